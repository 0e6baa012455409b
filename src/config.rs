use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chat::DEFAULT_CHAT_MODEL;
use crate::frame_sampler::{Resolution, SamplingConfig};
use crate::gemini::DEFAULT_API_BASE;
use crate::session::DEFAULT_GUIDELINE;
use crate::summarizer::DEFAULT_SUMMARY_MODEL;

const CONFIG_FILE_NAME: &str = "visual-chat.ini";
const DEFAULT_BIND: &str = "0.0.0.0:9000";

/// 完整的运行配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// 帧采样配置
    pub sampling: SamplingConfig,
    /// 托管模型的 API Key，只从环境变量读取
    pub api_key: Option<String>,
    pub api_base: String,
    pub summary_model: String,
    pub chat_model: String,
    /// 模型请求超时（秒），0 表示不设超时
    pub request_timeout_secs: u64,
    /// HTTP 监听地址
    pub bind: String,
    /// 上传大小上限（MB）
    pub max_upload_mb: usize,
    /// 会话空闲多久后回收（分钟），0 表示不回收
    pub session_idle_minutes: u64,
    /// 上传视频的临时目录
    pub scratch_dir: PathBuf,
    /// 允许上传的视频扩展名（小写）
    pub allowed_extensions: Vec<String>,
    /// 默认指导说明
    pub guideline: String,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        PartialConfig::default().resolve()
    }
}

impl AppConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_minutes > 0).then(|| Duration::from_secs(self.session_idle_minutes * 60))
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn is_allowed_extension(&self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|e| *e == extension)
    }

    fn validate(&self) -> Result<()> {
        if !(self.sampling.interval_secs.is_finite() && self.sampling.interval_secs > 0.0) {
            bail!("采样间隔必须为正数: {}", self.sampling.interval_secs);
        }
        if self.sampling.resolution.width == 0 || self.sampling.resolution.height == 0 {
            bail!(
                "输出分辨率无效: {}x{}",
                self.sampling.resolution.width,
                self.sampling.resolution.height
            );
        }
        if self.allowed_extensions.is_empty() {
            bail!("allowed_extensions 不能为空");
        }
        Ok(())
    }
}

/// 命令行可以覆盖的配置项
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub interval_secs: Option<f64>,
    pub summary_model: Option<String>,
    pub chat_model: Option<String>,
    pub bind: Option<String>,
}

/// 某一个配置来源读取到的值，未设置的项为 None
#[derive(Debug, Clone, Default, PartialEq)]
struct PartialConfig {
    interval_secs: Option<f64>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    api_key: Option<String>,
    api_base: Option<String>,
    summary_model: Option<String>,
    chat_model: Option<String>,
    request_timeout_secs: Option<u64>,
    bind: Option<String>,
    max_upload_mb: Option<usize>,
    session_idle_minutes: Option<u64>,
    scratch_dir: Option<PathBuf>,
    allowed_extensions: Option<Vec<String>>,
    guideline: Option<String>,
    log_level: Option<String>,
}

impl PartialConfig {
    /// self 优先，缺失的项由 lower 补齐
    fn or(self, lower: PartialConfig) -> PartialConfig {
        PartialConfig {
            interval_secs: self.interval_secs.or(lower.interval_secs),
            frame_width: self.frame_width.or(lower.frame_width),
            frame_height: self.frame_height.or(lower.frame_height),
            api_key: self.api_key.or(lower.api_key),
            api_base: self.api_base.or(lower.api_base),
            summary_model: self.summary_model.or(lower.summary_model),
            chat_model: self.chat_model.or(lower.chat_model),
            request_timeout_secs: self.request_timeout_secs.or(lower.request_timeout_secs),
            bind: self.bind.or(lower.bind),
            max_upload_mb: self.max_upload_mb.or(lower.max_upload_mb),
            session_idle_minutes: self.session_idle_minutes.or(lower.session_idle_minutes),
            scratch_dir: self.scratch_dir.or(lower.scratch_dir),
            allowed_extensions: self.allowed_extensions.or(lower.allowed_extensions),
            guideline: self.guideline.or(lower.guideline),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    fn resolve(self) -> AppConfig {
        let defaults = SamplingConfig::default();
        AppConfig {
            sampling: SamplingConfig {
                interval_secs: self.interval_secs.unwrap_or(defaults.interval_secs),
                resolution: Resolution {
                    width: self.frame_width.unwrap_or(defaults.resolution.width),
                    height: self.frame_height.unwrap_or(defaults.resolution.height),
                },
            },
            api_key: self.api_key,
            api_base: self.api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            summary_model: self
                .summary_model
                .unwrap_or_else(|| DEFAULT_SUMMARY_MODEL.to_string()),
            chat_model: self.chat_model.unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            request_timeout_secs: self.request_timeout_secs.unwrap_or(120),
            bind: self.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            max_upload_mb: self.max_upload_mb.unwrap_or(512),
            session_idle_minutes: self.session_idle_minutes.unwrap_or(60),
            scratch_dir: self
                .scratch_dir
                .unwrap_or_else(|| env::temp_dir().join("visual-chat")),
            allowed_extensions: self
                .allowed_extensions
                .unwrap_or_else(|| parse_extensions("mp4,mov,avi")),
            guideline: self.guideline.unwrap_or_else(|| DEFAULT_GUIDELINE.to_string()),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
        }
    }
}

impl From<ConfigOverrides> for PartialConfig {
    fn from(overrides: ConfigOverrides) -> Self {
        PartialConfig {
            interval_secs: overrides.interval_secs,
            summary_model: overrides.summary_model,
            chat_model: overrides.chat_model,
            bind: overrides.bind,
            ..Default::default()
        }
    }
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<AppConfig> {
        // 指定了配置文件就必须能读到，默认位置找不到则忽略
        let file_config = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };

        let env_config = Self::load_from_lookup(|key| env::var(key).ok());

        let config = PartialConfig::from(overrides)
            .or(env_config)
            .or(file_config)
            .resolve();
        config.validate()?;
        Ok(config)
    }

    /// 从环境变量加载配置（lookup 便于测试时替换）
    fn load_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PartialConfig {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse_f64 = |key: &str| -> Option<f64> { get(key).and_then(|v| v.parse().ok()) };
        let parse_u32 = |key: &str| -> Option<u32> { get(key).and_then(|v| v.parse().ok()) };

        PartialConfig {
            interval_secs: parse_f64("VISUAL_CHAT_SAMPLE_INTERVAL"),
            frame_width: parse_u32("VISUAL_CHAT_FRAME_WIDTH"),
            frame_height: parse_u32("VISUAL_CHAT_FRAME_HEIGHT"),
            api_key: get("GOOGLE_API_KEY"),
            api_base: get("GEMINI_API_BASE"),
            summary_model: get("VISUAL_CHAT_SUMMARY_MODEL"),
            chat_model: get("VISUAL_CHAT_CHAT_MODEL"),
            request_timeout_secs: get("VISUAL_CHAT_REQUEST_TIMEOUT").and_then(|v| v.parse().ok()),
            bind: get("VISUAL_CHAT_BIND")
                .or_else(|| get("FC_SERVER_PORT").map(|port| format!("0.0.0.0:{}", port))),
            max_upload_mb: get("VISUAL_CHAT_MAX_UPLOAD_MB").and_then(|v| v.parse().ok()),
            session_idle_minutes: get("VISUAL_CHAT_SESSION_IDLE_MINUTES").and_then(|v| v.parse().ok()),
            scratch_dir: get("VISUAL_CHAT_SCRATCH_DIR").map(PathBuf::from),
            allowed_extensions: None,
            guideline: None,
            log_level: get("LOG_LEVEL"),
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            bail!("配置文件不存在: {}", config_path.display());
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        let get = |section: &str, key: &str| {
            config_parser
                .get(section, key)
                .or_else(|| config_parser.get("default", key))
                .filter(|v| !v.trim().is_empty())
        };

        Ok(PartialConfig {
            interval_secs: get("sampling", "interval_secs").and_then(|v| v.parse().ok()),
            frame_width: get("sampling", "frame_width").and_then(|v| v.parse().ok()),
            frame_height: get("sampling", "frame_height").and_then(|v| v.parse().ok()),
            // API Key 不从配置文件读取
            api_key: None,
            api_base: get("gemini", "api_base"),
            summary_model: get("gemini", "summary_model"),
            chat_model: get("gemini", "chat_model"),
            request_timeout_secs: get("gemini", "request_timeout_secs").and_then(|v| v.parse().ok()),
            bind: get("server", "bind"),
            max_upload_mb: get("server", "max_upload_mb").and_then(|v| v.parse().ok()),
            session_idle_minutes: get("server", "session_idle_minutes").and_then(|v| v.parse().ok()),
            scratch_dir: get("server", "scratch_dir").map(PathBuf::from),
            allowed_extensions: get("server", "allowed_extensions").map(|v| parse_extensions(&v)),
            guideline: get("assistant", "guideline"),
            log_level: get("logging", "level"),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<PartialConfig> {
        let mut candidates = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from(format!(".{}", CONFIG_FILE_NAME)),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(format!(".{}", CONFIG_FILE_NAME)));
        }
        candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));

        match candidates.iter().find(|path| path.exists()) {
            Some(path) => Self::load_from_file(path),
            None => bail!("未找到配置文件"),
        }
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = PartialConfig::default().resolve();

        let mut config_parser = configparser::ini::Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            config_parser.set(section, key, Some(value));
        };
        set("sampling", "interval_secs", defaults.sampling.interval_secs.to_string());
        set("sampling", "frame_width", defaults.sampling.resolution.width.to_string());
        set("sampling", "frame_height", defaults.sampling.resolution.height.to_string());
        set("gemini", "api_base", defaults.api_base);
        set("gemini", "summary_model", defaults.summary_model);
        set("gemini", "chat_model", defaults.chat_model);
        set("gemini", "request_timeout_secs", defaults.request_timeout_secs.to_string());
        set("server", "bind", defaults.bind);
        set("server", "max_upload_mb", defaults.max_upload_mb.to_string());
        set("server", "session_idle_minutes", defaults.session_idle_minutes.to_string());
        set("server", "scratch_dir", String::new());
        set("server", "allowed_extensions", defaults.allowed_extensions.join(","));
        set("assistant", "guideline", defaults.guideline);
        set("logging", "level", defaults.log_level);

        config_parser
            .write(config_path)
            .with_context(|| format!("写入配置文件失败: {}", config_path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn write_ini(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        std::io::Write::write_all(&mut file, contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_match_original_pipeline() {
        let config = PartialConfig::default().resolve();
        assert_eq!(config.sampling.interval_secs, 5.0);
        assert_eq!(config.sampling.resolution, Resolution { width: 640, height: 360 });
        assert_eq!(config.summary_model, "gemini-1.5-pro");
        assert_eq!(config.chat_model, "gemini-pro");
        assert_eq!(config.allowed_extensions, vec!["mp4", "mov", "avi"]);
        assert_eq!(config.session_idle_timeout(), Some(Duration::from_secs(3600)));
        assert!(config.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_values_are_parsed() {
        let env = ConfigLoader::load_from_lookup(lookup(&[
            ("GOOGLE_API_KEY", "secret"),
            ("VISUAL_CHAT_SAMPLE_INTERVAL", "2.5"),
            ("VISUAL_CHAT_FRAME_WIDTH", "not-a-number"),
            ("FC_SERVER_PORT", "8080"),
            ("VISUAL_CHAT_SUMMARY_MODEL", ""),
            ("VISUAL_CHAT_SESSION_IDLE_MINUTES", "0"),
        ]));
        assert_eq!(env.api_key.as_deref(), Some("secret"));
        assert_eq!(env.interval_secs, Some(2.5));
        assert_eq!(env.frame_width, None);
        assert_eq!(env.bind.as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(env.summary_model, None);
        assert_eq!(env.session_idle_minutes, Some(0));
        assert_eq!(env.resolve().session_idle_timeout(), None);
    }

    #[test]
    fn file_values_are_read_by_section() {
        let file = write_ini(
            "[sampling]\ninterval_secs = 3\nframe_width = 320\n\n\
             [gemini]\nchat_model = gemini-1.5-flash\n\n\
             [server]\nallowed_extensions = MP4, .mkv\n\n\
             [logging]\nlevel = debug\n",
        );
        let partial = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(partial.interval_secs, Some(3.0));
        assert_eq!(partial.frame_width, Some(320));
        assert_eq!(partial.frame_height, None);
        assert_eq!(partial.chat_model.as_deref(), Some("gemini-1.5-flash"));
        assert_eq!(partial.allowed_extensions, Some(vec!["mp4".to_string(), "mkv".to_string()]));
        assert_eq!(partial.log_level.as_deref(), Some("debug"));
        assert_eq!(partial.api_key, None);
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let file = PartialConfig {
            interval_secs: Some(1.0),
            chat_model: Some("file-chat".to_string()),
            summary_model: Some("file-summary".to_string()),
            log_level: Some("warn".to_string()),
            ..Default::default()
        };
        let env = ConfigLoader::load_from_lookup(lookup(&[
            ("VISUAL_CHAT_SAMPLE_INTERVAL", "2"),
            ("VISUAL_CHAT_CHAT_MODEL", "env-chat"),
        ]));
        let cli = PartialConfig::from(ConfigOverrides {
            interval_secs: Some(10.0),
            ..Default::default()
        });

        let config = cli.or(env).or(file).resolve();
        assert_eq!(config.sampling.interval_secs, 10.0);
        assert_eq!(config.chat_model, "env-chat");
        assert_eq!(config.summary_model, "file-summary");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = PartialConfig::default().resolve();
        config.sampling.interval_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = PartialConfig::default().resolve();
        config.sampling.resolution.height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let result = ConfigLoader::load_config(
            Some(Path::new("/nonexistent/visual-chat.ini")),
            ConfigOverrides::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn default_config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visual-chat.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let partial = ConfigLoader::load_from_file(&path).unwrap();
        let config = partial.resolve();
        assert_eq!(config.sampling.interval_secs, 5.0);
        assert_eq!(config.chat_model, "gemini-pro");
        assert_eq!(config.guideline, DEFAULT_GUIDELINE);
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let config = PartialConfig::default().resolve();
        assert!(config.is_allowed_extension("MOV"));
        assert!(!config.is_allowed_extension("mkv"));
    }
}
