use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat::{ChatResponder, FALLBACK_ANSWER};
use crate::config::AppConfig;
use crate::error::AnalysisError;
use crate::gemini::GeminiClient;
use crate::frame_sampler::{sample_upload_blocking, SampledFrame, SamplingConfig, VideoAsset};
use crate::summarizer::Summarizer;

pub const DEFAULT_GUIDELINE: &str = "You are a traffic safety inspector. Analyze this sequence of video frames. \
Identify key events like vehicle movements, pedestrian crossings, and traffic light changes. \
Most importantly, detect and list any traffic violations with an approximate timestamp (e.g., 'at around second 5'). \
Provide a concise summary of the scene and a list of any violations found.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Warning,
    Error,
}

/// 一次操作产生的提示信息，下一次操作开始时清空
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

/// 单个用户会话的内存状态
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// 最近一次使用的指导说明
    pub guideline: String,
    /// 只保留最新一次成功分析的摘要
    pub video_summary: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub notices: Vec<Notice>,
}

impl Session {
    pub fn new(guideline: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            guideline: guideline.into(),
            video_summary: None,
            messages: Vec::new(),
            notices: Vec::new(),
        }
    }

    fn notify(&mut self, level: NoticeLevel, text: impl Into<String>) {
        self.notices.push(Notice {
            level,
            text: text.into(),
        });
    }

    fn begin_action(&mut self) {
        self.notices.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Completed { frame_count: usize },
    MissingVideo,
    NoFrames,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionOutcome {
    Answered,
    Fallback(String),
    NoSummary,
    Ignored,
}

/// 用户操作的处理器：提交分析、提交追问
///
/// 每个处理器拿到会话的可变引用，操作失败只影响本次操作，不会回滚已有状态。
#[derive(Debug, Clone)]
pub struct SessionController {
    sampling: SamplingConfig,
    scratch_dir: PathBuf,
    summarizer: Summarizer,
    responder: ChatResponder,
}

impl SessionController {
    pub fn new(
        sampling: SamplingConfig,
        scratch_dir: impl Into<PathBuf>,
        summarizer: Summarizer,
        responder: ChatResponder,
    ) -> Self {
        Self {
            sampling,
            scratch_dir: scratch_dir.into(),
            summarizer,
            responder,
        }
    }

    /// 按配置创建模型客户端和处理器，缺少 API Key 时失败
    pub fn from_config(config: &AppConfig) -> Result<Self, AnalysisError> {
        let client = GeminiClient::new(
            config.api_key.clone(),
            config.api_base.clone(),
            config.request_timeout(),
        )?;
        Ok(Self::new(
            config.sampling,
            config.scratch_dir.clone(),
            Summarizer::new(client.clone(), config.summary_model.clone()),
            ChatResponder::new(client, config.chat_model.clone()),
        ))
    }

    pub async fn submit_analysis(
        &self,
        session: &mut Session,
        video: Option<VideoAsset>,
        guideline: &str,
    ) -> AnalysisOutcome {
        session.begin_action();
        session.guideline = guideline.to_string();

        let Some(video) = video else {
            session.notify(NoticeLevel::Warning, "Please upload a video file first.");
            return AnalysisOutcome::MissingVideo;
        };

        info!(
            "🎬 [会话 {}] 开始分析视频: {} ({} 字节)",
            session.id,
            video.filename,
            video.bytes.len()
        );
        let frames =
            match sample_upload_blocking(video, self.scratch_dir.clone(), self.sampling).await {
                Ok(frames) => frames,
                Err(e) => {
                    warn!("⚠️  [会话 {}] 抽帧失败: {}", session.id, e);
                    Vec::new()
                }
            };

        self.analyze_frames(session, frames, guideline).await
    }

    /// 对已采样的帧执行摘要，成功后替换摘要并重置对话记录
    pub async fn analyze_frames(
        &self,
        session: &mut Session,
        frames: Vec<SampledFrame>,
        guideline: &str,
    ) -> AnalysisOutcome {
        if frames.is_empty() {
            session.notify(NoticeLevel::Error, "Could not extract frames from the video.");
            return AnalysisOutcome::NoFrames;
        }
        session.notify(
            NoticeLevel::Success,
            format!("{} frames extracted successfully!", frames.len()),
        );

        match self.summarizer.summarize(&frames, guideline).await {
            Ok(summary) => {
                session.messages = vec![ChatMessage::assistant(format!(
                    "**Video Analysis Complete.**\n\n{}",
                    summary
                ))];
                session.video_summary = Some(summary);
                session.notify(NoticeLevel::Success, "Analysis complete!");
                info!("✅ [会话 {}] 分析完成", session.id);
                AnalysisOutcome::Completed {
                    frame_count: frames.len(),
                }
            }
            Err(e) => {
                // 已有的摘要保持不变
                let message = e.to_string();
                session.notify(
                    NoticeLevel::Error,
                    format!("An error occurred during analysis: {}", message),
                );
                AnalysisOutcome::Failed(message)
            }
        }
    }

    pub async fn submit_question(&self, session: &mut Session, question: &str) -> QuestionOutcome {
        session.begin_action();

        if question.trim().is_empty() {
            return QuestionOutcome::Ignored;
        }
        let Some(summary) = session.video_summary.clone() else {
            session.notify(
                NoticeLevel::Warning,
                "Please analyze a video before asking questions.",
            );
            return QuestionOutcome::NoSummary;
        };

        session.messages.push(ChatMessage::user(question));

        match self.responder.respond(&summary, question).await {
            Ok(answer) => {
                session.messages.push(ChatMessage::assistant(answer));
                QuestionOutcome::Answered
            }
            Err(e) => {
                let message = e.to_string();
                session.notify(
                    NoticeLevel::Error,
                    format!("An error occurred during chat: {}", message),
                );
                session.messages.push(ChatMessage::assistant(FALLBACK_ANSWER));
                QuestionOutcome::Fallback(message)
            }
        }
    }
}
