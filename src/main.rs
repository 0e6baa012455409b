use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use visual_chat::session::{Notice, NoticeLevel};
use visual_chat::{
    router, AnalysisOutcome, AppConfig, AppState, ConfigLoader, ConfigOverrides, QuestionOutcome,
    Role, Session, SessionController, SessionStore, VideoAsset,
};

/// 视频理解对话助手 - 抽帧后由多模态模型生成摘要，再基于摘要回答追问
#[derive(Parser, Debug)]
#[command(name = "visual-chat")]
#[command(about = "视频理解对话助手：按固定间隔抽帧、生成视频摘要、基于摘要对话", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Web 服务模式：启动带对话页面的 HTTP 服务器
    Serve {
        /// 监听地址（默认读取 VISUAL_CHAT_BIND / FC_SERVER_PORT，否则 0.0.0.0:9000）
        #[arg(short, long)]
        bind: Option<String>,

        /// 配置文件路径（可选，支持 .ini 格式）
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// CLI 模式：分析本地视频文件，并依次回答追问
    Analyze {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 指导说明（默认使用配置中的 guideline）
        #[arg(short, long)]
        guideline: Option<String>,

        /// 追问，可重复指定
        #[arg(short, long = "question")]
        questions: Vec<String>,

        /// 采样间隔（秒）
        /// 可通过环境变量 VISUAL_CHAT_SAMPLE_INTERVAL 或配置文件设置
        #[arg(long)]
        interval: Option<f64>,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(short, long, default_value = "visual-chat.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env 中的 GOOGLE_API_KEY 等变量
    dotenvy::dotenv().ok();

    let args = Args::parse();

    match args.command {
        Commands::Serve { bind, config } => {
            let config = ConfigLoader::load_config(
                config.as_deref(),
                ConfigOverrides {
                    bind,
                    ..Default::default()
                },
            )
            .context("加载配置失败")?;
            init_logging(&config.log_level);
            start_web_server(config).await?;
        }
        Commands::Analyze {
            input,
            guideline,
            questions,
            interval,
            config,
        } => {
            let config = ConfigLoader::load_config(
                config.as_deref(),
                ConfigOverrides {
                    interval_secs: interval,
                    ..Default::default()
                },
            )
            .context("加载配置失败")?;
            init_logging(&config.log_level);
            run_analyze(config, input, guideline, questions).await?;
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("已生成配置文件: {}", path.display());
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let level = level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn run_analyze(
    config: AppConfig,
    input: PathBuf,
    guideline: Option<String>,
    questions: Vec<String>,
) -> Result<()> {
    let controller = SessionController::from_config(&config)
        .context("创建模型客户端失败，请设置 GOOGLE_API_KEY")?;

    let bytes = tokio::fs::read(&input)
        .await
        .with_context(|| format!("读取视频文件失败: {}", input.display()))?;
    let filename = input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("video.mp4")
        .to_string();
    let guideline = guideline.unwrap_or_else(|| config.guideline.clone());

    let mut session = Session::new(&guideline);
    let outcome = controller
        .submit_analysis(&mut session, Some(VideoAsset::new(filename, bytes)), &guideline)
        .await;
    print_notices(&session.notices);
    if !matches!(outcome, AnalysisOutcome::Completed { .. }) {
        bail!("视频分析未完成: {:?}", outcome);
    }
    print_last_message(&session);

    for question in questions {
        println!("\n> {}", question);
        let outcome = controller.submit_question(&mut session, &question).await;
        print_notices(&session.notices);
        if outcome != QuestionOutcome::Ignored {
            print_last_message(&session);
        }
    }

    Ok(())
}

fn print_notices(notices: &[Notice]) {
    for notice in notices {
        let tag = match notice.level {
            NoticeLevel::Success => "✅",
            NoticeLevel::Warning => "⚠️ ",
            NoticeLevel::Error => "❌",
        };
        eprintln!("{} {}", tag, notice.text);
    }
}

fn print_last_message(session: &Session) {
    if let Some(message) = session.messages.last() {
        if message.role == Role::Assistant {
            println!("\n{}", message.content);
        }
    }
}

async fn start_web_server(config: AppConfig) -> Result<()> {
    let bind = config.bind.clone();
    let idle_timeout = config.session_idle_timeout();
    let state = AppState::from_config(config)
        .context("创建模型客户端失败，请设置 GOOGLE_API_KEY")?;
    if let Some(idle) = idle_timeout {
        spawn_session_sweeper(state.store.clone(), idle);
    }
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 对话页面: GET  http://{}/", bind);
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 新建会话: POST http://{}/sessions", bind);
    tracing::info!("  • 查看会话: GET  http://{}/sessions/<id>", bind);
    tracing::info!("  • 分析视频: POST http://{}/sessions/<id>/analyze", bind);
    tracing::info!("  • 追问: POST http://{}/sessions/<id>/messages", bind);
    tracing::info!("  • 结束会话: DELETE http://{}/sessions/<id>", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}

/// 定期回收空闲会话
fn spawn_session_sweeper(store: SessionStore, idle: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle / 4);
        loop {
            ticker.tick().await;
            store.evict_idle().await;
        }
    });
}
