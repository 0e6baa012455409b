use thiserror::Error;

/// 帧采样失败（容器无法打开、没有视频流、解码器无法创建等）
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("初始化 FFmpeg 失败: {0}")]
    Init(#[source] ffmpeg_next::Error),
    #[error("无法打开视频文件: {0}")]
    Open(#[source] ffmpeg_next::Error),
    #[error("未找到视频流")]
    NoVideoStream,
    #[error("无法创建视频解码器: {0}")]
    Decoder(#[source] ffmpeg_next::Error),
    #[error("无法创建缩放器: {0}")]
    Scaler(#[source] ffmpeg_next::Error),
    #[error("帧数据长度不足: {width}x{height}")]
    FrameBuffer { width: u32, height: u32 },
    #[error("写入临时视频文件失败: {0}")]
    Scratch(#[from] std::io::Error),
    #[error("帧采样任务异常退出: {0}")]
    Worker(String),
}

/// 调用托管模型失败的原因
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("没有可供分析的视频帧")]
    NoFrames,
    #[error("未配置 GOOGLE_API_KEY")]
    MissingApiKey,
    #[error("请求模型服务失败: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("模型服务返回错误 ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("模型未返回文本内容 ({0})")]
    EmptyResponse(String),
    #[error("图像编码失败: {0}")]
    Encode(#[from] image::ImageError),
}
