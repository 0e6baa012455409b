use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};
use std::time::Instant;
use tracing::{error, info};

use crate::error::AnalysisError;
use crate::frame_sampler::SampledFrame;
use crate::gemini::{GeminiClient, Part};

pub const DEFAULT_SUMMARY_MODEL: &str = "gemini-1.5-pro";

const JPEG_QUALITY: u8 = 85;

/// 视频摘要：把指导说明和全部采样帧一次性发给多模态模型
#[derive(Debug, Clone)]
pub struct Summarizer {
    client: GeminiClient,
    model: String,
}

impl Summarizer {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// 返回模型的原始文本回复，不做任何后处理
    pub async fn summarize(
        &self,
        frames: &[SampledFrame],
        guideline: &str,
    ) -> Result<String, AnalysisError> {
        if frames.is_empty() {
            return Err(AnalysisError::NoFrames);
        }

        let start = Instant::now();
        let parts = build_parts(frames, guideline)?;
        info!(
            "⏳ [视频摘要] 发送 {} 帧到 {} ...",
            frames.len(),
            self.model
        );

        let summary = self
            .client
            .generate(&self.model, &parts)
            .await
            .map_err(|e| {
                error!("❌ [视频摘要] 分析失败: {}", e);
                e
            })?;

        info!(
            "✅ [视频摘要] 完成，{} 字符，耗时 {:.2}秒",
            summary.chars().count(),
            start.elapsed().as_secs_f64()
        );
        Ok(summary)
    }
}

/// 指导说明在前，随后按时间顺序排列的帧
fn build_parts(frames: &[SampledFrame], guideline: &str) -> Result<Vec<Part>, AnalysisError> {
    let mut parts = Vec::with_capacity(frames.len() + 1);
    parts.push(Part::text(guideline));
    for frame in frames {
        parts.push(Part::inline("image/jpeg", &encode_jpeg(&frame.image)?));
    }
    Ok(parts)
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, AnalysisError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        ColorType::Rgb8,
    )?;
    Ok(buf)
}
