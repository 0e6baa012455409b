use tracing::{error, info};

use crate::error::AnalysisError;
use crate::gemini::{GeminiClient, Part};

pub const DEFAULT_CHAT_MODEL: &str = "gemini-pro";

/// 追问失败时写入对话记录的固定回复
pub const FALLBACK_ANSWER: &str = "Sorry, I couldn't process that question.";

/// 基于视频摘要回答追问
///
/// 每次调用相互独立：只带上摘要和当前问题，之前的问答不会进入提示词。
#[derive(Debug, Clone)]
pub struct ChatResponder {
    client: GeminiClient,
    model: String,
}

impl ChatResponder {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub async fn respond(&self, summary: &str, question: &str) -> Result<String, AnalysisError> {
        let prompt = compose_prompt(summary, question);
        info!("⏳ [追问] 发送问题到 {} ...", self.model);

        self.client
            .generate(&self.model, &[Part::text(prompt)])
            .await
            .map_err(|e| {
                error!("❌ [追问] 回答失败: {}", e);
                e
            })
    }
}

pub fn compose_prompt(summary: &str, question: &str) -> String {
    format!(
        "You are an AI assistant. A user has provided a video, and an initial analysis was performed. \
         Based on the following summary, please answer the user's follow-up question.\n\n\
         --- VIDEO SUMMARY ---\n{summary}\n\n\
         --- USER'S QUESTION ---\n{question}\n\n\
         Your Answer:"
    )
}
