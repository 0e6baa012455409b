use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::AnalysisError;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// 请求中的一段内容：文本或内联的二进制数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn inline(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Part::InlineData {
            inline_data: Blob {
                mime_type: mime_type.into(),
                data: general_purpose::STANDARD.encode(bytes),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// base64 编码后的数据
    pub data: String,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: &'a [Part],
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl GenerateContentResponse {
    /// 第一个候选结果中所有文本段拼接后的内容
    fn into_text(self) -> Result<String, AnalysisError> {
        let block_reason = self.prompt_feedback.and_then(|f| f.block_reason);
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Err(AnalysisError::EmptyResponse(
                block_reason.unwrap_or_else(|| "no candidates".to_string()),
            ));
        };

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(AnalysisError::EmptyResponse(
                candidate
                    .finish_reason
                    .unwrap_or_else(|| "empty text".to_string()),
            ));
        }
        Ok(text)
    }
}

/// 托管生成式模型的 HTTP 客户端
///
/// 一次调用就是一次阻塞式请求：没有重试、退避或流式输出。
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(
        api_key: Option<String>,
        api_base: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, AnalysisError> {
        let api_key = api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(AnalysisError::MissingApiKey)?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.api_base, model)
    }

    /// 以单条用户消息发送全部内容段，返回模型的文本回复
    pub async fn generate(&self, model: &str, parts: &[Part]) -> Result<String, AnalysisError> {
        let url = self.endpoint(model);
        debug!("[模型调用] POST {} ({} 段内容)", url, parts.len());

        let request = GenerateContentRequest {
            contents: [Content { role: "user", parts }],
        };

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            error!("❌ [模型调用] {} 返回错误状态 {}: {}", model, status, message);
            return Err(AnalysisError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<GenerateContentResponse>().await?.into_text()
    }
}
