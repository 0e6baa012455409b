pub mod frame_sampler;
pub mod gemini;
pub mod summarizer;
pub mod chat;
pub mod session;
pub mod store;
pub mod handler;
pub mod config;
pub mod error;

pub use frame_sampler::{FrameSampler, FrameSelector, Resolution, SampledFrame, SamplingConfig, VideoAsset};
pub use gemini::{GeminiClient, Part};
pub use summarizer::Summarizer;
pub use chat::ChatResponder;
pub use session::{AnalysisOutcome, ChatMessage, QuestionOutcome, Role, Session, SessionController};
pub use store::SessionStore;
pub use handler::{router, AppState};
pub use config::{AppConfig, ConfigLoader, ConfigOverrides};
pub use error::{AnalysisError, SamplerError};
