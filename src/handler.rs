use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::StatusCode,
    response::{Html, Json as ResponseJson},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AnalysisError;
use crate::frame_sampler::VideoAsset;
use crate::session::{ChatMessage, Notice, Session, SessionController};
use crate::store::{SessionStore, SharedSession};

type ApiError = (StatusCode, String);

/// 所有 handler 共享的状态
#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub controller: Arc<SessionController>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> Result<Self, AnalysisError> {
        let controller = SessionController::from_config(&config)?;
        Ok(Self {
            store: SessionStore::with_idle_timeout(config.session_idle_timeout()),
            controller: Arc::new(controller),
            config: Arc::new(config),
        })
    }
}

/// 返回给页面的会话快照
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub guideline: String,
    pub video_summary: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub notices: Vec<Notice>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id,
            created_at: session.created_at,
            guideline: session.guideline.clone(),
            video_summary: session.video_summary.clone(),
            messages: session.messages.clone(),
            notices: session.notices.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes();
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/sessions", post(handle_create_session))
        .route(
            "/sessions/:id",
            get(handle_get_session).delete(handle_end_session),
        )
        .route("/sessions/:id/analyze", post(handle_analyze))
        .route("/sessions/:id/messages", post(handle_question))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

pub async fn health_check() -> &'static str {
    "OK"
}

async fn find_session(state: &AppState, id: &Uuid) -> Result<SharedSession, ApiError> {
    state
        .store
        .get(id)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("会话不存在: {}", id)))
}

pub async fn handle_create_session(
    State(state): State<AppState>,
) -> (StatusCode, ResponseJson<SessionView>) {
    let session = state.store.create(&state.config.guideline).await;
    let session = session.lock().await;
    (StatusCode::CREATED, ResponseJson(SessionView::from(&*session)))
}

pub async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<SessionView>, ApiError> {
    let session = find_session(&state, &id).await?;
    let session = session.lock().await;
    Ok(ResponseJson(SessionView::from(&*session)))
}

pub async fn handle_end_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    if state.store.remove(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// 上传视频并分析（multipart 字段：video 文件、guideline 文本）
pub async fn handle_analyze(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<ResponseJson<SessionView>, ApiError> {
    let session = find_session(&state, &id).await?;

    let mut video = None;
    let mut guideline = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), format!("读取上传内容失败: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("video") => {
                let filename = field.file_name().map(str::to_string).unwrap_or_default();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| (e.status(), format!("读取视频失败: {}", e)))?;
                // 表单里没有选择文件时浏览器仍会发送一个空字段
                if filename.is_empty() && bytes.is_empty() {
                    continue;
                }

                let asset = VideoAsset::new(filename, bytes.to_vec());
                let allowed = asset
                    .extension()
                    .is_some_and(|ext| state.config.is_allowed_extension(&ext));
                if !allowed {
                    warn!("⚠️  [上传] 拒绝不支持的文件: {}", asset.filename);
                    return Err((
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        format!(
                            "不支持的视频格式: {}（允许: {}）",
                            asset.filename,
                            state.config.allowed_extensions.join(", ")
                        ),
                    ));
                }
                video = Some(asset);
            }
            Some("guideline") => {
                guideline = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| (e.status(), format!("读取指导说明失败: {}", e)))?,
                );
            }
            _ => {}
        }
    }

    let mut session = session.lock().await;
    let guideline = guideline.unwrap_or_else(|| session.guideline.clone());
    let outcome = state
        .controller
        .submit_analysis(&mut session, video, &guideline)
        .await;
    info!("[会话 {}] 分析结果: {:?}", id, outcome);

    Ok(ResponseJson(SessionView::from(&*session)))
}

pub async fn handle_question(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<QuestionRequest>,
) -> Result<ResponseJson<SessionView>, ApiError> {
    let session = find_session(&state, &id).await?;
    let mut session = session.lock().await;
    let outcome = state
        .controller
        .submit_question(&mut session, &request.question)
        .await;
    info!("[会话 {}] 追问结果: {:?}", id, outcome);

    Ok(ResponseJson(SessionView::from(&*session)))
}
