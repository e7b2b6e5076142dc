// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/server.rs - HTTP 接口
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use axum::{
  Json, Router,
  extract::{DefaultBodyLimit, Multipart, Query, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use image::RgbImage;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
  config::ServerSettings,
  detect::Verdict,
  input::{self, InputError},
  lifecycle::{NotReadyError, ReloadOutcome, StateKind},
  service::{DetectError, DetectionService},
};

const UPLOAD_CONTEXT: &str = "Error processing image";
const BASE64_CONTEXT: &str = "Error processing base64 image";
const URL_CONTEXT: &str = "Error processing image URL";
const UPLOAD_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
  service: Arc<DetectionService>,
  client: reqwest::Client,
  static_dir: Option<PathBuf>,
}

impl AppState {
  /// 静态目录不存在时不挂载 `/static`
  pub fn new(
    service: Arc<DetectionService>,
    settings: &ServerSettings,
  ) -> Result<Self, reqwest::Error> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("xinhao/", env!("CARGO_PKG_VERSION")))
      .timeout(settings.fetch_timeout())
      .build()?;

    let static_dir = settings.static_dir.is_dir().then(|| settings.static_dir.clone());
    if static_dir.is_none() {
      info!("静态目录 {} 不存在, 不提供网页", settings.static_dir.display());
    }

    Ok(AppState {
      service,
      client,
      static_dir,
    })
  }

  pub fn service(&self) -> &DetectionService {
    &self.service
  }
}

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("Model not loaded yet. Error: {}", not_ready_reason(.0))]
  NotReady(NotReadyError),
  #[error("{context}: {message}")]
  BadRequest {
    context: &'static str,
    message: String,
  },
  #[error("Internal server error: {0}")]
  Internal(String),
}

fn not_ready_reason(err: &NotReadyError) -> &str {
  err.reason.as_deref().unwrap_or("None")
}

impl ApiError {
  fn bad_request(context: &'static str, err: impl std::fmt::Display) -> Self {
    ApiError::BadRequest {
      context,
      message: err.to_string(),
    }
  }

  fn from_detect(context: &'static str, err: DetectError) -> Self {
    match err {
      DetectError::NotReady(e) => ApiError::NotReady(e),
      DetectError::Backend(e) => ApiError::bad_request(context, e),
    }
  }

  fn status_code(&self) -> StatusCode {
    match self {
      ApiError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
      ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    if status.is_server_error() {
      warn!("请求失败 ({}): {}", status, self);
    }
    (status, Json(json!({ "detail": self.to_string() }))).into_response()
  }
}

pub fn router(state: AppState, body_limit: usize) -> Router {
  let static_dir = state.static_dir.clone();

  let router = Router::new()
    .route("/", get(root_handler))
    .route("/health", get(health_handler))
    .route("/status", get(status_handler))
    .route("/model-status", get(model_status_handler))
    .route("/reload-model", post(reload_model_handler))
    .route("/detect", post(detect_upload_handler))
    .route("/detect-base64", post(detect_base64_handler))
    .route("/detect-url", post(detect_url_handler));

  let router = match static_dir {
    Some(dir) => router.nest_service("/static", ServeDir::new(dir)),
    None => router,
  };

  router
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn root_handler(State(state): State<AppState>) -> Json<Value> {
  let status = state.service.lifecycle().status();
  Json(json!({
    "message": "Traffic Light Detection API",
    "status": "running",
    "model_loaded": status.state == StateKind::Ready,
    "model_error": status.last_error,
    "web_interface": state.static_dir.as_ref().map(|_| "/static/index.html"),
  }))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
  let status = state.service.lifecycle().status();
  let body = match status.state {
    StateKind::Ready => json!({
      "status": "healthy",
      "model_loaded": true,
      "message": "API is ready to process requests",
    }),
    StateKind::Failed => json!({
      "status": "unhealthy",
      "model_loaded": false,
      "error": status.last_error,
      "message": "Model failed to load",
    }),
    StateKind::Unloaded | StateKind::Loading => json!({
      "status": "loading",
      "model_loaded": false,
      "message": "Model is still loading, please wait...",
    }),
  };
  Json(body)
}

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
  let status = state.service.lifecycle().status();
  let service_name = std::env::var("K_SERVICE").ok();
  Json(json!({
    "api_status": "running",
    "model_loaded": status.state == StateKind::Ready,
    "model_error": status.last_error,
    "environment": {
      "cloud_run": service_name.is_some(),
      "docker": Path::new("/.dockerenv").exists(),
      "service_name": service_name.as_deref().unwrap_or("N/A"),
    },
    "lifecycle": status,
  }))
}

async fn model_status_handler(State(state): State<AppState>) -> Json<Value> {
  let status = state.service.lifecycle().status();
  let (label, message) = match status.state {
    StateKind::Ready => ("ready", "Model is ready for inference".to_string()),
    StateKind::Failed => (
      "error",
      format!(
        "Model failed to load: {}",
        status.last_error.as_deref().unwrap_or("unknown error")
      ),
    ),
    StateKind::Unloaded | StateKind::Loading => {
      ("loading", "Model is still loading, please wait...".to_string())
    }
  };
  Json(json!({
    "model_loaded": status.state == StateKind::Ready,
    "model_error": status.last_error,
    "status": label,
    "message": message,
  }))
}

async fn reload_model_handler(State(state): State<AppState>) -> Json<Value> {
  info!("收到模型重新加载请求");
  let body = match state.service.lifecycle().request_reload() {
    Ok(ReloadOutcome::AlreadyReady) => json!({
      "message": "Model is already loaded",
      "status": "success",
    }),
    Ok(ReloadOutcome::AlreadyLoading) => json!({
      "message": "Model is already loading",
      "status": "loading",
      "note": "Check /model-status endpoint for progress",
    }),
    Ok(ReloadOutcome::Started) => json!({
      "message": "Model reload started in background",
      "status": "loading",
      "note": "Check /model-status endpoint for progress",
    }),
    Err(e) => {
      error!("无法重新加载模型: {}", e);
      json!({
        "message": format!("Failed to start model reload: {}", e),
        "status": "error",
      })
    }
  };
  Json(body)
}

/// 先检查就绪状态，再在阻塞线程池中解码并推理
async fn run_detection<F>(
  state: &AppState,
  context: &'static str,
  decode: F,
) -> Result<Json<Verdict>, ApiError>
where
  F: FnOnce() -> Result<RgbImage, InputError> + Send + 'static,
{
  state
    .service
    .lifecycle()
    .ensure_ready()
    .map_err(ApiError::NotReady)?;

  let service = Arc::clone(&state.service);
  let verdict = tokio::task::spawn_blocking(move || {
    let image = decode().map_err(|e| ApiError::bad_request(context, e))?;
    service
      .detect(&image)
      .map_err(|e| ApiError::from_detect(context, e))
  })
  .await
  .map_err(|e| ApiError::Internal(e.to_string()))??;

  info!(
    "判定: {:?}, 置信度 {:.3}, 检测到信号灯: {}",
    verdict.command, verdict.confidence, verdict.traffic_light_detected
  );
  Ok(Json(verdict))
}

async fn detect_upload_handler(
  State(state): State<AppState>,
  mut multipart: Multipart,
) -> Result<Json<Verdict>, ApiError> {
  // 未就绪时不读取上传内容
  state
    .service
    .lifecycle()
    .ensure_ready()
    .map_err(ApiError::NotReady)?;

  let mut upload = None;
  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| ApiError::bad_request(UPLOAD_CONTEXT, e))?
  {
    if field.name() == Some(UPLOAD_FIELD) {
      let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::bad_request(UPLOAD_CONTEXT, e))?;
      upload = Some(bytes);
      break;
    }
  }

  let bytes = upload.ok_or_else(|| {
    ApiError::bad_request(UPLOAD_CONTEXT, format!("missing form field '{}'", UPLOAD_FIELD))
  })?;
  run_detection(&state, UPLOAD_CONTEXT, move || input::decode_image(&bytes)).await
}

fn default_image_format() -> String {
  "jpeg".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Base64ImageRequest {
  pub image_base64: String,
  #[serde(default = "default_image_format")]
  pub image_format: String,
}

async fn detect_base64_handler(
  State(state): State<AppState>,
  Json(request): Json<Base64ImageRequest>,
) -> Result<Json<Verdict>, ApiError> {
  run_detection(&state, BASE64_CONTEXT, move || {
    input::decode_base64_image(&request.image_base64, Some(&request.image_format))
  })
  .await
}

#[derive(Debug, Deserialize)]
pub struct DetectUrlParams {
  pub image_url: String,
}

async fn detect_url_handler(
  State(state): State<AppState>,
  Query(params): Query<DetectUrlParams>,
) -> Result<Json<Verdict>, ApiError> {
  state
    .service
    .lifecycle()
    .ensure_ready()
    .map_err(ApiError::NotReady)?;

  let image = input::fetch_image(&state.client, &params.image_url)
    .await
    .map_err(|e| ApiError::bad_request(URL_CONTEXT, e))?;
  run_detection(&state, URL_CONTEXT, move || Ok(image)).await
}
