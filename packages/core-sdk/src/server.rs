use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, get_service, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::services::ServeDir;

use crate::{
    config::ServerConfig,
    error::RelayError,
    images::{self, ImageRequest},
    models::Message,
    providers::{ProviderConfig, ProviderId, ProviderRegistry},
    relay::{self, RelayRequest},
    request::{ChatOptions, DEFAULT_TEMPERATURE},
    telemetry,
    wire::WireFormat,
};

/**
 * \brief 路由共享状态：启动时构建、之后只读的 Provider 注册表。
 */
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
}

impl AppState {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

/**
 * \brief 组装路由：API 与静态前端（fallback）。
 */
pub fn app(state: AppState, static_root: PathBuf) -> Router {
    let static_service =
        get_service(ServeDir::new(static_root).append_index_html_on_directories(true));

    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/images", post(generate_images))
        .route("/api/proxy", get(proxy_image))
        .route("/api/providers", get(list_providers))
        .route("/api/health", get(health_check))
        .fallback_service(static_service)
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 */
pub async fn run(config: ServerConfig) -> Result<()> {
    telemetry::init(config.telemetry, config.log_dir.clone());
    let state = AppState::new(config.registry());
    let app = app(state, config.static_root());

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    telemetry::log_event("server", &format!("listening on {}", config.addr));
    println!("Server listening on http://{}", config.addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief `POST /api/chat` 请求体。字段名沿用网页端的 camelCase，`max_tokens` 例外。
 */
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ChatRequestBody {
    #[serde(default)]
    messages: Option<Value>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
    /** \brief 缺省为 true */
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    reasoning_level: Option<String>,
    #[serde(default, rename = "max_tokens")]
    max_tokens: Option<f64>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    wire_format: Option<String>,
}

impl ChatRequestBody {
    fn parse(body: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(body)
            .map_err(|e| RelayError::InvalidInput(format!("malformed request body: {}", e)))
    }

    /**
     * \brief 转换为中继请求；先查凭据，再查消息。
     */
    fn into_relay_request(self) -> Result<RelayRequest, RelayError> {
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(RelayError::MissingCredential)?;
        let messages: Vec<Message> = match self.messages {
            Some(v @ Value::Array(_)) => serde_json::from_value(v).map_err(|e| {
                RelayError::InvalidInput(format!("invalid messages: {}", e))
            })?,
            _ => {
                return Err(RelayError::InvalidInput(
                    "messages must be a non-empty array".to_string(),
                ))
            }
        };
        let wire_format = self
            .wire_format
            .as_deref()
            .map(str::parse::<WireFormat>)
            .transpose()?;

        Ok(RelayRequest {
            provider: self
                .provider
                .unwrap_or_else(|| ProviderId::Xai.as_str().to_string()),
            api_key: Some(api_key),
            model: self.model.filter(|m| !m.trim().is_empty()),
            messages,
            options: ChatOptions {
                temperature: Some(self.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
                max_tokens: self.max_tokens.map(|n| n as i64),
                reasoning_effort: self.reasoning_level,
                stream: self.stream.unwrap_or(true),
            },
            wire_format,
        })
    }
}

/**
 * \brief 聊天中继：流式（SSE / 纯文本）或一次性 JSON。
 */
async fn chat(State(state): State<AppState>, body: Bytes) -> Response {
    let req = match ChatRequestBody::parse(&body).and_then(ChatRequestBody::into_relay_request) {
        Ok(req) => req,
        Err(e) => {
            telemetry::log_error("server.chat", &format!("rejected: {}", e));
            return e.into_response();
        }
    };

    telemetry::log_event(
        "server.chat",
        &format!(
            "provider={} model={} messages={} stream={}",
            req.provider,
            req.model.as_deref().unwrap_or("-"),
            req.messages.len(),
            req.options.stream
        ),
    );

    match relay::open(&state.registry, req).await {
        Ok(resp) => resp.into_response(),
        Err(e) => {
            telemetry::log_error("server.chat", &format!("relay failed: {}", e));
            e.into_response()
        }
    }
}

/**
 * \brief 图像生成：校验后转发到 xAI，结果原样返回。
 */
async fn generate_images(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ImageRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return RelayError::InvalidInput(format!("malformed request body: {}", e))
                .into_response()
        }
    };
    telemetry::log_event(
        "server.images",
        &format!(
            "n={} format={:?}",
            request.n.unwrap_or(1),
            request.response_format.unwrap_or_default()
        ),
    );
    match images::generate(&state.registry, request).await {
        Ok(v) => Json(v).into_response(),
        Err(e) => {
            telemetry::log_error("server.images", &format!("generation failed: {}", e));
            e.into_response()
        }
    }
}

#[derive(Deserialize, Debug)]
struct ProxyQuery {
    url: Option<String>,
}

/**
 * \brief 图片代理：`GET /api/proxy?url=...`
 */
async fn proxy_image(Query(q): Query<ProxyQuery>) -> Response {
    match images::proxy(q.url.as_deref()).await {
        Ok(resp) => resp,
        Err(e) => {
            telemetry::log_error("server.proxy", &format!("proxy failed: {}", e));
            e.into_response()
        }
    }
}

/**
 * \brief 列出可用的 Provider 及其模型。
 */
async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<&ProviderConfig> = state.registry.iter().collect();
    Json(json!({ "providers": providers }))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "ok": true }))
}
