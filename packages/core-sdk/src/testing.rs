//! 测试用的本地上游与中继：均绑定在 127.0.0.1 的临时端口上。

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    providers::{ProviderId, ProviderRegistry},
    server::{self, AppState},
};

pub(crate) const STREAM_DELTAS: [&str; 3] = ["Hel", "lo", " world"];
pub(crate) const MID_STREAM_ERROR: &str = "upstream exploded";
pub(crate) const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake";

/**
 * \brief 模拟上游的行为。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpstreamMode {
    /** \brief 正常返回分片或完整 JSON */
    Ok,
    /** \brief 以 401 拒绝 */
    Reject,
    /** \brief 首个事件即为错误记录 */
    FailBeforeFirst,
    /** \brief 下发全部分片后追加一条错误记录 */
    FailMidStream,
}

#[derive(Clone)]
struct UpstreamState {
    mode: UpstreamMode,
    hits: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<Value>>>,
    base: String,
}

pub(crate) struct MockUpstream {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<Value>>>,
}

impl MockUpstream {
    pub async fn start(mode: UpstreamMode) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr: SocketAddr = listener.local_addr().expect("mock upstream addr");
        let base_url = format!("http://{}/v1", addr);
        let hits = Arc::new(AtomicUsize::new(0));
        let last_body = Arc::new(Mutex::new(None));
        let state = UpstreamState {
            mode,
            hits: hits.clone(),
            last_body: last_body.clone(),
            base: format!("http://{}", addr),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/images/generations", post(image_generations))
            .route("/img.png", get(image_bytes))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self {
            base_url,
            hits,
            last_body,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Option<Value> {
        self.last_body.lock().expect("last body lock").clone()
    }

    /** \brief 两个 Provider 都指向本上游的注册表。 */
    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::builtin()
            .clone()
            .with_base_url(ProviderId::Xai, self.base_url.clone())
            .with_base_url(ProviderId::Deepseek, self.base_url.clone())
    }
}

fn record(state: &UpstreamState, body: Value) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    *state.last_body.lock().expect("last body lock") = Some(body);
}

fn sse_record(v: &Value) -> String {
    format!("data: {}\n\n", v)
}

async fn chat_completions(State(state): State<UpstreamState>, Json(body): Json<Value>) -> Response {
    let stream = body["stream"].as_bool().unwrap_or(false);
    record(&state, body);

    let error = json!({"error": {"message": MID_STREAM_ERROR}});
    match state.mode {
        UpstreamMode::Reject => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"message": "Incorrect API key provided"}})),
            )
                .into_response()
        }
        UpstreamMode::FailBeforeFirst if stream => {
            return ([(CONTENT_TYPE, "text/event-stream")], sse_record(&error)).into_response()
        }
        _ => {}
    }

    if !stream {
        return Json(json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": STREAM_DELTAS.concat(),
                    "reasoning_content": "thinking"
                },
                "finish_reason": "stop"
            }]
        }))
        .into_response();
    }

    let mut out = String::new();
    for delta in STREAM_DELTAS {
        out.push_str(&sse_record(&json!({
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": delta}}]
        })));
    }
    if state.mode == UpstreamMode::FailMidStream {
        out.push_str(&sse_record(&error));
    } else {
        out.push_str("data: [DONE]\n\n");
    }
    ([(CONTENT_TYPE, "text/event-stream")], out).into_response()
}

async fn image_generations(State(state): State<UpstreamState>, Json(body): Json<Value>) -> Response {
    let n = body["n"].as_u64().unwrap_or(1);
    record(&state, body);
    if state.mode == UpstreamMode::Reject {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "Incorrect API key provided"}})),
        )
            .into_response();
    }
    let data: Vec<Value> = (0..n)
        .map(|i| {
            json!({
                "url": format!("{}/img.png?i={}", state.base, i),
                "revised_prompt": "a revised prompt"
            })
        })
        .collect();
    Json(json!({ "data": data })).into_response()
}

async fn image_bytes() -> Response {
    ([(CONTENT_TYPE, "image/png")], PNG_BYTES).into_response()
}

/**
 * \brief 启动中继并返回其根地址，如 `http://127.0.0.1:43210`。
 */
pub(crate) async fn spawn_relay(registry: ProviderRegistry) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let static_root = std::env::temp_dir().join("chatrelay-test-static-missing");
    let app = server::app(AppState::new(registry), static_root);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}
