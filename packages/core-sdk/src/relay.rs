use axum::{
    body::Body,
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    error::RelayError,
    llm::{self, ChunkStream, Completion},
    models::Message,
    providers::ProviderRegistry,
    request::{build_request, ChatOptions},
    telemetry,
    wire::{RelayFrame, WireFormat},
};

/** \brief 中继到客户端的通道容量；只做背压，不改变顺序。 */
const RELAY_CHANNEL_CAPACITY: usize = 16;

/**
 * \brief 单个请求的中继状态：`Idle → Sending → (Streaming | Buffering) → Closed`。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Sending,
    Streaming,
    Buffering,
    Closed,
}

/**
 * \brief 流式中继的结束方式。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /** \brief 上游分片耗尽，已下发结束标记。 */
    Completed { chunks: usize },
    /** \brief 中途出错，已下发错误事件与结束标记。 */
    Failed { chunks: usize, message: String },
    /** \brief 客户端已断开，停止拉取上游。 */
    Cancelled { chunks: usize },
}

/**
 * \brief 一次聊天中继请求（已从 HTTP 请求体解析）。
 */
#[derive(Debug, Clone, Default)]
pub struct RelayRequest {
    pub provider: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub options: ChatOptions,
    /** \brief 覆盖 Provider 配置的线格式 */
    pub wire_format: Option<WireFormat>,
}

/**
 * \brief 中继响应：一次性 JSON 或分片字节流。
 */
pub enum RelayResponse {
    Buffered(Value),
    Streaming {
        format: WireFormat,
        body: ReceiverStream<Result<Bytes, RelayError>>,
    },
}

impl IntoResponse for RelayResponse {
    fn into_response(self) -> Response {
        match self {
            RelayResponse::Buffered(v) => Json(v).into_response(),
            RelayResponse::Streaming { format, body } => (
                [
                    (CONTENT_TYPE, format.content_type()),
                    (CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(body),
            )
                .into_response(),
        }
    }
}

/**
 * \brief `Idle → Sending` 的前置校验；失败时不会触达上游。
 */
pub fn validate(req: &RelayRequest) -> Result<(), RelayError> {
    if req
        .api_key
        .as_deref()
        .map(|k| k.trim().is_empty())
        .unwrap_or(true)
    {
        return Err(RelayError::MissingCredential);
    }
    if req.messages.is_empty() {
        return Err(RelayError::InvalidInput(
            "messages must be a non-empty array".to_string(),
        ));
    }
    Ok(())
}

/**
 * \brief 打开上游调用并决定响应形态。
 *
 * 建立连接阶段（含首个分片到达之前）的失败以 `Err` 返回，由调用方渲染为 JSON 错误；
 * 之后的失败在流内下发（见 `pump`）。
 */
pub async fn open(
    registry: &ProviderRegistry,
    req: RelayRequest,
) -> Result<RelayResponse, RelayError> {
    let mut state = RelayState::Idle;
    validate(&req)?;
    let api_key = req.api_key.as_deref().unwrap_or_default();
    let client = llm::create_client(registry, &req.provider, api_key)?;
    let provider = client.provider();
    let payload = build_request(provider, req.model.as_deref(), &req.messages, &req.options);
    let format = req.wire_format.unwrap_or(provider.wire_format);
    let label = format!("provider={} model={}", provider.id, payload.model);

    advance(&mut state, RelayState::Sending, &label);
    let completion = match llm::chat_completion(&client, &payload).await {
        Ok(c) => c,
        Err(e) => {
            telemetry::log_error("relay", &format!("{} upstream failed: {}", label, e));
            advance(&mut state, RelayState::Closed, &label);
            return Err(e);
        }
    };

    match completion {
        Completion::Full(v) => {
            advance(&mut state, RelayState::Buffering, &label);
            advance(&mut state, RelayState::Closed, &label);
            Ok(RelayResponse::Buffered(v))
        }
        Completion::Stream(mut chunks) => {
            let first = match chunks.next().await {
                Some(Ok(chunk)) => Some(chunk),
                Some(Err(e)) => {
                    telemetry::log_error(
                        "relay",
                        &format!("{} stream failed before first chunk: {}", label, e),
                    );
                    advance(&mut state, RelayState::Closed, &label);
                    return Err(match e {
                        RelayError::MidStream(message) => RelayError::Upstream {
                            status: None,
                            message,
                        },
                        other => other,
                    });
                }
                None => None,
            };
            advance(&mut state, RelayState::Streaming, &label);

            let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                let outcome = pump(first, chunks, format, tx).await;
                advance(&mut state, RelayState::Closed, &label);
                match &outcome {
                    RelayOutcome::Failed { chunks, message } => telemetry::log_error(
                        "relay",
                        &format!("{} mid-stream error after {} chunks: {}", label, chunks, message),
                    ),
                    other => telemetry::log_event("relay", &format!("{} {:?}", label, other)),
                }
            });

            Ok(RelayResponse::Streaming {
                format,
                body: ReceiverStream::new(rx),
            })
        }
    }
}

/**
 * \brief 按到达顺序逐个转发分片；客户端断开（通道关闭）即停止拉取上游。
 *
 * 出错时：有带内错误帧的格式先发错误帧再发结束标记；没有的格式以 `Err` 结束响应体，
 * 客户端读取随之失败。返回时 `tx` 被释放，下游连接随之关闭且只关闭一次。
 */
pub async fn pump(
    first: Option<Value>,
    mut chunks: ChunkStream,
    format: WireFormat,
    tx: mpsc::Sender<Result<Bytes, RelayError>>,
) -> RelayOutcome {
    let mut sent = 0usize;
    let mut pending = first;
    let mut failure = None;

    loop {
        let chunk = match pending.take() {
            Some(chunk) => chunk,
            None => {
                let next = tokio::select! {
                    _ = tx.closed() => return RelayOutcome::Cancelled { chunks: sent },
                    next = chunks.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        failure = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
        };
        if let Some(bytes) = format.encode(&RelayFrame::Chunk(chunk)) {
            if tx.send(Ok(bytes)).await.is_err() {
                return RelayOutcome::Cancelled { chunks: sent };
            }
            sent += 1;
        }
    }
    drop(chunks);

    if let Some(message) = &failure {
        let frame = format
            .encode(&RelayFrame::Error(message.clone()))
            .ok_or_else(|| RelayError::MidStream(message.clone()));
        let aborted = frame.is_err();
        if tx.send(frame).await.is_err() {
            return RelayOutcome::Cancelled { chunks: sent };
        }
        if aborted {
            return RelayOutcome::Failed {
                chunks: sent,
                message: message.clone(),
            };
        }
    }
    if let Some(bytes) = format.encode(&RelayFrame::Done) {
        if tx.send(Ok(bytes)).await.is_err() {
            return RelayOutcome::Cancelled { chunks: sent };
        }
    }

    match failure {
        Some(message) => RelayOutcome::Failed {
            chunks: sent,
            message,
        },
        None => RelayOutcome::Completed { chunks: sent },
    }
}

fn advance(state: &mut RelayState, next: RelayState, label: &str) {
    telemetry::log_event("relay", &format!("{} {:?} -> {:?}", label, state, next));
    *state = next;
}
