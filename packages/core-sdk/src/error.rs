use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/**
 * \brief 中继链路的统一错误类型；上游返回的各种错误形态都在 Provider 边界处归一到这里。
 */
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /** \brief 请求体格式错误或字段缺失（400）。 */
    #[error("{0}")]
    InvalidInput(String),
    /** \brief 未提供 API Key（401）。 */
    #[error("API key not provided")]
    MissingCredential,
    /** \brief 未知的 Provider 标识（400）。 */
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
    /** \brief 流开始之前的上游失败；携带上游状态码（若有）。 */
    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },
    /** \brief 字节已开始下发后的失败，只能以流内事件的形式通知客户端。 */
    #[error("{0}")]
    MidStream(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidInput(_) | RelayError::UnsupportedProvider(_) => {
                StatusCode::BAD_REQUEST
            }
            RelayError::MissingCredential => StatusCode::UNAUTHORIZED,
            RelayError::Upstream {
                status: Some(code), ..
            } => StatusCode::from_u16(*code)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            RelayError::Upstream { status: None, .. } | RelayError::MidStream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /**
     * \brief 由上游的非 2xx 响应构造错误，尽量取出 `error.message` / `error` / `message` 字段。
     */
    pub fn upstream(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| error_message(&v))
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("upstream request failed with status {}", status)
                } else {
                    trimmed.to_string()
                }
            });
        RelayError::Upstream {
            status: Some(status),
            message,
        }
    }

    /** \brief 传输层错误（连接失败、解码失败等），状态码取自 reqwest 若存在。 */
    pub fn transport(err: reqwest::Error) -> Self {
        RelayError::Upstream {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/**
 * \brief 从 JSON 错误体中提取消息文本，兼容 `{"error":{"message":..}}`、`{"error":".."}`、`{"message":".."}`。
 */
pub fn error_message(v: &Value) -> Option<String> {
    match v.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(obj @ Value::Object(_)) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
            .or_else(|| Some(obj.to_string())),
        _ => v
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string()),
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
