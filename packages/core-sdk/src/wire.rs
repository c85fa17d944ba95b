use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{error::RelayError, llm};

/** \brief 事件流结束标记。 */
pub const DONE_MARKER: &str = "[DONE]";

pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
pub const RAW_TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/**
 * \brief 中继向客户端下发流式输出的线格式。
 *
 * - `EventStream`：`data: <json-chunk>\n\n`，以 `data: [DONE]\n\n` 结束，错误以 `{"error":..}` 记录下发；
 * - `RawText`：旧版纯文本模式，仅拼接增量文本；中途出错时响应体异常结束，没有结束标记。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    EventStream,
    RawText,
}

/**
 * \brief 中继输出的逻辑帧，由 `WireFormat::encode` 序列化为字节。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Chunk(Value),
    Error(String),
    Done,
}

impl WireFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            WireFormat::EventStream => EVENT_STREAM_CONTENT_TYPE,
            WireFormat::RawText => RAW_TEXT_CONTENT_TYPE,
        }
    }

    /** \brief 根据响应的 Content-Type 判断线格式；JSON 等非流式类型返回 None。 */
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "text/event-stream" => Some(WireFormat::EventStream),
            "text/plain" => Some(WireFormat::RawText),
            _ => None,
        }
    }

    /**
     * \brief 将一帧编码为下发字节；返回 None 表示该帧在此格式下无需输出。
     */
    pub fn encode(self, frame: &RelayFrame) -> Option<Bytes> {
        match (self, frame) {
            (WireFormat::EventStream, RelayFrame::Chunk(chunk)) => {
                Some(Bytes::from(format!("data: {}\n\n", chunk)))
            }
            (WireFormat::EventStream, RelayFrame::Error(message)) => Some(Bytes::from(format!(
                "data: {}\n\n",
                json!({ "error": message })
            ))),
            (WireFormat::EventStream, RelayFrame::Done) => {
                Some(Bytes::from(format!("data: {}\n\n", DONE_MARKER)))
            }
            (WireFormat::RawText, RelayFrame::Chunk(chunk)) => llm::chunk_delta(chunk)
                .filter(|s| !s.is_empty())
                .map(|s| Bytes::from(s.to_string())),
            // 纯文本模式没有带内错误通道，由中继异常结束响应体
            (WireFormat::RawText, RelayFrame::Error(_)) | (WireFormat::RawText, RelayFrame::Done) => {
                None
            }
        }
    }
}

impl FromStr for WireFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event-stream" | "sse" => Ok(WireFormat::EventStream),
            "raw-text" | "text" => Ok(WireFormat::RawText),
            other => Err(RelayError::InvalidInput(format!(
                "unknown wire format: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Value {
        json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"content": text}}]})
    }

    #[test]
    fn test_event_stream_framing() {
        let fmt = WireFormat::EventStream;
        let bytes = fmt.encode(&RelayFrame::Chunk(chunk("Hi"))).expect("chunk frame");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("}\n\n"));
        let payload: Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim()).expect("json payload");
        assert_eq!(payload, chunk("Hi"));

        let err = fmt
            .encode(&RelayFrame::Error("upstream closed".into()))
            .expect("error frame");
        assert_eq!(&err[..], b"data: {\"error\":\"upstream closed\"}\n\n");

        let done = fmt.encode(&RelayFrame::Done).expect("done frame");
        assert_eq!(&done[..], b"data: [DONE]\n\n");
    }

    #[test]
    fn test_raw_text_framing() {
        let fmt = WireFormat::RawText;
        assert_eq!(
            fmt.encode(&RelayFrame::Chunk(chunk("Hel"))).as_deref(),
            Some(&b"Hel"[..])
        );
        assert!(fmt.encode(&RelayFrame::Chunk(chunk(""))).is_none());
        assert!(fmt
            .encode(&RelayFrame::Chunk(json!({"choices": [{"delta": {"role": "assistant"}}]})))
            .is_none());
        assert!(fmt.encode(&RelayFrame::Done).is_none());
        assert!(fmt.encode(&RelayFrame::Error("gone".into())).is_none());
    }

    #[test]
    fn test_content_type_round_trip() {
        for fmt in [WireFormat::EventStream, WireFormat::RawText] {
            assert_eq!(WireFormat::from_content_type(fmt.content_type()), Some(fmt));
        }
        assert_eq!(WireFormat::from_content_type("application/json"), None);
        assert_eq!(
            "sse".parse::<WireFormat>().expect("parse"),
            WireFormat::EventStream
        );
        assert!("xml".parse::<WireFormat>().is_err());
    }
}
