use std::pin::Pin;

use async_stream::try_stream;
use futures_util::Stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use crate::{
    error::{error_message, RelayError},
    providers::{ProviderConfig, ProviderRegistry},
    request::RequestPayload,
    wire::DONE_MARKER,
};

/** \brief 上游流式分片序列；分片为原始 chunk JSON。 */
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, RelayError>> + Send>>;

/**
 * \brief 一次 Chat Completions 调用的结果：完整回复或分片流。
 */
pub enum Completion {
    Full(Value),
    Stream(ChunkStream),
}

/**
 * \brief 指向某个 Provider 的客户端；每个请求单独构造，不跨请求复用。
 */
#[derive(Debug, Clone)]
pub struct Client {
    provider: ProviderConfig,
    api_key: String,
    http: reqwest::Client,
}

/**
 * \brief 为指定 Provider 构造客户端；未知 Provider 返回 `UnsupportedProvider`。
 */
pub fn create_client(
    registry: &ProviderRegistry,
    provider: &str,
    api_key: &str,
) -> Result<Client, RelayError> {
    let provider = registry.lookup(provider)?.clone();
    let http = reqwest::Client::builder()
        .build()
        .map_err(RelayError::transport)?;
    Ok(Client {
        provider,
        api_key: api_key.to_string(),
        http,
    })
}

impl Client {
    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /**
     * \brief 以 Bearer 认证 POST JSON；非 2xx 响应归一为 `RelayError::Upstream`。
     */
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<reqwest::Response, RelayError> {
        let resp = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(RelayError::transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::upstream(status, &text));
        }
        Ok(resp)
    }
}

/**
 * \brief 调用 Chat Completions；`payload.stream` 决定返回完整结果还是分片流。
 */
pub async fn chat_completion(
    client: &Client,
    payload: &RequestPayload,
) -> Result<Completion, RelayError> {
    let resp = client.post_json(&client.provider.chat_url(), payload).await?;

    if !payload.stream {
        let v: Value = resp.json().await.map_err(RelayError::transport)?;
        if let Some(message) = error_message(&v).filter(|_| v.get("choices").is_none()) {
            return Err(RelayError::Upstream {
                status: None,
                message,
            });
        }
        return Ok(Completion::Full(v));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    let out = try_stream! {
        use futures_util::StreamExt;
        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| RelayError::MidStream(format!("upstream stream failed: {}", e)))?;
            buf.extend_from_slice(&chunk);
            while let Some((pos, sep)) = find_event_boundary(&buf) {
                let block = buf.drain(..pos + sep).collect::<Vec<u8>>();
                if let Some(data) = extract_data_line(&block) {
                    if data == DONE_MARKER {
                        break 'read;
                    }
                    yield parse_chunk(&data)?;
                }
            }
        }
        if let Some(data) = extract_data_line(&buf) {
            if data != DONE_MARKER {
                yield parse_chunk(&data)?;
            }
        }
    };

    Ok(Completion::Stream(Box::pin(out)))
}

/**
 * \brief 找到下一个 SSE 事件边界，返回 (位置, 分隔符长度)；兼容 `\n\n` 与 `\r\n\r\n`。
 */
fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/**
 * \brief 取出事件块中的 data 字段；多行 data 以换行拼接，注释行忽略。
 */
fn extract_data_line(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let lines: Vec<&str> = text
        .lines()
        .map(|line| line.trim_start())
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.trim())
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn parse_chunk(data: &str) -> Result<Value, RelayError> {
    let v: Value = serde_json::from_str(data)
        .map_err(|e| RelayError::MidStream(format!("malformed upstream chunk: {}", e)))?;
    if v.get("choices").is_none() {
        if let Some(message) = error_message(&v) {
            return Err(RelayError::MidStream(message));
        }
    }
    Ok(v)
}

/** \brief 分片中的增量正文 `choices[0].delta.content`。 */
pub fn chunk_delta(v: &Value) -> Option<&str> {
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

/** \brief 分片中的增量推理 `choices[0].delta.reasoning_content`。 */
pub fn chunk_reasoning(v: &Value) -> Option<&str> {
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("reasoning_content")?
        .as_str()
}

/**
 * \brief 从完整回复中取出 (正文, 推理)。
 */
pub fn completion_content(v: &Value) -> (String, Option<String>) {
    let message = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"));
    let content = message
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();
    let reasoning = message
        .and_then(|m| m.get("reasoning_content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    (content, reasoning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_client_rejects_unknown_provider() {
        let err = create_client(ProviderRegistry::builtin(), "anthropic", "k")
            .expect_err("unsupported");
        assert!(matches!(err, RelayError::UnsupportedProvider(_)));

        let client = create_client(ProviderRegistry::builtin(), "XAI", "k").expect("xai client");
        assert_eq!(client.provider().id.as_str(), "xai");
    }

    #[test]
    fn test_find_event_boundary() {
        assert_eq!(find_event_boundary(b"data: a\n\ndata: b"), Some((7, 2)));
        assert_eq!(find_event_boundary(b"data: a\r\n\r\n"), Some((7, 4)));
        assert_eq!(find_event_boundary(b"data: partial"), None);
    }

    #[test]
    fn test_extract_data_line() {
        assert_eq!(
            extract_data_line(b": keep-alive\ndata: {\"a\":1}\n\n").as_deref(),
            Some("{\"a\":1}")
        );
        assert_eq!(extract_data_line(b"data:[DONE]").as_deref(), Some("[DONE]"));
        assert_eq!(extract_data_line(b"event: ping\n\n"), None);
    }

    #[test]
    fn test_parse_chunk_maps_inline_errors() {
        let ok = parse_chunk(r#"{"choices":[{"delta":{"content":"x"}}]}"#).expect("chunk");
        assert_eq!(chunk_delta(&ok), Some("x"));

        let err = parse_chunk(r#"{"error":{"message":"overloaded"}}"#).expect_err("error");
        assert_eq!(err, RelayError::MidStream("overloaded".into()));

        assert!(matches!(
            parse_chunk("{not json"),
            Err(RelayError::MidStream(_))
        ));
    }

    #[test]
    fn test_completion_content() {
        let v = json!({"choices":[{"message":{"role":"assistant","content":"42","reasoning_content":"math"}}]});
        assert_eq!(
            completion_content(&v),
            ("42".to_string(), Some("math".to_string()))
        );
        assert_eq!(completion_content(&json!({})), (String::new(), None));

        let delta = json!({"choices":[{"delta":{"reasoning_content":"hmm"}}]});
        assert_eq!(chunk_reasoning(&delta), Some("hmm"));
        assert_eq!(chunk_delta(&delta), None);
    }
}
