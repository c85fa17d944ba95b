use std::fmt::Display;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::{
    error::{error_message, RelayError},
    llm,
    models::Message,
    wire::{WireFormat, DONE_MARKER},
};

/**
 * \brief 流式消费回调。`on_complete` 与 `on_error` 互斥且至多调用一次，之后不再有任何回调。
 */
pub trait StreamObserver {
    /** \brief 新增片段与当前累计全文。 */
    fn on_increment(&mut self, increment: &str, buffer: &str);
    fn on_error(&mut self, message: &str);
    fn on_complete(&mut self, text: &str);
    /** \brief 推理增量（可选实现）。 */
    fn on_reasoning(&mut self, _increment: &str) {}
}

/**
 * \brief 已累计的输出。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub content: String,
    pub reasoning: String,
}

impl Transcript {
    pub fn into_message(self) -> Message {
        Message::assistant(self.content, Some(self.reasoning))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Completed(Transcript),
    Failed {
        error: RelayError,
        partial: Transcript,
    },
}

/**
 * \brief 增量 UTF-8 解码器：跨分片的多字节字符会被暂存到下一次读取。
 */
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(
                        &self.pending[start..start + valid],
                    ));
                    start += valid;
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += len;
                        }
                        None => break,
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    fn flush(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/**
 * \brief 客户端流消费状态机；每次读取喂入一段字节，`feed` 返回 Some 后调用方不应再喂入。
 */
#[derive(Debug)]
pub struct StreamConsumer {
    format: WireFormat,
    decoder: Utf8Decoder,
    line_buf: String,
    transcript: Transcript,
}

impl StreamConsumer {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            decoder: Utf8Decoder::default(),
            line_buf: String::new(),
            transcript: Transcript::default(),
        }
    }

    /**
     * \brief 喂入一次读取的字节；返回 Some 表示已终止（结束标记或错误记录）。
     */
    pub fn feed(
        &mut self,
        bytes: &[u8],
        observer: &mut dyn StreamObserver,
    ) -> Option<ConsumeOutcome> {
        let text = self.decoder.decode(bytes);
        self.accept_text(text, observer)
    }

    /** \brief 读取结束（EOF）；未见结束标记时以已累计内容完成。 */
    pub fn finish(mut self, observer: &mut dyn StreamObserver) -> ConsumeOutcome {
        let rest = self.decoder.flush();
        if let Some(outcome) = self.accept_text(rest, observer) {
            return outcome;
        }
        if self.format == WireFormat::EventStream && !self.line_buf.trim().is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            if let Some(outcome) = self.process_line(&line, observer) {
                return outcome;
            }
        }
        self.complete(observer)
    }

    fn accept_text(
        &mut self,
        text: String,
        observer: &mut dyn StreamObserver,
    ) -> Option<ConsumeOutcome> {
        if text.is_empty() {
            return None;
        }
        match self.format {
            WireFormat::RawText => {
                self.append(&text, observer);
                None
            }
            WireFormat::EventStream => {
                self.line_buf.push_str(&text);
                while let Some(pos) = self.line_buf.find('\n') {
                    let line: String = self.line_buf.drain(..=pos).collect();
                    if let Some(outcome) = self.process_line(&line, observer) {
                        return Some(outcome);
                    }
                }
                None
            }
        }
    }

    fn process_line(
        &mut self,
        line: &str,
        observer: &mut dyn StreamObserver,
    ) -> Option<ConsumeOutcome> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        // 空行是事件分隔，冒号开头是注释/保活
        let data = line.strip_prefix("data:")?.trim();
        if data == DONE_MARKER {
            return Some(self.complete(observer));
        }
        let record: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                return Some(self.fail(
                    RelayError::MidStream(format!("malformed stream record: {}", e)),
                    observer,
                ))
            }
        };
        if record.get("error").is_some() {
            let message = error_message(&record).unwrap_or_else(|| record.to_string());
            return Some(self.fail(RelayError::MidStream(message), observer));
        }
        if let Some(reasoning) = llm::chunk_reasoning(&record).filter(|s| !s.is_empty()) {
            self.transcript.reasoning.push_str(reasoning);
            observer.on_reasoning(reasoning);
        }
        if let Some(delta) = llm::chunk_delta(&record) {
            let delta = delta.to_string();
            self.append(&delta, observer);
        }
        None
    }

    fn append(&mut self, increment: &str, observer: &mut dyn StreamObserver) {
        if increment.is_empty() {
            return;
        }
        self.transcript.content.push_str(increment);
        observer.on_increment(increment, &self.transcript.content);
    }

    fn complete(&mut self, observer: &mut dyn StreamObserver) -> ConsumeOutcome {
        let transcript = std::mem::take(&mut self.transcript);
        observer.on_complete(&transcript.content);
        ConsumeOutcome::Completed(transcript)
    }

    fn fail(&mut self, error: RelayError, observer: &mut dyn StreamObserver) -> ConsumeOutcome {
        observer.on_error(&error.to_string());
        ConsumeOutcome::Failed {
            error,
            partial: std::mem::take(&mut self.transcript),
        }
    }
}

/**
 * \brief 逐段读取响应体并驱动回调；不做任何重试。
 */
pub async fn consume<S, E>(
    body: S,
    format: WireFormat,
    observer: &mut dyn StreamObserver,
) -> ConsumeOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut consumer = StreamConsumer::new(format);
    while let Some(read) = body.next().await {
        match read {
            Ok(bytes) => {
                if let Some(outcome) = consumer.feed(&bytes, observer) {
                    return outcome;
                }
            }
            Err(e) => {
                let error = RelayError::MidStream(format!("failed to read response: {}", e));
                return consumer.fail(error, observer);
            }
        }
    }
    consumer.finish(observer)
}

/**
 * \brief 处理中继的完整 HTTP 响应：错误状态、一次性 JSON 或流式正文。
 */
pub async fn consume_response(
    resp: reqwest::Response,
    observer: &mut dyn StreamObserver,
) -> ConsumeOutcome {
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let error = RelayError::upstream(status.as_u16(), &text);
        observer.on_error(&error.to_string());
        return ConsumeOutcome::Failed {
            error,
            partial: Transcript::default(),
        };
    }

    match WireFormat::from_content_type(&content_type) {
        Some(format) => consume(resp.bytes_stream(), format, observer).await,
        None => {
            let mut consumer = StreamConsumer::new(WireFormat::RawText);
            let v: Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    let error = RelayError::Upstream {
                        status: None,
                        message: format!("invalid completion body: {}", e),
                    };
                    return consumer.fail(error, observer);
                }
            };
            if v.get("choices").is_none() {
                if let Some(message) = error_message(&v) {
                    return consumer.fail(
                        RelayError::Upstream {
                            status: None,
                            message,
                        },
                        observer,
                    );
                }
            }
            let (content, reasoning) = llm::completion_content(&v);
            if let Some(reasoning) = reasoning {
                observer.on_reasoning(&reasoning);
                consumer.transcript.reasoning = reasoning;
            }
            consumer.append(&content, observer);
            consumer.complete(observer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    /** \brief 记录全部回调，便于断言调用顺序。 */
    #[derive(Default)]
    struct Recorder {
        increments: Vec<String>,
        buffers: Vec<String>,
        reasoning: String,
        errors: Vec<String>,
        completed: Vec<String>,
        calls_after_end: usize,
    }

    impl Recorder {
        fn ended(&self) -> bool {
            !self.errors.is_empty() || !self.completed.is_empty()
        }
    }

    impl StreamObserver for Recorder {
        fn on_increment(&mut self, increment: &str, buffer: &str) {
            if self.ended() {
                self.calls_after_end += 1;
            }
            self.increments.push(increment.to_string());
            self.buffers.push(buffer.to_string());
        }
        fn on_error(&mut self, message: &str) {
            if self.ended() {
                self.calls_after_end += 1;
            }
            self.errors.push(message.to_string());
        }
        fn on_complete(&mut self, text: &str) {
            if self.ended() {
                self.calls_after_end += 1;
            }
            self.completed.push(text.to_string());
        }
        fn on_reasoning(&mut self, increment: &str) {
            self.reasoning.push_str(increment);
        }
    }

    fn body(parts: Vec<&[u8]>) -> impl Stream<Item = Result<Bytes, Infallible>> {
        stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::copy_from_slice(p)))
                .collect::<Vec<_>>(),
        )
    }

    fn sse(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]})
        )
    }

    #[test]
    fn test_utf8_decoder_holds_split_characters() {
        let mut dec = Utf8Decoder::default();
        let bytes = "héllo 世界".as_bytes();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&dec.decode(std::slice::from_ref(b)));
        }
        out.push_str(&dec.flush());
        assert_eq!(out, "héllo 世界");

        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.decode(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn test_event_stream_accumulates_until_done() {
        let raw = format!("{}{}: ping\n\n{}data: [DONE]\n\n{}", sse("Hel"), sse("lo"), sse("!"), sse("late"));
        let mut rec = Recorder::default();
        let outcome = consume(body(vec![raw.as_bytes()]), WireFormat::EventStream, &mut rec).await;
        assert_eq!(rec.increments, vec!["Hel", "lo", "!"]);
        assert_eq!(rec.buffers, vec!["Hel", "Hello", "Hello!"]);
        assert_eq!(rec.completed, vec!["Hello!"]);
        assert_eq!(rec.calls_after_end, 0);
        match outcome {
            ConsumeOutcome::Completed(t) => assert_eq!(t.content, "Hello!"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_increments_concatenate_to_final_text_for_any_split() {
        let raw = format!("{}{}{}data: [DONE]\n\n", sse("¿Qué "), sse("tal"), sse(" 世界?"));
        let bytes = raw.as_bytes();
        for split in 1..bytes.len() {
            let mut rec = Recorder::default();
            let parts = vec![&bytes[..split], &bytes[split..]];
            consume(body(parts), WireFormat::EventStream, &mut rec).await;
            assert_eq!(rec.completed.len(), 1, "split at {}", split);
            assert_eq!(rec.increments.concat(), rec.completed[0], "split at {}", split);
            assert_eq!(rec.completed[0], "¿Qué tal 世界?");
        }
    }

    #[tokio::test]
    async fn test_error_record_stops_consumption() {
        let raw = format!(
            "{}data: {{\"error\":\"upstream overloaded\"}}\n\n{}data: [DONE]\n\n",
            sse("par"),
            sse("never")
        );
        let mut rec = Recorder::default();
        let outcome = consume(body(vec![raw.as_bytes()]), WireFormat::EventStream, &mut rec).await;
        assert_eq!(rec.increments, vec!["par"]);
        assert_eq!(rec.errors, vec!["upstream overloaded"]);
        assert!(rec.completed.is_empty());
        assert_eq!(rec.calls_after_end, 0);
        assert_eq!(
            outcome,
            ConsumeOutcome::Failed {
                error: RelayError::MidStream("upstream overloaded".into()),
                partial: Transcript {
                    content: "par".into(),
                    reasoning: String::new()
                },
            }
        );
    }

    #[tokio::test]
    async fn test_reasoning_is_tracked_separately() {
        let chunk = serde_json::json!({"choices": [{"delta": {"reasoning_content": "think"}}]});
        let raw = format!("data: {}\n\n{}data: [DONE]\n\n", chunk, sse("answer"));
        let mut rec = Recorder::default();
        let outcome = consume(body(vec![raw.as_bytes()]), WireFormat::EventStream, &mut rec).await;
        assert_eq!(rec.reasoning, "think");
        assert_eq!(rec.increments, vec!["answer"]);
        match outcome {
            ConsumeOutcome::Completed(t) => {
                let msg = t.into_message();
                assert_eq!(msg.content, "answer");
                assert_eq!(msg.reasoning.as_deref(), Some("think"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_raw_text_appends_verbatim() {
        let mut rec = Recorder::default();
        let parts: Vec<&[u8]> = vec![&b"data: not parsed "[..], "caf".as_bytes(), &[0xc3][..], &[0xa9][..]];
        let outcome = consume(body(parts), WireFormat::RawText, &mut rec).await;
        assert_eq!(rec.completed, vec!["data: not parsed café"]);
        assert_eq!(rec.increments.concat(), "data: not parsed café");
        assert!(matches!(outcome, ConsumeOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_read_error_fails_once() {
        let parts: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from(sse("a"))),
            Err("connection reset".to_string()),
            Ok(Bytes::from(sse("b"))),
        ];
        let mut rec = Recorder::default();
        let outcome = consume(stream::iter(parts), WireFormat::EventStream, &mut rec).await;
        assert_eq!(rec.increments, vec!["a"]);
        assert_eq!(rec.errors.len(), 1);
        assert!(rec.errors[0].contains("connection reset"));
        assert!(matches!(outcome, ConsumeOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_eof_without_done_completes_with_partial_line() {
        let raw = format!("{}data: {}", sse("a"), serde_json::json!({"choices": [{"delta": {"content": "b"}}]}));
        let mut rec = Recorder::default();
        consume(body(vec![raw.as_bytes()]), WireFormat::EventStream, &mut rec).await;
        assert_eq!(rec.completed, vec!["ab"]);
    }
}
