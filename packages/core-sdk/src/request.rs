use serde::Serialize;

use crate::{
    models::{Message, Role},
    providers::ProviderConfig,
};

/** \brief 原聊天接口使用的默认温度。 */
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/**
 * \brief 调用方可选参数。
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    /** \brief 非正数视为未提供 */
    pub max_tokens: Option<i64>,
    /** \brief 推理强度，如 "low" / "high" */
    pub reasoning_effort: Option<String>,
    pub stream: bool,
}

/**
 * \brief 发往上游的消息，只保留 role/content（推理内容不回传）。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}

/**
 * \brief Chat Completions 请求体。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestPayload {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

/**
 * \brief 按 Provider 能力构造请求体。
 *
 * - 未知模型静默回落到默认模型；
 * - 仅当模型支持推理且调用方提供了强度时附带 `reasoning_effort`；
 * - 仅当 `max_tokens` 为正时附带；
 * - Provider 不支持流式时强制 `stream=false`。
 */
pub fn build_request(
    provider: &ProviderConfig,
    requested_model: Option<&str>,
    messages: &[Message],
    options: &ChatOptions,
) -> RequestPayload {
    let resolved = provider.resolve_model(requested_model);
    let reasoning_effort = options
        .reasoning_effort
        .as_deref()
        .map(str::trim)
        .filter(|level| resolved.supports_reasoning && !level.is_empty())
        .map(str::to_string);

    RequestPayload {
        model: resolved.id.to_string(),
        messages: messages.iter().map(WireMessage::from).collect(),
        stream: options.stream && provider.supports_streaming,
        temperature: options.temperature,
        max_tokens: options.max_tokens.filter(|n| *n > 0),
        reasoning_effort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderId, ProviderRegistry};

    fn history() -> Vec<Message> {
        vec![
            Message::user("hi"),
            Message::assistant("hello", Some("thinking".into())),
            Message::user("again"),
        ]
    }

    #[test]
    fn test_stream_forced_off_when_unsupported() {
        let reg = ProviderRegistry::builtin();
        let opts = ChatOptions {
            stream: true,
            ..Default::default()
        };
        let deepseek = reg.get(ProviderId::Deepseek).expect("deepseek");
        assert!(!build_request(deepseek, None, &history(), &opts).stream);

        let xai = reg.get(ProviderId::Xai).expect("xai");
        assert!(build_request(xai, None, &history(), &opts).stream);

        let off = ChatOptions::default();
        assert!(!build_request(xai, None, &history(), &off).stream);
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let reg = ProviderRegistry::builtin();
        let xai = reg.get(ProviderId::Xai).expect("xai");
        let payload = build_request(xai, Some("deepseek-chat"), &history(), &Default::default());
        assert_eq!(payload.model, xai.default_model);
    }

    #[test]
    fn test_reasoning_effort_only_for_reasoning_models() {
        let reg = ProviderRegistry::builtin();
        let xai = reg.get(ProviderId::Xai).expect("xai");
        let opts = ChatOptions {
            reasoning_effort: Some("high".into()),
            ..Default::default()
        };
        let with = build_request(xai, Some("grok-3-mini-beta"), &history(), &opts);
        assert_eq!(with.reasoning_effort.as_deref(), Some("high"));

        let without = build_request(xai, Some("grok-3-fast-beta"), &history(), &opts);
        assert!(without.reasoning_effort.is_none());

        let blank = ChatOptions {
            reasoning_effort: Some("  ".into()),
            ..Default::default()
        };
        assert!(build_request(xai, Some("grok-3-mini-beta"), &history(), &blank)
            .reasoning_effort
            .is_none());
    }

    #[test]
    fn test_max_tokens_only_when_positive() {
        let reg = ProviderRegistry::builtin();
        let xai = reg.get(ProviderId::Xai).expect("xai");
        for (given, expected) in [(Some(2000), Some(2000)), (Some(0), None), (Some(-5), None), (None, None)] {
            let opts = ChatOptions {
                max_tokens: given,
                ..Default::default()
            };
            assert_eq!(build_request(xai, None, &history(), &opts).max_tokens, expected);
        }
    }

    #[test]
    fn test_payload_serialization_omits_absent_fields() {
        let reg = ProviderRegistry::builtin();
        let deepseek = reg.get(ProviderId::Deepseek).expect("deepseek");
        let payload = build_request(deepseek, None, &history(), &Default::default());
        let v = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(
            v,
            serde_json::json!({
                "model": "deepseek-chat",
                "messages": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"},
                    {"role": "user", "content": "again"}
                ],
                "stream": false
            })
        );
    }
}
