use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::{
    consumer::{consume_response, ConsumeOutcome, StreamObserver},
    error::RelayError,
    models::{Conversation, Message},
    providers::ProviderId,
    request::{ChatOptions, WireMessage},
    telemetry,
    wire::WireFormat,
};

/**
 * \brief 客户端内存中的各 Provider API Key；不落盘，也不会被中继保存。
 */
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    keys: HashMap<ProviderId, String>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /** \brief 读取 `CHATRELAY_XAI_API_KEY` / `CHATRELAY_DEEPSEEK_API_KEY`。 */
    pub fn from_env() -> Self {
        let mut store = Self::new();
        for (id, key) in [
            (ProviderId::Xai, "CHATRELAY_XAI_API_KEY"),
            (ProviderId::Deepseek, "CHATRELAY_DEEPSEEK_API_KEY"),
        ] {
            if let Ok(value) = std::env::var(key) {
                store.set(id, value);
            }
        }
        store
    }

    pub fn set(&mut self, provider: ProviderId, key: impl Into<String>) {
        let key = key.into();
        if key.trim().is_empty() {
            self.keys.remove(&provider);
        } else {
            self.keys.insert(provider, key);
        }
    }

    pub fn get(&self, provider: ProviderId) -> Option<&str> {
        self.keys.get(&provider).map(|s| s.as_str())
    }

    pub fn remove(&mut self, provider: ProviderId) {
        self.keys.remove(&provider);
    }
}

/**
 * \brief 客户端聊天会话：持有会话历史并通过中继逐轮发送。
 *
 * `send` 需要 `&mut self`，因此同一会话同一时刻只有一个在途请求。
 */
#[derive(Debug)]
pub struct ChatSession {
    http: reqwest::Client,
    relay_url: String,
    pub provider: ProviderId,
    pub model: Option<String>,
    pub options: ChatOptions,
    pub wire_format: Option<WireFormat>,
    conversation: Conversation,
}

impl ChatSession {
    pub fn new(relay_url: impl Into<String>, provider: ProviderId) -> Self {
        Self {
            http: reqwest::Client::new(),
            relay_url: relay_url.into(),
            provider,
            model: None,
            options: ChatOptions {
                stream: true,
                ..Default::default()
            },
            wire_format: None,
            conversation: Conversation::new(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn clear(&mut self) {
        self.conversation.clear();
    }

    /** \brief 追加系统提示（在首轮之前调用）。 */
    pub fn push_system(&mut self, prompt: impl Into<String>) {
        self.conversation.push(Message::system(prompt));
    }

    fn request_body(&self, api_key: &str, user: &Message) -> Value {
        let messages: Vec<WireMessage> = self
            .conversation
            .messages()
            .iter()
            .chain(std::iter::once(user))
            .map(WireMessage::from)
            .collect();
        let mut body = Map::new();
        body.insert("messages".into(), json!(messages));
        body.insert("provider".into(), json!(self.provider));
        body.insert("apiKey".into(), json!(api_key));
        body.insert("stream".into(), json!(self.options.stream));
        if let Some(model) = &self.model {
            body.insert("model".into(), json!(model));
        }
        if let Some(level) = &self.options.reasoning_effort {
            body.insert("reasoningLevel".into(), json!(level));
        }
        if let Some(max) = self.options.max_tokens {
            body.insert("max_tokens".into(), json!(max));
        }
        if let Some(t) = self.options.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(format) = self.wire_format {
            body.insert("wireFormat".into(), json!(format));
        }
        Value::Object(body)
    }

    /**
     * \brief 发送一轮用户消息。成功时追加用户消息与助手回复；失败时会话保持不变，不做重试。
     */
    pub async fn send(
        &mut self,
        credentials: &CredentialStore,
        text: &str,
        observer: &mut dyn StreamObserver,
    ) -> Result<Message, RelayError> {
        if text.trim().is_empty() {
            return Err(RelayError::InvalidInput("message is empty".to_string()));
        }
        let api_key = credentials
            .get(self.provider)
            .ok_or(RelayError::MissingCredential)?;
        let user = Message::user(text);
        let body = self.request_body(api_key, &user);
        let url = format!("{}/api/chat", self.relay_url.trim_end_matches('/'));

        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(RelayError::transport)?;

        match consume_response(resp, observer).await {
            ConsumeOutcome::Completed(transcript) => {
                let reply = transcript.into_message();
                self.conversation.push(user);
                self.conversation.push(reply.clone());
                Ok(reply)
            }
            ConsumeOutcome::Failed { error, partial } => {
                telemetry::log_error(
                    "cli.chat",
                    &format!(
                        "provider={} turn failed after {} chars: {}",
                        self.provider,
                        partial.content.len(),
                        error
                    ),
                );
                Err(error)
            }
        }
    }
}
