use std::{collections::BTreeMap, fmt, str::FromStr};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{error::RelayError, wire::WireFormat};

/**
 * \brief 已知的上游 Provider。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Xai,
    Deepseek,
}

impl ProviderId {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Xai => "xai",
            ProviderId::Deepseek => "deepseek",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xai" | "grok" => Ok(ProviderId::Xai),
            "deepseek" => Ok(ProviderId::Deepseek),
            _ => Err(RelayError::UnsupportedProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_size: u32,
    pub supports_reasoning: bool,
}

/**
 * \brief Provider 描述；启动时装载，之后只读。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief API 基地址（含版本前缀，如 `/v1`） */
    pub base_url: String,
    pub default_model: String,
    pub models: Vec<ModelInfo>,
    pub supports_streaming: bool,
    /** \brief 流式下发给客户端时采用的线格式 */
    pub wire_format: WireFormat,
}

/**
 * \brief 模型解析结果：请求的模型不在列表中时回落到默认模型。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedModel<'a> {
    pub id: &'a str,
    pub supports_reasoning: bool,
}

impl ProviderConfig {
    pub fn find_model(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn resolve_model(&self, requested: Option<&str>) -> ResolvedModel<'_> {
        match requested.and_then(|id| self.find_model(id)) {
            Some(model) => ResolvedModel {
                id: &model.id,
                supports_reasoning: model.supports_reasoning,
            },
            None => ResolvedModel {
                id: &self.default_model,
                supports_reasoning: self
                    .find_model(&self.default_model)
                    .map(|m| m.supports_reasoning)
                    .unwrap_or(false),
            },
        }
    }

    pub fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn model(id: &str, name: &str, context_size: u32, supports_reasoning: bool) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        name: name.to_string(),
        context_size,
        supports_reasoning,
    }
}

static BUILTIN: Lazy<ProviderRegistry> = Lazy::new(|| {
    let xai = ProviderConfig {
        id: ProviderId::Xai,
        name: "X.AI (Grok)".to_string(),
        base_url: "https://api.x.ai/v1".to_string(),
        default_model: "grok-3-mini-beta".to_string(),
        models: vec![
            model("grok-3-beta", "Grok 3 Beta", 131_072, true),
            model("grok-3-mini-beta", "Grok 3 Mini Beta", 131_072, true),
            model("grok-3-fast-beta", "Grok 3 Fast Beta", 131_072, false),
            model("grok-3-mini-fast-beta", "Grok 3 Mini Fast Beta", 131_072, true),
            model("grok-2-vision-1212", "Grok 2 Vision 1212", 32_768, false),
            model("grok-2-image-1212", "Grok 2 Image 1212", 131_072, false),
        ],
        supports_streaming: true,
        wire_format: WireFormat::EventStream,
    };
    let deepseek = ProviderConfig {
        id: ProviderId::Deepseek,
        name: "DeepSeek".to_string(),
        base_url: "https://api.deepseek.com/v1".to_string(),
        default_model: "deepseek-chat".to_string(),
        models: vec![
            model("deepseek-chat", "DeepSeek Chat", 65_536, false),
            model("deepseek-reasoner", "DeepSeek Reasoner (R1)", 65_536, true),
        ],
        supports_streaming: false,
        wire_format: WireFormat::EventStream,
    };
    ProviderRegistry::from_configs([xai, deepseek])
});

/**
 * \brief Provider 注册表：id -> 描述。进程启动时构建一次，之后以 `Arc` 共享只读。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderId, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn builtin() -> &'static ProviderRegistry {
        &BUILTIN
    }

    pub fn from_configs(configs: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            providers: configs.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    /** \brief 构建阶段覆盖某个 Provider 的基地址（测试或私有网关）。 */
    pub fn with_base_url(mut self, id: ProviderId, base_url: impl Into<String>) -> Self {
        if let Some(cfg) = self.providers.get_mut(&id) {
            cfg.base_url = base_url.into();
        }
        self
    }

    pub fn with_wire_format(mut self, id: ProviderId, format: WireFormat) -> Self {
        if let Some(cfg) = self.providers.get_mut(&id) {
            cfg.wire_format = format;
        }
        self
    }

    pub fn get(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(&id)
    }

    /**
     * \brief 按请求中的字符串查找 Provider；未知标识返回 `UnsupportedProvider`。
     */
    pub fn lookup(&self, name: &str) -> Result<&ProviderConfig, RelayError> {
        let id: ProviderId = name.parse()?;
        self.get(id)
            .ok_or_else(|| RelayError::UnsupportedProvider(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values()
    }
}
