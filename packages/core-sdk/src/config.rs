use std::{collections::BTreeMap, path::PathBuf};

use crate::providers::{ProviderId, ProviderRegistry};

pub const DEFAULT_ADDR: &str = "127.0.0.1:5173";

/**
 * \brief 服务端配置，来自 `CHATRELAY_*` 环境变量，命令行参数可再覆盖。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /** \brief 监听地址 */
    pub addr: String,
    /** \brief 前端静态目录 */
    pub ui_dir: PathBuf,
    /** \brief `ui_dir` 不存在时的后备目录 */
    pub ui_fallback: PathBuf,
    pub telemetry: bool,
    pub log_dir: PathBuf,
    /** \brief Provider 基地址覆盖，构建注册表时生效 */
    pub base_urls: BTreeMap<ProviderId, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            ui_dir: PathBuf::from("web/dist"),
            ui_fallback: PathBuf::from("web"),
            telemetry: false,
            log_dir: PathBuf::from("logs"),
            base_urls: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 以任意键值来源构造配置（便于测试）。
     */
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(addr) = lookup("CHATRELAY_ADDR").filter(|v| !v.trim().is_empty()) {
            cfg.addr = addr;
        }
        if let Some(dir) = lookup("CHATRELAY_UI_DIR") {
            cfg.ui_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CHATRELAY_UI_FALLBACK") {
            cfg.ui_fallback = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("CHATRELAY_TELEMETRY") {
            cfg.telemetry = parse_flag(&flag);
        }
        if let Some(dir) = lookup("CHATRELAY_LOG_DIR") {
            cfg.log_dir = PathBuf::from(dir);
        }
        for (id, key) in [
            (ProviderId::Xai, "CHATRELAY_XAI_BASE_URL"),
            (ProviderId::Deepseek, "CHATRELAY_DEEPSEEK_BASE_URL"),
        ] {
            if let Some(url) = lookup(key).filter(|v| !v.trim().is_empty()) {
                cfg.base_urls.insert(id, url);
            }
        }
        cfg
    }

    /**
     * \brief 构建只读的 Provider 注册表（内置表 + 基地址覆盖）。
     */
    pub fn registry(&self) -> ProviderRegistry {
        self.base_urls
            .iter()
            .fold(ProviderRegistry::builtin().clone(), |reg, (id, url)| {
                reg.with_base_url(*id, url.clone())
            })
    }

    /** \brief 实际使用的静态目录。 */
    pub fn static_root(&self) -> PathBuf {
        if self.ui_dir.exists() {
            self.ui_dir.clone()
        } else {
            self.ui_fallback.clone()
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
