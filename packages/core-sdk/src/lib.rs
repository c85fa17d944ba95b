pub mod config;
pub mod consumer;
pub mod error;
pub mod images;
pub mod llm;
pub mod models;
pub mod providers;
pub mod quota;
pub mod relay;
pub mod request;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod wire;

#[cfg(test)]
mod testing;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::consumer::{ConsumeOutcome, StreamObserver};
    pub use crate::error::RelayError;
    pub use crate::models::{Conversation, Message, Role};
    pub use crate::providers::{ProviderId, ProviderRegistry};
    pub use crate::session::{ChatSession, CredentialStore};
    pub use crate::wire::WireFormat;
    pub use crate::{images, quota, server, telemetry};
}
