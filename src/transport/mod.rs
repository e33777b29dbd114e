//! Messaging transport capability.
//!
//! The relay never talks to WhatsApp itself. It drives an opaque client that
//! can `initialize`, `destroy`, report its state and send/list messages, and
//! that reports lifecycle changes as [`TransportEvent`]s on a channel handed
//! to it at creation time. Events arrive in emission order; the lifecycle
//! manager consumes them from a single task.

pub mod sidecar;

#[cfg(test)]
pub(crate) mod fake;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use sidecar::SidecarFactory;

/// Lifecycle notifications emitted by a transport instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A fresh authentication challenge (QR payload) to show the operator.
    Challenge(String),
    Authenticated,
    Ready,
    Disconnected(String),
    AuthFailure(String),
    LoadingScreen { percent: u8, message: String },
    StateChanged(String),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Identity of the linked account, available once ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub pushname: Option<String>,
    pub wid: Option<String>,
    pub platform: Option<String>,
}

/// One chat as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub participants: Option<usize>,
}

/// Everything a transport needs at creation time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    /// Credential store (local auth) directory.
    pub data_path: PathBuf,
    /// Local web-version cache directory.
    pub cache_path: PathBuf,
    pub headless: bool,
    #[serde(rename = "protocolTimeoutMs", serialize_with = "serialize_millis")]
    pub protocol_timeout: Duration,
    pub browser_args: Vec<String>,
    pub takeover_on_conflict: bool,
    pub takeover_timeout_ms: u64,
    pub restart_on_auth_fail: bool,
    pub qr_max_retries: u32,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// A live client instance. At most one exists per process.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the remote handshake. May take tens of seconds; events are
    /// emitted while it runs.
    async fn initialize(&self) -> Result<()>;

    /// Release every resource held by the instance. Best effort.
    async fn destroy(&self) -> Result<()>;

    /// Connection state as reported by the remote side, if known.
    async fn get_state(&self) -> Result<Option<String>>;

    async fn send_message(&self, to: &str, body: &str) -> Result<()>;

    async fn get_chats(&self) -> Result<Vec<Chat>>;

    async fn info(&self) -> Result<Option<ClientInfo>>;
}

/// Creates transport instances bound to an event channel.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn create(
        &self,
        options: &TransportOptions,
        events: TransportEventSender,
    ) -> Result<Arc<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_serialize_with_camel_case_and_millis() {
        let options = TransportOptions {
            data_path: PathBuf::from("/var/data/wwebjs"),
            cache_path: PathBuf::from("/var/data/wwebjs-cache"),
            headless: true,
            protocol_timeout: Duration::from_secs(180),
            browser_args: vec!["--no-sandbox".into()],
            takeover_on_conflict: true,
            takeover_timeout_ms: 0,
            restart_on_auth_fail: true,
            qr_max_retries: 8,
        };

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["dataPath"], "/var/data/wwebjs");
        assert_eq!(json["protocolTimeoutMs"], 180_000);
        assert_eq!(json["takeoverOnConflict"], true);
        assert_eq!(json["qrMaxRetries"], 8);
    }

    #[test]
    fn chat_deserializes_with_missing_optionals() {
        let chat: Chat = serde_json::from_str(r#"{"id":"123@g.us","isGroup":true}"#).unwrap();
        assert!(chat.is_group);
        assert!(chat.name.is_none());
        assert!(chat.participants.is_none());
    }
}
