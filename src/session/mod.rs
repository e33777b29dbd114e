//! The single logical session slot.
//!
//! [`SessionHandle`] owns the live transport instance (if any) and the flags
//! derived from its events. It lives inside the lifecycle manager's state
//! lock for the whole process and is cleared and re-populated across
//! restarts, never replaced.
//!
//! Invariant: `ready` implies `authenticated`.

use crate::transport::{Chat, Transport};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A ready-gated call was attempted before the session finished loading.
    #[error("session is not ready")]
    NotReady,
    #[error("transport call failed: {0:#}")]
    Transport(#[from] anyhow::Error),
}

/// Read-only view of the session flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub authenticated: bool,
    pub ready: bool,
    pub pending_challenge: Option<String>,
    pub has_client: bool,
}

/// A group chat as exposed by `/groups`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: String,
    pub name: Option<String>,
    pub participants_count: Option<usize>,
}

impl GroupSummary {
    /// Keep only group chats from a chat listing.
    pub fn from_chats(chats: Vec<Chat>) -> Vec<Self> {
        chats
            .into_iter()
            .filter(|chat| chat.is_group)
            .map(|chat| Self {
                id: chat.id,
                name: chat.name,
                participants_count: chat.participants,
            })
            .collect()
    }
}

#[derive(Default)]
pub struct SessionHandle {
    client: Option<Arc<dyn Transport>>,
    authenticated: bool,
    ready: bool,
    pending_challenge: Option<String>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a freshly created transport instance.
    ///
    /// Returns the previous instance if one was still installed; the caller
    /// is responsible for destroying it.
    pub fn install(&mut self, client: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        self.authenticated = false;
        self.ready = false;
        self.client.replace(client)
    }

    /// A new challenge replaces any previous one and resets authentication.
    pub fn record_challenge(&mut self, payload: String) {
        self.pending_challenge = Some(payload);
        self.authenticated = false;
        self.ready = false;
    }

    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
        self.pending_challenge = None;
    }

    /// Ready implies authenticated, so this sets both.
    pub fn mark_ready(&mut self) {
        self.authenticated = true;
        self.pending_challenge = None;
        self.ready = true;
    }

    /// A clone of the installed client, for teardown.
    pub fn client(&self) -> Option<Arc<dyn Transport>> {
        self.client.clone()
    }

    /// Drop the client and reset every flag. The pending challenge is kept:
    /// it stays visible on `/qr` until a new one arrives.
    pub fn clear(&mut self) -> Option<Arc<dyn Transport>> {
        self.authenticated = false;
        self.ready = false;
        self.client.take()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn pending_challenge(&self) -> Option<&str> {
        self.pending_challenge.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            authenticated: self.authenticated,
            ready: self.ready,
            pending_challenge: self.pending_challenge.clone(),
            has_client: self.client.is_some(),
        }
    }

    /// The client, but only while the session is ready.
    pub fn ready_client(&self) -> Result<Arc<dyn Transport>, SessionError> {
        match (&self.client, self.ready) {
            (Some(client), true) => Ok(Arc::clone(client)),
            _ => Err(SessionError::NotReady),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("has_client", &self.client.is_some())
            .field("authenticated", &self.authenticated)
            .field("ready", &self.ready)
            .field("pending_challenge", &self.pending_challenge.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeControl;
    use crate::transport::{TransportFactory, TransportOptions};
    use std::path::PathBuf;
    use std::time::Duration;

    async fn fake_client(control: &FakeControl) -> Arc<dyn Transport> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let options = TransportOptions {
            data_path: PathBuf::from("data"),
            cache_path: PathBuf::from("cache"),
            headless: true,
            protocol_timeout: Duration::from_secs(1),
            browser_args: vec![],
            takeover_on_conflict: true,
            takeover_timeout_ms: 0,
            restart_on_auth_fail: true,
            qr_max_retries: 8,
        };
        control.factory().create(&options, tx).await.unwrap()
    }

    #[tokio::test]
    async fn ready_client_requires_ready_flag() {
        let control = FakeControl::default();
        let mut handle = SessionHandle::new();
        assert!(matches!(handle.ready_client(), Err(SessionError::NotReady)));

        handle.install(fake_client(&control).await);
        assert!(matches!(handle.ready_client(), Err(SessionError::NotReady)));

        handle.mark_authenticated();
        assert!(matches!(handle.ready_client(), Err(SessionError::NotReady)));

        handle.mark_ready();
        assert!(handle.ready_client().is_ok());
    }

    #[test]
    fn authenticated_clears_pending_challenge() {
        let mut handle = SessionHandle::new();
        handle.record_challenge("2@first".into());
        handle.record_challenge("2@second".into());
        assert_eq!(handle.pending_challenge(), Some("2@second"));

        handle.mark_authenticated();
        assert!(handle.pending_challenge().is_none());
        assert!(handle.is_authenticated());
        assert!(!handle.is_ready());
    }

    #[test]
    fn challenge_after_ready_resets_flags() {
        let mut handle = SessionHandle::new();
        handle.mark_ready();
        handle.record_challenge("2@again".into());
        assert!(!handle.is_ready());
        assert!(!handle.is_authenticated());
    }

    #[test]
    fn ready_implies_authenticated() {
        let mut handle = SessionHandle::new();
        handle.mark_ready();
        let status = handle.status();
        assert!(status.ready && status.authenticated);
    }

    #[tokio::test]
    async fn clear_drops_client_and_flags() {
        let control = FakeControl::default();
        let mut handle = SessionHandle::new();
        handle.install(fake_client(&control).await);
        handle.mark_ready();

        assert!(handle.clear().is_some());
        let status = handle.status();
        assert!(!status.has_client && !status.ready && !status.authenticated);
        assert!(handle.clear().is_none());
    }

    #[test]
    fn group_summary_keeps_only_groups() {
        let chats = vec![
            Chat {
                id: "1@c.us".into(),
                name: Some("Alice".into()),
                is_group: false,
                participants: None,
            },
            Chat {
                id: "2@g.us".into(),
                name: Some("Family".into()),
                is_group: true,
                participants: Some(4),
            },
        ];

        let groups = GroupSummary::from_chats(chats);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "2@g.us");
        assert_eq!(groups[0].participants_count, Some(4));
    }
}
