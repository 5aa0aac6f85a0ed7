use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Credentials that authorize the hub login and scope file downloads.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSession {
    pub channel: String,
    pub token: String,
}

impl ChannelSession {
    pub fn new(channel: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            token: token.into(),
        }
    }
}

// Keep the token out of logs.
impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("channel", &self.channel)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Last-value holder for the current session. Consumers that need a session
/// wait until one is known; nothing is processed unauthenticated.
#[derive(Clone)]
pub struct SessionProvider {
    tx: Arc<watch::Sender<Option<ChannelSession>>>,
}

impl SessionProvider {
    pub fn new(initial: Option<ChannelSession>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Publishes a session. Returns false when it equals the current one.
    pub fn set(&self, session: ChannelSession) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&session) {
                return false;
            }
            tracing::info!(channel = %session.channel, "channel session updated");
            *current = Some(session);
            true
        })
    }

    pub fn current(&self) -> Option<ChannelSession> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> ChannelSession {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(session) = rx.borrow_and_update().clone() {
                return session;
            }
            // The sender lives in `self`, so this only errors if it was dropped mid-wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ChannelSession>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn debug_output_redacts_token() {
        let s = ChannelSession::new("chan", "secret-token");
        let dbg = format!("{s:?}");
        assert!(dbg.contains("chan"));
        assert!(!dbg.contains("secret-token"));
    }

    #[test]
    fn set_reports_only_real_changes() {
        let provider = SessionProvider::new(None);
        assert!(provider.set(ChannelSession::new("a", "t")));
        assert!(!provider.set(ChannelSession::new("a", "t")));
        assert!(provider.set(ChannelSession::new("a", "t2")));
        assert_eq!(provider.current().unwrap().token, "t2");
    }

    #[tokio::test]
    async fn wait_resolves_once_a_session_is_published() {
        let provider = SessionProvider::new(None);
        let waiter = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        provider.set(ChannelSession::new("late", "tok"));
        let session = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.channel, "late");
    }
}
