//! Session-scoped progress fan-out for test runs.

use scrivener_protocol::{PayloadError, ProgressEvent, SessionId};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::collaborators::ProgressNotifier;

const CHANNEL_CAPACITY: usize = 256;

/// In-process hub: one broadcast channel, filtered per session on receipt.
#[derive(Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<ProgressEvent>,
}

impl NotificationHub {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to one session. Missing or malformed session ids are refused.
    pub fn subscribe(&self, session_id: &str) -> Result<SessionSubscription, PayloadError> {
        let session = SessionId::parse(session_id)?;
        Ok(SessionSubscription {
            session,
            receiver: self.sender.subscribe(),
        })
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressNotifier for NotificationHub {
    fn notify(&self, event: ProgressEvent) {
        // No subscribers is normal: nobody is watching this test run.
        if self.sender.send(event).is_err() {
            trace!("Progress event dropped: no subscribers");
        }
    }
}

pub struct SessionSubscription {
    session: SessionId,
    receiver: broadcast::Receiver<ProgressEvent>,
}

impl SessionSubscription {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Next event for this session, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.session_id() == self.session => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session_id = %self.session, skipped, "Subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrivener_protocol::TokenUsage;

    #[test]
    fn test_subscribe_refuses_bad_session() {
        let hub = NotificationHub::new();
        assert!(matches!(
            hub.subscribe(""),
            Err(PayloadError::InvalidSessionId(_))
        ));
        assert!(hub.subscribe("session-42").is_err());
    }

    #[tokio::test]
    async fn test_events_are_scoped_to_session() {
        let hub = NotificationHub::new();
        let mine = SessionId::new();
        let other = SessionId::new();
        let mut sub = hub.subscribe(&mine.to_string()).unwrap();

        hub.notify(ProgressEvent::RunError {
            session_id: other,
            message: "not for you".to_string(),
        });
        hub.notify(ProgressEvent::RunComplete {
            session_id: mine,
            completed: 1,
            failed: 0,
            token_usage: TokenUsage::default(),
        });

        let event = sub.recv().await.unwrap();
        assert_eq!(event.session_id(), mine);
        assert!(matches!(event, ProgressEvent::RunComplete { completed: 1, .. }));
    }
}
