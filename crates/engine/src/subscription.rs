use std::sync::{Arc, Mutex};

use domain::{ChangeEvent, DiscussionId};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Live change stream of one discussion.
///
/// `recv` yields `None` once the stream is gone, whether the remote side
/// dropped it or `unsubscribe` was called. Dropping the value unsubscribes.
pub struct Subscription {
    discussion_id: DiscussionId,
    events: mpsc::Receiver<ChangeEvent>,
    token: CancellationToken,
}

impl Subscription {
    pub fn new(
        discussion_id: DiscussionId,
        events: mpsc::Receiver<ChangeEvent>,
        token: CancellationToken,
    ) -> Self {
        Self {
            discussion_id,
            events,
            token,
        }
    }

    pub fn discussion_id(&self) -> &DiscussionId {
        &self.discussion_id
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(self) {
        debug!("Unsubscribing from {}", self.discussion_id);
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// In-process fan-out of change events, scoped per discussion on subscribe.
///
/// A subscriber that falls behind the broadcast buffer loses its stream
/// instead of silently skipping events, so the session re-fetches.
#[derive(Clone)]
pub struct ChangeHub {
    tx: broadcast::Sender<(DiscussionId, ChangeEvent)>,
    root: Arc<Mutex<CancellationToken>>,
    buffer: usize,
}

impl ChangeHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            root: Arc::new(Mutex::new(CancellationToken::new())),
            buffer: capacity.max(1),
        }
    }

    pub fn publish(&self, discussion_id: &DiscussionId, event: ChangeEvent) {
        // No receivers is fine: nobody is watching this discussion.
        let _ = self.tx.send((discussion_id.clone(), event));
    }

    pub fn subscribe(&self, discussion_id: &DiscussionId) -> Subscription {
        let mut rx = self.tx.subscribe();
        let (tx_events, events) = mpsc::channel(self.buffer);
        let token = self
            .root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token();
        let forward_token = token.clone();
        let scope = discussion_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok((id, event)) if id == scope => {
                            if tx_events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Change feed for {} lagged by {} events, dropping stream", scope, missed);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Subscription::new(discussion_id.clone(), events, token)
    }

    /// Drops every live subscription. New subscriptions are unaffected.
    pub fn disconnect_all(&self) {
        let mut root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        root.cancel();
        *root = CancellationToken::new();
    }
}
