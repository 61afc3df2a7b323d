use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use domain::DiscussionId;
use engine::{open_session_with_cancel_token, AuthorCache, Services, SessionHandle};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionSettings;

type SessionKey = (String, DiscussionId);

struct Entry {
    handle: SessionHandle,
    last_used: Instant,
}

/// Open sessions, one per viewer and discussion, created on first use.
///
/// Closed sessions are dropped and idle ones closed whenever a session is
/// opened and on every sweep. The map never holds more than `max_open`.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionKey, Entry>>>,
    services: Services,
    settings: SessionSettings,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(services: Services, settings: SessionSettings, shutdown: CancellationToken) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            services,
            settings,
            shutdown,
        }
    }

    pub async fn get_or_open(&self, viewer_id: &str, discussion_id: &DiscussionId) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        let key = (viewer_id.to_string(), discussion_id.clone());
        if let Some(entry) = sessions.get_mut(&key) {
            if !entry.handle.is_closed() {
                entry.last_used = Instant::now();
                return entry.handle.clone();
            }
        }

        // Room for the new one.
        let keep = self.settings.max_open.max(1) - 1;
        evict(&mut sessions, self.settings.idle_timeout(), keep);

        let config = self.settings.session_config(discussion_id.clone(), viewer_id);
        let handle =
            open_session_with_cancel_token(config, self.services.clone(), self.shutdown.child_token()).await;
        info!("Session opened: viewer={} discussion={} (total {})", viewer_id, discussion_id, sessions.len() + 1);
        sessions.insert(
            key,
            Entry {
                handle: handle.clone(),
                last_used: Instant::now(),
            },
        );
        handle
    }

    /// Closes and forgets the session. False if there was none.
    pub async fn close(&self, viewer_id: &str, discussion_id: &DiscussionId) -> bool {
        let key = (viewer_id.to_string(), discussion_id.clone());
        match self.sessions.lock().await.remove(&key) {
            Some(entry) => {
                entry.handle.close();
                info!("Session closed: viewer={} discussion={}", viewer_id, discussion_id);
                true
            }
            None => false,
        }
    }

    /// Drops closed sessions and closes idle ones. Returns how many went away.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        evict(&mut sessions, self.settings.idle_timeout(), self.settings.max_open.max(1))
    }

    /// Sweeps on a fixed interval until shutdown.
    pub fn spawn_sweeper(&self) {
        let registry = self.clone();
        let every = self.settings.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.sweep().await;
                        if removed > 0 {
                            debug!("Swept {} sessions", removed);
                        }
                    }
                }
            }
        });
    }

    /// Profile cache shared by all sessions.
    pub fn authors(&self) -> &AuthorCache {
        &self.services.authors
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Sessions with a live event stream never count as idle. Past `keep`, the
/// least recently used are closed regardless.
fn evict(sessions: &mut HashMap<SessionKey, Entry>, idle_timeout: Duration, keep: usize) -> usize {
    let before = sessions.len();
    sessions.retain(|(viewer_id, discussion_id), entry| {
        if entry.handle.is_closed() {
            return false;
        }
        if entry.last_used.elapsed() >= idle_timeout && entry.handle.listener_count() == 0 {
            info!("Session idle: viewer={} discussion={}", viewer_id, discussion_id);
            entry.handle.close();
            return false;
        }
        true
    });

    while sessions.len() > keep {
        let oldest = sessions
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        let Some(key) = oldest else { break };
        if let Some(entry) = sessions.remove(&key) {
            warn!("Session limit reached, closing: viewer={} discussion={}", key.0, key.1);
            entry.handle.close();
        }
    }
    before - sessions.len()
}
