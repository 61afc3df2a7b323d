use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use domain::{
    ChangeEvent, CommentNode, CommentRecord, DiscussionId, ProjectedComment, SessionPhase,
    SessionSignal, SyncError, DEFAULT_MAX_DEPTH,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{AuthorCache, LikedCache};
use crate::fetcher::Fetcher;
use crate::mutation::{LikeDraft, PostDraft};
use crate::session::{SessionState, Stage};
use crate::subscription::Subscription;
use crate::traits::{CommentBackend, LocalStore};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub discussion_id: DiscussionId,
    pub viewer_id: String,
    pub max_depth: usize,
    pub command_buffer: usize,
    pub signal_buffer: usize,
    pub reconnect_delay: Duration,
}

impl SessionConfig {
    pub fn new(discussion_id: DiscussionId, viewer_id: impl Into<String>) -> Self {
        Self {
            discussion_id,
            viewer_id: viewer_id.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            command_buffer: 64,
            signal_buffer: 64,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Collaborators shared by every session of the process.
#[derive(Clone)]
pub struct Services {
    pub backend: Arc<dyn CommentBackend>,
    pub local: Arc<dyn LocalStore>,
    pub authors: AuthorCache,
    pub liked: LikedCache,
}

impl Services {
    pub fn new(backend: Arc<dyn CommentBackend>, local: Arc<dyn LocalStore>) -> Self {
        Self {
            backend,
            local,
            authors: AuthorCache::default(),
            liked: LikedCache::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;
type PostSettle = oneshot::Sender<Result<CommentRecord, SyncError>>;
type LikeSettle = oneshot::Sender<Result<u32, SyncError>>;

enum Command {
    GetTree(Reply<Vec<CommentNode>>),
    GetProjection {
        max_depth: usize,
        resp: Reply<Vec<ProjectedComment>>,
    },
    GetPhase(Reply<SessionPhase>),
    GetReplyTarget(Reply<Option<String>>),
    PostComment {
        text: String,
        parent_id: Option<String>,
        settle: PostSettle,
        resp: Reply<Result<String, SyncError>>,
    },
    ToggleLike {
        comment_id: String,
        settle: LikeSettle,
        resp: Reply<Result<bool, SyncError>>,
    },
    SetReplyTarget {
        comment_id: Option<String>,
        resp: Reply<Result<(), SyncError>>,
    },
    Retry(Reply<bool>),
}

/// Results of work the driver spawned.
enum Internal {
    Fetched(Result<Vec<CommentRecord>, SyncError>),
    RefetchDue,
    Resubscribed(Subscription),
    AuthorsResolved(usize),
    PostSettled {
        local_id: String,
        result: Result<CommentRecord, SyncError>,
    },
    LikeSettled {
        comment_id: String,
        result: Result<(), SyncError>,
    },
}

enum Step {
    Command(Command),
    Internal(Internal),
    Change(Option<ChangeEvent>),
    Stop,
}

/// Accepted post; `settled` resolves with the stored record.
pub struct PostTicket {
    pub local_id: String,
    settled: oneshot::Receiver<Result<CommentRecord, SyncError>>,
}

impl PostTicket {
    pub async fn settled(self) -> Result<CommentRecord, SyncError> {
        self.settled.await.unwrap_or(Err(SyncError::SessionClosed))
    }
}

/// Accepted like toggle; `settled` resolves with the confirmed like count.
pub struct LikeTicket {
    pub comment_id: String,
    pub liked: bool,
    settled: oneshot::Receiver<Result<u32, SyncError>>,
}

impl LikeTicket {
    pub async fn settled(self) -> Result<u32, SyncError> {
        self.settled.await.unwrap_or(Err(SyncError::SessionClosed))
    }
}

/// Cheap handle to a running session. Every call is answered by the
/// session's driver task, in submission order.
#[derive(Clone)]
pub struct SessionHandle {
    discussion_id: DiscussionId,
    viewer_id: String,
    max_depth: usize,
    tx: mpsc::Sender<Command>,
    signals: broadcast::Sender<SessionSignal>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn discussion_id(&self) -> &DiscussionId {
        &self.discussion_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::SessionClosed);
        }
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn get_tree(&self) -> Result<Vec<CommentNode>, SyncError> {
        self.request(Command::GetTree).await
    }

    pub async fn get_view_projection(&self, max_depth: usize) -> Result<Vec<ProjectedComment>, SyncError> {
        self.request(|resp| Command::GetProjection { max_depth, resp })
            .await
    }

    /// Projection at the session's configured depth.
    pub async fn projection(&self) -> Result<Vec<ProjectedComment>, SyncError> {
        self.get_view_projection(self.max_depth).await
    }

    pub async fn phase(&self) -> Result<SessionPhase, SyncError> {
        self.request(Command::GetPhase).await
    }

    pub async fn reply_target(&self) -> Result<Option<String>, SyncError> {
        self.request(Command::GetReplyTarget).await
    }

    pub async fn set_reply_target(&self, comment_id: Option<String>) -> Result<(), SyncError> {
        self.request(|resp| Command::SetReplyTarget { comment_id, resp })
            .await?
    }

    /// Inserts the comment locally and starts the remote write. Without an
    /// explicit `parent_id` the current reply target is used.
    pub async fn post_comment(
        &self,
        text: impl Into<String>,
        parent_id: Option<String>,
    ) -> Result<PostTicket, SyncError> {
        let text = text.into();
        let (settle, settled) = oneshot::channel();
        let local_id = self
            .request(|resp| Command::PostComment {
                text,
                parent_id,
                settle,
                resp,
            })
            .await??;
        Ok(PostTicket { local_id, settled })
    }

    pub async fn toggle_like(&self, comment_id: &str) -> Result<LikeTicket, SyncError> {
        let (settle, settled) = oneshot::channel();
        let liked = self
            .request(|resp| Command::ToggleLike {
                comment_id: comment_id.to_string(),
                settle,
                resp,
            })
            .await??;
        Ok(LikeTicket {
            comment_id: comment_id.to_string(),
            liked,
            settled,
        })
    }

    /// Reloads a session whose initial fetch failed.
    pub async fn retry(&self) -> Result<bool, SyncError> {
        self.request(Command::Retry).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    /// Live signal receivers, such as open event streams.
    pub fn listener_count(&self) -> usize {
        self.signals.receiver_count()
    }

    /// Stops the driver. Pending tickets resolve to `SessionClosed` and the
    /// results of writes still in flight are dropped.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

pub async fn open_session(config: SessionConfig, services: Services) -> SessionHandle {
    open_session_with_cancel_token(config, services, CancellationToken::new()).await
}

/// Starts a session driver that also stops when `cancel_token` fires.
pub async fn open_session_with_cancel_token(
    config: SessionConfig,
    services: Services,
    cancel_token: CancellationToken,
) -> SessionHandle {
    let persisted = match services.local.load_liked(&config.viewer_id).await {
        Ok(entries) => {
            debug!("Loaded {} liked entries for {}", entries.len(), config.viewer_id);
            services.liked.extend(&config.viewer_id, entries.clone());
            entries
        }
        Err(e) => {
            warn!("Failed to load liked state for {}: {:?}", config.viewer_id, e);
            HashMap::new()
        }
    };

    let (tx, rx_cmd) = mpsc::channel(config.command_buffer.max(1));
    let (signals, _) = broadcast::channel(config.signal_buffer.max(1));
    let (tx_internal, rx_internal) = mpsc::unbounded_channel();

    let handle = SessionHandle {
        discussion_id: config.discussion_id.clone(),
        viewer_id: config.viewer_id.clone(),
        max_depth: config.max_depth,
        tx,
        signals: signals.clone(),
        cancel: cancel_token.clone(),
    };

    let mut state = SessionState::new(
        config.discussion_id.clone(),
        config.viewer_id.clone(),
        services.liked.clone(),
    );
    state.restore_liked(persisted);

    let driver = Driver {
        fetcher: Fetcher::new(
            services.backend.clone(),
            services.local.clone(),
            services.authors.clone(),
        ),
        state,
        config,
        services,
        subscription: None,
        tx_internal,
        signals,
        post_waiters: HashMap::new(),
        like_waiters: HashMap::new(),
        fetching: false,
        refetch_queued: false,
        cancel: cancel_token,
    };
    tokio::spawn(driver.run(rx_cmd, rx_internal));

    handle
}

struct Driver {
    config: SessionConfig,
    services: Services,
    fetcher: Fetcher,
    state: SessionState,
    subscription: Option<Subscription>,
    tx_internal: mpsc::UnboundedSender<Internal>,
    signals: broadcast::Sender<SessionSignal>,
    post_waiters: HashMap<String, PostSettle>,
    like_waiters: HashMap<String, LikeSettle>,
    fetching: bool,
    refetch_queued: bool,
    cancel: CancellationToken,
}

async fn next_change(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut rx_cmd: mpsc::Receiver<Command>,
        mut rx_internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let discussion_id = self.config.discussion_id.clone();
        info!("Opening session on {} for {}", discussion_id, self.config.viewer_id);

        // Subscribe before the first fetch; anything arriving meanwhile is queued.
        match self.services.backend.subscribe(&discussion_id).await {
            Ok(sub) => self.subscription = Some(sub),
            Err(e) => {
                warn!("Subscribe to {} failed: {:?}", discussion_id, e);
                self.spawn_reconnect();
            }
        }
        self.request_fetch();

        let cancel = self.cancel.clone();
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                cmd = rx_cmd.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => Step::Stop,
                },
                Some(msg) = rx_internal.recv() => Step::Internal(msg),
                change = next_change(&mut self.subscription) => Step::Change(change),
            };

            let revision = self.state.revision();
            let phase = self.state.phase();
            match step {
                Step::Command(cmd) => self.handle_command(cmd),
                Step::Internal(msg) => self.handle_internal(msg),
                Step::Change(Some(event)) => self.handle_change(event),
                Step::Change(None) => {
                    warn!("{}: {}, reconnecting", discussion_id, SyncError::StreamDisconnected);
                    self.subscription = None;
                    self.spawn_reconnect();
                }
                Step::Stop => break,
            }
            self.publish_changes(revision, phase);
        }

        if let Some(sub) = self.subscription.take() {
            sub.unsubscribe();
        }
        cancel.cancel();
        info!(
            "Closed session on {} ({} posts, {} likes unsettled)",
            discussion_id,
            self.post_waiters.len(),
            self.like_waiters.len()
        );
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::GetTree(resp) => {
                let _ = resp.send(self.state.snapshot());
            }
            Command::GetProjection { max_depth, resp } => {
                let _ = resp.send(self.state.projection(max_depth, &self.services.authors));
            }
            Command::GetPhase(resp) => {
                let _ = resp.send(self.state.phase());
            }
            Command::GetReplyTarget(resp) => {
                let _ = resp.send(self.state.reply_target().map(str::to_string));
            }
            Command::SetReplyTarget { comment_id, resp } => {
                let _ = resp.send(self.state.set_reply_target(comment_id));
            }
            Command::PostComment {
                text,
                parent_id,
                settle,
                resp,
            } => match self.state.begin_post(text, parent_id, Utc::now()) {
                Ok(draft) => {
                    let _ = resp.send(Ok(draft.local_id.clone()));
                    self.post_waiters.insert(draft.local_id.clone(), settle);
                    self.spawn_post(draft);
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::ToggleLike {
                comment_id,
                settle,
                resp,
            } => match self.state.begin_like(&comment_id) {
                Ok(draft) => {
                    let _ = resp.send(Ok(draft.liked));
                    self.like_waiters.insert(comment_id.clone(), settle);
                    self.spawn_like(comment_id, draft);
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::Retry(resp) => {
                let retried = self.state.retry();
                if retried {
                    info!("Retrying load of {}", self.config.discussion_id);
                    self.request_fetch();
                }
                let _ = resp.send(retried);
            }
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Fetched(result) => {
                self.fetching = false;
                match result {
                    Ok(records) => {
                        let first = !self.state.is_ready();
                        let changed = self.state.load(records);
                        if first {
                            info!(
                                "{} ready with {} comments",
                                self.config.discussion_id,
                                self.state.tree().len()
                            );
                        } else {
                            debug!("Re-fetch of {} changed {} comments", self.config.discussion_id, changed);
                        }
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        self.emit(SessionSignal::FetchFailed {
                            reason: reason.clone(),
                        });
                        if self.state.is_ready() {
                            warn!("Re-fetch of {} failed: {}", self.config.discussion_id, reason);
                            self.spawn_refetch_timer();
                        } else {
                            error!("Initial fetch of {} failed: {}", self.config.discussion_id, reason);
                            self.state.fetch_failed(reason);
                        }
                    }
                }
                if std::mem::take(&mut self.refetch_queued) {
                    self.request_fetch();
                }
            }
            Internal::RefetchDue => self.request_fetch(),
            Internal::Resubscribed(sub) => {
                info!("Resubscribed to {}, re-fetching", sub.discussion_id());
                self.subscription = Some(sub);
                self.request_fetch();
            }
            Internal::AuthorsResolved(added) => {
                if added > 0 {
                    self.state.touch();
                }
            }
            Internal::PostSettled { local_id, result } => {
                let waiter = self.post_waiters.remove(&local_id);
                match &result {
                    Ok(stored) => {
                        if self.state.confirm_post(&local_id, stored.clone()) {
                            info!("Post {} confirmed as {}", local_id, stored.id);
                        }
                    }
                    Err(e) => {
                        if self.state.fail_post(&local_id) {
                            warn!("Post {} rejected: {}", local_id, e);
                            self.emit(SessionSignal::MutationFailed {
                                comment_id: local_id.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                if let Some(waiter) = waiter {
                    let _ = waiter.send(result);
                }
            }
            Internal::LikeSettled { comment_id, result } => {
                let waiter = self.like_waiters.remove(&comment_id);
                let outcome = match result {
                    Ok(()) => self
                        .state
                        .confirm_like(&comment_id)
                        .ok_or_else(|| SyncError::UnknownComment(comment_id.clone())),
                    Err(e) => {
                        if let Some(restored) = self.state.rollback_like(&comment_id) {
                            warn!("Like on {} rolled back to {}: {}", comment_id, restored, e);
                            self.emit(SessionSignal::MutationFailed {
                                comment_id: comment_id.clone(),
                                reason: e.to_string(),
                            });
                        }
                        Err(e)
                    }
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(outcome);
                }
            }
        }
    }

    fn handle_change(&mut self, event: ChangeEvent) {
        let outcome = self.state.apply_change(event);
        debug!("Change on {}: {:?}", self.config.discussion_id, outcome);
        if let Some(author_id) = outcome.author_id() {
            let missing = self.services.authors.missing(&[author_id.to_string()]);
            if !missing.is_empty() {
                self.spawn_author_resolution(missing);
            }
        }
    }

    fn publish_changes(&self, revision: u64, phase: SessionPhase) {
        let current = self.state.phase();
        if current != phase {
            self.emit(SessionSignal::PhaseChanged { phase: current });
        }
        if self.state.revision() != revision {
            self.emit(SessionSignal::TreeChanged {
                revision: self.state.revision(),
            });
        }
    }

    fn emit(&self, signal: SessionSignal) {
        // Nobody listening is fine.
        let _ = self.signals.send(signal);
    }

    fn request_fetch(&mut self) {
        if matches!(self.state.stage, Stage::Failed(_)) {
            return;
        }
        if self.fetching {
            self.refetch_queued = true;
            return;
        }
        self.fetching = true;

        let fetcher = self.fetcher.clone();
        let discussion_id = self.config.discussion_id.clone();
        let tx = self.tx_internal.clone();
        tokio::spawn(async move {
            let result = fetcher.fetch(&discussion_id).await.map(|outcome| outcome.records);
            let _ = tx.send(Internal::Fetched(result));
        });
    }

    fn spawn_refetch_timer(&self) {
        let delay = self.config.reconnect_delay;
        let tx = self.tx_internal.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Internal::RefetchDue);
                }
            }
        });
    }

    fn spawn_reconnect(&self) {
        let backend = self.services.backend.clone();
        let discussion_id = self.config.discussion_id.clone();
        let delay = self.config.reconnect_delay;
        let tx = self.tx_internal.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut attempt = 1u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match backend.subscribe(&discussion_id).await {
                    Ok(sub) => {
                        let _ = tx.send(Internal::Resubscribed(sub));
                        return;
                    }
                    Err(e) => {
                        warn!("Resubscribe attempt {} to {} failed: {:?}", attempt, discussion_id, e);
                        attempt += 1;
                    }
                }
            }
        });
    }

    fn spawn_author_resolution(&self, user_ids: Vec<String>) {
        let fetcher = self.fetcher.clone();
        let tx = self.tx_internal.clone();
        tokio::spawn(async move {
            let added = fetcher.resolve_authors(&user_ids).await;
            let _ = tx.send(Internal::AuthorsResolved(added));
        });
    }

    fn spawn_post(&self, draft: PostDraft) {
        let backend = self.services.backend.clone();
        let discussion_id = self.config.discussion_id.clone();
        let author_id = self.config.viewer_id.clone();
        let tx = self.tx_internal.clone();
        tokio::spawn(async move {
            let result = backend
                .insert_comment(&discussion_id, &author_id, &draft.text, draft.parent_id.as_deref())
                .await
                .map_err(|e| SyncError::WriteFailed(e.to_string()));
            let _ = tx.send(Internal::PostSettled {
                local_id: draft.local_id,
                result,
            });
        });
    }

    /// Persists the new flag, writes the count, and on failure persists the
    /// old flag again before reporting back.
    fn spawn_like(&self, comment_id: String, draft: LikeDraft) {
        let backend = self.services.backend.clone();
        let local = self.services.local.clone();
        let viewer_id = self.config.viewer_id.clone();
        let tx = self.tx_internal.clone();
        tokio::spawn(async move {
            if let Err(e) = local.save_liked(&viewer_id, &comment_id, draft.liked).await {
                warn!("Failed to persist liked state for {}: {:?}", comment_id, e);
            }
            let result = backend
                .update_like_count(&comment_id, draft.new_count)
                .await
                .map_err(|e| SyncError::WriteFailed(e.to_string()));
            if result.is_err() {
                if let Err(e) = local.save_liked(&viewer_id, &comment_id, !draft.liked).await {
                    warn!("Failed to restore liked state for {}: {:?}", comment_id, e);
                }
            }
            let _ = tx.send(Internal::LikeSettled { comment_id, result });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record_by, FakeBackend, MemoryStore};
    use domain::{AuthorProfile, CommentPatch};
    use tokio::time::{sleep, timeout};

    async fn open(backend: &Arc<FakeBackend>, local: &Arc<MemoryStore>) -> SessionHandle {
        let mut config = SessionConfig::new(backend.discussion(), "me");
        config.reconnect_delay = Duration::from_millis(10);
        open_session(config, Services::new(backend.clone(), local.clone())).await
    }

    fn find<'a>(nodes: &'a [CommentNode], id: &str) -> Option<&'a CommentNode> {
        nodes
            .iter()
            .find_map(|n| if n.id() == id { Some(n) } else { find(&n.replies, id) })
    }

    async fn wait_for_phase(handle: &SessionHandle, pred: impl Fn(&SessionPhase) -> bool) -> SessionPhase {
        for _ in 0..200 {
            let phase = handle.phase().await.unwrap();
            if pred(&phase) {
                return phase;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached the expected phase");
    }

    async fn wait_for_tree(handle: &SessionHandle, pred: impl Fn(&[CommentNode]) -> bool) -> Vec<CommentNode> {
        for _ in 0..200 {
            let tree = handle.get_tree().await.unwrap();
            if pred(&tree) {
                return tree;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("tree never reached the expected shape");
    }

    async fn ready(handle: &SessionHandle) {
        wait_for_phase(handle, SessionPhase::is_ready).await;
    }

    async fn next_signal(
        rx: &mut broadcast::Receiver<SessionSignal>,
        pred: impl Fn(&SessionSignal) -> bool,
    ) -> SessionSignal {
        timeout(Duration::from_secs(1), async {
            loop {
                let signal = rx.recv().await.unwrap();
                if pred(&signal) {
                    return signal;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_post_is_visible_before_store_confirms() {
        let backend = FakeBackend::new();
        backend.seed(vec![record_by("a", None, "bob")]);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;

        backend.hold_writes();
        let ticket = handle.post_comment("hello", Some("a".to_string())).await.unwrap();
        let tree = handle.get_tree().await.unwrap();
        assert_eq!(find(&tree, "a").unwrap().replies[0].id(), ticket.local_id);
        assert_eq!(
            handle.phase().await.unwrap(),
            SessionPhase::Ready { pending_mutations: 1 }
        );

        backend.release_writes();
        let local_id = ticket.local_id.clone();
        let stored = ticket.settled().await.unwrap();
        assert!(stored.id.starts_with("srv-"));

        // Give the stream time to deliver the echo.
        sleep(Duration::from_millis(30)).await;
        let tree = handle.get_tree().await.unwrap();
        let a = find(&tree, "a").unwrap();
        assert_eq!(a.replies.len(), 1);
        assert_eq!(a.replies[0].id(), stored.id);
        assert!(find(&tree, &local_id).is_none());
        assert_eq!(
            handle.phase().await.unwrap(),
            SessionPhase::Ready { pending_mutations: 0 }
        );
    }

    #[tokio::test]
    async fn test_failed_like_is_rolled_back() {
        let backend = FakeBackend::new();
        let mut a = record_by("a", None, "bob");
        a.like_count = 2;
        backend.seed(vec![a]);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;
        let mut signals = handle.subscribe();

        backend.hold_writes();
        let ticket = handle.toggle_like("a").await.unwrap();
        assert!(ticket.liked);
        let view = handle.projection().await.unwrap();
        assert_eq!((view[0].like_count, view[0].liked), (3, true));

        backend.set_fail_writes(true);
        backend.release_writes();
        assert!(matches!(ticket.settled().await, Err(SyncError::WriteFailed(_))));

        let view = handle.projection().await.unwrap();
        assert_eq!((view[0].like_count, view[0].liked), (2, false));
        assert_eq!(local.liked_value("me", "a"), Some(false));
        let signal = next_signal(&mut signals, |s| matches!(s, SessionSignal::MutationFailed { .. })).await;
        assert_eq!(
            signal,
            SessionSignal::MutationFailed {
                comment_id: "a".to_string(),
                reason: SyncError::WriteFailed("write rejected by fake backend".to_string()).to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_confirmed_like_is_written_and_persisted() {
        let backend = FakeBackend::new();
        let mut a = record_by("a", None, "bob");
        a.like_count = 2;
        backend.seed(vec![a]);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;

        let ticket = handle.toggle_like("a").await.unwrap();
        assert_eq!(ticket.settled().await, Ok(3));
        assert_eq!(backend.like_writes(), vec![("a".to_string(), 3)]);
        assert_eq!(local.liked_value("me", "a"), Some(true));

        let view = handle.projection().await.unwrap();
        assert_eq!((view[0].like_count, view[0].liked), (3, true));
    }

    #[tokio::test]
    async fn test_liked_state_survives_a_new_session() {
        let backend = FakeBackend::new();
        backend.seed(vec![record_by("a", None, "bob")]);
        let local = Arc::new(MemoryStore::default());
        local.save_liked("me", "a", true).await.unwrap();

        let handle = open(&backend, &local).await;
        ready(&handle).await;
        assert!(handle.projection().await.unwrap()[0].liked);
    }

    #[tokio::test]
    async fn test_persisted_likes_survive_cache_eviction() {
        let backend = FakeBackend::new();
        let mut a = record_by("a", None, "bob");
        a.like_count = 1;
        let mut b = record_by("b", None, "bob");
        b.like_count = 1;
        backend.seed(vec![b, a]);
        let local = Arc::new(MemoryStore::default());
        local.save_liked("me", "a", true).await.unwrap();
        local.save_liked("me", "b", true).await.unwrap();

        let mut services = Services::new(backend.clone(), local.clone());
        services.liked = LikedCache::new(1);
        let handle = open_session(SessionConfig::new(backend.discussion(), "me"), services).await;
        ready(&handle).await;

        let view = handle.projection().await.unwrap();
        assert_eq!(view.len(), 2);
        assert!(view.iter().all(|c| c.liked));

        let ticket = handle.toggle_like("a").await.unwrap();
        assert!(!ticket.liked);
        assert_eq!(ticket.settled().await, Ok(0));
        assert_eq!(backend.like_writes(), vec![("a".to_string(), 0)]);
        assert_eq!(local.liked_value("me", "a"), Some(false));

        let view = handle.projection().await.unwrap();
        let b = view.iter().find(|c| c.id == "b").unwrap();
        assert!(b.liked);
    }

    #[tokio::test]
    async fn test_child_before_parent_is_nested_once_parent_arrives() {
        let backend = FakeBackend::new();
        backend.seed(vec![record_by("a", None, "bob")]);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;

        backend.push_remote(ChangeEvent::Inserted(record_by("r2", Some("r1"), "ann")));
        sleep(Duration::from_millis(20)).await;
        assert!(find(&handle.get_tree().await.unwrap(), "r2").is_none());

        backend.push_remote(ChangeEvent::Inserted(record_by("r1", Some("a"), "bob")));
        let tree = wait_for_tree(&handle, |t| find(t, "r2").is_some()).await;
        assert_eq!(find(&tree, "r1").unwrap().replies[0].id(), "r2");
    }

    #[tokio::test]
    async fn test_update_before_insert_is_applied_on_arrival() {
        let backend = FakeBackend::new();
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;

        backend.push_remote(ChangeEvent::Updated(CommentPatch::like_count("ghost", 5)));
        backend.push_remote(ChangeEvent::Inserted(record_by("ghost", None, "bob")));
        let tree = wait_for_tree(&handle, |t| find(t, "ghost").is_some()).await;
        assert_eq!(find(&tree, "ghost").unwrap().record.like_count, 5);
    }

    #[tokio::test]
    async fn test_stream_drop_triggers_refetch() {
        let backend = FakeBackend::new();
        backend.seed(vec![record_by("a", None, "bob")]);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;
        assert_eq!(backend.fetch_count(), 1);

        // Stored while nobody could hear about it.
        backend.seed(vec![record_by("missed", Some("a"), "ann")]);
        backend.drop_streams();

        let tree = wait_for_tree(&handle, |t| find(t, "missed").is_some()).await;
        assert_eq!(find(&tree, "a").unwrap().replies.len(), 1);
        assert!(backend.fetch_count() >= 2);
        assert!(backend.subscribe_count() >= 2);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_tree_and_retries() {
        let backend = FakeBackend::new();
        backend.seed(vec![record_by("a", None, "bob")]);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;
        let mut signals = handle.subscribe();

        backend.set_fail_fetch(true);
        backend.seed(vec![record_by("missed", Some("a"), "ann")]);
        backend.drop_streams();

        next_signal(&mut signals, |s| matches!(s, SessionSignal::FetchFailed { .. })).await;
        let tree = handle.get_tree().await.unwrap();
        assert_eq!(tree.len(), 1);
        assert!(find(&tree, "missed").is_none());
        assert!(handle.phase().await.unwrap().is_ready());

        let failed_fetches = backend.fetch_count();
        backend.set_fail_fetch(false);
        let tree = wait_for_tree(&handle, |t| find(t, "missed").is_some()).await;
        assert_eq!(find(&tree, "a").unwrap().replies.len(), 1);
        assert!(backend.fetch_count() > failed_fetches);
    }

    #[tokio::test]
    async fn test_resubscribe_is_retried_until_it_succeeds() {
        let backend = FakeBackend::new();
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;

        backend.set_fail_subscribe(true);
        backend.drop_streams();
        sleep(Duration::from_millis(50)).await;
        assert!(backend.subscribe_count() >= 3);

        backend.set_fail_subscribe(false);
        let before = backend.fetch_count();
        for _ in 0..200 {
            if backend.fetch_count() > before {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(backend.fetch_count() > before);

        backend.push_remote(ChangeEvent::Inserted(record_by("live", None, "bob")));
        wait_for_tree(&handle, |t| find(t, "live").is_some()).await;
    }

    #[tokio::test]
    async fn test_initial_fetch_failure_and_retry() {
        let backend = FakeBackend::new();
        backend.seed(vec![record_by("a", None, "bob")]);
        backend.set_fail_fetch(true);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;

        let phase = wait_for_phase(&handle, |p| matches!(p, SessionPhase::Error { .. })).await;
        assert!(matches!(phase, SessionPhase::Error { .. }));
        assert!(matches!(
            handle.post_comment("early", None).await,
            Err(SyncError::NotReady)
        ));

        backend.set_fail_fetch(false);
        assert!(handle.retry().await.unwrap());
        ready(&handle).await;
        assert_eq!(handle.get_tree().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_to_flattened_comment_keeps_real_parent() {
        let backend = FakeBackend::new();
        backend.seed(vec![
            record_by("n4", Some("n3"), "bob"),
            record_by("n3", Some("n2"), "bob"),
            record_by("n2", Some("n1"), "bob"),
            record_by("n1", Some("n0"), "bob"),
            record_by("n0", None, "bob"),
        ]);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;

        let view = handle.projection().await.unwrap();
        let n4 = view[0].find("n4").unwrap();
        assert!(n4.flattened);
        assert_eq!(n4.anchor_id.as_deref(), Some("n2"));

        let ticket = handle
            .post_comment("deep reply", Some(n4.reply_target().to_string()))
            .await
            .unwrap();
        let stored = ticket.settled().await.unwrap();
        assert_eq!(stored.parent_id.as_deref(), Some("n4"));

        let tree = handle.get_tree().await.unwrap();
        assert_eq!(find(&tree, "n4").unwrap().replies[0].id(), stored.id);
    }

    #[tokio::test]
    async fn test_new_authors_are_resolved_eagerly() {
        let backend = FakeBackend::new();
        backend.add_author(AuthorProfile {
            user_id: "cid".to_string(),
            display_name: "Cid".to_string(),
            avatar_url: None,
        });
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;
        let mut signals = handle.subscribe();

        backend.push_remote(ChangeEvent::Inserted(record_by("c1", None, "cid")));
        next_signal(&mut signals, |s| matches!(s, SessionSignal::TreeChanged { .. })).await;

        for _ in 0..200 {
            let view = handle.projection().await.unwrap();
            if let Some(author) = view.iter().find_map(|c| c.author.clone()) {
                assert_eq!(author.display_name, "Cid");
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("author never resolved");
    }

    #[tokio::test]
    async fn test_close_settles_pending_tickets() {
        let backend = FakeBackend::new();
        backend.seed(vec![record_by("a", None, "bob")]);
        let local = Arc::new(MemoryStore::default());
        let handle = open(&backend, &local).await;
        ready(&handle).await;

        backend.hold_writes();
        let ticket = handle.post_comment("never mind", None).await.unwrap();
        handle.close();

        assert_eq!(ticket.settled().await, Err(SyncError::SessionClosed));
        assert!(handle.is_closed());
        assert_eq!(handle.get_tree().await, Err(SyncError::SessionClosed));
        backend.release_writes();
    }
}
