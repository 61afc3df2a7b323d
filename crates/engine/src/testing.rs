//! Fakes shared by the engine's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use domain::{AuthorProfile, ChangeEvent, CommentPatch, CommentRecord, DiscussionId};
use tokio::sync::watch;

use crate::cache::LikedCache;
use crate::session::SessionState;
use crate::subscription::{ChangeHub, Subscription};
use crate::traits::{CommentBackend, LocalStore};

pub const DISCUSSION: &str = "post-1";

pub fn record_by(id: &str, parent: Option<&str>, author: &str) -> CommentRecord {
    CommentRecord {
        id: id.to_string(),
        text: format!("comment {}", id),
        author_id: author.to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + Duration::seconds(id.len() as i64),
        parent_id: parent.map(str::to_string),
        like_count: 0,
        discussion_id: DiscussionId::new_unchecked(DISCUSSION.to_string()),
    }
}

pub fn session(viewer: &str) -> SessionState {
    SessionState::new(
        DiscussionId::new_unchecked(DISCUSSION.to_string()),
        viewer,
        LikedCache::new(64),
    )
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

pub struct FakeBackend {
    discussion: DiscussionId,
    comments: Mutex<Vec<CommentRecord>>,
    authors: Mutex<HashMap<String, AuthorProfile>>,
    profile_requests: Mutex<Vec<Vec<String>>>,
    like_writes: Mutex<Vec<(String, u32)>>,
    hub: ChangeHub,
    fail_fetch: AtomicBool,
    fail_writes: AtomicBool,
    fail_subscribe: AtomicBool,
    fetches: AtomicUsize,
    subscribes: AtomicUsize,
    next_id: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            discussion: DiscussionId::new_unchecked(DISCUSSION.to_string()),
            comments: Mutex::new(Vec::new()),
            authors: Mutex::new(HashMap::new()),
            profile_requests: Mutex::new(Vec::new()),
            like_writes: Mutex::new(Vec::new()),
            hub: ChangeHub::new(64),
            fail_fetch: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            gate,
        })
    }

    pub fn discussion(&self) -> DiscussionId {
        self.discussion.clone()
    }

    /// Stores records (newest first) without notifying anybody.
    pub fn seed(&self, records: Vec<CommentRecord>) {
        let mut comments = lock(&self.comments);
        for record in records.into_iter().rev() {
            comments.insert(0, record);
        }
    }

    pub fn add_author(&self, profile: AuthorProfile) {
        lock(&self.authors).insert(profile.user_id.clone(), profile);
    }

    /// Stores the change and pushes it to subscribers.
    pub fn push_remote(&self, event: ChangeEvent) {
        match &event {
            ChangeEvent::Inserted(record) => lock(&self.comments).insert(0, record.clone()),
            ChangeEvent::Updated(patch) => {
                if let Some(c) = lock(&self.comments).iter_mut().find(|c| c.id == patch.id) {
                    c.apply(patch);
                }
            }
        }
        self.hub.publish(&self.discussion, event);
    }

    pub fn drop_streams(&self) {
        self.hub.disconnect_all();
    }

    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn profile_requests(&self) -> Vec<Vec<String>> {
        lock(&self.profile_requests).clone()
    }

    pub fn like_writes(&self) -> Vec<(String, u32)> {
        lock(&self.like_writes).clone()
    }

    pub fn stored(&self, id: &str) -> Option<CommentRecord> {
        lock(&self.comments).iter().find(|c| c.id == id).cloned()
    }

    async fn pass_gate(&self) -> Result<()> {
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("write rejected by fake backend"));
        }
        Ok(())
    }
}

#[async_trait]
impl CommentBackend for FakeBackend {
    async fn fetch_comments(&self, _discussion_id: &DiscussionId) -> Result<Vec<CommentRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(lock(&self.comments).clone())
    }

    async fn insert_comment(
        &self,
        discussion_id: &DiscussionId,
        author_id: &str,
        text: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentRecord> {
        self.pass_gate().await?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = CommentRecord {
            id: format!("srv-{}", n),
            text: text.to_string(),
            author_id: author_id.to_string(),
            created_at: Utc::now(),
            parent_id: parent_id.map(str::to_string),
            like_count: 0,
            discussion_id: discussion_id.clone(),
        };
        self.push_remote(ChangeEvent::Inserted(record.clone()));
        Ok(record)
    }

    async fn update_like_count(&self, comment_id: &str, new_count: u32) -> Result<()> {
        self.pass_gate().await?;
        if self.stored(comment_id).is_none() {
            return Err(anyhow!("no comment {}", comment_id));
        }
        lock(&self.like_writes).push((comment_id.to_string(), new_count));
        self.push_remote(ChangeEvent::Updated(CommentPatch::like_count(comment_id, new_count)));
        Ok(())
    }

    async fn subscribe(&self, discussion_id: &DiscussionId) -> Result<Subscription> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(anyhow!("realtime endpoint unavailable"));
        }
        Ok(self.hub.subscribe(discussion_id))
    }

    async fn fetch_author_profiles(&self, user_ids: &[String]) -> Result<Vec<AuthorProfile>> {
        lock(&self.profile_requests).push(user_ids.to_vec());
        let authors = lock(&self.authors);
        Ok(user_ids.iter().filter_map(|id| authors.get(id).cloned()).collect())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    liked: Mutex<HashMap<(String, String), bool>>,
    profiles: Mutex<HashMap<String, AuthorProfile>>,
}

impl MemoryStore {
    pub fn liked_value(&self, viewer_id: &str, comment_id: &str) -> Option<bool> {
        lock(&self.liked)
            .get(&(viewer_id.to_string(), comment_id.to_string()))
            .copied()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn load_liked(&self, viewer_id: &str) -> Result<HashMap<String, bool>> {
        Ok(lock(&self.liked)
            .iter()
            .filter(|((viewer, _), _)| viewer == viewer_id)
            .map(|((_, comment), liked)| (comment.clone(), *liked))
            .collect())
    }

    async fn save_liked(&self, viewer_id: &str, comment_id: &str, liked: bool) -> Result<()> {
        lock(&self.liked).insert((viewer_id.to_string(), comment_id.to_string()), liked);
        Ok(())
    }

    async fn load_profiles(&self, user_ids: &[String]) -> Result<Vec<AuthorProfile>> {
        let profiles = lock(&self.profiles);
        Ok(user_ids.iter().filter_map(|id| profiles.get(id).cloned()).collect())
    }

    async fn save_profiles(&self, profiles: &[AuthorProfile]) -> Result<()> {
        let mut stored = lock(&self.profiles);
        for profile in profiles {
            stored.insert(profile.user_id.clone(), profile.clone());
        }
        Ok(())
    }
}
