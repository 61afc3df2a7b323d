use std::collections::HashSet;
use std::sync::Arc;

use domain::{CommentRecord, DiscussionId, SyncError};
use tracing::{debug, info, warn};

use crate::cache::AuthorCache;
use crate::traits::{CommentBackend, LocalStore};

pub struct FetchOutcome {
    /// Newest first, as delivered by the backend.
    pub records: Vec<CommentRecord>,
    /// Distinct authors in first-seen order.
    pub author_ids: Vec<String>,
}

#[derive(Clone)]
pub struct Fetcher {
    backend: Arc<dyn CommentBackend>,
    local: Arc<dyn LocalStore>,
    authors: AuthorCache,
}

impl Fetcher {
    pub fn new(backend: Arc<dyn CommentBackend>, local: Arc<dyn LocalStore>, authors: AuthorCache) -> Self {
        Self {
            backend,
            local,
            authors,
        }
    }

    /// Loads the whole discussion. Author resolution problems are logged and
    /// never fail the fetch.
    pub async fn fetch(&self, discussion_id: &DiscussionId) -> Result<FetchOutcome, SyncError> {
        let records = self
            .backend
            .fetch_comments(discussion_id)
            .await
            .map_err(|e| SyncError::FetchFailed(e.to_string()))?;

        let author_ids = distinct_authors(&records);
        info!(
            "Fetched {} comments ({} authors) for {}",
            records.len(),
            author_ids.len(),
            discussion_id
        );
        self.resolve_authors(&author_ids).await;

        Ok(FetchOutcome {
            records,
            author_ids,
        })
    }

    /// Fills the author cache for ids it does not know yet: local store
    /// first, then the backend. Returns how many profiles were added.
    pub async fn resolve_authors(&self, user_ids: &[String]) -> usize {
        let mut missing = self.authors.missing(user_ids);
        if missing.is_empty() {
            return 0;
        }
        let mut added = 0;

        match self.local.load_profiles(&missing).await {
            Ok(cached) => {
                missing.retain(|id| !cached.iter().any(|p| &p.user_id == id));
                added += cached.len();
                self.authors.merge(cached);
            }
            Err(e) => warn!("Failed to read cached profiles: {:?}", e),
        }
        if missing.is_empty() {
            return added;
        }

        match self.backend.fetch_author_profiles(&missing).await {
            Ok(profiles) => {
                debug!("Resolved {} of {} unknown authors", profiles.len(), missing.len());
                if let Err(e) = self.local.save_profiles(&profiles).await {
                    warn!("Failed to persist author profiles: {:?}", e);
                }
                added += profiles.len();
                self.authors.merge(profiles);
            }
            Err(e) => warn!("Failed to resolve author profiles: {:?}", e),
        }
        added
    }
}

fn distinct_authors(records: &[CommentRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(r.author_id.as_str()))
        .map(|r| r.author_id.clone())
        .collect()
}
