//! Folding realtime change events into a session's tree.

use domain::{ChangeEvent, InsertOutcome, PatchOutcome, Placement};
use tracing::debug;

use crate::session::{SessionState, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Tree not loaded yet; the event is replayed after the first load.
    Queued,
    /// Initial load failed; a retry fetches the full set instead.
    Discarded,
    /// Our own insert reported back by the stream.
    Echo,
    /// Event for another discussion.
    Foreign,
    Duplicate,
    Attached { author_id: String, resolved: Vec<String> },
    Orphaned { author_id: String },
    Patched,
    Deferred,
}

impl MergeOutcome {
    /// Author whose profile may need resolving after this merge.
    pub fn author_id(&self) -> Option<&str> {
        match self {
            MergeOutcome::Attached { author_id, .. } | MergeOutcome::Orphaned { author_id } => {
                Some(author_id.as_str())
            }
            _ => None,
        }
    }
}

impl SessionState {
    pub fn apply_change(&mut self, event: ChangeEvent) -> MergeOutcome {
        match self.stage {
            Stage::Ready => {}
            Stage::Loading => {
                self.queued.push(event);
                return MergeOutcome::Queued;
            }
            Stage::Failed(_) => return MergeOutcome::Discarded,
        }

        match event {
            ChangeEvent::Inserted(record) => {
                if record.discussion_id != self.discussion_id {
                    return MergeOutcome::Foreign;
                }
                if record.author_id == self.viewer_id {
                    debug!("Dropping self-echo of {}", record.id);
                    return MergeOutcome::Echo;
                }
                let author_id = record.author_id.clone();
                match self.tree.insert(record, Placement::Front) {
                    InsertOutcome::Attached { resolved } => {
                        if !resolved.is_empty() {
                            debug!("Resolved orphans {:?}", resolved);
                        }
                        self.touch();
                        MergeOutcome::Attached {
                            author_id,
                            resolved,
                        }
                    }
                    InsertOutcome::Orphaned => MergeOutcome::Orphaned { author_id },
                    InsertOutcome::Duplicate => MergeOutcome::Duplicate,
                }
            }
            ChangeEvent::Updated(patch) => {
                if patch.like_count.is_some() {
                    if let Some(pending) = self.pending_likes.get_mut(&patch.id) {
                        pending.superseded = true;
                    }
                }
                match self.tree.apply_patch(patch) {
                    PatchOutcome::Applied => {
                        self.touch();
                        MergeOutcome::Patched
                    }
                    PatchOutcome::Deferred => MergeOutcome::Deferred,
                }
            }
        }
    }
}
