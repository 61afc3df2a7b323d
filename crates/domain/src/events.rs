use crate::models::{CommentPatch, CommentRecord, SessionPhase};
use serde::{Deserialize, Serialize};

/// Notification delivered by a discussion's realtime change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ChangeEvent {
    Inserted(CommentRecord),
    Updated(CommentPatch),
}

impl ChangeEvent {
    pub fn comment_id(&self) -> &str {
        match self {
            ChangeEvent::Inserted(record) => &record.id,
            ChangeEvent::Updated(patch) => &patch.id,
        }
    }
}

/// What a session tells its observers. The UI re-renders on `TreeChanged`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionSignal {
    TreeChanged { revision: u64 },
    PhaseChanged { phase: SessionPhase },
    MutationFailed { comment_id: String, reason: String },
    FetchFailed { reason: String },
}
