mod error;
mod events;
mod models;
pub mod projection;
pub mod thread;

pub use error::SyncError;
pub use events::{ChangeEvent, SessionSignal};
pub use models::{
    AuthorProfile, CommentNode, CommentPatch, CommentRecord, DiscussionId, SessionPhase,
};
pub use projection::{ProjectedComment, ViewContext, DEFAULT_MAX_DEPTH};
pub use thread::{DiscussionTree, InsertOutcome, PatchOutcome, Placement};
