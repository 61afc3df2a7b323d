mod cache;
mod driver;
mod fetcher;
mod local;
mod merge;
mod mutation;
mod session;
mod subscription;
mod traits;

#[cfg(test)]
mod testing;

pub use cache::{AuthorCache, BoundedCache, LikedCache, DEFAULT_AUTHOR_CAPACITY, DEFAULT_LIKED_CAPACITY};
pub use driver::{
    open_session, open_session_with_cancel_token, LikeTicket, PostTicket, Services, SessionConfig,
    SessionHandle,
};
pub use fetcher::{FetchOutcome, Fetcher};
pub use merge::MergeOutcome;
pub use mutation::{is_local_id, LikeDraft, PostDraft};
pub use session::SessionState;
pub use subscription::{ChangeHub, Subscription};
pub use traits::{CommentBackend, LocalStore};
