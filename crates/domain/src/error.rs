use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("failed to fetch comments: {0}")]
    FetchFailed(String),

    #[error("remote write rejected: {0}")]
    WriteFailed(String),

    #[error("realtime stream disconnected")]
    StreamDisconnected,

    #[error("discussion is not loaded yet")]
    NotReady,

    #[error("unknown comment: {0}")]
    UnknownComment(String),

    #[error("comment {0} has not been confirmed yet")]
    Unconfirmed(String),

    #[error("a like toggle for comment {0} is still in flight")]
    LikeInFlight(String),

    #[error("discussion session is closed")]
    SessionClosed,
}
