pub mod authors;
pub mod comments;
pub mod sse;

use axum::http::{HeaderMap, StatusCode};
use domain::{DiscussionId, SyncError};

/// Authentication is someone else's job; the caller names the viewer.
pub const VIEWER_HEADER: &str = "x-viewer-id";

pub type ApiError = (StatusCode, String);

pub fn sync_error(e: SyncError) -> ApiError {
    let status = match &e {
        SyncError::FetchFailed(_) | SyncError::WriteFailed(_) => StatusCode::BAD_GATEWAY,
        SyncError::NotReady | SyncError::StreamDisconnected => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::UnknownComment(_) => StatusCode::NOT_FOUND,
        SyncError::Unconfirmed(_) | SyncError::LikeInFlight(_) => StatusCode::CONFLICT,
        SyncError::SessionClosed => StatusCode::GONE,
    };
    (status, e.to_string())
}

pub fn viewer_id(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get(VIEWER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "Missing X-Viewer-Id header".to_string(),
        ))?;
    if raw.len() > 128 {
        return Err((StatusCode::BAD_REQUEST, "Viewer ID is too long".to_string()));
    }
    Ok(raw.to_string())
}

pub fn discussion_id(raw: String) -> Result<DiscussionId, ApiError> {
    DiscussionId::new(raw).map_err(|e| (StatusCode::BAD_REQUEST, e))
}
