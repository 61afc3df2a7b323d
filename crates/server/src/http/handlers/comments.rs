use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use domain::{CommentNode, CommentRecord, ProjectedComment, SessionPhase};
use engine::SessionHandle;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{discussion_id, sync_error, viewer_id, ApiError};
use crate::state::AppState;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TEXT_LEN: usize = 10_000;

#[derive(Deserialize)]
pub struct ViewQuery {
    pub max_depth: Option<usize>,
}

/// `?wait=true` holds the response until the store settles the write.
#[derive(Deserialize, Default)]
pub struct WaitQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Deserialize)]
pub struct CreateCommentRequest {
    pub text: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostCommentResponse {
    pub local_id: String,
    pub comment: Option<CommentRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LikeResponse {
    pub liked: bool,
    pub like_count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub comment_id: Option<String>,
}

async fn open(state: &AppState, headers: &HeaderMap, raw_id: String) -> Result<SessionHandle, ApiError> {
    let viewer = viewer_id(headers)?;
    let discussion = discussion_id(raw_id)?;
    Ok(state.sessions.get_or_open(&viewer, &discussion).await)
}

pub async fn get_tree(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<Vec<CommentNode>>, ApiError> {
    let session = open(&state, &headers, raw_id).await?;
    let tree = session.get_tree().await.map_err(sync_error)?;
    Ok(Json(tree))
}

pub async fn get_view(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<Json<Vec<ProjectedComment>>, ApiError> {
    let session = open(&state, &headers, raw_id).await?;
    let view = match query.max_depth {
        Some(depth) => session.get_view_projection(depth).await,
        None => session.projection().await,
    }
    .map_err(sync_error)?;
    Ok(Json(view))
}

pub async fn get_phase(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<SessionPhase>, ApiError> {
    let session = open(&state, &headers, raw_id).await?;
    let phase = session.phase().await.map_err(sync_error)?;
    Ok(Json(phase))
}

pub async fn post_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
    Query(wait): Query<WaitQuery>,
    Json(payload): Json<CreateCommentRequest>,
) -> Result<(StatusCode, Json<PostCommentResponse>), ApiError> {
    let text = payload.text.trim();
    if text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Comment text is empty".to_string()));
    }
    if text.len() > MAX_TEXT_LEN {
        return Err((StatusCode::PAYLOAD_TOO_LARGE, "Comment text is too long".to_string()));
    }

    let session = open(&state, &headers, raw_id).await?;
    let ticket = session
        .post_comment(text, payload.parent_id)
        .await
        .map_err(sync_error)?;
    let local_id = ticket.local_id.clone();

    if !wait.wait {
        return Ok((
            StatusCode::ACCEPTED,
            Json(PostCommentResponse {
                local_id,
                comment: None,
            }),
        ));
    }

    match tokio::time::timeout(SETTLE_TIMEOUT, ticket.settled()).await {
        Ok(Ok(comment)) => Ok((
            StatusCode::CREATED,
            Json(PostCommentResponse {
                local_id,
                comment: Some(comment),
            }),
        )),
        Ok(Err(e)) => Err(sync_error(e)),
        Err(_) => {
            warn!("Post {} still unsettled after {:?}", local_id, SETTLE_TIMEOUT);
            Err((StatusCode::GATEWAY_TIMEOUT, "Timeout".to_string()))
        }
    }
}

pub async fn toggle_like(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((raw_id, comment_id)): Path<(String, String)>,
    Query(wait): Query<WaitQuery>,
) -> Result<Json<LikeResponse>, ApiError> {
    let session = open(&state, &headers, raw_id).await?;
    let ticket = session.toggle_like(&comment_id).await.map_err(sync_error)?;
    let liked = ticket.liked;

    if !wait.wait {
        return Ok(Json(LikeResponse {
            liked,
            like_count: None,
        }));
    }

    match tokio::time::timeout(SETTLE_TIMEOUT, ticket.settled()).await {
        Ok(Ok(count)) => Ok(Json(LikeResponse {
            liked,
            like_count: Some(count),
        })),
        Ok(Err(e)) => Err(sync_error(e)),
        Err(_) => Err((StatusCode::GATEWAY_TIMEOUT, "Timeout".to_string())),
    }
}

pub async fn get_reply_target(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<ReplyTarget>, ApiError> {
    let session = open(&state, &headers, raw_id).await?;
    let comment_id = session.reply_target().await.map_err(sync_error)?;
    Ok(Json(ReplyTarget { comment_id }))
}

pub async fn set_reply_target(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
    Json(payload): Json<ReplyTarget>,
) -> Result<Json<ReplyTarget>, ApiError> {
    let session = open(&state, &headers, raw_id).await?;
    session
        .set_reply_target(payload.comment_id.clone())
        .await
        .map_err(sync_error)?;
    Ok(Json(payload))
}

pub async fn retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = open(&state, &headers, raw_id).await?;
    let retried = session.retry().await.map_err(sync_error)?;
    Ok(Json(serde_json::json!({ "retried": retried })))
}

pub async fn close_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let viewer = viewer_id(&headers)?;
    let discussion = discussion_id(raw_id)?;
    let closed = state.sessions.close(&viewer, &discussion).await;
    Ok(Json(serde_json::json!({ "closed": closed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StoreBackend;
    use crate::config::SessionSettings;
    use crate::http::handlers::VIEWER_HEADER;
    use crate::registry::SessionRegistry;
    use axum::http::HeaderValue;
    use engine::{ChangeHub, Services};
    use std::sync::Arc;
    use storage::Db;
    use tokio_util::sync::CancellationToken;

    async fn app_state() -> AppState {
        let db = Db::in_memory().await.unwrap();
        let backend = Arc::new(StoreBackend::new(db.clone(), ChangeHub::new(16)));
        let settings = SessionSettings {
            max_depth: 3,
            command_buffer: 8,
            signal_buffer: 8,
            reconnect_delay_ms: 10,
            idle_timeout_ms: 60_000,
            max_open: 64,
            sweep_interval_ms: 60_000,
        };
        let sessions = SessionRegistry::new(
            Services::new(backend, Arc::new(db.clone())),
            settings,
            CancellationToken::new(),
        );
        AppState { db, sessions }
    }

    fn viewer(name: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(VIEWER_HEADER, HeaderValue::from_static(name));
        headers
    }

    async fn wait_ready(state: &AppState, headers: &HeaderMap) {
        for _ in 0..200 {
            let Json(phase) = get_phase(State(state.clone()), headers.clone(), Path("p1".to_string()))
                .await
                .unwrap();
            if phase.is_ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never became ready");
    }

    #[tokio::test]
    async fn test_post_and_reply_through_handlers() {
        let state = app_state().await;
        let ann = viewer("ann");
        wait_ready(&state, &ann).await;

        let (status, Json(root)) = post_comment(
            State(state.clone()),
            ann.clone(),
            Path("p1".to_string()),
            Query(WaitQuery { wait: true }),
            Json(CreateCommentRequest {
                text: "  first  ".to_string(),
                parent_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let root = root.comment.unwrap();
        assert_eq!(root.text, "first");

        let (status, _) = post_comment(
            State(state.clone()),
            ann.clone(),
            Path("p1".to_string()),
            Query(WaitQuery::default()),
            Json(CreateCommentRequest {
                text: "reply".to_string(),
                parent_id: Some(root.id.clone()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let Json(tree) = get_tree(State(state.clone()), ann.clone(), Path("p1".to_string()))
            .await
            .unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].replies.len(), 1);
    }

    #[tokio::test]
    async fn test_rejections_carry_status() {
        let state = app_state().await;
        let ann = viewer("ann");
        wait_ready(&state, &ann).await;

        let err = post_comment(
            State(state.clone()),
            ann.clone(),
            Path("p1".to_string()),
            Query(WaitQuery::default()),
            Json(CreateCommentRequest {
                text: "   ".to_string(),
                parent_id: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = toggle_like(
            State(state.clone()),
            ann.clone(),
            Path(("p1".to_string(), "missing".to_string())),
            Query(WaitQuery::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = get_tree(State(state.clone()), HeaderMap::new(), Path("p1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_like_is_visible_to_other_viewers() {
        let state = app_state().await;
        let ann = viewer("ann");
        let bob = viewer("bob");
        wait_ready(&state, &ann).await;
        wait_ready(&state, &bob).await;

        let (_, Json(posted)) = post_comment(
            State(state.clone()),
            ann.clone(),
            Path("p1".to_string()),
            Query(WaitQuery { wait: true }),
            Json(CreateCommentRequest {
                text: "like me".to_string(),
                parent_id: None,
            }),
        )
        .await
        .unwrap();
        let id = posted.comment.unwrap().id;

        for _ in 0..200 {
            let Json(tree) = get_tree(State(state.clone()), bob.clone(), Path("p1".to_string()))
                .await
                .unwrap();
            if !tree.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let Json(like) = toggle_like(
            State(state.clone()),
            bob.clone(),
            Path(("p1".to_string(), id.clone())),
            Query(WaitQuery { wait: true }),
        )
        .await
        .unwrap();
        assert!(like.liked);
        assert_eq!(like.like_count, Some(1));

        for _ in 0..200 {
            let Json(view) = get_view(
                State(state.clone()),
                ann.clone(),
                Path("p1".to_string()),
                Query(ViewQuery { max_depth: None }),
            )
            .await
            .unwrap();
            if view.first().map(|c| c.like_count) == Some(1) {
                assert!(!view[0].liked);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("like never reached the other viewer");
    }
}
