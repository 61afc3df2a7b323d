use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use domain::AuthorProfile;
use serde::Deserialize;
use tracing::info;

use super::{viewer_id, ApiError};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RegisterAuthorRequest {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Stores the calling viewer's profile and refreshes every cached copy.
pub async fn register_author(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterAuthorRequest>,
) -> Result<Json<AuthorProfile>, ApiError> {
    let user_id = viewer_id(&headers)?;
    let display_name = payload.display_name.trim();
    if display_name.is_empty() || display_name.len() > 64 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Display name must be 1-64 characters".to_string(),
        ));
    }

    let profile = AuthorProfile {
        user_id,
        display_name: display_name.to_string(),
        avatar_url: payload.avatar_url.filter(|u| !u.trim().is_empty()),
    };
    let internal = |e: anyhow::Error| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    state.db.upsert_author(&profile).await.map_err(internal)?;
    state.db.upsert_cached_profile(&profile).await.map_err(internal)?;
    state.sessions.authors().merge([profile.clone()]);

    info!("Registered author {} as {:?}", profile.user_id, profile.display_name);
    Ok(Json(profile))
}
