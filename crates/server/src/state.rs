use axum::extract::FromRef;
use storage::Db;

use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub sessions: SessionRegistry,
}

impl FromRef<AppState> for Db {
    fn from_ref(state: &AppState) -> Self {
        state.db.clone()
    }
}
