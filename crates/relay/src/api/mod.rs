pub mod sessions;

use std::sync::Arc;

use axum::Router;

use crate::session::SessionRegistry;

/// REST surface: session creation and lookup.
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    sessions::router(registry)
}
