//! HTTP API for the chat relay

mod handlers;
mod types;

pub use handlers::{build_router, AppError, AuthUser};
pub use types::*;

use crate::auth::TokenAuth;
use crate::db::Database;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;

/// Application state shared across handlers and socket tasks
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub auth: Arc<TokenAuth>,
    pub registry: Arc<ConnectionRegistry>,
}

impl AppState {
    pub fn new(db: Database, auth: TokenAuth) -> Self {
        Self {
            db,
            auth: Arc::new(auth),
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }
}
