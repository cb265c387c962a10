use sqlx::PgPool;
use std::sync::Arc;

use crate::services::storage::BlobStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn BlobStore>,
}

impl AppState {
    pub fn new(db: PgPool, store: Arc<dyn BlobStore>) -> Self {
        Self { db, store }
    }
}
