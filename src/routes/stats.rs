use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::db::image_queries::{self, PipelineStats};

#[derive(Deserialize)]
pub struct StatsQuery {
    pub batch_id: Option<String>,
}

/// GET /api/stats — status histogram and success rate, optionally scoped to
/// a batch. Read-only and weakly consistent.
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<PipelineStats>, (StatusCode, String)> {
    let stats = image_queries::pipeline_stats(&state.db, query.batch_id.as_deref())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e)))?;

    Ok(Json(stats))
}
