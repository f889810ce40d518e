//! Status endpoints

use super::prelude::*;
use crate::status::HealthReport;

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthReport>> {
    let report = HealthReport::collect(
        state.lifecycle.state(),
        state.lifecycle.started_at(),
        &state.statuses,
        Some(state.viewers.as_ref()),
        Some(state.cache.as_ref()),
        &state.settings.quality,
    );
    Json(ApiResponse::success(report))
}
