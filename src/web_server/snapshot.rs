//! Single-frame JPEG snapshots.

use axum::http::header;
use bytes::Bytes;

use super::prelude::*;
use crate::encoder::{self, CONTENT_TYPE};
use crate::viewers::QualityTier;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SnapshotQuery {
    /// Re-encode the retained raw frame at this tier instead of serving the
    /// cached JPEG.
    tier: Option<QualityTier>,
}

/// `GET /snapshot/{source}`
///
/// Serves whatever frame is cached, however old. Works whether or not
/// anyone is watching the feed.
#[instrument(level = "debug", skip(state))]
pub(crate) async fn snapshot(
    Path(source): Path<String>,
    Query(query): Query<SnapshotQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let source_id = SourceId::from(source);
    if !state.cache.contains(&source_id) {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown source {source_id}"));
    }
    let Some(snapshot) = state.cache.read_snapshot(&source_id) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("No frame available yet for {source_id}"),
        );
    };

    let data: Bytes = match query.tier {
        Some(tier) if tier != snapshot.encoded.tier => {
            let raw = Arc::clone(&snapshot.raw);
            let policy = state.settings.quality.clone();
            let encoded =
                tokio::task::spawn_blocking(move || encoder::encode(&raw, tier, &policy)).await;
            match encoded {
                Ok(Ok(encoded)) => encoded.data,
                Ok(Err(e)) => {
                    error!("Failed to re-encode snapshot for {source_id}: {e}");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
                }
                Err(e) => {
                    error!("Snapshot encode task for {source_id} failed: {e}");
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Snapshot encoding failed",
                    );
                }
            }
        }
        _ => snapshot.encoded.data,
    };

    debug!("Serving {} byte snapshot of {source_id}", data.len());
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], data).into_response()
}
