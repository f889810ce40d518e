//! HTTP surface: live feeds, snapshots, health and the static display assets.

use std::sync::Arc;

use axum::{Router, middleware::from_fn, middleware::from_fn_with_state, routing::get};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::cache::FrameCache;
use crate::config::Settings;
use crate::service::Lifecycle;
use crate::status::StatusBoard;
use crate::viewers::ViewerRegistry;

pub(crate) mod feed;
pub(crate) mod health;
pub(crate) mod middleware;
pub(crate) mod prelude;
pub(crate) mod snapshot;

pub use feed::{BOUNDARY, StreamSession};

/// Application state shared across handlers, one per service run.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub cache: Arc<FrameCache>,
    pub viewers: Arc<ViewerRegistry>,
    pub statuses: Arc<StatusBoard>,
    pub lifecycle: Arc<Lifecycle>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Fresh cache and viewer registry for the configured sources.
    pub fn new(
        settings: Arc<Settings>,
        statuses: Arc<StatusBoard>,
        lifecycle: Arc<Lifecycle>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let cache = Arc::new(FrameCache::new(settings.source_ids().cloned()));
        let viewers = Arc::new(ViewerRegistry::new(settings.source_ids().cloned()));
        Self {
            settings,
            cache,
            viewers,
            statuses,
            lifecycle,
            shutdown,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let camera_routes = Router::new()
        .route("/health", get(health::health))
        .route("/feed/{source}", get(feed::live_feed))
        .route("/snapshot/{source}", get(snapshot::snapshot))
        .layer(from_fn(middleware::no_cache_middleware));

    // Preset images first, then whatever operators dropped into custom/.
    let asset_root = &state.settings.asset_root;
    let custom = ServeDir::new(asset_root.join("custom"));
    let assets = ServeDir::new(asset_root).fallback(custom);
    let asset_routes = Router::new()
        .nest_service("/asset", assets)
        .layer(from_fn_with_state(
            Arc::clone(&state),
            middleware::asset_cache_middleware,
        ));

    Router::new()
        .merge(camera_routes)
        .merge(asset_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceConfig, SourceKind};
    use crate::frame::SourceId;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    fn test_state() -> (Arc<AppState>, watch::Sender<bool>) {
        let settings = Settings {
            sources: vec![SourceConfig::new(
                "robot",
                SourceKind::TestPattern {
                    width: 8,
                    height: 8,
                },
            )],
            asset_root: std::env::temp_dir().join("frame-relay-missing-assets"),
            ..Settings::default()
        };
        let statuses = Arc::new(StatusBoard::new(settings.source_ids().cloned()));
        let (tx, rx) = watch::channel(false);
        let state = AppState::new(
            Arc::new(settings),
            statuses,
            Arc::new(Lifecycle::default()),
            rx,
        );
        (Arc::new(state), tx)
    }

    fn request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn test_unknown_source_is_not_found() {
        let (state, _tx) = test_state();
        for uri in ["/feed/usb", "/snapshot/usb"] {
            let response = router(Arc::clone(&state))
                .oneshot(request(uri))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_feed_refused_while_not_running() {
        let (state, _tx) = test_state();
        let response = router(Arc::clone(&state))
            .oneshot(request("/feed/robot"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.viewers.current_count(&SourceId::from("robot")), 0);
    }

    #[tokio::test]
    async fn test_camera_routes_are_not_cacheable() {
        let (state, _tx) = test_state();
        let response = router(state)
            .oneshot(request("/health"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let cache_control = response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(cache_control.contains("no-store"));
    }

    #[tokio::test]
    async fn test_missing_asset() {
        let (state, _tx) = test_state();
        let response = router(state)
            .oneshot(request("/asset/nothing.png"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());
    }
}
