//! Service lifecycle: owns the sources, capture loops and HTTP listener of
//! one running instance.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::capture::{CaptureLoop, shutdown_requested};
use crate::config::Settings;
use crate::frame::SourceId;
use crate::sources::{SourceFactory, SourceHandle, SourceState, default_factory};
use crate::status::{HealthReport, StatusBoard};
use crate::web_server::{self, AppState};
use crate::{OurError, OurResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Result of a `start()` or `stop()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleChange {
    Transitioned,
    AlreadyRunning,
    AlreadyStopped,
}

/// Service state readable from any task without touching the lifecycle lock.
#[derive(Debug)]
pub struct Lifecycle {
    state: RwLock<ServiceState>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: RwLock::new(ServiceState::Stopped),
            started_at: RwLock::new(None),
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> ServiceState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, state: ServiceState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
        if state == ServiceState::Running {
            *self.started_at.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        } else if state == ServiceState::Stopped {
            *self.started_at.write().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }
}

struct RunningService {
    app: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    capture_tasks: Vec<(SourceId, JoinHandle<SourceHandle>)>,
    server_task: Option<JoinHandle<()>>,
}

/// The live-frame distribution service.
///
/// Frame caches and viewer counts belong to one run: they are created by
/// `start()` and cleared by `stop()`. Source status survives across runs
/// so health still answers while stopped.
pub struct FeedService {
    settings: Arc<Settings>,
    factory: SourceFactory,
    lifecycle: Arc<Lifecycle>,
    statuses: Arc<StatusBoard>,
    running: tokio::sync::Mutex<Option<RunningService>>,
    active: RwLock<Option<(Arc<AppState>, SocketAddr)>>,
}

impl FeedService {
    pub fn new(settings: Settings, factory: SourceFactory) -> OurResult<Self> {
        settings.validate()?;
        let statuses = Arc::new(StatusBoard::new(settings.source_ids().cloned()));
        Ok(Self {
            settings: Arc::new(settings),
            factory,
            lifecycle: Arc::new(Lifecycle::default()),
            statuses,
            running: tokio::sync::Mutex::new(None),
            active: RwLock::new(None),
        })
    }

    /// A service using the built-in camera backends.
    pub fn with_default_sources(settings: Settings) -> OurResult<Self> {
        let factory = default_factory(settings.read_timeout);
        Self::new(settings, factory)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn source_state(&self, source_id: &SourceId) -> Option<SourceState> {
        self.statuses.state(source_id)
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active().map(|(_, addr)| addr)
    }

    fn active(&self) -> Option<(Arc<AppState>, SocketAddr)> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.settings.port)
    }

    /// URL a collaborator on another machine uses to embed a live feed.
    pub fn feed_url(&self, host: &str, source_id: &SourceId) -> String {
        format!("http://{host}:{}/feed/{source_id}", self.port())
    }

    pub fn snapshot_url(&self, host: &str, source_id: &SourceId) -> String {
        format!("http://{host}:{}/snapshot/{source_id}", self.port())
    }

    pub fn asset_url(&self, host: &str, name: &str) -> String {
        format!("http://{host}:{}/asset/{name}", self.port())
    }

    pub fn health(&self) -> HealthReport {
        let active = self.active();
        let app = active.as_ref().map(|(app, _)| app);
        HealthReport::collect(
            self.lifecycle.state(),
            self.lifecycle.started_at(),
            &self.statuses,
            app.map(|app| app.viewers.as_ref()),
            app.map(|app| app.cache.as_ref()),
            &self.settings.quality,
        )
    }

    /// Open every source, launch their capture loops and start listening.
    ///
    /// A source that fails to open is left `Unavailable` and retried by its
    /// capture loop; only a listener bind failure aborts the start.
    pub async fn start(&self) -> OurResult<LifecycleChange> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Feed service already running, ignoring start");
            return Ok(LifecycleChange::AlreadyRunning);
        }

        self.lifecycle.set(ServiceState::Starting);
        info!(
            "Starting feed service with {} sources",
            self.settings.sources.len()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = Arc::new(AppState::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.statuses),
            Arc::clone(&self.lifecycle),
            shutdown_rx.clone(),
        ));

        let mut handles = Vec::new();
        for source in &self.settings.sources {
            let Some(status) = self.statuses.get(&source.id) else {
                continue;
            };
            status.reset();
            match SourceHandle::spawn(
                source.clone(),
                Arc::clone(&self.factory),
                self.settings.read_timeout,
            ) {
                Ok(handle) => handles.push((source, status, handle)),
                Err(e) => {
                    error!("Failed to start worker for {}: {e}", source.id);
                    status.mark_unavailable(e.to_string());
                }
            }
        }

        let opened = join_all(handles.iter().map(|(_, _, handle)| handle.open())).await;
        for ((source, status, _), result) in handles.iter().zip(opened) {
            match result {
                Ok(()) => {
                    status.mark_open();
                    info!("Source {} open", source.id);
                }
                Err(e) => {
                    status.mark_unavailable(e.to_string());
                    warn!("Source {} unavailable: {e}", source.id);
                }
            }
        }

        let capture_tasks = handles
            .into_iter()
            .map(|(source, status, handle)| {
                let capture = CaptureLoop {
                    source_id: source.id.clone(),
                    handle,
                    cache: Arc::clone(&app.cache),
                    viewers: Arc::clone(&app.viewers),
                    status,
                    policy: self.settings.quality.clone(),
                    interval: source.capture_interval,
                    max_backoff: self.settings.max_backoff,
                    shutdown: shutdown_rx.clone(),
                };
                (source.id.clone(), tokio::spawn(capture.run()))
            })
            .collect();

        let mut run = RunningService {
            app: Arc::clone(&app),
            shutdown_tx,
            capture_tasks,
            server_task: None,
        };

        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let bound = match TcpListener::bind(&addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!("Failed to bind to {addr}: {e}");
                self.lifecycle.set(ServiceState::Stopping);
                self.teardown(run).await;
                self.lifecycle.set(ServiceState::Stopped);
                return Err(OurError::App(format!("Failed to bind to {addr}: {e}")));
            }
        };

        run.server_task = Some(tokio::spawn(serve(
            listener,
            web_server::router(Arc::clone(&app)),
            shutdown_rx,
        )));

        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some((app, local_addr));
        *running = Some(run);
        self.lifecycle.set(ServiceState::Running);
        info!("Feed service running on http://{local_addr}");
        Ok(LifecycleChange::Transitioned)
    }

    /// Stop capture, release every camera and shut the listener down.
    ///
    /// Returns within the configured stop grace period even when a camera
    /// read is hung.
    pub async fn stop(&self) -> OurResult<LifecycleChange> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            warn!("Feed service already stopped, ignoring stop");
            return Ok(LifecycleChange::AlreadyStopped);
        };

        self.lifecycle.set(ServiceState::Stopping);
        info!("Stopping feed service");
        self.teardown(run).await;
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.lifecycle.set(ServiceState::Stopped);
        info!("Feed service stopped");
        Ok(LifecycleChange::Transitioned)
    }

    async fn teardown(&self, run: RunningService) {
        let deadline = Instant::now() + self.settings.stop_grace;
        let remaining = move || deadline.saturating_duration_since(Instant::now());

        // The run's AppState holds a receiver, so this cannot fail.
        let _ = run.shutdown_tx.send(true);

        let joins = run.capture_tasks.into_iter().map(|(source_id, mut task)| async move {
            match tokio::time::timeout(remaining(), &mut task).await {
                Ok(Ok(handle)) => Some(handle),
                Ok(Err(e)) => {
                    error!("Capture loop for {source_id} failed: {e}");
                    None
                }
                Err(_) => {
                    warn!("Capture loop for {source_id} did not stop in time, aborting it");
                    task.abort();
                    None
                }
            }
        });
        let handles: Vec<SourceHandle> = join_all(joins).await.into_iter().flatten().collect();

        let closes = handles.into_iter().map(|h| h.shutdown(remaining()));
        let close_sources = join_all(closes);
        let stop_server = async {
            if let Some(mut server) = run.server_task {
                if tokio::time::timeout(remaining(), &mut server).await.is_err() {
                    warn!("HTTP listener did not shut down in time, aborting it");
                    server.abort();
                }
            }
        };
        tokio::join!(close_sources, stop_server);

        run.app.cache.clear();
        for (_, status) in self.statuses.iter() {
            status.mark_closed();
        }
    }

    /// How long `stop()` may take at most, plus scheduling slack.
    pub fn stop_bound(&self) -> Duration {
        self.settings.stop_grace + Duration::from_millis(250)
    }
}

async fn serve(listener: TcpListener, app: Router, mut shutdown: watch::Receiver<bool>) {
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await;
    if let Err(e) = result {
        error!("Server error: {e}");
    }
}
