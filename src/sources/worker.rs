//! Dedicated worker thread per source and the async handle used to drive it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{FrameSource, SourceFactory};
use crate::config::SourceConfig;
use crate::frame::{RawFrame, SourceId};
use crate::{OurError, OurResult};

/// Camera initialisation is allowed this many read timeouts.
const OPEN_TIMEOUT_FACTOR: u32 = 3;

#[derive(Debug)]
enum SourceRequest {
    Open {
        respond_to: oneshot::Sender<OurResult<()>>,
    },
    Read {
        respond_to: oneshot::Sender<OurResult<RawFrame>>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle for communicating with a source's worker thread
pub struct SourceHandle {
    source_id: SourceId,
    request_sender: mpsc::UnboundedSender<SourceRequest>,
    open_in_flight: Arc<AtomicBool>,
    read_in_flight: Arc<AtomicBool>,
    opened: Arc<AtomicBool>,
    read_timeout: Duration,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    /// Start the worker thread. The source itself is built on that thread.
    pub fn spawn(
        config: SourceConfig,
        factory: SourceFactory,
        read_timeout: Duration,
    ) -> OurResult<Self> {
        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let open_in_flight = Arc::new(AtomicBool::new(false));
        let read_in_flight = Arc::new(AtomicBool::new(false));
        let opened = Arc::new(AtomicBool::new(false));
        let source_id = config.id.clone();

        let flags = WorkerFlags {
            open_in_flight: Arc::clone(&open_in_flight),
            read_in_flight: Arc::clone(&read_in_flight),
            opened: Arc::clone(&opened),
        };
        let thread = std::thread::Builder::new()
            .name(format!("source-{source_id}"))
            .spawn(move || run_worker(config, factory, request_receiver, flags))?;

        Ok(Self {
            source_id,
            request_sender,
            open_in_flight,
            read_in_flight,
            opened,
            read_timeout,
            thread: Some(thread),
        })
    }

    /// Whether the worker reports the camera as acquired.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    fn channel_closed(&self) -> OurError {
        OurError::App(format!("source worker for {} has exited", self.source_id))
    }

    /// Acquire the camera. Like reads, an open that is still running on the
    /// worker makes further opens fail immediately.
    pub async fn open(&self) -> OurResult<()> {
        if self.open_in_flight.swap(true, Ordering::AcqRel) {
            return Err(OurError::Open {
                source_id: self.source_id.clone(),
                reason: "previous open is still pending".to_string(),
            });
        }

        let (respond_to, receiver) = oneshot::channel();
        if self
            .request_sender
            .send(SourceRequest::Open { respond_to })
            .is_err()
        {
            self.open_in_flight.store(false, Ordering::Release);
            return Err(self.channel_closed());
        }

        let timeout = self.read_timeout * OPEN_TIMEOUT_FACTOR;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.channel_closed()),
            Err(_) => Err(OurError::Open {
                source_id: self.source_id.clone(),
                reason: format!("open did not complete within {timeout:?}"),
            }),
        }
    }

    /// Read one frame, giving up after the read timeout.
    ///
    /// A read abandoned on timeout keeps the worker busy until the camera
    /// returns; reads issued meanwhile fail immediately instead of queueing.
    pub async fn read_frame(&self) -> OurResult<RawFrame> {
        if self.read_in_flight.swap(true, Ordering::AcqRel) {
            return Err(OurError::Read {
                source_id: self.source_id.clone(),
                reason: "previous read is still pending".to_string(),
            });
        }

        let (respond_to, receiver) = oneshot::channel();
        if self
            .request_sender
            .send(SourceRequest::Read { respond_to })
            .is_err()
        {
            self.read_in_flight.store(false, Ordering::Release);
            return Err(self.channel_closed());
        }

        match tokio::time::timeout(self.read_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.channel_closed()),
            Err(_) => Err(OurError::ReadTimeout {
                source_id: self.source_id.clone(),
                timeout: self.read_timeout,
            }),
        }
    }

    /// Ask the worker to release the camera. Returns false when the worker
    /// did not get to it within `timeout`, e.g. because a read is hung.
    pub async fn close(&self, timeout: Duration) -> bool {
        let (respond_to, receiver) = oneshot::channel();
        if self
            .request_sender
            .send(SourceRequest::Close { respond_to })
            .is_err()
        {
            return true;
        }
        matches!(tokio::time::timeout(timeout, receiver).await, Ok(Ok(())))
    }

    /// Close the source and wait up to `grace` for the worker thread to end.
    ///
    /// A worker stuck in a camera call is left to finish on its own; it
    /// releases the camera as soon as the call returns.
    pub async fn shutdown(self, grace: Duration) {
        let deadline = Instant::now() + grace;
        if !self.close(grace).await {
            warn!(
                "Source {} did not close within {grace:?}, a read is probably hung",
                self.source_id
            );
        }

        let Self {
            source_id,
            request_sender,
            thread,
            ..
        } = self;
        // Dropping the sender ends the worker's receive loop.
        drop(request_sender);

        let Some(thread) = thread else {
            return;
        };
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!("Worker thread for {source_id} still busy, detaching it");
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if thread.join().is_err() {
            error!("Worker thread for {source_id} panicked");
        }
    }
}

struct WorkerFlags {
    open_in_flight: Arc<AtomicBool>,
    read_in_flight: Arc<AtomicBool>,
    opened: Arc<AtomicBool>,
}

fn run_worker(
    config: SourceConfig,
    factory: SourceFactory,
    mut request_receiver: mpsc::UnboundedReceiver<SourceRequest>,
    flags: WorkerFlags,
) {
    let source_id = config.id.clone();
    let mut source: Result<Box<dyn FrameSource>, String> =
        factory(&config).map_err(|e| e.to_string());
    if let Err(e) = &source {
        error!("Failed to create source {source_id}: {e}");
    }
    debug!("Worker for {source_id} started");

    while let Some(request) = request_receiver.blocking_recv() {
        match request {
            SourceRequest::Open { respond_to } => {
                let result = match source.as_mut() {
                    Ok(source) => {
                        let result = source.open();
                        flags.opened.store(source.is_open(), Ordering::Release);
                        result
                    }
                    Err(reason) => Err(OurError::Open {
                        source_id: source_id.clone(),
                        reason: reason.clone(),
                    }),
                };
                flags.open_in_flight.store(false, Ordering::Release);
                if respond_to.send(result).is_err() {
                    debug!("Open result for {source_id} was abandoned");
                }
            }
            SourceRequest::Read { respond_to } => {
                let result = match source.as_mut() {
                    Ok(source) => source.read_frame(),
                    Err(reason) => Err(OurError::Read {
                        source_id: source_id.clone(),
                        reason: reason.clone(),
                    }),
                };
                flags.read_in_flight.store(false, Ordering::Release);
                if respond_to.send(result).is_err() {
                    debug!("Frame read from {source_id} was abandoned");
                }
            }
            SourceRequest::Close { respond_to } => {
                if let Ok(source) = source.as_mut() {
                    source.close();
                }
                flags.opened.store(false, Ordering::Release);
                let _ = respond_to.send(());
            }
        }
    }

    if let Ok(source) = source.as_mut() {
        source.close();
    }
    flags.opened.store(false, Ordering::Release);
    info!("Worker for {source_id} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use std::sync::atomic::AtomicU32;

    /// Opens block until `release` is set.
    struct SlowOpenSource {
        release: Arc<AtomicBool>,
        opens: Arc<AtomicU32>,
        open: bool,
    }

    impl FrameSource for SlowOpenSource {
        fn open(&mut self) -> OurResult<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            self.open = true;
            Ok(())
        }

        fn read_frame(&mut self) -> OurResult<RawFrame> {
            Ok(RawFrame::new(1, 1, vec![0; 3]))
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[tokio::test]
    async fn test_open_fails_fast_while_previous_open_hangs() {
        let release = Arc::new(AtomicBool::new(false));
        let opens = Arc::new(AtomicU32::new(0));
        let factory: SourceFactory = {
            let release = Arc::clone(&release);
            let opens = Arc::clone(&opens);
            Arc::new(move |_: &SourceConfig| -> OurResult<Box<dyn FrameSource>> {
                Ok(Box::new(SlowOpenSource {
                    release: Arc::clone(&release),
                    opens: Arc::clone(&opens),
                    open: false,
                }))
            })
        };
        let config = SourceConfig::new(
            "usb",
            SourceKind::TestPattern {
                width: 1,
                height: 1,
            },
        );
        let handle =
            SourceHandle::spawn(config, factory, Duration::from_millis(20)).expect("spawn");

        // times out after OPEN_TIMEOUT_FACTOR read timeouts
        assert!(matches!(handle.open().await, Err(OurError::Open { .. })));

        let started = Instant::now();
        match handle.open().await {
            Err(OurError::Open { reason, .. }) => assert!(reason.contains("pending")),
            other => panic!("expected a pending open error, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_millis(20));

        release.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.open().await.is_err() {
            assert!(Instant::now() < deadline, "open never recovered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.is_open());
        // the hung open plus the one that succeeded, nothing queued behind it
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        handle.shutdown(Duration::from_secs(1)).await;
    }
}
