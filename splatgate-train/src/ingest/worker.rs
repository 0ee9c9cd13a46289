//! Background thread that drains a camera stream into the ingestion buffer.

use crate::ingest::buffer::{BufferError, IngestionBuffer};
use crate::ingest::camera::{CameraStream, StreamError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Totals reported when the worker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: usize,
    pub dropped: usize,
}

/// Handle to a running ingest thread.
pub struct IngestWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<IngestStats, StreamError>>>,
}

impl IngestWorker {
    /// Spawn a thread pulling frames from `stream` until it ends, fails, or
    /// [`IngestWorker::stop`] is called.
    pub fn spawn<S>(mut stream: S, buffer: Arc<IngestionBuffer>) -> std::io::Result<Self>
    where
        S: CameraStream + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("splatgate-ingest".to_string())
            .spawn(move || {
                let mut stats = IngestStats::default();
                info!("Ingest worker started (frame rate: {:?})", stream.frame_rate());

                while !stop_flag.load(Ordering::Acquire) && stream.is_active() {
                    let frame = match stream.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            debug!("Camera stream ended");
                            break;
                        }
                        Err(e) => {
                            warn!("Camera stream failed after {} frames: {}", stats.received, e);
                            return Err(e);
                        }
                    };

                    match buffer.push(frame) {
                        Ok(_) => stats.received += 1,
                        Err(BufferError::Full { capacity }) => {
                            stats.dropped += 1;
                            if stats.dropped == 1 {
                                warn!("Ingestion buffer full at {} frames, dropping new frames", capacity);
                            }
                        }
                        Err(BufferError::Poisoned) => {
                            return Err(StreamError::InvalidData(
                                "ingestion buffer lock poisoned".to_string(),
                            ));
                        }
                    }
                }

                info!(
                    "Ingest worker stopped: {} received, {} dropped",
                    stats.received, stats.dropped
                );
                Ok(stats)
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit after its current frame.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait for the thread to exit and return its totals.
    pub fn join(mut self) -> Result<IngestStats, StreamError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(StreamError::InvalidData("ingest thread panicked".to_string()))),
            None => Ok(IngestStats::default()),
        }
    }
}

impl Drop for IngestWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
