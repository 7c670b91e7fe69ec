//! Worker pool management with structured concurrency.
//!
//! Owns the join handles of a shipper's flush workers and the token that
//! cancels them.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{Result, ShipperError},
    shipper::ShipperCore,
    worker::FlushWorker,
};

/// Supervised set of flush workers for one shipper.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    core: Arc<ShipperCore>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(core: Arc<ShipperCore>, cancellation_token: CancellationToken) -> Self {
        Self { core, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns `num_workers` flush workers. Returns once they are spawned.
    pub(crate) fn spawn_workers(&mut self) {
        let worker_count = self.core.config().num_workers;
        info!(worker_count, shipper_id = %self.core.id(), "spawning flush workers");

        for worker_id in 0..worker_count {
            let worker =
                FlushWorker::new(worker_id, Arc::clone(&self.core), self.cancellation_token.clone());
            self.worker_handles.push(tokio::spawn(worker.run()));
        }
    }

    /// Cancels every worker and waits up to `timeout` for them to exit.
    ///
    /// Workers in the middle of a flush finish it first.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers are still running after
    /// `timeout`, or `WorkerPanic` for the first worker that panicked.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);

        let shutdown_future = async {
            let mut first_panic = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "flush worker panicked");
                    first_panic.get_or_insert(ShipperError::WorkerPanic {
                        worker_id,
                        error: join_error.to_string(),
                    });
                }
            }
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(ShipperError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any worker task is still running.
    pub(crate) fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = self.worker_handles.iter().filter(|h| !h.is_finished()).count(),
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
