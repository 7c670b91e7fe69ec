//! Periodic flush worker.

use std::sync::Arc;

use runlog_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::shipper::ShipperCore;

/// One of the shipper's symmetric flush workers.
///
/// Sleeps `flush_interval`, runs a guarded flush cycle, and repeats until
/// cancelled. Cancellation is only observed while sleeping, so a flush in
/// progress always runs to completion or to its timeout.
pub(crate) struct FlushWorker {
    id: usize,
    core: Arc<ShipperCore>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl FlushWorker {
    pub(crate) fn new(id: usize, core: Arc<ShipperCore>, cancellation_token: CancellationToken) -> Self {
        let clock = core.clock();
        Self { id, core, cancellation_token, clock }
    }

    pub(crate) async fn run(self) {
        let interval = self.core.config().flush_interval;
        info!(worker_id = self.id, shipper_id = %self.core.id(), "flush worker started");

        loop {
            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                () = self.clock.sleep(interval) => {}
            }

            debug!(worker_id = self.id, "flush worker woke");
            self.core.guarded_flush(self.id).await;
        }

        info!(worker_id = self.id, shipper_id = %self.core.id(), "flush worker stopped");
    }
}
