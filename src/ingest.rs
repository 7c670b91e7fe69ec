//! Newline-delimited JSON ingestion.
//!
//! Each non-blank line is one [`LifecycleEvent`] object tagged by `kind`.
//! Malformed lines and backpressure rejections are logged and counted; they
//! never stop the pump.

use anyhow::{Context, Result};
use runlog_core::LifecycleEvent;
use runlog_shipper::Shipper;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// Totals for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// Lines read, including blank ones.
    pub lines: u64,
    /// Events the shipper accepted.
    pub accepted: u64,
    /// Lines that were not a valid event.
    pub malformed: u64,
    /// Events refused because their queue stayed full.
    pub rejected: u64,
}

/// Reads events from `reader` until EOF and hands them to `shipper`.
///
/// # Errors
///
/// Returns an error only if reading from `reader` fails.
pub async fn pump<R>(reader: R, shipper: &Shipper) -> Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IngestSummary::default();

    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        summary.lines += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: LifecycleEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                summary.malformed += 1;
                warn!(line = summary.lines, error = %e, "skipping malformed event");
                continue;
            },
        };

        let category = event.category();
        match shipper.record(event).await {
            Ok(()) => {
                summary.accepted += 1;
                debug!(line = summary.lines, %category, "event accepted");
            },
            Err(e) => {
                summary.rejected += 1;
                warn!(line = summary.lines, %category, error = %e, "event rejected");
            },
        }
    }

    Ok(summary)
}
