//! Pipeline lifecycle audit log shipper.
//!
//! Library half of the `runlog` binary: layered configuration and the
//! stdin ingestion pump. The shipping machinery lives in `runlog-shipper`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod ingest;

pub use config::Config;
pub use ingest::{pump, IngestSummary};
