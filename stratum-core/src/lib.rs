//! stratum core - historical time-series storage engine
//!
//! Persists supervisory/industrial process values at multiple detail levels
//! and answers time-range queries over them.
//!
//! # Architecture
//!
//! Samples flow through the following components:
//!
//! - **Channel group**: broadcasts every incoming sample to the registered
//!   channels of a configuration
//! - **Calculation pipeline**: reduces samples into coarser detail levels
//!   (AVERAGE, MINIMUM, MAXIMUM) window by window
//! - **Multiplexer**: routes each level's stream across many shard files,
//!   each owning an exclusive time span
//! - **File back-end**: a self-describing, checksum-protected record file
//!   with in-place insertion and binary-search reads
//!
//! Reads walk the covering shards newest-first and merge their contents,
//! tolerating torn trailing records and quarantining corrupt shards without
//! losing the stream.

pub mod backend;
pub mod calculation;
pub mod channel;
pub mod pipeline;
pub mod settings;
pub mod store;

mod error;
mod types;

pub use error::{Result, StratumError};
pub use types::*;

/// stratum version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
