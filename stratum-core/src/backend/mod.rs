//! Storage back-ends
//!
//! The persistence layer of the engine:
//!
//! - **header/file**: one shard file holding a contiguous time window of
//!   sorted, checksummed records
//! - **factory**: on-disk naming and discovery of shard files
//! - **manager**: lifecycle, locking and corruption handling of all shards
//!   of one configuration
//! - **multiplexer**: the virtual back-end presenting many shards as one
//!   stream

mod factory;
mod file;
mod header;
mod manager;
mod multiplexer;

pub use factory::{decode_name_part, encode_name_part, encode_time_part, FileBackEndFactory};
pub use file::{FileBackEnd, ShardLock, RECORD_SIZE};
pub use header::{FileHeader, FILE_MARKER, FILE_VERSION};
pub use manager::BackEndManager;
pub use multiplexer::BackEndMultiplexer;
