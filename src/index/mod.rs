//! Stream index storage
//!
//! - `bucket`: Year/Month/Day bucket tree and the `Reference` entry
//! - `stream_index`: one (identity, stream type) index with its count cache
//! - `streams`: an identity's bundle of indices and the type dispatch table
//! - `manager`: the lock-owning manager and the reverse activity map

mod bucket;
mod manager;
mod stream_index;
mod streams;

pub use bucket::{DayBucket, DayKey, Reference};
pub use manager::{IndexStats, IndexStore, RefLocation, StreamIndexManager};
pub use stream_index::{Placement, StreamIndex};
pub use streams::IdentityStreams;
