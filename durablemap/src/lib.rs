pub mod appendable;
pub mod blob;
pub mod byte_store;
pub mod chunked_log;
pub mod compaction;
pub mod config;
pub mod durable_map;
pub mod error;
pub mod index;
pub mod record;
pub mod types;

pub use appendable::{AppendableValuesMap, Items};
pub use blob::BlobStorage;
pub use byte_store::{ByteStore, MMapFile, VecStore};
pub use chunked_log::{ChunkedLog, LogChunk};
pub use compaction::{compaction_score, Compactable};
pub use config::{AllocationStrategy, CompactionConfig, DurableMapConfig};
pub use durable_map::{DurableMap, ValueEquality};
pub use error::{DurableMapError, Result};
pub use index::IntToMultiIntMap;
pub use types::{adjust_hash, Bytes, DataExternalizer, KeyDescriptor, Native, Str, NO_VALUE};
