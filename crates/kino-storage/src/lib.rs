//! Table/column/video descriptors, the storage backend seam, and the
//! worker-side metadata cache.
//!
//! Architecture role:
//! - [`descriptor`] defines the schema structs the core reads and writes;
//!   the physical layout behind them is a backend concern
//! - [`provider`] is the [`Storage`] trait boundary; [`local`] is the
//!   filesystem backend, [`mem`] the in-memory backend for tests and
//!   embedded runs
//! - [`cache`] is the read-mostly [`MetadataCache`] shared by pipeline
//!   instances within one process

pub mod cache;
pub mod descriptor;
pub mod local;
pub mod mem;
pub mod provider;

pub use cache::MetadataCache;
pub use descriptor::{Column, ColumnType, CompressionSpec, TableDescriptor, VideoIndexEntry};
pub use local::LocalStorage;
pub use mem::MemoryStorage;
pub use provider::Storage;
