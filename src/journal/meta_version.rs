//! Metadata log format versions
//!
//! Every journal record carries the version it was written with; decoders
//! branch on it so that records written by older coordinators keep loading.

/// First version whose alter jobs carry bloom filter settings
pub const VERSION_BLOOM_FILTER: u32 = 9;

/// First version whose alter jobs carry the storage encoding flag
pub const VERSION_STORAGE_ENCODING: u32 = 39;

/// Version written by this build
pub const CURRENT_META_VERSION: u32 = 42;
