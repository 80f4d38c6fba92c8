//! # The proof store
//!
//! Generating a proof takes a long time and needs a dedicated, expensive machine. Every outcome of
//! a proof computation is thus persisted to the file system, keyed by a [`RequestKey`] derived
//! from the trace.
//!
//! ## Layout
//!
//! Each entry is a single JSON file `<cache_dir>/<key>`, holding either `{"result": …}` for a
//! proof or `{"error": {"kind": …}}` for a failure. New entries are written into `<cache_dir>/tmp`
//! and moved into place atomically, so a reader sees either the old or the new entry, never a
//! partial one. There is no index, the directory listing is the index.
//!
//! The creation time of an entry is its `mtime`.
//!
//! ## Expiration
//!
//! A background sweep (see [`ProofStore::spawn_sweeper`]) runs every
//! [`CacheConfig::sweep_interval`](crate::config::CacheConfig::sweep_interval) and removes:
//!
//! - successful entries older than [`CacheConfig::retention`](crate::config::CacheConfig::retention),
//! - all failed entries, so a failed request is recomputed after the next sweep,
//! - corrupt entries, which lookups already treat as a miss.
//!
//! [`ProveError::InternalError`] is never persisted.
//!
//! ### Metrics
//!
//! - `caches.sweep.files`: Entries retained by the last sweep.
//! - `caches.sweep.files_removed`: Entries removed by sweeps.

mod cache_error;
mod cache_key;
mod cleanup;
mod fs;

pub use cache_error::{CacheEntry, ProveError};
pub use cache_key::RequestKey;
pub use cleanup::{CleanupStats, cleanup};
pub use fs::ProofStore;
