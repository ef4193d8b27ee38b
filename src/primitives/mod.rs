//! Low-level primitives for building the storage engine.
//!
//! Includes positioned file I/O and the page cache.

/// Page cache with pinning and LRU eviction.
///
/// Pages are handed out as RAII guards that unpin on drop.
pub mod cache;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;
