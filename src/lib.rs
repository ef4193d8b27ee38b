//! Strata: a slotted-page object store.
//!
//! Objects are variable-length byte strings addressed by stable [`types::ObjectId`]s.
//! They live on fixed-size pages grouped into files; [`storage::ObjectManager`]
//! places new objects using per-file free-space tiers, and [`volume::Volume`]
//! ties the page cache, extent allocator and catalog to one backing file.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Tracing subscriber setup.
pub mod logging;
/// File I/O and the page cache.
pub mod primitives;
/// Slotted pages, free-space tiers and the object manager.
pub mod storage;
/// Identifiers, errors and checksums shared by every layer.
pub mod types;
/// Volume assembly and the meta page.
pub mod volume;

pub use storage::{DeallocList, DeallocPool, ObjectHeader, ObjectManager, StoreOptions};
pub use types::{FileId, ObjectId, PageId, Result, StrataError};
pub use volume::Volume;
