//! Object storage on slotted pages.
//!
//! Objects live on fixed-size pages grouped into files. Each file keeps a
//! chain of its pages and five free-space tiers used to pick a page for new
//! objects; pages emptied by deletes are handed to a caller-owned
//! deallocation list.

/// Per-file catalog entries and volume-wide counters.
pub mod catalog;

/// Deferred deallocation pool and list.
pub mod dealloc;

/// Extent ownership and page allocation.
pub mod extent;

/// Page chain of a file.
pub mod filemap;

/// Object create, read and destroy.
pub mod object;

/// Store configuration.
pub mod options;

/// Slotted page layout.
pub mod page;

/// Free-space tiers.
pub mod tier;

pub use catalog::{Catalog, CatalogEntry, PagedCatalog};
pub use dealloc::{
    enqueue_for_deallocation, release_deallocated, DeallocEntry, DeallocList, DeallocPool,
};
pub use extent::{BitmapAllocator, ExtentAllocator, ExtentMap};
pub use object::{Object, ObjectManager};
pub use options::StoreOptions;
pub use page::{ObjectHeader, PageSummary, SlottedPage};
pub use tier::Tier;
