use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::page::max_inline_len;
use crate::types::{Result, StrataError, VolumeId};

/// Smallest supported page size; page sizes are multiples of it.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;

/// Settings used when creating or opening a volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Size of every page in bytes.
    pub page_size: u32,
    /// Number of frames in the buffer pool.
    pub cache_pages: usize,
    /// Pages per extent (at most 32).
    pub pages_per_extent: u32,
    /// Identifier stamped into every page of the volume.
    pub volume_id: u16,
    /// Default extent fill factor for new files, in percent.
    pub fill_factor: u8,
    /// Lower bound for the largest object stored inline.
    pub inline_threshold: Option<u32>,
    /// Unique tags reserved from the catalog at a time.
    pub unique_batch: u32,
    /// Capacity of deallocation pools handed out by the volume.
    pub dealloc_pool_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_pages: 256,
            pages_per_extent: 16,
            volume_id: 1,
            fill_factor: 100,
            inline_threshold: None,
            unique_batch: 16,
            dealloc_pool_size: 64,
        }
    }
}

impl StoreOptions {
    /// Sets the page size in bytes.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the buffer pool capacity in pages.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Sets how many pages one extent spans.
    pub fn pages_per_extent(mut self, pages: u32) -> Self {
        self.pages_per_extent = pages;
        self
    }

    /// Sets the default extent fill factor in percent.
    pub fn fill_factor(mut self, percent: u8) -> Self {
        self.fill_factor = percent;
        self
    }

    /// Caps inline objects below the page capacity.
    pub fn inline_threshold(mut self, bytes: u32) -> Self {
        self.inline_threshold = Some(bytes);
        self
    }

    /// Sets how many unique tags a page reserves at once.
    pub fn unique_batch(mut self, tags: u32) -> Self {
        self.unique_batch = tags;
        self
    }

    /// The configured volume id.
    pub fn volume(&self) -> VolumeId {
        VolumeId(self.volume_id)
    }

    /// Largest payload, in bytes, `create_object` accepts.
    pub fn max_object_len(&self) -> usize {
        let capacity = max_inline_len(self.page_size as usize);
        match self.inline_threshold {
            Some(limit) => capacity.min(limit as usize),
            None => capacity,
        }
    }

    /// Checks every setting against its supported range.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            || self.page_size % MIN_PAGE_SIZE != 0
        {
            return Err(StrataError::Invalid(
                "page_size must be a multiple of 512 between 512 and 32768",
            ));
        }
        if self.cache_pages < 4 {
            return Err(StrataError::Invalid("cache_pages must be at least 4"));
        }
        if !(1..=32).contains(&self.pages_per_extent) {
            return Err(StrataError::Invalid("pages_per_extent must be within 1..=32"));
        }
        if self.pages_per_extent < 2 {
            return Err(StrataError::Invalid("pages_per_extent must leave room for system pages"));
        }
        if !(1..=100).contains(&self.fill_factor) {
            return Err(StrataError::Invalid("fill_factor must be within 1..=100"));
        }
        if self.inline_threshold == Some(0) {
            return Err(StrataError::Invalid("inline_threshold must be positive"));
        }
        if self.unique_batch == 0 {
            return Err(StrataError::Invalid("unique_batch must be positive"));
        }
        if self.dealloc_pool_size == 0 {
            return Err(StrataError::Invalid("dealloc_pool_size must be positive"));
        }
        Ok(())
    }

    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(text).map_err(|err| StrataError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| StrataError::Config(err.to_string()))
    }
}
