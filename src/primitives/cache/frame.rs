use parking_lot::RwLock;
use std::sync::Arc;

/// A cached page image plus its bookkeeping.
pub struct Frame {
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn zeroed(page_size: usize) -> Self {
        Self::with_image(vec![0u8; page_size].into_boxed_slice())
    }

    pub fn with_image(image: Box<[u8]>) -> Self {
        Self {
            buf: Arc::new(RwLock::new(image)),
            dirty: false,
            pin_count: 0,
        }
    }

    pub fn is_evictable(&self) -> bool {
        self.pin_count == 0
    }
}
