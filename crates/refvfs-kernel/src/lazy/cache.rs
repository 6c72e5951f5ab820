//! LRU cache of decoded, persisted pages.
//!
//! Only clean page contents live here. Pending edits stay in the mapper's
//! dirty buffers, so evicting a page never loses work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::page::PageSlots;

/// Default maximum cached pages.
pub const DEFAULT_MAX_PAGES: usize = 128;

/// `(array, page number)`.
pub type PageKey = (String, u64);

struct CachedPage {
    slots: Arc<PageSlots>,
    /// Last access time for LRU eviction.
    last_access: Instant,
}

pub struct PageCache {
    pages: HashMap<PageKey, CachedPage>,
    max_pages: usize,
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("len", &self.pages.len())
            .field("max_pages", &self.max_pages)
            .finish()
    }
}

impl PageCache {
    pub fn new(max_pages: usize) -> Self {
        Self {
            pages: HashMap::new(),
            max_pages: max_pages.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn get(&mut self, key: &PageKey) -> Option<Arc<PageSlots>> {
        let entry = self.pages.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.slots.clone())
    }

    pub fn insert(&mut self, key: PageKey, slots: Arc<PageSlots>) {
        if !self.pages.contains_key(&key) {
            self.evict_if_needed();
        }
        self.pages.insert(
            key,
            CachedPage {
                slots,
                last_access: Instant::now(),
            },
        );
    }

    /// Evict oldest entries if the cache is full.
    fn evict_if_needed(&mut self) {
        while self.pages.len() >= self.max_pages {
            let oldest = self
                .pages
                .iter()
                .min_by_key(|(_, p)| p.last_access)
                .map(|(k, _)| k.clone());

            match oldest {
                Some(key) => {
                    tracing::trace!(array = %key.0, page = key.1, "evicting cached page");
                    self.pages.remove(&key);
                }
                None => break,
            }
        }
    }
}
