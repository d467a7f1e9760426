//! A single entry, process wide cache with single-flight fetches.
use std::future::Future;

use tokio::sync::Mutex;

/// Where a value handed out by `CachedValue` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// The entry was already populated.
    Cached,
    /// The entry was empty and this call ran the fetch.
    Fetched,
}

/// Holds at most one value. The lock is held across the fetch, so concurrent callers that find
/// the entry empty queue behind the first one and reuse what it stored instead of issuing their
/// own fetch. A failed fetch leaves the entry empty and the next caller tries again.
pub struct CachedValue<T> {
    slot: Mutex<Option<T>>,
}

impl<T: Clone> CachedValue<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return the cached value, or run `fetch`, store its result and return it.
    pub async fn get_or_fetch<F, Fut, E>(&self, fetch: F) -> Result<(T, CacheSource), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.lock().await;

        if let Some(value) = slot.as_ref() {
            return Ok((value.clone(), CacheSource::Cached));
        }

        let value = fetch().await?;
        *slot = Some(value.clone());

        Ok((value, CacheSource::Fetched))
    }

    pub async fn get(&self) -> Option<T> {
        self.slot.lock().await.clone()
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

impl<T: Clone + PartialEq> CachedValue<T> {
    /// Clear the entry only if it still holds `stale`. Returns whether anything was cleared.
    /// A newer value stored by another caller in the meantime is kept.
    pub async fn invalidate_if(&self, stale: &T) -> bool {
        let mut slot = self.slot.lock().await;

        if slot.as_ref() == Some(stale) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

impl<T: Clone> Default for CachedValue<T> {
    fn default() -> Self {
        Self::new()
    }
}
