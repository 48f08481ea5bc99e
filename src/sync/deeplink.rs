//! Resolves an external item id (e.g. from a shared link) to an item.
//!
//! The memory index is checked first. While feeds are still warming up the
//! item may appear shortly, so the index is polled for a bounded window
//! before falling back to the single-item API lookup.

use crate::feed::{FetchError, HttpFetcher, Item};
use crate::sync::MemoryIndex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Item id is empty")]
    EmptyId,
    #[error("Item lookup failed: {0}")]
    Fetch(#[from] FetchError),
}

#[derive(Clone)]
pub struct DeepLinkResolver {
    index: MemoryIndex,
    fetcher: HttpFetcher,
    poll_window: Duration,
    poll_interval: Duration,
}

impl DeepLinkResolver {
    pub fn new(index: MemoryIndex, fetcher: HttpFetcher) -> Self {
        Self {
            index,
            fetcher,
            poll_window: Duration::from_secs(4),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_polling(mut self, window: Duration, interval: Duration) -> Self {
        self.poll_window = window;
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Index hit → poll the index → HTTP lookup.
    ///
    /// A successful HTTP lookup is added to the index.
    pub async fn resolve(&self, id: &str) -> Result<Item, ResolveError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ResolveError::EmptyId);
        }

        if let Some(item) = self.index.get(id) {
            tracing::debug!(id = %id, "Deep link resolved from index");
            return Ok(item);
        }

        let deadline = Instant::now() + self.poll_window;
        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(item) = self.index.get(id) {
                tracing::debug!(id = %id, "Deep link resolved from index after warm-up");
                return Ok(item);
            }
        }

        tracing::debug!(id = %id, "Deep link not indexed, falling back to item lookup");
        let item = self.fetcher.get_item(id).await?;
        self.index.insert(item.clone());
        Ok(item)
    }
}
