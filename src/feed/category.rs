//! Per-category feed state machine.
//!
//! A [`CategoryFeed`] owns the authoritative newest-first list for one
//! category key. Every mutation happens inside [`CategoryFeed::load`]; the
//! resulting state is published as an immutable [`FeedSnapshot`] through a
//! `watch` channel, so observers only ever see sorted, deduplicated lists.
//!
//! Loads may overlap (a slow reset and a timer tick, say). Each load takes a
//! generation number when it starts, and a response is applied only if its
//! load is still the latest one issued. Older responses are dropped.

use crate::feed::fetcher::{FetchError, HttpFetcher};
use crate::feed::item::{sort_newest_first, Item};
use crate::storage::DiskCache;
use crate::sync::MemoryIndex;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Category Keys
// ============================================================================

/// Identifies a content vertical (e.g. `all`, `entertainment`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CategoryKey(Arc<str>);

impl CategoryKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default allow-list used when the config does not name categories.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "all",
    "news",
    "entertainment",
    "sports",
    "technology",
    "science",
    "business",
    "lifestyle",
];

/// The allow-list of category keys plus the fallback for unknown input.
#[derive(Debug, Clone)]
pub struct CategoryCatalog {
    keys: Vec<CategoryKey>,
    fallback: CategoryKey,
}

impl CategoryCatalog {
    /// Builds a catalog; `fallback` is added to the list if missing.
    pub fn new<I, S>(keys: I, fallback: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fallback = CategoryKey(Arc::from(fallback.trim().to_lowercase()));
        let mut list: Vec<CategoryKey> = Vec::new();
        for key in keys {
            let key = key.as_ref().trim().to_lowercase();
            if key.is_empty() || list.iter().any(|k| k.as_str() == key) {
                continue;
            }
            list.push(CategoryKey(Arc::from(key)));
        }
        if !list.contains(&fallback) {
            list.insert(0, fallback.clone());
        }
        Self {
            keys: list,
            fallback,
        }
    }

    /// Maps raw input onto a known key; anything unrecognized becomes the
    /// fallback.
    pub fn normalize(&self, raw: &str) -> CategoryKey {
        let wanted = raw.trim().to_lowercase();
        match self.keys.iter().find(|k| k.as_str() == wanted) {
            Some(key) => key.clone(),
            None => {
                tracing::debug!(requested = %raw, fallback = %self.fallback, "Unknown category, using fallback");
                self.fallback.clone()
            }
        }
    }

    pub fn keys(&self) -> &[CategoryKey] {
        &self.keys
    }

    pub fn fallback(&self) -> &CategoryKey {
        &self.fallback
    }
}

impl Default for CategoryCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_CATEGORIES.iter().copied(), "all")
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Observable phase of a feed, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    /// Never loaded
    Idle,
    InitialLoading,
    Ready,
    Refreshing,
    /// Last load failed and there is nothing to show; offer a manual retry
    ErrorNoData,
}

/// Immutable view of a feed published after every state change.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub category: CategoryKey,
    /// Newest-first, unique by id.
    pub items: Arc<Vec<Item>>,
    pub initial_loading: bool,
    pub refreshing: bool,
    pub error: Option<FetchError>,
    /// Max effective timestamp seen in the current load cycle.
    pub cursor: Option<DateTime<Utc>>,
    pub loaded_once: bool,
}

impl FeedSnapshot {
    fn empty(category: CategoryKey) -> Self {
        Self {
            category,
            items: Arc::new(Vec::new()),
            initial_loading: false,
            refreshing: false,
            error: None,
            cursor: None,
            loaded_once: false,
        }
    }

    pub fn phase(&self) -> FeedPhase {
        if self.initial_loading {
            FeedPhase::InitialLoading
        } else if self.refreshing {
            FeedPhase::Refreshing
        } else if self.error.is_some() && self.items.is_empty() {
            FeedPhase::ErrorNoData
        } else if !self.loaded_once {
            FeedPhase::Idle
        } else {
            FeedPhase::Ready
        }
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Merges `fetched` into `existing` by id and returns the newest-first result.
///
/// Fetched items overwrite existing ones with the same id; within `fetched`,
/// a later duplicate wins. Replaying the same items is a no-op.
pub fn merge_items(existing: &[Item], fetched: Vec<Item>) -> Vec<Item> {
    let mut by_id: HashMap<String, Item> = existing
        .iter()
        .map(|item| (item.id.clone(), item.clone()))
        .collect();
    for item in fetched {
        by_id.insert(item.id.clone(), item);
    }
    let mut merged: Vec<Item> = by_id.into_values().collect();
    sort_newest_first(&mut merged);
    merged
}

fn max_timestamp(items: &[Item]) -> Option<DateTime<Utc>> {
    items.iter().filter_map(Item::effective_timestamp).max()
}

// ============================================================================
// CategoryFeed
// ============================================================================

/// Paging and size limits for a feed.
#[derive(Debug, Clone, Copy)]
pub struct FeedOptions {
    pub page_size: u32,
    /// Pages followed per load via `next_cursor`.
    pub max_pages: u32,
    /// 0 = unlimited
    pub max_items: usize,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 3,
            max_items: 0,
        }
    }
}

/// What happened to a single `load()` call.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Response merged; `fetched` items came from the network.
    Applied { fetched: usize },
    /// Fetch failed; existing items were kept.
    Failed(FetchError),
    /// A newer load was issued before this one finished; result dropped.
    Superseded,
    /// The feed was disposed; nothing was changed.
    Disposed,
}

#[derive(Debug, Default)]
struct FeedState {
    items: Arc<Vec<Item>>,
    cursor: Option<DateTime<Utc>>,
    initial_loading: bool,
    refreshing: bool,
    error: Option<FetchError>,
    loaded_once: bool,
    generation: u64,
}

pub struct CategoryFeed {
    key: CategoryKey,
    fetcher: HttpFetcher,
    cache: DiskCache,
    index: MemoryIndex,
    options: FeedOptions,
    state: Mutex<FeedState>,
    snapshot_tx: watch::Sender<FeedSnapshot>,
    cancel: CancellationToken,
    pending_saves: Mutex<Vec<JoinHandle<()>>>,
}

impl CategoryFeed {
    pub fn new(
        key: CategoryKey,
        fetcher: HttpFetcher,
        cache: DiskCache,
        index: MemoryIndex,
        options: FeedOptions,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(FeedSnapshot::empty(key.clone()));
        Self {
            key,
            fetcher,
            cache,
            index,
            options,
            state: Mutex::new(FeedState::default()),
            snapshot_tx,
            cancel: CancellationToken::new(),
            pending_saves: Mutex::new(Vec::new()),
        }
    }

    /// Ties the feed's lifetime to `parent`: cancelling it disposes the feed.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn key(&self) -> &CategoryKey {
        &self.key
    }

    /// Receives a new snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops the feed. In-flight loads are abandoned and leave state untouched.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Loads the feed.
    ///
    /// `reset = true` clears the list and cursor, hydrates from the disk
    /// cache, fetches the full listing and persists the merged result.
    /// `reset = false` fetches only items newer than the cursor (the full
    /// listing if there is none yet, which is persisted too) and merges them in.
    ///
    /// Failures never discard loaded items. The cursor advances only when
    /// every page of the listing was fetched.
    pub async fn load(&self, reset: bool) -> LoadOutcome {
        self.run_load(reset, true).await
    }

    /// Incremental load that does not raise the `refreshing` flag.
    pub async fn load_silent(&self) -> LoadOutcome {
        self.run_load(false, false).await
    }

    /// Waits for outstanding disk cache writes started by full-listing loads.
    pub async fn flush(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.lock_saves());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(category = %self.key, error = %e, "Cache write task failed");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_saves(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending_saves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self) {
        let snapshot = {
            let state = self.lock();
            FeedSnapshot {
                category: self.key.clone(),
                items: Arc::clone(&state.items),
                initial_loading: state.initial_loading,
                refreshing: state.refreshing,
                error: state.error.clone(),
                cursor: state.cursor,
                loaded_once: state.loaded_once,
            }
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    fn cap(&self, items: &mut Vec<Item>) {
        if self.options.max_items > 0 && items.len() > self.options.max_items {
            items.truncate(self.options.max_items);
        }
    }

    async fn run_load(&self, reset: bool, show_progress: bool) -> LoadOutcome {
        if self.is_disposed() {
            return LoadOutcome::Disposed;
        }

        let (generation, since) = {
            let mut state = self.lock();
            state.generation = state.generation.wrapping_add(1);
            if reset {
                state.items = Arc::new(Vec::new());
                state.cursor = None;
                state.initial_loading = true;
            } else if show_progress {
                state.refreshing = true;
            }
            (state.generation, if reset { None } else { state.cursor })
        };

        tracing::debug!(category = %self.key, reset, generation, since = ?since, "Load started");

        if reset {
            self.hydrate(generation).await;
        } else if show_progress {
            self.publish();
        }

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(category = %self.key, generation, "Load abandoned (feed disposed)");
                return LoadOutcome::Disposed;
            }
            result = self.fetch_pages(since) => result,
        };

        let mut persist = None;
        let outcome = {
            let mut state = self.lock();
            if self.is_disposed() {
                return LoadOutcome::Disposed;
            }
            if state.generation != generation {
                tracing::debug!(
                    category = %self.key,
                    generation,
                    latest = state.generation,
                    "Ignoring stale load result (generation mismatch)"
                );
                return LoadOutcome::Superseded;
            }

            state.initial_loading = false;
            state.refreshing = false;
            state.loaded_once = true;

            match fetched {
                Ok(paged) => {
                    let fetched_count = paged.items.len();
                    let mut merged = merge_items(&state.items, paged.items);
                    self.cap(&mut merged);
                    // Items on unfetched pages are older than this batch, so
                    // the cursor only moves once the listing was read to the end
                    if paged.complete {
                        state.cursor = state.cursor.max(max_timestamp(&merged));
                    } else {
                        tracing::debug!(category = %self.key, cursor = ?state.cursor, "Listing incomplete, cursor held");
                    }
                    state.error = paged.error;
                    self.index.insert_all(&merged);
                    let merged = Arc::new(merged);
                    if since.is_none() {
                        persist = Some(Arc::clone(&merged));
                    }
                    tracing::info!(
                        category = %self.key,
                        reset,
                        fetched = fetched_count,
                        total = merged.len(),
                        complete = paged.complete,
                        "Feed updated"
                    );
                    state.items = merged;
                    LoadOutcome::Applied {
                        fetched: fetched_count,
                    }
                }
                Err(e) => {
                    if e.is_quiet() {
                        tracing::debug!(category = %self.key, error = %e, "Load failed");
                    } else {
                        tracing::warn!(
                            category = %self.key,
                            error = %e,
                            kept = state.items.len(),
                            "Load failed, keeping existing items"
                        );
                    }
                    state.error = Some(e.clone());
                    LoadOutcome::Failed(e)
                }
            }
        };

        if let Some(items) = persist {
            if let Some(handle) = self.cache.save(&self.key, items) {
                let mut saves = self.lock_saves();
                saves.retain(|h| !h.is_finished());
                saves.push(handle);
            }
        }

        self.publish();
        outcome
    }

    /// Paints cached items while the network request is in flight.
    async fn hydrate(&self, generation: u64) {
        let cached = self.cache.load(&self.key).await;
        let hydrated = {
            let mut state = self.lock();
            if state.generation == generation && !cached.is_empty() {
                let mut cached = merge_items(&[], cached);
                self.cap(&mut cached);
                self.index.insert_all(&cached);
                state.items = Arc::new(cached);
                true
            } else {
                false
            }
        };
        if hydrated {
            tracing::debug!(category = %self.key, "Hydrated from disk cache");
        }
        self.publish();
    }

    /// Fetches up to `max_pages` pages. A failure after the first page ends
    /// pagination but keeps what was already fetched; the result is then
    /// marked incomplete.
    async fn fetch_pages(&self, since: Option<DateTime<Utc>>) -> Result<PagedFetch, FetchError> {
        let mut fetched = PagedFetch::default();
        let mut cursor: Option<String> = None;

        for page_number in 0..self.options.max_pages.max(1) {
            let page = self
                .fetcher
                .list_items(
                    self.key.as_str(),
                    self.options.page_size,
                    since,
                    cursor.as_deref(),
                )
                .await;

            let page = match page {
                Ok(page) => page,
                Err(e) if page_number == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        category = %self.key,
                        page = page_number + 1,
                        error = %e,
                        "Pagination stopped early"
                    );
                    fetched.error = Some(e);
                    return Ok(fetched);
                }
            };

            let next = page.next_cursor().map(str::to_owned);
            fetched.items.extend(page.items);
            match next {
                Some(next) => cursor = Some(next),
                None => {
                    fetched.complete = true;
                    return Ok(fetched);
                }
            }
        }

        tracing::debug!(
            category = %self.key,
            max_pages = self.options.max_pages,
            "Page limit reached with more pages available"
        );
        Ok(fetched)
    }
}

/// Items gathered across pages for one load.
#[derive(Debug, Default)]
struct PagedFetch {
    items: Vec<Item>,
    /// The last page had no `next_cursor`.
    complete: bool,
    /// Failure on a page after the first.
    error: Option<FetchError>,
}
