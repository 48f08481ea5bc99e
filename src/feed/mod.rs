//! Feed data and loading.
//!
//! - [`item`] - the `Item` model, newest-first ordering, client-side views
//! - [`fetcher`] - HTTP access to the feed API with retry and typed errors
//! - [`category`] - per-category state machine, merge and snapshots
//!
//! # Example
//!
//! ```ignore
//! use feedsync::feed::{CategoryFeed, FeedOptions};
//!
//! let feed = CategoryFeed::new(key, fetcher, cache, index, FeedOptions::default());
//! feed.load(true).await;                // reset: hydrate, fetch, persist
//! feed.load(false).await;               // incremental: only items since cursor
//! let snapshot = feed.snapshot();       // newest-first, unique by id
//! ```

mod category;
mod fetcher;
mod item;

pub use category::{
    merge_items, CategoryCatalog, CategoryFeed, CategoryKey, FeedOptions, FeedPhase, FeedSnapshot,
    LoadOutcome, DEFAULT_CATEGORIES,
};
pub use fetcher::{
    build_client, Connectivity, Endpoints, FeedPage, FetchError, FetchPolicy, HttpFetcher,
    TRANSIENT_STATUSES,
};
pub use item::{
    filter_items, newest_first, parse_timestamp, sort_newest_first, sorted_view, Item, SortMode,
};
