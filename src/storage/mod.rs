//! SQLite-backed persistence: the per-category disk cache and a small
//! preference table.

mod item_cache;
mod preferences;
mod schema;
mod types;

pub use item_cache::DiskCache;
pub use preferences::ACTIVE_CATEGORY_KEY;
pub use schema::Database;
pub use types::{CachedCategory, DatabaseError};
