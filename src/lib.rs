//! Client-side feed synchronization and live updates.
//!
//! Per-category item lists are loaded from a paginated HTTP API, merged by
//! id, kept newest-first and mirrored to a SQLite disk cache. A coordinator
//! refreshes the active category on connectivity changes, foreground
//! transitions, a timer and hints from a websocket push channel.

pub mod config;
pub mod feed;
pub mod realtime;
pub mod storage;
pub mod sync;
pub mod util;
