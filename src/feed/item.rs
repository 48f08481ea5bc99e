//! Content items and the orderings applied to them.
//!
//! The authoritative order of every category list is newest-first by
//! [`Item::effective_timestamp`], ties broken by descending `id`. The
//! engagement-based orders in [`SortMode`] are presentation views computed
//! from a snapshot; they never reorder the stored list.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// A single content entry as delivered by the feed API.
///
/// Timestamps are parsed leniently: an unreadable value becomes `None`
/// instead of rejecting the whole page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(
        default,
        alias = "normalized_at",
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub normalized_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "published_at",
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "release_date",
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub release_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<u64>,
    #[serde(
        default,
        alias = "trending_score",
        skip_serializing_if = "Option::is_none"
    )]
    pub trending_score: Option<f64>,
    #[serde(default, alias = "editor_pick", skip_serializing_if = "Option::is_none")]
    pub editor_pick: Option<bool>,
}

impl Item {
    /// Creates an item with only an id and title set.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            summary: None,
            url: String::new(),
            kind: None,
            normalized_at: None,
            published_at: None,
            release_date: None,
            views: None,
            trending_score: None,
            editor_pick: None,
        }
    }

    /// The instant used for ordering: normalized-at, then published-at,
    /// then release-date.
    pub fn effective_timestamp(&self) -> Option<DateTime<Utc>> {
        self.normalized_at
            .or(self.published_at)
            .or(self.release_date)
    }

    /// Case-insensitive match of `query` against title and summary.
    ///
    /// `query` is expected to be lowercased already.
    fn matches_lowercase(&self, query: &str) -> bool {
        self.title.to_lowercase().contains(query)
            || self
                .summary
                .as_deref()
                .is_some_and(|s| s.to_lowercase().contains(query))
    }
}

/// Parses an RFC 3339 instant or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => parse_timestamp(&s),
        // Epoch seconds
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    })
}

/// Newest-first comparator: descending effective timestamp, undated items
/// last, ties broken by descending `id`.
pub fn newest_first(a: &Item, b: &Item) -> Ordering {
    b.effective_timestamp()
        .cmp(&a.effective_timestamp())
        .then_with(|| b.id.cmp(&a.id))
}

/// Sorts `items` into the authoritative newest-first order.
pub fn sort_newest_first(items: &mut [Item]) {
    items.sort_by(newest_first);
}

/// Client-side presentation orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    #[default]
    Newest,
    Trending,
    MostViewed,
    EditorsPicks,
}

impl SortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortMode::Newest => "newest",
            SortMode::Trending => "trending",
            SortMode::MostViewed => "views",
            SortMode::EditorsPicks => "editors",
        }
    }
}

impl FromStr for SortMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "newest" | "new" => Ok(SortMode::Newest),
            "trending" | "hot" => Ok(SortMode::Trending),
            "views" | "most_viewed" | "popular" => Ok(SortMode::MostViewed),
            "editors" | "editors_picks" | "picks" => Ok(SortMode::EditorsPicks),
            other => Err(format!("Unknown sort mode: {}", other)),
        }
    }
}

/// Present values first (descending), absent values last.
fn desc_present_first<T, F>(a: Option<T>, b: Option<T>, cmp: F) -> Ordering
where
    F: Fn(&T, &T) -> Ordering,
{
    match (a, b) {
        (Some(a), Some(b)) => cmp(&b, &a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Returns a copy of `items` (assumed newest-first) in the requested order.
///
/// The sort is stable, so items that compare equal under `mode` keep their
/// newest-first relative order.
pub fn sorted_view(items: &[Item], mode: SortMode) -> Vec<Item> {
    let mut view = items.to_vec();
    match mode {
        SortMode::Newest => {}
        SortMode::Trending => view.sort_by(|a, b| {
            desc_present_first(a.trending_score, b.trending_score, |x, y| x.total_cmp(y))
        }),
        SortMode::MostViewed => {
            view.sort_by(|a, b| desc_present_first(a.views, b.views, |x, y| x.cmp(y)))
        }
        SortMode::EditorsPicks => view.sort_by_key(|item| item.editor_pick != Some(true)),
    }
    view
}

/// Items whose title or summary contain `query`, case-insensitively.
///
/// A blank query matches everything.
pub fn filter_items(items: &[Item], query: &str) -> Vec<Item> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return items.to_vec();
    }
    items
        .iter()
        .filter(|item| item.matches_lowercase(&query))
        .cloned()
        .collect()
}
