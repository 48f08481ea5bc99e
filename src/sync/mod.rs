//! Cross-feed services: the shared item index, deep-link resolution and the
//! coordinator that schedules refreshes.

mod coordinator;
mod deeplink;
mod index;

pub use coordinator::{
    plan_load, Debounce, LoadKind, SyncConditions, SyncCoordinator, SyncEvent, SyncServices,
    SyncSettings, Trigger,
};
pub use deeplink::{DeepLinkResolver, ResolveError};
pub use index::MemoryIndex;
