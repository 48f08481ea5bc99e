//! Push channel that tells the coordinator when to refresh.
//!
//! The channel never carries item data. It connects only while the app is
//! foregrounded and online, and reconnects with exponential backoff.

mod backoff;
mod channel;

pub use backoff::Backoff;
pub use channel::{
    classify, realtime_url, ChannelGate, ChannelState, ChannelStatus, ChannelTimeouts,
    RealtimeChannel, Signal,
};
