//! TRACERY trace protocol.
//!
//! JSON messages and the transport they travel on: trace requests go to a
//! shared work list consumed by competing workers; trace results, node
//! announcements, and external input answers travel on broadcast channels.

#![warn(clippy::all)]

pub mod bus;
pub mod message;

pub use bus::{Bus, Envelope, MemoryBus, Subscription};
pub use message::{
    result_channel, InputEvent, NodeAnnouncement, TraceRequest, TraceResult, CHANNEL_INPUT,
    CHANNEL_NODE, TRACE_CHANNEL_PREFIX, WORK_TRACE,
};
