//! TRACERY Core Types
//!
//! This crate contains pure types and logic with no I/O: the interaction and
//! syscall records that make up an execution trace, the flat-trace container
//! carried by the trace protocol, node identifiers, and the lossless
//! byte-to-text payload encoding used on the JSON wire.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod id;
pub mod interaction;
pub mod syscall;
pub mod trace;

// Re-exports
pub use encoding::{decode_latin1, encode_latin1};
pub use error::{CoreError, CoreResult};
pub use id::NodeId;
pub use interaction::{tcp_channel, Direction, Interaction, CHANNEL_ERROR, CHANNEL_STDERR, CHANNEL_STDIO};
pub use syscall::SyscallRecord;
pub use trace::{Datapoint, FlatTrace};
