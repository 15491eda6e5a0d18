//! TRACERY substrate adapter.
//!
//! The substrate is the instrumented execution environment that runs the
//! target program and reports every executed basic block and every syscall.
//! This crate provides the contract over it ([`Substrate`]), the QEMU
//! user-mode implementation ([`QemuSubstrate`]), the incremental log parser
//! it is built on, and a scripted in-memory substrate for deterministic
//! tests.

#![warn(clippy::all)]

pub mod parser;
pub mod qemu;
pub mod script;

use async_trait::async_trait;
use tracery_core::CoreResult;

/// One low-level event reported by the substrate, in strict execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateEvent {
    /// One executed basic block
    ExecBlock {
        /// Block address
        addr: u64,
    },
    /// Syscall entry; the result is not yet known
    SyscallStart {
        /// Syscall name
        name: String,
        /// Ordered raw textual arguments
        args: Vec<String>,
    },
    /// Syscall exit, with the result when the substrate reported one
    SyscallFinish {
        /// Syscall name
        name: String,
        /// Ordered raw textual arguments
        args: Vec<String>,
        /// Return value; absent when the substrate reported none
        result: Option<i64>,
    },
}

/// Contract over the instrumented process substrate.
///
/// Implementations own the target process (or its stand-in) and must release
/// every resource on [`Substrate::shutdown`] and on drop, whichever comes
/// first, including when a run is aborted by an error or a timeout.
#[async_trait]
pub trait Substrate: Send {
    /// Next event in the strictly ordered stream; `None` once the target
    /// has exited and the stream is exhausted.
    async fn next_event(&mut self) -> CoreResult<Option<SubstrateEvent>>;

    /// Deliver bytes to the target on a named channel (e.g. its stdin).
    async fn write_channel(&mut self, channel: &str, data: &[u8]) -> CoreResult<()>;

    /// Read exactly `len` bytes the target produced on a named channel.
    async fn read_channel(&mut self, channel: &str, len: usize) -> CoreResult<Vec<u8>>;

    /// Close the write side of a named channel (EOF for the target).
    async fn close_channel(&mut self, channel: &str) -> CoreResult<()>;

    /// Tear down the target and release all resources.
    async fn shutdown(&mut self) -> CoreResult<()>;

    /// Memory-map snapshot captured at launch, when available.
    fn maps(&self) -> Option<String> {
        None
    }
}
