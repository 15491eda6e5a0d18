//! Scripted in-memory substrate for deterministic tests.
//!
//! Plays back a fixed event sequence and byte streams, so engine and worker
//! behavior can be exercised without a real target process.

use crate::{Substrate, SubstrateEvent};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use tracery_core::{CoreError, CoreResult};

/// Substrate that replays a scripted run
#[derive(Debug, Default)]
pub struct ScriptedSubstrate {
    events: VecDeque<SubstrateEvent>,
    /// Bytes "the target produced", read back by write-syscall handlers
    captured: HashMap<String, VecDeque<u8>>,
    /// Bytes delivered to "the target", per channel
    delivered: HashMap<String, Vec<u8>>,
    closed: HashSet<String>,
    shut_down: bool,
}

impl ScriptedSubstrate {
    /// Create an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the script
    #[must_use]
    pub fn with_event(mut self, event: SubstrateEvent) -> Self {
        self.events.push_back(event);
        self
    }

    /// Append a whole event sequence
    #[must_use]
    pub fn with_events(mut self, events: impl IntoIterator<Item = SubstrateEvent>) -> Self {
        self.events.extend(events);
        self
    }

    /// Stage bytes the scripted target produces on a channel
    #[must_use]
    pub fn with_captured(mut self, channel: impl Into<String>, data: &[u8]) -> Self {
        self.captured
            .entry(channel.into())
            .or_default()
            .extend(data.iter().copied());
        self
    }

    /// Bytes delivered to the target so far on a channel
    #[must_use]
    pub fn delivered(&self, channel: &str) -> &[u8] {
        self.delivered.get(channel).map_or(&[], Vec::as_slice)
    }

    /// Whether a channel's write side was closed
    #[must_use]
    pub fn channel_closed(&self, channel: &str) -> bool {
        self.closed.contains(channel)
    }

    /// Whether the substrate was shut down
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

#[async_trait]
impl Substrate for ScriptedSubstrate {
    async fn next_event(&mut self) -> CoreResult<Option<SubstrateEvent>> {
        Ok(self.events.pop_front())
    }

    async fn write_channel(&mut self, channel: &str, data: &[u8]) -> CoreResult<()> {
        if self.closed.contains(channel) {
            return Err(CoreError::Closed {
                endpoint: channel.to_string(),
            });
        }
        self.delivered
            .entry(channel.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn read_channel(&mut self, channel: &str, len: usize) -> CoreResult<Vec<u8>> {
        let queue = self.captured.get_mut(channel).ok_or_else(|| CoreError::Closed {
            endpoint: channel.to_string(),
        })?;
        if queue.len() < len {
            return Err(CoreError::Io {
                message: format!(
                    "channel {} produced {} bytes, syscall reported {}",
                    channel,
                    queue.len(),
                    len
                ),
            });
        }
        Ok(queue.drain(..len).collect())
    }

    async fn close_channel(&mut self, channel: &str) -> CoreResult<()> {
        self.closed.insert(channel.to_string());
        Ok(())
    }

    async fn shutdown(&mut self) -> CoreResult<()> {
        self.shut_down = true;
        self.events.clear();
        Ok(())
    }
}
