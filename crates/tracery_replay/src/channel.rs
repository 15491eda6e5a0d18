//! I/O channel router.
//!
//! Maintains the fd-to-channel mapping and translates raw read/write
//! syscalls into structured interactions. A single logical interaction may be
//! serviced over multiple syscalls: a short read delivers the requested
//! prefix and retains the remainder as excess data keyed by
//! `(channel, direction)`, reused for the immediately following syscall on
//! the same channel without consulting replay data again.

use crate::ledger::Ledger;
use crate::{BlockPoint, Desync, Fault};
use indexmap::IndexMap;
use tracery_core::{
    tcp_channel, CoreError, Direction, Interaction, CHANNEL_STDERR, CHANNEL_STDIO,
};
use tracery_substrate::Substrate;
use tracing::{debug, trace};

/// fd-to-channel router with excess-data buffering
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    fd_map: IndexMap<i64, String>,
    excess: IndexMap<(String, Direction), Vec<u8>>,
    sockets_established: usize,
}

impl Default for ChannelRouter {
    fn default() -> Self {
        let mut fd_map = IndexMap::new();
        fd_map.insert(0, CHANNEL_STDIO.to_string());
        fd_map.insert(1, CHANNEL_STDIO.to_string());
        fd_map.insert(2, CHANNEL_STDERR.to_string());
        Self {
            fd_map,
            excess: IndexMap::new(),
            sockets_established: 0,
        }
    }
}

impl ChannelRouter {
    /// Create a router with the standard-stream mappings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel bound to an fd, if any
    #[must_use]
    pub fn channel_of(&self, fd: i64) -> Option<&str> {
        self.fd_map.get(&fd).map(String::as_str)
    }

    /// Bind a freshly established socket fd to the next `tcp:<n>` channel
    pub fn bind_socket(&mut self, fd: i64) -> String {
        let channel = tcp_channel(self.sockets_established);
        self.sockets_established += 1;
        debug!(fd, channel, "socket channel established");
        self.fd_map.insert(fd, channel.clone());
        channel
    }

    /// Propagate a binding across descriptor duplication
    pub fn propagate(&mut self, old_fd: i64, new_fd: i64) {
        if let Some(channel) = self.fd_map.get(&old_fd).cloned() {
            self.fd_map.insert(new_fd, channel);
        }
    }

    /// Retire an fd's binding
    pub fn retire(&mut self, fd: i64) {
        self.fd_map.shift_remove(&fd);
    }

    /// Buffered excess bytes for an endpoint
    #[must_use]
    pub fn excess_len(&self, channel: &str, direction: Direction) -> usize {
        self.excess
            .get(&(channel.to_string(), direction))
            .map_or(0, Vec::len)
    }

    /// Handle a read-syscall entry on a possibly mapped fd.
    ///
    /// The target is suspended inside the syscall, so known data must be
    /// delivered (and `Block` raised when there is none) *before* the
    /// syscall is serviced.
    ///
    /// # Errors
    ///
    /// `Fault::Block` when no data is known for the channel; `Fault::Desync`
    /// when the recorded interaction does not match.
    pub async fn read_start<S: Substrate + ?Sized>(
        &mut self,
        substrate: &mut S,
        ledger: &mut Ledger<Interaction>,
        name: &str,
        args: &[String],
        trace_index: usize,
    ) -> Result<(), Fault> {
        let Some(channel) = parse_fd(args).and_then(|fd| self.channel_of(fd)) else {
            return Ok(()); // untracked file descriptor
        };
        let channel = channel.to_string();
        let requested = parse_count(name, args);

        // Excess from a previous short read services this syscall directly.
        let key = (channel.clone(), Direction::Input);
        if let Some(excess) = self.excess.get_mut(&key) {
            if !excess.is_empty() {
                let take = requested.unwrap_or(excess.len()).min(excess.len());
                let bytes: Vec<u8> = excess.drain(..take).collect();
                trace!(channel, take, "read serviced from excess data");
                substrate.write_channel(&channel, &bytes).await?;
                return Ok(());
            }
        }

        if ledger.in_replay() {
            let current = ledger.current().cloned().ok_or_else(cursor_error)?;
            if current.channel != channel || current.direction != Direction::Input {
                return Err(Fault::Desync(Desync {
                    expected: format!("{}/{:?}", current.channel, current.direction),
                    received: format!("{}/input", channel),
                    what: "interaction endpoint replay".to_string(),
                }));
            }
            match current.data {
                None => Err(Fault::Block(block_point(&channel, name, args, trace_index))),
                Some(data) if data.is_empty() => {
                    // An answered empty read is end-of-input.
                    substrate.close_channel(&channel).await?;
                    ledger.advance();
                    Ok(())
                }
                Some(data) => {
                    let take = requested.unwrap_or(data.len()).min(data.len());
                    substrate.write_channel(&channel, &data[..take]).await?;
                    if data.len() > take {
                        self.excess.insert(key, data[take..].to_vec());
                    }
                    ledger.advance();
                    Ok(())
                }
            }
        } else {
            ledger.push(Interaction::pending_input(channel.clone(), trace_index));
            ledger.advance();
            Err(Fault::Block(block_point(&channel, name, args, trace_index)))
        }
    }

    /// Handle a write-syscall exit on a possibly mapped fd.
    ///
    /// Reads exactly `result` bytes of captured output and verifies them
    /// against the record (replay) or appends a fresh output interaction
    /// (extend).
    ///
    /// # Errors
    ///
    /// `Fault::Desync` on a byte-for-byte mismatch with recorded output.
    pub async fn write_finish<S: Substrate + ?Sized>(
        &mut self,
        substrate: &mut S,
        ledger: &mut Ledger<Interaction>,
        result: Option<i64>,
        trace_index: usize,
        args: &[String],
    ) -> Result<(), Fault> {
        let Some(channel) = parse_fd(args).and_then(|fd| self.channel_of(fd)) else {
            return Ok(());
        };
        let channel = channel.to_string();
        let Some(written) = result.filter(|&n| n > 0) else {
            return Ok(()); // failed or empty write
        };
        #[allow(clippy::cast_sign_loss)]
        let written = written as usize;

        let observed = substrate.read_channel(&channel, written).await?;
        let key = (channel.clone(), Direction::Output);
        let mut offset = 0;

        while offset < observed.len() {
            let chunk = &observed[offset..];

            // Remainder of a previously recorded (longer) interaction.
            if let Some(excess) = self.excess.get_mut(&key) {
                if !excess.is_empty() {
                    let take = chunk.len().min(excess.len());
                    let expected: Vec<u8> = excess.drain(..take).collect();
                    if expected != chunk[..take] {
                        return Err(output_desync(&expected, &chunk[..take]));
                    }
                    offset += take;
                    continue;
                }
            }

            if ledger.in_replay() {
                let current = ledger.current().cloned().ok_or_else(cursor_error)?;
                if current.channel != channel || current.direction != Direction::Output {
                    return Err(Fault::Desync(Desync {
                        expected: format!("{}/{:?}", current.channel, current.direction),
                        received: format!("{}/output", channel),
                        what: "interaction endpoint replay".to_string(),
                    }));
                }
                let Some(recorded) = current.data else {
                    return Err(Fault::Error(CoreError::Internal {
                        message: "recorded output interaction with no data".to_string(),
                    }));
                };
                if recorded.len() <= chunk.len() {
                    if recorded != chunk[..recorded.len()] {
                        return Err(output_desync(&recorded, &chunk[..recorded.len()]));
                    }
                    offset += recorded.len();
                } else {
                    if recorded[..chunk.len()] != *chunk {
                        return Err(output_desync(&recorded[..chunk.len()], chunk));
                    }
                    self.excess.insert(key.clone(), recorded[chunk.len()..].to_vec());
                    offset = observed.len();
                }
                ledger.advance();
            } else {
                ledger.push(Interaction::resolved(
                    channel.clone(),
                    Direction::Output,
                    chunk.to_vec(),
                    trace_index,
                ));
                ledger.advance();
                offset = observed.len();
            }
        }

        Ok(())
    }
}

fn parse_fd(args: &[String]) -> Option<i64> {
    args.first()?.trim().parse().ok()
}

/// Requested byte count of a read-family syscall, when the argument list
/// carries one. `read`/`recv`/`recvfrom` put the buffer length at index 2;
/// `recvmsg` has its flags word there and the msghdr total is not visible in
/// the log, so no count is reported and the full known payload is delivered.
fn parse_count(name: &str, args: &[String]) -> Option<usize> {
    if name == "recvmsg" {
        return None;
    }
    args.get(2).and_then(|raw| raw.trim().parse().ok())
}

fn block_point(channel: &str, name: &str, args: &[String], trace_index: usize) -> BlockPoint {
    BlockPoint {
        channel: channel.to_string(),
        syscall: name.to_string(),
        args: args.to_vec(),
        trace_index,
    }
}

fn output_desync(expected: &[u8], received: &[u8]) -> Fault {
    Fault::Desync(Desync {
        expected: String::from_utf8_lossy(expected).into_owned(),
        received: String::from_utf8_lossy(received).into_owned(),
        what: "recorded output bytes".to_string(),
    })
}

fn cursor_error() -> Fault {
    Fault::Error(CoreError::Internal {
        message: "replay cursor past ledger end".to_string(),
    })
}
