//! QEMU user-mode substrate.
//!
//! Runs the target under `qemu -d strace,exec`, with the log delivered over
//! a dedicated pipe (`-D /proc/<pid>/fd/<w>`) so the target's own standard
//! streams stay clean for channel I/O.

use crate::parser::{LogItem, LogParser};
use crate::{Substrate, SubstrateEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracery_core::{CoreError, CoreResult, CHANNEL_STDERR, CHANNEL_STDIO};
use tracing::{debug, warn};

/// QEMU substrate configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuConfig {
    /// Path to the qemu user-mode binary
    pub qemu_path: String,
    /// Target argument vector (argv[0] first)
    pub target_args: Vec<String>,
    /// Report syscalls (`-d strace`)
    pub syscall_trace: bool,
    /// Report executed blocks (`-d exec`)
    pub block_trace: bool,
}

impl QemuConfig {
    /// Create a config for a target argument vector
    #[must_use]
    pub fn new(qemu_path: impl Into<String>, target_args: Vec<String>) -> Self {
        Self {
            qemu_path: qemu_path.into(),
            target_args,
            syscall_trace: true,
            block_trace: true,
        }
    }

    /// Enable or disable syscall reporting
    #[must_use]
    pub fn with_syscall_trace(mut self, enabled: bool) -> Self {
        self.syscall_trace = enabled;
        self
    }

    /// Enable or disable block reporting
    #[must_use]
    pub fn with_block_trace(mut self, enabled: bool) -> Self {
        self.block_trace = enabled;
        self
    }

    fn log_options(&self) -> String {
        let mut options = Vec::new();
        if self.syscall_trace {
            options.push("strace");
        }
        if self.block_trace {
            options.push("exec");
        }
        options.join(",")
    }
}

/// A syscall entry whose result tail has not been consumed yet
struct PendingSyscall {
    name: String,
    args: Vec<String>,
}

/// QEMU-backed substrate instance.
///
/// The child is spawned with `kill_on_drop`, so the process is reaped on
/// every exit path; [`Substrate::shutdown`] performs the orderly teardown.
pub struct QemuSubstrate {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    log: pipe::Receiver,
    // Held open so `/proc/<pid>/fd/<w>` stays valid for the child's writes.
    _log_writer: pipe::Sender,
    parser: LogParser,
    pending: Option<PendingSyscall>,
    tcp_read: HashMap<String, OwnedReadHalf>,
    tcp_write: HashMap<String, tokio::net::tcp::OwnedWriteHalf>,
    maps: Option<String>,
    exited: bool,
}

impl QemuSubstrate {
    /// Launch the target under instrumentation.
    ///
    /// # Errors
    ///
    /// Returns an error if the log pipe or the child process cannot be
    /// created.
    pub fn launch(config: &QemuConfig) -> CoreResult<Self> {
        let (log_writer, log_reader) = pipe::pipe()?;
        let log_path = format!(
            "/proc/{}/fd/{}",
            std::process::id(),
            log_writer.as_raw_fd()
        );

        let mut child = Command::new(&config.qemu_path)
            .arg("-d")
            .arg(config.log_options())
            .arg("-D")
            .arg(&log_path)
            .arg("--")
            .args(&config.target_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let maps = child
            .id()
            .and_then(|pid| std::fs::read_to_string(format!("/proc/{}/maps", pid)).ok());

        debug!(target = ?config.target_args.first(), pid = child.id(), "substrate launched");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            log: log_reader,
            _log_writer: log_writer,
            parser: LogParser::new(),
            pending: None,
            tcp_read: HashMap::new(),
            tcp_write: HashMap::new(),
            maps,
            exited: false,
        })
    }

    /// Attach a connected socket as a virtual channel (network targets).
    pub fn register_tcp_channel(&mut self, channel: impl Into<String>, stream: tokio::net::TcpStream) {
        let (read, write) = stream.into_split();
        let channel = channel.into();
        self.tcp_read.insert(channel.clone(), read);
        self.tcp_write.insert(channel, write);
    }

    fn parse_ready(&mut self) -> CoreResult<Option<SubstrateEvent>> {
        if let Some(pending) = self.pending.take() {
            match self.parser.try_result()? {
                Some(LogItem::SyscallResult { result }) => {
                    return Ok(Some(SubstrateEvent::SyscallFinish {
                        name: pending.name,
                        args: pending.args,
                        result,
                    }));
                }
                _ => {
                    self.pending = Some(pending);
                    return Ok(None);
                }
            }
        }

        match self.parser.try_event()? {
            Some(LogItem::Block { addr }) => Ok(Some(SubstrateEvent::ExecBlock { addr })),
            Some(LogItem::SyscallEntry { name, args, .. }) => {
                // Exit-family syscalls never produce a result tail.
                if !name.contains("exit") {
                    self.pending = Some(PendingSyscall {
                        name: name.clone(),
                        args: args.clone(),
                    });
                }
                Ok(Some(SubstrateEvent::SyscallStart { name, args }))
            }
            Some(LogItem::SyscallResult { .. }) | None => Ok(None),
        }
    }

    /// Drain whatever log bytes remain after the child has exited.
    fn drain_log(&mut self) {
        let mut chunk = [0u8; 4096];
        while let Ok(n) = self.log.try_read(&mut chunk) {
            if n == 0 {
                break;
            }
            self.parser.feed(&chunk[..n]);
        }
    }
}

#[async_trait]
impl Substrate for QemuSubstrate {
    async fn next_event(&mut self) -> CoreResult<Option<SubstrateEvent>> {
        loop {
            if let Some(event) = self.parse_ready()? {
                return Ok(Some(event));
            }
            if self.exited {
                return Ok(None);
            }

            let mut chunk = [0u8; 4096];
            tokio::select! {
                read = self.log.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        self.exited = true;
                    } else {
                        self.parser.feed(&chunk[..n]);
                    }
                }
                status = self.child.wait() => {
                    debug!(?status, "target exited");
                    self.exited = true;
                    self.drain_log();
                }
            }
        }
    }

    async fn write_channel(&mut self, channel: &str, data: &[u8]) -> CoreResult<()> {
        match channel {
            CHANNEL_STDIO => {
                let stdin = self.stdin.as_mut().ok_or_else(|| closed(channel))?;
                stdin.write_all(data).await?;
                stdin.flush().await?;
                Ok(())
            }
            _ => {
                let write = self.tcp_write.get_mut(channel).ok_or_else(|| closed(channel))?;
                write.write_all(data).await?;
                Ok(())
            }
        }
    }

    async fn read_channel(&mut self, channel: &str, len: usize) -> CoreResult<Vec<u8>> {
        let mut data = vec![0u8; len];
        match channel {
            CHANNEL_STDIO => {
                let stdout = self.stdout.as_mut().ok_or_else(|| closed(channel))?;
                stdout.read_exact(&mut data).await?;
            }
            CHANNEL_STDERR => {
                let stderr = self.stderr.as_mut().ok_or_else(|| closed(channel))?;
                stderr.read_exact(&mut data).await?;
            }
            _ => {
                let read = self.tcp_read.get_mut(channel).ok_or_else(|| closed(channel))?;
                read.read_exact(&mut data).await?;
            }
        }
        Ok(data)
    }

    async fn close_channel(&mut self, channel: &str) -> CoreResult<()> {
        match channel {
            CHANNEL_STDIO => {
                // Dropping the handle closes the write side (EOF for the target).
                self.stdin.take();
                Ok(())
            }
            _ => {
                self.tcp_write.remove(channel);
                Ok(())
            }
        }
    }

    async fn shutdown(&mut self) -> CoreResult<()> {
        if let Err(err) = self.child.start_kill() {
            // Already gone is fine; anything else is worth a trace.
            if err.kind() != std::io::ErrorKind::InvalidInput {
                warn!(%err, "substrate kill failed");
            }
        }
        let _ = self.child.wait().await;
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
        self.tcp_read.clear();
        self.tcp_write.clear();
        self.exited = true;
        Ok(())
    }

    fn maps(&self) -> Option<String> {
        self.maps.clone()
    }
}

fn closed(channel: &str) -> CoreError {
    CoreError::Closed {
        endpoint: channel.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_log_options() {
        let config = QemuConfig::new("/usr/bin/qemu-x86_64", vec!["/bin/cat".to_string()]);
        assert_eq!(config.log_options(), "strace,exec");

        let config = config.with_block_trace(false);
        assert_eq!(config.log_options(), "strace");

        let config = config.with_syscall_trace(false);
        assert_eq!(config.log_options(), "");
    }

    #[test]
    fn test_config_builder_keeps_args() {
        let config = QemuConfig::new("qemu", vec!["/bin/echo".to_string(), "hi".to_string()])
            .with_block_trace(true);
        assert_eq!(config.target_args.len(), 2);
        assert!(config.block_trace);
    }
}
