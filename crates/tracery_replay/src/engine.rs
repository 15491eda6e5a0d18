//! Replay-extend engine.
//!
//! Drives one run of the target: every substrate event is dispatched through
//! the handler table and checked against (replay) or appended to (extend) the
//! tracing ledgers. The `execve` that launches the target is not observable
//! through the substrate, so it is synthesized as the first syscall of every
//! run, before block index 0.

use crate::channel::ChannelRouter;
use crate::dispatch::{DispatchTable, EventFilter, EventKind, HandlerAction};
use crate::ledger::Ledger;
use crate::{Desync, Fault, RunOutcome};
use tracery_core::{CoreError, CoreResult, Datapoint, FlatTrace, Interaction, SyscallRecord};
use tracery_substrate::{Substrate, SubstrateEvent};
use tracing::{debug, info};

/// One-run replay-extend engine over three tracing ledgers
pub struct ReplayEngine {
    target_args: Vec<String>,
    blocks: Ledger<u64>,
    syscalls: Ledger<SyscallRecord>,
    interactions: Ledger<Interaction>,
    router: ChannelRouter,
    table: DispatchTable,
    /// Root-only attributes carried through from the replayed prefix
    tracepoints: Vec<u64>,
    datapoints: Vec<Datapoint>,
}

impl ReplayEngine {
    /// Create an engine that replays `recorded` and then extends it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ParseError` if a built-in syscall filter fails to
    /// compile.
    pub fn new(target_args: Vec<String>, recorded: FlatTrace) -> CoreResult<Self> {
        let mut table = DispatchTable::new();
        table.register(
            EventKind::SyscallStart,
            EventFilter::syscall(".*")?,
            HandlerAction::RecordSyscallStart,
        );
        table.register(
            EventKind::SyscallFinish,
            EventFilter::syscall(".*")?,
            HandlerAction::RecordSyscallFinish,
        );
        table.register(EventKind::ExecBlock, EventFilter::AllBlocks, HandlerAction::RecordBlock);
        table.register(
            EventKind::SyscallStart,
            EventFilter::syscall("read|recv|recvfrom|recvmsg")?,
            HandlerAction::RouteReadStart,
        );
        table.register(
            EventKind::SyscallFinish,
            EventFilter::syscall("write|send|sendto|sendmsg")?,
            HandlerAction::RouteWriteFinish,
        );
        table.register(
            EventKind::SyscallFinish,
            EventFilter::syscall("accept|accept4|connect")?,
            HandlerAction::BindSocket,
        );
        table.register(
            EventKind::SyscallFinish,
            EventFilter::syscall("dup|dup2|dup3")?,
            HandlerAction::PropagateDup,
        );
        table.register(
            EventKind::SyscallFinish,
            EventFilter::syscall("close")?,
            HandlerAction::RetireFd,
        );

        Ok(Self {
            target_args,
            blocks: Ledger::new(recorded.basic_blocks),
            syscalls: Ledger::new(recorded.syscalls),
            interactions: Ledger::new(recorded.interactions),
            router: ChannelRouter::new(),
            table,
            tracepoints: recorded.tracepoints,
            datapoints: recorded.datapoints,
        })
    }

    /// Number of basic blocks observed so far; the current trace index
    #[must_use]
    pub fn trace_index(&self) -> usize {
        self.blocks.position()
    }

    /// Drive the target to an outcome.
    ///
    /// Replays the recorded prefix against live observations and extends
    /// past it. Returns as soon as the run blocks, desyncs, errs, or the
    /// target exits.
    pub async fn run<S: Substrate + ?Sized>(&mut self, substrate: &mut S) -> RunOutcome {
        if let Err(fault) = self.launch(substrate).await {
            return fault_outcome(fault);
        }
        loop {
            let event = match substrate.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    info!(trace_index = self.trace_index(), "event stream ended");
                    return RunOutcome::Completed;
                }
                Err(err) => return RunOutcome::Errored(err.to_string()),
            };
            for action in self.table.actions_for(&event) {
                if let Err(fault) = self.apply(substrate, action, &event).await {
                    return fault_outcome(fault);
                }
            }
            if let SubstrateEvent::SyscallStart { name, .. } = &event {
                if name.contains("exit") {
                    info!(syscall = name.as_str(), "target exiting");
                    return RunOutcome::Completed;
                }
            }
        }
    }

    /// Consume the engine into the full flat trace of the run
    #[must_use]
    pub fn into_trace(self, maps: Option<String>) -> FlatTrace {
        FlatTrace {
            tracepoints: self.tracepoints,
            basic_blocks: self.blocks.into_entries(),
            syscalls: self.syscalls.into_entries(),
            interactions: self.interactions.into_entries(),
            datapoints: self.datapoints,
            maps,
        }
    }

    /// Synthesize the launch `execve` through the regular dispatch path
    async fn launch<S: Substrate + ?Sized>(&mut self, substrate: &mut S) -> Result<(), Fault> {
        let record = SyscallRecord::synthetic_execve(&self.target_args);
        let start = SubstrateEvent::SyscallStart {
            name: record.name.clone(),
            args: record.args.clone(),
        };
        let finish = SubstrateEvent::SyscallFinish {
            name: record.name,
            args: record.args,
            result: None,
        };
        for event in [start, finish] {
            for action in self.table.actions_for(&event) {
                self.apply(substrate, action, &event).await?;
            }
        }
        Ok(())
    }

    async fn apply<S: Substrate + ?Sized>(
        &mut self,
        substrate: &mut S,
        action: HandlerAction,
        event: &SubstrateEvent,
    ) -> Result<(), Fault> {
        match (action, event) {
            (HandlerAction::RecordSyscallStart, SubstrateEvent::SyscallStart { name, args }) => {
                self.record_syscall_start(name, args)
            }
            (
                HandlerAction::RecordSyscallFinish,
                SubstrateEvent::SyscallFinish { result, .. },
            ) => self.record_syscall_finish(*result),
            (HandlerAction::RecordBlock, SubstrateEvent::ExecBlock { addr }) => {
                self.record_block(*addr)
            }
            (HandlerAction::RouteReadStart, SubstrateEvent::SyscallStart { name, args }) => {
                let trace_index = self.blocks.position();
                self.router
                    .read_start(substrate, &mut self.interactions, name, args, trace_index)
                    .await
            }
            (
                HandlerAction::RouteWriteFinish,
                SubstrateEvent::SyscallFinish { args, result, .. },
            ) => {
                let trace_index = self.blocks.position();
                self.router
                    .write_finish(substrate, &mut self.interactions, *result, trace_index, args)
                    .await
            }
            (
                HandlerAction::BindSocket,
                SubstrateEvent::SyscallFinish { name, args, result },
            ) => {
                self.bind_socket(name, args, *result);
                Ok(())
            }
            (
                HandlerAction::PropagateDup,
                SubstrateEvent::SyscallFinish { args, result, .. },
            ) => {
                if let (Some(old_fd), Some(new_fd)) = (parse_fd(args), result.filter(|&n| n >= 0))
                {
                    self.router.propagate(old_fd, new_fd);
                }
                Ok(())
            }
            (HandlerAction::RetireFd, SubstrateEvent::SyscallFinish { args, .. }) => {
                if let Some(fd) = parse_fd(args) {
                    self.router.retire(fd);
                }
                Ok(())
            }
            // Kind and filter guarantee the pairing; anything else is inert.
            _ => Ok(()),
        }
    }

    fn record_syscall_start(&mut self, name: &str, args: &[String]) -> Result<(), Fault> {
        let trace_index = self.blocks.position();
        if self.syscalls.in_replay() {
            let recorded = self.syscalls.current().ok_or_else(cursor_error)?;
            if !recorded.matches_entry(name, args, trace_index) {
                return Err(Fault::Desync(Desync {
                    expected: format_entry(recorded),
                    received: format!("{}({}) @ {}", name, args.join(","), trace_index),
                    what: "syscall entry replay".to_string(),
                }));
            }
            debug!(syscall = name, trace_index, "syscall entry replayed");
        } else {
            self.syscalls.push(SyscallRecord::started(name, args.to_vec(), trace_index));
        }
        Ok(())
    }

    fn record_syscall_finish(&mut self, result: Option<i64>) -> Result<(), Fault> {
        // The cursor sits on the syscall whose entry was just checked or
        // pushed. A result already known from the record must reproduce; a
        // result not yet known (a previously blocked syscall) is set now.
        let in_replay = self.syscalls.in_replay();
        let record = self.syscalls.current_mut().ok_or_else(cursor_error)?;
        if in_replay {
            if let (Some(recorded), Some(observed)) = (record.result, result) {
                if recorded != observed {
                    return Err(Fault::Desync(Desync {
                        expected: recorded.to_string(),
                        received: observed.to_string(),
                        what: format!("result of {} @ {}", record.name, record.trace_index),
                    }));
                }
            }
            if record.result.is_none() {
                record.result = result;
            }
        } else {
            record.result = result;
        }
        self.syscalls.advance();
        Ok(())
    }

    fn record_block(&mut self, addr: u64) -> Result<(), Fault> {
        if self.blocks.in_replay() {
            let recorded = *self.blocks.current().ok_or_else(cursor_error)?;
            if recorded != addr {
                return Err(Fault::Desync(Desync {
                    expected: format!("{:#x}", recorded),
                    received: format!("{:#x}", addr),
                    what: format!("basic block replay @ {}", self.blocks.position()),
                }));
            }
        } else {
            self.blocks.push(addr);
        }
        self.blocks.advance();
        Ok(())
    }

    fn bind_socket(&mut self, name: &str, args: &[String], result: Option<i64>) {
        match name {
            // accept returns the connected fd
            "accept" | "accept4" => {
                if let Some(fd) = result.filter(|&n| n >= 0) {
                    self.router.bind_socket(fd);
                }
            }
            // connect succeeds in place on the fd it was given
            "connect" => {
                if result == Some(0) {
                    if let Some(fd) = parse_fd(args) {
                        self.router.bind_socket(fd);
                    }
                }
            }
            _ => {}
        }
    }
}

fn parse_fd(args: &[String]) -> Option<i64> {
    args.first()?.trim().parse().ok()
}

fn format_entry(record: &SyscallRecord) -> String {
    format!("{}({}) @ {}", record.name, record.args.join(","), record.trace_index)
}

fn fault_outcome(fault: Fault) -> RunOutcome {
    match fault {
        Fault::Block(point) => RunOutcome::Blocked(point),
        Fault::Desync(desync) => RunOutcome::Desynced(desync),
        Fault::Error(err) => RunOutcome::Errored(err.to_string()),
    }
}

fn cursor_error() -> Fault {
    Fault::Error(CoreError::Internal {
        message: "syscall ledger cursor out of step".to_string(),
    })
}
