//! Trace workers.
//!
//! A worker owns no shared state: it pops a trace request off the work list,
//! launches a fresh substrate, drives the replay-extend engine under a
//! wall-clock budget, and publishes the outcome on the matching result
//! channel. Workers scale horizontally; ordering is the tree service's
//! problem, not theirs.

use crate::Launcher;
use std::sync::Arc;
use std::time::Duration;
use tracery_core::{CoreResult, FlatTrace, NodeId};
use tracery_proto::{result_channel, Bus, TraceRequest, TraceResult};
use tracery_replay::{ReplayEngine, RunOutcome};
use tracery_substrate::Substrate;
use tracing::{info, warn};
use uuid::Uuid;

/// Default per-run wall-clock budget
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Target argument vector (argv[0] first)
    pub target_args: Vec<String>,
    /// Wall-clock budget per run
    pub timeout: Duration,
}

impl WorkerConfig {
    /// Create a config for a target argument vector
    #[must_use]
    pub fn new(target_args: Vec<String>) -> Self {
        Self {
            target_args,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-run wall-clock budget
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One trace worker
pub struct TraceWorker<L: Launcher, B: Bus> {
    id: Uuid,
    bus: Arc<B>,
    launcher: L,
    config: WorkerConfig,
}

impl<L: Launcher, B: Bus> TraceWorker<L, B> {
    /// Create a worker over a bus and a substrate launcher
    #[must_use]
    pub fn new(bus: Arc<B>, launcher: L, config: WorkerConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            bus,
            launcher,
            config,
        }
    }

    /// Consume the work list until it closes.
    ///
    /// A failed run is logged and published as an error result; it never
    /// stops the worker.
    ///
    /// # Errors
    ///
    /// Propagates bus errors only.
    pub async fn run(&self) -> CoreResult<()> {
        info!(worker = %self.id, "worker online");
        while let Some(request) = self.bus.pop_work().await? {
            if let Err(err) = self.process(request).await {
                warn!(worker = %self.id, %err, "trace run failed");
            }
        }
        info!(worker = %self.id, "work list closed");
        Ok(())
    }

    /// Run one trace request end to end and publish its result.
    ///
    /// The substrate is torn down on every path, including timeout.
    ///
    /// # Errors
    ///
    /// Propagates bus and serialization errors; substrate faults become
    /// error results instead.
    pub async fn process(&self, request: TraceRequest) -> CoreResult<()> {
        let TraceRequest { node_id, trace } = request;
        let mut substrate = match self.launcher.launch(&self.config.target_args).await {
            Ok(substrate) => substrate,
            Err(err) => {
                warn!(worker = %self.id, node = %node_id, %err, "substrate launch failed");
                return self
                    .publish(node_id, trace, &RunOutcome::Errored(err.to_string()))
                    .await;
            }
        };
        let mut engine = ReplayEngine::new(self.config.target_args.clone(), trace)?;

        let outcome = match tokio::time::timeout(self.config.timeout, engine.run(&mut substrate))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(worker = %self.id, node = %node_id, "run exceeded wall-clock budget");
                RunOutcome::TimedOut
            }
        };

        let maps = substrate.maps();
        if let Err(err) = substrate.shutdown().await {
            warn!(worker = %self.id, %err, "substrate teardown failed");
        }

        self.publish(node_id, engine.into_trace(maps), &outcome).await
    }

    async fn publish(
        &self,
        node_id: NodeId,
        trace: FlatTrace,
        outcome: &RunOutcome,
    ) -> CoreResult<()> {
        let kind = outcome.kind();
        let result = TraceResult::new(node_id, trace, outcome.annotation());
        self.bus
            .publish(&result_channel(kind), serde_json::to_value(&result)?)
            .await?;
        info!(worker = %self.id, node = %node_id, kind, "trace result published");
        Ok(())
    }
}
