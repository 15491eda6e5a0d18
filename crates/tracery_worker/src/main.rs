//! TRACERY
//!
//! Automated execution exploration: runs a target under an instrumented
//! substrate, replays recorded trace prefixes, and partitions the traces
//! into a persistent execution tree.

#![warn(missing_docs)]
#![warn(clippy::all)]

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracery_proto::MemoryBus;
use tracery_tree::{KvStore, MemoryKv, NodeRepository, RedbKv, TreeBuilder};
use tracery_worker::{QemuLauncher, TraceWorker, TreeService, WorkerConfig};
use tracing::error;

#[derive(Parser)]
#[command(name = "tracery")]
#[command(about = "Execution exploration under an instrumented substrate", long_about = None)]
struct Args {
    /// QEMU user-mode binary
    #[arg(short, long, default_value = "qemu-x86_64")]
    qemu: String,

    /// Tree database path; in-memory when omitted
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Number of concurrent trace workers
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Per-run wall-clock budget in seconds
    #[arg(short, long, default_value_t = 180)]
    timeout: u64,

    /// Target argument vector (argv[0] first)
    #[arg(trailing_var_arg = true, required = true)]
    target: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter("tracery=debug")
        .init();

    let store: Arc<dyn KvStore> = match &args.store {
        Some(path) => Arc::new(RedbKv::open(path)?),
        None => Arc::new(MemoryKv::new()),
    };
    let repo = NodeRepository::open(store)?;
    let bus = Arc::new(MemoryBus::new());

    let config = WorkerConfig::new(args.target.clone())
        .with_timeout(Duration::from_secs(args.timeout));
    for _ in 0..args.workers {
        let worker = TraceWorker::new(bus.clone(), QemuLauncher::new(&args.qemu), config.clone());
        tokio::spawn(async move {
            if let Err(err) = worker.run().await {
                error!(%err, "worker stopped");
            }
        });
    }

    let mut service = TreeService::new(TreeBuilder::new(repo), bus);
    service.run().await?;

    Ok(())
}
