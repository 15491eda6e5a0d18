//! TRACERY workers and tree service.
//!
//! Ties the pieces together: workers pop trace requests, run the target
//! under the substrate with the replay-extend engine, and publish results;
//! the tree service is the single consumer that folds those results into the
//! execution tree.

#![warn(clippy::all)]

pub mod service;
pub mod worker;

pub use service::TreeService;
pub use worker::{TraceWorker, WorkerConfig, DEFAULT_TIMEOUT};

use async_trait::async_trait;
use tracery_core::CoreResult;
use tracery_substrate::qemu::{QemuConfig, QemuSubstrate};
use tracery_substrate::Substrate;

/// Factory producing a fresh substrate instance per run
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Substrate type this launcher produces
    type Instance: Substrate;

    /// Launch the target under instrumentation.
    async fn launch(&self, target_args: &[String]) -> CoreResult<Self::Instance>;
}

/// Launcher for the QEMU user-mode substrate
pub struct QemuLauncher {
    qemu_path: String,
}

impl QemuLauncher {
    /// Create a launcher for a qemu user-mode binary
    #[must_use]
    pub fn new(qemu_path: impl Into<String>) -> Self {
        Self {
            qemu_path: qemu_path.into(),
        }
    }
}

#[async_trait]
impl Launcher for QemuLauncher {
    type Instance = QemuSubstrate;

    async fn launch(&self, target_args: &[String]) -> CoreResult<QemuSubstrate> {
        QemuSubstrate::launch(&QemuConfig::new(&self.qemu_path, target_args.to_vec()))
    }
}
