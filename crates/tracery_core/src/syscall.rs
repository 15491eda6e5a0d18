//! Syscall records.

use serde::{Deserialize, Serialize};

/// Syscall names that always start a new partition cluster
const BOUNDARY_SYSCALLS: &[&str] = &["execve", "exit", "exit_group", "signal"];

/// One observed syscall with its arguments and (eventual) result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRecord {
    /// Syscall name as reported by the substrate
    pub name: String,
    /// Ordered raw textual arguments
    pub args: Vec<String>,
    /// Return value; `None` until the syscall completes
    pub result: Option<i64>,
    /// Basic-block counter at the moment of the syscall
    pub trace_index: usize,
}

impl SyscallRecord {
    /// Create a record for a syscall that has started but not finished
    #[must_use]
    pub fn started(name: impl Into<String>, args: Vec<String>, trace_index: usize) -> Self {
        Self {
            name: name.into(),
            args,
            result: None,
            trace_index,
        }
    }

    /// Synthesize the `execve` record for process launch.
    ///
    /// Recorded logically before block index 0, with
    /// `args = (argv[0], argv, {})`, each argument JSON-encoded.
    #[must_use]
    pub fn synthetic_execve(argv: &[String]) -> Self {
        let argv0 = argv.first().cloned().unwrap_or_default();
        let args = vec![
            serde_json::to_string(&argv0).unwrap_or_default(),
            serde_json::to_string(argv).unwrap_or_default(),
            "{}".to_string(),
        ];
        Self::started("execve", args, 0)
    }

    /// Whether replaying `name`, `args`, and `trace_index` matches exactly
    #[must_use]
    pub fn matches_entry(&self, name: &str, args: &[String], trace_index: usize) -> bool {
        self.name == name && self.args == args && self.trace_index == trace_index
    }

    /// Whether this syscall forces a cluster boundary during partitioning
    #[must_use]
    pub fn is_boundary(&self) -> bool {
        BOUNDARY_SYSCALLS.contains(&self.name.as_str())
    }

    /// Whether this syscall terminates the target process
    #[must_use]
    pub fn is_exit(&self) -> bool {
        self.name.contains("exit")
    }
}
