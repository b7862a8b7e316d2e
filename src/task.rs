use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::manifest::{ManifestFlags, ScopePolicy};

fn default_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_child_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFlags {
    pub fail_unexpected: bool,
    pub break_on_unexpected: bool,
    pub report_file_accesses: bool,
    pub monitor_child_processes: bool,
    pub report_process_args: bool,
    pub enforce_policies_on_mkdir: bool,
    pub check_message_count: bool,
    /// Distributed-worker mode: allow-listed-but-not-cacheable accesses are
    /// escalated to violations with a distinguishing record.
    pub report_allowlisted: bool,
    pub use_secondary_pipe: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsafeFlags {
    pub ignore_create_file: bool,
    pub monitor_create_file: bool,
    pub ignore_set_file_info: bool,
}

/// Everything the engine hands over to run one task under the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: u64,
    pub hash: u64,
    /// Declaring value symbol; keys the allow-list.
    pub value_symbol: String,
    #[serde(default)]
    pub module_id: Option<u64>,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_child_timeout")]
    pub child_timeout: Duration,
    pub interposer_path: PathBuf,
    #[serde(default)]
    pub expected_outputs: Vec<PathBuf>,
    #[serde(default)]
    pub scopes: Vec<ScopePolicy>,
    #[serde(default)]
    pub flags: TaskFlags,
    #[serde(default)]
    pub unsafe_flags: UnsafeFlags,
    /// Allow-list image keys compare case-insensitively. OS-native default.
    #[serde(default = "default_image_case")]
    pub image_case_insensitive: bool,
    #[serde(default)]
    pub restricted_temp_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub debug_log: Option<PathBuf>,
}

fn default_image_case() -> bool {
    cfg!(windows)
}

impl TaskDescriptor {
    /// Admission-time checks. Anything wrong here must fail before launch,
    /// never mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(WardenError::config("task has no program"));
        }
        if self.value_symbol.is_empty() {
            return Err(WardenError::config("task has no value symbol"));
        }
        if self.timeout.is_zero() || self.child_timeout.is_zero() {
            return Err(WardenError::config("task timeout must be non-zero"));
        }
        Ok(())
    }

    pub fn manifest_flags(&self) -> ManifestFlags {
        let mut flags = ManifestFlags::empty();
        let mut set = |cond: bool, flag: ManifestFlags| {
            if cond {
                flags |= flag;
            }
        };
        set(
            self.flags.monitor_child_processes,
            ManifestFlags::MONITOR_CHILD_PROCESSES,
        );
        set(
            self.flags.report_file_accesses,
            ManifestFlags::REPORT_FILE_ACCESSES,
        );
        set(
            self.flags.report_process_args,
            ManifestFlags::REPORT_PROCESS_ARGS,
        );
        set(self.flags.fail_unexpected, ManifestFlags::FAIL_UNEXPECTED);
        set(
            self.flags.break_on_unexpected,
            ManifestFlags::BREAK_ON_UNEXPECTED,
        );
        set(
            self.flags.enforce_policies_on_mkdir,
            ManifestFlags::ENFORCE_POLICIES_ON_MKDIR,
        );
        set(
            self.flags.check_message_count,
            ManifestFlags::CHECK_MESSAGE_COUNT,
        );
        flags
    }

    /// Prober cadence: one second, or the per-child timeout if that is
    /// shorter.
    pub fn probe_cadence(&self) -> Duration {
        self.child_timeout.min(Duration::from_secs(1))
    }
}

/// Final classification of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Succeeded,
    ExecutionFailed,
    /// Descendants survived the root and had to be killed.
    Killed,
    TimedOut,
    Canceled,
    OutputMissing,
    PreparationFailed,
    MismatchedMessageCount,
    DetouringFailure,
}
