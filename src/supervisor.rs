use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::allowlist::{AllowList, MatchStrength};
use crate::classify::{Classifier, ClassifierConfig, OutcomeCounters};
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{Result, WardenError};
use crate::fifo::{PipeId, ReportPipe};
use crate::manifest::{
    Manifest, ENV_DEBUG_LOG_PATH, ENV_INTERPOSER_PATH, ENV_LD_PRELOAD, ENV_MANIFEST_PATH,
    ENV_ROOT_PID,
};
use crate::prober::run_prober;
use crate::reader::run_reader;
use crate::report::ReportedAccess;
use crate::state::TreeState;
use crate::task::{TaskDescriptor, TaskOutcome};

const LAUNCH_RETRY_LIMIT: u32 = 5;
const TEARDOWN_GRACE: Duration = Duration::from_secs(60);
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(5);

static TASK_NODE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Everything the engine gets back for one task.
#[derive(Debug)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    pub exit_code: Option<i32>,
    pub counters: OutcomeCounters,
    pub violations: Vec<ReportedAccess>,
    pub allowlisted: Vec<ReportedAccess>,
    /// Aggregate verdict per reported path, least permissive constituent.
    pub path_verdicts: BTreeMap<String, MatchStrength>,
    pub is_cacheable: bool,
    pub diagnostics: Vec<String>,
}

impl TaskResult {
    fn preparation_failed(err: WardenError) -> Self {
        Self {
            outcome: TaskOutcome::PreparationFailed,
            exit_code: None,
            counters: OutcomeCounters::default(),
            violations: Vec::new(),
            allowlisted: Vec::new(),
            path_verdicts: BTreeMap::new(),
            is_cacheable: false,
            diagnostics: vec![err.to_string()],
        }
    }
}

/// Per-task orchestrator: owns the FIFOs, the manifest, the readers, the
/// dispatcher and the prober, and decides when the process tree is truly
/// done.
pub struct Supervisor {
    task: TaskDescriptor,
    allowlist: Arc<AllowList>,
    primary: Arc<ReportPipe>,
    secondary: Option<Arc<ReportPipe>>,
    manifest_path: PathBuf,
    access_sink: Option<mpsc::UnboundedSender<ReportedAccess>>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(task: TaskDescriptor, allowlist: Arc<AllowList>) -> Result<Self> {
        task.validate()?;

        let unique = format!(
            "bxl_{}_{}_{}",
            std::process::id(),
            task.id,
            TASK_NODE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let tmp = std::env::temp_dir();
        let primary = Arc::new(ReportPipe::create(
            tmp.join(format!("{}.fifo", unique)),
            PipeId::Primary,
        )?);
        let secondary = if task.flags.use_secondary_pipe {
            Some(Arc::new(ReportPipe::create(
                tmp.join(format!("{}.fifo2", unique)),
                PipeId::Secondary,
            )?))
        } else {
            None
        };

        let manifest_path = tmp.join(format!("{}.fam", unique));
        let manifest = Manifest {
            task_id: task.id,
            debug: task.debug_log.is_some(),
            flags: task.manifest_flags(),
            report_path: primary.path().to_path_buf(),
            scopes: task.scopes.clone(),
        };
        manifest.write_file(&manifest_path).map_err(WardenError::Pipe)?;

        Ok(Self {
            task,
            allowlist,
            primary,
            secondary,
            manifest_path,
            access_sink: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Forwarded accesses (post-cache, pre-classification) are mirrored here
    /// for the engine.
    pub fn set_access_sink(&mut self, sink: mpsc::UnboundedSender<ReportedAccess>) {
        self.access_sink = Some(sink);
    }

    /// Handle for external cancellation (engine shutdown, user kill).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn report_path(&self) -> &Path {
        self.primary.path()
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Launch the child under the interposer and supervise it to completion.
    pub async fn run(mut self) -> TaskResult {
        let child = match self.launch().await {
            Ok(child) => child,
            Err(err) => {
                error!(%err, "launch failed");
                return TaskResult::preparation_failed(err);
            }
        };
        let Some(root_pid) = child.id() else {
            return TaskResult::preparation_failed(WardenError::launch(io::Error::other(
                "child exited before supervision began",
            )));
        };
        debug!(root_pid, program = %self.task.program.display(), "sandboxed process started");
        self.pump(root_pid, Some(child)).await
    }

    async fn launch(&self) -> Result<Child> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_launch() {
                Ok(child) => return Ok(child),
                Err(err) if err.is_transient_launch() && attempt < LAUNCH_RETRY_LIMIT => {
                    warn!(attempt, %err, "transient launch failure, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_launch(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.task.program);
        cmd.args(&self.task.args)
            .current_dir(&self.task.working_dir)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        for (key, value) in &self.task.env {
            cmd.env(key, value);
        }
        cmd.env(ENV_MANIFEST_PATH, &self.manifest_path);
        cmd.env(ENV_INTERPOSER_PATH, &self.task.interposer_path);
        // concatenate onto, never replace, a caller-supplied preload list
        let interposer = self.task.interposer_path.display().to_string();
        let preload = match self.task.env.get(ENV_LD_PRELOAD) {
            Some(existing) if !existing.is_empty() => format!("{}:{}", interposer, existing),
            _ => interposer,
        };
        cmd.env(ENV_LD_PRELOAD, preload);
        if let Some(log) = &self.task.debug_log {
            cmd.env(ENV_DEBUG_LOG_PATH, log);
        }

        let root_pid_key = CString::new(ENV_ROOT_PID)
            .map_err(|_| WardenError::config("root pid env name contains NUL"))?;
        unsafe {
            cmd.pre_exec(move || {
                // runs in the child, where the pid is finally known; no
                // allocation between fork and exec
                let mut buf = [0u8; 12];
                let mut pid = libc::getpid() as u32;
                let mut pos = buf.len() - 1;
                loop {
                    pos -= 1;
                    buf[pos] = b'0' + (pid % 10) as u8;
                    pid /= 10;
                    if pid == 0 {
                        break;
                    }
                }
                if libc::setenv(root_pid_key.as_ptr(), buf[pos..].as_ptr().cast(), 1) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn().map_err(WardenError::launch)
    }

    /// Drive the event pump for an already-running root until the process
    /// tree is done or the task is cancelled or times out.
    async fn pump(&mut self, root_pid: u32, child: Option<Child>) -> TaskResult {
        let had_child = child.is_some();
        let state = Arc::new(TreeState::new(root_pid));
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let pipe = self.primary.clone();
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || run_reader(pipe, tx));
        }
        if let Some(secondary) = &self.secondary {
            let pipe = secondary.clone();
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || run_reader(pipe, tx));
        }
        drop(tx);

        let classifier = Classifier::new(ClassifierConfig {
            report_allowlisted: self.task.flags.report_allowlisted,
            ignore_create_file: self.task.unsafe_flags.ignore_create_file,
            restricted_temp_dirs: self.task.restricted_temp_dirs.clone(),
        });
        let dispatcher = Dispatcher::new(
            state.clone(),
            self.allowlist.clone(),
            classifier,
            self.primary.clone(),
            self.secondary.clone(),
            self.access_sink.take(),
            self.task.value_symbol.clone(),
            self.task.module_id,
            self.task.program.clone(),
        );
        let mut dispatch_task = tokio::spawn(dispatcher.run(rx));

        let prober_cancel = self.cancel.child_token();
        tokio::spawn(run_prober(
            state.clone(),
            self.primary.clone(),
            self.task.probe_cadence(),
            self.task.child_timeout,
            prober_cancel.clone(),
        ));

        let mut exit_rx = None;
        if let Some(mut child) = child {
            let state = state.clone();
            let (etx, erx) = oneshot::channel();
            tokio::spawn(async move {
                let status = child.wait().await;
                state.note_root_exited();
                let _ = etx.send(status);
            });
            exit_rx = Some(erx);
        }

        let mut diagnostics = Vec::new();
        let mut cancelled = false;
        let mut timed_out = false;

        let report = tokio::select! {
            res = &mut dispatch_task => Some(res),
            _ = self.cancel.cancelled() => {
                cancelled = true;
                None
            }
            _ = tokio::time::sleep(self.task.timeout) => {
                timed_out = true;
                None
            }
        };

        let report = match report {
            Some(Ok(report)) => report,
            Some(Err(err)) => {
                diagnostics.push(format!("dispatcher failed: {}", err));
                DispatchReport::interrupted()
            }
            None => {
                // external teardown: kill the tree, unpark the writers so the
                // readers can reach EOF, then give the pump a bounded grace
                // period before forcing completion
                if timed_out {
                    warn!(root_pid, "task timed out; killing process tree");
                    diagnostics.push(WardenError::Timeout.to_string());
                } else {
                    debug!(root_pid, "task cancelled; killing process tree");
                    diagnostics.push(WardenError::Cancelled.to_string());
                }
                self.kill_tree(root_pid, &state, &mut diagnostics);
                prober_cancel.cancel();
                self.primary.close_parked_writer();
                if let Some(secondary) = &self.secondary {
                    secondary.close_parked_writer();
                }
                match tokio::time::timeout(TEARDOWN_GRACE, &mut dispatch_task).await {
                    Ok(Ok(report)) => report,
                    Ok(Err(err)) => {
                        diagnostics.push(format!("dispatcher failed: {}", err));
                        DispatchReport::interrupted()
                    }
                    Err(_) => {
                        warn!("teardown grace period expired; forcing completion");
                        dispatch_task.abort();
                        diagnostics.push("teardown grace period expired".to_string());
                        DispatchReport::interrupted()
                    }
                }
            }
        };
        prober_cancel.cancel();

        let exit_code = match exit_rx {
            Some(erx) => match tokio::time::timeout(EXIT_STATUS_WAIT, erx).await {
                Ok(Ok(Ok(status))) => status.code(),
                Ok(Ok(Err(err))) => {
                    diagnostics.push(format!("wait on root failed: {}", err));
                    None
                }
                _ => None,
            },
            None => None,
        };

        if let Some(err) = &report.pipe_failure {
            diagnostics.push(err.to_string());
        }
        let mismatched = self.task.flags.check_message_count
            && report
                .acked_records
                .is_some_and(|acked| acked != report.received_records);
        let missing_output = self
            .task
            .expected_outputs
            .iter()
            .any(|path| !path.exists());

        let outcome = if cancelled {
            TaskOutcome::Canceled
        } else if timed_out {
            TaskOutcome::TimedOut
        } else if report.pipe_failure.is_some() || !report.completed {
            TaskOutcome::DetouringFailure
        } else if mismatched {
            TaskOutcome::MismatchedMessageCount
        } else if state.killed_survivors() {
            TaskOutcome::Killed
        } else if had_child && exit_code != Some(0) {
            TaskOutcome::ExecutionFailed
        } else if missing_output {
            TaskOutcome::OutputMissing
        } else {
            TaskOutcome::Succeeded
        };

        let classified = report.classified;
        TaskResult {
            outcome,
            exit_code,
            is_cacheable: outcome == TaskOutcome::Succeeded
                && !classified.counters.has_uncacheable(),
            counters: classified.counters,
            violations: classified.violations,
            allowlisted: classified.allowlisted,
            path_verdicts: classified.path_verdicts,
            diagnostics,
        }
    }

    fn kill_tree(&self, root_pid: u32, state: &TreeState, diagnostics: &mut Vec<String>) {
        // whole process group first, then whatever the set still tracks
        let _ = kill(Pid::from_raw(-(root_pid as i32)), Signal::SIGKILL);
        if let Err(err) = kill(Pid::from_raw(root_pid as i32), Signal::SIGKILL) {
            if err != Errno::ESRCH {
                diagnostics.push(format!("failed to kill root {}: {}", root_pid, err));
            }
        }
        for pid in state.survivors() {
            if pid == root_pid {
                continue;
            }
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                if err != Errno::ESRCH {
                    diagnostics.push(format!("failed to kill {}: {}", pid, err));
                }
            }
        }
        state.note_root_exited();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // fifo nodes unlink themselves; the manifest and debug log are ours
        if let Err(err) = std::fs::remove_file(&self.manifest_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.manifest_path.display(), ?err, "failed to remove manifest");
            }
        }
        if let Some(log) = &self.task.debug_log {
            if let Err(err) = std::fs::remove_file(log) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %log.display(), ?err, "failed to remove debug log");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use super::*;
    use crate::report::AccessFlags;

    // a pid far above anything running, but below the default pid_max
    const DEAD_PID: u32 = 4_000_000;

    fn frame(payload: &str) -> Vec<u8> {
        let mut out = (payload.len() as i32).to_le_bytes().to_vec();
        out.extend_from_slice(payload.as_bytes());
        out
    }

    fn start(pid: u32) -> Vec<u8> {
        frame(&format!("0|clone|0|{}|1|0|0|0|0|0|", pid))
    }

    fn exit(pid: u32) -> Vec<u8> {
        frame(&format!("0|exit|2|{}|1|0|0|0|0|0|", pid))
    }

    fn write_access(pid: u32, path: &str) -> Vec<u8> {
        frame(&format!("0|open|13|{}|1|0|2|0|0|0|{}", pid, path))
    }

    fn read_access(pid: u32, path: &str) -> Vec<u8> {
        frame(&format!("0|open|12|{}|1|0|1|0|0|0|{}", pid, path))
    }

    fn task(dir: &Path) -> TaskDescriptor {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "hash": 1,
            "value_symbol": "Test",
            "program": "/bin/true",
            "working_dir": dir,
            "interposer_path": "/usr/lib/libinterpose.so",
            "child_timeout": { "secs": 0, "nanos": 100_000_000 },
        }))
        .unwrap()
    }

    fn supervisor(task: TaskDescriptor) -> Supervisor {
        Supervisor::new(task, Arc::new(AllowList::new(false))).unwrap()
    }

    fn spawn_writer(path: PathBuf, frames: Vec<Vec<u8>>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut w = OpenOptions::new().write(true).open(path).unwrap();
            for f in frames {
                w.write_all(&f).unwrap();
            }
        })
    }

    async fn pump(mut sup: Supervisor, root: u32) -> TaskResult {
        tokio::time::timeout(Duration::from_secs(10), sup.pump(root, None))
            .await
            .expect("pump did not terminate")
    }

    #[tokio::test]
    async fn clean_run_single_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(task(dir.path()));
        let (atx, mut arx) = mpsc::unbounded_channel();
        sup.set_access_sink(atx);

        let writer = spawn_writer(
            sup.report_path().to_path_buf(),
            vec![
                start(42),
                write_access(42, "/w/out1"),
                write_access(42, "/w/out1"),
                write_access(42, "/w/out1"),
                exit(42),
            ],
        );

        let result = pump(sup, 42).await;
        writer.join().unwrap();

        assert_eq!(result.outcome, TaskOutcome::Succeeded);
        // three writes to the same path surface exactly once
        assert_eq!(result.counters.violations, 1);
        assert_eq!(result.path_verdicts["/w/out1"], MatchStrength::NoMatch);
        let surfaced = arx.recv().await.unwrap();
        assert_eq!(surfaced.path, "/w/out1");
        assert_eq!(surfaced.requested, AccessFlags::WRITE);
        assert!(arx.recv().await.is_none());
    }

    #[tokio::test]
    async fn prober_rescues_missing_exit_event() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(task(dir.path()));

        // the child with DEAD_PID crashed without an exit record
        let writer = spawn_writer(
            sup.report_path().to_path_buf(),
            vec![start(DEAD_PID), exit(42)],
        );

        let result = pump(sup, 42).await;
        writer.join().unwrap();
        assert_eq!(result.outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn ptrace_self_observation_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(task(dir.path()));
        let (atx, mut arx) = mpsc::unbounded_channel();
        sup.set_access_sink(atx);

        let fifo = sup.report_path().to_string_lossy().to_string();
        let writer = spawn_writer(
            sup.report_path().to_path_buf(),
            vec![
                start(42),
                frame(&format!("0|ptrace|5|{}|1|0|0|0|0|0|", 42)),
                write_access(42, &fifo),
                read_access(42, "/real/input"),
                exit(42),
            ],
        );

        let result = pump(sup, 42).await;
        writer.join().unwrap();

        assert_eq!(result.outcome, TaskOutcome::Succeeded);
        let surfaced = arx.recv().await.unwrap();
        assert_eq!(surfaced.path, "/real/input");
        assert!(arx.recv().await.is_none());
        assert_eq!(result.counters.violations, 1);
    }

    #[tokio::test]
    async fn memfd_paths_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(task(dir.path()));
        let (atx, mut arx) = mpsc::unbounded_channel();
        sup.set_access_sink(atx);

        let writer = spawn_writer(
            sup.report_path().to_path_buf(),
            vec![
                start(42),
                write_access(42, "/memfd:jit-cache (deleted)"),
                exit(42),
            ],
        );

        let result = pump(sup, 42).await;
        writer.join().unwrap();
        assert_eq!(result.outcome, TaskOutcome::Succeeded);
        assert!(arx.recv().await.is_none());
        assert_eq!(result.counters.violations, 0);
    }

    #[tokio::test]
    async fn secondary_pipe_drains_after_primary() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = task(dir.path());
        desc.flags.use_secondary_pipe = true;
        let sup = supervisor(desc);

        let writer = spawn_writer(sup.report_path().to_path_buf(), vec![start(42), exit(42)]);

        let result = pump(sup, 42).await;
        writer.join().unwrap();
        assert_eq!(result.outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn cancellation_yields_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(task(dir.path()));
        let token = sup.cancellation_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        // nothing ever arrives; only cancellation can end this pump
        let result = pump(sup, DEAD_PID + 1).await;
        assert_eq!(result.outcome, TaskOutcome::Canceled);
        assert!(!result.is_cacheable);
    }

    #[tokio::test]
    async fn timeout_yields_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = task(dir.path());
        desc.timeout = Duration::from_millis(200);
        let sup = supervisor(desc);

        let result = pump(sup, DEAD_PID + 2).await;
        assert_eq!(result.outcome, TaskOutcome::TimedOut);
    }

    #[tokio::test]
    async fn message_count_mismatch_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = task(dir.path());
        desc.flags.check_message_count = true;
        let sup = supervisor(desc);

        let writer = spawn_writer(
            sup.report_path().to_path_buf(),
            vec![
                start(42),
                read_access(42, "/etc/hosts"),
                frame("0|ack|4|42|1|0|0|0|0|0|99"),
                exit(42),
            ],
        );

        let result = pump(sup, 42).await;
        writer.join().unwrap();
        assert_eq!(result.outcome, TaskOutcome::MismatchedMessageCount);
    }

    #[tokio::test]
    async fn matching_ack_count_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = task(dir.path());
        desc.flags.check_message_count = true;
        let sup = supervisor(desc);

        // start + read + exit = 3 counted records; the ack itself is not
        let writer = spawn_writer(
            sup.report_path().to_path_buf(),
            vec![
                start(42),
                read_access(42, "/etc/hosts"),
                frame("0|ack|4|42|1|0|0|0|0|0|3"),
                exit(42),
            ],
        );

        let result = pump(sup, 42).await;
        writer.join().unwrap();
        assert_eq!(result.outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn surviving_child_is_killed_and_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(task(dir.path()));

        // a real process that outlives the root and never reports an exit
        let mut straggler = std::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let straggler_pid = straggler.id();
        // reap it once the prober kills it, so /proc reflects the death
        let reaper = std::thread::spawn(move || {
            let _ = straggler.wait();
        });

        let writer = spawn_writer(
            sup.report_path().to_path_buf(),
            vec![start(straggler_pid), exit(42)],
        );

        let result = pump(sup, 42).await;
        writer.join().unwrap();
        reaper.join().unwrap();
        assert_eq!(result.outcome, TaskOutcome::Killed);
    }

    #[tokio::test]
    async fn missing_program_is_a_preparation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = task(dir.path());
        desc.program = PathBuf::from("/nonexistent/never-here");
        let sup = supervisor(desc);

        let result = sup.run().await;
        assert_eq!(result.outcome, TaskOutcome::PreparationFailed);
        assert!(!result.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn real_child_without_interposer_completes_via_prober() {
        let dir = tempfile::tempdir().unwrap();
        // /bin/true never opens the fifo; the prober notices the exit
        let result = tokio::time::timeout(Duration::from_secs(10), supervisor(task(dir.path())).run())
            .await
            .expect("run did not terminate");
        assert_eq!(result.outcome, TaskOutcome::Succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.is_cacheable);
    }

    #[tokio::test]
    async fn missing_expected_output_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = task(dir.path());
        desc.expected_outputs = vec![dir.path().join("never-written")];
        let sup = supervisor(desc);

        let writer = spawn_writer(sup.report_path().to_path_buf(), vec![start(42), exit(42)]);
        let result = pump(sup, 42).await;
        writer.join().unwrap();
        assert_eq!(result.outcome, TaskOutcome::OutputMissing);
    }
}
