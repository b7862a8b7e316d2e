use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, trace, warn};

use crate::allowlist::AllowList;
use crate::cache::PathAccessCache;
use crate::classify::{Classifier, ClassifiedOutcome};
use crate::error::WardenError;
use crate::fifo::{PipeId, ReportPipe};
use crate::reader::{CloseReason, PipeEvent, PipeEventKind};
use crate::report::{
    AccessFlags, FileAccessStatus, Operation, Report, ReportedAccess, END_OF_REPORTS_SENTINEL,
    NO_ACTIVE_PROCESSES_SENTINEL,
};
use crate::state::TreeState;

/// What the dispatcher knows when it stops draining.
pub struct DispatchReport {
    pub classified: ClassifiedOutcome,
    pub received_records: u64,
    pub acked_records: Option<u64>,
    pub pipe_failure: Option<WardenError>,
    /// Every pipe reached its termination boundary (sentinel or EOF).
    pub completed: bool,
}

impl DispatchReport {
    /// Stand-in result when the grace period expires before the pump drains.
    pub fn interrupted() -> Self {
        Self {
            classified: ClassifiedOutcome::default(),
            received_records: 0,
            acked_records: None,
            pipe_failure: None,
            completed: false,
        }
    }
}

/// Single consumer of both readers' events, in arrival order. All mutable
/// per-task state (active set, cache, classifier) is owned here; only the
/// prober shares the tree state.
pub struct Dispatcher {
    state: Arc<TreeState>,
    allowlist: Arc<AllowList>,
    classifier: Classifier,
    cache: PathAccessCache,
    primary: Arc<ReportPipe>,
    secondary: Option<Arc<ReportPipe>>,
    access_sink: Option<UnboundedSender<ReportedAccess>>,
    value_symbol: String,
    module_id: Option<u64>,
    root_image: PathBuf,
    /// pid → last exec'd image, for allow-list lookups.
    images: HashMap<u32, PathBuf>,
    saw_ptrace: bool,
    received: u64,
    acked: Option<u64>,
    pipe_failure: Option<WardenError>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<TreeState>,
        allowlist: Arc<AllowList>,
        classifier: Classifier,
        primary: Arc<ReportPipe>,
        secondary: Option<Arc<ReportPipe>>,
        access_sink: Option<UnboundedSender<ReportedAccess>>,
        value_symbol: String,
        module_id: Option<u64>,
        root_image: PathBuf,
    ) -> Self {
        Self {
            state,
            allowlist,
            classifier,
            cache: PathAccessCache::new(),
            primary,
            secondary,
            access_sink,
            value_symbol,
            module_id,
            root_image,
            images: HashMap::new(),
            saw_ptrace: false,
            received: 0,
            acked: None,
            pipe_failure: None,
        }
    }

    pub async fn run(mut self, mut rx: UnboundedReceiver<PipeEvent>) -> DispatchReport {
        let mut primary_open = true;
        let mut secondary_open = self.secondary.is_some();

        while let Some(event) = rx.recv().await {
            match event.kind {
                PipeEventKind::Report(report) => {
                    self.received += 1;
                    match report {
                        Report::FileAccess(access) => self.on_access(access),
                        Report::Debug { pid, text } => trace!(pid, %text, "sandbox debug"),
                    }
                }
                PipeEventKind::NoActiveProcesses => self.on_marker(event.pipe),
                PipeEventKind::Closed(reason) => {
                    match reason {
                        CloseReason::EndOfReports => trace!(pipe = ?event.pipe, "pipe drained"),
                        CloseReason::Eof => debug!(pipe = ?event.pipe, "pipe hit eof"),
                        CloseReason::Failed(err) => {
                            error!(pipe = ?event.pipe, %err, "pipe failed");
                            self.pipe_failure.get_or_insert(err);
                        }
                    }
                    match event.pipe {
                        PipeId::Primary => {
                            primary_open = false;
                            // primary is terminal: start the secondary drain
                            if secondary_open {
                                if let Some(secondary) = &self.secondary {
                                    secondary.write_sentinel(NO_ACTIVE_PROCESSES_SENTINEL);
                                }
                            }
                        }
                        PipeId::Secondary => secondary_open = false,
                    }
                    if !primary_open && !secondary_open {
                        break;
                    }
                }
            }
        }

        DispatchReport {
            classified: self.classifier.finish(),
            received_records: self.received,
            acked_records: self.acked,
            pipe_failure: self.pipe_failure,
            completed: !primary_open && !secondary_open,
        }
    }

    /// A dequeued no-active-processes marker. On the primary it only counts
    /// if the set is still empty: the pipe's FIFO ordering then witnesses
    /// that no start event was in flight ahead of it. The secondary carries
    /// no start events, so its marker is always final.
    fn on_marker(&mut self, pipe: PipeId) {
        match pipe {
            PipeId::Primary => {
                if self.state.is_empty() {
                    self.primary.write_sentinel(END_OF_REPORTS_SENTINEL);
                } else {
                    trace!("active set refilled before the marker; drain voided");
                    self.state.rearm_drain();
                }
            }
            PipeId::Secondary => {
                if let Some(secondary) = &self.secondary {
                    secondary.write_sentinel(END_OF_REPORTS_SENTINEL);
                }
            }
        }
    }

    fn is_fifo_path(&self, path: &str) -> bool {
        let path = Path::new(path);
        path == self.primary.path()
            || self.secondary.as_ref().is_some_and(|s| path == s.path())
    }

    fn on_access(&mut self, access: ReportedAccess) {
        // self-observations of the report pipe from the ptrace attach race
        if self.saw_ptrace && self.is_fifo_path(&access.path) {
            trace!(pid = access.pid, "dropped report-pipe self-observation");
            return;
        }
        if access.path.starts_with("/memfd:") {
            return;
        }

        match access.operation {
            Operation::Process => {
                trace!(pid = access.pid, ppid = access.ppid, "process started");
                self.state.on_start(access.pid);
            }
            Operation::ProcessExec => {
                if !access.path.is_empty() {
                    self.images.insert(access.pid, PathBuf::from(&access.path));
                }
            }
            Operation::ProcessExit => {
                trace!(pid = access.pid, "process exited");
                if self.state.on_exit(access.pid) {
                    self.primary.write_sentinel(NO_ACTIVE_PROCESSES_SENTINEL);
                }
            }
            Operation::ProcessBreakaway => {
                debug!(pid = access.pid, "process broke away");
                self.state.on_breakaway(access.pid);
            }
            Operation::ProcessTreeCompletedAck => {
                // the path field carries the interposer's sent-record count
                match access.path.parse::<u64>() {
                    // the ack itself is not part of the counted stream
                    Ok(sent) => self.acked = Some(sent),
                    Err(_) => warn!(count = %access.path, "unparsable ack record count"),
                }
                self.received -= 1;
            }
            Operation::ProcessRequiresPtrace => {
                debug!(pid = access.pid, "ptrace runner requested");
                self.saw_ptrace = true;
            }
            _ => self.on_file_access(access),
        }
    }

    fn on_file_access(&mut self, access: ReportedAccess) {
        // the interposer may have narrowed a read/write request to read-only;
        // surfaced as a warning only, no counter moves
        if access.status == FileAccessStatus::CannotDeterminePolicy
            && access.requested.contains(AccessFlags::WRITE)
        {
            warn!(
                pid = access.pid,
                path = %access.path,
                "write access under undeterminable policy"
            );
        }

        if !self.cache.admit(&access.path, access.requested) {
            return;
        }

        let image = self
            .images
            .get(&access.pid)
            .unwrap_or(&self.root_image)
            .clone();
        let verdict =
            self.allowlist
                .matches(&self.value_symbol, self.module_id, &image, &access.path);
        self.classifier.classify(&access, verdict);

        if let Some(sink) = &self.access_sink {
            let _ = sink.send(access);
        }
    }
}
