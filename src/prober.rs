use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::fifo::ReportPipe;
use crate::report::NO_ACTIVE_PROCESSES_SENTINEL;
use crate::state::TreeState;

pub fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Periodic rescue for children that die without an exit record. Idle until
/// the root has exited; from then on every tick reaps PIDs that are gone
/// from /proc or have broken away, and survivors that outlive the root by
/// more than the per-child timeout are killed outright.
pub async fn run_prober(
    state: Arc<TreeState>,
    primary: Arc<ReportPipe>,
    cadence: Duration,
    child_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut root_exit_seen: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("prober cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        if !state.root_exited() {
            continue;
        }
        if state.is_empty() {
            return;
        }
        let first_seen = *root_exit_seen.get_or_insert_with(Instant::now);

        if state.sweep_dead(pid_alive) {
            trace!("prober emptied the active set");
            primary.write_sentinel(NO_ACTIVE_PROCESSES_SENTINEL);
            return;
        }

        if first_seen.elapsed() >= child_timeout {
            let survivors = state.survivors();
            if !survivors.is_empty() {
                warn!(?survivors, "killing processes that outlived the root");
                state.mark_killed_survivors();
                for pid in survivors {
                    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        trace!(pid, ?err, "survivor kill failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_lookup() {
        assert!(pid_alive(std::process::id()));
        // pid_max on Linux defaults to 1<<22; this one cannot exist
        assert!(!pid_alive(4_194_305));
    }
}
