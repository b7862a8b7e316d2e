use std::collections::HashSet;
use std::sync::Mutex;

/// Live view of the sandboxed process tree, shared between the dispatcher
/// and the liveness prober.
///
/// The task is terminal iff the active set is empty and the readers have
/// drained every message sent up to that point; emptiness transitions are
/// witnessed here exactly once per drain attempt (`drain_started`), so the
/// dispatcher and the prober cannot both emit the teardown sentinel.
pub struct TreeState {
    root: u32,
    inner: Mutex<Inner>,
}

struct Inner {
    active: HashSet<u32>,
    breakaway: HashSet<u32>,
    root_exited: bool,
    drain_started: bool,
    killed_survivors: bool,
}

impl TreeState {
    pub fn new(root: u32) -> Self {
        let mut active = HashSet::new();
        active.insert(root);
        Self {
            root,
            inner: Mutex::new(Inner {
                active,
                breakaway: HashSet::new(),
                root_exited: false,
                drain_started: false,
                killed_survivors: false,
            }),
        }
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// A clone/fork report. If the PID was marked breakaway, the number has
    /// been reused by a new process and the breakaway entry is stale.
    pub fn on_start(&self, pid: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.insert(pid);
        inner.breakaway.remove(&pid);
    }

    /// An exit report. Returns true if this removal emptied the set and this
    /// caller won the right to start the teardown drain.
    pub fn on_exit(&self, pid: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(&pid);
        if pid == self.root {
            inner.root_exited = true;
        }
        inner.begin_drain_if_empty()
    }

    pub fn on_breakaway(&self, pid: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.breakaway.insert(pid);
    }

    /// Root exit observed out-of-band (waitpid), without an exit record.
    pub fn note_root_exited(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.root_exited = true;
    }

    pub fn root_exited(&self) -> bool {
        self.inner.lock().unwrap().root_exited
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().active.is_empty()
    }

    /// A no-active-processes marker was dequeued but the set had refilled:
    /// the drain is void, allow the next emptiness transition to emit again.
    pub fn rearm_drain(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.active.is_empty() {
            inner.drain_started = false;
        }
    }

    /// Prober pass: drop every PID that is gone from /proc or has broken
    /// away. Returns true if the set emptied and this sweep won the drain.
    pub fn sweep_dead(&self, alive: impl Fn(u32) -> bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.root_exited || inner.active.is_empty() {
            return false;
        }
        let breakaway = &inner.breakaway;
        let dead: Vec<u32> = inner
            .active
            .iter()
            .copied()
            .filter(|pid| breakaway.contains(pid) || !alive(*pid))
            .collect();
        for pid in dead {
            inner.active.remove(&pid);
        }
        inner.begin_drain_if_empty()
    }

    /// PIDs still believed alive and not allowed to outlive the sandbox.
    pub fn survivors(&self) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .iter()
            .copied()
            .filter(|pid| !inner.breakaway.contains(pid))
            .collect()
    }

    pub fn mark_killed_survivors(&self) {
        self.inner.lock().unwrap().killed_survivors = true;
    }

    pub fn killed_survivors(&self) -> bool {
        self.inner.lock().unwrap().killed_survivors
    }

    #[cfg(test)]
    pub fn contains(&self, pid: u32) -> bool {
        self.inner.lock().unwrap().active.contains(&pid)
    }

    #[cfg(test)]
    pub fn is_breakaway(&self, pid: u32) -> bool {
        self.inner.lock().unwrap().breakaway.contains(&pid)
    }
}

impl Inner {
    fn begin_drain_if_empty(&mut self) -> bool {
        if self.active.is_empty() && !self.drain_started {
            self.drain_started = true;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_exit_starts_drain_once() {
        let state = TreeState::new(42);
        assert!(state.on_exit(42));
        assert!(state.root_exited());
        // duplicate exit reports do not re-win the drain
        assert!(!state.on_exit(42));
    }

    #[test]
    fn breakaway_then_pid_reuse() {
        let state = TreeState::new(1);
        state.on_start(100);
        state.on_breakaway(100);
        assert!(state.is_breakaway(100));
        // same number cloned again: reuse clears the breakaway entry
        state.on_start(100);
        assert!(state.contains(100));
        assert!(!state.is_breakaway(100));
    }

    #[test]
    fn rearm_after_overtaking_start() {
        let state = TreeState::new(1);
        assert!(state.on_exit(1));
        state.on_start(2);
        state.rearm_drain();
        assert!(state.on_exit(2));
    }

    #[test]
    fn sweep_requires_root_exit() {
        let state = TreeState::new(1);
        state.on_start(999_999_999);
        assert!(!state.sweep_dead(|_| false));
        state.on_exit(1);
        // root gone, 999999999 not alive: sweep empties the set
        assert!(state.sweep_dead(|_| false));
        assert!(state.is_empty());
    }

    #[test]
    fn sweep_reaps_breakaway_even_if_alive() {
        let state = TreeState::new(1);
        state.on_start(2);
        state.on_breakaway(2);
        state.on_exit(1);
        assert!(state.sweep_dead(|_| true));
    }

    #[test]
    fn survivors_exclude_breakaway() {
        let state = TreeState::new(1);
        state.on_start(2);
        state.on_start(3);
        state.on_breakaway(3);
        let mut survivors = state.survivors();
        survivors.sort_unstable();
        assert_eq!(survivors, vec![1, 2]);
    }
}
