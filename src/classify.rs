use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::allowlist::MatchStrength;
use crate::report::{Operation, ReportedAccess};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounters {
    pub violations: u64,
    pub allowlisted_cacheable: u64,
    pub allowlisted_not_cacheable: u64,
    /// Subset of `violations` that only probed for existence.
    pub existence_based_violations: u64,
}

impl OutcomeCounters {
    /// The task must not be cached upstream if anything beyond
    /// existence-probing escaped the cacheable allow-list.
    pub fn has_uncacheable(&self) -> bool {
        self.violations + self.allowlisted_not_cacheable > self.existence_based_violations
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassifierConfig {
    pub report_allowlisted: bool,
    pub ignore_create_file: bool,
    pub restricted_temp_dirs: Vec<PathBuf>,
}

/// Accumulates the classification of forwarded accesses into the final
/// outcome evidence.
///
/// The path cache forwards a re-access to a known path whenever its closure
/// widens, so one path can collect verdicts from several processes; every
/// constituent verdict is kept here and folded per path on `finish`.
pub struct Classifier {
    cfg: ClassifierConfig,
    counters: OutcomeCounters,
    violations: Vec<ReportedAccess>,
    allowlisted: Vec<ReportedAccess>,
    path_verdicts: HashMap<String, Vec<MatchStrength>>,
}

#[derive(Debug, Default)]
pub struct ClassifiedOutcome {
    pub counters: OutcomeCounters,
    pub violations: Vec<ReportedAccess>,
    pub allowlisted: Vec<ReportedAccess>,
    /// Aggregate verdict per path: the least permissive constituent.
    pub path_verdicts: BTreeMap<String, MatchStrength>,
}

impl Classifier {
    pub fn new(cfg: ClassifierConfig) -> Self {
        Self {
            cfg,
            counters: OutcomeCounters::default(),
            violations: Vec::new(),
            allowlisted: Vec::new(),
            path_verdicts: HashMap::new(),
        }
    }

    fn in_restricted_temp(&self, path: &str) -> bool {
        self.cfg
            .restricted_temp_dirs
            .iter()
            .any(|dir| Path::new(path).starts_with(dir))
    }

    pub fn classify(&mut self, access: &ReportedAccess, verdict: MatchStrength) {
        if verdict == MatchStrength::NoMatch
            && access.operation == Operation::Create
            && self.cfg.ignore_create_file
        {
            warn!(
                pid = access.pid,
                path = %access.path,
                "unexpected file creation ignored by unsafe option"
            );
            return;
        }

        self.path_verdicts
            .entry(access.path.clone())
            .or_default()
            .push(verdict);

        match verdict {
            MatchStrength::NoMatch => {
                if self.in_restricted_temp(&access.path) {
                    debug!(pid = access.pid, path = %access.path, "disallowed temp access");
                } else {
                    warn!(
                        pid = access.pid,
                        operation = ?access.operation,
                        requested = ?access.requested,
                        path = %access.path,
                        "disallowed file access"
                    );
                }
                if access.is_existence_based() {
                    self.counters.existence_based_violations += 1;
                }
                self.counters.violations += 1;
                self.violations.push(access.clone());
            }
            MatchStrength::MatchesButNotCacheable => {
                if self.cfg.report_allowlisted {
                    warn!(
                        pid = access.pid,
                        path = %access.path,
                        "allow-listed access escalated to violation"
                    );
                    self.counters.violations += 1;
                    self.violations.push(access.clone());
                } else {
                    self.counters.allowlisted_not_cacheable += 1;
                    self.allowlisted.push(access.clone());
                }
            }
            MatchStrength::MatchesAndCacheable => {
                self.counters.allowlisted_cacheable += 1;
                self.allowlisted.push(access.clone());
            }
        }
    }

    pub fn counters(&self) -> &OutcomeCounters {
        &self.counters
    }

    pub fn finish(self) -> ClassifiedOutcome {
        let path_verdicts = self
            .path_verdicts
            .into_iter()
            .map(|(path, verdicts)| (path, MatchStrength::aggregate(verdicts)))
            .collect();
        ClassifiedOutcome {
            counters: self.counters,
            violations: self.violations,
            allowlisted: self.allowlisted,
            path_verdicts,
        }
    }
}
