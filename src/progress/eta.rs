//! Completion-time estimation from execution history.
//!
//! Per (site type, agent), an EMA of observed durations feeds a simple
//! remaining-time estimate: the sum over agents that have not completed
//! yet. Defaults cover the cold-start case.

use crate::analyzer::AnalyzerKind;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// EMA smoothing factor, matching the supervisor's history.
const ALPHA: f64 = 0.2;

/// Default per-agent duration estimates in seconds.
fn default_estimate(kind: AnalyzerKind) -> f64 {
    match kind {
        AnalyzerKind::Scout => 20.0,
        AnalyzerKind::Vision => 30.0,
        AnalyzerKind::Graph => 10.0,
        AnalyzerKind::Judge => 10.0,
        AnalyzerKind::Osint => 25.0,
        AnalyzerKind::Security => 30.0,
    }
}

/// Estimates remaining audit time from per-agent history.
#[derive(Debug, Default)]
pub struct EtaEstimator {
    ema_secs: HashMap<(String, AnalyzerKind), f64>,
    completed: HashSet<AnalyzerKind>,
    expected: Vec<AnalyzerKind>,
}

impl EtaEstimator {
    /// Create an estimator expecting the standard pipeline agents.
    pub fn new() -> Self {
        Self {
            ema_secs: HashMap::new(),
            completed: HashSet::new(),
            expected: vec![
                AnalyzerKind::Scout,
                AnalyzerKind::Security,
                AnalyzerKind::Vision,
                AnalyzerKind::Graph,
                AnalyzerKind::Judge,
            ],
        }
    }

    /// Restrict or extend the expected agent set.
    pub fn with_expected(mut self, expected: Vec<AnalyzerKind>) -> Self {
        self.expected = expected;
        self
    }

    /// Record an observed execution duration.
    pub fn record(&mut self, site_type: &str, kind: AnalyzerKind, duration: Duration) {
        let secs = duration.as_secs_f64();
        self.ema_secs
            .entry((site_type.to_string(), kind))
            .and_modify(|mean| *mean = ALPHA * secs + (1.0 - ALPHA) * *mean)
            .or_insert(secs);
    }

    /// Mark an agent as completed for this audit.
    pub fn mark_completed(&mut self, kind: AnalyzerKind) {
        self.completed.insert(kind);
    }

    /// Reset completion tracking for a new iteration.
    pub fn reset_iteration(&mut self) {
        self.completed.clear();
    }

    /// Estimated duration for one agent.
    pub fn estimate(&self, site_type: &str, kind: AnalyzerKind) -> f64 {
        self.ema_secs
            .get(&(site_type.to_string(), kind))
            .copied()
            .unwrap_or_else(|| default_estimate(kind))
    }

    /// Remaining time: the sum of estimates for agents not yet completed.
    pub fn remaining_seconds(&self, site_type: &str) -> f64 {
        self.expected
            .iter()
            .filter(|kind| !self.completed.contains(kind))
            .map(|kind| self.estimate(site_type, *kind))
            .sum()
    }
}
