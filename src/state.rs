//! Audit session state.
//!
//! `AuditState` is owned exclusively by the orchestrator and mutated only
//! between phase boundaries. Analyzers receive immutable snapshots built
//! from it; no analyzer ever observes a partially-merged sibling result.

use crate::analyzer::{AnalyzerOutput, JudgeDecision};
use crate::config::{AuditTier, ExecutionMode};
use crate::finding::SecurityFinding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// Terminal-forward audit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Running,
    Completed,
    Aborted,
    Error,
}

impl AuditStatus {
    /// Whether the audit has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One recorded failure, appended as phases degrade or abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditErrorRecord {
    /// Phase in which the failure occurred
    pub phase: String,
    /// Error kind label ("timeout", "breaker_open", "contract", ...)
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

/// Mutable state of one audit, owned by the orchestrator.
#[derive(Debug)]
pub struct AuditState {
    /// Target URL the audit was started with
    pub url: String,
    /// Budget tier
    pub tier: AuditTier,
    /// Current iteration (1-indexed once the first scout begins)
    pub iteration: u32,
    /// Iteration budget
    pub max_iterations: u32,
    /// Page budget
    pub max_pages: usize,
    /// Current status
    status: AuditStatus,
    /// URLs queued for investigation, in discovery order
    pending_urls: VecDeque<String>,
    /// URLs already visited; never re-enqueued
    investigated_urls: HashSet<String>,
    /// Scout outputs keyed by URL
    pub scout_results: HashMap<String, AnalyzerOutput>,
    /// Aggregated security findings
    pub security_results: Vec<SecurityFinding>,
    /// Latest vision output
    pub vision_result: Option<AnalyzerOutput>,
    /// Latest graph/OSINT output
    pub graph_result: Option<AnalyzerOutput>,
    /// Latest judge decision
    pub judge_decision: Option<JudgeDecision>,
    /// Site type classified by the first scout
    pub site_type: Option<String>,
    /// Classification confidence in [0, 1]
    pub site_type_confidence: f64,
    /// Append-only failure log
    pub errors: Vec<AuditErrorRecord>,
    /// Consecutive scout failures
    pub scout_failures: u32,
    /// VLM calls consumed so far
    pub vlm_calls_used: u32,
    /// Wall-clock start
    pub start_time: DateTime<Utc>,
    /// Monotonic start for elapsed computation
    started: Instant,
    /// Scheduling mode for this audit
    pub execution_mode: ExecutionMode,
    /// Set when a budget forced the final verdict
    pub force_verdict: bool,
}

impl AuditState {
    /// Create state for a new audit. The target URL is the first pending URL.
    pub fn new(url: impl Into<String>, tier: AuditTier, execution_mode: ExecutionMode) -> Self {
        let url = url.into();
        let mut pending_urls = VecDeque::new();
        pending_urls.push_back(url.clone());

        Self {
            url,
            tier,
            iteration: 0,
            max_iterations: tier.max_iterations(),
            max_pages: tier.max_pages(),
            status: AuditStatus::Running,
            pending_urls,
            investigated_urls: HashSet::new(),
            scout_results: HashMap::new(),
            security_results: Vec::new(),
            vision_result: None,
            graph_result: None,
            judge_decision: None,
            site_type: None,
            site_type_confidence: 0.0,
            errors: Vec::new(),
            scout_failures: 0,
            vlm_calls_used: 0,
            start_time: Utc::now(),
            started: Instant::now(),
            execution_mode,
            force_verdict: false,
        }
    }

    /// Current status.
    pub fn status(&self) -> AuditStatus {
        self.status
    }

    /// Transition to a terminal status.
    ///
    /// Status moves monotonically forward: the first terminal transition
    /// wins, later attempts are ignored. Returns whether the transition
    /// was applied.
    pub fn transition(&mut self, to: AuditStatus) -> bool {
        if self.status.is_terminal() || to == AuditStatus::Running {
            return false;
        }
        self.status = to;
        true
    }

    /// Seconds elapsed since the audit started.
    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Begin the next iteration. Returns the new iteration number.
    pub fn advance_iteration(&mut self) -> u32 {
        self.iteration += 1;
        debug_assert!(self.iteration <= self.max_iterations + 1);
        self.iteration
    }

    /// Enqueue a URL for investigation.
    ///
    /// URLs already investigated or already pending are silently skipped,
    /// preserving the never-revisit invariant.
    pub fn push_pending(&mut self, url: impl Into<String>) {
        let url = url.into();
        if self.investigated_urls.contains(&url) || self.pending_urls.contains(&url) {
            return;
        }
        self.pending_urls.push_back(url);
    }

    /// Take the next URL to investigate, marking it investigated.
    ///
    /// Returns `None` when the queue is empty or the page budget is spent.
    pub fn take_next_url(&mut self) -> Option<String> {
        if self.investigated_urls.len() >= self.max_pages {
            return None;
        }
        let url = self.pending_urls.pop_front()?;
        self.investigated_urls.insert(url.clone());
        Some(url)
    }

    /// Number of pages investigated so far.
    pub fn investigated_count(&self) -> usize {
        self.investigated_urls.len()
    }

    /// Whether any URLs remain queued.
    pub fn has_pending_urls(&self) -> bool {
        !self.pending_urls.is_empty()
    }

    /// Whether a URL has been investigated.
    pub fn is_investigated(&self, url: &str) -> bool {
        self.investigated_urls.contains(url)
    }

    /// Record a failure in the append-only error log.
    pub fn record_error(
        &mut self,
        phase: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.errors.push(AuditErrorRecord {
            phase: phase.into(),
            kind: kind.into(),
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Record the site classification from the first successful scout.
    pub fn classify_site(&mut self, site_type: impl Into<String>, confidence: f64) {
        if self.site_type.is_none() {
            self.site_type = Some(site_type.into());
            self.site_type_confidence = confidence.clamp(0.0, 1.0);
        }
    }

    /// Site type or "unknown" while unclassified.
    pub fn site_type_or_unknown(&self) -> &str {
        self.site_type.as_deref().unwrap_or("unknown")
    }

    /// Whether any successful scout result exists.
    pub fn has_scout_results(&self) -> bool {
        !self.scout_results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;

    fn state() -> AuditState {
        AuditState::new(
            "https://example.com",
            AuditTier::Standard,
            ExecutionMode::Cooperative,
        )
    }

    #[test]
    fn test_initial_state() {
        let s = state();
        assert_eq!(s.status(), AuditStatus::Running);
        assert_eq!(s.iteration, 0);
        assert_eq!(s.max_iterations, 3);
        assert_eq!(s.max_pages, 5);
        assert!(s.has_pending_urls());
        assert_eq!(s.investigated_count(), 0);
    }

    #[test]
    fn test_status_transitions_monotonic() {
        let mut s = state();
        assert!(s.transition(AuditStatus::Completed));
        assert_eq!(s.status(), AuditStatus::Completed);
        // First terminal transition wins
        assert!(!s.transition(AuditStatus::Error));
        assert_eq!(s.status(), AuditStatus::Completed);
        // Cannot return to running
        assert!(!s.transition(AuditStatus::Running));
    }

    #[test]
    fn test_investigated_urls_never_requeued() {
        let mut s = state();
        let url = s.take_next_url().unwrap();
        assert_eq!(url, "https://example.com");
        assert!(s.is_investigated(&url));

        s.push_pending(url.clone());
        assert!(!s.has_pending_urls());
    }

    #[test]
    fn test_pending_dedup() {
        let mut s = state();
        s.push_pending("https://example.com/about");
        s.push_pending("https://example.com/about");
        let _ = s.take_next_url();
        assert_eq!(s.take_next_url().as_deref(), Some("https://example.com/about"));
        assert!(s.take_next_url().is_none());
    }

    #[test]
    fn test_page_budget_stops_take() {
        let mut s = AuditState::new(
            "https://example.com",
            AuditTier::Quick,
            ExecutionMode::Cooperative,
        );
        s.push_pending("https://example.com/two");
        assert!(s.take_next_url().is_some());
        // Quick tier allows a single page
        assert!(s.take_next_url().is_none());
        assert_eq!(s.investigated_count(), 1);
    }

    #[test]
    fn test_site_classification_is_sticky() {
        let mut s = state();
        s.classify_site("ecommerce", 0.9);
        s.classify_site("news", 0.99);
        assert_eq!(s.site_type_or_unknown(), "ecommerce");
        assert_eq!(s.site_type_confidence, 0.9);
    }
}
