//! Multi-source consensus and explainable confidence.
//!
//! Findings from different analyzers that describe the same observation
//! collide onto one consensus key. Each key carries a verification status
//! driven by a strict state machine, and an aggregated confidence score
//! whose factors are preserved for explainability.

use crate::error::{Error, Result};
use crate::finding::{Finding, Severity, SourceAgent};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;
use tracing::debug;

static URL_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").expect("static regex"));

/// Verification status of a consensus entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStatus {
    /// No sources ingested yet
    Pending,
    /// A single agent family has reported
    Unconfirmed,
    /// At least `min_sources` distinct agent families agree
    Confirmed,
    /// Agents disagree about threat vs safe; terminal
    Conflicted,
}

impl ConsensusStatus {
    /// Whether the transition `self -> to` is allowed.
    pub fn can_transition(&self, to: ConsensusStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Unconfirmed)
                | (Self::Unconfirmed, Self::Confirmed)
                | (Self::Unconfirmed, Self::Conflicted)
                | (Self::Confirmed, Self::Conflicted)
        )
    }
}

impl std::fmt::Display for ConsensusStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Unconfirmed => write!(f, "UNCONFIRMED"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Conflicted => write!(f, "CONFLICTED"),
        }
    }
}

/// Normalized signature under which equivalent findings collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FindingKey {
    pub category: String,
    pub pattern_type: String,
    pub region: String,
}

impl FindingKey {
    /// Build the key for a finding.
    pub fn for_finding(finding: &Finding) -> Self {
        Self {
            category: finding.category.trim().to_lowercase(),
            pattern_type: finding.pattern_type.trim().to_lowercase(),
            region: normalize_region(&finding.region),
        }
    }

    /// Stable short digest used as the map key.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.category.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.pattern_type.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.region.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len / 2)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Normalize a page region or URL so equivalent anchors collide.
///
/// Scheme, query, fragment, and trailing slash are stripped; the result
/// is lowercased.
pub fn normalize_region(region: &str) -> String {
    let trimmed = region.trim();
    let without_scheme = URL_SCHEME.replace(trimmed, "");
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or("");
    without_query.trim_end_matches('/').to_lowercase()
}

/// Confidence tier derived from an aggregated score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    Low,
    Moderate,
    Suspicious,
    Likely,
    Critical,
}

impl ConfidenceTier {
    /// Map a score in [0, 100] to its tier using inclusive lower bounds.
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Critical
        } else if score >= 60.0 {
            Self::Likely
        } else if score >= 40.0 {
            Self::Suspicious
        } else if score >= 20.0 {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

/// Aggregate view of all findings sharing one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Normalized signature
    pub finding_key: FindingKey,
    /// Stable digest of the signature
    pub key: String,
    /// All ingested findings, in arrival order
    pub sources: Vec<Finding>,
    /// Verification status
    pub status: ConsensusStatus,
    /// Aggregated confidence in [0, 100]
    pub aggregated_confidence: f64,
    /// Named factor contributions for explainability
    pub confidence_breakdown: BTreeMap<String, f64>,
    /// Notes describing detected conflicts
    pub conflict_notes: Vec<String>,
}

impl ConsensusResult {
    fn new(finding_key: FindingKey) -> Self {
        let key = finding_key.digest();
        Self {
            finding_key,
            key,
            sources: Vec::new(),
            status: ConsensusStatus::Pending,
            aggregated_confidence: 0.0,
            confidence_breakdown: BTreeMap::new(),
            conflict_notes: Vec::new(),
        }
    }

    /// Distinct source agent families among the ingested findings.
    pub fn distinct_agents(&self) -> HashSet<SourceAgent> {
        self.sources.iter().map(|f| f.source_agent).collect()
    }

    /// Highest severity among the ingested findings.
    pub fn max_severity(&self) -> Option<Severity> {
        self.sources.iter().map(|f| f.severity).max()
    }

    fn transition(&mut self, to: ConsensusStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition(to) {
            return Err(Error::invalid_transition(
                self.status.to_string(),
                to.to_string(),
            ));
        }
        debug!(key = %self.key, from = %self.status, to = %to, "consensus transition");
        self.status = to;
        Ok(())
    }
}

/// Aggregates findings into consensus results.
pub struct ConsensusEngine {
    results: HashMap<String, ConsensusResult>,
    min_sources: usize,
}

impl ConsensusEngine {
    /// Create an engine requiring `min_sources` distinct agents to confirm.
    pub fn new(min_sources: usize) -> Self {
        Self {
            results: HashMap::new(),
            min_sources: min_sources.max(1),
        }
    }

    /// Ingest one finding, updating the consensus entry for its key.
    ///
    /// Returns the status after the update. An illegal status transition
    /// is a programming error and surfaces as `Error::InvalidTransition`.
    pub fn ingest(&mut self, finding: Finding) -> Result<ConsensusStatus> {
        let key = FindingKey::for_finding(&finding);
        let digest = key.digest();
        let entry = self
            .results
            .entry(digest)
            .or_insert_with(|| ConsensusResult::new(key));

        if entry.status == ConsensusStatus::Conflicted {
            // Terminal: further reports are noted, not aggregated.
            entry.conflict_notes.push(format!(
                "{} reported {} after conflict",
                finding.source_agent, finding.severity
            ));
            return Ok(entry.status);
        }

        // Threat vs safe disagreement on the same key is a conflict.
        let disagrees = entry.sources.iter().any(|existing| {
            existing.severity.is_threat() != finding.severity.is_threat()
        });
        if disagrees {
            let mut agents: Vec<String> = entry
                .distinct_agents()
                .iter()
                .map(|a| a.to_string())
                .collect();
            agents.sort();
            entry.conflict_notes.push(format!(
                "{} ({}) disagrees with {} on {}/{}",
                finding.source_agent,
                finding.severity,
                agents.join(", "),
                entry.finding_key.category,
                entry.finding_key.pattern_type,
            ));
            entry.transition(ConsensusStatus::Conflicted)?;
            return Ok(entry.status);
        }

        entry.sources.push(finding);

        let n = entry.distinct_agents().len();
        if entry.status == ConsensusStatus::Pending {
            entry.transition(ConsensusStatus::Unconfirmed)?;
        }
        if n >= self.min_sources && entry.status == ConsensusStatus::Unconfirmed {
            entry.transition(ConsensusStatus::Confirmed)?;
        }

        Self::recompute_confidence(entry, self.min_sources);
        Ok(entry.status)
    }

    /// Recompute the aggregated confidence and its breakdown.
    ///
    /// Weights: source agreement 60%, severity factor 25%, contextual
    /// confidence 15%. Hard bands then clamp the raw score so multi-source
    /// high-severity results always read as confirmed and single-source
    /// results never do.
    fn recompute_confidence(entry: &mut ConsensusResult, min_sources: usize) {
        let n = entry.distinct_agents().len();
        if n == 0 {
            return;
        }

        let source_agreement = (n as f64 / min_sources as f64).min(1.0);
        let max_severity = entry.max_severity().unwrap_or(Severity::Info);
        let severity_factor = max_severity.confidence_factor();
        let context_confidence = entry.sources.iter().map(|f| f.confidence).sum::<f64>()
            / entry.sources.len() as f64;

        let raw =
            60.0 * source_agreement + 25.0 * severity_factor + 15.0 * context_confidence;

        let multi = n >= 2;
        let mut score = match (multi, max_severity) {
            (true, sev) if sev >= Severity::High => raw.max(75.0),
            (true, Severity::Medium) => raw.clamp(50.0, 75.0),
            (false, sev) if sev >= Severity::High => raw.clamp(40.0, 49.0),
            (false, Severity::Medium) => raw.clamp(20.0, 49.0),
            _ => raw,
        };

        // A single-source entry can never read as confirmed.
        if entry.status == ConsensusStatus::Unconfirmed {
            score = score.min(49.0);
        }
        entry.aggregated_confidence = score.clamp(0.0, 100.0);

        entry.confidence_breakdown = BTreeMap::from([
            ("source_agreement".to_string(), source_agreement),
            ("severity_factor".to_string(), severity_factor),
            ("context_confidence".to_string(), context_confidence),
            ("source_count".to_string(), n as f64),
        ]);
    }

    /// Point-in-time copy of all consensus results.
    pub fn snapshot(&self) -> Vec<ConsensusResult> {
        let mut results: Vec<ConsensusResult> = self.results.values().cloned().collect();
        results.sort_by(|a, b| {
            b.aggregated_confidence
                .partial_cmp(&a.aggregated_confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        results
    }

    /// Entries with confirmed status.
    pub fn get_confirmed(&self) -> Vec<&ConsensusResult> {
        self.with_status(ConsensusStatus::Confirmed)
    }

    /// Entries with conflicted status.
    pub fn get_conflicted(&self) -> Vec<&ConsensusResult> {
        self.with_status(ConsensusStatus::Conflicted)
    }

    /// Entries still unconfirmed.
    pub fn get_unconfirmed(&self) -> Vec<&ConsensusResult> {
        self.with_status(ConsensusStatus::Unconfirmed)
    }

    fn with_status(&self, status: ConsensusStatus) -> Vec<&ConsensusResult> {
        let mut entries: Vec<&ConsensusResult> = self
            .results
            .values()
            .filter(|r| r.status == status)
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Human-readable confidence summary for one key.
    pub fn format_confidence(&self, key: &str) -> Option<String> {
        let entry = self.results.get(key)?;
        let n = entry.distinct_agents().len();
        let severity = entry
            .max_severity()
            .map(|s| s.label())
            .unwrap_or("unknown");
        Some(format!(
            "{:.0}%: {} source{} agree, {}",
            entry.aggregated_confidence,
            n,
            if n == 1 { "" } else { "s" },
            severity
        ))
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no findings have been ingested.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::SourceAgent;
    use pretty_assertions::assert_eq;

    fn finding(
        category: &str,
        severity: Severity,
        agent: SourceAgent,
        confidence: f64,
    ) -> Finding {
        Finding::new(category, "pattern", severity, agent)
            .with_confidence(confidence)
            .with_region("https://example.com/login")
    }

    #[test]
    fn test_region_normalization_collides_equivalents() {
        assert_eq!(
            normalize_region("https://Example.com/Login?next=/home#top"),
            normalize_region("http://example.com/login/")
        );
    }

    #[test]
    fn test_key_collision_across_agents() {
        let a = finding("forms_insecure", Severity::High, SourceAgent::Security, 0.9);
        let b = finding("Forms_Insecure", Severity::High, SourceAgent::Vision, 0.8);
        assert_eq!(
            FindingKey::for_finding(&a).digest(),
            FindingKey::for_finding(&b).digest()
        );
    }

    #[test]
    fn test_single_source_stays_unconfirmed_below_fifty() {
        let mut engine = ConsensusEngine::new(2);
        let status = engine
            .ingest(finding(
                "forms_insecure",
                Severity::Critical,
                SourceAgent::Security,
                1.0,
            ))
            .unwrap();
        assert_eq!(status, ConsensusStatus::Unconfirmed);

        let entry = &engine.snapshot()[0];
        assert!(entry.aggregated_confidence < 50.0);
        assert!(entry.aggregated_confidence >= 40.0);
    }

    #[test]
    fn test_two_agents_confirm_with_floor() {
        let mut engine = ConsensusEngine::new(2);
        engine
            .ingest(finding("forms_insecure", Severity::High, SourceAgent::Security, 0.7))
            .unwrap();
        let status = engine
            .ingest(finding("forms_insecure", Severity::High, SourceAgent::Vision, 0.6))
            .unwrap();
        assert_eq!(status, ConsensusStatus::Confirmed);

        let entry = &engine.snapshot()[0];
        assert!(entry.aggregated_confidence >= 75.0);
        assert_eq!(entry.confidence_breakdown["source_count"], 2.0);
    }

    #[test]
    fn test_same_agent_never_confirms() {
        let mut engine = ConsensusEngine::new(2);
        for _ in 0..3 {
            engine
                .ingest(finding("popup_spam", Severity::Medium, SourceAgent::Vision, 0.9))
                .unwrap();
        }
        let entry = &engine.snapshot()[0];
        assert_eq!(entry.status, ConsensusStatus::Unconfirmed);
        assert_eq!(entry.confidence_breakdown["source_count"], 1.0);
        assert!(entry.aggregated_confidence < 50.0);
    }

    #[test]
    fn test_medium_confirmed_band() {
        let mut engine = ConsensusEngine::new(2);
        engine
            .ingest(finding("popup_spam", Severity::Medium, SourceAgent::Vision, 0.9))
            .unwrap();
        engine
            .ingest(finding("popup_spam", Severity::Medium, SourceAgent::Osint, 0.9))
            .unwrap();
        let entry = &engine.snapshot()[0];
        assert_eq!(entry.status, ConsensusStatus::Confirmed);
        assert!(entry.aggregated_confidence >= 50.0);
        assert!(entry.aggregated_confidence <= 75.0);
    }

    #[test]
    fn test_conflict_threat_vs_safe() {
        let mut engine = ConsensusEngine::new(2);
        engine
            .ingest(finding("forms_insecure", Severity::High, SourceAgent::Security, 0.9))
            .unwrap();
        let status = engine
            .ingest(finding("forms_insecure", Severity::Info, SourceAgent::Vision, 0.9))
            .unwrap();
        assert_eq!(status, ConsensusStatus::Conflicted);

        let entry = &engine.snapshot()[0];
        assert_eq!(entry.conflict_notes.len(), 1);
        assert!(entry.conflict_notes[0].contains("vision"));
        assert!(entry.conflict_notes[0].contains("security"));
        // The conflicting report was not aggregated
        assert_eq!(entry.sources.len(), 1);
        assert!(entry.aggregated_confidence < 75.0);
    }

    #[test]
    fn test_conflicted_is_terminal() {
        let mut engine = ConsensusEngine::new(2);
        engine
            .ingest(finding("forms_insecure", Severity::High, SourceAgent::Security, 0.9))
            .unwrap();
        engine
            .ingest(finding("forms_insecure", Severity::Info, SourceAgent::Vision, 0.9))
            .unwrap();
        // A later agreeing report does not resurrect the entry
        let status = engine
            .ingest(finding("forms_insecure", Severity::High, SourceAgent::Osint, 0.9))
            .unwrap();
        assert_eq!(status, ConsensusStatus::Conflicted);
    }

    #[test]
    fn test_transition_graph() {
        use ConsensusStatus::*;
        assert!(Pending.can_transition(Unconfirmed));
        assert!(Unconfirmed.can_transition(Confirmed));
        assert!(Unconfirmed.can_transition(Conflicted));
        assert!(Confirmed.can_transition(Conflicted));

        assert!(!Pending.can_transition(Confirmed));
        assert!(!Pending.can_transition(Conflicted));
        assert!(!Confirmed.can_transition(Unconfirmed));
        assert!(!Conflicted.can_transition(Confirmed));
        assert!(!Conflicted.can_transition(Unconfirmed));
    }

    #[test]
    fn test_confidence_tiers() {
        assert_eq!(ConfidenceTier::from_score(0.0), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_score(19.9), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_score(20.0), ConfidenceTier::Moderate);
        assert_eq!(ConfidenceTier::from_score(40.0), ConfidenceTier::Suspicious);
        assert_eq!(ConfidenceTier::from_score(60.0), ConfidenceTier::Likely);
        assert_eq!(ConfidenceTier::from_score(80.0), ConfidenceTier::Critical);
        assert_eq!(ConfidenceTier::from_score(100.0), ConfidenceTier::Critical);
    }

    #[test]
    fn test_format_confidence() {
        let mut engine = ConsensusEngine::new(2);
        engine
            .ingest(finding("forms_insecure", Severity::High, SourceAgent::Security, 0.8))
            .unwrap();
        engine
            .ingest(finding("forms_insecure", Severity::High, SourceAgent::Vision, 0.8))
            .unwrap();

        let key = engine.snapshot()[0].key.clone();
        let formatted = engine.format_confidence(&key).unwrap();
        assert!(formatted.contains("2 sources agree"));
        assert!(formatted.contains("high"));
    }

    #[test]
    fn test_every_entry_in_exactly_one_partition() {
        let mut engine = ConsensusEngine::new(2);
        engine
            .ingest(finding("a", Severity::High, SourceAgent::Security, 0.9))
            .unwrap();
        engine
            .ingest(finding("a", Severity::High, SourceAgent::Vision, 0.9))
            .unwrap();
        engine
            .ingest(finding("b", Severity::Medium, SourceAgent::Vision, 0.9))
            .unwrap();
        engine
            .ingest(finding("c", Severity::High, SourceAgent::Security, 0.9))
            .unwrap();
        engine
            .ingest(finding("c", Severity::Info, SourceAgent::Vision, 0.9))
            .unwrap();

        let total = engine.get_confirmed().len()
            + engine.get_unconfirmed().len()
            + engine.get_conflicted().len();
        assert_eq!(total, engine.len());
        assert_eq!(engine.get_confirmed().len(), 1);
        assert_eq!(engine.get_unconfirmed().len(), 1);
        assert_eq!(engine.get_conflicted().len(), 1);
    }

    mod confidence_bands {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn single_source_always_below_fifty(
                confidence in 0.0f64..=1.0,
                severity_idx in 0usize..5,
            ) {
                let severity = [
                    Severity::Info,
                    Severity::Low,
                    Severity::Medium,
                    Severity::High,
                    Severity::Critical,
                ][severity_idx];

                let mut engine = ConsensusEngine::new(2);
                engine
                    .ingest(finding("cat", severity, SourceAgent::Vision, confidence))
                    .unwrap();
                let entry = &engine.snapshot()[0];
                prop_assert!(entry.aggregated_confidence < 50.0);
            }

            #[test]
            fn confirmed_always_at_least_fifty(
                confidence in 0.0f64..=1.0,
                severity_idx in 0usize..5,
            ) {
                let severity = [
                    Severity::Info,
                    Severity::Low,
                    Severity::Medium,
                    Severity::High,
                    Severity::Critical,
                ][severity_idx];

                let mut engine = ConsensusEngine::new(2);
                engine
                    .ingest(finding("cat", severity, SourceAgent::Vision, confidence))
                    .unwrap();
                engine
                    .ingest(finding("cat", severity, SourceAgent::Security, confidence))
                    .unwrap();
                let entry = &engine.snapshot()[0];
                prop_assert_eq!(entry.status, ConsensusStatus::Confirmed);
                prop_assert!(entry.aggregated_confidence >= 50.0);
            }
        }
    }
}
