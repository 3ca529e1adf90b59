//! Finding types produced by analyzers.
//!
//! A finding is one observation from one analyzer. Findings are immutable
//! once emitted; the consensus engine aggregates them without mutating the
//! originals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity level of a finding.
///
/// Ordered from least to most severe so `Ord` comparisons read naturally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Weight used by the consensus confidence formula.
    pub fn confidence_factor(&self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::High => 0.8,
            Self::Medium => 0.6,
            Self::Low => 0.4,
            Self::Info => 0.2,
        }
    }

    /// Whether this finding represents an actual threat signal.
    ///
    /// Info-level findings are "safe" observations; any other severity is
    /// non-trivial and conflicts with a safe observation on the same key.
    pub fn is_threat(&self) -> bool {
        !matches!(self, Self::Info)
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The analyzer family that produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceAgent {
    Vision,
    Osint,
    Security,
}

impl std::fmt::Display for SourceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vision => write!(f, "vision"),
            Self::Osint => write!(f, "osint"),
            Self::Security => write!(f, "security"),
        }
    }
}

/// A single observation from an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Unique identifier
    pub id: String,
    /// Category (e.g. "forms_insecure", "hidden_element")
    pub category: String,
    /// Pattern within the category (e.g. "password_over_http")
    pub pattern_type: String,
    /// Severity of the observation
    pub severity: Severity,
    /// Analyzer's confidence in the observation (0.0-1.0)
    pub confidence: f64,
    /// Evidence blob supporting the observation
    pub evidence: serde_json::Value,
    /// The agent family that produced it
    pub source_agent: SourceAgent,
    /// Page region or URL the observation is anchored to
    pub region: String,
    /// CWE identifier, when mapped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwe_id: Option<String>,
    /// CVSS base score in [0, 10], when mapped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_score: Option<f64>,
    /// When the observation was made
    pub observed_at: DateTime<Utc>,
}

impl Finding {
    /// Create a new finding.
    pub fn new(
        category: impl Into<String>,
        pattern_type: impl Into<String>,
        severity: Severity,
        source_agent: SourceAgent,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category: category.into(),
            pattern_type: pattern_type.into(),
            severity,
            confidence: 0.8,
            evidence: serde_json::Value::Null,
            source_agent,
            region: String::new(),
            cwe_id: None,
            cvss_score: None,
            observed_at: Utc::now(),
        }
    }

    /// Set the analyzer confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Attach an evidence blob.
    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = evidence;
        self
    }

    /// Anchor the finding to a page region or URL.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Attach a CWE identifier.
    pub fn with_cwe(mut self, cwe_id: impl Into<String>) -> Self {
        self.cwe_id = Some(cwe_id.into());
        self
    }

    /// Attach a CVSS score, clamped to [0, 10].
    pub fn with_cvss(mut self, score: f64) -> Self {
        self.cvss_score = Some(score.clamp(0.0, 10.0));
        self
    }
}

/// A security-module finding, enriched with CWE/CVSS before aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityFinding {
    /// The underlying observation
    pub finding: Finding,
    /// Security module that produced it
    pub module: String,
}

impl SecurityFinding {
    pub fn new(module: impl Into<String>, finding: Finding) -> Self {
        Self {
            module: module.into(),
            finding,
        }
    }

    /// Effective CVSS score for sorting; unmapped findings sort last.
    pub fn cvss(&self) -> f64 {
        self.finding.cvss_score.unwrap_or(0.0)
    }
}

/// Injected CWE/CVSS mapper.
///
/// The implementation is an external collaborator; the core only relies on
/// the contract `(category, severity, evidence) -> (cwe_id, cvss_score)`.
pub trait CweCvssMapper: Send + Sync {
    /// Map a finding's category/severity/evidence to CWE id and CVSS score.
    fn map(
        &self,
        category: &str,
        severity: Severity,
        evidence: &serde_json::Value,
    ) -> (Option<String>, Option<f64>);
}

/// Mapper backed by a plain function, for construction-time injection.
pub struct FnCweCvssMapper<F>(pub F);

impl<F> CweCvssMapper for FnCweCvssMapper<F>
where
    F: Fn(&str, Severity, &serde_json::Value) -> (Option<String>, Option<f64>) + Send + Sync,
{
    fn map(
        &self,
        category: &str,
        severity: Severity,
        evidence: &serde_json::Value,
    ) -> (Option<String>, Option<f64>) {
        (self.0)(category, severity, evidence)
    }
}

/// Mapper that leaves findings unenriched.
pub struct NullCweCvssMapper;

impl CweCvssMapper for NullCweCvssMapper {
    fn map(
        &self,
        _category: &str,
        _severity: Severity,
        _evidence: &serde_json::Value,
    ) -> (Option<String>, Option<f64>) {
        (None, None)
    }
}
