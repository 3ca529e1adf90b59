//! Analyzer interface and the typed results the orchestrator consumes.
//!
//! Every phase of the audit is performed by an external collaborator that
//! implements [`Analyzer`]. The core never performs blocking I/O itself;
//! analyzers own their HTTP clients, browsers, and caches. Implementations
//! must be thread-safe (`Send + Sync`) and honor cancellation within a
//! bounded delay.

use crate::complexity::ComplexitySignals;
use crate::error::Result;
use crate::finding::Finding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The analyzer families the pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    /// Browser reconnaissance: page structure, links, complexity signals
    Scout,
    /// Security module suite (run through the tier scheduler)
    Security,
    /// Visual/VLM analysis of rendered pages
    Vision,
    /// Entity/OSINT graph investigation
    Graph,
    /// Verdict synthesis and routing decisions
    Judge,
    /// WHOIS/DNS/registration lookups
    Osint,
}

impl AnalyzerKind {
    /// Default timeout before adaptive adjustment.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::Scout => Duration::from_secs(20),
            Self::Security => Duration::from_secs(60),
            Self::Vision => Duration::from_secs(30),
            Self::Graph => Duration::from_secs(10),
            Self::Judge => Duration::from_secs(10),
            Self::Osint => Duration::from_secs(25),
        }
    }

    /// Minimum timeout floor regardless of history or complexity.
    pub fn minimum_timeout(&self) -> Duration {
        Duration::from_secs(3)
    }

    /// All kinds in pipeline order.
    pub fn all() -> [AnalyzerKind; 6] {
        [
            Self::Scout,
            Self::Security,
            Self::Vision,
            Self::Graph,
            Self::Judge,
            Self::Osint,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scout => "scout",
            Self::Security => "security",
            Self::Vision => "vision",
            Self::Graph => "graph",
            Self::Judge => "judge",
            Self::Osint => "osint",
        }
    }
}

impl std::fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable snapshot handed to an analyzer for one call.
///
/// Built at the phase boundary; analyzers never observe partially-merged
/// state from a sibling phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerInput {
    /// Target URL for this call
    pub url: String,
    /// Site type classified by the first scout, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_type: Option<String>,
    /// Scout result for the same URL, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scout_result: Option<Value>,
    /// Security modules enabled for this audit, when restricted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_modules: Option<Vec<String>>,
    /// Current iteration (1-indexed)
    pub iteration: u32,
    /// Force the judge to render a verdict regardless of ambiguity
    #[serde(default)]
    pub force_verdict: bool,
    /// Synthesis context for the judge (consensus snapshot, stats)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl AnalyzerInput {
    /// Create an input targeting a URL.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_site_type(mut self, site_type: impl Into<String>) -> Self {
        self.site_type = Some(site_type.into());
        self
    }

    pub fn with_scout_result(mut self, result: Value) -> Self {
        self.scout_result = Some(result);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force_verdict = true;
        self
    }
}

/// Typed result returned by an analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerOutput {
    /// Observations produced by this call
    pub findings: Vec<Finding>,
    /// Analyzer-specific payload (scout report, judge decision, ...)
    pub data: Value,
    /// Per-call metrics reported by the analyzer
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metrics: Value,
    /// Soft error the analyzer wants surfaced without failing the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalyzerOutput {
    /// Create an output with a data payload and no findings.
    pub fn with_data(data: Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Create an output carrying findings.
    pub fn with_findings(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            ..Self::default()
        }
    }

    /// Minimal well-formed placeholder for an analyzer that produced nothing.
    ///
    /// Used by the NONE fallback mode: empty findings, but the payload shape
    /// is intact so downstream consumers never see a hole.
    pub fn placeholder(kind: AnalyzerKind) -> Self {
        Self {
            findings: Vec::new(),
            data: serde_json::json!({
                "analyzer": kind.as_str(),
                "placeholder": true,
            }),
            metrics: Value::Null,
            error: None,
        }
    }

    /// Whether the payload carries any usable shape.
    pub fn is_well_formed(&self) -> bool {
        !self.data.is_null() || !self.findings.is_empty()
    }
}

/// Scout report parsed from the scout analyzer's payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoutReport {
    /// Classified site type (opaque strategy data)
    pub site_type: String,
    /// Classification confidence in [0, 1]
    pub site_type_confidence: f64,
    /// URLs discovered on the page, candidates for further investigation
    #[serde(default)]
    pub discovered_urls: Vec<String>,
    /// Page complexity measurements
    #[serde(default)]
    pub complexity: ComplexitySignals,
}

impl ScoutReport {
    /// Parse a scout report out of an analyzer payload.
    pub fn from_output(output: &AnalyzerOutput) -> Result<Self> {
        Ok(serde_json::from_value(output.data.clone())?)
    }

    /// Serialize into an analyzer payload.
    pub fn into_output(self) -> Result<AnalyzerOutput> {
        Ok(AnalyzerOutput::with_data(serde_json::to_value(self)?))
    }
}

/// Routing action requested by the judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeAction {
    /// Finalize: the verdict below is the audit's verdict
    RenderVerdict,
    /// Loop: investigate the listed URLs before deciding
    RequestMoreInvestigation,
}

/// Verdict synthesis returned by the judge analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeDecision {
    /// Requested routing action
    pub action: JudgeAction,
    /// Trust score in [0, 100]
    pub trust_score: f64,
    /// Risk level label ("low", "suspicious", ...)
    pub risk_level: String,
    /// Free-form reasoning
    #[serde(default)]
    pub reasoning: String,
    /// URLs the judge wants investigated next
    #[serde(default)]
    pub requested_urls: Vec<String>,
    /// Non-technical summary, when the analyzer produces one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_summary: Option<String>,
}

impl JudgeDecision {
    /// Parse a judge decision out of an analyzer payload.
    pub fn from_output(output: &AnalyzerOutput) -> Result<Self> {
        Ok(serde_json::from_value(output.data.clone())?)
    }

    /// Serialize into an analyzer payload.
    pub fn into_output(self) -> Result<AnalyzerOutput> {
        Ok(AnalyzerOutput::with_data(serde_json::to_value(self)?))
    }

    /// A conservative decision used when no judge output is available.
    pub fn unknown() -> Self {
        Self {
            action: JudgeAction::RenderVerdict,
            trust_score: 0.0,
            risk_level: "unknown".to_string(),
            reasoning: String::new(),
            requested_urls: Vec::new(),
            plain_summary: None,
        }
    }
}

/// The interface every analyzer plugs into.
///
/// Implementations declare their defaults; the supervisor owns the actual
/// timeout, breaker, and fallback policy around each call.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Which pipeline phase this analyzer serves.
    fn kind(&self) -> AnalyzerKind;

    /// Default timeout before adaptive adjustment.
    fn default_timeout(&self) -> Duration {
        self.kind().default_timeout()
    }

    /// Whether registered fallbacks may be invoked for this analyzer.
    fn supports_fallback(&self) -> bool {
        true
    }

    /// Whether this analyzer applies to the classified site type.
    fn applies_to(&self, _site_type: &str) -> bool {
        true
    }

    /// Perform the analysis. Must honor `cancel` within a bounded delay.
    async fn execute(
        &self,
        input: &AnalyzerInput,
        cancel: &CancellationToken,
    ) -> Result<AnalyzerOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_well_formed() {
        let out = AnalyzerOutput::placeholder(AnalyzerKind::Vision);
        assert!(out.is_well_formed());
        assert!(out.findings.is_empty());
        assert_eq!(out.data["analyzer"], "vision");
    }

    #[test]
    fn test_scout_report_round_trip() {
        let report = ScoutReport {
            site_type: "ecommerce".to_string(),
            site_type_confidence: 0.92,
            discovered_urls: vec!["https://example.com/checkout".to_string()],
            complexity: ComplexitySignals {
                dom_nodes: 1200,
                ..Default::default()
            },
        };
        let output = report.clone().into_output().unwrap();
        let parsed = ScoutReport::from_output(&output).unwrap();
        assert_eq!(parsed.site_type, "ecommerce");
        assert_eq!(parsed.discovered_urls.len(), 1);
        assert_eq!(parsed.complexity.dom_nodes, 1200);
    }

    #[test]
    fn test_judge_decision_unknown() {
        let decision = JudgeDecision::unknown();
        assert_eq!(decision.action, JudgeAction::RenderVerdict);
        assert_eq!(decision.trust_score, 0.0);
        assert_eq!(decision.risk_level, "unknown");
    }

    #[test]
    fn test_default_timeouts_cover_all_kinds() {
        for kind in AnalyzerKind::all() {
            assert!(kind.default_timeout() >= kind.minimum_timeout());
        }
    }
}
