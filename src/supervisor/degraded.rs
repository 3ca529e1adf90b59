//! Degraded results and the fallback registry.
//!
//! When a primary analyzer call fails, times out, or is rejected by its
//! circuit breaker, the supervisor produces a `DegradedResult` instead of
//! propagating the failure. The payload is always well-formed; consumers
//! never see a hole where a result should be.

use crate::analyzer::{AnalyzerInput, AnalyzerKind, AnalyzerOutput};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Quality penalty for a fallback that produced usable data.
pub const PENALTY_FALLBACK: f64 = 0.2;
/// Quality penalty for a timeout salvaged with partial data.
pub const PENALTY_PARTIAL: f64 = 0.5;
/// Quality penalty when no fallback succeeded.
pub const PENALTY_NONE: f64 = 0.7;

/// How a primary analyzer call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// The adaptive timeout elapsed
    Timeout,
    /// The circuit breaker rejected the call
    BreakerOpen,
    /// The analyzer returned an error or violated its contract
    Exception,
    /// The caller's cancellation signal fired mid-call
    Cancelled,
}

/// The fallback path that produced a degraded result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Minimal placeholder; empty findings but well-formed shape
    None,
    /// Cheaper sub-algorithm ran instead of the primary
    Simplified,
    /// Last successful result for the same URL
    Cached,
    /// Whatever was collected before the failure
    Partial,
    /// Secondary provider answered
    Alternative,
}

impl std::fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Simplified => write!(f, "simplified"),
            Self::Cached => write!(f, "cached"),
            Self::Partial => write!(f, "partial"),
            Self::Alternative => write!(f, "alternative"),
        }
    }
}

/// A well-formed but lower-quality analyzer result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedResult {
    /// Usable payload; never empty
    pub result_data: AnalyzerOutput,
    /// Which fallback path produced it
    pub fallback_mode: FallbackMode,
    /// Names of the data the primary would have provided
    #[serde(default)]
    pub missing_data: Vec<String>,
    /// Penalty applied to the final trust score multiplier
    pub quality_penalty: f64,
}

impl DegradedResult {
    /// Build a degraded result around a fallback payload.
    pub fn new(result_data: AnalyzerOutput, fallback_mode: FallbackMode) -> Self {
        let quality_penalty = match fallback_mode {
            FallbackMode::Partial => PENALTY_PARTIAL,
            FallbackMode::None => PENALTY_NONE,
            _ => PENALTY_FALLBACK,
        };
        Self {
            result_data,
            fallback_mode,
            missing_data: Vec::new(),
            quality_penalty,
        }
    }

    /// Minimal placeholder for an analyzer with no usable fallback.
    pub fn placeholder(kind: AnalyzerKind) -> Self {
        Self::new(AnalyzerOutput::placeholder(kind), FallbackMode::None)
    }

    /// Partial result produced when a call was cancelled or timed out
    /// with data already in hand.
    pub fn partial(result_data: AnalyzerOutput) -> Self {
        Self::new(result_data, FallbackMode::Partial)
    }

    pub fn with_missing_data(mut self, missing: Vec<String>) -> Self {
        self.missing_data = missing;
        self
    }
}

/// Accumulates per-phase quality penalties into a score multiplier.
///
/// Penalties combine multiplicatively: each degraded phase contributes
/// `1 - penalty`. The multiplier never drops below 0.3 so a minimum
/// signal always survives.
#[derive(Debug, Clone, Default)]
pub struct QualityLedger {
    penalties: Vec<(AnalyzerKind, f64)>,
}

impl QualityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a penalty incurred by one analyzer.
    pub fn record(&mut self, kind: AnalyzerKind, penalty: f64) {
        if penalty > 0.0 {
            self.penalties.push((kind, penalty.clamp(0.0, PENALTY_NONE)));
        }
    }

    /// The combined score multiplier in [0.3, 1.0].
    pub fn multiplier(&self) -> f64 {
        let product: f64 = self.penalties.iter().map(|(_, p)| 1.0 - p).product();
        product.clamp(0.3, 1.0)
    }

    /// Analyzer kinds that incurred any penalty, deduplicated in order.
    pub fn degraded_agents(&self) -> Vec<AnalyzerKind> {
        let mut agents = Vec::new();
        for (kind, _) in &self.penalties {
            if !agents.contains(kind) {
                agents.push(*kind);
            }
        }
        agents
    }

    /// Whether any penalty was recorded.
    pub fn is_degraded(&self) -> bool {
        !self.penalties.is_empty()
    }
}

/// Produces a fallback result when a primary analyzer call fails.
///
/// Producers take the same input as the primary. Returning `None` means
/// this producer cannot help for this input; the supervisor tries the
/// next registered producer.
#[async_trait]
pub trait FallbackProducer: Send + Sync {
    async fn produce(&self, input: &AnalyzerInput, mode: FailureMode) -> Option<DegradedResult>;
}

/// Fallback producer backed by a plain closure.
pub struct FnFallback<F>(pub F);

#[async_trait]
impl<F> FallbackProducer for FnFallback<F>
where
    F: Fn(&AnalyzerInput, FailureMode) -> Option<DegradedResult> + Send + Sync,
{
    async fn produce(&self, input: &AnalyzerInput, mode: FailureMode) -> Option<DegradedResult> {
        (self.0)(input, mode)
    }
}

/// Registry of fallback producers keyed by analyzer and failure mode.
#[derive(Default)]
pub struct FallbackRegistry {
    producers: HashMap<(AnalyzerKind, FailureMode), Vec<Arc<dyn FallbackProducer>>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer for one analyzer and failure mode.
    pub fn register(
        &mut self,
        kind: AnalyzerKind,
        mode: FailureMode,
        producer: Arc<dyn FallbackProducer>,
    ) {
        self.producers
            .entry((kind, mode))
            .or_default()
            .push(producer);
    }

    /// Register a producer for every failure mode of one analyzer.
    pub fn register_all_modes(&mut self, kind: AnalyzerKind, producer: Arc<dyn FallbackProducer>) {
        for mode in [
            FailureMode::Timeout,
            FailureMode::BreakerOpen,
            FailureMode::Exception,
        ] {
            self.register(kind, mode, Arc::clone(&producer));
        }
    }

    /// Producers registered for an analyzer and failure mode.
    pub fn producers_for(
        &self,
        kind: AnalyzerKind,
        mode: FailureMode,
    ) -> &[Arc<dyn FallbackProducer>] {
        self.producers
            .get(&(kind, mode))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
