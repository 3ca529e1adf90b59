//! Audit configuration: tiers, budgets, feature flags, and builder.
//!
//! The configuration surface is supplied once at audit start and is
//! immutable for the lifetime of the session. Tier selection drives the
//! iteration/page budgets and the overall deadline.

use crate::analyzer::AnalyzerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Audit tier controlling overall budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditTier {
    /// Single-pass audit: 1 iteration, 1 page
    Quick,
    /// Default audit: 3 iterations, 5 pages
    Standard,
    /// Exhaustive audit: 5 iterations, 10 pages
    Deep,
}

impl AuditTier {
    /// Maximum number of judge-routed iterations for this tier.
    pub fn max_iterations(&self) -> u32 {
        match self {
            Self::Quick => 1,
            Self::Standard => 3,
            Self::Deep => 5,
        }
    }

    /// Maximum number of distinct pages investigated for this tier.
    pub fn max_pages(&self) -> usize {
        match self {
            Self::Quick => 1,
            Self::Standard => 5,
            Self::Deep => 10,
        }
    }

    /// Overall wall-clock deadline for the audit.
    pub fn deadline(&self) -> Duration {
        match self {
            Self::Quick => Duration::from_secs(120),
            Self::Standard => Duration::from_secs(300),
            Self::Deep => Duration::from_secs(600),
        }
    }
}

impl std::fmt::Display for AuditTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quick => write!(f, "quick"),
            Self::Standard => write!(f, "standard"),
            Self::Deep => write!(f, "deep"),
        }
    }
}

/// How analyzer phases are scheduled within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// One analyzer at a time on the driver task
    Cooperative,
    /// Independent subtasks (security tiers) run concurrently
    ParallelTier,
}

/// Feature flags supplied with audit preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Select timeouts from complexity + execution history
    pub use_adaptive_timeout: bool,
    /// Gate analyzer calls behind per-analyzer circuit breakers
    pub use_circuit_breaker: bool,
    /// Stream rate-limited progress events to subscribers
    pub use_progress_streaming: bool,
    /// Produce technical and non-technical verdict variants
    pub use_dual_verdict: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            use_adaptive_timeout: true,
            use_circuit_breaker: true,
            use_progress_streaming: true,
            use_dual_verdict: false,
        }
    }
}

/// Configuration for an audit session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Tier controlling budgets and deadlines
    pub tier: AuditTier,
    /// Feature flags
    pub flags: FeatureFlags,
    /// Scheduling mode for independent subtasks
    pub execution_mode: ExecutionMode,
    /// Per-analyzer timeout overrides in milliseconds
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub timeout_overrides: HashMap<AnalyzerKind, u64>,
    /// Distinct source agents required to confirm a finding (default: 2)
    pub min_consensus_sources: usize,
    /// Progress emitter refill rate in events per second (default: 5)
    pub max_rate: u32,
    /// Progress emitter burst capacity in tokens (default: 10)
    pub burst: u32,
    /// Consecutive scout failures before the audit aborts (default: 3)
    pub max_scout_failures: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            tier: AuditTier::Standard,
            flags: FeatureFlags::default(),
            execution_mode: ExecutionMode::ParallelTier,
            timeout_overrides: HashMap::new(),
            min_consensus_sources: 2,
            max_rate: 5,
            burst: 10,
            max_scout_failures: 3,
        }
    }
}

impl AuditConfig {
    /// Create a configuration for the given tier with defaults elsewhere.
    pub fn for_tier(tier: AuditTier) -> Self {
        Self {
            tier,
            ..Self::default()
        }
    }

    /// Effective timeout override for an analyzer, if configured.
    pub fn timeout_override(&self, kind: AnalyzerKind) -> Option<Duration> {
        self.timeout_overrides
            .get(&kind)
            .map(|ms| Duration::from_millis(*ms))
    }
}

/// Builder for audit configurations.
#[derive(Debug, Clone, Default)]
pub struct AuditConfigBuilder {
    config: AuditConfig,
}

impl AuditConfigBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the audit tier.
    pub fn tier(mut self, tier: AuditTier) -> Self {
        self.config.tier = tier;
        self
    }

    /// Set the execution mode.
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.config.execution_mode = mode;
        self
    }

    /// Enable or disable adaptive timeouts.
    pub fn adaptive_timeout(mut self, enabled: bool) -> Self {
        self.config.flags.use_adaptive_timeout = enabled;
        self
    }

    /// Enable or disable circuit breakers.
    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.config.flags.use_circuit_breaker = enabled;
        self
    }

    /// Enable or disable progress streaming.
    pub fn progress_streaming(mut self, enabled: bool) -> Self {
        self.config.flags.use_progress_streaming = enabled;
        self
    }

    /// Enable or disable the dual technical/non-technical verdict.
    pub fn dual_verdict(mut self, enabled: bool) -> Self {
        self.config.flags.use_dual_verdict = enabled;
        self
    }

    /// Override the timeout for one analyzer.
    pub fn timeout_override(mut self, kind: AnalyzerKind, timeout: Duration) -> Self {
        self.config
            .timeout_overrides
            .insert(kind, timeout.as_millis() as u64);
        self
    }

    /// Set the minimum distinct sources for consensus confirmation.
    pub fn min_consensus_sources(mut self, sources: usize) -> Self {
        self.config.min_consensus_sources = sources.max(1);
        self
    }

    /// Set the progress rate limiter refill rate (events per second).
    pub fn max_rate(mut self, rate: u32) -> Self {
        self.config.max_rate = rate.max(1);
        self
    }

    /// Set the progress rate limiter burst capacity.
    pub fn burst(mut self, burst: u32) -> Self {
        self.config.burst = burst.max(1);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> AuditConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_budgets() {
        assert_eq!(AuditTier::Quick.max_iterations(), 1);
        assert_eq!(AuditTier::Quick.max_pages(), 1);
        assert_eq!(AuditTier::Standard.max_iterations(), 3);
        assert_eq!(AuditTier::Standard.max_pages(), 5);
        assert_eq!(AuditTier::Deep.max_iterations(), 5);
        assert_eq!(AuditTier::Deep.max_pages(), 10);
    }

    #[test]
    fn test_tier_deadlines_increase() {
        assert!(AuditTier::Quick.deadline() < AuditTier::Standard.deadline());
        assert!(AuditTier::Standard.deadline() < AuditTier::Deep.deadline());
    }

    #[test]
    fn test_config_defaults() {
        let config = AuditConfig::default();
        assert_eq!(config.min_consensus_sources, 2);
        assert_eq!(config.max_rate, 5);
        assert_eq!(config.burst, 10);
        assert!(config.flags.use_adaptive_timeout);
        assert!(!config.flags.use_dual_verdict);
    }

    #[test]
    fn test_builder() {
        let config = AuditConfigBuilder::new()
            .tier(AuditTier::Deep)
            .dual_verdict(true)
            .timeout_override(AnalyzerKind::Vision, Duration::from_secs(45))
            .max_rate(10)
            .build();

        assert_eq!(config.tier, AuditTier::Deep);
        assert!(config.flags.use_dual_verdict);
        assert_eq!(
            config.timeout_override(AnalyzerKind::Vision),
            Some(Duration::from_secs(45))
        );
        assert_eq!(config.max_rate, 10);
    }

    #[test]
    fn test_builder_clamps_zero_rate() {
        let config = AuditConfigBuilder::new().max_rate(0).burst(0).build();
        assert_eq!(config.max_rate, 1);
        assert_eq!(config.burst, 1);
    }
}
