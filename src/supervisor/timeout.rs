//! Adaptive timeout selection.
//!
//! A `TimeoutConfig` is a per-analyzer timeout table selected from the
//! page's complexity strategy. Execution history per (site type, analyzer)
//! is tracked with an EMA; once history diverges from the defaults by more
//! than 20%, the historical mean drives the applied timeout.

use crate::analyzer::AnalyzerKind;
use crate::complexity::TimeoutStrategy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// EMA smoothing factor for execution-time history.
pub const EMA_ALPHA: f64 = 0.2;

/// Per-analyzer timeout table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub scout: Duration,
    pub vision: Duration,
    pub security: Duration,
    pub graph: Duration,
    pub judge: Duration,
    pub osint: Duration,
}

impl TimeoutConfig {
    /// Build the table for a complexity strategy by scaling the defaults.
    pub fn for_strategy(strategy: TimeoutStrategy) -> Self {
        let scale = |kind: AnalyzerKind| {
            kind.default_timeout()
                .mul_f64(strategy.multiplier())
                .max(kind.minimum_timeout())
        };
        Self {
            scout: scale(AnalyzerKind::Scout),
            vision: scale(AnalyzerKind::Vision),
            security: scale(AnalyzerKind::Security),
            graph: scale(AnalyzerKind::Graph),
            judge: scale(AnalyzerKind::Judge),
            osint: scale(AnalyzerKind::Osint),
        }
    }

    /// Timeout for one analyzer.
    pub fn get(&self, kind: AnalyzerKind) -> Duration {
        match kind {
            AnalyzerKind::Scout => self.scout,
            AnalyzerKind::Vision => self.vision,
            AnalyzerKind::Security => self.security,
            AnalyzerKind::Graph => self.graph,
            AnalyzerKind::Judge => self.judge,
            AnalyzerKind::Osint => self.osint,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::for_strategy(TimeoutStrategy::Standard)
    }
}

/// EMA of execution times keyed by (site type, analyzer).
#[derive(Debug, Default)]
pub struct ExecutionHistory {
    ema_secs: RwLock<HashMap<(String, AnalyzerKind), f64>>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observed execution time into the EMA.
    pub fn record(&self, site_type: &str, kind: AnalyzerKind, duration: Duration) {
        let mut ema = self.ema_secs.write();
        let key = (site_type.to_string(), kind);
        let secs = duration.as_secs_f64();
        ema.entry(key)
            .and_modify(|mean| *mean = EMA_ALPHA * secs + (1.0 - EMA_ALPHA) * *mean)
            .or_insert(secs);
    }

    /// Historical mean for (site type, analyzer), if any.
    pub fn mean(&self, site_type: &str, kind: AnalyzerKind) -> Option<Duration> {
        self.ema_secs
            .read()
            .get(&(site_type.to_string(), kind))
            .map(|secs| Duration::from_secs_f64(*secs))
    }

    /// Snapshot of all tracked means in seconds.
    pub fn snapshot(&self) -> HashMap<(String, AnalyzerKind), f64> {
        self.ema_secs.read().clone()
    }
}

/// Select the applied timeout for one analyzer call.
///
/// Priority: explicit override > history-driven adjustment > strategy
/// table. History only takes over once it diverges from the analyzer's
/// default by more than 20%; the applied value is then
/// `max(historical_mean * 1.2, minimum)`.
pub fn select_timeout(
    kind: AnalyzerKind,
    config: &TimeoutConfig,
    history: Option<Duration>,
    override_timeout: Option<Duration>,
) -> Duration {
    if let Some(explicit) = override_timeout {
        return explicit.max(kind.minimum_timeout());
    }

    let default = kind.default_timeout();
    if let Some(mean) = history {
        let divergence = (mean.as_secs_f64() - default.as_secs_f64()).abs();
        if divergence > 0.2 * default.as_secs_f64() {
            return mean.mul_f64(1.2).max(kind.minimum_timeout());
        }
    }

    config.get(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_tables_scale() {
        let fast = TimeoutConfig::for_strategy(TimeoutStrategy::Fast);
        let standard = TimeoutConfig::for_strategy(TimeoutStrategy::Standard);
        let conservative = TimeoutConfig::for_strategy(TimeoutStrategy::Conservative);

        assert!(fast.vision < standard.vision);
        assert!(standard.vision < conservative.vision);
        assert_eq!(standard.vision, AnalyzerKind::Vision.default_timeout());
    }

    #[test]
    fn test_override_wins() {
        let config = TimeoutConfig::default();
        let applied = select_timeout(
            AnalyzerKind::Vision,
            &config,
            Some(Duration::from_secs(300)),
            Some(Duration::from_secs(7)),
        );
        assert_eq!(applied, Duration::from_secs(7));
    }

    #[test]
    fn test_history_within_band_is_ignored() {
        let config = TimeoutConfig::default();
        // Vision default is 30s; 33s is within the 20% band
        let applied = select_timeout(
            AnalyzerKind::Vision,
            &config,
            Some(Duration::from_secs(33)),
            None,
        );
        assert_eq!(applied, config.vision);
    }

    #[test]
    fn test_divergent_history_drives_timeout() {
        let config = TimeoutConfig::default();
        // Vision default is 30s; 50s diverges by more than 20%
        let applied = select_timeout(
            AnalyzerKind::Vision,
            &config,
            Some(Duration::from_secs(50)),
            None,
        );
        assert_eq!(applied, Duration::from_secs(60));
    }

    #[test]
    fn test_divergent_fast_history_floors_at_minimum() {
        let config = TimeoutConfig::default();
        let applied = select_timeout(
            AnalyzerKind::Vision,
            &config,
            Some(Duration::from_secs(1)),
            None,
        );
        assert_eq!(applied, AnalyzerKind::Vision.minimum_timeout());
    }

    #[test]
    fn test_ema_converges() {
        let history = ExecutionHistory::new();
        history.record("ecommerce", AnalyzerKind::Scout, Duration::from_secs(10));
        assert_eq!(
            history.mean("ecommerce", AnalyzerKind::Scout),
            Some(Duration::from_secs(10))
        );

        // EMA folds new samples at alpha = 0.2
        history.record("ecommerce", AnalyzerKind::Scout, Duration::from_secs(20));
        let mean = history.mean("ecommerce", AnalyzerKind::Scout).unwrap();
        assert!((mean.as_secs_f64() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_keyed_by_site_type() {
        let history = ExecutionHistory::new();
        history.record("ecommerce", AnalyzerKind::Scout, Duration::from_secs(10));
        assert!(history.mean("news", AnalyzerKind::Scout).is_none());
    }
}
