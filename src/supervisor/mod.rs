//! Analyzer supervision: adaptive timeouts, circuit breakers, fallbacks.
//!
//! Every analyzer call the orchestrator makes goes through
//! [`AnalyzerSupervisor::execute`]. The supervisor owns the timeout and
//! breaker policy around the call and converts every failure into a
//! well-formed [`DegradedResult`]; failures never propagate upward.

pub mod breaker;
pub mod degraded;
pub mod timeout;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use degraded::{
    DegradedResult, FailureMode, FallbackMode, FallbackProducer, FallbackRegistry, FnFallback,
    QualityLedger, PENALTY_FALLBACK, PENALTY_NONE, PENALTY_PARTIAL,
};
pub use timeout::{select_timeout, ExecutionHistory, TimeoutConfig, EMA_ALPHA};

use crate::analyzer::{Analyzer, AnalyzerInput, AnalyzerKind, AnalyzerOutput};
use crate::complexity::{ComplexitySignals, TimeoutStrategy};
use crate::config::AuditConfig;
use crate::error::Error;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Result of a supervised analyzer call.
#[derive(Debug, Clone)]
pub enum SupervisedOutcome {
    /// The primary call succeeded
    Primary(AnalyzerOutput),
    /// A fallback path produced a degraded result
    Degraded(DegradedResult),
}

impl SupervisedOutcome {
    /// The usable payload, primary or degraded.
    pub fn output(&self) -> &AnalyzerOutput {
        match self {
            Self::Primary(output) => output,
            Self::Degraded(degraded) => &degraded.result_data,
        }
    }

    /// Consume into the usable payload.
    pub fn into_output(self) -> AnalyzerOutput {
        match self {
            Self::Primary(output) => output,
            Self::Degraded(degraded) => degraded.result_data,
        }
    }

    /// Quality penalty incurred by this call (0 for a primary result).
    pub fn quality_penalty(&self) -> f64 {
        match self {
            Self::Primary(_) => 0.0,
            Self::Degraded(degraded) => degraded.quality_penalty,
        }
    }

    /// Whether a fallback path produced this result.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    /// The fallback mode, when degraded.
    pub fn fallback_mode(&self) -> Option<FallbackMode> {
        match self {
            Self::Primary(_) => None,
            Self::Degraded(degraded) => Some(degraded.fallback_mode),
        }
    }
}

/// Outcome of the raw primary call, captured before policy is applied.
enum CallResult {
    Ok(AnalyzerOutput),
    Failed(Error),
    TimedOut,
    Cancelled,
}

/// Wraps analyzer calls with timeout, breaker, and fallback policy.
pub struct AnalyzerSupervisor {
    use_adaptive_timeout: bool,
    use_circuit_breaker: bool,
    overrides: HashMap<AnalyzerKind, Duration>,
    breaker_config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    history: ExecutionHistory,
    registry: FallbackRegistry,
}

impl AnalyzerSupervisor {
    /// Create a supervisor from the audit configuration.
    pub fn new(config: &AuditConfig, registry: FallbackRegistry) -> Self {
        let overrides = config
            .timeout_overrides
            .iter()
            .map(|(kind, ms)| (*kind, Duration::from_millis(*ms)))
            .collect();

        Self {
            use_adaptive_timeout: config.flags.use_adaptive_timeout,
            use_circuit_breaker: config.flags.use_circuit_breaker,
            overrides,
            breaker_config: BreakerConfig::default(),
            breakers: RwLock::new(HashMap::new()),
            history: ExecutionHistory::new(),
            registry,
        }
    }

    /// Override the breaker configuration.
    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.breaker_config.clone()))),
        )
    }

    /// Execute one analyzer call under full supervision.
    ///
    /// Always returns within the applied timeout plus a small overhead,
    /// regardless of analyzer misbehavior.
    #[instrument(skip_all, fields(analyzer = %analyzer.kind(), url = %input.url))]
    pub async fn execute(
        &self,
        analyzer: &dyn Analyzer,
        input: &AnalyzerInput,
        complexity: Option<ComplexitySignals>,
        cancel: &CancellationToken,
    ) -> SupervisedOutcome {
        self.execute_keyed(analyzer.kind().as_str(), analyzer, input, complexity, None, cancel)
            .await
    }

    /// Execute with an explicit breaker key and timeout.
    ///
    /// Security modules run as mini-analyzers with their own breaker keys
    /// and per-module timeouts.
    pub async fn execute_keyed(
        &self,
        breaker_key: &str,
        analyzer: &dyn Analyzer,
        input: &AnalyzerInput,
        complexity: Option<ComplexitySignals>,
        explicit_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> SupervisedOutcome {
        let kind = analyzer.kind();
        let site_type = input.site_type.as_deref().unwrap_or("unknown");
        let applied_timeout = self.applied_timeout(kind, site_type, complexity, explicit_timeout);

        let breaker = self.breaker(breaker_key);
        if self.use_circuit_breaker && !breaker.can_proceed() {
            warn!(breaker = breaker_key, "call rejected by open circuit");
            return self.fallback(analyzer, input, FailureMode::BreakerOpen).await;
        }

        let child = cancel.child_token();
        let started = Instant::now();
        let result = {
            let call_token = child.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => CallResult::Cancelled,
                outcome = tokio::time::timeout(applied_timeout, analyzer.execute(input, &call_token)) => {
                    match outcome {
                        Ok(Ok(output)) => CallResult::Ok(output),
                        Ok(Err(err)) => CallResult::Failed(err),
                        Err(_) => CallResult::TimedOut,
                    }
                }
            }
        };

        match result {
            CallResult::Ok(output) => {
                let elapsed = started.elapsed();
                self.history.record(site_type, kind, elapsed);
                breaker.record_success();
                debug!(elapsed_ms = elapsed.as_millis() as u64, "analyzer call succeeded");
                SupervisedOutcome::Primary(output)
            }
            CallResult::Failed(err) => {
                warn!(error = %err, "analyzer call failed");
                breaker.record_failure();
                self.fallback(analyzer, input, FailureMode::Exception).await
            }
            CallResult::TimedOut => {
                warn!(timeout_ms = applied_timeout.as_millis() as u64, "analyzer call timed out");
                child.cancel();
                breaker.record_failure();
                self.fallback(analyzer, input, FailureMode::Timeout).await
            }
            CallResult::Cancelled => {
                // The audit is being torn down. The abandoned work is not
                // the analyzer's fault, so the breaker is not charged.
                debug!("analyzer call abandoned on cancellation");
                child.cancel();
                SupervisedOutcome::Degraded(
                    DegradedResult::partial(AnalyzerOutput::placeholder(kind))
                        .with_missing_data(vec![format!("{kind} result (cancelled)")]),
                )
            }
        }
    }

    fn applied_timeout(
        &self,
        kind: AnalyzerKind,
        site_type: &str,
        complexity: Option<ComplexitySignals>,
        explicit_timeout: Option<Duration>,
    ) -> Duration {
        let override_timeout = explicit_timeout.or_else(|| self.overrides.get(&kind).copied());
        if !self.use_adaptive_timeout {
            return override_timeout.unwrap_or_else(|| kind.default_timeout());
        }

        let strategy = complexity
            .map(|signals| signals.strategy())
            .unwrap_or(TimeoutStrategy::Standard);
        let table = TimeoutConfig::for_strategy(strategy);
        let history = self.history.mean(site_type, kind);
        select_timeout(kind, &table, history, override_timeout)
    }

    async fn fallback(
        &self,
        analyzer: &dyn Analyzer,
        input: &AnalyzerInput,
        mode: FailureMode,
    ) -> SupervisedOutcome {
        let kind = analyzer.kind();
        if analyzer.supports_fallback() {
            for producer in self.registry.producers_for(kind, mode) {
                if let Some(mut degraded) = producer.produce(input, mode).await {
                    if !degraded.result_data.is_well_formed() {
                        degraded.result_data = AnalyzerOutput::placeholder(kind);
                    }
                    debug!(mode = %degraded.fallback_mode, "fallback produced degraded result");
                    return SupervisedOutcome::Degraded(degraded);
                }
            }
        }

        SupervisedOutcome::Degraded(
            DegradedResult::placeholder(kind)
                .with_missing_data(vec![format!("{kind} primary result")]),
        )
    }

    /// Read-only statistics for breakers and execution history.
    pub fn stats(&self) -> SupervisorStats {
        let breakers = self
            .breakers
            .read()
            .values()
            .map(|b| b.stats())
            .collect();
        let history = self
            .history
            .snapshot()
            .into_iter()
            .map(|((site_type, analyzer), mean_secs)| HistoryEntry {
                site_type,
                analyzer,
                mean_secs,
            })
            .collect();
        SupervisorStats { breakers, history }
    }

    /// Execution history handle, shared with the progress estimator.
    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }
}

/// One EMA entry in the supervisor stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub site_type: String,
    pub analyzer: AnalyzerKind,
    pub mean_secs: f64,
}

/// Read-only supervisor statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub breakers: Vec<BreakerStats>,
    pub history: Vec<HistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Analyzer that fails a configurable number of times, then succeeds.
    struct FlakyAnalyzer {
        kind: AnalyzerKind,
        failures_remaining: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyAnalyzer {
        fn failing(kind: AnalyzerKind, failures: u32) -> Self {
            Self {
                kind,
                failures_remaining: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Analyzer for FlakyAnalyzer {
        fn kind(&self) -> AnalyzerKind {
            self.kind
        }

        async fn execute(
            &self,
            _input: &AnalyzerInput,
            _cancel: &CancellationToken,
        ) -> Result<AnalyzerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Internal("synthetic failure".to_string()));
            }
            Ok(AnalyzerOutput::with_data(serde_json::json!({"ok": true})))
        }
    }

    /// Analyzer that never completes until cancelled.
    struct HangingAnalyzer;

    #[async_trait]
    impl Analyzer for HangingAnalyzer {
        fn kind(&self) -> AnalyzerKind {
            AnalyzerKind::Vision
        }

        async fn execute(
            &self,
            _input: &AnalyzerInput,
            cancel: &CancellationToken,
        ) -> Result<AnalyzerOutput> {
            cancel.cancelled().await;
            Err(Error::Cancelled)
        }
    }

    fn supervisor() -> AnalyzerSupervisor {
        AnalyzerSupervisor::new(&AuditConfig::default(), FallbackRegistry::new())
    }

    #[tokio::test]
    async fn test_primary_success() {
        let sup = supervisor();
        let analyzer = FlakyAnalyzer::failing(AnalyzerKind::Scout, 0);
        let input = AnalyzerInput::for_url("https://example.com");
        let cancel = CancellationToken::new();

        let outcome = sup.execute(&analyzer, &input, None, &cancel).await;
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.quality_penalty(), 0.0);
        assert_eq!(outcome.output().data["ok"], true);
    }

    #[tokio::test]
    async fn test_failure_without_fallback_yields_placeholder() {
        let sup = supervisor();
        let analyzer = FlakyAnalyzer::failing(AnalyzerKind::Vision, 1);
        let input = AnalyzerInput::for_url("https://example.com");
        let cancel = CancellationToken::new();

        let outcome = sup.execute(&analyzer, &input, None, &cancel).await;
        assert!(outcome.is_degraded());
        assert_eq!(outcome.fallback_mode(), Some(FallbackMode::None));
        assert_eq!(outcome.quality_penalty(), PENALTY_NONE);
        assert!(outcome.output().is_well_formed());
    }

    #[tokio::test]
    async fn test_registered_fallback_is_used() {
        let mut registry = FallbackRegistry::new();
        registry.register(
            AnalyzerKind::Vision,
            FailureMode::Exception,
            Arc::new(FnFallback(|_: &AnalyzerInput, _| {
                Some(DegradedResult::new(
                    AnalyzerOutput::with_data(serde_json::json!({"cached": true})),
                    FallbackMode::Cached,
                ))
            })),
        );
        let sup = AnalyzerSupervisor::new(&AuditConfig::default(), registry);
        let analyzer = FlakyAnalyzer::failing(AnalyzerKind::Vision, 1);
        let input = AnalyzerInput::for_url("https://example.com");
        let cancel = CancellationToken::new();

        let outcome = sup.execute(&analyzer, &input, None, &cancel).await;
        assert_eq!(outcome.fallback_mode(), Some(FallbackMode::Cached));
        assert_eq!(outcome.quality_penalty(), PENALTY_FALLBACK);
        assert_eq!(outcome.output().data["cached"], true);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_skips_analyzer() {
        let sup = supervisor();
        let analyzer = FlakyAnalyzer::failing(AnalyzerKind::Vision, u32::MAX);
        let input = AnalyzerInput::for_url("https://example.com");
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let outcome = sup.execute(&analyzer, &input, None, &cancel).await;
            assert!(outcome.is_degraded());
        }
        assert_eq!(analyzer.calls(), 3);

        // Fourth call is rejected without invoking the analyzer
        let outcome = sup.execute(&analyzer, &input, None, &cancel).await;
        assert!(outcome.is_degraded());
        assert_eq!(analyzer.calls(), 3);

        let stats = sup.stats();
        let breaker = stats.breakers.iter().find(|b| b.name == "vision").unwrap();
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.total_rejected, 1);
    }

    #[tokio::test]
    async fn test_timeout_produces_degraded_result() {
        let sup = supervisor();
        let analyzer = HangingAnalyzer;
        let input = AnalyzerInput::for_url("https://example.com");
        let cancel = CancellationToken::new();

        let outcome = sup
            .execute_keyed(
                "vision",
                &analyzer,
                &input,
                None,
                Some(Duration::from_millis(20)),
                &cancel,
            )
            .await;
        assert!(outcome.is_degraded());
        assert!(outcome.output().is_well_formed());
    }

    #[tokio::test]
    async fn test_cancellation_returns_partial_without_breaker_credit() {
        let sup = supervisor();
        let analyzer = HangingAnalyzer;
        let input = AnalyzerInput::for_url("https://example.com");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = sup.execute(&analyzer, &input, None, &cancel).await;
        assert_eq!(outcome.fallback_mode(), Some(FallbackMode::Partial));
        assert_eq!(outcome.quality_penalty(), PENALTY_PARTIAL);

        // The breaker saw no failure
        let stats = sup.stats();
        let breaker = stats.breakers.iter().find(|b| b.name == "vision").unwrap();
        assert_eq!(breaker.total_failures, 0);
        assert_eq!(breaker.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_records_history() {
        let sup = supervisor();
        let analyzer = FlakyAnalyzer::failing(AnalyzerKind::Scout, 0);
        let input = AnalyzerInput::for_url("https://example.com").with_site_type("ecommerce");
        let cancel = CancellationToken::new();

        let _ = sup.execute(&analyzer, &input, None, &cancel).await;
        assert!(sup
            .history()
            .mean("ecommerce", AnalyzerKind::Scout)
            .is_some());
    }
}
