//! Audit orchestration engine.
//!
//! The engine drives the audit pipeline as a plain cooperative loop:
//!
//! ```text
//! START -> SCOUT -> SECURITY || VISION -> GRAPH -> JUDGE
//!                                                    |
//!              +------------- route ----------------+
//!              v                                     |
//!         REQUEST_MORE -> SCOUT (next pending URL)   |
//!              |                                     |
//!              +--> END <- FORCE_VERDICT <-----------+
//! ```
//!
//! Budgets (iterations, pages, wall clock) are checked before each phase;
//! exhaustion routes through one final forced judge call rather than
//! erroring. Analyzer failures never escape the supervisor: the loop only
//! terminates early on cancellation or an internal invariant violation.

use crate::analyzer::{
    Analyzer, AnalyzerInput, AnalyzerKind, JudgeAction, JudgeDecision, ScoutReport,
};
use crate::config::{AuditConfig, ExecutionMode};
use crate::consensus::{ConsensusEngine, ConsensusResult};
use crate::error::{Error, Result};
use crate::finding::{CweCvssMapper, Finding, NullCweCvssMapper, SourceAgent};
use crate::progress::{EventSink, NullSink, ProgressEmitter, ProgressEvent};
use crate::security::{SecurityModuleSpec, SecurityTierScheduler};
use crate::state::{AuditErrorRecord, AuditState, AuditStatus};
use crate::supervisor::{AnalyzerSupervisor, FallbackRegistry, QualityLedger, SupervisorStats};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Per-agent signal contribution in the final result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSignal {
    /// Findings attributed to this agent
    pub findings: usize,
    /// Severity-and-confidence weighted signal in [0, 100]
    pub signal: f64,
}

/// Technical and non-technical verdict variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualVerdict {
    /// Full reasoning for technical consumers
    pub technical: String,
    /// Plain-language summary
    pub plain: String,
}

/// Run metadata attached to every audit result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditMetadata {
    pub iterations: u32,
    pub pages_investigated: usize,
    pub elapsed_seconds: f64,
    pub execution_mode: ExecutionMode,
    /// Agents that incurred any quality penalty
    pub degraded_agents: Vec<String>,
    /// Combined quality multiplier applied to the trust score
    pub quality_multiplier: f64,
    /// Progress events dropped by the rate limiter
    pub dropped_events: u64,
    pub vlm_calls_used: u32,
    pub site_type: String,
    pub site_type_confidence: f64,
    /// Failures recorded during the run
    pub errors: Vec<AuditErrorRecord>,
}

/// Final output of one audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    /// Trust score in [0, 100] after quality penalties
    pub trust_score: f64,
    /// Risk level label from the judge
    pub risk_level: String,
    /// Terminal status
    pub status: AuditStatus,
    /// Whether the verdict was forced by budget exhaustion
    pub forced: bool,
    /// Consensus entries confirmed by multiple agents
    pub confirmed_findings: Vec<ConsensusResult>,
    /// Consensus entries where agents disagreed
    pub conflicted_findings: Vec<ConsensusResult>,
    /// Single-source consensus entries
    pub unconfirmed_findings: Vec<ConsensusResult>,
    /// Per-agent signal contributions
    pub signal_breakdown: HashMap<String, AgentSignal>,
    /// Technical / plain verdict pair, when enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dual_verdict: Option<DualVerdict>,
    /// Run metadata
    pub metadata: AuditMetadata,
}

/// Builder for [`AuditEngine`].
pub struct AuditEngineBuilder {
    config: AuditConfig,
    sink: Option<Arc<dyn EventSink>>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    modules: Vec<SecurityModuleSpec>,
    mapper: Arc<dyn CweCvssMapper>,
    registry: FallbackRegistry,
}

impl AuditEngineBuilder {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            sink: None,
            analyzers: Vec::new(),
            modules: Vec::new(),
            mapper: Arc::new(NullCweCvssMapper),
            registry: FallbackRegistry::new(),
        }
    }

    /// Set the progress event sink.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Register an analyzer for its declared kind.
    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.push(analyzer);
        self
    }

    /// Register a security module.
    pub fn security_module(mut self, spec: SecurityModuleSpec) -> Self {
        self.modules.push(spec);
        self
    }

    /// Inject the CWE/CVSS mapper.
    pub fn cwe_cvss_mapper(mut self, mapper: Arc<dyn CweCvssMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Provide the fallback registry.
    pub fn fallbacks(mut self, registry: FallbackRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Build the engine. Scout and judge analyzers are mandatory.
    pub fn build(self) -> Result<AuditEngine> {
        let mut analyzers: HashMap<AnalyzerKind, Arc<dyn Analyzer>> = HashMap::new();
        for analyzer in self.analyzers {
            analyzers.insert(analyzer.kind(), analyzer);
        }
        for required in [AnalyzerKind::Scout, AnalyzerKind::Judge] {
            if !analyzers.contains_key(&required) {
                return Err(Error::Config(format!(
                    "missing required analyzer: {required}"
                )));
            }
        }

        let mut security = SecurityTierScheduler::new(self.mapper);
        for spec in self.modules {
            security.register(spec);
        }

        let supervisor = AnalyzerSupervisor::new(&self.config, self.registry);

        Ok(AuditEngine {
            sink: self.sink.unwrap_or_else(|| Arc::new(NullSink)),
            config: self.config,
            analyzers,
            security,
            supervisor,
        })
    }
}

/// The audit orchestration engine.
///
/// Long-lived; breaker and EMA state persists across audits run on the
/// same engine. Each `audit` call owns its state, consensus, and emitter
/// exclusively.
pub struct AuditEngine {
    config: AuditConfig,
    analyzers: HashMap<AnalyzerKind, Arc<dyn Analyzer>>,
    security: SecurityTierScheduler,
    supervisor: AnalyzerSupervisor,
    sink: Arc<dyn EventSink>,
}

/// Per-audit working set threaded through the phases.
struct AuditRun<'a> {
    state: AuditState,
    consensus: ConsensusEngine,
    ledger: QualityLedger,
    emitter: &'a ProgressEmitter,
    deadline: Instant,
}

impl AuditEngine {
    /// Start building an engine.
    pub fn builder(config: AuditConfig) -> AuditEngineBuilder {
        AuditEngineBuilder::new(config)
    }

    /// Audit one URL.
    ///
    /// Always closes the progress stream with a final `audit_complete`
    /// event. Returns `Err` only for cancellation or an internal
    /// invariant violation; every analyzer-level failure degrades instead.
    #[instrument(skip(self, cancel), fields(tier = %self.config.tier))]
    pub async fn audit(&self, url: &str, cancel: &CancellationToken) -> Result<AuditResult> {
        if url.trim().is_empty() {
            return Err(Error::Config("audit target URL must be non-empty".into()));
        }

        info!(url, "audit started");
        let emitter = ProgressEmitter::new(Arc::clone(&self.sink), &self.config);
        let mut run = AuditRun {
            state: AuditState::new(url, self.config.tier, self.config.execution_mode),
            consensus: ConsensusEngine::new(self.config.min_consensus_sources),
            ledger: QualityLedger::new(),
            emitter: &emitter,
            deadline: Instant::now() + self.config.tier.deadline(),
        };

        let outcome = self.drive(&mut run, cancel).await;
        let failure = match outcome {
            Ok(()) => None,
            Err(Error::Cancelled) => {
                run.state.transition(AuditStatus::Aborted);
                run.state
                    .record_error("orchestrator", "cancelled", "cancelled by caller");
                Some(Error::Cancelled)
            }
            Err(err) => {
                run.state.transition(AuditStatus::Error);
                run.state
                    .record_error("orchestrator", "internal", err.to_string());
                Some(err)
            }
        };

        // Terminal bookkeeping happens even on failure: the consumer
        // always receives audit_result and audit_complete.
        let status = run.state.status();
        let mut result = self.assemble(run);
        let result_payload =
            serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
        emitter.emit(ProgressEvent::audit_result(result_payload));
        emitter.flush().await;
        result.metadata.dropped_events = emitter.close(status.to_string()).await;
        info!(
            status = %status,
            trust_score = result.trust_score,
            "audit finished"
        );

        match failure {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// The main phase loop.
    async fn drive(&self, run: &mut AuditRun<'_>, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(reason) = self.budget_exhausted(&run.state) {
                info!(reason, "budget exhausted; forcing verdict");
                return self.finish_forced(run, cancel).await;
            }

            let Some(url) = run.state.take_next_url() else {
                debug!("no pending URLs; forcing verdict");
                return self.finish_forced(run, cancel).await;
            };

            run.state.advance_iteration();
            run.emitter.reset_iteration();
            debug!(iteration = run.state.iteration, url = %url, "iteration started");

            self.run_scout(run, &url, cancel).await;
            if run.state.scout_failures >= self.config.max_scout_failures
                && !run.state.has_scout_results()
            {
                warn!("scout failed repeatedly with no prior results; aborting");
                run.state.record_error(
                    "scout",
                    "aborted",
                    format!(
                        "{} consecutive scout failures without a successful result",
                        run.state.scout_failures
                    ),
                );
                run.state.transition(AuditStatus::Error);
                return Ok(());
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.run_security_and_vision(run, &url, cancel).await;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.run_graph(run, &url, cancel).await;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let decision = self.run_judge(run, false, cancel).await;
            let action = decision.action;
            let requested = decision.requested_urls.clone();
            run.state.judge_decision = Some(decision);

            match action {
                JudgeAction::RenderVerdict => {
                    run.state.transition(AuditStatus::Completed);
                    return Ok(());
                }
                JudgeAction::RequestMoreInvestigation => {
                    for url in requested {
                        run.state.push_pending(url);
                    }
                    let within_budget = run.state.investigated_count() < run.state.max_pages
                        && run.state.has_pending_urls();
                    if !within_budget {
                        // Terminal routes win over another loop.
                        return self.finish_forced(run, cancel).await;
                    }
                }
            }
        }
    }

    /// One final judge call with the force flag, then END.
    async fn finish_forced(
        &self,
        run: &mut AuditRun<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        run.state.force_verdict = true;
        let decision = self.run_judge(run, true, cancel).await;
        run.state.judge_decision = Some(decision);
        run.state.transition(AuditStatus::Completed);
        Ok(())
    }

    /// Budget check applied before each iteration.
    fn budget_exhausted(&self, state: &AuditState) -> Option<&'static str> {
        if state.iteration >= state.max_iterations {
            return Some("iteration budget");
        }
        if state.investigated_count() >= state.max_pages {
            return Some("page budget");
        }
        if Duration::from_secs_f64(state.elapsed_seconds()) >= self.config.tier.deadline() {
            return Some("tier deadline");
        }
        None
    }

    fn analyzer(&self, kind: AnalyzerKind) -> Option<&Arc<dyn Analyzer>> {
        self.analyzers.get(&kind)
    }

    /// Base input snapshot for the current state of the audit.
    fn input_for(&self, state: &AuditState, url: &str) -> AnalyzerInput {
        let mut input = AnalyzerInput::for_url(url).with_iteration(state.iteration);
        if let Some(site_type) = &state.site_type {
            input = input.with_site_type(site_type.clone());
        }
        if let Some(scout) = state.scout_results.get(url) {
            input = input.with_scout_result(scout.data.clone());
        }
        input
    }

    async fn run_scout(&self, run: &mut AuditRun<'_>, url: &str, cancel: &CancellationToken) {
        let Some(scout) = self.analyzer(AnalyzerKind::Scout) else {
            return;
        };
        run.emitter.emit(ProgressEvent::phase_start("scout"));
        run.emitter.agent_started(AnalyzerKind::Scout);
        let started = Instant::now();

        let input = self.input_for(&run.state, url);
        let complexity = run
            .state
            .scout_results
            .get(url)
            .and_then(|output| ScoutReport::from_output(output).ok())
            .map(|report| report.complexity);
        let outcome = self
            .supervisor
            .execute(scout.as_ref(), &input, complexity, cancel)
            .await;

        run.ledger
            .record(AnalyzerKind::Scout, outcome.quality_penalty());
        if outcome.is_degraded() {
            run.state.scout_failures += 1;
            run.state.record_error(
                "scout",
                "degraded",
                format!(
                    "scout degraded ({})",
                    outcome
                        .fallback_mode()
                        .map(|m| m.to_string())
                        .unwrap_or_default()
                ),
            );
            run.emitter
                .emit(ProgressEvent::phase_error("scout", "scout degraded"));
        } else {
            run.state.scout_failures = 0;
            let output = outcome.output().clone();
            if let Ok(report) = ScoutReport::from_output(&output) {
                run.state
                    .classify_site(report.site_type.clone(), report.site_type_confidence);
                run.emitter.set_site_type(run.state.site_type_or_unknown());
                for discovered in report.discovered_urls {
                    run.state.push_pending(discovered);
                }
            }
            for finding in &output.findings {
                self.ingest(run, finding.clone());
            }
            run.state.scout_results.insert(url.to_string(), output);
        }

        run.emitter
            .agent_completed(AnalyzerKind::Scout, started.elapsed());
        run.emitter.emit(ProgressEvent::phase_complete(
            "scout",
            started.elapsed().as_millis() as u64,
        ));
    }

    /// Security and vision are independent; in parallel-tier mode they run
    /// concurrently and merge at the phase boundary.
    async fn run_security_and_vision(
        &self,
        run: &mut AuditRun<'_>,
        url: &str,
        cancel: &CancellationToken,
    ) {
        let input = self.input_for(&run.state, url);
        let budget_remaining = run.deadline.saturating_duration_since(Instant::now());

        run.emitter.emit(ProgressEvent::phase_start("security"));
        run.emitter.agent_started(AnalyzerKind::Security);
        let security_started = Instant::now();
        let security_fut = self
            .security
            .run_security(&input, &self.supervisor, budget_remaining, cancel);

        let vision = self.analyzer(AnalyzerKind::Vision);
        let vision_fut = async {
            let Some(vision) = vision else { return None };
            run.emitter.emit(ProgressEvent::phase_start("vision"));
            run.emitter.agent_started(AnalyzerKind::Vision);
            let started = Instant::now();
            let outcome = self
                .supervisor
                .execute(vision.as_ref(), &input, None, cancel)
                .await;
            Some((outcome, started.elapsed()))
        };

        let (security_report, vision_outcome) = match run.state.execution_mode {
            ExecutionMode::ParallelTier => tokio::join!(security_fut, vision_fut),
            ExecutionMode::Cooperative => {
                let security_report = security_fut.await;
                let vision_outcome = vision_fut.await;
                (security_report, vision_outcome)
            }
        };

        // Merge security results
        run.ledger
            .record(AnalyzerKind::Security, security_report.worst_penalty());
        if security_report.is_degraded() {
            run.emitter.emit(ProgressEvent::phase_error(
                "security",
                "one or more security modules degraded",
            ));
        }
        for security_finding in &security_report.findings {
            self.ingest(run, security_finding.finding.clone());
        }
        run.state
            .security_results
            .extend(security_report.findings);
        run.emitter
            .agent_completed(AnalyzerKind::Security, security_started.elapsed());
        run.emitter.emit(ProgressEvent::phase_complete(
            "security",
            security_started.elapsed().as_millis() as u64,
        ));

        // Merge vision results
        if let Some((outcome, elapsed)) = vision_outcome {
            run.state.vlm_calls_used += 1;
            run.ledger
                .record(AnalyzerKind::Vision, outcome.quality_penalty());
            if outcome.is_degraded() {
                run.state.record_error(
                    "vision",
                    "degraded",
                    format!(
                    "vision degraded ({})",
                    outcome
                        .fallback_mode()
                        .map(|m| m.to_string())
                        .unwrap_or_default()
                ),
                );
                run.emitter
                    .emit(ProgressEvent::phase_error("vision", "vision degraded"));
            }
            let output = outcome.into_output();
            for finding in &output.findings {
                self.ingest(run, finding.clone());
            }
            run.state.vision_result = Some(output);
            run.emitter.agent_completed(AnalyzerKind::Vision, elapsed);
            run.emitter.emit(ProgressEvent::phase_complete(
                "vision",
                elapsed.as_millis() as u64,
            ));
        }
    }

    async fn run_graph(&self, run: &mut AuditRun<'_>, url: &str, cancel: &CancellationToken) {
        let Some(graph) = self.analyzer(AnalyzerKind::Graph) else {
            return;
        };
        run.emitter.emit(ProgressEvent::phase_start("graph"));
        run.emitter.agent_started(AnalyzerKind::Graph);
        let started = Instant::now();

        let input = self.input_for(&run.state, url);
        let outcome = self
            .supervisor
            .execute(graph.as_ref(), &input, None, cancel)
            .await;

        run.ledger
            .record(AnalyzerKind::Graph, outcome.quality_penalty());
        if outcome.is_degraded() {
            run.state.record_error(
                "graph",
                "degraded",
                format!(
                    "graph degraded ({})",
                    outcome
                        .fallback_mode()
                        .map(|m| m.to_string())
                        .unwrap_or_default()
                ),
            );
            run.emitter
                .emit(ProgressEvent::phase_error("graph", "graph degraded"));
        }
        let output = outcome.into_output();
        for finding in &output.findings {
            self.ingest(run, finding.clone());
        }
        run.state.graph_result = Some(output);

        run.emitter
            .agent_completed(AnalyzerKind::Graph, started.elapsed());
        run.emitter.emit(ProgressEvent::phase_complete(
            "graph",
            started.elapsed().as_millis() as u64,
        ));
    }

    async fn run_judge(
        &self,
        run: &mut AuditRun<'_>,
        force: bool,
        cancel: &CancellationToken,
    ) -> JudgeDecision {
        let Some(judge) = self.analyzer(AnalyzerKind::Judge) else {
            return JudgeDecision::unknown();
        };
        run.emitter.emit(ProgressEvent::phase_start("judge"));
        run.emitter.agent_started(AnalyzerKind::Judge);
        let started = Instant::now();

        let context = serde_json::json!({
            "consensus": run.consensus.snapshot(),
            "iteration": run.state.iteration,
            "investigated": run.state.investigated_count(),
            "site_type": run.state.site_type_or_unknown(),
        });
        let url = run.state.url.clone();
        let mut input = self.input_for(&run.state, &url).with_context(context);
        input.force_verdict = force;

        let outcome = self
            .supervisor
            .execute(judge.as_ref(), &input, None, cancel)
            .await;
        run.ledger
            .record(AnalyzerKind::Judge, outcome.quality_penalty());

        let decision = match JudgeDecision::from_output(outcome.output()) {
            Ok(decision) => decision,
            Err(err) => {
                // A judge that cannot produce a parsable verdict leaves
                // the audit with an unknown one.
                warn!(error = %err, "judge output unparsable");
                run.state
                    .record_error("judge", "contract", err.to_string());
                JudgeDecision::unknown()
            }
        };

        run.emitter
            .agent_completed(AnalyzerKind::Judge, started.elapsed());
        run.emitter.emit(ProgressEvent::phase_complete(
            "judge",
            started.elapsed().as_millis() as u64,
        ));
        decision
    }

    /// Feed a finding into consensus and the event stream.
    fn ingest(&self, run: &mut AuditRun<'_>, finding: Finding) {
        run.emitter.emit_finding(finding.clone());
        if let Err(err) = run.consensus.ingest(finding) {
            // An illegal transition is a bug; record it without killing
            // the audit.
            warn!(error = %err, "consensus rejected finding");
            run.state
                .record_error("consensus", "transition", err.to_string());
        }
    }

    /// Assemble the final result from the run's terminal state.
    fn assemble(&self, run: AuditRun<'_>) -> AuditResult {
        let AuditRun {
            state,
            consensus,
            ledger,
            ..
        } = run;

        let decision = state
            .judge_decision
            .clone()
            .unwrap_or_else(JudgeDecision::unknown);
        let multiplier = ledger.multiplier();
        let trust_score = if state.status() == AuditStatus::Error {
            0.0
        } else {
            (decision.trust_score * multiplier).clamp(0.0, 100.0)
        };
        let risk_level = if state.status() == AuditStatus::Error {
            "unknown".to_string()
        } else {
            decision.risk_level.clone()
        };

        let snapshot = consensus.snapshot();
        let signal_breakdown = signal_breakdown(&snapshot);
        let partition = |status: crate::consensus::ConsensusStatus| -> Vec<ConsensusResult> {
            snapshot
                .iter()
                .filter(|entry| entry.status == status)
                .cloned()
                .collect()
        };

        let dual_verdict = self.config.flags.use_dual_verdict.then(|| DualVerdict {
            technical: decision.reasoning.clone(),
            plain: decision.plain_summary.clone().unwrap_or_else(|| {
                format!(
                    "This site scored {:.0}/100 ({}).",
                    trust_score, risk_level
                )
            }),
        });

        AuditResult {
            trust_score,
            risk_level,
            status: state.status(),
            forced: state.force_verdict,
            confirmed_findings: partition(crate::consensus::ConsensusStatus::Confirmed),
            conflicted_findings: partition(crate::consensus::ConsensusStatus::Conflicted),
            unconfirmed_findings: partition(crate::consensus::ConsensusStatus::Unconfirmed),
            signal_breakdown,
            dual_verdict,
            metadata: AuditMetadata {
                iterations: state.iteration,
                pages_investigated: state.investigated_count(),
                elapsed_seconds: state.elapsed_seconds(),
                execution_mode: state.execution_mode,
                degraded_agents: ledger
                    .degraded_agents()
                    .iter()
                    .map(|kind| kind.to_string())
                    .collect(),
                quality_multiplier: multiplier,
                dropped_events: 0,
                vlm_calls_used: state.vlm_calls_used,
                site_type: state.site_type_or_unknown().to_string(),
                site_type_confidence: state.site_type_confidence,
                errors: state.errors,
            },
        }
    }

    /// Supervisor statistics (breakers, EMA history).
    pub fn supervisor_stats(&self) -> SupervisorStats {
        self.supervisor.stats()
    }
}

/// Severity-and-confidence weighted per-agent signal.
fn signal_breakdown(snapshot: &[ConsensusResult]) -> HashMap<String, AgentSignal> {
    let mut grouped: HashMap<SourceAgent, Vec<f64>> = HashMap::new();
    for entry in snapshot {
        for finding in &entry.sources {
            grouped
                .entry(finding.source_agent)
                .or_default()
                .push(finding.severity.confidence_factor() * finding.confidence * 100.0);
        }
    }

    grouped
        .into_iter()
        .map(|(agent, signals)| {
            let mean = signals.iter().sum::<f64>() / signals.len() as f64;
            (
                agent.to_string(),
                AgentSignal {
                    findings: signals.len(),
                    signal: mean,
                },
            )
        })
        .collect()
}
