//! Security module suite and the tiered execution scheduler.
//!
//! Security modules are mini-analyzers grouped into three tiers. Within a
//! tier all selected modules run concurrently, each behind its own
//! circuit breaker; a tier-wide deadline turns stragglers into degraded
//! placeholders instead of blocking the audit.

use crate::analyzer::{Analyzer, AnalyzerInput, AnalyzerKind, AnalyzerOutput};
use crate::error::Result;
use crate::finding::{CweCvssMapper, Finding, SecurityFinding, SourceAgent};
use crate::supervisor::{AnalyzerSupervisor, DegradedResult, FallbackMode, SupervisedOutcome};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Execution tier for a security module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleTier {
    /// Cheap checks: headers, cookies, obvious misconfigurations
    Fast,
    /// Moderate checks: TLS probing, CSP analysis
    Medium,
    /// Expensive checks: crawling sub-resources, policy audits
    Deep,
}

impl ModuleTier {
    /// Default per-module timeout for this tier.
    pub fn default_module_timeout(&self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(5),
            Self::Medium => Duration::from_secs(12),
            Self::Deep => Duration::from_secs(30),
        }
    }

    /// Tier-wide deadline; modules still running are degraded.
    pub fn deadline(&self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(10),
            Self::Medium => Duration::from_secs(30),
            Self::Deep => Duration::from_secs(60),
        }
    }

    /// Tiers in execution order.
    pub fn ordered() -> [ModuleTier; 3] {
        [Self::Fast, Self::Medium, Self::Deep]
    }
}

impl std::fmt::Display for ModuleTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Medium => write!(f, "medium"),
            Self::Deep => write!(f, "deep"),
        }
    }
}

/// One security check.
///
/// Implementations own their I/O and must honor cancellation.
#[async_trait]
pub trait SecurityModule: Send + Sync {
    /// Run the check and return raw findings.
    async fn scan(
        &self,
        input: &AnalyzerInput,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>>;
}

/// Registration record for a security module.
pub struct SecurityModuleSpec {
    /// Unique module name (also the breaker key suffix)
    pub name: String,
    /// Execution tier
    pub tier: ModuleTier,
    /// Category tag applied to the module's findings
    pub category: String,
    /// Per-module timeout; defaults to the tier's timeout
    pub timeout: Option<Duration>,
    /// The check implementation
    pub module: Arc<dyn SecurityModule>,
}

impl SecurityModuleSpec {
    pub fn new(
        name: impl Into<String>,
        tier: ModuleTier,
        category: impl Into<String>,
        module: Arc<dyn SecurityModule>,
    ) -> Self {
        Self {
            name: name.into(),
            tier,
            category: category.into(),
            timeout: None,
            module,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.tier.default_module_timeout())
    }
}

/// Adapter presenting one security module as an analyzer to the supervisor.
struct ModuleAnalyzer<'a> {
    spec: &'a SecurityModuleSpec,
}

#[async_trait]
impl Analyzer for ModuleAnalyzer<'_> {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Security
    }

    fn default_timeout(&self) -> Duration {
        self.spec.effective_timeout()
    }

    async fn execute(
        &self,
        input: &AnalyzerInput,
        cancel: &CancellationToken,
    ) -> Result<AnalyzerOutput> {
        let mut findings = self.spec.module.scan(input, cancel).await?;
        for finding in &mut findings {
            finding.source_agent = SourceAgent::Security;
        }
        Ok(AnalyzerOutput::with_findings(findings))
    }
}

/// Outcome of one module within a security run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleOutcome {
    pub name: String,
    pub tier: ModuleTier,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_mode: Option<FallbackMode>,
    pub quality_penalty: f64,
}

/// Result of a full security run across all tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityRunReport {
    /// Enriched findings, deterministically sorted
    pub findings: Vec<SecurityFinding>,
    /// Per-module outcomes, in completion order
    pub module_outcomes: Vec<ModuleOutcome>,
    /// Tiers skipped under deadline pressure
    pub skipped_tiers: Vec<ModuleTier>,
}

impl SecurityRunReport {
    /// The worst quality penalty incurred by any module.
    pub fn worst_penalty(&self) -> f64 {
        self.module_outcomes
            .iter()
            .map(|o| o.quality_penalty)
            .fold(0.0, f64::max)
    }

    /// Whether any module degraded.
    pub fn is_degraded(&self) -> bool {
        self.module_outcomes.iter().any(|o| o.degraded)
    }
}

/// Runs registered security modules tier by tier.
pub struct SecurityTierScheduler {
    modules: Vec<SecurityModuleSpec>,
    mapper: Arc<dyn CweCvssMapper>,
}

impl SecurityTierScheduler {
    pub fn new(mapper: Arc<dyn CweCvssMapper>) -> Self {
        Self {
            modules: Vec::new(),
            mapper,
        }
    }

    /// Register a module.
    pub fn register(&mut self, spec: SecurityModuleSpec) {
        self.modules.push(spec);
    }

    /// Number of registered modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Run all selected modules against one page.
    ///
    /// Tiers execute in order FAST, MEDIUM, DEEP. Modules within a tier run
    /// fully parallel through the supervisor. When the remaining audit
    /// budget cannot cover the DEEP tier deadline, DEEP is skipped and each
    /// of its modules records a simplified fallback.
    pub async fn run_security(
        &self,
        input: &AnalyzerInput,
        supervisor: &AnalyzerSupervisor,
        audit_budget_remaining: Duration,
        cancel: &CancellationToken,
    ) -> SecurityRunReport {
        let started = Instant::now();
        let mut report = SecurityRunReport::default();

        for tier in ModuleTier::ordered() {
            let selected: Vec<&SecurityModuleSpec> = self
                .modules
                .iter()
                .filter(|spec| spec.tier == tier)
                .filter(|spec| match &input.enabled_modules {
                    Some(enabled) => enabled.iter().any(|name| name == &spec.name),
                    None => true,
                })
                .collect();
            if selected.is_empty() {
                continue;
            }

            if tier == ModuleTier::Deep {
                let remaining = audit_budget_remaining.saturating_sub(started.elapsed());
                if remaining < tier.deadline() {
                    info!(
                        remaining_secs = remaining.as_secs(),
                        "skipping deep security tier under deadline pressure"
                    );
                    for spec in &selected {
                        report.module_outcomes.push(ModuleOutcome {
                            name: spec.name.clone(),
                            tier,
                            degraded: true,
                            fallback_mode: Some(FallbackMode::Simplified),
                            quality_penalty: DegradedResult::new(
                                AnalyzerOutput::placeholder(AnalyzerKind::Security),
                                FallbackMode::Simplified,
                            )
                            .quality_penalty,
                        });
                    }
                    report.skipped_tiers.push(tier);
                    continue;
                }
            }

            debug!(tier = %tier, modules = selected.len(), "launching security tier");
            let tier_deadline = tier.deadline();
            let calls = selected.iter().copied().map(|spec| {
                let adapter = ModuleAnalyzer { spec };
                let breaker_key = format!("security:{}", spec.name);
                let timeout = spec.effective_timeout();
                async move {
                    let outcome = tokio::time::timeout(
                        tier_deadline,
                        supervisor.execute_keyed(
                            &breaker_key,
                            &adapter,
                            input,
                            None,
                            Some(timeout),
                            cancel,
                        ),
                    )
                    .await;
                    (spec, outcome)
                }
            });

            for (spec, outcome) in join_all(calls).await {
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(module = %spec.name, "module missed tier deadline");
                        SupervisedOutcome::Degraded(DegradedResult::placeholder(
                            AnalyzerKind::Security,
                        ))
                    }
                };

                report.module_outcomes.push(ModuleOutcome {
                    name: spec.name.clone(),
                    tier,
                    degraded: outcome.is_degraded(),
                    fallback_mode: outcome.fallback_mode(),
                    quality_penalty: outcome.quality_penalty(),
                });

                for finding in outcome.into_output().findings {
                    report
                        .findings
                        .push(self.enrich(spec, finding));
                }
            }
        }

        sort_findings(&mut report.findings);
        report
    }

    /// Attach CWE/CVSS via the injected mapper where the module left them unset.
    fn enrich(&self, spec: &SecurityModuleSpec, mut finding: Finding) -> SecurityFinding {
        if finding.cwe_id.is_none() || finding.cvss_score.is_none() {
            let (cwe, cvss) =
                self.mapper
                    .map(&finding.category, finding.severity, &finding.evidence);
            if finding.cwe_id.is_none() {
                finding.cwe_id = cwe;
            }
            if finding.cvss_score.is_none() {
                finding.cvss_score = cvss;
            }
        }
        SecurityFinding::new(spec.name.clone(), finding)
    }
}

/// Deterministic output order: severity desc, CVSS desc, category asc.
fn sort_findings(findings: &mut [SecurityFinding]) {
    findings.sort_by(|a, b| {
        Reverse(a.finding.severity)
            .cmp(&Reverse(b.finding.severity))
            .then(
                b.cvss()
                    .partial_cmp(&a.cvss())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.finding.category.cmp(&b.finding.category))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use crate::finding::{NullCweCvssMapper, Severity};
    use crate::supervisor::FallbackRegistry;

    struct StaticModule {
        findings: Vec<Finding>,
    }

    #[async_trait]
    impl SecurityModule for StaticModule {
        async fn scan(
            &self,
            _input: &AnalyzerInput,
            _cancel: &CancellationToken,
        ) -> Result<Vec<Finding>> {
            Ok(self.findings.clone())
        }
    }

    struct SlowModule;

    #[async_trait]
    impl SecurityModule for SlowModule {
        async fn scan(
            &self,
            _input: &AnalyzerInput,
            cancel: &CancellationToken,
        ) -> Result<Vec<Finding>> {
            cancel.cancelled().await;
            Ok(Vec::new())
        }
    }

    fn finding(category: &str, severity: Severity, cvss: Option<f64>) -> Finding {
        let mut f = Finding::new(category, "pattern", severity, SourceAgent::Security);
        if let Some(score) = cvss {
            f = f.with_cvss(score);
        }
        f
    }

    fn scheduler_with(modules: Vec<SecurityModuleSpec>) -> SecurityTierScheduler {
        let mut scheduler = SecurityTierScheduler::new(Arc::new(NullCweCvssMapper));
        for spec in modules {
            scheduler.register(spec);
        }
        scheduler
    }

    fn supervisor() -> AnalyzerSupervisor {
        AnalyzerSupervisor::new(&AuditConfig::default(), FallbackRegistry::new())
    }

    #[tokio::test]
    async fn test_findings_sorted_deterministically() {
        let scheduler = scheduler_with(vec![
            SecurityModuleSpec::new(
                "headers",
                ModuleTier::Fast,
                "headers",
                Arc::new(StaticModule {
                    findings: vec![
                        finding("zeta", Severity::Medium, Some(5.0)),
                        finding("alpha", Severity::Medium, Some(5.0)),
                        finding("beta", Severity::Critical, Some(9.0)),
                        finding("gamma", Severity::Critical, Some(9.8)),
                    ],
                }),
            ),
        ]);

        let sup = supervisor();
        let input = AnalyzerInput::for_url("https://example.com");
        let report = scheduler
            .run_security(&input, &sup, Duration::from_secs(600), &CancellationToken::new())
            .await;

        let order: Vec<&str> = report
            .findings
            .iter()
            .map(|f| f.finding.category.as_str())
            .collect();
        assert_eq!(order, vec!["gamma", "beta", "alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_enabled_modules_filter() {
        let scheduler = scheduler_with(vec![
            SecurityModuleSpec::new(
                "headers",
                ModuleTier::Fast,
                "headers",
                Arc::new(StaticModule {
                    findings: vec![finding("headers", Severity::Low, None)],
                }),
            ),
            SecurityModuleSpec::new(
                "cookies",
                ModuleTier::Fast,
                "cookies",
                Arc::new(StaticModule {
                    findings: vec![finding("cookies", Severity::Low, None)],
                }),
            ),
        ]);

        let sup = supervisor();
        let mut input = AnalyzerInput::for_url("https://example.com");
        input.enabled_modules = Some(vec!["cookies".to_string()]);
        let report = scheduler
            .run_security(&input, &sup, Duration::from_secs(600), &CancellationToken::new())
            .await;

        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].module, "cookies");
    }

    #[tokio::test]
    async fn test_deep_tier_skipped_under_pressure() {
        let scheduler = scheduler_with(vec![
            SecurityModuleSpec::new(
                "headers",
                ModuleTier::Fast,
                "headers",
                Arc::new(StaticModule {
                    findings: vec![finding("headers", Severity::Low, None)],
                }),
            ),
            SecurityModuleSpec::new(
                "gdpr",
                ModuleTier::Deep,
                "compliance",
                Arc::new(StaticModule {
                    findings: vec![finding("compliance", Severity::High, None)],
                }),
            ),
        ]);

        let sup = supervisor();
        let input = AnalyzerInput::for_url("https://example.com");
        // Ten seconds left: not enough for the 60s deep deadline
        let report = scheduler
            .run_security(&input, &sup, Duration::from_secs(10), &CancellationToken::new())
            .await;

        assert_eq!(report.skipped_tiers, vec![ModuleTier::Deep]);
        assert_eq!(report.findings.len(), 1);
        let deep = report
            .module_outcomes
            .iter()
            .find(|o| o.name == "gdpr")
            .unwrap();
        assert!(deep.degraded);
        assert_eq!(deep.fallback_mode, Some(FallbackMode::Simplified));
    }

    #[tokio::test]
    async fn test_straggler_becomes_placeholder() {
        let scheduler = scheduler_with(vec![SecurityModuleSpec::new(
            "slow-crawl",
            ModuleTier::Fast,
            "crawl",
            Arc::new(SlowModule),
        )
        .with_timeout(Duration::from_millis(20))]);

        let sup = supervisor();
        let input = AnalyzerInput::for_url("https://example.com");
        let report = scheduler
            .run_security(&input, &sup, Duration::from_secs(600), &CancellationToken::new())
            .await;

        assert!(report.findings.is_empty());
        assert!(report.is_degraded());
        assert!(report.worst_penalty() > 0.0);
    }

    #[tokio::test]
    async fn test_mapper_enriches_findings() {
        use crate::finding::FnCweCvssMapper;

        let mut scheduler = SecurityTierScheduler::new(Arc::new(FnCweCvssMapper(
            |_: &str, _: Severity, _: &serde_json::Value| (Some("CWE-319".to_string()), Some(7.4)),
        )));
        scheduler.register(SecurityModuleSpec::new(
            "forms",
            ModuleTier::Fast,
            "forms_insecure",
            Arc::new(StaticModule {
                findings: vec![finding("forms_insecure", Severity::High, None)],
            }),
        ));

        let sup = supervisor();
        let input = AnalyzerInput::for_url("https://example.com");
        let report = scheduler
            .run_security(&input, &sup, Duration::from_secs(600), &CancellationToken::new())
            .await;

        assert_eq!(report.findings[0].finding.cwe_id.as_deref(), Some("CWE-319"));
        assert_eq!(report.findings[0].finding.cvss_score, Some(7.4));
    }
}
