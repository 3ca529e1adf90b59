//! # webaudit-core
//!
//! An autonomous web-audit orchestration engine. Given a target URL and an
//! audit tier, the engine drives a pipeline of pluggable analyzers
//! (browser reconnaissance, security scanning, visual analysis, OSINT
//! graph investigation, verdict synthesis) and emits a single trust
//! verdict plus a rate-limited stream of progress events.
//!
//! ## Core Components
//!
//! - **Orchestrator**: the tier-aware state machine driving the phases
//! - **Supervisor**: adaptive timeouts, circuit breakers, degradation
//! - **Security**: the FAST/MEDIUM/DEEP tier scheduler
//! - **Consensus**: multi-source agreement and explainable confidence
//! - **Progress**: token-bucket-limited event streaming with ETA
//!
//! ## Example
//!
//! ```rust,ignore
//! use webaudit_core::{AuditConfigBuilder, AuditEngine, AuditTier};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = AuditConfigBuilder::new().tier(AuditTier::Standard).build();
//! let engine = AuditEngine::builder(config)
//!     .analyzer(scout)
//!     .analyzer(judge)
//!     .build()?;
//!
//! let result = engine.audit("https://example.com", &CancellationToken::new()).await?;
//! println!("trust: {} ({})", result.trust_score, result.risk_level);
//! ```

pub mod analyzer;
pub mod complexity;
pub mod config;
pub mod consensus;
pub mod error;
pub mod finding;
pub mod orchestrator;
pub mod progress;
pub mod security;
pub mod state;
pub mod supervisor;

// Re-exports for convenience
pub use analyzer::{
    Analyzer, AnalyzerInput, AnalyzerKind, AnalyzerOutput, JudgeAction, JudgeDecision,
    ScoutReport,
};
pub use complexity::{ComplexitySignals, TimeoutStrategy};
pub use config::{AuditConfig, AuditConfigBuilder, AuditTier, ExecutionMode, FeatureFlags};
pub use consensus::{
    normalize_region, ConfidenceTier, ConsensusEngine, ConsensusResult, ConsensusStatus,
    FindingKey,
};
pub use error::{Error, Result};
pub use finding::{
    CweCvssMapper, Finding, FnCweCvssMapper, NullCweCvssMapper, SecurityFinding, Severity,
    SourceAgent,
};
pub use orchestrator::{
    AgentSignal, AuditEngine, AuditEngineBuilder, AuditMetadata, AuditResult, DualVerdict,
};
pub use progress::{
    export_events, EtaEstimator, EventPriority, EventSink, NullSink, ProgressEmitter,
    ProgressEvent, ProgressEventType, VecSink,
};
pub use security::{
    ModuleTier, SecurityModule, SecurityModuleSpec, SecurityRunReport, SecurityTierScheduler,
};
pub use state::{AuditErrorRecord, AuditState, AuditStatus};
pub use supervisor::{
    AnalyzerSupervisor, BreakerConfig, BreakerStats, CircuitBreaker, CircuitState,
    DegradedResult, FailureMode, FallbackMode, FallbackProducer, FallbackRegistry, FnFallback,
    QualityLedger, SupervisedOutcome, SupervisorStats, TimeoutConfig,
};
