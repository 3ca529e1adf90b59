//! Progress event types for observable audit execution.
//!
//! The event stream can be rendered differently depending on the
//! deployment context: streamed to a live dashboard, exported as JSON
//! lines for replay, or inspected in tests.

use crate::finding::Finding;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Types of progress events emitted during an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    PhaseStart,
    PhaseComplete,
    PhaseError,
    AgentStatus,
    Finding,
    FindingsBatch,
    Screenshot,
    StatsUpdate,
    LogEntry,
    Heartbeat,
    InterestingHighlight,
    AuditResult,
    AuditComplete,
}

impl std::fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PhaseStart => "phase_start",
            Self::PhaseComplete => "phase_complete",
            Self::PhaseError => "phase_error",
            Self::AgentStatus => "agent_status",
            Self::Finding => "finding",
            Self::FindingsBatch => "findings_batch",
            Self::Screenshot => "screenshot",
            Self::StatsUpdate => "stats_update",
            Self::LogEntry => "log_entry",
            Self::Heartbeat => "heartbeat",
            Self::InterestingHighlight => "interesting_highlight",
            Self::AuditResult => "audit_result",
            Self::AuditComplete => "audit_complete",
        };
        write!(f, "{}", s)
    }
}

/// Delivery priority; lower values are delivered and retained first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

/// A progress event emitted during audit execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Type of the event
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    /// Delivery priority
    pub priority: EventPriority,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Phase the event belongs to, if applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Event-specific payload
    pub payload: Value,
}

impl ProgressEvent {
    /// Create an event with the type's default priority.
    pub fn new(event_type: ProgressEventType, payload: Value) -> Self {
        Self {
            event_type,
            priority: default_priority(event_type),
            timestamp_ms: Utc::now().timestamp_millis() as u64,
            phase: None,
            payload,
        }
    }

    /// Attach the phase this event belongs to.
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Override the priority.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    // Convenience constructors for common event types

    /// A phase has started.
    pub fn phase_start(phase: impl Into<String>) -> Self {
        let phase = phase.into();
        Self::new(
            ProgressEventType::PhaseStart,
            serde_json::json!({ "phase": phase }),
        )
        .with_phase(phase)
    }

    /// A phase finished.
    pub fn phase_complete(phase: impl Into<String>, elapsed_ms: u64) -> Self {
        let phase = phase.into();
        Self::new(
            ProgressEventType::PhaseComplete,
            serde_json::json!({ "phase": phase, "elapsed_ms": elapsed_ms }),
        )
        .with_phase(phase)
    }

    /// A phase failed or degraded.
    pub fn phase_error(phase: impl Into<String>, message: impl Into<String>) -> Self {
        let phase = phase.into();
        Self::new(
            ProgressEventType::PhaseError,
            serde_json::json!({ "phase": phase, "message": message.into() }),
        )
        .with_phase(phase)
    }

    /// Agent status change with an optional completion estimate.
    pub fn agent_status(
        agent: impl Into<String>,
        state: impl Into<String>,
        eta_seconds: Option<f64>,
    ) -> Self {
        Self::new(
            ProgressEventType::AgentStatus,
            serde_json::json!({
                "agent": agent.into(),
                "state": state.into(),
                "eta_seconds": eta_seconds,
            }),
        )
    }

    /// A batch of findings.
    pub fn findings_batch(findings: &[Finding]) -> Self {
        Self::new(
            ProgressEventType::FindingsBatch,
            serde_json::json!({
                "count": findings.len(),
                "findings": findings,
            }),
        )
    }

    /// A compressed screenshot thumbnail.
    pub fn screenshot(phase: impl Into<String>, width: u32, height: u32, data: Vec<u8>) -> Self {
        let phase = phase.into();
        Self::new(
            ProgressEventType::Screenshot,
            serde_json::json!({
                "width": width,
                "height": height,
                "format": "jpeg",
                "data": data,
            }),
        )
        .with_phase(phase)
    }

    /// Keep-alive heartbeat.
    pub fn heartbeat() -> Self {
        Self::new(ProgressEventType::Heartbeat, Value::Null)
    }

    /// A pre-registered highlight from the current phase context.
    pub fn highlight(text: impl Into<String>) -> Self {
        Self::new(
            ProgressEventType::InterestingHighlight,
            serde_json::json!({ "text": text.into() }),
        )
    }

    /// A log line forwarded to the consumer.
    pub fn log_entry(message: impl Into<String>) -> Self {
        Self::new(
            ProgressEventType::LogEntry,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Final audit result payload.
    pub fn audit_result(payload: Value) -> Self {
        Self::new(ProgressEventType::AuditResult, payload)
    }

    /// The terminal event of every audit.
    pub fn audit_complete(status: impl Into<String>) -> Self {
        Self::new(
            ProgressEventType::AuditComplete,
            serde_json::json!({ "status": status.into() }),
        )
    }
}

/// Default priority for each event type.
fn default_priority(event_type: ProgressEventType) -> EventPriority {
    use ProgressEventType::*;
    match event_type {
        AuditComplete | AuditResult | PhaseError => EventPriority::Critical,
        PhaseStart | PhaseComplete | Finding | FindingsBatch => EventPriority::High,
        AgentStatus | Screenshot | StatsUpdate | InterestingHighlight => EventPriority::Medium,
        LogEntry | Heartbeat => EventPriority::Low,
    }
}

/// Serialize events to JSON lines (one event per line).
pub fn export_events(events: &[ProgressEvent]) -> String {
    events
        .iter()
        .filter_map(|e| serde_json::to_string(e).ok())
        .collect::<Vec<_>>()
        .join("\n")
}
