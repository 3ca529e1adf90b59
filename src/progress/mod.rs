//! Rate-limited progress streaming.
//!
//! The emitter is a producer/consumer with a bounded priority queue. A
//! worker task owns the token bucket, the finding batcher, heartbeat
//! pacing, and the completion-time estimator; producers only enqueue
//! commands. Events are totally ordered on the wire from the worker's
//! perspective.

pub mod eta;
pub mod event;
pub mod limiter;
pub mod screenshot;

pub use eta::EtaEstimator;
pub use event::{export_events, EventPriority, ProgressEvent, ProgressEventType};
pub use limiter::{EventQueue, TokenBucket};
pub use screenshot::{compress, Thumbnail};

use crate::analyzer::AnalyzerKind;
use crate::config::AuditConfig;
use crate::error::Result;
use crate::finding::Finding;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Findings buffered before a batch event is emitted.
const BATCH_SIZE: usize = 5;
/// Silence window before a heartbeat or highlight is emitted.
const HEARTBEAT_AFTER: Duration = Duration::from_secs(6);
/// Bound on the internal priority queue.
const QUEUE_CAPACITY: usize = 256;
/// Grace period for draining on close.
const CLOSE_GRACE: Duration = Duration::from_secs(10);

/// Downstream consumer of progress events.
///
/// Implementations must not block; the worker calls `send` inline.
pub trait EventSink: Send + Sync {
    fn send(&self, event: ProgressEvent);

    /// Called once when the emitter closes.
    fn close(&self) {}
}

/// Sink that collects events in memory.
#[derive(Default)]
pub struct VecSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all received events.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for VecSink {
    fn send(&self, event: ProgressEvent) {
        self.events.lock().push(event);
    }
}

/// Sink that discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, _event: ProgressEvent) {}
}

enum Command {
    Emit(ProgressEvent),
    Finding(Box<Finding>),
    AgentStarted(AnalyzerKind),
    AgentCompleted(AnalyzerKind, Duration),
    SiteType(String),
    RegisterHighlight(String),
    ResetIteration,
    Flush(oneshot::Sender<()>),
    Close(String, oneshot::Sender<u64>),
}

/// Rate-limited progress event emitter.
///
/// After [`close`](Self::close), all further calls are no-ops.
pub struct ProgressEmitter {
    tx: Option<mpsc::UnboundedSender<Command>>,
    closed: AtomicBool,
}

impl ProgressEmitter {
    /// Create an emitter streaming to `sink`, spawning the worker task.
    pub fn new(sink: Arc<dyn EventSink>, config: &AuditConfig) -> Self {
        if !config.flags.use_progress_streaming {
            return Self::disabled();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            rx,
            sink,
            bucket: TokenBucket::new(config.burst, config.max_rate),
            queue: EventQueue::new(QUEUE_CAPACITY),
            batch: Vec::new(),
            eta: EtaEstimator::new(),
            site_type: "unknown".to_string(),
            highlights: VecDeque::new(),
            last_emit: Instant::now(),
        };
        tokio::spawn(worker.run());

        Self {
            tx: Some(tx),
            closed: AtomicBool::new(false),
        }
    }

    /// Create an emitter that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            closed: AtomicBool::new(true),
        }
    }

    fn send(&self, command: Command) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(command);
        }
    }

    /// Emit one event.
    pub fn emit(&self, event: ProgressEvent) {
        self.send(Command::Emit(event));
    }

    /// Compress and emit a screenshot thumbnail.
    pub fn emit_screenshot(&self, phase: impl Into<String>, raw: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let thumb = compress(raw)?;
        self.emit(ProgressEvent::screenshot(
            phase,
            thumb.width,
            thumb.height,
            thumb.data,
        ));
        Ok(())
    }

    /// Buffer a finding; a batch event is emitted at five findings or on flush.
    pub fn emit_finding(&self, finding: Finding) {
        self.send(Command::Finding(Box::new(finding)));
    }

    /// Emit a generic agent status update.
    pub fn emit_agent_status(&self, agent: impl Into<String>, state: impl Into<String>) {
        self.emit(ProgressEvent::agent_status(agent, state, None));
    }

    /// Record that an agent started; emits a status event with an ETA.
    pub fn agent_started(&self, kind: AnalyzerKind) {
        self.send(Command::AgentStarted(kind));
    }

    /// Record that an agent completed; feeds the ETA history.
    pub fn agent_completed(&self, kind: AnalyzerKind, duration: Duration) {
        self.send(Command::AgentCompleted(kind, duration));
    }

    /// Set the classified site type used for ETA lookups.
    pub fn set_site_type(&self, site_type: impl Into<String>) {
        self.send(Command::SiteType(site_type.into()));
    }

    /// Reset per-iteration agent completion tracking.
    pub fn reset_iteration(&self) {
        self.send(Command::ResetIteration);
    }

    /// Emit a heartbeat immediately.
    pub fn emit_heartbeat(&self) {
        self.emit(ProgressEvent::heartbeat());
    }

    /// Emit an interesting highlight immediately.
    pub fn emit_highlight(&self, text: impl Into<String>) {
        self.emit(ProgressEvent::highlight(text));
    }

    /// Register a highlight to be emitted instead of a heartbeat when the
    /// stream goes quiet.
    pub fn register_highlight(&self, text: impl Into<String>) {
        self.send(Command::RegisterHighlight(text.into()));
    }

    /// Flush buffered findings into a batch event.
    pub async fn flush(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let (ack, done) = oneshot::channel();
        self.send(Command::Flush(ack));
        let _ = done.await;
    }

    /// Drain, emit `audit_complete`, and close the sink.
    ///
    /// Returns the number of events dropped over the emitter's lifetime.
    /// Idempotent; later calls return zero.
    pub async fn close(&self, status: impl Into<String>) -> u64 {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let Some(tx) = &self.tx else { return 0 };
        let (ack, done) = oneshot::channel();
        if tx.send(Command::Close(status.into(), ack)).is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }
}

struct Worker {
    rx: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn EventSink>,
    bucket: TokenBucket,
    queue: EventQueue,
    batch: Vec<Finding>,
    eta: EtaEstimator,
    site_type: String,
    highlights: VecDeque<String>,
    last_emit: Instant,
}

impl Worker {
    async fn run(mut self) {
        loop {
            self.pump();
            let deadline = self.next_wake();
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        None => {
                            // Producer dropped without closing; stop quietly.
                            debug!("progress emitter channel closed without close()");
                            break;
                        }
                        Some(command) => {
                            if self.handle(command).await {
                                return;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.maybe_heartbeat();
                }
            }
        }
    }

    /// Returns true when the worker should terminate.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Emit(event) => self.accept(event),
            Command::Finding(finding) => {
                self.batch.push(*finding);
                if self.batch.len() >= BATCH_SIZE {
                    self.flush_batch();
                }
            }
            Command::AgentStarted(kind) => {
                let eta = self.eta.remaining_seconds(&self.site_type);
                self.accept(ProgressEvent::agent_status(
                    kind.to_string(),
                    "started",
                    Some(eta),
                ));
            }
            Command::AgentCompleted(kind, duration) => {
                self.eta.record(&self.site_type, kind, duration);
                self.eta.mark_completed(kind);
                let eta = self.eta.remaining_seconds(&self.site_type);
                self.accept(ProgressEvent::agent_status(
                    kind.to_string(),
                    "completed",
                    Some(eta),
                ));
            }
            Command::SiteType(site_type) => self.site_type = site_type,
            Command::RegisterHighlight(text) => self.highlights.push_back(text),
            Command::ResetIteration => self.eta.reset_iteration(),
            Command::Flush(ack) => {
                self.flush_batch();
                let _ = ack.send(());
            }
            Command::Close(status, ack) => {
                self.flush_batch();
                self.drain().await;
                // The terminal event always goes out, token or not.
                let _ = self.bucket.try_acquire();
                self.deliver(ProgressEvent::audit_complete(status));
                self.sink.close();
                let _ = ack.send(self.queue.dropped_count());
                return true;
            }
        }
        false
    }

    /// Deliver immediately when a token is free, otherwise enqueue.
    fn accept(&mut self, event: ProgressEvent) {
        if self.queue.is_empty() && self.bucket.try_acquire() {
            self.deliver(event);
        } else {
            self.queue.push(event);
        }
    }

    /// Move queued events to the sink while tokens last.
    fn pump(&mut self) {
        while !self.queue.is_empty() && self.bucket.try_acquire() {
            if let Some(event) = self.queue.pop() {
                self.deliver(event);
            }
        }
    }

    fn deliver(&mut self, event: ProgressEvent) {
        self.sink.send(event);
        self.last_emit = Instant::now();
    }

    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let findings = std::mem::take(&mut self.batch);
        self.accept(ProgressEvent::findings_batch(&findings));
    }

    fn next_wake(&mut self) -> Instant {
        let heartbeat_at = self.last_emit + HEARTBEAT_AFTER;
        if self.queue.is_empty() {
            heartbeat_at
        } else {
            let token_at = Instant::now() + self.bucket.time_until_token();
            token_at.min(heartbeat_at)
        }
    }

    fn maybe_heartbeat(&mut self) {
        if self.last_emit.elapsed() < HEARTBEAT_AFTER {
            return;
        }
        let event = match self.highlights.pop_front() {
            Some(text) => ProgressEvent::highlight(text),
            None => ProgressEvent::heartbeat(),
        };
        self.accept(event);
    }

    /// Drain the queue respecting the bucket, bounded by the grace period.
    async fn drain(&mut self) {
        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            self.pump();
            if self.queue.is_empty() {
                return;
            }
            let wait = self.bucket.time_until_token();
            if Instant::now() + wait > deadline {
                warn!(
                    remaining = self.queue.len(),
                    "close grace period exhausted; dropping queued events"
                );
                self.queue.clear_dropping();
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }
}
