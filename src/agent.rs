//! Agent consumers - one task per agent draining its mailbox
//!
//! The orchestrator only routes; deciding what a message means is left to an
//! [`AgentRuntime`]. Each consumer dequeues, asks the runtime for an outcome,
//! and reports it back so unresolved work climbs the hierarchy.
//!
//! A report that fails while the hop is still in flight (full mailbox
//! upstream, ledger unavailable) is retried with backoff until it is accepted
//! or the consumers are shut down.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ConsumerConfig;
use crate::error::OrchestratorError;
use crate::ledger::{DecisionRecord, LedgerError};
use crate::mailbox::Mailbox;
use crate::message::{AgentId, Message, MessageType, Outcome, Payload};
use crate::orchestrator::OrchestratorHandle;

/// Result of handling one message
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub outcome: Outcome,
    /// Sent back to the hop's sender as a `RESPONSE` when resolved
    pub response: Option<Payload>,
    /// Runtime's own confidence, recorded with the decision
    pub confidence: Option<f64>,
}

impl Processed {
    pub fn resolved() -> Self {
        Self::unresolved(Outcome::Resolved)
    }

    pub fn resolved_with(response: Payload) -> Self {
        Self {
            response: Some(response),
            ..Self::resolved()
        }
    }

    pub fn unresolved(outcome: Outcome) -> Self {
        Self {
            outcome,
            response: None,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Whatever does the actual work behind an agent id
#[async_trait]
pub trait AgentRuntime: Send + Sync + 'static {
    async fn process(&self, message: &Message) -> Processed;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Processing,
    Stopped,
}

/// Consumer state for one agent
pub struct AgentWorker {
    agent_id: AgentId,
    status: RwLock<AgentStatus>,
    processed: AtomicU64,
    /// Runtime calls timed so far and their total duration
    timed: AtomicU64,
    busy_micros: AtomicU64,
    config: ConsumerConfig,
}

impl AgentWorker {
    fn new(agent_id: AgentId, config: ConsumerConfig) -> Self {
        Self {
            agent_id,
            status: RwLock::new(AgentStatus::Idle),
            processed: AtomicU64::new(0),
            timed: AtomicU64::new(0),
            busy_micros: AtomicU64::new(0),
            config,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    /// Messages taken off the mailbox so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Mean runtime call duration. Expired hops are never handed to the
    /// runtime and do not count.
    pub fn average_processing_time(&self) -> Option<Duration> {
        let timed = self.timed.load(Ordering::Relaxed);
        (timed > 0).then(|| Duration::from_micros(self.busy_micros.load(Ordering::Relaxed) / timed))
    }

    fn set_status(&self, status: AgentStatus) {
        *self.status.write() = status;
    }

    async fn run(
        self: Arc<Self>,
        handle: OrchestratorHandle,
        mailbox: Arc<Mailbox>,
        runtime: Arc<dyn AgentRuntime>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(agent_id = %self.agent_id, "Consumer started");

        while let Some(message) = mailbox.dequeue().await {
            self.set_status(AgentStatus::Processing);
            self.processed.fetch_add(1, Ordering::Relaxed);

            let processed = if message.is_expired(Utc::now()) {
                debug!(agent_id = %self.agent_id, hop = %message.hop_id(), "TTL expired before processing");
                Processed::unresolved(Outcome::TimedOut)
            } else {
                let started = Instant::now();
                let processed = runtime.process(&message).await;
                self.record_processing_time(&handle, started.elapsed());
                processed
            };

            if self.config.log_decisions {
                if let Err(e) = self.log_decision(&handle, &message, &processed).await {
                    warn!(agent_id = %self.agent_id, hop = %message.hop_id(), error = %e, "Failed to log decision");
                }
            }

            if let Err(e) = self.report(&handle, &message, processed, &mut shutdown).await {
                warn!(
                    agent_id = %self.agent_id,
                    hop = %message.hop_id(),
                    error = %e,
                    "Failed to report outcome"
                );
            }
            self.set_status(AgentStatus::Idle);
        }

        self.set_status(AgentStatus::Stopped);
        debug!(agent_id = %self.agent_id, "Consumer stopped");
    }

    fn record_processing_time(&self, handle: &OrchestratorHandle, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.busy_micros.fetch_add(micros, Ordering::Relaxed);
        self.timed.fetch_add(1, Ordering::Relaxed);
        handle.record_processing_time(elapsed);
    }

    async fn log_decision(
        &self,
        handle: &OrchestratorHandle,
        message: &Message,
        processed: &Processed,
    ) -> Result<(), LedgerError> {
        let mut record = DecisionRecord::new(
            self.agent_id.clone(),
            Some(message.hop_id()),
            &message.payload,
            processed.outcome,
        )?;
        if let Some(response) = &processed.response {
            record = record.with_response(response)?;
        }
        if let Some(confidence) = processed.confidence {
            record = record.with_confidence(confidence);
        }
        handle.ledger().log_decision(record).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(agent_id = %self.agent_id, hop = %message.hop_id(), outcome = %processed.outcome))]
    async fn report(
        &self,
        handle: &OrchestratorHandle,
        message: &Message,
        processed: Processed,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), OrchestratorError> {
        let hop_id = message.hop_id();
        let outcome = processed.outcome;
        self.with_retry(shutdown, || handle.report_outcome(hop_id, outcome))
            .await?;

        if let (Outcome::Resolved, Some(payload)) = (outcome, processed.response) {
            let reply = Message::new(self.agent_id.clone(), MessageType::Response, payload)
                .to(message.sender_id.clone())
                .with_priority(message.priority);
            self.with_retry(shutdown, || handle.submit(reply.clone()))
                .await?;
        }
        Ok(())
    }

    /// Retry with capped linear backoff while the failure leaves the work
    /// pending, until it goes through or shutdown is signalled
    async fn with_retry<T, F, Fut>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(e) if worth_retrying(&e) => {
                    if *shutdown.borrow() {
                        return Err(e);
                    }
                    attempt = attempt.saturating_add(1);
                    let delay = self.config.backoff_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");

                    let sender_gone = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        changed = shutdown.changed() => changed.is_err(),
                    };
                    // A dropped sender counts as shutdown
                    if sender_gone || *shutdown.borrow() {
                        info!(agent_id = %self.agent_id, attempt, "Shutdown while retrying, giving up");
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
    }
}

/// Failures after which the hop is still in flight and the call can succeed later
fn worth_retrying(error: &OrchestratorError) -> bool {
    error.is_retriable() || matches!(error, OrchestratorError::LedgerUnavailable(_))
}

/// Running consumers, one per agent
pub struct ConsumerSet {
    handle: OrchestratorHandle,
    workers: Vec<(Arc<AgentWorker>, JoinHandle<()>)>,
    shutdown: watch::Sender<bool>,
}

impl ConsumerSet {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, agent_id: &AgentId) -> Option<&AgentWorker> {
        self.workers
            .iter()
            .map(|(w, _)| w.as_ref())
            .find(|w| w.agent_id() == agent_id)
    }

    pub fn total_processed(&self) -> u64 {
        self.workers.iter().map(|(w, _)| w.processed()).sum()
    }

    /// Close the consumers' mailboxes, stop any retries in progress and wait
    /// for the consumers to drain and exit.
    ///
    /// Hops whose report was abandoned stay in flight. Messages routed after
    /// a consumer has exited stay queued.
    pub async fn shutdown(self) {
        for (worker, _) in &self.workers {
            if let Some(mailbox) = self.handle.mailbox(worker.agent_id()) {
                mailbox.close();
            }
        }
        let _ = self.shutdown.send(true);

        for (worker, task) in self.workers {
            if let Err(e) = task.await {
                warn!(agent_id = %worker.agent_id(), error = %e, "Consumer task failed");
            }
        }
        info!("Consumers shut down");
    }
}

/// Start a consumer for every mailbox the orchestrator currently has
pub fn spawn_consumers(handle: &OrchestratorHandle, runtime: Arc<dyn AgentRuntime>) -> ConsumerSet {
    spawn(handle, runtime, handle.mailboxes())
}

/// Start consumers for the listed agents only. Unknown ids are skipped.
pub fn spawn_consumers_for(
    handle: &OrchestratorHandle,
    runtime: Arc<dyn AgentRuntime>,
    agents: &[AgentId],
) -> ConsumerSet {
    let mailboxes = agents.iter().filter_map(|id| handle.mailbox(id)).collect();
    spawn(handle, runtime, mailboxes)
}

fn spawn(handle: &OrchestratorHandle, runtime: Arc<dyn AgentRuntime>, mailboxes: Vec<Arc<Mailbox>>) -> ConsumerSet {
    let config = handle.config().consumer.clone();
    let (shutdown, stop_rx) = watch::channel(false);

    let workers: Vec<_> = mailboxes
        .into_iter()
        .map(|mailbox| {
            let worker = Arc::new(AgentWorker::new(mailbox.agent_id().clone(), config.clone()));
            let task = tokio::spawn(Arc::clone(&worker).run(
                handle.clone(),
                mailbox,
                Arc::clone(&runtime),
                stop_rx.clone(),
            ));
            (worker, task)
        })
        .collect();

    info!(consumers = workers.len(), "Consumers started");

    ConsumerSet {
        handle: handle.clone(),
        workers,
        shutdown,
    }
}
