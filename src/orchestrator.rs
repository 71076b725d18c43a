//! Communication orchestrator - routes messages and audits every decision
//!
//! `submit` and `report_outcome` follow the same three steps:
//!
//! 1. claim room in the target mailbox(es) (`MailboxFull` fails fast)
//! 2. append the routing decision to the audit ledger (waits for the writer)
//! 3. make the message visible to the recipient
//!
//! Step 3 runs on the ledger writer right after the batch is persisted, so
//! mailboxes fill in ledger order. Once a batch has been handed to the writer
//! its delivery no longer depends on the caller: dropping the future only
//! loses the receipt. A failure at step 1 or 2, or a call dropped before its
//! batch reaches the writer, rolls every claim back, so a mailbox never holds
//! a message whose routing decision is missing from the ledger.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::escalation::{self, NextHop, Route};
use crate::hierarchy::{AgentDescriptor, HierarchyIndex};
use crate::ledger::{AuditLedger, ChainStatus, Disposition, LedgerBlock, LedgerError, RoutingRecord};
use crate::mailbox::{Mailbox, MailboxStats, Reservation};
use crate::message::{AgentId, HopId, Message, MessageId, Outcome};

/// Confirmation that a routing decision is delivered and on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub message_id: MessageId,
    pub disposition: Disposition,
    /// One entry per hop routed; several for a broadcast
    pub hops: Vec<HopReceipt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HopReceipt {
    pub hop_id: HopId,
    pub recipient: AgentId,
    pub ledger_index: u64,
    /// Queued hop evicted to make room for this one
    pub displaced: Option<HopId>,
}

impl Receipt {
    /// Entered the system but exhausted escalation
    pub fn is_dead_lettered(&self) -> bool {
        self.disposition == Disposition::DeadLettered
    }

    /// Hop id of the first (usually only) hop
    pub fn hop_id(&self) -> Option<HopId> {
        self.hops.first().map(|h| h.hop_id)
    }
}

#[derive(Debug, Default)]
struct Stats {
    messages_routed: AtomicU64,
    messages_failed: AtomicU64,
    escalations: AtomicU64,
    resolved: AtomicU64,
    dead_lettered: AtomicU64,
    displaced: AtomicU64,
    processed: AtomicU64,
    processing_micros: AtomicU64,
}

/// Counter increments of one persisted batch
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    routed: u64,
    escalations: u64,
    resolved: u64,
    dead_lettered: u64,
    displaced: u64,
}

impl Stats {
    fn add(&self, tally: Tally) {
        self.messages_routed.fetch_add(tally.routed, Ordering::Relaxed);
        self.escalations.fetch_add(tally.escalations, Ordering::Relaxed);
        self.resolved.fetch_add(tally.resolved, Ordering::Relaxed);
        self.dead_lettered.fetch_add(tally.dead_lettered, Ordering::Relaxed);
        self.displaced.fetch_add(tally.displaced, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the orchestrator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_routed: u64,
    pub messages_failed: u64,
    pub escalations: u64,
    pub resolved: u64,
    pub dead_lettered: u64,
    pub displaced: u64,
    /// Mean time agents spent processing a hop, once any has been recorded
    pub average_processing_time: Option<Duration>,
}

impl StatsSnapshot {
    /// Share of routing attempts that were rejected, `0.0` before any attempt
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.messages_routed + self.messages_failed;
        if attempts == 0 {
            return 0.0;
        }
        self.messages_failed as f64 / attempts as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Warning,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub total_agents: usize,
    pub in_flight: usize,
    pub total_queue_depth: usize,
    pub stats: StatsSnapshot,
    pub mailboxes: Vec<MailboxStats>,
    pub health: Health,
}

/// Every hop the orchestrator is responsible for
#[derive(Debug, Default)]
struct HopTable {
    /// Delivered and awaiting an outcome
    in_flight: HashMap<HopId, Message>,
    /// Claimed by a routing call whose batch is not persisted yet
    pending: HashSet<HopId>,
    /// Pending or in-flight hops per logical message
    live: HashMap<MessageId, usize>,
}

impl HopTable {
    fn admit(&mut self, message_id: MessageId, hops: &[HopId]) -> Result<(), OrchestratorError> {
        if self.live.contains_key(&message_id) {
            return Err(OrchestratorError::DuplicateMessage(message_id));
        }
        for hop_id in hops {
            self.extend(*hop_id);
        }
        Ok(())
    }

    fn extend(&mut self, hop_id: HopId) {
        self.pending.insert(hop_id);
        *self.live.entry(hop_id.message_id).or_default() += 1;
    }

    fn check_out(&mut self, hop_id: HopId) -> Option<Message> {
        let message = self.in_flight.remove(&hop_id)?;
        self.pending.insert(hop_id);
        Some(message)
    }

    fn activate(&mut self, message: Message) {
        self.pending.remove(&message.hop_id());
        self.in_flight.insert(message.hop_id(), message);
    }

    fn retire(&mut self, hop_id: HopId) {
        let known = self.pending.remove(&hop_id) | self.in_flight.remove(&hop_id).is_some();
        if !known {
            return;
        }
        if let Some(count) = self.live.get_mut(&hop_id.message_id) {
            *count -= 1;
            if *count == 0 {
                self.live.remove(&hop_id.message_id);
            }
        }
    }
}

/// Hop-table changes made by one routing call. Undone on drop unless applied.
struct HopClaim {
    table: Arc<Mutex<HopTable>>,
    /// New hops, pending until the batch lands
    admitted: Vec<HopId>,
    /// Hop whose outcome is being applied
    settling: Option<Message>,
    /// Queued hops this call evicts
    victims: Vec<Message>,
    applied: bool,
}

impl HopClaim {
    fn admit(table: &Arc<Mutex<HopTable>>, message_id: MessageId, hops: &[HopId]) -> Result<Self, OrchestratorError> {
        table.lock().admit(message_id, hops)?;
        Ok(Self::new(table, hops.to_vec(), None))
    }

    fn check_out(table: &Arc<Mutex<HopTable>>, hop_id: HopId) -> Result<(Self, Message), OrchestratorError> {
        let message = table
            .lock()
            .check_out(hop_id)
            .ok_or(OrchestratorError::UnknownHop(hop_id))?;
        Ok((Self::new(table, Vec::new(), Some(message.clone())), message))
    }

    fn new(table: &Arc<Mutex<HopTable>>, admitted: Vec<HopId>, settling: Option<Message>) -> Self {
        Self {
            table: Arc::clone(table),
            admitted,
            settling,
            victims: Vec::new(),
            applied: false,
        }
    }

    fn extend(&mut self, hop_id: HopId) {
        self.table.lock().extend(hop_id);
        self.admitted.push(hop_id);
    }

    /// Take evicted hops out of flight. Returns those this call now owns;
    /// a hop whose outcome is already being reported is left to that report.
    fn evict<'a>(&mut self, held: impl Iterator<Item = &'a Message>) -> &[Message] {
        {
            let mut table = self.table.lock();
            for victim in held {
                if let Some(message) = table.check_out(victim.hop_id()) {
                    self.victims.push(message);
                }
            }
        }
        &self.victims
    }

    fn apply(&mut self, delivered: &[Message]) {
        let mut table = self.table.lock();
        if let Some(message) = self.settling.take() {
            table.retire(message.hop_id());
        }
        for victim in self.victims.drain(..) {
            table.retire(victim.hop_id());
        }
        for hop in delivered {
            table.activate(hop.clone());
        }
        self.applied = true;
    }
}

impl Drop for HopClaim {
    fn drop(&mut self) {
        if self.applied {
            return;
        }
        let mut table = self.table.lock();
        for hop_id in &self.admitted {
            table.retire(*hop_id);
        }
        if let Some(message) = self.settling.take() {
            table.activate(message);
        }
        for victim in self.victims.drain(..) {
            table.activate(victim);
        }
    }
}

/// What a routing call applies once its batch is persisted.
///
/// Dropped unapplied, the hop table is restored before the mailboxes.
struct Commit {
    claim: HopClaim,
    slots: Vec<Reservation>,
    hops: Vec<Message>,
    /// Slot of a hop pulled back out of its holder's mailbox
    withdrawn: Option<Reservation>,
    tally: Tally,
}

impl Commit {
    fn apply(self, stats: &Stats) {
        let Commit {
            mut claim,
            slots,
            hops,
            withdrawn,
            tally,
        } = self;

        claim.apply(&hops);
        stats.add(tally);
        for (hop, slot) in hops.into_iter().zip(slots) {
            debug!(hop = %hop.hop_id(), recipient = %recipient_of(&hop), "Delivered");
            if let Some(victim) = slot.commit(hop) {
                warn!(displaced = %victim.hop_id(), "Queued hop displaced by higher-priority traffic");
            }
        }
        if let Some(slot) = withdrawn {
            slot.release();
        }
    }
}

/// Routes messages between agents and records each decision on the ledger
pub struct Orchestrator {
    config: OrchestratorConfig,
    /// Swapped wholesale on update; readers keep the snapshot they loaded
    hierarchy: RwLock<Arc<HierarchyIndex>>,
    mailboxes: RwLock<HashMap<AgentId, Arc<Mailbox>>>,
    hops: Arc<Mutex<HopTable>>,
    ledger: AuditLedger,
    stats: Arc<Stats>,
}

impl Orchestrator {
    /// Create an orchestrator with one mailbox per agent in the hierarchy
    pub fn new(hierarchy: HierarchyIndex, ledger: AuditLedger, config: OrchestratorConfig) -> Self {
        let mailboxes = hierarchy
            .agent_ids()
            .map(|id| (id.clone(), Arc::new(Mailbox::new(id.clone(), config.mailbox_capacity))))
            .collect::<HashMap<_, _>>();

        info!(
            agents = mailboxes.len(),
            mailbox_capacity = config.mailbox_capacity,
            "Creating orchestrator"
        );

        Self {
            config,
            hierarchy: RwLock::new(Arc::new(hierarchy)),
            mailboxes: RwLock::new(mailboxes),
            hops: Arc::new(Mutex::new(HopTable::default())),
            ledger,
            stats: Arc::new(Stats::default()),
        }
    }

    /// Orchestrator backed by an in-memory ledger
    pub async fn in_memory(hierarchy: HierarchyIndex, config: OrchestratorConfig) -> Result<Self, LedgerError> {
        let ledger = AuditLedger::in_memory(&config.ledger).await?;
        Ok(Self::new(hierarchy, ledger, config))
    }

    /// Configuration this orchestrator was built with
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Route a new message.
    ///
    /// Errors mean the message never entered the system. A manager-relative
    /// message from a root agent is accepted and dead-lettered instead. A
    /// message whose id still has hops in flight is rejected as a duplicate.
    #[instrument(skip(self, message), fields(message_id = %message.id(), sender = %message.sender_id))]
    pub async fn submit(&self, message: Message) -> Result<Receipt, OrchestratorError> {
        let result = self.route_submission(message).await;
        if let Err(e) = &result {
            self.stats.messages_failed.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Submission rejected");
        }
        result
    }

    async fn route_submission(&self, message: Message) -> Result<Receipt, OrchestratorError> {
        let hierarchy = self.hierarchy();
        let hop_id = message.hop_id();
        let sender = message.sender_id.clone();

        match escalation::route(&message, &*hierarchy)? {
            Route::Direct(recipient) => {
                let hop = message.rehop(hop_id, sender, recipient, message.message_type, message.priority);
                let claim = HopClaim::admit(&self.hops, message.id(), &[hop_id])?;
                self.deliver(vec![hop], Disposition::Delivered, claim, None).await
            }
            Route::FanOut(recipients) => {
                let copies: Vec<Message> = recipients
                    .into_iter()
                    .enumerate()
                    .map(|(i, recipient)| {
                        message.rehop(
                            hop_id.branch(i as u32),
                            sender.clone(),
                            recipient,
                            message.message_type,
                            message.priority,
                        )
                    })
                    .collect();
                let hop_ids: Vec<HopId> = copies.iter().map(Message::hop_id).collect();
                let claim = HopClaim::admit(&self.hops, message.id(), &hop_ids)?;
                self.deliver(copies, Disposition::Delivered, claim, None).await
            }
            Route::DeadLetter => {
                let claim = HopClaim::admit(&self.hops, message.id(), &[])?;
                self.record_terminal(&message, hop_id, &sender, Disposition::DeadLettered, claim, None)
                    .await
            }
        }
    }

    /// Report how the holder of a hop dealt with it.
    ///
    /// Anything other than `Resolved` escalates to the holder's manager as a
    /// new hop of the same message; at the root it is dead-lettered. Exactly
    /// one ledger block is written either way. On error the hop stays in
    /// flight and the report may be retried.
    #[instrument(skip(self, hop_id), fields(hop = %hop_id))]
    pub async fn report_outcome(&self, hop_id: HopId, outcome: Outcome) -> Result<Receipt, OrchestratorError> {
        let (claim, message) = HopClaim::check_out(&self.hops, hop_id)?;

        let result = self.settle(claim, &message, outcome).await;
        if let Err(e) = &result {
            self.stats.messages_failed.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Outcome not applied, hop stays in flight");
        }
        result
    }

    async fn settle(&self, mut claim: HopClaim, message: &Message, outcome: Outcome) -> Result<Receipt, OrchestratorError> {
        let hierarchy = self.hierarchy();
        let holder = recipient_of(message).clone();
        let next = message.hop_id().next();

        // Outcome reported while still queued (e.g. TTL expired before dequeue)
        let withdrawn = self
            .mailbox(&holder)
            .and_then(|mailbox| mailbox.withdraw(message.hop_id()));

        match escalation::next_hop(message, outcome, &*hierarchy) {
            NextHop::Terminal => {
                self.record_terminal(message, next, &holder, Disposition::Resolved, claim, withdrawn)
                    .await
            }
            NextHop::DeadLetter => {
                self.record_terminal(message, next, &holder, Disposition::DeadLettered, claim, withdrawn)
                    .await
            }
            NextHop::Escalate { to, priority } => {
                info!(from = %holder, to = %to, priority = %priority, "Escalating");
                let hop = message.escalated(holder, to, priority);
                claim.extend(hop.hop_id());
                self.deliver(vec![hop], Disposition::Escalated, claim, withdrawn)
                    .await
            }
        }
    }

    /// Reserve, audit, then enqueue every hop as one unit.
    ///
    /// Queued hops evicted along the way are dead-lettered in the same batch.
    async fn deliver(
        &self,
        hops: Vec<Message>,
        disposition: Disposition,
        mut claim: HopClaim,
        withdrawn: Option<Reservation>,
    ) -> Result<Receipt, OrchestratorError> {
        let slots = match self.reserve_all(&hops) {
            Ok(slots) => slots,
            Err(e) => {
                // Hop table first, so a withdrawn hop is in flight again before it is visible
                drop(claim);
                drop(withdrawn);
                return Err(e);
            }
        };

        let mut records: Vec<RoutingRecord> = hops
            .iter()
            .zip(&slots)
            .map(|(hop, slot)| RoutingRecord {
                message_id: hop.id(),
                hop_id: hop.hop_id(),
                sender: hop.sender_id.clone(),
                recipient: recipient_of(hop).clone(),
                message_type: hop.message_type,
                priority: hop.priority,
                disposition,
                displaced: slot.held().map(Message::hop_id),
            })
            .collect();

        let victims = claim.evict(slots.iter().filter_map(Reservation::held));
        records.extend(victims.iter().map(|victim| {
            let holder = recipient_of(victim);
            terminal_record(victim, victim.hop_id().next(), holder, Disposition::DeadLettered)
        }));

        let tally = Tally {
            routed: hops.len() as u64,
            escalations: u64::from(disposition == Disposition::Escalated),
            dead_lettered: victims.len() as u64,
            displaced: slots.iter().filter(|s| s.held().is_some()).count() as u64,
            ..Tally::default()
        };
        for victim in victims {
            warn!(
                message_id = %victim.id(),
                hop = %victim.hop_id(),
                holder = %recipient_of(victim),
                "Displaced hop dead-lettered"
            );
        }

        let mut receipt = Receipt {
            message_id: hops[0].id(),
            disposition,
            hops: hops
                .iter()
                .zip(&slots)
                .map(|(hop, slot)| HopReceipt {
                    hop_id: hop.hop_id(),
                    recipient: recipient_of(hop).clone(),
                    ledger_index: 0,
                    displaced: slot.held().map(Message::hop_id),
                })
                .collect(),
        };

        let commit = Commit {
            claim,
            slots,
            hops,
            withdrawn,
            tally,
        };
        let blocks = self.append_then_commit(records, commit).await?;
        for (hop, block) in receipt.hops.iter_mut().zip(&blocks) {
            hop.ledger_index = block.index;
        }
        Ok(receipt)
    }

    fn reserve_all(&self, hops: &[Message]) -> Result<Vec<Reservation>, OrchestratorError> {
        let mut targets = Vec::with_capacity(hops.len());
        for hop in hops {
            let recipient = recipient_of(hop);
            let mailbox = self
                .mailbox(recipient)
                .ok_or_else(|| OrchestratorError::UnknownAgent(recipient.clone()))?;
            targets.push(mailbox);
        }

        let mut slots = Vec::with_capacity(hops.len());
        for (mailbox, hop) in targets.iter().zip(hops) {
            let slot = mailbox
                .reserve(hop.priority)
                .map_err(|full| OrchestratorError::MailboxFull(full.agent_id))?;
            slots.push(slot);
        }
        Ok(slots)
    }

    /// Write a terminal block for a message that goes nowhere else
    async fn record_terminal(
        &self,
        message: &Message,
        hop_id: HopId,
        holder: &AgentId,
        disposition: Disposition,
        claim: HopClaim,
        withdrawn: Option<Reservation>,
    ) -> Result<Receipt, OrchestratorError> {
        let dead = disposition == Disposition::DeadLettered;
        let commit = Commit {
            claim,
            slots: Vec::new(),
            hops: Vec::new(),
            withdrawn,
            tally: Tally {
                resolved: u64::from(!dead),
                dead_lettered: u64::from(dead),
                ..Tally::default()
            },
        };
        let record = terminal_record(message, hop_id, holder, disposition);
        let blocks = self.append_then_commit(vec![record], commit).await?;
        let ledger_index = blocks
            .first()
            .map(|b| b.index)
            .ok_or(OrchestratorError::LedgerUnavailable(LedgerError::WriterStopped))?;

        if dead {
            warn!(message_id = %message.id(), hop = %hop_id, holder = %holder, "Message dead-lettered");
        } else {
            debug!(message_id = %message.id(), hop = %hop_id, holder = %holder, "Message resolved");
        }

        Ok(Receipt {
            message_id: message.id(),
            disposition,
            hops: vec![HopReceipt {
                hop_id,
                recipient: holder.clone(),
                ledger_index,
                displaced: None,
            }],
        })
    }

    /// Persist the batch; the writer applies `commit` before sealing the next one
    async fn append_then_commit(
        &self,
        records: Vec<RoutingRecord>,
        commit: Commit,
    ) -> Result<Vec<LedgerBlock>, OrchestratorError> {
        let stats = Arc::clone(&self.stats);
        self.ledger
            .append_batch_then(records, move |_| commit.apply(&stats))
            .await
            .map_err(OrchestratorError::LedgerUnavailable)
    }

    /// Fold one agent's processing time into the running average
    pub fn record_processing_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.stats.processing_micros.fetch_add(micros, Ordering::Relaxed);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current hierarchy snapshot
    pub fn hierarchy(&self) -> Arc<HierarchyIndex> {
        Arc::clone(&self.hierarchy.read())
    }

    /// Descriptors of every agent in the current hierarchy
    pub fn hierarchy_snapshot(&self) -> Vec<AgentDescriptor> {
        self.hierarchy().snapshot()
    }

    /// Swap in a new hierarchy. Agents that disappear keep their mailbox so
    /// queued work can still be drained and reassigned.
    pub fn replace_hierarchy(&self, hierarchy: HierarchyIndex) {
        {
            let mut mailboxes = self.mailboxes.write();
            for id in hierarchy.agent_ids() {
                mailboxes
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(Mailbox::new(id.clone(), self.config.mailbox_capacity)));
            }
        }
        info!(agents = hierarchy.len(), "Hierarchy replaced");
        *self.hierarchy.write() = Arc::new(hierarchy);
    }

    /// Mailbox of one agent, including agents dropped by a hierarchy update
    pub fn mailbox(&self, agent_id: &AgentId) -> Option<Arc<Mailbox>> {
        self.mailboxes.read().get(agent_id).cloned()
    }

    /// Depth and age of one agent's mailbox
    pub fn mailbox_stats(&self, agent_id: &AgentId) -> Option<MailboxStats> {
        self.mailbox(agent_id).map(|m| m.stats())
    }

    /// Every mailbox, sorted by agent id
    pub fn mailboxes(&self) -> Vec<Arc<Mailbox>> {
        let mut mailboxes: Vec<Arc<Mailbox>> = self.mailboxes.read().values().cloned().collect();
        mailboxes.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        mailboxes
    }

    /// A hop awaiting its outcome
    pub fn in_flight(&self, hop_id: &HopId) -> Option<Message> {
        self.hops.lock().in_flight.get(hop_id).cloned()
    }

    /// Hops delivered and awaiting an outcome. Hops whose batch is still
    /// being written are not counted.
    pub fn in_flight_count(&self) -> usize {
        self.hops.lock().in_flight.len()
    }

    /// The audit ledger every routing decision is written to
    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Last `n` ledger blocks, oldest first
    pub async fn recent_blocks(&self, n: usize) -> Result<Vec<LedgerBlock>, OrchestratorError> {
        self.ledger
            .recent(n)
            .await
            .map_err(OrchestratorError::LedgerUnavailable)
    }

    /// Walk the full chain and report its status
    pub async fn validate_ledger(&self) -> Result<ChainStatus, OrchestratorError> {
        self.ledger
            .validate()
            .await
            .map_err(OrchestratorError::LedgerUnavailable)
    }

    /// Like [`Self::validate_ledger`], but a broken chain is an error
    pub async fn verify_ledger(&self) -> Result<u64, OrchestratorError> {
        match self.validate_ledger().await? {
            ChainStatus::Intact { length } => Ok(length),
            ChainStatus::Tampered {
                first_invalid_index, ..
            } => {
                warn!(index = first_invalid_index, "Ledger tamper detected");
                Err(OrchestratorError::ChainTamperDetected {
                    index: first_invalid_index,
                })
            }
        }
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        let processed = self.stats.processed.load(Ordering::Relaxed);
        let average_processing_time = (processed > 0)
            .then(|| Duration::from_micros(self.stats.processing_micros.load(Ordering::Relaxed) / processed));
        StatsSnapshot {
            messages_routed: self.stats.messages_routed.load(Ordering::Relaxed),
            messages_failed: self.stats.messages_failed.load(Ordering::Relaxed),
            escalations: self.stats.escalations.load(Ordering::Relaxed),
            resolved: self.stats.resolved.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            displaced: self.stats.displaced.load(Ordering::Relaxed),
            average_processing_time,
        }
    }

    /// Counters, queue depths and a health verdict from the configured thresholds
    pub fn system_status(&self) -> SystemStatus {
        let mailboxes: Vec<MailboxStats> = self.mailboxes().iter().map(|m| m.stats()).collect();
        let total_queue_depth = mailboxes.iter().map(|m| m.depth).sum();
        let stats = self.stats();

        SystemStatus {
            total_agents: self.hierarchy().len(),
            in_flight: self.in_flight_count(),
            total_queue_depth,
            health: self.assess_health(total_queue_depth, stats.failure_rate()),
            stats,
            mailboxes,
        }
    }

    fn assess_health(&self, total_queue_depth: usize, failure_rate: f64) -> Health {
        let t = &self.config.health;
        if total_queue_depth > t.degraded_queue_depth || failure_rate > t.degraded_failure_rate {
            Health::Degraded
        } else if total_queue_depth > t.warning_queue_depth || failure_rate > t.warning_failure_rate {
            Health::Warning
        } else {
            Health::Healthy
        }
    }
}

fn recipient_of(message: &Message) -> &AgentId {
    message.recipient_id.as_ref().unwrap_or(&message.sender_id)
}

/// Block for a hop that ends with its holder
fn terminal_record(message: &Message, hop_id: HopId, holder: &AgentId, disposition: Disposition) -> RoutingRecord {
    RoutingRecord {
        message_id: message.id(),
        hop_id,
        sender: holder.clone(),
        recipient: holder.clone(),
        message_type: message.message_type,
        priority: message.priority,
        disposition,
        displaced: None,
    }
}

/// Shared handle to an orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    inner: Arc<Orchestrator>,
}

impl OrchestratorHandle {
    /// Wrap an orchestrator for sharing across tasks
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            inner: Arc::new(orchestrator),
        }
    }
}

impl Deref for OrchestratorHandle {
    type Target = Orchestrator;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
