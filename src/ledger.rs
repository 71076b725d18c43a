//! Audit ledger - hash-chained record of every routing and agent decision
//!
//! ```text
//!   block[i].hash = SHA-256(index ‖ timestamp ‖ prev_hash ‖ payload_digest)
//!   block[i].prev_hash = block[i-1].hash        (all zeros for block 0)
//!   block[i].payload_digest = SHA-256(canonical JSON of block[i].record)
//! ```
//!
//! A single writer task owns the chain tail. Every append goes through its
//! request channel, so index assignment and `prev_hash` linkage never race.
//! After a failed sink write the writer re-reads the tail from the sink
//! before sealing anything else.
//! The chain proves tamper-evidence inside one trusted process; it is not a
//! consensus protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::message::{AgentId, HopId, MessageId, MessageType, Outcome, Payload, Priority};
use crate::sink::{LedgerSink, MemorySink};

/// 32-byte SHA-256 value, hex encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(Self(out))
    }
}

/// What happened to a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    /// Placed in the recipient's mailbox
    Delivered,
    /// Placed in the manager's mailbox after an unresolved outcome
    Escalated,
    /// Terminal: the holder resolved it
    Resolved,
    /// Terminal: escalation exhausted without resolution
    DeadLettered,
}

impl Disposition {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::DeadLettered)
    }
}

/// Audit record of one routing decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub message_id: MessageId,
    pub hop_id: HopId,
    pub sender: AgentId,
    pub recipient: AgentId,
    pub message_type: MessageType,
    pub priority: Priority,
    pub disposition: Disposition,
    /// Hop evicted from the recipient's mailbox to make room for this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displaced: Option<HopId>,
}

/// Periodic marker summarising the chain so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Index of the last block covered by this checkpoint
    pub through_index: u64,
    /// Routing blocks written so far
    pub routed_blocks: u64,
}

/// What an agent decided about a hop.
///
/// Context and response are stored as digests only; the ledger never holds
/// message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub agent_id: AgentId,
    pub hop_id: Option<HopId>,
    pub outcome: Outcome,
    /// SHA-256 of the canonical JSON the agent was given
    pub context_digest: BlockHash,
    /// SHA-256 of the canonical JSON the agent answered with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_digest: Option<BlockHash>,
    /// Self-reported confidence in `0.0..=1.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl DecisionRecord {
    pub fn new(agent_id: AgentId, hop_id: Option<HopId>, context: &Payload, outcome: Outcome) -> Result<Self, LedgerError> {
        Ok(Self {
            agent_id,
            hop_id,
            outcome,
            context_digest: json_digest(context)?,
            response_digest: None,
            confidence: None,
        })
    }

    pub fn with_response(mut self, response: &Payload) -> Result<Self, LedgerError> {
        self.response_digest = Some(json_digest(response)?);
        Ok(self)
    }

    /// Non-finite values are dropped, everything else is clamped to `0.0..=1.0`
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.is_finite().then(|| confidence.clamp(0.0, 1.0));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockRecord {
    Routing(RoutingRecord),
    Decision(DecisionRecord),
    Checkpoint(CheckpointRecord),
}

impl BlockRecord {
    /// SHA-256 over the canonical JSON serialization
    pub fn digest(&self) -> Result<BlockHash, LedgerError> {
        json_digest(self)
    }
}

fn json_digest<T: Serialize + ?Sized>(value: &T) -> Result<BlockHash, LedgerError> {
    let canonical = serde_json::to_vec(value)?;
    Ok(BlockHash(Sha256::digest(&canonical).into()))
}

/// One sealed, hash-linked ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerBlock {
    pub index: u64,
    /// Unix time in milliseconds
    pub timestamp: u64,
    pub prev_hash: BlockHash,
    pub payload_digest: BlockHash,
    pub hash: BlockHash,
    pub record: BlockRecord,
}

impl LedgerBlock {
    pub fn compute_hash(index: u64, timestamp: u64, prev_hash: &BlockHash, payload_digest: &BlockHash) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(index.to_be_bytes());
        hasher.update(timestamp.to_be_bytes());
        hasher.update(prev_hash.0);
        hasher.update(payload_digest.0);
        BlockHash(hasher.finalize().into())
    }

    pub fn routing(&self) -> Option<&RoutingRecord> {
        match &self.record {
            BlockRecord::Routing(r) => Some(r),
            _ => None,
        }
    }

    pub fn decision(&self) -> Option<&DecisionRecord> {
        match &self.record {
            BlockRecord::Decision(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self.record, BlockRecord::Checkpoint(_))
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(i64::try_from(self.timestamp).ok()?)
    }

    /// Whether every stored field agrees with a recomputation
    fn verify(&self, expected_index: u64, expected_prev: &BlockHash) -> bool {
        if self.index != expected_index || &self.prev_hash != expected_prev {
            return false;
        }
        match self.record.digest() {
            Ok(digest) if digest == self.payload_digest => {}
            _ => return false,
        }
        Self::compute_hash(self.index, self.timestamp, &self.prev_hash, &self.payload_digest) == self.hash
    }
}

/// Result of walking the chain from genesis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainStatus {
    Intact { length: u64 },
    Tampered { length: u64, first_invalid_index: u64 },
}

impl ChainStatus {
    pub fn is_intact(&self) -> bool {
        matches!(self, Self::Intact { .. })
    }

    pub fn first_invalid_index(&self) -> Option<u64> {
        match self {
            Self::Intact { .. } => None,
            Self::Tampered { first_invalid_index, .. } => Some(*first_invalid_index),
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            Self::Intact { length } | Self::Tampered { length, .. } => *length,
        }
    }
}

/// Recompute every block from genesis and report the first one that does not check out.
///
/// No stored field is trusted: index, linkage, digest and hash are all
/// recomputed. Runs in O(n).
pub fn validate_chain(blocks: &[LedgerBlock]) -> ChainStatus {
    let length = blocks.len() as u64;
    let mut expected_prev = BlockHash::ZERO;

    for (i, block) in blocks.iter().enumerate() {
        let index = i as u64;
        if !block.verify(index, &expected_prev) {
            return ChainStatus::Tampered {
                length,
                first_invalid_index: index,
            };
        }
        expected_prev = block.hash;
    }

    ChainStatus::Intact { length }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ledger sink rejected the write: {0}")]
    Sink(String),

    #[error("Ledger writer is not running")]
    WriterStopped,

    #[error("Imported chain is invalid at block {index}")]
    InvalidChain { index: u64 },

    #[error("Cannot import into a sink that already holds {0} blocks")]
    SinkNotEmpty(usize),
}

/// End of the chain: where the next block goes
#[derive(Debug, Clone, Copy)]
struct Tail {
    next_index: u64,
    last_hash: BlockHash,
    routed_blocks: u64,
}

impl Tail {
    fn genesis() -> Self {
        Self {
            next_index: 0,
            last_hash: BlockHash::ZERO,
            routed_blocks: 0,
        }
    }

    fn resume(blocks: &[LedgerBlock]) -> Self {
        match blocks.last() {
            Some(last) => Self {
                next_index: last.index + 1,
                last_hash: last.hash,
                routed_blocks: blocks.iter().filter(|b| b.routing().is_some()).count() as u64,
            },
            None => Self::genesis(),
        }
    }

    fn same_position(&self, other: &Tail) -> bool {
        self.next_index == other.next_index && self.last_hash == other.last_hash
    }

    fn seal(&mut self, record: BlockRecord, timestamp: u64) -> Result<LedgerBlock, LedgerError> {
        let payload_digest = record.digest()?;
        let index = self.next_index;
        let hash = LedgerBlock::compute_hash(index, timestamp, &self.last_hash, &payload_digest);

        if matches!(record, BlockRecord::Routing(_)) {
            self.routed_blocks += 1;
        }
        let block = LedgerBlock {
            index,
            timestamp,
            prev_hash: self.last_hash,
            payload_digest,
            hash,
            record,
        };
        self.next_index += 1;
        self.last_hash = hash;
        Ok(block)
    }
}

/// Seal records into a fresh chain starting at genesis
#[cfg(test)]
pub(crate) fn seal_chain(records: Vec<BlockRecord>) -> Result<Vec<LedgerBlock>, LedgerError> {
    let mut tail = Tail::genesis();
    records
        .into_iter()
        .map(|record| tail.seal(record, now_millis()))
        .collect()
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Runs on the writer task once a batch is persisted, before the next one is
/// sealed. Receives the non-checkpoint blocks in record order.
pub(crate) type OnPersisted = Box<dyn FnOnce(&[LedgerBlock]) + Send>;

struct AppendRequest {
    records: Vec<BlockRecord>,
    on_persisted: Option<OnPersisted>,
    reply: oneshot::Sender<Result<Vec<LedgerBlock>, LedgerError>>,
}

/// Tail and blocks since the last checkpoint, as stored in a sink
fn resume_state(existing: &[LedgerBlock]) -> (Tail, u64) {
    let since_checkpoint = existing
        .iter()
        .rev()
        .take_while(|b| !b.is_checkpoint())
        .count() as u64;
    (Tail::resume(existing), since_checkpoint)
}

/// The single appender. Owns the tail; nothing else writes to the sink.
struct LedgerWriter {
    sink: Arc<dyn LedgerSink>,
    tail: Tail,
    checkpoint_interval: Option<u64>,
    since_checkpoint: u64,
    /// Set when the sink's state is unknown after a failed write
    stale: bool,
    rx: mpsc::Receiver<AppendRequest>,
}

impl LedgerWriter {
    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            let AppendRequest {
                records,
                on_persisted,
                reply,
            } = request;
            let result = self.append(records).await;
            match &result {
                Ok(blocks) => {
                    if let Some(on_persisted) = on_persisted {
                        on_persisted(blocks);
                    }
                }
                Err(e) => {
                    // Roll back before the requester hears about it
                    drop(on_persisted);
                    error!(error = %e, next_index = self.tail.next_index, "Ledger append failed");
                }
            }
            // The requester may have gone away; persisted blocks stay in the chain either way
            let _ = reply.send(result);
        }
        debug!(next_index = self.tail.next_index, "Ledger writer stopped");
    }

    /// Seal and persist a batch. The tail only moves once the sink confirms.
    async fn append(&mut self, records: Vec<BlockRecord>) -> Result<Vec<LedgerBlock>, LedgerError> {
        if self.stale {
            self.resync().await?;
        }

        let mut tail = self.tail;
        let mut since_checkpoint = self.since_checkpoint;
        let mut sealed = Vec::with_capacity(records.len());
        let mut returned = Vec::with_capacity(records.len());
        let timestamp = now_millis();

        for record in records {
            let block = tail.seal(record, timestamp)?;
            returned.push(block.clone());
            sealed.push(block);
            since_checkpoint += 1;

            if let Some(interval) = self.checkpoint_interval {
                if since_checkpoint >= interval {
                    let checkpoint = CheckpointRecord {
                        through_index: tail.next_index - 1,
                        routed_blocks: tail.routed_blocks,
                    };
                    sealed.push(tail.seal(BlockRecord::Checkpoint(checkpoint), timestamp)?);
                    since_checkpoint = 0;
                }
            }
        }

        if let Err(e) = self.sink.append(&sealed).await {
            self.recover(e, &tail).await?;
            return Ok(returned);
        }

        if sealed.len() > returned.len() {
            info!(index = tail.next_index - 1, routed_blocks = tail.routed_blocks, "Ledger checkpoint");
        }
        self.tail = tail;
        self.since_checkpoint = since_checkpoint;
        Ok(returned)
    }

    /// Work out what a failed write left behind.
    ///
    /// Succeeds only if the sink turns out to hold the whole batch.
    async fn recover(&mut self, cause: LedgerError, intended: &Tail) -> Result<(), LedgerError> {
        if let Err(e) = self.resync().await {
            self.stale = true;
            error!(error = %e, "Cannot re-read ledger sink after failed write");
            return Err(cause);
        }
        if self.tail.same_position(intended) {
            warn!(error = %cause, next_index = self.tail.next_index, "Sink reported failure but holds the batch");
            return Ok(());
        }
        Err(cause)
    }

    async fn resync(&mut self) -> Result<(), LedgerError> {
        let existing = self.sink.read_all().await?;
        let (tail, since_checkpoint) = resume_state(&existing);
        if !tail.same_position(&self.tail) {
            warn!(
                expected_next = self.tail.next_index,
                stored_next = tail.next_index,
                "Ledger tail resynchronised from sink"
            );
        }
        self.tail = tail;
        self.since_checkpoint = since_checkpoint;
        self.stale = false;
        Ok(())
    }
}

/// Per-agent traffic in a compliance report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentActivity {
    pub sent: usize,
    pub received: usize,
}

/// Summary of ledger activity over a time window
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub report_id: Uuid,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_communications: usize,
    pub by_message_type: BTreeMap<MessageType, usize>,
    pub by_disposition: BTreeMap<Disposition, usize>,
    pub agent_activity: BTreeMap<AgentId, AgentActivity>,
    pub dead_lettered: Vec<MessageId>,
    /// Agent decision blocks in the window
    pub decisions: usize,
    pub integrity: ChainStatus,
    pub generated_at: DateTime<Utc>,
}

/// Handle to the audit ledger. Cheap to clone; all clones share one writer.
#[derive(Clone)]
pub struct AuditLedger {
    tx: mpsc::Sender<AppendRequest>,
    sink: Arc<dyn LedgerSink>,
}

impl fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLedger")
            .field("writer_running", &!self.tx.is_closed())
            .finish()
    }
}

impl AuditLedger {
    /// Start a ledger on top of a sink, resuming after any blocks it already holds.
    ///
    /// Must be called from within a tokio runtime; the writer runs as a task.
    pub async fn open(sink: Arc<dyn LedgerSink>, config: &LedgerConfig) -> Result<Self, LedgerError> {
        let existing = sink.read_all().await?;
        let (tail, since_checkpoint) = resume_state(&existing);

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let writer = LedgerWriter {
            sink: Arc::clone(&sink),
            tail,
            checkpoint_interval: config.checkpoint_interval,
            since_checkpoint,
            stale: false,
            rx,
        };
        tokio::spawn(writer.run());

        info!(resumed_blocks = existing.len(), next_index = tail.next_index, "Audit ledger opened");
        Ok(Self { tx, sink })
    }

    /// Ledger backed by a fresh [`MemorySink`]
    pub async fn in_memory(config: &LedgerConfig) -> Result<Self, LedgerError> {
        Self::open(Arc::new(MemorySink::new()), config).await
    }

    /// Write a verified chain into an empty sink and open a ledger on it
    pub async fn import(
        sink: Arc<dyn LedgerSink>,
        blocks: Vec<LedgerBlock>,
        config: &LedgerConfig,
    ) -> Result<Self, LedgerError> {
        if let Some(index) = validate_chain(&blocks).first_invalid_index() {
            return Err(LedgerError::InvalidChain { index });
        }
        let existing = sink.read_all().await?.len();
        if existing > 0 {
            return Err(LedgerError::SinkNotEmpty(existing));
        }
        sink.append(&blocks).await?;
        Self::open(sink, config).await
    }

    /// Append one routing record and wait until it is persisted
    pub async fn append(&self, record: RoutingRecord) -> Result<LedgerBlock, LedgerError> {
        self.append_batch(vec![record])
            .await?
            .pop()
            .ok_or(LedgerError::WriterStopped)
    }

    /// Append several records as one unit: all are persisted, or none are.
    ///
    /// Returns one block per record, in order. Checkpoint blocks the writer
    /// interleaves are not included.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn append_batch(&self, records: Vec<RoutingRecord>) -> Result<Vec<LedgerBlock>, LedgerError> {
        self.request(records.into_iter().map(BlockRecord::Routing).collect(), None)
            .await
    }

    /// Like [`Self::append_batch`], running `on_persisted` on the writer task
    /// before any later batch is sealed. If the append fails or the request
    /// never reaches the writer, `on_persisted` is dropped without running.
    pub(crate) async fn append_batch_then(
        &self,
        records: Vec<RoutingRecord>,
        on_persisted: impl FnOnce(&[LedgerBlock]) + Send + 'static,
    ) -> Result<Vec<LedgerBlock>, LedgerError> {
        self.request(
            records.into_iter().map(BlockRecord::Routing).collect(),
            Some(Box::new(on_persisted)),
        )
        .await
    }

    /// Record an agent's decision in the chain
    #[instrument(skip(self, record), fields(agent_id = %record.agent_id, outcome = %record.outcome))]
    pub async fn log_decision(&self, record: DecisionRecord) -> Result<LedgerBlock, LedgerError> {
        self.request(vec![BlockRecord::Decision(record)], None)
            .await?
            .pop()
            .ok_or(LedgerError::WriterStopped)
    }

    async fn request(
        &self,
        records: Vec<BlockRecord>,
        on_persisted: Option<OnPersisted>,
    ) -> Result<Vec<LedgerBlock>, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AppendRequest {
                records,
                on_persisted,
                reply,
            })
            .await
            .map_err(|_| LedgerError::WriterStopped)?;
        rx.await.map_err(|_| LedgerError::WriterStopped)?
    }

    /// Re-read the chain from the sink and walk it from genesis
    pub async fn validate(&self) -> Result<ChainStatus, LedgerError> {
        let blocks = self.sink.read_all().await?;
        Ok(validate_chain(&blocks))
    }

    pub async fn blocks_since(&self, index: u64) -> Result<Vec<LedgerBlock>, LedgerError> {
        let blocks = self.sink.read_all().await?;
        let start = usize::try_from(index).unwrap_or(usize::MAX).min(blocks.len());
        Ok(blocks[start..].to_vec())
    }

    /// Last `n` blocks, oldest first
    pub async fn recent(&self, n: usize) -> Result<Vec<LedgerBlock>, LedgerError> {
        let mut blocks = self.sink.read_all().await?;
        let start = blocks.len().saturating_sub(n);
        Ok(blocks.split_off(start))
    }

    pub async fn len(&self) -> Result<u64, LedgerError> {
        Ok(self.sink.read_all().await?.len() as u64)
    }

    /// Every stored block, genesis first
    pub async fn export(&self) -> Result<Vec<LedgerBlock>, LedgerError> {
        self.sink.read_all().await
    }

    /// Every hop recorded for one logical message, in ledger order
    pub async fn audit_trail(&self, message_id: MessageId) -> Result<Vec<LedgerBlock>, LedgerError> {
        let blocks = self.sink.read_all().await?;
        Ok(blocks
            .into_iter()
            .filter(|b| b.routing().is_some_and(|r| r.message_id == message_id))
            .collect())
    }

    /// Decision blocks logged by one agent, in ledger order
    pub async fn decisions(&self, agent_id: &AgentId) -> Result<Vec<LedgerBlock>, LedgerError> {
        let blocks = self.sink.read_all().await?;
        Ok(blocks
            .into_iter()
            .filter(|b| b.decision().is_some_and(|d| &d.agent_id == agent_id))
            .collect())
    }

    /// Routing blocks an agent sent or received, optionally bounded in time
    pub async fn communication_history(
        &self,
        agent_id: &AgentId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerBlock>, LedgerError> {
        let blocks = self.sink.read_all().await?;
        Ok(blocks
            .into_iter()
            .filter(|b| {
                b.routing()
                    .is_some_and(|r| &r.sender == agent_id || &r.recipient == agent_id)
            })
            .filter(|b| within(b, from, to))
            .collect())
    }

    pub async fn compliance_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ComplianceReport, LedgerError> {
        let blocks = self.sink.read_all().await?;
        let integrity = validate_chain(&blocks);

        let mut report = ComplianceReport {
            report_id: Uuid::new_v4(),
            from,
            to,
            total_communications: 0,
            by_message_type: BTreeMap::new(),
            by_disposition: BTreeMap::new(),
            agent_activity: BTreeMap::new(),
            dead_lettered: Vec::new(),
            decisions: 0,
            integrity,
            generated_at: Utc::now(),
        };

        let in_window: Vec<&LedgerBlock> = blocks.iter().filter(|b| within(b, Some(from), Some(to))).collect();
        report.decisions = in_window.iter().filter(|b| b.decision().is_some()).count();

        for record in in_window.iter().filter_map(|b| b.routing()) {
            report.total_communications += 1;
            *report.by_message_type.entry(record.message_type).or_default() += 1;
            *report.by_disposition.entry(record.disposition).or_default() += 1;

            match record.disposition {
                Disposition::Delivered | Disposition::Escalated => {
                    report.agent_activity.entry(record.sender.clone()).or_default().sent += 1;
                    report.agent_activity.entry(record.recipient.clone()).or_default().received += 1;
                }
                Disposition::DeadLettered => report.dead_lettered.push(record.message_id),
                Disposition::Resolved => {}
            }
        }

        Ok(report)
    }
}

fn within(block: &LedgerBlock, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    let Some(at) = block.recorded_at() else {
        return false;
    };
    from.map_or(true, |from| at >= from) && to.map_or(true, |to| at <= to)
}
