//! # Cadre
//!
//! Hierarchical message routing for groups of cooperating agents, with a
//! tamper-evident audit trail of every routing decision.
//!
//! ## Architecture
//!
//! ```text
//!   producers ──submit / report_outcome──┐
//!                                        ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │  Hierarchy   │  │  Escalation  │  │   In-flight  │               │
//! │  │    Index     │  │    Policy    │  │     hops     │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └──────────┬─────────────────────────────────────────┬────────────────┘
//!            │ reserve / commit                        │ append (awaited)
//!            ▼                                         ▼
//!   ┌─────────────────┐                      ┌──────────────────┐
//!   │ Mailbox per     │                      │   Ledger writer  │
//!   │ agent (4 bands) │                      │ (single task)    │
//!   └────────┬────────┘                      └────────┬─────────┘
//!            │ dequeue                                │
//!            ▼                                        ▼
//!   ┌─────────────────┐                      ┌──────────────────┐
//!   │ Agent consumers │                      │ LedgerSink       │
//!   │ (AgentRuntime)  │                      │ memory / file    │
//!   └─────────────────┘                      └──────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Hierarchy**: agents by level; every non-root reports to one manager
//! - **Mailbox**: bounded per-agent queue, highest priority first
//! - **Hop**: one routing decision for a message; escalation adds a hop
//! - **Ledger**: append-only, SHA-256 linked blocks, one per hop, plus
//!   optional digest-only records of what each agent decided
//!
//! ## Example
//!
//! ```no_run
//! use cadre::{AgentDescriptor, HierarchyIndex, Message, Orchestrator, OrchestratorConfig, Outcome};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let hierarchy = HierarchyIndex::new(vec![
//!     AgentDescriptor::root("ceo"),
//!     AgentDescriptor::reporting("lead", 2, "ceo"),
//!     AgentDescriptor::reporting("worker", 3, "lead"),
//! ])?;
//! let orchestrator = Orchestrator::in_memory(hierarchy, OrchestratorConfig::default()).await?;
//!
//! let receipt = orchestrator.submit(Message::query("lead", "worker", json!({"task": "summarise"}))).await?;
//! if let Some(hop) = receipt.hop_id() {
//!     // worker could not answer; the lead gets it next
//!     orchestrator.report_outcome(hop, Outcome::LowConfidence).await?;
//! }
//! assert!(orchestrator.validate_ledger().await?.is_intact());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod escalation;
pub mod hierarchy;
pub mod ledger;
pub mod mailbox;
pub mod message;
pub mod orchestrator;
pub mod sink;

pub use agent::{spawn_consumers, spawn_consumers_for, AgentRuntime, AgentStatus, AgentWorker, ConsumerSet, Processed};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{HierarchyError, OrchestratorError};
pub use hierarchy::{AgentDescriptor, HierarchyConfig, HierarchyIndex, Topology};
pub use ledger::{
    validate_chain, AuditLedger, BlockHash, ChainStatus, ComplianceReport, DecisionRecord, Disposition, LedgerBlock,
    LedgerError,
};
pub use mailbox::{Mailbox, MailboxFull, MailboxStats};
pub use message::{AgentId, HopId, Message, MessageId, MessageType, Outcome, Payload, Priority};
pub use orchestrator::{Health, Orchestrator, OrchestratorHandle, Receipt, StatsSnapshot, SystemStatus};
pub use sink::{FileSink, LedgerSink, MemorySink};
