//! Routing and hierarchy error types

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::message::{AgentId, HopId, MessageId};

/// Errors returned by the orchestrator's public operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Sender or recipient is not in the hierarchy index
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// Direct message without a recipient
    #[error("{message_type} from {sender} has no recipient")]
    MissingRecipient {
        sender: AgentId,
        message_type: crate::message::MessageType,
    },

    /// Broadcast from an agent with nobody reporting to it
    #[error("Broadcast from {0} has no direct reports to reach")]
    EmptyBroadcast(AgentId),

    /// A message with this id is still being routed; the submission never entered
    #[error("Message {0} is already in flight")]
    DuplicateMessage(MessageId),

    /// Outcome reported for a hop that is not in flight
    #[error("Unknown or already retired hop: {0}")]
    UnknownHop(HopId),

    /// Target mailbox is at capacity
    #[error("Mailbox full: {0}")]
    MailboxFull(AgentId),

    /// The ledger append failed; nothing was delivered
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(#[source] LedgerError),

    /// Chain re-validation found a block whose contents do not hash correctly
    #[error("Ledger chain tampered at block {index}")]
    ChainTamperDetected { index: u64 },
}

impl OrchestratorError {
    /// Transient failures the caller may retry with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::MailboxFull(_))
    }
}

/// Load-time hierarchy validation failures
#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("Agent {0} appears more than once")]
    DuplicateAgent(AgentId),

    #[error("Agent {0} has level 0; levels start at 1")]
    InvalidLevel(AgentId),

    #[error("Agent {agent} reports to unknown agent {manager}")]
    UnknownManager { agent: AgentId, manager: AgentId },

    #[error("Level-1 agent {agent} cannot report to {manager}")]
    RootWithManager { agent: AgentId, manager: AgentId },

    #[error("Agent {agent} at level {level} has no manager")]
    MissingManager { agent: AgentId, level: u32 },

    #[error("Agent {agent} (level {level}) reports to {manager} at level {manager_level}")]
    LevelOrder {
        agent: AgentId,
        level: u32,
        manager: AgentId,
        manager_level: u32,
    },
}
