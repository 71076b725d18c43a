//! Escalation policy - where a message goes next
//!
//! Pure decisions over a [`Topology`]; the orchestrator applies them.

use tracing::warn;

use crate::error::OrchestratorError;
use crate::hierarchy::Topology;
use crate::message::{AgentId, Message, MessageType, Outcome, Priority};

/// Destination of a submitted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// One recipient
    Direct(AgentId),
    /// One copy per direct report of the sender
    FanOut(Vec<AgentId>),
    /// Manager-relative message from an agent with no manager
    DeadLetter,
}

/// What follows a reported outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// Resolved; nothing more to route
    Terminal,
    /// Hand the work to the holder's manager
    Escalate { to: AgentId, priority: Priority },
    /// Unresolved at the top of the hierarchy
    DeadLetter,
}

/// Resolve the destination of a freshly submitted message
pub fn route(message: &Message, topology: &impl Topology) -> Result<Route, OrchestratorError> {
    let sender = &message.sender_id;
    if topology.descriptor(sender).is_none() {
        return Err(OrchestratorError::UnknownAgent(sender.clone()));
    }

    match (&message.recipient_id, message.message_type) {
        (Some(recipient), _) => {
            if topology.descriptor(recipient).is_none() {
                return Err(OrchestratorError::UnknownAgent(recipient.clone()));
            }
            Ok(Route::Direct(recipient.clone()))
        }
        (None, MessageType::Broadcast) => {
            let reports = topology.direct_reports(sender);
            if reports.is_empty() {
                return Err(OrchestratorError::EmptyBroadcast(sender.clone()));
            }
            Ok(Route::FanOut(reports))
        }
        (None, MessageType::Escalation) => Ok(match manager(sender, topology) {
            Some(manager) => Route::Direct(manager),
            None => Route::DeadLetter,
        }),
        (None, message_type) => Err(OrchestratorError::MissingRecipient {
            sender: sender.clone(),
            message_type,
        }),
    }
}

/// Decide the next hop after the current holder reports an outcome
pub fn next_hop(message: &Message, outcome: Outcome, topology: &impl Topology) -> NextHop {
    let holder = message.recipient_id.as_ref().unwrap_or(&message.sender_id);

    match outcome {
        Outcome::Resolved => NextHop::Terminal,
        Outcome::LowConfidence | Outcome::TimedOut | Outcome::Refused => match manager(holder, topology) {
            Some(to) => NextHop::Escalate {
                to,
                priority: message.priority.raised(),
            },
            None => NextHop::DeadLetter,
        },
    }
}

/// The single manager of an agent; lowest id wins if the topology offers several
fn manager(agent_id: &AgentId, topology: &impl Topology) -> Option<AgentId> {
    let mut candidates = topology.managers(agent_id);
    if candidates.len() > 1 {
        candidates.sort();
        warn!(
            agent_id = %agent_id,
            candidates = ?candidates,
            chosen = %candidates[0],
            "Hierarchy inconsistency: multiple managers, choosing lowest id"
        );
    }
    candidates.into_iter().next()
}
