//! Message model routed between agents

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque message body. The orchestrator never looks inside it.
pub type Payload = serde_json::Value;

/// Identity of an addressable agent in the hierarchy
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one logical request, shared by all of its hops
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one routing decision for a logical message.
///
/// `seq` is 0 for the submission and grows by one per escalation.
/// Broadcast copies share `seq` and carry a distinct `branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HopId {
    pub message_id: MessageId,
    pub seq: u32,
    pub branch: Option<u32>,
}

impl HopId {
    /// First hop of a freshly submitted message
    pub fn origin(message_id: MessageId) -> Self {
        Self {
            message_id,
            seq: 0,
            branch: None,
        }
    }

    /// The hop that follows this one for the same logical message
    pub fn next(self) -> Self {
        Self {
            seq: self.seq + 1,
            ..self
        }
    }

    /// A fan-out copy of this hop
    pub fn branch(self, branch: u32) -> Self {
        Self {
            branch: Some(branch),
            ..self
        }
    }
}

impl fmt::Display for HopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.branch {
            Some(branch) => write!(f, "{}/{}.{}", self.message_id, self.seq, branch),
            None => write!(f, "{}/{}", self.message_id, self.seq),
        }
    }
}

/// Kind of communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Query,
    Response,
    Escalation,
    Broadcast,
    Directive,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "QUERY",
            Self::Response => "RESPONSE",
            Self::Escalation => "ESCALATION",
            Self::Broadcast => "BROADCAST",
            Self::Directive => "DIRECTIVE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery urgency. Ordered so that `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Bands in dequeue order
    pub const BANDS: [Priority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Position in [`Priority::BANDS`]
    pub fn band(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// One band more urgent, saturating at `Critical`
    pub fn raised(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Whether a message of this priority may displace queued low-urgency work
    pub fn may_evict(self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an agent processing one hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Resolved,
    LowConfidence,
    TimedOut,
    Refused,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "RESOLVED",
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::TimedOut => "TIMED_OUT",
            Self::Refused => "REFUSED",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of communication between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    hop_id: HopId,
    /// Agent that routed this hop
    pub sender_id: AgentId,
    /// Target agent; `None` leaves resolution to the escalation policy
    pub recipient_id: Option<AgentId>,
    pub message_type: MessageType,
    pub priority: Priority,
    pub payload: Payload,
    /// When this hop was routed. Escalation hops are stamped afresh.
    pub created_at: DateTime<Utc>,
    /// Processing deadline measured from `created_at`
    pub ttl: Option<Duration>,
}

impl Message {
    /// Create a new message with a fresh id and no recipient
    pub fn new(sender_id: impl Into<AgentId>, message_type: MessageType, payload: Payload) -> Self {
        let id = MessageId::new();
        Self {
            id,
            hop_id: HopId::origin(id),
            sender_id: sender_id.into(),
            recipient_id: None,
            message_type,
            priority: Priority::default(),
            payload,
            created_at: Utc::now(),
            ttl: None,
        }
    }

    /// Direct query to a named agent
    pub fn query(
        sender_id: impl Into<AgentId>,
        recipient_id: impl Into<AgentId>,
        payload: Payload,
    ) -> Self {
        Self::new(sender_id, MessageType::Query, payload).to(recipient_id)
    }

    /// Use a caller-assigned id instead of a generated one
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self.hop_id = HopId::origin(id);
        self
    }

    pub fn to(mut self, recipient_id: impl Into<AgentId>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn hop_id(&self) -> HopId {
        self.hop_id
    }

    /// Point in time after which the consuming runtime reports `TIMED_OUT`
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Copy of this message routed as another hop of the same logical request
    pub(crate) fn rehop(
        &self,
        hop_id: HopId,
        sender_id: AgentId,
        recipient_id: AgentId,
        message_type: MessageType,
        priority: Priority,
    ) -> Self {
        Self {
            id: self.id,
            hop_id,
            sender_id,
            recipient_id: Some(recipient_id),
            message_type,
            priority,
            payload: self.payload.clone(),
            created_at: self.created_at,
            ttl: self.ttl,
        }
    }

    /// Next hop up the chain. The TTL restarts for the new holder.
    pub(crate) fn escalated(&self, sender_id: AgentId, recipient_id: AgentId, priority: Priority) -> Self {
        let mut hop = self.rehop(self.hop_id.next(), sender_id, recipient_id, MessageType::Escalation, priority);
        hop.created_at = Utc::now();
        hop
    }
}
