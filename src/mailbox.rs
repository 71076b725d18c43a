//! Per-agent bounded priority mailbox
//!
//! One FIFO per priority band, scanned from `CRITICAL` down to `LOW` on
//! dequeue. Enqueue never blocks: a full mailbox either rejects the newcomer
//! or, for `HIGH`/`CRITICAL` traffic, displaces the oldest `LOW` (then
//! `NORMAL`) item.
//!
//! The orchestrator routes through [`Reservation`]s: capacity is claimed
//! first, the ledger append happens, and only then does the message become
//! visible. Reservations are committed by the ledger writer in block order,
//! so within a band the queue follows the ledger. A dropped reservation puts
//! everything back where it was.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::message::{AgentId, HopId, Message, Priority};

/// Returned when an enqueue finds the mailbox at capacity
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Mailbox for {agent_id} is full ({capacity} messages)")]
pub struct MailboxFull {
    pub agent_id: AgentId,
    pub capacity: usize,
}

/// Depth and age snapshot of one mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxStats {
    pub agent_id: AgentId,
    pub depth: usize,
    pub capacity: usize,
    pub oldest_age: Option<Duration>,
}

#[derive(Debug)]
struct Queued {
    seq: u64,
    enqueued_at: Instant,
    message: Message,
}

#[derive(Debug, Default)]
struct MailboxInner {
    bands: [VecDeque<Queued>; 4],
    /// Slots claimed by reservations that are not yet committed
    reserved: usize,
    next_seq: u64,
    closed: bool,
}

impl MailboxInner {
    fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    fn occupancy(&self) -> usize {
        self.len() + self.reserved
    }

    fn push(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.bands[message.priority.band()].push_back(Queued {
            seq,
            enqueued_at: Instant::now(),
            message,
        });
    }

    fn pop_front(&mut self) -> Option<Queued> {
        self.bands.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Oldest LOW item, else oldest NORMAL item
    fn take_victim(&mut self) -> Option<Queued> {
        [Priority::Low, Priority::Normal]
            .into_iter()
            .find_map(|p| self.bands[p.band()].pop_front())
    }

    /// Put an item back at its original arrival position
    fn restore(&mut self, queued: Queued) {
        let band = &mut self.bands[queued.message.priority.band()];
        let pos = band.partition_point(|q| q.seq < queued.seq);
        band.insert(pos, queued);
    }

    fn remove_hop(&mut self, hop_id: HopId) -> Option<Queued> {
        self.bands.iter_mut().find_map(|band| {
            let pos = band.iter().position(|q| q.message.hop_id() == hop_id)?;
            band.remove(pos)
        })
    }
}

/// Bounded, priority-ordered inbound queue of one agent
#[derive(Debug)]
pub struct Mailbox {
    agent_id: AgentId,
    capacity: usize,
    inner: Mutex<MailboxInner>,
    notify: Notify,
}

impl Mailbox {
    /// Empty mailbox holding at most `capacity` messages
    pub fn new(agent_id: AgentId, capacity: usize) -> Self {
        Self {
            agent_id,
            capacity,
            inner: Mutex::new(MailboxInner::default()),
            notify: Notify::new(),
        }
    }

    /// Agent that consumes this mailbox
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Maximum number of queued plus reserved messages
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue without blocking.
    ///
    /// Returns the message displaced to make room, if any.
    pub fn enqueue(&self, message: Message) -> Result<Option<Message>, MailboxFull> {
        let victim = self.claim(message.priority)?;
        {
            let mut inner = self.inner.lock();
            inner.reserved -= 1;
            inner.push(message);
        }
        self.notify.notify_one();
        Ok(victim.map(|q| q.message))
    }

    /// Wait for the next message. Returns `None` once closed and empty.
    pub async fn dequeue(&self) -> Option<Message> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(queued) = inner.pop_front() {
                    return Some(queued.message);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the next message if one is queued, without waiting
    pub fn try_dequeue(&self) -> Option<Message> {
        self.inner.lock().pop_front().map(|q| q.message)
    }

    /// Messages currently queued; reserved slots are not counted
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything, in dequeue order
    pub fn drain(&self) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.len());
        while let Some(queued) = inner.pop_front() {
            drained.push(queued.message);
        }
        drained
    }

    /// Time the longest-waiting message has spent queued
    pub fn oldest_age(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .bands
            .iter()
            .filter_map(|band| band.front())
            .map(|q| q.enqueued_at)
            .min()
            .map(|at| at.elapsed())
    }

    /// Depth, capacity and oldest age in one snapshot
    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            agent_id: self.agent_id.clone(),
            depth: self.len(),
            capacity: self.capacity,
            oldest_age: self.oldest_age(),
        }
    }

    /// Stop accepting waits; suspended consumers drain what is left and exit
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether [`Mailbox::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Claim room for one message of the given priority
    pub(crate) fn reserve(self: &Arc<Self>, priority: Priority) -> Result<Reservation, MailboxFull> {
        let victim = self.claim(priority)?;
        Ok(Reservation::new(Arc::clone(self), victim))
    }

    /// Count one reserved slot, evicting if allowed. Returns the victim.
    fn claim(&self, priority: Priority) -> Result<Option<Queued>, MailboxFull> {
        let mut inner = self.inner.lock();

        if inner.occupancy() < self.capacity {
            inner.reserved += 1;
            return Ok(None);
        }

        if priority.may_evict() {
            if let Some(victim) = inner.take_victim() {
                inner.reserved += 1;
                warn!(
                    agent_id = %self.agent_id,
                    evicted = %victim.message.hop_id(),
                    evicted_priority = %victim.message.priority,
                    incoming_priority = %priority,
                    "Mailbox full, displacing oldest low-priority message"
                );
                return Ok(Some(victim));
            }
        }

        debug!(agent_id = %self.agent_id, capacity = self.capacity, "Mailbox full");
        Err(MailboxFull {
            agent_id: self.agent_id.clone(),
            capacity: self.capacity,
        })
    }

    /// Pull a still-queued hop out, keeping its slot until the reservation ends
    pub(crate) fn withdraw(self: &Arc<Self>, hop_id: HopId) -> Option<Reservation> {
        let queued = {
            let mut inner = self.inner.lock();
            let queued = inner.remove_hop(hop_id)?;
            inner.reserved += 1;
            queued
        };
        Some(Reservation::new(Arc::clone(self), Some(queued)))
    }
}

/// Capacity claimed in a mailbox.
///
/// `commit` makes a message visible, `release` gives the slot back and
/// discards whatever was held. Dropping the reservation undoes it: the slot
/// is freed and any held message returns to its original position.
#[must_use]
#[derive(Debug)]
pub(crate) struct Reservation {
    mailbox: Arc<Mailbox>,
    held: Option<Queued>,
    settled: bool,
}

impl Reservation {
    fn new(mailbox: Arc<Mailbox>, held: Option<Queued>) -> Self {
        Self {
            mailbox,
            held,
            settled: false,
        }
    }

    /// Message taken out of the queue by this reservation
    pub(crate) fn held(&self) -> Option<&Message> {
        self.held.as_ref().map(|q| &q.message)
    }

    /// Enqueue into the claimed slot. Returns the held message, if any.
    pub(crate) fn commit(mut self, message: Message) -> Option<Message> {
        {
            let mut inner = self.mailbox.inner.lock();
            inner.reserved -= 1;
            inner.push(message);
        }
        self.settled = true;
        self.mailbox.notify.notify_one();
        self.held.take().map(|q| q.message)
    }

    /// Free the slot without enqueuing. Returns the held message, if any.
    pub(crate) fn release(mut self) -> Option<Message> {
        self.mailbox.inner.lock().reserved -= 1;
        self.settled = true;
        self.held.take().map(|q| q.message)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let restored = {
            let mut inner = self.mailbox.inner.lock();
            inner.reserved -= 1;
            match self.held.take() {
                Some(queued) => {
                    inner.restore(queued);
                    true
                }
                None => false,
            }
        };
        if restored {
            self.mailbox.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use proptest::prelude::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready};

    fn msg(priority: Priority, n: u64) -> Message {
        Message::new("A", MessageType::Query, json!({ "n": n }))
            .to("C")
            .with_priority(priority)
    }

    fn n(message: &Message) -> u64 {
        message.payload["n"].as_u64().unwrap()
    }

    fn mailbox(capacity: usize) -> Mailbox {
        Mailbox::new(AgentId::from("C"), capacity)
    }

    // === Ordering Tests ===

    #[test]
    fn test_critical_before_normal() {
        let mb = mailbox(8);
        mb.enqueue(msg(Priority::Normal, 1)).unwrap();
        mb.enqueue(msg(Priority::Low, 2)).unwrap();
        mb.enqueue(msg(Priority::Critical, 3)).unwrap();
        mb.enqueue(msg(Priority::High, 4)).unwrap();
        mb.enqueue(msg(Priority::Normal, 5)).unwrap();

        let order: Vec<u64> = mb.drain().iter().map(n).collect();
        assert_eq!(order, vec![3, 4, 1, 5, 2]);
        assert!(mb.is_empty());
    }

    proptest! {
        #[test]
        fn prop_bands_then_arrival(bands in proptest::collection::vec(0usize..4, 0..64)) {
            let mb = mailbox(64);
            for (i, band) in bands.iter().enumerate() {
                mb.enqueue(msg(Priority::BANDS[*band], i as u64)).unwrap();
            }

            let mut expected: Vec<(usize, u64)> =
                bands.iter().enumerate().map(|(i, b)| (*b, i as u64)).collect();
            expected.sort();

            let mut actual = Vec::new();
            while let Some(m) = mb.try_dequeue() {
                actual.push((m.priority.band(), n(&m)));
            }
            prop_assert_eq!(actual, expected);
        }
    }

    // === Capacity Tests ===

    #[test]
    fn test_overflow_rejects_normal_and_critical_evicts() {
        let mb = mailbox(2);
        mb.enqueue(msg(Priority::Normal, 1)).unwrap();
        mb.enqueue(msg(Priority::Normal, 2)).unwrap();

        let err = mb.enqueue(msg(Priority::Normal, 3)).unwrap_err();
        assert_eq!(err.capacity, 2);

        let evicted = mb.enqueue(msg(Priority::Critical, 4)).unwrap().unwrap();
        assert_eq!(n(&evicted), 1);
        assert_eq!(mb.len(), 2);

        let order: Vec<u64> = mb.drain().iter().map(n).collect();
        assert_eq!(order, vec![4, 2]);
    }

    #[test]
    fn test_eviction_prefers_low() {
        let mb = mailbox(2);
        mb.enqueue(msg(Priority::Normal, 1)).unwrap();
        mb.enqueue(msg(Priority::Low, 2)).unwrap();

        let evicted = mb.enqueue(msg(Priority::High, 3)).unwrap().unwrap();
        assert_eq!(n(&evicted), 2);
    }

    #[test]
    fn test_no_eviction_of_urgent_work() {
        let mb = mailbox(1);
        mb.enqueue(msg(Priority::High, 1)).unwrap();
        assert!(mb.enqueue(msg(Priority::Critical, 2)).is_err());
    }

    #[test]
    fn test_low_never_evicts() {
        let mb = mailbox(1);
        mb.enqueue(msg(Priority::Low, 1)).unwrap();
        assert!(mb.enqueue(msg(Priority::Low, 2)).is_err());
    }

    // === Reservation Tests ===

    #[test]
    fn test_reservation_counts_against_capacity() {
        let mb = Arc::new(mailbox(1));
        let slot = mb.reserve(Priority::Normal).unwrap();
        assert!(mb.reserve(Priority::Normal).is_err());
        assert!(mb.is_empty());

        drop(slot);
        assert!(mb.reserve(Priority::Normal).is_ok());
    }

    #[test]
    fn test_aborted_eviction_restores_victim() {
        let mb = Arc::new(mailbox(2));
        mb.enqueue(msg(Priority::Normal, 1)).unwrap();
        mb.enqueue(msg(Priority::Normal, 2)).unwrap();

        let slot = mb.reserve(Priority::Critical).unwrap();
        assert_eq!(slot.held().map(n), Some(1));
        assert_eq!(mb.len(), 1);
        drop(slot);

        let order: Vec<u64> = mb.drain().iter().map(n).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_withdraw_and_release() {
        let mb = Arc::new(mailbox(4));
        let first = msg(Priority::Normal, 1);
        let hop = first.hop_id();
        mb.enqueue(first).unwrap();
        mb.enqueue(msg(Priority::Normal, 2)).unwrap();

        let slot = mb.withdraw(hop).unwrap();
        let withdrawn = slot.release().unwrap();
        assert_eq!(n(&withdrawn), 1);
        assert_eq!(mb.len(), 1);
        assert!(mb.withdraw(hop).is_none());
    }

    #[test]
    fn test_withdraw_abort_keeps_position() {
        let mb = Arc::new(mailbox(4));
        mb.enqueue(msg(Priority::Normal, 1)).unwrap();
        let second = msg(Priority::Normal, 2);
        let hop = second.hop_id();
        mb.enqueue(second).unwrap();
        mb.enqueue(msg(Priority::Normal, 3)).unwrap();

        drop(mb.withdraw(hop).unwrap());

        let order: Vec<u64> = mb.drain().iter().map(n).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_queue_follows_commit_order() {
        let mb = Arc::new(mailbox(4));
        let first = mb.reserve(Priority::Normal).unwrap();
        let second = mb.reserve(Priority::Normal).unwrap();

        second.commit(msg(Priority::Normal, 2));
        first.commit(msg(Priority::Normal, 1));

        let order: Vec<u64> = mb.drain().iter().map(n).collect();
        assert_eq!(order, vec![2, 1]);
    }

    // === Suspension Tests ===

    #[test]
    fn test_dequeue_suspends_until_enqueue() {
        let mb = Arc::new(mailbox(4));
        let consumer = Arc::clone(&mb);
        let mut fut = tokio_test::task::spawn(async move { consumer.dequeue().await });

        assert_pending!(fut.poll());

        mb.enqueue(msg(Priority::Low, 9)).unwrap();
        assert!(fut.is_woken());

        let received = assert_ready!(fut.poll()).unwrap();
        assert_eq!(n(&received), 9);
    }

    #[test]
    fn test_close_wakes_consumer() {
        let mb = Arc::new(mailbox(4));
        let consumer = Arc::clone(&mb);
        let mut fut = tokio_test::task::spawn(async move { consumer.dequeue().await });

        assert_pending!(fut.poll());
        mb.close();
        assert!(fut.is_woken());
        assert!(assert_ready!(fut.poll()).is_none());
    }

    #[tokio::test]
    async fn test_closed_mailbox_drains_remaining() {
        let mb = mailbox(4);
        mb.enqueue(msg(Priority::Normal, 1)).unwrap();
        mb.close();

        assert_eq!(mb.dequeue().await.map(|m| n(&m)), Some(1));
        assert!(mb.dequeue().await.is_none());
    }

    #[test]
    fn test_stats() {
        let mb = mailbox(3);
        assert!(mb.oldest_age().is_none());
        mb.enqueue(msg(Priority::Normal, 1)).unwrap();

        let stats = mb.stats();
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.capacity, 3);
        assert!(stats.oldest_age.is_some());
    }
}
