use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use super::circuit::CloseReason;
use super::message::Message;
use super::protocol::PacketFlags;
use crate::error::DeliveryFailure;

/// What eventually happened to a tracked reliable send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Failed(DeliveryFailure),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error("sequence {0} is already awaiting an ack")]
    Collision(u32),
    #[error("{0} messages already awaiting acks")]
    Backlog(usize),
}

/// A reliable message the peer has not acknowledged yet.
#[derive(Debug)]
pub struct PendingAck {
    pub sequence: u32,
    pub message: Message,
    /// Encoded frame without appended acks; resends flip the resent bit.
    pub frame: Vec<u8>,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub retries: u32,
    pub(crate) ticket: Option<Sender<DeliveryOutcome>>,
}

impl PendingAck {
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    pub(crate) fn notify(&mut self, outcome: DeliveryOutcome) {
        if let Some(ticket) = self.ticket.take() {
            // The waiter may have given up; nothing to report then.
            let _ = ticket.send(outcome);
        }
    }
}

#[derive(Debug)]
pub struct AckTracker {
    pending: HashMap<u32, PendingAck>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: HashMap::with_capacity(max_pending.min(64)),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track(&mut self, pending: PendingAck) -> Result<(), TrackError> {
        if self.pending.contains_key(&pending.sequence) {
            return Err(TrackError::Collision(pending.sequence));
        }
        if self.pending.len() >= self.max_pending {
            return Err(TrackError::Backlog(self.pending.len()));
        }
        self.pending.insert(pending.sequence, pending);
        Ok(())
    }

    /// Removes the entry for `sequence`. Only first transmissions feed the
    /// RTT estimate, since an ack for a resent frame is ambiguous.
    pub fn acknowledge(&mut self, sequence: u32, now: Instant) -> Option<PendingAck> {
        let pending = self.pending.remove(&sequence)?;
        if pending.retries == 0 {
            let rtt = now.duration_since(pending.first_sent).as_secs_f32() * 1000.0;
            self.update_rtt(rtt);
        }
        Some(pending)
    }

    /// Returns frames due for a resend (resent bit set, retry count bumped)
    /// and removes the entries that ran out of retries.
    pub fn collect_resends(
        &mut self,
        now: Instant,
        timeout: Duration,
        max_resends: u32,
    ) -> (Vec<(u32, Vec<u8>)>, Vec<PendingAck>) {
        let mut resends = Vec::new();
        let mut exhausted = Vec::new();

        for (&sequence, pending) in self.pending.iter_mut() {
            if now.duration_since(pending.last_sent) < timeout {
                continue;
            }
            if pending.retries >= max_resends {
                exhausted.push(sequence);
                continue;
            }
            pending.retries += 1;
            pending.last_sent = now;
            pending.message.resent = true;
            if let Some(flags) = pending.frame.first_mut() {
                *flags |= PacketFlags::RESENT.bits();
            }
            resends.push((sequence, pending.frame.clone()));
        }

        resends.sort_unstable_by_key(|(sequence, _)| *sequence);
        let expired = exhausted
            .into_iter()
            .filter_map(|sequence| self.pending.remove(&sequence))
            .collect();
        (resends, expired)
    }

    /// Takes every entry, used when the circuit closes.
    pub fn drain(&mut self) -> Vec<PendingAck> {
        self.pending.drain().map(|(_, pending)| pending).collect()
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.len()
    }
}

/// Bounded window of recently received sequence numbers.
#[derive(Debug)]
pub struct ReceiveTracker {
    seen: HashSet<u32>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl ReceiveTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if `sequence` is still inside the window.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(sequence);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Sequence numbers we owe the peer an ack for.
#[derive(Debug, Default)]
pub struct AckQueue {
    queue: VecDeque<u32>,
    oldest: Option<Instant>,
}

impl AckQueue {
    pub fn push(&mut self, sequence: u32, now: Instant) {
        if self.queue.is_empty() {
            self.oldest = Some(now);
        }
        self.queue.push_back(sequence);
    }

    pub fn take(&mut self, max: usize) -> Vec<u32> {
        let n = max.min(self.queue.len());
        let taken: Vec<u32> = self.queue.drain(..n).collect();
        if self.queue.is_empty() {
            self.oldest = None;
        }
        taken
    }

    pub fn is_due(&self, now: Instant, delay: Duration, batch: usize) -> bool {
        match self.oldest {
            Some(oldest) => self.queue.len() >= batch || now.duration_since(oldest) >= delay,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::MessageType;

    fn pending(sequence: u32, at: Instant) -> PendingAck {
        let mut message = Message::new(MessageType::TeleportStart);
        message.reliable = true;
        PendingAck {
            sequence,
            message,
            frame: vec![PacketFlags::RELIABLE.bits(), 0, 0, 0, sequence as u8],
            first_sent: at,
            last_sent: at,
            retries: 0,
            ticket: None,
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new(8);

        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(2));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut tracker = ReceiveTracker::new(3);
        for seq in 1..=4 {
            assert!(tracker.record_received(seq));
        }
        assert_eq!(tracker.len(), 3);
        // 1 fell out of the window, 4 is still inside
        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(4));
    }

    #[test]
    fn test_ack_tracker_rtt() {
        let start = Instant::now();
        let mut tracker = AckTracker::new(32);
        tracker.track(pending(1, start)).unwrap();

        let acked = tracker.acknowledge(1, start + Duration::from_millis(300));
        assert!(acked.is_some());
        assert!(tracker.srtt() > 100.0);
        assert!(tracker.acknowledge(1, start).is_none());
    }

    #[test]
    fn test_collision_and_backlog() {
        let now = Instant::now();
        let mut tracker = AckTracker::new(2);
        tracker.track(pending(1, now)).unwrap();
        assert_eq!(
            tracker.track(pending(1, now)),
            Err(TrackError::Collision(1))
        );
        tracker.track(pending(2, now)).unwrap();
        assert_eq!(tracker.track(pending(3, now)), Err(TrackError::Backlog(2)));
    }

    #[test]
    fn test_resend_then_expire() {
        let start = Instant::now();
        let timeout = Duration::from_millis(100);
        let mut tracker = AckTracker::new(8);
        tracker.track(pending(5, start)).unwrap();

        let (resends, expired) =
            tracker.collect_resends(start + Duration::from_millis(50), timeout, 2);
        assert!(resends.is_empty() && expired.is_empty());

        let mut at = start;
        for _ in 0..2 {
            at += timeout;
            let (resends, expired) = tracker.collect_resends(at, timeout, 2);
            assert_eq!(resends.len(), 1);
            assert!(expired.is_empty());
            assert_ne!(resends[0].1[0] & PacketFlags::RESENT.bits(), 0);
        }

        at += timeout;
        let (resends, expired) = tracker.collect_resends(at, timeout, 2);
        assert!(resends.is_empty());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].attempts(), 3);
        assert!(expired[0].message.resent);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn test_resent_ack_does_not_sample_rtt() {
        let start = Instant::now();
        let mut tracker = AckTracker::new(8);
        let mut entry = pending(9, start);
        entry.retries = 1;
        tracker.track(entry).unwrap();
        tracker.acknowledge(9, start + Duration::from_secs(5));
        assert_eq!(tracker.srtt(), 100.0);
    }

    #[test]
    fn test_ack_queue_flush_rules() {
        let now = Instant::now();
        let delay = Duration::from_millis(100);
        let mut queue = AckQueue::default();
        assert!(!queue.is_due(now, delay, 4));

        queue.push(1, now);
        queue.push(2, now);
        assert!(!queue.is_due(now, delay, 4));
        assert!(queue.is_due(now + delay, delay, 4));
        assert!(queue.is_due(now, delay, 2));

        assert_eq!(queue.take(1), vec![1]);
        assert_eq!(queue.take(10), vec![2]);
        assert!(queue.is_empty());
    }
}
