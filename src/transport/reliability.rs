//! Sequencing, acknowledgement and delivery ordering.
//!
//! Sequence numbers are 16 bits per channel and wrap; comparisons go
//! through [`seq_diff`], which treats the half of the ring ahead of a
//! sequence as newer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::frame::MessageType;
use crate::core::ACK_WINDOW_BITS;

/// Signed distance from `b` to `a` on the 16-bit ring.
#[inline]
pub fn seq_diff(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Whether `a` is newer than `b`.
#[inline]
pub fn seq_newer(a: u16, b: u16) -> bool {
    seq_diff(a, b) > 0
}

/// Sequences named by an acknowledgement: `latest` and every bit of `mask`,
/// where bit `i` stands for `latest - 1 - i`.
pub fn acked_sequences(latest: u16, mask: u32) -> impl Iterator<Item = u16> {
    std::iter::once(latest).chain(
        (0..ACK_WINDOW_BITS)
            .filter(move |bit| mask & (1 << bit) != 0)
            .map(move |bit| latest.wrapping_sub(1 + bit)),
    )
}

/// Received reliable sequences of one channel, summarized for acks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckWindow {
    latest: Option<u16>,
    mask: u32,
}

impl AckWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `seq` received.
    pub fn record(&mut self, seq: u16) {
        let Some(latest) = self.latest else {
            self.latest = Some(seq);
            self.mask = 0;
            return;
        };

        let diff = seq_diff(seq, latest);
        if diff > 0 {
            let shift = diff as u32;
            self.mask = if shift > u32::from(ACK_WINDOW_BITS) {
                0
            } else {
                // Old latest lands on bit `shift - 1`
                let shifted = (u64::from(self.mask) << shift) | (1u64 << (shift - 1));
                shifted as u32
            };
            self.latest = Some(seq);
        } else if diff < 0 {
            let bit = u32::from(diff.unsigned_abs()) - 1;
            if bit < u32::from(ACK_WINDOW_BITS) {
                self.mask |= 1 << bit;
            }
        }
    }

    /// `(latest, mask)` to put in an acknowledgement.
    pub fn fields(&self) -> Option<(u16, u32)> {
        self.latest.map(|latest| (latest, self.mask))
    }
}

/// A reliable message waiting for its acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Message type, pings are the only RTT source.
    pub message_type: MessageType,
    /// Channel.
    pub channel: u8,
    /// Sequence.
    pub sequence: u16,
    /// Encoded message, attempt byte included.
    pub bytes: Vec<u8>,
    /// Offset of the attempt byte in `bytes`.
    pub attempt_offset: usize,
    /// Current attempt, zero for the first send.
    pub attempt: u8,
    /// When the first send left the peer.
    pub first_sent: Option<Instant>,
    /// When the latest send left the peer.
    pub last_sent: Option<Instant>,
    /// When the next resend is due.
    pub next_resend: Option<Instant>,
}

impl PendingMessage {
    /// Wrap an encoded reliable message.
    pub fn new(
        message_type: MessageType,
        channel: u8,
        sequence: u16,
        bytes: Vec<u8>,
        attempt_offset: usize,
    ) -> Self {
        Self {
            message_type,
            channel,
            sequence,
            bytes,
            attempt_offset,
            attempt: 0,
            first_sent: None,
            last_sent: None,
            next_resend: None,
        }
    }
}

/// Reliable messages in flight, keyed by `(channel, sequence)`.
#[derive(Debug, Default)]
pub struct ResendQueue {
    entries: HashMap<(u8, u16), PendingMessage>,
}

impl ResendQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a message. Returns a stale entry with the same key, which can
    /// only exist after a full wrap of the channel's sequences.
    pub fn insert(&mut self, message: PendingMessage) -> Option<PendingMessage> {
        self.entries
            .insert((message.channel, message.sequence), message)
    }

    /// Stop tracking an acknowledged message.
    pub fn acknowledge(&mut self, channel: u8, sequence: u16) -> Option<PendingMessage> {
        self.entries.remove(&(channel, sequence))
    }

    /// Look up a message.
    pub fn get(&self, channel: u8, sequence: u16) -> Option<&PendingMessage> {
        self.entries.get(&(channel, sequence))
    }

    /// Stamp a send at `now` and schedule the next resend after `delay`.
    pub fn mark_sent(&mut self, channel: u8, sequence: u16, now: Instant, delay: Duration) {
        if let Some(entry) = self.entries.get_mut(&(channel, sequence)) {
            entry.first_sent.get_or_insert(now);
            entry.last_sent = Some(now);
            entry.next_resend = Some(now + delay);
        }
    }

    /// Keys of messages due for a resend at `now`, oldest first.
    pub fn due(&self, now: Instant) -> Vec<(u8, u16)> {
        let mut due: Vec<_> = self
            .entries
            .values()
            .filter_map(|entry| match entry.next_resend {
                Some(at) if at <= now => Some((at, entry.channel, entry.sequence)),
                _ => None,
            })
            .collect();
        due.sort_unstable();
        due.into_iter()
            .map(|(_, channel, sequence)| (channel, sequence))
            .collect()
    }

    /// Bump the attempt of a message and patch it into the encoded bytes.
    ///
    /// Returns the new attempt and the bytes to send again.
    pub fn next_attempt(&mut self, channel: u8, sequence: u16) -> Option<(u8, &[u8])> {
        let entry = self.entries.get_mut(&(channel, sequence))?;
        entry.attempt = entry.attempt.wrapping_add(1);
        entry.next_resend = None;
        if let Some(byte) = entry.bytes.get_mut(entry.attempt_offset) {
            *byte = entry.attempt;
        }
        Some((entry.attempt, entry.bytes.as_slice()))
    }

    /// Number of messages in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every message, returning their buffers.
    pub fn drain(&mut self) -> impl Iterator<Item = PendingMessage> + '_ {
        self.entries.drain().map(|(_, entry)| entry)
    }
}

/// Outcome of offering a message to an [`OrderedChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderedOutcome {
    /// Delivered now, possibly followed by buffered successors.
    Delivered,
    /// Held until its predecessors arrive.
    Buffered,
    /// Older than the delivery cursor or already buffered; dropped.
    Late,
}

#[derive(Debug)]
struct Held<T> {
    sequence: u16,
    deadline: Instant,
    passed: u32,
    /// `None` marks a sequence consumed by a message outside the ordering.
    message: Option<T>,
}

/// Delivery cursor of one ordered channel.
///
/// Reliable messages that arrive ahead of the cursor wait for the gap to
/// fill, but only until `delay_max` later messages were delivered or
/// `delay_timeout` elapsed. Unreliable messages never wait.
///
/// Every sequenced message of the channel shares the cursor, so messages
/// delivered outside the ordering still have to [`pass`](Self::pass)
/// through it to keep the gaps honest.
#[derive(Debug)]
pub struct OrderedChannel<T> {
    last: u16,
    held: Vec<Held<T>>,
    delay_max: u32,
    delay_timeout: Duration,
}

impl<T> OrderedChannel<T> {
    /// Create a channel expecting sequence 0 first. A zero `delay_max` or
    /// `delay_timeout` disables buffering.
    pub fn new(delay_max: u32, delay_timeout: Duration) -> Self {
        Self {
            last: u16::MAX,
            held: Vec::new(),
            delay_max,
            delay_timeout,
        }
    }

    fn buffering(&self) -> bool {
        self.delay_max > 0 && !self.delay_timeout.is_zero()
    }

    /// Last sequence the cursor moved past.
    pub fn last(&self) -> u16 {
        self.last
    }

    /// Number of held messages.
    pub fn held(&self) -> usize {
        self.held.iter().filter(|held| held.message.is_some()).count()
    }

    /// Offer ordered message `sequence`; deliverable messages are pushed to
    /// `out` in sequence order.
    pub fn receive(
        &mut self,
        now: Instant,
        sequence: u16,
        reliable: bool,
        message: T,
        out: &mut Vec<T>,
    ) -> OrderedOutcome {
        self.offer(now, sequence, reliable, Some(message), out)
    }

    /// Move the cursor over `sequence`, taken by a message that is not
    /// ordered. Held messages it unblocks are pushed to `out`.
    pub fn pass(&mut self, now: Instant, sequence: u16, reliable: bool, out: &mut Vec<T>) {
        self.offer(now, sequence, reliable, None, out);
    }

    fn offer(
        &mut self,
        now: Instant,
        sequence: u16,
        reliable: bool,
        message: Option<T>,
        out: &mut Vec<T>,
    ) -> OrderedOutcome {
        let diff = seq_diff(sequence, self.last);
        if diff <= 0 || self.held.iter().any(|held| held.sequence == sequence) {
            return OrderedOutcome::Late;
        }

        if diff > 1 && reliable && self.buffering() {
            let held = Held {
                sequence,
                deadline: now + self.delay_timeout,
                passed: 0,
                message,
            };
            let position = self
                .held
                .iter()
                .position(|other| seq_newer(other.sequence, sequence))
                .unwrap_or(self.held.len());
            self.held.insert(position, held);
            return OrderedOutcome::Buffered;
        }

        // Held predecessors go first when the cursor jumps
        self.release_through(sequence.wrapping_sub(1), out);
        self.deliver(sequence, message, out);
        self.drain(out);
        OrderedOutcome::Delivered
    }

    /// Force out held messages whose wait is over.
    pub fn sweep(&mut self, now: Instant, out: &mut Vec<T>) {
        let delay_max = self.delay_max;
        let expired = self
            .held
            .iter()
            .rev()
            .find(|held| held.passed >= delay_max || now >= held.deadline)
            .map(|held| held.sequence);
        if let Some(sequence) = expired {
            self.release_through(sequence, out);
            self.drain(out);
        }
    }

    /// Drop every held message.
    pub fn clear(&mut self) -> impl Iterator<Item = T> + '_ {
        self.held.drain(..).filter_map(|held| held.message)
    }

    fn deliver(&mut self, sequence: u16, message: Option<T>, out: &mut Vec<T>) {
        self.last = sequence;
        if let Some(message) = message {
            out.push(message);
            for held in &mut self.held {
                held.passed += 1;
            }
        }
    }

    /// Deliver held messages up to and including `through`.
    fn release_through(&mut self, through: u16, out: &mut Vec<T>) {
        while let Some(first) = self.held.first() {
            if seq_newer(first.sequence, through) {
                break;
            }
            let held = self.held.remove(0);
            self.deliver(held.sequence, held.message, out);
        }
    }

    /// Deliver held messages that directly follow the cursor.
    fn drain(&mut self, out: &mut Vec<T>) {
        while let Some(first) = self.held.first() {
            if first.sequence != self.last.wrapping_add(1) {
                break;
            }
            let held = self.held.remove(0);
            self.deliver(held.sequence, held.message, out);
        }
    }
}

/// Recently seen `(channel, sequence)` pairs of unique messages.
#[derive(Debug, Default)]
pub struct UniqueWindow {
    seen: HashMap<(u8, u16), Instant>,
}

impl UniqueWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message; returns `false` if it was seen within its lifetime.
    pub fn check(&mut self, now: Instant, channel: u8, sequence: u16, timeout: Duration) -> bool {
        match self.seen.get(&(channel, sequence)) {
            Some(expiry) if now < *expiry => false,
            _ => {
                self.seen.insert((channel, sequence), now + timeout);
                true
            }
        }
    }

    /// Forget expired entries.
    pub fn sweep(&mut self, now: Instant) {
        self.seen.retain(|_, expiry| now < *expiry);
    }

    /// Number of remembered entries.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Loss accounting for the sequenced messages of one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossTracker {
    expected: Option<u16>,
}

impl LossTracker {
    /// Record `sequence`; returns the change of the lost count.
    ///
    /// Skipped sequences count as lost until they show up late.
    pub fn record(&mut self, sequence: u16) -> i64 {
        let Some(expected) = self.expected else {
            self.expected = Some(sequence.wrapping_add(1));
            return i64::from(sequence);
        };
        let diff = seq_diff(sequence, expected);
        if diff >= 0 {
            self.expected = Some(sequence.wrapping_add(1));
            i64::from(diff)
        } else {
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_diff_wraps() {
        assert_eq!(seq_diff(1, 0), 1);
        assert_eq!(seq_diff(0, 65535), 1);
        assert_eq!(seq_diff(65535, 0), -1);
        assert!(seq_newer(5, 65530));
        assert!(!seq_newer(65530, 5));
    }

    #[test]
    fn test_ack_window() {
        let mut window = AckWindow::new();
        assert_eq!(window.fields(), None);

        window.record(10);
        assert_eq!(window.fields(), Some((10, 0)));

        window.record(12);
        // 11 missing, 10 on bit 1
        assert_eq!(window.fields(), Some((12, 0b10)));

        window.record(11);
        assert_eq!(window.fields(), Some((12, 0b11)));

        window.record(100);
        assert_eq!(window.fields(), Some((100, 0)));
    }

    #[test]
    fn test_ack_window_full_shift() {
        let mut window = AckWindow::new();
        window.record(0);
        window.record(32);
        // 0 is exactly 32 behind, still inside the mask
        assert_eq!(window.fields(), Some((32, 1 << 31)));
    }

    #[test]
    fn test_acked_sequences() {
        let acked: Vec<u16> = acked_sequences(1, 0b101).collect();
        assert_eq!(acked, vec![1, 0, 65534]);
    }

    #[test]
    fn test_resend_queue() {
        let now = Instant::now();
        let mut queue = ResendQueue::new();
        queue.insert(PendingMessage::new(MessageType::Custom, 1, 7, vec![0x84, 7, 0, 0, b'x'], 3));
        assert!(queue.due(now).is_empty());

        queue.mark_sent(1, 7, now, Duration::from_millis(100));
        assert!(queue.due(now + Duration::from_millis(99)).is_empty());
        assert_eq!(queue.due(now + Duration::from_millis(100)), vec![(1, 7)]);

        let (attempt, bytes) = queue.next_attempt(1, 7).unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(bytes[3], 1);

        let entry = queue.acknowledge(1, 7).unwrap();
        assert_eq!(entry.first_sent, Some(now));
        assert!(queue.is_empty());
        assert!(queue.acknowledge(1, 7).is_none());
    }

    #[test]
    fn test_ordered_in_sequence() {
        let now = Instant::now();
        let mut channel = OrderedChannel::new(8, Duration::from_secs(1));
        let mut out = Vec::new();
        for seq in 0..3u16 {
            assert_eq!(
                channel.receive(now, seq, true, seq, &mut out),
                OrderedOutcome::Delivered
            );
        }
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(channel.receive(now, 1, true, 1, &mut out), OrderedOutcome::Late);
    }

    #[test]
    fn test_ordered_reliable_gap_fills() {
        let now = Instant::now();
        let mut channel = OrderedChannel::new(8, Duration::from_secs(1));
        let mut out = Vec::new();
        assert_eq!(channel.receive(now, 2, true, 2, &mut out), OrderedOutcome::Buffered);
        assert_eq!(channel.receive(now, 1, true, 1, &mut out), OrderedOutcome::Buffered);
        assert_eq!(channel.receive(now, 2, true, 2, &mut out), OrderedOutcome::Late);
        assert!(out.is_empty());

        assert_eq!(channel.receive(now, 0, true, 0, &mut out), OrderedOutcome::Delivered);
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(channel.held(), 0);
    }

    #[test]
    fn test_ordered_unreliable_skips() {
        let now = Instant::now();
        let mut channel = OrderedChannel::new(8, Duration::from_secs(1));
        let mut out = Vec::new();
        channel.receive(now, 2, true, 2, &mut out);
        assert_eq!(channel.receive(now, 4, false, 4, &mut out), OrderedOutcome::Delivered);
        // Held 2 is released ahead of 4
        assert_eq!(out, vec![2, 4]);
        assert_eq!(channel.last(), 4);
        assert_eq!(channel.receive(now, 3, true, 3, &mut out), OrderedOutcome::Late);
    }

    #[test]
    fn test_ordered_timeout_forces_delivery() {
        let now = Instant::now();
        let mut channel = OrderedChannel::new(8, Duration::from_millis(100));
        let mut out = Vec::new();
        channel.receive(now, 1, true, 1, &mut out);
        channel.receive(now, 2, true, 2, &mut out);

        channel.sweep(now + Duration::from_millis(50), &mut out);
        assert!(out.is_empty());
        channel.sweep(now + Duration::from_millis(100), &mut out);
        assert_eq!(out, vec![1, 2]);
        assert_eq!(channel.last(), 2);
    }

    #[test]
    fn test_ordered_delay_max_forces_delivery() {
        let now = Instant::now();
        let mut channel = OrderedChannel::new(2, Duration::from_secs(60));
        let mut out = Vec::new();
        // 5 waits for 2..=4 and gives up after two later deliveries
        channel.receive(now, 5, true, 5, &mut out);
        channel.receive(now, 0, true, 0, &mut out);
        channel.receive(now, 1, true, 1, &mut out);
        assert_eq!(out, vec![0, 1]);
        channel.sweep(now, &mut out);
        assert_eq!(out, vec![0, 1, 5]);
    }

    #[test]
    fn test_ordered_pass_fills_gap() {
        let now = Instant::now();
        let mut channel = OrderedChannel::new(8, Duration::from_secs(1));
        let mut out = Vec::new();
        // 0 was a ping, 1 an ordered message that arrived first
        assert_eq!(channel.receive(now, 1, true, 1, &mut out), OrderedOutcome::Buffered);
        channel.pass(now, 0, true, &mut out);
        assert_eq!(out, vec![1]);

        // A reliable pass ahead of the cursor holds its place
        channel.pass(now, 3, true, &mut out);
        assert_eq!(channel.held(), 0);
        assert_eq!(channel.receive(now, 4, true, 4, &mut out), OrderedOutcome::Buffered);
        assert_eq!(channel.receive(now, 2, true, 2, &mut out), OrderedOutcome::Delivered);
        assert_eq!(out, vec![1, 2, 4]);
        assert_eq!(channel.last(), 4);
    }

    #[test]
    fn test_ordered_buffering_disabled() {
        let now = Instant::now();
        let mut channel = OrderedChannel::new(0, Duration::from_secs(1));
        let mut out = Vec::new();
        assert_eq!(channel.receive(now, 3, true, 3, &mut out), OrderedOutcome::Delivered);
        assert_eq!(channel.receive(now, 1, true, 1, &mut out), OrderedOutcome::Late);
    }

    #[test]
    fn test_unique_window() {
        let now = Instant::now();
        let timeout = Duration::from_millis(100);
        let mut window = UniqueWindow::new();
        assert!(window.check(now, 0, 1, timeout));
        assert!(!window.check(now, 0, 1, timeout));
        assert!(window.check(now, 1, 1, timeout));

        let later = now + timeout;
        window.sweep(later);
        assert!(window.is_empty());
        assert!(window.check(later, 0, 1, timeout));
    }

    #[test]
    fn test_loss_tracker() {
        let mut tracker = LossTracker::default();
        assert_eq!(tracker.record(0), 0);
        assert_eq!(tracker.record(1), 0);
        assert_eq!(tracker.record(4), 2);
        assert_eq!(tracker.record(2), -1);
        assert_eq!(tracker.record(5), 0);
    }
}
