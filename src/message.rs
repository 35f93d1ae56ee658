//! Outbound and inbound message state.
//!
//! An [`OutboundMessage`] owns an assembled payload plus its transmission
//! bookkeeping; an [`InboundMessage`] owns received fragments plus assembly
//! bookkeeping. Both are internally locked so the Sender, Receiver, and Op
//! coordinator can share them across threads, and both stamp a last-activity
//! timestamp on every meaningful event so their owning component can drive
//! timeout transitions.

use std::sync::{Arc, Mutex, Weak};

use crate::driver::{Address, RawAddress};
use crate::error::{Error, Result};
use crate::protocol::{DataHeader, MessageId, DATA_HEADER_SIZE, MAX_MESSAGE_LENGTH};
use crate::transport::Op;

/// Transmission state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// Payload is being assembled; transmission has not begun.
    NotStarted,
    /// Some fragments remain untransmitted or ungranted.
    InProgress,
    /// Every fragment has been transmitted at least once.
    Sent,
    /// The receiver acknowledged delivery.
    Completed,
    /// The peer declared failure, or the message timed out.
    Failed,
}

/// Assembly state of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundState {
    /// Fragments are still outstanding.
    InProgress,
    /// Contiguous coverage reached the total length.
    Completed,
    /// The message timed out before completing.
    Failed,
}

/// Outcome of integrating one DATA fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragmentInsert {
    /// The fragment was already present (or the message is terminal).
    Duplicate,
    /// The fragment was new; `became_ready` is true exactly once, when this
    /// fragment completed contiguous coverage.
    Accepted { became_ready: bool },
}

/// Outcome of a RESEND request against an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResendDisposition {
    /// The range was marked for retransmission.
    Marked,
    /// The range lies beyond anything transmitted; the peer should be told
    /// the sender is alive but not there yet.
    NotYetSent,
}

/// Timeout decision for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundTimeout {
    Quiet,
    SendPing,
    Failed,
}

/// Timeout decision for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundTimeout {
    Quiet,
    SendResend { offset: u32, length: u32 },
    Failed,
}

/// A fragment ready to hand to the driver.
pub(crate) struct FragmentOut {
    pub destination: Address,
    pub payload: Vec<u8>,
    /// True when this transmission moved the message to `Sent`.
    pub became_sent: bool,
}

struct OutboundInner {
    id: Option<MessageId>,
    destination: Option<Address>,
    reply_address: RawAddress,
    payload: Vec<u8>,
    state: OutboundState,
    packet_data_length: usize,
    num_packets: usize,
    /// Highest packet index transmitted in order; -1 before the first send.
    sent_index: i64,
    /// Highest byte offset the receiver has granted, inclusive.
    grant_offset: usize,
    /// `grant_offset / packet_data_length`; packets through this index are
    /// eligible to transmit.
    grant_index: usize,
    /// Per-packet retransmission marks.
    resend: Vec<bool>,
    queued: bool,
    last_activity_us: u64,
    last_ping_us: u64,
}

impl OutboundInner {
    fn total_length(&self) -> usize {
        self.payload.len()
    }

    fn packet_payload_len(&self, index: usize) -> usize {
        let offset = index * self.packet_data_length;
        self.total_length().saturating_sub(offset).min(self.packet_data_length)
    }

    fn fully_sent(&self) -> bool {
        self.sent_index + 1 == self.num_packets as i64 && !self.resend.iter().any(|&m| m)
    }

    fn build_fragment(&self, index: usize) -> Vec<u8> {
        let id = self.id.expect("fragment built before transmission started");
        let offset = index * self.packet_data_length;
        let len = self.packet_payload_len(index);
        let header = DataHeader::new(
            id,
            self.total_length() as u32,
            offset as u32,
            self.reply_address,
        );
        let mut payload = vec![0u8; DATA_HEADER_SIZE + len];
        unsafe { header.write_to(payload.as_mut_ptr()) };
        payload[DATA_HEADER_SIZE..].copy_from_slice(&self.payload[offset..offset + len]);
        payload
    }
}

/// A message owned by an Op and transmitted by the Sender.
pub struct OutboundMessage {
    op: Weak<Op>,
    inner: Mutex<OutboundInner>,
}

impl OutboundMessage {
    pub(crate) fn new(op: Weak<Op>) -> Self {
        Self {
            op,
            inner: Mutex::new(OutboundInner {
                id: None,
                destination: None,
                reply_address: RawAddress::default(),
                payload: Vec::new(),
                state: OutboundState::NotStarted,
                packet_data_length: 0,
                num_packets: 0,
                sent_index: -1,
                grant_offset: 0,
                grant_index: 0,
                resend: Vec::new(),
                queued: false,
                last_activity_us: 0,
                last_ping_us: 0,
            }),
        }
    }

    /// The Op this message belongs to, if it is still alive.
    pub(crate) fn op(&self) -> Option<Arc<Op>> {
        self.op.upgrade()
    }

    /// Current transmission state.
    pub fn state(&self) -> OutboundState {
        self.inner.lock().unwrap().state
    }

    /// The message id assigned at transmission start.
    pub fn id(&self) -> Option<MessageId> {
        self.inner.lock().unwrap().id
    }

    /// Append application payload. Only legal before transmission starts.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(
            inner.state,
            OutboundState::NotStarted,
            "append after transmission started"
        );
        let size = inner.payload.len() + data.len();
        if size > MAX_MESSAGE_LENGTH {
            return Err(Error::MessageTooLarge {
                size,
                max: MAX_MESSAGE_LENGTH,
            });
        }
        inner.payload.extend_from_slice(data);
        Ok(())
    }

    /// Bytes of application payload appended so far.
    pub fn payload_len(&self) -> usize {
        self.inner.lock().unwrap().payload.len()
    }

    pub(crate) fn set_reply_address(&self, raw: RawAddress) {
        self.inner.lock().unwrap().reply_address = raw;
    }

    /// Assign identity and begin transmission. Returns false if the message
    /// was already started (duplicate send request).
    pub(crate) fn start_transmission(
        &self,
        id: MessageId,
        destination: Address,
        packet_data_length: usize,
        unscheduled_packets: usize,
        now: u64,
    ) -> bool {
        assert!(packet_data_length > 0);
        assert!(unscheduled_packets > 0);
        let mut inner = self.inner.lock().unwrap();
        if inner.state != OutboundState::NotStarted || inner.id.is_some() {
            return false;
        }
        let total = inner.payload.len();
        inner.id = Some(id);
        inner.destination = Some(destination);
        inner.packet_data_length = packet_data_length;
        inner.num_packets = if total == 0 {
            1
        } else {
            (total + packet_data_length - 1) / packet_data_length
        };
        inner.resend = vec![false; inner.num_packets];
        inner.sent_index = -1;
        inner.grant_offset = total
            .min(unscheduled_packets * packet_data_length)
            .saturating_sub(1);
        inner.grant_index = inner.grant_offset / packet_data_length;
        inner.state = OutboundState::InProgress;
        inner.last_activity_us = now;
        true
    }

    /// Raise the granted offset. Stale grants are ignored; grants past the
    /// end of the message are clamped.
    pub(crate) fn handle_grant(&self, offset: usize, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.id.is_none() {
            return;
        }
        let limit = inner.total_length().saturating_sub(1);
        let offset = offset.min(limit);
        if offset > inner.grant_offset {
            inner.grant_offset = offset;
            inner.grant_index = offset / inner.packet_data_length;
        }
        inner.last_activity_us = now;
    }

    /// Mark a byte range for retransmission.
    pub(crate) fn handle_resend(&self, offset: usize, length: usize, now: u64) -> ResendDisposition {
        let mut inner = self.inner.lock().unwrap();
        if inner.id.is_none()
            || length == 0
            || matches!(inner.state, OutboundState::Completed | OutboundState::Failed)
        {
            return ResendDisposition::Marked;
        }
        inner.last_activity_us = now;
        let first = offset / inner.packet_data_length;
        if first as i64 > inner.sent_index {
            return ResendDisposition::NotYetSent;
        }
        let last = (offset + length - 1) / inner.packet_data_length;
        let last = last.min(inner.num_packets - 1).min(inner.sent_index as usize);
        for index in first..=last {
            inner.resend[index] = true;
        }
        ResendDisposition::Marked
    }

    /// Restart transmission from the first fragment, keeping current grants.
    pub(crate) fn restart(&self, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, OutboundState::InProgress | OutboundState::Sent) {
            inner.sent_index = -1;
            inner.resend.iter_mut().for_each(|m| *m = false);
            inner.state = OutboundState::InProgress;
            inner.last_activity_us = now;
        }
    }

    /// Mark the message delivered. Returns true on the transition.
    pub(crate) fn complete(&self, now: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, OutboundState::InProgress | OutboundState::Sent) {
            inner.state = OutboundState::Completed;
            inner.last_activity_us = now;
            true
        } else {
            false
        }
    }

    /// Mark the message failed. Returns true on the transition.
    pub(crate) fn fail(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, OutboundState::Completed | OutboundState::Failed) {
            false
        } else {
            inner.state = OutboundState::Failed;
            true
        }
    }

    /// Produce the next eligible fragment, if any: a resend-marked fragment
    /// first, otherwise the next untransmitted fragment within the grant.
    pub(crate) fn next_fragment(&self, now: u64) -> Option<FragmentOut> {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.state, OutboundState::InProgress | OutboundState::Sent) {
            return None;
        }
        let destination = inner.destination?;

        let grant_index = inner.grant_index;
        if let Some(index) = inner
            .resend
            .iter()
            .position(|&m| m)
            .filter(|&i| i <= grant_index)
        {
            inner.resend[index] = false;
            inner.last_activity_us = now;
            let payload = inner.build_fragment(index);
            let became_sent = inner.state == OutboundState::InProgress && inner.fully_sent();
            if became_sent {
                inner.state = OutboundState::Sent;
            }
            return Some(FragmentOut {
                destination,
                payload,
                became_sent,
            });
        }

        let next = (inner.sent_index + 1) as usize;
        if next < inner.num_packets && next <= grant_index {
            inner.sent_index = next as i64;
            inner.last_activity_us = now;
            let payload = inner.build_fragment(next);
            let became_sent = inner.fully_sent();
            if became_sent {
                inner.state = OutboundState::Sent;
            }
            return Some(FragmentOut {
                destination,
                payload,
                became_sent,
            });
        }
        None
    }

    /// True once every fragment has been transmitted and no retransmissions
    /// are pending.
    pub(crate) fn finished_sending(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(
            inner.state,
            OutboundState::Sent | OutboundState::Completed | OutboundState::Failed
        ) && !inner.resend.iter().any(|&m| m)
    }

    /// Record queue membership. Returns true if the message was newly
    /// enqueued (it was not in the send queue before).
    pub(crate) fn try_enqueue(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.queued {
            false
        } else {
            inner.queued = true;
            true
        }
    }

    pub(crate) fn clear_queued(&self) {
        self.inner.lock().unwrap().queued = false;
    }

    /// Evaluate timeout state.
    pub(crate) fn check_timeouts(
        &self,
        now: u64,
        ping_interval_us: u64,
        message_timeout_us: u64,
    ) -> OutboundTimeout {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, OutboundState::NotStarted | OutboundState::Completed | OutboundState::Failed) {
            return OutboundTimeout::Quiet;
        }
        let idle = now.saturating_sub(inner.last_activity_us);
        if idle >= message_timeout_us {
            inner.state = OutboundState::Failed;
            return OutboundTimeout::Failed;
        }
        if idle >= ping_interval_us && now.saturating_sub(inner.last_ping_us) >= ping_interval_us {
            inner.last_ping_us = now;
            return OutboundTimeout::SendPing;
        }
        OutboundTimeout::Quiet
    }

    pub(crate) fn destination(&self) -> Option<Address> {
        self.inner.lock().unwrap().destination
    }

    #[cfg(test)]
    pub(crate) fn grant_offset(&self) -> usize {
        self.inner.lock().unwrap().grant_offset
    }

    #[cfg(test)]
    pub(crate) fn grant_index(&self) -> usize {
        self.inner.lock().unwrap().grant_index
    }

    #[cfg(test)]
    pub(crate) fn sent_index(&self) -> i64 {
        self.inner.lock().unwrap().sent_index
    }

    #[cfg(test)]
    pub(crate) fn num_packets(&self) -> usize {
        self.inner.lock().unwrap().num_packets
    }
}

struct InboundInner {
    id: MessageId,
    source: Address,
    total_length: usize,
    packet_data_length: usize,
    num_packets: usize,
    buffer: Vec<u8>,
    received: Vec<bool>,
    /// Bytes covered contiguously from offset 0.
    contiguous_bytes: usize,
    reply_address: Option<RawAddress>,
    state: InboundState,
    op: Option<Weak<Op>>,
    /// Highest offset granted so far, inclusive.
    grant_offset: Option<usize>,
    last_activity_us: u64,
    last_resend_us: u64,
}

impl InboundInner {
    fn advance_contiguous(&mut self) {
        let mut index = self.contiguous_bytes / self.packet_data_length;
        while index < self.num_packets && self.received[index] {
            self.contiguous_bytes = self
                .total_length
                .min((index + 1) * self.packet_data_length);
            index += 1;
        }
    }
}

/// A message being assembled by the Receiver and surfaced to an Op.
pub struct InboundMessage {
    inner: Mutex<InboundInner>,
}

impl InboundMessage {
    pub(crate) fn new(
        id: MessageId,
        source: Address,
        total_length: usize,
        packet_data_length: usize,
        now: u64,
    ) -> Self {
        assert!(packet_data_length > 0);
        let num_packets = if total_length == 0 {
            1
        } else {
            (total_length + packet_data_length - 1) / packet_data_length
        };
        Self {
            inner: Mutex::new(InboundInner {
                id,
                source,
                total_length,
                packet_data_length,
                num_packets,
                buffer: vec![0; total_length],
                received: vec![false; num_packets],
                contiguous_bytes: 0,
                reply_address: None,
                state: InboundState::InProgress,
                op: None,
                grant_offset: None,
                last_activity_us: now,
                last_resend_us: 0,
            }),
        }
    }

    /// The message id.
    pub fn id(&self) -> MessageId {
        self.inner.lock().unwrap().id
    }

    /// The address the fragments arrived from.
    pub fn source(&self) -> Address {
        self.inner.lock().unwrap().source
    }

    /// Total message length, known from the first fragment.
    pub fn total_length(&self) -> usize {
        self.inner.lock().unwrap().total_length
    }

    /// True iff every byte has been received.
    pub fn is_ready(&self) -> bool {
        self.inner.lock().unwrap().state == InboundState::Completed
    }

    /// Current assembly state.
    pub fn state(&self) -> InboundState {
        self.inner.lock().unwrap().state
    }

    /// The assembled payload, once ready.
    pub fn payload(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        if inner.state == InboundState::Completed {
            Some(inner.buffer.clone())
        } else {
            None
        }
    }

    /// Reply address carried by fragment 0, once that fragment has arrived.
    pub fn reply_address(&self) -> Option<RawAddress> {
        self.inner.lock().unwrap().reply_address
    }

    /// Attach the Op that owns this message. At most one registration.
    pub(crate) fn register_op(&self, op: &Arc<Op>) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.op.is_none(), "inbound message registered twice");
        inner.op = Some(Arc::downgrade(op));
    }

    /// The registered Op, if any and still alive.
    pub(crate) fn registered_op(&self) -> Option<Arc<Op>> {
        self.inner.lock().unwrap().op.as_ref().and_then(Weak::upgrade)
    }

    /// Integrate one fragment. Duplicates are idempotent.
    pub(crate) fn insert_fragment(
        &self,
        offset: usize,
        data: &[u8],
        reply_address: RawAddress,
        now: u64,
    ) -> FragmentInsert {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != InboundState::InProgress {
            return FragmentInsert::Duplicate;
        }
        let index = offset / inner.packet_data_length;
        if index >= inner.num_packets || offset % inner.packet_data_length != 0 {
            return FragmentInsert::Duplicate;
        }
        inner.last_activity_us = now;
        if inner.received[index] {
            return FragmentInsert::Duplicate;
        }
        inner.received[index] = true;
        let len = data
            .len()
            .min(inner.total_length.saturating_sub(offset));
        inner.buffer[offset..offset + len].copy_from_slice(&data[..len]);
        if offset == 0 {
            inner.reply_address = Some(reply_address);
        }
        inner.advance_contiguous();
        let became_ready = inner.contiguous_bytes == inner.total_length;
        if became_ready {
            inner.state = InboundState::Completed;
        }
        FragmentInsert::Accepted { became_ready }
    }

    /// Refresh the activity timestamp (BUSY from the sender).
    pub(crate) fn refresh_activity(&self, now: u64) {
        self.inner.lock().unwrap().last_activity_us = now;
    }

    /// Bytes still missing; the SRPT scheduling key.
    pub(crate) fn remaining_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.total_length - inner.contiguous_bytes
    }

    /// Compute a raised grant so the unmet window equals `window_bytes`.
    /// Returns the new offset iff it exceeds the previous grant.
    pub(crate) fn grant_target(&self, window_bytes: usize) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != InboundState::InProgress || inner.total_length == 0 {
            return None;
        }
        let target = (inner.contiguous_bytes + window_bytes).min(inner.total_length - 1);
        if inner.grant_offset.map_or(true, |g| target > g) {
            inner.grant_offset = Some(target);
            Some(target as u32)
        } else {
            None
        }
    }

    /// The grant to re-issue in response to a PING: the previous grant, or a
    /// freshly computed one.
    pub(crate) fn refresh_grant(&self, window_bytes: usize) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.total_length == 0 {
            return None;
        }
        match inner.state {
            InboundState::Failed => None,
            InboundState::Completed => Some((inner.total_length - 1) as u32),
            InboundState::InProgress => {
                let target = (inner.contiguous_bytes + window_bytes).min(inner.total_length - 1);
                let grant = inner.grant_offset.map_or(target, |g| g.max(target));
                inner.grant_offset = Some(grant);
                Some(grant as u32)
            }
        }
    }

    /// The first missing range: from the contiguous high-water mark to the
    /// next received fragment, or to the end of the message.
    pub(crate) fn missing_range(&self) -> Option<(u32, u32)> {
        let inner = self.inner.lock().unwrap();
        if inner.state != InboundState::InProgress {
            return None;
        }
        let first_missing = inner.contiguous_bytes / inner.packet_data_length;
        let end = (first_missing + 1..inner.num_packets)
            .find(|&i| inner.received[i])
            .map(|i| i * inner.packet_data_length)
            .unwrap_or(inner.total_length);
        Some((
            inner.contiguous_bytes as u32,
            (end - inner.contiguous_bytes) as u32,
        ))
    }

    /// True iff some fragment beyond the contiguous prefix has arrived.
    pub(crate) fn has_received_beyond_contiguous(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let first_missing = inner.contiguous_bytes / inner.packet_data_length;
        (first_missing + 1..inner.num_packets).any(|i| inner.received[i])
    }

    /// Evaluate timeout state.
    pub(crate) fn check_timeouts(
        &self,
        now: u64,
        resend_interval_us: u64,
        message_timeout_us: u64,
    ) -> InboundTimeout {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != InboundState::InProgress {
            return InboundTimeout::Quiet;
        }
        let idle = now.saturating_sub(inner.last_activity_us);
        if idle >= message_timeout_us {
            inner.state = InboundState::Failed;
            return InboundTimeout::Failed;
        }
        if idle >= resend_interval_us
            && now.saturating_sub(inner.last_resend_us) >= resend_interval_us
        {
            inner.last_resend_us = now;
            let first_missing = inner.contiguous_bytes / inner.packet_data_length;
            let end = (first_missing + 1..inner.num_packets)
                .find(|&i| inner.received[i])
                .map(|i| i * inner.packet_data_length)
                .unwrap_or(inner.total_length);
            return InboundTimeout::SendResend {
                offset: inner.contiguous_bytes as u32,
                length: (end - inner.contiguous_bytes) as u32,
            };
        }
        InboundTimeout::Quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpId;

    fn test_id() -> MessageId {
        MessageId::new(OpId::new(42, 1), MessageId::INITIAL_REQUEST_TAG)
    }

    fn started_message(payload_len: usize, pdl: usize, unscheduled: usize) -> OutboundMessage {
        let message = OutboundMessage::new(Weak::new());
        message.append(&vec![0xAB; payload_len]).unwrap();
        assert!(message.start_transmission(test_id(), Address(7), pdl, unscheduled, 0));
        message
    }

    #[test]
    fn test_outbound_single_packet_grant() {
        let message = started_message(420, 1000, 8);
        assert_eq!(message.num_packets(), 1);
        assert_eq!(message.grant_offset(), 419);
        assert_eq!(message.grant_index(), 0);
    }

    #[test]
    fn test_outbound_unscheduled_limit() {
        let message = started_message(9000, 1000, 5);
        assert_eq!(message.num_packets(), 9);
        assert_eq!(message.grant_offset(), 4999);
        assert_eq!(message.grant_index(), 4);
    }

    #[test]
    fn test_grant_monotone_and_clamped() {
        let message = started_message(9000, 1000, 5);

        message.handle_grant(6500, 1);
        assert_eq!(message.grant_offset(), 6500);
        assert_eq!(message.grant_index(), 6);

        // Stale grant is ignored.
        message.handle_grant(4000, 2);
        assert_eq!(message.grant_offset(), 6500);

        // Excess grant is clamped to the last byte.
        message.handle_grant(9001, 3);
        assert_eq!(message.grant_offset(), 8999);
        assert_eq!(message.grant_index(), 8);
    }

    #[test]
    fn test_fragment_emission_respects_grant() {
        let message = started_message(5000, 1000, 2);
        let mut offsets = Vec::new();
        while let Some(fragment) = message.next_fragment(0) {
            let header = DataHeader::from_bytes(&fragment.payload).unwrap();
            offsets.push(header.offset);
        }
        assert_eq!(offsets, vec![0, 1000]);

        message.handle_grant(4000, 1);
        let mut offsets = Vec::new();
        while let Some(fragment) = message.next_fragment(1) {
            let header = DataHeader::from_bytes(&fragment.payload).unwrap();
            offsets.push(header.offset);
        }
        assert_eq!(offsets, vec![2000, 3000, 4000]);
        assert_eq!(message.state(), OutboundState::Sent);
    }

    #[test]
    fn test_resend_marks_and_busy() {
        let message = started_message(5000, 1000, 5);
        while message.next_fragment(0).is_some() {}
        assert_eq!(message.state(), OutboundState::Sent);

        assert_eq!(message.handle_resend(2000, 1000, 1), ResendDisposition::Marked);
        let fragment = message.next_fragment(2).unwrap();
        let header = DataHeader::from_bytes(&fragment.payload).unwrap();
        let offset = header.offset;
        assert_eq!(offset, 2000);
        assert!(message.next_fragment(3).is_none());

        // A range beyond anything transmitted cannot be resent.
        let fresh = started_message(5000, 1000, 1);
        assert_eq!(
            fresh.handle_resend(3000, 1000, 4),
            ResendDisposition::NotYetSent
        );
    }

    #[test]
    fn test_unknown_restart_keeps_grant() {
        let message = started_message(5000, 1000, 2);
        while message.next_fragment(0).is_some() {}
        message.handle_grant(4999, 1);
        message.restart(2);

        assert_eq!(message.sent_index(), -1);
        assert_eq!(message.grant_offset(), 4999);
        let mut count = 0;
        while message.next_fragment(3).is_some() {
            count += 1;
        }
        // Restart retransmits from offset 0 through the standing grant.
        assert_eq!(count, 5);
    }

    #[test]
    fn test_outbound_terminal_states_sticky() {
        let message = started_message(100, 1000, 1);
        assert!(message.complete(1));
        assert!(!message.fail());
        assert_eq!(message.state(), OutboundState::Completed);

        let message = started_message(100, 1000, 1);
        assert!(message.fail());
        assert!(!message.complete(1));
        assert_eq!(message.state(), OutboundState::Failed);
    }

    #[test]
    fn test_outbound_timeouts() {
        let message = started_message(100, 1000, 1);
        assert_eq!(message.check_timeouts(10, 100, 1000), OutboundTimeout::Quiet);
        assert_eq!(message.check_timeouts(150, 100, 1000), OutboundTimeout::SendPing);
        // Ping throttled until another interval elapses.
        assert_eq!(message.check_timeouts(200, 100, 1000), OutboundTimeout::Quiet);
        assert_eq!(message.check_timeouts(260, 100, 1000), OutboundTimeout::SendPing);
        assert_eq!(message.check_timeouts(2000, 100, 1000), OutboundTimeout::Failed);
        assert_eq!(message.state(), OutboundState::Failed);
    }

    #[test]
    fn test_append_after_start_panics() {
        let message = started_message(10, 1000, 1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            message.append(b"late").unwrap()
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_inbound_out_of_order_assembly() {
        let message = InboundMessage::new(test_id(), Address(3), 2500, 1000, 0);
        let reply = RawAddress::default();

        assert_eq!(
            message.insert_fragment(2000, &[3u8; 500], reply, 1),
            FragmentInsert::Accepted { became_ready: false }
        );
        assert!(message.has_received_beyond_contiguous());
        assert_eq!(message.missing_range(), Some((0, 2000)));

        assert_eq!(
            message.insert_fragment(0, &[1u8; 1000], reply, 2),
            FragmentInsert::Accepted { became_ready: false }
        );
        assert_eq!(message.missing_range(), Some((1000, 1000)));

        assert_eq!(
            message.insert_fragment(1000, &[2u8; 1000], reply, 3),
            FragmentInsert::Accepted { became_ready: true }
        );
        assert!(message.is_ready());

        let payload = message.payload().unwrap();
        assert_eq!(&payload[..1000], &[1u8; 1000][..]);
        assert_eq!(&payload[1000..2000], &[2u8; 1000][..]);
        assert_eq!(&payload[2000..], &[3u8; 500][..]);
    }

    #[test]
    fn test_inbound_duplicate_idempotent() {
        let message = InboundMessage::new(test_id(), Address(3), 2000, 1000, 0);
        let reply = RawAddress::default();

        assert_eq!(
            message.insert_fragment(0, &[1u8; 1000], reply, 1),
            FragmentInsert::Accepted { became_ready: false }
        );
        assert_eq!(
            message.insert_fragment(0, &[9u8; 1000], reply, 2),
            FragmentInsert::Duplicate
        );
        assert_eq!(
            message.insert_fragment(1000, &[2u8; 1000], reply, 3),
            FragmentInsert::Accepted { became_ready: true }
        );
        // Ready exactly once; later duplicates change nothing.
        assert_eq!(
            message.insert_fragment(1000, &[9u8; 1000], reply, 4),
            FragmentInsert::Duplicate
        );
        let payload = message.payload().unwrap();
        assert_eq!(&payload[..1000], &[1u8; 1000][..]);
    }

    #[test]
    fn test_inbound_zero_length() {
        let message = InboundMessage::new(test_id(), Address(3), 0, 1000, 0);
        assert_eq!(
            message.insert_fragment(0, &[], RawAddress::default(), 1),
            FragmentInsert::Accepted { became_ready: true }
        );
        assert_eq!(message.payload().unwrap().len(), 0);
    }

    #[test]
    fn test_inbound_grant_window() {
        let message = InboundMessage::new(test_id(), Address(3), 5000, 1000, 0);
        let reply = RawAddress::default();
        message.insert_fragment(0, &[0u8; 1000], reply, 1);
        message.insert_fragment(1000, &[0u8; 1000], reply, 2);

        assert_eq!(message.grant_target(2000), Some(4000));
        // Unchanged coverage does not re-grant.
        assert_eq!(message.grant_target(2000), None);

        message.insert_fragment(2000, &[0u8; 1000], reply, 3);
        // Clamped to the last byte of the message.
        assert_eq!(message.grant_target(2000), Some(4999));
    }

    #[test]
    fn test_inbound_timeouts() {
        let message = InboundMessage::new(test_id(), Address(3), 3000, 1000, 0);
        let reply = RawAddress::default();
        message.insert_fragment(0, &[0u8; 1000], reply, 0);

        assert_eq!(message.check_timeouts(50, 100, 10_000), InboundTimeout::Quiet);
        assert_eq!(
            message.check_timeouts(150, 100, 10_000),
            InboundTimeout::SendResend {
                offset: 1000,
                length: 2000
            }
        );
        // Resend throttled until another interval elapses.
        assert_eq!(message.check_timeouts(200, 100, 10_000), InboundTimeout::Quiet);
        assert_eq!(
            message.check_timeouts(20_000, 100, 10_000),
            InboundTimeout::Failed
        );
        assert_eq!(message.state(), InboundState::Failed);
    }
}
