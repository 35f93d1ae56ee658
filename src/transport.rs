//! The Op coordinator: binds request/response message pairs into Ops,
//! advances their state machines, and garbage collects released Ops.
//!
//! [`Transport::poll`] is the sole progress engine; nothing advances unless
//! some application thread calls it. Multiple threads may poll and call the
//! Op operations concurrently: the transport's tables, each queue, and each
//! Op carry their own locks. Lock order is transport table before Op, and
//! queue before Op; a thread holding an Op lock never reaches back for the
//! table lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::control;
use crate::driver::{Address, Driver};
use crate::error::Result;
use crate::message::{InboundMessage, InboundState, OutboundMessage, OutboundState};
use crate::protocol::{CommonHeader, MessageId, Opcode, OpId, TransportId};
use crate::receiver::{Receiver, ReceiverApi};
use crate::sender::{Sender, SenderApi};

/// Coordinator state of an Op.
///
/// The state never regresses; `Completed` and `Failed` are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    /// Allocated but not yet making progress.
    NotStarted = 0,
    /// Request or reply traffic is in flight.
    InProgress = 1,
    /// The operation finished successfully.
    Completed = 2,
    /// The operation failed (timeout or peer-declared).
    Failed = 3,
}

impl OpState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => OpState::NotStarted,
            1 => OpState::InProgress,
            2 => OpState::Completed,
            _ => OpState::Failed,
        }
    }
}

struct OpInner {
    in_message: Option<Arc<InboundMessage>>,
    destroy: bool,
}

/// One logical remote operation: exactly one outbound message, at most one
/// registered inbound message.
pub struct Op {
    token: u64,
    op_id: OpId,
    is_server_op: bool,
    state: AtomicU8,
    retained: AtomicBool,
    out_message: Arc<OutboundMessage>,
    inner: Mutex<OpInner>,
}

impl Op {
    fn new(token: u64, op_id: OpId, is_server_op: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Op>| Op {
            token,
            op_id,
            is_server_op,
            state: AtomicU8::new(OpState::NotStarted as u8),
            retained: AtomicBool::new(false),
            out_message: Arc::new(OutboundMessage::new(weak.clone())),
            inner: Mutex::new(OpInner {
                in_message: None,
                destroy: false,
            }),
        })
    }

    /// Current coordinator state.
    pub fn state(&self) -> OpState {
        OpState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: OpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn retained(&self) -> bool {
        self.retained.load(Ordering::Acquire)
    }
}

/// Application-facing handle to an Op.
///
/// Returned by [`Transport::alloc_op`] and [`Transport::receive_op`]; hand it
/// back with [`Transport::release_op`] when the operation is no longer
/// needed.
pub struct OpContext {
    op: Arc<Op>,
}

impl OpContext {
    /// The operation's identifier.
    pub fn op_id(&self) -> OpId {
        self.op.op_id
    }

    /// True for server-side handling of an inbound request.
    pub fn is_server_op(&self) -> bool {
        self.op.is_server_op
    }

    /// Observed coordinator state.
    pub fn state(&self) -> OpState {
        self.op.state()
    }

    /// Append bytes to the outbound message (the request of a client op, the
    /// reply of a server op). Only legal before the message is sent.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.op.out_message.append(data)
    }

    /// The assembled inbound payload: the request of a server op, the
    /// response of a completed client op. `None` until it is ready.
    pub fn payload(&self) -> Option<Vec<u8>> {
        let guard = self.op.inner.lock().unwrap();
        guard.in_message.as_ref().and_then(|m| m.payload())
    }
}

struct HintsInner {
    tokens: HashSet<u64>,
    order: VecDeque<(u64, Weak<Op>)>,
}

/// Deduplicated FIFO of Ops flagged as possibly needing state advancement.
///
/// Shared between the transport and its sender/receiver halves so packet
/// handlers can flag an Op without reaching into the transport tables.
pub(crate) struct UpdateHints {
    inner: Mutex<HintsInner>,
}

impl UpdateHints {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HintsInner {
                tokens: HashSet::new(),
                order: VecDeque::new(),
            }),
        })
    }

    /// Flag an Op. Already-flagged Ops are not flagged twice.
    pub(crate) fn push(&self, op: &Arc<Op>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.tokens.insert(op.token) {
            inner.order.push_back((op.token, Arc::downgrade(op)));
        }
    }

    fn pop(&self) -> Option<Weak<Op>> {
        let mut inner = self.inner.lock().unwrap();
        let (token, weak) = inner.order.pop_front()?;
        inner.tokens.remove(&token);
        Some(weak)
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }
}

struct TransportInner {
    next_sequence: u64,
    next_token: u64,
    /// Every live Op, destroyed or not, until GC releases it.
    active_ops: HashMap<u64, Arc<Op>>,
    /// Client Ops, keyed by the reply leg that will complete them.
    remote_ops: HashMap<MessageId, Arc<Op>>,
}

/// A Homa-style transport instance.
///
/// Generic over its sending and receiving halves so tests can substitute
/// doubles; applications use the default halves via [`Transport::new`].
pub struct Transport<S: SenderApi = Sender, R: ReceiverApi = Receiver> {
    driver: Arc<dyn Driver>,
    transport_id: TransportId,
    config: TransportConfig,
    sender: S,
    receiver: R,
    inner: Mutex<TransportInner>,
    /// Server Ops ready for the application, in arrival order.
    pending_server_ops: Mutex<VecDeque<Arc<Op>>>,
    update_hints: Arc<UpdateHints>,
    /// Ops queued for garbage collection.
    unused_ops: Mutex<VecDeque<Arc<Op>>>,
}

impl Transport {
    /// Create a transport with the production sender and receiver.
    pub fn new(driver: Arc<dyn Driver>, transport_id: TransportId, config: TransportConfig) -> Self {
        let hints = UpdateHints::new();
        let sender = Sender::new(Arc::clone(&driver), config.clone(), Arc::clone(&hints));
        let receiver = Receiver::new(Arc::clone(&driver), config.clone(), Arc::clone(&hints));
        Self::with_parts(driver, transport_id, config, hints, sender, receiver)
    }
}

impl<S: SenderApi, R: ReceiverApi> Transport<S, R> {
    pub(crate) fn with_parts(
        driver: Arc<dyn Driver>,
        transport_id: TransportId,
        config: TransportConfig,
        update_hints: Arc<UpdateHints>,
        sender: S,
        receiver: R,
    ) -> Self {
        Self {
            driver,
            transport_id,
            config,
            sender,
            receiver,
            inner: Mutex::new(TransportInner {
                next_sequence: 1,
                next_token: 1,
                active_ops: HashMap::new(),
                remote_ops: HashMap::new(),
            }),
            pending_server_ops: Mutex::new(VecDeque::new()),
            update_hints,
            unused_ops: Mutex::new(VecDeque::new()),
        }
    }

    /// This transport's identifier.
    pub fn transport_id(&self) -> TransportId {
        self.transport_id
    }

    /// Allocate a client Op.
    pub fn alloc_op(&self) -> OpContext {
        let op;
        {
            let mut inner = self.inner.lock().unwrap();
            let op_id = OpId::new(self.transport_id, inner.next_sequence);
            inner.next_sequence += 1;
            let token = inner.next_token;
            inner.next_token += 1;
            op = Op::new(token, op_id, false);
            inner.active_ops.insert(token, Arc::clone(&op));
            inner.remote_ops.insert(
                MessageId::new(op_id, MessageId::ULTIMATE_RESPONSE_TAG),
                Arc::clone(&op),
            );

            // Lock handoff: hold the Op before releasing the table so no
            // other thread can destroy it underneath us.
            let _guard = op.inner.lock().unwrap();
            drop(inner);
            op.out_message
                .set_reply_address(self.driver.raw_address(self.driver.local_address()));
            op.retained.store(true, Ordering::Release);
        }
        OpContext { op }
    }

    /// Dequeue one inbound request as a server Op, if any is ready.
    pub fn receive_op(&self) -> Option<OpContext> {
        let op = self.pending_server_ops.lock().unwrap().pop_front()?;
        {
            let guard = op.inner.lock().unwrap();
            let in_message = guard
                .in_message
                .as_ref()
                .expect("server op without inbound message");
            let reply = in_message
                .reply_address()
                .expect("ready inbound message without reply address");
            op.out_message.set_reply_address(reply);
            op.retained.store(true, Ordering::Release);
        }
        Some(OpContext { op })
    }

    /// Signal that the application no longer holds this Op. The Op will be
    /// garbage collected by subsequent polls.
    pub fn release_op(&self, context: OpContext) {
        let op = context.op;
        op.retained.store(false, Ordering::Release);
        if op.is_server_op && op.out_message.state() == OutboundState::NotStarted {
            // Abandoned without a reply: nothing will ever advance this Op,
            // so fail it now and let GC notify the requestor.
            let _guard = op.inner.lock().unwrap();
            op.set_state(OpState::Failed);
        }
        self.update_hints.push(&op);
    }

    /// Send the Op's outbound message as a request.
    ///
    /// For a client Op this is the initial request leg; for a server Op it is
    /// a delegated request leg derived from the inbound message's tag.
    pub fn send_request(&self, context: &OpContext, destination: Address) {
        let op = &context.op;
        let guard = op.inner.lock().unwrap();
        if op.is_server_op {
            let request_id = guard
                .in_message
                .as_ref()
                .expect("server op without inbound message")
                .id();
            let delegation_id = MessageId::new(request_id.op_id, request_id.tag + 1);
            self.sender
                .send_message(delegation_id, destination, &op.out_message);
        } else {
            op.set_state(OpState::InProgress);
            self.sender.send_message(
                MessageId::new(op.op_id, MessageId::INITIAL_REQUEST_TAG),
                destination,
                &op.out_message,
            );
        }
        drop(guard);
    }

    /// Send the Op's outbound message as the final reply, to the address the
    /// request carried. Only valid for server Ops.
    pub fn send_reply(&self, context: &OpContext) {
        let op = &context.op;
        assert!(op.is_server_op, "send_reply on a client op");
        let guard = op.inner.lock().unwrap();
        let in_message = guard
            .in_message
            .as_ref()
            .expect("server op without inbound message");
        let op_id = in_message.id().op_id;
        let raw = in_message
            .reply_address()
            .expect("ready inbound message without reply address");
        match self.driver.intern_address(&raw) {
            Ok(address) => {
                op.set_state(OpState::InProgress);
                self.sender.send_message(
                    MessageId::new(op_id, MessageId::ULTIMATE_RESPONSE_TAG),
                    address,
                    &op.out_message,
                );
            }
            Err(_) => {
                warn!(op_id = ?op.op_id, "reply address cannot be interned; failing op");
                op.set_state(OpState::Failed);
                self.update_hints.push(op);
            }
        }
    }

    /// Make incremental progress: drain a burst of packets, tick the sender
    /// and receiver, bind completed messages to Ops, advance hinted Ops, and
    /// garbage collect.
    pub fn poll(&self) {
        self.process_packets();
        self.sender.poll();
        self.receiver.poll();
        self.process_inbound_messages();
        self.check_for_updates();
        self.cleanup_ops();
    }

    /// Receive a burst of packets and dispatch them by opcode.
    fn process_packets(&self) {
        let mut packets = Vec::with_capacity(self.config.max_burst);
        self.driver
            .receive_packets(self.config.max_burst, &mut packets);
        for packet in &packets {
            match CommonHeader::opcode_of(&packet.payload) {
                Ok(Opcode::Data) => self.receiver.handle_data_packet(packet),
                Ok(Opcode::Grant) => self.sender.handle_grant_packet(packet),
                Ok(Opcode::Done) => self.sender.handle_done_packet(packet),
                Ok(Opcode::Resend) => self.sender.handle_resend_packet(packet),
                Ok(Opcode::Busy) => self.receiver.handle_busy_packet(packet),
                Ok(Opcode::Ping) => self.receiver.handle_ping_packet(packet),
                Ok(Opcode::Unknown) => self.sender.handle_unknown_packet(packet),
                Ok(Opcode::Error) => self.sender.handle_error_packet(packet),
                Err(_) => warn!("datagram with invalid header dropped"),
            }
        }
    }

    /// Bind completed inbound messages to their Ops.
    fn process_inbound_messages(&self) {
        while let Some(message) = self.receiver.receive_message() {
            let id = message.id();
            if id.tag == MessageId::ULTIMATE_RESPONSE_TAG {
                // The message is a response to one of our client Ops.
                let found = self.inner.lock().unwrap().remote_ops.get(&id).cloned();
                match found {
                    Some(op) => {
                        let mut guard = op.inner.lock().unwrap();
                        if guard.in_message.is_none() {
                            message.register_op(&op);
                            guard.in_message = Some(message);
                            drop(guard);
                            self.update_hints.push(&op);
                        } else {
                            drop(guard);
                            self.receiver.drop_message(&message);
                        }
                    }
                    None => {
                        // Legal race with release_op: nobody is waiting.
                        debug!(?id, "response without a waiting op dropped");
                        self.receiver.drop_message(&message);
                    }
                }
            } else {
                // The message is a request; construct a server Op for it.
                let op;
                {
                    let mut inner = self.inner.lock().unwrap();
                    let token = inner.next_token;
                    inner.next_token += 1;
                    op = Op::new(token, id.op_id, true);
                    inner.active_ops.insert(token, Arc::clone(&op));

                    // Lock handoff, as in alloc_op.
                    let mut guard = op.inner.lock().unwrap();
                    drop(inner);
                    message.register_op(&op);
                    guard.in_message = Some(message);
                }
                self.update_hints.push(&op);
            }
        }
    }

    /// Run the state machine of every currently hinted Op.
    fn check_for_updates(&self) {
        // Bound the pass by the number of hints present at entry.
        let hinted = self.update_hints.len();
        for _ in 0..hinted {
            let Some(weak) = self.update_hints.pop() else {
                break;
            };
            let Some(op) = weak.upgrade() else {
                continue;
            };
            let inner = self.inner.lock().unwrap();
            if !inner.active_ops.contains_key(&op.token) {
                continue;
            }
            // Lock handoff.
            let guard = op.inner.lock().unwrap();
            drop(inner);
            self.process_updates(&op, guard);
        }
    }

    /// Advance one Op's state machine. Caller supplies the held Op lock.
    fn process_updates(&self, op: &Arc<Op>, mut guard: MutexGuard<'_, OpInner>) {
        if guard.destroy {
            return;
        }
        let state = op.state();
        let out_state = op.out_message.state();

        if op.is_server_op {
            match state {
                OpState::NotStarted => {
                    let in_message = guard
                        .in_message
                        .as_ref()
                        .expect("server op without inbound message");
                    if in_message.is_ready() {
                        self.pending_server_ops
                            .lock()
                            .unwrap()
                            .push_back(Arc::clone(op));
                        op.set_state(OpState::InProgress);
                    } else if in_message.state() == InboundState::Failed {
                        op.set_state(OpState::Failed);
                        self.update_hints.push(op);
                    }
                }
                OpState::InProgress => {
                    let reply_sent = op.out_message.id().map(|id| id.tag)
                        == Some(MessageId::ULTIMATE_RESPONSE_TAG)
                        && out_state == OutboundState::Sent;
                    if out_state == OutboundState::Completed || reply_sent {
                        // The final reply has nobody to ack it, so reaching
                        // SENT is logical completion for that leg.
                        op.set_state(OpState::Completed);
                        let in_message = guard
                            .in_message
                            .as_ref()
                            .expect("server op without inbound message");
                        if in_message.id().tag != MessageId::INITIAL_REQUEST_TAG {
                            control::send_done(
                                self.driver.as_ref(),
                                in_message.source(),
                                in_message.id(),
                            );
                        }
                        self.update_hints.push(op);
                    } else if out_state == OutboundState::Failed {
                        op.set_state(OpState::Failed);
                        self.update_hints.push(op);
                    }
                }
                OpState::Completed | OpState::Failed => {
                    if !op.retained() {
                        self.drop_op(op, &mut guard);
                    }
                }
            }
        } else if !op.retained() {
            // The client is no longer interested; remove the Op whatever
            // state it is in.
            self.drop_op(op, &mut guard);
        } else if state == OpState::InProgress {
            let ready = guard.in_message.as_ref().map_or(false, |m| m.is_ready());
            let in_failed = guard
                .in_message
                .as_ref()
                .map_or(false, |m| m.state() == InboundState::Failed);
            if ready {
                op.set_state(OpState::Completed);
                self.update_hints.push(op);
            } else if in_failed || out_state == OutboundState::Failed {
                op.set_state(OpState::Failed);
                self.update_hints.push(op);
            }
        }
    }

    /// Queue an Op for garbage collection. Idempotent.
    fn drop_op(&self, op: &Arc<Op>, guard: &mut MutexGuard<'_, OpInner>) {
        if guard.destroy {
            return;
        }
        guard.destroy = true;
        self.unused_ops.lock().unwrap().push_back(Arc::clone(op));
    }

    /// Release a bounded batch of destroyed Ops.
    fn cleanup_ops(&self) {
        let count = self.unused_ops.lock().unwrap().len();
        for _ in 0..count {
            let Some(op) = self.unused_ops.lock().unwrap().pop_front() else {
                break;
            };
            let mut inner = self.inner.lock().unwrap();
            if inner.active_ops.remove(&op.token).is_none() {
                continue;
            }
            let guard = op.inner.lock().unwrap();
            debug_assert!(guard.destroy);

            self.sender.drop_message(&op.out_message);
            if let Some(in_message) = guard.in_message.as_ref() {
                if op.is_server_op && op.state() != OpState::Completed {
                    // The requestor is still waiting for a reply that will
                    // never come; fail it explicitly.
                    control::send_error(
                        self.driver.as_ref(),
                        in_message.source(),
                        in_message.id(),
                    );
                }
                self.receiver.drop_message(in_message);
            }
            if !op.is_server_op {
                inner
                    .remote_ops
                    .remove(&MessageId::new(op.op_id, MessageId::ULTIMATE_RESPONSE_TAG));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn active_op_count(&self) -> usize {
        self.inner.lock().unwrap().active_ops.len()
    }

    #[cfg(test)]
    pub(crate) fn remote_op_count(&self) -> usize {
        self.inner.lock().unwrap().remote_ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Packet, RawAddress};
    use crate::fake_driver::FakeNetwork;
    use crate::protocol::DATA_HEADER_SIZE;

    /// Sender double that records send requests and completes nothing.
    struct MockSender {
        sent: Mutex<Vec<(MessageId, Address)>>,
    }

    impl MockSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl SenderApi for Arc<MockSender> {
        fn send_message(&self, id: MessageId, destination: Address, message: &Arc<OutboundMessage>) {
            let _ = message;
            self.sent.lock().unwrap().push((id, destination));
        }
        fn handle_grant_packet(&self, _packet: &Packet) {}
        fn handle_done_packet(&self, _packet: &Packet) {}
        fn handle_resend_packet(&self, _packet: &Packet) {}
        fn handle_unknown_packet(&self, _packet: &Packet) {}
        fn handle_error_packet(&self, _packet: &Packet) {}
        fn drop_message(&self, _message: &Arc<OutboundMessage>) {}
        fn poll(&self) {}
    }

    /// Receiver double that surfaces pre-loaded messages.
    struct MockReceiver {
        ready: Mutex<VecDeque<Arc<InboundMessage>>>,
        dropped: Mutex<Vec<MessageId>>,
    }

    impl MockReceiver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ready: Mutex::new(VecDeque::new()),
                dropped: Mutex::new(Vec::new()),
            })
        }

        fn load(&self, message: InboundMessage) {
            self.ready.lock().unwrap().push_back(Arc::new(message));
        }
    }

    impl ReceiverApi for Arc<MockReceiver> {
        fn handle_data_packet(&self, _packet: &Packet) {}
        fn handle_busy_packet(&self, _packet: &Packet) {}
        fn handle_ping_packet(&self, _packet: &Packet) {}
        fn receive_message(&self) -> Option<Arc<InboundMessage>> {
            self.ready.lock().unwrap().pop_front()
        }
        fn drop_message(&self, message: &Arc<InboundMessage>) {
            self.dropped.lock().unwrap().push(message.id());
        }
        fn poll(&self) {}
    }

    struct Harness {
        transport: Transport<Arc<MockSender>, Arc<MockReceiver>>,
        sender: Arc<MockSender>,
        receiver: Arc<MockReceiver>,
        peer_address: Address,
    }

    fn harness() -> Harness {
        let network = FakeNetwork::new(1000 + DATA_HEADER_SIZE);
        let local = network.endpoint();
        let peer = network.endpoint();
        let peer_address = peer.local_address();
        let sender = MockSender::new();
        let receiver = MockReceiver::new();
        let transport = Transport::with_parts(
            Arc::new(local),
            1,
            TransportConfig::default(),
            UpdateHints::new(),
            Arc::clone(&sender),
            Arc::clone(&receiver),
        );
        Harness {
            transport,
            sender,
            receiver,
            peer_address,
        }
    }

    /// A fully assembled single-fragment request with a valid reply address.
    fn ready_request(op_id: OpId, tag: u64, source: Address, payload: &[u8]) -> InboundMessage {
        let message = InboundMessage::new(
            MessageId::new(op_id, tag),
            source,
            payload.len(),
            1000,
            0,
        );
        let mut reply = RawAddress::default();
        reply.bytes[..8].copy_from_slice(&source.0.to_le_bytes());
        message.insert_fragment(0, payload, reply, 0);
        assert!(message.is_ready());
        message
    }

    #[test]
    fn test_alloc_op_assigns_sequential_ids() {
        let h = harness();
        let a = h.transport.alloc_op();
        let b = h.transport.alloc_op();
        assert_eq!(a.op_id(), OpId::new(1, 1));
        assert_eq!(b.op_id(), OpId::new(1, 2));
        assert!(!a.is_server_op());
        assert_eq!(a.state(), OpState::NotStarted);
        assert_eq!(h.transport.active_op_count(), 2);
        assert_eq!(h.transport.remote_op_count(), 2);
    }

    #[test]
    fn test_client_request_uses_initial_tag() {
        let h = harness();
        let op = h.transport.alloc_op();
        op.append(b"ping").unwrap();
        h.transport.send_request(&op, h.peer_address);

        assert_eq!(op.state(), OpState::InProgress);
        let sent = h.sender.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![(
                MessageId::new(OpId::new(1, 1), MessageId::INITIAL_REQUEST_TAG),
                h.peer_address
            )]
        );
    }

    #[test]
    fn test_inbound_request_becomes_server_op() {
        let h = harness();
        h.receiver.load(ready_request(
            OpId::new(9, 5),
            MessageId::INITIAL_REQUEST_TAG,
            h.peer_address,
            b"work",
        ));
        h.transport.poll();

        let op = h.transport.receive_op().expect("server op ready");
        assert!(op.is_server_op());
        assert_eq!(op.state(), OpState::InProgress);
        assert_eq!(op.payload().unwrap(), b"work");
        // At most once.
        assert!(h.transport.receive_op().is_none());
    }

    #[test]
    fn test_delegated_request_increments_tag() {
        let h = harness();
        h.receiver.load(ready_request(
            OpId::new(9, 5),
            MessageId::INITIAL_REQUEST_TAG,
            h.peer_address,
            b"work",
        ));
        h.transport.poll();
        let op = h.transport.receive_op().unwrap();

        h.transport.send_request(&op, h.peer_address);
        let sent = h.sender.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![(
                MessageId::new(OpId::new(9, 5), MessageId::INITIAL_REQUEST_TAG + 1),
                h.peer_address
            )]
        );
    }

    #[test]
    fn test_reply_uses_ultimate_tag_and_reply_address() {
        let h = harness();
        h.receiver.load(ready_request(
            OpId::new(9, 5),
            MessageId::INITIAL_REQUEST_TAG,
            h.peer_address,
            b"work",
        ));
        h.transport.poll();
        let op = h.transport.receive_op().unwrap();
        op.append(b"done").unwrap();

        h.transport.send_reply(&op);
        let sent = h.sender.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![(
                MessageId::new(OpId::new(9, 5), MessageId::ULTIMATE_RESPONSE_TAG),
                h.peer_address
            )]
        );
    }

    #[test]
    #[should_panic(expected = "send_reply on a client op")]
    fn test_reply_on_client_op_panics() {
        let h = harness();
        let op = h.transport.alloc_op();
        h.transport.send_reply(&op);
    }

    #[test]
    fn test_response_registers_onto_client_op() {
        let h = harness();
        let op = h.transport.alloc_op();
        op.append(b"ping").unwrap();
        h.transport.send_request(&op, h.peer_address);

        h.receiver.load(ready_request(
            OpId::new(1, 1),
            MessageId::ULTIMATE_RESPONSE_TAG,
            h.peer_address,
            b"pong",
        ));
        h.transport.poll();

        assert_eq!(op.state(), OpState::Completed);
        assert_eq!(op.payload().unwrap(), b"pong");
    }

    #[test]
    fn test_unmatched_response_dropped_silently() {
        let h = harness();
        h.receiver.load(ready_request(
            OpId::new(1, 77),
            MessageId::ULTIMATE_RESPONSE_TAG,
            h.peer_address,
            b"pong",
        ));
        h.transport.poll();

        assert_eq!(h.transport.active_op_count(), 0);
        assert_eq!(*h.receiver.dropped.lock().unwrap(), vec![MessageId::new(
            OpId::new(1, 77),
            MessageId::ULTIMATE_RESPONSE_TAG
        )]);
    }

    #[test]
    fn test_release_gc_removes_op_everywhere() {
        let h = harness();
        let op = h.transport.alloc_op();
        assert_eq!(h.transport.active_op_count(), 1);

        h.transport.release_op(op);
        h.transport.poll(); // processes the hint, queues for GC
        h.transport.poll(); // collects
        assert_eq!(h.transport.active_op_count(), 0);
        assert_eq!(h.transport.remote_op_count(), 0);
    }

    #[test]
    fn test_gc_is_idempotent_across_double_release_hints() {
        let h = harness();
        let op = h.transport.alloc_op();
        // Extra hints for the same op must not confuse GC.
        h.update_hints_for_test(&op);
        h.transport.release_op(op);
        for _ in 0..3 {
            h.transport.poll();
        }
        assert_eq!(h.transport.active_op_count(), 0);
    }

    impl Harness {
        fn update_hints_for_test(&self, context: &OpContext) {
            self.transport.update_hints.push(&context.op);
        }
    }
}
