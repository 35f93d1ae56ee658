//! The sending half of the transport: fragment pacing, grants, resends,
//! acknowledgments, and outbound timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::control;
use crate::driver::{Address, Driver, Packet};
use crate::message::{OutboundMessage, OutboundTimeout, ResendDisposition};
use crate::protocol::{
    DoneHeader, ErrorHeader, GrantHeader, MessageId, ResendHeader, UnknownHeader, DATA_HEADER_SIZE,
};
use crate::timing::monotonic_us;
use crate::transport::UpdateHints;

/// Operations the transport requires of its sending half.
///
/// The production implementation is [`Sender`]; tests may substitute any
/// other implementation.
pub trait SenderApi: Send + Sync {
    /// Begin transmitting `message` under `id` to `destination`.
    fn send_message(&self, id: MessageId, destination: Address, message: &Arc<OutboundMessage>);
    /// Integrate a GRANT packet.
    fn handle_grant_packet(&self, packet: &Packet);
    /// Integrate a DONE packet.
    fn handle_done_packet(&self, packet: &Packet);
    /// Integrate a RESEND packet.
    fn handle_resend_packet(&self, packet: &Packet);
    /// Integrate an UNKNOWN packet.
    fn handle_unknown_packet(&self, packet: &Packet);
    /// Integrate an ERROR packet.
    fn handle_error_packet(&self, packet: &Packet);
    /// Stop tracking `message` and release its queue slot.
    fn drop_message(&self, message: &Arc<OutboundMessage>);
    /// Transmit eligible fragments and run timeout maintenance.
    fn poll(&self);
}

/// The production sending half.
pub struct Sender {
    driver: Arc<dyn Driver>,
    config: TransportConfig,
    hints: Arc<UpdateHints>,
    /// Outbound messages in flight, by id.
    messages: Mutex<HashMap<MessageId, Arc<OutboundMessage>>>,
    /// Messages with fragments (potentially) left to transmit.
    send_queue: Mutex<VecDeque<Arc<OutboundMessage>>>,
}

impl Sender {
    /// Create a new Sender.
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        config: TransportConfig,
        hints: Arc<UpdateHints>,
    ) -> Self {
        Self {
            driver,
            config,
            hints,
            messages: Mutex::new(HashMap::new()),
            send_queue: Mutex::new(VecDeque::new()),
        }
    }

    fn lookup(&self, id: MessageId) -> Option<Arc<OutboundMessage>> {
        self.messages.lock().unwrap().get(&id).cloned()
    }

    fn enqueue(&self, message: &Arc<OutboundMessage>) {
        if message.try_enqueue() {
            self.send_queue.lock().unwrap().push_back(Arc::clone(message));
        }
    }

    fn hint_op(&self, message: &OutboundMessage) {
        if let Some(op) = message.op() {
            self.hints.push(&op);
        }
    }

    /// Transmit every currently eligible fragment, round-robin across ready
    /// messages. Non-blocking: a concurrent poller already holding the queue
    /// makes this call return immediately.
    fn try_send(&self) {
        let Ok(mut queue) = self.send_queue.try_lock() else {
            return;
        };
        let now = monotonic_us();
        loop {
            let mut progress = false;
            for message in queue.iter() {
                if let Some(fragment) = message.next_fragment(now) {
                    progress = true;
                    self.driver.send_packet(Packet {
                        payload: fragment.payload,
                        address: fragment.destination,
                    });
                    if fragment.became_sent {
                        self.hint_op(message);
                    }
                }
            }
            if !progress {
                break;
            }
        }
        // Fully transmitted messages give up their queue slot; a later
        // RESEND re-enqueues them.
        queue.retain(|message| {
            if message.finished_sending() {
                message.clear_queued();
                false
            } else {
                true
            }
        });
    }

    fn check_timeouts(&self) {
        let now = monotonic_us();
        let messages: Vec<Arc<OutboundMessage>> =
            self.messages.lock().unwrap().values().cloned().collect();
        for message in messages {
            match message.check_timeouts(
                now,
                self.config.ping_interval_us,
                self.config.message_timeout_us,
            ) {
                OutboundTimeout::Quiet => {}
                OutboundTimeout::SendPing => {
                    if let (Some(id), Some(destination)) = (message.id(), message.destination()) {
                        control::send_ping(self.driver.as_ref(), destination, id);
                    }
                }
                OutboundTimeout::Failed => {
                    debug!(id = ?message.id(), "outbound message timed out");
                    self.hint_op(&message);
                }
            }
        }
    }
}

impl SenderApi for Sender {
    fn send_message(&self, id: MessageId, destination: Address, message: &Arc<OutboundMessage>) {
        let packet_data_length = self.driver.max_payload_size() - DATA_HEADER_SIZE;
        let now = monotonic_us();
        if !message.start_transmission(
            id,
            destination,
            packet_data_length,
            self.config.grant_window_packets,
            now,
        ) {
            warn!(?id, "duplicate send request dropped");
            return;
        }
        self.messages
            .lock()
            .unwrap()
            .insert(id, Arc::clone(message));
        self.enqueue(message);
    }

    fn handle_grant_packet(&self, packet: &Packet) {
        let Ok(header) = GrantHeader::from_bytes(&packet.payload) else {
            warn!("malformed GRANT packet dropped");
            return;
        };
        let id = header.id;
        let offset = header.offset;
        match self.lookup(id) {
            Some(message) => message.handle_grant(offset as usize, monotonic_us()),
            None => debug!(?id, "grant for unknown message"),
        }
    }

    fn handle_done_packet(&self, packet: &Packet) {
        let Ok(header) = DoneHeader::from_bytes(&packet.payload) else {
            warn!("malformed DONE packet dropped");
            return;
        };
        let id = header.id;
        if let Some(message) = self.lookup(id) {
            if message.complete(monotonic_us()) {
                self.hint_op(&message);
            }
        }
    }

    fn handle_resend_packet(&self, packet: &Packet) {
        let Ok(header) = ResendHeader::from_bytes(&packet.payload) else {
            warn!("malformed RESEND packet dropped");
            return;
        };
        let id = header.id;
        let offset = header.offset;
        let length = header.length;
        let Some(message) = self.lookup(id) else {
            // The message is gone; tell the peer so it stops asking.
            control::send_unknown(self.driver.as_ref(), packet.address, id);
            return;
        };
        match message.handle_resend(offset as usize, length as usize, monotonic_us()) {
            ResendDisposition::Marked => self.enqueue(&message),
            ResendDisposition::NotYetSent => {
                control::send_busy(self.driver.as_ref(), packet.address, id);
            }
        }
    }

    fn handle_unknown_packet(&self, packet: &Packet) {
        let Ok(header) = UnknownHeader::from_bytes(&packet.payload) else {
            warn!("malformed UNKNOWN packet dropped");
            return;
        };
        let id = header.id;
        if let Some(message) = self.lookup(id) {
            debug!(?id, "peer lost track of message, restarting transmission");
            message.restart(monotonic_us());
            self.enqueue(&message);
        }
    }

    fn handle_error_packet(&self, packet: &Packet) {
        let Ok(header) = ErrorHeader::from_bytes(&packet.payload) else {
            warn!("malformed ERROR packet dropped");
            return;
        };
        let id = header.id;
        if let Some(message) = self.lookup(id) {
            if message.fail() {
                self.hint_op(&message);
            }
        }
    }

    fn drop_message(&self, message: &Arc<OutboundMessage>) {
        if let Some(id) = message.id() {
            self.messages.lock().unwrap().remove(&id);
        }
        self.send_queue
            .lock()
            .unwrap()
            .retain(|m| !Arc::ptr_eq(m, message));
        message.clear_queued();
    }

    fn poll(&self) {
        self.try_send();
        self.check_timeouts();
    }
}
