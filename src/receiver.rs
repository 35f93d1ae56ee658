//! The receiving half of the transport: fragment assembly dispatch, the
//! scheduled grant loop, and inbound timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::control;
use crate::driver::{Driver, Packet};
use crate::message::{FragmentInsert, InboundMessage, InboundTimeout};
use crate::protocol::{BusyHeader, DataHeader, MessageId, PingHeader, DATA_HEADER_SIZE};
use crate::timing::monotonic_us;
use crate::transport::UpdateHints;

/// Operations the transport requires of its receiving half.
///
/// The production implementation is [`Receiver`]; tests may substitute any
/// other implementation.
pub trait ReceiverApi: Send + Sync {
    /// Integrate a DATA fragment.
    fn handle_data_packet(&self, packet: &Packet);
    /// Integrate a BUSY packet.
    fn handle_busy_packet(&self, packet: &Packet);
    /// Integrate a PING packet.
    fn handle_ping_packet(&self, packet: &Packet);
    /// Pop the next fully assembled message, in completion order.
    fn receive_message(&self) -> Option<Arc<InboundMessage>>;
    /// Release a message back to the receiver.
    fn drop_message(&self, message: &Arc<InboundMessage>);
    /// Run grant scheduling and timeout maintenance.
    fn poll(&self);
}

/// The production receiving half.
pub struct Receiver {
    driver: Arc<dyn Driver>,
    config: TransportConfig,
    hints: Arc<UpdateHints>,
    /// Messages being assembled or awaiting release, by id.
    inbound_messages: Mutex<HashMap<MessageId, Arc<InboundMessage>>>,
    /// Fully assembled messages not yet claimed by the transport.
    received_messages: Mutex<VecDeque<Arc<InboundMessage>>>,
    /// One-shot guard so only one thread runs `schedule()` per tick.
    scheduling: AtomicBool,
}

impl Receiver {
    /// Create a new Receiver.
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        config: TransportConfig,
        hints: Arc<UpdateHints>,
    ) -> Self {
        Self {
            driver,
            config,
            hints,
            inbound_messages: Mutex::new(HashMap::new()),
            received_messages: Mutex::new(VecDeque::new()),
            scheduling: AtomicBool::new(false),
        }
    }

    fn packet_data_length(&self) -> usize {
        self.driver.max_payload_size() - DATA_HEADER_SIZE
    }

    fn window_bytes(&self) -> usize {
        self.config.grant_window_packets * self.packet_data_length()
    }

    fn lookup(&self, id: MessageId) -> Option<Arc<InboundMessage>> {
        self.inbound_messages.lock().unwrap().get(&id).cloned()
    }

    /// Recompute the actively granted set and issue any raised grants.
    ///
    /// Guarded by the `scheduling` flag: a concurrent caller returns
    /// immediately, and a pass missed that way is picked up by the next
    /// poll rather than re-triggered.
    fn schedule(&self) {
        if self
            .scheduling
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut candidates: Vec<(usize, Arc<InboundMessage>)> = self
            .inbound_messages
            .lock()
            .unwrap()
            .values()
            .map(|m| (m.remaining_bytes(), Arc::clone(m)))
            .filter(|(remaining, _)| *remaining > 0)
            .collect();
        // Shortest remaining bytes first.
        candidates.sort_by_key(|(remaining, _)| *remaining);

        let window = self.window_bytes();
        for (_, message) in candidates.into_iter().take(self.config.max_granted_messages) {
            if let Some(offset) = message.grant_target(window) {
                control::send_grant(self.driver.as_ref(), message.source(), message.id(), offset);
            }
        }

        self.scheduling.store(false, Ordering::Release);
    }

    fn check_timeouts(&self) {
        let now = monotonic_us();
        let messages: Vec<Arc<InboundMessage>> = self
            .inbound_messages
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for message in messages {
            match message.check_timeouts(
                now,
                self.config.resend_interval_us,
                self.config.message_timeout_us,
            ) {
                InboundTimeout::Quiet => {}
                InboundTimeout::SendResend { offset, length } => {
                    control::send_resend(
                        self.driver.as_ref(),
                        message.source(),
                        message.id(),
                        offset,
                        length,
                    );
                }
                InboundTimeout::Failed => {
                    debug!(id = ?message.id(), "inbound message timed out");
                    match message.registered_op() {
                        Some(op) => self.hints.push(&op),
                        None => {
                            // Nobody is waiting for it; forget it.
                            self.inbound_messages.lock().unwrap().remove(&message.id());
                        }
                    }
                }
            }
        }
    }
}

impl ReceiverApi for Receiver {
    fn handle_data_packet(&self, packet: &Packet) {
        let Ok(header) = DataHeader::from_bytes(&packet.payload) else {
            warn!("malformed DATA packet dropped");
            return;
        };
        let id = header.id;
        let total_length = header.total_length as usize;
        let offset = header.offset as usize;
        let reply_address = header.reply_address;
        let now = monotonic_us();

        let message = {
            let mut inbound = self.inbound_messages.lock().unwrap();
            Arc::clone(inbound.entry(id).or_insert_with(|| {
                Arc::new(InboundMessage::new(
                    id,
                    packet.address,
                    total_length,
                    self.packet_data_length(),
                    now,
                ))
            }))
        };

        let data = &packet.payload[DATA_HEADER_SIZE..];
        match message.insert_fragment(offset, data, reply_address, now) {
            FragmentInsert::Accepted { became_ready: true } => {
                self.received_messages.lock().unwrap().push_back(message);
            }
            FragmentInsert::Accepted { became_ready: false } | FragmentInsert::Duplicate => {}
        }
    }

    fn handle_busy_packet(&self, packet: &Packet) {
        let Ok(header) = BusyHeader::from_bytes(&packet.payload) else {
            warn!("malformed BUSY packet dropped");
            return;
        };
        let id = header.id;
        if let Some(message) = self.lookup(id) {
            message.refresh_activity(monotonic_us());
        }
    }

    fn handle_ping_packet(&self, packet: &Packet) {
        let Ok(header) = PingHeader::from_bytes(&packet.payload) else {
            warn!("malformed PING packet dropped");
            return;
        };
        let id = header.id;
        let Some(message) = self.lookup(id) else {
            control::send_unknown(self.driver.as_ref(), packet.address, id);
            return;
        };
        if message.has_received_beyond_contiguous() {
            if let Some((offset, length)) = message.missing_range() {
                control::send_resend(
                    self.driver.as_ref(),
                    message.source(),
                    id,
                    offset,
                    length,
                );
            }
        } else if let Some(offset) = message.refresh_grant(self.window_bytes()) {
            control::send_grant(self.driver.as_ref(), message.source(), id, offset);
        }
    }

    fn receive_message(&self) -> Option<Arc<InboundMessage>> {
        self.received_messages.lock().unwrap().pop_front()
    }

    fn drop_message(&self, message: &Arc<InboundMessage>) {
        self.inbound_messages.lock().unwrap().remove(&message.id());
        self.received_messages
            .lock()
            .unwrap()
            .retain(|m| !Arc::ptr_eq(m, message));
    }

    fn poll(&self) {
        self.schedule();
        self.check_timeouts();
    }
}
