//! Common harness for transport integration tests: paired transports over an
//! in-memory fabric, bounded polling, and a wire tap built on the fabric's
//! loss hook.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use homa::protocol::{CommonHeader, DataHeader, GrantHeader, Opcode, ResendHeader};
use homa::{
    Address, Driver, FakeNetwork, MessageId, Packet, Transport, TransportConfig, DATA_HEADER_SIZE,
};

/// Fragment payload size used throughout the integration tests.
pub const PACKET_DATA_LENGTH: usize = 1000;

/// A pair of transports joined by a fabric.
pub struct TestNet {
    pub network: Arc<FakeNetwork>,
    pub client: Transport,
    pub server: Transport,
    pub client_address: Address,
    pub server_address: Address,
}

/// Build a client/server pair whose datagrams carry exactly
/// `PACKET_DATA_LENGTH` bytes of message payload.
pub fn pair(config: TransportConfig) -> TestNet {
    let network = FakeNetwork::new(DATA_HEADER_SIZE + PACKET_DATA_LENGTH);
    let client_driver = network.endpoint();
    let server_driver = network.endpoint();
    let client_address = client_driver.local_address();
    let server_address = server_driver.local_address();
    TestNet {
        client: Transport::new(Arc::new(client_driver), 1, config.clone()),
        server: Transport::new(Arc::new(server_driver), 2, config),
        network,
        client_address,
        server_address,
    }
}

/// Poll every transport until the predicate holds, up to `max_polls` rounds.
/// Returns true if the predicate held.
pub fn poll_until(
    transports: &[&Transport],
    max_polls: usize,
    mut predicate: impl FnMut() -> bool,
) -> bool {
    for _ in 0..max_polls {
        for transport in transports {
            transport.poll();
        }
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(100));
    }
    false
}

/// One observed DATA fragment.
pub struct DataRecord {
    pub id: MessageId,
    pub total: u32,
    pub offset: u32,
    pub payload: Vec<u8>,
    /// Originating endpoint.
    pub source: Address,
}

/// Everything seen on the wire, by packet kind.
#[derive(Default)]
pub struct PacketLog {
    pub data: Vec<DataRecord>,
    pub grants: Vec<(MessageId, u32)>,
    pub resends: Vec<(MessageId, u32, u32)>,
    pub dones: Vec<(MessageId, Address)>,
    pub errors: Vec<MessageId>,
}

impl PacketLog {
    pub fn data_offsets(&self, id: MessageId) -> Vec<u32> {
        self.data
            .iter()
            .filter(|r| r.id == id)
            .map(|r| r.offset)
            .collect()
    }

    pub fn grant_offsets(&self, id: MessageId) -> Vec<u32> {
        self.grants
            .iter()
            .filter(|(g, _)| *g == id)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

fn record(log: &Mutex<PacketLog>, packet: &Packet) {
    let mut log = log.lock().unwrap();
    match CommonHeader::opcode_of(&packet.payload) {
        Ok(Opcode::Data) => {
            if let Ok(header) = DataHeader::from_bytes(&packet.payload) {
                log.data.push(DataRecord {
                    id: header.id,
                    total: header.total_length,
                    offset: header.offset,
                    payload: packet.payload[DATA_HEADER_SIZE..].to_vec(),
                    source: packet.address,
                });
            }
        }
        Ok(Opcode::Grant) => {
            if let Ok(header) = GrantHeader::from_bytes(&packet.payload) {
                log.grants.push((header.id, header.offset));
            }
        }
        Ok(Opcode::Resend) => {
            if let Ok(header) = ResendHeader::from_bytes(&packet.payload) {
                log.resends.push((header.id, header.offset, header.length));
            }
        }
        Ok(Opcode::Done) => {
            if let Ok(header) = homa::protocol::DoneHeader::from_bytes(&packet.payload) {
                log.dones.push((header.id, packet.address));
            }
        }
        Ok(Opcode::Error) => {
            if let Ok(header) = homa::protocol::ErrorHeader::from_bytes(&packet.payload) {
                log.errors.push(header.id);
            }
        }
        _ => {}
    }
}

/// Observe every packet on the fabric without dropping any.
pub fn install_tap(network: &FakeNetwork) -> Arc<Mutex<PacketLog>> {
    install_tap_with_drop(network, |_| false)
}

/// Observe every packet, then let `drop` decide whether to lose it.
pub fn install_tap_with_drop(
    network: &FakeNetwork,
    mut drop: impl FnMut(&Packet) -> bool + Send + 'static,
) -> Arc<Mutex<PacketLog>> {
    let log = Arc::new(Mutex::new(PacketLog::default()));
    let tap = Arc::clone(&log);
    network.set_loss_hook(move |packet| {
        record(&tap, packet);
        drop(packet)
    });
    log
}

/// Drop the first DATA fragment observed at `offset`, then pass everything.
pub fn drop_data_offset_once(offset: u32) -> impl FnMut(&Packet) -> bool + Send + 'static {
    let mut dropped = false;
    move |packet| {
        if dropped {
            return false;
        }
        if matches!(CommonHeader::opcode_of(&packet.payload), Ok(Opcode::Data)) {
            if let Ok(header) = DataHeader::from_bytes(&packet.payload) {
                let seen = header.offset;
                if seen == offset {
                    dropped = true;
                    return true;
                }
            }
        }
        false
    }
}
