//! In-memory packet fabric for tests, benches, and demos.
//!
//! A [`FakeNetwork`] holds one FIFO of packets per endpoint; a
//! [`FakeDriver`] is one endpoint's view of the fabric. Delivery is
//! immediate and lossless unless a loss hook is installed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::driver::{Address, Driver, Packet, RawAddress, RAW_ADDRESS_SIZE};
use crate::error::{Error, Result};

/// Loss hook: inspects a packet about to be delivered (`address` already
/// rewritten to the source endpoint) and returns true to drop it.
pub type LossHook = Box<dyn FnMut(&Packet) -> bool + Send>;

struct NetworkInner {
    queues: HashMap<u64, VecDeque<Packet>>,
    next_endpoint: u64,
}

/// Shared in-memory fabric connecting [`FakeDriver`] endpoints.
pub struct FakeNetwork {
    inner: Mutex<NetworkInner>,
    loss_hook: Mutex<Option<LossHook>>,
    max_payload_size: usize,
}

impl FakeNetwork {
    /// Create a new fabric whose datagrams carry at most `max_payload_size`
    /// bytes.
    pub fn new(max_payload_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetworkInner {
                queues: HashMap::new(),
                next_endpoint: 1,
            }),
            loss_hook: Mutex::new(None),
            max_payload_size,
        })
    }

    /// Attach a new endpoint to the fabric.
    pub fn endpoint(self: &Arc<Self>) -> FakeDriver {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_endpoint;
        inner.next_endpoint += 1;
        inner.queues.insert(id, VecDeque::new());
        FakeDriver {
            network: Arc::clone(self),
            address: Address(id),
        }
    }

    /// Install a loss hook consulted on every delivery. Replaces any
    /// previous hook.
    pub fn set_loss_hook<F>(&self, hook: F)
    where
        F: FnMut(&Packet) -> bool + Send + 'static,
    {
        *self.loss_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Remove the loss hook; the fabric becomes lossless again.
    pub fn clear_loss_hook(&self) {
        *self.loss_hook.lock().unwrap() = None;
    }

    fn deliver(&self, destination: Address, packet: Packet) {
        {
            let mut hook = self.loss_hook.lock().unwrap();
            if let Some(f) = hook.as_mut() {
                if f(&packet) {
                    return;
                }
            }
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.queues.get_mut(&destination.0) {
            queue.push_back(packet);
        }
    }
}

/// One endpoint of a [`FakeNetwork`].
pub struct FakeDriver {
    network: Arc<FakeNetwork>,
    address: Address,
}

impl Driver for FakeDriver {
    fn send_packet(&self, packet: Packet) {
        assert!(packet.payload.len() <= self.network.max_payload_size);
        let destination = packet.address;
        // Rewrite the address so the receiving side sees the source.
        let delivered = Packet {
            payload: packet.payload,
            address: self.address,
        };
        self.network.deliver(destination, delivered);
    }

    fn receive_packets(&self, max: usize, out: &mut Vec<Packet>) -> usize {
        let mut inner = self.network.inner.lock().unwrap();
        let queue = match inner.queues.get_mut(&self.address.0) {
            Some(q) => q,
            None => return 0,
        };
        let mut count = 0;
        while count < max {
            match queue.pop_front() {
                Some(packet) => {
                    out.push(packet);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn local_address(&self) -> Address {
        self.address
    }

    fn intern_address(&self, raw: &RawAddress) -> Result<Address> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw.bytes[..8]);
        let id = u64::from_le_bytes(bytes);
        if id == 0 {
            return Err(Error::InvalidAddress);
        }
        Ok(Address(id))
    }

    fn raw_address(&self, address: Address) -> RawAddress {
        let mut raw = RawAddress {
            bytes: [0; RAW_ADDRESS_SIZE],
        };
        raw.bytes[..8].copy_from_slice(&address.0.to_le_bytes());
        raw
    }

    fn max_payload_size(&self) -> usize {
        self.network.max_payload_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let network = FakeNetwork::new(1024);
        let a = network.endpoint();
        let b = network.endpoint();

        a.send_packet(Packet {
            payload: vec![1, 2, 3],
            address: b.local_address(),
        });

        let mut received = Vec::new();
        assert_eq!(b.receive_packets(32, &mut received), 1);
        assert_eq!(received[0].payload, vec![1, 2, 3]);
        // Delivered packets carry the source address.
        assert_eq!(received[0].address, a.local_address());
        assert_eq!(a.receive_packets(32, &mut received), 0);
    }

    #[test]
    fn test_address_interning() {
        let network = FakeNetwork::new(1024);
        let a = network.endpoint();
        let b = network.endpoint();

        let raw = a.raw_address(b.local_address());
        assert_eq!(a.intern_address(&raw).unwrap(), b.local_address());
        let zero = RawAddress::default();
        assert!(a.intern_address(&zero).is_err());
    }

    #[test]
    fn test_loss_hook() {
        let network = FakeNetwork::new(1024);
        let a = network.endpoint();
        let b = network.endpoint();

        network.set_loss_hook(|packet| packet.payload[0] == 9);

        a.send_packet(Packet {
            payload: vec![9],
            address: b.local_address(),
        });
        a.send_packet(Packet {
            payload: vec![1],
            address: b.local_address(),
        });

        let mut received = Vec::new();
        assert_eq!(b.receive_packets(32, &mut received), 1);
        assert_eq!(received[0].payload, vec![1]);

        network.clear_loss_hook();
        a.send_packet(Packet {
            payload: vec![9],
            address: b.local_address(),
        });
        assert_eq!(b.receive_packets(32, &mut received), 1);
    }

    #[test]
    fn test_burst_limit() {
        let network = FakeNetwork::new(1024);
        let a = network.endpoint();
        let b = network.endpoint();

        for i in 0..5u8 {
            a.send_packet(Packet {
                payload: vec![i],
                address: b.local_address(),
            });
        }

        let mut received = Vec::new();
        assert_eq!(b.receive_packets(3, &mut received), 3);
        assert_eq!(b.receive_packets(3, &mut received), 2);
        assert_eq!(received.len(), 5);
    }
}
