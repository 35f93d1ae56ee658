//! Datagram driver over a non-blocking UDP socket.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;

use slab::Slab;
use tracing::warn;

use crate::driver::{Address, Driver, Packet, RawAddress, RAW_ADDRESS_SIZE};
use crate::error::{Error, Result};

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

struct AddressTable {
    slots: Slab<SocketAddr>,
    by_addr: HashMap<SocketAddr, usize>,
}

/// Driver that sends and receives datagrams over UDP.
///
/// Socket addresses are interned into stable [`Address`] handles through a
/// slab-backed table; the wire form encodes family, address octets, and port.
pub struct UdpDriver {
    socket: UdpSocket,
    max_payload_size: usize,
    local: Address,
    table: Mutex<AddressTable>,
}

impl UdpDriver {
    /// Bind a UDP socket and wrap it as a driver.
    pub fn new<A: ToSocketAddrs>(bind: A, max_payload_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let mut table = AddressTable {
            slots: Slab::new(),
            by_addr: HashMap::new(),
        };
        let key = table.slots.insert(local_addr);
        table.by_addr.insert(local_addr, key);

        Ok(Self {
            socket,
            max_payload_size,
            local: Address(key as u64 + 1),
            table: Mutex::new(table),
        })
    }

    /// The socket address this driver is bound to.
    pub fn local_socket_addr(&self) -> SocketAddr {
        self.lookup(self.local).unwrap()
    }

    /// Intern a socket address into a handle.
    pub fn intern_socket_addr(&self, addr: SocketAddr) -> Address {
        let mut table = self.table.lock().unwrap();
        if let Some(&key) = table.by_addr.get(&addr) {
            return Address(key as u64 + 1);
        }
        let key = table.slots.insert(addr);
        table.by_addr.insert(addr, key);
        Address(key as u64 + 1)
    }

    fn lookup(&self, address: Address) -> Option<SocketAddr> {
        if address.0 == 0 {
            return None;
        }
        let table = self.table.lock().unwrap();
        table.slots.get(address.0 as usize - 1).copied()
    }

    fn encode(addr: SocketAddr) -> RawAddress {
        let mut raw = RawAddress {
            bytes: [0; RAW_ADDRESS_SIZE],
        };
        match addr {
            SocketAddr::V4(v4) => {
                raw.bytes[0] = FAMILY_V4;
                raw.bytes[1..5].copy_from_slice(&v4.ip().octets());
                raw.bytes[5..7].copy_from_slice(&v4.port().to_le_bytes());
            }
            SocketAddr::V6(v6) => {
                raw.bytes[0] = FAMILY_V6;
                raw.bytes[1..17].copy_from_slice(&v6.ip().octets());
                raw.bytes[17..19].copy_from_slice(&v6.port().to_le_bytes());
            }
        }
        raw
    }

    fn decode(raw: &RawAddress) -> Result<SocketAddr> {
        match raw.bytes[0] {
            FAMILY_V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&raw.bytes[1..5]);
                let port = u16::from_le_bytes([raw.bytes[5], raw.bytes[6]]);
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            FAMILY_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw.bytes[1..17]);
                let port = u16::from_le_bytes([raw.bytes[17], raw.bytes[18]]);
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => Err(Error::InvalidAddress),
        }
    }
}

impl Driver for UdpDriver {
    fn send_packet(&self, packet: Packet) {
        let Some(dest) = self.lookup(packet.address) else {
            warn!(handle = packet.address.0, "send to unknown address handle");
            return;
        };
        if let Err(e) = self.socket.send_to(&packet.payload, dest) {
            // Datagram loss is the protocol's problem; just note it.
            warn!(%dest, error = %e, "UDP send failed");
        }
    }

    fn receive_packets(&self, max: usize, out: &mut Vec<Packet>) -> usize {
        let mut count = 0;
        let mut buf = vec![0u8; self.max_payload_size];
        while count < max {
            match self.socket.recv_from(&mut buf) {
                Ok((len, source)) => {
                    let address = self.intern_socket_addr(source);
                    out.push(Packet {
                        payload: buf[..len].to_vec(),
                        address,
                    });
                    count += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    break;
                }
            }
        }
        count
    }

    fn local_address(&self) -> Address {
        self.local
    }

    fn intern_address(&self, raw: &RawAddress) -> Result<Address> {
        let addr = Self::decode(raw)?;
        Ok(self.intern_socket_addr(addr))
    }

    fn raw_address(&self, address: Address) -> RawAddress {
        match self.lookup(address) {
            Some(addr) => Self::encode(addr),
            None => RawAddress::default(),
        }
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip_v4() {
        let addr: SocketAddr = "127.0.0.1:4711".parse().unwrap();
        let raw = UdpDriver::encode(addr);
        assert_eq!(UdpDriver::decode(&raw).unwrap(), addr);
    }

    #[test]
    fn test_raw_roundtrip_v6() {
        let addr: SocketAddr = "[::1]:4711".parse().unwrap();
        let raw = UdpDriver::encode(addr);
        assert_eq!(UdpDriver::decode(&raw).unwrap(), addr);
    }

    #[test]
    fn test_decode_invalid() {
        assert!(UdpDriver::decode(&RawAddress::default()).is_err());
    }

    #[test]
    fn test_loopback_send_receive() {
        let a = UdpDriver::new("127.0.0.1:0", 1400).unwrap();
        let b = UdpDriver::new("127.0.0.1:0", 1400).unwrap();

        let b_handle = a.intern_socket_addr(b.local_socket_addr());
        a.send_packet(Packet {
            payload: vec![7, 8, 9],
            address: b_handle,
        });

        // Loopback delivery is fast but not instantaneous.
        let mut received = Vec::new();
        for _ in 0..100 {
            if b.receive_packets(32, &mut received) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, vec![7, 8, 9]);

        // The source address handle round-trips through the wire form.
        let raw = b.raw_address(received[0].address);
        assert_eq!(UdpDriver::decode(&raw).unwrap(), a.local_socket_addr());
    }

    #[test]
    fn test_interning_is_stable() {
        let driver = UdpDriver::new("127.0.0.1:0", 1400).unwrap();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let h1 = driver.intern_socket_addr(addr);
        let h2 = driver.intern_socket_addr(addr);
        assert_eq!(h1, h2);
    }
}
