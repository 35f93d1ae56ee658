//! Contract with the packet-level device used to move datagrams.
//!
//! The transport core never touches a NIC directly; it talks to a [`Driver`],
//! which supplies interned [`Address`] handles and moves owned [`Packet`]s.
//! Drivers must be callable from multiple threads.

use crate::error::Result;

/// Size of the bit-exact wire serialization of an address.
///
/// Large enough for an IPv6 socket address with room to spare; drivers with
/// smaller native addresses zero-pad.
pub const RAW_ADDRESS_SIZE: usize = 20;

/// Bit-exact wire form of an address, as carried inside DATA headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawAddress {
    pub bytes: [u8; RAW_ADDRESS_SIZE],
}

impl Default for RawAddress {
    fn default() -> Self {
        Self {
            bytes: [0; RAW_ADDRESS_SIZE],
        }
    }
}

/// Opaque interned handle to a network address.
///
/// Handles are only meaningful to the driver that produced them; use
/// [`Driver::raw_address`] to obtain the wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub u64);

/// One datagram.
///
/// `address` is the source when received from a driver and the destination
/// when handed to [`Driver::send_packet`]. Dropping a packet releases it.
#[derive(Debug)]
pub struct Packet {
    /// Datagram payload, headers included.
    pub payload: Vec<u8>,
    /// Source (inbound) or destination (outbound) address.
    pub address: Address,
}

/// A device that transmits and receives datagrams.
///
/// Implementations must be thread-safe; the transport calls into the driver
/// concurrently from any thread that polls.
pub trait Driver: Send + Sync {
    /// Transmit one packet to `packet.address`. Transmission is best-effort;
    /// loss is handled by the protocol above.
    fn send_packet(&self, packet: Packet);

    /// Receive up to `max` packets without blocking, appending them to `out`.
    /// Returns the number of packets appended.
    fn receive_packets(&self, max: usize, out: &mut Vec<Packet>) -> usize;

    /// The address other endpoints should use to reach this driver.
    fn local_address(&self) -> Address;

    /// Intern a wire-form address into a handle.
    fn intern_address(&self, raw: &RawAddress) -> Result<Address>;

    /// Serialize an address handle into its wire form.
    fn raw_address(&self, address: Address) -> RawAddress;

    /// Largest datagram payload this driver can carry, headers included.
    fn max_payload_size(&self) -> usize;
}
