//! Construction and emission of control packets.
//!
//! Control packets are header-only datagrams; each helper builds the packed
//! header and hands it straight to the driver.

use crate::driver::{Address, Driver, Packet};
use crate::protocol::{
    BusyHeader, DoneHeader, ErrorHeader, GrantHeader, MessageId, PingHeader, ResendHeader,
    UnknownHeader,
};

/// Serialize a packed header into a fresh packet and transmit it.
fn send<H: Copy>(driver: &dyn Driver, destination: Address, header: &H) {
    let size = std::mem::size_of::<H>();
    let mut payload = vec![0u8; size];
    unsafe {
        std::ptr::copy_nonoverlapping(header as *const H as *const u8, payload.as_mut_ptr(), size);
    }
    driver.send_packet(Packet {
        payload,
        address: destination,
    });
}

/// Raise the peer sender's permitted transmit offset.
pub(crate) fn send_grant(driver: &dyn Driver, destination: Address, id: MessageId, offset: u32) {
    send(driver, destination, &GrantHeader::new(id, offset));
}

/// Acknowledge that a message was delivered to the application.
pub(crate) fn send_done(driver: &dyn Driver, destination: Address, id: MessageId) {
    send(driver, destination, &DoneHeader::new(id));
}

/// Demand retransmission of a byte range.
pub(crate) fn send_resend(
    driver: &dyn Driver,
    destination: Address,
    id: MessageId,
    offset: u32,
    length: u32,
) {
    send(driver, destination, &ResendHeader::new(id, offset, length));
}

/// Signal that the sender is alive but cannot make progress yet.
pub(crate) fn send_busy(driver: &dyn Driver, destination: Address, id: MessageId) {
    send(driver, destination, &BusyHeader::new(id));
}

/// Probe the receiving side for liveness.
pub(crate) fn send_ping(driver: &dyn Driver, destination: Address, id: MessageId) {
    send(driver, destination, &PingHeader::new(id));
}

/// Tell the peer this endpoint has no record of the message.
pub(crate) fn send_unknown(driver: &dyn Driver, destination: Address, id: MessageId) {
    send(driver, destination, &UnknownHeader::new(id));
}

/// Declare the message permanently failed.
pub(crate) fn send_error(driver: &dyn Driver, destination: Address, id: MessageId) {
    send(driver, destination, &ErrorHeader::new(id));
}
