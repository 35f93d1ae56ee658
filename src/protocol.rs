//! Protocol vocabulary: identifiers, opcodes, and wire header formats.
//!
//! All headers are fixed-size `#[repr(C, packed)]` structs carried at the
//! front of the datagram payload and interpreted in place. Multi-byte fields
//! are little-endian on the wire; the communicating set is assumed to share
//! byte order, as is usual for a single datacenter fabric.

use crate::driver::RawAddress;
use crate::error::{Error, Result};

/// Unique identifier of one transport within the communicating set.
pub type TransportId = u64;

/// Identifier of a single remote operation.
///
/// The allocating transport increments `sequence` monotonically, so the pair
/// is unique across the set for the lifetime of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct OpId {
    /// Transport that allocated this operation.
    pub transport_id: TransportId,
    /// Allocation sequence number within that transport.
    pub sequence: u64,
}

impl OpId {
    /// Create a new OpId.
    #[inline]
    pub fn new(transport_id: TransportId, sequence: u64) -> Self {
        Self {
            transport_id,
            sequence,
        }
    }
}

/// Identifier of one directional message leg of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct MessageId {
    /// Operation this message belongs to.
    pub op_id: OpId,
    /// Which leg of the operation this message is.
    pub tag: u64,
}

impl MessageId {
    /// Tag of the final reply leg that completes an operation.
    pub const ULTIMATE_RESPONSE_TAG: u64 = 0;
    /// Tag of the original request leg of an operation.
    pub const INITIAL_REQUEST_TAG: u64 = 1;

    /// Create a new MessageId.
    #[inline]
    pub fn new(op_id: OpId, tag: u64) -> Self {
        Self { op_id, tag }
    }
}

/// Maximum message payload length (fits the 32-bit totalLength field with
/// room to spare).
pub const MAX_MESSAGE_LENGTH: usize = (1 << 24) - 1;

/// Packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Message fragment.
    Data = 1,
    /// Receiver raises the sender's permitted transmit offset.
    Grant = 2,
    /// Receiver has delivered the message to the application.
    Done = 3,
    /// Receiver demands retransmission of a byte range.
    Resend = 4,
    /// Sender is alive but not ready to make progress.
    Busy = 5,
    /// Sender probes for liveness of the receiving side.
    Ping = 6,
    /// Recipient has no record of the message.
    Unknown = 7,
    /// Peer declares the message permanently failed.
    Error = 8,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Data),
            2 => Ok(Opcode::Grant),
            3 => Ok(Opcode::Done),
            4 => Ok(Opcode::Resend),
            5 => Ok(Opcode::Busy),
            6 => Ok(Opcode::Ping),
            7 => Ok(Opcode::Unknown),
            8 => Ok(Opcode::Error),
            _ => Err(Error::InvalidOpcode(value)),
        }
    }
}

/// Size of the common header prefix shared by every packet.
pub const COMMON_HEADER_SIZE: usize = 1;
/// Size of a DATA packet header.
pub const DATA_HEADER_SIZE: usize = std::mem::size_of::<DataHeader>();
/// Size of a GRANT packet header.
pub const GRANT_HEADER_SIZE: usize = std::mem::size_of::<GrantHeader>();
/// Size of a RESEND packet header.
pub const RESEND_HEADER_SIZE: usize = std::mem::size_of::<ResendHeader>();
/// Size of the id-only control headers (DONE, BUSY, PING, UNKNOWN, ERROR).
pub const CONTROL_HEADER_SIZE: usize = std::mem::size_of::<DoneHeader>();

/// Copy a header out of the front of a datagram payload.
///
/// # Safety
/// The caller must guarantee `bytes.len() >= size_of::<H>()`.
unsafe fn read_header<H: Copy>(bytes: &[u8]) -> H {
    let mut header = std::mem::MaybeUninit::<H>::uninit();
    std::ptr::copy_nonoverlapping(
        bytes.as_ptr(),
        header.as_mut_ptr() as *mut u8,
        std::mem::size_of::<H>(),
    );
    header.assume_init()
}

/// Prefix common to every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct CommonHeader {
    /// Raw opcode byte; see [`Opcode`].
    pub opcode: u8,
}

impl CommonHeader {
    /// Decode the opcode of a datagram, if it carries a well-formed prefix.
    pub fn opcode_of(bytes: &[u8]) -> Result<Opcode> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return Err(Error::InvalidPacket);
        }
        Opcode::try_from(bytes[0])
    }
}

/// Header of a DATA packet; `payload bytes` follow it in the datagram.
///
/// `total_length` counts application payload only. The `reply_address` field
/// keeps the header fixed-size on every fragment but is meaningful only on
/// the fragment at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct DataHeader {
    pub common: CommonHeader,
    pub id: MessageId,
    /// Total message length in bytes.
    pub total_length: u32,
    /// Byte offset of this fragment within the message.
    pub offset: u32,
    /// Where the reply to this operation should be sent.
    pub reply_address: RawAddress,
}

impl DataHeader {
    /// Create a new DATA header.
    pub fn new(id: MessageId, total_length: u32, offset: u32, reply_address: RawAddress) -> Self {
        Self {
            common: CommonHeader {
                opcode: Opcode::Data as u8,
            },
            id,
            total_length,
            offset,
            reply_address,
        }
    }

    /// Serialize the header to a buffer.
    ///
    /// # Safety
    /// The destination must hold at least `DATA_HEADER_SIZE` bytes.
    #[inline]
    pub unsafe fn write_to(&self, dst: *mut u8) {
        std::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, DATA_HEADER_SIZE);
    }

    /// Parse a DATA header from the front of a datagram payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DATA_HEADER_SIZE {
            return Err(Error::InvalidPacket);
        }
        let header: Self = unsafe { read_header(bytes) };
        if header.common.opcode != Opcode::Data as u8 {
            return Err(Error::InvalidPacket);
        }
        Ok(header)
    }
}

/// Header of a GRANT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct GrantHeader {
    pub common: CommonHeader,
    pub id: MessageId,
    /// Highest byte offset the sender may transmit through (inclusive).
    pub offset: u32,
}

impl GrantHeader {
    /// Create a new GRANT header.
    pub fn new(id: MessageId, offset: u32) -> Self {
        Self {
            common: CommonHeader {
                opcode: Opcode::Grant as u8,
            },
            id,
            offset,
        }
    }

    /// Parse a GRANT header from the front of a datagram payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GRANT_HEADER_SIZE {
            return Err(Error::InvalidPacket);
        }
        let header: Self = unsafe { read_header(bytes) };
        if header.common.opcode != Opcode::Grant as u8 {
            return Err(Error::InvalidPacket);
        }
        Ok(header)
    }
}

/// Header of a RESEND packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct ResendHeader {
    pub common: CommonHeader,
    pub id: MessageId,
    /// First byte of the range to retransmit.
    pub offset: u32,
    /// Length of the range to retransmit.
    pub length: u32,
}

impl ResendHeader {
    /// Create a new RESEND header.
    pub fn new(id: MessageId, offset: u32, length: u32) -> Self {
        Self {
            common: CommonHeader {
                opcode: Opcode::Resend as u8,
            },
            id,
            offset,
            length,
        }
    }

    /// Parse a RESEND header from the front of a datagram payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESEND_HEADER_SIZE {
            return Err(Error::InvalidPacket);
        }
        let header: Self = unsafe { read_header(bytes) };
        if header.common.opcode != Opcode::Resend as u8 {
            return Err(Error::InvalidPacket);
        }
        Ok(header)
    }
}

macro_rules! id_only_header {
    ($(#[$doc:meta])* $name:ident, $opcode:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(C, packed)]
        pub struct $name {
            pub common: CommonHeader,
            pub id: MessageId,
        }

        impl $name {
            /// Create a new header.
            pub fn new(id: MessageId) -> Self {
                Self {
                    common: CommonHeader {
                        opcode: $opcode as u8,
                    },
                    id,
                }
            }

            /// Parse the header from the front of a datagram payload.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                if bytes.len() < std::mem::size_of::<Self>() {
                    return Err(Error::InvalidPacket);
                }
                let header: Self = unsafe { read_header(bytes) };
                if header.common.opcode != $opcode as u8 {
                    return Err(Error::InvalidPacket);
                }
                Ok(header)
            }
        }
    };
}

id_only_header!(
    /// Header of a DONE packet.
    DoneHeader,
    Opcode::Done
);
id_only_header!(
    /// Header of a BUSY packet.
    BusyHeader,
    Opcode::Busy
);
id_only_header!(
    /// Header of a PING packet.
    PingHeader,
    Opcode::Ping
);
id_only_header!(
    /// Header of an UNKNOWN packet.
    UnknownHeader,
    Opcode::Unknown
);
id_only_header!(
    /// Header of an ERROR packet.
    ErrorHeader,
    Opcode::Error
);
