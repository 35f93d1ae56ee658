//! # homa - receiver-driven datagram transport for low-latency RPC
//!
//! This crate implements a Homa-style (NSDI 2018 lineage) message-oriented
//! transport for short remote operations across a datacenter fabric. Many
//! in-flight operations are multiplexed over a single packet device;
//! inbound datagrams are assembled into messages, outbound traffic is paced
//! under explicit receiver-issued grants, and completed request/response
//! pairs surface to the application through a polling API.
//!
//! ## Features
//!
//! - **Receiver-driven flow control**: receivers grant transmit windows to
//!   the shortest-remaining messages first (SRPT)
//! - **Message fragmentation**: arbitrary payloads are cut to the driver's
//!   datagram size and reassembled in any arrival order
//! - **Loss recovery**: receiver-requested resends, sender liveness pings,
//!   and restart-on-unknown
//! - **Op lifecycle**: request/response pairs are coordinated as `Op`s with
//!   explicit release and background garbage collection
//! - **Pluggable packet device**: anything implementing [`Driver`] works; a
//!   UDP driver and an in-memory fabric are included
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use homa::{Driver, FakeNetwork, OpState, Transport, TransportConfig};
//!
//! let network = FakeNetwork::new(1400);
//! let server_driver = network.endpoint();
//! let server_address = server_driver.local_address();
//!
//! let client = Transport::new(Arc::new(network.endpoint()), 1, TransportConfig::default());
//! let server = Transport::new(Arc::new(server_driver), 2, TransportConfig::default());
//!
//! // Client issues a request.
//! let op = client.alloc_op();
//! op.append(b"ping").unwrap();
//! client.send_request(&op, server_address);
//!
//! // Both sides poll until the operation completes.
//! for _ in 0..100 {
//!     client.poll();
//!     server.poll();
//!     if let Some(request) = server.receive_op() {
//!         assert_eq!(request.payload().unwrap(), b"ping");
//!         request.append(b"pong").unwrap();
//!         server.send_reply(&request);
//!         server.release_op(request);
//!     }
//!     if op.state() == OpState::Completed {
//!         break;
//!     }
//! }
//! assert_eq!(op.state(), OpState::Completed);
//! assert_eq!(op.payload().unwrap(), b"pong");
//! client.release_op(op);
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`]: identifiers, opcodes, and packed wire headers
//! - [`driver`]: the packet-device contract ([`Driver`], [`Packet`],
//!   [`Address`])
//! - [`message`]: [`OutboundMessage`] and [`InboundMessage`] assembly and
//!   grant/retry state
//! - [`sender`]: fragment pacing, grants, resends, acks ([`Sender`])
//! - [`receiver`]: assembly dispatch and the scheduled grant loop
//!   ([`Receiver`])
//! - [`transport`]: the Op coordinator and the [`Transport::poll`] progress
//!   engine
//! - [`udp_driver`] / [`fake_driver`]: ready-made packet devices
//!
//! Progress is made only inside [`Transport::poll`]; the crate spawns no
//! threads and performs no blocking I/O. Any number of application threads
//! may poll and operate on the same transport concurrently.

pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod fake_driver;
pub mod message;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod timing;
pub mod transport;
pub mod udp_driver;

// Re-export main types
pub use config::TransportConfig;
pub use driver::{Address, Driver, Packet, RawAddress, RAW_ADDRESS_SIZE};
pub use error::{Error, Result};
pub use fake_driver::{FakeDriver, FakeNetwork};
pub use message::{InboundMessage, InboundState, OutboundMessage, OutboundState};
pub use protocol::{MessageId, Opcode, OpId, TransportId, DATA_HEADER_SIZE};
pub use receiver::{Receiver, ReceiverApi};
pub use sender::{Sender, SenderApi};
pub use transport::{Op, OpContext, OpState, Transport};
pub use udp_driver::UdpDriver;
