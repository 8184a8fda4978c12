//! # dpworker-net
//!
//! The packet edge of the engine: locating a request inside a received
//! Ethernet/IPv4/UDP frame, and sending replies through a [`Transport`].

pub mod frame;
pub mod transport;

pub use frame::{build_udp_frame, extract_request, FrameError, Request};
pub use transport::{LoopbackTransport, NetError, SentReply, Transport, UdpTransport};
