//! Reply transmission
//!
//! The engine only needs "send these bytes to this tuple", plus two
//! housekeeping hooks the worker calls once per turn. A NIC-backed
//! implementation would recycle completed TX descriptors in `reclaim` and
//! push batched descriptors in `flush`.

use core::fmt;
use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dpworker_core::{EngineError, IpTuple, SpinLock};

use crate::frame::FrameError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    Io(io::ErrorKind),
    /// Transmit queue has no room
    QueueFull,
    /// Transport declined the send
    Refused,
    Frame(FrameError),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Io(kind) => write!(f, "io error: {}", kind),
            NetError::QueueFull => write!(f, "transmit queue full"),
            NetError::Refused => write!(f, "send refused"),
            NetError::Frame(e) => write!(f, "frame error: {}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        NetError::Io(e.kind())
    }
}

impl From<FrameError> for NetError {
    fn from(e: FrameError) -> Self {
        NetError::Frame(e)
    }
}

impl From<NetError> for EngineError {
    fn from(e: NetError) -> Self {
        EngineError::Net(e.to_string())
    }
}

/// Outbound packet path used by jobs to reply.
///
/// `send` is called from job context with preemption masked; it must not
/// block indefinitely.
pub trait Transport: Send + Sync {
    /// Send one UDP payload from `to.src` to `to.dst`
    fn send(&self, payload: &[u8], to: &IpTuple) -> Result<(), NetError>;

    /// Recycle completed transmit resources
    fn reclaim(&self) {}

    /// Push out anything batched by `send`
    fn flush(&self) {}
}

/// One reply captured by [`LoopbackTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReply {
    pub to: IpTuple,
    pub payload: Vec<u8>,
}

/// In-memory transport that records replies
///
/// Bounded: sends beyond `capacity` fail with `QueueFull`. Failures can
/// also be injected with [`fail_next`](Self::fail_next).
pub struct LoopbackTransport {
    sent: SpinLock<Vec<SentReply>>,
    capacity: usize,
    fail_next: AtomicUsize,
    reclaims: AtomicU64,
    flushes: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            sent: SpinLock::new(Vec::with_capacity(capacity)),
            capacity,
            fail_next: AtomicUsize::new(0),
            reclaims: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Make the next `n` sends fail with `Refused`
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Remove and return everything sent so far
    pub fn take_sent(&self) -> Vec<SentReply> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, payload: &[u8], to: &IpTuple) -> Result<(), NetError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(NetError::Refused);
        }

        let mut sent = self.sent.lock();
        if sent.len() >= self.capacity {
            return Err(NetError::QueueFull);
        }
        sent.push(SentReply { to: *to, payload: payload.to_vec() });
        Ok(())
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Replies over a kernel UDP socket
///
/// Stand-in for a NIC queue when running without kernel bypass: the
/// payload goes to `to.dst` from whatever address the socket is bound to.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn bind(addr: SocketAddrV4) -> io::Result<Self> {
        Ok(Self::new(UdpSocket::bind(addr)?))
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8], to: &IpTuple) -> Result<(), NetError> {
        let n = self.socket.send_to(payload, to.dst_addr())?;
        if n != payload.len() {
            return Err(NetError::Io(io::ErrorKind::WriteZero));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn tuple(port: u16) -> IpTuple {
        let lo = u32::from(Ipv4Addr::LOCALHOST);
        IpTuple::new(lo, 9, lo, port)
    }

    #[test]
    fn test_loopback_records_replies() {
        let t = LoopbackTransport::new(4);
        t.send(b"a", &tuple(1)).unwrap();
        t.send(b"b", &tuple(2)).unwrap();
        assert_eq!(t.sent_count(), 2);

        let sent = t.take_sent();
        assert_eq!(sent[1], SentReply { to: tuple(2), payload: b"b".to_vec() });
        assert_eq!(t.sent_count(), 0);
    }

    #[test]
    fn test_loopback_bounded_and_injected_failures() {
        let t = LoopbackTransport::new(1);
        t.fail_next(1);
        assert_eq!(t.send(b"x", &tuple(1)), Err(NetError::Refused));
        t.send(b"y", &tuple(1)).unwrap();
        assert_eq!(t.send(b"z", &tuple(1)), Err(NetError::QueueFull));
    }

    #[test]
    fn test_loopback_housekeeping_counters() {
        let t = LoopbackTransport::new(1);
        t.reclaim();
        t.flush();
        t.flush();
        assert_eq!(t.reclaim_count(), 1);
        assert_eq!(t.flush_count(), 2);
    }

    #[test]
    fn test_udp_transport_delivers() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = rx.local_addr().unwrap().port();

        let tx = UdpTransport::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        tx.send(b"reply", &tuple(port)).unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[test]
    fn test_net_error_into_engine_error() {
        let e: EngineError = NetError::QueueFull.into();
        assert_eq!(e, EngineError::Net("transmit queue full".into()));
    }
}
