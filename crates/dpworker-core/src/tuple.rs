//! Connection 4-tuple

use core::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Addresses of one UDP exchange, host byte order.
///
/// `src` is the peer that sent the request, `dst` is us. Replies go out on
/// [`IpTuple::reversed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IpTuple {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

impl IpTuple {
    pub const fn new(src_ip: u32, src_port: u16, dst_ip: u32, dst_port: u16) -> Self {
        Self { src_ip, dst_ip, src_port, dst_port }
    }

    /// Build from socket addresses
    pub fn from_addrs(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(u32::from(*src.ip()), src.port(), u32::from(*dst.ip()), dst.port())
    }

    /// Same exchange seen from the other end
    #[inline]
    pub const fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    pub fn src_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.src_ip), self.src_port)
    }

    pub fn dst_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.dst_ip), self.dst_port)
    }
}

impl fmt::Display for IpTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src_addr(), self.dst_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversed_swaps_both_ends() {
        let a = u32::from(Ipv4Addr::new(10, 0, 0, 1));
        let b = u32::from(Ipv4Addr::new(10, 0, 0, 2));
        let t = IpTuple::new(a, 1000, b, 2000);

        let r = t.reversed();
        assert_eq!(r, IpTuple::new(b, 2000, a, 1000));
        assert_eq!(r.reversed(), t);
    }

    #[test]
    fn test_display() {
        let t = IpTuple::from_addrs(
            "192.168.1.5:4000".parse().unwrap(),
            "192.168.1.9:8080".parse().unwrap(),
        );
        assert_eq!(t.to_string(), "192.168.1.5:4000 -> 192.168.1.9:8080");
    }
}
