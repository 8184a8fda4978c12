//! Ethernet / IPv4 / UDP framing
//!
//! Parsing is bounds-checked against the received length at every header;
//! a frame that claims more bytes than it carries is reported, never read
//! past.

use core::fmt;
use core::ops::Range;

use dpworker_core::IpTuple;

pub const ETH_HDR_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPV4_MIN_HDR_LEN: usize = 20;
pub const IPPROTO_UDP: u8 = 17;
pub const UDP_HDR_LEN: usize = 8;

/// Header bytes in front of the payload for a frame without IP options
pub const HEADERS_LEN: usize = ETH_HDR_LEN + IPV4_MIN_HDR_LEN + UDP_HDR_LEN;

/// Largest UDP payload an IPv4 datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65_535 - IPV4_MIN_HDR_LEN - UDP_HDR_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A header or the declared UDP length runs past the frame
    Truncated { need: usize, have: usize },
    NotIpv4(u16),
    NotUdp(u8),
    BadHeader(&'static str),
    /// Output buffer or payload too large when building
    TooLarge { len: usize, cap: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated { need, have } => {
                write!(f, "frame truncated: need {} bytes, have {}", need, have)
            }
            FrameError::NotIpv4(ethertype) => write!(f, "not IPv4 (ethertype {:#06x})", ethertype),
            FrameError::NotUdp(proto) => write!(f, "not UDP (protocol {})", proto),
            FrameError::BadHeader(what) => write!(f, "bad header: {}", what),
            FrameError::TooLarge { len, cap } => write!(f, "{} bytes exceed {}", len, cap),
        }
    }
}

impl std::error::Error for FrameError {}

/// Where a request lives inside its frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Peer is `src`, we are `dst`
    pub tuple: IpTuple,
    /// UDP payload byte range within the frame
    pub payload: Range<usize>,
}

#[inline]
fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

#[inline]
fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[inline]
fn need(frame: &[u8], end: usize) -> Result<(), FrameError> {
    if end > frame.len() {
        return Err(FrameError::Truncated { need: end, have: frame.len() });
    }
    Ok(())
}

/// Locate the UDP payload and connection tuple of a received frame.
///
/// Addresses and ports come back in host byte order.
pub fn extract_request(frame: &[u8]) -> Result<Request, FrameError> {
    need(frame, ETH_HDR_LEN)?;
    let ethertype = be16(frame, 12);
    if ethertype != ETHERTYPE_IPV4 {
        return Err(FrameError::NotIpv4(ethertype));
    }

    let ip = ETH_HDR_LEN;
    need(frame, ip + IPV4_MIN_HDR_LEN)?;
    if frame[ip] >> 4 != 4 {
        return Err(FrameError::BadHeader("ip version"));
    }
    let ihl = (frame[ip] & 0x0f) as usize * 4;
    if ihl < IPV4_MIN_HDR_LEN {
        return Err(FrameError::BadHeader("ip header length"));
    }
    need(frame, ip + ihl)?;
    let proto = frame[ip + 9];
    if proto != IPPROTO_UDP {
        return Err(FrameError::NotUdp(proto));
    }
    let src_ip = be32(frame, ip + 12);
    let dst_ip = be32(frame, ip + 16);

    let udp = ip + ihl;
    need(frame, udp + UDP_HDR_LEN)?;
    let src_port = be16(frame, udp);
    let dst_port = be16(frame, udp + 2);
    let udp_len = be16(frame, udp + 4) as usize;
    if udp_len < UDP_HDR_LEN {
        return Err(FrameError::BadHeader("udp length"));
    }
    need(frame, udp + udp_len)?;

    Ok(Request {
        tuple: IpTuple::new(src_ip, src_port, dst_ip, dst_port),
        payload: udp + UDP_HDR_LEN..udp + udp_len,
    })
}

/// RFC 1071 ones-complement sum over an IPv4 header
fn ipv4_checksum(hdr: &[u8]) -> u16 {
    let mut sum: u32 = hdr
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Write an Ethernet/IPv4/UDP frame carrying `payload` from `tuple.src` to
/// `tuple.dst` into `out`. MAC addresses are zero; UDP checksum is left
/// unset. Returns the frame length.
pub fn build_udp_frame(tuple: &IpTuple, payload: &[u8], out: &mut [u8]) -> Result<usize, FrameError> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return Err(FrameError::TooLarge { len: payload.len(), cap: MAX_UDP_PAYLOAD });
    }
    let total = HEADERS_LEN + payload.len();
    if total > out.len() {
        return Err(FrameError::TooLarge { len: total, cap: out.len() });
    }
    let out = &mut out[..total];
    out[..12].fill(0);
    out[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip = ETH_HDR_LEN;
    let ip_len = (IPV4_MIN_HDR_LEN + UDP_HDR_LEN + payload.len()) as u16;
    let hdr = &mut out[ip..ip + IPV4_MIN_HDR_LEN];
    hdr[0] = 0x45;
    hdr[1] = 0;
    hdr[2..4].copy_from_slice(&ip_len.to_be_bytes());
    hdr[4..6].fill(0);
    hdr[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    hdr[8] = 64;
    hdr[9] = IPPROTO_UDP;
    hdr[10..12].fill(0);
    hdr[12..16].copy_from_slice(&tuple.src_ip.to_be_bytes());
    hdr[16..20].copy_from_slice(&tuple.dst_ip.to_be_bytes());
    let csum = ipv4_checksum(hdr);
    hdr[10..12].copy_from_slice(&csum.to_be_bytes());

    let udp = ip + IPV4_MIN_HDR_LEN;
    let udp_len = (UDP_HDR_LEN + payload.len()) as u16;
    out[udp..udp + 2].copy_from_slice(&tuple.src_port.to_be_bytes());
    out[udp + 2..udp + 4].copy_from_slice(&tuple.dst_port.to_be_bytes());
    out[udp + 4..udp + 6].copy_from_slice(&udp_len.to_be_bytes());
    out[udp + 6..udp + 8].fill(0);
    out[udp + UDP_HDR_LEN..].copy_from_slice(payload);

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tuple() -> IpTuple {
        IpTuple::new(
            u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            1000,
            u32::from(Ipv4Addr::new(10, 0, 0, 2)),
            2000,
        )
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; HEADERS_LEN + payload.len()];
        let n = build_udp_frame(&tuple(), payload, &mut out).unwrap();
        out.truncate(n);
        out
    }

    #[test]
    fn test_extract_payload_and_tuple() {
        let f = frame(b"ping");
        let req = extract_request(&f).unwrap();
        assert_eq!(req.tuple, tuple());
        assert_eq!(&f[req.payload], b"ping");
    }

    #[test]
    fn test_checksum_verifies() {
        let f = frame(b"x");
        // Sum over a header with a correct checksum folds to zero
        assert_eq!(ipv4_checksum(&f[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_MIN_HDR_LEN]), 0);
    }

    #[test]
    fn test_declared_length_past_end() {
        let mut f = frame(b"0123456789");
        let udp_len_at = ETH_HDR_LEN + IPV4_MIN_HDR_LEN + 4;
        f[udp_len_at..udp_len_at + 2].copy_from_slice(&200u16.to_be_bytes());
        assert!(matches!(extract_request(&f), Err(FrameError::Truncated { .. })));
    }

    #[test]
    fn test_every_prefix_is_safe() {
        let f = frame(b"payload");
        for n in 0..f.len() {
            assert!(extract_request(&f[..n]).is_err(), "prefix {} parsed", n);
        }
        assert!(extract_request(&f).is_ok());
    }

    #[test]
    fn test_ip_options_honoured() {
        let base = frame(b"opt");
        let mut f = Vec::new();
        f.extend_from_slice(&base[..ETH_HDR_LEN]);
        f.push(0x46); // IHL = 6 words
        f.extend_from_slice(&base[ETH_HDR_LEN + 1..ETH_HDR_LEN + IPV4_MIN_HDR_LEN]);
        f.extend_from_slice(&[1, 1, 1, 1]); // NOP options
        f.extend_from_slice(&base[ETH_HDR_LEN + IPV4_MIN_HDR_LEN..]);

        let req = extract_request(&f).unwrap();
        assert_eq!(&f[req.payload], b"opt");
    }

    #[test]
    fn test_rejects_non_udp() {
        let mut f = frame(b"tcp?");
        f[ETH_HDR_LEN + 9] = 6;
        assert_eq!(extract_request(&f), Err(FrameError::NotUdp(6)));

        let mut f = frame(b"arp?");
        f[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(extract_request(&f), Err(FrameError::NotIpv4(0x0806)));
    }

    #[test]
    fn test_build_into_short_buffer() {
        let mut out = [0u8; HEADERS_LEN + 3];
        assert!(matches!(
            build_udp_frame(&tuple(), b"four", &mut out),
            Err(FrameError::TooLarge { .. })
        ));
    }
}
