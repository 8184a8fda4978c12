//! Request/response record exchanged with the load generator
//!
//! Six little-endian `u64` words, 48 bytes total. Replies echo the request
//! record, so the same layout serves both directions.
//!
//! ```text
//!  0  id        request id chosen by the client
//!  8  gen_ns    client send timestamp
//! 16  recv_ns   server receive timestamp (filled by the dispatcher side)
//! 24  kind      request type (GET / SCAN for the key-value workload)
//! 32  key       key for GET
//! 40  run_ns    requested service time for synthetic work
//! ```

/// Encoded size of a record
pub const RECORD_SIZE: usize = 48;

/// Point lookup
pub const KIND_GET: u64 = 1;
/// Full ordered iteration
pub const KIND_SCAN: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireRecord {
    pub id: u64,
    pub gen_ns: u64,
    pub recv_ns: u64,
    pub kind: u64,
    pub key: u64,
    pub run_ns: u64,
}

#[inline]
fn word(buf: &[u8], i: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
    u64::from_le_bytes(b)
}

impl WireRecord {
    /// Decode the leading record of `buf`; `None` if it is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_SIZE {
            return None;
        }
        Some(Self {
            id: word(buf, 0),
            gen_ns: word(buf, 1),
            recv_ns: word(buf, 2),
            kind: word(buf, 3),
            key: word(buf, 4),
            run_ns: word(buf, 5),
        })
    }

    /// Encode into the first `RECORD_SIZE` bytes of `out`.
    ///
    /// Returns the number of bytes written, or `None` if `out` is too short.
    pub fn encode_into(&self, out: &mut [u8]) -> Option<usize> {
        let out = out.get_mut(..RECORD_SIZE)?;
        let words = [self.id, self.gen_ns, self.recv_ns, self.kind, self.key, self.run_ns];
        for (chunk, w) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        Some(RECORD_SIZE)
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        // RECORD_SIZE bytes always fit
        let _ = self.encode_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_offsets() {
        let rec = WireRecord { id: 1, gen_ns: 2, recv_ns: 3, kind: KIND_SCAN, key: 5, run_ns: 5000 };
        let bytes = rec.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[24], KIND_SCAN as u8);
        assert_eq!(u64::from_le_bytes(bytes[40..48].try_into().unwrap()), 5000);
        assert_eq!(WireRecord::decode(&bytes), Some(rec));
    }

    #[test]
    fn test_decode_short_buffer() {
        assert_eq!(WireRecord::decode(&[0u8; RECORD_SIZE - 1]), None);
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let rec = WireRecord { run_ns: 9, ..Default::default() };
        let mut buf = rec.to_bytes().to_vec();
        buf.extend_from_slice(b"trailer");
        assert_eq!(WireRecord::decode(&buf), Some(rec));
    }

    #[test]
    fn test_encode_short_buffer() {
        let mut out = [0u8; 16];
        assert_eq!(WireRecord::default().encode_into(&mut out), None);
    }
}
