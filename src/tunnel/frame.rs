//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format (all multi-byte integers big-endian):
//! ```text
//! +--------+--------+--------+--------+
//! |     Magic (2B)  | Ver    | Proto  |
//! +--------+--------+--------+--------+
//! | Flags  | ExtraL |    Seq (4B)     |
//! +--------+--------+--------+--------+
//! |       Seq cont. |   FragId (2B)   |
//! +--------+--------+--------+--------+
//! |  FragTotal (2B) |  GroupId (4B)   |
//! +--------+--------+--------+--------+
//! |  GroupId cont.  |  RealLen (2B)   |
//! +--------+--------+--------+--------+
//! | PayloadLen (2B) |  Extra header.. |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! The payload region is `payload_len` bytes; only the first `real_len`
//! carry application data, the rest is padding.

use super::{flags, TunnelError, PROTO_ID_SPACE};
use crate::{MAGIC, MAX_FRAME_SIZE, WIRE_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 22;

/// Maximum payload size, leaving room for the header and a full extra region
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE - u8::MAX as usize;

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Profile template id, range [0, 3)
    pub proto_id: u8,
    /// Flag bitfield, see [`super::flags`]
    pub flags: u8,
    /// Per-sender monotone sequence number
    pub seq: u32,
    /// Index within the fragment group
    pub frag_id: u16,
    /// Fragment count of the group, 1 = unfragmented
    pub frag_total: u16,
    /// Identifier shared by fragments of one logical message
    pub group_id: u32,
    /// True payload bytes; the rest of `payload` is padding
    pub real_len: u16,
    /// Profile-specific filler bytes
    pub extra_header: Bytes,
    /// Payload region, `real_len` data bytes followed by padding
    pub payload: Bytes,
}

/// Summary of a frame observed in a byte stream without consuming it
#[derive(Debug, Clone, Copy)]
pub struct FrameSummary {
    pub proto_id: u8,
    pub flags: u8,
    pub seq: u32,
    pub frag_id: u16,
    pub frag_total: u16,
    pub group_id: u32,
    pub extra_len: u8,
    pub payload_len: u16,
    /// Total on-the-wire length of the frame
    pub wire_len: usize,
}

/// Result of peeking at the head of a receive buffer
#[derive(Debug)]
pub enum Peek {
    /// Not enough bytes buffered yet
    NeedMore,
    /// A complete frame of `wire_len` bytes starts at offset 0
    Frame(FrameSummary),
    /// The first `skip` bytes are not a decodable frame
    Junk { skip: usize },
}

impl Frame {
    /// Create a data frame; `payload` holds `real_len` application bytes
    /// followed by padding.
    pub fn data(seq: u32, group_id: u32, frag_id: u16, frag_total: u16, payload: Bytes, real_len: u16) -> Self {
        let frag_flag = if frag_total > 1 { flags::FRAG } else { 0 };
        Self {
            proto_id: 0,
            flags: frag_flag,
            seq,
            frag_id,
            frag_total,
            group_id,
            real_len,
            extra_header: Bytes::new(),
            payload,
        }
    }

    /// Create an ACK frame carrying the acknowledged seq as payload.
    pub fn ack(seq: u32, acked: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(acked);
        Self {
            proto_id: 0,
            flags: flags::ACK,
            seq,
            frag_id: 0,
            frag_total: 1,
            group_id: 0,
            real_len: 4,
            extra_header: Bytes::new(),
            payload: payload.freeze(),
        }
    }

    /// Create a padding-only frame.
    pub fn padding(seq: u32, payload: Bytes) -> Self {
        Self {
            proto_id: 0,
            flags: flags::PAD,
            seq,
            frag_id: 0,
            frag_total: 1,
            group_id: 0,
            real_len: 0,
            extra_header: Bytes::new(),
            payload,
        }
    }

    /// Create a handshake decoy frame.
    pub fn handshake(seq: u32, payload: Bytes) -> Self {
        let real_len = payload.len() as u16;
        Self {
            proto_id: 0,
            flags: flags::HANDSHAKE,
            seq,
            frag_id: 0,
            frag_total: 1,
            group_id: 0,
            real_len,
            extra_header: Bytes::new(),
            payload,
        }
    }

    /// Application bytes, padding stripped.
    pub fn real_payload(&self) -> &[u8] {
        &self.payload[..self.real_len as usize]
    }

    /// Number of padding bytes in the payload region.
    pub fn padding_len(&self) -> usize {
        self.payload.len() - self.real_len as usize
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    pub fn is_decoy(&self) -> bool {
        self.flags & (flags::PAD | flags::HANDSHAKE) != 0
    }

    /// The seq acknowledged by this frame, if it is a well-formed ACK.
    pub fn acked_seq(&self) -> Option<u32> {
        if !self.is_ack() || self.payload.len() < 4 {
            return None;
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.payload[..4]);
        Some(u32::from_be_bytes(b))
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.extra_header.len() + self.payload.len()
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(self.payload.len(), MAX_PAYLOAD_SIZE));
        }
        if self.extra_header.len() > u8::MAX as usize {
            return Err(TunnelError::FrameTooLarge(self.extra_header.len(), u8::MAX as usize));
        }
        if (self.real_len as usize) > self.payload.len() {
            return Err(TunnelError::Malformed(format!(
                "real_len {} exceeds payload {}",
                self.real_len,
                self.payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&MAGIC);
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.proto_id);
        buf.put_u8(self.flags);
        buf.put_u8(self.extra_header.len() as u8);
        buf.put_u32(self.seq);
        buf.put_u16(self.frag_id);
        buf.put_u16(self.frag_total);
        buf.put_u32(self.group_id);
        buf.put_u16(self.real_len);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.extra_header);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Peek at the head of `buf` without consuming bytes.
    ///
    /// Never fails: undecodable bytes are reported as [`Peek::Junk`] so that
    /// transparent forwarders can pass them through unaltered.
    pub fn peek(buf: &[u8]) -> Peek {
        if buf.len() < FRAME_HEADER_SIZE {
            // A short buffer that cannot start a frame is junk right away
            if !buf.is_empty() && buf[0] != MAGIC[0] {
                return Peek::Junk { skip: junk_len(buf) };
            }
            return Peek::NeedMore;
        }
        if buf[0] != MAGIC[0] || buf[1] != MAGIC[1] || buf[2] != WIRE_VERSION {
            return Peek::Junk { skip: junk_len(buf) };
        }
        let extra_len = buf[5];
        let payload_len = u16::from_be_bytes([buf[20], buf[21]]);
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            // Declared length is untrustworthy, resync on the next magic
            return Peek::Junk { skip: junk_len(buf) };
        }
        let wire_len = FRAME_HEADER_SIZE + extra_len as usize + payload_len as usize;
        if buf.len() < wire_len {
            return Peek::NeedMore;
        }
        Peek::Frame(FrameSummary {
            proto_id: buf[3],
            flags: buf[4],
            seq: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            frag_id: u16::from_be_bytes([buf[10], buf[11]]),
            frag_total: u16::from_be_bytes([buf[12], buf[13]]),
            group_id: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
            extra_len,
            payload_len,
            wire_len,
        })
    }

    /// Decode one frame from the receive buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. On a malformed region
    /// the buffer is advanced past it (resynchronizing on the next magic)
    /// and `Malformed` is returned; the caller counts offenses and may keep
    /// reading.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        let summary = match Self::peek(buf) {
            Peek::NeedMore => return Ok(None),
            Peek::Junk { skip } => {
                buf.advance(skip);
                return Err(TunnelError::Malformed(format!(
                    "bad magic or length, skipped {skip} bytes"
                )));
            }
            Peek::Frame(s) => s,
        };

        // Structural checks on a fully buffered frame: consume it either way.
        if summary.proto_id >= PROTO_ID_SPACE {
            buf.advance(summary.wire_len);
            return Err(TunnelError::Malformed(format!(
                "unknown profile id {}",
                summary.proto_id
            )));
        }
        if summary.frag_total == 0 || summary.frag_id >= summary.frag_total {
            buf.advance(summary.wire_len);
            return Err(TunnelError::Malformed(format!(
                "frag_id {} out of range for frag_total {}",
                summary.frag_id, summary.frag_total
            )));
        }
        let real_len = u16::from_be_bytes([buf[18], buf[19]]);
        if real_len > summary.payload_len {
            buf.advance(summary.wire_len);
            return Err(TunnelError::Malformed(format!(
                "real_len {} exceeds payload_len {}",
                real_len, summary.payload_len
            )));
        }

        buf.advance(FRAME_HEADER_SIZE);
        let extra_header = buf.split_to(summary.extra_len as usize).freeze();
        let payload = buf.split_to(summary.payload_len as usize).freeze();

        Ok(Some(Self {
            proto_id: summary.proto_id,
            flags: summary.flags,
            seq: summary.seq,
            frag_id: summary.frag_id,
            frag_total: summary.frag_total,
            group_id: summary.group_id,
            real_len,
            extra_header,
            payload,
        }))
    }
}

/// Length of the junk prefix: everything up to the next candidate magic.
fn junk_len(buf: &[u8]) -> usize {
    for i in 1..buf.len() {
        if buf[i] == MAGIC[0] && (i + 1 == buf.len() || buf[i + 1] == MAGIC[1]) {
            return i;
        }
    }
    buf.len()
}

/// Read one frame from an async stream, buffering in `buf`.
///
/// Returns `Ok(None)` on clean EOF. Malformed regions surface as errors with
/// the buffer already resynchronized, so the caller can count and continue.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<Frame>, TunnelError> {
    loop {
        match Frame::decode(buf) {
            Ok(Some(frame)) => return Ok(Some(frame)),
            Ok(None) => {}
            Err(e) => return Err(e),
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(TunnelError::Malformed("truncated frame at EOF".into()));
        }
    }
}

/// Encode and write one frame to an async stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), TunnelError> {
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame {
            proto_id: 1,
            flags: flags::FRAG,
            seq: 7,
            frag_id: 2,
            frag_total: 5,
            group_id: 0xDEAD_BEEF,
            real_len: 5,
            extra_header: Bytes::from_static(&[0xAA; 6]),
            payload: Bytes::from_static(b"hello\0\0\0"),
        }
    }

    #[test]
    fn roundtrip() {
        let original = sample_frame();
        let mut encoded = original.encode().unwrap();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(encoded.is_empty());
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frame = Frame::data(1, 1, 0, 1, Bytes::new(), 0);
        let mut encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 0);
        assert_eq!(decoded.real_len, 0);
    }

    #[test]
    fn partial_header_needs_more() {
        let frame = sample_frame();
        let encoded = frame.encode().unwrap();
        let mut partial = BytesMut::from(&encoded[..10]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn partial_payload_needs_more() {
        let frame = sample_frame();
        let encoded = frame.encode().unwrap();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn bad_magic_resyncs_to_next_frame() {
        let mut wire = sample_frame().encode().unwrap();
        wire[0] ^= 0xFF;
        let good = sample_frame().encode().unwrap();
        wire.extend_from_slice(&good);

        // First decode reports the corrupted region
        assert!(matches!(
            Frame::decode(&mut wire),
            Err(TunnelError::Malformed(_))
        ));
        // Second decode recovers the intact frame
        let decoded = Frame::decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, sample_frame());
    }

    #[test]
    fn frag_id_out_of_range_rejected() {
        let mut frame = sample_frame();
        frame.frag_id = 5;
        frame.frag_total = 5;
        let mut encoded = frame.encode().unwrap();
        assert!(matches!(
            Frame::decode(&mut encoded),
            Err(TunnelError::Malformed(_))
        ));
        // The bad frame was consumed entirely
        assert!(encoded.is_empty());
    }

    #[test]
    fn unknown_profile_id_rejected() {
        let mut frame = sample_frame();
        frame.proto_id = PROTO_ID_SPACE;
        let mut encoded = frame.encode().unwrap();
        assert!(matches!(
            Frame::decode(&mut encoded),
            Err(TunnelError::Malformed(_))
        ));
        assert!(encoded.is_empty());
    }

    #[test]
    fn max_payload_boundary() {
        let payload = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE]);
        let frame = Frame::data(1, 1, 0, 1, payload, MAX_PAYLOAD_SIZE as u16);
        let mut encoded = frame.encode().unwrap();
        assert!(Frame::decode(&mut encoded).unwrap().is_some());

        let oversize = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let frame = Frame::data(1, 1, 0, 1, oversize, 0);
        assert!(matches!(
            frame.encode(),
            Err(TunnelError::FrameTooLarge(_, _))
        ));
    }

    #[test]
    fn oversize_declared_length_is_junk() {
        let frame = sample_frame();
        let mut encoded = frame.encode().unwrap();
        // Corrupt payload_len to exceed the cap
        encoded[20] = 0xFF;
        encoded[21] = 0xFF;
        assert!(matches!(
            Frame::decode(&mut encoded),
            Err(TunnelError::Malformed(_))
        ));
    }

    #[test]
    fn ack_payload_roundtrip() {
        let ack = Frame::ack(12, 99);
        assert_eq!(ack.acked_seq(), Some(99));
        let mut encoded = ack.encode().unwrap();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.acked_seq(), Some(99));
    }

    #[test]
    fn peek_reports_summary_without_consuming() {
        let frame = sample_frame();
        let encoded = frame.encode().unwrap();
        match Frame::peek(&encoded) {
            Peek::Frame(summary) => {
                assert_eq!(summary.proto_id, frame.proto_id);
                assert_eq!(summary.wire_len, encoded.len());
                assert_eq!(summary.payload_len as usize, frame.payload.len());
            }
            other => panic!("unexpected peek: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_write_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = sample_frame();
        write_frame(&mut a, &frame).await.unwrap();
        drop(a);

        let mut buf = BytesMut::new();
        let decoded = read_frame(&mut b, &mut buf).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(read_frame(&mut b, &mut buf).await.unwrap().is_none());
    }
}
