//! RFC 6455 frame codec
//!
//! Reads and writes WebSocket frames directly on a raw byte stream: after
//! the extended CONNECT handshake, the HTTP/3 request stream body carries
//! plain RFC 6455 frames. The codec itself only performs byte operations;
//! asynchrony lives in the `AsyncRead`/`AsyncWrite` it is handed.
//!
//! Reserved bits (RSV1-3) are ignored: extensions and compression are not
//! negotiated by the proxy.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CloseReason, Error, Result};
use crate::metrics;

/// Maximum control frame payload (RFC 6455 §5.5)
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest payload encodable with a 7-bit length field
pub const SMALL_PAYLOAD_MAX: usize = 125;

/// Largest payload encodable with a 16-bit length field
pub const MEDIUM_PAYLOAD_MAX: usize = 65535;

/// Maximum frame header size (2 + 8 + 4 bytes)
pub const MAX_HEADER_SIZE: usize = 14;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from byte; `None` for reserved opcodes.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// One frame decoded from the wire
///
/// The opcode is kept as the raw low nibble of the first header byte so
/// frames with reserved opcodes survive decoding; dispatch decides whether
/// to ignore them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Raw opcode nibble
    pub opcode: u8,
    /// Whether the payload arrived masked
    pub masked: bool,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

/// XOR `data` in place with the 4-byte masking key.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i & 3];
    }
}

/// Read one frame from `r`.
///
/// When `max_payload` is non-zero, a frame whose declared payload exceeds it
/// fails with [`Error::FrameTooLarge`] before any payload byte is read; the
/// stream is left mid-frame and the session must be torn down.
pub async fn read_frame<R>(r: &mut R, max_payload: u64) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 2];
    r.read_exact(&mut hdr).await?;

    let fin = hdr[0] & 0x80 != 0;
    let opcode = hdr[0] & 0x0F;
    let masked = hdr[1] & 0x80 != 0;

    let mut len = u64::from(hdr[1] & 0x7F);
    if len == 126 {
        let mut ext = [0u8; 2];
        r.read_exact(&mut ext).await?;
        len = u64::from(u16::from_be_bytes(ext));
    } else if len == 127 {
        let mut ext = [0u8; 8];
        r.read_exact(&mut ext).await?;
        len = u64::from_be_bytes(ext);
        if len > i64::MAX as u64 {
            return Err(Error::InvalidFrame("payload length exceeds signed range"));
        }
    }

    if max_payload > 0 && len > max_payload {
        metrics::oversize_drop("frame");
        return Err(Error::FrameTooLarge);
    }

    let mut mask = [0u8; 4];
    if masked {
        r.read_exact(&mut mask).await?;
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    if masked {
        apply_mask(&mut payload, mask);
    }

    Ok(Frame {
        fin,
        opcode,
        masked,
        payload: payload.into(),
    })
}

/// Encode one frame into `buf`.
///
/// When a mask is given, the payload is copied and masked in the output
/// buffer; the caller's payload is never mutated.
pub fn encode_frame(buf: &mut BytesMut, opcode: u8, payload: &[u8], fin: bool, mask: Option<[u8; 4]>) {
    buf.reserve(MAX_HEADER_SIZE + payload.len());

    let mut b0 = opcode & 0x0F;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len <= SMALL_PAYLOAD_MAX {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= MEDIUM_PAYLOAD_MAX {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}

/// Encode and write one frame. A masked write draws a fresh random key.
async fn write_frame<W>(w: &mut W, opcode: u8, payload: &[u8], masked: bool, fin: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mask = if masked {
        Some(rand::random::<[u8; 4]>())
    } else {
        None
    };
    let mut buf = BytesMut::with_capacity(MAX_HEADER_SIZE + payload.len());
    encode_frame(&mut buf, opcode, payload, fin, mask);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Write a data frame, fragmenting when the payload exceeds `max_frame_size`.
///
/// The first fragment carries `opcode`, subsequent fragments are
/// continuations, and only the last carries `fin`. Every chunk except the
/// last is exactly `max_frame_size` bytes. `max_frame_size == 0` disables
/// fragmentation.
pub async fn write_data_frame<W>(
    w: &mut W,
    opcode: u8,
    payload: &[u8],
    masked: bool,
    max_frame_size: u64,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if max_frame_size == 0 || payload.len() as u64 <= max_frame_size {
        return write_frame(w, opcode, payload, masked, true).await;
    }

    let chunk = max_frame_size as usize;
    let mut rest = payload;
    let mut op = opcode;
    while rest.len() > chunk {
        let (head, tail) = rest.split_at(chunk);
        write_frame(w, op, head, masked, false).await?;
        op = OpCode::Continuation as u8;
        rest = tail;
    }
    write_frame(w, op, rest, masked, true).await
}

/// Write a control frame, truncating the payload to 125 bytes.
pub async fn write_control_frame<W>(w: &mut W, opcode: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = &payload[..payload.len().min(MAX_CONTROL_PAYLOAD)];
    write_frame(w, opcode, payload, false, true).await
}

/// Write a close frame: big-endian code followed by the UTF-8 reason,
/// truncated to the control frame limit.
pub async fn write_close_frame<W>(w: &mut W, code: u16, reason: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    payload.truncate(MAX_CONTROL_PAYLOAD);
    write_frame(w, OpCode::Close as u8, &payload, false, true).await
}

/// Parse a close frame payload into (code, reason).
///
/// A payload shorter than two bytes means "no status": (1000, "").
pub fn parse_close(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (CloseReason::NORMAL, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    (code, String::from_utf8_lossy(&payload[2..]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(data: &[u8], max_payload: u64) -> Result<Frame> {
        let mut cursor = data;
        read_frame(&mut cursor, max_payload).await
    }

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), None);
    }

    #[tokio::test]
    async fn test_decode_small_unmasked() {
        let frame = decode(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'], 0)
            .await
            .unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text as u8);
        assert!(!frame.masked);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_decode_masked() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut payload = *b"Hello";
        apply_mask(&mut payload, mask);

        let mut data = vec![0x81, 0x85];
        data.extend_from_slice(&mask);
        data.extend_from_slice(&payload);

        let frame = decode(&data, 0).await.unwrap();
        assert!(frame.masked);
        assert_eq!(frame.payload.as_ref(), b"Hello");
    }

    #[tokio::test]
    async fn test_length_field_boundaries() {
        for (len, marker, header_len) in [
            (125usize, 125u8, 2usize),
            (126, 126, 4),
            (65535, 126, 4),
            (65536, 127, 10),
        ] {
            let payload = vec![0x42u8; len];
            let mut buf = BytesMut::new();
            encode_frame(&mut buf, OpCode::Binary as u8, &payload, true, None);
            assert_eq!(buf[1] & 0x7F, marker, "len={len}");
            assert_eq!(buf.len(), header_len + len, "len={len}");

            let frame = decode(&buf, 0).await.unwrap();
            assert_eq!(frame.payload.len(), len);
        }
    }

    #[tokio::test]
    async fn test_round_trip_masked() {
        let mut out = Vec::new();
        write_data_frame(&mut out, OpCode::Text as u8, b"round trip", true, 0)
            .await
            .unwrap();

        let frame = decode(&out, 0).await.unwrap();
        assert!(frame.fin);
        assert!(frame.masked);
        assert_eq!(frame.opcode, OpCode::Text as u8);
        assert_eq!(frame.payload.as_ref(), b"round trip");
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let mut out = Vec::new();
        write_data_frame(&mut out, OpCode::Binary as u8, &[0u8; 10], false, 0)
            .await
            .unwrap();

        let err = decode(&out, 5).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge));
    }

    #[tokio::test]
    async fn test_truncated_frame_fails() {
        let err = decode(&[0x82, 0x05, 0x01, 0x02], 0).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_fragmentation_pattern() {
        let mut out = Vec::new();
        write_data_frame(&mut out, OpCode::Binary as u8, &[0xAB; 10], false, 3)
            .await
            .unwrap();

        let mut cursor = &out[..];
        let mut frames = Vec::new();
        for _ in 0..4 {
            frames.push(read_frame(&mut cursor, 0).await.unwrap());
        }
        assert!(cursor.is_empty());

        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);

        let opcodes: Vec<u8> = frames.iter().map(|f| f.opcode).collect();
        assert_eq!(opcodes, vec![0x2, 0x0, 0x0, 0x0]);

        let fins: Vec<bool> = frames.iter().map(|f| f.fin).collect();
        assert_eq!(fins, vec![false, false, false, true]);
    }

    #[tokio::test]
    async fn test_control_frame_truncated() {
        let mut out = Vec::new();
        write_control_frame(&mut out, OpCode::Ping as u8, &[0x11; 200])
            .await
            .unwrap();

        let frame = decode(&out, 0).await.unwrap();
        assert_eq!(frame.opcode, OpCode::Ping as u8);
        assert_eq!(frame.payload.len(), MAX_CONTROL_PAYLOAD);
        assert!(frame.fin);
    }

    #[tokio::test]
    async fn test_close_frame_round_trip() {
        let mut out = Vec::new();
        write_close_frame(&mut out, 1001, "going away").await.unwrap();

        let frame = decode(&out, 0).await.unwrap();
        assert_eq!(frame.opcode, OpCode::Close as u8);
        let (code, reason) = parse_close(&frame.payload);
        assert_eq!(code, 1001);
        assert_eq!(reason, "going away");
    }

    #[tokio::test]
    async fn test_close_frame_long_reason_truncated() {
        let reason = "x".repeat(200);
        let mut out = Vec::new();
        write_close_frame(&mut out, 1000, &reason).await.unwrap();

        let frame = decode(&out, 0).await.unwrap();
        assert_eq!(frame.payload.len(), MAX_CONTROL_PAYLOAD);
    }

    #[test]
    fn test_parse_close_no_status() {
        assert_eq!(parse_close(&[]), (1000, String::new()));
        assert_eq!(parse_close(&[0x03]), (1000, String::new()));
        assert_eq!(parse_close(&[0x03, 0xE9]), (1001, String::new()));
    }
}
