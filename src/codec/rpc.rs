//! Server-facing and client-control binary framed codec (§4.1, §6).
//!
//! Wire format: a 20-byte big-endian header
//! `(major: u16, minor: u16, type: u32, id: u64, payload_len: u32)` followed
//! by `payload_len` bytes. Payload is a sequence of typed elements: `u32`,
//! `u64`, `string` (4-byte length then UTF-8 bytes), `bin` (4-byte length
//! then raw bytes).
//!
//! The decoder is non-blocking over a byte source: `FrameDecoder::feed`
//! accumulates bytes and yields a frame only once a complete one has
//! arrived, so a caller driving it from a socket read loop never blocks
//! mid-message.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CoreError;

pub const HEADER_LEN: usize = 2 + 2 + 4 + 8 + 4;

/// Highest `major` version this decoder accepts. A frame whose header major
/// differs is rejected per §6 ("VersionMismatch").
pub const SUPPORTED_MAJOR: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub major: u16,
    pub minor: u16,
    pub msg_type: u32,
    pub id: u64,
    pub payload_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Encodes a frame into a byte buffer ready to write to a transport.
pub fn encode(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u16(header.major);
    buf.put_u16(header.minor);
    buf.put_u32(header.msg_type);
    buf.put_u64(header.id);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Incremental frame decoder. Feed it bytes as they arrive; it yields
/// complete frames and buffers a partial tail internally. Never buffers
/// more than one in-flight frame per §4.1 contract — a caller should drain
/// `poll` until it returns `None` before feeding more bytes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode one complete frame from the buffered bytes.
    /// Returns `Ok(None)` if more bytes are needed.
    pub fn poll(&mut self) -> Result<Option<Frame>, CoreError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut peek = &self.buf[..HEADER_LEN];
        let major = peek.get_u16();
        let minor = peek.get_u16();
        let msg_type = peek.get_u32();
        let id = peek.get_u64();
        let payload_len = peek.get_u32();

        if major != SUPPORTED_MAJOR {
            return Err(CoreError::Protocol(format!(
                "version mismatch: frame major {major} != supported {SUPPORTED_MAJOR}"
            )));
        }

        let total_len = HEADER_LEN + payload_len as usize;
        if self.buf.len() < total_len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(payload_len as usize).to_vec();

        Ok(Some(Frame {
            header: FrameHeader { major, minor, msg_type, id, payload_len },
            payload,
        }))
    }
}

/// Cursor over a decoded payload, reading the §4.1 element types in order.
/// Errors (`DecodeError` in spec terms) surface as `CoreError::Decode` if
/// any declared length overruns the remaining buffer.
pub struct ElementReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ElementReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        if self.pos + n > self.buf.len() {
            return Err(CoreError::Decode("element overruns payload".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32, CoreError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, CoreError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_string(&mut self) -> Result<String, CoreError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CoreError::Decode(format!("invalid utf8 string element: {e}")))
    }

    pub fn read_bin(&mut self) -> Result<Vec<u8>, CoreError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Builder for a payload, writing the §4.1 element types in order.
#[derive(Debug, Default)]
pub struct ElementWriter {
    buf: Vec<u8>,
}

impl ElementWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn write_bin(&mut self, b: &[u8]) -> &mut Self {
        self.write_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
        self
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_header_and_elements() {
        let mut w = ElementWriter::new();
        w.write_u32(7).write_string("hello").write_bin(&[1, 2, 3]);
        let payload = w.into_vec();

        let header = FrameHeader { major: 1, minor: 2, msg_type: 9, id: 42, payload_len: payload.len() as u32 };
        let bytes = encode(&header, &payload);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let frame = decoder.poll().unwrap().unwrap();
        assert_eq!(frame.header, header);

        let mut r = ElementReader::new(&frame.payload);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_string().unwrap(), "hello");
        assert_eq!(r.read_bin().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn partial_feed_waits_for_more_bytes() {
        let header = FrameHeader { major: 1, minor: 0, msg_type: 1, id: 1, payload_len: 4 };
        let bytes = encode(&header, &[1, 2, 3, 4]);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes[..10]);
        assert!(decoder.poll().unwrap().is_none());

        decoder.feed(&bytes[10..]);
        assert!(decoder.poll().unwrap().is_some());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let header = FrameHeader { major: 2, minor: 0, msg_type: 1, id: 1, payload_len: 0 };
        let bytes = encode(&header, &[]);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        assert!(decoder.poll().is_err());
    }

    #[test]
    fn overrunning_string_length_is_decode_error() {
        let mut r = ElementReader::new(&[0, 0, 0, 100, b'h', b'i']);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn decoder_buffers_two_frames_and_yields_them_in_order() {
        let h1 = FrameHeader { major: 1, minor: 0, msg_type: 1, id: 1, payload_len: 0 };
        let h2 = FrameHeader { major: 1, minor: 0, msg_type: 2, id: 2, payload_len: 0 };
        let mut bytes = encode(&h1, &[]);
        bytes.extend(encode(&h2, &[]));

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let first = decoder.poll().unwrap().unwrap();
        let second = decoder.poll().unwrap().unwrap();
        assert_eq!(first.header.id, 1);
        assert_eq!(second.header.id, 2);
    }
}
