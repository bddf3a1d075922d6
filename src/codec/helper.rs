//! ASCII-tagged codec for the crypto-helper sub-process (§4.1, §6, §9).
//!
//! Each element on the wire is one of three shapes:
//!   - `INS<hex8>` — a 32-bit instruction code, hex-encoded.
//!   - `INT<decimal>>` — an unsigned integer terminated by `>`.
//!   - `STR<decimal>><bytes>` — a length-prefixed binary blob.
//!
//! `HelperDecoder` is a byte-at-a-time state machine: feed it bytes as they
//! arrive and it yields one `HelperElement` per completed record, never
//! blocking on a partial tag or length.
//!
//! Structured commands serialize themselves onto the wire by implementing
//! `HelperEncode`, walking their fields explicitly rather than through
//! runtime reflection (§9 REDESIGN FLAGS).

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperElement {
    Ins(u32),
    Int(u64),
    Str(Vec<u8>),
}

/// Fields a structured helper command walks to serialize itself, in place
/// of the original implementation's reflection-based field walk.
pub trait HelperEncode {
    fn encode(&self, out: &mut Vec<HelperElement>);
}

impl HelperEncode for u32 {
    fn encode(&self, out: &mut Vec<HelperElement>) {
        out.push(HelperElement::Int(*self as u64));
    }
}

impl HelperEncode for u64 {
    fn encode(&self, out: &mut Vec<HelperElement>) {
        out.push(HelperElement::Int(*self));
    }
}

impl HelperEncode for Vec<u8> {
    fn encode(&self, out: &mut Vec<HelperElement>) {
        out.push(HelperElement::Str(self.clone()));
    }
}

impl<T: HelperEncode> HelperEncode for Vec<T> {
    fn encode(&self, out: &mut Vec<HelperElement>) {
        out.push(HelperElement::Int(self.len() as u64));
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: HelperEncode> HelperEncode for &T {
    fn encode(&self, out: &mut Vec<HelperElement>) {
        (*self).encode(out)
    }
}

/// Serializes an element sequence to wire bytes.
pub fn write_elements(elements: &[HelperElement]) -> Vec<u8> {
    let mut out = Vec::new();
    for el in elements {
        match el {
            HelperElement::Ins(code) => {
                out.extend_from_slice(b"INS");
                out.extend_from_slice(format!("{code:08x}").as_bytes());
            }
            HelperElement::Int(v) => {
                out.extend_from_slice(b"INT");
                out.extend_from_slice(v.to_string().as_bytes());
                out.push(b'>');
            }
            HelperElement::Str(bytes) => {
                out.extend_from_slice(b"STR");
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b'>');
                out.extend_from_slice(bytes);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Tag,
    InsHex(usize),
    IntDigits,
    StrLenDigits,
    StrBody(usize),
}

/// Incremental ASCII-tagged decoder (§4.1). Byte-at-a-time state machine;
/// `feed` + `poll` never blocks and buffers at most one in-flight element.
#[derive(Debug)]
pub struct HelperDecoder {
    buf: Vec<u8>,
    pos: usize,
    state: State,
    scratch: Vec<u8>,
}

impl Default for HelperDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HelperDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new(), pos: 0, state: State::Tag, scratch: Vec::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode one element. Returns `Ok(None)` if more bytes are
    /// needed to complete the current element.
    pub fn poll(&mut self) -> Result<Option<HelperElement>, CoreError> {
        loop {
            match self.state {
                State::Tag => {
                    if self.buf.len() - self.pos < 3 {
                        return Ok(None);
                    }
                    let tag = &self.buf[self.pos..self.pos + 3];
                    self.pos += 3;
                    self.scratch.clear();
                    self.state = match tag {
                        b"INS" => State::InsHex(8),
                        b"INT" => State::IntDigits,
                        b"STR" => State::StrLenDigits,
                        other => {
                            return Err(CoreError::Decode(format!(
                                "unknown helper tag {:?}",
                                String::from_utf8_lossy(other)
                            )))
                        }
                    };
                }
                State::InsHex(remaining) => {
                    if self.buf.len() - self.pos < remaining {
                        return Ok(None);
                    }
                    let hex = &self.buf[self.pos..self.pos + remaining];
                    self.pos += remaining;
                    let s = std::str::from_utf8(hex)
                        .map_err(|e| CoreError::Decode(format!("invalid hex in INS: {e}")))?;
                    let code = u32::from_str_radix(s, 16)
                        .map_err(|e| CoreError::Decode(format!("invalid hex in INS: {e}")))?;
                    self.state = State::Tag;
                    self.compact();
                    return Ok(Some(HelperElement::Ins(code)));
                }
                State::IntDigits => {
                    match self.find_terminator(b'>') {
                        None => return Ok(None),
                        Some(end) => {
                            let digits = &self.buf[self.pos..end];
                            let s = std::str::from_utf8(digits)
                                .map_err(|e| CoreError::Decode(format!("invalid INT digits: {e}")))?;
                            let value: u64 = s
                                .parse()
                                .map_err(|e| CoreError::Decode(format!("invalid INT digits: {e}")))?;
                            self.pos = end + 1;
                            self.state = State::Tag;
                            self.compact();
                            return Ok(Some(HelperElement::Int(value)));
                        }
                    }
                }
                State::StrLenDigits => {
                    match self.find_terminator(b'>') {
                        None => return Ok(None),
                        Some(end) => {
                            let digits = &self.buf[self.pos..end];
                            let s = std::str::from_utf8(digits)
                                .map_err(|e| CoreError::Decode(format!("invalid STR length: {e}")))?;
                            let len: usize = s
                                .parse()
                                .map_err(|e| CoreError::Decode(format!("invalid STR length: {e}")))?;
                            self.pos = end + 1;
                            self.state = State::StrBody(len);
                        }
                    }
                }
                State::StrBody(len) => {
                    if self.buf.len() - self.pos < len {
                        return Ok(None);
                    }
                    let bytes = self.buf[self.pos..self.pos + len].to_vec();
                    self.pos += len;
                    self.state = State::Tag;
                    self.compact();
                    return Ok(Some(HelperElement::Str(bytes)));
                }
            }
        }
    }

    fn find_terminator(&self, byte: u8) -> Option<usize> {
        self.buf[self.pos..].iter().position(|&b| b == byte).map(|i| self.pos + i)
    }

    fn compact(&mut self) {
        if self.pos > 4096 {
            self.buf.drain(0..self.pos);
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ins_int_str_sequence() {
        let elements = vec![
            HelperElement::Ins(0xdeadbeef),
            HelperElement::Int(42),
            HelperElement::Str(b"payload".to_vec()),
        ];
        let bytes = write_elements(&elements);

        let mut dec = HelperDecoder::new();
        dec.feed(&bytes);

        let mut decoded = Vec::new();
        while let Some(el) = dec.poll().unwrap() {
            decoded.push(el);
        }
        assert_eq!(decoded, elements);
    }

    #[test]
    fn partial_feed_suspends_mid_element() {
        let bytes = write_elements(&[HelperElement::Int(12345)]);
        let mut dec = HelperDecoder::new();
        dec.feed(&bytes[..3]);
        assert!(dec.poll().unwrap().is_none());
        dec.feed(&bytes[3..]);
        assert_eq!(dec.poll().unwrap(), Some(HelperElement::Int(12345)));
    }

    #[test]
    fn unknown_tag_is_decode_error() {
        let mut dec = HelperDecoder::new();
        dec.feed(b"XYZ");
        assert!(dec.poll().is_err());
    }

    #[test]
    fn vec_of_u32_encodes_with_length_prefix() {
        let values: Vec<u32> = vec![1, 2, 3];
        let mut out = Vec::new();
        values.encode(&mut out);
        assert_eq!(out[0], HelperElement::Int(3));
        assert_eq!(out.len(), 4);
    }
}
