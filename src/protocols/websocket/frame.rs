//! Frame layout.
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| payload len |    extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |    masking key (0 or 4)       |          payload ...          |
//! +-------------------------------+-------------------------------+
//! ```

use crate::error::CodecError;
use crate::protocols::cursor::Cursor;
use crate::runtime::buffer::ScratchBuffer;

/// Largest header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_SIZE: usize = 14;
/// Control frame payloads are limited to this size.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    /// Control frames have the top opcode bit set.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Bytes occupied by the header itself.
    pub header_len: usize,
}

impl FrameHeader {
    /// Header plus payload.
    pub fn frame_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// Parse the frame header at the front of `data`; `None` if more bytes are
/// needed.
pub fn parse_header(data: &[u8]) -> Result<Option<FrameHeader>, CodecError> {
    let mut cur = Cursor::new(data);
    let (Some(b0), Some(b1)) = (cur.u8(), cur.u8()) else {
        return Ok(None);
    };

    if b0 & 0x70 != 0 {
        return Err(CodecError::malformed(
            "websocket frame",
            "reserved bits set without an extension",
        ));
    }
    let opcode = OpCode::from_u8(b0 & 0x0F).ok_or_else(|| {
        CodecError::malformed("websocket frame", format!("opcode {:#x}", b0 & 0x0F))
    })?;

    let payload_len = match b1 & 0x7F {
        126 => match cur.u16_be() {
            Some(len) => len as u64,
            None => return Ok(None),
        },
        127 => match cur.u64_be() {
            Some(len) => len,
            None => return Ok(None),
        },
        len => len as u64,
    };

    let mask = if b1 & 0x80 != 0 {
        match cur.bytes(4) {
            Some(key) => Some([key[0], key[1], key[2], key[3]]),
            None => return Ok(None),
        }
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin: b0 & 0x80 != 0,
        opcode,
        mask,
        payload_len,
        header_len: cur.position(),
    }))
}

/// Extra length bytes needed after the 7-bit field.
pub fn length_field_size(payload_len: usize) -> usize {
    match payload_len {
        0..=125 => 0,
        126..=65535 => 2,
        _ => 8,
    }
}

/// Size of a complete frame carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize, masked: bool) -> usize {
    let mask_len = if masked { 4 } else { 0 };
    2 + length_field_size(payload_len) + mask_len + payload_len
}

/// XOR `data` with `key`, starting at key byte 0. Applying it twice restores
/// the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a single final frame into `out`, replacing its contents.
///
/// A zero `mask` sends the payload unmasked. Returns the frame size.
pub fn encode_frame(
    opcode: OpCode,
    payload: &[u8],
    mask: [u8; 4],
    out: &mut ScratchBuffer,
) -> Result<usize, CodecError> {
    let masked = mask != [0; 4];
    let total = encoded_len(payload.len(), masked);
    if total > out.capacity() {
        return Err(CodecError::Overflow {
            what: "websocket frame",
            size: total,
            limit: out.capacity(),
        });
    }

    let mut header = [0u8; MAX_HEADER_SIZE];
    header[0] = 0x80 | opcode.as_u8();
    let mask_bit = if masked { 0x80 } else { 0 };
    let mut len = 2;
    match length_field_size(payload.len()) {
        0 => header[1] = mask_bit | payload.len() as u8,
        2 => {
            header[1] = mask_bit | 126;
            header[2..4].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            len += 2;
        }
        _ => {
            header[1] = mask_bit | 127;
            header[2..10].copy_from_slice(&(payload.len() as u64).to_be_bytes());
            len += 8;
        }
    }
    if masked {
        header[len..len + 4].copy_from_slice(&mask);
        len += 4;
    }

    out.clear();
    out.extend(&header[..len])
        .and_then(|_| out.extend(payload))
        .map_err(|e| CodecError::Overflow {
            what: "websocket frame",
            size: e.needed,
            limit: e.capacity,
        })?;
    if masked {
        apply_mask(&mut out.data_mut()[len..], mask);
    }
    Ok(total)
}

/// Body of a close frame: big-endian status code then UTF-8 reason.
pub fn close_payload(code: Option<u16>, reason: &str) -> Vec<u8> {
    match code {
        Some(code) => {
            let mut body = code.to_be_bytes().to_vec();
            body.extend_from_slice(reason.as_bytes());
            body.truncate(MAX_CONTROL_PAYLOAD);
            body
        }
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_length_field_boundaries() {
        let mut out = ScratchBuffer::new(70_000);
        for (len, extra) in [(0, 0), (125, 0), (126, 2), (65535, 2), (65536, 8)] {
            let payload = vec![1u8; len];
            let size = encode_frame(OpCode::Binary, &payload, [0; 4], &mut out).unwrap();
            assert_eq!(size, 2 + extra + len, "payload of {len} bytes");

            let header = parse_header(out.data()).unwrap().unwrap();
            assert_eq!(header.header_len, 2 + extra);
            assert_eq!(header.payload_len, len as u64);
            assert!(header.fin);
        }
    }

    #[test]
    fn test_masked_frame() {
        let mut out = ScratchBuffer::new(64);
        let key = [0x37, 0xfa, 0x21, 0x3d];
        encode_frame(OpCode::Text, b"Hello", key, &mut out).unwrap();

        // RFC 6455 section 5.7
        assert_eq!(
            out.data(),
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
        let header = parse_header(out.data()).unwrap().unwrap();
        assert_eq!(header.mask, Some(key));
        assert_eq!(header.opcode, OpCode::Text);
    }

    #[test]
    fn test_frame_must_fit_scratch() {
        let mut out = ScratchBuffer::new(16);
        assert!(matches!(
            encode_frame(OpCode::Binary, &[0u8; 15], [0; 4], &mut out),
            Err(CodecError::Overflow { size: 17, .. })
        ));
    }

    #[test]
    fn test_partial_header() {
        assert_eq!(parse_header(&[0x82]).unwrap(), None);
        assert_eq!(parse_header(&[0x82, 126, 0]).unwrap(), None);
        assert_eq!(parse_header(&[0x82, 0x85, 1, 2]).unwrap(), None);
    }

    #[test]
    fn test_rejects_unknown_opcode_and_rsv() {
        assert!(parse_header(&[0x83, 0]).is_err());
        assert!(parse_header(&[0xC1, 0]).is_err());
    }

    #[test]
    fn test_control_opcodes() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Continuation.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    proptest! {
        #[test]
        fn prop_mask_is_involution(key: [u8; 4], payload in proptest::collection::vec(any::<u8>(), 0..300)) {
            let mut data = payload.clone();
            apply_mask(&mut data, key);
            apply_mask(&mut data, key);
            prop_assert_eq!(data, payload);
        }
    }
}
