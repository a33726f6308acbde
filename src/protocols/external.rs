//! Client application header.
//!
//! ```text
//! +------------+-------------+------------+----------------------+
//! | cmdid (4)  | bodylen (4) | seq (4)    | payload              |
//! +------------+-------------+------------+----------------------+
//! ```
//!
//! All fields are big endian. `cmdid` is `main_cmd << 16 | sub_cmd` and
//! `bodylen` counts the header itself plus the payload.

use super::cursor::Cursor;
use super::{Decode, DecodeResult};
use crate::error::CodecError;
use bytes::{BufMut, BytesMut};

pub const EXTERNAL_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalHeader {
    pub cmd_id: u32,
    pub body_len: u32,
    pub seq: u32,
}

impl ExternalHeader {
    pub fn cmd_id(main_cmd: u16, sub_cmd: u16) -> u32 {
        (main_cmd as u32) << 16 | sub_cmd as u32
    }

    pub fn main_cmd(&self) -> u16 {
        (self.cmd_id >> 16) as u16
    }

    pub fn sub_cmd(&self) -> u16 {
        self.cmd_id as u16
    }

    pub fn payload_len(&self) -> usize {
        (self.body_len as usize).saturating_sub(EXTERNAL_HEADER_SIZE)
    }
}

/// A decoded frame borrowing its payload from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalFrame<'a> {
    pub header: ExternalHeader,
    pub payload: &'a [u8],
}

/// Decode one frame from the front of `data`.
///
/// Frames whose `bodylen` is larger than `limit` are fatal.
pub fn decode(data: &[u8], limit: usize) -> DecodeResult<ExternalFrame<'_>> {
    let mut cur = Cursor::new(data);
    let (Some(cmd_id), Some(body_len), Some(seq)) = (cur.u32_be(), cur.u32_be(), cur.u32_be())
    else {
        return Ok(Decode::Incomplete);
    };

    let total = body_len as usize;
    if total < EXTERNAL_HEADER_SIZE {
        return Err(CodecError::malformed(
            "external header",
            format!("bodylen {total} is smaller than the header"),
        ));
    }
    if total > limit {
        return Err(CodecError::Overflow {
            what: "external frame",
            size: total,
            limit,
        });
    }

    let Some(payload) = cur.bytes(total - EXTERNAL_HEADER_SIZE) else {
        return Ok(Decode::Incomplete);
    };

    Ok(Decode::Complete {
        value: ExternalFrame {
            header: ExternalHeader {
                cmd_id,
                body_len,
                seq,
            },
            payload,
        },
        consumed: total,
    })
}

/// Append one frame to `out`. Returns the encoded size.
pub fn encode(
    cmd_id: u32,
    seq: u32,
    payload: &[u8],
    out: &mut BytesMut,
    limit: usize,
) -> Result<usize, CodecError> {
    let total = payload.len() + EXTERNAL_HEADER_SIZE;
    if total > limit || total > u32::MAX as usize {
        return Err(CodecError::Overflow {
            what: "external frame",
            size: total,
            limit,
        });
    }

    out.reserve(total);
    out.put_u32(cmd_id);
    out.put_u32(total as u32);
    out.put_u32(seq);
    out.put_slice(payload);
    Ok(total)
}
