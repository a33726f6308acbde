//! Length-prefixed RPC framing: `flags(1) | datalen(4, be) | data`.

use super::cursor::Cursor;
use super::{Decode, DecodeResult};
use crate::error::CodecError;
use bytes::{BufMut, BytesMut};

pub const RPC_HEADER_SIZE: usize = 5;

/// Payload is compressed with the encoding negotiated out of band.
pub const FLAG_COMPRESSED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcFrame<'a> {
    pub flags: u8,
    pub payload: &'a [u8],
}

impl RpcFrame<'_> {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

pub fn decode(data: &[u8], limit: usize) -> DecodeResult<RpcFrame<'_>> {
    let mut cur = Cursor::new(data);
    let (Some(flags), Some(len)) = (cur.u8(), cur.u32_be()) else {
        return Ok(Decode::Incomplete);
    };

    let total = RPC_HEADER_SIZE + len as usize;
    if total > limit {
        return Err(CodecError::Overflow {
            what: "rpc frame",
            size: total,
            limit,
        });
    }

    Ok(match cur.bytes(len as usize) {
        Some(payload) => Decode::Complete {
            value: RpcFrame { flags, payload },
            consumed: total,
        },
        None => Decode::Incomplete,
    })
}

pub fn encode(
    flags: u8,
    payload: &[u8],
    out: &mut BytesMut,
    limit: usize,
) -> Result<usize, CodecError> {
    let total = RPC_HEADER_SIZE + payload.len();
    if total > limit || payload.len() > u32::MAX as usize {
        return Err(CodecError::Overflow {
            what: "rpc frame",
            size: total,
            limit,
        });
    }
    out.reserve(total);
    out.put_u8(flags);
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    Ok(total)
}
