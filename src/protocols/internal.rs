//! Intra-process routing header.
//!
//! Fixed 30-byte layout in host byte order, never sent across a trust
//! boundary:
//!
//! ```text
//! cmdtype(2) maincmd(4) subcmd(4) linkid(8) varhrlen(8) datalen(4) payload
//! ```

use super::cursor::Cursor;
use super::{Decode, DecodeResult};
use crate::error::CodecError;
use bytes::{BufMut, BytesMut};

pub const INTERNAL_HEADER_SIZE: usize = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InternalHeader {
    pub cmd_type: u16,
    pub main_cmd: u32,
    pub sub_cmd: u32,
    /// Opaque routing id, usually the originating connection.
    pub link_id: u64,
    /// Reserved.
    pub var_hr_len: u64,
    pub data_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalFrame<'a> {
    pub header: InternalHeader,
    pub payload: &'a [u8],
}

pub fn decode(data: &[u8], limit: usize) -> DecodeResult<InternalFrame<'_>> {
    let mut cur = Cursor::new(data);
    let header = match (
        cur.u16_ne(),
        cur.u32_ne(),
        cur.u32_ne(),
        cur.u64_ne(),
        cur.u64_ne(),
        cur.u32_ne(),
    ) {
        (
            Some(cmd_type),
            Some(main_cmd),
            Some(sub_cmd),
            Some(link_id),
            Some(var_hr_len),
            Some(data_len),
        ) => InternalHeader {
            cmd_type,
            main_cmd,
            sub_cmd,
            link_id,
            var_hr_len,
            data_len,
        },
        _ => return Ok(Decode::Incomplete),
    };

    let total = INTERNAL_HEADER_SIZE + header.data_len as usize;
    if total > limit {
        return Err(CodecError::Overflow {
            what: "internal frame",
            size: total,
            limit,
        });
    }

    match cur.bytes(header.data_len as usize) {
        Some(payload) => Ok(Decode::Complete {
            value: InternalFrame { header, payload },
            consumed: total,
        }),
        None => Ok(Decode::Incomplete),
    }
}

/// Append `header` and `payload` to `out`; `data_len` is taken from the
/// payload. Returns the encoded size.
pub fn encode(
    header: &InternalHeader,
    payload: &[u8],
    out: &mut BytesMut,
    limit: usize,
) -> Result<usize, CodecError> {
    let total = INTERNAL_HEADER_SIZE + payload.len();
    if total > limit || payload.len() > u32::MAX as usize {
        return Err(CodecError::Overflow {
            what: "internal frame",
            size: total,
            limit,
        });
    }

    out.reserve(total);
    out.put_slice(&header.cmd_type.to_ne_bytes());
    out.put_slice(&header.main_cmd.to_ne_bytes());
    out.put_slice(&header.sub_cmd.to_ne_bytes());
    out.put_slice(&header.link_id.to_ne_bytes());
    out.put_slice(&header.var_hr_len.to_ne_bytes());
    out.put_slice(&(payload.len() as u32).to_ne_bytes());
    out.put_slice(payload);
    Ok(total)
}
