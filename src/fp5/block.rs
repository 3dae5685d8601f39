//! Physical block layer.
//!
//! An fp5 file is a sequence of 0x400-byte blocks. Every block carries a
//! 14-byte header followed by `length` payload bytes:
//!
//! ```text
//! Offset  Size  Field
//! 0       1     deleted_flag: 0xFF means deleted, skip the block
//! 1       1     level: chain level, 0 = data
//! 2       4     prev_id: u32 BE, predecessor block id (0 = chain head)
//! 6       4     next_id: u32 BE, successor block id (0 = chain tail)
//! 10      2     skip_bytes: u16 BE, payload prefix continuing the
//!               predecessor's last token
//! 12      2     length: u16 BE, payload length (<= 0x3F2)
//! ```

use crate::error::{Fp5Error, Result};
use crate::fp5::path::TokenPath;

/// Size of one physical block.
pub const BLOCK_SIZE: usize = 0x400;

/// Size of the common block header.
pub const BLOCK_HEADER_LEN: usize = 14;

/// Largest payload a block can declare.
pub const MAX_PAYLOAD_LEN: usize = 0x3F2;

/// Marker value of `deleted_flag` for deleted blocks.
pub const DELETED_FLAG: u8 = 0xFF;

/// Parsed 14-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub deleted: bool,
    pub level: u8,
    pub prev_id: u32,
    pub next_id: u32,
    pub skip_bytes: u16,
    pub length: u16,
}

impl BlockHeader {
    /// Parse a header from the start of `bytes`.
    ///
    /// Returns the header even for deleted blocks; callers must check
    /// [`BlockHeader::deleted`] before trusting the payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_LEN {
            return Err(Fp5Error::Block(format!(
                "truncated block header: {} bytes",
                bytes.len()
            )));
        }

        let header = Self {
            deleted: bytes[0] == DELETED_FLAG,
            level: bytes[1],
            prev_id: u32::from_be_bytes(bytes[2..6].try_into().unwrap()),
            next_id: u32::from_be_bytes(bytes[6..10].try_into().unwrap()),
            skip_bytes: u16::from_be_bytes(bytes[10..12].try_into().unwrap()),
            length: u16::from_be_bytes(bytes[12..14].try_into().unwrap()),
        };

        if header.length as usize > MAX_PAYLOAD_LEN {
            return Err(Fp5Error::Block(format!(
                "block declares payload of {:#x} bytes, maximum is {:#x}",
                header.length, MAX_PAYLOAD_LEN
            )));
        }

        Ok(header)
    }
}

/// Read the header of the block starting at `offset`.
pub fn header_at(data: &[u8], offset: u64) -> Result<BlockHeader> {
    let start = offset as usize;
    let end = start
        .checked_add(BLOCK_HEADER_LEN)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Fp5Error::Block(format!("block offset {offset:#x} past end of file")))?;
    BlockHeader::from_bytes(&data[start..end])
}

/// Slice the payload of the block starting at `offset`.
///
/// With `skip_prefix` the first `skip_bytes` payload bytes (the tail of a
/// token straddling in from the predecessor block) are dropped.
pub fn payload_at<'a>(data: &'a [u8], offset: u64, header: &BlockHeader, skip_prefix: bool) -> Result<&'a [u8]> {
    let start = offset as usize + BLOCK_HEADER_LEN;
    let end = start + header.length as usize;
    if end > data.len() {
        return Err(Fp5Error::Block(format!(
            "block at {offset:#x} declares {} payload bytes past end of file",
            header.length
        )));
    }

    let skip = if skip_prefix {
        let skip = header.skip_bytes as usize;
        if skip > header.length as usize {
            return Err(Fp5Error::Block(format!(
                "block at {offset:#x}: skip_bytes {skip:#x} exceeds payload length {:#x}",
                header.length
            )));
        }
        skip
    } else {
        0
    };

    Ok(&data[start + skip..end])
}

/// Copy a whole block (header plus payload), zero-padded back to
/// [`BLOCK_SIZE`]. This is the unit the block-dump actions write.
pub fn padded_block_at(data: &[u8], offset: u64, header: &BlockHeader) -> Result<Vec<u8>> {
    let start = offset as usize;
    let end = start + BLOCK_HEADER_LEN + header.length as usize;
    if end > data.len() {
        return Err(Fp5Error::Block(format!(
            "block at {offset:#x} truncated by end of file"
        )));
    }

    let mut out = data[start..end].to_vec();
    out.resize(BLOCK_SIZE, 0);
    Ok(out)
}

/// Path of the first token in a payload, derived from the leading path
/// push/pop tokens. Best-effort: stops at the first non-path token, and
/// yields whatever has accumulated when a push runs off the payload.
///
/// Used by the path-scoped block dump to decide when the blocks for a
/// path prefix have been exhausted.
pub fn first_token_path(payload: &[u8]) -> TokenPath {
    let mut path = TokenPath::new();
    let mut cursor = 0usize;

    while cursor < payload.len() {
        match payload[cursor] {
            0xC0 => {
                path.pop();
                cursor += 1;
            }
            byte @ 0xC1..=0xFE => {
                let len = (byte - 0xC0) as usize;
                let start = cursor + 1;
                let end = start + len;
                if end > payload.len() {
                    break;
                }
                path.push(payload[start..end].to_vec());
                cursor = end;
            }
            _ => break,
        }
    }

    path
}
