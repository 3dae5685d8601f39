//! Path index navigator.
//!
//! Index chains (levels 1..*L*) store separator entries of the form
//! `(path segments, reference bytes, child block id)`. Descending from the
//! root, each level is scanned until the first entry whose effective key
//! (path plus reference suffix) reaches the query path; the walk then
//! descends into the previous sibling's child when one exists (the query
//! may fall between two separators), or into the matching entry's child
//! when its key is a prefix of the query. Reference bytes `FF FE`/`FF FF`
//! are end-of-range sentinels. At level 1 the chosen child is the data
//! block id.

use std::cmp::Ordering;

use tracing::warn;

use crate::error::Result;
use crate::fp5::block;
use crate::fp5::chain::{BlockChain, ChainSet};
use crate::fp5::path::TokenPath;

/// One separator entry of an index block.
#[derive(Debug)]
struct IndexEntry {
    key: Vec<Vec<u8>>,
    ref_bytes: Vec<u8>,
    child: u32,
}

impl IndexEntry {
    fn is_sentinel(&self) -> bool {
        self.ref_bytes == [0xFF, 0xFF] || self.ref_bytes == [0xFF, 0xFE]
    }
}

/// Find the id of the first data block whose first token path is >= the
/// query path, or `None` when every indexed path precedes the query range
/// (the path is absent).
pub fn find_first_block_for_path(
    data: &[u8],
    chains: &ChainSet,
    query: &[Vec<u8>],
) -> Result<Option<u32>> {
    if chains.levels == 0 {
        // Degenerate file without index levels: the scan starts at the
        // head of the data chain.
        return Ok(chains.data_chain().entries().first().map(|e| e.id));
    }

    let mut start_id = chains.root_chain().entries()[0].id;

    for level in (1..=chains.levels).rev() {
        let chain = chains.chain(level);
        match scan_level(data, chain, start_id, query)? {
            None => return Ok(None),
            Some(child) => {
                if level == 1 {
                    return Ok(Some(child));
                }
                start_id = child;
            }
        }
    }

    unreachable!("loop returns at level 1");
}

/// Scan one index level from `start_id`, returning the child block id to
/// descend into.
fn scan_level(
    data: &[u8],
    chain: &BlockChain,
    start_id: u32,
    query: &[Vec<u8>],
) -> Result<Option<u32>> {
    let Some(mut start_pos) = chain.position_of(start_id) else {
        warn!(level = chain.level, start_id, "index descend target not in chain");
        return Ok(None);
    };

    'retry: loop {
        let mut prev_child: Option<u32> = None;
        let mut path = TokenPath::new();

        for entry_pos in start_pos..chain.len() {
            let block_entry = chain.entries()[entry_pos];
            let header = block::header_at(data, block_entry.offset)?;
            let payload = block::payload_at(data, block_entry.offset, &header, true)?;

            for entry in parse_index_entries(payload, &mut path, chain.level, block_entry.id) {
                if entry.is_sentinel() {
                    return Ok(Some(prev_child.unwrap_or(entry.child)));
                }

                if query.starts_with(&entry.key[..]) {
                    // The separator names a node on the query's own path:
                    // its subtree holds the query start.
                    return Ok(Some(entry.child));
                }

                match entry.key[..].cmp(query) {
                    Ordering::Less => prev_child = Some(entry.child),
                    _ => {
                        if let Some(child) = prev_child {
                            return Ok(Some(child));
                        }
                        // First entry already exceeds the query: back up one
                        // block and retry; with no predecessor the path is
                        // absent.
                        if start_pos == 0 {
                            return Ok(None);
                        }
                        start_pos -= 1;
                        continue 'retry;
                    }
                }
            }
        }

        // Chain exhausted below the query: descend the rightmost child.
        return Ok(prev_child);
    }
}

/// Parse the separator entries of one index payload, updating `path`
/// across the push/pop tokens.
fn parse_index_entries(
    payload: &[u8],
    path: &mut TokenPath,
    level: u8,
    block_id: u32,
) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;

    while cursor < payload.len() {
        let byte = payload[cursor];
        let (ref_bytes, data_start): (Vec<u8>, usize) = match byte {
            // Pop path segment.
            0xC0 => {
                path.pop();
                cursor += 1;
                continue;
            }
            // Push path segment.
            0xC1..=0xFE => {
                let len = (byte - 0xC0) as usize;
                let end = cursor + 1 + len;
                if end > payload.len() {
                    warn!(level, block_id, cursor, "index path push overruns payload");
                    break;
                }
                path.push(payload[cursor + 1..end].to_vec());
                cursor = end;
                continue;
            }
            // Implicit reference 0.
            0x00 => (vec![0x00], cursor + 2),
            // Long reference: n raw bytes.
            0x01..=0x3F => {
                let len = byte as usize;
                if cursor + 1 + len >= payload.len() {
                    warn!(level, block_id, cursor, "index reference overruns payload");
                    break;
                }
                (payload[cursor + 1..cursor + 1 + len].to_vec(), cursor + 2 + len)
            }
            // Short reference: low six bits of the lead byte.
            0x40..=0x7F => (vec![byte & 0xBF], cursor + 2),
            _ => {
                warn!(level, block_id, cursor, byte, "unhandled index token, abandoning block");
                break;
            }
        };

        let Some(&len_byte) = payload.get(data_start - 1) else {
            warn!(level, block_id, cursor, "index entry missing length byte");
            break;
        };
        let data_end = data_start + len_byte as usize;
        if data_end > payload.len() {
            warn!(level, block_id, cursor, "index entry data overruns payload");
            break;
        }

        let data = &payload[data_start..data_end];
        let child = match data.len() {
            1..=4 => {
                let mut id = 0u32;
                for &b in data {
                    id = (id << 8) | b as u32;
                }
                id
            }
            _ => {
                warn!(
                    level,
                    block_id,
                    len = data.len(),
                    "index entry payload is not a block id, skipping"
                );
                cursor = data_end;
                continue;
            }
        };

        let mut key = path.segments().to_vec();
        key.push(ref_bytes.clone());
        entries.push(IndexEntry {
            key,
            ref_bytes,
            child,
        });

        cursor = data_end;
    }

    entries
}
