//! Block chains: per-level ordered lists of blocks.
//!
//! The file stores no block's own id, only its neighbours', through the
//! `prev_id`/`next_id` header fields. Reconstruction therefore happens in
//! two passes:
//!
//! 1. A linear scan from `0x800` buckets every non-deleted block into a
//!    `prev_id -> offset` table (the offset of each block's successor) and
//!    records each level's chain head (the block with `prev_id == 0`).
//! 2. Per level, from the root down, the chain is walked: the first
//!    block's id comes from the parent chain's leading index token; each
//!    block's successor is found through the `prev_id` table, and the
//!    successor's id is the current block's `next_id`.
//!
//! The root chain (level *L*) is the single block at `0x800`; its
//! `next_id` field holds the largest block id in the file.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{Fp5Error, Result};
use crate::fp5::block::{self, BlockHeader};

/// File offset of the root index block.
pub const ROOT_BLOCK_OFFSET: u64 = 0x800;

/// One block in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub id: u32,
    pub offset: u64,
}

/// Lookup tables built by the linear scan.
#[derive(Debug)]
pub struct BlockTables {
    /// Block id -> file offset (0 = unknown). Filled during ordering.
    pub id_to_offset: Vec<u64>,
    /// prev_id -> file offset of the block carrying it, i.e. the offset
    /// of the successor of the block with that id (0 = none).
    pub prev_id_to_offset: Vec<u64>,
    pub largest_block_id: u32,
}

/// Ordered blocks of one level.
#[derive(Debug)]
pub struct BlockChain {
    pub level: u8,
    /// Offset of the block with `prev_id == 0`, or 0 when the level has
    /// no blocks.
    pub first_block_offset: u64,
    entries: Vec<ChainEntry>,
    position: HashMap<u32, usize>,
}

impl BlockChain {
    fn new(level: u8) -> Self {
        Self {
            level,
            first_block_offset: 0,
            entries: Vec::new(),
            position: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    /// Position of a block id within the chain order. O(1).
    pub fn position_of(&self, id: u32) -> Option<usize> {
        self.position.get(&id).copied()
    }

    /// Iterate entries in chain order, optionally seeking to `from_id`.
    ///
    /// An unknown `from_id` yields the empty iterator: the caller asked
    /// for a block this chain does not contain.
    pub fn iter_from(&self, from_id: Option<u32>) -> impl Iterator<Item = ChainEntry> + '_ {
        let start = match from_id {
            None => 0,
            Some(id) => self.position_of(id).unwrap_or(self.entries.len()),
        };
        self.entries[start..].iter().copied()
    }

    fn push(&mut self, id: u32, offset: u64) {
        self.position.insert(id, self.entries.len());
        self.entries.push(ChainEntry { id, offset });
    }
}

/// All chains of one file plus the id tables.
#[derive(Debug)]
pub struct ChainSet {
    pub tables: BlockTables,
    pub levels: u8,
    chains: Vec<BlockChain>,
}

impl ChainSet {
    /// Scan the file and reconstruct every chain, leaf to root.
    pub fn build(data: &[u8]) -> Result<Self> {
        let (tables, levels, mut chains) = scan_blocks(data)?;
        let mut set = Self {
            tables,
            levels,
            chains: Vec::new(),
        };

        for level in (0..=levels).rev() {
            if level == levels {
                // Root chain: exactly the block at 0x800, conventionally id 0.
                set.tables.id_to_offset[0] = ROOT_BLOCK_OFFSET;
                chains[level as usize].push(0, ROOT_BLOCK_OFFSET);
            } else {
                let parent_offset = chains[level as usize + 1].first_block_offset;
                order_chain(data, &mut set.tables, &mut chains[level as usize], parent_offset)?;
            }
        }

        for chain in &chains {
            debug!(level = chain.level, blocks = chain.len(), "ordered chain");
        }

        set.chains = chains;
        Ok(set)
    }

    pub fn chain(&self, level: u8) -> &BlockChain {
        &self.chains[level as usize]
    }

    /// The level-0 data chain.
    pub fn data_chain(&self) -> &BlockChain {
        &self.chains[0]
    }

    /// The single-block root chain.
    pub fn root_chain(&self) -> &BlockChain {
        &self.chains[self.levels as usize]
    }
}

/// Linear scan pass: headers only, bucketing by level.
fn scan_blocks(data: &[u8]) -> Result<(BlockTables, u8, Vec<BlockChain>)> {
    if data.len() < ROOT_BLOCK_OFFSET as usize + block::BLOCK_SIZE {
        return Err(Fp5Error::Format(format!(
            "file too small to hold a root block: {} bytes",
            data.len()
        )));
    }

    let root = block::header_at(data, ROOT_BLOCK_OFFSET)?;
    if root.deleted {
        return Err(Fp5Error::Format("root index block is deleted".into()));
    }

    let largest_block_id = root.next_id;
    let levels = root.level;

    let mut tables = BlockTables {
        id_to_offset: vec![0; largest_block_id as usize + 1],
        prev_id_to_offset: vec![0; largest_block_id as usize + 1],
        largest_block_id,
    };
    let mut chains: Vec<BlockChain> = (0..=levels).map(BlockChain::new).collect();

    let mut offset = ROOT_BLOCK_OFFSET;
    while (offset as usize) < data.len() {
        let header = match block::header_at(data, offset) {
            Ok(header) => header,
            Err(err) => {
                warn!(offset = format_args!("{offset:#x}"), %err, "skipping unreadable block");
                offset += block::BLOCK_SIZE as u64;
                continue;
            }
        };

        if !header.deleted {
            if header.level > levels {
                warn!(
                    offset = format_args!("{offset:#x}"),
                    level = header.level,
                    "block level above root level, skipping"
                );
            } else if header.prev_id == 0 {
                let chain = &mut chains[header.level as usize];
                if chain.first_block_offset == 0 {
                    chain.first_block_offset = offset;
                } else if offset != ROOT_BLOCK_OFFSET {
                    warn!(
                        level = header.level,
                        offset = format_args!("{offset:#x}"),
                        "duplicate chain head, keeping first"
                    );
                }
            } else if (header.prev_id as usize) < tables.prev_id_to_offset.len() {
                let slot = &mut tables.prev_id_to_offset[header.prev_id as usize];
                if *slot == 0 {
                    *slot = offset;
                } else {
                    warn!(
                        prev_id = header.prev_id,
                        offset = format_args!("{offset:#x}"),
                        "block with duplicate prev_id, keeping first"
                    );
                }
            } else {
                warn!(
                    prev_id = header.prev_id,
                    largest = largest_block_id,
                    "block prev_id above largest block id, skipping"
                );
            }
        }

        offset += block::BLOCK_SIZE as u64;
    }

    Ok((tables, levels, chains))
}

/// Id of the first child block, read from the leading `00 04 <id: u32 BE>`
/// index token of the parent chain's first block.
fn first_block_ref(data: &[u8], parent_offset: u64) -> Result<u32> {
    let header = block::header_at(data, parent_offset)?;
    let payload = block::payload_at(data, parent_offset, &header, false)?;

    if payload.len() < 6 || payload[0] != 0x00 || payload[1] != 0x04 {
        return Err(Fp5Error::Block(format!(
            "unexpected chain start sequence in parent block at {parent_offset:#x}: \
             expected payload starting with 00 04"
        )));
    }

    Ok(u32::from_be_bytes(payload[2..6].try_into().unwrap()))
}

/// Order one non-root chain by walking prev/next pointers from its head.
fn order_chain(
    data: &[u8],
    tables: &mut BlockTables,
    chain: &mut BlockChain,
    parent_offset: u64,
) -> Result<()> {
    if parent_offset == 0 {
        warn!(level = chain.level, "parent chain has no head, leaving level empty");
        return Ok(());
    }
    if chain.first_block_offset == 0 {
        warn!(level = chain.level, "no chain head at this level");
        return Ok(());
    }

    let mut id = first_block_ref(data, parent_offset)?;
    let mut offset = chain.first_block_offset;

    loop {
        if id as usize >= tables.id_to_offset.len() {
            warn!(
                level = chain.level,
                id,
                largest = tables.largest_block_id,
                "chain walk reached id above largest block id, stopping"
            );
            break;
        }

        if tables.id_to_offset[id as usize] == 0 {
            tables.id_to_offset[id as usize] = offset;
        } else {
            warn!(
                id,
                offset = format_args!("{offset:#x}"),
                "duplicate block id in chain walk, keeping first offset"
            );
        }
        chain.push(id, offset);

        let header: BlockHeader = block::header_at(data, offset)?;
        if header.next_id == 0 {
            break;
        }

        let successor = tables.prev_id_to_offset[id as usize];
        if successor == 0 {
            warn!(
                level = chain.level,
                id,
                next_id = header.next_id,
                "chain truncated: successor block not found"
            );
            break;
        }

        offset = successor;
        id = header.next_id;
    }

    Ok(())
}
