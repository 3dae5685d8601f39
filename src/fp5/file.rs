//! `Fp5File`: the open file handle and everything derived from it once at
//! open time -- header validation, block tables, chains, field catalog
//! and record index.
//!
//! The file is memory-mapped read-only; all block access happens through
//! slices of the map. Apart from the id tables and the per-level ordered
//! block lists, nothing is materialized: node content streams lazily
//! through [`SubNodes`].

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{info, warn};

use crate::error::{Fp5Error, Result};
use crate::export::locale::TextEncoding;
use crate::fp5::block;
use crate::fp5::chain::ChainSet;
use crate::fp5::fields::{self, FieldCatalog};
use crate::fp5::index;
use crate::fp5::path::TokenPath;
use crate::fp5::token::{StartBlock, SubNodes, SubNodesQuery, Value};

/// 15-byte file magic at offset 0.
pub const MAGIC: [u8; 15] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x05, 0x00, 0x02, 0x00, 0x02, 0xC0,
];

/// Offset of the length-prefixed ASCII version string.
pub const VERSION_OFFSET: usize = 0x15;

/// Offset of the length-prefixed stored database name (second header block).
pub const DB_NAME_OFFSET: usize = 0x410;

/// Version strings this reader accepts.
pub const ACCEPTED_VERSIONS: [&str; 2] = ["Pro 3.0", "Pro 5.0"];

/// Well-known path of the record subtree.
pub fn records_path() -> Vec<Vec<u8>> {
    vec![vec![0x05]]
}

/// An open, validated fp5 file.
pub struct Fp5File {
    map: Mmap,
    pub path: PathBuf,
    pub encoding: TextEncoding,
    pub chains: ChainSet,
    pub version: String,
    pub db_name: String,
    pub fields: FieldCatalog,
    /// Full ordered list of record ids (VLI bytes) from the `0D` node.
    pub records_index: Vec<Vec<u8>>,
}

impl std::fmt::Debug for Fp5File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fp5File")
            .field("path", &self.path)
            .field("encoding", &self.encoding)
            .field("version", &self.version)
            .field("db_name", &self.db_name)
            .finish_non_exhaustive()
    }
}

impl Fp5File {
    /// Open and validate a file, then build chains, catalog and record
    /// index.
    pub fn open(path: impl AsRef<Path>, encoding: TextEncoding) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let handle = File::open(&path)?;

        let size = handle.metadata()?.len();
        if size == 0 || size % block::BLOCK_SIZE as u64 != 0 {
            return Err(Fp5Error::Format(format!(
                "file size {size:#x} is not a positive multiple of {:#x}",
                block::BLOCK_SIZE
            )));
        }

        let map = unsafe { Mmap::map(&handle) }?;
        if map[..MAGIC.len().min(map.len())] != MAGIC {
            return Err(Fp5Error::Format("bad magic number".into()));
        }

        let version = match pascal_str(&map, VERSION_OFFSET) {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => String::new(),
        };
        if !ACCEPTED_VERSIONS.contains(&version.as_str()) {
            return Err(Fp5Error::Format(format!(
                "unsupported version {version:?}, expected one of {ACCEPTED_VERSIONS:?}"
            )));
        }

        let db_name = pascal_str(&map, DB_NAME_OFFSET)
            .map(|bytes| encoding.decode(bytes))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });

        let chains = ChainSet::build(&map)?;

        let mut file = Self {
            map,
            path,
            encoding,
            chains,
            version,
            db_name,
            fields: FieldCatalog::new(),
            records_index: Vec::new(),
        };

        info!(
            file = %file.path.display(),
            version = %file.version,
            levels = file.chains.levels,
            data_blocks = file.chains.data_chain().len(),
            "opened fp5 file"
        );

        file.fields = fields::build_catalog(&file, encoding);
        file.records_index = file.read_record_index();

        Ok(file)
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    pub fn records_count(&self) -> usize {
        self.records_index.len()
    }

    /// The record id following `id_bytes` in file order, for resumable
    /// scans.
    pub fn record_id_after(&self, id_bytes: &[u8]) -> Option<&[u8]> {
        let pos = self.records_index.iter().position(|id| id == id_bytes)?;
        self.records_index.get(pos + 1).map(Vec::as_slice)
    }

    // ── Node Access ───────────────────────────────────────────────

    /// First data block whose first token path reaches the query (§ path
    /// index). `None` when the path is absent.
    pub fn find_first_block_for_path(&self, query: &[Vec<u8>]) -> Result<Option<u32>> {
        index::find_first_block_for_path(&self.map, &self.chains, query)
    }

    /// Full traversal entry point; see [`SubNodes`].
    pub fn sub_nodes(
        &self,
        search: Vec<Vec<u8>>,
        yield_children: bool,
        start_node: Option<Vec<Vec<u8>>>,
        token_filter: Option<HashSet<Vec<u8>>>,
    ) -> Result<SubNodes<'_>> {
        let start = if search.is_empty() && start_node.is_none() {
            StartBlock::Head
        } else {
            let lookup = start_node.as_deref().unwrap_or(&search);
            match self.find_first_block_for_path(lookup)? {
                Some(id) => StartBlock::At(id),
                None => StartBlock::Absent,
            }
        };

        Ok(SubNodes::new(
            &self.map,
            self.chains.data_chain(),
            start,
            SubNodesQuery {
                search,
                yield_children,
                start_node,
                token_filter,
            },
        ))
    }

    /// Children of one node, tolerating navigator failures (used by the
    /// catalog build, where schema trouble is never fatal).
    pub fn sub_node_children(&self, path: &[Vec<u8>]) -> SubNodes<'_> {
        match self.sub_nodes(path.to_vec(), true, None, None) {
            Ok(iter) => iter,
            Err(err) => {
                warn!(%err, "path index failed, treating node as empty");
                SubNodes::new(
                    &self.map,
                    self.chains.data_chain(),
                    StartBlock::Absent,
                    SubNodesQuery {
                        search: path.to_vec(),
                        yield_children: true,
                        start_node: None,
                        token_filter: None,
                    },
                )
            }
        }
    }

    /// The whole node at `path`, if present.
    pub fn node(&self, path: &[Vec<u8>]) -> Result<Option<Value>> {
        Ok(self
            .sub_nodes(path.to_vec(), false, None, None)?
            .next()
            .map(|(_, value)| value))
    }

    fn read_record_index(&self) -> Vec<Vec<u8>> {
        match self.node(&[vec![0x0D]]) {
            Ok(Some(Value::List(ids))) => ids,
            Ok(Some(_)) => {
                warn!("record index node is not an inline byte-array list");
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(%err, "failed to read record index");
                Vec::new()
            }
        }
    }

    // ── Block Dumps ───────────────────────────────────────────────

    /// Write the ordered data blocks (headers included, zero-padded).
    pub fn dump_data_blocks(&self, out: &mut dyn Write) -> Result<()> {
        for entry in self.chains.data_chain().iter_from(None) {
            self.dump_block(entry.offset, out)?;
        }
        Ok(())
    }

    /// Write the ordered index blocks, root level first.
    pub fn dump_index_blocks(&self, out: &mut dyn Write) -> Result<()> {
        for level in (1..=self.chains.levels).rev() {
            for entry in self.chains.chain(level).iter_from(None) {
                self.dump_block(entry.offset, out)?;
            }
        }
        Ok(())
    }

    /// Write the data blocks holding nodes under `path`.
    pub fn dump_blocks_with_path(&self, path: &TokenPath, out: &mut dyn Write) -> Result<()> {
        let start = self.find_first_block_for_path(path.segments())?;
        let Some(start) = start else {
            return Ok(());
        };

        for entry in self.chains.data_chain().iter_from(Some(start)) {
            let header = block::header_at(&self.map, entry.offset)?;
            let payload = block::payload_at(&self.map, entry.offset, &header, false)?;
            let first = block::first_token_path(payload);
            if first.truncated_cmp(path.segments()) == std::cmp::Ordering::Greater {
                break;
            }
            self.dump_block(entry.offset, out)?;
        }
        Ok(())
    }

    fn dump_block(&self, offset: u64, out: &mut dyn Write) -> Result<()> {
        let header = block::header_at(&self.map, offset)?;
        let padded = block::padded_block_at(&self.map, offset, &header)?;
        out.write_all(&padded)?;
        Ok(())
    }
}

/// Length-prefixed string read, `None` past the end of the map.
fn pascal_str(data: &[u8], offset: usize) -> Option<&[u8]> {
    let len = *data.get(offset)? as usize;
    data.get(offset + 1..offset + 1 + len)
}
