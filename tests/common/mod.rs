//! Synthetic .fp5 fixture builder.
//!
//! Builds byte-exact files: two header blocks (magic, version, stored
//! database name), a single-level root index block at 0x800 whose
//! separators are derived from each data block's first token path, and
//! the data chain in the requested physical order.

#![allow(dead_code)]

use fp5dump::fp5::block::{first_token_path, BLOCK_SIZE};

pub const ROOT_OFFSET: usize = 0x800;

// ── Token Writer ───────────────────────────────────────────────────

/// Builds token stream payloads.
#[derive(Default)]
pub struct TokenWriter {
    pub buf: Vec<u8>,
}

impl TokenWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: &[u8]) -> &mut Self {
        assert!(!segment.is_empty() && segment.len() <= 0x3E);
        self.buf.push(0xC0 + segment.len() as u8);
        self.buf.extend_from_slice(segment);
        self
    }

    pub fn pop(&mut self) -> &mut Self {
        self.buf.push(0xC0);
        self
    }

    /// Short field-ref (0x40..0x7F), one-byte length.
    pub fn leaf_short(&mut self, reference: u8, data: &[u8]) -> &mut Self {
        assert!(reference <= 0x3F && data.len() <= 0xFF);
        self.buf.push(0x40 | reference);
        self.buf.push(data.len() as u8);
        self.buf.extend_from_slice(data);
        self
    }

    /// Long field-ref (raw reference bytes), one-byte length.
    pub fn leaf_long_ref(&mut self, reference: &[u8], data: &[u8]) -> &mut Self {
        assert!(!reference.is_empty() && reference.len() <= 0x3F && data.len() <= 0xFF);
        self.buf.push(reference.len() as u8);
        self.buf.extend_from_slice(reference);
        self.buf.push(data.len() as u8);
        self.buf.extend_from_slice(data);
        self
    }

    /// Long data with a long-form reference: `FF <n> <ref> <len u16> <data>`.
    pub fn long_data(&mut self, reference: &[u8], data: &[u8]) -> &mut Self {
        assert!((1..=4).contains(&reference.len()));
        self.buf.push(0xFF);
        self.buf.push(reference.len() as u8);
        self.buf.extend_from_slice(reference);
        self.buf
            .extend_from_slice(&(data.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(data);
        self
    }

    /// Inline byte-array entry (0x81..0xBF).
    pub fn inline_entry(&mut self, chunk: &[u8]) -> &mut Self {
        assert!(!chunk.is_empty() && chunk.len() <= 0x3F);
        self.buf.push(0x80 + chunk.len() as u8);
        self.buf.extend_from_slice(chunk);
        self
    }

    /// Five-byte length check: `01 FF 05 <total u40 BE>`.
    pub fn length_check(&mut self, total: u64) -> &mut Self {
        self.buf.extend_from_slice(&[0x01, 0xFF, 0x05]);
        self.buf.extend_from_slice(&total.to_be_bytes()[3..]);
        self
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }
}

// ── File Builder ───────────────────────────────────────────────────

pub struct DataBlock {
    pub payload: Vec<u8>,
    pub skip_bytes: u16,
    /// Index separator key for this block; defaults to the block's first
    /// token path. Continuation blocks whose leading tokens do not
    /// re-establish the full path need an explicit key.
    pub separator: Option<Vec<Vec<u8>>>,
}

pub struct Fp5Builder {
    pub magic_ok: bool,
    pub version: String,
    pub db_name: String,
    pub data_blocks: Vec<DataBlock>,
    /// Physical placement of the data blocks (indices into
    /// `data_blocks`); defaults to chain order.
    pub physical_order: Option<Vec<usize>>,
}

impl Fp5Builder {
    pub fn new() -> Self {
        Self {
            magic_ok: true,
            version: "Pro 5.0".into(),
            db_name: "testdb".into(),
            data_blocks: Vec::new(),
            physical_order: None,
        }
    }

    pub fn data_block(&mut self, payload: Vec<u8>) -> &mut Self {
        self.data_blocks.push(DataBlock {
            payload,
            skip_bytes: 0,
            separator: None,
        });
        self
    }

    pub fn data_block_with_skip(&mut self, payload: Vec<u8>, skip_bytes: u16) -> &mut Self {
        self.data_blocks.push(DataBlock {
            payload,
            skip_bytes,
            separator: None,
        });
        self
    }

    pub fn data_block_with_separator(
        &mut self,
        payload: Vec<u8>,
        separator: Vec<Vec<u8>>,
    ) -> &mut Self {
        self.data_blocks.push(DataBlock {
            payload,
            skip_bytes: 0,
            separator: Some(separator),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let block_count = self.data_blocks.len();
        assert!(block_count > 0, "a fixture needs at least one data block");

        // Data block ids: 2, 3, ... in chain order.
        let ids: Vec<u32> = (0..block_count as u32).map(|i| i + 2).collect();
        let largest_id = *ids.last().unwrap();

        // ── Header blocks ──
        let mut file = vec![0u8; ROOT_OFFSET];
        if self.magic_ok {
            file[..fp5dump::fp5::file::MAGIC.len()].copy_from_slice(&fp5dump::fp5::file::MAGIC);
        }
        let version = self.version.as_bytes();
        file[fp5dump::fp5::file::VERSION_OFFSET] = version.len() as u8;
        file[fp5dump::fp5::file::VERSION_OFFSET + 1..][..version.len()]
            .copy_from_slice(version);
        let name = self.db_name.as_bytes();
        file[fp5dump::fp5::file::DB_NAME_OFFSET] = name.len() as u8;
        file[fp5dump::fp5::file::DB_NAME_OFFSET + 1..][..name.len()].copy_from_slice(name);

        // ── Root index block ──
        let root_payload = self.root_payload(&ids);
        file.extend_from_slice(&raw_block(0x00, 1, 0, largest_id, 0, &root_payload));

        // ── Data blocks ──
        let order: Vec<usize> = match &self.physical_order {
            Some(order) => order.clone(),
            None => (0..block_count).collect(),
        };
        assert_eq!(order.len(), block_count);

        for &chain_index in &order {
            let block = &self.data_blocks[chain_index];
            let prev = if chain_index == 0 {
                0
            } else {
                ids[chain_index - 1]
            };
            let next = if chain_index + 1 < block_count {
                ids[chain_index + 1]
            } else {
                0
            };
            file.extend_from_slice(&raw_block(
                0x00,
                0,
                prev,
                next,
                block.skip_bytes,
                &block.payload,
            ));
        }

        file
    }

    /// Leftmost pointer, separators from each later block's first token
    /// path, end-of-range sentinel.
    fn root_payload(&self, ids: &[u32]) -> Vec<u8> {
        let mut payload = vec![0x00, 0x04];
        payload.extend_from_slice(&ids[0].to_be_bytes());

        let mut current: Vec<Vec<u8>> = Vec::new();
        for (index, block) in self.data_blocks.iter().enumerate().skip(1) {
            let segments = match &block.separator {
                Some(separator) => separator.clone(),
                None => first_token_path(&block.payload).segments().to_vec(),
            };
            if segments.is_empty() {
                continue;
            }
            let (last, prefix) = segments.split_last().unwrap();

            // Move the path stack to the separator's prefix.
            let common = current
                .iter()
                .zip(prefix)
                .take_while(|(a, b)| a == b)
                .count();
            for _ in common..current.len() {
                payload.push(0xC0);
            }
            for segment in &prefix[common..] {
                payload.push(0xC0 + segment.len() as u8);
                payload.extend_from_slice(segment);
            }
            current = prefix.to_vec();

            // Separator entry: reference bytes are the last segment.
            payload.push(last.len() as u8);
            payload.extend_from_slice(last);
            payload.push(0x04);
            payload.extend_from_slice(&ids[index].to_be_bytes());
        }

        for _ in 0..current.len() {
            payload.push(0xC0);
        }

        // End-of-range sentinel pointing at the last block.
        payload.extend_from_slice(&[0x02, 0xFF, 0xFE, 0x04]);
        payload.extend_from_slice(&ids[ids.len() - 1].to_be_bytes());

        payload
    }
}

fn raw_block(deleted: u8, level: u8, prev: u32, next: u32, skip: u16, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 0x3F2, "payload too large for one block");
    let mut block = vec![deleted, level];
    block.extend_from_slice(&prev.to_be_bytes());
    block.extend_from_slice(&next.to_be_bytes());
    block.extend_from_slice(&skip.to_be_bytes());
    block.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    block.extend_from_slice(payload);
    block.resize(BLOCK_SIZE, 0);
    block
}

// ── Standard Fixture ───────────────────────────────────────────────

/// Catalog: four fields; three records; record index. Data spread over
/// three blocks so the index navigator and cross-block scans are
/// exercised.
///
/// Fields: 1 "Name" TEXT, 2 "Betrag" NUMBER, 3 "Tags" TEXT x3,
/// 4 "Geheim" TEXT (unstored).
pub fn standard_file() -> Vec<u8> {
    let mut builder = Fp5Builder::new();

    // ── Block 1: the 03 schema subtree ──
    let mut w = TokenWriter::new();
    w.push(&[0x03]);

    // 03/01: name -> (flag, field id VLI)
    w.push(&[0x01]);
    w.leaf_long_ref(b"Name", &[0x00, 0x01]);
    w.leaf_long_ref(b"Betrag", &[0x00, 0x02]);
    w.leaf_long_ref(b"Tags", &[0x00, 0x03]);
    w.leaf_long_ref(b"Geheim", &[0x00, 0x04]);
    w.pop();

    // 03/02: type code -> inline list of field ids
    w.push(&[0x02]);
    w.push(&[0x01]); // TEXT
    w.inline_entry(&[0x01]);
    w.inline_entry(&[0x03]);
    w.inline_entry(&[0x04]);
    w.pop();
    w.push(&[0x02]); // NUMBER
    w.inline_entry(&[0x02]);
    w.pop();
    w.pop();

    // 03/03: order number -> field id
    w.push(&[0x03]);
    w.leaf_long_ref(&[0x00, 0x01], &[0x00, 0x01]);
    w.leaf_long_ref(&[0x00, 0x02], &[0x00, 0x02]);
    w.leaf_long_ref(&[0x00, 0x03], &[0x00, 0x03]);
    w.leaf_long_ref(&[0x00, 0x04], &[0x00, 0x04]);
    w.pop();

    // 03/05/<id>: options (01 label, 02 flags)
    w.push(&[0x05]);
    for (id, label, repetitions, stored, indexed) in [
        (0x01u8, &b"Name"[..], 1u8, true, true),
        (0x02, &b"Betrag"[..], 1, true, false),
        (0x03, &b"Tags"[..], 3, true, false),
        (0x04, &b"Geheim"[..], 1, false, false),
    ] {
        w.push(&[id]);
        w.leaf_short(0x01, label);
        w.leaf_short(0x02, &option_flags(stored, indexed, repetitions));
        w.pop();
    }
    w.pop();

    w.pop(); // close 03
    builder.data_block(w.into_payload());

    // ── Block 2: records 1 and 2 ──
    let mut w = TokenWriter::new();
    w.push(&[0x05]);

    w.push(&[0x01]); // record 1
    w.leaf_short(0x01, b"Alice");
    w.leaf_short(0x02, b"1,234.50");
    w.leaf_long_ref(&[0x03, 0x01], b"red");
    w.leaf_long_ref(&[0x03, 0x03], b"blue");
    w.leaf_long_ref(&[0xFC], &[0x05]); // mod id 5
    w.pop();

    w.push(&[0x02]); // record 2
    w.leaf_short(0x01, b"Bob");
    w.leaf_long_ref(&[0xFC], &[0x07]); // mod id 7
    w.pop();

    builder.data_block(w.into_payload()); // leaves 05 open across the boundary

    // ── Block 3: record 3, record index, end of chain ──
    let mut w = TokenWriter::new();
    w.push(&[0x03]); // record 3
    w.leaf_short(0x01, b"Carol");
    w.leaf_short(0x02, b"17");
    w.leaf_long_ref(&[0xFC], &[0x09]); // mod id 9
    w.pop();
    w.pop(); // close 05

    w.push(&[0x0D]); // record index
    w.inline_entry(&[0x01]);
    w.inline_entry(&[0x02]);
    w.inline_entry(&[0x03]);
    w.pop();

    w.pop(); // end-of-chain marker
    builder.data_block_with_separator(w.into_payload(), vec![vec![0x05], vec![0x03]]);

    builder.build()
}

pub fn option_flags(stored: bool, indexed: bool, repetitions: u8) -> Vec<u8> {
    let mut flags = vec![0u8; 12];
    flags[0] = if stored { 0x01 } else { 0x80 };
    flags[2] = u8::from(indexed);
    flags[11] = repetitions;
    flags
}

/// Write bytes to a temp file and return the handle plus path.
pub fn write_temp(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("fixture.fp5");
    std::fs::write(&path, bytes).unwrap();
    (dir, path)
}
