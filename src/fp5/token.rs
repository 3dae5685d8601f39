//! Token stream traversal: folds the concatenated data-block payloads into
//! a lazy sequence of logical nodes.
//!
//! The data chain is one continuous token stream: path pushes (`0xC1..FE`)
//! and pops (`0xC0`) move through the logical tree, leaf tokens attach
//! `(reference -> value)` entries to the node at the current path, inline
//! array entries (`0x81..BF`) accumulate list values, and long values
//! arrive as counter-sequenced chunks closed by a five-byte length check.
//! A token's payload may run past its block's end; the remainder sits at
//! the start of the successor block's payload, whose `skip_bytes` header
//! field covers exactly that tail.
//!
//! [`SubNodes`] is the single consumer-facing iterator: give it a search
//! path and it yields `(key, value)` pairs in strictly increasing key
//! order: either the search node's children one by one, or the whole
//! node once. Scans start at the block named by the path index and stop
//! as soon as the current path exceeds the search path.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use tracing::{error, warn};

use crate::fp5::block;
use crate::fp5::chain::BlockChain;
use crate::fp5::path::TokenPath;
use crate::vli;

/// A logical node value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Scalar byte string (short data, or a reassembled long value).
    Bytes(Vec<u8>),
    /// Inline byte-array entries accumulated at one path (`0x81..BF`).
    List(Vec<Vec<u8>>),
    /// Interior node: insertion-ordered children.
    Node(Node),
}

pub type Node = IndexMap<Vec<u8>, Value>;

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Vec<u8>]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Reference bytes of the record modification id sub-token.
pub const MOD_ID_REF: &[u8] = &[0xFC];

/// Query parameters of one traversal.
pub struct SubNodesQuery {
    /// Path of the node whose content is wanted.
    pub search: Vec<Vec<u8>>,
    /// Yield each immediate child as it closes instead of the whole node.
    pub yield_children: bool,
    /// Resume point: yields begin at this node path (for incremental
    /// record scans).
    pub start_node: Option<Vec<Vec<u8>>>,
    /// Prune the traversal to these references/segments (the record
    /// modification id is always kept).
    pub token_filter: Option<HashSet<Vec<u8>>>,
}

/// Where a traversal begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBlock {
    /// Head of the data chain (full scan).
    Head,
    /// Block chosen by the path index.
    At(u32),
    /// The path index reported the path absent: yield nothing.
    Absent,
}

/// Lazy `(key, value)` iterator over one node's content. See module docs.
pub struct SubNodes<'a> {
    data: &'a [u8],
    chain: &'a BlockChain,
    query: SubNodesQuery,

    // Block cursor.
    chain_pos: usize,
    payload: &'a [u8],
    cursor: usize,
    loaded: bool,

    // Parse state.
    path: TokenPath,
    found: bool,
    node_stack: Vec<(Node, Vec<Vec<u8>>)>,
    current: Node,
    current_list: Vec<Vec<u8>>,
    long_acc: Option<Vec<Vec<u8>>>,
    skip_until: Option<usize>,

    pending: VecDeque<(Vec<u8>, Value)>,
    done: bool,
}

impl<'a> SubNodes<'a> {
    /// Start a traversal on `chain`, beginning at `start_block` (from the
    /// path index) or at the chain head.
    pub fn new(
        data: &'a [u8],
        chain: &'a BlockChain,
        start_block: StartBlock,
        query: SubNodesQuery,
    ) -> Self {
        let chain_pos = match start_block {
            StartBlock::Head => 0,
            StartBlock::At(id) => chain.position_of(id).unwrap_or(chain.len()),
            StartBlock::Absent => chain.len(),
        };
        let found = query.search.is_empty() && query.start_node.is_none();

        Self {
            data,
            chain,
            query,
            chain_pos,
            payload: &[],
            cursor: 0,
            loaded: false,
            path: TokenPath::new(),
            found,
            node_stack: Vec::new(),
            current: Node::new(),
            current_list: Vec::new(),
            long_acc: None,
            skip_until: None,
            pending: VecDeque::new(),
            done: false,
        }
    }

    // ── Block Cursor ──────────────────────────────────────────────

    /// Load the block at `chain_pos`; returns false at chain end.
    fn load_block(&mut self, skip_prefix: bool) -> bool {
        if self.chain_pos >= self.chain.len() {
            return false;
        }
        let entry = self.chain.entries()[self.chain_pos];
        let header = match block::header_at(self.data, entry.offset) {
            Ok(h) => h,
            Err(err) => {
                error!(block_id = entry.id, %err, "unreadable block in data chain");
                return false;
            }
        };
        match block::payload_at(self.data, entry.offset, &header, false) {
            Ok(payload) => {
                self.payload = payload;
                self.cursor = if skip_prefix {
                    (header.skip_bytes as usize).min(payload.len())
                } else {
                    0
                };
                true
            }
            Err(err) => {
                error!(block_id = entry.id, %err, "truncated block in data chain");
                false
            }
        }
    }

    /// Move to the next block of the chain, skipping its continuation
    /// prefix. Returns false at chain end.
    fn next_block(&mut self) -> bool {
        self.chain_pos += 1;
        self.load_block(true)
    }

    fn at_last_block(&self) -> bool {
        self.chain_pos + 1 >= self.chain.len()
    }

    /// Read `len` payload bytes starting at `start`, following a straddle
    /// into the successor block when the declared length crosses the
    /// payload end. Leaves the cursor past the value. `None` is a parse
    /// error (already logged).
    fn read_value(&mut self, start: usize, len: usize) -> Option<Vec<u8>> {
        let end = start + len;
        if end <= self.payload.len() {
            let value = self.payload[start..end].to_vec();
            self.cursor = end;
            return Some(value);
        }

        // Straddle: the tail sits at the start of the successor block,
        // which must declare it via skip_bytes.
        let need = end - self.payload.len();
        if start > self.payload.len() {
            error!(cursor = self.cursor, "token header crosses block boundary");
            return None;
        }
        let mut value = self.payload[start..].to_vec();

        if self.chain_pos + 1 >= self.chain.len() {
            error!(needed = need, "value continues past the last block");
            return None;
        }
        let entry = self.chain.entries()[self.chain_pos + 1];
        let header = match block::header_at(self.data, entry.offset) {
            Ok(h) => h,
            Err(err) => {
                error!(block_id = entry.id, %err, "unreadable continuation block");
                return None;
            }
        };
        if header.skip_bytes as usize != need {
            error!(
                block_id = entry.id,
                skip_bytes = header.skip_bytes,
                needed = need,
                "continuation block skip_bytes does not cover straddling value"
            );
            return None;
        }
        let payload = match block::payload_at(self.data, entry.offset, &header, false) {
            Ok(p) => p,
            Err(err) => {
                error!(block_id = entry.id, %err, "truncated continuation block");
                return None;
            }
        };
        if need > payload.len() {
            error!(block_id = entry.id, "continuation block shorter than straddling tail");
            return None;
        }

        value.extend_from_slice(&payload[..need]);
        self.chain_pos += 1;
        self.payload = payload;
        self.cursor = need;
        Some(value)
    }

    // ── Interest / Pruning ────────────────────────────────────────

    fn interested(&self) -> bool {
        self.found && self.skip_until.is_none()
    }

    /// Depth at which the token filter prunes whole sub-nodes.
    fn filter_depth(&self) -> usize {
        self.query.search.len() + if self.query.yield_children { 2 } else { 1 }
    }

    /// Whether a leaf entry with this combined reference survives the
    /// token filter at the current depth.
    fn keep_leaf(&self, combined: &[u8]) -> bool {
        let Some(filter) = &self.query.token_filter else {
            return true;
        };
        if combined == MOD_ID_REF {
            return true;
        }
        // Only direct members of a yielded child are filtered by
        // reference; deeper tokens were already pruned by path.
        if self.query.yield_children && self.path.len() != self.query.search.len() + 1 {
            return true;
        }
        match vli::split(combined) {
            Some((primary, _)) => filter.contains(primary),
            None => true,
        }
    }

    // ── Node Assembly ─────────────────────────────────────────────

    fn take_current_value(&mut self) -> Value {
        if !self.current.is_empty() {
            if !self.current_list.is_empty() {
                warn!("node mixes references and inline array entries, dropping the list");
                self.current_list.clear();
            }
            self.long_acc = None;
            Value::Node(std::mem::take(&mut self.current))
        } else if !self.current_list.is_empty() {
            self.long_acc = None;
            Value::List(std::mem::take(&mut self.current_list))
        } else if let Some(chunks) = self.long_acc.take() {
            Value::Bytes(chunks.concat())
        } else {
            Value::Node(Node::new())
        }
    }

    fn has_current_content(&self) -> bool {
        !self.current.is_empty() || !self.current_list.is_empty() || self.long_acc.is_some()
    }

    /// Abandon the in-flight node after a parse error and resume at the
    /// next block boundary.
    ///
    /// Best-effort recovery: the rest of the current block is lost, so
    /// the path stack is rewound to the search depth, where the next
    /// block normally opens the next sibling node.
    fn abort_node(&mut self) {
        self.current.clear();
        self.current_list.clear();
        self.long_acc = None;
        self.node_stack.clear();
        self.skip_until = None;
        if self.found {
            let depth = self.query.search.len();
            while self.path.len() > depth {
                self.path.pop();
            }
        } else {
            while self.path.pop().is_some() {}
        }
        if !self.next_block() {
            self.done = true;
        }
    }

    // ── Token Dispatch ────────────────────────────────────────────

    /// Consume one token (or advance to the next block).
    fn step(&mut self) {
        if self.cursor >= self.payload.len() {
            if !self.next_block() {
                self.done = true;
            }
            return;
        }

        // Fast-forward past non-structural tokens while outside the
        // region of interest.
        if !self.interested() {
            let byte = self.payload[self.cursor];
            if byte < 0xC0 || byte == 0xFF {
                self.skip_token();
                return;
            }
        }

        let byte = self.payload[self.cursor];
        match byte {
            0x01 if self.peek(1) == Some(0xFF) && self.peek(2) == Some(0x05) => {
                self.on_length_check()
            }
            0x00 => self.on_short_data_implicit_ref(),
            0x01..=0x3F => self.on_long_ref_short_data(byte),
            0x40..=0x7F => self.on_short_ref_short_data(byte),
            0x81..=0xBF => self.on_inline_array_entry(byte),
            0xC0 => self.on_pop(),
            0xC1..=0xFE => self.on_push(byte),
            0xFF => self.on_long_data(),
            _ => {
                error!(
                    path = %self.path,
                    byte,
                    cursor = self.cursor,
                    "unknown token byte, abandoning block"
                );
                self.abort_node();
            }
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.payload.get(self.cursor + ahead).copied()
    }

    /// Advance past one non-structural token without materializing it.
    fn skip_token(&mut self) {
        let byte = self.payload[self.cursor];
        let (start, len) = match byte {
            0x00 => match self.peek(1) {
                Some(len) => (self.cursor + 2, len as usize),
                None => return self.abort_parse("short token missing length byte"),
            },
            0x01..=0x3F => {
                let n = byte as usize;
                match self.peek(1 + n) {
                    Some(len) => (self.cursor + 2 + n, len as usize),
                    None => return self.abort_parse("reference token missing length byte"),
                }
            }
            0x40..=0x7F => match self.peek(1) {
                Some(len) => (self.cursor + 2, len as usize),
                None => return self.abort_parse("short token missing length byte"),
            },
            0x80 => return self.abort_parse("unknown token byte 0x80"),
            0x81..=0xBF => (self.cursor + 1, (byte - 0x80) as usize),
            0xFF => match self.peek(1) {
                Some(n @ 0x01..=0x04) => {
                    let n = n as usize;
                    match self.read_u16_at(self.cursor + 2 + n) {
                        Some(len) => (self.cursor + 4 + n, len as usize),
                        None => return self.abort_parse("long token missing length field"),
                    }
                }
                Some(0x40..=0xFE) => match self.read_u16_at(self.cursor + 2) {
                    Some(len) => (self.cursor + 4, len as usize),
                    None => return self.abort_parse("long token missing length field"),
                },
                _ => return self.abort_parse("unhandled 0xFF token"),
            },
            _ => unreachable!("path tokens are not skipped"),
        };

        // Jump the value, following a straddle if needed.
        if start + len <= self.payload.len() {
            self.cursor = start + len;
        } else if self.read_value(start, len).is_none() {
            self.abort_node();
        }
    }

    fn abort_parse(&mut self, message: &str) {
        error!(path = %self.path, cursor = self.cursor, "{message}");
        self.abort_node();
    }

    fn read_u16_at(&self, at: usize) -> Option<usize> {
        let hi = self.payload.get(at)?;
        let lo = self.payload.get(at + 1)?;
        Some(u16::from_be_bytes([*hi, *lo]) as usize)
    }

    // ── Token Handlers ────────────────────────────────────────────

    fn on_length_check(&mut self) {
        let Some(value) = self.read_value(self.cursor + 3, 5) else {
            return self.abort_node();
        };
        let mut check = 0u64;
        for b in &value {
            check = (check << 8) | *b as u64;
        }

        if let Some(chunks) = self.long_acc.take() {
            let joined: Vec<u8> = chunks.concat();
            if joined.len() as u64 != check {
                error!(
                    path = %self.path,
                    expected = check,
                    actual = joined.len(),
                    "length check failed for reassembled value"
                );
                return self.abort_node();
            }
            self.long_acc = Some(vec![joined]);
        } else if self.current.len() == 1 && self.current.contains_key(&[0x01][..]) {
            let entry = self.current.get(&[0x01][..]).and_then(Value::as_bytes);
            match entry {
                Some(bytes) if bytes.len() as u64 == check => {
                    let bytes = bytes.to_vec();
                    self.current.clear();
                    self.long_acc = Some(vec![bytes]);
                }
                _ => {
                    error!(path = %self.path, expected = check, "length check failed for node entry");
                    return self.abort_node();
                }
            }
        } else if self.current.len() == 2 && self.current.contains_key(&[0x01][..]) {
            // Two-entry node with keys 01 and 00: the check covers the 01
            // entry only; a mismatch there is logged but never fatal.
            let ok = self
                .current
                .get(&[0x01][..])
                .and_then(Value::as_bytes)
                .is_some_and(|b| b.len() as u64 == check);
            if !ok {
                warn!(path = %self.path, expected = check, "length check mismatch on two-entry node, keeping value");
            }
        } else {
            self.long_acc = None;
        }
    }

    fn on_short_data_implicit_ref(&mut self) {
        let Some(len) = self.peek(1) else {
            return self.abort_parse("short token missing length byte");
        };
        let Some(value) = self.read_value(self.cursor + 2, len as usize) else {
            return self.abort_node();
        };
        if self.long_acc.is_none() && self.keep_leaf(&[0x00]) {
            self.current.insert(vec![0x00], Value::Bytes(value));
        }
    }

    fn on_long_ref_short_data(&mut self, byte: u8) {
        let n = byte as usize;
        if self.cursor + 1 + n > self.payload.len() {
            return self.abort_parse("reference bytes overrun payload");
        }
        let combined = self.payload[self.cursor + 1..self.cursor + 1 + n].to_vec();
        let Some(len) = self.peek(1 + n) else {
            return self.abort_parse("reference token missing length byte");
        };
        let Some(value) = self.read_value(self.cursor + 2 + n, len as usize) else {
            return self.abort_node();
        };

        match &mut self.long_acc {
            Some(chunks) => {
                // Continuation chunk: the reference slot carries the counter.
                let counter = vli::decode(&combined, false);
                if counter != Some(chunks.len() as u64 + 1) {
                    error!(
                        path = %self.path,
                        counter = ?counter,
                        expected = chunks.len() + 1,
                        "wrong partial data counter"
                    );
                    return self.abort_node();
                }
                chunks.push(value);
            }
            None => {
                if self.keep_leaf(&combined) {
                    self.current.insert(combined, Value::Bytes(value));
                }
            }
        }
    }

    fn on_short_ref_short_data(&mut self, byte: u8) {
        let Some(len) = self.peek(1) else {
            return self.abort_parse("short token missing length byte");
        };
        let Some(value) = self.read_value(self.cursor + 2, len as usize) else {
            return self.abort_node();
        };

        match &mut self.long_acc {
            Some(chunks) => {
                let counter = (byte - 0x40) as u64;
                if counter != chunks.len() as u64 + 1 {
                    error!(
                        path = %self.path,
                        counter,
                        expected = chunks.len() + 1,
                        "wrong partial data counter"
                    );
                    return self.abort_node();
                }
                chunks.push(value);
            }
            None => {
                let reference = vec![byte & 0xBF];
                if self.keep_leaf(&reference) {
                    self.current.insert(reference, Value::Bytes(value));
                }
            }
        }
    }

    fn on_inline_array_entry(&mut self, byte: u8) {
        let len = (byte - 0x80) as usize;
        let Some(value) = self.read_value(self.cursor + 1, len) else {
            return self.abort_node();
        };
        self.current_list.push(value);
    }

    fn on_long_data(&mut self) {
        let Some(marker) = self.peek(1) else {
            return self.abort_parse("truncated 0xFF token");
        };

        let (counter, data_start, data_len) = match marker {
            0x01..=0x04 => {
                let n = marker as usize;
                if self.cursor + 2 + n > self.payload.len() {
                    return self.abort_parse("long token reference overruns payload");
                }
                let reference = &self.payload[self.cursor + 2..self.cursor + 2 + n];
                let counter = vli::decode(reference, false);
                let Some(len) = self.read_u16_at(self.cursor + 2 + n) else {
                    return self.abort_parse("long token missing length field");
                };
                (counter, self.cursor + 4 + n, len)
            }
            0x40..=0xFE => {
                let counter = Some((marker - 0x40) as u64);
                let Some(len) = self.read_u16_at(self.cursor + 2) else {
                    return self.abort_parse("long token missing length field");
                };
                (counter, self.cursor + 4, len)
            }
            _ => return self.abort_parse("unhandled 0xFF token"),
        };

        let Some(value) = self.read_value(data_start, data_len) else {
            return self.abort_node();
        };

        let chunks = self.long_acc.get_or_insert_with(Vec::new);
        match counter {
            Some(c) if c == chunks.len() as u64 + 1 => {}
            _ => warn!(
                path = %self.path,
                counter = ?counter,
                expected = chunks.len() + 1,
                "long value counter out of sequence"
            ),
        }
        chunks.push(value);
    }

    fn on_pop(&mut self) {
        // End of chain: the final pop closes the stream.
        if self.at_last_block() && self.cursor + 1 == self.payload.len() {
            self.done = true;
            return;
        }

        if self.found && self.path.len() == self.query.search.len() {
            // The search node itself closes: emit and stop.
            if self.query.yield_children {
                let value = self.take_current_value();
                if let Value::Node(node) = value {
                    for (k, v) in node {
                        self.pending.push_back((k, v));
                    }
                } else if let Value::List(list) = value {
                    for item in list {
                        self.pending.push_back((item, Value::Bytes(Vec::new())));
                    }
                }
            } else {
                let key = self.query.search.last().cloned().unwrap_or_default();
                let value = self.take_current_value();
                self.pending.push_back((key, value));
            }
            self.done = true;
            return;
        }

        if self.query.yield_children
            && self.found
            && self.path.len() == self.query.search.len() + 1
            && self.interested()
            && self.has_current_content()
        {
            let key = self.path.last().expect("path non-empty at child close").to_vec();
            let value = self.take_current_value();
            self.pending.push_back((key, value));
        }

        let was_interested = self.interested();
        let Some(segment) = self.path.pop() else {
            // A pop for a segment opened before this scan's start block:
            // structural no-op.
            self.cursor += 1;
            return;
        };

        if let Some(depth) = self.skip_until {
            if self.path.len() == depth {
                self.skip_until = None;
            }
        } else if was_interested {
            if let Some((parent, parent_list)) = self.node_stack.pop() {
                let closing = if self.has_current_content() {
                    Some(self.take_current_value())
                } else {
                    None
                };
                self.current = parent;
                self.current_list = parent_list;
                if let Some(value) = closing {
                    self.current.insert(segment, value);
                }
            }
        }

        self.cursor += 1;
    }

    fn on_push(&mut self, byte: u8) {
        let len = (byte - 0xC0) as usize;
        if self.cursor + 1 + len > self.payload.len() {
            return self.abort_parse("path push overruns payload");
        }
        let segment = self.payload[self.cursor + 1..self.cursor + 1 + len].to_vec();
        self.path.push(segment.clone());
        self.cursor += 1 + len;

        // The data is sorted: past the search subtree, stop.
        if self.path.truncated_cmp(&self.query.search) == std::cmp::Ordering::Greater {
            self.done = true;
            return;
        }

        if !self.found {
            let target = self
                .query
                .start_node
                .as_deref()
                .unwrap_or(&self.query.search);
            if self.path.starts_with(target) {
                self.found = true;
            }
        }

        if self.interested() {
            if let Some(filter) = &self.query.token_filter {
                if self.path.len() == self.filter_depth() && !filter.contains(&segment) {
                    self.skip_until = Some(self.path.len() - 1);
                    return;
                }
            }

            // An open long value becomes a node entry under key 01 when a
            // sub-node opens inside it.
            if let Some(chunks) = self.long_acc.take() {
                self.current.insert(vec![0x01], Value::Bytes(chunks.concat()));
            }
            let parent = std::mem::take(&mut self.current);
            let parent_list = std::mem::take(&mut self.current_list);
            self.node_stack.push((parent, parent_list));
        }
    }
}

impl<'a> Iterator for SubNodes<'a> {
    type Item = (Vec<u8>, Value);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            if !self.loaded {
                self.loaded = true;
                if !self.load_block(false) {
                    self.done = true;
                    continue;
                }
            }
            self.step();
        }
    }
}
