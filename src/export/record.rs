//! Record assembly: from yielded record nodes to typed rows.
//!
//! Each record arrives as `(record-id VLI, node)` from the token stream.
//! Direct leaf entries carry combined `field-ref [sub-ref]` keys; long
//! values arrive as sub-nodes keyed by the field reference. Sub-refs are
//! the 1-based repetition counters of array-valued fields.

use tracing::{debug, warn};

use crate::export::coerce::{self, Cell, CellValue, CoerceErrors};
use crate::export::definition::ExportDefinition;
use crate::export::locale::{TextEncoding, ValueParsers};
use crate::fp5::file::{records_path, Fp5File};
use crate::fp5::token::{SubNodes, Value, MOD_ID_REF};
use crate::vli;

/// One assembled record: raw cells by column ordinal.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub id_bytes: Vec<u8>,
    pub mod_id: i64,
    pub raw: Vec<Option<RawCell>>,
}

/// Raw (undecoded) cell content.
#[derive(Debug, Clone)]
pub enum RawCell {
    Scalar(Vec<u8>),
    Array(Vec<Option<Vec<u8>>>),
}

/// One fully coerced row.
#[derive(Debug, Clone)]
pub struct CoercedRow {
    pub id: u64,
    pub mod_id: i64,
    pub cells: Vec<Cell>,
}

// ── Record Stream ──────────────────────────────────────────────────

/// Streaming record iterator over the `05` subtree.
pub struct RecordStream<'a> {
    inner: SubNodes<'a>,
    definition: &'a ExportDefinition,
}

/// Open a record stream, optionally resuming at `first_record` (VLI id
/// bytes) and pruned to the definition's fields.
pub fn record_stream<'a>(
    file: &'a Fp5File,
    definition: &'a ExportDefinition,
    first_record: Option<&[u8]>,
) -> crate::error::Result<RecordStream<'a>> {
    let search = records_path();
    let start_node = first_record.map(|rid| {
        let mut path = records_path();
        path.push(rid.to_vec());
        path
    });
    let inner = file.sub_nodes(search, true, start_node, Some(definition.token_filter()))?;
    Ok(RecordStream { inner, definition })
}

impl Iterator for RecordStream<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (id_bytes, value) = self.inner.next()?;
            let Value::Node(node) = value else {
                debug!(id = %hex(&id_bytes), "record entry is not a node, skipping");
                continue;
            };
            let Some(id) = vli::decode(&id_bytes, false) else {
                warn!(id = %hex(&id_bytes), "record id is not a valid VLI, skipping");
                continue;
            };

            let mut record = Record {
                id,
                id_bytes: id_bytes.clone(),
                mod_id: 0,
                raw: vec![None; self.definition.columns.len()],
            };

            for (key, value) in &node {
                if key.as_slice() == MOD_ID_REF {
                    if let Some(bytes) = value.as_bytes() {
                        record.mod_id = vli::be_uint(bytes) as i64;
                    }
                    continue;
                }

                let raw_value: &[u8] = match value {
                    Value::Bytes(bytes) => bytes,
                    // A reassembled long value closed without a trailing
                    // node: stored under its own reference sub-node.
                    Value::Node(sub) => match sub.get(&[0x01][..]).and_then(Value::as_bytes) {
                        Some(bytes) => bytes,
                        None => continue,
                    },
                    Value::List(_) => continue,
                };

                let Some((head, sub)) = vli::split(key) else {
                    continue;
                };
                let Some(field_id) = vli::decode(head, false) else {
                    continue;
                };
                let sub_ref = sub.and_then(|s| vli::decode(s, false)).unwrap_or(1);

                self.route(&mut record, field_id, sub_ref, raw_value);
            }

            return Some(record);
        }
    }
}

impl RecordStream<'_> {
    fn route(&self, record: &mut Record, field_id: u64, sub_ref: u64, value: &[u8]) {
        let Some(column) = self.definition.column_for(field_id) else {
            return;
        };
        let slot = &mut record.raw[column.ordinal as usize];

        if column.split_lines {
            *slot = Some(RawCell::Array(
                split_lines(value).into_iter().map(Some).collect(),
            ));
        } else if let Some(subscript) = column.subscript {
            if sub_ref == u64::from(subscript) {
                *slot = Some(RawCell::Scalar(value.to_vec()));
            }
        } else if column.field.repetitions > 1 {
            let repetitions = column.field.repetitions as usize;
            if !matches!(slot, Some(RawCell::Array(_))) {
                *slot = Some(RawCell::Array(vec![None; repetitions]));
            }
            let Some(RawCell::Array(array)) = slot else {
                unreachable!()
            };
            let index = sub_ref.saturating_sub(1) as usize;
            if index < array.len() {
                array[index] = Some(value.to_vec());
            } else {
                warn!(
                    record_id = record.id,
                    field_id,
                    sub_ref,
                    repetitions,
                    "repetition slot out of range"
                );
            }
        } else {
            *slot = Some(RawCell::Scalar(value.to_vec()));
        }
    }
}

/// Split a raw value on line feeds, dropping a trailing carriage return
/// per line. An empty value yields no lines.
fn split_lines(value: &[u8]) -> Vec<Vec<u8>> {
    if value.is_empty() {
        return Vec::new();
    }
    value
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
        .collect()
}

// ── Coercion Driver ────────────────────────────────────────────────

/// Coerce an assembled record into a typed row. Failed cells become NULL,
/// get sampled into `errors`, and rewrite the row's modification id to -1
/// so update mode re-examines the record later.
pub fn coerce_record(
    record: &Record,
    definition: &ExportDefinition,
    encoding: TextEncoding,
    parsers: &dyn ValueParsers,
    errors: &mut CoerceErrors,
) -> CoercedRow {
    let mut cells = Vec::with_capacity(definition.columns.len());
    let mut failed = false;

    for column in &definition.columns {
        let raw = &record.raw[column.ordinal as usize];
        let cell = match raw {
            None => Cell::Scalar(CellValue::Null),
            Some(RawCell::Scalar(bytes)) => {
                let text = encoding.decode(bytes);
                match coerce::coerce_scalar(&text, column, parsers) {
                    Ok(value) => Cell::Scalar(value),
                    Err(_) => {
                        errors.record(column.field_id(), record.id, &text);
                        failed = true;
                        Cell::Scalar(CellValue::Null)
                    }
                }
            }
            Some(RawCell::Array(slots)) => {
                let mut elements = Vec::with_capacity(slots.len());
                for slot in slots {
                    match slot {
                        None => elements.push(CellValue::Null),
                        Some(bytes) if bytes.is_empty() => elements.push(CellValue::Null),
                        Some(bytes) => {
                            let text = encoding.decode(bytes);
                            match coerce::coerce_scalar(&text, column, parsers) {
                                Ok(value) => elements.push(value),
                                Err(_) => {
                                    errors.record(column.field_id(), record.id, &text);
                                    failed = true;
                                    elements.push(CellValue::Null);
                                }
                            }
                        }
                    }
                }
                Cell::Array(elements)
            }
        };
        cells.push(cell);
    }

    CoercedRow {
        id: record.id,
        mod_id: if failed { -1 } else { record.mod_id },
        cells,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
