//! PostgreSQL v3 binary COPY encoder.
//!
//! Stream layout:
//!
//! ```text
//! "PGCOPY\n\xFF\r\n\0"            11-byte signature
//! [flags: u32 = 0]
//! [header extension length: u32 = 0]
//! per row:
//!   [field count: u16]
//!   per field: [length: u32][bytes] or 0xFFFFFFFF for NULL
//! [trailer: 0xFFFF]
//! ```
//!
//! 1-D arrays frame as `<ndim=1><hasnulls><element_oid><dim_len><lower=1>`
//! followed by the length-prefixed elements, all inside the field's
//! length. Dates are days since 2000-01-01 (i32), times microseconds
//! since midnight (i64), numerics the base-10000 digit-group format.

use chrono::NaiveDate;

use crate::export::coerce::{Cell, CellValue, PgNumeric};
use crate::export::definition::{ColumnType, ExportDefinition};
use crate::export::record::CoercedRow;

/// 11-byte stream signature.
pub const COPY_SIGNATURE: &[u8; 11] = b"PGCOPY\n\xFF\r\n\0";

/// NULL field marker.
const NULL_FIELD: [u8; 4] = 0xFFFF_FFFFu32.to_be_bytes();

/// Numeric sign words.
const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;

fn pg_date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("fixed epoch")
}

/// Encode a numeric into its wire bytes (header plus digit groups).
pub fn numeric_bytes(numeric: &PgNumeric) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + numeric.digits.len() * 2);
    out.extend_from_slice(&(numeric.digits.len() as i16).to_be_bytes());
    out.extend_from_slice(&numeric.weight.to_be_bytes());
    let sign = if numeric.negative { NUMERIC_NEG } else { NUMERIC_POS };
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&numeric.dscale.to_be_bytes());
    for digit in &numeric.digits {
        out.extend_from_slice(&digit.to_be_bytes());
    }
    out
}

/// Wire bytes of one non-null scalar.
fn scalar_bytes(value: &CellValue) -> Option<Vec<u8>> {
    match value {
        CellValue::Null => None,
        CellValue::Text(text) => Some(text.as_bytes().to_vec()),
        CellValue::Enum(key) => Some(key.as_bytes().to_vec()),
        CellValue::Integer(v) => Some(v.to_be_bytes().to_vec()),
        CellValue::Bigint(v) => Some(v.to_be_bytes().to_vec()),
        CellValue::Numeric(n) => Some(numeric_bytes(n)),
        CellValue::Date(d) => {
            let days = d.signed_duration_since(pg_date_epoch()).num_days() as i32;
            Some(days.to_be_bytes().to_vec())
        }
        CellValue::TimeMicros(micros) => Some(micros.to_be_bytes().to_vec()),
        CellValue::Bool(b) => Some(vec![u8::from(*b)]),
        CellValue::Uuid(u) => Some(u.as_bytes().to_vec()),
    }
}

fn put_field(buf: &mut Vec<u8>, bytes: Option<Vec<u8>>) {
    match bytes {
        None => buf.extend_from_slice(&NULL_FIELD),
        Some(bytes) => {
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(&bytes);
        }
    }
}

fn put_array(buf: &mut Vec<u8>, elements: &[CellValue], column_type: &ColumnType) {
    let encoded: Vec<Option<Vec<u8>>> = elements.iter().map(scalar_bytes).collect();
    let has_nulls = encoded.iter().any(Option::is_none);

    let payload_len: usize = 20
        + encoded
            .iter()
            .map(|e| 4 + e.as_ref().map_or(0, Vec::len))
            .sum::<usize>();

    buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
    buf.extend_from_slice(&1u32.to_be_bytes()); // ndim
    buf.extend_from_slice(&u32::from(has_nulls).to_be_bytes());
    buf.extend_from_slice(&column_type.oid().to_be_bytes());
    buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    buf.extend_from_slice(&1u32.to_be_bytes()); // lower bound

    for element in encoded {
        put_field(buf, element);
    }
}

/// Row-by-row COPY stream encoder. The caller drains [`buffer`] whenever
/// it crosses the flush threshold.
///
/// [`buffer`]: CopyEncoder::buffer
pub struct CopyEncoder<'a> {
    definition: &'a ExportDefinition,
    buf: Vec<u8>,
}

impl<'a> CopyEncoder<'a> {
    pub fn new(definition: &'a ExportDefinition) -> Self {
        Self {
            definition,
            buf: Vec::new(),
        }
    }

    /// Signature plus the two zero header words.
    pub fn write_header(&mut self) {
        self.buf.extend_from_slice(COPY_SIGNATURE);
        self.buf.extend_from_slice(&0u32.to_be_bytes());
        self.buf.extend_from_slice(&0u32.to_be_bytes());
    }

    /// One row: `fm_id`, `fm_mod_id`, then every definition column.
    pub fn write_row(&mut self, row: &CoercedRow) {
        let field_count = (2 + self.definition.columns.len()) as u16;
        self.buf.extend_from_slice(&field_count.to_be_bytes());

        put_field(&mut self.buf, Some((row.id as i64).to_be_bytes().to_vec()));
        put_field(&mut self.buf, Some(row.mod_id.to_be_bytes().to_vec()));

        for (cell, column) in row.cells.iter().zip(&self.definition.columns) {
            match cell {
                Cell::Scalar(value) => put_field(&mut self.buf, scalar_bytes(value)),
                Cell::Array(elements) => put_array(&mut self.buf, elements, &column.column),
            }
        }
    }

    /// End-of-stream marker.
    pub fn write_trailer(&mut self) {
        self.buf.extend_from_slice(&(-1i16).to_be_bytes());
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
