//! Typed value coercion.
//!
//! Raw field bytes, decoded through the source encoding, become one of
//! the closed set of destination values. A failed coercion is never
//! fatal: the caller samples it into a bounded per-field error buffer,
//! the cell becomes NULL, and the record's modification id is rewritten
//! to -1 so a later run re-examines it.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Fp5Error, Result};
use crate::export::definition::{ColumnType, FieldExportDefinition};
use crate::export::locale::{NumberLocale, ValueParsers};

// ── PostgreSQL Numeric ─────────────────────────────────────────────

/// A parsed decimal in PostgreSQL's base-10000 wire shape.
///
/// `weight` counts the base-10000 groups of the integer part (zero when
/// the value is purely fractional); the leading integer group is
/// `digits[0]` whenever `weight > 0`. Trailing zero groups are trimmed,
/// `dscale` preserves the declared fraction width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNumeric {
    pub digits: Vec<u16>,
    pub weight: i16,
    pub negative: bool,
    pub dscale: u16,
}

impl PgNumeric {
    /// Render back to a plain decimal string (for the SQL text emitter).
    pub fn to_decimal_string(&self) -> String {
        let mut out = String::new();
        if self.negative {
            out.push('-');
        }

        let int_groups = self.weight.max(0) as usize;
        if int_groups == 0 {
            out.push('0');
        } else {
            for i in 0..int_groups {
                let group = self.digits.get(i).copied().unwrap_or(0);
                if i == 0 {
                    out.push_str(&group.to_string());
                } else {
                    out.push_str(&format!("{group:04}"));
                }
            }
        }

        if self.dscale > 0 {
            let mut frac = String::new();
            if self.weight < 0 {
                frac.push_str(&"0".repeat((-self.weight) as usize * 4));
            }
            for i in int_groups..self.digits.len() {
                frac.push_str(&format!("{:04}", self.digits[i]));
            }
            while frac.len() < self.dscale as usize {
                frac.push('0');
            }
            frac.truncate(self.dscale as usize);
            out.push('.');
            out.push_str(&frac);
        }

        out
    }
}

/// Scan a localized decimal numeral.
///
/// Leading whitespace, `+`, and leading zero digits are ignored; `-`
/// flips the sign; the thousands separator is ignored within the integer
/// part; any other byte terminates the scan. `None` when no digit was
/// seen.
pub fn parse_numeric(bytes: &[u8], locale: &NumberLocale) -> Option<PgNumeric> {
    let mut negative = false;
    let mut int_digits: Vec<u8> = Vec::new();
    let mut frac_digits: Vec<u8> = Vec::new();
    let mut in_fraction = false;
    let mut seen_digit = false;
    let mut started = false;

    for &b in bytes {
        match b {
            b' ' | b'\t' if !started => continue,
            b'+' => continue,
            b'-' => {
                negative = !negative;
                started = true;
            }
            b'0'..=b'9' => {
                started = true;
                seen_digit = true;
                if in_fraction {
                    frac_digits.push(b - b'0');
                } else if b != b'0' || !int_digits.is_empty() {
                    int_digits.push(b - b'0');
                }
            }
            _ if b == locale.decimal_point && !in_fraction => {
                started = true;
                in_fraction = true;
            }
            _ if b == locale.thousands_sep && !in_fraction => {
                started = true;
            }
            _ => break,
        }
    }

    if !seen_digit {
        return None;
    }

    let dscale = frac_digits.len() as u16;

    // Integer part: right-aligned base-10000 groups.
    let mut digits: Vec<u16> = Vec::new();
    let lead = int_digits.len() % 4;
    if lead > 0 {
        digits.push(group_value(&int_digits[..lead]));
    }
    for chunk in int_digits[lead..].chunks(4) {
        digits.push(group_value(chunk));
    }
    let mut weight = digits.len() as i16;

    // Fraction: left-aligned, zero-padded groups.
    for chunk in frac_digits.chunks(4) {
        let mut group = [0u8; 4];
        group[..chunk.len()].copy_from_slice(chunk);
        digits.push(group_value(&group));
    }

    // Trim zero groups from both ends; weight tracks the leading trim.
    while digits.first() == Some(&0) {
        digits.remove(0);
        weight -= 1;
    }
    while digits.last() == Some(&0) {
        digits.pop();
    }
    if digits.is_empty() {
        weight = 0;
    }

    Some(PgNumeric {
        digits,
        weight,
        negative,
        dscale,
    })
}

fn group_value(digits: &[u8]) -> u16 {
    digits.iter().fold(0u16, |acc, &d| acc * 10 + d as u16)
}

// ── Cell Values ────────────────────────────────────────────────────

/// A coerced destination value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Text(String),
    Integer(i32),
    Bigint(i64),
    Numeric(PgNumeric),
    Date(NaiveDate),
    /// Microseconds since midnight.
    TimeMicros(i64),
    Bool(bool),
    Uuid(Uuid),
    /// Resolved enum key.
    Enum(String),
}

/// One output cell: a scalar or a 1-D array of nullable elements.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Scalar(CellValue),
    Array(Vec<CellValue>),
}

fn time_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d{1,2}):(\d{1,2})(:\d{1,2})?\s*$").unwrap())
}

/// Coerce one decoded scalar to the column's declared type.
pub fn coerce_scalar(
    raw: &str,
    definition: &FieldExportDefinition,
    parsers: &dyn ValueParsers,
) -> Result<CellValue> {
    let fail = || Fp5Error::Coerce {
        target: definition.column.name(),
        value: raw.to_string(),
    };

    match &definition.column {
        ColumnType::Text => Ok(CellValue::Text(raw.replace('\0', ""))),
        ColumnType::Integer => {
            let value: i64 = raw.trim().parse().map_err(|_| fail())?;
            let value = i32::try_from(value).map_err(|_| fail())?;
            Ok(CellValue::Integer(value))
        }
        ColumnType::Bigint => Ok(CellValue::Bigint(raw.trim().parse().map_err(|_| fail())?)),
        ColumnType::Numeric => parsers
            .parse_decimal(raw)
            .map(CellValue::Numeric)
            .ok_or_else(fail),
        ColumnType::Date => parsers
            .parse_datetime(raw)
            .map(|dt| CellValue::Date(dt.date()))
            .ok_or_else(fail),
        ColumnType::Time => {
            let captures = time_pattern().captures(raw).ok_or_else(fail)?;
            let hours: i64 = captures[1].parse().map_err(|_| fail())?;
            let minutes: i64 = captures[2].parse().map_err(|_| fail())?;
            let seconds: i64 = captures
                .get(3)
                .map(|m| m.as_str()[1..].parse())
                .transpose()
                .map_err(|_| fail())?
                .unwrap_or(0);
            if hours > 23 || minutes > 59 || seconds > 59 {
                return Err(fail());
            }
            Ok(CellValue::TimeMicros(
                (hours * 3600 + minutes * 60 + seconds) * 1_000_000,
            ))
        }
        ColumnType::Boolean => match raw.to_lowercase().as_str() {
            "ja" | "yes" | "true" | "1" | "ok" => Ok(CellValue::Bool(true)),
            "nein" | "no" | "false" | "0" | "" => Ok(CellValue::Bool(false)),
            _ => Err(fail()),
        },
        ColumnType::Uuid => Uuid::parse_str(raw.trim())
            .map(CellValue::Uuid)
            .map_err(|_| fail()),
        ColumnType::Enum(_) => {
            let enum_def = definition.enum_def.as_ref().ok_or_else(fail)?;
            match enum_def.resolve(raw) {
                Some(Some(key)) => Ok(CellValue::Enum(key.to_string())),
                Some(None) => Ok(CellValue::Null),
                None => Err(fail()),
            }
        }
    }
}

// ── Error Sampling ─────────────────────────────────────────────────

/// Per-field cap on sampled coercion failures.
pub const ERROR_SAMPLE_CAP: usize = 100;

/// Bounded per-field buffer of coercion failures.
#[derive(Debug, Default)]
pub struct CoerceErrors {
    samples: HashMap<u64, Vec<(u64, String)>>,
}

impl CoerceErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure; drops samples past the per-field cap.
    pub fn record(&mut self, field_id: u64, record_id: u64, raw: &str) {
        let samples = self.samples.entry(field_id).or_default();
        if samples.len() < ERROR_SAMPLE_CAP {
            samples.push((record_id, raw.to_string()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn total(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }

    /// Log the collected samples, grouped by field.
    pub fn report(&self, columns: &[FieldExportDefinition]) {
        for column in columns {
            let Some(samples) = self.samples.get(&column.field_id()) else {
                continue;
            };
            let capped = if samples.len() == ERROR_SAMPLE_CAP { "+" } else { "" };
            warn!(
                field = %column.field.label,
                target = column.column.name(),
                errors = format_args!("{}{capped}", samples.len()),
                "coercion failures"
            );
            for (record_id, raw) in samples {
                warn!(record_id, value = %raw, "  failed sample");
            }
        }
    }
}
