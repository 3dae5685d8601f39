//! Text-SQL emitter: a PostgreSQL script with enum DDL, table DDL and
//! batched `INSERT` statements.
//!
//! String literals use escape syntax (`E'…'`, no dollar quoting); enums
//! are created empty and populated through `ALTER TYPE … ADD VALUE IF NOT
//! EXISTS` so re-running a script against an existing type stays safe.

use std::io::Write;

use tracing::info;

use crate::error::Result;
use crate::export::coerce::{Cell, CellValue, CoerceErrors};
use crate::export::definition::{ColumnType, ExportDefinition};
use crate::export::locale::ValueParsers;
use crate::export::progress::Progress;
use crate::export::record::{self, CoercedRow};
use crate::fp5::file::Fp5File;

/// Rows per `INSERT` statement.
pub const INSERT_BATCH_ROWS: usize = 1000;

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a string into `E'…'` body form:
/// `\ ' \b \f \n \r \t` escape, NUL drops.
pub fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => {}
            _ => out.push(ch),
        }
    }
    out
}

/// Render one scalar value as an SQL literal (no casts).
fn scalar_literal(value: &CellValue) -> String {
    match value {
        CellValue::Null => "NULL".into(),
        CellValue::Text(text) => format!("E'{}'", escape_literal(text)),
        CellValue::Integer(v) => v.to_string(),
        CellValue::Bigint(v) => v.to_string(),
        CellValue::Numeric(n) => n.to_decimal_string(),
        CellValue::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        CellValue::TimeMicros(micros) => {
            let seconds = micros / 1_000_000;
            format!(
                "'{:02}:{:02}:{:02}'",
                seconds / 3600,
                (seconds / 60) % 60,
                seconds % 60
            )
        }
        CellValue::Bool(true) => "TRUE".into(),
        CellValue::Bool(false) => "FALSE".into(),
        CellValue::Uuid(u) => format!("'{u}'"),
        CellValue::Enum(key) => format!("E'{}'", escape_literal(key)),
    }
}

fn cell_sql(cell: &Cell, column_type: &ColumnType) -> String {
    match cell {
        Cell::Scalar(CellValue::Enum(key)) => {
            format!("E'{}'::{}", escape_literal(key), column_type.sql_type())
        }
        Cell::Scalar(value) => scalar_literal(value),
        Cell::Array(elements) => {
            let rendered: Vec<String> = elements.iter().map(scalar_literal).collect();
            format!(
                "ARRAY[{}]::{}[]",
                rendered.join(", "),
                column_type.sql_type()
            )
        }
    }
}

// ── Script Writer ──────────────────────────────────────────────────

/// Incremental script writer: prelude once, then rows in batches.
pub struct SqlScriptWriter<'a, W: Write> {
    out: W,
    definition: &'a ExportDefinition,
    table: String,
    rows_in_batch: usize,
}

impl<'a, W: Write> SqlScriptWriter<'a, W> {
    pub fn new(out: W, definition: &'a ExportDefinition, table: &str) -> Self {
        Self {
            out,
            definition,
            table: table.to_string(),
            rows_in_batch: 0,
        }
    }

    /// Enum DDL, `DROP TABLE`, `CREATE TABLE`.
    pub fn write_prelude(&mut self) -> Result<()> {
        for enum_def in self.definition.enums() {
            let name = quote_ident(&enum_def.name);
            writeln!(self.out, "CREATE TYPE {name} AS ENUM();")?;
            for key in enum_def.values.keys().filter(|k| *k != "NULL") {
                writeln!(
                    self.out,
                    "ALTER TYPE {name} ADD VALUE IF NOT EXISTS '{}';",
                    key.replace('\'', "''")
                )?;
            }
            writeln!(self.out)?;
        }

        let table = quote_ident(&self.table);
        writeln!(self.out, "DROP TABLE IF EXISTS {table};")?;
        writeln!(self.out, "CREATE TABLE IF NOT EXISTS {table} (")?;
        writeln!(self.out, "\t\"fm_id\" bigint,")?;
        writeln!(self.out, "\t\"fm_mod_id\" bigint,")?;
        for column in &self.definition.columns {
            let array = if column.is_array { "[]" } else { "" };
            writeln!(
                self.out,
                "\t{} {}{array},",
                quote_ident(&column.field.label),
                column.column.sql_type()
            )?;
        }
        writeln!(
            self.out,
            "\tCONSTRAINT {} PRIMARY KEY (\"fm_id\")",
            quote_ident(&format!("_{}_pkey", self.table))
        )?;
        writeln!(self.out, ");")?;
        Ok(())
    }

    pub fn write_row(&mut self, row: &CoercedRow) -> Result<()> {
        if self.rows_in_batch == 0 {
            let columns: Vec<String> = ["fm_id", "fm_mod_id"]
                .into_iter()
                .map(quote_ident)
                .chain(
                    self.definition
                        .columns
                        .iter()
                        .map(|c| quote_ident(&c.field.label)),
                )
                .collect();
            write!(
                self.out,
                "\nINSERT INTO {} ({}) VALUES",
                quote_ident(&self.table),
                columns.join(", ")
            )?;
        } else {
            write!(self.out, ",")?;
        }

        write!(self.out, "\n\t({}, {}", row.id, row.mod_id)?;
        for (cell, column) in row.cells.iter().zip(&self.definition.columns) {
            write!(self.out, ", {}", cell_sql(cell, &column.column))?;
        }
        write!(self.out, ")")?;

        self.rows_in_batch += 1;
        if self.rows_in_batch >= INSERT_BATCH_ROWS {
            self.end_batch()?;
        }
        Ok(())
    }

    fn end_batch(&mut self) -> Result<()> {
        if self.rows_in_batch > 0 {
            writeln!(self.out, ";")?;
            self.rows_in_batch = 0;
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.end_batch()?;
        self.out.flush()?;
        Ok(())
    }
}

// ── Run Driver ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ExportStats {
    pub processed: usize,
    pub failed_cells: usize,
}

/// Stream every record through coercion into an SQL script.
pub fn dump_records<W: Write>(
    file: &Fp5File,
    definition: &ExportDefinition,
    parsers: &dyn ValueParsers,
    table: &str,
    out: W,
    show_progress: bool,
) -> Result<ExportStats> {
    let mut writer = SqlScriptWriter::new(out, definition, table);
    writer.write_prelude()?;

    let mut errors = CoerceErrors::new();
    let mut progress = Progress::new(file.records_count(), show_progress);

    for record in record::record_stream(file, definition, None)? {
        let row = record::coerce_record(&record, definition, file.encoding, parsers, &mut errors);
        writer.write_row(&row)?;
        progress.tick();
    }

    writer.finish()?;
    progress.finish();
    errors.report(&definition.columns);

    let stats = ExportStats {
        processed: progress.processed(),
        failed_cells: errors.total(),
    };
    info!(records = stats.processed, table, "dumped records");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_table() {
        assert_eq!(escape_literal(r"a\b"), r"a\\b");
        assert_eq!(escape_literal("it's"), r"it\'s");
        assert_eq!(escape_literal("a\nb\tc\rd"), r"a\nb\tc\rd");
        assert_eq!(escape_literal("nul\0gone"), "nulgone");
        assert_eq!(escape_literal("a\u{8}\u{c}b"), r"a\b\fb");
    }

    #[test]
    fn test_scalar_literals() {
        assert_eq!(scalar_literal(&CellValue::Null), "NULL");
        assert_eq!(scalar_literal(&CellValue::Bool(true)), "TRUE");
        assert_eq!(scalar_literal(&CellValue::Integer(-5)), "-5");
        assert_eq!(
            scalar_literal(&CellValue::TimeMicros(86_399_000_000)),
            "'23:59:59'"
        );
        assert_eq!(
            scalar_literal(&CellValue::Text("O'Neil".into())),
            r"E'O\'Neil'"
        );
    }

    #[test]
    fn test_array_cell_casts() {
        let cell = Cell::Array(vec![
            CellValue::Text("a".into()),
            CellValue::Null,
        ]);
        assert_eq!(
            cell_sql(&cell, &ColumnType::Text),
            "ARRAY[E'a', NULL]::text[]"
        );
    }

    #[test]
    fn test_enum_scalar_cast() {
        let cell = Cell::Scalar(CellValue::Enum("FOO".into()));
        assert_eq!(
            cell_sql(&cell, &ColumnType::Enum("colors".into())),
            "E'FOO'::\"colors\""
        );
    }

    #[test]
    fn test_quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("ta\"ble"), "\"ta\"\"ble\"");
    }
}
