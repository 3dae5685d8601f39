//! Destination seam and the binary COPY export engine.
//!
//! The network client for the destination database is a collaborator,
//! not part of this crate: everything it must be able to do is the
//! [`Destination`] trait. The engine drives record streaming, typed
//! coercion, mod-id diffing for update mode, the pre-delete queue, the
//! 10 MiB batch flush and the absent-row deletion.
//!
//! Two implementations ship here: [`SpoolDestination`] writes the COPY
//! stream and a DDL/DELETE script to files (the CLI's file sink), and
//! [`MemoryDestination`] records every operation for tests.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::error::{Fp5Error, Result};
use crate::export::coerce::CoerceErrors;
use crate::export::copy::CopyEncoder;
use crate::export::definition::ExportDefinition;
use crate::export::locale::ValueParsers;
use crate::export::progress::Progress;
use crate::export::record;
use crate::export::sql::{quote_ident, SqlScriptWriter};
use crate::fp5::file::Fp5File;
use crate::vli;

/// Flush the COPY staging buffer at this size.
pub const COPY_FLUSH_BYTES: usize = 10 * 1024 * 1024;

// ── Destination Trait ──────────────────────────────────────────────

/// What the export engine needs from a destination database client.
///
/// Calls arrive in order: `prepare`, then per batch any `delete_rows`
/// followed by `copy_chunk`, finally optional `delete_absent` and
/// `commit`. The whole run is one destination transaction; an `Err` from
/// any method aborts and rolls back.
pub trait Destination {
    fn prepare(&mut self, definition: &ExportDefinition, table: &str, recreate: bool)
        -> Result<()>;

    /// `fm_id -> fm_mod_id` of rows already present (update mode).
    fn existing_rows(&mut self) -> Result<HashMap<i64, i64>>;

    /// Delete rows queued for rewrite, before the next chunk lands.
    fn delete_rows(&mut self, ids: &[i64]) -> Result<()>;

    /// One segment of the binary COPY stream (framing spans segments).
    fn copy_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Delete destination rows whose `fm_id` is not in `present`.
    fn delete_absent(&mut self, present: &[i64]) -> Result<()>;

    fn commit(&mut self) -> Result<()>;
}

// ── Engine ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CopyStats {
    pub processed: usize,
    pub written: usize,
    pub skipped: usize,
    pub pre_deleted: usize,
    pub failed_cells: usize,
}

#[derive(Debug, Default)]
pub struct CopyExportOptions {
    /// Diff against existing rows instead of a fresh table.
    pub update: bool,
    /// Resume: process records starting at this record id (VLI bytes).
    pub first_record: Option<Vec<u8>>,
    /// Update mode: treat the last *n* destination rows as stale so they
    /// are re-exported even with matching modification ids.
    pub recheck_last_rows: usize,
    pub show_progress: bool,
}

/// Find the resume point from the destination's row set: the record id
/// following the largest destination id that still exists in the file's
/// record index.
pub fn resume_point(file: &Fp5File, existing: &HashMap<i64, i64>) -> Option<Vec<u8>> {
    let mut ids: Vec<i64> = existing.keys().copied().collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));

    for id in ids {
        let Ok(id) = u64::try_from(id) else { continue };
        let Some(encoded) = vli::encode(id) else { continue };
        if file
            .records_index
            .iter()
            .any(|known| known.as_slice() == encoded.as_slice())
        {
            return file.record_id_after(&encoded).map(<[u8]>::to_vec);
        }
    }
    None
}

/// Stream records into a destination as binary COPY.
pub fn run_copy_export(
    file: &Fp5File,
    definition: &ExportDefinition,
    parsers: &dyn ValueParsers,
    destination: &mut dyn Destination,
    table: &str,
    options: &CopyExportOptions,
) -> Result<CopyStats> {
    let mut existing = if options.update {
        destination.existing_rows()?
    } else {
        HashMap::new()
    };

    // Stale-marking: a modification id no real record carries forces the
    // diff below to rewrite these rows.
    if options.recheck_last_rows > 0 {
        let mut ids: Vec<i64> = existing.keys().copied().collect();
        ids.sort_unstable();
        for id in ids.iter().rev().take(options.recheck_last_rows) {
            existing.insert(*id, i64::MIN);
        }
    }

    destination.prepare(definition, table, !options.update)?;

    let mut stats = CopyStats::default();
    let mut errors = CoerceErrors::new();
    let mut progress = Progress::new(
        records_to_process(file, options.first_record.as_deref()),
        options.show_progress,
    );

    let mut encoder = CopyEncoder::new(definition);
    encoder.write_header();
    let mut pre_delete: Vec<i64> = Vec::new();

    for rec in record::record_stream(file, definition, options.first_record.as_deref())? {
        stats.processed += 1;
        progress.tick();

        let row = record::coerce_record(&rec, definition, file.encoding, parsers, &mut errors);

        if options.update {
            match existing.get(&(row.id as i64)) {
                Some(known) if *known == row.mod_id => {
                    stats.skipped += 1;
                    continue;
                }
                Some(_) => pre_delete.push(row.id as i64),
                None => {}
            }
        }

        encoder.write_row(&row);
        stats.written += 1;

        if encoder.buffer().len() >= COPY_FLUSH_BYTES {
            flush(destination, &mut encoder, &mut pre_delete, &mut stats)?;
        }
    }

    encoder.write_trailer();
    flush(destination, &mut encoder, &mut pre_delete, &mut stats)?;

    // Source-deleted rows: only meaningful after a full scan.
    if options.update && options.first_record.is_none() {
        let present: Vec<i64> = file
            .records_index
            .iter()
            .filter_map(|id| vli::decode(id, false))
            .map(|id| id as i64)
            .collect();
        destination.delete_absent(&present)?;
    }

    destination.commit()?;
    progress.finish();
    errors.report(&definition.columns);
    stats.failed_cells = errors.total();

    info!(
        processed = stats.processed,
        written = stats.written,
        skipped = stats.skipped,
        table,
        "copy export finished"
    );
    Ok(stats)
}

fn flush(
    destination: &mut dyn Destination,
    encoder: &mut CopyEncoder<'_>,
    pre_delete: &mut Vec<i64>,
    stats: &mut CopyStats,
) -> Result<()> {
    if !pre_delete.is_empty() {
        destination.delete_rows(pre_delete)?;
        stats.pre_deleted += pre_delete.len();
        pre_delete.clear();
    }
    let chunk = encoder.take_buffer();
    if !chunk.is_empty() {
        destination.copy_chunk(&chunk)?;
    }
    Ok(())
}

fn records_to_process(file: &Fp5File, first_record: Option<&[u8]>) -> usize {
    match first_record {
        None => file.records_count(),
        Some(first) => {
            match file.records_index.iter().position(|id| id.as_slice() == first) {
                Some(pos) => file.records_count() - pos,
                None => file.records_count(),
            }
        }
    }
}

// ── Spool Destination ──────────────────────────────────────────────

/// File-backed destination: the COPY stream spools to one file, DDL and
/// DELETE statements to an SQL script. Existing rows, when update mode
/// needs them, come from a `fm_id<TAB>fm_mod_id` listing exported from
/// the real destination.
pub struct SpoolDestination {
    copy_out: BufWriter<File>,
    script_out: BufWriter<File>,
    table: String,
    existing: HashMap<i64, i64>,
}

impl SpoolDestination {
    pub fn create(
        copy_path: &Path,
        script_path: &Path,
        existing_rows: Option<&Path>,
    ) -> Result<Self> {
        let existing = match existing_rows {
            None => HashMap::new(),
            Some(path) => read_existing_rows(path)?,
        };
        Ok(Self {
            copy_out: BufWriter::new(File::create(copy_path)?),
            script_out: BufWriter::new(File::create(script_path)?),
            table: String::new(),
            existing,
        })
    }
}

fn read_existing_rows(path: &Path) -> Result<HashMap<i64, i64>> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = HashMap::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split('\t');
        let id = parts.next().and_then(|v| v.trim().parse::<i64>().ok());
        let mod_id = parts.next().and_then(|v| v.trim().parse::<i64>().ok());
        match (id, mod_id) {
            (Some(id), Some(mod_id)) => {
                rows.insert(id, mod_id);
            }
            _ => {
                return Err(Fp5Error::Config(format!(
                    "existing-rows file {}:{}: expected 'fm_id<TAB>fm_mod_id'",
                    path.display(),
                    number + 1
                )))
            }
        }
    }
    Ok(rows)
}

impl Destination for SpoolDestination {
    fn prepare(
        &mut self,
        definition: &ExportDefinition,
        table: &str,
        recreate: bool,
    ) -> Result<()> {
        self.table = table.to_string();
        if recreate {
            let mut writer = SqlScriptWriter::new(&mut self.script_out, definition, table);
            writer.write_prelude()?;
        }
        Ok(())
    }

    fn existing_rows(&mut self) -> Result<HashMap<i64, i64>> {
        Ok(self.existing.clone())
    }

    fn delete_rows(&mut self, ids: &[i64]) -> Result<()> {
        let list: Vec<String> = ids.iter().map(i64::to_string).collect();
        writeln!(
            self.script_out,
            "DELETE FROM {} WHERE \"fm_id\" IN ({});",
            quote_ident(&self.table),
            list.join(", ")
        )?;
        Ok(())
    }

    fn copy_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.copy_out.write_all(chunk)?;
        Ok(())
    }

    fn delete_absent(&mut self, present: &[i64]) -> Result<()> {
        let table = quote_ident(&self.table);
        let temp = quote_ident(&format!("_{}_present", self.table));
        writeln!(self.script_out, "CREATE TEMPORARY TABLE {temp} (\"fm_id\" bigint);")?;
        for chunk in present.chunks(1000) {
            let rows: Vec<String> = chunk.iter().map(|id| format!("({id})")).collect();
            writeln!(
                self.script_out,
                "INSERT INTO {temp} (\"fm_id\") VALUES {};",
                rows.join(", ")
            )?;
        }
        writeln!(
            self.script_out,
            "DELETE FROM {table} WHERE \"fm_id\" NOT IN (SELECT \"fm_id\" FROM {temp});"
        )?;
        writeln!(self.script_out, "DROP TABLE {temp};")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.copy_out.flush()?;
        self.script_out.flush()?;
        Ok(())
    }
}

// ── Memory Destination ─────────────────────────────────────────────

/// Operation log entry of [`MemoryDestination`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationOp {
    Prepare { table: String, recreate: bool },
    DeleteRows(Vec<i64>),
    CopyChunk(usize),
    DeleteAbsent(Vec<i64>),
    Commit,
}

/// In-memory destination recording every call, for tests.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    pub existing: HashMap<i64, i64>,
    pub operations: Vec<DestinationOp>,
    pub copy_bytes: Vec<u8>,
}

impl MemoryDestination {
    pub fn with_existing(existing: HashMap<i64, i64>) -> Self {
        Self {
            existing,
            ..Self::default()
        }
    }
}

impl Destination for MemoryDestination {
    fn prepare(
        &mut self,
        _definition: &ExportDefinition,
        table: &str,
        recreate: bool,
    ) -> Result<()> {
        self.operations.push(DestinationOp::Prepare {
            table: table.to_string(),
            recreate,
        });
        Ok(())
    }

    fn existing_rows(&mut self) -> Result<HashMap<i64, i64>> {
        Ok(self.existing.clone())
    }

    fn delete_rows(&mut self, ids: &[i64]) -> Result<()> {
        self.operations.push(DestinationOp::DeleteRows(ids.to_vec()));
        Ok(())
    }

    fn copy_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.operations.push(DestinationOp::CopyChunk(chunk.len()));
        self.copy_bytes.extend_from_slice(chunk);
        Ok(())
    }

    fn delete_absent(&mut self, present: &[i64]) -> Result<()> {
        self.operations
            .push(DestinationOp::DeleteAbsent(present.to_vec()));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.operations.push(DestinationOp::Commit);
        Ok(())
    }
}
