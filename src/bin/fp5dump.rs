//! fp5dump CLI.
//!
//! Actions over a read-only .fp5 file:
//!   list-fields     print the field catalog
//!   count-records   print the record count
//!   dump-blocks     write the ordered data or index blocks
//!   dump-records    write records as a PostgreSQL SQL script
//!   insert-records  spool records as a binary COPY stream plus DDL script
//!   update-records  diff against known destination rows, spool the delta
//!
//! The destination database client is a collaborator: the record actions
//! write files (COPY stream, SQL script) a client loads in one
//! transaction. Exit code 0 on success, non-zero on any failure.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use fp5dump::export::definition::{ExportDefinition, FieldFilters};
use fp5dump::export::destination::{
    resume_point, run_copy_export, CopyExportOptions, Destination, SpoolDestination,
};
use fp5dump::export::locale::{LocaleParsers, TextEncoding};
use fp5dump::export::sql;
use fp5dump::fp5::path::TokenPath;
use fp5dump::{FieldType, Fp5File};

#[derive(Parser)]
#[command(
    name = "fp5dump",
    version,
    about = "dumps the content of FileMaker 5/6 .fp5 files to PostgreSQL"
)]
struct Cli {
    /// Verbosity: -v = info, -vv = debug.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// List the fields and their types.
    ListFields {
        /// The .fp5 file to list the fields of.
        input: PathBuf,
        #[arg(long, default_value = "latin_1")]
        encoding: String,
        /// Include unstored fields in the listing.
        #[arg(long)]
        show_unstored: bool,
        /// Show only fields with these types.
        #[arg(long, value_delimiter = ',')]
        include_field_types: Vec<String>,
    },

    /// Count the records.
    CountRecords {
        input: PathBuf,
    },

    /// Write the ordered data or index blocks.
    DumpBlocks {
        input: PathBuf,
        /// Output filename; defaults to `<input>.<kind>`.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = BlockKind::Data)]
        kind: BlockKind,
        /// Dump only data blocks holding nodes under this path, e.g. `03/01`.
        #[arg(long)]
        with_path: Option<String>,
    },

    /// Write the records as a PostgreSQL SQL script.
    DumpRecords {
        #[command(flatten)]
        records: RecordArgs,
        /// Output filename; defaults to `<basename>.psql`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Spool the records as a binary COPY stream plus a DDL script.
    InsertRecords {
        #[command(flatten)]
        records: RecordArgs,
        /// Output base path; writes `<base>.copy` and `<base>.sql`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Diff against known destination rows and spool only the delta.
    UpdateRecords {
        #[command(flatten)]
        records: RecordArgs,
        /// Output base path; writes `<base>.copy` and `<base>.sql`.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// `fm_id<TAB>fm_mod_id` listing exported from the destination.
        #[arg(long)]
        existing_rows: Option<PathBuf>,
        /// Re-export the last n destination rows even when unchanged.
        #[arg(long, default_value_t = 0)]
        recheck_last_rows: usize,
        /// Only process records after the largest known destination id.
        #[arg(long)]
        append_only: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BlockKind {
    Data,
    Index,
}

#[derive(Args)]
struct RecordArgs {
    /// The .fp5 file to export the records of.
    input: PathBuf,

    /// Encoding of strings in the file: ascii, latin_1, cp1252, macroman.
    #[arg(long, default_value = "latin_1")]
    encoding: String,

    /// Locale for date, time and numeric fields.
    #[arg(long, default_value = "en_US")]
    locale: String,

    /// Include fields by exact name.
    #[arg(long)]
    include_fields: Vec<String>,

    /// Include fields whose names match these regular expressions.
    #[arg(long)]
    include_fields_like: Vec<String>,

    /// Ignore fields by exact name.
    #[arg(long)]
    ignore_fields: Vec<String>,

    /// Ignore fields whose names match these regular expressions.
    #[arg(long)]
    ignore_fields_like: Vec<String>,

    /// Ignore fields with these types.
    #[arg(long, value_delimiter = ',', default_values_t = [String::from("GLOBAL"), String::from("CONTAINER")])]
    ignore_field_types: Vec<String>,

    /// Map every field to text.
    #[arg(long)]
    assume_string: bool,

    /// YAML declaration file naming the fields and their target types.
    #[arg(long)]
    definition: Option<PathBuf>,

    /// Destination table name; defaults to the stored database name.
    #[arg(long)]
    table: Option<String>,

    /// Show progress while exporting.
    #[arg(short, long)]
    progress: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.action {
        Action::ListFields {
            input,
            encoding,
            show_unstored,
            include_field_types,
        } => list_fields(&input, &encoding, show_unstored, &include_field_types),
        Action::CountRecords { input } => {
            let file = Fp5File::open(&input, TextEncoding::default())?;
            println!("{}", file.records_count());
            Ok(())
        }
        Action::DumpBlocks {
            input,
            output,
            kind,
            with_path,
        } => dump_blocks(&input, output, kind, with_path),
        Action::DumpRecords { records, output } => dump_records(&records, output),
        Action::InsertRecords { records, output } => {
            spool_records(&records, output, None, 0, false)
        }
        Action::UpdateRecords {
            records,
            output,
            existing_rows,
            recheck_last_rows,
            append_only,
        } => spool_update(&records, output, existing_rows, recheck_last_rows, append_only),
    }
}

// ── Action Implementations ─────────────────────────────────────────

fn list_fields(
    input: &Path,
    encoding: &str,
    show_unstored: bool,
    include_field_types: &[String],
) -> anyhow::Result<()> {
    let encoding = TextEncoding::from_name(encoding)?;
    let types = parse_field_types(include_field_types)?;
    let file = Fp5File::open(input, encoding)?;

    println!("ID TYPE[REPETITIONS] STORED NAME");
    let mut ids: Vec<u64> = file.fields.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let field = &file.fields[&id];
        if !show_unstored && !field.stored {
            continue;
        }
        if !types.is_empty() && !types.contains(&field.field_type) {
            continue;
        }
        println!(
            "0x{:04X} {:>9}[{:2}] {:5} '{}'",
            field.id,
            field.field_type.name(),
            field.repetitions,
            field.stored,
            field.label
        );
    }
    Ok(())
}

fn dump_blocks(
    input: &Path,
    output: Option<PathBuf>,
    kind: BlockKind,
    with_path: Option<String>,
) -> anyhow::Result<()> {
    let file = Fp5File::open(input, TextEncoding::default())?;

    let extension = match kind {
        BlockKind::Data => "data",
        BlockKind::Index => "index",
    };
    let output = output.unwrap_or_else(|| with_extension(input, extension));
    let mut out = BufWriter::new(fs::File::create(&output)?);

    match (kind, with_path) {
        (BlockKind::Index, None) => file.dump_index_blocks(&mut out)?,
        (BlockKind::Index, Some(_)) => bail!("--with-path applies to data blocks only"),
        (BlockKind::Data, None) => file.dump_data_blocks(&mut out)?,
        (BlockKind::Data, Some(path)) => {
            let path = TokenPath::parse(&path)?;
            file.dump_blocks_with_path(&path, &mut out)?;
        }
    }
    Ok(())
}

fn dump_records(records: &RecordArgs, output: Option<PathBuf>) -> anyhow::Result<()> {
    let (file, definition, parsers) = open_for_export(records)?;
    ensure_exportable(&file, &definition)?;

    let table = table_name(records, &definition, &file);
    let output = output.unwrap_or_else(|| with_extension(&records.input, "psql"));
    let out = BufWriter::new(
        fs::File::create(&output)
            .with_context(|| format!("cannot create {}", output.display()))?,
    );

    sql::dump_records(&file, &definition, &parsers, &table, out, records.progress)?;
    Ok(())
}

fn spool_records(
    records: &RecordArgs,
    output: Option<PathBuf>,
    existing_rows: Option<PathBuf>,
    recheck_last_rows: usize,
    update: bool,
) -> anyhow::Result<()> {
    let (file, definition, parsers) = open_for_export(records)?;
    ensure_exportable(&file, &definition)?;

    let table = table_name(records, &definition, &file);
    let base = output.unwrap_or_else(|| records.input.to_path_buf());
    let mut destination = SpoolDestination::create(
        &with_extension(&base, "copy"),
        &with_extension(&base, "sql"),
        existing_rows.as_deref(),
    )?;

    let options = CopyExportOptions {
        update,
        first_record: None,
        recheck_last_rows,
        show_progress: records.progress,
    };
    run_copy_export(&file, &definition, &parsers, &mut destination, &table, &options)?;
    Ok(())
}

fn spool_update(
    records: &RecordArgs,
    output: Option<PathBuf>,
    existing_rows: Option<PathBuf>,
    recheck_last_rows: usize,
    append_only: bool,
) -> anyhow::Result<()> {
    if !append_only {
        return spool_records(records, output, existing_rows, recheck_last_rows, true);
    }

    let (file, definition, parsers) = open_for_export(records)?;
    ensure_exportable(&file, &definition)?;

    let table = table_name(records, &definition, &file);
    let base = output.unwrap_or_else(|| records.input.to_path_buf());
    let mut destination = SpoolDestination::create(
        &with_extension(&base, "copy"),
        &with_extension(&base, "sql"),
        existing_rows.as_deref(),
    )?;

    let existing = destination.existing_rows()?;
    let first_record = resume_point(&file, &existing);
    if existing.is_empty() {
        tracing::info!("no known destination rows, exporting everything");
    } else if first_record.is_none() {
        tracing::info!("destination already holds the latest record id, nothing to append");
        return Ok(());
    }

    let options = CopyExportOptions {
        update: true,
        first_record,
        recheck_last_rows,
        show_progress: records.progress,
    };
    run_copy_export(&file, &definition, &parsers, &mut destination, &table, &options)?;
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────

fn open_for_export(
    records: &RecordArgs,
) -> anyhow::Result<(Fp5File, ExportDefinition, LocaleParsers)> {
    let encoding = TextEncoding::from_name(&records.encoding)?;
    let parsers = LocaleParsers::new(&records.locale)?;
    let file = Fp5File::open(&records.input, encoding)?;

    let definition = match &records.definition {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            ExportDefinition::load_yaml(&text, &file.fields)?
        }
        None => {
            let filters = FieldFilters {
                include: records.include_fields.clone(),
                include_like: records.include_fields_like.clone(),
                ignore: records.ignore_fields.clone(),
                ignore_like: records.ignore_fields_like.clone(),
                ignore_types: parse_field_types(&records.ignore_field_types)?,
            };
            ExportDefinition::generate(&file.fields, &filters, records.assume_string)?
        }
    };

    Ok((file, definition, parsers))
}

fn ensure_exportable(file: &Fp5File, definition: &ExportDefinition) -> anyhow::Result<()> {
    if definition.columns.is_empty() {
        bail!("no fields to export");
    }
    if file.records_count() == 0 {
        bail!("no records to export");
    }
    Ok(())
}

fn table_name(records: &RecordArgs, definition: &ExportDefinition, file: &Fp5File) -> String {
    records
        .table
        .clone()
        .or_else(|| definition.table.clone())
        .unwrap_or_else(|| file.db_name.clone())
}

fn parse_field_types(names: &[String]) -> anyhow::Result<Vec<FieldType>> {
    names
        .iter()
        .map(|name| {
            FieldType::parse_name(name)
                .ok_or_else(|| anyhow::anyhow!("unknown field type {name:?}"))
        })
        .collect()
}

fn with_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}
