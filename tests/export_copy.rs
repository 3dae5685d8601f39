//! Integration tests: the binary COPY engine, update mode and the spool
//! destination.

mod common;

use std::collections::HashMap;

use common::{standard_file, write_temp};
use fp5dump::export::copy::COPY_SIGNATURE;
use fp5dump::export::definition::{ExportDefinition, FieldFilters};
use fp5dump::export::destination::{
    resume_point, run_copy_export, CopyExportOptions, DestinationOp, MemoryDestination,
    SpoolDestination,
};
use fp5dump::export::locale::LocaleParsers;
use fp5dump::{Fp5File, TextEncoding};

fn open_standard() -> (tempfile::TempDir, Fp5File, ExportDefinition, LocaleParsers) {
    let (dir, path) = write_temp(&standard_file());
    let file = Fp5File::open(&path, TextEncoding::Latin1).unwrap();
    let definition =
        ExportDefinition::generate(&file.fields, &FieldFilters::default(), false).unwrap();
    let parsers = LocaleParsers::new("en_US").unwrap();
    (dir, file, definition, parsers)
}

/// Parse a COPY stream into rows of optional field bytes.
fn parse_rows(bytes: &[u8]) -> Vec<Vec<Option<Vec<u8>>>> {
    assert!(bytes.len() >= 19, "missing COPY header");
    assert_eq!(&bytes[..11], COPY_SIGNATURE);
    assert_eq!(&bytes[11..19], &[0u8; 8]);

    let mut pos = 19;
    let mut rows = Vec::new();
    loop {
        let count = u16::from_be_bytes(bytes[pos..pos + 2].try_into().unwrap());
        pos += 2;
        if count == 0xFFFF {
            break;
        }
        let mut row = Vec::new();
        for _ in 0..count {
            let len = i32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
            if len < 0 {
                row.push(None);
            } else {
                row.push(Some(bytes[pos..pos + len as usize].to_vec()));
                pos += len as usize;
            }
        }
        rows.push(row);
    }
    assert_eq!(pos, bytes.len(), "trailing bytes after COPY trailer");
    rows
}

fn fm_id(row: &[Option<Vec<u8>>]) -> i64 {
    i64::from_be_bytes(row[0].as_ref().unwrap()[..8].try_into().unwrap())
}

fn fm_mod_id(row: &[Option<Vec<u8>>]) -> i64 {
    i64::from_be_bytes(row[1].as_ref().unwrap()[..8].try_into().unwrap())
}

#[test]
fn insert_streams_every_record() {
    let (_dir, file, definition, parsers) = open_standard();
    let mut destination = MemoryDestination::default();

    let stats = run_copy_export(
        &file,
        &definition,
        &parsers,
        &mut destination,
        "testdb",
        &CopyExportOptions::default(),
    )
    .unwrap();

    assert_eq!(stats.processed, 3);
    assert_eq!(stats.written, 3);
    assert_eq!(stats.skipped, 0);

    assert_eq!(
        destination.operations[0],
        DestinationOp::Prepare {
            table: "testdb".into(),
            recreate: true
        }
    );
    assert_eq!(destination.operations.last(), Some(&DestinationOp::Commit));
    assert!(!destination
        .operations
        .iter()
        .any(|op| matches!(op, DestinationOp::DeleteRows(_) | DestinationOp::DeleteAbsent(_))));

    let rows = parse_rows(&destination.copy_bytes);
    assert_eq!(rows.len(), 3);
    // fm_id, fm_mod_id plus Name, Betrag, Tags.
    assert!(rows.iter().all(|row| row.len() == 5));
    assert_eq!(fm_id(&rows[0]), 1);
    assert_eq!(fm_mod_id(&rows[0]), 5);
    assert_eq!(rows[0][2].as_deref(), Some(&b"Alice"[..]));
    // Record 2 has no Betrag and no Tags.
    assert_eq!(fm_id(&rows[1]), 2);
    assert!(rows[1][3].is_none());
    assert!(rows[1][4].is_none());
}

#[test]
fn tags_array_frames_with_null_slot() {
    let (_dir, file, definition, parsers) = open_standard();
    let mut destination = MemoryDestination::default();
    run_copy_export(
        &file,
        &definition,
        &parsers,
        &mut destination,
        "testdb",
        &CopyExportOptions::default(),
    )
    .unwrap();

    let rows = parse_rows(&destination.copy_bytes);
    let tags = rows[0][4].as_ref().unwrap();
    assert_eq!(&tags[0..4], &1u32.to_be_bytes()); // ndim
    assert_eq!(&tags[4..8], &1u32.to_be_bytes()); // hasnulls
    assert_eq!(&tags[8..12], &25u32.to_be_bytes()); // text element oid
    assert_eq!(&tags[12..16], &3u32.to_be_bytes()); // dim length
    assert_eq!(&tags[16..20], &1u32.to_be_bytes()); // lower bound
    assert_eq!(&tags[20..24], &3u32.to_be_bytes());
    assert_eq!(&tags[24..27], b"red");
    assert_eq!(&tags[27..31], &[0xFF; 4]); // NULL slot
    assert_eq!(&tags[31..35], &4u32.to_be_bytes());
    assert_eq!(&tags[35..39], b"blue");
}

#[test]
fn update_diffs_on_mod_id() {
    let (_dir, file, definition, parsers) = open_standard();
    // Record 1 unchanged, record 2 stale, fm_id 99 gone from the source.
    let mut destination =
        MemoryDestination::with_existing(HashMap::from([(1, 5), (2, 6), (99, 1)]));

    let options = CopyExportOptions {
        update: true,
        ..Default::default()
    };
    let stats = run_copy_export(
        &file,
        &definition,
        &parsers,
        &mut destination,
        "testdb",
        &options,
    )
    .unwrap();

    assert_eq!(stats.processed, 3);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.written, 2);
    assert_eq!(stats.pre_deleted, 1);

    let rows = parse_rows(&destination.copy_bytes);
    let ids: Vec<i64> = rows.iter().map(|r| fm_id(r)).collect();
    assert_eq!(ids, vec![2, 3]);

    // Pre-delete lands before the chunk; the absent-row sweep covers the
    // full source id set.
    let delete_pos = destination
        .operations
        .iter()
        .position(|op| matches!(op, DestinationOp::DeleteRows(ids) if ids == &vec![2]))
        .unwrap();
    let chunk_pos = destination
        .operations
        .iter()
        .position(|op| matches!(op, DestinationOp::CopyChunk(_)))
        .unwrap();
    assert!(delete_pos < chunk_pos);
    assert!(destination
        .operations
        .iter()
        .any(|op| matches!(op, DestinationOp::DeleteAbsent(present) if present == &vec![1, 2, 3])));
    assert!(matches!(
        destination.operations[0],
        DestinationOp::Prepare { recreate: false, .. }
    ));
}

#[test]
fn resume_processes_only_later_records() {
    let (_dir, file, definition, parsers) = open_standard();
    let existing = HashMap::from([(1, 5)]);

    // The destination's newest row is record 1: resume at record 2.
    let first = resume_point(&file, &existing);
    assert_eq!(first.as_deref(), Some(&[0x02][..]));

    let mut destination = MemoryDestination::with_existing(existing);
    let options = CopyExportOptions {
        update: true,
        first_record: first,
        ..Default::default()
    };
    let stats = run_copy_export(
        &file,
        &definition,
        &parsers,
        &mut destination,
        "testdb",
        &options,
    )
    .unwrap();

    // records_count - index_of(R0) - 1 = 3 - 0 - 1.
    assert_eq!(stats.processed, 2);
    let rows = parse_rows(&destination.copy_bytes);
    let ids: Vec<i64> = rows.iter().map(|r| fm_id(r)).collect();
    assert_eq!(ids, vec![2, 3]);

    // A partial scan must not sweep out "absent" rows it never visited.
    assert!(!destination
        .operations
        .iter()
        .any(|op| matches!(op, DestinationOp::DeleteAbsent(_))));
}

#[test]
fn resume_point_is_none_when_destination_is_current() {
    let (_dir, file, _definition, _parsers) = open_standard();
    let existing = HashMap::from([(1, 5), (2, 7), (3, 9)]);
    assert_eq!(resume_point(&file, &existing), None);
}

#[test]
fn recheck_last_rows_forces_rewrite() {
    let (_dir, file, definition, parsers) = open_standard();
    // Everything up to date; rechecking the last row rewrites record 3.
    let mut destination =
        MemoryDestination::with_existing(HashMap::from([(1, 5), (2, 7), (3, 9)]));

    let options = CopyExportOptions {
        update: true,
        recheck_last_rows: 1,
        ..Default::default()
    };
    let stats = run_copy_export(
        &file,
        &definition,
        &parsers,
        &mut destination,
        "testdb",
        &options,
    )
    .unwrap();

    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.written, 1);
    assert_eq!(stats.pre_deleted, 1);
    let rows = parse_rows(&destination.copy_bytes);
    assert_eq!(fm_id(&rows[0]), 3);
}

#[test]
fn spool_destination_writes_copy_and_script() {
    let (_dir, file, definition, parsers) = open_standard();
    let out = tempfile::TempDir::new().unwrap();
    let copy_path = out.path().join("testdb.copy");
    let script_path = out.path().join("testdb.sql");

    let mut destination = SpoolDestination::create(&copy_path, &script_path, None).unwrap();
    run_copy_export(
        &file,
        &definition,
        &parsers,
        &mut destination,
        "testdb",
        &CopyExportOptions::default(),
    )
    .unwrap();

    let copy = std::fs::read(&copy_path).unwrap();
    assert_eq!(&copy[..11], COPY_SIGNATURE);
    assert_eq!(parse_rows(&copy).len(), 3);

    let script = std::fs::read_to_string(&script_path).unwrap();
    assert!(script.contains("CREATE TABLE IF NOT EXISTS \"testdb\""));
}
