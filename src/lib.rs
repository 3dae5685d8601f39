//! fp5dump: reader and PostgreSQL export pipeline for FileMaker Pro
//! 3/5/6 `.fp5` files.
//!
//! The reader reconstructs the block B+tree stored inside the file,
//! traverses its hierarchical token stream to materialize the field
//! catalog and stream the records, and hands typed rows to one of two
//! emitters: a textual SQL script or a PostgreSQL binary COPY stream.
//!
//! The file is opened read-only and never modified.

pub mod error;
pub mod export;
pub mod fp5;
pub mod vli;

pub use error::{Fp5Error, Result};
pub use export::definition::{ColumnType, ExportDefinition, FieldExportDefinition};
pub use export::locale::TextEncoding;
pub use fp5::fields::{DataField, FieldType};
pub use fp5::file::Fp5File;
pub use fp5::token::Value;
