//! Error types for the fp5 reader and export pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Fp5Error>;

#[derive(Error, Debug)]
pub enum Fp5Error {
    /// Fatal open-time failures: bad magic, wrong version, unaligned size.
    #[error("format error: {0}")]
    Format(String),

    /// Deleted or truncated block reached via a chain walk.
    #[error("block error: {0}")]
    Block(String),

    /// Unknown token byte, payload overrun, failed length check.
    #[error("parse error: {0}")]
    Parse(String),

    /// Field catalog inconsistencies (duplicate id, unknown type code).
    #[error("schema error: {0}")]
    Schema(String),

    /// A value could not be parsed into its declared column type.
    #[error("cannot coerce {value:?} to {target}")]
    Coerce { target: &'static str, value: String },

    /// The destination rejected a statement or COPY payload.
    #[error("destination error: {0}")]
    Destination(String),

    /// Invalid export definition, locale, or encoding.
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Fp5Error {
    /// Whether the error aborts the whole run (as opposed to a single
    /// record or block, which the caller logs and skips).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Fp5Error::Format(_)
                | Fp5Error::Destination(_)
                | Fp5Error::Config(_)
                | Fp5Error::Io(_)
        )
    }
}
