//! Locale and encoding collaborators.
//!
//! The reader itself is locale-free; the export pipeline consumes two
//! injected capabilities ("parse a localized decimal numeral", "parse a
//! date/time string") plus a source text encoding. Nothing here touches
//! process-global state.

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{Fp5Error, Result};
use crate::export::coerce::{self, PgNumeric};

// ── Text Encodings ─────────────────────────────────────────────────

/// Source encodings an fp5 file's strings may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    Ascii,
    #[default]
    Latin1,
    Cp1252,
    MacRoman,
}

impl TextEncoding {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "ascii" => Ok(TextEncoding::Ascii),
            "latin_1" | "latin1" | "iso_8859_1" => Ok(TextEncoding::Latin1),
            "cp1252" | "windows_1252" => Ok(TextEncoding::Cp1252),
            "macroman" | "mac_roman" => Ok(TextEncoding::MacRoman),
            other => Err(Fp5Error::Config(format!("unknown encoding {other:?}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Ascii => "ascii",
            TextEncoding::Latin1 => "latin_1",
            TextEncoding::Cp1252 => "cp1252",
            TextEncoding::MacRoman => "macroman",
        }
    }

    /// Decode bytes to a string. Bytes outside the encoding map to the
    /// replacement character rather than failing: source data quality is
    /// a per-cell concern, not a per-file one.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Ascii => bytes
                .iter()
                .map(|&b| if b < 0x80 { b as char } else { '\u{FFFD}' })
                .collect(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            TextEncoding::Cp1252 => encoding_rs::WINDOWS_1252
                .decode_without_bom_handling(bytes)
                .0
                .into_owned(),
            TextEncoding::MacRoman => encoding_rs::MACINTOSH
                .decode_without_bom_handling(bytes)
                .0
                .into_owned(),
        }
    }
}

// ── Number Format ──────────────────────────────────────────────────

/// Decimal point and thousands separator of one locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberLocale {
    pub decimal_point: u8,
    pub thousands_sep: u8,
}

impl NumberLocale {
    pub const EN: NumberLocale = NumberLocale {
        decimal_point: b'.',
        thousands_sep: b',',
    };

    pub const DE: NumberLocale = NumberLocale {
        decimal_point: b',',
        thousands_sep: b'.',
    };
}

// ── Locale Parsers ─────────────────────────────────────────────────

/// The two capabilities the coercion layer needs, injected at export
/// start.
pub trait ValueParsers {
    fn parse_decimal(&self, text: &str) -> Option<PgNumeric>;
    fn parse_datetime(&self, text: &str) -> Option<NaiveDateTime>;
}

/// Locale-derived implementation of [`ValueParsers`].
#[derive(Debug, Clone)]
pub struct LocaleParsers {
    pub numbers: NumberLocale,
    date_formats: &'static [&'static str],
    datetime_formats: &'static [&'static str],
}

const MDY_DATES: &[&str] = &["%m/%d/%Y", "%m/%d/%y", "%Y-%m-%d", "%d.%m.%Y"];
const MDY_DATETIMES: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
];

const DMY_DATES: &[&str] = &["%d.%m.%Y", "%d.%m.%y", "%d/%m/%Y", "%Y-%m-%d"];
const DMY_DATETIMES: &[&str] = &[
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
];

impl LocaleParsers {
    /// Build parsers for a locale name like `en_US` or `de_DE`.
    pub fn new(locale: &str) -> Result<Self> {
        let tag = locale
            .split('.')
            .next()
            .unwrap_or(locale)
            .to_ascii_lowercase();
        let language = tag.split('_').next().unwrap_or(&tag);

        match language {
            "c" | "posix" | "en" => Ok(Self {
                numbers: NumberLocale::EN,
                date_formats: MDY_DATES,
                datetime_formats: MDY_DATETIMES,
            }),
            "de" | "es" | "it" | "nl" | "pt" | "da" | "fi" | "sv" | "nb" | "no" => Ok(Self {
                numbers: NumberLocale::DE,
                date_formats: DMY_DATES,
                datetime_formats: DMY_DATETIMES,
            }),
            "fr" => Ok(Self {
                numbers: NumberLocale {
                    decimal_point: b',',
                    thousands_sep: b' ',
                },
                date_formats: DMY_DATES,
                datetime_formats: DMY_DATETIMES,
            }),
            _ => Err(Fp5Error::Config(format!("unknown locale {locale:?}"))),
        }
    }
}

impl ValueParsers for LocaleParsers {
    fn parse_decimal(&self, text: &str) -> Option<PgNumeric> {
        coerce::parse_numeric(text.as_bytes(), &self.numbers)
    }

    fn parse_datetime(&self, text: &str) -> Option<NaiveDateTime> {
        let text = text.trim();
        for format in self.datetime_formats {
            if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
                return Some(dt);
            }
        }
        for format in self.date_formats {
            if let Ok(date) = NaiveDate::parse_from_str(text, format) {
                return date.and_hms_opt(0, 0, 0);
            }
        }
        None
    }
}
