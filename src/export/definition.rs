//! Export definitions: the typed view of the field catalog one export run
//! works from.
//!
//! A definition is either generated from the catalog through name/type
//! filters, or loaded from a YAML declaration file:
//!
//! ```yaml
//! table: people
//! enums:
//!   colors:
//!     RED: [RED, ROT]
//!     BLUE: [BLUE, BLAU]
//!     "*": RED
//! columns:
//!   - field: Name
//!     type: text
//!   - field: Tags
//!     type: text
//!     split: lines
//!   - field: Farbe
//!     type: enum colors
//! ```
//!
//! All validation happens here, before the streaming phase: unknown
//! labels, type keywords or enum references abort the run with a config
//! error.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Fp5Error, Result};
use crate::fp5::fields::{DataField, FieldCatalog, FieldType};

// ── Column Types ───────────────────────────────────────────────────

/// Destination column types. The closed set of §typed coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Bigint,
    Numeric,
    Date,
    Time,
    Boolean,
    Uuid,
    /// Enum type, by declared enum name.
    Enum(String),
}

impl ColumnType {
    /// Parse a declaration keyword (`text`, `integer`, …, `enum <name>`).
    pub fn parse(keyword: &str) -> Result<Self> {
        let keyword = keyword.trim();
        if let Some(name) = keyword.strip_prefix("enum ") {
            let name = name.trim();
            if name.is_empty() {
                return Err(Fp5Error::Config("enum type without a name".into()));
            }
            return Ok(ColumnType::Enum(name.to_string()));
        }

        match keyword {
            "text" => Ok(ColumnType::Text),
            "integer" => Ok(ColumnType::Integer),
            "bigint" => Ok(ColumnType::Bigint),
            "numeric" => Ok(ColumnType::Numeric),
            "date" => Ok(ColumnType::Date),
            "time" => Ok(ColumnType::Time),
            "boolean" => Ok(ColumnType::Boolean),
            "uuid" => Ok(ColumnType::Uuid),
            other => Err(Fp5Error::Config(format!("unknown type keyword {other:?}"))),
        }
    }

    /// SQL rendering of the type (enums are quoted identifiers).
    pub fn sql_type(&self) -> String {
        match self {
            ColumnType::Text => "text".into(),
            ColumnType::Integer => "integer".into(),
            ColumnType::Bigint => "bigint".into(),
            ColumnType::Numeric => "numeric".into(),
            ColumnType::Date => "date".into(),
            ColumnType::Time => "time".into(),
            ColumnType::Boolean => "boolean".into(),
            ColumnType::Uuid => "uuid".into(),
            ColumnType::Enum(name) => format!("\"{name}\""),
        }
    }

    /// PostgreSQL type OID used for binary COPY array framing. Enum OIDs
    /// are destination-assigned; enums travel as text.
    pub fn oid(&self) -> u32 {
        match self {
            ColumnType::Text | ColumnType::Enum(_) => 25,
            ColumnType::Integer => 23,
            ColumnType::Bigint => 20,
            ColumnType::Numeric => 1700,
            ColumnType::Date => 1082,
            ColumnType::Time => 1083,
            ColumnType::Uuid => 2950,
            ColumnType::Boolean => 16,
        }
    }

    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Bigint => "bigint",
            ColumnType::Numeric => "numeric",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::Boolean => "boolean",
            ColumnType::Uuid => "uuid",
            ColumnType::Enum(_) => "enum",
        }
    }
}

// ── Enum Definitions ───────────────────────────────────────────────

/// A declared enum: destination keys, accepted source spellings, and an
/// optional wildcard fallback key.
#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    /// Key -> accepted source values, uppercased at load time. The key
    /// `NULL` maps matches to SQL NULL.
    pub values: IndexMap<String, HashSet<String>>,
    /// Key named by the wildcard entry `"*"`.
    pub fallback: Option<String>,
}

impl EnumDef {
    /// Resolve a raw value. `None`: no match (a coercion error);
    /// `Some(None)`: SQL NULL; `Some(Some(key))`: the destination key.
    pub fn resolve(&self, raw: &str) -> Option<Option<&str>> {
        let upper = raw.to_uppercase();
        for (key, accepted) in &self.values {
            if accepted.contains(&upper) {
                return Some(if key == "NULL" { None } else { Some(key) });
            }
        }
        self.fallback
            .as_deref()
            .map(|key| if key == "NULL" { None } else { Some(key) })
    }
}

// ── Field Export Definition ────────────────────────────────────────

/// One destination column bound to one catalog field.
#[derive(Debug, Clone)]
pub struct FieldExportDefinition {
    pub field: DataField,
    pub column: ColumnType,
    /// Array-valued column (repeating field without a subscript, or a
    /// split-lines text field).
    pub is_array: bool,
    /// Split the scalar value on line feeds into an array.
    pub split_lines: bool,
    /// Select a single 1-based repetition slot instead of the array.
    pub subscript: Option<u32>,
    pub enum_def: Option<EnumDef>,
    /// Column position within the export, 0-based.
    pub ordinal: u32,
}

impl FieldExportDefinition {
    pub fn field_id(&self) -> u64 {
        self.field.id
    }
}

// ── Filters ────────────────────────────────────────────────────────

/// Name/type filters for generated definitions.
#[derive(Debug, Default)]
pub struct FieldFilters {
    pub include: Vec<String>,
    pub include_like: Vec<String>,
    pub ignore: Vec<String>,
    pub ignore_like: Vec<String>,
    pub ignore_types: Vec<FieldType>,
}

struct CompiledFilters {
    include: Vec<String>,
    include_like: Vec<Regex>,
    ignore: Vec<String>,
    ignore_like: Vec<Regex>,
    ignore_types: Vec<FieldType>,
}

impl CompiledFilters {
    fn compile(filters: &FieldFilters) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| Fp5Error::Config(format!("invalid field pattern {p:?}: {e}")))
                })
                .collect()
        };
        Ok(Self {
            include: filters.include.clone(),
            include_like: compile(&filters.include_like)?,
            ignore: filters.ignore.clone(),
            ignore_like: compile(&filters.ignore_like)?,
            ignore_types: filters.ignore_types.clone(),
        })
    }

    fn keeps(&self, field: &DataField) -> bool {
        if self.ignore_types.contains(&field.field_type) {
            return false;
        }
        if self.ignore.iter().any(|n| n == &field.label)
            || self.ignore_like.iter().any(|re| re.is_match(&field.label))
        {
            return false;
        }
        if self.include.is_empty() && self.include_like.is_empty() {
            return true;
        }
        self.include.iter().any(|n| n == &field.label)
            || self.include_like.iter().any(|re| re.is_match(&field.label))
    }
}

// ── Export Definition ──────────────────────────────────────────────

/// The full, validated definition of one export run.
#[derive(Debug, Clone)]
pub struct ExportDefinition {
    pub columns: Vec<FieldExportDefinition>,
    /// Table name from the declaration file, if any.
    pub table: Option<String>,
    by_field: HashMap<u64, usize>,
}

impl ExportDefinition {
    fn from_columns(columns: Vec<FieldExportDefinition>, table: Option<String>) -> Self {
        let by_field = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.field_id(), i))
            .collect();
        Self {
            columns,
            table,
            by_field,
        }
    }

    /// Generate a definition from the catalog through filters. Field
    /// types map to their natural column types unless `assume_string`
    /// forces text.
    pub fn generate(
        catalog: &FieldCatalog,
        filters: &FieldFilters,
        assume_string: bool,
    ) -> Result<Self> {
        let compiled = CompiledFilters::compile(filters)?;

        let mut fields: Vec<&DataField> = catalog.values().collect();
        fields.sort_by_key(|f| (f.order, f.id));

        let mut columns = Vec::new();
        for field in fields {
            if !field.stored {
                debug!(field = %field.label, "skipping unstored field");
                continue;
            }
            if field.field_type == FieldType::Container {
                debug!(field = %field.label, "skipping container field");
                continue;
            }
            if !compiled.keeps(field) {
                continue;
            }

            let column = if assume_string {
                ColumnType::Text
            } else {
                match field.field_type {
                    FieldType::Number => ColumnType::Numeric,
                    FieldType::Date => ColumnType::Date,
                    FieldType::Time => ColumnType::Time,
                    _ => ColumnType::Text,
                }
            };

            columns.push(FieldExportDefinition {
                is_array: field.repetitions > 1,
                field: field.clone(),
                column,
                split_lines: false,
                subscript: None,
                enum_def: None,
                ordinal: columns.len() as u32,
            });
        }

        Ok(Self::from_columns(columns, None))
    }

    /// Load and validate a YAML declaration file against the catalog.
    pub fn load_yaml(text: &str, catalog: &FieldCatalog) -> Result<Self> {
        let decl: DeclFile = serde_yaml::from_str(text)
            .map_err(|e| Fp5Error::Config(format!("invalid declaration file: {e}")))?;

        let mut enums: IndexMap<String, EnumDef> = IndexMap::new();
        for (name, entries) in &decl.enums {
            let mut values = IndexMap::new();
            let mut fallback = None;
            for (key, entry) in entries {
                match entry {
                    EnumEntry::One(value) if key == "*" => {
                        fallback = Some(value.clone());
                    }
                    EnumEntry::One(value) => {
                        values.insert(
                            key.clone(),
                            HashSet::from([value.to_uppercase()]),
                        );
                    }
                    EnumEntry::Many(list) if key == "*" => {
                        return Err(Fp5Error::Config(format!(
                            "enum {name:?}: the wildcard entry must name a single fallback key, got {list:?}"
                        )));
                    }
                    EnumEntry::Many(list) => {
                        values.insert(
                            key.clone(),
                            list.iter().map(|v| v.to_uppercase()).collect(),
                        );
                    }
                }
            }
            if let Some(fallback_key) = &fallback {
                if fallback_key != "NULL" && !values.contains_key(fallback_key) {
                    return Err(Fp5Error::Config(format!(
                        "enum {name:?}: wildcard falls back to undefined key {fallback_key:?}"
                    )));
                }
            }
            enums.insert(
                name.clone(),
                EnumDef {
                    name: name.clone(),
                    values,
                    fallback,
                },
            );
        }

        let by_label: HashMap<&str, &DataField> = catalog
            .values()
            .map(|f| (f.label.as_str(), f))
            .collect();

        let mut columns = Vec::new();
        for decl_column in &decl.columns {
            let field = *by_label.get(decl_column.field.as_str()).ok_or_else(|| {
                Fp5Error::Config(format!("unknown field {:?}", decl_column.field))
            })?;
            if !field.stored {
                return Err(Fp5Error::Config(format!(
                    "field {:?} is unstored and cannot be exported",
                    field.label
                )));
            }

            let column = ColumnType::parse(&decl_column.type_)?;
            let enum_def = match &column {
                ColumnType::Enum(name) => Some(
                    enums
                        .get(name)
                        .ok_or_else(|| {
                            Fp5Error::Config(format!("reference to undefined enum {name:?}"))
                        })?
                        .clone(),
                ),
                _ => None,
            };

            let split_lines = match decl_column.split.as_deref() {
                None => false,
                Some("lines") => true,
                Some(other) => {
                    return Err(Fp5Error::Config(format!(
                        "unknown split mode {other:?}, expected \"lines\""
                    )))
                }
            };

            if let Some(subscript) = decl_column.subscript {
                if subscript == 0 {
                    return Err(Fp5Error::Config(format!(
                        "field {:?}: subscripts are 1-based",
                        field.label
                    )));
                }
                if u32::from(field.repetitions) < subscript {
                    return Err(Fp5Error::Config(format!(
                        "field {:?} has {} repetitions, subscript {subscript} is out of range",
                        field.label, field.repetitions
                    )));
                }
                if split_lines {
                    return Err(Fp5Error::Config(format!(
                        "field {:?}: split and subscript are mutually exclusive",
                        field.label
                    )));
                }
            }

            let is_array =
                split_lines || (field.repetitions > 1 && decl_column.subscript.is_none());

            columns.push(FieldExportDefinition {
                field: field.clone(),
                column,
                is_array,
                split_lines,
                subscript: decl_column.subscript,
                enum_def,
                ordinal: columns.len() as u32,
            });
        }

        if columns.is_empty() {
            return Err(Fp5Error::Config("declaration file defines no columns".into()));
        }

        Ok(Self::from_columns(columns, decl.table))
    }

    pub fn column_for(&self, field_id: u64) -> Option<&FieldExportDefinition> {
        self.by_field.get(&field_id).map(|&i| &self.columns[i])
    }

    /// Reference bytes the token stream should keep: one VLI per exported
    /// field.
    pub fn token_filter(&self) -> HashSet<Vec<u8>> {
        self.columns
            .iter()
            .map(|c| c.field.id_bytes.clone())
            .collect()
    }

    /// Distinct enums, in declaration order, for DDL emission.
    pub fn enums(&self) -> Vec<&EnumDef> {
        let mut seen = HashSet::new();
        self.columns
            .iter()
            .filter_map(|c| c.enum_def.as_ref())
            .filter(|e| seen.insert(e.name.clone()))
            .collect()
    }
}

// ── Declaration File Shape ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DeclFile {
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    enums: IndexMap<String, IndexMap<String, EnumEntry>>,
    columns: Vec<DeclColumn>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnumEntry {
    Many(Vec<String>),
    One(String),
}

#[derive(Debug, Deserialize)]
struct DeclColumn {
    field: String,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    split: Option<String>,
    #[serde(default)]
    subscript: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> FieldCatalog {
        let mut catalog = FieldCatalog::new();
        for (id, label, field_type, repetitions, stored) in [
            (1u64, "Name", FieldType::Text, 1u8, true),
            (2, "Betrag", FieldType::Number, 1, true),
            (3, "Tags", FieldType::Text, 3, true),
            (4, "Berechnung", FieldType::Calc, 1, false),
            (5, "Bild", FieldType::Container, 1, true),
        ] {
            let field = DataField {
                id,
                id_bytes: crate::vli::encode(id).unwrap(),
                label: label.to_string(),
                field_type,
                repetitions,
                stored,
                indexed: false,
                order: id as u32,
            };
            catalog.insert(id, field);
        }
        catalog
    }

    #[test]
    fn test_generate_maps_types_and_skips_unstored() {
        let def =
            ExportDefinition::generate(&catalog(), &FieldFilters::default(), false).unwrap();
        let labels: Vec<&str> = def.columns.iter().map(|c| c.field.label.as_str()).collect();
        // Unstored and container fields never export.
        assert_eq!(labels, vec!["Name", "Betrag", "Tags"]);
        assert_eq!(def.columns[0].column, ColumnType::Text);
        assert_eq!(def.columns[1].column, ColumnType::Numeric);
        assert!(def.columns[2].is_array);
    }

    #[test]
    fn test_generate_filters() {
        let filters = FieldFilters {
            ignore: vec!["Tags".into()],
            ..Default::default()
        };
        let def = ExportDefinition::generate(&catalog(), &filters, true).unwrap();
        let labels: Vec<&str> = def.columns.iter().map(|c| c.field.label.as_str()).collect();
        assert_eq!(labels, vec!["Name", "Betrag"]);
        assert_eq!(def.columns[1].column, ColumnType::Text); // assume_string

        let filters = FieldFilters {
            include_like: vec!["^Be".into()],
            ..Default::default()
        };
        let def = ExportDefinition::generate(&catalog(), &filters, false).unwrap();
        let labels: Vec<&str> = def.columns.iter().map(|c| c.field.label.as_str()).collect();
        assert_eq!(labels, vec!["Betrag"]);
    }

    #[test]
    fn test_load_yaml_happy_path() {
        let text = r#"
table: leute
enums:
  colors:
    RED: [RED, ROT]
    "NULL": ["N/A"]
    "*": RED
columns:
  - field: Name
    type: enum colors
  - field: Tags
    type: text
    subscript: 2
  - field: Betrag
    type: numeric
"#;
        let def = ExportDefinition::load_yaml(text, &catalog()).unwrap();
        assert_eq!(def.table.as_deref(), Some("leute"));
        assert_eq!(def.columns.len(), 3);

        let colors = def.columns[0].enum_def.as_ref().unwrap();
        assert_eq!(colors.resolve("rot"), Some(Some("RED")));
        assert_eq!(colors.resolve("n/a"), Some(None));
        assert_eq!(colors.resolve("???"), Some(Some("RED")));

        assert_eq!(def.columns[1].subscript, Some(2));
        assert!(!def.columns[1].is_array);
    }

    #[test]
    fn test_load_yaml_rejects_bad_references() {
        let unknown_field = "columns:\n  - field: Nope\n    type: text\n";
        assert!(matches!(
            ExportDefinition::load_yaml(unknown_field, &catalog()),
            Err(Fp5Error::Config(_))
        ));

        let unknown_type = "columns:\n  - field: Name\n    type: blob\n";
        assert!(ExportDefinition::load_yaml(unknown_type, &catalog()).is_err());

        let unknown_enum = "columns:\n  - field: Name\n    type: enum nope\n";
        assert!(ExportDefinition::load_yaml(unknown_enum, &catalog()).is_err());

        let unstored = "columns:\n  - field: Berechnung\n    type: text\n";
        assert!(ExportDefinition::load_yaml(unstored, &catalog()).is_err());

        let bad_subscript = "columns:\n  - field: Name\n    type: text\n    subscript: 2\n";
        assert!(ExportDefinition::load_yaml(bad_subscript, &catalog()).is_err());
    }

    #[test]
    fn test_token_filter_uses_field_reference_bytes() {
        let def =
            ExportDefinition::generate(&catalog(), &FieldFilters::default(), false).unwrap();
        let filter = def.token_filter();
        assert!(filter.contains(&vec![0x01]));
        assert!(filter.contains(&vec![0x03]));
        assert!(!filter.contains(&vec![0x05]));
    }
}
