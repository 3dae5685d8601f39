//! Field catalog: the schema stored under the `03` subtree.
//!
//! Four passes build the catalog (§ well-known paths):
//! `03/01` maps field names to ids, `03/02` groups ids by type code,
//! `03/03` assigns order numbers, and `03/05/<id>` carries per-field
//! options (label override, stored/indexed flags, repetition count).
//! Catalog inconsistencies are never fatal: they log a warning and the
//! field keeps its defaults.

use indexmap::IndexMap;
use tracing::warn;

use crate::export::locale::TextEncoding;
use crate::fp5::file::Fp5File;
use crate::fp5::token::Value;
use crate::vli;

/// FileMaker field type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Number,
    Date,
    Time,
    Container,
    Calc,
    Summary,
    Global,
    Unknown,
}

impl FieldType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FieldType::Text),
            2 => Some(FieldType::Number),
            3 => Some(FieldType::Date),
            4 => Some(FieldType::Time),
            5 => Some(FieldType::Container),
            6 => Some(FieldType::Calc),
            7 => Some(FieldType::Summary),
            8 => Some(FieldType::Global),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Number => "NUMBER",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Container => "CONTAINER",
            FieldType::Calc => "CALC",
            FieldType::Summary => "SUMMARY",
            FieldType::Global => "GLOBAL",
            FieldType::Unknown => "UNKNOWN",
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "TEXT" => Some(FieldType::Text),
            "NUMBER" => Some(FieldType::Number),
            "DATE" => Some(FieldType::Date),
            "TIME" => Some(FieldType::Time),
            "CONTAINER" => Some(FieldType::Container),
            "CALC" => Some(FieldType::Calc),
            "SUMMARY" => Some(FieldType::Summary),
            "GLOBAL" => Some(FieldType::Global),
            _ => None,
        }
    }
}

/// One schema field.
#[derive(Debug, Clone)]
pub struct DataField {
    pub id: u64,
    /// Shortest VLI encoding of `id`: the reference bytes record tokens
    /// use for this field.
    pub id_bytes: Vec<u8>,
    pub label: String,
    pub field_type: FieldType,
    pub repetitions: u8,
    pub stored: bool,
    pub indexed: bool,
    pub order: u32,
}

impl DataField {
    fn new(id: u64, label: String) -> Self {
        Self {
            id,
            id_bytes: vli::encode(id).unwrap_or_default(),
            label,
            field_type: FieldType::Unknown,
            repetitions: 1,
            stored: false,
            indexed: false,
            order: 0,
        }
    }
}

/// Catalog keyed by field id, in file order.
pub type FieldCatalog = IndexMap<u64, DataField>;

/// Build the field catalog from the schema subtree.
pub fn build_catalog(file: &Fp5File, encoding: TextEncoding) -> FieldCatalog {
    let mut fields = FieldCatalog::new();

    // Pass 1: field id and name under 03/01.
    for (name, value) in file.sub_node_children(&[vec![0x03], vec![0x01]]) {
        let Some(data) = value.as_bytes() else {
            warn!(name = %hex(&name), "field name entry is not a scalar");
            continue;
        };
        if data.len() < 2 {
            warn!(name = %hex(&name), "field name entry too short for an id");
            continue;
        }
        let Some(id) = vli::decode(&data[1..], false) else {
            warn!(name = %hex(&name), "field id is not a valid VLI");
            continue;
        };
        if fields.contains_key(&id) {
            warn!(field_id = id, "duplicate field id, keeping first entry");
            continue;
        }
        fields.insert(id, DataField::new(id, encoding.decode(&name)));
    }

    // Pass 2: type codes under 03/02.
    for (type_seg, value) in file.sub_node_children(&[vec![0x03], vec![0x02]]) {
        let Some(ids) = value.as_list() else {
            continue;
        };
        let code = *type_seg.last().unwrap_or(&0);
        let Some(field_type) = FieldType::from_code(code) else {
            warn!(code, "unknown field type code");
            continue;
        };
        for id_bytes in ids {
            match vli::decode(id_bytes, false).and_then(|id| fields.get_mut(&id)) {
                Some(field) => field.field_type = field_type,
                None => warn!(id = %hex(id_bytes), "unhandled field id in type index"),
            }
        }
    }

    // Pass 3: order numbers under 03/03.
    for (order_bytes, value) in file.sub_node_children(&[vec![0x03], vec![0x03]]) {
        let Some(data) = value.as_bytes() else {
            continue;
        };
        if data.len() < 2 {
            continue;
        }
        match vli::decode(&data[1..], false).and_then(|id| fields.get_mut(&id)) {
            Some(field) => field.order = vli::be_uint(&order_bytes) as u32,
            None => warn!(order = %hex(&order_bytes), "unhandled field id in order index"),
        }
    }

    // Pass 4: per-field options under 03/05/<id>.
    for (id_seg, value) in file.sub_node_children(&[vec![0x03], vec![0x05]]) {
        let Some(options) = value.as_node() else {
            continue;
        };
        let Some(field) = vli::decode(&id_seg, false).and_then(|id| fields.get_mut(&id)) else {
            warn!(id = %hex(&id_seg), "options for unknown field id");
            continue;
        };

        if let Some(label) = options.get(&[0x01][..]).and_then(Value::as_bytes) {
            field.label = encoding.decode(label);
        }
        if let Some(flags) = options.get(&[0x02][..]).and_then(Value::as_bytes) {
            if flags.len() < 12 {
                warn!(field_id = field.id, len = flags.len(), "short option flags, keeping defaults");
            } else {
                field.stored = flags[0] <= 0x02;
                field.indexed = flags[2] == 0x01;
                field.repetitions = flags[11].max(1);
            }
        }
    }

    fields
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
