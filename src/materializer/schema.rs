// File: src/materializer/schema.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Expected JSON type of a field in parsed leaf data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    /// 64-char hex string
    Pubkey,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Pubkey => match value {
                Value::String(s) => s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()),
                _ => false,
            },
            FieldKind::Any => true,
        }
    }
}

/// Shape that parsed leaf data of a tree is expected to have
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Required fields
    #[serde(default)]
    pub fields: BTreeMap<String, FieldKind>,

    /// Optional fields, checked only when present
    #[serde(default)]
    pub optional: BTreeMap<String, FieldKind>,
}

impl SchemaDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    pub fn allow(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.optional.insert(name.into(), kind);
        self
    }

    /// Check parsed data against the schema. Returns the first violation.
    pub fn validate(&self, value: &serde_json::Value) -> Result<(), String> {
        let Some(object) = value.as_object() else {
            return Err("parsed data is not an object".into());
        };
        for (name, kind) in &self.fields {
            match object.get(name) {
                None => return Err(format!("missing field '{}'", name)),
                Some(v) if !kind.matches(v) => {
                    return Err(format!("field '{}' is not {:?}", name, kind))
                }
                Some(_) => {}
            }
        }
        for (name, kind) in &self.optional {
            if let Some(v) = object.get(name) {
                if !v.is_null() && !kind.matches(v) {
                    return Err(format!("field '{}' is not {:?}", name, kind));
                }
            }
        }
        Ok(())
    }
}
