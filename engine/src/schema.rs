//! Model schema: declared attributes and associations of one record type.
//!
//! The schema is what the sanitizer reads to decide how each column is
//! serialized, and what the dependency graph reads to find foreign keys.

use crate::{error::Result, Error, RecordType};
use serde::{Deserialize, Serialize};

/// Column kinds that influence serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Full instant, serialized as an ISO-8601 UTC string.
    Timestamp,
    /// Domain column holding local wall time as `YYYY-MM-DD HH:MM:SS`.
    DateTimeString,
    /// Domain column holding a calendar date as `YYYY-MM-DD`.
    DateString,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::DateTimeString => write!(f, "DateTimeString"),
            FieldType::DateString => write!(f, "DateString"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Column name
    pub name: String,
    /// Column kind
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }

    /// Check that a JSON value can be stored in this column.
    ///
    /// Null is always accepted; absence is handled by the caller.
    pub fn validate(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String | FieldType::DateTimeString | FieldType::DateString => {
                value.is_string() || value.is_null()
            }
            FieldType::Int => value.is_i64() || value.is_u64() || value.is_null(),
            FieldType::Float => value.is_number() || value.is_null(),
            FieldType::Bool => value.is_boolean() || value.is_null(),
            FieldType::Timestamp => value.is_string() || value.is_i64() || value.is_null(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidFieldValue {
                field: self.name.clone(),
                reason: format!("expected {}, got {}", self.field_type, json_type_name(value)),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Kind of relationship between two record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssociationKind {
    /// This type holds the foreign key.
    BelongsTo,
    HasOne,
    HasMany,
}

/// A named relationship to another record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    /// Name used in relation paths (`lab_requests.tests`).
    pub alias: String,
    pub kind: AssociationKind,
    /// Record type on the other side.
    pub target: RecordType,
    /// Column holding the foreign key (on this type for belongs-to, on the
    /// target otherwise).
    pub foreign_key: String,
}

impl Association {
    pub fn belongs_to(
        alias: impl Into<String>,
        target: impl Into<RecordType>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            kind: AssociationKind::BelongsTo,
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }

    pub fn has_many(
        alias: impl Into<String>,
        target: impl Into<RecordType>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            kind: AssociationKind::HasMany,
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }

    pub fn has_one(
        alias: impl Into<String>,
        target: impl Into<RecordType>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            kind: AssociationKind::HasOne,
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }
}

/// Schema for one record type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    /// Declared columns, in declaration order.
    pub attributes: Vec<FieldDef>,
    pub associations: Vec<Association>,
}

impl ModelSchema {
    pub fn new(attributes: Vec<FieldDef>) -> Self {
        Self {
            attributes,
            associations: Vec::new(),
        }
    }

    /// Builder-style method to add an association.
    pub fn with_association(mut self, association: Association) -> Self {
        self.associations.push(association);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&FieldDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn association(&self, alias: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.alias == alias)
    }

    /// Targets of belongs-to associations, paired with whether the edge
    /// points back at `own_type`.
    pub fn belongs_to_edges<'a>(
        &'a self,
        own_type: &'a str,
    ) -> impl Iterator<Item = (&'a str, bool)> + 'a {
        self.associations
            .iter()
            .filter(|a| a.kind == AssociationKind::BelongsTo)
            .map(move |a| (a.target.as_str(), a.target == own_type))
    }

    /// Validate an incoming field map. Unknown keys are rejected so that a
    /// schema mismatch between nodes surfaces instead of silently dropping data.
    pub fn validate_data(&self, data: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        for (key, value) in data {
            match self.attribute(key) {
                Some(field) => field.validate(value)?,
                None if key == "id" => {}
                None => {
                    return Err(Error::InvalidFieldValue {
                        field: key.clone(),
                        reason: "not a declared attribute".into(),
                    })
                }
            }
        }
        Ok(())
    }
}
