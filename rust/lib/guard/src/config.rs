//! Model configuration as declared in the server config file.
//!
//! ```toml
//! [[models]]
//! name = "Product"
//! read_only = { status = true, type = "create-only" }
//!
//! [[models.relations]]
//! name = "reviews"
//! model = "Review"
//! type = "hasMany"
//! ```
//!
//! `read_only` is either a boolean (`true` locks the whole type) or a
//! table of field → `true` | `"create-only"`. The reserved key
//! [`CREATE_EXEMPT_KEY`] lists fields that a fully locked type still
//! accepts on creation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::RelationKind;

/// Reserved `read_only` key holding the creation-exempt field list.
pub const CREATE_EXEMPT_KEY: &str = "$createExempt";

/// Marker value for fields writable only on creation.
pub const CREATE_ONLY_MARKER: &str = "create-only";

/// One record type as declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,

    /// URL segment. Defaults to the lowercased name plus `s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plural: Option<String>,

    #[serde(default = "default_id_field")]
    pub id_field: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<ReadOnlySpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<RelationConfig>,
}

fn default_id_field() -> String {
    "id".to_string()
}

/// A relation from the declaring model to another model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationConfig {
    pub name: String,

    /// Related model name.
    pub model: String,

    #[serde(rename = "type")]
    pub kind: RelationKind,

    /// Foreign key field. For "has" relations it lives on the related
    /// model, for `belongsTo` on the declaring one.
    #[serde(default, rename = "foreignKey", alias = "foreign_key", skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
}

/// The `read_only` setting of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadOnlySpec {
    Flag(bool),
    Fields(BTreeMap<String, FieldSpec>),
}

/// One entry of a `read_only` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    Flag(bool),
    Marker(String),
    List(Vec<String>),
}

impl FieldSpec {
    fn describe(&self) -> String {
        match self {
            FieldSpec::Flag(b) => b.to_string(),
            FieldSpec::Marker(m) => format!("{:?}", m),
            FieldSpec::List(_) => "a list".to_string(),
        }
    }
}

/// Invalid model configuration. Raised once, at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("model '{model}': field '{field}' has unsupported read-only mode {found} (expected true or \"create-only\")")]
    InvalidMode {
        model: String,
        field: String,
        found: String,
    },

    #[error("model '{model}': '$createExempt' must be a list of field names")]
    InvalidExempt { model: String },

    #[error("model '{0}' is declared more than once")]
    DuplicateModel(String),

    #[error("models '{first}' and '{second}' share the URL segment '{plural}'")]
    DuplicatePlural {
        first: String,
        second: String,
        plural: String,
    },

    #[error("model '{model}': relation '{relation}' targets unknown model '{target}'")]
    UnknownRelationTarget {
        model: String,
        relation: String,
        target: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid_mode(model: &str, field: &str, found: &FieldSpec) -> Self {
        ConfigError::InvalidMode {
            model: model.to_string(),
            field: field.to_string(),
            found: found.describe(),
        }
    }
}
