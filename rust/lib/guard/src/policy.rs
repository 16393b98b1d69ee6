//! Read-only policy of a record type.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{CREATE_EXEMPT_KEY, CREATE_ONLY_MARKER, ConfigError, FieldSpec, ReadOnlySpec};

/// When a protected field refuses caller-supplied values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldMode {
    /// Protected on every write.
    Always,
    /// Writable on creation, protected afterwards.
    CreateOnly,
}

impl FieldMode {
    /// Whether a creation write may set the field.
    pub fn writable_on_create(self) -> bool {
        matches!(self, FieldMode::CreateOnly)
    }
}

/// Immutable read-only declaration for one record type.
///
/// A fully locked policy ignores `protected_fields` entirely: every write is
/// rejected unless it is a creation limited to `creation_exempt_fields`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    record_type: String,
    fully_locked: bool,
    protected_fields: BTreeMap<String, FieldMode>,
    creation_exempt_fields: BTreeSet<String>,
}

impl Policy {
    /// A type that accepts no writes.
    pub fn locked(record_type: impl Into<String>) -> Self {
        Self::locked_except(record_type, std::iter::empty::<String>())
    }

    /// A type that accepts no writes, except these fields on creation.
    pub fn locked_except<I, S>(record_type: impl Into<String>, exempt: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            record_type: record_type.into(),
            fully_locked: true,
            protected_fields: BTreeMap::new(),
            creation_exempt_fields: exempt.into_iter().map(Into::into).collect(),
        }
    }

    /// A type with individually protected fields.
    pub fn fields<I, S>(record_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldMode)>,
        S: Into<String>,
    {
        Self {
            record_type: record_type.into(),
            fully_locked: false,
            protected_fields: fields.into_iter().map(|(f, m)| (f.into(), m)).collect(),
            creation_exempt_fields: BTreeSet::new(),
        }
    }

    /// Build a policy from the `read_only` configuration of a model.
    ///
    /// Returns `None` when the setting protects nothing (`false`, or a
    /// table whose fields are all `false`).
    pub fn from_spec(record_type: &str, spec: &ReadOnlySpec) -> Result<Option<Self>, ConfigError> {
        let entries = match spec {
            ReadOnlySpec::Flag(false) => return Ok(None),
            ReadOnlySpec::Flag(true) => return Ok(Some(Self::locked(record_type))),
            ReadOnlySpec::Fields(entries) => entries,
        };

        let mut fields = BTreeMap::new();
        let mut exempt: Vec<String> = Vec::new();
        let mut declared = 0usize;

        for (name, entry) in entries {
            if name == CREATE_EXEMPT_KEY {
                match entry {
                    FieldSpec::List(list) => exempt.extend(list.iter().cloned()),
                    _ => {
                        return Err(ConfigError::InvalidExempt {
                            model: record_type.to_string(),
                        });
                    }
                }
                continue;
            }

            declared += 1;
            match entry {
                FieldSpec::Flag(true) => {
                    fields.insert(name.clone(), FieldMode::Always);
                }
                FieldSpec::Flag(false) => {}
                FieldSpec::Marker(marker) if marker == CREATE_ONLY_MARKER => {
                    fields.insert(name.clone(), FieldMode::CreateOnly);
                }
                other => return Err(ConfigError::invalid_mode(record_type, name, other)),
            }
        }

        // No field entries at all: the table locks the whole type.
        if declared == 0 {
            return Ok(Some(Self::locked_except(record_type, exempt)));
        }
        if !exempt.is_empty() {
            warn!(
                "model {}: '{}' only applies to fully locked types, ignoring",
                record_type, CREATE_EXEMPT_KEY
            );
        }
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::fields(record_type, fields)))
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn is_fully_locked(&self) -> bool {
        self.fully_locked
    }

    pub fn protected_fields(&self) -> &BTreeMap<String, FieldMode> {
        &self.protected_fields
    }

    pub fn creation_exempt_fields(&self) -> &BTreeSet<String> {
        &self.creation_exempt_fields
    }
}
