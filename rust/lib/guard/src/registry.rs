//! Model registry and policy resolution.
//!
//! The registry is built once at startup from configuration and shared
//! read-only afterwards. Nothing mutates it per request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, ModelConfig, RelationConfig};
use crate::policy::Policy;

/// Relation kinds, resolved when the relation is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    HasMany,
    HasOne,
    HasManyThrough,
    BelongsTo,
}

impl RelationKind {
    /// The declaring model owns instances of the related model, which
    /// carries the foreign key.
    pub fn is_has(self) -> bool {
        matches!(
            self,
            RelationKind::HasMany | RelationKind::HasOne | RelationKind::HasManyThrough
        )
    }

    /// The declaring model carries a foreign key to the related model.
    pub fn is_belongs_to(self) -> bool {
        matches!(self, RelationKind::BelongsTo)
    }
}

/// A relation between two registered models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub name: String,
    pub related_type: String,
    pub kind: RelationKind,
    pub foreign_key: String,
}

impl RelationDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: RelationKind,
        related_type: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            related_type: related_type.into(),
            kind,
            foreign_key: foreign_key.into(),
        }
    }

    fn from_config(owner: &str, config: RelationConfig) -> Self {
        let foreign_key = config.foreign_key.unwrap_or_else(|| {
            if config.kind.is_belongs_to() {
                format!("{}Id", config.name)
            } else {
                format!("{}Id", lower_first(owner))
            }
        });
        Self::new(config.name, config.kind, config.model, foreign_key)
    }
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// One registered record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDef {
    name: String,
    plural: String,
    id_field: String,
    policy: Option<Policy>,
    relations: Vec<RelationDescriptor>,
}

impl ModelDef {
    /// A model with default plural (`{name}s`, lowercased) and id field `id`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            plural: format!("{}s", name.to_lowercase()),
            name,
            id_field: "id".to_string(),
            policy: None,
            relations: Vec::new(),
        }
    }

    pub fn with_plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = plural.into();
        self
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    /// Build from configuration, parsing the read-only setting.
    pub fn from_config(config: ModelConfig) -> Result<Self, ConfigError> {
        let policy = match &config.read_only {
            Some(spec) => Policy::from_spec(&config.name, spec)?,
            None => None,
        };
        let relations = config
            .relations
            .into_iter()
            .map(|r| RelationDescriptor::from_config(&config.name, r))
            .collect();

        let mut def = Self::new(config.name).with_id_field(config.id_field);
        if let Some(plural) = config.plural {
            def.plural = plural;
        }
        def.policy = policy;
        def.relations = relations;
        Ok(def)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plural(&self) -> &str {
        &self.plural
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.policy.as_ref()
    }

    pub fn relations(&self) -> &[RelationDescriptor] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// The type has no read-only policy. Callers treat this as "unprotected".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no read-only policy registered for {0}")]
pub struct PolicyNotFound(pub String);

/// Immutable mapping of model name → definition.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDef>,
}

impl ModelRegistry {
    /// Build and validate a registry.
    ///
    /// Model names and URL segments must be unique, and every relation
    /// must target a registered model.
    pub fn new(defs: impl IntoIterator<Item = ModelDef>) -> Result<Self, ConfigError> {
        let mut models = BTreeMap::new();
        let mut plurals: BTreeMap<String, String> = BTreeMap::new();

        for def in defs {
            if let Some(first) = plurals.get(&def.plural) {
                return Err(ConfigError::DuplicatePlural {
                    first: first.clone(),
                    second: def.name.clone(),
                    plural: def.plural.clone(),
                });
            }
            if models.contains_key(&def.name) {
                return Err(ConfigError::DuplicateModel(def.name.clone()));
            }
            plurals.insert(def.plural.clone(), def.name.clone());
            models.insert(def.name.clone(), def);
        }

        for def in models.values() {
            for relation in &def.relations {
                if !models.contains_key(&relation.related_type) {
                    return Err(ConfigError::UnknownRelationTarget {
                        model: def.name.clone(),
                        relation: relation.name.clone(),
                        target: relation.related_type.clone(),
                    });
                }
            }
        }

        Ok(Self { models })
    }

    pub fn from_configs(configs: impl IntoIterator<Item = ModelConfig>) -> Result<Self, ConfigError> {
        let defs = configs
            .into_iter()
            .map(ModelDef::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(defs)
    }

    pub fn get(&self, name: &str) -> Option<&ModelDef> {
        self.models.get(name)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDef> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Resolve the read-only policy of a type.
    pub fn resolve(&self, record_type: &str) -> Result<&Policy, PolicyNotFound> {
        self.models
            .get(record_type)
            .and_then(ModelDef::policy)
            .ok_or_else(|| PolicyNotFound(record_type.to_string()))
    }
}
