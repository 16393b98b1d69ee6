//! Hook table: which write entry points run the enforcer, and how each
//! one turns a remote call into a [`WriteContext`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use fieldguard_core::{Record, ServiceError};
use tracing::debug;

use crate::cascade;
use crate::engine::{Enforcer, WriteContext, WriteKind};

/// Write methods every model exposes directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Create,
    ReplaceOrCreate,
    PatchOrCreate,
    ReplaceById,
    PatchAttributes,
    UpdateAll,
    UpsertWithWhere,
}

impl Method {
    /// Every direct write method, in binding order.
    pub const ALL: [Method; 7] = [
        Method::Create,
        Method::ReplaceOrCreate,
        Method::PatchOrCreate,
        Method::ReplaceById,
        Method::PatchAttributes,
        Method::UpdateAll,
        Method::UpsertWithWhere,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::ReplaceOrCreate => "replaceOrCreate",
            Method::PatchOrCreate => "patchOrCreate",
            Method::ReplaceById => "replaceById",
            Method::PatchAttributes => "prototype.patchAttributes",
            Method::UpdateAll => "updateAll",
            Method::UpsertWithWhere => "upsertWithWhere",
        }
    }

    pub fn binding(self) -> Binding {
        match self {
            Method::Create => Binding::direct(WriteKind::Create, IdSource::None),
            Method::ReplaceOrCreate | Method::PatchOrCreate => {
                Binding::direct(WriteKind::Upsert, IdSource::None)
            }
            Method::ReplaceById | Method::PatchAttributes => {
                Binding::direct(WriteKind::Update, IdSource::Instance)
            }
            Method::UpdateAll | Method::UpsertWithWhere => {
                Binding::direct(WriteKind::BulkUpdate, IdSource::None)
            }
        }
    }
}

/// A write entry point of one model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryPoint {
    Method(Method),
    /// Create a related instance through the named relation.
    CreateRelated(String),
    /// Update a related instance, addressed by its id, through the named relation.
    UpdateRelated(String),
}

impl EntryPoint {
    pub fn binding(&self) -> Binding {
        match self {
            EntryPoint::Method(method) => method.binding(),
            EntryPoint::CreateRelated(_) => Binding::relation(WriteKind::Create, IdSource::None),
            EntryPoint::UpdateRelated(_) => Binding::relation(WriteKind::Update, IdSource::Related),
        }
    }
}

impl From<Method> for EntryPoint {
    fn from(method: Method) -> Self {
        EntryPoint::Method(method)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Method(method) => f.write_str(method.as_str()),
            EntryPoint::CreateRelated(relation) => write!(f, "prototype.__create__{}", relation),
            EntryPoint::UpdateRelated(relation) => write!(f, "prototype.__updateById__{}", relation),
        }
    }
}

/// Where the addressed identifier of a call comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    /// The call addresses no single instance.
    None,
    /// The instance id in the path (`/{plural}/{id}`).
    Instance,
    /// The related instance id in a nested path (`/{plural}/{id}/{rel}/{fk}`).
    Related,
}

/// How an entry point is turned into a [`WriteContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub kind: WriteKind,
    pub id_source: IdSource,
    pub is_relation_write: bool,
}

impl Binding {
    pub const fn direct(kind: WriteKind, id_source: IdSource) -> Self {
        Self {
            kind,
            id_source,
            is_relation_write: false,
        }
    }

    pub const fn relation(kind: WriteKind, id_source: IdSource) -> Self {
        Self {
            kind,
            id_source,
            is_relation_write: true,
        }
    }
}

/// What the transport extracted from an inbound write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteCall {
    pub body: Option<Record>,
    /// Path id of the addressed instance (the parent, on nested routes).
    pub id: Option<String>,
    /// Path id of the related instance on nested routes.
    pub fk: Option<String>,
}

impl RemoteCall {
    pub fn new(body: Option<Record>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_fk(mut self, fk: impl Into<String>) -> Self {
        self.fk = Some(fk.into());
        self
    }

    fn addressed(&self, source: IdSource) -> Option<String> {
        match source {
            IdSource::None => None,
            IdSource::Instance => self.id.clone(),
            IdSource::Related => self.fk.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Hook {
    target_type: String,
}

/// Enforcer bindings for every model and entry point, built once.
pub struct HookTable {
    enforcer: Arc<Enforcer>,
    hooks: HashMap<String, HashMap<EntryPoint, Vec<Hook>>>,
}

impl HookTable {
    /// Bind the enforcer to the direct methods of every model that has a
    /// policy, and to the relation entry points found by the cascade.
    pub fn bind(enforcer: Arc<Enforcer>) -> Self {
        let registry = Arc::clone(enforcer.registry());
        let mut table: HashMap<String, HashMap<EntryPoint, BTreeSet<Hook>>> = HashMap::new();

        for model in registry.models().filter(|m| m.policy().is_some()) {
            let entries = table.entry(model.name().to_string()).or_default();
            for method in Method::ALL {
                entries.entry(method.into()).or_default().insert(Hook {
                    target_type: model.name().to_string(),
                });
            }
        }

        for binding in cascade::relation_bindings(&registry) {
            debug!(
                "binding {} on {} to {}",
                binding.entry_point, binding.owner, binding.target_type
            );
            table
                .entry(binding.owner)
                .or_default()
                .entry(binding.entry_point)
                .or_default()
                .insert(Hook {
                    target_type: binding.target_type,
                });
        }

        let hooks = table
            .into_iter()
            .map(|(model, entries)| {
                let entries = entries
                    .into_iter()
                    .map(|(entry, hooks)| (entry, hooks.into_iter().collect()))
                    .collect();
                (model, entries)
            })
            .collect();

        Self { enforcer, hooks }
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    /// Whether any hook runs for this model and entry point.
    #[cfg(test)]
    fn is_bound(&self, model: &str, entry_point: &EntryPoint) -> bool {
        self.targets(model, entry_point).next().is_some()
    }

    /// Target types enforced for this model and entry point.
    #[cfg(test)]
    fn targets<'a>(&'a self, model: &str, entry_point: &EntryPoint) -> impl Iterator<Item = &'a str> {
        self.hooks
            .get(model)
            .and_then(|entries| entries.get(entry_point))
            .into_iter()
            .flatten()
            .map(|hook| hook.target_type.as_str())
    }

    /// Total number of bound hooks.
    pub fn len(&self) -> usize {
        self.hooks
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook bound to `model`/`entry_point` against the call body.
    ///
    /// The body is replaced only when all hooks succeed.
    pub async fn before_remote(
        &self,
        model: &str,
        entry_point: &EntryPoint,
        call: &mut RemoteCall,
    ) -> Result<(), ServiceError> {
        let Some(hooks) = self.hooks.get(model).and_then(|e| e.get(entry_point)) else {
            return Ok(());
        };
        let binding = entry_point.binding();

        let mut body = call.body.clone();
        for hook in hooks {
            debug!("{} {}: checking {}", model, entry_point, hook.target_type);
            let mut ctx = WriteContext {
                target_type: hook.target_type.clone(),
                payload: body,
                target_id: call.addressed(binding.id_source),
                kind: binding.kind,
                is_relation_write: binding.is_relation_write,
            };
            self.enforcer.enforce(&mut ctx).await?;
            body = ctx.payload;
        }
        call.body = body;
        Ok(())
    }
}
