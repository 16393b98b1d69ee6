//! Read-only field enforcement.
//!
//! Models declare which fields callers may never set (`Always`) or may set
//! only when creating (`CreateOnly`), or lock the whole type. The
//! [`Enforcer`] rewrites inbound write payloads before they reach storage;
//! the [`HookTable`] binds it to every write entry point, including nested
//! writes through relations.
//!
//! ```ignore
//! let registry = Arc::new(ModelRegistry::from_configs(config.models)?);
//! let enforcer = Arc::new(Enforcer::new(registry, store));
//! let hooks = HookTable::bind(enforcer);
//! hooks.before_remote("Product", &Method::Create.into(), &mut call).await?;
//! ```

pub mod cascade;
pub mod config;
pub mod engine;
pub mod hooks;
pub mod policy;
pub mod registry;

pub use cascade::{RelationBinding, relation_bindings};
pub use config::{ConfigError, FieldSpec, ModelConfig, ReadOnlySpec, RelationConfig};
pub use engine::{Enforcer, RecordLookup, WriteContext, WriteKind, as_record};
pub use hooks::{Binding, EntryPoint, HookTable, IdSource, Method, RemoteCall};
pub use policy::{FieldMode, Policy};
pub use registry::{ModelDef, ModelRegistry, PolicyNotFound, RelationDescriptor, RelationKind};
