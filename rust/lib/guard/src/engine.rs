//! Enforcement engine: decides, before a write reaches storage, which
//! submitted fields are dropped, which are restored from the persisted
//! instance, and whether the whole write is refused.

use std::sync::Arc;

use async_trait::async_trait;
use fieldguard_core::{Record, ServiceError, id_string};
use serde_json::Value;
use tracing::debug;

use crate::policy::{FieldMode, Policy};
use crate::registry::ModelRegistry;

/// Storage lookup used to restore protected values.
#[async_trait]
pub trait RecordLookup: Send + Sync {
    /// Fetch one persisted instance. `Ok(None)` when it does not exist;
    /// any other failure is returned as-is.
    async fn find_by_id(&self, record_type: &str, id: &str) -> Result<Option<Record>, ServiceError>;
}

/// Shape of the write being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Always creates a new instance.
    Create,
    /// Replaces or patches the instance named in the payload, or creates one.
    Upsert,
    /// Modifies one addressed instance.
    Update,
    /// Modifies every instance matching a query.
    BulkUpdate,
}

/// Per-request input to [`Enforcer::enforce`]. The payload is rewritten in place.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteContext {
    pub target_type: String,
    pub payload: Option<Record>,
    /// Identifier of the addressed resource (URL path), if any.
    pub target_id: Option<String>,
    pub kind: WriteKind,
    /// Reached through a relation route rather than the model's own routes.
    pub is_relation_write: bool,
}

impl WriteContext {
    pub fn new(target_type: impl Into<String>, kind: WriteKind, payload: Option<Record>) -> Self {
        Self {
            target_type: target_type.into(),
            payload,
            target_id: None,
            kind,
            is_relation_write: false,
        }
    }

    pub fn with_target_id(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn through_relation(mut self) -> Self {
        self.is_relation_write = true;
        self
    }
}

/// The read-only enforcement engine.
///
/// Holds no per-request state. Each call performs at most one storage read.
pub struct Enforcer {
    registry: Arc<ModelRegistry>,
    lookup: Arc<dyn RecordLookup>,
}

impl Enforcer {
    pub fn new(registry: Arc<ModelRegistry>, lookup: Arc<dyn RecordLookup>) -> Self {
        Self { registry, lookup }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Apply the target type's policy to `ctx.payload`.
    ///
    /// On rejection the payload is left untouched. The payload is only
    /// modified after the persisted instance has been fetched, so dropping
    /// the returned future never leaves a half-applied payload.
    pub async fn enforce(&self, ctx: &mut WriteContext) -> Result<(), ServiceError> {
        let Some(submitted) = ctx.payload.as_ref() else {
            return Ok(());
        };
        let policy = match self.registry.resolve(&ctx.target_type) {
            Ok(policy) => policy,
            Err(_) => return Ok(()),
        };
        // An empty body is still a write to a locked type.
        if submitted.is_empty() && !policy.is_fully_locked() {
            return Ok(());
        }
        debug!(
            "enforcing read-only policy for {} ({:?}, relation: {})",
            ctx.target_type, ctx.kind, ctx.is_relation_write
        );

        let effective_id = self.effective_id(ctx);
        let is_creation = match ctx.kind {
            WriteKind::Create => true,
            WriteKind::Upsert => effective_id.is_none(),
            WriteKind::Update | WriteKind::BulkUpdate => false,
        };

        if policy.is_fully_locked() {
            let exempt = policy.creation_exempt_fields();
            if is_creation && !exempt.is_empty() {
                if let Some(payload) = ctx.payload.as_mut() {
                    payload.retain(|field, _| {
                        let keep = exempt.contains(field);
                        if !keep {
                            debug!("{} is read only, removing incoming '{}'", ctx.target_type, field);
                        }
                        keep
                    });
                }
                return Ok(());
            }
            return Err(ServiceError::read_only_type(&ctx.target_type));
        }

        if let Some(id) = effective_id {
            let persisted = self.lookup.find_by_id(&ctx.target_type, &id).await?;
            let Some(payload) = ctx.payload.as_mut() else {
                return Ok(());
            };
            match persisted {
                Some(instance) => restore_fields(policy, &instance, payload),
                None => {
                    debug!("{} '{}' not found, nothing to restore from", ctx.target_type, id);
                    delete_fields(policy, payload, |_| true);
                }
            }
            return Ok(());
        }

        if let Some(payload) = ctx.payload.as_mut() {
            if is_creation {
                delete_fields(policy, payload, |mode| !mode.writable_on_create());
            } else {
                delete_fields(policy, payload, |_| true);
            }
        }
        Ok(())
    }

    /// Identifier of the single instance this write addresses, if any.
    ///
    /// Relation writes carry the child identifier in the URL path, so the
    /// payload is never consulted for them.
    fn effective_id(&self, ctx: &WriteContext) -> Option<String> {
        match ctx.kind {
            WriteKind::Create | WriteKind::BulkUpdate => None,
            WriteKind::Upsert | WriteKind::Update if ctx.is_relation_write => ctx.target_id.clone(),
            WriteKind::Upsert | WriteKind::Update => self
                .payload_id(ctx)
                .or_else(|| ctx.target_id.clone()),
        }
    }

    fn payload_id(&self, ctx: &WriteContext) -> Option<String> {
        let id_field = self.registry.get(&ctx.target_type)?.id_field();
        ctx.payload.as_ref()?.get(id_field).and_then(id_string)
    }
}

fn delete_fields(policy: &Policy, payload: &mut Record, applies: impl Fn(FieldMode) -> bool) {
    for (field, mode) in policy.protected_fields() {
        if applies(*mode) && payload.remove(field).is_some() {
            debug!(
                "'{}' of {} is read only, removing incoming data",
                field,
                policy.record_type()
            );
        }
    }
}

fn restore_fields(policy: &Policy, instance: &Record, payload: &mut Record) {
    for field in policy.protected_fields().keys() {
        match instance.get(field) {
            Some(value) => {
                debug!(
                    "'{}' of {} is read only, replacing incoming data with existing value: {}",
                    field,
                    policy.record_type(),
                    value
                );
                payload.insert(field.clone(), value.clone());
            }
            None => {
                payload.remove(field);
            }
        }
    }
}

/// Unwrap a JSON object into a record. Non-objects yield `None`.
pub fn as_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::registry::ModelDef;

    /// In-memory lookup that counts calls.
    #[derive(Default)]
    struct Fixtures {
        records: HashMap<(String, String), Record>,
        calls: AtomicUsize,
    }

    impl Fixtures {
        fn with(mut self, record_type: &str, id: &str, value: Value) -> Self {
            self.records
                .insert((record_type.into(), id.into()), as_record(value).unwrap());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecordLookup for Fixtures {
        async fn find_by_id(&self, record_type: &str, id: &str) -> Result<Option<Record>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.get(&(record_type.to_string(), id.to_string())).cloned())
        }
    }

    /// Lookup that never completes.
    struct Stalled;

    #[async_trait]
    impl RecordLookup for Stalled {
        async fn find_by_id(&self, _: &str, _: &str) -> Result<Option<Record>, ServiceError> {
            std::future::pending().await
        }
    }

    /// Lookup whose backend is down.
    struct Broken;

    #[async_trait]
    impl RecordLookup for Broken {
        async fn find_by_id(&self, _: &str, _: &str) -> Result<Option<Record>, ServiceError> {
            Err(ServiceError::Storage("connection refused".into()))
        }
    }

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::new([
                ModelDef::new("Product")
                    .with_policy(Policy::fields("Product", [("status", FieldMode::Always)])),
                ModelDef::new("Person")
                    .with_plural("people")
                    .with_policy(Policy::fields("Person", [("role", FieldMode::CreateOnly)])),
                ModelDef::new("AuditTrail").with_policy(Policy::locked("AuditTrail")),
                ModelDef::new("Ledger").with_policy(Policy::locked_except("Ledger", ["x"])),
                ModelDef::new("Invoice")
                    .with_id_field("number")
                    .with_policy(Policy::fields("Invoice", [("total", FieldMode::Always)])),
                ModelDef::new("Note"),
            ])
            .unwrap(),
        )
    }

    fn enforcer(lookup: Arc<dyn RecordLookup>) -> Enforcer {
        Enforcer::new(registry(), lookup)
    }

    fn ctx(record_type: &str, kind: WriteKind, payload: Value) -> WriteContext {
        WriteContext::new(record_type, kind, as_record(payload))
    }

    fn payload(ctx: &WriteContext) -> Value {
        Value::Object(ctx.payload.clone().unwrap_or_default())
    }

    #[tokio::test]
    async fn no_policy_is_noop() {
        let lookup = Arc::new(Fixtures::default());
        let engine = enforcer(lookup.clone());
        for kind in [WriteKind::Create, WriteKind::Upsert, WriteKind::Update, WriteKind::BulkUpdate] {
            let mut c = ctx("Note", kind, json!({"status": "x", "id": "1"})).with_target_id("1");
            engine.enforce(&mut c).await.unwrap();
            assert_eq!(payload(&c), json!({"status": "x", "id": "1"}));
        }
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn absent_payload_is_noop() {
        let engine = enforcer(Arc::new(Fixtures::default()));
        let mut absent = WriteContext::new("AuditTrail", WriteKind::Update, None);
        engine.enforce(&mut absent).await.unwrap();
        assert_eq!(absent.payload, None);
    }

    #[tokio::test]
    async fn empty_payload_is_noop_unless_locked() {
        let lookup = Arc::new(Fixtures::default());
        let engine = enforcer(lookup.clone());

        let mut empty = ctx("Product", WriteKind::Update, json!({})).with_target_id("1");
        engine.enforce(&mut empty).await.unwrap();
        assert_eq!(payload(&empty), json!({}));
        assert_eq!(lookup.calls(), 0);

        for kind in [WriteKind::Create, WriteKind::Update] {
            let mut locked = ctx("AuditTrail", kind, json!({}));
            let err = engine.enforce(&mut locked).await.unwrap_err();
            assert!(matches!(err, ServiceError::ReadOnly(_)));
        }

        // Exempt creation of nothing is still a creation.
        let mut exempt = ctx("Ledger", WriteKind::Create, json!({}));
        engine.enforce(&mut exempt).await.unwrap();
        assert_eq!(payload(&exempt), json!({}));
    }

    #[tokio::test]
    async fn fully_locked_rejects_create_and_update() {
        let lookup = Arc::new(Fixtures::default().with("AuditTrail", "1", json!({"event": "edit"})));
        let engine = enforcer(lookup.clone());

        let mut create = ctx("AuditTrail", WriteKind::Create, json!({"event": "update"}));
        let err = engine.enforce(&mut create).await.unwrap_err();
        assert_eq!(err, ServiceError::ReadOnly("Unable to update: AuditTrail is read only.".into()));
        assert_eq!(payload(&create), json!({"event": "update"}));

        let mut update =
            ctx("AuditTrail", WriteKind::Update, json!({"event": "update"})).with_target_id("1");
        assert!(matches!(engine.enforce(&mut update).await.unwrap_err(), ServiceError::ReadOnly(_)));

        let mut bulk = ctx("AuditTrail", WriteKind::BulkUpdate, json!({"event": "update"}));
        assert!(engine.enforce(&mut bulk).await.is_err());

        assert_eq!(lookup.calls(), 0, "rejection must not touch storage");
    }

    #[tokio::test]
    async fn fully_locked_with_exemptions_narrows_creation() {
        let engine = enforcer(Arc::new(Fixtures::default()));

        let mut create = ctx("Ledger", WriteKind::Create, json!({"x": 1, "y": 2}));
        engine.enforce(&mut create).await.unwrap();
        assert_eq!(payload(&create), json!({"x": 1}));

        let mut upsert = ctx("Ledger", WriteKind::Upsert, json!({"x": 1, "y": 2}));
        engine.enforce(&mut upsert).await.unwrap();
        assert_eq!(payload(&upsert), json!({"x": 1}));

        let mut update = ctx("Ledger", WriteKind::Update, json!({"x": 1})).with_target_id("7");
        assert!(matches!(engine.enforce(&mut update).await.unwrap_err(), ServiceError::ReadOnly(_)));

        let mut addressed_upsert = ctx("Ledger", WriteKind::Upsert, json!({"id": "7", "x": 1}));
        assert!(engine.enforce(&mut addressed_upsert).await.is_err());
    }

    #[tokio::test]
    async fn always_field_dropped_on_create() {
        let engine = enforcer(Arc::new(Fixtures::default()));
        let mut c = ctx("Product", WriteKind::Create, json!({"name": "a", "status": "pending"}));
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"name": "a"}));
    }

    #[tokio::test]
    async fn always_field_restored_on_update() {
        let lookup = Arc::new(
            Fixtures::default().with("Product", "p1", json!({"id": "p1", "name": "a", "status": "pending"})),
        );
        let engine = enforcer(lookup.clone());
        let mut c = ctx("Product", WriteKind::Update, json!({"name": "b", "status": "active"}))
            .with_target_id("p1");
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"name": "b", "status": "pending"}));
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn restore_supplies_omitted_field() {
        let lookup = Arc::new(
            Fixtures::default().with("Product", "p1", json!({"id": "p1", "status": "pending"})),
        );
        let engine = enforcer(lookup);
        let mut c = ctx("Product", WriteKind::Update, json!({"name": "b"})).with_target_id("p1");
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"name": "b", "status": "pending"}));
    }

    #[tokio::test]
    async fn restore_removes_field_missing_from_instance() {
        let lookup = Arc::new(Fixtures::default().with("Product", "p1", json!({"id": "p1"})));
        let engine = enforcer(lookup);
        let mut c = ctx("Product", WriteKind::Update, json!({"name": "b", "status": "active"}))
            .with_target_id("p1");
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"name": "b"}));
    }

    #[tokio::test]
    async fn create_only_kept_on_create_restored_on_update() {
        let lookup = Arc::new(
            Fixtures::default().with("Person", "tom", json!({"id": "tom", "role": "admin"})),
        );
        let engine = enforcer(lookup);

        let mut create = ctx("Person", WriteKind::Create, json!({"role": "admin"}));
        engine.enforce(&mut create).await.unwrap();
        assert_eq!(payload(&create), json!({"role": "admin"}));

        let mut update = ctx("Person", WriteKind::Update, json!({"role": "user"})).with_target_id("tom");
        engine.enforce(&mut update).await.unwrap();
        assert_eq!(payload(&update), json!({"role": "admin"}));
    }

    #[tokio::test]
    async fn missing_instance_falls_back_to_delete() {
        let engine = enforcer(Arc::new(Fixtures::default()));
        let mut c = ctx("Person", WriteKind::Update, json!({"name": "x", "role": "user"}))
            .with_target_id("gone");
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"name": "x"}));
    }

    #[tokio::test]
    async fn bulk_update_strips_without_lookup() {
        let lookup = Arc::new(Fixtures::default());
        let engine = enforcer(lookup.clone());

        let mut c = ctx("Person", WriteKind::BulkUpdate, json!({"name": "x", "role": "user"}));
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"name": "x"}));

        let mut c = ctx("Product", WriteKind::BulkUpdate, json!({"status": "active"}));
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({}));

        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn upsert_prefers_payload_identifier() {
        let lookup = Arc::new(
            Fixtures::default()
                .with("Product", "from-body", json!({"status": "body"}))
                .with("Product", "from-path", json!({"status": "path"})),
        );
        let engine = enforcer(lookup);

        let mut c = ctx("Product", WriteKind::Upsert, json!({"id": "from-body", "status": "x"}))
            .with_target_id("from-path");
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c)["status"], json!("body"));

        // Without a payload identifier the upsert is a creation.
        let mut c = ctx("Product", WriteKind::Upsert, json!({"name": "n", "status": "x"}));
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"name": "n"}));
    }

    #[tokio::test]
    async fn upsert_creation_keeps_create_only() {
        let engine = enforcer(Arc::new(Fixtures::default()));
        let mut c = ctx("Person", WriteKind::Upsert, json!({"role": "admin"}));
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"role": "admin"}));
    }

    #[tokio::test]
    async fn payload_identifier_uses_model_id_field() {
        let lookup = Arc::new(Fixtures::default().with("Invoice", "42", json!({"number": 42, "total": 100})));
        let engine = enforcer(lookup);
        let mut c = ctx("Invoice", WriteKind::Upsert, json!({"number": 42, "total": 1}));
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), json!({"number": 42, "total": 100}));
    }

    #[tokio::test]
    async fn relation_write_ignores_payload_identifier() {
        let lookup = Arc::new(
            Fixtures::default()
                .with("Product", "child", json!({"status": "child"}))
                .with("Product", "spoofed", json!({"status": "spoofed"})),
        );
        let engine = enforcer(lookup);
        let mut c = ctx("Product", WriteKind::Update, json!({"id": "spoofed", "status": "x"}))
            .with_target_id("child")
            .through_relation();
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c)["status"], json!("child"));
    }

    #[tokio::test]
    async fn enforce_is_idempotent() {
        let lookup = Arc::new(
            Fixtures::default().with("Product", "p1", json!({"id": "p1", "status": "pending"})),
        );
        let engine = enforcer(lookup);

        let mut c = ctx("Product", WriteKind::Update, json!({"name": "b", "status": "active"}))
            .with_target_id("p1");
        engine.enforce(&mut c).await.unwrap();
        let once = payload(&c);
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), once);

        let mut c = ctx("Product", WriteKind::Create, json!({"name": "a", "status": "x"}));
        engine.enforce(&mut c).await.unwrap();
        let once = payload(&c);
        engine.enforce(&mut c).await.unwrap();
        assert_eq!(payload(&c), once);
    }

    #[tokio::test]
    async fn storage_failure_propagates_untouched() {
        let engine = enforcer(Arc::new(Broken));
        let mut c = ctx("Product", WriteKind::Update, json!({"status": "active"})).with_target_id("p1");
        let err = engine.enforce(&mut c).await.unwrap_err();
        assert_eq!(err, ServiceError::Storage("connection refused".into()));
        assert_eq!(payload(&c), json!({"status": "active"}));
    }

    #[tokio::test]
    async fn cancelled_lookup_leaves_payload_untouched() {
        let engine = enforcer(Arc::new(Stalled));
        let mut c = ctx("Product", WriteKind::Update, json!({"status": "active"})).with_target_id("p1");
        let result = tokio::time::timeout(Duration::from_millis(20), engine.enforce(&mut c)).await;
        assert!(result.is_err(), "lookup should not complete");
        assert_eq!(payload(&c), json!({"status": "active"}));
    }
}
