//! REST binding — generates `/{plural}` routes for every registered model.
//!
//! Every write handler runs the bound read-only hooks before the store is
//! touched, so a rejected write leaves storage unchanged.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use fieldguard::{EntryPoint, HookTable, Method, ModelDef, ModelRegistry, RelationDescriptor, RemoteCall};
use fieldguard_core::{CountResult, Record, ServiceError, id_string};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::record::RecordStore;

/// Shared state for one model's handlers.
struct ModelState {
    model: ModelDef,
    registry: Arc<ModelRegistry>,
    store: Arc<RecordStore>,
    hooks: Arc<HookTable>,
}

impl ModelState {
    /// Run the hooks bound to `entry_point` and return the rewritten body.
    async fn guard(&self, entry_point: EntryPoint, call: RemoteCall) -> Result<Record, ServiceError> {
        let mut call = call;
        self.hooks
            .before_remote(self.model.name(), &entry_point, &mut call)
            .await?;
        Ok(call.body.unwrap_or_default())
    }

    /// A "has" relation of this model and the related model definition.
    fn related(&self, relation: &str) -> Result<(&RelationDescriptor, &ModelDef), ServiceError> {
        let not_found = || {
            ServiceError::NotFound(format!(
                "{} has no relation '{}'",
                self.model.name(),
                relation
            ))
        };
        let descriptor = self
            .model
            .relation(relation)
            .filter(|r| r.kind.is_has())
            .ok_or_else(not_found)?;
        let child = self
            .registry
            .get(&descriptor.related_type)
            .ok_or_else(not_found)?;
        Ok((descriptor, child))
    }

    /// Stored id value of a parent record, as written into child foreign keys.
    fn parent_key(&self, parent: &Record, id: &str) -> Value {
        parent
            .get(self.model.id_field())
            .cloned()
            .unwrap_or_else(|| Value::String(id.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct WhereParams {
    #[serde(rename = "where")]
    filter: Option<String>,
}

impl WhereParams {
    /// Parse the `where` query parameter. Absent means "every record".
    fn parse(&self) -> Result<Record, ServiceError> {
        match self.filter.as_deref() {
            None | Some("") => Ok(Record::new()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| ServiceError::Validation(format!("invalid where filter: {}", e))),
        }
    }
}

/// Build an Axum router covering every model in the hook table's registry.
///
/// Routes per model:
///   GET    /{plural}                        — list
///   POST   /{plural}                        — create
///   PUT    /{plural}                        — replaceOrCreate
///   PATCH  /{plural}                        — patchOrCreate
///   POST   /{plural}/update?where=          — updateAll
///   POST   /{plural}/upsertWithWhere?where= — upsertWithWhere
///   GET    /{plural}/{id}                   — get by id
///   PUT    /{plural}/{id}                   — replaceById
///   PATCH  /{plural}/{id}                   — patchAttributes
///   DELETE /{plural}/{id}                   — delete
///   GET    /{plural}/{id}/{rel}             — list related
///   POST   /{plural}/{id}/{rel}             — create related
///   PUT    /{plural}/{id}/{rel}/{fk}        — update related
pub fn rest_router(store: Arc<RecordStore>, hooks: Arc<HookTable>) -> Router {
    let registry = Arc::clone(hooks.enforcer().registry());
    if registry.is_empty() {
        warn!("no models registered, REST router has no routes");
    }
    let mut router = Router::new();
    for model in registry.models() {
        debug!("mounting /{} for {}", model.plural(), model.name());
        router = router.merge(model_router(
            model.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&hooks),
        ));
    }
    router
}

fn model_router(
    model: ModelDef,
    registry: Arc<ModelRegistry>,
    store: Arc<RecordStore>,
    hooks: Arc<HookTable>,
) -> Router {
    let plural = model.plural().to_string();
    let state = Arc::new(ModelState {
        model,
        registry,
        store,
        hooks,
    });

    let list_path = format!("/{}", plural);
    let update_all_path = format!("/{}/update", plural);
    let upsert_where_path = format!("/{}/upsertWithWhere", plural);
    let item_path = format!("/{}/{{id}}", plural);
    let related_path = format!("/{}/{{id}}/{{relation}}", plural);
    let related_item_path = format!("/{}/{{id}}/{{relation}}/{{fk}}", plural);

    Router::new()
        .route(
            &list_path,
            get(list_handler)
                .post(create_handler)
                .put(replace_or_create_handler)
                .patch(patch_or_create_handler),
        )
        .route(&update_all_path, post(update_all_handler))
        .route(&upsert_where_path, post(upsert_with_where_handler))
        .route(
            &item_path,
            get(get_handler)
                .put(replace_by_id_handler)
                .patch(patch_attributes_handler)
                .delete(delete_handler),
        )
        .route(&related_path, get(list_related_handler).post(create_related_handler))
        .route(&related_item_path, put(update_related_handler))
        .with_state(state)
}

fn check_body_id(model: &ModelDef, id: &str, body: &Record) -> Result<(), ServiceError> {
    match body.get(model.id_field()).and_then(id_string) {
        Some(body_id) if body_id != id => Err(ServiceError::Validation(format!(
            "URL key '{}' does not match body key '{}'",
            id, body_id
        ))),
        _ => Ok(()),
    }
}

async fn list_handler(State(state): State<Arc<ModelState>>) -> Result<Json<Vec<Record>>, ServiceError> {
    Ok(Json(state.store.list(state.model.name())?))
}

async fn get_handler(
    State(state): State<Arc<ModelState>>,
    Path(id): Path<String>,
) -> Result<Json<Record>, ServiceError> {
    Ok(Json(state.store.get_or_err(&state.model, &id)?))
}

async fn create_handler(
    State(state): State<Arc<ModelState>>,
    Json(body): Json<Record>,
) -> Result<Json<Record>, ServiceError> {
    let body = state
        .guard(Method::Create.into(), RemoteCall::new(Some(body)))
        .await?;
    Ok(Json(state.store.create(&state.model, body)?))
}

async fn replace_or_create_handler(
    State(state): State<Arc<ModelState>>,
    Json(body): Json<Record>,
) -> Result<Json<Record>, ServiceError> {
    let body = state
        .guard(Method::ReplaceOrCreate.into(), RemoteCall::new(Some(body)))
        .await?;
    Ok(Json(state.store.replace_or_create(&state.model, body)?))
}

async fn patch_or_create_handler(
    State(state): State<Arc<ModelState>>,
    Json(body): Json<Record>,
) -> Result<Json<Record>, ServiceError> {
    let body = state
        .guard(Method::PatchOrCreate.into(), RemoteCall::new(Some(body)))
        .await?;
    Ok(Json(state.store.patch_or_create(&state.model, body)?))
}

async fn replace_by_id_handler(
    State(state): State<Arc<ModelState>>,
    Path(id): Path<String>,
    Json(body): Json<Record>,
) -> Result<Json<Record>, ServiceError> {
    check_body_id(&state.model, &id, &body)?;
    let body = state
        .guard(Method::ReplaceById.into(), RemoteCall::new(Some(body)).with_id(&id))
        .await?;
    Ok(Json(state.store.replace(&state.model, &id, body)?))
}

async fn patch_attributes_handler(
    State(state): State<Arc<ModelState>>,
    Path(id): Path<String>,
    Json(body): Json<Record>,
) -> Result<Json<Record>, ServiceError> {
    check_body_id(&state.model, &id, &body)?;
    let body = state
        .guard(Method::PatchAttributes.into(), RemoteCall::new(Some(body)).with_id(&id))
        .await?;
    Ok(Json(state.store.patch(&state.model, &id, &body)?))
}

async fn update_all_handler(
    State(state): State<Arc<ModelState>>,
    Query(params): Query<WhereParams>,
    Json(body): Json<Record>,
) -> Result<Json<CountResult>, ServiceError> {
    let filter = params.parse()?;
    let body = state
        .guard(Method::UpdateAll.into(), RemoteCall::new(Some(body)))
        .await?;
    let count = state.store.update_all(&state.model, &filter, &body)?;
    Ok(Json(CountResult { count }))
}

async fn upsert_with_where_handler(
    State(state): State<Arc<ModelState>>,
    Query(params): Query<WhereParams>,
    Json(body): Json<Record>,
) -> Result<Json<Record>, ServiceError> {
    let filter = params.parse()?;
    let body = state
        .guard(Method::UpsertWithWhere.into(), RemoteCall::new(Some(body)))
        .await?;
    Ok(Json(state.store.upsert_with_where(&state.model, &filter, body)?))
}

async fn delete_handler(
    State(state): State<Arc<ModelState>>,
    Path(id): Path<String>,
) -> Result<(), ServiceError> {
    state.store.delete(&state.model, &id)?;
    Ok(())
}

async fn list_related_handler(
    State(state): State<Arc<ModelState>>,
    Path((id, relation)): Path<(String, String)>,
) -> Result<Json<Vec<Record>>, ServiceError> {
    let (descriptor, child) = state.related(&relation)?;
    let parent = state.store.get_or_err(&state.model, &id)?;

    let mut filter = Record::new();
    filter.insert(descriptor.foreign_key.clone(), state.parent_key(&parent, &id));
    Ok(Json(state.store.find_where(child.name(), &filter)?))
}

async fn create_related_handler(
    State(state): State<Arc<ModelState>>,
    Path((id, relation)): Path<(String, String)>,
    Json(body): Json<Record>,
) -> Result<Json<Record>, ServiceError> {
    let (descriptor, child) = state.related(&relation)?;
    let parent = state.store.get_or_err(&state.model, &id)?;

    let entry_point = EntryPoint::CreateRelated(descriptor.name.clone());
    let mut body = state
        .guard(entry_point, RemoteCall::new(Some(body)).with_id(&id))
        .await?;
    body.insert(descriptor.foreign_key.clone(), state.parent_key(&parent, &id));
    Ok(Json(state.store.create(child, body)?))
}

async fn update_related_handler(
    State(state): State<Arc<ModelState>>,
    Path((id, relation, fk)): Path<(String, String, String)>,
    Json(body): Json<Record>,
) -> Result<Json<Record>, ServiceError> {
    let (descriptor, child) = state.related(&relation)?;
    let parent = state.store.get_or_err(&state.model, &id)?;
    let parent_key = state.parent_key(&parent, &id);

    let existing = state.store.get_or_err(child, &fk)?;
    if existing.get(&descriptor.foreign_key) != Some(&parent_key) {
        return Err(ServiceError::NotFound(format!(
            "{} '{}' is not related to {} '{}'",
            child.name(),
            fk,
            state.model.name(),
            id
        )));
    }
    check_body_id(child, &fk, &body)?;

    let entry_point = EntryPoint::UpdateRelated(descriptor.name.clone());
    let mut body = state
        .guard(entry_point, RemoteCall::new(Some(body)).with_id(&id).with_fk(&fk))
        .await?;
    body.insert(descriptor.foreign_key.clone(), parent_key);
    Ok(Json(state.store.patch(child, &fk, &body)?))
}
