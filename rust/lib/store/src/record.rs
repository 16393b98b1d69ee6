//! RecordStore: JSON records of every model in a single redb table.
//!
//! Keys are `{model}/{id}`. Every write is one redb transaction, so
//! read-modify-write operations (patch, bulk update) are atomic.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fieldguard::{ModelDef, RecordLookup};
use fieldguard_core::{Record, ServiceError, id_string, merge_patch, new_id};
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

fn storage_err(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Storage(e.to_string())
}

fn record_key(record_type: &str, id: &str) -> String {
    format!("{}/{}", record_type, id)
}

fn type_prefix(record_type: &str) -> String {
    format!("{}/", record_type)
}

fn decode(bytes: &[u8]) -> Result<Record, ServiceError> {
    serde_json::from_slice(bytes).map_err(|e| ServiceError::Internal(format!("deserialize: {}", e)))
}

fn encode(record: &Record) -> Result<Vec<u8>, ServiceError> {
    serde_json::to_vec(record).map_err(|e| ServiceError::Internal(format!("serialize: {}", e)))
}

fn not_found(model: &ModelDef, id: &str) -> ServiceError {
    ServiceError::NotFound(format!("{} '{}' not found", model.name(), id))
}

/// True when every field of `filter` is present in `record` with an equal value.
pub fn matches_filter(record: &Record, filter: &Record) -> bool {
    filter.iter().all(|(field, value)| record.get(field) == Some(value))
}

/// Merge `patch` into `base`, keeping the stored identifier.
fn apply_patch(model: &ModelDef, base: &mut Record, patch: &Record) {
    let id = base.get(model.id_field()).cloned();
    merge_patch(base, patch);
    if let Some(id) = id {
        base.insert(model.id_field().to_string(), id);
    }
}

/// Embedded store for all model records.
pub struct RecordStore {
    db: Arc<Database>,
}

impl RecordStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, ServiceError> {
        let db = Database::create(path).map_err(storage_err)?;

        // Ensure the table exists so read transactions never fail on a fresh file.
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            let _table = write_txn.open_table(RECORDS).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a record by id. Returns None if not found.
    pub fn get(&self, record_type: &str, id: &str) -> Result<Option<Record>, ServiceError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(RECORDS).map_err(storage_err)?;
        let key = record_key(record_type, id);
        let value = table.get(key.as_str()).map_err(storage_err)?;
        value.map(|v| decode(v.value())).transpose()
    }

    /// Get a record or return NotFound.
    pub fn get_or_err(&self, model: &ModelDef, id: &str) -> Result<Record, ServiceError> {
        self.get(model.name(), id)?.ok_or_else(|| not_found(model, id))
    }

    /// All records of a model, ordered by id.
    pub fn list(&self, record_type: &str) -> Result<Vec<Record>, ServiceError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(RECORDS).map_err(storage_err)?;
        let prefix = type_prefix(record_type);

        let mut records = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(storage_err)? {
            let (key, value) = entry.map_err(storage_err)?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            records.push(decode(value.value())?);
        }
        Ok(records)
    }

    /// Records of a model matching an equality filter.
    pub fn find_where(&self, record_type: &str, filter: &Record) -> Result<Vec<Record>, ServiceError> {
        let mut records = self.list(record_type)?;
        records.retain(|r| matches_filter(r, filter));
        Ok(records)
    }

    /// Read, transform and write back one record in a single transaction.
    fn write_one<F>(&self, key: &str, f: F) -> Result<Record, ServiceError>
    where
        F: FnOnce(Option<Record>) -> Result<Record, ServiceError>,
    {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let record = {
            let mut table = write_txn.open_table(RECORDS).map_err(storage_err)?;
            let existing = table
                .get(key)
                .map_err(storage_err)?
                .map(|v| decode(v.value()))
                .transpose()?;
            let record = f(existing)?;
            let bytes = encode(&record)?;
            table.insert(key, bytes.as_slice()).map_err(storage_err)?;
            record
        };
        write_txn.commit().map_err(storage_err)?;
        Ok(record)
    }

    /// Insert a new record. Assigns an id when the record has none.
    pub fn create(&self, model: &ModelDef, mut record: Record) -> Result<Record, ServiceError> {
        let id = match record.get(model.id_field()).and_then(id_string) {
            Some(id) => id,
            None => {
                let id = new_id();
                record.insert(model.id_field().to_string(), Value::String(id.clone()));
                id
            }
        };

        self.write_one(&record_key(model.name(), &id), |existing| {
            if existing.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "{} '{}' already exists",
                    model.name(),
                    id
                )));
            }
            Ok(record)
        })
    }

    /// Replace an existing record wholesale. Fields absent from `record` are cleared.
    pub fn replace(&self, model: &ModelDef, id: &str, mut record: Record) -> Result<Record, ServiceError> {
        if record.get(model.id_field()).and_then(id_string).is_none() {
            record.insert(model.id_field().to_string(), Value::String(id.to_string()));
        }
        self.write_one(&record_key(model.name(), id), |existing| match existing {
            Some(_) => Ok(record),
            None => Err(not_found(model, id)),
        })
    }

    /// Merge-patch an existing record (RFC 7386).
    pub fn patch(&self, model: &ModelDef, id: &str, patch: &Record) -> Result<Record, ServiceError> {
        self.write_one(&record_key(model.name(), id), |existing| {
            let mut base = existing.ok_or_else(|| not_found(model, id))?;
            apply_patch(model, &mut base, patch);
            Ok(base)
        })
    }

    /// Replace the record named by the payload id, or create it.
    pub fn replace_or_create(&self, model: &ModelDef, record: Record) -> Result<Record, ServiceError> {
        match record.get(model.id_field()).and_then(id_string) {
            Some(id) => self.write_one(&record_key(model.name(), &id), |_| Ok(record)),
            None => self.create(model, record),
        }
    }

    /// Patch the record named by the payload id, or create it.
    pub fn patch_or_create(&self, model: &ModelDef, record: Record) -> Result<Record, ServiceError> {
        match record.get(model.id_field()).and_then(id_string) {
            Some(id) => self.write_one(&record_key(model.name(), &id), |existing| match existing {
                Some(mut base) => {
                    apply_patch(model, &mut base, &record);
                    Ok(base)
                }
                None => Ok(record),
            }),
            None => self.create(model, record),
        }
    }

    /// Patch every record matching `filter`. Returns the number updated.
    pub fn update_all(&self, model: &ModelDef, filter: &Record, patch: &Record) -> Result<usize, ServiceError> {
        let prefix = type_prefix(model.name());
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let count = {
            let mut table = write_txn.open_table(RECORDS).map_err(storage_err)?;

            let mut matched = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(storage_err)? {
                let (key, value) = entry.map_err(storage_err)?;
                let key = key.value().to_string();
                if !key.starts_with(&prefix) {
                    break;
                }
                let record = decode(value.value())?;
                if matches_filter(&record, filter) {
                    matched.push((key, record));
                }
            }

            let count = matched.len();
            for (key, mut record) in matched {
                apply_patch(model, &mut record, patch);
                let bytes = encode(&record)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(storage_err)?;
            }
            count
        };
        write_txn.commit().map_err(storage_err)?;
        Ok(count)
    }

    /// Patch the single record matching `filter`, or create one.
    pub fn upsert_with_where(
        &self,
        model: &ModelDef,
        filter: &Record,
        record: Record,
    ) -> Result<Record, ServiceError> {
        let matches = self.find_where(model.name(), filter)?;
        match matches.as_slice() {
            [] => self.create(model, record),
            [existing] => {
                let id = existing
                    .get(model.id_field())
                    .and_then(id_string)
                    .ok_or_else(|| ServiceError::Internal(format!("{} record without id", model.name())))?;
                self.patch(model, &id, &record)
            }
            _ => Err(ServiceError::Validation(format!(
                "multiple {} records match, upsert not performed",
                model.name()
            ))),
        }
    }

    /// Delete a record by id.
    pub fn delete(&self, model: &ModelDef, id: &str) -> Result<(), ServiceError> {
        let key = record_key(model.name(), id);
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let removed = {
            let mut table = write_txn.open_table(RECORDS).map_err(storage_err)?;
            let removed = table.remove(key.as_str()).map_err(storage_err)?;
            removed.is_some()
        };
        if !removed {
            return Err(not_found(model, id));
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordLookup for RecordStore {
    async fn find_by_id(&self, record_type: &str, id: &str) -> Result<Option<Record>, ServiceError> {
        self.get(record_type, id)
    }
}
