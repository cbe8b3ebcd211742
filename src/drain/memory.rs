use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{DestroyOutcome, DrainStore, ExfilRecord};
use crate::error::{AttackError, AttackResult};
use crate::loot::LootWriter;

fn auth_denied(action: &'static str) -> AttackError {
    AttackError::Auth {
        action,
        code: Some("InvalidClientTokenId".into()),
        message: "the security token included in the request is invalid".into(),
    }
}

fn not_found(action: &'static str, what: &str) -> AttackError {
    AttackError::NotFound {
        action,
        code: Some("ResourceNotFoundException".into()),
        message: format!("{what} does not exist"),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// In-memory bucket fixture with S3 delete semantics (deleting a missing
/// key succeeds). Used by the offline mode and the scenario tests.
pub struct MemoryBuckets {
    note_object: String,
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    fail_get: HashSet<(String, String)>,
    deny: bool,
}

impl MemoryBuckets {
    pub fn new(note_object: impl Into<String>) -> Self {
        Self {
            note_object: note_object.into(),
            buckets: Mutex::new(BTreeMap::new()),
            fail_get: HashSet::new(),
            deny: false,
        }
    }

    pub fn with_bucket(self, name: &str) -> Self {
        lock(&self.buckets).entry(name.to_string()).or_default();
        self
    }

    pub fn with_object(self, bucket: &str, key: &str, body: &[u8]) -> Self {
        lock(&self.buckets)
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body.to_vec());
        self
    }

    /// Make reads of one object fail, for partial-batch tests.
    pub fn with_get_failure(mut self, bucket: &str, key: &str) -> Self {
        self.fail_get.insert((bucket.to_string(), key.to_string()));
        self
    }

    /// Simulate revoked credentials on every call.
    pub fn deny_all(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.buckets).get(bucket)?.get(key).cloned()
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        lock(&self.buckets).get(bucket).map_or(0, BTreeMap::len)
    }

    fn gate(&self, action: &'static str) -> AttackResult<()> {
        if self.deny {
            return Err(auth_denied(action));
        }
        Ok(())
    }
}

#[async_trait]
impl DrainStore for MemoryBuckets {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn list_resources(&self) -> AttackResult<Vec<String>> {
        self.gate("list buckets")?;
        Ok(lock(&self.buckets).keys().cloned().collect())
    }

    async fn exfiltrate(&self, target: &str, loot: &mut LootWriter) -> AttackResult<ExfilRecord> {
        self.gate("list objects")?;
        let objects = lock(&self.buckets)
            .get(target)
            .ok_or_else(|| not_found("list objects", target))?
            .clone();
        let mut record = ExfilRecord::new(target);
        for (key, body) in objects {
            if self.fail_get.contains(&(target.to_string(), key.clone())) {
                record.failed += 1;
                continue;
            }
            let path = loot.write_object(target, &key, &body)?;
            record.keys.push(key);
            record.items += 1;
            record.artifacts.push(path);
        }
        Ok(record)
    }

    async fn destroy(&self, target: &str, record: &ExfilRecord) -> AttackResult<DestroyOutcome> {
        self.gate("delete object")?;
        let mut buckets = lock(&self.buckets);
        let bucket = buckets
            .get_mut(target)
            .ok_or_else(|| not_found("delete object", target))?;
        let mut outcome = DestroyOutcome::default();
        for key in &record.keys {
            bucket.remove(key);
            outcome.destroyed += 1;
        }
        Ok(outcome)
    }

    async fn annotate(&self, target: &str, message: &str) -> AttackResult<()> {
        self.gate("place ransom note")?;
        lock(&self.buckets)
            .get_mut(target)
            .ok_or_else(|| not_found("place ransom note", target))?
            .insert(self.note_object.clone(), message.as_bytes().to_vec());
        Ok(())
    }
}

/// In-memory table fixture mirroring the DynamoDB drain semantics,
/// including the on-demand ransom table.
pub struct MemoryTables {
    ransom_table: String,
    tables: Mutex<BTreeMap<String, Vec<Value>>>,
    deny: bool,
}

impl MemoryTables {
    pub fn new(ransom_table: impl Into<String>) -> Self {
        Self {
            ransom_table: ransom_table.into(),
            tables: Mutex::new(BTreeMap::new()),
            deny: false,
        }
    }

    pub fn with_table(self, name: &str, rows: Vec<Value>) -> Self {
        lock(&self.tables).insert(name.to_string(), rows);
        self
    }

    pub fn deny_all(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn table_exists(&self, name: &str) -> bool {
        lock(&self.tables).contains_key(name)
    }

    pub fn table_rows(&self, name: &str) -> Option<Vec<Value>> {
        lock(&self.tables).get(name).cloned()
    }

    fn gate(&self, action: &'static str) -> AttackResult<()> {
        if self.deny {
            return Err(auth_denied(action));
        }
        Ok(())
    }
}

#[async_trait]
impl DrainStore for MemoryTables {
    fn kind(&self) -> &'static str {
        "dynamodb"
    }

    async fn list_resources(&self) -> AttackResult<Vec<String>> {
        self.gate("list tables")?;
        Ok(lock(&self.tables).keys().cloned().collect())
    }

    async fn exfiltrate(&self, target: &str, loot: &mut LootWriter) -> AttackResult<ExfilRecord> {
        self.gate("scan table")?;
        let rows = lock(&self.tables)
            .get(target)
            .ok_or_else(|| not_found("scan table", target))?
            .clone();
        let mut record = ExfilRecord::new(target);
        record.items = rows.len();
        if rows.is_empty() {
            return Ok(record);
        }
        let path = loot.write_json(&format!("{target}.json"), &rows)?;
        record.artifacts.push(path);
        Ok(record)
    }

    async fn destroy(&self, target: &str, _record: &ExfilRecord) -> AttackResult<DestroyOutcome> {
        self.gate("delete table")?;
        lock(&self.tables)
            .remove(target)
            .ok_or_else(|| not_found("delete table", target))?;
        Ok(DestroyOutcome { destroyed: 1, failed: 0 })
    }

    fn destroys_empty_targets(&self) -> bool {
        true
    }

    async fn prepare_annotation(&self) -> AttackResult<()> {
        self.gate("create ransom table")?;
        lock(&self.tables)
            .entry(self.ransom_table.clone())
            .or_default();
        Ok(())
    }

    async fn annotate(&self, target: &str, message: &str) -> AttackResult<()> {
        self.gate("insert ransom note")?;
        let note_id = format!("{target}{}", super::table_store::RANSOM_KEY_SUFFIX);
        let mut tables = lock(&self.tables);
        let rows = tables
            .get_mut(&self.ransom_table)
            .ok_or_else(|| not_found("insert ransom note", &self.ransom_table))?;
        // put-item semantics: same key replaces, never duplicates
        rows.retain(|r| r["ID"] != note_id.as_str());
        rows.push(json!({
            "ID": note_id,
            "SourceTable": target,
            "Message": message,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_fixture_lists_in_name_order() {
        let store = MemoryBuckets::new("too_late.txt")
            .with_bucket("payment-data-x")
            .with_object("customer-data-y", "a.json", b"{}");
        let listed = store.list_resources().await.unwrap();
        assert_eq!(listed, vec!["customer-data-y", "payment-data-x"]);
    }

    #[tokio::test]
    async fn note_insertion_replaces_existing_row() {
        let store = MemoryTables::new("too_late");
        store.prepare_annotation().await.unwrap();
        store.annotate("orders", "pay up").await.unwrap();
        store.annotate("orders", "pay up again").await.unwrap();
        let rows = store.table_rows("too_late").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["ID"], "orders_RANSOM_NOTE");
        assert_eq!(rows[0]["Message"], "pay up again");
    }

    #[tokio::test]
    async fn denied_fixture_fails_with_auth() {
        let store = MemoryBuckets::new("too_late.txt").deny_all();
        assert!(store.list_resources().await.unwrap_err().is_auth());
    }
}
