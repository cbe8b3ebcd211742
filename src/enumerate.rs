use std::path::PathBuf;

use aws_sdk_dynamodb as dynamodb;
use aws_sdk_iam as iam;
use aws_sdk_s3 as s3;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{classify, with_retry, AttackResult};
use crate::loot::LootWriter;
use crate::session::CloudSession;

const IDENTITY_DUMP: &str = "iam_users.json";
const BUCKET_DUMP: &str = "s3_buckets.json";
const TABLE_DUMP: &str = "dynamodb_tables.json";

/// Read-only reconnaissance across IAM, S3 and DynamoDB. Each service dump
/// lands as one JSON artifact; a failing service is logged and skipped so
/// the rest of the sweep still runs.
pub struct Enumerator {
    iam: iam::Client,
    s3: s3::Client,
    dynamodb: dynamodb::Client,
}

#[derive(Debug, Default)]
pub struct EnumerationReport {
    pub files: Vec<PathBuf>,
    pub failures: Vec<String>,
}

impl EnumerationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl Enumerator {
    pub fn new(session: &CloudSession) -> Self {
        Self {
            iam: iam::Client::new(session.config()),
            s3: s3::Client::new(session.config()),
            dynamodb: dynamodb::Client::new(session.config()),
        }
    }

    /// Run all three dumps in order, writing each into `loot`.
    pub async fn sweep(&self, loot: &mut LootWriter) -> AttackResult<EnumerationReport> {
        let mut report = EnumerationReport::default();
        record(&mut report, loot, IDENTITY_DUMP, self.dump_identities().await)?;
        record(&mut report, loot, BUCKET_DUMP, self.dump_buckets().await)?;
        record(&mut report, loot, TABLE_DUMP, self.dump_tables().await)?;
        Ok(report)
    }

    /// Every user in the account with their attached managed policies.
    async fn dump_identities(&self) -> AttackResult<Value> {
        let mut users = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let resp = with_retry("list users", || {
                let mut req = self.iam.list_users();
                if let Some(m) = &marker {
                    req = req.marker(m);
                }
                async move { req.send().await.map_err(|e| classify("list users", e)) }
            })
            .await?;
            for user in resp.users() {
                let policies = match self
                    .iam
                    .list_attached_user_policies()
                    .user_name(user.user_name())
                    .send()
                    .await
                {
                    Ok(out) => out
                        .attached_policies()
                        .iter()
                        .map(|p| json!({ "name": p.policy_name(), "arn": p.policy_arn() }))
                        .collect(),
                    Err(e) => {
                        warn!(
                            user = user.user_name(),
                            error = %classify("list attached user policies", e),
                            "attached policies not listed"
                        );
                        Vec::new()
                    }
                };
                users.push(json!({
                    "user_name": user.user_name(),
                    "user_id": user.user_id(),
                    "arn": user.arn(),
                    "attached_policies": policies,
                }));
            }
            match next_marker(resp.is_truncated(), resp.marker()) {
                Some(m) => marker = Some(m),
                None => break,
            }
        }
        Ok(Value::Array(users))
    }

    async fn dump_buckets(&self) -> AttackResult<Value> {
        let resp = with_retry("list buckets", || {
            let req = self.s3.list_buckets();
            async move { req.send().await.map_err(|e| classify("list buckets", e)) }
        })
        .await?;
        let names: Vec<&str> = resp.buckets().iter().filter_map(|b| b.name()).collect();
        Ok(json!(names))
    }

    async fn dump_tables(&self) -> AttackResult<Value> {
        let mut names: Vec<String> = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let resp = with_retry("list tables", || {
                let mut req = self.dynamodb.list_tables();
                if let Some(s) = &start {
                    req = req.exclusive_start_table_name(s);
                }
                async move { req.send().await.map_err(|e| classify("list tables", e)) }
            })
            .await?;
            names.extend(resp.table_names().iter().cloned());
            match resp.last_evaluated_table_name() {
                Some(next) => start = Some(next.to_string()),
                None => break,
            }
        }
        Ok(json!(names))
    }
}

/// Marker for the next IAM listing page, or `None` at the end. A page that
/// claims truncation but carries no marker counts as the last page.
pub(crate) fn next_marker(truncated: bool, marker: Option<&str>) -> Option<String> {
    match marker {
        Some(m) if truncated => Some(m.to_string()),
        _ => None,
    }
}

// Auth errors abort the sweep; anything else becomes a recorded failure.
fn record(
    report: &mut EnumerationReport,
    loot: &mut LootWriter,
    file: &str,
    result: AttackResult<Value>,
) -> AttackResult<()> {
    match result {
        Ok(value) => {
            let path = loot.write_json(file, &value)?;
            info!(path = %path.display(), "enumeration dump written");
            report.files.push(path);
        }
        Err(e) if e.is_auth() => return Err(e),
        Err(e) => {
            warn!(file, error = %e, "service enumeration failed");
            report.failures.push(format!("{file}: {e}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttackError;

    #[test]
    fn truncated_page_without_marker_ends_the_walk() {
        assert_eq!(next_marker(true, Some("user-42")), Some("user-42".to_string()));
        assert_eq!(next_marker(true, None), None);
        assert_eq!(next_marker(false, Some("stale")), None);
    }

    #[test]
    fn successful_dump_is_written_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut loot = LootWriter::new(dir.path()).unwrap();
        let mut report = EnumerationReport::default();

        record(&mut report, &mut loot, BUCKET_DUMP, Ok(json!(["a", "b"]))).unwrap();

        assert_eq!(report.files.len(), 1);
        assert!(report.is_clean());
        let back: Value =
            serde_json::from_str(&std::fs::read_to_string(&report.files[0]).unwrap()).unwrap();
        assert_eq!(back, json!(["a", "b"]));
    }

    #[test]
    fn service_failure_is_kept_and_sweep_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut loot = LootWriter::new(dir.path()).unwrap();
        let mut report = EnumerationReport::default();

        let err = AttackError::Api {
            action: "list tables",
            code: Some("InternalError".into()),
            message: "boom".into(),
        };
        record(&mut report, &mut loot, TABLE_DUMP, Err(err)).unwrap();

        assert!(report.files.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with(TABLE_DUMP));
    }

    #[test]
    fn auth_failure_aborts_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let mut loot = LootWriter::new(dir.path()).unwrap();
        let mut report = EnumerationReport::default();

        let err = AttackError::Auth {
            action: "list users",
            code: Some("AccessDenied".into()),
            message: "denied".into(),
        };
        let out = record(&mut report, &mut loot, IDENTITY_DUMP, Err(err));
        assert!(out.is_err_and(|e| e.is_auth()));
    }
}
