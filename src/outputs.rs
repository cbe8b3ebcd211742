use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::info;

use crate::error::{AttackError, AttackResult};

/// Keys the provisioning step must have exported for the scenario to run.
pub const REQUIRED_KEYS: &[&str] = &[
    "CustomerOrdersTable",
    "CustomerSSNTable",
    "admin_user_arn",
    "config_files_bucket",
    "customer_data_bucket",
    "devops_user_arn",
    "gd_detector_id",
    "payment_data_bucket",
    "regular_buckets",
];

/// Stack output JSON from the provisioning tool, as a validated lookup table.
#[derive(Debug, Clone)]
pub struct InfraOutputs {
    path: PathBuf,
    values: Map<String, Value>,
}

impl InfraOutputs {
    pub fn load(path: &Path) -> AttackResult<Self> {
        if !path.exists() {
            return Err(AttackError::Config(format!(
                "output file '{}' not found, did the infrastructure rollout run?",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
            AttackError::Config(format!("'{}' contains invalid JSON: {e}", path.display()))
        })?;
        let Value::Object(values) = parsed else {
            return Err(AttackError::Config(format!(
                "'{}' is not a JSON object of stack outputs",
                path.display()
            )));
        };
        Ok(Self { path: path.to_path_buf(), values })
    }

    /// Poll for the file to appear, bounded. The rollout writes it at the end.
    pub async fn wait_until_present(path: &Path, timeout: Duration) -> AttackResult<()> {
        let started = std::time::Instant::now();
        loop {
            if path.exists() {
                info!(path = %path.display(), "output file found");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(AttackError::TimedOut {
                    what: format!("output file '{}'", path.display()),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// All required keys present, reported together rather than one at a time.
    pub fn validate(&self) -> AttackResult<()> {
        let missing: Vec<String> = REQUIRED_KEYS
            .iter()
            .filter(|k| !self.values.contains_key(**k))
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AttackError::MissingOutputs(missing));
        }
        info!(path = %self.path.display(), "rollout outputs validated");
        Ok(())
    }

    pub fn get_str(&self, key: &str) -> AttackResult<&str> {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| AttackError::Config(format!("output '{key}' missing or not a string")))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// String-array output; absent or wrongly shaped reads as empty.
    pub fn str_list(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every bucket and table name the rollout claims to own. Used to cap the
    /// locator's blast radius when `restrict_to_rollout` is set.
    pub fn rollout_resource_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for key in [
            "config_files_bucket",
            "customer_data_bucket",
            "payment_data_bucket",
            "CustomerOrdersTable",
            "CustomerSSNTable",
        ] {
            if let Some(v) = self.get_str_opt(key) {
                names.push(v.to_string());
            }
        }
        names.extend(self.str_list("regular_buckets"));
        names
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// Last path segment of an IAM ARN, i.e. the user name.
pub fn user_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_outputs(v: Value) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.json");
        std::fs::write(&path, serde_json::to_string_pretty(&v).unwrap()).unwrap();
        (dir, path)
    }

    fn complete_outputs() -> Value {
        json!({
            "CustomerOrdersTable": "CustomerOrdersTable-7f3a",
            "CustomerSSNTable": "CustomerSSNTable-9b1c",
            "admin_user_arn": "arn:aws:iam::111122223333:user/AdminUser",
            "config_files_bucket": "configuration-files-a1b2",
            "customer_data_bucket": "customer-data-c3d4",
            "devops_user_arn": "arn:aws:iam::111122223333:user/DevopsUser",
            "gd_detector_id": "12abc34d567e8f90",
            "payment_data_bucket": "payment-data-e5f6",
            "regular_buckets": ["company-data-q1-2024-x", "company-data-q2-2024-y"],
        })
    }

    #[test]
    fn valid_outputs_pass() {
        let (_dir, path) = write_outputs(complete_outputs());
        let outputs = InfraOutputs::load(&path).unwrap();
        outputs.validate().unwrap();
        assert_eq!(outputs.get_str("gd_detector_id").unwrap(), "12abc34d567e8f90");
        assert_eq!(outputs.str_list("regular_buckets").len(), 2);
    }

    #[test]
    fn missing_keys_are_reported_together() {
        let mut v = complete_outputs();
        v.as_object_mut().unwrap().remove("gd_detector_id");
        v.as_object_mut().unwrap().remove("regular_buckets");
        let (_dir, path) = write_outputs(v);
        let outputs = InfraOutputs::load(&path).unwrap();
        match outputs.validate() {
            Err(AttackError::MissingOutputs(keys)) => {
                assert_eq!(keys, vec!["gd_detector_id", "regular_buckets"]);
            }
            other => panic!("expected MissingOutputs, got {other:?}"),
        }
    }

    #[test]
    fn absent_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = InfraOutputs::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, AttackError::Config(_)));
    }

    #[test]
    fn non_object_json_is_rejected() {
        let (_dir, path) = write_outputs(json!(["not", "an", "object"]));
        assert!(InfraOutputs::load(&path).is_err());
    }

    #[test]
    fn rollout_names_cover_buckets_and_tables() {
        let (_dir, path) = write_outputs(complete_outputs());
        let outputs = InfraOutputs::load(&path).unwrap();
        let names = outputs.rollout_resource_names();
        assert!(names.contains(&"customer-data-c3d4".to_string()));
        assert!(names.contains(&"CustomerOrdersTable-7f3a".to_string()));
        assert!(names.contains(&"company-data-q2-2024-y".to_string()));
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn arn_to_user_name() {
        assert_eq!(user_from_arn("arn:aws:iam::1:user/DevopsUser"), "DevopsUser");
        assert_eq!(user_from_arn("DevopsUser"), "DevopsUser");
    }

    #[tokio::test]
    async fn wait_times_out_when_file_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let err = InfraOutputs::wait_until_present(
            &dir.path().join("never.json"),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AttackError::TimedOut { .. }));
    }
}
