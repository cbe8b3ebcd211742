use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AttackError, AttackResult};

pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Everything tunable about a scenario run. Defaults reproduce the demo
/// account's naming convention; a YAML file and a handful of env vars
/// override them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    pub region: String,
    /// Stack output JSON written by the provisioning step.
    pub outputs_file: PathBuf,

    /// Bucket names must start with one of these to become targets.
    pub bucket_prefixes: Vec<String>,
    /// Table names must start with one of these to become targets.
    pub table_prefixes: Vec<String>,
    /// Opt into the looser lowercase comparison.
    pub case_insensitive: bool,
    /// When set, prefix matches are additionally intersected with the
    /// resource names recorded in the outputs file.
    pub restrict_to_rollout: bool,
    /// Allow the delete phase without a completed exfiltration phase.
    pub force_delete: bool,

    pub bucket_ransom_object: String,
    pub bucket_ransom_message: String,
    pub ransom_table: String,
    pub table_ransom_message: String,

    pub bucket_loot_dir: PathBuf,
    pub table_loot_dir: PathBuf,
    pub enumeration_dir: PathBuf,

    pub devops_user: Option<String>,
    pub mfa_device_name: String,
    pub attack_user_prefix: String,

    /// Narrative pauses between attack phases. Zeroed by --no-delay.
    pub pacing_long_secs: u64,
    pub pacing_short_secs: u64,
    /// Functional waits; not zeroed by --no-delay.
    pub iam_propagation_secs: u64,
    pub mfa_registration_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".into(),
            outputs_file: "Infra/forrester-2025-output.json".into(),
            bucket_prefixes: vec![
                "company-data-q1-2024".into(),
                "company-data-q2-2024".into(),
                "company-data-q3-2024".into(),
                "company-data-q4-2024".into(),
                "configuration-files".into(),
                "customer-data".into(),
                "payment-data".into(),
            ],
            table_prefixes: vec!["CustomerOrdersTable".into(), "CustomerSSNTable".into()],
            case_insensitive: false,
            restrict_to_rollout: false,
            force_delete: false,
            bucket_ransom_object: "too_late.txt".into(),
            bucket_ransom_message: "Your data has been taken. Pay or it's gone forever.".into(),
            ransom_table: "too_late".into(),
            table_ransom_message: "Your database is gone. Pay to get it back.".into(),
            bucket_loot_dir: "s3_Exfiltration".into(),
            table_loot_dir: "DynamoDB_Exfiltration".into(),
            enumeration_dir: "AWS_Enumeration".into(),
            devops_user: None,
            mfa_device_name: "DevopsUserMFA".into(),
            attack_user_prefix: "run_while_u_can".into(),
            pacing_long_secs: 30,
            pacing_short_secs: 15,
            iam_propagation_secs: 5,
            mfa_registration_secs: 10,
            poll_interval_secs: 2,
            poll_timeout_secs: 120,
        }
    }
}

impl ScenarioConfig {
    /// Load from a YAML file if one is given, otherwise defaults, then apply
    /// env overrides.
    pub fn load(path: Option<&Path>) -> AttackResult<Self> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    AttackError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                serde_yaml::from_str(&raw)
                    .map_err(|e| AttackError::Config(format!("{}: {e}", p.display())))?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        self.region = env_or("NIGHTMARE_REGION", &self.region);
        if let Ok(v) = std::env::var("NIGHTMARE_OUTPUTS") {
            self.outputs_file = v.into();
        }
        if std::env::var("NIGHTMARE_NO_DELAY").is_ok() {
            self.skip_pacing();
        }
    }

    fn validate(&self) -> AttackResult<()> {
        if self.bucket_ransom_object.is_empty() || self.ransom_table.is_empty() {
            return Err(AttackError::Config(
                "ransom marker names must not be empty".into(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(AttackError::Config("poll_interval_secs must be > 0".into()));
        }
        if self.poll_timeout_secs < self.poll_interval_secs {
            return Err(AttackError::Config(
                "poll_timeout_secs must be >= poll_interval_secs".into(),
            ));
        }
        Ok(())
    }

    /// Zero the narrative pauses (CI runs). Functional waits stay.
    pub fn skip_pacing(&mut self) {
        self.pacing_long_secs = 0;
        self.pacing_short_secs = 0;
    }

    pub fn pacing_long(&self) -> Duration {
        Duration::from_secs(self.pacing_long_secs)
    }

    pub fn pacing_short(&self) -> Duration {
        Duration::from_secs(self.pacing_short_secs)
    }

    pub fn iam_propagation(&self) -> Duration {
        Duration::from_secs(self.iam_propagation_secs)
    }

    pub fn mfa_registration(&self) -> Duration {
        Duration::from_secs(self.mfa_registration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_carry_demo_naming() {
        let cfg = ScenarioConfig::default();
        assert!(cfg.bucket_prefixes.contains(&"customer-data".to_string()));
        assert!(cfg.table_prefixes.contains(&"CustomerSSNTable".to_string()));
        assert_eq!(cfg.ransom_table, "too_late");
        assert_eq!(cfg.bucket_ransom_object, "too_late.txt");
        assert!(!cfg.case_insensitive);
        assert!(!cfg.force_delete);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "region: eu-west-1").unwrap();
        writeln!(f, "ransom_table: pay_up").unwrap();
        writeln!(f, "pacing_long_secs: 0").unwrap();
        drop(f);

        let cfg = ScenarioConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.region, "eu-west-1");
        assert_eq!(cfg.ransom_table, "pay_up");
        assert_eq!(cfg.pacing_long(), Duration::ZERO);
        // untouched fields keep their defaults
        assert_eq!(cfg.bucket_ransom_object, "too_late.txt");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.yaml");
        std::fs::write(&path, "regoin: us-east-2\n").unwrap();
        assert!(ScenarioConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn bad_poll_settings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.yaml");
        std::fs::write(&path, "poll_interval_secs: 0\n").unwrap();
        assert!(ScenarioConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn skip_pacing_keeps_functional_waits() {
        let mut cfg = ScenarioConfig::default();
        cfg.skip_pacing();
        assert_eq!(cfg.pacing_long(), Duration::ZERO);
        assert_eq!(cfg.pacing_short(), Duration::ZERO);
        assert_eq!(cfg.iam_propagation(), Duration::from_secs(5));
    }
}
