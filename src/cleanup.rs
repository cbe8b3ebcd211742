use std::path::{Path, PathBuf};

use aws_sdk_iam as iam;
use aws_sdk_iam::types::AssignmentStatusType;
use tracing::{debug, info, warn};

use crate::config::ScenarioConfig;
use crate::enumerate::next_marker;
use crate::error::classify;
use crate::session::CloudSession;

/// Reverses the attack's account changes and removes local artifacts.
/// Every step is best-effort and logged; the report records what actually
/// happened so the operator can finish by hand if needed.
pub struct Cleaner {
    iam: iam::Client,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub users_deleted: Vec<String>,
    pub devices_purged: usize,
    pub dirs_removed: Vec<PathBuf>,
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, what: String) {
        self.failures.push(what);
    }
}

impl Cleaner {
    pub fn new(session: &CloudSession) -> Self {
        Self {
            iam: iam::Client::new(session.config()),
        }
    }

    /// Delete attack-created users (plus the devops user when known), purge
    /// leftover virtual MFA devices, then remove the local artifact
    /// directories.
    pub async fn run(&self, cfg: &ScenarioConfig, devops_user: Option<&str>) -> CleanupReport {
        let mut report = CleanupReport::default();

        let mut targets = self.attack_users(&cfg.attack_user_prefix, &mut report).await;
        if let Some(devops) = devops_user {
            if !targets.iter().any(|u| u == devops) {
                targets.push(devops.to_string());
            }
        }
        for user in &targets {
            self.delete_user_completely(user, &mut report).await;
        }

        self.purge_unassigned_devices(&cfg.mfa_device_name, &mut report)
            .await;

        for dir in [&cfg.bucket_loot_dir, &cfg.table_loot_dir, &cfg.enumeration_dir] {
            remove_artifact_dir(dir, &mut report);
        }
        report
    }

    async fn attack_users(&self, prefix: &str, report: &mut CleanupReport) -> Vec<String> {
        let mut found = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut req = self.iam.list_users();
            if let Some(m) = &marker {
                req = req.marker(m);
            }
            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %classify("list users", e), "user listing failed");
                    report.fail("list users".into());
                    break;
                }
            };
            found.extend(
                resp.users()
                    .iter()
                    .filter(|u| u.user_name().starts_with(prefix))
                    .map(|u| u.user_name().to_string()),
            );
            match next_marker(resp.is_truncated(), resp.marker()) {
                Some(m) => marker = Some(m),
                None => break,
            }
        }
        found
    }

    // IAM refuses to delete a user that still owns devices, keys, policies,
    // a console profile or group memberships, so strip those first.
    async fn delete_user_completely(&self, user: &str, report: &mut CleanupReport) {
        match self.iam.list_mfa_devices().user_name(user).send().await {
            Ok(resp) => {
                for device in resp.mfa_devices() {
                    let serial = device.serial_number();
                    if let Err(e) = self
                        .iam
                        .deactivate_mfa_device()
                        .user_name(user)
                        .serial_number(serial)
                        .send()
                        .await
                    {
                        warn!(user, serial, error = %classify("deactivate mfa device", e), "device not deactivated");
                    }
                    match self
                        .iam
                        .delete_virtual_mfa_device()
                        .serial_number(serial)
                        .send()
                        .await
                    {
                        Ok(_) => report.devices_purged += 1,
                        Err(e) => {
                            warn!(user, serial, error = %classify("delete mfa device", e), "device not deleted")
                        }
                    }
                }
            }
            Err(e) => {
                let err = classify("list mfa devices", e);
                if err.is_not_found() {
                    info!(user, "user already absent");
                    return;
                }
                warn!(user, error = %err, "mfa devices not listed");
            }
        }

        match self.iam.list_access_keys().user_name(user).send().await {
            Ok(resp) => {
                for meta in resp.access_key_metadata() {
                    let Some(key_id) = meta.access_key_id() else { continue };
                    if let Err(e) = self
                        .iam
                        .delete_access_key()
                        .user_name(user)
                        .access_key_id(key_id)
                        .send()
                        .await
                    {
                        warn!(user, key_id, error = %classify("delete access key", e), "access key not deleted");
                    }
                }
            }
            Err(e) => {
                warn!(user, error = %classify("list access keys", e), "access keys not listed")
            }
        }

        match self.iam.delete_login_profile().user_name(user).send().await {
            Ok(_) => info!(user, "login profile deleted"),
            Err(e) => {
                let err = classify("delete login profile", e);
                if !err.is_not_found() {
                    warn!(user, error = %err, "login profile not deleted");
                }
            }
        }

        match self
            .iam
            .list_attached_user_policies()
            .user_name(user)
            .send()
            .await
        {
            Ok(resp) => {
                for policy in resp.attached_policies() {
                    let Some(arn) = policy.policy_arn() else { continue };
                    if let Err(e) = self
                        .iam
                        .detach_user_policy()
                        .user_name(user)
                        .policy_arn(arn)
                        .send()
                        .await
                    {
                        warn!(user, policy = arn, error = %classify("detach user policy", e), "policy not detached");
                    }
                }
            }
            Err(e) => {
                warn!(user, error = %classify("list attached user policies", e), "attached policies not listed")
            }
        }

        match self.iam.list_user_policies().user_name(user).send().await {
            Ok(resp) => {
                for name in resp.policy_names() {
                    if let Err(e) = self
                        .iam
                        .delete_user_policy()
                        .user_name(user)
                        .policy_name(name.as_str())
                        .send()
                        .await
                    {
                        warn!(user, policy = %name, error = %classify("delete user policy", e), "inline policy not deleted");
                    }
                }
            }
            Err(e) => {
                warn!(user, error = %classify("list user policies", e), "inline policies not listed")
            }
        }

        match self.iam.list_groups_for_user().user_name(user).send().await {
            Ok(resp) => {
                for group in resp.groups() {
                    let name = group.group_name();
                    if let Err(e) = self
                        .iam
                        .remove_user_from_group()
                        .user_name(user)
                        .group_name(name)
                        .send()
                        .await
                    {
                        warn!(user, group = name, error = %classify("remove user from group", e), "group membership kept");
                    }
                }
            }
            Err(e) => warn!(user, error = %classify("list groups for user", e), "groups not listed"),
        }

        match self.iam.delete_user().user_name(user).send().await {
            Ok(_) => {
                info!(user, "user deleted");
                report.users_deleted.push(user.to_string());
            }
            Err(e) => {
                warn!(user, error = %classify("delete user", e), "user not deleted");
                report.fail(format!("delete user {user}"));
            }
        }
    }

    async fn purge_unassigned_devices(&self, device_name: &str, report: &mut CleanupReport) {
        let resp = match self
            .iam
            .list_virtual_mfa_devices()
            .assignment_status(AssignmentStatusType::Unassigned)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %classify("list virtual mfa devices", e), "virtual device listing failed");
                report.fail("list virtual mfa devices".into());
                return;
            }
        };
        let suffix = format!("mfa/{device_name}");
        for device in resp.virtual_mfa_devices() {
            let serial = device.serial_number();
            if !serial.ends_with(&suffix) {
                continue;
            }
            match self
                .iam
                .delete_virtual_mfa_device()
                .serial_number(serial)
                .send()
                .await
            {
                Ok(_) => {
                    info!(serial, "unassigned MFA device deleted");
                    report.devices_purged += 1;
                }
                Err(e) => {
                    warn!(serial, error = %classify("delete mfa device", e), "device not deleted")
                }
            }
        }
    }
}

fn remove_artifact_dir(dir: &Path, report: &mut CleanupReport) {
    if !dir.exists() {
        debug!(dir = %dir.display(), "artifact directory already absent");
        return;
    }
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            info!(dir = %dir.display(), "artifact directory removed");
            report.dirs_removed.push(dir.to_path_buf());
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "artifact directory not removed");
            report.fail(format!("remove {}", dir.display()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_dir_removal_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let loot = dir.path().join("s3_Exfiltration");
        std::fs::create_dir_all(loot.join("nested")).unwrap();
        std::fs::write(loot.join("nested").join("f.bin"), b"x").unwrap();

        let mut report = CleanupReport::default();
        remove_artifact_dir(&loot, &mut report);

        assert!(!loot.exists());
        assert_eq!(report.dirs_removed, vec![loot]);
        assert!(report.is_clean());
    }

    #[test]
    fn missing_dir_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = CleanupReport::default();
        remove_artifact_dir(&dir.path().join("never_created"), &mut report);
        assert!(report.dirs_removed.is_empty());
        assert!(report.is_clean());
    }
}
