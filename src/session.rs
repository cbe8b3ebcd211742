use std::time::Duration;

use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::Credentials;
use aws_types::region::Region;
use tracing::info;

use crate::error::{classify, with_retry, AttackResult};
use crate::outputs::user_from_arn;

/// The identity STS resolved for a session.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

impl CallerIdentity {
    pub fn user_name(&self) -> &str {
        user_from_arn(&self.arn)
    }
}

/// An SDK config that has been verified against STS before anyone uses it.
/// Components receive this by injection; there is no ambient global client.
pub struct CloudSession {
    conf: SdkConfig,
    identity: CallerIdentity,
}

impl CloudSession {
    /// Ambient credential chain (env vars, profile), verified.
    pub async fn from_env(region: &str) -> AttackResult<Self> {
        let conf = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self::verified(conf).await
    }

    /// Explicit static keys, for the freshly escalated identity. Waits out
    /// IAM propagation before the first call.
    pub async fn from_static_keys(
        region: &str,
        access_key: &str,
        secret_key: &str,
        session_token: Option<String>,
        propagation: Duration,
    ) -> AttackResult<Self> {
        if !propagation.is_zero() {
            info!(secs = propagation.as_secs(), "waiting for IAM propagation");
            tokio::time::sleep(propagation).await;
        }
        let creds = Credentials::new(
            access_key.to_string(),
            secret_key.to_string(),
            session_token,
            None,
            "cloud-nightmare",
        );
        let conf = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(creds)
            .load()
            .await;
        Self::verified(conf).await
    }

    async fn verified(conf: SdkConfig) -> AttackResult<Self> {
        let sts = aws_sdk_sts::Client::new(&conf);
        let resp = with_retry("verify session", || {
            let req = sts.get_caller_identity();
            async move { req.send().await.map_err(|e| classify("verify session", e)) }
        })
        .await?;
        let identity = CallerIdentity {
            account: resp.account().unwrap_or_default().to_string(),
            arn: resp.arn().unwrap_or_default().to_string(),
            user_id: resp.user_id().unwrap_or_default().to_string(),
        };
        info!(arn = %identity.arn, account = %identity.account, "confirmed AWS identity");
        Ok(Self { conf, identity })
    }

    pub fn config(&self) -> &SdkConfig {
        &self.conf
    }

    pub fn identity(&self) -> &CallerIdentity {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_exposes_user_name() {
        let id = CallerIdentity {
            account: "111122223333".into(),
            arn: "arn:aws:iam::111122223333:user/DevopsUser".into(),
            user_id: "AIDAEXAMPLE".into(),
        };
        assert_eq!(id.user_name(), "DevopsUser");
    }
}
