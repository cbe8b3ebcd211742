use std::time::Duration;

use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use thiserror::Error;

pub type AttackResult<T> = std::result::Result<T, AttackError>;

/// Failure classes for every call the kit makes against the account.
#[derive(Debug, Error)]
pub enum AttackError {
    /// Credentials rejected outright. Fatal; the run aborts.
    #[error("{action}: authentication failure: {message}")]
    Auth {
        action: &'static str,
        code: Option<String>,
        message: String,
    },

    /// Throttling or server-side trouble. Safe to retry with backoff.
    #[error("{action}: transient api failure: {message}")]
    Transient {
        action: &'static str,
        code: Option<String>,
        message: String,
    },

    /// The named resource is gone or never existed. Logged, batch continues.
    #[error("{action}: not found: {message}")]
    NotFound {
        action: &'static str,
        code: Option<String>,
        message: String,
    },

    /// Any other service-side rejection.
    #[error("{action}: api failure: {message}")]
    Api {
        action: &'static str,
        code: Option<String>,
        message: String,
    },

    /// A phase was invoked out of order. Rejected before any API call.
    #[error("{action} rejected: run is {state}, requires {requires}")]
    Precondition {
        action: &'static str,
        state: String,
        requires: String,
    },

    /// A bounded wait expired before the resource reached the wanted state.
    #[error("timed out after {waited:?} waiting for {what}")]
    TimedOut { what: String, waited: Duration },

    /// Some items in a batch failed; the survivors were still processed.
    #[error("{action}: {failed} of {total} items failed")]
    PartialBatch {
        action: &'static str,
        failed: usize,
        total: usize,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("mfa failure: {0}")]
    Mfa(String),

    #[error("deployment outputs missing keys: {0:?}")]
    MissingOutputs(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("artifact serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AttackError {
    pub fn is_auth(&self) -> bool {
        matches!(self, AttackError::Auth { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AttackError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AttackError::NotFound { .. })
    }

    /// Service error code, if the failure carried one.
    pub fn code(&self) -> Option<&str> {
        match self {
            AttackError::Auth { code, .. }
            | AttackError::Transient { code, .. }
            | AttackError::NotFound { code, .. }
            | AttackError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// Error codes shared across the services we touch. AWS reports the same
// condition under several spellings depending on the service.
const AUTH_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AuthFailure",
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidAccessKeyId",
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "UnauthorizedOperation",
    "UnrecognizedClientException",
];

const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchBucket",
    "NoSuchEntity",
    "NoSuchKey",
    "NotFoundException",
    "ResourceNotFoundException",
    "TableNotFoundException",
    "TrailNotFoundException",
];

const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "RequestTimeout",
    "ServiceUnavailable",
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
];

/// Classify an SDK failure into the taxonomy above.
pub fn classify<E, R>(action: &'static str, err: SdkError<E, R>) -> AttackError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err.code().map(str::to_string);
    let message = match err.message() {
        Some(m) => m.to_string(),
        None => format!("{}", DisplayErrorContext(&err)),
    };

    // Transport-level trouble has no service code but is worth retrying.
    if matches!(&err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)) {
        return AttackError::Transient { action, code, message };
    }

    match code.as_deref() {
        Some(c) if AUTH_CODES.contains(&c) => AttackError::Auth { action, code, message },
        Some(c) if NOT_FOUND_CODES.contains(&c) => AttackError::NotFound { action, code, message },
        Some(c) if TRANSIENT_CODES.contains(&c) => AttackError::Transient { action, code, message },
        _ => AttackError::Api { action, code, message },
    }
}

const RETRIES: usize = 3;
const BACKOFF_MS: u64 = 300;

/// Re-issue a call up to RETRIES times on transient failures, linear backoff.
/// Non-transient errors return immediately.
pub async fn with_retry<T, F, Fut>(action: &'static str, mut call: F) -> AttackResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AttackResult<T>>,
{
    let mut last = None;
    for attempt in 1..=RETRIES {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                tracing::warn!(action, attempt, error = %e, "transient failure, backing off");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
        if attempt < RETRIES {
            tokio::time::sleep(Duration::from_millis(BACKOFF_MS * attempt as u64)).await;
        }
    }
    Err(last.unwrap_or_else(|| AttackError::Transient {
        action,
        code: None,
        message: "retries exhausted".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_smithy_types::error::ErrorMetadata;

    #[derive(Debug)]
    struct FakeApiError {
        meta: ErrorMetadata,
    }

    impl std::fmt::Display for FakeApiError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.meta.code().unwrap_or("?"))
        }
    }

    impl std::error::Error for FakeApiError {}

    impl ProvideErrorMetadata for FakeApiError {
        fn meta(&self) -> &ErrorMetadata {
            &self.meta
        }
    }

    fn service_err(code: &str) -> SdkError<FakeApiError, ()> {
        let meta = ErrorMetadata::builder().code(code).message("boom").build();
        SdkError::service_error(FakeApiError { meta }, ())
    }

    #[test]
    fn access_denied_is_auth() {
        assert!(classify("list buckets", service_err("AccessDenied")).is_auth());
        assert!(classify("sts", service_err("InvalidClientTokenId")).is_auth());
    }

    #[test]
    fn throttling_is_transient() {
        assert!(classify("scan", service_err("ThrottlingException")).is_transient());
        assert!(classify("scan", service_err("SlowDown")).is_transient());
    }

    #[test]
    fn missing_table_is_not_found() {
        let e = classify("describe table", service_err("ResourceNotFoundException"));
        assert!(e.is_not_found());
        assert_eq!(e.code(), Some("ResourceNotFoundException"));
    }

    #[test]
    fn unknown_code_is_plain_api_failure() {
        let e = classify("create user", service_err("EntityAlreadyExists"));
        assert!(!e.is_auth() && !e.is_transient() && !e.is_not_found());
        assert_eq!(e.code(), Some("EntityAlreadyExists"));
    }

    #[tokio::test]
    async fn retry_gives_up_after_three_attempts() {
        let mut calls = 0u32;
        let res: AttackResult<()> = with_retry("always throttled", || {
            calls += 1;
            async {
                Err(AttackError::Transient {
                    action: "always throttled",
                    code: Some("Throttling".into()),
                    message: "slow down".into(),
                })
            }
        })
        .await;
        assert!(res.unwrap_err().is_transient());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_stops_on_fatal() {
        let mut calls = 0u32;
        let res: AttackResult<()> = with_retry("denied", || {
            calls += 1;
            async {
                Err(AttackError::Auth {
                    action: "denied",
                    code: Some("AccessDenied".into()),
                    message: "no".into(),
                })
            }
        })
        .await;
        assert!(res.unwrap_err().is_auth());
        assert_eq!(calls, 1);
    }
}
