//! Classification of AWS error codes into provider error kinds

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use sandbox_core::provider::{ProviderError, ProviderErrorKind};

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "SlowDown",
];

const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchEntity",
    "NoSuchBucket",
    "NoSuchKey",
    "NoSuchTagSet",
    "NotFound",
    "NatGatewayNotFound",
];

const CONFLICT_CODES: &[&str] = &[
    "BucketAlreadyExists",
    "EntityAlreadyExists",
    "InvalidGroup.Duplicate",
    "InvalidKeyPair.Duplicate",
];

/// The dependency exists but is not usable yet, or still holds dependents
const NOT_READY_CODES: &[&str] = &[
    "DependencyViolation",
    "DeleteConflict",
    "IncorrectInstanceState",
    "IncorrectState",
    "BucketNotEmpty",
    "InvalidIPAddress.InUse",
];

/// Map an AWS error code (and message) to a provider error kind
pub fn classify(code: Option<&str>, message: Option<&str>) -> ProviderErrorKind {
    let message = message.unwrap_or_default();
    match code {
        Some(c) if THROTTLING_CODES.contains(&c) => ProviderErrorKind::Throttled,
        Some(c) if NOT_FOUND_CODES.contains(&c) || c.ends_with(".NotFound") => {
            ProviderErrorKind::NotFound
        }
        Some(c) if CONFLICT_CODES.contains(&c) => ProviderErrorKind::Conflict,
        Some(c) if NOT_READY_CODES.contains(&c) => ProviderErrorKind::NotReady,
        // EC2 does not see a freshly created instance profile yet
        Some("InvalidParameterValue") if message.contains("iamInstanceProfile") => {
            ProviderErrorKind::NotReady
        }
        Some(_) if message.contains("Invalid IAM Instance Profile") => ProviderErrorKind::NotReady,
        _ => ProviderErrorKind::Other,
    }
}

/// Convert an SDK error into a classified `ProviderError`
pub(crate) fn sdk_error<E, R>(context: &str, err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let kind = classify(err.code(), err.message());
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    let error = ProviderError::new(message).with_kind(kind);
    let error = match err.code() {
        Some(code) => error.with_code(code),
        None => error,
    };
    error.with_cause(err)
}

/// Error for a response that lacked a field the request guarantees
pub(crate) fn missing(what: &str) -> ProviderError {
    ProviderError::new(format!("AWS response did not include {}", what))
}
