//! Removal of half-built resources
//!
//! Several resources need follow-up calls after the create call returned an
//! ID (VPC attributes, gateway attachment, routes, ingress rules, bucket
//! tags). The create call already tagged the resource, so leaving it behind
//! after a failed follow-up would let the next run locate and reuse it as if
//! it were complete.

use std::future::Future;

use log::{info, warn};
use sandbox_core::provider::ProviderResult;

/// Pass `result` through; on error run `undo` first and return the original error
///
/// When `undo` fails as well, the error message names the resource left behind.
pub(crate) async fn undo_on_error<T, F, Fut>(
    what: &str,
    result: ProviderResult<T>,
    undo: F,
) -> ProviderResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ProviderResult<()>>,
{
    let mut err = match result {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    match undo().await {
        Ok(()) => info!("Removed incomplete {} after: {}", what, err),
        Err(undo_err) => {
            warn!("Could not remove incomplete {}: {}", what, undo_err);
            err.message = format!("{} (incomplete {} left in place: {})", err.message, what, undo_err);
        }
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::provider::{ProviderError, ProviderErrorKind};
    use std::cell::Cell;

    #[tokio::test]
    async fn success_skips_undo() {
        let undone = Cell::new(false);
        let flag = &undone;

        let result = undo_on_error("VPC vpc-1", Ok("vpc-1"), || async move {
            flag.set(true);
            Ok(())
        })
        .await;

        assert_eq!(result.unwrap(), "vpc-1");
        assert!(!undone.get());
    }

    #[tokio::test]
    async fn failed_follow_up_removes_resource() {
        let undone = Cell::new(0);
        let count = &undone;

        let result: ProviderResult<()> = undo_on_error(
            "internet gateway igw-1",
            Err(ProviderError::new("attach failed").with_kind(ProviderErrorKind::NotReady)),
            || async move {
                count.set(count.get() + 1);
                Ok(())
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(undone.get(), 1);
        assert_eq!(err.message, "attach failed");
        assert_eq!(err.kind, ProviderErrorKind::NotReady);
    }

    #[tokio::test]
    async fn failed_undo_keeps_original_error() {
        let result: ProviderResult<()> = undo_on_error(
            "security group sg-1",
            Err(ProviderError::new("authorize failed").with_code("InvalidPermission.Malformed")),
            || async { Err(ProviderError::new("DependencyViolation")) },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("InvalidPermission.Malformed"));
        assert!(err.message.starts_with("authorize failed"));
        assert!(err.message.contains("incomplete security group sg-1 left in place"));
    }
}
