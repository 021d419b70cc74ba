//! Error taxonomy for the orchestration core

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::ProviderError;
use crate::resource::ResourceKind;
use crate::sequencer::Stage;
use crate::template::TemplateError;

/// Errors raised by the Locator, Factory, Waiter and Renderer
///
/// Every variant is fatal for the stage that raised it.
#[derive(Debug, Error)]
pub enum CoreError {
    /// More than one resource matched a filter; a tagging or configuration bug
    #[error("Ambiguous match for {filter}: {} candidates ({})", candidates.len(), candidates.join(", "))]
    AmbiguousMatch {
        filter: String,
        candidates: Vec<String>,
    },

    /// A lookup call failed
    #[error("Failed to look up {kind}: {cause}")]
    LookupFailed {
        kind: ResourceKind,
        #[source]
        cause: ProviderError,
    },

    /// The provider rejected a mutation
    #[error("Failed to provision {kind} '{name}': {cause}")]
    ProvisioningFailed {
        kind: ResourceKind,
        name: String,
        #[source]
        cause: ProviderError,
    },

    /// A consistency wait ran out of attempts; a later retry may succeed
    #[error("{resource} not ready after {attempts} attempts: {last_error}")]
    DependencyNotReady {
        resource: String,
        attempts: u32,
        last_error: String,
    },

    /// A global-namespace name is taken by someone else
    #[error("Name '{name}' for {kind} is already taken; choose another name")]
    NameConflict {
        kind: ResourceKind,
        name: String,
        #[source]
        cause: ProviderError,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Local private-key file could not be written or would be orphaned
    #[error("Key material at {}: {message}", path.display())]
    KeyMaterial { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Cancelled before stage {0}")]
    Cancelled(Stage),
}

impl CoreError {
    /// Whether re-running the whole deployment later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::DependencyNotReady { .. })
    }
}

/// A failed deployment or teardown, naming the stage that failed
#[derive(Debug, Error)]
#[error("Stage {stage} failed: {cause}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub cause: CoreError,
}

impl StageFailure {
    pub fn new(stage: Stage, cause: CoreError) -> Self {
        Self { stage, cause }
    }
}

/// Helper for `map_err` at a stage boundary
pub(crate) fn at(stage: Stage) -> impl FnOnce(CoreError) -> StageFailure {
    move |cause| StageFailure::new(stage, cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderErrorKind;

    #[test]
    fn ambiguous_match_lists_candidates() {
        let err = CoreError::AmbiguousMatch {
            filter: "vpc[tag:Name=pf1-vpc]".to_string(),
            candidates: vec!["vpc-1".to_string(), "vpc-2".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Ambiguous match for vpc[tag:Name=pf1-vpc]: 2 candidates (vpc-1, vpc-2)"
        );
    }

    #[test]
    fn stage_failure_names_stage() {
        let failure = StageFailure::new(
            Stage::ProfileReady,
            CoreError::DependencyNotReady {
                resource: "instance profile pf1-ec2-s3-profile".to_string(),
                attempts: 15,
                last_error: "role not attached".to_string(),
            },
        );
        assert_eq!(
            failure.to_string(),
            "Stage profile_ready failed: instance profile pf1-ec2-s3-profile not ready after 15 attempts: role not attached"
        );
        assert!(failure.cause.is_retryable());
    }

    #[test]
    fn name_conflict_is_not_retryable() {
        let err = CoreError::NameConflict {
            kind: ResourceKind::Bucket,
            name: "taken".to_string(),
            cause: ProviderError::new("exists").with_kind(ProviderErrorKind::Conflict),
        };
        assert!(!err.is_retryable());
    }
}
