//! Provider - Trait abstracting the cloud control plane
//!
//! A CloudProvider exposes the handful of lookup and mutation calls the
//! orchestration core needs. One provider handle is constructed per deployment
//! and passed explicitly into the Sequencer, so tests can substitute a fake.

use std::future::Future;
use std::pin::Pin;

use crate::resource::{FoundResource, PolicyDocument, ResourceFilter, ResourceId, ResourceKind, ResourceSpec, Tags};

/// Classification of a provider failure, derived from the provider's error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The addressed resource does not exist (yet)
    NotFound,
    /// A dependency has been accepted but is not usable yet (eventual consistency)
    NotReady,
    /// Name collision or ownership conflict
    Conflict,
    /// Request rate exceeded
    Throttled,
    Other,
}

/// Error type for CloudProvider operations
#[derive(Debug)]
pub struct ProviderError {
    pub message: String,
    pub kind: ProviderErrorKind,
    /// Provider error code, when one was returned
    pub code: Option<String>,
    pub resource_id: Option<ResourceId>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] ", id)?;
        }
        match self.code {
            Some(ref code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ProviderErrorKind::Other,
            code: None,
            resource_id: None,
            cause: None,
        }
    }

    pub fn with_kind(mut self, kind: ProviderErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_throttled(&self) -> bool {
        self.kind == ProviderErrorKind::Throttled
    }

    /// Errors that a consistency wait may poll through
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::NotReady | ProviderErrorKind::NotFound | ProviderErrorKind::Throttled
        )
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a creation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedResource {
    /// Provider-assigned identifier
    pub id: String,
    /// Private key material, returned only when a key pair is created
    pub key_material: Option<String>,
}

impl CreatedResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key_material: None,
        }
    }

    pub fn with_key_material(mut self, material: impl Into<String>) -> Self {
        self.key_material = Some(material.into());
        self
    }
}

/// Everything an instance launch needs
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    /// Logical name, stored in the `Name` tag
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub key_name: String,
    /// Instance profile passed at launch; `None` when bound later or not at all
    pub instance_profile: Option<String>,
    /// Rendered bootstrap payload, passed through unmodified
    pub user_data: Vec<u8>,
    pub tags: Tags,
}

/// Main provider trait
///
/// All operations are async and involve side effects, except the lookups
/// (`find_resources`, `profile_ready`) which only read.
pub trait CloudProvider: Send + Sync {
    /// Name of this provider (e.g., "aws")
    fn name(&self) -> &'static str;

    /// List every resource matching the filter
    fn find_resources(
        &self,
        filter: &ResourceFilter,
    ) -> BoxFuture<'_, ProviderResult<Vec<FoundResource>>>;

    /// Create a resource from its full spec and return its identifier
    fn create_resource(&self, spec: &ResourceSpec) -> BoxFuture<'_, ProviderResult<CreatedResource>>;

    /// Attach (or overwrite) a named inline policy on a role
    fn attach_policy(
        &self,
        role_name: &str,
        policy: &PolicyDocument,
    ) -> BoxFuture<'_, ProviderResult<()>>;

    /// Wrap a role in an instance profile
    fn bind_role(&self, profile_name: &str, role_name: &str) -> BoxFuture<'_, ProviderResult<()>>;

    /// Whether the profile is visible and wraps the role
    fn profile_ready(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> BoxFuture<'_, ProviderResult<bool>>;

    /// Associate an instance profile with a running instance
    ///
    /// Fails with [`ProviderErrorKind::NotReady`] while the profile is still propagating.
    fn associate_profile(
        &self,
        instance_id: &str,
        profile_name: &str,
    ) -> BoxFuture<'_, ProviderResult<()>>;

    /// Remove any instance profile association from an instance
    fn disassociate_profile(&self, instance_id: &str) -> BoxFuture<'_, ProviderResult<()>>;

    /// Launch one instance and return its ID
    fn launch_instance(&self, request: &LaunchRequest) -> BoxFuture<'_, ProviderResult<String>>;

    /// Delete (or terminate) a previously located resource
    fn delete_resource(
        &self,
        kind: ResourceKind,
        resource: &FoundResource,
    ) -> BoxFuture<'_, ProviderResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display() {
        let err = ProviderError::new("Failed to create VPC")
            .with_code("VpcLimitExceeded")
            .for_resource(ResourceId::new(ResourceKind::Vpc, "pf1-vpc"));
        assert_eq!(
            err.to_string(),
            "[vpc.pf1-vpc] Failed to create VPC (VpcLimitExceeded)"
        );
    }

    #[test]
    fn transient_kinds() {
        assert!(ProviderError::new("x").with_kind(ProviderErrorKind::NotReady).is_transient());
        assert!(ProviderError::new("x").with_kind(ProviderErrorKind::Throttled).is_transient());
        assert!(!ProviderError::new("x").with_kind(ProviderErrorKind::Conflict).is_transient());
        assert!(!ProviderError::new("x").is_transient());
    }
}
