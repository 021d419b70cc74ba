//! IAM resources: the instance role, its inline policy and the instance profile

use std::collections::BTreeMap;

use aws_sdk_iam::types::Tag;
use log::debug;
use sandbox_core::provider::{
    CreatedResource, ProviderError, ProviderErrorKind, ProviderResult,
};
use sandbox_core::resource::{
    FoundResource, InstanceProfileSpec, PolicyDocument, ResourceFilter, RoleSpec, Tags, attr,
};

use crate::AwsProvider;
use crate::errors::sdk_error;

fn iam_tags(tags: &Tags) -> ProviderResult<Vec<Tag>> {
    tags.iter()
        .map(|(key, value)| {
            Tag::builder()
                .key(key)
                .value(value)
                .build()
                .map_err(|e| ProviderError::new(format!("Failed to build IAM tag: {}", e)))
        })
        .collect()
}

fn collect_tags(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .map(|t| (t.key().to_string(), t.value().to_string()))
        .collect()
}

/// IAM names are global to the account, so only a name lookup makes sense
fn required_name(filter: &ResourceFilter) -> ProviderResult<&str> {
    filter.name().ok_or_else(|| {
        ProviderError::new(format!("{} lookups need a name criterion", filter.kind))
    })
}

impl AwsProvider {
    /// The role by name, with its inline policy names in [`attr::POLICIES`]
    pub(crate) async fn find_roles(&self, filter: &ResourceFilter) -> ProviderResult<Vec<FoundResource>> {
        let name = required_name(filter)?;
        let result = match self.iam_client.get_role().role_name(name).send().await {
            Ok(result) => result,
            Err(e) => {
                let err = sdk_error("Failed to get IAM role", e);
                if err.kind == ProviderErrorKind::NotFound {
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        };
        let Some(role) = result.role() else {
            return Ok(Vec::new());
        };

        let policies = self
            .iam_client
            .list_role_policies()
            .role_name(name)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to list role policies", e))?;

        let mut found = FoundResource::new(role.role_name())
            .with_attribute(attr::NAME, role.role_name())
            .with_attribute(attr::POLICIES, policies.policy_names().join(","))
            .with_attribute("arn", role.arn());
        found.tags = collect_tags(role.tags());
        Ok(vec![found])
    }

    /// The instance profile by name, with its role names in [`attr::ROLES`]
    pub(crate) async fn find_instance_profiles(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let name = required_name(filter)?;
        let result = match self
            .iam_client
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let err = sdk_error("Failed to get instance profile", e);
                if err.kind == ProviderErrorKind::NotFound {
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        };
        let Some(profile) = result.instance_profile() else {
            return Ok(Vec::new());
        };

        let roles: Vec<&str> = profile.roles().iter().map(|r| r.role_name()).collect();
        let mut found = FoundResource::new(profile.instance_profile_name())
            .with_attribute(attr::NAME, profile.instance_profile_name())
            .with_attribute(attr::ROLES, roles.join(","))
            .with_attribute("arn", profile.arn());
        found.tags = collect_tags(profile.tags());
        Ok(vec![found])
    }

    pub(crate) async fn create_role(&self, spec: &RoleSpec) -> ProviderResult<CreatedResource> {
        self.iam_client
            .create_role()
            .role_name(&spec.name)
            .assume_role_policy_document(spec.trust_policy.to_string())
            .description(&spec.description)
            .set_tags(Some(iam_tags(&spec.tags)?))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create IAM role", e))?;
        Ok(CreatedResource::new(&spec.name))
    }

    pub(crate) async fn create_instance_profile(
        &self,
        spec: &InstanceProfileSpec,
    ) -> ProviderResult<CreatedResource> {
        self.iam_client
            .create_instance_profile()
            .instance_profile_name(&spec.name)
            .set_tags(Some(iam_tags(&spec.tags)?))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create instance profile", e))?;
        Ok(CreatedResource::new(&spec.name))
    }

    pub(crate) async fn put_role_policy(
        &self,
        role_name: &str,
        policy: &PolicyDocument,
    ) -> ProviderResult<()> {
        self.iam_client
            .put_role_policy()
            .role_name(role_name)
            .policy_name(&policy.name)
            .policy_document(policy.document.to_string())
            .send()
            .await
            .map_err(|e| sdk_error("Failed to put role policy", e))?;
        Ok(())
    }

    pub(crate) async fn add_role_to_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ProviderResult<()> {
        self.iam_client
            .add_role_to_instance_profile()
            .instance_profile_name(profile_name)
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to add role to instance profile", e))?;
        Ok(())
    }

    /// Visible through the IAM API and wrapping the role
    pub(crate) async fn instance_profile_ready(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ProviderResult<bool> {
        let filter = ResourceFilter::new(sandbox_core::resource::ResourceKind::InstanceProfile)
            .with_name(profile_name);
        let found = self.find_instance_profiles(&filter).await?;
        Ok(found
            .first()
            .is_some_and(|p| p.list_attribute(attr::ROLES).contains(&role_name)))
    }

    /// Inline policies and profile memberships go first, then the role
    pub(crate) async fn delete_role(&self, role_name: &str) -> ProviderResult<()> {
        let profiles = self
            .iam_client
            .list_instance_profiles_for_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to list instance profiles for role", e))?;
        for profile in profiles.instance_profiles() {
            self.remove_role(profile.instance_profile_name(), role_name)
                .await?;
        }

        let policies = self
            .iam_client
            .list_role_policies()
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to list role policies", e))?;
        for policy_name in policies.policy_names() {
            self.iam_client
                .delete_role_policy()
                .role_name(role_name)
                .policy_name(policy_name)
                .send()
                .await
                .map_err(|e| sdk_error("Failed to delete role policy", e))?;
            debug!("Deleted inline policy {} from {}", policy_name, role_name);
        }

        self.iam_client
            .delete_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to delete IAM role", e))?;
        Ok(())
    }

    pub(crate) async fn delete_instance_profile(&self, resource: &FoundResource) -> ProviderResult<()> {
        for role_name in resource.list_attribute(attr::ROLES) {
            self.remove_role(&resource.id, role_name).await?;
        }

        self.iam_client
            .delete_instance_profile()
            .instance_profile_name(&resource.id)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to delete instance profile", e))?;
        Ok(())
    }

    /// Already-removed memberships are fine
    async fn remove_role(&self, profile_name: &str, role_name: &str) -> ProviderResult<()> {
        match self
            .iam_client
            .remove_role_from_instance_profile()
            .instance_profile_name(profile_name)
            .role_name(role_name)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = sdk_error("Failed to remove role from instance profile", e);
                if err.kind == ProviderErrorKind::NotFound {
                    debug!("Role {} already removed from {}", role_name, profile_name);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}
