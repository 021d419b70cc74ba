//! Teardown - Locate a deployment's resources and delete them in reverse order
//!
//! Teardown is explicit and never runs as part of `deploy`. Resources that
//! cannot be found are skipped, so running it twice is harmless.

use std::path::PathBuf;

use log::{info, warn};

use crate::blueprint::Blueprint;
use crate::config::DeployConfig;
use crate::error::{CoreError, StageFailure, at};
use crate::locator::Locator;
use crate::provider::{CloudProvider, ProviderErrorKind};
use crate::resource::{FoundResource, NAME_TAG, ResourceFilter, ResourceId, ResourceKind, attr};
use crate::sequencer::{CancelFlag, Stage, wait_failed};
use crate::waiter::{Probe, RetryPolicy, Waiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownOptions {
    /// The bucket holds data and is only deleted on request
    pub delete_bucket: bool,
    pub remove_key_file: bool,
}

impl Default for TeardownOptions {
    fn default() -> Self {
        Self {
            delete_bucket: false,
            remove_key_file: true,
        }
    }
}

/// One located resource scheduled for deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDeletion {
    pub stage: Stage,
    pub id: ResourceId,
    pub resource: FoundResource,
}

/// Located resources in deletion order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TeardownPlan {
    pub deletions: Vec<PlannedDeletion>,
    /// Local private-key file, when present and scheduled for removal
    pub key_file: Option<PathBuf>,
}

impl TeardownPlan {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.key_file.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TeardownReport {
    pub deleted: Vec<ResourceId>,
    pub removed_key_file: Option<PathBuf>,
}

pub struct Teardown<'a> {
    provider: &'a dyn CloudProvider,
    waiter: Waiter,
    cancel: CancelFlag,
    policy: RetryPolicy,
}

impl<'a> Teardown<'a> {
    pub fn new(provider: &'a dyn CloudProvider) -> Self {
        Self {
            provider,
            waiter: Waiter::tokio(),
            cancel: CancelFlag::new(),
            policy: RetryPolicy::teardown(),
        }
    }

    pub fn with_waiter(mut self, waiter: Waiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Policy for instance shutdown and dependency-violation retries
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Locate and delete everything in one go
    pub async fn destroy(
        &self,
        config: &DeployConfig,
        options: TeardownOptions,
    ) -> Result<TeardownReport, StageFailure> {
        let plan = self.plan(config, options).await?;
        self.execute(&plan).await
    }

    /// Locate every resource of the deployment, in deletion order
    pub async fn plan(
        &self,
        config: &DeployConfig,
        options: TeardownOptions,
    ) -> Result<TeardownPlan, StageFailure> {
        let blueprint = Blueprint::new(config);
        let names = blueprint.names();
        let locator = Locator::new(self.provider, &self.waiter);
        let mut plan = TeardownPlan::default();

        let mut add = |stage: Stage, kind: ResourceKind, name: &str, found: Option<FoundResource>| {
            if let Some(resource) = found {
                plan.deletions.push(PlannedDeletion {
                    stage,
                    id: ResourceId::new(kind, name),
                    resource,
                });
            }
        };

        let instance_filter =
            ResourceFilter::new(ResourceKind::Instance).with_tag(NAME_TAG, &names.instance);
        let instance = locator
            .locate(&instance_filter)
            .await
            .map_err(at(Stage::ComputeInstance))?;
        add(Stage::ComputeInstance, ResourceKind::Instance, &names.instance, instance);

        for spec in [blueprint.instance_profile(), blueprint.role()] {
            let found = locator
                .locate(&spec.filter())
                .await
                .map_err(at(Stage::IamRoleAndProfile))?;
            add(Stage::IamRoleAndProfile, spec.kind(), spec.logical_name(), found);
        }

        let vpc_spec = blueprint.vpc();
        let vpc = locator
            .locate(&vpc_spec.filter())
            .await
            .map_err(at(Stage::Network))?;
        let vpc_id = vpc.as_ref().map(|v| v.id.clone());

        if let Some(ref vpc_id) = vpc_id {
            let sg = blueprint.security_group(vpc_id);
            let found = locator
                .locate(&sg.filter())
                .await
                .map_err(at(Stage::SecurityGroup))?;
            add(Stage::SecurityGroup, sg.kind(), sg.logical_name(), found);
        }

        let key_pair = blueprint.key_pair();
        let found = locator
            .locate(&key_pair.filter())
            .await
            .map_err(at(Stage::KeyMaterial))?;
        let owns_key_file = found.is_some();
        add(Stage::KeyMaterial, key_pair.kind(), key_pair.logical_name(), found);

        // Only the name and VPC identify these, so filters are built directly.
        // The NAT gateway's address must be released before the internet
        // gateway can be detached.
        let mut routing = Vec::new();
        if let Some(ref vpc_id) = vpc_id {
            for name in [&names.private_route_table, &names.route_table] {
                routing.push((
                    Stage::Routing,
                    ResourceKind::RouteTable,
                    name,
                    ResourceFilter::new(ResourceKind::RouteTable)
                        .with_tag(NAME_TAG, name)
                        .in_vpc(vpc_id),
                ));
            }
            routing.push((
                Stage::NatGateway,
                ResourceKind::NatGateway,
                &names.nat_gateway,
                ResourceFilter::new(ResourceKind::NatGateway)
                    .with_tag(NAME_TAG, &names.nat_gateway)
                    .in_vpc(vpc_id),
            ));
        }
        routing.push((
            Stage::NatGateway,
            ResourceKind::ElasticIp,
            &names.elastic_ip,
            ResourceFilter::new(ResourceKind::ElasticIp).with_tag(NAME_TAG, &names.elastic_ip),
        ));
        routing.push((
            Stage::Routing,
            ResourceKind::InternetGateway,
            &names.internet_gateway,
            ResourceFilter::new(ResourceKind::InternetGateway)
                .with_tag(NAME_TAG, &names.internet_gateway),
        ));
        for (stage, kind, name, filter) in routing {
            let found = locator.locate(&filter).await.map_err(at(stage))?;
            add(stage, kind, name, found);
        }

        if let Some(ref vpc_id) = vpc_id {
            // The private subnet may exist from an earlier run even when disabled now
            for name in [&names.public_subnet, &names.private_subnet] {
                let filter = ResourceFilter::new(ResourceKind::Subnet)
                    .with_tag(NAME_TAG, name)
                    .in_vpc(vpc_id);
                let found = locator.locate(&filter).await.map_err(at(Stage::Network))?;
                add(Stage::Network, ResourceKind::Subnet, name, found);
            }
        }
        add(Stage::Network, ResourceKind::Vpc, vpc_spec.logical_name(), vpc);

        if options.delete_bucket {
            let bucket = blueprint.bucket();
            let found = locator
                .locate(&bucket.filter())
                .await
                .map_err(at(Stage::Storage))?;
            add(Stage::Storage, bucket.kind(), bucket.logical_name(), found);
        }

        // A key file without its key pair was not written by this deployment
        let key_path = config.key_path();
        if options.remove_key_file && owns_key_file && key_path.exists() {
            plan.key_file = Some(key_path);
        }

        Ok(plan)
    }

    /// Delete the planned resources in order; the first failure stops the run
    pub async fn execute(&self, plan: &TeardownPlan) -> Result<TeardownReport, StageFailure> {
        let mut report = TeardownReport::default();

        for deletion in &plan.deletions {
            if self.cancel.is_cancelled() {
                return Err(StageFailure::new(
                    deletion.stage,
                    CoreError::Cancelled(deletion.stage),
                ));
            }

            if deletion.id.kind == ResourceKind::Instance {
                self.terminate(&deletion.resource)
                    .await
                    .map_err(at(deletion.stage))?;
            } else {
                self.delete(deletion.id.kind, &deletion.resource)
                    .await
                    .map_err(at(deletion.stage))?;
            }
            info!("Deleted {}: {}", deletion.id, deletion.resource.id);
            report.deleted.push(deletion.id.clone());
        }

        if let Some(ref key_file) = plan.key_file {
            match std::fs::remove_file(key_file) {
                Ok(()) => {
                    info!("Removed {}", key_file.display());
                    report.removed_key_file = Some(key_file.clone());
                }
                Err(e) => warn!("Could not remove {}: {}", key_file.display(), e),
            }
        }

        Ok(report)
    }

    /// Drop the profile association, terminate, and wait until the instance is gone
    async fn terminate(&self, instance: &FoundResource) -> Result<(), CoreError> {
        let provider = self.provider;
        let instance_id: &str = &instance.id;

        if instance.attribute(attr::IAM_PROFILE).is_some()
            && let Err(e) = provider.disassociate_profile(instance_id).await
        {
            warn!("Could not disassociate profile from {}: {}", instance_id, e);
        }

        self.delete(ResourceKind::Instance, instance).await?;

        let filter = ResourceFilter::new(ResourceKind::Instance)
            .with_tag(NAME_TAG, instance.tag(NAME_TAG).unwrap_or_default());
        let filter = &filter;
        self.waiter
            .wait_until(
                &format!("termination of {}", instance_id),
                &self.policy,
                move |_| async move {
                    provider.find_resources(filter).await.map(|found| {
                        if found.iter().any(|r| r.id == instance_id) {
                            Probe::Pending(format!("{} still shutting down", instance_id))
                        } else {
                            Probe::Ready(())
                        }
                    })
                },
            )
            .await
            .map_err(|e| wait_failed(e, ResourceKind::Instance, instance_id))
    }

    /// Delete one resource, retrying while dependents are still being released
    async fn delete(&self, kind: ResourceKind, resource: &FoundResource) -> Result<(), CoreError> {
        let provider = self.provider;
        self.waiter
            .wait_until(
                &format!("deletion of {} {}", kind, resource.id),
                &self.policy,
                move |_| async move {
                    match provider.delete_resource(kind, resource).await {
                        Ok(()) => Ok(Probe::Ready(())),
                        Err(e) if e.kind == ProviderErrorKind::NotFound => Ok(Probe::Ready(())),
                        Err(e) => Err(e),
                    }
                },
            )
            .await
            .map_err(|e| wait_failed(e, kind, &resource.id))
    }
}
