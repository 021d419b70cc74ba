//! Sequencer - Dependency-ordered provisioning of one sandbox deployment
//!
//! Stages run strictly in order on a single task. A stage only starts when all
//! earlier stages succeeded; the first failure stops the run and is reported
//! together with the stage that raised it. Nothing is rolled back: re-running
//! picks up every resource that already exists.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use serde::Serialize;

use crate::blueprint::Blueprint;
use crate::config::{DeployConfig, ProfileBinding};
use crate::error::{CoreError, StageFailure, at};
use crate::factory::{Ensured, ResourceFactory};
use crate::provider::{CloudProvider, ProviderError, ProviderErrorKind};
use crate::resource::{NAME_TAG, ResourceFilter, ResourceId, ResourceKind, attr};
use crate::template::{self, DEFAULT_BOOTSTRAP};
use crate::waiter::{Probe, RetryPolicy, WaitError, Waiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Network,
    Routing,
    NatGateway,
    SecurityGroup,
    KeyMaterial,
    Storage,
    IamRoleAndProfile,
    ProfileReady,
    BootstrapRender,
    ComputeInstance,
    ProfileAssociation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Network => "network",
            Stage::Routing => "routing",
            Stage::NatGateway => "nat_gateway",
            Stage::SecurityGroup => "security_group",
            Stage::KeyMaterial => "key_material",
            Stage::Storage => "storage",
            Stage::IamRoleAndProfile => "iam_role_and_profile",
            Stage::ProfileReady => "profile_ready",
            Stage::BootstrapRender => "bootstrap_render",
            Stage::ComputeInstance => "compute_instance",
            Stage::ProfileAssociation => "profile_association",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative cancellation, checked at every stage boundary
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Identifiers of every resource in a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentResult {
    pub region: String,
    pub vpc_id: String,
    pub public_subnet_id: String,
    pub private_subnet_id: Option<String>,
    pub internet_gateway_id: String,
    pub route_table_id: String,
    pub elastic_ip_allocation_id: Option<String>,
    pub nat_gateway_id: Option<String>,
    pub private_route_table_id: Option<String>,
    pub security_group_id: String,
    pub key_name: String,
    pub bucket_name: String,
    pub role_name: Option<String>,
    pub instance_profile_name: Option<String>,
    pub instance_id: String,
    /// Resources created by this run, in creation order
    pub created: Vec<ResourceId>,
}

impl DeploymentResult {
    /// VPC, public subnet, security group, key pair, bucket and instance
    pub fn primary_identifiers(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("vpc", self.vpc_id.as_str()),
            ("public_subnet", self.public_subnet_id.as_str()),
            ("security_group", self.security_group_id.as_str()),
            ("key_pair", self.key_name.as_str()),
            ("bucket", self.bucket_name.as_str()),
            ("instance", self.instance_id.as_str()),
        ]
    }

    /// Every identifier, optional ones included when present
    pub fn identifiers(&self) -> Vec<(&'static str, &str)> {
        let mut ids = vec![
            ("vpc", self.vpc_id.as_str()),
            ("public_subnet", self.public_subnet_id.as_str()),
        ];
        if let Some(ref id) = self.private_subnet_id {
            ids.push(("private_subnet", id.as_str()));
        }
        ids.push(("internet_gateway", self.internet_gateway_id.as_str()));
        ids.push(("route_table", self.route_table_id.as_str()));
        for (label, id) in [
            ("elastic_ip", &self.elastic_ip_allocation_id),
            ("nat_gateway", &self.nat_gateway_id),
            ("private_route_table", &self.private_route_table_id),
        ] {
            if let Some(id) = id {
                ids.push((label, id.as_str()));
            }
        }
        ids.push(("security_group", self.security_group_id.as_str()));
        ids.push(("key_pair", self.key_name.as_str()));
        ids.push(("bucket", self.bucket_name.as_str()));
        if let Some(ref role) = self.role_name {
            ids.push(("iam_role", role.as_str()));
        }
        if let Some(ref profile) = self.instance_profile_name {
            ids.push(("instance_profile", profile.as_str()));
        }
        ids.push(("instance", self.instance_id.as_str()));
        ids
    }
}

struct Network {
    vpc_id: String,
    public_subnet_id: String,
    private_subnet_id: Option<String>,
}

struct Routing {
    internet_gateway_id: String,
    route_table_id: String,
}

struct Nat {
    allocation_id: String,
    nat_gateway_id: String,
    route_table_id: String,
}

struct Iam {
    role_name: String,
    profile_name: String,
}

const NAT_AVAILABLE: &str = "available";

/// Runs the provisioning stages against one provider handle
pub struct Sequencer<'a> {
    provider: &'a dyn CloudProvider,
    waiter: Waiter,
    cancel: CancelFlag,
    template: String,
    nat_wait: RetryPolicy,
}

impl<'a> Sequencer<'a> {
    pub fn new(provider: &'a dyn CloudProvider) -> Self {
        Self {
            provider,
            waiter: Waiter::tokio(),
            cancel: CancelFlag::new(),
            template: DEFAULT_BOOTSTRAP.to_string(),
            nat_wait: RetryPolicy::nat_gateway(),
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

    /// Policy for waiting on a new NAT gateway
    pub fn with_nat_wait(mut self, policy: RetryPolicy) -> Self {
        self.nat_wait = policy;
        self
    }

    /// Replace the bundled bootstrap script
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    fn enter(&self, stage: Stage) -> Result<(), StageFailure> {
        if self.cancel.is_cancelled() {
            return Err(StageFailure::new(stage, CoreError::Cancelled(stage)));
        }
        info!("Stage {}", stage);
        Ok(())
    }

    /// Provision (or find) every resource of the deployment
    pub async fn deploy(&self, config: &DeployConfig) -> Result<DeploymentResult, StageFailure> {
        self.enter(Stage::Validate)?;
        config
            .validate()
            .map_err(|e| StageFailure::new(Stage::Validate, e.into()))?;

        let blueprint = Blueprint::new(config);
        let mut factory = ResourceFactory::new(self.provider, &self.waiter);

        self.enter(Stage::Network)?;
        let network = self
            .network(&blueprint, &mut factory)
            .await
            .map_err(at(Stage::Network))?;

        self.enter(Stage::Routing)?;
        let routing = self
            .routing(&blueprint, &mut factory, &network)
            .await
            .map_err(at(Stage::Routing))?;

        let nat = match network.private_subnet_id {
            Some(ref private_subnet_id) if config.uses_nat_gateway() => {
                self.enter(Stage::NatGateway)?;
                let nat = self
                    .nat(&blueprint, &mut factory, &network, private_subnet_id)
                    .await
                    .map_err(at(Stage::NatGateway))?;
                Some(nat)
            }
            _ => None,
        };

        self.enter(Stage::SecurityGroup)?;
        let security_group = factory
            .ensure(&blueprint.security_group(&network.vpc_id))
            .await
            .map_err(at(Stage::SecurityGroup))?;

        self.enter(Stage::KeyMaterial)?;
        let key_pair = factory
            .ensure_key_pair(&blueprint.key_pair(), &config.key_path())
            .await
            .map_err(at(Stage::KeyMaterial))?;

        self.enter(Stage::Storage)?;
        let bucket = factory
            .ensure(&blueprint.bucket())
            .await
            .map_err(at(Stage::Storage))?;

        let iam = if config.profile_binding.uses_iam() {
            self.enter(Stage::IamRoleAndProfile)?;
            let iam = self
                .iam(&blueprint, &mut factory, &bucket.id)
                .await
                .map_err(at(Stage::IamRoleAndProfile))?;

            self.enter(Stage::ProfileReady)?;
            self.wait_for_profile(&iam, &config.iam_wait)
                .await
                .map_err(at(Stage::ProfileReady))?;
            Some(iam)
        } else {
            None
        };

        self.enter(Stage::BootstrapRender)?;
        let user_data = template::render(&self.template, &blueprint.template_bindings(&bucket.id))
            .map_err(|e| StageFailure::new(Stage::BootstrapRender, e.into()))?;

        self.enter(Stage::ComputeInstance)?;
        let profile_at_launch = match (&iam, config.profile_binding) {
            (Some(iam), ProfileBinding::AtLaunch) => Some(iam.profile_name.clone()),
            _ => None,
        };
        let request = blueprint.launch_request(
            &network.public_subnet_id,
            &security_group.id,
            &key_pair.id,
            profile_at_launch,
            user_data,
        );
        let instance = factory
            .ensure_instance(&request, &config.iam_wait)
            .await
            .map_err(at(Stage::ComputeInstance))?;

        if let Some(ref iam) = iam
            && config.profile_binding == ProfileBinding::Associate
        {
            self.enter(Stage::ProfileAssociation)?;
            self.associate(&instance, iam, &config.iam_wait)
                .await
                .map_err(at(Stage::ProfileAssociation))?;
        }

        let created = factory.created().to_vec();
        info!(
            "Deployment {} ready in {} ({} resource(s) created)",
            config.prefix,
            config.region,
            created.len()
        );

        Ok(DeploymentResult {
            region: config.region.clone(),
            vpc_id: network.vpc_id,
            public_subnet_id: network.public_subnet_id,
            private_subnet_id: network.private_subnet_id,
            internet_gateway_id: routing.internet_gateway_id,
            route_table_id: routing.route_table_id,
            elastic_ip_allocation_id: nat.as_ref().map(|n| n.allocation_id.clone()),
            nat_gateway_id: nat.as_ref().map(|n| n.nat_gateway_id.clone()),
            private_route_table_id: nat.map(|n| n.route_table_id),
            security_group_id: security_group.id,
            key_name: key_pair.id,
            bucket_name: bucket.id,
            role_name: iam.as_ref().map(|i| i.role_name.clone()),
            instance_profile_name: iam.map(|i| i.profile_name),
            instance_id: instance.id,
            created,
        })
    }

    async fn network(
        &self,
        blueprint: &Blueprint<'_>,
        factory: &mut ResourceFactory<'_>,
    ) -> Result<Network, CoreError> {
        let vpc = factory.ensure(&blueprint.vpc()).await?;
        let public = factory.ensure(&blueprint.public_subnet(&vpc.id)).await?;
        let private = match blueprint.private_subnet(&vpc.id) {
            Some(spec) => Some(factory.ensure(&spec).await?.id),
            None => None,
        };
        Ok(Network {
            vpc_id: vpc.id,
            public_subnet_id: public.id,
            private_subnet_id: private,
        })
    }

    async fn routing(
        &self,
        blueprint: &Blueprint<'_>,
        factory: &mut ResourceFactory<'_>,
        network: &Network,
    ) -> Result<Routing, CoreError> {
        let gateway = factory
            .ensure(&blueprint.internet_gateway(&network.vpc_id))
            .await?;
        let route_table = factory
            .ensure(&blueprint.route_table(
                &network.vpc_id,
                &gateway.id,
                &network.public_subnet_id,
            ))
            .await?;
        Ok(Routing {
            internet_gateway_id: gateway.id,
            route_table_id: route_table.id,
        })
    }

    /// Elastic IP, NAT gateway in the public subnet, and the private subnet's route through it
    async fn nat(
        &self,
        blueprint: &Blueprint<'_>,
        factory: &mut ResourceFactory<'_>,
        network: &Network,
        private_subnet_id: &str,
    ) -> Result<Nat, CoreError> {
        let address = factory.ensure(&blueprint.elastic_ip()).await?;
        let gateway = factory
            .ensure(&blueprint.nat_gateway(
                &network.vpc_id,
                &network.public_subnet_id,
                &address.id,
            ))
            .await?;
        if gateway.attribute(attr::STATE) != Some(NAT_AVAILABLE) {
            let name = &blueprint.names().nat_gateway;
            self.wait_for_nat_gateway(name, &network.vpc_id, &gateway.id)
                .await?;
        }
        let route_table = factory
            .ensure(&blueprint.private_route_table(
                &network.vpc_id,
                &gateway.id,
                private_subnet_id,
            ))
            .await?;

        Ok(Nat {
            allocation_id: address.id,
            nat_gateway_id: gateway.id,
            route_table_id: route_table.id,
        })
    }

    async fn wait_for_nat_gateway(
        &self,
        name: &str,
        vpc_id: &str,
        nat_id: &str,
    ) -> Result<(), CoreError> {
        let provider = self.provider;
        let filter = ResourceFilter::new(ResourceKind::NatGateway)
            .with_tag(NAME_TAG, name)
            .in_vpc(vpc_id);
        let filter = &filter;

        self.waiter
            .wait_until(
                &format!("NAT gateway {}", nat_id),
                &self.nat_wait,
                move |_| async move {
                    provider.find_resources(filter).await.map(|found| {
                        match found.iter().find(|r| r.id == nat_id) {
                            Some(nat) if nat.attribute(attr::STATE) == Some(NAT_AVAILABLE) => {
                                Probe::Ready(())
                            }
                            Some(nat) => Probe::Pending(format!(
                                "{} is {}",
                                nat_id,
                                nat.attribute(attr::STATE).unwrap_or("pending")
                            )),
                            None => Probe::Pending(format!("{} not visible yet", nat_id)),
                        }
                    })
                },
            )
            .await
            .map_err(|e| wait_failed(e, ResourceKind::NatGateway, nat_id))?;

        info!("NAT gateway {} is available", nat_id);
        Ok(())
    }

    async fn iam(
        &self,
        blueprint: &Blueprint<'_>,
        factory: &mut ResourceFactory<'_>,
        bucket: &str,
    ) -> Result<Iam, CoreError> {
        let names = blueprint.names();
        let provider = self.provider;

        let role = factory.ensure(&blueprint.role()).await?;
        let policy = blueprint.bucket_policy(bucket);
        if role.created || !role.list_attribute(attr::POLICIES).contains(&policy.name.as_str()) {
            self.waiter
                .retry_throttled(&RetryPolicy::throttle(), || {
                    provider.attach_policy(&names.role, &policy)
                })
                .await
                .map_err(|cause| CoreError::ProvisioningFailed {
                    kind: ResourceKind::IamRole,
                    name: names.role.clone(),
                    cause,
                })?;
            info!("Attached policy {} to {}", policy.name, names.role);
        }

        let profile = factory.ensure(&blueprint.instance_profile()).await?;
        let roles = profile.list_attribute(attr::ROLES);
        if roles.is_empty() {
            self.waiter
                .retry_throttled(&RetryPolicy::throttle(), || {
                    provider.bind_role(&names.instance_profile, &names.role)
                })
                .await
                .map_err(|cause| CoreError::ProvisioningFailed {
                    kind: ResourceKind::InstanceProfile,
                    name: names.instance_profile.clone(),
                    cause,
                })?;
            info!("Added role {} to {}", names.role, names.instance_profile);
        } else if roles != [names.role.as_str()] {
            return Err(CoreError::ProvisioningFailed {
                kind: ResourceKind::InstanceProfile,
                name: names.instance_profile.clone(),
                cause: ProviderError::new(format!(
                    "profile wraps role(s) {} instead of {}",
                    roles.join(", "),
                    names.role
                ))
                .with_kind(ProviderErrorKind::Conflict),
            });
        }

        Ok(Iam {
            role_name: names.role.clone(),
            profile_name: names.instance_profile.clone(),
        })
    }

    async fn wait_for_profile(&self, iam: &Iam, policy: &RetryPolicy) -> Result<(), CoreError> {
        let provider = self.provider;
        let profile: &str = &iam.profile_name;
        let role: &str = &iam.role_name;

        self.waiter
            .wait_until(
                &format!("instance profile {}", profile),
                policy,
                move |_| async move {
                    provider.profile_ready(profile, role).await.map(|ready| {
                        if ready {
                            Probe::Ready(())
                        } else {
                            Probe::Pending(format!("role {} not yet visible in profile", role))
                        }
                    })
                },
            )
            .await
            .map_err(|e| wait_failed(e, ResourceKind::InstanceProfile, profile))
    }

    /// Associate the profile with the running instance, polling while the
    /// provider still reports it as not ready
    async fn associate(
        &self,
        instance: &Ensured,
        iam: &Iam,
        policy: &RetryPolicy,
    ) -> Result<(), CoreError> {
        let profile: &str = &iam.profile_name;
        if instance.attribute(attr::IAM_PROFILE) == Some(profile) {
            info!("{} already carries {}", instance.id, profile);
            return Ok(());
        }

        let provider = self.provider;
        let instance_id: &str = &instance.id;
        self.waiter
            .wait_until(
                &format!("profile association for {}", instance_id),
                policy,
                move |_| async move {
                    provider
                        .associate_profile(instance_id, profile)
                        .await
                        .map(|()| Probe::Ready(()))
                },
            )
            .await
            .map_err(|e| wait_failed(e, ResourceKind::Instance, instance_id))?;

        info!("Associated {} with {}", profile, instance_id);
        Ok(())
    }
}

pub(crate) fn wait_failed(err: WaitError, kind: ResourceKind, name: &str) -> CoreError {
    match err {
        WaitError::TimedOut {
            resource,
            attempts,
            last_error,
        } => CoreError::DependencyNotReady {
            resource,
            attempts,
            last_error,
        },
        WaitError::Failed { cause, .. } => CoreError::ProvisioningFailed {
            kind,
            name: name.to_string(),
            cause,
        },
    }
}
