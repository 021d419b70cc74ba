//! EC2 resources: VPC, subnets, gateways, route tables, Elastic IPs, security
//! group, key pair and instances

use std::collections::BTreeMap;

use aws_sdk_ec2::types::{
    AttributeBooleanValue, DomainType, Filter, IamInstanceProfileSpecification, InstanceType,
    IpPermission, IpRange, KeyType, ResourceType, Tag, TagSpecification,
};
use base64::Engine;
use log::debug;
use sandbox_core::provider::{
    CreatedResource, LaunchRequest, ProviderError, ProviderErrorKind, ProviderResult,
};
use sandbox_core::resource::{
    Criterion, ElasticIpSpec, FoundResource, InternetGatewaySpec, KeyPairSpec, NAME_TAG,
    NatGatewaySpec, ResourceFilter, ResourceKind, RouteTableSpec, RouteTarget, SecurityGroupSpec,
    SubnetSpec, Tags, Tier, VpcSpec, attr,
};

use crate::AwsProvider;
use crate::errors::{missing, sdk_error};
use crate::rollback::undo_on_error;

/// Instance states that still count as "the instance exists"
const LIVE_INSTANCE_STATES: &[&str] = &["pending", "running", "stopping", "stopped"];
/// Deleted NAT gateways stay visible for about an hour
const LIVE_NAT_STATES: &[&str] = &["pending", "available"];

fn nat_gateway_filters(filter: &ResourceFilter) -> Vec<Filter> {
    let mut filters = ec2_filters(filter);
    filters.push(
        Filter::builder()
            .name("state")
            .set_values(Some(LIVE_NAT_STATES.iter().map(|s| s.to_string()).collect()))
            .build(),
    );
    filters
}

fn tag_specification(resource_type: ResourceType, tags: &Tags) -> TagSpecification {
    let mut spec = TagSpecification::builder().resource_type(resource_type);
    for (key, value) in tags {
        spec = spec.tags(Tag::builder().key(key).value(value).build());
    }
    spec.build()
}

fn collect_tags(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect()
}

fn enabled() -> AttributeBooleanValue {
    AttributeBooleanValue::builder().value(true).build()
}

/// Translate a lookup filter into EC2 describe filters
fn ec2_filters(filter: &ResourceFilter) -> Vec<Filter> {
    filter
        .criteria
        .iter()
        .filter_map(|criterion| match criterion {
            Criterion::Tag { key, value } => Some(
                Filter::builder()
                    .name(format!("tag:{}", key))
                    .values(value)
                    .build(),
            ),
            Criterion::Vpc(vpc_id) => Some(Filter::builder().name("vpc-id").values(vpc_id).build()),
            Criterion::Name(name) => {
                let field = match filter.kind {
                    ResourceKind::SecurityGroup => "group-name",
                    ResourceKind::KeyPair => "key-name",
                    // No name field on other kinds; the Locator re-checks
                    _ => return None,
                };
                Some(Filter::builder().name(field).values(name).build())
            }
        })
        .collect()
}

impl AwsProvider {
    // ========== Lookups ==========

    pub(crate) async fn find_vpcs(&self, filter: &ResourceFilter) -> ProviderResult<Vec<FoundResource>> {
        let result = self
            .ec2_client
            .describe_vpcs()
            .set_filters(Some(ec2_filters(filter)))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe VPCs", e))?;

        Ok(result
            .vpcs()
            .iter()
            .filter_map(|vpc| {
                let mut found = FoundResource::new(vpc.vpc_id()?);
                found.tags = collect_tags(vpc.tags());
                if let Some(cidr) = vpc.cidr_block() {
                    found = found.with_attribute(attr::CIDR_BLOCK, cidr);
                }
                Some(found)
            })
            .collect())
    }

    pub(crate) async fn find_subnets(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let result = self
            .ec2_client
            .describe_subnets()
            .set_filters(Some(ec2_filters(filter)))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe subnets", e))?;

        Ok(result
            .subnets()
            .iter()
            .filter_map(|subnet| {
                let mut found = FoundResource::new(subnet.subnet_id()?);
                found.tags = collect_tags(subnet.tags());
                if let Some(vpc_id) = subnet.vpc_id() {
                    found = found.with_attribute(attr::VPC_ID, vpc_id);
                }
                if let Some(cidr) = subnet.cidr_block() {
                    found = found.with_attribute(attr::CIDR_BLOCK, cidr);
                }
                Some(found)
            })
            .collect())
    }

    pub(crate) async fn find_internet_gateways(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let result = self
            .ec2_client
            .describe_internet_gateways()
            .set_filters(Some(ec2_filters(filter)))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe internet gateways", e))?;

        Ok(result
            .internet_gateways()
            .iter()
            .filter_map(|igw| {
                let mut found = FoundResource::new(igw.internet_gateway_id()?);
                found.tags = collect_tags(igw.tags());
                if let Some(vpc_id) = igw.attachments().first().and_then(|a| a.vpc_id()) {
                    found = found.with_attribute(attr::ATTACHED_VPC, vpc_id);
                }
                Some(found)
            })
            .collect())
    }

    pub(crate) async fn find_route_tables(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let result = self
            .ec2_client
            .describe_route_tables()
            .set_filters(Some(ec2_filters(filter)))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe route tables", e))?;

        Ok(result
            .route_tables()
            .iter()
            .filter_map(|rt| {
                let mut found = FoundResource::new(rt.route_table_id()?);
                found.tags = collect_tags(rt.tags());
                if let Some(vpc_id) = rt.vpc_id() {
                    found = found.with_attribute(attr::VPC_ID, vpc_id);
                }
                Some(found)
            })
            .collect())
    }

    pub(crate) async fn find_security_groups(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let result = self
            .ec2_client
            .describe_security_groups()
            .set_filters(Some(ec2_filters(filter)))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe security groups", e))?;

        Ok(result
            .security_groups()
            .iter()
            .filter_map(|sg| {
                let mut found = FoundResource::new(sg.group_id()?);
                found.tags = collect_tags(sg.tags());
                if let Some(name) = sg.group_name() {
                    found = found.with_attribute(attr::NAME, name);
                }
                if let Some(vpc_id) = sg.vpc_id() {
                    found = found.with_attribute(attr::VPC_ID, vpc_id);
                }
                Some(found)
            })
            .collect())
    }

    /// Elastic IPs are identified by their allocation ID
    pub(crate) async fn find_addresses(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let result = self
            .ec2_client
            .describe_addresses()
            .set_filters(Some(ec2_filters(filter)))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe addresses", e))?;

        Ok(result
            .addresses()
            .iter()
            .filter_map(|address| {
                let mut found = FoundResource::new(address.allocation_id()?);
                found.tags = collect_tags(address.tags());
                if let Some(ip) = address.public_ip() {
                    found = found.with_attribute(attr::PUBLIC_IP, ip);
                }
                Some(found)
            })
            .collect())
    }

    /// Pending and available NAT gateways only
    pub(crate) async fn find_nat_gateways(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let result = self
            .ec2_client
            .describe_nat_gateways()
            .set_filter(Some(nat_gateway_filters(filter)))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe NAT gateways", e))?;

        Ok(result
            .nat_gateways()
            .iter()
            .filter_map(|nat| {
                let mut found = FoundResource::new(nat.nat_gateway_id()?);
                found.tags = collect_tags(nat.tags());
                if let Some(vpc_id) = nat.vpc_id() {
                    found = found.with_attribute(attr::VPC_ID, vpc_id);
                }
                if let Some(subnet_id) = nat.subnet_id() {
                    found = found.with_attribute(attr::SUBNET_ID, subnet_id);
                }
                if let Some(state) = nat.state() {
                    found = found.with_attribute(attr::STATE, state.as_str());
                }
                if let Some(allocation_id) = nat
                    .nat_gateway_addresses()
                    .first()
                    .and_then(|a| a.allocation_id())
                {
                    found = found.with_attribute(attr::ALLOCATION_ID, allocation_id);
                }
                Some(found)
            })
            .collect())
    }

    /// Key pairs are identified by name, which is also what instances reference
    pub(crate) async fn find_key_pairs(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let result = self
            .ec2_client
            .describe_key_pairs()
            .set_filters(Some(ec2_filters(filter)))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe key pairs", e))?;

        Ok(result
            .key_pairs()
            .iter()
            .filter_map(|kp| {
                let name = kp.key_name()?;
                let mut found = FoundResource::new(name).with_attribute(attr::NAME, name);
                found.tags = collect_tags(kp.tags());
                Some(found)
            })
            .collect())
    }

    /// Instances that are not shutting down or terminated
    pub(crate) async fn find_instances(
        &self,
        filter: &ResourceFilter,
    ) -> ProviderResult<Vec<FoundResource>> {
        let mut filters = ec2_filters(filter);
        filters.push(
            Filter::builder()
                .name("instance-state-name")
                .set_values(Some(
                    LIVE_INSTANCE_STATES.iter().map(|s| s.to_string()).collect(),
                ))
                .build(),
        );

        let result = self
            .ec2_client
            .describe_instances()
            .set_filters(Some(filters))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe instances", e))?;

        Ok(result
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|instance| {
                let mut found = FoundResource::new(instance.instance_id()?);
                found.tags = collect_tags(instance.tags());
                if let Some(state) = instance.state().and_then(|s| s.name()) {
                    found = found.with_attribute(attr::STATE, state.as_str());
                }
                if let Some(profile) = instance
                    .iam_instance_profile()
                    .and_then(|p| p.arn())
                    .and_then(|arn| arn.rsplit('/').next())
                {
                    found = found.with_attribute(attr::IAM_PROFILE, profile);
                }
                if let Some(subnet_id) = instance.subnet_id() {
                    found = found.with_attribute(attr::SUBNET_ID, subnet_id);
                }
                if let Some(ip) = instance.public_ip_address() {
                    found = found.with_attribute(attr::PUBLIC_IP, ip);
                }
                Some(found)
            })
            .collect())
    }

    // ========== Creation ==========

    pub(crate) async fn create_vpc(&self, spec: &VpcSpec) -> ProviderResult<CreatedResource> {
        let result = self
            .ec2_client
            .create_vpc()
            .cidr_block(&spec.cidr_block)
            .tag_specifications(tag_specification(ResourceType::Vpc, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create VPC", e))?;

        let vpc_id = result
            .vpc()
            .and_then(|v| v.vpc_id())
            .ok_or_else(|| missing("a VPC ID"))?;

        // DNS support and hostnames must be set in separate calls
        let configured = async {
            self.ec2_client
                .modify_vpc_attribute()
                .vpc_id(vpc_id)
                .enable_dns_support(enabled())
                .send()
                .await
                .map_err(|e| sdk_error("Failed to enable DNS support", e))?;
            self.ec2_client
                .modify_vpc_attribute()
                .vpc_id(vpc_id)
                .enable_dns_hostnames(enabled())
                .send()
                .await
                .map_err(|e| sdk_error("Failed to enable DNS hostnames", e))?;
            Ok::<(), ProviderError>(())
        }
        .await;
        self.undo_ec2(ResourceKind::Vpc, vpc_id, configured).await?;

        Ok(CreatedResource::new(vpc_id))
    }

    pub(crate) async fn create_subnet(&self, spec: &SubnetSpec) -> ProviderResult<CreatedResource> {
        let result = self
            .ec2_client
            .create_subnet()
            .vpc_id(&spec.vpc_id)
            .cidr_block(&spec.cidr_block)
            .set_availability_zone(spec.availability_zone.clone())
            .tag_specifications(tag_specification(ResourceType::Subnet, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create subnet", e))?;

        let subnet_id = result
            .subnet()
            .and_then(|s| s.subnet_id())
            .ok_or_else(|| missing("a subnet ID"))?;

        if spec.tier == Tier::Public {
            let configured = self
                .ec2_client
                .modify_subnet_attribute()
                .subnet_id(subnet_id)
                .map_public_ip_on_launch(enabled())
                .send()
                .await
                .map(|_| ())
                .map_err(|e| sdk_error("Failed to enable public IPs on subnet", e));
            self.undo_ec2(ResourceKind::Subnet, subnet_id, configured).await?;
        }

        Ok(CreatedResource::new(subnet_id))
    }

    pub(crate) async fn create_internet_gateway(
        &self,
        spec: &InternetGatewaySpec,
    ) -> ProviderResult<CreatedResource> {
        let result = self
            .ec2_client
            .create_internet_gateway()
            .tag_specifications(tag_specification(ResourceType::InternetGateway, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create internet gateway", e))?;

        let igw_id = result
            .internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .ok_or_else(|| missing("an internet gateway ID"))?;

        let attached = self
            .ec2_client
            .attach_internet_gateway()
            .internet_gateway_id(igw_id)
            .vpc_id(&spec.vpc_id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| sdk_error("Failed to attach internet gateway", e));
        self.undo_ec2(ResourceKind::InternetGateway, igw_id, attached).await?;

        Ok(CreatedResource::new(igw_id))
    }

    /// Route table with the default route to its target, bound to the subnet
    pub(crate) async fn create_route_table(
        &self,
        spec: &RouteTableSpec,
    ) -> ProviderResult<CreatedResource> {
        let result = self
            .ec2_client
            .create_route_table()
            .vpc_id(&spec.vpc_id)
            .tag_specifications(tag_specification(ResourceType::RouteTable, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create route table", e))?;

        let rt_id = result
            .route_table()
            .and_then(|rt| rt.route_table_id())
            .ok_or_else(|| missing("a route table ID"))?;

        let route = self
            .ec2_client
            .create_route()
            .route_table_id(rt_id)
            .destination_cidr_block(RouteTableSpec::DEFAULT_ROUTE);
        let route = match spec.target {
            RouteTarget::InternetGateway(ref igw_id) => route.gateway_id(igw_id),
            RouteTarget::NatGateway(ref nat_id) => route.nat_gateway_id(nat_id),
        };

        let routed = async {
            route
                .send()
                .await
                .map_err(|e| sdk_error("Failed to create default route", e))?;
            self.ec2_client
                .associate_route_table()
                .route_table_id(rt_id)
                .subnet_id(&spec.subnet_id)
                .send()
                .await
                .map_err(|e| sdk_error("Failed to associate route table", e))?;
            Ok::<(), ProviderError>(())
        }
        .await;
        self.undo_ec2(ResourceKind::RouteTable, rt_id, routed).await?;

        Ok(CreatedResource::new(rt_id))
    }

    pub(crate) async fn allocate_elastic_ip(
        &self,
        spec: &ElasticIpSpec,
    ) -> ProviderResult<CreatedResource> {
        let result = self
            .ec2_client
            .allocate_address()
            .domain(DomainType::Vpc)
            .tag_specifications(tag_specification(ResourceType::ElasticIp, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to allocate Elastic IP", e))?;

        let allocation_id = result
            .allocation_id()
            .ok_or_else(|| missing("an allocation ID"))?;
        Ok(CreatedResource::new(allocation_id))
    }

    /// Returns while the gateway is still pending; callers wait for `available`
    pub(crate) async fn create_nat_gateway(
        &self,
        spec: &NatGatewaySpec,
    ) -> ProviderResult<CreatedResource> {
        let result = self
            .ec2_client
            .create_nat_gateway()
            .subnet_id(&spec.subnet_id)
            .allocation_id(&spec.allocation_id)
            .tag_specifications(tag_specification(ResourceType::Natgateway, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create NAT gateway", e))?;

        let nat_id = result
            .nat_gateway()
            .and_then(|n| n.nat_gateway_id())
            .ok_or_else(|| missing("a NAT gateway ID"))?;
        Ok(CreatedResource::new(nat_id))
    }

    pub(crate) async fn create_security_group(
        &self,
        spec: &SecurityGroupSpec,
    ) -> ProviderResult<CreatedResource> {
        let result = self
            .ec2_client
            .create_security_group()
            .group_name(&spec.name)
            .description(&spec.description)
            .vpc_id(&spec.vpc_id)
            .tag_specifications(tag_specification(ResourceType::SecurityGroup, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create security group", e))?;

        let group_id = result.group_id().ok_or_else(|| missing("a security group ID"))?;

        if !spec.ingress.is_empty() {
            let permissions: Vec<IpPermission> = spec
                .ingress
                .iter()
                .map(|rule| {
                    let mut range = IpRange::builder().cidr_ip(&rule.cidr);
                    if !rule.description.is_empty() {
                        range = range.description(&rule.description);
                    }
                    IpPermission::builder()
                        .ip_protocol(&rule.protocol)
                        .from_port(rule.from_port)
                        .to_port(rule.to_port)
                        .ip_ranges(range.build())
                        .build()
                })
                .collect();

            let authorized = self
                .ec2_client
                .authorize_security_group_ingress()
                .group_id(group_id)
                .set_ip_permissions(Some(permissions))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| sdk_error("Failed to authorize ingress", e));
            self.undo_ec2(ResourceKind::SecurityGroup, group_id, authorized).await?;
        }

        Ok(CreatedResource::new(group_id))
    }

    /// The private key is only returned here, never again
    pub(crate) async fn create_key_pair(&self, spec: &KeyPairSpec) -> ProviderResult<CreatedResource> {
        let result = self
            .ec2_client
            .create_key_pair()
            .key_name(&spec.name)
            .key_type(KeyType::Rsa)
            .tag_specifications(tag_specification(ResourceType::KeyPair, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("Failed to create key pair", e))?;

        let material = result
            .key_material()
            .ok_or_else(|| missing("private key material"))?;

        Ok(CreatedResource::new(&spec.name).with_key_material(material))
    }

    pub(crate) async fn launch(&self, request: &LaunchRequest) -> ProviderResult<String> {
        let user_data = base64::engine::general_purpose::STANDARD.encode(&request.user_data);

        let mut tags = request.tags.clone();
        tags.insert(NAME_TAG.to_string(), request.name.clone());

        let mut run = self
            .ec2_client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .subnet_id(&request.subnet_id)
            .set_security_group_ids(Some(request.security_group_ids.clone()))
            .key_name(&request.key_name)
            .user_data(user_data)
            .tag_specifications(tag_specification(ResourceType::Instance, &tags));

        if let Some(ref profile) = request.instance_profile {
            run = run.iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(profile)
                    .build(),
            );
        }

        let result = run
            .send()
            .await
            .map_err(|e| sdk_error("Failed to launch instance", e))?;

        result
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(String::from)
            .ok_or_else(|| missing("an instance ID"))
    }

    /// Delete a resource created moments ago when its follow-up call failed
    async fn undo_ec2(&self, kind: ResourceKind, id: &str, result: ProviderResult<()>) -> ProviderResult<()> {
        undo_on_error(&format!("{} {}", kind, id), result, || async move {
            self.delete_ec2(kind, &FoundResource::new(id)).await
        })
        .await
    }

    // ========== Instance profile association ==========

    pub(crate) async fn associate_instance_profile(
        &self,
        instance_id: &str,
        profile_name: &str,
    ) -> ProviderResult<()> {
        self.ec2_client
            .associate_iam_instance_profile()
            .instance_id(instance_id)
            .iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(profile_name)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("Failed to associate instance profile", e))?;
        Ok(())
    }

    pub(crate) async fn disassociate_instance_profile(&self, instance_id: &str) -> ProviderResult<()> {
        let result = self
            .ec2_client
            .describe_iam_instance_profile_associations()
            .filters(Filter::builder().name("instance-id").values(instance_id).build())
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe profile associations", e))?;

        for association in result.iam_instance_profile_associations() {
            if let Some(association_id) = association.association_id() {
                self.ec2_client
                    .disassociate_iam_instance_profile()
                    .association_id(association_id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to disassociate instance profile", e))?;
                debug!("Disassociated {} from {}", association_id, instance_id);
            }
        }
        Ok(())
    }

    // ========== Deletion ==========

    pub(crate) async fn delete_ec2(
        &self,
        kind: ResourceKind,
        resource: &FoundResource,
    ) -> ProviderResult<()> {
        let id = resource.id.as_str();
        match kind {
            ResourceKind::Instance => {
                self.ec2_client
                    .terminate_instances()
                    .instance_ids(id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to terminate instance", e))?;
            }
            ResourceKind::SecurityGroup => {
                self.ec2_client
                    .delete_security_group()
                    .group_id(id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to delete security group", e))?;
            }
            ResourceKind::KeyPair => {
                self.ec2_client
                    .delete_key_pair()
                    .key_name(id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to delete key pair", e))?;
            }
            ResourceKind::RouteTable => self.delete_route_table(id).await?,
            // Deletion is asynchronous; the gateway moves through `deleting`
            ResourceKind::NatGateway => {
                self.ec2_client
                    .delete_nat_gateway()
                    .nat_gateway_id(id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to delete NAT gateway", e))?;
            }
            ResourceKind::ElasticIp => {
                self.ec2_client
                    .release_address()
                    .allocation_id(id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to release Elastic IP", e))?;
            }
            ResourceKind::InternetGateway => {
                // Detach first
                if let Some(vpc_id) = resource.attribute(attr::ATTACHED_VPC) {
                    let detached = self
                        .ec2_client
                        .detach_internet_gateway()
                        .internet_gateway_id(id)
                        .vpc_id(vpc_id)
                        .send()
                        .await
                        .map_err(|e| sdk_error("Failed to detach internet gateway", e));
                    match detached {
                        Err(e) if e.kind == ProviderErrorKind::NotReady => return Err(e),
                        Err(e) => debug!("Detach of {} skipped: {}", id, e),
                        Ok(_) => {}
                    }
                }
                self.ec2_client
                    .delete_internet_gateway()
                    .internet_gateway_id(id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to delete internet gateway", e))?;
            }
            ResourceKind::Subnet => {
                self.ec2_client
                    .delete_subnet()
                    .subnet_id(id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to delete subnet", e))?;
            }
            ResourceKind::Vpc => {
                self.ec2_client
                    .delete_vpc()
                    .vpc_id(id)
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to delete VPC", e))?;
            }
            other => {
                return Err(ProviderError::new(format!(
                    "{} is not an EC2 resource",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Drop subnet associations, then the table itself
    async fn delete_route_table(&self, rt_id: &str) -> ProviderResult<()> {
        let result = self
            .ec2_client
            .describe_route_tables()
            .route_table_ids(rt_id)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to describe route table", e))?;

        for rt in result.route_tables() {
            for association in rt.associations() {
                if association.main() == Some(true) {
                    continue;
                }
                if let Some(association_id) = association.route_table_association_id() {
                    self.ec2_client
                        .disassociate_route_table()
                        .association_id(association_id)
                        .send()
                        .await
                        .map_err(|e| sdk_error("Failed to disassociate route table", e))?;
                }
            }
        }

        self.ec2_client
            .delete_route_table()
            .route_table_id(rt_id)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to delete route table", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_translate_tags_and_vpc() {
        let filter = ResourceFilter::new(ResourceKind::Subnet)
            .with_tag(NAME_TAG, "pf1-public-subnet")
            .in_vpc("vpc-1");
        let filters = ec2_filters(&filter);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].name(), Some("tag:Name"));
        assert_eq!(filters[0].values(), ["pf1-public-subnet"]);
        assert_eq!(filters[1].name(), Some("vpc-id"));
    }

    #[test]
    fn name_filter_depends_on_kind() {
        let sg = ResourceFilter::new(ResourceKind::SecurityGroup).with_name("pf1-public-sg");
        assert_eq!(ec2_filters(&sg)[0].name(), Some("group-name"));

        let key = ResourceFilter::new(ResourceKind::KeyPair).with_name("pf1-ec2-key");
        assert_eq!(ec2_filters(&key)[0].name(), Some("key-name"));

        let vpc = ResourceFilter::new(ResourceKind::Vpc).with_name("pf1-vpc");
        assert!(ec2_filters(&vpc).is_empty());
    }

    #[test]
    fn nat_lookups_skip_deleted_gateways() {
        let filter = ResourceFilter::new(ResourceKind::NatGateway)
            .with_tag(NAME_TAG, "pf1-nat-1")
            .in_vpc("vpc-1");
        let filters = nat_gateway_filters(&filter);

        assert_eq!(filters.len(), 3);
        assert_eq!(filters[1].name(), Some("vpc-id"));
        assert_eq!(filters[2].name(), Some("state"));
        assert_eq!(filters[2].values(), ["pending", "available"]);
    }

    #[test]
    fn tag_specification_carries_every_tag() {
        let tags: Tags = [
            (NAME_TAG.to_string(), "pf1-vpc".to_string()),
            ("sandbox:deployment".to_string(), "pf1".to_string()),
        ]
        .into();
        let spec = tag_specification(ResourceType::Vpc, &tags);
        assert_eq!(spec.resource_type(), Some(&ResourceType::Vpc));
        assert_eq!(collect_tags(spec.tags()), tags);
    }
}
