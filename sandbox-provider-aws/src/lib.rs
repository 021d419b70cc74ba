//! Sandbox AWS Provider
//!
//! CloudProvider implementation over the EC2, IAM and S3 SDK clients

mod ec2;
pub mod errors;
mod iam;
mod rollback;
mod s3;

use aws_config::Region;
use aws_sdk_ec2::Client as Ec2Client;
use aws_sdk_iam::Client as IamClient;
use aws_sdk_s3::Client as S3Client;
use sandbox_core::provider::{
    BoxFuture, CloudProvider, CreatedResource, LaunchRequest, ProviderResult,
};
use sandbox_core::resource::{
    FoundResource, PolicyDocument, ResourceFilter, ResourceKind, ResourceSpec,
};

/// AWS Provider
pub struct AwsProvider {
    ec2_client: Ec2Client,
    iam_client: IamClient,
    s3_client: S3Client,
    region: String,
}

impl AwsProvider {
    /// Create a new AWS Provider from the default credential chain
    pub async fn new(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self {
            ec2_client: Ec2Client::new(&config),
            iam_client: IamClient::new(&config),
            s3_client: S3Client::new(&config),
            region: region.to_string(),
        }
    }

    /// Create with specific clients (for testing)
    pub fn with_clients(
        ec2_client: Ec2Client,
        iam_client: IamClient,
        s3_client: S3Client,
        region: String,
    ) -> Self {
        Self {
            ec2_client,
            iam_client,
            s3_client,
            region,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

impl CloudProvider for AwsProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn find_resources(
        &self,
        filter: &ResourceFilter,
    ) -> BoxFuture<'_, ProviderResult<Vec<FoundResource>>> {
        let filter = filter.clone();
        Box::pin(async move {
            match filter.kind {
                ResourceKind::Vpc => self.find_vpcs(&filter).await,
                ResourceKind::Subnet => self.find_subnets(&filter).await,
                ResourceKind::InternetGateway => self.find_internet_gateways(&filter).await,
                ResourceKind::RouteTable => self.find_route_tables(&filter).await,
                ResourceKind::ElasticIp => self.find_addresses(&filter).await,
                ResourceKind::NatGateway => self.find_nat_gateways(&filter).await,
                ResourceKind::SecurityGroup => self.find_security_groups(&filter).await,
                ResourceKind::KeyPair => self.find_key_pairs(&filter).await,
                ResourceKind::Bucket => self.find_buckets(&filter).await,
                ResourceKind::IamRole => self.find_roles(&filter).await,
                ResourceKind::InstanceProfile => self.find_instance_profiles(&filter).await,
                ResourceKind::Instance => self.find_instances(&filter).await,
            }
        })
    }

    fn create_resource(&self, spec: &ResourceSpec) -> BoxFuture<'_, ProviderResult<CreatedResource>> {
        let spec = spec.clone();
        Box::pin(async move {
            let id = spec.id();
            let result = match &spec {
                ResourceSpec::Vpc(s) => self.create_vpc(s).await,
                ResourceSpec::Subnet(s) => self.create_subnet(s).await,
                ResourceSpec::InternetGateway(s) => self.create_internet_gateway(s).await,
                ResourceSpec::RouteTable(s) => self.create_route_table(s).await,
                ResourceSpec::ElasticIp(s) => self.allocate_elastic_ip(s).await,
                ResourceSpec::NatGateway(s) => self.create_nat_gateway(s).await,
                ResourceSpec::SecurityGroup(s) => self.create_security_group(s).await,
                ResourceSpec::KeyPair(s) => self.create_key_pair(s).await,
                ResourceSpec::Bucket(s) => self.create_bucket(s).await,
                ResourceSpec::IamRole(s) => self.create_role(s).await,
                ResourceSpec::InstanceProfile(s) => self.create_instance_profile(s).await,
            };
            result.map_err(|e| e.for_resource(id))
        })
    }

    fn attach_policy(
        &self,
        role_name: &str,
        policy: &PolicyDocument,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let role_name = role_name.to_string();
        let policy = policy.clone();
        Box::pin(async move { self.put_role_policy(&role_name, &policy).await })
    }

    fn bind_role(&self, profile_name: &str, role_name: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let profile_name = profile_name.to_string();
        let role_name = role_name.to_string();
        Box::pin(async move { self.add_role_to_profile(&profile_name, &role_name).await })
    }

    fn profile_ready(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> BoxFuture<'_, ProviderResult<bool>> {
        let profile_name = profile_name.to_string();
        let role_name = role_name.to_string();
        Box::pin(async move { self.instance_profile_ready(&profile_name, &role_name).await })
    }

    fn associate_profile(
        &self,
        instance_id: &str,
        profile_name: &str,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let instance_id = instance_id.to_string();
        let profile_name = profile_name.to_string();
        Box::pin(async move {
            self.associate_instance_profile(&instance_id, &profile_name)
                .await
        })
    }

    fn disassociate_profile(&self, instance_id: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let instance_id = instance_id.to_string();
        Box::pin(async move { self.disassociate_instance_profile(&instance_id).await })
    }

    fn launch_instance(&self, request: &LaunchRequest) -> BoxFuture<'_, ProviderResult<String>> {
        let request = request.clone();
        Box::pin(async move { self.launch(&request).await })
    }

    fn delete_resource(
        &self,
        kind: ResourceKind,
        resource: &FoundResource,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let resource = resource.clone();
        Box::pin(async move {
            match kind {
                ResourceKind::Bucket => self.delete_bucket(&resource.id).await,
                ResourceKind::IamRole => self.delete_role(&resource.id).await,
                ResourceKind::InstanceProfile => self.delete_instance_profile(&resource).await,
                _ => self.delete_ec2(kind, &resource).await,
            }
        })
    }
}
