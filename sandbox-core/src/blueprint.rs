//! Blueprint - Names, tags and resource specs derived from a DeployConfig

use std::collections::HashMap;

use serde_json::json;
use uuid::Uuid;

use crate::config::{BucketName, DeployConfig};
use crate::provider::LaunchRequest;
use crate::resource::{
    BucketSpec, DEPLOYMENT_TAG, ElasticIpSpec, InstanceProfileSpec, InternetGatewaySpec,
    KeyPairSpec, NAME_TAG, NatGatewaySpec, PolicyDocument, ResourceSpec, RoleSpec, RouteTableSpec,
    RouteTarget, SecurityGroupSpec, SubnetSpec, TIER_TAG, Tags, Tier, VpcSpec,
};

/// Logical resource names for one deployment prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Names {
    pub vpc: String,
    pub public_subnet: String,
    pub private_subnet: String,
    pub internet_gateway: String,
    pub route_table: String,
    pub private_route_table: String,
    pub nat_gateway: String,
    pub elastic_ip: String,
    pub security_group: String,
    pub key_pair: String,
    pub bucket: String,
    pub role: String,
    pub instance_profile: String,
    pub instance: String,
}

impl Names {
    pub fn new(prefix: &str) -> Self {
        Self {
            vpc: format!("{}-vpc", prefix),
            public_subnet: format!("{}-public-subnet", prefix),
            private_subnet: format!("{}-private-subnet", prefix),
            internet_gateway: format!("{}-igw", prefix),
            route_table: format!("{}-public-rt", prefix),
            private_route_table: format!("{}-private-rt", prefix),
            nat_gateway: format!("{}-nat-1", prefix),
            elastic_ip: format!("{}-nat-1-eip", prefix),
            security_group: format!("{}-public-sg", prefix),
            key_pair: format!("{}-ec2-key", prefix),
            bucket: format!("{}-bucket", prefix),
            role: format!("{}-ec2-s3-role", prefix),
            instance_profile: format!("{}-ec2-s3-profile", prefix),
            instance: format!("{}-ec2-instance", prefix),
        }
    }
}

/// `<prefix>-<8 lowercase hex>`
pub fn generated_bucket_name(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..8])
}

/// Trust policy letting EC2 assume the role
pub fn ec2_trust_policy() -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "ec2.amazonaws.com" },
            "Action": "sts:AssumeRole"
        }]
    })
}

/// Least-privilege access to exactly one bucket
pub fn bucket_access_policy(role_name: &str, bucket: &str) -> PolicyDocument {
    PolicyDocument {
        name: format!("{}-s3-access", role_name),
        document: json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": ["s3:ListBucket"],
                    "Resource": format!("arn:aws:s3:::{}", bucket)
                },
                {
                    "Effect": "Allow",
                    "Action": ["s3:GetObject", "s3:PutObject", "s3:DeleteObject"],
                    "Resource": format!("arn:aws:s3:::{}/*", bucket)
                }
            ]
        }),
    }
}

/// Turns a config into concrete resource specs
pub struct Blueprint<'a> {
    config: &'a DeployConfig,
    names: Names,
}

impl<'a> Blueprint<'a> {
    pub fn new(config: &'a DeployConfig) -> Self {
        Self {
            config,
            names: Names::new(&config.prefix),
        }
    }

    pub fn names(&self) -> &Names {
        &self.names
    }

    /// `Name` and `sandbox:deployment` tags
    pub fn tags(&self, name: &str) -> Tags {
        let mut tags = Tags::new();
        tags.insert(NAME_TAG.to_string(), name.to_string());
        tags.insert(DEPLOYMENT_TAG.to_string(), self.config.prefix.clone());
        tags
    }

    pub fn vpc(&self) -> ResourceSpec {
        ResourceSpec::Vpc(VpcSpec {
            name: self.names.vpc.clone(),
            cidr_block: self.config.vpc_cidr.clone(),
            tags: self.tags(&self.names.vpc),
        })
    }

    pub fn public_subnet(&self, vpc_id: &str) -> ResourceSpec {
        self.subnet(
            &self.names.public_subnet,
            vpc_id,
            &self.config.public_subnet_cidr,
            Tier::Public,
        )
    }

    /// `None` when the private subnet is disabled
    pub fn private_subnet(&self, vpc_id: &str) -> Option<ResourceSpec> {
        self.config
            .private_subnet_cidr
            .as_ref()
            .map(|cidr| self.subnet(&self.names.private_subnet, vpc_id, cidr, Tier::Private))
    }

    fn subnet(&self, name: &str, vpc_id: &str, cidr: &str, tier: Tier) -> ResourceSpec {
        let mut tags = self.tags(name);
        tags.insert(TIER_TAG.to_string(), tier.as_str().to_string());
        ResourceSpec::Subnet(SubnetSpec {
            name: name.to_string(),
            vpc_id: vpc_id.to_string(),
            cidr_block: cidr.to_string(),
            tier,
            availability_zone: self.config.availability_zone.clone(),
            tags,
        })
    }

    pub fn internet_gateway(&self, vpc_id: &str) -> ResourceSpec {
        ResourceSpec::InternetGateway(InternetGatewaySpec {
            name: self.names.internet_gateway.clone(),
            vpc_id: vpc_id.to_string(),
            tags: self.tags(&self.names.internet_gateway),
        })
    }

    /// Public route table sending 0.0.0.0/0 to the internet gateway
    pub fn route_table(&self, vpc_id: &str, gateway_id: &str, subnet_id: &str) -> ResourceSpec {
        ResourceSpec::RouteTable(RouteTableSpec {
            name: self.names.route_table.clone(),
            vpc_id: vpc_id.to_string(),
            target: RouteTarget::InternetGateway(gateway_id.to_string()),
            subnet_id: subnet_id.to_string(),
            tags: self.tags(&self.names.route_table),
        })
    }

    pub fn elastic_ip(&self) -> ResourceSpec {
        ResourceSpec::ElasticIp(ElasticIpSpec {
            name: self.names.elastic_ip.clone(),
            tags: self.tags(&self.names.elastic_ip),
        })
    }

    pub fn nat_gateway(&self, vpc_id: &str, public_subnet_id: &str, allocation_id: &str) -> ResourceSpec {
        ResourceSpec::NatGateway(NatGatewaySpec {
            name: self.names.nat_gateway.clone(),
            vpc_id: vpc_id.to_string(),
            subnet_id: public_subnet_id.to_string(),
            allocation_id: allocation_id.to_string(),
            tags: self.tags(&self.names.nat_gateway),
        })
    }

    /// Private route table sending 0.0.0.0/0 through the NAT gateway
    pub fn private_route_table(
        &self,
        vpc_id: &str,
        nat_gateway_id: &str,
        private_subnet_id: &str,
    ) -> ResourceSpec {
        ResourceSpec::RouteTable(RouteTableSpec {
            name: self.names.private_route_table.clone(),
            vpc_id: vpc_id.to_string(),
            target: RouteTarget::NatGateway(nat_gateway_id.to_string()),
            subnet_id: private_subnet_id.to_string(),
            tags: self.tags(&self.names.private_route_table),
        })
    }

    pub fn security_group(&self, vpc_id: &str) -> ResourceSpec {
        ResourceSpec::SecurityGroup(SecurityGroupSpec {
            name: self.names.security_group.clone(),
            description: format!("Public access for the {} sandbox", self.config.prefix),
            vpc_id: vpc_id.to_string(),
            ingress: self.config.ingress.clone(),
            tags: self.tags(&self.names.security_group),
        })
    }

    pub fn key_pair(&self) -> ResourceSpec {
        ResourceSpec::KeyPair(KeyPairSpec {
            name: self.names.key_pair.clone(),
            tags: self.tags(&self.names.key_pair),
        })
    }

    /// Bucket spec; a generated bucket gets a fresh random name that is only
    /// used if the Locator finds nothing tagged with the logical name
    pub fn bucket(&self) -> ResourceSpec {
        let (bucket_name, generated) = match self.config.bucket {
            BucketName::Generate => (generated_bucket_name(&self.config.prefix), true),
            BucketName::Named(ref name) => (name.clone(), false),
        };
        ResourceSpec::Bucket(BucketSpec {
            logical_name: self.names.bucket.clone(),
            bucket_name,
            generated,
            region: self.config.region.clone(),
            tags: self.tags(&self.names.bucket),
        })
    }

    pub fn role(&self) -> ResourceSpec {
        ResourceSpec::IamRole(RoleSpec {
            name: self.names.role.clone(),
            description: format!("EC2 access to the {} sandbox bucket", self.config.prefix),
            trust_policy: ec2_trust_policy(),
            tags: self.tags(&self.names.role),
        })
    }

    pub fn bucket_policy(&self, bucket: &str) -> PolicyDocument {
        bucket_access_policy(&self.names.role, bucket)
    }

    pub fn instance_profile(&self) -> ResourceSpec {
        ResourceSpec::InstanceProfile(InstanceProfileSpec {
            name: self.names.instance_profile.clone(),
            tags: self.tags(&self.names.instance_profile),
        })
    }

    /// Values available to the bootstrap template
    pub fn template_bindings(&self, bucket: &str) -> HashMap<String, String> {
        HashMap::from([
            ("bucket".to_string(), bucket.to_string()),
            ("region".to_string(), self.config.region.clone()),
            ("prefix".to_string(), self.config.prefix.clone()),
        ])
    }

    pub fn launch_request(
        &self,
        subnet_id: &str,
        security_group_id: &str,
        key_name: &str,
        instance_profile: Option<String>,
        user_data: Vec<u8>,
    ) -> LaunchRequest {
        LaunchRequest {
            name: self.names.instance.clone(),
            image_id: self.config.image_id.clone(),
            instance_type: self.config.instance_type.clone(),
            subnet_id: subnet_id.to_string(),
            security_group_ids: vec![security_group_id.to_string()],
            key_name: key_name.to_string(),
            instance_profile,
            user_data,
            tags: self.tags(&self.names.instance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    #[test]
    fn names_follow_prefix() {
        let names = Names::new("lab");
        assert_eq!(names.vpc, "lab-vpc");
        assert_eq!(names.key_pair, "lab-ec2-key");
        assert_eq!(names.role, "lab-ec2-s3-role");
        assert_eq!(names.instance_profile, "lab-ec2-s3-profile");
    }

    #[test]
    fn generated_bucket_name_shape() {
        let name = generated_bucket_name("pf1");
        let (prefix, suffix) = name.split_once('-').unwrap();
        assert_eq!(prefix, "pf1");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn subnets_carry_tier_tag() {
        let config = DeployConfig::default();
        let blueprint = Blueprint::new(&config);
        let public = blueprint.public_subnet("vpc-1");
        assert_eq!(public.tags().get(TIER_TAG).map(String::as_str), Some("public"));
        assert_eq!(public.tags().get(DEPLOYMENT_TAG).map(String::as_str), Some("pf1"));

        let private = blueprint.private_subnet("vpc-1").unwrap();
        assert_eq!(private.tags().get(TIER_TAG).map(String::as_str), Some("private"));
    }

    #[test]
    fn private_subnet_is_optional() {
        let config = DeployConfig {
            private_subnet_cidr: None,
            ..Default::default()
        };
        assert!(Blueprint::new(&config).private_subnet("vpc-1").is_none());
    }

    #[test]
    fn nat_gateway_routes_private_subnet() {
        let config = DeployConfig::default();
        let blueprint = Blueprint::new(&config);
        assert_eq!(blueprint.names().nat_gateway, "pf1-nat-1");

        let nat = blueprint.nat_gateway("vpc-1", "subnet-pub", "eipalloc-1");
        assert_eq!(nat.filter().vpc(), Some("vpc-1"));
        assert_eq!(nat.filter().tag(NAME_TAG), Some("pf1-nat-1"));

        match blueprint.private_route_table("vpc-1", "nat-1", "subnet-priv") {
            ResourceSpec::RouteTable(spec) => {
                assert_eq!(spec.name, "pf1-private-rt");
                assert_eq!(spec.target, RouteTarget::NatGateway("nat-1".to_string()));
                assert_eq!(spec.subnet_id, "subnet-priv");
            }
            other => panic!("Expected route table spec, got {:?}", other.kind()),
        }
    }

    #[test]
    fn bucket_policy_is_scoped_to_one_bucket() {
        let policy = bucket_access_policy("pf1-ec2-s3-role", "demo-1");
        assert_eq!(policy.name, "pf1-ec2-s3-role-s3-access");
        let statements = policy.document["Statement"].as_array().unwrap();
        assert_eq!(statements[0]["Resource"], "arn:aws:s3:::demo-1");
        assert_eq!(statements[1]["Resource"], "arn:aws:s3:::demo-1/*");
    }

    #[test]
    fn named_bucket_is_not_generated() {
        let config = DeployConfig {
            bucket: BucketName::Named("demo-bucket-1".to_string()),
            ..Default::default()
        };
        match Blueprint::new(&config).bucket() {
            ResourceSpec::Bucket(spec) => {
                assert_eq!(spec.bucket_name, "demo-bucket-1");
                assert!(!spec.generated);
            }
            other => panic!("Expected bucket spec, got {:?}", other.kind()),
        }
    }

    #[test]
    fn launch_request_tags_instance() {
        let config = DeployConfig::default();
        let request = Blueprint::new(&config).launch_request(
            "subnet-1",
            "sg-1",
            "pf1-ec2-key",
            Some("pf1-ec2-s3-profile".to_string()),
            b"#!/bin/bash".to_vec(),
        );
        assert_eq!(request.name, "pf1-ec2-instance");
        assert_eq!(request.security_group_ids, vec!["sg-1"]);
        assert_eq!(request.tags.get(NAME_TAG).map(String::as_str), Some("pf1-ec2-instance"));
        assert_eq!(Blueprint::new(&config).role().kind(), ResourceKind::IamRole);
    }
}
