//! Resource - Kinds, desired specs and lookup filters for sandbox resources

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag holding the logical name of every managed resource
pub const NAME_TAG: &str = "Name";
/// Tag holding the deployment prefix that owns a resource
pub const DEPLOYMENT_TAG: &str = "sandbox:deployment";
/// Tag marking a subnet as public or private
pub const TIER_TAG: &str = "Tier";

/// Well-known attribute keys reported by providers in [`FoundResource::attributes`]
pub mod attr {
    /// Provider-side name (group name, key name, role name, bucket name)
    pub const NAME: &str = "name";
    pub const VPC_ID: &str = "vpc_id";
    pub const SUBNET_ID: &str = "subnet_id";
    pub const CIDR_BLOCK: &str = "cidr_block";
    /// Name of the instance profile currently associated with an instance
    pub const IAM_PROFILE: &str = "iam_profile";
    /// Comma-separated role names wrapped by an instance profile
    pub const ROLES: &str = "roles";
    /// Comma-separated inline policy names attached to a role
    pub const POLICIES: &str = "policies";
    pub const STATE: &str = "state";
    /// VPC an internet gateway is attached to
    pub const ATTACHED_VPC: &str = "attached_vpc";
    /// Elastic IP allocation backing a NAT gateway
    pub const ALLOCATION_ID: &str = "allocation_id";
    pub const PUBLIC_IP: &str = "public_ip";
}

/// The fixed set of resource kinds the sandbox manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    InternetGateway,
    RouteTable,
    ElasticIp,
    NatGateway,
    SecurityGroup,
    KeyPair,
    Bucket,
    IamRole,
    InstanceProfile,
    Instance,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::InternetGateway => "internet_gateway",
            ResourceKind::RouteTable => "route_table",
            ResourceKind::ElasticIp => "elastic_ip",
            ResourceKind::NatGateway => "nat_gateway",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::KeyPair => "key_pair",
            ResourceKind::Bucket => "s3.bucket",
            ResourceKind::IamRole => "iam.role",
            ResourceKind::InstanceProfile => "iam.instance_profile",
            ResourceKind::Instance => "instance",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical identity of a resource: its kind plus the caller-chosen name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    /// Logical name (e.g., "pf1-vpc"), stable across runs
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

/// A single exact-match lookup criterion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// Provider-side name field (group name, key name, role name, bucket name)
    Name(String),
    /// Tag key/value pair
    Tag { key: String, value: String },
    /// Resource lives in the given VPC
    Vpc(String),
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Name(name) => write!(f, "name={}", name),
            Criterion::Tag { key, value } => write!(f, "tag:{}={}", key, value),
            Criterion::Vpc(vpc_id) => write!(f, "vpc-id={}", vpc_id),
        }
    }
}

/// Typed lookup filter for one resource kind
///
/// All criteria must match (logical AND). There is no fuzzy or prefix matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFilter {
    pub kind: ResourceKind,
    pub criteria: Vec<Criterion>,
}

impl ResourceFilter {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            criteria: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.criteria.push(Criterion::Name(name.into()));
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.criteria.push(Criterion::Tag {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn in_vpc(mut self, vpc_id: impl Into<String>) -> Self {
        self.criteria.push(Criterion::Vpc(vpc_id.into()));
        self
    }

    /// The `Name` criterion, if any
    pub fn name(&self) -> Option<&str> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::Name(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Value of the tag criterion with the given key, if any
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::Tag { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// The VPC criterion, if any
    pub fn vpc(&self) -> Option<&str> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::Vpc(vpc_id) => Some(vpc_id.as_str()),
            _ => None,
        })
    }

    /// Check a candidate against every criterion
    pub fn matches(&self, candidate: &FoundResource) -> bool {
        self.criteria.iter().all(|c| match c {
            Criterion::Name(name) => candidate.attribute(attr::NAME) == Some(name.as_str()),
            Criterion::Tag { key, value } => candidate.tag(key) == Some(value.as_str()),
            Criterion::Vpc(vpc_id) => candidate.attribute(attr::VPC_ID) == Some(vpc_id.as_str()),
        })
    }
}

impl fmt::Display for ResourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let criteria: Vec<String> = self.criteria.iter().map(|c| c.to_string()).collect();
        write!(f, "{}[{}]", self.kind, criteria.join(", "))
    }
}

/// A resource as reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoundResource {
    /// Provider-assigned identifier (vpc-xxx, sg-xxx, bucket name, role name, ...)
    pub id: String,
    pub tags: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

impl FoundResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Items of a comma-separated list attribute such as [`attr::ROLES`]
    pub fn list_attribute(&self, key: &str) -> Vec<&str> {
        self.attribute(key)
            .map(|v| v.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Subnet tier, recorded in the `Tier` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Public,
    Private,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Public => "public",
            Tier::Private => "private",
        }
    }
}

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct VpcSpec {
    pub name: String,
    pub cidr_block: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubnetSpec {
    pub name: String,
    pub vpc_id: String,
    pub cidr_block: String,
    pub tier: Tier,
    pub availability_zone: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternetGatewaySpec {
    pub name: String,
    /// VPC the gateway is attached to on creation
    pub vpc_id: String,
    pub tags: Tags,
}

/// Where a route table's default route points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    InternetGateway(String),
    NatGateway(String),
}

/// Route table with one default route, associated with one subnet
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTableSpec {
    pub name: String,
    pub vpc_id: String,
    pub target: RouteTarget,
    pub subnet_id: String,
    pub tags: Tags,
}

impl RouteTableSpec {
    pub const DEFAULT_ROUTE: &'static str = "0.0.0.0/0";
}

/// VPC-scoped Elastic IP, identified by its `Name` tag
#[derive(Debug, Clone, PartialEq)]
pub struct ElasticIpSpec {
    pub name: String,
    pub tags: Tags,
}

/// NAT gateway in the public subnet, giving the private subnet outbound access
#[derive(Debug, Clone, PartialEq)]
pub struct NatGatewaySpec {
    pub name: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub allocation_id: String,
    pub tags: Tags,
}

/// A single TCP/UDP ingress permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default = "IngressRule::default_protocol")]
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    #[serde(default = "IngressRule::default_cidr")]
    pub cidr: String,
    #[serde(default)]
    pub description: String,
}

impl IngressRule {
    pub fn tcp(port: i32, description: impl Into<String>) -> Self {
        Self {
            protocol: Self::default_protocol(),
            from_port: port,
            to_port: port,
            cidr: Self::default_cidr(),
            description: description.into(),
        }
    }

    fn default_protocol() -> String {
        "tcp".to_string()
    }

    fn default_cidr() -> String {
        "0.0.0.0/0".to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityGroupSpec {
    pub name: String,
    pub description: String,
    pub vpc_id: String,
    /// Full ingress rule set, applied when the group is created
    pub ingress: Vec<IngressRule>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyPairSpec {
    pub name: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketSpec {
    /// Logical name, stored in the `Name` tag
    pub logical_name: String,
    /// Physical, globally unique bucket name used on creation
    pub bucket_name: String,
    /// Generated buckets are located by tag because their physical name is random
    pub generated: bool,
    pub region: String,
    pub tags: Tags,
}

/// Named IAM policy document
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDocument {
    pub name: String,
    pub document: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleSpec {
    pub name: String,
    pub description: String,
    pub trust_policy: serde_json::Value,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceProfileSpec {
    pub name: String,
    pub tags: Tags,
}

/// Desired resource handed to the Factory
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Vpc(VpcSpec),
    Subnet(SubnetSpec),
    InternetGateway(InternetGatewaySpec),
    RouteTable(RouteTableSpec),
    ElasticIp(ElasticIpSpec),
    NatGateway(NatGatewaySpec),
    SecurityGroup(SecurityGroupSpec),
    KeyPair(KeyPairSpec),
    Bucket(BucketSpec),
    IamRole(RoleSpec),
    InstanceProfile(InstanceProfileSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Vpc(_) => ResourceKind::Vpc,
            ResourceSpec::Subnet(_) => ResourceKind::Subnet,
            ResourceSpec::InternetGateway(_) => ResourceKind::InternetGateway,
            ResourceSpec::RouteTable(_) => ResourceKind::RouteTable,
            ResourceSpec::ElasticIp(_) => ResourceKind::ElasticIp,
            ResourceSpec::NatGateway(_) => ResourceKind::NatGateway,
            ResourceSpec::SecurityGroup(_) => ResourceKind::SecurityGroup,
            ResourceSpec::KeyPair(_) => ResourceKind::KeyPair,
            ResourceSpec::Bucket(_) => ResourceKind::Bucket,
            ResourceSpec::IamRole(_) => ResourceKind::IamRole,
            ResourceSpec::InstanceProfile(_) => ResourceKind::InstanceProfile,
        }
    }

    /// Logical name used for idempotency matching
    pub fn logical_name(&self) -> &str {
        match self {
            ResourceSpec::Vpc(s) => &s.name,
            ResourceSpec::Subnet(s) => &s.name,
            ResourceSpec::InternetGateway(s) => &s.name,
            ResourceSpec::RouteTable(s) => &s.name,
            ResourceSpec::ElasticIp(s) => &s.name,
            ResourceSpec::NatGateway(s) => &s.name,
            ResourceSpec::SecurityGroup(s) => &s.name,
            ResourceSpec::KeyPair(s) => &s.name,
            ResourceSpec::Bucket(s) => &s.logical_name,
            ResourceSpec::IamRole(s) => &s.name,
            ResourceSpec::InstanceProfile(s) => &s.name,
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind(), self.logical_name())
    }

    pub fn tags(&self) -> &Tags {
        match self {
            ResourceSpec::Vpc(s) => &s.tags,
            ResourceSpec::Subnet(s) => &s.tags,
            ResourceSpec::InternetGateway(s) => &s.tags,
            ResourceSpec::RouteTable(s) => &s.tags,
            ResourceSpec::ElasticIp(s) => &s.tags,
            ResourceSpec::NatGateway(s) => &s.tags,
            ResourceSpec::SecurityGroup(s) => &s.tags,
            ResourceSpec::KeyPair(s) => &s.tags,
            ResourceSpec::Bucket(s) => &s.tags,
            ResourceSpec::IamRole(s) => &s.tags,
            ResourceSpec::InstanceProfile(s) => &s.tags,
        }
    }

    /// The identifying filter the Locator uses for this spec
    pub fn filter(&self) -> ResourceFilter {
        let kind = self.kind();
        match self {
            ResourceSpec::Vpc(s) => ResourceFilter::new(kind).with_tag(NAME_TAG, &s.name),
            ResourceSpec::InternetGateway(s) => {
                ResourceFilter::new(kind).with_tag(NAME_TAG, &s.name)
            }
            ResourceSpec::Subnet(s) => ResourceFilter::new(kind)
                .with_tag(NAME_TAG, &s.name)
                .in_vpc(&s.vpc_id),
            ResourceSpec::RouteTable(s) => ResourceFilter::new(kind)
                .with_tag(NAME_TAG, &s.name)
                .in_vpc(&s.vpc_id),
            ResourceSpec::ElasticIp(s) => ResourceFilter::new(kind).with_tag(NAME_TAG, &s.name),
            ResourceSpec::NatGateway(s) => ResourceFilter::new(kind)
                .with_tag(NAME_TAG, &s.name)
                .in_vpc(&s.vpc_id),
            ResourceSpec::SecurityGroup(s) => {
                ResourceFilter::new(kind).with_name(&s.name).in_vpc(&s.vpc_id)
            }
            ResourceSpec::KeyPair(s) => ResourceFilter::new(kind).with_name(&s.name),
            ResourceSpec::Bucket(s) if s.generated => {
                ResourceFilter::new(kind).with_tag(NAME_TAG, &s.logical_name)
            }
            ResourceSpec::Bucket(s) => ResourceFilter::new(kind).with_name(&s.bucket_name),
            ResourceSpec::IamRole(s) => ResourceFilter::new(kind).with_name(&s.name),
            ResourceSpec::InstanceProfile(s) => ResourceFilter::new(kind).with_name(&s.name),
        }
    }
}
