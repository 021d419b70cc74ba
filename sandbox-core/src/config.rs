//! Deployment configuration
//!
//! A `DeployConfig` is plain data: it can be deserialized from a JSON file and
//! then overridden field by field by the CLI.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::IngressRule;
use crate::waiter::RetryPolicy;

pub const DEFAULT_REGION: &str = "eu-central-1";
pub const DEFAULT_PREFIX: &str = "pf1";
/// Ubuntu 20.04 LTS in eu-central-1; the bundled bootstrap script relies on apt
pub const DEFAULT_IMAGE_ID: &str = "ami-004e960cde33f9146";
pub const DEFAULT_INSTANCE_TYPE: &str = "t3.micro";

static BUCKET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").unwrap());
static PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,30}$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid CIDR block '{0}'")]
    InvalidCidr(String),

    #[error("Subnet {subnet} is not inside VPC {vpc}")]
    SubnetOutsideVpc { subnet: String, vpc: String },

    #[error("Subnets {0} and {1} overlap")]
    OverlappingSubnets(String, String),

    #[error("Invalid bucket name '{0}': use 3-63 lowercase letters, digits, '.' or '-'")]
    InvalidBucketName(String),

    #[error("Invalid prefix '{0}': use lowercase letters, digits and '-' (max 31)")]
    InvalidPrefix(String),

    #[error("Invalid ingress rule {0}")]
    InvalidIngress(String),

    #[error("iam_wait.max_attempts must be at least 1")]
    InvalidWaitPolicy,

    #[error("Unknown profile binding '{0}' (expected at-launch, associate or none)")]
    UnknownProfileBinding(String),

    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Bucket naming: generated from the prefix, or a caller-chosen name
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BucketName {
    /// `<prefix>-<8 hex>`; written as `""` or `"generate"`
    #[default]
    Generate,
    Named(String),
}

impl From<String> for BucketName {
    fn from(value: String) -> Self {
        match value.trim() {
            "" | "generate" => BucketName::Generate,
            name => BucketName::Named(name.to_string()),
        }
    }
}

impl From<BucketName> for String {
    fn from(value: BucketName) -> Self {
        match value {
            BucketName::Generate => String::new(),
            BucketName::Named(name) => name,
        }
    }
}

/// How the instance profile reaches the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileBinding {
    /// Passed in the launch request
    #[default]
    AtLaunch,
    /// Associated with the running instance afterwards
    Associate,
    /// No IAM resources at all
    None,
}

impl ProfileBinding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileBinding::AtLaunch => "at-launch",
            ProfileBinding::Associate => "associate",
            ProfileBinding::None => "none",
        }
    }

    pub fn uses_iam(&self) -> bool {
        *self != ProfileBinding::None
    }
}

impl FromStr for ProfileBinding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "at-launch" => Ok(ProfileBinding::AtLaunch),
            "associate" => Ok(ProfileBinding::Associate),
            "none" => Ok(ProfileBinding::None),
            other => Err(ConfigError::UnknownProfileBinding(other.to_string())),
        }
    }
}

impl fmt::Display for ProfileBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub region: String,
    pub prefix: String,
    pub vpc_cidr: String,
    pub public_subnet_cidr: String,
    /// `None` skips the private subnet
    pub private_subnet_cidr: Option<String>,
    /// NAT gateway and private route table for the private subnet
    pub nat_gateway: bool,
    pub availability_zone: Option<String>,
    pub bucket: BucketName,
    pub image_id: String,
    pub instance_type: String,
    /// Local private-key file; defaults to `<prefix>-ec2-key.pem`
    pub key_path: Option<PathBuf>,
    pub ingress: Vec<IngressRule>,
    pub profile_binding: ProfileBinding,
    pub iam_wait: RetryPolicy,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            vpc_cidr: "10.0.0.0/16".to_string(),
            public_subnet_cidr: "10.0.1.0/24".to_string(),
            private_subnet_cidr: Some("10.0.2.0/24".to_string()),
            nat_gateway: true,
            availability_zone: None,
            bucket: BucketName::Generate,
            image_id: DEFAULT_IMAGE_ID.to_string(),
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            key_path: None,
            ingress: default_ingress(),
            profile_binding: ProfileBinding::AtLaunch,
            iam_wait: RetryPolicy::iam_propagation(),
        }
    }
}

/// SSH, HTTP and HTTPS from anywhere
pub fn default_ingress() -> Vec<IngressRule> {
    vec![
        IngressRule::tcp(22, "SSH"),
        IngressRule::tcp(80, "HTTP"),
        IngressRule::tcp(443, "HTTPS"),
    ]
}

impl DeployConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Effective key file location
    pub fn key_path(&self) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}-ec2-key.pem", self.prefix)))
    }

    /// The NAT gateway only exists to serve the private subnet
    pub fn uses_nat_gateway(&self) -> bool {
        self.nat_gateway && self.private_subnet_cidr.is_some()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !PREFIX.is_match(&self.prefix) {
            return Err(ConfigError::InvalidPrefix(self.prefix.clone()));
        }

        let vpc: Cidr = self.vpc_cidr.parse()?;
        let public: Cidr = self.public_subnet_cidr.parse()?;
        if !vpc.contains(&public) {
            return Err(ConfigError::SubnetOutsideVpc {
                subnet: self.public_subnet_cidr.clone(),
                vpc: self.vpc_cidr.clone(),
            });
        }
        if let Some(ref private_cidr) = self.private_subnet_cidr {
            let private: Cidr = private_cidr.parse()?;
            if !vpc.contains(&private) {
                return Err(ConfigError::SubnetOutsideVpc {
                    subnet: private_cidr.clone(),
                    vpc: self.vpc_cidr.clone(),
                });
            }
            if public.overlaps(&private) {
                return Err(ConfigError::OverlappingSubnets(
                    self.public_subnet_cidr.clone(),
                    private_cidr.clone(),
                ));
            }
        }

        if let BucketName::Named(ref name) = self.bucket
            && (!BUCKET_NAME.is_match(name) || name.contains(".."))
        {
            return Err(ConfigError::InvalidBucketName(name.clone()));
        }

        for rule in &self.ingress {
            if rule.from_port > rule.to_port || rule.from_port < 0 || rule.to_port > 65535 {
                return Err(ConfigError::InvalidIngress(format!(
                    "{}-{}",
                    rule.from_port, rule.to_port
                )));
            }
            rule.cidr.parse::<Cidr>()?;
        }

        if self.iam_wait.max_attempts == 0 {
            return Err(ConfigError::InvalidWaitPolicy);
        }
        Ok(())
    }
}

/// IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: u32,
    prefix_len: u8,
}

impl Cidr {
    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        }
    }

    pub fn contains(&self, other: &Cidr) -> bool {
        other.prefix_len >= self.prefix_len && other.network & self.mask() == self.network
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl FromStr for Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidCidr(s.to_string());
        let (addr, len) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = len.parse().map_err(|_| invalid())?;
        if prefix_len > 32 {
            return Err(invalid());
        }
        let cidr = Cidr {
            network: u32::from(addr),
            prefix_len,
        };
        // Host bits must be zero
        if cidr.network & !cidr.mask() != 0 {
            return Err(invalid());
        }
        Ok(cidr)
    }
}
