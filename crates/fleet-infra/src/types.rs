use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Provider-assigned instance identifier (`i-0abc...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Provider-reported instance lifecycle state.
///
/// Convergence only cares about `Pending` versus everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    /// Parse an EC2 state name. Unrecognized names map to `Unknown`.
    pub fn parse(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instance as the provider currently reports it. Read-only to the core
/// apart from tagging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveInstance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    pub placement: Option<String>,
    pub private_ip_address: Option<String>,
    pub private_dns_name: Option<String>,
    pub dns_name: Option<String>,
    pub ip_address: Option<String>,
    pub launch_time: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl LiveInstance {
    /// Value of the `name` tag, matching the key case-insensitively so that
    /// both `Name` (set at launch) and `name` are honoured.
    pub fn name(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("name"))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Image {
    pub id: String,
    pub name: Option<String>,
    pub location: Option<String>,
    pub state: Option<String>,
    pub owner_id: Option<String>,
    pub is_public: Option<bool>,
    pub architecture: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub id: String,
    pub endpoint: String,
}

/// Entry of the static instance-type catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Size {
    pub id: &'static str,
    pub name: &'static str,
    pub ram_mb: u32,
    pub disk_gb: u32,
}

/// Everything needed to launch one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub placement: Option<String>,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
}

/// Private key returned by key-pair creation.
#[derive(Debug, Clone)]
pub struct KeyPairMaterial {
    pub name: String,
    pub fingerprint: Option<String>,
    pub material: Option<String>,
}

/// IP protocols a port rule may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            other => Err(Error::Validation(format!(
                "protocol must be one of tcp, udp or icmp, got \"{other}\""
            ))),
        }
    }
}

/// A single-port ingress rule on a named security group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngressRule {
    pub group: String,
    pub protocol: Protocol,
    pub port: u16,
    pub cidr: String,
}
