pub mod ami;
pub mod autoscale;
pub mod aws;
pub mod deployer;
pub mod inventory;
pub mod keys;
pub mod poller;
pub mod provisioner;
pub mod security;
pub mod session;
pub mod sizes;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use types::{Image, IngressRule, InstanceId, KeyPairMaterial, LaunchSpec, LiveInstance, Region};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ec2 provider error: {0}")]
    Ec2(#[from] ec2_api::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("aborted by operator: {0}")]
    AbortedByOperator(String),

    #[error("timed out after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    #[error("desired-state document {0} changed on disk since it was loaded")]
    Conflict(PathBuf),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed desired-state document {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),

    #[error("remote command failed: {0}")]
    Remote(String),

    /// The instance exists at the provider but its tags were not applied.
    #[error("instance {instance} launched but could not be tagged: {source}")]
    Untagged {
        instance: InstanceId,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// AWS error code of an underlying provider failure, if any.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Self::Ec2(e) => e.code(),
            Self::Untagged { source, .. } => source.provider_code(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Provider operations the reconciliation core depends on.
///
/// `AwsProvider` implements this over the EC2 Query API; tests use
/// `test_utils::MockProvider`. Every call is a single round trip with no
/// retries.
#[async_trait]
pub trait Ec2Provider: Send + Sync + 'static {
    /// Every instance across every reservation visible to the account.
    async fn list_instances(&self) -> Result<Vec<LiveInstance>>;

    /// Fresh view of one instance; `None` once the provider no longer reports it.
    async fn describe_instance(&self, id: &InstanceId) -> Result<Option<LiveInstance>>;

    /// Images owned by any of `owners` (`"self"`, `"amazon"`, an account id).
    async fn list_images(&self, owners: &[String]) -> Result<Vec<Image>>;

    /// One image by id; `None` if the provider does not recognize it.
    async fn get_image(&self, image_id: &str) -> Result<Option<Image>>;

    async fn list_regions(&self) -> Result<Vec<Region>>;

    /// Launch exactly one instance.
    async fn run_instance(&self, spec: &LaunchSpec) -> Result<LiveInstance>;

    async fn create_tags(&self, id: &InstanceId, tags: &[(&str, &str)]) -> Result<()>;

    /// Add one ingress rule. Duplicate rules surface as a provider error
    /// with code `InvalidPermission.Duplicate`.
    async fn authorize_ingress(&self, rule: &IngressRule) -> Result<()>;

    async fn create_key_pair(&self, key_name: &str) -> Result<KeyPairMaterial>;

    /// Region this provider handle talks to.
    fn region(&self) -> &str;
}
