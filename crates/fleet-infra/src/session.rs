use std::env;
use std::sync::Arc;

use ec2_api::{Credentials, Ec2Client};
use tracing::info;

use crate::aws::AwsProvider;
use crate::types::Region;
use crate::{Ec2Provider, Error, Result};

/// Region used to discover the others when none has been resolved yet.
pub const BOOTSTRAP_REGION: &str = "us-east-1";

pub const DEFAULT_REGION: &str = "us-east-1";

/// Provider settings for one run. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub region_id: String,
    pub credentials: Credentials,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
}

impl ProviderConfig {
    /// Create from env vars:
    ///
    /// - `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` (required)
    /// - `FLEET_REGION` (default: `"us-east-1"`)
    /// - `FLEET_SECURITY_GROUPS` (comma-separated names, optional)
    /// - `FLEET_KEY_NAME` (optional)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let access_key = env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            Error::Configuration("must have AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY in env".into())
        })?;
        let secret_key = env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            Error::Configuration("must have AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY in env".into())
        })?;

        let region_id = env::var("FLEET_REGION").unwrap_or_else(|_| DEFAULT_REGION.into());

        let security_groups = split_list(&env::var("FLEET_SECURITY_GROUPS").unwrap_or_default());

        let key_name = env::var("FLEET_KEY_NAME")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            region_id,
            credentials: Credentials::new(access_key, secret_key),
            security_groups,
            key_name,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Pick the advertised region whose id equals `region_id`.
pub fn select_region(regions: Vec<Region>, region_id: &str) -> Result<Region> {
    regions
        .into_iter()
        .find(|r| r.id == region_id)
        .ok_or_else(|| Error::NotFound(format!("region \"{region_id}\"")))
}

/// Explicit provider handle shared by every component of a run.
#[derive(Clone)]
pub struct Session {
    config: ProviderConfig,
    provider: Arc<dyn Ec2Provider>,
}

impl Session {
    /// Resolve the configured region against the provider's region list and
    /// connect to its endpoint.
    pub async fn connect(config: ProviderConfig) -> Result<Self> {
        let bootstrap = AwsProvider::new(Ec2Client::new(
            config.credentials.clone(),
            BOOTSTRAP_REGION,
        )?);
        let region = select_region(bootstrap.list_regions().await?, &config.region_id)?;

        let client = Ec2Client::with_endpoint(
            config.credentials.clone(),
            region.id.clone(),
            &format!("https://{}/", region.endpoint),
        )?;

        info!(region = %region.id, endpoint = %region.endpoint, "ec2 session ready");

        Ok(Self {
            config,
            provider: Arc::new(AwsProvider::new(client)),
        })
    }

    /// Session over an already constructed provider.
    pub fn with_provider(config: ProviderConfig, provider: Arc<dyn Ec2Provider>) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn provider(&self) -> &dyn Ec2Provider {
        self.provider.as_ref()
    }
}
