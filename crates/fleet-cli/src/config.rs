use std::env;
use std::path::PathBuf;

use fleet_infra::ami::AmiBundle;
use fleet_infra::poller::PollConfig;
use fleet_infra::session::ProviderConfig;
use fleet_infra::{Error, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub state_file: PathBuf,
    pub poll: PollConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            provider: ProviderConfig::from_env()?,
            state_file: env::var("FLEET_STATE_FILE")
                .unwrap_or_else(|_| "fleet.json".into())
                .into(),
            poll: PollConfig::from_env(),
        })
    }

    /// Inputs for `save-ami`, read only when that command runs.
    pub fn ami_bundle(&self, name: &str, arch: &str) -> Result<AmiBundle> {
        Ok(AmiBundle {
            name: name.to_string(),
            region_id: self.provider.region_id.clone(),
            arch: arch.to_string(),
            account_id: required("AWS_ID")?,
            bucket: required("AWS_AMI_BUCKET")?,
            private_key: required("AWS_X509_PRIVATE_KEY")?.into(),
            certificate: required("AWS_X509_CERTIFICATE")?.into(),
            access_key: self.provider.credentials.access_key_id.clone(),
            secret_key: self.provider.credentials.secret_access_key.clone(),
        })
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Configuration(format!("{name} must be set")))
}
