//! Auto-scaling groups declared per stage.
//!
//! Only the interface and the orchestration live here; there is no
//! reconciliation beyond "skip groups that already exist".

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::store::DesiredState;
use crate::{Error, Result};

/// One `autoscale` entry of a stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AutoscaleSpec {
    pub image: String,
    #[serde(rename = "min-size")]
    pub min_size: u32,
    #[serde(rename = "max-size")]
    pub max_size: u32,
    #[serde(rename = "min-cpu", default)]
    pub min_cpu: Option<f64>,
    #[serde(rename = "max-cpu", default)]
    pub max_cpu: Option<f64>,
    #[serde(rename = "load-balancers", default)]
    pub load_balancers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchConfiguration {
    pub name: String,
    pub image_id: String,
    pub key_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoScalingGroup {
    pub name: String,
    pub launch_config: String,
    pub availability_zones: Vec<String>,
    pub load_balancers: Vec<String>,
    pub min_size: u32,
    pub max_size: u32,
}

/// CPU-driven scaling trigger for a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub name: String,
    pub group: String,
    pub measure_name: String,
    pub statistic: String,
    pub unit: String,
    pub dimensions: Vec<(String, String)>,
    pub period_secs: u32,
    pub breach_duration_secs: u32,
    pub lower_threshold: f64,
    pub upper_threshold: f64,
    pub lower_breach_scale_increment: i32,
    pub upper_breach_scale_increment: i32,
}

impl Trigger {
    fn cpu(group: &str, lower: f64, upper: f64) -> Self {
        Self {
            name: format!("{group}-trigger"),
            group: group.to_string(),
            measure_name: "CPUUtilization".into(),
            statistic: "Average".into(),
            unit: "Percent".into(),
            dimensions: vec![("AutoScalingGroupName".into(), group.to_string())],
            period_secs: 60,
            breach_duration_secs: 60,
            lower_threshold: lower,
            upper_threshold: upper,
            lower_breach_scale_increment: -1,
            upper_breach_scale_increment: 2,
        }
    }
}

/// Auto-scaling service calls.
#[async_trait]
pub trait AutoScaling: Send + Sync {
    async fn group_exists(&self, name: &str) -> Result<bool>;

    async fn create_launch_configuration(&self, config: &LaunchConfiguration) -> Result<()>;

    async fn create_group(&self, group: &AutoScalingGroup) -> Result<()>;

    async fn create_trigger(&self, trigger: &Trigger) -> Result<()>;
}

/// Parse the `autoscale` block of `stage`. A stage without one yields no entries.
pub fn autoscale_specs(state: &DesiredState, stage: &str) -> Result<BTreeMap<String, AutoscaleSpec>> {
    match state.stage_block(stage, "autoscale") {
        Some(block) => BTreeMap::<String, AutoscaleSpec>::deserialize(block).map_err(|e| {
            Error::Configuration(format!("invalid autoscale block for stage \"{stage}\": {e}"))
        }),
        None => Ok(BTreeMap::new()),
    }
}

/// Create every auto-scaling group declared for `stage` that does not exist yet.
///
/// Returns the names of the groups created.
pub async fn launch_auto_scaling(
    scaler: &dyn AutoScaling,
    state: &DesiredState,
    stage: &str,
    region_id: &str,
) -> Result<Vec<String>> {
    let mut created = Vec::new();

    for (name, spec) in autoscale_specs(state, stage)? {
        if scaler.group_exists(&name).await? {
            warn!(group = %name, "autoscale group {name} already exists");
            continue;
        }

        let launch_config = LaunchConfiguration {
            name: format!("{name}-launch-config"),
            image_id: spec.image.clone(),
            key_name: state.key().map(str::to_string),
        };
        scaler.create_launch_configuration(&launch_config).await?;

        scaler
            .create_group(&AutoScalingGroup {
                name: name.clone(),
                launch_config: launch_config.name.clone(),
                availability_zones: vec![region_id.to_string()],
                load_balancers: spec.load_balancers.clone(),
                min_size: spec.min_size,
                max_size: spec.max_size,
            })
            .await?;

        if let (Some(lower), Some(upper)) = (spec.min_cpu, spec.max_cpu) {
            scaler.create_trigger(&Trigger::cpu(&name, lower, upper)).await?;
        }

        info!(group = %name, stage, "autoscale group created");
        created.push(name);
    }

    Ok(created)
}
