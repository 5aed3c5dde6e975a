use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::inventory::Inventory;
use crate::store::{DesiredState, DesiredStateStore};
use crate::types::{InstanceId, LiveInstance};
use crate::{Ec2Provider, Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between two refreshes of a pending instance.
    pub interval: Duration,
    /// Bound on the whole drain phase; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(DEFAULT_POLL_TIMEOUT),
        }
    }
}

impl PollConfig {
    /// Create from env vars:
    ///
    /// - `FLEET_POLL_INTERVAL_SECS` (default: 5)
    /// - `FLEET_POLL_TIMEOUT_SECS` (default: 600, `0` disables the bound)
    pub fn from_env() -> Self {
        let interval = env::var("FLEET_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        let timeout = match env::var("FLEET_POLL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_POLL_TIMEOUT),
        };

        Self { interval, timeout }
    }
}

/// Location of one record in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub stage: String,
    pub machine: String,
    pub id: InstanceId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<RecordRef>,
    /// Records whose id matched no live instance; left untouched.
    pub orphaned: Vec<RecordRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport {
    /// Final view of every instance in the drain snapshot.
    pub settled: Vec<LiveInstance>,
    pub merge: MergeReport,
}

/// Copy live network and placement attributes into every record whose id
/// matches an instance in `live`.
pub fn merge_live_attributes(state: &mut DesiredState, live: &[LiveInstance]) -> MergeReport {
    let by_id: HashMap<&InstanceId, &LiveInstance> = live.iter().map(|i| (&i.id, i)).collect();
    let mut report = MergeReport::default();

    for (stage, machine, record) in state.records_mut() {
        let Some(id) = record.recorded_id().cloned() else {
            continue;
        };
        let entry = RecordRef {
            stage: stage.to_string(),
            machine: machine.to_string(),
            id,
        };

        match by_id.get(&entry.id) {
            Some(instance) => {
                record.absorb(instance);
                report.merged.push(entry);
            }
            None => {
                debug!(stage, machine, instance_id = %entry.id, "no live instance for recorded id");
                report.orphaned.push(entry);
            }
        }
    }

    report
}

/// Waits for pending instances to settle, then writes their observed
/// attributes back into the desired state.
///
/// Instances are polled one after another; nothing runs in parallel.
pub struct ConvergencePoller<'a> {
    provider: &'a dyn Ec2Provider,
    store: &'a DesiredStateStore,
    config: PollConfig,
}

impl<'a> ConvergencePoller<'a> {
    pub fn new(provider: &'a dyn Ec2Provider, store: &'a DesiredStateStore, config: PollConfig) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Poll every instance visible now until none of them is pending.
    ///
    /// Instances launched after the snapshot are not waited for. Fails with
    /// [`Error::Timeout`] once `config.timeout` has elapsed.
    pub async fn drain_pending(&self) -> Result<Vec<LiveInstance>> {
        let started = Instant::now();
        let snapshot = Inventory::new(self.provider).list_instances().await?;
        let mut settled = Vec::with_capacity(snapshot.len());

        for mut instance in snapshot {
            while instance.state.is_pending() {
                if let Some(limit) = self.config.timeout
                    && started.elapsed() >= limit
                {
                    return Err(Error::Timeout {
                        resource: format!("instance {} to leave pending", instance.id),
                        elapsed: started.elapsed(),
                    });
                }

                debug!(instance_id = %instance.id, "instance still pending");
                tokio::time::sleep(self.config.interval).await;

                match self.provider.describe_instance(&instance.id).await? {
                    Some(refreshed) => instance = refreshed,
                    None => {
                        warn!(instance_id = %instance.id, "instance disappeared while pending");
                        break;
                    }
                }
            }

            info!(instance_id = %instance.id, state = %instance.state, "instance settled");
            settled.push(instance);
        }

        Ok(settled)
    }

    /// Drain pending instances, merge live attributes into every stage and
    /// save the document once.
    pub async fn converge(&self) -> Result<ConvergenceReport> {
        let settled = self.drain_pending().await?;

        let mut state = self.store.load()?;
        let live = Inventory::new(self.provider).list_instances().await?;
        let merge = merge_live_attributes(&mut state, &live);
        self.store.save(&mut state)?;

        info!(
            merged = merge.merged.len(),
            orphaned = merge.orphaned.len(),
            "live attributes merged into desired state"
        );
        Ok(ConvergenceReport { settled, merge })
    }
}
