use std::collections::{BTreeMap, HashSet};

use tracing::{error, info, warn};

use crate::inventory::Inventory;
use crate::provisioner::{ProvisionRequest, Provisioner};
use crate::sizes::{DEFAULT_PLACEMENT, DEFAULT_SIZE};
use crate::store::{DesiredState, DesiredStateStore};
use crate::types::{InstanceId, InstanceState};
use crate::{Ec2Provider, Error, Result};

/// Saves tried before a run gives up on a document that keeps changing.
const SAVE_ATTEMPTS: usize = 3;

/// Operator gate in front of costly actions.
pub trait Confirm: Send + Sync {
    /// Ask `prompt`; `Ok(false)` means no.
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Answers yes without asking (`--yes`).
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        info!(prompt, "confirmation assumed");
        Ok(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
    /// Treat recorded ids the provider no longer reports (or reports as
    /// terminated) as absent, and provision those machines again.
    pub verify_recorded_ids: bool,
}

/// What one deploy run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub stage: String,
    pub provisioned: Vec<(String, InstanceId)>,
    pub skipped: Vec<String>,
}

/// Creates the machines of a stage that have no recorded instance id.
pub struct FleetDeployer<'a> {
    provider: &'a dyn Ec2Provider,
    store: &'a DesiredStateStore,
    confirm: &'a dyn Confirm,
    options: DeployOptions,
}

impl<'a> FleetDeployer<'a> {
    pub fn new(
        provider: &'a dyn Ec2Provider,
        store: &'a DesiredStateStore,
        confirm: &'a dyn Confirm,
        options: DeployOptions,
    ) -> Self {
        Self {
            provider,
            store,
            confirm,
            options,
        }
    }

    /// Provision every machine of `stage` without an id, then save once.
    ///
    /// A machine with a recorded id is skipped; the id alone decides, unless
    /// `verify_recorded_ids` is set. If a launch fails part way, the ids
    /// obtained so far are saved before the error is returned. If the
    /// document changed on disk meanwhile, the new ids are merged into the
    /// newer version instead of being dropped.
    pub async fn deploy(&self, stage: &str) -> Result<DeployReport> {
        let mut state = self.store.load()?;
        if state.stage(stage).is_none() {
            return Err(Error::NotFound(format!("stage \"{stage}\" is not available")));
        }
        let loaded_ids = recorded_ids(&state, stage);
        let key_name = self
            .options
            .key_name
            .clone()
            .ok_or_else(|| Error::Configuration("must supply a valid key name".into()))?;

        if self.options.verify_recorded_ids {
            self.forget_vanished_ids(&mut state, stage).await?;
        }

        let names = state.machine_names(stage);
        let to_create: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|name| {
                state
                    .machine(stage, name)
                    .is_some_and(|record| record.recorded_id().is_none())
            })
            .collect();

        let mut report = DeployReport {
            stage: stage.to_string(),
            ..Default::default()
        };

        if to_create.is_empty() {
            for name in &names {
                warn!(stage, machine = %name, "{stage} machine {name} already exists");
                report.skipped.push(name.clone());
            }
            return Ok(report);
        }

        let prompt = format!(
            "Do you wish to stage {stage} servers with the following names: {}?",
            to_create.join(", ")
        );
        if !self.confirm.confirm(&prompt)? {
            return Err(Error::AbortedByOperator("instance deployment declined".into()));
        }

        let name_index = Inventory::new(self.provider).name_index().await?;
        let provisioner = Provisioner::new(
            self.provider,
            Some(key_name),
            self.options.security_groups.clone(),
        );

        for name in &names {
            let Some(record) = state.machine(stage, name).cloned() else {
                continue;
            };

            if let Some(id) = record.recorded_id() {
                warn!(stage, machine = %name, instance_id = %id, "{stage} machine {name} already exists");
                report.skipped.push(name.clone());
                continue;
            }

            let live_holders = name_index.ids(name);
            if name_index.is_ambiguous(name) {
                warn!(
                    stage,
                    machine = %name,
                    instances = ?live_holders,
                    "several live instances already carry this name; provisioning another"
                );
            } else if !live_holders.is_empty() {
                warn!(
                    stage,
                    machine = %name,
                    instances = ?live_holders,
                    "live instances already carry this name; provisioning a new one"
                );
            }

            let launched = match record.image.as_deref() {
                Some(image_id) => {
                    provisioner
                        .provision(&ProvisionRequest {
                            name,
                            image_id,
                            instance_type: record.size.as_deref().unwrap_or(DEFAULT_SIZE),
                            placement: Some(record.placement.as_deref().unwrap_or(DEFAULT_PLACEMENT)),
                            server_type: record.server_type.as_deref(),
                            stage,
                        })
                        .await
                }
                None => Err(Error::NotFound(format!("{stage} machine {name} has no image"))),
            };

            match launched {
                Ok(instance) => {
                    if let Some(record) = state.machine_mut(stage, name) {
                        record.id = Some(instance.id.clone());
                    }
                    report.provisioned.push((name.clone(), instance.id));
                }
                Err(e) => {
                    if let Error::Untagged { instance, .. } = &e {
                        if let Some(record) = state.machine_mut(stage, name) {
                            record.id = Some(instance.clone());
                        }
                        report.provisioned.push((name.clone(), instance.clone()));
                    }
                    self.save_partial(&mut state, &report, &loaded_ids);
                    return Err(e);
                }
            }
        }

        self.persist(&mut state, &report, &loaded_ids)?;
        info!(
            stage,
            provisioned = report.provisioned.len(),
            skipped = report.skipped.len(),
            "deploy finished"
        );
        Ok(report)
    }

    /// Clear recorded ids in `stage` that the provider does not know or
    /// reports as terminated.
    async fn forget_vanished_ids(&self, state: &mut DesiredState, stage: &str) -> Result<()> {
        let live: HashSet<InstanceId> = Inventory::new(self.provider)
            .list_instances()
            .await?
            .into_iter()
            .filter(|i| !matches!(i.state, InstanceState::Terminated | InstanceState::ShuttingDown))
            .map(|i| i.id)
            .collect();

        if let Some(machines) = state.stage_mut(stage) {
            for (name, record) in machines.iter_mut() {
                if let Some(id) = record.recorded_id()
                    && !live.contains(id)
                {
                    warn!(stage, machine = %name, instance_id = %id, "recorded instance is gone, will provision again");
                    record.id = None;
                }
            }
        }
        Ok(())
    }

    /// Save `state`; on a concurrent change, reload and merge this run's
    /// ids into the newer document, then try again.
    fn persist(
        &self,
        state: &mut DesiredState,
        report: &DeployReport,
        loaded_ids: &BTreeMap<String, Option<InstanceId>>,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.save(state) {
                Err(Error::Conflict(path)) if attempt < SAVE_ATTEMPTS => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        "desired state changed on disk during deploy; merging into the newer version"
                    );
                    let mut newer = self.store.load()?;
                    merge_provisioned(&mut newer, report, loaded_ids);
                    *state = newer;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn save_partial(
        &self,
        state: &mut DesiredState,
        report: &DeployReport,
        loaded_ids: &BTreeMap<String, Option<InstanceId>>,
    ) {
        if report.provisioned.is_empty() {
            return;
        }
        match self.persist(state, report, loaded_ids) {
            Ok(()) => warn!(
                stage = %report.stage,
                provisioned = report.provisioned.len(),
                "deploy failed part way; saved the instances created so far"
            ),
            Err(e) => error!(
                stage = %report.stage,
                instances = ?report.provisioned,
                error = %e,
                "deploy failed part way and the created instances could not be recorded"
            ),
        }
    }
}

fn recorded_ids(state: &DesiredState, stage: &str) -> BTreeMap<String, Option<InstanceId>> {
    state
        .machine_names(stage)
        .into_iter()
        .map(|name| {
            let id = state.machine(stage, &name).and_then(|r| r.recorded_id().cloned());
            (name, id)
        })
        .collect()
}

/// Record this run's ids in a document reloaded after a concurrent change.
///
/// An id is written where the record still holds what this run loaded; a
/// record that another writer changed keeps the other writer's value.
fn merge_provisioned(
    state: &mut DesiredState,
    report: &DeployReport,
    loaded_ids: &BTreeMap<String, Option<InstanceId>>,
) {
    let stage = report.stage.as_str();
    for (name, id) in &report.provisioned {
        let Some(record) = state.machine_mut(stage, name) else {
            error!(
                stage,
                machine = %name,
                instance_id = %id,
                "machine was removed while its instance launched; not recorded"
            );
            continue;
        };
        let current = record.recorded_id().cloned();
        let loaded = loaded_ids.get(name).cloned().flatten();
        if current.is_none() || current == loaded {
            record.id = Some(id.clone());
        } else if current.as_ref() != Some(id) {
            error!(
                stage,
                machine = %name,
                instance_id = %id,
                recorded = ?current,
                "another writer recorded a different instance for this machine; keeping theirs"
            );
        }
    }
}
