//! Persisted desired state.
//!
//! The document is JSON keyed by region id at the top level. The active
//! region's section holds `machines`: stage name, then machine name, then a
//! [`MachineRecord`]. Sections for other regions and keys this crate does
//! not know about are carried through a rewrite untouched.
//!
//! Saves rewrite the whole document through a temp file and a rename, and
//! only after checking that the file still has the content it was loaded
//! from. A concurrent writer therefore causes [`Error::Conflict`] instead of
//! a silently lost update.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::types::{InstanceId, LiveInstance};
use crate::{Error, Result};

/// Address fields are single-element lists whose element may be `null`.
pub type AddressList = Vec<Option<String>>;

/// Machines of one stage, ordered by machine name.
pub type StageMachines = BTreeMap<String, MachineRecord>;

/// One desired machine.
///
/// Operators write the static fields (`image`, `size`, `placement`,
/// `server_type`); deployment adds `id`; convergence adds the observed
/// network fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<InstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<AddressList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_dns: Option<AddressList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<AddressList>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MachineRecord {
    /// The recorded instance id. An empty string counts as absent.
    pub fn recorded_id(&self) -> Option<&InstanceId> {
        self.id.as_ref().filter(|id| !id.0.is_empty())
    }

    /// Copy observed attributes of `live` into this record.
    ///
    /// `image` and `placement` are only overwritten when the provider reports
    /// a value; the address fields are always replaced by a one-element list.
    pub fn absorb(&mut self, live: &LiveInstance) {
        if let Some(image) = &live.image_id {
            self.image = Some(image.clone());
        }
        if let Some(placement) = &live.placement {
            self.placement = Some(placement.clone());
        }
        self.private_ip = Some(vec![live.private_ip_address.clone()]);
        self.private_dns = Some(vec![live.private_dns_name.clone()]);
        self.public_ip = Some(vec![live.dns_name.clone()]);
    }
}

/// The active region's section of the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSection {
    pub machines: BTreeMap<String, StageMachines>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Content hash of the bytes a [`DesiredState`] was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision(String);

impl Revision {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Loaded desired state for one region, plus the rest of the document.
#[derive(Debug, Clone)]
pub struct DesiredState {
    region_id: String,
    section: ProviderSection,
    document: Map<String, Value>,
    revision: Revision,
}

impl DesiredState {
    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn section(&self) -> &ProviderSection {
        &self.section
    }

    /// Key pair name recorded in the section, if any.
    pub fn key(&self) -> Option<&str> {
        self.section.key.as_deref()
    }

    pub fn stage(&self, stage: &str) -> Option<&StageMachines> {
        self.section.machines.get(stage)
    }

    pub fn stage_mut(&mut self, stage: &str) -> Option<&mut StageMachines> {
        self.section.machines.get_mut(stage)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.section.machines.keys().cloned().collect()
    }

    /// Machine names of `stage` in enumeration order; empty for an unknown stage.
    pub fn machine_names(&self, stage: &str) -> Vec<String> {
        self.stage(stage)
            .map(|machines| machines.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn machine(&self, stage: &str, name: &str) -> Option<&MachineRecord> {
        self.stage(stage)?.get(name)
    }

    pub fn machine_mut(&mut self, stage: &str, name: &str) -> Option<&mut MachineRecord> {
        self.stage_mut(stage)?.get_mut(name)
    }

    /// Every record of every stage as `(stage, machine name, record)`.
    pub fn records_mut(&mut self) -> impl Iterator<Item = (&str, &str, &mut MachineRecord)> {
        self.section.machines.iter_mut().flat_map(|(stage, machines)| {
            machines
                .iter_mut()
                .map(move |(name, record)| (stage.as_str(), name.as_str(), record))
        })
    }

    /// A stage-scoped block stored next to `machines` (e.g. `development.autoscale`).
    pub fn stage_block(&self, stage: &str, block: &str) -> Option<&Value> {
        self.section.extra.get(stage)?.get(block)
    }

    fn parse(region_id: &str, path: &Path, bytes: &[u8]) -> Result<Self> {
        let document: Map<String, Value> =
            serde_json::from_slice(bytes).map_err(|source| Error::Document {
                path: path.to_path_buf(),
                source,
            })?;

        let raw = document.get(region_id).ok_or_else(|| {
            Error::Configuration(format!(
                "{} has no section for region \"{region_id}\"",
                path.display()
            ))
        })?;
        if raw.get("machines").is_none() {
            return Err(Error::Configuration(format!(
                "section \"{region_id}\" of {} has no machines",
                path.display()
            )));
        }

        let section = ProviderSection::deserialize(raw).map_err(|source| Error::Document {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            region_id: region_id.to_string(),
            section,
            document,
            revision: Revision::of(bytes),
        })
    }

    fn render(&self) -> Result<Vec<u8>> {
        let mut document = self.document.clone();
        document.insert(self.region_id.clone(), serde_json::to_value(&self.section)?);

        let mut bytes = serde_json::to_vec_pretty(&Value::Object(document))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// File-backed store for the desired-state document of one region.
#[derive(Debug, Clone)]
pub struct DesiredStateStore {
    path: PathBuf,
    region_id: String,
}

impl DesiredStateStore {
    pub fn new(path: impl Into<PathBuf>, region_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            region_id: region_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn load(&self) -> Result<DesiredState> {
        let bytes = fs::read(&self.path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                Error::Configuration(format!(
                    "desired-state document {} does not exist",
                    self.path.display()
                ))
            } else {
                self.io_error(source)
            }
        })?;

        let state = DesiredState::parse(&self.region_id, &self.path, &bytes)?;
        debug!(path = %self.path.display(), revision = %state.revision.as_str(), "desired state loaded");
        Ok(state)
    }

    /// Rewrite the whole document with `state`.
    ///
    /// Fails with [`Error::Conflict`] and writes nothing if the file no longer
    /// matches the revision `state` was loaded from. On success the revision
    /// of `state` is advanced so it can be saved again.
    pub fn save(&self, state: &mut DesiredState) -> Result<()> {
        let on_disk = match fs::read(&self.path) {
            Ok(bytes) => Some(Revision::of(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(self.io_error(e)),
        };
        if on_disk.as_ref() != Some(&state.revision) {
            return Err(Error::Conflict(self.path.clone()));
        }

        let bytes = state.render()?;
        self.write_atomically(&bytes)?;
        state.revision = Revision::of(&bytes);

        info!(path = %self.path.display(), "desired state saved");
        Ok(())
    }

    fn write_atomically(&self, bytes: &[u8]) -> Result<()> {
        let mut tmp_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp).map_err(|source| Error::Io {
            path: tmp.clone(),
            source,
        })?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|source| Error::Io {
                path: tmp.clone(),
                source,
            })?;

        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::Io {
            path: self.path.clone(),
            source,
        }
    }
}
