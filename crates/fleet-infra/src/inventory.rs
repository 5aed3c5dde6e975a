use std::collections::BTreeMap;

use crate::sizes;
use crate::types::{Image, InstanceId, InstanceState, LiveInstance, Region, Size};
use crate::{Ec2Provider, Result};

/// Read-only view of what exists at the provider.
///
/// Provider failures propagate unchanged; nothing here retries. Lookups that
/// find nothing return `None` rather than an error.
pub struct Inventory<'a> {
    provider: &'a dyn Ec2Provider,
}

impl<'a> Inventory<'a> {
    pub fn new(provider: &'a dyn Ec2Provider) -> Self {
        Self { provider }
    }

    /// All instances across all reservations, in provider order.
    pub async fn list_instances(&self) -> Result<Vec<LiveInstance>> {
        self.provider.list_instances().await
    }

    /// First running instance whose `name` tag equals `name`.
    pub async fn get_instance(&self, name: &str) -> Result<Option<LiveInstance>> {
        Ok(self
            .list_instances()
            .await?
            .into_iter()
            .find(|i| i.name() == Some(name) && i.state == InstanceState::Running))
    }

    pub async fn name_index(&self) -> Result<NameIndex> {
        Ok(NameIndex::build(&self.list_instances().await?))
    }

    pub async fn list_images(&self, owners: &[String]) -> Result<Vec<Image>> {
        self.provider.list_images(owners).await
    }

    pub async fn get_image(&self, image_id: &str) -> Result<Option<Image>> {
        self.provider.get_image(image_id).await
    }

    /// Known instance types. Served from the local catalog, no API call.
    pub fn list_sizes(&self) -> &'static [Size] {
        sizes::CATALOG
    }

    pub fn get_size(&self, size_id: &str) -> Option<&'static Size> {
        sizes::find(size_id)
    }

    pub async fn list_regions(&self) -> Result<Vec<Region>> {
        self.provider.list_regions().await
    }

    pub async fn get_region(&self, region_id: &str) -> Result<Option<Region>> {
        Ok(self
            .list_regions()
            .await?
            .into_iter()
            .find(|r| r.id == region_id))
    }
}

/// Secondary index from `name` tag to instance ids.
///
/// Tags are mutable and not unique at the provider, so one name may map to
/// several instances (in any state) or to none.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    by_name: BTreeMap<String, Vec<InstanceId>>,
}

impl NameIndex {
    pub fn build(instances: &[LiveInstance]) -> Self {
        let mut by_name: BTreeMap<String, Vec<InstanceId>> = BTreeMap::new();
        for instance in instances {
            if let Some(name) = instance.name() {
                by_name
                    .entry(name.to_string())
                    .or_default()
                    .push(instance.id.clone());
            }
        }
        Self { by_name }
    }

    pub fn ids(&self, name: &str) -> &[InstanceId] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_ambiguous(&self, name: &str) -> bool {
        self.ids(name).len() > 1
    }
}
