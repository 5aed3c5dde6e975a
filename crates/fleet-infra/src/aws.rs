use async_trait::async_trait;
use ec2_api::{Ec2Client, IngressRequest, RunInstancesRequest};
use tracing::info;

use crate::types::{
    Image, IngressRule, InstanceId, InstanceState, KeyPairMaterial, LaunchSpec, LiveInstance,
    Region,
};
use crate::{Ec2Provider, Error, Result};

/// EC2 provider backed by `ec2_api::Ec2Client`.
pub struct AwsProvider {
    client: Ec2Client,
}

impl AwsProvider {
    pub fn new(client: Ec2Client) -> Self {
        Self { client }
    }

    fn live_instance(instance: ec2_api::Instance) -> LiveInstance {
        LiveInstance {
            id: InstanceId(instance.instance_id),
            state: InstanceState::parse(&instance.instance_state.name),
            image_id: non_empty(instance.image_id),
            instance_type: non_empty(instance.instance_type),
            placement: non_empty(instance.placement.and_then(|p| p.availability_zone)),
            private_ip_address: non_empty(instance.private_ip_address),
            private_dns_name: non_empty(instance.private_dns_name),
            dns_name: non_empty(instance.dns_name),
            ip_address: non_empty(instance.ip_address),
            launch_time: non_empty(instance.launch_time),
            tags: instance
                .tag_set
                .items
                .into_iter()
                .map(|tag| (tag.key, tag.value.unwrap_or_default()))
                .collect(),
        }
    }

    fn image(image: ec2_api::ImageInfo) -> Image {
        Image {
            id: image.image_id,
            name: non_empty(image.name),
            location: non_empty(image.image_location),
            state: non_empty(image.image_state),
            owner_id: non_empty(image.image_owner_id),
            is_public: image.is_public,
            architecture: non_empty(image.architecture),
            description: non_empty(image.description),
        }
    }

    fn has_code_prefix(err: &ec2_api::Error, prefix: &str) -> bool {
        err.code().is_some_and(|code| code.starts_with(prefix))
    }
}

/// EC2 renders absent values as empty elements.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

#[async_trait]
impl Ec2Provider for AwsProvider {
    async fn list_instances(&self) -> Result<Vec<LiveInstance>> {
        let reservations = self.client.describe_instances(&[]).await?;
        Ok(reservations
            .into_iter()
            .flat_map(|r| r.instances_set.items)
            .map(Self::live_instance)
            .collect())
    }

    async fn describe_instance(&self, id: &InstanceId) -> Result<Option<LiveInstance>> {
        match self.client.describe_instances(&[id.as_str()]).await {
            Ok(reservations) => Ok(reservations
                .into_iter()
                .flat_map(|r| r.instances_set.items)
                .map(Self::live_instance)
                .find(|i| i.id == *id)),
            Err(e) if Self::has_code_prefix(&e, "InvalidInstanceID.") => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_images(&self, owners: &[String]) -> Result<Vec<Image>> {
        let owners: Vec<&str> = owners.iter().map(String::as_str).collect();
        let images = self.client.describe_images(&[], &owners).await?;
        Ok(images.into_iter().map(Self::image).collect())
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<Image>> {
        match self.client.describe_images(&[image_id], &[]).await {
            Ok(images) => Ok(images.into_iter().next().map(Self::image)),
            Err(e) if Self::has_code_prefix(&e, "InvalidAMIID.") => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_regions(&self) -> Result<Vec<Region>> {
        let regions = self.client.describe_regions().await?;
        Ok(regions
            .into_iter()
            .map(|r| Region {
                id: r.region_name,
                endpoint: r.region_endpoint,
            })
            .collect())
    }

    async fn run_instance(&self, spec: &LaunchSpec) -> Result<LiveInstance> {
        let reservation = self
            .client
            .run_instances(&RunInstancesRequest {
                image_id: spec.image_id.clone(),
                instance_type: spec.instance_type.clone(),
                min_count: 1,
                max_count: 1,
                key_name: spec.key_name.clone(),
                availability_zone: spec.placement.clone(),
                security_groups: spec.security_groups.clone(),
            })
            .await?;

        let instance = reservation
            .instances_set
            .items
            .into_iter()
            .next()
            .map(Self::live_instance)
            .ok_or_else(|| {
                Error::InvalidResponse(format!(
                    "reservation {} contains no instance",
                    reservation.reservation_id
                ))
            })?;

        info!(instance_id = %instance.id, state = %instance.state, "ec2: instance launched");
        Ok(instance)
    }

    async fn create_tags(&self, id: &InstanceId, tags: &[(&str, &str)]) -> Result<()> {
        self.client.create_tags(&[id.as_str()], tags).await?;
        Ok(())
    }

    async fn authorize_ingress(&self, rule: &IngressRule) -> Result<()> {
        self.client
            .authorize_security_group_ingress(&IngressRequest {
                group_name: rule.group.clone(),
                ip_protocol: rule.protocol.as_str().into(),
                from_port: i32::from(rule.port),
                to_port: i32::from(rule.port),
                cidr_ip: rule.cidr.clone(),
            })
            .await?;
        Ok(())
    }

    async fn create_key_pair(&self, key_name: &str) -> Result<KeyPairMaterial> {
        let key = self.client.create_key_pair(key_name).await?;
        Ok(KeyPairMaterial {
            name: key.key_name,
            fingerprint: non_empty(key.key_fingerprint),
            material: non_empty(key.key_material),
        })
    }

    fn region(&self) -> &str {
        self.client.region()
    }
}

#[cfg(test)]
mod tests {
    use ec2_api::{InstanceStateInfo, ItemSet, Placement, Tag};

    use super::*;

    #[test]
    fn converts_wire_instances_and_drops_empty_fields() {
        let wire = ec2_api::Instance {
            instance_id: "i-123".into(),
            image_id: Some("ami-1".into()),
            instance_state: InstanceStateInfo {
                code: 0,
                name: "pending".into(),
            },
            private_dns_name: Some(String::new()),
            dns_name: None,
            key_name: None,
            instance_type: Some("m1.small".into()),
            launch_time: None,
            placement: Some(Placement {
                availability_zone: Some("us-east-1b".into()),
            }),
            private_ip_address: Some("10.0.0.5".into()),
            ip_address: None,
            tag_set: ItemSet {
                items: vec![Tag {
                    key: "Name".into(),
                    value: Some("web1".into()),
                }],
            },
        };

        let live = AwsProvider::live_instance(wire);
        assert_eq!(live.id, InstanceId::from("i-123"));
        assert!(live.state.is_pending());
        assert_eq!(live.placement.as_deref(), Some("us-east-1b"));
        assert_eq!(live.private_dns_name, None);
        assert_eq!(live.name(), Some("web1"));
    }
}
