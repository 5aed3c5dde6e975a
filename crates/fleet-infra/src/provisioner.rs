use tracing::{error, info};

use crate::inventory::Inventory;
use crate::types::{LaunchSpec, LiveInstance};
use crate::{Ec2Provider, Error, Result};

pub const TAG_NAME: &str = "Name";
pub const TAG_SERVER_TYPE: &str = "Server Type";
pub const TAG_STAGE: &str = "Stage";

/// One instance to launch.
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'r> {
    pub name: &'r str,
    pub image_id: &'r str,
    pub instance_type: &'r str,
    pub placement: Option<&'r str>,
    pub server_type: Option<&'r str>,
    pub stage: &'r str,
}

/// Launches single instances. Every successful call creates exactly one
/// billable instance; callers are responsible for calling it at most once
/// per machine.
pub struct Provisioner<'a> {
    provider: &'a dyn Ec2Provider,
    key_name: Option<String>,
    security_groups: Vec<String>,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        provider: &'a dyn Ec2Provider,
        key_name: Option<String>,
        security_groups: Vec<String>,
    ) -> Self {
        Self {
            provider,
            key_name,
            security_groups,
        }
    }

    /// Resolve the image, launch one instance from it and tag it.
    ///
    /// The returned handle is normally still `pending`. A tagging failure
    /// after the launch is reported as [`Error::Untagged`], which carries the
    /// id of the instance that now exists.
    pub async fn provision(&self, req: &ProvisionRequest<'_>) -> Result<LiveInstance> {
        let image = Inventory::new(self.provider)
            .get_image(req.image_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("no image was found that matched id {}", req.image_id))
            })?;

        let mut instance = self
            .provider
            .run_instance(&LaunchSpec {
                image_id: image.id,
                instance_type: req.instance_type.to_string(),
                placement: req.placement.map(str::to_string),
                key_name: self.key_name.clone(),
                security_groups: self.security_groups.clone(),
            })
            .await?;

        let tags = [
            (TAG_NAME, req.name),
            (TAG_SERVER_TYPE, req.server_type.unwrap_or_default()),
            (TAG_STAGE, req.stage),
        ];
        if let Err(e) = self.provider.create_tags(&instance.id, &tags).await {
            error!(
                instance_id = %instance.id,
                machine = req.name,
                error = %e,
                "instance launched but could not be tagged"
            );
            return Err(Error::Untagged {
                instance: instance.id,
                source: Box::new(e),
            });
        }
        for (key, value) in tags {
            instance.tags.insert(key.to_string(), value.to_string());
        }

        info!(
            instance_id = %instance.id,
            machine = req.name,
            stage = req.stage,
            state = %instance.state,
            "instance provisioned"
        );
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockProvider;
    use crate::types::{InstanceId, InstanceState};

    fn request<'r>(image_id: &'r str) -> ProvisionRequest<'r> {
        ProvisionRequest {
            name: "web1",
            image_id,
            instance_type: "m1.small",
            placement: Some("us-east-1b"),
            server_type: Some("app"),
            stage: "development",
        }
    }

    #[tokio::test]
    async fn launches_one_tagged_pending_instance() {
        let provider = MockProvider::new().with_image("ami-42");
        let provisioner = Provisioner::new(&provider, Some("deploy".into()), vec!["web".into()]);

        let instance = provisioner.provision(&request("ami-42")).await.unwrap();

        assert_eq!(instance.state, InstanceState::Pending);
        assert_eq!(instance.name(), Some("web1"));

        let launches = provider.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(
            launches[0],
            LaunchSpec {
                image_id: "ami-42".into(),
                instance_type: "m1.small".into(),
                placement: Some("us-east-1b".into()),
                key_name: Some("deploy".into()),
                security_groups: vec!["web".into()],
            }
        );
        assert_eq!(
            provider.tags_for(&instance.id),
            vec![
                ("Name".to_string(), "web1".to_string()),
                ("Server Type".to_string(), "app".to_string()),
                ("Stage".to_string(), "development".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_image_is_not_found_and_launches_nothing() {
        let provider = MockProvider::new();
        let provisioner = Provisioner::new(&provider, None, Vec::new());

        let err = provisioner.provision(&request("ami-missing")).await.unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert!(provider.launches().is_empty());
    }

    #[tokio::test]
    async fn tagging_failure_still_reports_the_launched_instance() {
        let provider = MockProvider::new().with_image("ami-42");
        provider.fail_next_tagging("RequestLimitExceeded");
        let provisioner = Provisioner::new(&provider, None, Vec::new());

        let err = provisioner.provision(&request("ami-42")).await.unwrap_err();

        match &err {
            Error::Untagged { instance, .. } => assert_eq!(instance, &InstanceId::from("i-1")),
            other => panic!("expected Untagged, got {other:?}"),
        }
        assert_eq!(err.provider_code(), Some("RequestLimitExceeded"));
        assert_eq!(provider.launches().len(), 1);
        assert!(provider.tags_for(&InstanceId::from("i-1")).is_empty());
    }

    #[tokio::test]
    async fn missing_server_type_tags_an_empty_value() {
        let provider = MockProvider::new().with_image("ami-42");
        let provisioner = Provisioner::new(&provider, None, Vec::new());

        let mut req = request("ami-42");
        req.server_type = None;
        let instance = provisioner.provision(&req).await.unwrap();

        assert_eq!(instance.tags.get("Server Type").map(String::as_str), Some(""));
    }
}
