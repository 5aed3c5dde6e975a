use serde::Deserialize;

// ── Shared ───────────────────────────────────────────────────────────

/// An EC2 `<somethingSet>` element: a list of `<item>` children.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tag {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// `<return>true</return>` acknowledgements; a missing flag reads as false.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AckResponse {
    #[serde(rename = "return", default)]
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ErrorResponse {
    #[serde(default)]
    pub errors: ErrorList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorList {
    #[serde(rename = "Error", default)]
    pub errors: Vec<ErrorItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ErrorItem {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
}

// ── Regions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DescribeRegionsResponse {
    #[serde(default)]
    pub region_info: ItemSet<RegionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionInfo {
    pub region_name: String,
    pub region_endpoint: String,
    #[serde(default)]
    pub opt_in_status: Option<String>,
}

// ── Instances ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DescribeInstancesResponse {
    #[serde(default)]
    pub reservation_set: ItemSet<Reservation>,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// A launch group. `RunInstances` answers with one of these at the root.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub reservation_id: String,
    #[serde(default)]
    pub instances_set: ItemSet<Instance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: String,
    #[serde(default)]
    pub image_id: Option<String>,
    pub instance_state: InstanceStateInfo,
    #[serde(default)]
    pub private_dns_name: Option<String>,
    #[serde(default)]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub launch_time: Option<String>,
    #[serde(default)]
    pub placement: Option<Placement>,
    #[serde(default)]
    pub private_ip_address: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub tag_set: ItemSet<Tag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceStateInfo {
    pub code: u32,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default)]
    pub availability_zone: Option<String>,
}

/// Parameters for launching instances.
#[derive(Debug, Clone)]
pub struct RunInstancesRequest {
    pub image_id: String,
    pub instance_type: String,
    pub min_count: u32,
    pub max_count: u32,
    pub key_name: Option<String>,
    pub availability_zone: Option<String>,
    pub security_groups: Vec<String>,
}

impl RunInstancesRequest {
    pub(crate) fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("ImageId".to_string(), self.image_id.clone()),
            ("InstanceType".to_string(), self.instance_type.clone()),
            ("MinCount".to_string(), self.min_count.to_string()),
            ("MaxCount".to_string(), self.max_count.to_string()),
        ];
        if let Some(key) = &self.key_name {
            params.push(("KeyName".into(), key.clone()));
        }
        if let Some(zone) = &self.availability_zone {
            params.push(("Placement.AvailabilityZone".into(), zone.clone()));
        }
        for (i, group) in self.security_groups.iter().enumerate() {
            params.push((format!("SecurityGroup.{}", i + 1), group.clone()));
        }
        params
    }
}

// ── Images ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DescribeImagesResponse {
    #[serde(default)]
    pub images_set: ItemSet<ImageInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub image_id: String,
    #[serde(default)]
    pub image_location: Option<String>,
    #[serde(default)]
    pub image_state: Option<String>,
    #[serde(default)]
    pub image_owner_id: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub image_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub root_device_type: Option<String>,
}

// ── Security groups ──────────────────────────────────────────────────

/// One ingress permission on a named security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRequest {
    pub group_name: String,
    pub ip_protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub cidr_ip: String,
}

impl IngressRequest {
    pub(crate) fn params(&self) -> Vec<(String, String)> {
        vec![
            ("GroupName".into(), self.group_name.clone()),
            ("IpPermissions.1.IpProtocol".into(), self.ip_protocol.clone()),
            ("IpPermissions.1.FromPort".into(), self.from_port.to_string()),
            ("IpPermissions.1.ToPort".into(), self.to_port.to_string()),
            ("IpPermissions.1.IpRanges.1.CidrIp".into(), self.cidr_ip.clone()),
        ]
    }
}

// ── Key pairs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub key_name: String,
    #[serde(default)]
    pub key_fingerprint: Option<String>,
    #[serde(default)]
    pub key_material: Option<String>,
}
