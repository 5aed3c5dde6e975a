//! Typed Rust client for the Amazon EC2 Query API.
//!
//! Covers the subset needed for fleet reconciliation:
//! regions, instances (describe, run, tag), images, security-group
//! ingress and key pairs. Requests are SigV4-signed form POSTs and
//! responses are XML.

mod sign;
mod types;

pub use types::*;

use chrono::Utc;
use serde::de::DeserializeOwned;

pub const API_VERSION: &str = "2016-11-15";

const SERVICE: &str = "ec2";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ec2 api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ec2 api {action} returned {status}: {code}: {message}")]
    Api {
        action: &'static str,
        status: u16,
        code: String,
        message: String,
    },

    #[error("ec2 api {action} returned an unreadable body: {source}")]
    Decode {
        action: &'static str,
        #[source]
        source: quick_xml::DeError,
    },

    #[error("invalid ec2 endpoint: {0}")]
    InvalidEndpoint(String),

    /// A 200 answer whose `<return>` was not `true`.
    #[error("ec2 api {action} did not accept the request")]
    Rejected { action: &'static str },
}

impl Error {
    /// The AWS error code (`InvalidPermission.Duplicate`, ...) for API errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Access key pair used to sign every request.
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Client for the EC2 Query API of a single region.
#[derive(Clone)]
pub struct Ec2Client {
    credentials: Credentials,
    region: String,
    endpoint: reqwest::Url,
    host: String,
    http: reqwest::Client,
}

impl Ec2Client {
    /// Client for the public regional endpoint `ec2.<region>.amazonaws.com`.
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Result<Self> {
        let region = region.into();
        let endpoint = format!("https://ec2.{region}.amazonaws.com/");
        Self::with_endpoint(credentials, region, &endpoint)
    }

    /// Client against an explicit endpoint URL (regional endpoint, proxy or test server).
    pub fn with_endpoint(
        credentials: Credentials,
        region: impl Into<String>,
        endpoint: &str,
    ) -> Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        let host_str = endpoint
            .host_str()
            .ok_or_else(|| Error::InvalidEndpoint(endpoint.to_string()))?;
        let host = match endpoint.port() {
            Some(port) => format!("{host_str}:{port}"),
            None => host_str.to_string(),
        };

        Ok(Self {
            credentials,
            region: region.into(),
            endpoint,
            host,
            http: reqwest::Client::new(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    fn encode_form(action: &str, params: &[(String, String)]) -> String {
        let mut body = format!("Action={action}&Version={API_VERSION}");
        for (key, value) in params {
            body.push('&');
            body.push_str(&urlencoding::encode(key));
            body.push('=');
            body.push_str(&urlencoding::encode(value));
        }
        body
    }

    fn api_error(action: &'static str, status: u16, body: &str) -> Error {
        let first = quick_xml::de::from_str::<ErrorResponse>(body)
            .ok()
            .and_then(|r| r.errors.errors.into_iter().next());

        match first {
            Some(item) => Error::Api {
                action,
                status,
                code: item.code,
                message: item.message.unwrap_or_default(),
            },
            None => Error::Api {
                action,
                status,
                code: "Unknown".into(),
                message: body.to_string(),
            },
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &'static str,
        params: &[(String, String)],
    ) -> Result<T> {
        let body = Self::encode_form(action, params);
        let signature = sign::sign(
            &self.credentials,
            &self.region,
            SERVICE,
            &self.host,
            &body,
            Utc::now(),
        );

        tracing::debug!(action, region = %self.region, "ec2 api call");

        let resp = self
            .http
            .post(self.endpoint.clone())
            .header("content-type", sign::CONTENT_TYPE)
            .header("x-amz-date", signature.amz_date)
            .header("authorization", signature.authorization)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Self::api_error(action, status.as_u16(), &text));
        }

        quick_xml::de::from_str(&text).map_err(|source| Error::Decode { action, source })
    }

    /// Calls answered with a bare `<return>` flag.
    async fn acknowledged(&self, action: &'static str, params: &[(String, String)]) -> Result<()> {
        let ack: AckResponse = self.call(action, params).await?;
        if !ack.accepted {
            return Err(Error::Rejected { action });
        }
        Ok(())
    }

    // ── Regions ─────────────────────────────────────────────────────

    pub async fn describe_regions(&self) -> Result<Vec<RegionInfo>> {
        let resp: DescribeRegionsResponse = self.call("DescribeRegions", &[]).await?;
        Ok(resp.region_info.items)
    }

    // ── Instances ───────────────────────────────────────────────────

    /// Describe instances, following `nextToken` until exhausted.
    ///
    /// An empty `instance_ids` describes every instance visible to the account.
    pub async fn describe_instances(&self, instance_ids: &[&str]) -> Result<Vec<Reservation>> {
        let mut reservations = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut params: Vec<(String, String)> = instance_ids
                .iter()
                .enumerate()
                .map(|(i, id)| (format!("InstanceId.{}", i + 1), id.to_string()))
                .collect();
            if let Some(token) = &next_token {
                params.push(("NextToken".into(), token.clone()));
            }

            let resp: DescribeInstancesResponse =
                self.call("DescribeInstances", &params).await?;
            reservations.extend(resp.reservation_set.items);

            match resp.next_token.filter(|t| !t.is_empty()) {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        Ok(reservations)
    }

    pub async fn run_instances(&self, req: &RunInstancesRequest) -> Result<Reservation> {
        self.call("RunInstances", &req.params()).await
    }

    pub async fn create_tags(&self, resource_ids: &[&str], tags: &[(&str, &str)]) -> Result<()> {
        let mut params: Vec<(String, String)> = resource_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (format!("ResourceId.{}", i + 1), id.to_string()))
            .collect();
        for (i, (key, value)) in tags.iter().enumerate() {
            params.push((format!("Tag.{}.Key", i + 1), key.to_string()));
            params.push((format!("Tag.{}.Value", i + 1), value.to_string()));
        }

        self.acknowledged("CreateTags", &params).await
    }

    // ── Images ──────────────────────────────────────────────────────

    pub async fn describe_images(&self, image_ids: &[&str], owners: &[&str]) -> Result<Vec<ImageInfo>> {
        let mut params: Vec<(String, String)> = image_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (format!("ImageId.{}", i + 1), id.to_string()))
            .collect();
        for (i, owner) in owners.iter().enumerate() {
            params.push((format!("Owner.{}", i + 1), owner.to_string()));
        }

        let resp: DescribeImagesResponse = self.call("DescribeImages", &params).await?;
        Ok(resp.images_set.items)
    }

    // ── Security groups ─────────────────────────────────────────────

    pub async fn authorize_security_group_ingress(&self, req: &IngressRequest) -> Result<()> {
        self.acknowledged("AuthorizeSecurityGroupIngress", &req.params())
            .await
    }

    // ── Key pairs ───────────────────────────────────────────────────

    pub async fn create_key_pair(&self, key_name: &str) -> Result<KeyPair> {
        self.call("CreateKeyPair", &[("KeyName".into(), key_name.into())])
            .await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const INSTANCES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <requestId>8f7724cf-496f-496e-8fe3-example</requestId>
  <reservationSet>
    <item>
      <reservationId>r-1234567890abcdef0</reservationId>
      <instancesSet>
        <item>
          <instanceId>i-123</instanceId>
          <imageId>ami-1</imageId>
          <instanceState><code>16</code><name>running</name></instanceState>
          <privateDnsName>ip-10-0-0-5.ec2.internal</privateDnsName>
          <dnsName>ec2-54-1-2-3.compute-1.amazonaws.com</dnsName>
          <instanceType>m1.small</instanceType>
          <placement><availabilityZone>us-east-1b</availabilityZone></placement>
          <privateIpAddress>10.0.0.5</privateIpAddress>
          <tagSet>
            <item><key>Name</key><value>web1</value></item>
          </tagSet>
        </item>
        <item>
          <instanceId>i-456</instanceId>
          <instanceState><code>0</code><name>pending</name></instanceState>
          <dnsName/>
        </item>
      </instancesSet>
    </item>
  </reservationSet>
</DescribeInstancesResponse>"#;

    async fn client(server: &MockServer) -> Ec2Client {
        Ec2Client::with_endpoint(
            Credentials::new("AKIDEXAMPLE", "secret"),
            "us-east-1",
            &format!("{}/", server.uri()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn describe_instances_parses_reservations() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("Action=DescribeInstances"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-date"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INSTANCES_XML))
            .mount(&server)
            .await;

        let reservations = client(&server).await.describe_instances(&[]).await.unwrap();
        assert_eq!(reservations.len(), 1);

        let instances = &reservations[0].instances_set.items;
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].instance_id, "i-123");
        assert_eq!(instances[0].instance_state.name, "running");
        assert_eq!(instances[0].private_ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(
            instances[0].placement.as_ref().and_then(|p| p.availability_zone.as_deref()),
            Some("us-east-1b")
        );
        assert_eq!(instances[0].tag_set.items[0].key, "Name");
        assert_eq!(instances[1].instance_state.name, "pending");
        assert!(instances[1].tag_set.items.is_empty());
    }

    #[tokio::test]
    async fn api_errors_carry_the_aws_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=AuthorizeSecurityGroupIngress"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<Response><Errors><Error><Code>InvalidPermission.Duplicate</Code><Message>the specified rule already exists</Message></Error></Errors><RequestID>abc</RequestID></Response>"#,
            ))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .authorize_security_group_ingress(&IngressRequest {
                group_name: "default".into(),
                ip_protocol: "tcp".into(),
                from_port: 443,
                to_port: 443,
                cidr_ip: "0.0.0.0/0".into(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some("InvalidPermission.Duplicate"));
        assert!(matches!(err, Error::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn run_instances_sends_launch_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=RunInstances"))
            .and(body_string_contains("ImageId=ami-42"))
            .and(body_string_contains("Placement.AvailabilityZone=us-east-1b"))
            .and(body_string_contains("SecurityGroup.1=web"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<RunInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <requestId>req</requestId>
  <reservationId>r-1</reservationId>
  <instancesSet>
    <item>
      <instanceId>i-1</instanceId>
      <imageId>ami-42</imageId>
      <instanceState><code>0</code><name>pending</name></instanceState>
    </item>
  </instancesSet>
</RunInstancesResponse>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let reservation = client(&server)
            .await
            .run_instances(&RunInstancesRequest {
                image_id: "ami-42".into(),
                instance_type: "m1.small".into(),
                min_count: 1,
                max_count: 1,
                key_name: Some("deploy".into()),
                availability_zone: Some("us-east-1b".into()),
                security_groups: vec!["web".into()],
            })
            .await
            .unwrap();

        assert_eq!(reservation.instances_set.items[0].instance_id, "i-1");
    }

    #[tokio::test]
    async fn create_tags_requires_a_true_return() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=CreateTags"))
            .and(body_string_contains("ResourceId.1=i-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<CreateTagsResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <requestId>req</requestId>
  <return>false</return>
</CreateTagsResponse>"#,
            ))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .create_tags(&["i-1"], &[("Name", "web1")])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected { action: "CreateTags" }));
        assert_eq!(err.code(), None);
    }

    #[tokio::test]
    async fn ingress_accepted_with_a_true_return() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=AuthorizeSecurityGroupIngress"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<AuthorizeSecurityGroupIngressResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <requestId>req</requestId>
  <return>true</return>
</AuthorizeSecurityGroupIngressResponse>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .authorize_security_group_ingress(&IngressRequest {
                group_name: "web".into(),
                ip_protocol: "tcp".into(),
                from_port: 80,
                to_port: 80,
                cidr_ip: "0.0.0.0/0".into(),
            })
            .await
            .unwrap();
    }

    #[test]
    fn form_values_are_percent_encoded() {
        let body = Ec2Client::encode_form(
            "CreateTags",
            &[("Tag.1.Key".into(), "Server Type".into())],
        );
        assert_eq!(
            body,
            "Action=CreateTags&Version=2016-11-15&Tag.1.Key=Server%20Type"
        );
    }

    #[test]
    fn unparseable_error_bodies_keep_the_raw_text() {
        let err = Ec2Client::api_error("DescribeRegions", 503, "Service Unavailable");
        assert_eq!(err.code(), Some("Unknown"));
        assert!(err.to_string().contains("Service Unavailable"));
    }
}
