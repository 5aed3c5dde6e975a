use tracing::{info, warn};

use crate::types::{IngressRule, Protocol};
use crate::{Ec2Provider, Error, Result};

/// AWS code reported when an identical rule already exists.
pub const DUPLICATE_PERMISSION: &str = "InvalidPermission.Duplicate";

/// Rules opened by [`authorize_port`] admit any source address.
pub const OPEN_CIDR: &str = "0.0.0.0/0";

/// Result of a successful authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    Authorized,
    AlreadyAuthorized,
}

/// Check that `port` fits in `0..=65535`.
pub fn validate_port(port: i64) -> Result<u16> {
    u16::try_from(port)
        .map_err(|_| Error::Validation(format!("ports must fall between 0 and 65535, got {port}")))
}

/// Open `protocol`/`port` to the world on `group`.
///
/// Inputs are validated before any provider call. Repeating the call for an
/// existing rule succeeds with [`AuthorizeOutcome::AlreadyAuthorized`].
pub async fn authorize_port(
    provider: &dyn Ec2Provider,
    group: &str,
    protocol: &str,
    port: i64,
) -> Result<AuthorizeOutcome> {
    let protocol: Protocol = protocol.parse()?;
    let port = validate_port(port)?;

    let rule = IngressRule {
        group: group.to_string(),
        protocol,
        port,
        cidr: OPEN_CIDR.into(),
    };

    match provider.authorize_ingress(&rule).await {
        Ok(()) => {
            info!(group, %protocol, port, "port authorized");
            Ok(AuthorizeOutcome::Authorized)
        }
        Err(e) if e.provider_code() == Some(DUPLICATE_PERMISSION) => {
            warn!(group, %protocol, port, "port already authorized");
            Ok(AuthorizeOutcome::AlreadyAuthorized)
        }
        Err(e) => Err(e),
    }
}
