use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result};

const REMOTE_PRIVATE_KEY: &str = "/tmp/pk.pem";
const REMOTE_CERTIFICATE: &str = "/tmp/cert.pem";
const BUNDLE_SIZE_MB: u32 = 10240;

/// Command execution on one remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Copy local file `local` to `remote` on the host.
    async fn put(&self, local: &Path, remote: &str) -> Result<()>;

    /// Run `command` as root and return its stdout.
    async fn sudo(&self, command: &str) -> Result<String>;

    /// Run `command` as the login user and return its stdout.
    async fn run(&self, command: &str) -> Result<String>;
}

/// `RemoteShell` over the system `ssh` and `scp` binaries.
///
/// Authentication is whatever the local ssh configuration provides.
#[derive(Debug, Clone)]
pub struct SshShell {
    destination: String,
}

impl SshShell {
    /// `destination` is anything ssh accepts (`host`, `user@host`, an alias).
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    async fn ssh(&self, command: &str) -> Result<String> {
        let output = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.destination)
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::Remote(format!("failed to execute ssh: {e}")))?;
        // The command line can carry credentials; only the program is logged.
        checked("ssh", output)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(host = %self.destination, remote, "uploading file");
        let output = Command::new("scp")
            .arg("-q")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(local)
            .arg(format!("{}:{remote}", self.destination))
            .output()
            .await
            .map_err(|e| Error::Remote(format!("failed to execute scp: {e}")))?;
        checked("scp", output).map(drop)
    }

    async fn sudo(&self, command: &str) -> Result<String> {
        self.ssh(&format!("sudo -n sh -c {}", shell_quote(command))).await
    }

    async fn run(&self, command: &str) -> Result<String> {
        self.ssh(command).await
    }
}

fn checked(program: &str, output: Output) -> Result<String> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Remote(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Inputs for turning a running host into a registered machine image.
#[derive(Debug, Clone)]
pub struct AmiBundle {
    pub name: String,
    pub region_id: String,
    pub arch: String,
    /// AWS account number (`AWS_ID`).
    pub account_id: String,
    pub bucket: String,
    /// Local path of the X.509 private key.
    pub private_key: PathBuf,
    /// Local path of the X.509 certificate.
    pub certificate: PathBuf,
    pub access_key: String,
    pub secret_key: String,
}

/// Bundle the host behind `shell`, upload the bundle and register it.
///
/// Returns the new image id. Each step runs once; a failing step aborts the
/// rest, which may leave the X.509 files in `/tmp` on the host.
pub async fn save_as_ami(shell: &dyn RemoteShell, bundle: &AmiBundle) -> Result<String> {
    shell.put(&bundle.private_key, REMOTE_PRIVATE_KEY).await?;
    shell.put(&bundle.certificate, REMOTE_CERTIFICATE).await?;

    shell
        .sudo("sed -i.bak -r -e 's/universe$/universe multiverse/g' /etc/apt/sources.list")
        .await?;
    shell.sudo("apt-get update").await?;
    shell.sudo("apt-get install -y ec2-ami-tools ec2-api-tools").await?;

    shell
        .sudo(&format!(
            "ec2-bundle-vol -c {REMOTE_CERTIFICATE} -k {REMOTE_PRIVATE_KEY} -u {} -s {BUNDLE_SIZE_MB} -r {}",
            bundle.account_id, bundle.arch
        ))
        .await?;
    shell
        .sudo(&format!(
            "ec2-upload-bundle -b {} -m /tmp/image.manifest.xml -a {} -s {} --location {}",
            bundle.bucket, bundle.access_key, bundle.secret_key, bundle.region_id
        ))
        .await?;
    let registered = shell
        .sudo(&format!(
            "ec2-register -C {REMOTE_CERTIFICATE} -K {REMOTE_PRIVATE_KEY} --region {} {}/image.manifest.xml -n {}",
            bundle.region_id, bundle.bucket, bundle.name
        ))
        .await?;

    shell.run(&format!("rm {REMOTE_PRIVATE_KEY}")).await?;
    shell.run(&format!("rm {REMOTE_CERTIFICATE}")).await?;

    let image_id = registered
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Remote(format!("ec2-register printed no image id: {:?}", registered.trim()))
        })?;

    info!(image_id, name = %bundle.name, region = %bundle.region_id, "image registered");
    Ok(image_id)
}
