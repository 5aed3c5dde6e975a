use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::{Ec2Provider, Error, Result};

/// Create key pair `key_name` and write its private key to `<dir>/<key_name>.pem`.
///
/// The file is readable and writable by the owner only (0600).
pub async fn create_key(provider: &dyn Ec2Provider, key_name: &str, dir: &Path) -> Result<PathBuf> {
    let key = provider.create_key_pair(key_name).await?;
    let material = key
        .material
        .ok_or_else(|| Error::InvalidResponse(format!("no key material returned for {key_name}")))?;

    let path = dir.join(format!("{key_name}.pem"));
    write_private_key(&path, &material)?;

    info!(key_name, path = %path.display(), fingerprint = ?key.fingerprint, "key pair created");
    Ok(path)
}

fn write_private_key(path: &Path, material: &str) -> Result<()> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(io_err)?;

    // `mode` only applies on creation; tighten a pre-existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
    }

    file.write_all(material.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .map_err(io_err)
}
