use std::{fs, io::Write, path::Path};

use russh::keys::{
    ssh_key::{rand_core::OsRng, LineEnding},
    Algorithm, PrivateKey,
};

use crate::KeyError;

/// Load the server identity from `path`, generating and persisting a new Ed25519 key when the file does not exist.
///
/// Existing files may be OpenSSH or legacy PEM encoded.
pub fn load_or_create_host_key(path: &Path) -> Result<PrivateKey, KeyError> {
    if path.exists() {
        let key = russh::keys::load_secret_key(path, None).map_err(|source| KeyError::InvalidHostKey { path: path.to_path_buf(), source })?;
        log::info!("[HostKey] loaded {} host key from {}", key.algorithm(), path.display());
        return Ok(key);
    }

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| KeyError::Generate(e.to_string()))?;
    let encoded = key.to_openssh(LineEnding::LF).map_err(|e| KeyError::Generate(e.to_string()))?;
    write_private(path, encoded.as_bytes()).map_err(|source| KeyError::Write { path: path.to_path_buf(), source })?;
    log::info!("[HostKey] generated new {} host key at {}", key.algorithm(), path.display());
    Ok(key)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

    if let Some(parent) = path.parent() {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
    }
    let mut file = fs::OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use russh::keys::Algorithm;

    use super::load_or_create_host_key;
    use crate::KeyError;

    #[test]
    fn generate_then_reload_same_key() {
        let path = crate::temp_path("nested/ssh_host_ed25519_key");
        let created = load_or_create_host_key(&path).expect("should create");
        assert_eq!(created.algorithm(), Algorithm::Ed25519);
        assert!(path.exists());

        let loaded = load_or_create_host_key(&path).expect("should load");
        assert_eq!(loaded.public_key().key_data(), created.public_key().key_data());
    }

    #[cfg(unix)]
    #[test]
    fn generated_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let path = crate::temp_path("ssh_host_ed25519_key");
        load_or_create_host_key(&path).expect("should create");
        let mode = std::fs::metadata(&path).expect("should stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_key_file_is_error() {
        let path = crate::temp_path("ssh_host_ed25519_key");
        std::fs::create_dir_all(path.parent().expect("should have parent")).expect("should create dir");
        std::fs::write(&path, "not a key").expect("should write");
        assert!(matches!(load_or_create_host_key(&path), Err(KeyError::InvalidHostKey { .. })));
    }
}
