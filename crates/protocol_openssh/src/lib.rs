use std::path::PathBuf;

mod authorized_keys;
mod host_key;

pub use authorized_keys::AuthorizedKeys;
pub use host_key::load_or_create_host_key;

const CONFIG_DIR: &str = "ssh-tunnel";
const HOST_KEY_FILE: &str = "ssh_host_ed25519_key";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("{path}:{line}: invalid authorized key: {reason}")]
    InvalidAuthorizedKey { path: PathBuf, line: usize, reason: String },
    #[error("parse host key {path}: {source}")]
    InvalidHostKey { path: PathBuf, source: russh::keys::Error },
    #[error("generate host key: {0}")]
    Generate(String),
}

/// `~/.config/ssh-tunnel/ssh_host_ed25519_key`, falling back to the working directory without a home.
pub fn default_host_key_path() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".config").join(CONFIG_DIR).join(HOST_KEY_FILE)
}

/// `~/.ssh/authorized_keys`
pub fn default_authorized_keys_path() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".ssh").join("authorized_keys")
}

#[cfg(test)]
fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ssh-tunnel-test-{:016x}", rand::random::<u64>())).join(name)
}
