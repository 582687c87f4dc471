use std::{path::Path, str::FromStr, sync::Arc};

use protocol::key::KeyAuthorizer;
use russh::keys::{ssh_key::authorized_keys::Entry, PublicKey};

use crate::KeyError;

/// Public keys allowed to log in, loaded once from an OpenSSH `authorized_keys` file.
///
/// Keys are matched by key data only, so comments and options on the entry do not matter.
#[derive(Clone, Debug, Default)]
pub struct AuthorizedKeys {
    keys: Arc<Vec<PublicKey>>,
}

impl AuthorizedKeys {
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let content = std::fs::read_to_string(path).map_err(|source| KeyError::Read { path: path.to_path_buf(), source })?;
        let keys = Self::parse(path, &content)?;
        log::info!("[AuthorizedKeys] loaded {} keys from {}", keys.len(), path.display());
        Ok(keys)
    }

    /// Blank lines and `#` comments are skipped, any other unparsable line fails the whole file.
    pub fn parse(path: &Path, content: &str) -> Result<Self, KeyError> {
        let mut keys = vec![];
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = Entry::from_str(line).map_err(|e| KeyError::InvalidAuthorizedKey {
                path: path.to_path_buf(),
                line: index + 1,
                reason: e.to_string(),
            })?;
            keys.push(entry.public_key().clone());
        }
        Ok(Self { keys: Arc::new(keys) })
    }

    pub fn from_keys(keys: Vec<PublicKey>) -> Self {
        Self { keys: Arc::new(keys) }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|k| k.key_data() == key.key_data())
    }
}

impl KeyAuthorizer<PublicKey> for AuthorizedKeys {
    fn authorize(&self, user: &str, key: &PublicKey) -> bool {
        let allowed = self.contains(key);
        if !allowed {
            log::warn!("[AuthorizedKeys] rejected key {} for user {user}", key.algorithm());
        }
        allowed
    }
}
