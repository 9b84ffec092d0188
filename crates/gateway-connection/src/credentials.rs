//! Persistent credential obtained from pairing.
//!
//! One JSON record, replaced atomically: the new record is written to a
//! sibling file, synced, then renamed over the old one, so a crash leaves
//! either the previous credential or the new one on disk.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CredentialError;

/// Client identity and pre-shared key issued by one gateway.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Gateway that issued the credential.
    pub gateway_id: String,
    pub identity: String,
    pub psk: Vec<u8>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("gateway_id", &self.gateway_id)
            .field("identity", &self.identity)
            .field("psk", &"<redacted>")
            .finish()
    }
}

/// On-disk form of a [`Credential`].
#[derive(Serialize, Deserialize)]
struct Record {
    gateway_id: String,
    identity: String,
    key: String,
}

/// File-backed store for the single paired credential.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored credential. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<Credential>, CredentialError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: Record = serde_json::from_str(&data)?;
        let psk = STANDARD.decode(record.key.as_bytes())?;
        debug!(path = ?self.path, gateway = %record.gateway_id, "loaded credential");
        Ok(Some(Credential {
            gateway_id: record.gateway_id,
            identity: record.identity,
            psk,
        }))
    }

    /// Replaces the stored credential.
    pub fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        let record = Record {
            gateway_id: credential.gateway_id.clone(),
            identity: credential.identity.clone(),
            key: STANDARD.encode(&credential.psk),
        };
        let json = serde_json::to_string_pretty(&record)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        let result = write_synced(&tmp, json.as_bytes()).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        // Persist the rename itself.
        if let Some(parent) = self.path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }

        debug!(path = ?self.path, gateway = %credential.gateway_id, "saved credential");
        Ok(())
    }

    /// Deletes the stored credential. Clearing an empty store is not an error.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = ?self.path, "cleared credential");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Returns the default credential path.
pub fn default_credential_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("tradfri-indicator").join("credentials.json"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
