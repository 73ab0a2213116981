//! Device identity: a UUID generated once, persisted, and advertised so peers recognise
//! this device across restarts and address changes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable device identity. Distinguishes a restarted instance from a different device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Fresh random identity.
    pub fn generate() -> Self {
        DeviceId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        DeviceId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DeviceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(DeviceId)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity file {path} does not hold a UUID")]
    Corrupt { path: PathBuf },
}

/// Load the identity stored at `path`, creating and persisting a new one on first run.
///
/// A file that exists but does not parse is an error rather than silently replaced,
/// since replacing it would make this device look like a different one to its peers.
pub fn load_or_create(path: &Path) -> Result<DeviceId, IdentityError> {
    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };
    match std::fs::read_to_string(path) {
        Ok(s) => s.parse().map_err(|_| IdentityError::Corrupt {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = DeviceId::generate();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(io_err)?;
            }
            // Write then rename so a crash never leaves a half-written identity.
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, format!("{}\n", id)).map_err(io_err)?;
            std::fs::rename(&tmp, path).map_err(io_err)?;
            Ok(id)
        }
        Err(e) => Err(io_err(e)),
    }
}
