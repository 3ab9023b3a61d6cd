use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// External object storage that receives final artifacts as soon as they
/// exist, bypassing the blob store.
pub trait DurableSink: Send + Sync {
    fn write_object(&self, local: &Utf8Path, key: &str, region: Option<&str>)
    -> Result<(), StoreError>;
}

/// Where a task should checkpoint an artifact in a [`DurableSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointTarget {
    pub key: String,
    pub region: Option<String>,
}

impl CheckpointTarget {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Same target with the last extension of the key swapped, e.g.
    /// `out/chr1.hal` to `out/chr1.vg`.
    pub fn with_extension(&self, extension: &str) -> Self {
        let stem = match self.key.rfind('.') {
            Some(dot) if !self.key[dot..].contains('/') => &self.key[..dot],
            _ => &self.key,
        };

        Self {
            key: format!("{stem}.{extension}"),
            region: self.region.clone(),
        }
    }

    /// Same target with `suffix` appended to the key.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            key: format!("{}{suffix}", self.key),
            region: self.region.clone(),
        }
    }

    /// Target for a file named `name` under this key.
    pub fn join(&self, name: &str) -> Self {
        Self {
            key: format!("{}/{name}", self.key.trim_end_matches('/')),
            region: self.region.clone(),
        }
    }
}

/// A [`DurableSink`] that writes objects below a local directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: Utf8PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, key: &str) -> Utf8PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl DurableSink for DirectorySink {
    fn write_object(
        &self,
        local: &Utf8Path,
        key: &str,
        region: Option<&str>,
    ) -> Result<(), StoreError> {
        let dest = self.path_of(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let partial = Utf8PathBuf::from(format!("{dest}.partial"));
        fs::copy(local, &partial)?;
        fs::rename(&partial, &dest)?;

        tracing::info!("checkpointed {local} to {key} (region {})", region.unwrap_or("default"));
        Ok(())
    }
}
