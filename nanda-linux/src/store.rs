//! Persisted registry endpoint: one `registry` key in a small TOML state file.
//! Written only through the administrative CLI flags, never after discovery.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Durable slot holding the last administratively chosen registry URL.
pub trait EndpointStore: Send + Sync {
    fn load(&self) -> Option<String>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registry: Option<String>,
}

pub struct FileEndpointStore {
    path: PathBuf,
}

impl FileEndpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, url: &str) -> anyhow::Result<()> {
        self.write(StateFile {
            registry: Some(url.trim().to_string()),
        })
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.write(StateFile::default())
    }

    fn write(&self, state: StateFile) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create {}", dir.display()))?;
        }
        let text = toml::to_string(&state).context("serialize state")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("write {}", self.path.display()))
    }
}

impl EndpointStore for FileEndpointStore {
    /// Missing, unreadable or malformed file, and empty values, all count as absent.
    fn load(&self) -> Option<String> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file unreadable");
                return None;
            }
        };
        match toml::from_str::<StateFile>(&text) {
            Ok(s) => s.registry.filter(|u| !u.trim().is_empty()),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file malformed");
                None
            }
        }
    }
}
