use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::descriptor::{ContentHash, Descriptor};
use crate::publish::Snapshot;

/// On-disk record of the last published generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub generation: u64,
    pub content_hash: ContentHash,
    pub published_at: DateTime<Utc>,
    pub descriptor: Descriptor,
}

impl From<&Snapshot> for PersistedState {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            generation: snapshot.generation(),
            content_hash: snapshot.content_hash.clone(),
            published_at: snapshot.published_at,
            descriptor: snapshot.descriptor.clone(),
        }
    }
}

impl PersistedState {
    /// Rebuilds the snapshot, rejecting records whose descriptor no longer
    /// hashes to the stored value.
    pub fn into_snapshot(self) -> Result<Snapshot> {
        let actual = self.descriptor.content_hash();
        if actual != self.content_hash {
            anyhow::bail!(
                "persisted descriptor hash mismatch: stored {}, computed {}",
                self.content_hash,
                actual
            );
        }
        Ok(Snapshot {
            descriptor: self.descriptor,
            content_hash: self.content_hash,
            published_at: self.published_at,
        })
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<PersistedState>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read state file {}", self.path.display()))
            }
        };
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse state file {}", self.path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).context("failed to serialize state")?;
        write_atomic(&self.path, &json)
    }
}

/// Writes `contents` to a temp file in the target directory and renames it
/// over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .context("failed to write temp file")?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
