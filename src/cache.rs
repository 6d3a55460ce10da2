//! The cache file shared by discovery and the responder. Discovery replaces it
//! atomically every cycle, so readers see either the previous or the new
//! snapshot, never a partial one.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::targets::TargetGroup;

/// Outcome of a discovery cycle, as stored in the cache.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Snapshot {
    Targets(Vec<TargetGroup>),

    Error { error: String },
}

impl Snapshot {
    pub fn error(err: impl ToString) -> Self {
        Snapshot::Error {
            error: err.to_string(),
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        // neither variant contains anything serde_json could reject
        serde_json::to_vec(self).unwrap_or_else(|_| b"[]".to_vec())
    }
}

pub struct CacheWriter {
    stable_file_path: PathBuf,
    tmp_file_path: PathBuf,
}

impl CacheWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let stable_file_path = path.into();
        let mut tmp = stable_file_path.clone().into_os_string();
        tmp.push(".tmp");

        Self {
            stable_file_path,
            tmp_file_path: PathBuf::from(tmp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.stable_file_path
    }

    /// Replace the cache file with `data`.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.stable_file_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        // If we die before the rename, the stable file is untouched.
        let mut f = tokio::fs::File::create(&self.tmp_file_path).await?;
        f.write_all(data).await?;
        f.flush().await?;
        f.sync_all().await?;
        drop(f);

        tokio::fs::rename(&self.tmp_file_path, &self.stable_file_path).await
    }
}

/// Read the cache file for serving. Failures become a human readable body,
/// the responder always has something to answer with.
pub async fn read(path: &Path) -> Vec<u8> {
    match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            format!("File not found: {}", path.display()).into_bytes()
        }
        Err(err) => {
            warn!(
                message = "read cache file failed",
                path = ?path,
                %err,
            );

            format!("An error occurred: {err}").into_bytes()
        }
    }
}
