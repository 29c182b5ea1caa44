//! Local delivery – the "download" fallback that hands a recording to the
//! user as a plain file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait LocalDelivery: Send + Sync {
    /// Write `payload` as `file_name`, returning where it landed.
    async fn deliver(&self, file_name: &str, payload: &[u8]) -> Result<PathBuf>;
}

/// Writes deliveries into a downloads directory, never overwriting an
/// existing file.
pub struct DownloadDir {
    dir: PathBuf,
}

impl DownloadDir {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

/// First free path for `file_name` in `dir`: `name.ext`, then
/// `name (1).ext`, `name (2).ext` and so on.
fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Strip path separators so a display name can never escape the directory.
fn sanitise(file_name: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "recording".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl LocalDelivery for DownloadDir {
    async fn deliver(&self, file_name: &str, payload: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Cannot create download dir: {}", self.dir.display()))?;

        let path = unique_path(&self.dir, &sanitise(file_name));
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("Cannot write {}", path.display()))?;
        info!("Saved {} ({} bytes)", path.display(), payload.len());
        Ok(path)
    }
}
