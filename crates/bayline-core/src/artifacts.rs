//! Artifact storage under the OS temp dir.
//!
//! Screenshots and PDFs land here. The sweep removes anything older than
//! 24 hours; screenshots are additionally capped by count, oldest first.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;

pub const ARTIFACT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    screenshot_cap: usize,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, screenshot_cap: usize) -> Self {
        Self {
            root,
            screenshot_cap,
        }
    }

    pub fn in_temp_dir(screenshot_cap: usize) -> Self {
        Self::new(std::env::temp_dir().join("bayline-artifacts"), screenshot_cap)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.root.join("screenshots")
    }

    pub fn pdfs_dir(&self) -> PathBuf {
        self.root.join("pdfs")
    }

    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.screenshots_dir()).await?;
        tokio::fs::create_dir_all(self.pdfs_dir()).await?;
        Ok(())
    }

    /// Path for a new screenshot belonging to `run_id`.
    pub fn screenshot_path(&self, run_id: &str, label: &str) -> PathBuf {
        self.screenshots_dir()
            .join(format!("{run_id}-{label}.png"))
    }

    pub fn pdf_path(&self, run_id: &str) -> PathBuf {
        self.pdfs_dir().join(format!("estimate-{run_id}.pdf"))
    }

    /// Removes artifacts older than 24 h and enforces the screenshot cap.
    /// Returns the number of files removed.
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        removed += sweep_old(&self.pdfs_dir(), ARTIFACT_MAX_AGE).await?;
        removed += sweep_old(&self.screenshots_dir(), ARTIFACT_MAX_AGE).await?;
        removed += cap_by_count(&self.screenshots_dir(), self.screenshot_cap).await?;
        if removed > 0 {
            debug!(target: "bayline.artifacts", removed, "artifact sweep");
        }
        Ok(removed)
    }
}

async fn sweep_old(dir: &Path, max_age: Duration) -> anyhow::Result<usize> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Ok(0);
    };
    let cutoff = SystemTime::now() - max_age;
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

async fn cap_by_count(dir: &Path, cap: usize) -> anyhow::Result<usize> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Ok(0);
    };
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.is_file() {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, entry.path()));
        }
    }
    if files.len() <= cap {
        return Ok(0);
    }
    files.sort_by_key(|(modified, _)| *modified);
    let excess = files.len() - cap;
    let mut removed = 0;
    for (_, path) in files.into_iter().take(excess) {
        if tokio::fs::remove_file(path).await.is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
