use std::path::{Path, PathBuf};

use gsm_process::OperationId;

use crate::error::{ProvisionError, Result};
use crate::instance::MergePolicy;

pub const STAGING_DIR: &str = ".gsm-staging";

/// Per-operation scratch space under the instance directory.
///
/// Each workflow gets its own directory, so two workflows never share
/// staging data. Removed on success, left in place on failure.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub async fn create(instance_dir: &Path, op: &OperationId) -> Result<Self> {
        let root = instance_dir.join(STAGING_DIR).join(&op.0);
        for dir in [root.join("config"), root.join("download"), root.join("release")] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ProvisionError::fs(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Holds the preserved user config.
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Holds the downloaded archive.
    pub fn download_dir(&self) -> PathBuf {
        self.root.join("download")
    }

    /// Holds the extracted release.
    pub fn release_dir(&self) -> PathBuf {
        self.root.join("release")
    }

    pub async fn remove(self) -> Result<()> {
        tokio::fs::remove_dir_all(&self.root)
            .await
            .map_err(|e| ProvisionError::fs(&self.root, e))?;
        // Drop the parent too once the last operation is gone.
        if let Some(parent) = self.root.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

fn collect_files(root: &Path, cur: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for e in std::fs::read_dir(cur)? {
        let e = e?;
        let p = e.path();
        let ty = e.file_type()?;
        if ty.is_symlink() {
            continue;
        }
        if ty.is_dir() {
            collect_files(root, &p, out)?;
        } else if ty.is_file()
            && let Ok(rel) = p.strip_prefix(root)
        {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

fn merge_blocking(staged: &Path, live: &Path, policy: MergePolicy) -> Result<usize> {
    let mut files = Vec::new();
    collect_files(staged, staged, &mut files).map_err(|e| ProvisionError::fs(staged, e))?;
    files.sort();

    // Validate the whole tree first so a rejected merge copies nothing.
    if policy == MergePolicy::ExistingOnly
        && let Some(missing) = files.iter().map(|rel| live.join(rel)).find(|p| !p.is_file())
    {
        return Err(ProvisionError::MergePrecondition {
            destination: missing,
        });
    }

    for rel in &files {
        let src = staged.join(rel);
        let dst = live.join(rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProvisionError::fs(parent, e))?;
        }
        std::fs::copy(&src, &dst).map_err(|e| ProvisionError::fs(&dst, e))?;
    }
    Ok(files.len())
}

/// Copies every staged file over the live instance directory.
///
/// With [`MergePolicy::ExistingOnly`] each staged file must already exist in
/// `live`; otherwise the merge is rejected before anything is copied.
pub async fn merge_into(staged: &Path, live: &Path, policy: MergePolicy) -> Result<usize> {
    let staged_owned = staged.to_path_buf();
    let live_owned = live.to_path_buf();
    let copied =
        tokio::task::spawn_blocking(move || merge_blocking(&staged_owned, &live_owned, policy))
            .await
            .map_err(|e| ProvisionError::Task(e.to_string()))??;
    tracing::info!(
        staged = %staged.display(),
        live = %live.display(),
        files = copied,
        ?policy,
        "merged staged release"
    );
    Ok(copied)
}
