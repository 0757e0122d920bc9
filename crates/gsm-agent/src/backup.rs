use std::path::Path;

use crate::error::{ProvisionError, Result};

/// Copies `source` over `dest`, creating `dest`'s parent when missing.
///
/// Used twice around a reinstall: live config into staging, then staging
/// back over the live config.
pub async fn preserve(source: &Path, dest: &Path) -> Result<()> {
    let err = |message: String| ProvisionError::Backup {
        source_path: source.to_path_buf(),
        destination: dest.to_path_buf(),
        message,
    };
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| err(e.to_string()))?;
    }
    tokio::fs::copy(source, dest)
        .await
        .map_err(|e| err(e.to_string()))?;
    tracing::debug!(source = %source.display(), dest = %dest.display(), "preserved file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backup_then_restore_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("server.cfg");
        let saved = dir.path().join("staging").join("config").join("server.cfg");
        let original = b"echo hi\r\nrcon_password abc\r\nport 7777\r\n".to_vec();
        std::fs::write(&live, &original).unwrap();

        preserve(&live, &saved).await.unwrap();
        std::fs::write(&live, b"port 1\n").unwrap();
        preserve(&saved, &live).await.unwrap();

        assert_eq!(std::fs::read(&live).unwrap(), original);
    }

    #[tokio::test]
    async fn missing_source_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let err = preserve(&dir.path().join("nope.cfg"), &dir.path().join("out.cfg"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backup");
        assert!(err.to_string().contains("nope.cfg"));
    }
}
