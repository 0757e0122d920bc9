use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{ProvisionError, Result};
use crate::instance::normalize_rel_path;
use crate::release::archive_name;
use crate::support::download_max_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadReport {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
}

fn download_chunk_threshold(total_bytes: u64) -> u64 {
    if total_bytes >= 512 * 1024 * 1024 {
        4 * 1024 * 1024
    } else {
        1024 * 1024
    }
}

fn speed(downloaded: u64, started_at: Instant) -> u64 {
    let elapsed = started_at.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        (downloaded as f64 / elapsed).round() as u64
    } else {
        0
    }
}

/// Streams `url` into `dir/<final path segment>`.
///
/// Bytes land in `<name>.part` first; a failed transfer leaves that partial
/// file behind and never a file under the final name.
pub async fn download_archive<F>(
    client: &reqwest::Client,
    url: &Url,
    dir: &Path,
    mut on_progress: F,
) -> Result<(PathBuf, DownloadReport)>
where
    F: FnMut(DownloadReport) + Send,
{
    let name = archive_name(url)?;
    let path = dir.join(&name);
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ProvisionError::fs(dir, e))?;

    let resp = client
        .get(url.clone())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ProvisionError::network(format!("downloading {name}"), e))?;

    let total_hint = resp.content_length().unwrap_or(0);
    let max_bytes = download_max_bytes();
    if total_hint > max_bytes {
        return Err(ProvisionError::network(
            format!("downloading {name}"),
            format!("archive too large ({total_hint} bytes)"),
        ));
    }
    let threshold = download_chunk_threshold(total_hint.max(1));

    let part = dir.join(format!("{name}.part"));
    let mut f = tokio::fs::File::create(&part)
        .await
        .map_err(|e| ProvisionError::fs(&part, e))?;
    let mut stream = resp.bytes_stream();

    let started_at = Instant::now();
    let mut last_emit_bytes = 0u64;
    let mut last_emit_at = started_at;
    let mut downloaded = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| ProvisionError::network(format!("downloading {name}"), e))?;
        downloaded = downloaded.saturating_add(chunk.len() as u64);
        if downloaded > max_bytes {
            return Err(ProvisionError::network(
                format!("downloading {name}"),
                "archive too large",
            ));
        }
        f.write_all(&chunk)
            .await
            .map_err(|e| ProvisionError::fs(&part, e))?;

        let now = Instant::now();
        if downloaded.saturating_sub(last_emit_bytes) >= threshold
            || now.duration_since(last_emit_at) >= Duration::from_millis(300)
        {
            on_progress(DownloadReport {
                downloaded_bytes: downloaded,
                total_bytes: total_hint.max(downloaded),
                speed_bytes_per_sec: speed(downloaded, started_at),
            });
            last_emit_bytes = downloaded;
            last_emit_at = now;
        }
    }
    f.flush().await.map_err(|e| ProvisionError::fs(&part, e))?;
    drop(f);
    tokio::fs::rename(&part, &path)
        .await
        .map_err(|e| ProvisionError::fs(&path, e))?;

    let report = DownloadReport {
        downloaded_bytes: downloaded,
        total_bytes: total_hint.max(downloaded),
        speed_bytes_per_sec: speed(downloaded, started_at),
    };
    on_progress(report);
    tracing::info!(url = %url, path = %path.display(), bytes = downloaded, "downloaded archive");
    Ok((path, report))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }
}

fn extract_zip_safely(zip_path: &Path, out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(f)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().replace('\\', "/");
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed)
            .map_err(|_| anyhow::anyhow!("invalid zip entry path {trimmed:?}"))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        if name.ends_with('/') {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

async fn extract_tar_gz(archive: &Path, out_dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(out_dir).await?;
    let out = Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(out_dir)
        .stdin(std::process::Stdio::null())
        .output()
        .await?;
    if !out.status.success() {
        anyhow::bail!(
            "tar exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// Unpacks `archive` into `dest_dir`.
pub async fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<()> {
    let failed = |message: String| ProvisionError::Extract {
        archive: archive.to_path_buf(),
        message,
    };
    let kind = ArchiveKind::detect(archive)
        .ok_or_else(|| failed("unsupported archive type".to_string()))?;

    match kind {
        ArchiveKind::Zip => {
            let zip_path = archive.to_path_buf();
            let out_dir = dest_dir.to_path_buf();
            tokio::task::spawn_blocking(move || extract_zip_safely(&zip_path, &out_dir))
                .await
                .map_err(|e| failed(e.to_string()))?
                .map_err(|e| failed(format!("{e:#}")))?;
        }
        ArchiveKind::TarGz => extract_tar_gz(archive, dest_dir)
            .await
            .map_err(|e| failed(format!("{e:#}")))?,
    }
    tracing::debug!(archive = %archive.display(), dest = %dest_dir.display(), "extracted archive");
    Ok(())
}

/// Install shape: download into `target_dir`, extract next to the archive,
/// then delete the archive.
///
/// When extraction fails the error is returned before the archive is
/// touched, so it stays in place for inspection.
pub async fn fetch_and_extract<F>(
    client: &reqwest::Client,
    url: &Url,
    target_dir: &Path,
    on_progress: F,
) -> Result<DownloadReport>
where
    F: FnMut(DownloadReport) + Send,
{
    let (archive, report) = download_archive(client, url, target_dir, on_progress).await?;
    let extract_into = archive
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| target_dir.to_path_buf());
    extract_archive(&archive, &extract_into).await?;
    if let Err(e) = tokio::fs::remove_file(&archive).await {
        tracing::warn!(path = %archive.display(), error = %e, "failed to delete archive");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let f = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(name.trim_end_matches('/'), opts).unwrap();
            } else {
                zip.start_file(*name, opts).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn archive_kind_by_extension() {
        assert_eq!(
            ArchiveKind::detect(Path::new("samp037_svr_R2-2-1_win32.zip")),
            Some(ArchiveKind::Zip)
        );
        assert_eq!(
            ArchiveKind::detect(Path::new("samp037svr_R2-1.TAR.GZ")),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(ArchiveKind::detect(Path::new("setup.exe")), None);
    }

    #[tokio::test]
    async fn extracts_zip_tree() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(
            &zip_path,
            &[
                ("samp-server.exe", b"MZ"),
                ("filterscripts/", b""),
                ("filterscripts/base.amx", b"amx"),
            ],
        );
        let out = dir.path().join("out");
        extract_archive(&zip_path, &out).await.unwrap();
        assert_eq!(fs::read(out.join("samp-server.exe")).unwrap(), b"MZ");
        assert_eq!(fs::read(out.join("filterscripts/base.amx")).unwrap(), b"amx");
    }

    #[tokio::test]
    async fn rejects_traversal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");
        write_zip(&zip_path, &[("../escape.txt", b"x")]);
        let err = extract_archive(&zip_path, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "extract");
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn corrupt_archive_is_an_extract_error() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("broken.zip");
        fs::write(&zip_path, b"not a zip").unwrap();
        let err = extract_archive(&zip_path, dir.path()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Extract { .. }));
    }

    #[tokio::test]
    async fn download_failure_is_a_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse("http://127.0.0.1:1/samp037_svr_R2-2-1_win32.zip").unwrap();
        let err = download_archive(&reqwest::Client::new(), &url, dir.path(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), "network");
        assert!(!dir.path().join("samp037_svr_R2-2-1_win32.zip").exists());
    }
}
