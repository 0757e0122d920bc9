use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

pub const INSTALL_MARKER_FILE: &str = ".gsm-install.json";

/// Four-component build number, compared component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildVersion(pub [u16; 4]);

impl std::fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// Normalizes a raw digit token from a release file name.
///
/// Release tokens are written `<major><minor><patch>` (`037` for 0.3.7), and
/// shorter tokens have lost their leading zeros, so the token is first
/// left-padded to three digits. The result is then right-padded with zeros
/// or cut to its first four digits, one digit per component. Non-digits
/// count as zero.
pub fn format_version(raw: &str) -> BuildVersion {
    let raw = raw.trim();
    let padded = format!("{raw:0>3}0000");
    let mut out = [0u16; 4];
    for (slot, c) in out.iter_mut().zip(padded.chars()) {
        *slot = c.to_digit(10).unwrap_or(0) as u16;
    }
    BuildVersion(out)
}

const FIXED_FILE_INFO_SIGNATURE: [u8; 4] = 0xFEEF_04BDu32.to_le_bytes();

/// Reads the product version from a PE image's `VS_FIXEDFILEINFO` block.
pub fn pe_product_version(image: &[u8]) -> Option<BuildVersion> {
    if !image.starts_with(b"MZ") {
        return None;
    }
    let start = image
        .windows(FIXED_FILE_INFO_SIGNATURE.len())
        .position(|w| w == FIXED_FILE_INFO_SIGNATURE)?;

    // dwSignature, dwStrucVersion, dwFileVersionMS/LS, dwProductVersionMS/LS
    let read_u32 = |offset: usize| -> Option<u32> {
        let bytes = image.get(start + offset..start + offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    };
    let ms = read_u32(16)?;
    let ls = read_u32(20)?;
    Some(BuildVersion([
        (ms >> 16) as u16,
        (ms & 0xffff) as u16,
        (ls >> 16) as u16,
        (ls & 0xffff) as u16,
    ]))
}

/// Written after every successful install or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<BuildVersion>,
    pub download_url: String,
    pub installed_at_unix_ms: u64,
}

pub fn read_marker(instance_dir: &Path) -> Option<InstallMarker> {
    let raw = std::fs::read(instance_dir.join(INSTALL_MARKER_FILE)).ok()?;
    serde_json::from_slice::<InstallMarker>(&raw).ok()
}

pub fn write_marker(instance_dir: &Path, marker: &InstallMarker) -> Result<()> {
    let p = instance_dir.join(INSTALL_MARKER_FILE);
    let tmp = p.with_extension("tmp");
    let data = serde_json::to_vec_pretty(marker).map_err(|e| ProvisionError::fs(&p, e))?;
    std::fs::write(&tmp, &data).map_err(|e| ProvisionError::fs(&tmp, e))?;
    std::fs::rename(&tmp, &p).map_err(|e| ProvisionError::fs(&p, e))?;
    Ok(())
}

/// Build of the installed executable.
///
/// The binary's own version resource wins; the install marker covers
/// binaries that carry none.
pub async fn local_build(executable: &Path, instance_dir: &Path) -> Result<BuildVersion> {
    let name = executable
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let image = match tokio::fs::read(executable).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProvisionError::MissingExecutable {
                name,
                path: executable.to_path_buf(),
            });
        }
        Err(e) => return Err(ProvisionError::fs(executable, e)),
    };

    if let Some(v) = pe_product_version(&image) {
        return Ok(v);
    }
    read_marker(instance_dir)
        .and_then(|m| m.version)
        .ok_or_else(|| ProvisionError::Parse {
            what: format!("{name} version"),
            message: "no version resource and no install marker".to_string(),
        })
}
