use std::{
    path::PathBuf,
    sync::OnceLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const DEFAULT_CONSOLE_MAX_LINES: usize = 1000;
const DEFAULT_CONSOLE_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_CONSOLE_FILE_MAX_FILES: usize = 3;
const DEFAULT_DOWNLOAD_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024; // 2 GiB

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn console_max_lines() -> usize {
    env_usize("GSM_CONSOLE_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_CONSOLE_MAX_LINES)
}

pub(crate) fn console_file_limits() -> (u64, usize) {
    let max_bytes = env_u64("GSM_CONSOLE_FILE_MAX_BYTES")
        .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_CONSOLE_FILE_MAX_BYTES);
    let max_files = env_usize("GSM_CONSOLE_FILE_MAX_FILES")
        .map(|v| v.clamp(1, 20))
        .unwrap_or(DEFAULT_CONSOLE_FILE_MAX_FILES);
    (max_bytes, max_files)
}

pub(crate) fn http_timeout() -> Duration {
    Duration::from_secs(
        env_u64("GSM_HTTP_TIMEOUT_SECS")
            .map(|v| v.clamp(5, 60 * 60))
            .unwrap_or(15 * 60),
    )
}

pub(crate) fn download_max_bytes() -> u64 {
    env_u64("GSM_DOWNLOAD_MAX_BYTES")
        .map(|v| v.clamp(1024 * 1024, 64 * 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_DOWNLOAD_MAX_BYTES)
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Root under which all instances live. `GSM_DATA_ROOT`, default `./data`.
pub fn data_root() -> PathBuf {
    static ROOT: OnceLock<PathBuf> = OnceLock::new();
    ROOT.get_or_init(|| {
        let raw = std::env::var("GSM_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
        let p = PathBuf::from(raw);
        let abs = if p.is_absolute() {
            p
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(p)
        };

        // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
        std::fs::canonicalize(&abs).unwrap_or(abs)
    })
    .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u64_ignores_garbage() {
        // Unset names fall back to None.
        assert_eq!(env_u64("GSM_TEST_SURELY_UNSET_VARIABLE"), None);
    }

    #[test]
    fn defaults_are_within_clamps() {
        let (bytes, files) = console_file_limits();
        assert!(bytes >= 256 * 1024);
        assert!((1..=20).contains(&files));
        assert!(console_max_lines() >= 100);
        assert!(http_timeout() >= Duration::from_secs(5));
    }
}
