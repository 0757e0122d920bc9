use std::path::{Component, Path, PathBuf};

use gsm_process::InstanceId;
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};
use crate::support::{data_root, env_string};

pub const DEFAULT_EXECUTABLE: &str = "samp-server.exe";
pub const CONFIG_FILE_NAME: &str = "server.cfg";
pub const IMPORT_MARKER_FILE: &str = "PackageInfo.bin";

/// How the update merge treats staged files with no live counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Overwrite files that already exist; any new staged file aborts the merge.
    #[default]
    ExistingOnly,
    /// Create files that are missing and overwrite the rest.
    CreateOrOverwrite,
}

/// Per-instance definition supplied by the host. Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub server_id: InstanceId,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default)]
    pub rcon_password: String,
    /// Extra launch parameters, whitespace separated.
    #[serde(default)]
    pub server_params: String,
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Capture stdout/stderr into the output sink.
    #[serde(default = "default_embed_console")]
    pub embed_console: bool,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// Overrides `<data_root>/servers/<id>/serverfiles`.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
}

fn default_hostname() -> String {
    "wgsm_samp_dedicated".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_max_players() -> u32 {
    50
}

fn default_executable() -> String {
    DEFAULT_EXECUTABLE.to_string()
}

fn default_embed_console() -> bool {
    true
}

impl InstanceConfig {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: InstanceId(server_id.into()),
            hostname: default_hostname(),
            port: default_port(),
            max_players: default_max_players(),
            rcon_password: String::new(),
            server_params: String::new(),
            executable: default_executable(),
            embed_console: default_embed_console(),
            merge_policy: MergePolicy::default(),
            install_dir: None,
        }
    }

    /// Parses a TOML instance definition and applies `GSM_*` env overrides.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut cfg: InstanceConfig =
            toml::from_str(raw).map_err(|e| ProvisionError::Config(e.to_string()))?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ProvisionError::fs(path, e))?;
        Self::from_toml_str(&raw)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_string("GSM_SERVER_PORT") {
            self.port = v
                .parse()
                .map_err(|_| ProvisionError::Config(format!("invalid GSM_SERVER_PORT: {v}")))?;
        }
        if let Some(v) = env_string("GSM_MAX_PLAYERS") {
            self.max_players = v
                .parse()
                .map_err(|_| ProvisionError::Config(format!("invalid GSM_MAX_PLAYERS: {v}")))?;
        }
        if let Some(v) = env_string("GSM_RCON_PASSWORD") {
            self.rcon_password = v;
        }
        if let Some(v) = env_string("GSM_HOSTNAME") {
            self.hostname = v;
        }
        if let Some(v) = env_string("GSM_SERVER_PARAMS") {
            self.server_params = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let id = self.server_id.0.trim();
        if id.is_empty() {
            return Err(ProvisionError::Config("server_id must be non-empty".to_string()));
        }
        // The id becomes a directory name.
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || id == "."
            || id == ".."
        {
            return Err(ProvisionError::Config(format!("invalid server_id: {id}")));
        }
        if self.port == 0 {
            return Err(ProvisionError::Config("port must be non-zero".to_string()));
        }
        if !(1..=1000).contains(&self.max_players) {
            return Err(ProvisionError::Config(format!(
                "max_players out of range: {}",
                self.max_players
            )));
        }
        if self.hostname.contains(['\n', '\r']) || self.rcon_password.contains(['\n', '\r']) {
            return Err(ProvisionError::Config(
                "hostname and rcon_password must be single-line".to_string(),
            ));
        }
        if Path::new(&self.executable).components().count() != 1 {
            return Err(ProvisionError::Config(format!(
                "executable must be a bare file name: {}",
                self.executable
            )));
        }
        Ok(())
    }

    /// Root of the installed server files.
    pub fn server_files(&self) -> PathBuf {
        match &self.install_dir {
            Some(dir) => dir.clone(),
            None => data_root()
                .join("servers")
                .join(&self.server_id.0)
                .join("serverfiles"),
        }
    }

    /// Joins a relative path onto the instance directory. Traversal outside
    /// the instance is rejected.
    pub fn instance_dir(&self, rel: &str) -> Result<PathBuf> {
        Ok(self.server_files().join(normalize_rel_path(rel)?))
    }

    pub fn executable_path(&self) -> PathBuf {
        self.server_files().join(&self.executable)
    }

    pub fn config_path(&self) -> PathBuf {
        self.server_files().join(CONFIG_FILE_NAME)
    }

    /// Launch argv from `server_params`.
    pub fn launch_args(&self) -> Vec<String> {
        self.server_params
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

pub(crate) fn normalize_rel_path(rel: &str) -> Result<PathBuf> {
    if rel.trim().is_empty() {
        return Ok(PathBuf::new());
    }
    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(ProvisionError::Config(format!(
            "path must be relative to the instance: {rel}"
        )));
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(ProvisionError::Config(format!(
                    "path traversal is not allowed: {rel}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(ProvisionError::Config(format!(
                    "path must be relative to the instance: {rel}"
                )));
            }
        }
    }
    Ok(out)
}
