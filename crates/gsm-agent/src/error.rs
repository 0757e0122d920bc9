use std::path::PathBuf;

/// Failure taxonomy for every provisioning and supervision operation.
///
/// Public operations return this instead of recording a shared "last error";
/// `Display` is the human-readable message hosts show to operators.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("{name} not found ({})", path.display())]
    MissingExecutable { name: String, path: PathBuf },

    #[error("Invalid Path! Fail to find {marker}")]
    InvalidImport { path: PathBuf, marker: String },

    #[error("network error while {action}: {message}")]
    Network { action: String, message: String },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("no release link matching the expected build found on {page}")]
    NoReleaseLink { page: String },

    #[error("failed to extract {}: {message}", archive.display())]
    Extract { archive: PathBuf, message: String },

    #[error("filesystem error at {}: {message}", path.display())]
    Filesystem { path: PathBuf, message: String },

    #[error("merge aborted: staged file has no existing counterpart at {}", destination.display())]
    MergePrecondition { destination: PathBuf },

    #[error("failed to copy {} to {}: {message}", source_path.display(), destination.display())]
    Backup {
        source_path: PathBuf,
        destination: PathBuf,
        message: String,
    },

    #[error("invalid instance config: {0}")]
    Config(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("instance {0} is busy with another provisioning workflow")]
    Busy(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl ProvisionError {
    /// Stable machine-readable code for hosts.
    pub fn code(&self) -> &'static str {
        match self {
            ProvisionError::MissingExecutable { .. } => "missing_executable",
            ProvisionError::InvalidImport { .. } => "invalid_import",
            ProvisionError::Network { .. } => "network",
            ProvisionError::Parse { .. } => "parse",
            ProvisionError::NoReleaseLink { .. } => "no_release_link",
            ProvisionError::Extract { .. } => "extract",
            ProvisionError::Filesystem { .. } => "filesystem",
            ProvisionError::MergePrecondition { .. } => "merge_precondition",
            ProvisionError::Backup { .. } => "backup",
            ProvisionError::Config(_) => "invalid_config",
            ProvisionError::Process(_) => "process",
            ProvisionError::Unsupported(_) => "unsupported",
            ProvisionError::Busy(_) => "busy",
            ProvisionError::Task(_) => "task",
        }
    }

    /// True for failures of remote release resolution. Callers treat these as
    /// "no action", never as "needs update".
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            ProvisionError::Network { .. }
                | ProvisionError::Parse { .. }
                | ProvisionError::NoReleaseLink { .. }
        )
    }

    pub(crate) fn network(action: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ProvisionError::Network {
            action: action.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ProvisionError::Filesystem {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

/// Flattens an error and its sources into one line, skipping repeats.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
