/// Identifier of a managed server instance, chosen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-workflow identifier. Also used as the staging directory nonce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Exited,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub instance_id: InstanceId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Provisioning state machine:
/// `NotInstalled -> Installing -> Installed`, and from `Installed`:
/// `CheckingUpdate -> {UpToDate, Downloading -> Extracting -> Merging -> Installed}`.
///
/// `BackingUp`, `Restoring` and `Failed` are reported in progress snapshots
/// so hosts can see where an update currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStage {
    NotInstalled,
    Installing,
    Installed,
    BackingUp,
    CheckingUpdate,
    UpToDate,
    Downloading,
    Extracting,
    Merging,
    Restoring,
    Failed,
}

impl ProvisionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisionStage::NotInstalled => "not_installed",
            ProvisionStage::Installing => "installing",
            ProvisionStage::Installed => "installed",
            ProvisionStage::BackingUp => "backing_up",
            ProvisionStage::CheckingUpdate => "checking_update",
            ProvisionStage::UpToDate => "up_to_date",
            ProvisionStage::Downloading => "downloading",
            ProvisionStage::Extracting => "extracting",
            ProvisionStage::Merging => "merging",
            ProvisionStage::Restoring => "restoring",
            ProvisionStage::Failed => "failed",
        }
    }

    /// Terminal stages end a workflow.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProvisionStage::Installed | ProvisionStage::UpToDate | ProvisionStage::Failed
        )
    }
}

impl std::fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProgressSnapshot {
    pub stage: ProvisionStage,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub message: String,
    pub done: bool,
    pub updated_at_unix_ms: u64,
}
