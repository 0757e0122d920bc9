//! Lifecycle management for SA-MP dedicated server instances: release
//! discovery, install and update with config preservation, and process
//! supervision.

pub mod backup;
pub mod build_info;
pub mod download;
pub mod error;
pub mod instance;
pub mod output;
pub mod progress;
pub mod provision;
pub mod release;
pub mod server_cfg;
pub mod staging;
pub mod supervisor;
pub mod support;

pub use build_info::BuildVersion;
pub use error::{ProvisionError, Result, format_error_chain};
pub use instance::{InstanceConfig, MergePolicy};
pub use output::{
    ConsoleBuffer, FileSink, MultiSink, NullSink, OutputSink, OutputStream, TracingSink,
};
pub use provision::{SampServer, UpdateOutcome, UpdateTask};
pub use release::{ReleaseResolver, ReleaseSource, RemoteRelease};
pub use supervisor::ProcessHandle;
