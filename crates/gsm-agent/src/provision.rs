//! Install, update, start and stop workflows for one SA-MP instance.
//!
//! Install and update on the same instance are serialised through a
//! per-instance lock. Every update stages its files in a directory of its
//! own.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, OnceLock},
};

use gsm_process::{OperationId, ProgressSnapshot, ProvisionStage};
use reqwest::Url;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::backup;
use crate::build_info::{self, BuildVersion, InstallMarker};
use crate::download::{self, DownloadReport};
use crate::error::{ProvisionError, Result};
use crate::instance::{CONFIG_FILE_NAME, IMPORT_MARKER_FILE, InstanceConfig};
use crate::output::OutputSink;
use crate::progress::{self, UpdateArgs};
use crate::release::{ReleaseResolver, ReleaseSource, RemoteRelease};
use crate::server_cfg::{self, Overrides};
use crate::staging::{self, StagingArea};
use crate::supervisor::{self, ProcessHandle};
use crate::support::now_unix_ms;

fn instance_locks() -> &'static std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| std::sync::Mutex::new(HashMap::new()))
}

fn lock_for(key: &str) -> Arc<Mutex<()>> {
    let mut map = instance_locks().lock().unwrap_or_else(|e| e.into_inner());
    map.entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// How a finished update left the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Local and remote builds matched; nothing was downloaded.
    UpToDate { version: BuildVersion },
    Updated {
        from: Option<BuildVersion>,
        to: Option<BuildVersion>,
        download_url: Url,
    },
}

/// A running update. Dropping it does not cancel the workflow.
#[derive(Debug)]
pub struct UpdateTask {
    op: OperationId,
    join: JoinHandle<Result<UpdateOutcome>>,
}

impl UpdateTask {
    pub fn operation_id(&self) -> &OperationId {
        &self.op
    }

    pub fn progress(&self) -> Option<ProgressSnapshot> {
        progress::get(&self.op)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<UpdateOutcome> {
        self.join
            .await
            .map_err(|e| ProvisionError::Task(e.to_string()))?
    }
}

struct ServerInner {
    config: InstanceConfig,
    resolver: ReleaseResolver,
    sink: Arc<dyn OutputSink>,
}

/// Host-facing handle for one configured instance.
#[derive(Clone)]
pub struct SampServer {
    inner: Arc<ServerInner>,
}

impl SampServer {
    /// Uses the release source from `GSM_SAMP_*` env, falling back to the
    /// public download pages.
    pub fn new(config: InstanceConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        Self::with_source(config, ReleaseSource::from_env(), sink)
    }

    pub fn with_source(
        config: InstanceConfig,
        source: ReleaseSource,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = ReleaseResolver::new(source)?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                resolver,
                sink,
            }),
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.inner.config
    }

    fn lock(&self) -> Arc<Mutex<()>> {
        lock_for(&self.inner.config.server_files().to_string_lossy())
    }

    /// Writes the stock `server.cfg` if none exists, then applies every
    /// instance override, the RCON password included.
    pub async fn create_default_config(&self) -> Result<()> {
        let path = self.inner.config.config_path();
        if server_cfg::ensure_default(&path).await? {
            tracing::info!(
                server_id = %self.inner.config.server_id,
                path = %path.display(),
                "wrote default server config"
            );
        }
        server_cfg::apply_overrides(&path, &Overrides::for_instance(&self.inner.config), None)
            .await
    }

    /// Launches the server. Refused while an install or update holds the
    /// instance.
    pub async fn start(&self) -> Result<ProcessHandle> {
        let lock = self.lock();
        let Ok(_guard) = lock.try_lock() else {
            return Err(ProvisionError::Busy(
                self.inner.config.server_id.to_string(),
            ));
        };
        supervisor::start(&self.inner.config, self.inner.sink.clone()).await
    }

    pub fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        supervisor::stop(handle)
    }

    /// Fresh install: download the current release straight into the
    /// instance directory, unpack it there and delete the archive.
    pub async fn install(&self) -> Result<RemoteRelease> {
        let cfg = &self.inner.config;
        let lock = self.lock();
        let _guard = lock.lock().await;

        let live = cfg.server_files();
        tokio::fs::create_dir_all(&live)
            .await
            .map_err(|e| ProvisionError::fs(&live, e))?;

        let op = OperationId::new();
        progress::start(&op, ProvisionStage::Installing, "resolving download link");
        let result = self.install_inner(&op, &live).await;
        match &result {
            Ok(release) => {
                progress::finish(&op, ProvisionStage::Installed, "installed");
                tracing::info!(
                    server_id = %cfg.server_id,
                    url = %release.download_url,
                    version = ?release.version,
                    "install finished"
                );
            }
            Err(e) => {
                progress::fail(&op, e.to_string());
                tracing::warn!(server_id = %cfg.server_id, error = %e, "install failed");
            }
        }
        result
    }

    async fn install_inner(&self, op: &OperationId, live: &Path) -> Result<RemoteRelease> {
        let resolver = &self.inner.resolver;
        let url = resolver.resolve_download_link().await?;
        progress::stage(op, ProvisionStage::Installing, format!("downloading {url}"));
        download::fetch_and_extract(resolver.client(), &url, live, |r| report(op, r)).await?;

        let version = resolver.version_of(&url);
        build_info::write_marker(
            live,
            &InstallMarker {
                version,
                download_url: url.to_string(),
                installed_at_unix_ms: now_unix_ms(),
            },
        )?;
        Ok(RemoteRelease {
            version,
            download_url: url,
        })
    }

    /// Starts an update and returns immediately.
    ///
    /// `validate` reinstalls even when the builds match. `custom` is a
    /// download URL used instead of the resolved one.
    pub fn update(&self, validate: bool, custom: Option<String>) -> UpdateTask {
        let op = OperationId::new();
        progress::start(&op, ProvisionStage::BackingUp, "waiting for instance lock");
        let server = self.clone();
        let task_op = op.clone();
        let join = tokio::spawn(async move { server.run_update(task_op, validate, custom).await });
        UpdateTask { op, join }
    }

    async fn run_update(
        &self,
        op: OperationId,
        validate: bool,
        custom: Option<String>,
    ) -> Result<UpdateOutcome> {
        let cfg = &self.inner.config;
        let lock = self.lock();
        let _guard = lock.lock().await;

        let result = self.update_locked(&op, validate, custom).await;
        match &result {
            Ok(UpdateOutcome::UpToDate { version }) => {
                progress::finish(&op, ProvisionStage::UpToDate, format!("already at {version}"));
                tracing::info!(server_id = %cfg.server_id, %version, "skipping update, same version");
            }
            Ok(UpdateOutcome::Updated { from, to, .. }) => {
                progress::finish(&op, ProvisionStage::Installed, "updated");
                tracing::info!(server_id = %cfg.server_id, ?from, ?to, "update finished");
            }
            Err(e) => {
                progress::fail(&op, e.to_string());
                tracing::warn!(server_id = %cfg.server_id, code = e.code(), error = %e, "update failed");
            }
        }
        result
    }

    async fn update_locked(
        &self,
        op: &OperationId,
        validate: bool,
        custom: Option<String>,
    ) -> Result<UpdateOutcome> {
        let cfg = &self.inner.config;
        let live = cfg.server_files();
        let live_cfg = cfg.config_path();

        progress::stage(op, ProvisionStage::BackingUp, format!("backing up {CONFIG_FILE_NAME}"));
        let staging = StagingArea::create(&live, op).await?;
        let saved_cfg = staging.config_dir().join(CONFIG_FILE_NAME);
        let backed_up = if tokio::fs::try_exists(&live_cfg).await.unwrap_or(false) {
            backup::preserve(&live_cfg, &saved_cfg).await?;
            true
        } else {
            tracing::debug!(path = %live_cfg.display(), "no server config to back up");
            false
        };

        let result = self.reinstall(op, &staging, &live, validate, custom).await;

        // The saved config goes back no matter how the reinstall went.
        let restored = if backed_up {
            progress::stage(op, ProvisionStage::Restoring, format!("restoring {CONFIG_FILE_NAME}"));
            backup::preserve(&saved_cfg, &live_cfg).await
        } else {
            Ok(())
        };

        match (result, restored) {
            (Ok(outcome), Ok(())) => {
                if let Err(e) = staging.remove().await {
                    tracing::warn!(error = %e, "failed to remove staging directory");
                }
                Ok(outcome)
            }
            (Ok(_), Err(restore_err)) => Err(restore_err),
            (Err(e), restored) => {
                if let Err(restore_err) = restored {
                    tracing::warn!(error = %restore_err, "config restore failed after update error");
                }
                tracing::info!(staging = %staging.root().display(), "kept staging directory for inspection");
                Err(e)
            }
        }
    }

    async fn reinstall(
        &self,
        op: &OperationId,
        staging: &StagingArea,
        live: &Path,
        validate: bool,
        custom: Option<String>,
    ) -> Result<UpdateOutcome> {
        let cfg = &self.inner.config;
        let resolver = &self.inner.resolver;

        let mut remote = None;
        let from = if validate {
            self.local_build().await.ok()
        } else {
            progress::stage(op, ProvisionStage::CheckingUpdate, "comparing builds");
            let local = match self.local_build().await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::info!(server_id = %cfg.server_id, error = %e, "local build unknown, reinstalling");
                    None
                }
            };
            let remote_version = resolver.resolve_remote_version().await?;
            if local == Some(remote_version) {
                return Ok(UpdateOutcome::UpToDate {
                    version: remote_version,
                });
            }
            remote = Some(remote_version);
            local
        };

        let url = match custom {
            Some(raw) => Url::parse(raw.trim()).map_err(|e| ProvisionError::Parse {
                what: "custom download url".to_string(),
                message: format!("{raw}: {e}"),
            })?,
            None => resolver.resolve_download_link().await?,
        };

        progress::stage(op, ProvisionStage::Downloading, format!("downloading {url}"));
        let (archive, _) =
            download::download_archive(resolver.client(), &url, &staging.download_dir(), |r| {
                report(op, r)
            })
            .await?;

        progress::stage(op, ProvisionStage::Extracting, "extracting release");
        download::extract_archive(&archive, &staging.release_dir()).await?;

        progress::stage(op, ProvisionStage::Merging, "merging into instance");
        staging::merge_into(&staging.release_dir(), live, cfg.merge_policy).await?;

        let to = resolver.version_of(&url).or(remote);
        build_info::write_marker(
            live,
            &InstallMarker {
                version: to,
                download_url: url.to_string(),
                installed_at_unix_ms: now_unix_ms(),
            },
        )?;
        Ok(UpdateOutcome::Updated {
            from,
            to,
            download_url: url,
        })
    }

    pub fn is_install_valid(&self) -> bool {
        self.inner.config.executable_path().is_file()
    }

    /// Checks that `path` looks like a server package that can be imported.
    pub fn is_import_valid(&self, path: &Path) -> Result<()> {
        if path.join(IMPORT_MARKER_FILE).is_file() {
            return Ok(());
        }
        Err(ProvisionError::InvalidImport {
            path: path.to_path_buf(),
            marker: IMPORT_MARKER_FILE.to_string(),
        })
    }

    pub async fn local_build(&self) -> Result<BuildVersion> {
        let cfg = &self.inner.config;
        build_info::local_build(&cfg.executable_path(), &cfg.server_files()).await
    }

    pub async fn remote_build(&self) -> Result<BuildVersion> {
        self.inner.resolver.resolve_remote_version().await
    }
}

fn report(op: &OperationId, r: DownloadReport) {
    progress::update(
        op,
        UpdateArgs {
            downloaded_bytes: Some(r.downloaded_bytes),
            total_bytes: Some(r.total_bytes),
            speed_bytes_per_sec: Some(r.speed_bytes_per_sec),
            ..UpdateArgs::default()
        },
    );
}
