use std::{process::Stdio, sync::Arc};

use gsm_process::{InstanceId, ProcessState, ProcessStatus};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{Mutex, watch},
};

use crate::error::{ProvisionError, Result};
use crate::instance::InstanceConfig;
use crate::output::{OutputSink, OutputStream};
use crate::server_cfg::{self, Overrides, RCON_PASSWORD};

struct HandleInner {
    instance_id: InstanceId,
    pid: Option<u32>,
    status: watch::Sender<ProcessStatus>,
    stdin: Mutex<Option<ChildStdin>>,
}

/// A launched server process. Cloning shares the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("instance_id", &self.inner.instance_id)
            .field("pid", &self.inner.pid)
            .finish()
    }
}

fn is_finished(state: ProcessState) -> bool {
    matches!(state, ProcessState::Exited | ProcessState::Failed)
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    pub fn status(&self) -> ProcessStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !is_finished(self.inner.status.borrow().state)
    }

    /// Resolves once the process has exited.
    pub async fn wait(&self) -> ProcessStatus {
        let mut rx = self.inner.status.subscribe();
        match rx.wait_for(|s| is_finished(s.state)).await {
            Ok(s) => s.clone(),
            Err(_) => self.status(),
        }
    }

    /// Writes one line to the server console. Only available when output is
    /// redirected.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut guard = self.inner.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(ProvisionError::Process(
                "console input is not captured for this process".to_string(),
            ));
        };
        let mut buf = line.trim_end_matches(['\r', '\n']).to_string();
        buf.push('\n');
        stdin
            .write_all(buf.as_bytes())
            .await
            .map_err(|e| ProvisionError::Process(format!("write to console: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProvisionError::Process(format!("write to console: {e}")))?;
        Ok(())
    }

    fn mark_stopping(&self) {
        self.inner.status.send_modify(|s| {
            if !is_finished(s.state) {
                s.state = ProcessState::Stopping;
            }
        });
    }

    fn clear_stopping(&self) {
        self.inner.status.send_modify(|s| {
            if s.state == ProcessState::Stopping {
                s.state = ProcessState::Running;
            }
        });
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Take the server down with us if the agent dies.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn forward_lines<R>(reader: R, stream: OutputStream, sink: Arc<dyn OutputSink>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.line(stream, &line);
        }
    });
}

/// Launches the instance's server executable.
///
/// The config file is patched first with every override except the RCON
/// password. In redirected mode (`embed_console`) stdout and stderr are
/// forwarded line by line to `sink`; otherwise the child inherits the
/// agent's stdio.
pub async fn start(cfg: &InstanceConfig, sink: Arc<dyn OutputSink>) -> Result<ProcessHandle> {
    let exe = cfg.executable_path();
    let exists = tokio::fs::metadata(&exe)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !exists {
        return Err(ProvisionError::MissingExecutable {
            name: cfg.executable.clone(),
            path: exe,
        });
    }

    server_cfg::apply_overrides(
        &cfg.config_path(),
        &Overrides::for_instance(cfg),
        Some(RCON_PASSWORD),
    )
    .await?;

    let cwd = cfg.server_files();
    let args = cfg.launch_args();
    let redirect = cfg.embed_console;

    let mut cmd = Command::new(&exe);
    cmd.args(&args).current_dir(&cwd);
    if redirect {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
    } else {
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session so a stop signal reaches the whole process group.
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|e| {
        ProvisionError::Process(format!("spawn {} (cwd {}): {e}", exe.display(), cwd.display()))
    })?;
    let pid = child.id();
    tracing::info!(
        server_id = %cfg.server_id,
        pid = ?pid,
        exec = %exe.display(),
        args = %args.join(" "),
        redirect,
        "server started"
    );

    if let Some(out) = child.stdout.take() {
        forward_lines(out, OutputStream::Stdout, sink.clone());
    }
    if let Some(err) = child.stderr.take() {
        forward_lines(err, OutputStream::Stderr, sink.clone());
    }

    let (status_tx, _) = watch::channel(ProcessStatus {
        instance_id: cfg.server_id.clone(),
        state: ProcessState::Running,
        pid,
        exit_code: None,
        message: None,
    });
    let handle = ProcessHandle {
        inner: Arc::new(HandleInner {
            instance_id: cfg.server_id.clone(),
            pid,
            status: status_tx,
            stdin: Mutex::new(child.stdin.take()),
        }),
    };

    let waiter = handle.clone();
    tokio::spawn(async move {
        let res = child.wait().await;
        waiter.inner.stdin.lock().await.take();
        waiter.inner.status.send_modify(|s| {
            let stopping = matches!(s.state, ProcessState::Stopping);
            match res {
                Ok(status) => {
                    s.exit_code = status.code();
                    if stopping {
                        s.state = ProcessState::Exited;
                        s.message = Some("stopped".to_string());
                    } else if status.success() {
                        s.state = ProcessState::Exited;
                        s.message = Some("exited".to_string());
                    } else {
                        s.state = ProcessState::Failed;
                        s.message = Some(match status.code() {
                            Some(code) => format!("exited with code {code}"),
                            None => "terminated by signal".to_string(),
                        });
                    }
                }
                Err(err) => {
                    s.state = ProcessState::Failed;
                    s.message = Some(format!("wait failed: {err}"));
                }
            }
        });
        let s = waiter.status();
        tracing::info!(
            server_id = %s.instance_id,
            exit_code = ?s.exit_code,
            message = s.message.as_deref().unwrap_or(""),
            "server exited"
        );
    });

    Ok(handle)
}

/// Asks the server to shut down the way an operator pressing Ctrl+C in its
/// console would. Returns without waiting; use [`ProcessHandle::wait`] to
/// observe the exit.
pub fn stop(handle: &ProcessHandle) -> Result<()> {
    #[cfg(unix)]
    {
        stop_with(handle, interrupt_group)
    }

    #[cfg(not(unix))]
    {
        if !handle.is_running() {
            return Ok(());
        }
        Err(ProvisionError::Unsupported("graceful console stop"))
    }
}

/// SIGINT to the whole process group. A group that is already gone counts
/// as delivered.
#[cfg(unix)]
fn interrupt_group(pid: u32) -> std::io::Result<()> {
    // The child leads its own session, so its pid is the process group id.
    let rc = unsafe { libc::kill(-(pid as i32), libc::SIGINT) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn stop_with(
    handle: &ProcessHandle,
    send: impl FnOnce(u32) -> std::io::Result<()>,
) -> Result<()> {
    if !handle.is_running() {
        return Ok(());
    }
    let Some(pid) = handle.pid() else {
        return Ok(());
    };

    // Set before signalling so the exit watcher sees a requested stop.
    handle.mark_stopping();
    if let Err(err) = send(pid) {
        handle.clear_stopping();
        return Err(ProvisionError::Process(format!("signal pid {pid}: {err}")));
    }
    tracing::info!(server_id = %handle.instance_id(), pid, "sent console interrupt");
    Ok(())
}
