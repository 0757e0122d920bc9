use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use gsm_agent::{
    FileSink, InstanceConfig, MultiSink, OutputSink, SampServer, TracingSink, UpdateOutcome,
    format_error_chain,
};
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser)]
#[command(name = "gsm-agent")]
#[command(about = "Install, update and run a SA-MP dedicated server instance")]
struct Cli {
    /// Instance definition (TOML)
    #[arg(long, short, env = "GSM_INSTANCE_CONFIG", default_value = "instance.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and unpack the current release into the instance directory
    Install,
    /// Reinstall when the remote build differs, keeping server.cfg
    Update {
        /// Reinstall even when the builds match
        #[arg(long)]
        validate: bool,
        /// Download from this URL instead of the resolved link
        #[arg(long)]
        url: Option<String>,
    },
    /// Print the local and remote builds
    Check,
    /// Write server.cfg (stock template if missing) with instance values
    CreateConfig,
    /// Check that a directory holds an importable server package
    VerifyImport { path: PathBuf },
    /// Run the server until Ctrl+C
    Start,
}

/// Keeps the non-blocking file writer flushing until main returns.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, guard) = match std::env::var("GSM_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "gsm-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn console_sink(cfg: &InstanceConfig) -> anyhow::Result<Arc<dyn OutputSink>> {
    let log_path = cfg.instance_dir("logs/console.log")?;
    let file = FileSink::open(log_path.clone())
        .await
        .with_context(|| format!("open console log {}", log_path.display()))?;
    Ok(Arc::new(
        MultiSink::new()
            .with(Arc::new(TracingSink::new(cfg.server_id.to_string())))
            .with(Arc::new(file)),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    let cfg = InstanceConfig::load(&cli.config)
        .with_context(|| format!("load instance config {}", cli.config.display()))?;
    let sink: Arc<dyn OutputSink> = match cli.command {
        Commands::Start => console_sink(&cfg).await?,
        _ => Arc::new(TracingSink::new(cfg.server_id.to_string())),
    };
    let server = SampServer::new(cfg, sink)?;

    match cli.command {
        Commands::Install => {
            let release = server.install().await?;
            match release.version {
                Some(v) => println!("installed {v} from {}", release.download_url),
                None => println!("installed from {}", release.download_url),
            }
        }
        Commands::Update { validate, url } => {
            let task = server.update(validate, url);
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            while !task.is_finished() {
                ticker.tick().await;
                if let Some(p) = task.progress() {
                    tracing::info!(
                        stage = %p.stage,
                        downloaded = p.downloaded_bytes,
                        total = p.total_bytes,
                        "{}",
                        p.message
                    );
                }
            }
            match task.wait().await? {
                UpdateOutcome::UpToDate { version } => {
                    println!("Skipping Update Same Version. ({version})")
                }
                UpdateOutcome::Updated { from, to, .. } => println!(
                    "updated {} -> {}",
                    from.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string()),
                    to.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string())
                ),
            }
        }
        Commands::Check => {
            match server.local_build().await {
                Ok(v) => println!("local:  {v}"),
                Err(e) => println!("local:  unknown ({})", format_error_chain(&e)),
            }
            match server.remote_build().await {
                Ok(v) => println!("remote: {v}"),
                Err(e) => println!("remote: unknown ({})", format_error_chain(&e)),
            }
        }
        Commands::CreateConfig => {
            server.create_default_config().await?;
            println!("{}", server.config().config_path().display());
        }
        Commands::VerifyImport { path } => {
            server.is_import_valid(&path)?;
            println!("ok");
        }
        Commands::Start => {
            let handle = server.start().await?;
            tokio::select! {
                status = handle.wait() => {
                    tracing::warn!(state = ?status.state, exit_code = ?status.exit_code, "server exited on its own");
                }
                res = tokio::signal::ctrl_c() => {
                    res.context("listen for ctrl-c")?;
                    server.stop(&handle)?;
                    let status = handle.wait().await;
                    tracing::info!(state = ?status.state, exit_code = ?status.exit_code, "server stopped");
                }
            }
        }
    }

    Ok(())
}
