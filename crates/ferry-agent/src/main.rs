//! ferry-agent
//!
//! Invoked periodically by an external scheduler (`ping`), once at install
//! time and whenever sources change (`update-config`), and by hand when a
//! restore is needed (`restore`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferry_agent::coordinator::{CoordinatorClient, MachineAuth};
use ferry_agent::daemon::{RsyncDaemonManager, RsyncSettings};
use ferry_agent::restore::{MachineLabels, RestoreController, RestoreSettings};
use ferry_agent::tunnel::{SshTunnelManager, TunnelSettings};
use ferry_agent::{gonogo, registration, shutdown, Launchers, PingOrchestrator};
use ferry_core::config::{self, AgentConfig};
use ferry_core::lock::RunLock;

#[derive(Parser)]
#[command(name = "ferry-agent")]
#[command(about = "ferry backup agent - serves scheduled backups and restores through a reverse tunnel")]
#[command(version)]
struct Cli {
    /// Configuration directory
    #[arg(short = 'c', long, global = true)]
    config_dir: Option<PathBuf>,

    /// Verbose output (same as --log-level debug)
    #[arg(long, global = true)]
    debug: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check in with the coordinator and serve any scheduled backups
    Ping {
        /// Sleep a random time up to this many seconds first
        #[arg(short, long)]
        wait: Option<f64>,

        /// Program that must exit 0 for the check-in to go ahead
        #[arg(long)]
        gonogo_program: Option<String>,
    },

    /// Open a writable session so a storage unit can push files back
    Restore {
        /// Storage unit to restore from (default: every unit, in turn)
        #[arg(long)]
        restore_storage: Option<String>,

        /// Sleep a random time up to this many seconds first
        #[arg(short, long)]
        wait: Option<f64>,
    },

    /// Register this machine and push its sources to the coordinator
    UpdateConfig {
        /// Registration name
        #[arg(long, requires = "api_auth_secret")]
        api_auth_name: Option<String>,

        /// Registration secret
        #[arg(long, requires = "api_auth_name")]
        api_auth_secret: Option<String>,

        /// Sleep a random time up to this many seconds first
        #[arg(short, long)]
        wait: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout is reserved for restore instructions
    let log_level = if cli.debug { "debug" } else { &cli.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ferry-agent: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_dir = cli.config_dir.unwrap_or_else(config::default_config_dir);

    match cli.command {
        Commands::Ping {
            wait,
            gonogo_program,
        } => {
            random_wait(wait).await;
            let config = load_config(&config_dir)?;
            ping(config, gonogo_program).await
        }
        Commands::Restore {
            restore_storage,
            wait,
        } => {
            random_wait(wait).await;
            let config = load_config(&config_dir)?;
            restore(config, restore_storage).await
        }
        Commands::UpdateConfig {
            api_auth_name,
            api_auth_secret,
            wait,
        } => {
            random_wait(wait).await;
            let config = load_config(&config_dir)?;
            update_config(config, api_auth_name, api_auth_secret).await
        }
    }
}

async fn ping(config: AgentConfig, gonogo_program: Option<String>) -> Result<ExitCode> {
    let Some(machine) = machine_auth(&config) else {
        tracing::debug!("Missing required configs, exiting silently");
        return Ok(ExitCode::SUCCESS);
    };

    let program: Vec<String> = match gonogo_program {
        Some(line) => line.split_whitespace().map(String::from).collect(),
        None => config
            .gonogo_program
            .as_ref()
            .map(|p| p.argv())
            .unwrap_or_default(),
    };
    if !gonogo::should_go(&program).await {
        return Ok(ExitCode::SUCCESS);
    }

    let _lock = RunLock::acquire(config.lock_dir.as_deref()).context("Failed to take run lock")?;

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone()).context("Failed to install signal handlers")?;

    let coordinator = Arc::new(coordinator_client(&config)?);
    let mut orchestrator = PingOrchestrator::new(
        coordinator,
        launchers(&config),
        machine,
        config.sources.clone(),
        config.session_max_duration,
    );

    let summary = orchestrator.run(&cancel).await;
    if summary.is_success() {
        return Ok(ExitCode::SUCCESS);
    }

    let message = match &summary.error {
        Some(e) => e.to_string(),
        None => {
            let failed = summary
                .sessions
                .iter()
                .filter(|s| s.status != ferry_agent::coordinator::ReportStatus::Success)
                .count();
            format!("{} of {} session(s) did not complete", failed, summary.sessions.len())
        }
    };
    eprintln!("ferry-agent: ping {}: {}", summary.state, message);
    Ok(ExitCode::FAILURE)
}

async fn restore(config: AgentConfig, restore_storage: Option<String>) -> Result<ExitCode> {
    let machine = machine_auth(&config).context("Machine is not registered; run update-config first")?;

    let _lock = RunLock::acquire(config.lock_dir.as_deref()).context("Failed to take run lock")?;

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone()).context("Failed to install signal handlers")?;

    tracing::info!("Entering restore mode");
    let controller = RestoreController::new(
        Arc::new(coordinator_client(&config)?),
        launchers(&config),
        machine,
        MachineLabels {
            environment_name: config.environment_name.clone(),
            service_name: config.service_name.clone(),
            unit_name: Some(config.unit_name()),
        },
        config.sources.clone(),
        RestoreSettings {
            destination: config.restore_path.clone(),
            module: config.restore_module.clone(),
            max_duration: config.restore_max_duration,
        },
    );

    let mut out = std::io::stdout();
    let served = controller
        .run(restore_storage.as_deref(), &mut out, &cancel)
        .await
        .context("Restore failed")?;
    tracing::info!("Restore finished after {} session(s)", served.len());
    Ok(ExitCode::SUCCESS)
}

async fn update_config(
    mut config: AgentConfig,
    api_auth_name: Option<String>,
    api_auth_secret: Option<String>,
) -> Result<ExitCode> {
    if config.api_url.is_none() {
        anyhow::bail!("Required config \"api_url\" not found");
    }

    let _lock = RunLock::acquire(config.lock_dir.as_deref()).context("Failed to take run lock")?;

    registration::ensure_directories(&config)?;
    registration::ensure_identity(&mut config)?;
    registration::ensure_ssh_key(&config.ssh_private_key_file(), &config.ssh_key_type).await?;

    let auth = registration::registration_auth(
        &config,
        api_auth_name.as_deref(),
        api_auth_secret.as_deref(),
    );
    let coordinator = coordinator_client(&config)?;
    registration::send_config(&mut config, &coordinator, auth)
        .await
        .context("Failed to send configuration to coordinator")?;
    Ok(ExitCode::SUCCESS)
}

fn load_config(config_dir: &std::path::Path) -> Result<AgentConfig> {
    config::load_agent_config(config_dir)
        .with_context(|| format!("Failed to load configuration from {:?}", config_dir))
}

fn machine_auth(config: &AgentConfig) -> Option<MachineAuth> {
    if !config.is_registered() {
        return None;
    }
    config
        .machine_credentials()
        .map(|(uuid, secret)| MachineAuth {
            uuid,
            secret: secret.to_string(),
        })
}

fn coordinator_client(config: &AgentConfig) -> Result<CoordinatorClient> {
    let api_url = config
        .api_url
        .as_deref()
        .context("Required config \"api_url\" not found")?;
    CoordinatorClient::new(api_url, config.api_timeout).context("Failed to create coordinator client")
}

fn launchers(config: &AgentConfig) -> Launchers {
    Launchers {
        daemons: Arc::new(RsyncDaemonManager::new(RsyncSettings::from_config(config))),
        tunnels: Arc::new(SshTunnelManager::new(TunnelSettings::from_config(config))),
    }
}

/// Sleep uniformly in `[0, max_secs)` to spread load across machines
async fn random_wait(max_secs: Option<f64>) {
    let Some(max_secs) = max_secs.filter(|s| s.is_finite() && *s > 0.0) else {
        return;
    };
    let secs = rand::thread_rng().gen_range(0.0..max_secs);
    if let Some(delay) = wait_duration(secs) {
        tracing::debug!("Waiting {:.1} seconds", secs);
        tokio::time::sleep(delay).await;
    }
}

fn wait_duration(secs: f64) -> Option<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(delay) => Some(delay),
        Err(e) => {
            tracing::warn!("Skipping random wait of {} seconds: {}", secs, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_duration_in_range() {
        assert_eq!(wait_duration(2.5), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_wait_duration_out_of_range_skipped() {
        assert_eq!(wait_duration(1e300), None);
        assert_eq!(wait_duration(-1.0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_random_wait_does_not_panic() {
        // Large enough that most draws exceed what a Duration can hold
        random_wait(Some(1e300)).await;
        random_wait(Some(f64::INFINITY)).await;
    }
}
