//! PingTunnel VPN CLI
//!
//! Command-line front end for the connection supervisor: gates startup on
//! single-instance and elevation, replays any outstanding recovery journal,
//! then drives connect/disconnect around a Ctrl-C wait.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use ptvpn_engine::{
    install_panic_trap, ConfigStore, ConnectionState, JournalStore, LoggingEventHandler,
    ProcessSupervisor, SingleInstance, SupervisorOptions, VpnConfiguration, VpnSupervisor,
    EXIT_FAILURE,
};

/// PingTunnel VPN - route a Windows endpoint through an ICMP-carried tunnel
#[derive(Parser)]
#[command(name = "ptvpn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Per-user data directory override
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Skip the administrator check (diagnostics only; connects will fail)
    #[arg(long, hide = true)]
    skip_elevation_check: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect with the selected server and stay up until Ctrl-C (default)
    Run,

    /// Undo the system mutations of a previous unclean run, then exit
    Recover,

    /// List stored server configurations
    List,

    /// Select a server configuration by id or name
    Select {
        /// Record id or display name
        target: String,
    },

    /// Import a configuration file as a new server record
    Import {
        /// Path of a configuration JSON file
        path: PathBuf,
    },

    /// Export the selected server's configuration
    Export {
        /// Destination path
        path: PathBuf,
    },

    /// Write a sample server record into the store
    GenConfig,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            std::process::ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn run(cli: Cli) -> Result<()> {
    // Single instance before anything else; a second copy exits cleanly
    let _instance = match SingleInstance::acquire() {
        Ok(guard) => guard,
        Err(_) => {
            info!("Another instance is already running");
            return Ok(());
        }
    };

    // Elevation gate: relaunch elevated and let the new process take over
    if !cli.skip_elevation_check && !ptun_os::elevation::is_elevated() {
        drop(_instance);
        info!("Not elevated, requesting administrator relaunch");
        ptun_os::elevation::relaunch_elevated()
            .context("elevation request failed; run as Administrator")?;
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(ptvpn_engine::paths::data_dir);
    let resource_dir = ptvpn_engine::paths::resource_dir();

    let store = Arc::new(ConfigStore::open(&data_dir).context("failed to open config store")?);
    let journal = Arc::new(JournalStore::at(data_dir.join("state.json")));

    let os = ptun_os::OsHandle::native().context("failed to initialize OS bindings")?;

    // Replay an outstanding undo journal before anything touches the system
    if journal.needs_recovery() {
        warn!("Unclean shutdown detected, recovering previous session state");
        journal
            .recover(&os, &resource_dir)
            .await
            .context("crash recovery failed")?;
    }

    // Anything carrying our fingerprints at startup is an orphan
    sweep_orphans(&os, &resource_dir).await;

    let (procs, process_events) = ProcessSupervisor::new(resource_dir.clone());

    let supervisor = VpnSupervisor::new(
        os,
        store.clone(),
        journal,
        procs,
        process_events,
        Arc::new(LoggingEventHandler),
        SupervisorOptions {
            require_elevation: !cli.skip_elevation_check,
            ..SupervisorOptions::default()
        },
    );

    install_panic_trap(supervisor.clone(), data_dir.join("crash.log"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_session(supervisor).await,
        Commands::Recover => {
            // Recovery already ran above; nothing further to do
            info!("Recovery sweep complete");
            Ok(())
        }
        Commands::List => {
            let selected = store.selected().map(|r| r.id);
            for record in store.list() {
                let marker = if Some(record.id) == selected { "*" } else { " " };
                println!(
                    "{} {}  {}  {}:{}",
                    marker,
                    record.id,
                    record.name,
                    record.configuration.server_address,
                    record.configuration.local_socks_port
                );
            }
            Ok(())
        }
        Commands::Select { target } => {
            let record = resolve_record(&store, &target)?;
            store.select(record.id)?;
            info!("Selected '{}'", record.name);
            Ok(())
        }
        Commands::Import { path } => {
            let record = store.import(&path).context("import failed")?;
            info!("Imported '{}' ({})", record.name, record.id);
            Ok(())
        }
        Commands::Export { path } => {
            store.export(&path).context("export failed")?;
            info!("Exported selected configuration to {:?}", path);
            Ok(())
        }
        Commands::GenConfig => {
            let record = store.add(
                "example",
                VpnConfiguration {
                    server_address: "tunnel.example.net".into(),
                    server_key: "change-me".into(),
                    local_socks_port: 1080,
                },
            )?;
            info!("Wrote sample record '{}' ({})", record.name, record.id);
            println!("Edit {:?} and set your server before connecting.", record.name);
            Ok(())
        }
    }
}

/// Kill leftover helper processes shipped from our resource directory and
/// remove firewall rules carrying the owned prefix.
async fn sweep_orphans(os: &ptun_os::OsHandle, resource_dir: &std::path::Path) {
    use ptvpn_engine::HelperKind;

    let killed = ptun_os::kill_orphans_under(
        os.processes.as_ref(),
        resource_dir,
        &[
            HelperKind::TunnelClient.image_name(),
            HelperKind::TunRouter.image_name(),
        ],
    )
    .await;
    if killed > 0 {
        warn!("Killed {} orphaned helper process(es)", killed);
    }

    match os
        .firewall
        .list_rules_with_prefix(ptun_os::OWNED_RULE_PREFIX)
        .await
    {
        Ok(rules) => {
            for rule in rules {
                warn!("Removing orphaned firewall rule {}", rule);
                if let Err(e) = os.firewall.remove_rule(&rule).await {
                    warn!("Failed to remove {}: {}", rule, e);
                }
            }
        }
        Err(e) => warn!("Firewall orphan scan failed: {}", e),
    }
}

async fn run_session(supervisor: Arc<VpnSupervisor>) -> Result<()> {
    info!("Connecting...");
    supervisor.connect().await.context("connect failed")?;
    info!("Connected. Press Ctrl-C to disconnect.");

    wait_for_shutdown().await;

    info!("Disconnecting...");
    if supervisor.state().await.can_disconnect() {
        if let Err(e) = supervisor.disconnect().await {
            error!("Disconnect failed: {}", e);
        }
    }

    match supervisor.state().await {
        ConnectionState::Disconnected => Ok(()),
        state => bail!("session ended in state {}", state),
    }
}

fn resolve_record(
    store: &ConfigStore,
    target: &str,
) -> Result<ptvpn_engine::ServerRecord> {
    if let Ok(id) = target.parse::<Uuid>() {
        if let Some(record) = store.get(id) {
            return Ok(record);
        }
    }
    store
        .list()
        .into_iter()
        .find(|r| r.name == target)
        .with_context(|| format!("no server record matching '{}'", target))
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_default_run() {
        let cli = Cli::parse_from(["ptvpn"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_parses_select() {
        let cli = Cli::parse_from(["ptvpn", "select", "home-server"]);
        match cli.command {
            Some(Commands::Select { target }) => assert_eq!(target, "home-server"),
            _ => panic!("expected select subcommand"),
        }
    }

    #[test]
    fn test_cli_parses_data_dir_and_level() {
        let cli = Cli::parse_from(["ptvpn", "--data-dir", "/tmp/x", "-l", "debug", "recover"]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Some(Commands::Recover)));
    }
}
