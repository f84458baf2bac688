//! dbtunnel: open a supervised tunnel to a named database.
//!
//! Two subcommands:
//! - `dbtunnel connect`: resolve, validate, allocate, then hold the tunnel open
//!   in the foreground until Ctrl-C or the transport exits
//! - `dbtunnel check`: verify the local prerequisites without connecting

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dbtunnel::prereq::all_passed;
use dbtunnel::{
    resolve_identity, AwsSsoCredentialStore, ConfiguredConnector, ConnectRequest,
    ConnectionReporter, DatabaseRef, PrereqChecker, TunnelConfig, TunnelState,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "dbtunnel.toml";

/// dbtunnel: supervised port-forwarding tunnels to private databases.
#[derive(Parser)]
#[command(
    name = "dbtunnel",
    version,
    about = "Open a local tunnel to a database behind a bastion host"
)]
struct Cli {
    /// Path to dbtunnel.toml [default: ./dbtunnel.toml or ~/.config/dbtunnel/dbtunnel.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Show operator details and transport output
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a tunnel and keep it open until Ctrl-C
    Connect {
        /// Canonical database name, e.g. hk-postgres-dev
        #[arg(
            conflicts_with_all = ["project", "engine", "environment"],
            required_unless_present_all = ["project", "engine", "environment"]
        )]
        name: Option<String>,
        /// Project segment of the database name
        #[arg(long)]
        project: Option<String>,
        /// Engine segment (postgres, mariadb, mysql)
        #[arg(long)]
        engine: Option<String>,
        /// Environment segment (dev, qa, prod, ...)
        #[arg(long = "env")]
        environment: Option<String>,
        /// AWS profile to use [default: default_profile from config]
        #[arg(long)]
        profile: Option<String>,
        /// Local port; fails if busy instead of picking another
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: Option<u16>,
        /// Never run `aws sso login`; fail when the session is expired
        #[arg(long)]
        no_login: bool,
    },
    /// Check AWS CLI, Session Manager plugin, profile and session
    Check {
        /// AWS profile to check [default: default_profile from config]
        #[arg(long)]
        profile: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise `--verbose` turns on debug logs for the library.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "dbtunnel=debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = resolve_config(cli.config);
    let mut config = load_config(config_path.as_deref()).await?;

    match cli.command {
        Commands::Connect {
            name,
            project,
            engine,
            environment,
            profile,
            port,
            no_login,
        } => {
            if no_login {
                config.session.auto_login = false;
            }
            let database = match (name, project, engine, environment) {
                (Some(name), _, _, _) => DatabaseRef::Name(name),
                (None, Some(project), Some(engine), Some(environment)) => DatabaseRef::Parts {
                    project,
                    engine,
                    environment,
                },
                _ => anyhow::bail!("give a database name or all of --project, --engine and --env"),
            };
            let request = ConnectRequest {
                database,
                local_port: port,
            };
            run_connect(&config, profile.as_deref(), request, cli.verbose).await
        }
        Commands::Check { profile } => run_check(&config, profile.as_deref()).await,
    }
}

/// Prepare the tunnel, hold it open, print the final report.
async fn run_connect(
    config: &TunnelConfig,
    profile: Option<&str>,
    request: ConnectRequest,
    verbose: bool,
) -> Result<ExitCode> {
    let identity = resolve_identity(profile, config);
    let reporter = ConnectionReporter::new(&identity, verbose);
    let connector = ConfiguredConnector::from_config(config, &identity)?;

    eprintln!("Using AWS profile '{}'", identity);
    let prepared = match connector.prepare(&request).await {
        Ok(prepared) => prepared,
        Err(e) => {
            let report = reporter.setup_error(&e);
            eprintln!("{}", report.render());
            return Ok(ExitCode::from(report.exit_code));
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let (state_tx, mut state_rx) = watch::channel(TunnelState::Starting);
    let banner = reporter
        .connected(&prepared.descriptor, prepared.local_port)
        .join("\n");
    let printer = tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            match state {
                TunnelState::Active => println!("{}\n", banner),
                TunnelState::Closing => eprintln!("Closing tunnel..."),
                TunnelState::Closed(_) => break,
                TunnelState::Starting => {}
            }
        }
    });

    eprintln!(
        "Starting tunnel to {} on port {}...",
        prepared.descriptor.name(),
        prepared.local_port
    );
    let outcome = connector.open(&prepared, cancel, state_tx).await;
    let _ = printer.await;

    let report = reporter.report(&prepared.descriptor, prepared.local_port, &outcome);
    if report.is_success() {
        println!("{}", report.render());
    } else {
        eprintln!("{}", report.render());
    }
    Ok(ExitCode::from(report.exit_code))
}

/// Print one line per prerequisite; nonzero exit when any fails.
async fn run_check(config: &TunnelConfig, profile: Option<&str>) -> Result<ExitCode> {
    let identity = resolve_identity(profile, config);
    let store = AwsSsoCredentialStore::from_config(config);
    let results = PrereqChecker::from_config(config).run(&store, &identity).await;

    for r in &results {
        let mark = if r.passed { "ok" } else { "FAIL" };
        println!("[{:>4}] {:<24} {}", mark, r.name, r.detail);
    }

    if all_passed(&results) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Ctrl-C (and SIGTERM on unix) cancels the tunnel instead of killing the process.
/// Every signal is relayed, so a second Ctrl-C while closing is acknowledged.
fn spawn_signal_handler(cancel: CancellationToken) {
    let (tx, rx) = mpsc::unbounded_channel();

    let ctrl_c_tx = tx.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if ctrl_c_tx.send(()).is_err() {
                break;
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::spawn(async move {
                    while term.recv().await.is_some() {
                        if tx.send(()).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    #[cfg(not(unix))]
    drop(tx);

    tokio::spawn(relay_interrupts(rx, cancel));
}

/// First signal cancels; later ones only report that shutdown is under way.
/// Returns how many signals were seen once every sender is gone.
async fn relay_interrupts(mut rx: mpsc::UnboundedReceiver<()>, cancel: CancellationToken) -> usize {
    let mut seen = 0;
    while rx.recv().await.is_some() {
        seen += 1;
        if cancel.is_cancelled() {
            tracing::warn!(signals = seen, "already closing");
            eprintln!("Tunnel is already closing, waiting for the transport to exit...");
        } else {
            tracing::info!("cancellation requested");
            cancel.cancel();
        }
    }
    seen
}

/// Resolve config file path: explicit flag → ./dbtunnel.toml → <config_dir>/dbtunnel/dbtunnel.toml.
/// `None` means built-in defaults.
fn resolve_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }

    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        return Some(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("dbtunnel").join(CONFIG_FILE);
        if xdg.exists() {
            return Some(xdg);
        }
    }

    None
}

/// Load, parse and validate a dbtunnel.toml config file.
async fn load_config(config_path: Option<&Path>) -> Result<TunnelConfig> {
    let Some(config_path) = config_path else {
        tracing::debug!("no config file found, using defaults");
        return Ok(TunnelConfig::default());
    };
    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", config_path, e))?;
    let config: TunnelConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", config_path, e))?;
    config.validate()?;
    tracing::debug!(path = %config_path.display(), "config loaded");
    Ok(config)
}
