use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use controldeck_core::plugin::manager::format_snapshot;
use controldeck_core::{CommandOutcome, DeckHost, SettingsManager};

/// Upper bound on waiting for abandoned module calls at exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "controldeck")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Control Deck - discover, install and supervise service modules")]
struct Args {
    /// Workspace roots searched for .controldeck/plugins
    #[arg(long, value_delimiter = ',')]
    workspace_roots: Option<Vec<String>>,

    /// Settings file (defaults to ~/.controldeck/settings.toml)
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Installed modules and their health
    List,
    /// Modules found in plugin directories and repositories
    Available,
    /// Install from a path, a URL or a discovered module id
    Install {
        source: String,
        /// Replace a copy installed from a higher priority location
        #[arg(long)]
        force: bool,
    },
    Enable { id: String },
    Disable { id: String },
    /// Uninstall a module
    Remove { id: String },
    /// Check a module source without installing it
    Validate { path: PathBuf },
    /// Check every enabled service once
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print each snapshot as the poller publishes it
    Watch {
        /// Stop after this many snapshots
        #[arg(long)]
        cycles: Option<u64>,
    },
    Start { id: String },
    Stop { id: String },
    Restart { id: String },
    /// Remove the service itself, such as a container
    RemoveService { id: String },
}

fn main() -> ExitCode {
    if let Err(e) = setup_tracing() {
        eprintln!("Failed to initialise logging: {e:#}");
    }
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async_main(args));
    // Hung module calls must not hold the process open.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(outcome) => {
            if outcome.success {
                println!("{}", outcome.message);
                ExitCode::SUCCESS
            } else {
                eprintln!("{}", outcome.message);
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn async_main(args: Args) -> Result<CommandOutcome> {
    info!("CLI startup: command={:?}", args.command);

    let manager = match args.settings {
        Some(path) => SettingsManager::from_path(path)?,
        None => SettingsManager::new()?,
    };
    info!("Loaded settings from {:?}", manager.path());
    let settings = manager.settings();

    let workspace_roots = match args.workspace_roots {
        Some(roots) => roots
            .into_iter()
            .map(canonicalize_workspace_root)
            .collect::<Result<Vec<_>>>()?,
        None => vec![std::env::current_dir().context("Failed to get current directory")?],
    };

    let host = DeckHost::builder()
        .settings(settings)
        .workspace_roots(workspace_roots)
        .build()?;

    let restored = host.restore().await?;
    for (id, error) in &restored.failed {
        warn!(module = %id, error = %error, "Module unavailable");
    }

    let outcome = match args.command {
        Command::List => host.list(),
        Command::Available => host.available().await,
        Command::Install { source, force } => {
            if force {
                host.force_install(&source).await?
            } else {
                host.install(&source).await?
            }
        }
        Command::Enable { id } => host.enable(&id).await?,
        Command::Disable { id } => host.disable(&id).await?,
        Command::Remove { id } => host.remove(&id).await?,
        Command::Validate { path } => host.validate(&path),
        Command::Status { json } => {
            if json {
                let snapshot = host.refresh_status().await;
                CommandOutcome::ok(serde_json::to_string_pretty(snapshot.as_ref())?)
            } else {
                host.status().await
            }
        }
        Command::Watch { cycles } => watch(&host, cycles).await?,
        Command::Start { id } => host.start(&id).await,
        Command::Stop { id } => host.stop(&id).await,
        Command::Restart { id } => host.restart(&id).await,
        Command::RemoveService { id } => host.remove_service(&id).await,
    };

    Ok(outcome)
}

/// Follows the background poller until `cycles` snapshots were printed or
/// Ctrl-C is pressed.
async fn watch(host: &DeckHost, cycles: Option<u64>) -> Result<CommandOutcome> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut snapshots = host.poller().subscribe();
    let poller = host.spawn_poller(shutdown_rx);

    let mut printed = 0u64;
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}\n", format_snapshot(&snapshot));
                printed += 1;
                if cycles.is_some_and(|limit| printed >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = shutdown_tx.send(true);
    poller.await.context("Status poller task failed")?;
    Ok(CommandOutcome::ok(format!("Watched {printed} snapshots")))
}

fn canonicalize_workspace_root(root: String) -> Result<PathBuf> {
    let path = PathBuf::from(&root);
    path.canonicalize()
        .map_err(|e| anyhow::anyhow!("Failed to canonicalize workspace root {root}: {e:?}"))
}

fn setup_tracing() -> Result<()> {
    use std::fs;
    use tracing_subscriber::fmt;

    let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
    let trace_dir = home.join(".controldeck").join("trace");
    fs::create_dir_all(&trace_dir)?;

    let log_file = trace_dir.join("controldeck.log");
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter)
        .init();

    info!("Tracing initialized to {:?}", log_file);
    Ok(())
}
