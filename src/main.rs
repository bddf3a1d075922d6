//! `kwmd` process entry point (§4.10, §7, §9).
//!
//! Wires the three broker workers (server connection, crypto helper,
//! external client) onto their own OS threads, opens the persistence
//! facade, and runs `WorkspaceManager::pass` from the main thread in a
//! loop until a shutdown signal arrives. No component here touches
//! workspace state directly — this file only spawns and glues.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use kwmd::client::{ExternalClientBroker, ManagerToClientBroker};
use kwmd::config::{CliOverrides, RuntimeConfig};
use kwmd::constants::SUBPROCESS_POLL_INTERVAL;
use kwmd::error::CoreError;
use kwmd::helper::broker::{CryptoHelperBroker, ManagerToHelper};
use kwmd::persistence::FileStore;
use kwmd::server::broker::{ManagerToBroker, ServerConnectionBroker};
use kwmd::{MainStatus, WorkspaceManager};

#[derive(Parser)]
#[command(name = "kwmd")]
#[command(version)]
#[command(about = "Workgroup-manager collaboration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts the coordinator and its brokers (§4.6).
    Run {
        /// Path to a `kwmd.toml` file; defaults to the platform config dir.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Log to stderr instead of the daemon log file.
        #[arg(long)]
        foreground: bool,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        socket_path: Option<PathBuf>,
    },
    /// Dumps the merged, resolved configuration as JSON and exits (§4.10).
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Internal: reads a crash description from stdin and writes a
    /// timestamped report file. Invoked by the fatal-error reporter, not
    /// by an operator directly.
    ReportCrash,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, foreground, data_dir, socket_path } => {
            install_crash_reporting_panic_hook();
            run(config, foreground, data_dir, socket_path)
        }
        Commands::PrintConfig { config } => print_config(config),
        Commands::ReportCrash => report_crash(),
    }
}

/// Installs a panic hook that spawns the `report-crash` subcommand with the
/// panic message before falling through to the default hook (§7: a fatal
/// `Internal` condition gets a best-effort out-of-process report).
fn install_crash_reporting_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        spawn_crash_reporter(&CoreError::internal(panic_info.to_string()));
        default_hook(panic_info);
    }));
}

fn print_config(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RuntimeConfig::load(config_path.as_deref(), CliOverrides::default()).context("loading configuration")?;
    println!("{}", cfg.to_json_pretty().context("rendering configuration")?);
    Ok(())
}

fn report_crash() -> Result<()> {
    use std::io::Read;
    let mut description = String::new();
    std::io::stdin().read_to_string(&mut description).context("reading crash description from stdin")?;

    let dir = kwmd::config::default_config_dir().join("crashes");
    std::fs::create_dir_all(&dir).context("creating crash report directory")?;
    let path = dir.join(format!("crash-{}.txt", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
    std::fs::write(&path, description).context("writing crash report")?;
    eprintln!("crash report written to {}", path.display());
    Ok(())
}

fn run(config_path: Option<PathBuf>, foreground: bool, data_dir: Option<PathBuf>, socket_path: Option<PathBuf>) -> Result<()> {
    let cli_overrides = CliOverrides { data_dir, socket_path };
    let config = RuntimeConfig::load(config_path.as_deref(), cli_overrides).context("loading configuration")?;
    init_logging(&config, foreground).context("initializing logging")?;
    config.ensure_data_dir().context("creating data directory")?;

    log::info!("kwmd starting, data_dir={}", config.data_dir.display());

    let passphrase = config.encryption_passphrase.clone().unwrap_or_default();
    let store = Box::new(FileStore::open(&config.data_dir, &passphrase).context("opening persistence store")?);

    let (to_broker, from_manager_broker) = channel::<ManagerToBroker>();
    let (to_manager_broker, from_broker) = channel();
    let server_broker = ServerConnectionBroker::new(from_manager_broker, to_manager_broker).context("initializing server-connection broker")?;
    let server_waker = server_broker.waker();
    std::thread::Builder::new()
        .name("server-broker".into())
        .spawn(move || run_server_broker(server_broker))
        .context("spawning server-connection broker thread")?;

    let (to_helper, from_manager_helper) = channel::<ManagerToHelper>();
    let (to_manager_helper, from_helper) = channel();
    let helper_broker = CryptoHelperBroker::new(config.helper_path.clone(), from_manager_helper, to_manager_helper);
    std::thread::Builder::new()
        .name("crypto-helper-broker".into())
        .spawn(move || run_helper_broker(helper_broker))
        .context("spawning crypto-helper broker thread")?;

    let (to_client, from_manager_client) = channel::<ManagerToClientBroker>();
    let (to_manager_client, from_client) = channel();
    let socket_path_for_broker = config.socket_path.clone();
    std::thread::Builder::new()
        .name("external-client-broker".into())
        .spawn(move || {
            let broker = ExternalClientBroker::new(socket_path_for_broker);
            if let Err(e) = broker.run(to_manager_client, from_manager_client) {
                log::error!("external-client broker exited: {e}");
            }
        })
        .context("spawning external-client broker thread")?;

    let mut manager = WorkspaceManager::new(config, store, to_broker, from_broker, to_helper, from_helper, to_client, from_client);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || shutdown_handler.store(true, Ordering::SeqCst)).context("installing signal handler")?;

    let mut stop_requested = false;
    loop {
        if shutdown.load(Ordering::SeqCst) && !stop_requested {
            log::info!("shutdown signal received, stopping workspaces");
            manager.request_stop();
            stop_requested = true;
        }

        let next = manager.pass(Instant::now());
        if manager.main_status() == MainStatus::Stopped {
            break;
        }

        server_waker.wake().ok();
        let sleep_for = next.saturating_duration_since(Instant::now()).min(Duration::from_millis(200));
        std::thread::sleep(sleep_for);
    }

    log::info!("kwmd stopped");
    Ok(())
}

fn run_server_broker(mut broker: ServerConnectionBroker) {
    loop {
        if let Err(e) = broker.run_once() {
            log::error!("server-connection broker iteration failed: {e}");
        }
    }
}

fn run_helper_broker(mut broker: CryptoHelperBroker) {
    loop {
        broker.run_once();
        std::thread::sleep(SUBPROCESS_POLL_INTERVAL);
    }
}

fn init_logging(config: &RuntimeConfig, foreground: bool) -> std::io::Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if foreground {
        builder.target(env_logger::Target::Stderr);
    } else {
        let log_path = config.data_dir.join("kwmd.log");
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

/// Fatal `Internal` errors spawn this binary's own `report-crash`
/// subcommand, piping the error text on stdin, before the process exits
/// non-zero (§7). Best-effort: a failure to spawn the reporter is silently
/// swallowed — the original fatal error is what matters.
fn spawn_crash_reporter(err: &CoreError) {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let exe = match std::env::current_exe() {
        Ok(path) => path,
        Err(_) => return,
    };
    let child = Command::new(exe).arg("report-crash").stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::null()).spawn();
    if let Ok(mut child) = child {
        if let Some(stdin) = child.stdin.as_mut() {
            let _ = stdin.write_all(err.to_string().as_bytes());
        }
        let _ = child.wait();
    }
}
