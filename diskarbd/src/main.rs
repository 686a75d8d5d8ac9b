//! Entry point for `diskarbd`.
//!
//! Argument parsing, the privilege check, daemonization, and PID-file
//! handling all happen synchronously, before any thread is spun up —
//! `nix::unistd::daemon`'s `fork()` is only safe before the process has
//! gone multi-threaded. Everything past that point (config, the telemetry
//! database, every registry, the kernel/console-user event sources, and
//! the RPC surface) is wired together on a single-threaded `tokio` runtime,
//! one task per concern, communicating over channels instead of sharing
//! state across OS threads, since the daemon's core loop has to interleave
//! many concurrent suspended per-disk stages rather than a few long-lived
//! workers.

use clap::Parser;
use futures::TryStreamExt;
use diskarbd::cleanup::ShutdownHandler;
use diskarbd::config::{Config, ConfigManager, MountMap};
use diskarbd::console_user::{ConsoleUserSource, LogindConsoleUserSource};
use diskarbd::daemon::{self, Daemon, DaemonCommand};
use diskarbd::db;
use diskarbd::ingest::{KernelEvent, KernelEventSource, UdevEventSource};
use diskarbd::rpc::{AuthenticatedUnixStream, RpcServer};
use diskarbd::stage;
use shared::constants::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, DEFAULT_STATE_DIR};
use shared::errors::ArbitrationError;
use shared::proto::rpc::disk_arbitration_server::DiskArbitrationServer;
use std::cell::RefCell;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnixListenerStream;

/// `diskarbd [-d] [--config PATH]` (spec.md §6).
#[derive(Parser)]
#[command(name = "diskarbd", about = "Arbitrates access to removable and fixed storage media")]
struct Cli {
    /// Enable debug logging and stay in the foreground instead of daemonizing.
    #[arg(short = 'd')]
    debug: bool,

    /// Override the config file path (defaults to $DISKARBD_CONFIG, then a built-in default).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    std::process::ExitCode::from(bootstrap(cli) as u8)
}

/// The synchronous half of startup: everything that must run before the
/// process forks and before the logger/runtime exist. Returns the process
/// exit code (spec.md §6/§7: usage 64, software 70, permission 77,
/// unavailable 69, OS error 71, ok 0).
fn bootstrap(cli: Cli) -> i32 {
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("diskarbd: permission denied.");
        return ArbitrationError::NotPrivileged.exit_code();
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config_mgr = match ConfigManager::new(&config_path) {
        Ok(mgr) => mgr,
        Err(e) => {
            eprintln!("diskarbd: {e}");
            return 70;
        }
    };
    let config = config_mgr.get();

    let mount_map = match MountMap::load(&config.mount_map_path) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("diskarbd: {e}");
            return 70;
        }
    };

    if already_running(&config.pid_file_path) {
        eprintln!("diskarbd: server is already active.");
        return 69;
    }

    if !cli.debug {
        if let Err(e) = nix::unistd::daemon(false, false) {
            eprintln!("diskarbd: could not daemonize: {e}");
            return 71;
        }
    }

    if let Err(e) = write_pid_file(&config.pid_file_path) {
        eprintln!("diskarbd: could not write pid file: {e}");
        return 71;
    }

    let _logger = match diskarbd::logger::init_logger(cli.debug) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("diskarbd: failed to initialize logging: {e}");
            let _ = std::fs::remove_file(&config.pid_file_path);
            return 70;
        }
    };

    log::info!("diskarbd starting (config={})", config_path.display());

    if let Err(e) = stage::sweep_stray_entries(&config.mount_root) {
        log::error!("failed to prepare mount root {}: {e}", config.mount_root.display());
        let _ = std::fs::remove_file(&config.pid_file_path);
        return 70;
    }
    if let Err(e) = std::fs::set_permissions(&config.mount_root, std::fs::Permissions::from_mode(0o1777)) {
        log::warn!("failed to set {} to mode 01777: {e}", config.mount_root.display());
    }

    let state_dir = PathBuf::from(DEFAULT_STATE_DIR);
    if let Err(e) = std::fs::create_dir_all(&state_dir) {
        log::warn!("failed to create state directory {}: {e}", state_dir.display());
    }
    // Telemetry is diagnostic-only (spec.md §1 Non-goals); a database
    // failure is logged and the daemon runs on without it rather than
    // treating it as a startup-fatal resource-acquisition failure.
    let db_conn = match db::init_database(&state_dir, &config.database) {
        Ok(conn) => Some(conn),
        Err(e) => {
            log::warn!("telemetry database unavailable, continuing without it: {e}");
            None
        }
    };

    let pid_file_path = config.pid_file_path.clone();
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start the async runtime: {e}");
            let _ = std::fs::remove_file(&pid_file_path);
            return 71;
        }
    };

    let exit = runtime.block_on(run_daemon(config, config_path, mount_map, db_conn));
    let _ = std::fs::remove_file(&pid_file_path);
    exit
}

fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// A stale PID file from a process that no longer exists does not count
/// (spec.md §6 PID file; original's `kDAServerStatusActive` check).
fn already_running(path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    Path::new(&format!("/proc/{pid}")).exists()
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Wires every collaborator into a `Daemon` and drives it to completion.
/// Runs entirely on the `tokio` current-thread runtime built in
/// `bootstrap`, inside a `LocalSet` so `Daemon`'s `Rc<RefCell<_>>` state
/// can be shared across spawned tasks (daemon.rs's module doc explains
/// why it isn't `Send`).
async fn run_daemon(config: Config, config_path: PathBuf, mount_map: MountMap, db_conn: Option<rusqlite::Connection>) -> i32 {
    let mount_map_path = config.mount_map_path.clone();
    let rpc_socket_path = config.rpc_socket_path.clone();
    let console_user_proxy_present = config.console_user_proxy_present;

    let local = tokio::task::LocalSet::new();
    let daemon = Rc::new(RefCell::new(Daemon::new(config, mount_map, db_conn)));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<DaemonCommand>();
    let (kernel_tx, kernel_rx) = mpsc::unbounded_channel::<KernelEvent>();
    let (console_tx, console_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());

    // Kernel storage-subsystem notifications (spec.md §4.3 sources (a)-(c)):
    // `udev`'s blocking netlink-read loop runs on a dedicated blocking
    // thread and forwards translated events into the main loop's channel.
    {
        let tx = kernel_tx.clone();
        tokio::task::spawn_blocking(move || {
            Box::new(UdevEventSource::new()).run(tx);
        });
    }

    // Mount-table notifications (spec.md §4.3 source (d)): there is no
    // blocking-read primitive for `/proc/self/mountinfo` changes on Linux
    // analogous to the original's notify-mount-table stream, so this polls.
    {
        let tx = kernel_tx.clone();
        local.spawn_local(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                ticker.tick().await;
                if tx.send(KernelEvent::MountTableChanged).is_err() {
                    break;
                }
            }
        });
    }

    // Console-user transitions, only when a console-user proxy (logind)
    // is configured to be present on this host.
    if console_user_proxy_present {
        let tx = console_tx.clone();
        tokio::task::spawn_blocking(move || {
            Box::new(LogindConsoleUserSource::new(Duration::from_secs(3))).run(tx);
        });
    }
    drop(console_tx);

    // The RPC surface (spec.md §6): a `tonic` service over a Unix domain
    // socket, every method forwarding into the event loop via `cmd_tx`.
    {
        let rpc_cmd_tx = cmd_tx.clone();
        let socket_path = rpc_socket_path.clone();
        tokio::task::spawn(async move {
            if let Err(e) = serve_rpc(&socket_path, rpc_cmd_tx).await {
                log::error!("RPC surface exited: {e}");
            }
        });
    }

    // SIGTERM/SIGINT trigger shutdown; SIGHUP reloads config + mount map.
    let shutdown_handler = {
        let shutdown_notify = Arc::clone(&shutdown);
        let reload_cmd_tx = cmd_tx.clone();
        let reload_config_path = config_path.clone();
        let reload_mount_map_path = mount_map_path.clone();
        ShutdownHandler::new(
            move || shutdown_notify.notify_one(),
            move || {
                let config = match Config::load(&reload_config_path) {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("SIGHUP: failed to reload {}: {e}", reload_config_path.display());
                        return;
                    }
                };
                let mount_map = match MountMap::load(&reload_mount_map_path) {
                    Ok(m) => m,
                    Err(e) => {
                        log::error!("SIGHUP: failed to reload {}: {e}", reload_mount_map_path.display());
                        return;
                    }
                };
                let _ = reload_cmd_tx.send(DaemonCommand::ReloadConfig { config, mount_map });
            },
        )
    };
    drop(cmd_tx);

    local
        .run_until(daemon::run(Rc::clone(&daemon), cmd_rx, kernel_rx, console_rx, shutdown))
        .await;

    drop(shutdown_handler);
    log::info!("diskarbd shut down cleanly");
    0
}

async fn serve_rpc(socket_path: &Path, commands: mpsc::UnboundedSender<DaemonCommand>) -> Result<(), Box<dyn std::error::Error>> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = tokio::net::UnixListener::bind(socket_path)?;
    log::info!("RPC surface listening on {}", socket_path.display());
    let incoming = UnixListenerStream::new(listener).map_ok(AuthenticatedUnixStream::new);

    tonic::transport::Server::builder()
        .add_service(DiskArbitrationServer::new(RpcServer::new(commands)))
        .serve_with_incoming(incoming)
        .await?;
    Ok(())
}
