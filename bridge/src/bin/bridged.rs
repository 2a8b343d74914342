// bridged - Request Queue Daemon for one (backend, directory) key
//
// Owns the key's FIFO queue and its terminal pane. Clients talk to it over a
// Unix socket in the key's runtime directory. Exits after the idle timeout,
// on an explicit stop, or when its pane disappears.

use anyhow::{bail, Context, Result};
use clap::Parser;
use pane_bridge::session::backend::{Backend, BackendProfile};
use pane_bridge::session::config::{Config, Settings};
use pane_bridge::session::dispatch::{Dispatcher, StopReason, WaitOutcome};
use pane_bridge::session::error::{BridgeError, ErrorCode};
use pane_bridge::session::protocol::{
    deserialize_message, serialize_message, DaemonRequest, DaemonResponse, SessionKey,
    MAX_REQUEST_FRAME_SIZE, PROTOCOL_VERSION,
};
use pane_bridge::session::registry::{HistoryStore, SessionRegistry, SessionTarget};
use pane_bridge::session::terminal::{backend_for, TerminalSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// How long a previous daemon gets to finish exiting before we refuse to start
const PREVIOUS_EXIT_WAIT: Duration = Duration::from_secs(3);

/// Time for connection tasks to flush final replies after the queue stops
const CLIENT_DRAIN: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "bridged", version, about = "Queue daemon for one AI CLI pane")]
struct Args {
    /// Backend served by this daemon
    #[arg(long)]
    backend: Backend,

    /// Working directory of the session
    #[arg(long)]
    dir: PathBuf,

    /// Ask the backend to continue its previous conversation
    #[arg(long)]
    resume: bool,

    /// Runtime root (defaults to BRIDGE_RUNTIME_DIR or the platform location)
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
        .with_context(|| format!("Failed to open log file: {}", config.log_file.display()))?;
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log))
        .init();
    Ok(())
}

/// Refuse to start while another live daemon owns the pid file. A daemon
/// that is just exiting gets a short grace period.
fn claim_pid_file(config: &Config) -> Result<()> {
    let deadline = Instant::now() + PREVIOUS_EXIT_WAIT;
    while let Some(pid) = config.read_pid() {
        if pid == std::process::id() || !config.is_daemon_running() {
            break;
        }
        if Instant::now() >= deadline {
            bail!("Daemon already running (PID: {})", pid);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    config.write_pid().context("Failed to write PID file")
}

fn bind_socket(config: &Config) -> Result<UnixListener> {
    // Any socket left behind belongs to a daemon that is gone
    config
        .remove_socket()
        .context("Failed to remove stale socket")?;
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to bind socket: {}", config.socket_path.display()))?;

    // Secure socket permissions (owner-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!(
                    "Failed to set socket permissions: {}",
                    config.socket_path.display()
                )
            })?;
    }
    Ok(listener)
}

/// Build the dispatcher from the environment and persisted history
fn build_dispatcher(key: SessionKey, resume: bool, config: &Config) -> Result<Arc<Dispatcher>> {
    let settings = Settings::from_env();
    let profile = BackendProfile::from_env(key.backend);
    let target = SessionTarget::discover(&key);
    tracing::info!(
        key = %key,
        terminal = %target.terminal,
        pane = ?target.pane.pane_id,
        marker = %target.pane.title_marker,
        source = ?target.source,
        "session target discovered"
    );

    let terminal = backend_for(target.terminal, &TerminalSettings::from_env());
    let resume = resume || target.resume;
    let history = HistoryStore::open(&config.history_file, settings.history_limit);

    let mut registry = SessionRegistry::new(settings.history_limit);
    registry.attach(key.clone(), target, history);
    registry
        .set_resume(&key, resume)
        .context("Failed to record resume flag")?;
    registry
        .set_owner(&key, Some(std::process::id()))
        .context("Failed to claim history file")?;

    Ok(Arc::new(Dispatcher::new(key, profile, terminal, registry)))
}

/// Run the dispatcher and accept clients until the dispatcher stops
async fn serve(listener: UnixListener, dispatcher: Arc<Dispatcher>) -> StopReason {
    let runner = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run().await })
    };
    tokio::pin!(runner);

    {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("signal received");
            dispatcher.request_stop().await;
        });
    }

    let reason = loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(dispatcher, stream).await {
                                tracing::debug!(error = %e, "client connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                    }
                }
            }

            result = &mut runner => {
                break match result {
                    Ok(reason) => reason,
                    Err(e) => {
                        tracing::error!(error = %e, "dispatcher task failed");
                        StopReason::Requested
                    }
                };
            }
        }
    };

    drop(listener);
    tokio::time::sleep(CLIENT_DRAIN).await;
    reason
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

async fn handle_client(dispatcher: Arc<Dispatcher>, mut stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut greeted = false;

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            // Client disconnected
            break;
        }

        // Enforce max request frame size (1MB)
        let (response, close) = if line.len() > MAX_REQUEST_FRAME_SIZE {
            let message = format!(
                "Request frame too large: {} bytes (max {})",
                line.len(),
                MAX_REQUEST_FRAME_SIZE
            );
            (DaemonResponse::error(ErrorCode::InvalidRequest, message), true)
        } else {
            match deserialize_message::<DaemonRequest>(line.as_bytes()) {
                Ok(DaemonRequest::Handshake { client_version }) => {
                    if client_version == PROTOCOL_VERSION {
                        greeted = true;
                        (
                            DaemonResponse::Handshake {
                                protocol_version: PROTOCOL_VERSION,
                            },
                            false,
                        )
                    } else {
                        let message = format!(
                            "client speaks {}, daemon speaks {}",
                            client_version, PROTOCOL_VERSION
                        );
                        (DaemonResponse::error(ErrorCode::VersionMismatch, message), true)
                    }
                }
                Ok(_) if !greeted => (
                    DaemonResponse::error(ErrorCode::InvalidRequest, "handshake required"),
                    true,
                ),
                Ok(request) => (handle_request(&dispatcher, request).await, false),
                Err(e) => (
                    DaemonResponse::error(
                        ErrorCode::InvalidRequest,
                        format!("Failed to parse request: {}", e),
                    ),
                    false,
                ),
            }
        };

        let bytes = serialize_message(&response)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        if close {
            break;
        }
    }
    Ok(())
}

async fn handle_request(dispatcher: &Dispatcher, request: DaemonRequest) -> DaemonResponse {
    match request {
        DaemonRequest::Handshake { .. } => DaemonResponse::Handshake {
            protocol_version: PROTOCOL_VERSION,
        },
        DaemonRequest::Enqueue { request, resume } => match dispatcher.enqueue(request, resume).await {
            Ok(queued) => DaemonResponse::Queued {
                round: queued.round,
                request_id: queued.request_id,
                ahead: queued.ahead,
            },
            Err(e) => error_response(e, None),
        },
        DaemonRequest::Wait { round, timeout_ms } => {
            match dispatcher
                .wait_for(round, Duration::from_millis(timeout_ms))
                .await
            {
                Ok(WaitOutcome::Reply(reply)) => DaemonResponse::Reply { reply },
                Ok(WaitOutcome::TimedOut) => DaemonResponse::WaitTimedOut { round },
                Err(e) => error_response(e, Some(round)),
            }
        }
        DaemonRequest::Pending { count } => DaemonResponse::History {
            replies: dispatcher.pending(count).await,
        },
        DaemonRequest::Ping => DaemonResponse::Pong {
            status: dispatcher.status().await,
        },
        DaemonRequest::Shutdown => {
            dispatcher.request_stop().await;
            DaemonResponse::ShuttingDown
        }
    }
}

fn error_response(error: BridgeError, round: Option<u64>) -> DaemonResponse {
    DaemonResponse::Error {
        code: error.code(),
        message: error.to_string(),
        round,
    }
}

async fn run(args: Args) -> Result<StopReason> {
    let key = SessionKey::resolve(args.backend, &args.dir)
        .with_context(|| format!("Failed to resolve working directory: {}", args.dir.display()))?;
    let root = args
        .runtime_dir
        .clone()
        .unwrap_or_else(Config::default_runtime_dir);
    let config = Config::with_root(root, &key);
    config
        .ensure_dirs()
        .context("Failed to create runtime directory")?;
    init_logging(&config, args.verbose)?;

    claim_pid_file(&config)?;
    let listener = bind_socket(&config)?;
    tracing::info!(
        key = %key,
        pid = std::process::id(),
        socket = %config.socket_path.display(),
        "daemon listening"
    );

    let dispatcher = build_dispatcher(key, args.resume, &config)?;
    let reason = serve(listener, Arc::clone(&dispatcher)).await;

    // Cleanup
    config.remove_socket().ok();
    dispatcher.release_history().await;
    config.remove_own_pid().ok();
    tracing::info!(reason = ?reason, "daemon stopped");
    Ok(reason)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %format!("{:#}", e), "daemon failed");
        return Err(e);
    }
    Ok(())
}
