// bridge: client command for the pane bridge
//
// Commands:
//   bridge ask <backend> [message...] [--wait] [--timeout SECS] [--resume]
//   bridge pending <backend> [N]
//   bridge ping <backend>
//   bridge stop <backend>

use clap::{Parser, Subcommand};
use pane_bridge::session::backend::{Backend, BackendProfile};
use pane_bridge::session::daemon_client::{AskOutcome, ClientSettings, DaemonClient, PendingSource};
use pane_bridge::session::error::{BridgeError, ErrorCode};
use pane_bridge::session::protocol::{DaemonStatus, Reply, Request, RequestMode, SessionKey};
use pane_bridge::session::registry::SessionTarget;
use pane_bridge::session::terminal::{backend_for, TerminalSettings};
use serde_json::json;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// Slack added to the backend's wait budget for the default foreground timeout
const FOREGROUND_SLACK: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "bridge")]
#[command(about = "Queue requests to AI CLI panes, one daemon per backend and directory")]
#[command(version)]
struct Cli {
    /// Working directory (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    dir: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a request; prints the round handle, or the reply with --wait
    Ask {
        backend: Backend,

        /// Request text (read from stdin when omitted)
        message: Vec<String>,

        /// Block until the reply is recorded
        #[arg(short, long)]
        wait: bool,

        /// Client-side wait limit in seconds; the daemon keeps working after it
        #[arg(long)]
        timeout: Option<u64>,

        /// Ask the backend to continue its previous conversation
        #[arg(long)]
        resume: bool,
    },

    /// Show the most recent replies
    Pending {
        backend: Backend,

        #[arg(default_value_t = 1)]
        count: usize,
    },

    /// Report daemon and pane status without starting a daemon
    Ping { backend: Backend },

    /// Stop the daemon, failing queued requests
    Stop { backend: Backend },
}

impl Commands {
    fn backend(&self) -> Backend {
        match self {
            Commands::Ask { backend, .. }
            | Commands::Pending { backend, .. }
            | Commands::Ping { backend }
            | Commands::Stop { backend } => *backend,
        }
    }
}

/// Best-effort caller identity: `BRIDGE_CALLER`, the caller's pane, or its pid
fn caller_identity<F>(lookup: F) -> (String, Option<String>)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let pane = var("TMUX_PANE").or_else(|| var("WEZTERM_PANE"));
    let caller = var("BRIDGE_CALLER")
        .or_else(|| pane.clone())
        .unwrap_or_else(|| format!("pid:{}", std::process::id()));
    (caller, pane)
}

fn read_message(words: &[String]) -> Result<String, BridgeError> {
    if !words.is_empty() {
        return Ok(words.join(" "));
    }
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Err(BridgeError::InvalidRequest(
            "no message given; pass it as arguments or on stdin".to_string(),
        ));
    }
    let mut message = String::new();
    stdin.lock().read_to_string(&mut message)?;
    Ok(message)
}

fn print_reply(reply: &Reply, json_output: bool) {
    if json_output {
        println!("{}", json!({ "reply": reply }));
    } else {
        println!("{}", reply.text);
    }
}

fn print_status(status: &DaemonStatus, json_output: bool) {
    if json_output {
        println!("{}", json!({ "daemon": status }));
        return;
    }
    println!("daemon:  pid {} ({:?})", status.pid, status.phase);
    println!("session: {}", status.key);
    match (&status.pane, &status.pane_error) {
        (Some(pane), _) => println!(
            "pane:    {} ({})",
            pane,
            if status.pane_alive { "alive" } else { "gone" }
        ),
        (None, Some(err)) => println!("pane:    unavailable ({})", err),
        (None, None) => println!("pane:    unknown"),
    }
    println!("resume:  {}", status.resume);
    println!("round:   {}", status.last_round);
    match status.in_flight {
        Some(round) => println!("queue:   {} waiting, round {} in flight", status.queue_len, round),
        None => println!("queue:   {} waiting", status.queue_len),
    }
}

fn report_error(error: &BridgeError, json_output: bool) {
    if json_output {
        eprintln!(
            "{}",
            json!({
                "error": {
                    "code": error.code(),
                    "message": error.to_string(),
                    "exit_code": error.exit_code(),
                }
            })
        );
    } else {
        eprintln!("error[{}]: {}", error.code(), error);
    }
}

/// Check the pane directly when no daemon is running
fn probe_pane(key: &SessionKey) -> Result<(String, bool), BridgeError> {
    let target = SessionTarget::discover(key);
    let terminal = backend_for(target.terminal, &TerminalSettings::from_env());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let pane = terminal.open(&target.pane).await?;
        let alive = terminal.exists(&pane).await?;
        Ok::<_, BridgeError>((pane.to_string(), alive))
    })
}

fn run(cli: Cli) -> Result<i32, BridgeError> {
    let work_dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let backend = cli.command.backend();
    let key = SessionKey::resolve(backend, Path::new(&work_dir)).map_err(|e| {
        BridgeError::InvalidRequest(format!("cannot resolve {}: {}", work_dir.display(), e))
    })?;
    let client = DaemonClient::new(key.clone(), ClientSettings::from_env());
    let json_output = cli.json;

    match cli.command {
        Commands::Ask {
            message,
            wait,
            timeout,
            resume,
            ..
        } => {
            let text = read_message(&message)?;
            let (caller, origin_pane) = caller_identity(|name| std::env::var(name).ok());
            let mode = if wait {
                RequestMode::Foreground
            } else {
                RequestMode::Background
            };
            let request = Request::new(text, mode).with_caller(Some(caller), origin_pane);
            let limit = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| BackendProfile::from_env(backend).max_wait + FOREGROUND_SLACK);

            match client.ask(request, resume, wait.then_some(limit))? {
                AskOutcome::Scheduled {
                    round,
                    request_id,
                    ahead,
                } => {
                    if json_output {
                        println!(
                            "{}",
                            json!({ "round": round, "request_id": request_id, "ahead": ahead })
                        );
                    } else {
                        println!("{}", round);
                    }
                    Ok(0)
                }
                AskOutcome::Answered(reply) => {
                    print_reply(&reply, json_output);
                    Ok(0)
                }
            }
        }

        Commands::Pending { count, .. } => {
            let (replies, source) = client.pending(count)?;
            if json_output {
                let source = match source {
                    PendingSource::Daemon => "daemon",
                    PendingSource::HistoryFile => "history",
                };
                println!("{}", json!({ "source": source, "replies": replies }));
            } else if replies.is_empty() {
                eprintln!("no replies recorded for {}", key);
            } else {
                for reply in &replies {
                    println!("--- round {} [{}] ---", reply.round, reply.status);
                    println!("{}", reply.text);
                }
            }
            Ok(0)
        }

        Commands::Ping { .. } => match client.ping() {
            Ok(status) => {
                print_status(&status, json_output);
                Ok(if status.pane_alive {
                    0
                } else {
                    ErrorCode::BackendPaneMissing.exit_code()
                })
            }
            Err(e) if e.code() == ErrorCode::DaemonUnreachable => {
                let (pane, alive) = probe_pane(&key)?;
                if json_output {
                    println!(
                        "{}",
                        json!({ "daemon": null, "key": key.to_string(), "pane": pane, "pane_alive": alive })
                    );
                } else {
                    println!("daemon:  not running");
                    println!("session: {}", key);
                    println!("pane:    {} ({})", pane, if alive { "alive" } else { "gone" });
                }
                Ok(if alive {
                    0
                } else {
                    ErrorCode::BackendPaneMissing.exit_code()
                })
            }
            Err(e) => Err(e),
        },

        Commands::Stop { .. } => {
            let stopped = client.stop()?;
            if json_output {
                println!("{}", json!({ "stopped": stopped }));
            } else if stopped {
                println!("stopped daemon for {}", key);
            } else {
                println!("no daemon running for {}", key);
            }
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let json_output = cli.json;
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            if let Some(reply) = e.reply() {
                print_reply(reply, json_output);
            }
            report_error(&e, json_output);
            e.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
