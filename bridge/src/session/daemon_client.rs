// Daemon client used by the `bridge` command
// Talks to the per-key bridged daemon over its Unix socket, spawning it when absent

use super::config::{Config, Settings};
use super::error::{BridgeError, ErrorCode};
use super::lock::{Acquire, LockManager};
use super::protocol::{
    deserialize_message, serialize_message, DaemonRequest, DaemonResponse, DaemonStatus, Reply,
    Request, SessionKey, MAX_RESPONSE_FRAME_SIZE, PROTOCOL_VERSION,
};
use super::registry::HistoryFile;
use crate::cli_paths::resolve_daemon_path;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Read timeout for requests that answer immediately
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra slack on top of a daemon-side wait before the socket read gives up
const WAIT_SLACK: Duration = Duration::from_secs(5);

/// How long a freshly spawned daemon gets to bind its socket
const SPAWN_WAIT: Duration = Duration::from_secs(5);

const SOCKET_POLL: Duration = Duration::from_millis(50);

/// First retry delay; doubled per attempt
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Client-side knobs
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Runtime root handed to spawned daemons
    pub runtime_root: PathBuf,
    pub daemon_bin: Option<PathBuf>,
    /// Attempts after the first one for transient failures
    pub retries: u32,
    pub lease_ttl: Duration,
}

impl ClientSettings {
    pub fn from_settings(settings: &Settings, runtime_root: PathBuf) -> Self {
        Self {
            runtime_root,
            daemon_bin: settings.daemon_bin.clone(),
            retries: settings.client_retries,
            lease_ttl: settings.lease_ttl,
        }
    }

    pub fn from_env() -> Self {
        Self::from_settings(&Settings::from_env(), Config::default_runtime_dir())
    }
}

/// Result of `ask`
#[derive(Debug, Clone)]
pub enum AskOutcome {
    /// Background mode: the request is queued
    Scheduled { round: u64, request_id: String, ahead: usize },
    /// Foreground mode: the finalized reply
    Answered(Reply),
}

/// Where `pending` read its replies from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSource {
    Daemon,
    HistoryFile,
}

/// One handshaken connection to a daemon
pub struct Connection {
    key: String,
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Connection {
    /// Connect and perform the protocol handshake
    pub fn open(config: &Config, key: &SessionKey) -> Result<Self, BridgeError> {
        let unreachable = |reason: String| BridgeError::DaemonUnreachable {
            key: key.to_string(),
            reason,
        };
        let stream = UnixStream::connect(&config.socket_path)
            .map_err(|e| unreachable(format!("connect {}: {}", config.socket_path.display(), e)))?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);

        let mut conn = Self {
            key: key.to_string(),
            writer: stream,
            reader,
        };
        let response = conn
            .exchange(&DaemonRequest::Handshake {
                client_version: PROTOCOL_VERSION,
            })
            .map_err(|e| match e {
                BridgeError::Io(io) => unreachable(format!("handshake: {}", io)),
                other => other,
            })?;
        match response {
            DaemonResponse::Handshake { protocol_version } if protocol_version == PROTOCOL_VERSION => Ok(conn),
            DaemonResponse::Handshake { protocol_version } => Err(BridgeError::VersionMismatch(format!(
                "client speaks {}, daemon speaks {}",
                PROTOCOL_VERSION, protocol_version
            ))),
            DaemonResponse::Error { code, message, .. } => Err(BridgeError::from_remote(code, message)),
            other => Err(unexpected("handshake", &other)),
        }
    }

    /// Send one request and read one response, surfacing daemon errors
    pub fn request(&mut self, request: &DaemonRequest) -> Result<DaemonResponse, BridgeError> {
        match self.exchange(request)? {
            DaemonResponse::Error { code, message, .. } => Err(BridgeError::from_remote(code, message)),
            response => Ok(response),
        }
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> Result<(), BridgeError> {
        self.writer.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    fn exchange(&mut self, request: &DaemonRequest) -> Result<DaemonResponse, BridgeError> {
        let bytes = serialize_message(request)?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        self.read_response()
    }

    fn read_response(&mut self) -> Result<DaemonResponse, BridgeError> {
        let mut line = String::new();
        let limit = (MAX_RESPONSE_FRAME_SIZE + 1) as u64;
        let read = (&mut self.reader).take(limit).read_line(&mut line)?;
        if read == 0 {
            return Err(BridgeError::DaemonUnreachable {
                key: self.key.clone(),
                reason: "daemon closed connection unexpectedly".to_string(),
            });
        }
        if line.len() > MAX_RESPONSE_FRAME_SIZE {
            return Err(BridgeError::Internal(format!(
                "response frame too large: more than {} bytes",
                MAX_RESPONSE_FRAME_SIZE
            )));
        }
        Ok(deserialize_message(line.as_bytes())?)
    }
}

fn unexpected(what: &str, response: &DaemonResponse) -> BridgeError {
    BridgeError::Internal(format!("unexpected response to {}: {:?}", what, response))
}

/// Client for one (backend, directory) key
pub struct DaemonClient {
    key: SessionKey,
    config: Config,
    settings: ClientSettings,
}

impl DaemonClient {
    pub fn new(key: SessionKey, settings: ClientSettings) -> Self {
        let config = Config::with_root(&settings.runtime_root, &key);
        Self {
            key,
            config,
            settings,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to a running daemon without ever spawning one
    pub fn connect(&self) -> Result<Connection, BridgeError> {
        Connection::open(&self.config, &self.key)
    }

    /// Connect, spawning the daemon under the spawn lease when none answers
    pub fn connect_or_spawn(&self, resume: bool) -> Result<Connection, BridgeError> {
        match self.connect() {
            Ok(conn) => return Ok(conn),
            Err(e) if e.code() == ErrorCode::DaemonUnreachable => {
                tracing::debug!(key = %self.key, error = %e, "daemon not reachable");
            }
            Err(e) => return Err(e),
        }

        self.config.ensure_dirs()?;
        let lock = LockManager::new(&self.config.lock_file, self.settings.lease_ttl);
        match lock.try_acquire()? {
            Acquire::Held(guard) => {
                // Another client may have finished spawning before we got the lease
                if let Ok(conn) = self.connect() {
                    return Ok(conn);
                }
                if self.config.is_daemon_running() {
                    tracing::info!(key = %self.key, pid = ?self.config.read_pid(), "daemon is starting up");
                } else {
                    self.spawn_daemon(resume)?;
                }
                let conn = self.wait_for_socket(SPAWN_WAIT);
                if let Err(e) = guard.release() {
                    tracing::warn!(key = %self.key, error = %e, "failed to release spawn lease");
                }
                conn
            }
            Acquire::Denied { holder } => {
                tracing::info!(key = %self.key, holder = holder.pid, "another process is spawning the daemon");
                self.wait_for_socket(SPAWN_WAIT)
                    .map_err(|_| BridgeError::LockContention {
                        key: self.key.to_string(),
                        holder: holder.pid,
                    })
            }
        }
    }

    fn spawn_daemon(&self, resume: bool) -> Result<(), BridgeError> {
        let unreachable = |reason: String| BridgeError::DaemonUnreachable {
            key: self.key.to_string(),
            reason,
        };
        let daemon_path = resolve_daemon_path(self.settings.daemon_bin.as_deref())
            .ok_or_else(|| unreachable("could not find the bridged binary".to_string()))?;

        let mut command = Command::new(&daemon_path);
        command
            .arg("--backend")
            .arg(self.key.backend.name())
            .arg("--dir")
            .arg(&self.key.work_dir)
            .arg("--runtime-dir")
            .arg(&self.settings.runtime_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if resume {
            command.arg("--resume");
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Detach from the caller's signals
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| unreachable(format!("failed to start {}: {}", daemon_path.display(), e)))?;
        tracing::info!(key = %self.key, pid = child.id(), path = %daemon_path.display(), "spawned daemon");

        // Reap the daemon if it exits while we are still running
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }

    fn wait_for_socket(&self, budget: Duration) -> Result<Connection, BridgeError> {
        let deadline = Instant::now() + budget;
        loop {
            match self.connect() {
                Ok(conn) => return Ok(conn),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => std::thread::sleep(SOCKET_POLL),
            }
        }
    }

    /// Run `op`, retrying transient failures with exponential backoff
    pub fn with_retries<T, F>(&self, mut op: F) -> Result<T, BridgeError>
    where
        F: FnMut() -> Result<T, BridgeError>,
    {
        let mut attempt = 0u32;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.settings.retries => {
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        key = %self.key,
                        code = %e.code(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Submit a request; with `wait`, block for its reply up to that long
    pub fn ask(&self, request: Request, resume: bool, wait: Option<Duration>) -> Result<AskOutcome, BridgeError> {
        let (round, request_id, ahead) = self.with_retries(|| {
            let mut conn = self.connect_or_spawn(resume)?;
            match conn.request(&DaemonRequest::Enqueue {
                request: request.clone(),
                resume,
            })? {
                DaemonResponse::Queued {
                    round,
                    request_id,
                    ahead,
                } => Ok((round, request_id, ahead)),
                other => Err(unexpected("enqueue", &other)),
            }
        })?;
        tracing::info!(key = %self.key, round, request_id = %request_id, ahead, "request queued");

        match wait {
            None => Ok(AskOutcome::Scheduled {
                round,
                request_id,
                ahead,
            }),
            Some(timeout) => self.wait(round, timeout).map(AskOutcome::Answered),
        }
    }

    /// Block until `round` is finalized. Elapsing is a client-side `Timeout`;
    /// the daemon keeps working on the round. Interrupted and unsettled
    /// replies come back as errors carrying the reply.
    pub fn wait(&self, round: u64, timeout: Duration) -> Result<Reply, BridgeError> {
        let mut conn = self.with_retries(|| self.connect())?;
        conn.set_read_timeout(timeout + WAIT_SLACK)?;
        let request = DaemonRequest::Wait {
            round,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        match conn.request(&request) {
            Ok(DaemonResponse::Reply { reply }) => BridgeError::from_reply(reply),
            Ok(DaemonResponse::WaitTimedOut { .. }) => Err(BridgeError::Timeout {
                round,
                waited: timeout,
            }),
            Ok(other) => Err(unexpected("wait", &other)),
            Err(BridgeError::Io(e))
                if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                Err(BridgeError::Timeout {
                    round,
                    waited: timeout,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Last `count` replies, from the daemon or straight from its history file
    pub fn pending(&self, count: usize) -> Result<(Vec<Reply>, PendingSource), BridgeError> {
        match self.connect() {
            Ok(mut conn) => match conn.request(&DaemonRequest::Pending { count })? {
                DaemonResponse::History { replies } => Ok((replies, PendingSource::Daemon)),
                other => Err(unexpected("pending", &other)),
            },
            Err(e) if e.code() == ErrorCode::DaemonUnreachable => {
                tracing::debug!(key = %self.key, "no daemon, reading history file");
                let history = HistoryFile::read(&self.config.history_file)
                    .map_err(|e| BridgeError::Internal(format!("{:#}", e)))?
                    .unwrap_or_default();
                Ok((history.last(count), PendingSource::HistoryFile))
            }
            Err(e) => Err(e),
        }
    }

    /// Status of the running daemon; never spawns
    pub fn ping(&self) -> Result<DaemonStatus, BridgeError> {
        let mut conn = self.connect()?;
        match conn.request(&DaemonRequest::Ping)? {
            DaemonResponse::Pong { status } => Ok(status),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Ask the daemon to stop. Returns `false` when none was running.
    pub fn stop(&self) -> Result<bool, BridgeError> {
        let mut conn = match self.connect() {
            Ok(conn) => conn,
            Err(e) if e.code() == ErrorCode::DaemonUnreachable => return Ok(false),
            Err(e) => return Err(e),
        };
        match conn.request(&DaemonRequest::Shutdown)? {
            DaemonResponse::ShuttingDown => {}
            other => return Err(unexpected("shutdown", &other)),
        }

        // Wait for the socket to go away so a follow-up command spawns afresh
        let deadline = Instant::now() + SPAWN_WAIT;
        while self.config.socket_exists() && Instant::now() < deadline {
            std::thread::sleep(SOCKET_POLL);
        }
        Ok(true)
    }
}
