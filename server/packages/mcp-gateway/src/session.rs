//! Streaming sessions: one client connection, one subprocess.
//!
//! A session is created when an SSE request resolves a stored
//! configuration. It registers itself, launches the configured command,
//! relays process output as wire events and tears everything down exactly
//! once on the first of: client disconnect, process exit, or launch
//! failure.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::response::sse::Event;
use futures::Stream;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use mcp_gateway_config_store::{first_server, ConfigRecord};

use crate::events;
use crate::launcher::{self, LaunchedProcess};
use crate::registry::ConnectionRegistry;

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

const EVENT_CHANNEL_CAPACITY: usize = 64;
const STDERR_CHUNK: usize = 4096;

/// Exit code reported when the process was killed rather than exiting.
const KILLED_EXIT_CODE: i32 = -1;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shared handle to a live streaming session.
///
/// The session is the sole writer to its event channel; the prompt router
/// only ever touches the process input stream. Teardown is guarded so
/// racing triggers (disconnect and process exit) clean up once.
pub struct SessionHandle {
    connection_id: String,
    config_id: i64,
    registry: Arc<ConnectionRegistry>,
    events: Mutex<Option<mpsc::Sender<Event>>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    closed: AtomicBool,
    cancelled: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.connection_id)
            .field("config_id", &self.config_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    fn new(
        config_id: i64,
        registry: Arc<ConnectionRegistry>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        // Millis alone could collide for simultaneous connections; the
        // process-wide counter makes the id unique.
        let connection_id = format!(
            "{}-{}-{}",
            config_id,
            unix_millis(),
            CONNECTION_SEQ.fetch_add(1, Ordering::SeqCst)
        );
        Self {
            connection_id,
            config_id,
            registry,
            events: Mutex::new(Some(events)),
            stdin: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            cancelled: CancellationToken::new(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn config_id(&self) -> i64 {
        self.config_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes an event to the client. Returns `false` once the session is
    /// closed or the client is gone; callers stop pumping on `false`.
    async fn emit(&self, event: Event) -> bool {
        let sender = self.events.lock().expect("events lock").clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Serializes a prompt payload onto the process input stream,
    /// newline-delimited.
    pub(crate) async fn send_prompt(&self, prompt: &Value) -> io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "process input not attached")
        })?;
        let mut line = serde_json::to_vec(prompt)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await
    }

    /// Tears the session down exactly once: deregisters, cancels the
    /// pump and heartbeat tasks, signals the exit monitor to kill the
    /// process, and closes the event channel. Racing triggers are no-ops
    /// after the first.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.unregister(&self.connection_id);
        self.cancelled.cancel();
        self.events.lock().expect("events lock").take();
        tracing::info!(connection_id = %self.connection_id, "session closed");
    }
}

/// SSE body stream for one session. Dropping it (client disconnect) closes
/// the session and kills the process.
pub struct SessionStream {
    events: ReceiverStream<Event>,
    _guard: DisconnectGuard,
}

struct DisconnectGuard {
    session: Arc<SessionHandle>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events)
            .poll_next(cx)
            .map(|event| event.map(Ok))
    }
}

/// Opens a session for a resolved configuration: registers it, then hands
/// the launch and pumping off to a background driver. The configuration is
/// snapshotted here; later edits to the stored record do not affect the
/// running session.
pub fn open(
    registry: Arc<ConnectionRegistry>,
    record: ConfigRecord,
    heartbeat_interval: Duration,
) -> SessionStream {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let session = Arc::new(SessionHandle::new(record.id, registry.clone(), tx));
    registry.register(session.clone());
    tracing::info!(
        connection_id = %session.connection_id(),
        config_id = record.id,
        "client connected"
    );
    tokio::spawn(drive(session.clone(), record, heartbeat_interval));
    SessionStream {
        events: ReceiverStream::new(rx),
        _guard: DisconnectGuard { session },
    }
}

async fn drive(session: Arc<SessionHandle>, record: ConfigRecord, heartbeat_interval: Duration) {
    if !session.emit(events::connected(record.id)).await {
        session.close();
        return;
    }

    tokio::spawn(run_heartbeat(session.clone(), heartbeat_interval));

    let Some((server_name, server)) = first_server(&record.config) else {
        session
            .emit(events::error("No server configuration found"))
            .await;
        session.close();
        return;
    };

    tracing::info!(
        connection_id = %session.connection_id(),
        server = %server_name,
        command = %server.command,
        "launching server process"
    );

    let process = match launcher::launch(&server.command, &server.args) {
        Ok(process) => process,
        Err(err) => {
            tracing::warn!(
                connection_id = %session.connection_id(),
                error = %err,
                "launch failed"
            );
            session.emit(events::error(&err.to_string())).await;
            session.close();
            return;
        }
    };

    let LaunchedProcess {
        stdin,
        stdout,
        stderr,
        child,
    } = process;
    *session.stdin.lock().await = Some(stdin);

    tokio::spawn(pump_stdout(session.clone(), stdout));
    tokio::spawn(pump_stderr(session.clone(), stderr));
    monitor_exit(session, child).await;
}

/// Waits for the process to exit or the session to close, whichever comes
/// first. On exit, the `close` event goes out before teardown; on session
/// close, the process is killed and reaped.
async fn monitor_exit(session: Arc<SessionHandle>, mut child: Child) {
    tokio::select! {
        _ = session.cancelled.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        status = child.wait() => {
            match status {
                Ok(status) => {
                    let code = status.code().unwrap_or(KILLED_EXIT_CODE);
                    tracing::info!(
                        connection_id = %session.connection_id(),
                        code,
                        "process exited"
                    );
                    session.emit(events::close(code)).await;
                }
                Err(err) => {
                    tracing::warn!(
                        connection_id = %session.connection_id(),
                        error = %err,
                        "process wait failed"
                    );
                }
            }
            session.close();
        }
    }
}

async fn pump_stdout(session: Arc<SessionHandle>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = session.cancelled.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(
                    connection_id = %session.connection_id(),
                    line = %line,
                    "stdout"
                );
                if !session.emit(events::message(&line)).await {
                    return;
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

async fn pump_stderr(session: Arc<SessionHandle>, mut stderr: ChildStderr) {
    let mut buf = vec![0u8; STDERR_CHUNK];
    loop {
        let read = tokio::select! {
            _ = session.cancelled.cancelled() => return,
            read = stderr.read(&mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                tracing::debug!(
                    connection_id = %session.connection_id(),
                    "stderr: {text}"
                );
                if !session.emit(events::error(&text)).await {
                    return;
                }
            }
        }
    }
}

/// Emits a keep-alive event on a fixed interval, independent of data
/// traffic, for as long as the session stays registered.
async fn run_heartbeat(session: Arc<SessionHandle>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick resolves immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = session.cancelled.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if !session.emit(events::heartbeat(unix_millis())).await {
            return;
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(
        registry: &Arc<ConnectionRegistry>,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = Arc::new(SessionHandle::new(1, registry.clone(), tx));
        registry.register(session.clone());
        (session, rx)
    }

    #[tokio::test]
    async fn connection_ids_are_unique_per_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (first, _rx1) = test_session(&registry);
        let (second, _rx2) = test_session(&registry);
        assert_ne!(first.connection_id(), second.connection_id());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (session, mut rx) = test_session(&registry);

        session.close();
        session.close();

        assert!(session.is_closed());
        assert!(registry.is_empty());
        // Channel is closed: no further events can be written.
        assert!(!session.emit(events::heartbeat(0)).await);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregistered_session_is_not_resurrected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (session, _rx) = test_session(&registry);
        let id = session.connection_id().to_string();

        session.close();
        assert!(registry.get(&id).is_none());
        assert!(registry.list_by_config(1).is_empty());
    }

    #[tokio::test]
    async fn prompt_before_launch_is_not_deliverable() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (session, _rx) = test_session(&registry);

        let err = session
            .send_prompt(&serde_json::json!({"text": "hello"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
