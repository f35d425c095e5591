//! Single-session state machine shared between the transport and the pump.
//!
//! The manager owns at most one child process at a time. Any number of
//! transport clients may attach to it; the first connect spawns the child,
//! later connects reuse it, and input from clients that are not attached to
//! a running session is dropped without error.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};

use tether_pty::{CommandSpec, PtyError, PtyProcess};

use crate::events::SessionEvent;
use crate::pump::start_output_pump;

/// PTY dimensions applied at spawn, before the first client resize arrives.
pub const DEFAULT_COLS: u16 = 50;
pub const DEFAULT_ROWS: u16 = 50;

/// Capacity of the broadcast channel carrying outbound events. A subscriber
/// that falls this far behind loses the oldest events.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle of the single session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// No child process yet; a connect will spawn one.
    Idle,
    /// A connect is spawning the child.
    Starting,
    /// The child is attached and the pump is forwarding output.
    Running,
    /// The child exited or the session was torn down.
    Terminated,
}

/// Session state behind the manager's mutex, shared with the pump.
pub(crate) struct SessionInner {
    pub(crate) status: SessionStatus,
    pub(crate) pty: Option<PtyProcess>,
    pub(crate) pump_stop: Option<mpsc::Sender<()>>,
    pub(crate) spawn_count: u64,
}

impl SessionInner {
    /// Release the PTY and mark the session terminated. Returns the child's
    /// exit code when it could be reaped.
    pub(crate) fn close_session(&mut self) -> Option<u32> {
        self.status = SessionStatus::Terminated;
        self.pump_stop = None;
        match self.pty.take() {
            Some(mut pty) => pty.close(),
            None => None,
        }
    }
}

/// Single-session bridge between a transport and one PTY child process.
///
/// Construct one per process instance with the command to run, then route
/// decoded client messages into [`SessionManager::connect`],
/// [`SessionManager::write_input`], and [`SessionManager::resize`]. Output
/// flows back through the broadcast stream returned by
/// [`SessionManager::subscribe`].
pub struct SessionManager {
    spec: CommandSpec,
    inner: Arc<Mutex<SessionInner>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Create a manager for the given command. No OS resources are
    /// allocated until the first connect.
    pub fn new(spec: CommandSpec) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            spec,
            inner: Arc::new(Mutex::new(SessionInner {
                status: SessionStatus::Idle,
                pty: None,
                pump_stop: None,
                spawn_count: 0,
            })),
            events,
        }
    }

    /// Attach a client: spawn the child on the first connect, reuse it
    /// afterwards.
    ///
    /// Idempotent while the session is starting or running, so concurrent
    /// connects spawn at most one child. After the session terminated, the
    /// next connect discards it and spawns a fresh child. On spawn failure
    /// the manager returns to idle and the error goes back to this caller,
    /// so a later connect can retry.
    ///
    /// Must be called from within a tokio runtime; the output pump runs as
    /// a tokio task.
    pub fn connect(&self) -> Result<(), PtyError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PtyError::SpawnFailed("session lock poisoned".to_string()))?;

        match inner.status {
            SessionStatus::Starting | SessionStatus::Running => return Ok(()),
            SessionStatus::Idle | SessionStatus::Terminated => {}
        }

        // Drop any previous, terminated session before starting over.
        inner.pty = None;
        inner.pump_stop = None;
        inner.status = SessionStatus::Starting;

        // The lock stays held across the spawn so racing connects cannot
        // observe Idle and start a second child.
        let pty = match PtyProcess::spawn(&self.spec, DEFAULT_COLS, DEFAULT_ROWS) {
            Ok(pty) => pty,
            Err(e) => {
                inner.status = SessionStatus::Idle;
                return Err(e);
            }
        };

        log::info!(
            "session running: {} (pid {:?})",
            self.spec.program,
            pty.pid()
        );

        inner.pty = Some(pty);
        inner.spawn_count += 1;
        inner.status = SessionStatus::Running;
        // The pump is tied to this spawn; see start_output_pump.
        let generation = inner.spawn_count;

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        inner.pump_stop = Some(stop_tx);
        drop(inner);

        start_output_pump(
            Arc::clone(&self.inner),
            self.events.clone(),
            stop_rx,
            generation,
        );

        Ok(())
    }

    /// Forward client input bytes to the child's stdin.
    ///
    /// Input arriving while no session is running (not yet connected, or
    /// already terminated) is dropped without error; late keystrokes from a
    /// stale client are not a fault. Write failures are logged, not raised.
    ///
    /// The write runs under the session lock; if the child stops reading
    /// its input and the kernel's pty input buffer fills, the caller (and
    /// the lock) stalls until the child drains it.
    pub fn write_input(&self, data: &[u8]) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        if inner.status != SessionStatus::Running {
            log::debug!("dropping {} input bytes: no running session", data.len());
            return;
        }
        if let Some(pty) = inner.pty.as_mut() {
            if let Err(e) = pty.write(data) {
                log::warn!("input write failed: {e}");
            }
        }
    }

    /// Propagate a client's terminal dimensions to the PTY.
    ///
    /// Ignored unless the session is running and both dimensions are
    /// positive. Errors are logged, not raised.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            log::debug!("ignoring resize to {cols}x{rows}");
            return;
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        if inner.status != SessionStatus::Running {
            return;
        }
        if let Some(pty) = inner.pty.as_mut() {
            if let Err(e) = pty.resize(cols, rows) {
                log::warn!("resize to {cols}x{rows} failed: {e}");
            }
        }
    }

    /// Stop the session: signal the pump, kill and reap the child, and
    /// notify subscribers. A no-op unless a session is starting or running.
    pub async fn shutdown(&self) {
        let (stop_tx, code) = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            match inner.status {
                SessionStatus::Idle | SessionStatus::Terminated => return,
                SessionStatus::Starting | SessionStatus::Running => {}
            }
            let stop_tx = inner.pump_stop.take();
            let code = inner.close_session();
            (stop_tx, code)
        };

        // Signal the pump outside the critical section; holding the guard
        // across an await would not be Send.
        if let Some(tx) = stop_tx {
            let _ = tx.send(()).await;
        }

        let _ = self.events.send(SessionEvent::Exited { code });
        log::info!("session shut down (exit code {code:?})");
    }

    /// Subscribe to the outbound event stream.
    ///
    /// Events arrive in the order they were sent. The channel keeps a
    /// bounded backlog per subscriber; one that falls too far behind
    /// observes `Lagged` and loses the oldest events rather than stalling
    /// the pump.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        self.inner
            .lock()
            .map(|inner| inner.status)
            .unwrap_or(SessionStatus::Terminated)
    }

    /// Number of successful child spawns over the manager's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.spawn_count).unwrap_or(0)
    }

    /// OS pid of the running child, when there is one.
    pub fn child_pid(&self) -> Option<u32> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.pty.as_ref().and_then(|pty| pty.pid()))
    }

    /// The command this manager runs.
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}
