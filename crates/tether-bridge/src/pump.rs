//! Output pump that drains the PTY and forwards events to subscribers.
//!
//! The active session gets one pump running as a tokio task. Each tick
//! grabs the session lock briefly, performs at most one non-blocking read,
//! releases the lock, and forwards at most one event, so reads are never
//! coalesced and a slow tick never blocks input or resize handling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use tether_pty::PtyError;

use crate::events::SessionEvent;
use crate::session::{SessionInner, SessionStatus};

/// Poll cadence for PTY output.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one pump tick.
enum PollOutcome {
    /// No output available this tick.
    Idle,
    /// The session was stopped elsewhere; the pump should end.
    Detached,
    /// An event to forward. An `Exited` event also ends the pump.
    Event(SessionEvent),
}

/// Start the output pump for one spawn of the session.
///
/// Runs at [`POLL_INTERVAL`]. Each tick:
/// 1. Lock the session
/// 2. Perform one non-blocking PTY read
/// 3. Forward the chunk as one `Output` event, in read order
/// 4. On end of stream, reap the child, mark the session terminated, and
///    send `Exited`
///
/// The pump stops when it receives a signal on the stop channel, when the
/// session is no longer running or belongs to a later spawn than
/// `generation`, or after sending `Exited`.
pub(crate) fn start_output_pump(
    inner: Arc<Mutex<SessionInner>>,
    events: broadcast::Sender<SessionEvent>,
    mut stop_rx: mpsc::Receiver<()>,
    generation: u64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.recv() => return,
            }

            match poll_session(&inner, generation) {
                PollOutcome::Idle => {}
                PollOutcome::Detached => return,
                PollOutcome::Event(event) => {
                    let is_exited = matches!(event, SessionEvent::Exited { .. });
                    // Forward to subscribers. Ignore errors (nobody listening).
                    let _ = events.send(event);
                    if is_exited {
                        return;
                    }
                }
            }
        }
    });
}

/// One tick of the pump. Holds the session lock briefly.
fn poll_session(inner: &Arc<Mutex<SessionInner>>, generation: u64) -> PollOutcome {
    let mut inner = match inner.lock() {
        Ok(guard) => guard,
        Err(_) => return PollOutcome::Detached, // Poisoned lock.
    };

    if inner.status != SessionStatus::Running {
        return PollOutcome::Detached;
    }
    // A respawn bumps the count; a pump from an earlier spawn must not
    // touch the new session.
    if inner.spawn_count != generation {
        return PollOutcome::Detached;
    }
    let pty = match inner.pty.as_mut() {
        Some(pty) => pty,
        None => return PollOutcome::Detached,
    };

    match pty.try_read() {
        Ok(Some(bytes)) => PollOutcome::Event(SessionEvent::Output {
            data: String::from_utf8_lossy(&bytes).into_owned(),
        }),
        Ok(None) => PollOutcome::Idle,
        Err(err) => {
            if !matches!(err, PtyError::Eof) {
                log::warn!("PTY read fault, ending session: {err}");
            }
            let code = inner.close_session();
            PollOutcome::Event(SessionEvent::Exited { code })
        }
    }
}
