//! tether-bridge: a single-session bridge between a message transport and a
//! process running inside a PTY.
//!
//! The bridge owns one terminal session at a time: a child process attached
//! to a pseudo-terminal, a pump task forwarding its output, and the state
//! machine deciding when connect, input, and resize requests apply. The
//! transport (a WebSocket server, a test harness, anything that can deliver
//! decoded messages) stays outside this crate and talks to
//! [`SessionManager`].
//!
//! # Architecture
//!
//! - [`SessionManager`] -- Single-session lifecycle: idempotent connect,
//!   input and resize routing, shutdown, and the broadcast event stream.
//! - [`SessionEvent`] -- What subscribers receive: output chunks and the
//!   exit notification.
//! - The output pump -- A periodic tokio task draining the PTY; internal to
//!   this crate.

pub mod events;
mod pump;
pub mod session;

pub use events::SessionEvent;
pub use session::{SessionManager, SessionStatus, DEFAULT_COLS, DEFAULT_ROWS};
