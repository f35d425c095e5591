//! tether-pty: PTY process management for the tether session bridge.
//!
//! This crate owns the OS-facing half of a terminal session. It allocates a
//! pseudo-terminal pair, spawns the configured command attached to the slave
//! side, and exposes non-blocking reads, input writes, and resizes over the
//! master side. The session state machine and output pump live in
//! `tether-bridge`.
//!
//! # Architecture
//!
//! - [`CommandSpec`] -- What to run: program, arguments, ephemeral-workdir flag.
//! - [`PtyProcess`] -- Low-level PTY + child pairing (spawn, try_read, write,
//!   resize, close).

pub mod command;
pub mod pty;

pub use command::{default_shell, CommandSpec};
pub use pty::{PtyError, PtyProcess, MAX_READ_BYTES, MAX_SPAWN_ATTEMPTS};
