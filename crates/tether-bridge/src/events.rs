//! Events forwarded from the session to the transport layer.
//!
//! Everything a connected client hears about goes through [`SessionEvent`],
//! serialized as tagged JSON by whatever transport embeds the bridge.

use serde::Serialize;

/// Events broadcast from the session to all transport subscribers.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// One chunk of terminal output, one event per underlying PTY read.
    ///
    /// Bytes are decoded tolerantly; malformed sequences are substituted,
    /// never dropped and never raised as errors.
    Output { data: String },
    /// The child process ended (exit, fatal read fault, or shutdown).
    Exited { code: Option<u32> },
}
