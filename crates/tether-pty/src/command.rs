use serde::{Deserialize, Serialize};

/// Describes the command a terminal session runs inside its PTY.
///
/// Populated once at startup by the embedding application (CLI flags,
/// environment) and treated as immutable by the session layer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute. A bare name is resolved via `$PATH`.
    pub program: String,
    /// Arguments passed to the program, in order.
    #[serde(default)]
    pub args: Vec<String>,
    /// Run the child in a freshly created scratch directory.
    ///
    /// The directory is removed when the session's PTY is torn down.
    #[serde(default)]
    pub ephemeral_workdir: bool,
}

impl CommandSpec {
    /// A spec that runs `program` with no arguments, in the caller's cwd.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ephemeral_workdir: false,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run the child in an ephemeral scratch directory.
    pub fn in_ephemeral_workdir(mut self) -> Self {
        self.ephemeral_workdir = true;
        self
    }
}

impl Default for CommandSpec {
    /// The user's default shell with no arguments.
    fn default() -> Self {
        Self::new(default_shell())
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
