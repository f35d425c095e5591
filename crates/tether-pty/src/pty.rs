use std::io::{Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread::JoinHandle;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tempfile::TempDir;

use crate::command::CommandSpec;

/// Upper bound on the bytes consumed by a single read of the PTY master.
pub const MAX_READ_BYTES: usize = 20 * 1024;

/// How many times `spawn` retries the child command before giving up.
pub const MAX_SPAWN_ATTEMPTS: u32 = 3;

/// Depth of the reader-to-consumer channel. When it is full the reader
/// thread blocks instead of queueing more, so unread output stays in the
/// kernel pty buffer and the child is throttled by ordinary pty flow
/// control rather than buffered without bound.
const READ_QUEUE_DEPTH: usize = 2;

/// Errors from PTY operations.
#[derive(Debug)]
pub enum PtyError {
    /// The PTY pair, scratch directory, or child process could not be created.
    SpawnFailed(String),
    /// An OS-level I/O fault on the master side. Fatal to the session.
    Io(std::io::Error),
    /// The kernel rejected the window-size change.
    ResizeFailed(String),
    /// The operation targeted a PTY that has already been closed.
    NotAttached,
    /// The PTY closed underneath the reader: the child exited and its
    /// remaining output has been drained.
    Eof,
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::SpawnFailed(msg) => write!(f, "PTY spawn failed: {msg}"),
            PtyError::Io(err) => write!(f, "PTY I/O error: {err}"),
            PtyError::ResizeFailed(msg) => write!(f, "PTY resize failed: {msg}"),
            PtyError::NotAttached => write!(f, "PTY is closed"),
            PtyError::Eof => write!(f, "PTY reached end of stream"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::Io(err)
    }
}

/// One message from the reader thread. `Data` carries the bytes of exactly
/// one OS read and is never empty.
enum ReaderMsg {
    Data(Vec<u8>),
    Eof,
    Err(std::io::Error),
}

/// Owns a portable-pty master pair, the child process attached to its slave
/// side, and the thread draining the master.
///
/// PTY reads block, so output is read on a dedicated thread and handed to
/// [`PtyProcess::try_read`] over a short bounded channel. A consumer that
/// falls behind blocks the reader, leaving unread output in the kernel pty
/// buffer where it throttles the child's writes.
pub struct PtyProcess {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    output: Option<Receiver<ReaderMsg>>,
    reader_thread: Option<JoinHandle<()>>,
    size: (u16, u16),
    eof: bool,
    exit_code: Option<u32>,
    scratch: Option<TempDir>,
}

impl PtyProcess {
    /// Spawn the command described by `spec` attached to a fresh PTY with
    /// the given dimensions.
    ///
    /// The child gets `TERM=xterm-256color` and, if the spec asks for an
    /// ephemeral workdir, starts inside a scratch directory that is removed
    /// on close. Spawning the command is attempted up to
    /// [`MAX_SPAWN_ATTEMPTS`] times before the whole call fails.
    pub fn spawn(spec: &CommandSpec, cols: u16, rows: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let scratch = if spec.ephemeral_workdir {
            let dir = TempDir::new().map_err(|e| {
                PtyError::SpawnFailed(format!("failed to create scratch dir: {e}"))
            })?;
            Some(dir)
        } else {
            None
        };

        let mut child = None;
        let mut last_err = String::new();
        for attempt in 1..=MAX_SPAWN_ATTEMPTS {
            match pair.slave.spawn_command(build_command(spec, scratch.as_ref())) {
                Ok(c) => {
                    child = Some(c);
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "spawn attempt {attempt}/{MAX_SPAWN_ATTEMPTS} for {} failed: {e}",
                        spec.program
                    );
                    last_err = e.to_string();
                }
            }
        }
        let child = child
            .ok_or_else(|| PtyError::SpawnFailed(format!("failed to spawn command: {last_err}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let (tx, rx) = mpsc::sync_channel(READ_QUEUE_DEPTH);
        let reader_thread = std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || read_loop(reader, tx))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn reader thread: {e}")))?;

        let pid = child.process_id();
        log::info!("spawned {} (pid {pid:?}) on a {cols}x{rows} PTY", spec.program);

        Ok(Self {
            master: Some(pair.master),
            writer: Some(writer),
            child,
            pid,
            output: Some(rx),
            reader_thread: Some(reader_thread),
            size: (cols, rows),
            eof: false,
            exit_code: None,
            scratch,
        })
    }

    /// Non-blocking read of PTY output.
    ///
    /// Returns `Ok(Some(bytes))` with the bytes of exactly one underlying
    /// read (never empty), `Ok(None)` when no output is currently available,
    /// `Err(PtyError::Eof)` once the PTY has closed with its output fully
    /// drained, or `Err(PtyError::Io)` on a read fault. After the first
    /// terminal result every subsequent call returns `Err(PtyError::Eof)`.
    pub fn try_read(&mut self) -> Result<Option<Vec<u8>>, PtyError> {
        if self.eof {
            return Err(PtyError::Eof);
        }

        let output = match self.output.as_ref() {
            Some(rx) => rx,
            None => return Err(PtyError::Eof),
        };

        match output.try_recv() {
            Ok(ReaderMsg::Data(bytes)) => Ok(Some(bytes)),
            Ok(ReaderMsg::Eof) => {
                self.eof = true;
                Err(PtyError::Eof)
            }
            Ok(ReaderMsg::Err(err)) => {
                self.eof = true;
                // Linux reports EIO on the master once the slave side is
                // gone; only a fault with the child still running counts as
                // a read fault.
                if self.try_wait().is_some() {
                    Err(PtyError::Eof)
                } else {
                    Err(PtyError::Io(err))
                }
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.eof = true;
                Err(PtyError::Eof)
            }
        }
    }

    /// Write bytes to the PTY master (client input -> child stdin).
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        let writer = self.writer.as_mut().ok_or(PtyError::NotAttached)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY to new dimensions.
    ///
    /// The child observes the new size on its next size query; no signal
    /// handling is needed on our side.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.as_ref().ok_or(PtyError::NotAttached)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))?;
        self.size = (cols, rows);
        Ok(())
    }

    /// Get the child process exit code if it has exited.
    ///
    /// Returns `None` while the process is still running.
    pub fn try_wait(&mut self) -> Option<u32> {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(status.exit_code());
            }
        }
        self.exit_code
    }

    /// Block until the child exits and return its exit code.
    pub fn wait(&mut self) -> Option<u32> {
        if self.exit_code.is_none() {
            if let Ok(status) = self.child.wait() {
                self.exit_code = Some(status.exit_code());
            }
        }
        self.exit_code
    }

    /// Check if the child process is still alive.
    pub fn is_alive(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Tear the PTY down: kill the child if it is still running, reap it,
    /// release the master pair, and join the reader thread. Idempotent.
    ///
    /// Returns the child's exit code when it could be reaped.
    pub fn close(&mut self) -> Option<u32> {
        if self.master.is_none() {
            return self.exit_code;
        }

        if self.try_wait().is_none() {
            if let Err(e) = self.child.kill() {
                log::warn!("failed to kill child {:?}: {e}", self.pid);
            }
        }
        let code = self.wait();

        // Unblock the reader before joining it: with the child gone a
        // blocked read sees end of stream, and dropping the receiver fails
        // any send parked on a full channel.
        self.writer = None;
        self.master = None;
        self.output = None;
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        self.eof = true;

        // Dropping the guard removes the scratch directory.
        self.scratch = None;

        code
    }

    /// OS process id of the child, when the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current PTY dimensions as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        self.size
    }

    /// Path of the ephemeral scratch directory, when one was requested.
    pub fn workdir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|dir| dir.path())
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Build the portable-pty command for one spawn attempt.
fn build_command(spec: &CommandSpec, scratch: Option<&TempDir>) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    // The client-side emulator speaks xterm; advertise it to the child.
    cmd.env("TERM", "xterm-256color");
    if let Some(dir) = scratch {
        cmd.cwd(dir.path());
    }
    cmd
}

/// Blocking read loop run on the reader thread. Sends one message per OS
/// read, blocking while the channel is full; stops on end of stream, a
/// read fault, or once the receiving side is gone.
fn read_loop(mut reader: Box<dyn Read + Send>, tx: SyncSender<ReaderMsg>) {
    let mut buf = [0u8; MAX_READ_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(ReaderMsg::Eof);
                return;
            }
            Ok(n) => {
                if tx.send(ReaderMsg::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(ReaderMsg::Err(e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn sh() -> CommandSpec {
        CommandSpec::new("/bin/sh")
    }

    /// Poll `try_read` until `pred` matches the collected output or the
    /// deadline passes.
    fn read_until(pty: &mut PtyProcess, pred: impl Fn(&str) -> bool) -> String {
        let mut output = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match pty.try_read() {
                Ok(Some(bytes)) => {
                    assert!(!bytes.is_empty(), "reads must never be empty");
                    output.push_str(&String::from_utf8_lossy(&bytes));
                    if pred(&output) {
                        break;
                    }
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(_) => break,
            }
        }
        output
    }

    #[test]
    fn test_spawn_pty() {
        let pty = PtyProcess::spawn(&sh(), 80, 24);
        assert!(pty.is_ok(), "Failed to spawn PTY: {:?}", pty.err());
        let mut pty = pty.unwrap();
        assert!(pty.is_alive());
        assert!(pty.pid().is_some());
        assert_eq!(pty.size(), (80, 24));
    }

    #[test]
    fn test_write_read_echo() {
        let mut pty = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        pty.write(b"echo TETHER_TEST_OK\n").unwrap();

        let output = read_until(&mut pty, |text| text.contains("TETHER_TEST_OK"));
        assert!(
            output.contains("TETHER_TEST_OK"),
            "Expected output to contain TETHER_TEST_OK, got: {output}"
        );
    }

    #[test]
    fn test_input_order_across_writes() {
        let mut pty = PtyProcess::spawn(&sh(), 80, 24).unwrap();

        // Split one command across several writes; the shell only sees the
        // marker if every byte arrives in order.
        pty.write(b"echo TETHER_").unwrap();
        pty.write(b"ORDER_").unwrap();
        pty.write(b"OK\n").unwrap();

        let output = read_until(&mut pty, |text| text.contains("TETHER_ORDER_OK"));
        assert!(
            output.contains("TETHER_ORDER_OK"),
            "Expected in-order input delivery, got: {output}"
        );
    }

    #[test]
    fn test_try_read_would_block() {
        // `sleep` produces no output, so the first read finds nothing.
        let spec = CommandSpec::new("sleep").arg("5");
        let mut pty = PtyProcess::spawn(&spec, 80, 24).unwrap();
        assert!(matches!(pty.try_read(), Ok(None)));
    }

    #[test]
    fn test_eof_after_child_exit() {
        let mut pty = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        pty.write(b"exit 0\n").unwrap();

        // Drain until the PTY reports end of stream.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut ended = false;
        while Instant::now() < deadline {
            match pty.try_read() {
                Ok(Some(_)) => {}
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(_) => {
                    ended = true;
                    break;
                }
            }
        }
        assert!(ended, "PTY should reach end of stream after child exit");

        // End of stream is sticky.
        assert!(matches!(pty.try_read(), Err(PtyError::Eof)));
        assert_eq!(pty.wait(), Some(0));
    }

    #[test]
    fn test_unread_output_throttles_child() {
        // seq's ~1.5 MB fits neither the read channel nor the kernel pty
        // buffer, so until someone reads, the child stays blocked in write.
        let spec = CommandSpec::new("/bin/sh").arg("-c").arg("seq 1 200000");
        let mut pty = PtyProcess::spawn(&spec, 80, 24).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(
            pty.is_alive(),
            "child should be blocked on write while output is unread"
        );

        // Draining releases it; every byte still arrives, ending in EOF.
        let mut output = String::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            assert!(Instant::now() < deadline, "draining took too long");
            match pty.try_read() {
                Ok(Some(bytes)) => output.push_str(&String::from_utf8_lossy(&bytes)),
                Ok(None) => thread::sleep(Duration::from_millis(5)),
                Err(PtyError::Eof) => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert!(
            output.contains("200000"),
            "final line should arrive after draining"
        );
        assert_eq!(pty.wait(), Some(0));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut pty = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        let first = pty.close();
        let second = pty.close();
        assert_eq!(first, second);
    }

    #[test]
    fn test_close_with_backlogged_output() {
        let spec = CommandSpec::new("/bin/sh").arg("-c").arg("seq 1 200000");
        let mut pty = PtyProcess::spawn(&spec, 80, 24).unwrap();
        thread::sleep(Duration::from_millis(100));

        // Nothing was read, so the reader thread is parked on a full
        // channel. close() must still finish and reap the child.
        let (done_tx, done_rx) = mpsc::channel();
        let closer = thread::spawn(move || {
            let code = pty.close();
            let _ = done_tx.send(code);
        });
        let code = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("close should not hang on a backlogged reader");
        assert!(code.is_some());
        closer.join().unwrap();
    }

    #[test]
    fn test_write_after_close() {
        let mut pty = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        pty.close();
        assert!(matches!(pty.write(b"late\n"), Err(PtyError::NotAttached)));
        assert!(matches!(pty.resize(100, 30), Err(PtyError::NotAttached)));
    }

    #[test]
    fn test_resize_updates_size() {
        let mut pty = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        pty.resize(120, 40).unwrap();
        assert_eq!(pty.size(), (120, 40));
    }

    #[test]
    fn test_resize_visible_to_child() {
        let mut pty = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        pty.resize(120, 40).unwrap();
        pty.write(b"stty size\n").unwrap();

        let output = read_until(&mut pty, |text| text.contains("40 120"));
        assert!(
            output.contains("40 120"),
            "Child should observe 40 rows x 120 cols, got: {output}"
        );
    }

    #[test]
    fn test_spawn_missing_program() {
        let spec = CommandSpec::new("/definitely/not/a/real/program");
        let result = PtyProcess::spawn(&spec, 80, 24);
        assert!(matches!(result, Err(PtyError::SpawnFailed(_))));
    }

    #[test]
    fn test_ephemeral_workdir() {
        let spec = CommandSpec::new("/bin/sh").in_ephemeral_workdir();
        let mut pty = PtyProcess::spawn(&spec, 80, 24).unwrap();

        let dir = pty.workdir().map(|p| p.to_path_buf()).unwrap();
        assert!(dir.exists());

        // The shell starts inside the scratch directory.
        pty.write(b"pwd\n").unwrap();
        let marker = dir.file_name().unwrap().to_string_lossy().into_owned();
        let output = read_until(&mut pty, |text| text.contains(&marker));
        assert!(
            output.contains(&marker),
            "Shell cwd should be the scratch dir {marker}, got: {output}"
        );

        pty.close();
        assert!(!dir.exists(), "Scratch dir should be removed on close");
    }

    #[test]
    fn test_error_display() {
        let err = PtyError::SpawnFailed("no such file".to_string());
        assert_eq!(err.to_string(), "PTY spawn failed: no such file");
        assert_eq!(PtyError::NotAttached.to_string(), "PTY is closed");
        assert_eq!(PtyError::Eof.to_string(), "PTY reached end of stream");
    }
}
