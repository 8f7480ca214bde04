//! One pseudo-terminal bridged onto the control channel
//!
//! Output is read on a blocking thread and forwarded as `PTY_DATA` lines;
//! input, resizes and teardown come from the command processor.

use std::io::{Read, Write};
use std::path::Path;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use tt_protocol::{Command, TerminalSize};

use super::PtyError;

/// Allowed shell paths for security (prevents arbitrary command execution)
const ALLOWED_SHELLS_UNIX: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

const ALLOWED_SHELLS_WINDOWS: &[&str] = &[
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
    "C:\\Windows\\System32\\cmd.exe",
    "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe",
];

const READ_BUFFER_SIZE: usize = 4096;

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "cmd.exe"
    } else {
        "/bin/sh"
    }
}

/// Validate that a shell path is allowed and exists
fn validate_shell(shell: &str) -> Result<String, PtyError> {
    let allowed = if cfg!(windows) {
        ALLOWED_SHELLS_WINDOWS
    } else {
        ALLOWED_SHELLS_UNIX
    };

    let listed = if cfg!(windows) {
        allowed.iter().any(|s| s.eq_ignore_ascii_case(shell))
    } else {
        allowed.contains(&shell) || in_etc_shells(shell)
    };
    if !listed {
        return Err(PtyError::ShellNotAllowed(shell.to_string()));
    }

    if !cfg!(windows) && !Path::new(shell).exists() {
        return Err(PtyError::ShellNotAllowed(shell.to_string()));
    }
    Ok(shell.to_string())
}

fn in_etc_shells(shell: &str) -> bool {
    std::fs::read_to_string("/etc/shells")
        .map(|shells| {
            shells
                .lines()
                .map(str::trim)
                .any(|line| !line.starts_with('#') && line == shell)
        })
        .unwrap_or(false)
}

/// Pick the shell for a new terminal.
///
/// An explicitly configured shell must validate. `$SHELL` is used when it
/// validates; otherwise the platform default is.
pub fn resolve_shell(configured: Option<&str>) -> Result<String, PtyError> {
    if let Some(shell) = configured {
        return validate_shell(shell);
    }

    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => validate_shell(&shell).or_else(|e| {
            tracing::warn!("Ignoring $SHELL: {}", e);
            Ok(default_shell().to_string())
        }),
        _ => Ok(default_shell().to_string()),
    }
}

/// A running shell on a pseudo-terminal
pub struct PtyBridge {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    /// Taken when the shell is killed
    child: Option<Box<dyn Child + Send + Sync>>,
    /// Stops the reader from forwarding after `close`
    cancel: CancellationToken,
    /// Fires when the reader hits EOF; taken once observed
    exited: Option<oneshot::Receiver<()>>,
}

impl PtyBridge {
    /// Start `shell` on a new 24x80 terminal. Output is sent to `output` as
    /// `PTY_DATA` lines.
    pub fn spawn(shell: &str, output: mpsc::Sender<String>) -> Result<Self, PtyError> {
        let size = TerminalSize::default();
        tracing::info!(
            "Starting terminal with {} ({}x{})",
            shell,
            size.cols,
            size.rows
        );

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| PtyError::system("failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::system("failed to spawn shell", e))?;
        tracing::debug!("Spawned shell process with PID: {:?}", child.process_id());
        // The child holds its own copy of the slave
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::system("failed to clone PTY reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::system("failed to take PTY writer", e))?;

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || read_output(reader, output, cancel, exit_tx)
        });

        Ok(Self {
            master: pair.master,
            writer,
            child: Some(child),
            cancel,
            exited: Some(exit_rx),
        })
    }

    /// Write keyboard input to the terminal
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn resize(&mut self, size: TerminalSize) -> Result<(), PtyError> {
        if !size.is_valid() {
            return Err(PtyError::InvalidSize {
                rows: size.rows,
                cols: size.cols,
            });
        }
        tracing::debug!("Resizing terminal to {}x{}", size.cols, size.rows);
        self.master
            .resize(pty_size(size))
            .map_err(|e| PtyError::system("failed to resize PTY", e))
    }

    /// Resolves once the shell side has closed. Pending forever after that.
    pub async fn exited(&mut self) {
        match self.exited.as_mut() {
            Some(rx) => {
                let _ = rx.await;
                self.exited = None;
            }
            None => std::future::pending().await,
        }
    }

    /// Kill and reap the shell. Returns its exit code if it could be reaped.
    ///
    /// Reaping blocks, so it runs on the blocking pool.
    pub async fn close(&mut self) -> Option<u32> {
        let mut child = self.kill()?;
        match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Terminal shell exited with code {}", status.exit_code());
                Some(status.exit_code())
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to reap terminal shell: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("Terminal reaper task failed: {}", e);
                None
            }
        }
    }

    /// Stop forwarding output and kill the shell, handing back the child
    /// to reap. `None` once already killed.
    fn kill(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        let mut child = self.child.take()?;
        self.cancel.cancel();
        if let Err(e) = child.kill() {
            tracing::debug!("Terminal shell already gone: {}", e);
        }
        Some(child)
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        let Some(mut child) = self.kill() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    let _ = child.wait();
                });
            }
            Err(_) => {
                let _ = child.wait();
            }
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn read_output(
    mut reader: Box<dyn Read + Send>,
    output: mpsc::Sender<String>,
    cancel: CancellationToken,
    exit_tx: oneshot::Sender<()>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if cancel.is_cancelled() {
                    return;
                }
                let line = Command::PtyData(buf[..n].to_vec()).to_line();
                if output.blocking_send(line).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the shell side closes
            Err(e) => {
                tracing::debug!("Terminal read ended: {}", e);
                break;
            }
        }
    }
    if !cancel.is_cancelled() {
        let _ = exit_tx.send(());
    }
}
