//! Interactive terminal bridge for a session in PTY mode
//!
//! Returns when the operator detaches (Ctrl+]) or the remote terminal exits.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use tokio::sync::mpsc;

use tt_protocol::{Command, TerminalSize};

use crate::session::{Outbound, PtyEvent, SessionRegistry};

/// Attach the local terminal to `peer`'s remote shell
pub async fn run_pty(registry: &SessionRegistry, peer: &str) -> Result<()> {
    let mut remote = open_terminal(registry, peer, enable_raw_mode).await?;

    let stop = Arc::new(AtomicBool::new(false));
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);

    // Terminal event reader
    let reader = tokio::task::spawn_blocking({
        let stop = Arc::clone(&stop);
        move || {
            while !stop.load(Ordering::Relaxed) {
                if event::poll(Duration::from_millis(10)).unwrap_or(false) {
                    if let Ok(evt) = event::read() {
                        if event_tx.blocking_send(evt).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let mut stdout = std::io::stdout();
    let result: Result<()> = loop {
        tokio::select! {
            Some(evt) = event_rx.recv() => match evt {
                Event::Key(KeyEvent { code, modifiers, kind, .. }) => {
                    if kind == KeyEventKind::Release {
                        continue;
                    }
                    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char(']') {
                        send(registry, peer, Command::PtyExit).await;
                        break Ok(());
                    }
                    let data = key_to_bytes(code, modifiers);
                    if !data.is_empty() {
                        send(registry, peer, Command::PtyData(data)).await;
                    }
                }
                Event::Paste(text) => {
                    send(registry, peer, Command::PtyData(text.into_bytes())).await;
                }
                Event::Resize(cols, rows) => {
                    send(registry, peer, Command::PtyResize(TerminalSize::new(rows, cols))).await;
                }
                _ => {}
            },
            event = remote.recv() => match event {
                Some(PtyEvent::Data(data)) => {
                    if let Err(e) = stdout.write_all(&data).and_then(|_| stdout.flush()) {
                        break Err(e).context("Failed to write terminal output");
                    }
                }
                Some(PtyEvent::Exit) | None => break Ok(()),
            }
        }
    };

    // Cleanup
    stop.store(true, Ordering::Relaxed);
    let _ = reader.await;
    disable_raw_mode().context("Failed to leave raw mode")?;
    registry.exit_pty_mode(peer);
    println!();
    result
}

/// Switch the session and the agent to PTY mode, then put the local
/// terminal in raw mode. If raw mode fails the remote terminal is closed
/// again and the session returns to normal mode.
async fn open_terminal<F>(
    registry: &SessionRegistry,
    peer: &str,
    enter_raw_mode: F,
) -> Result<mpsc::Receiver<PtyEvent>>
where
    F: FnOnce() -> std::io::Result<()>,
{
    let remote = registry
        .enter_pty_mode(peer)
        .with_context(|| format!("Cannot start a terminal on {}", peer))?;

    if let Err(e) = registry
        .enqueue(peer, Outbound::Line(Command::PtyMode.to_line()))
        .await
    {
        registry.exit_pty_mode(peer);
        return Err(e).context("Failed to request a terminal");
    }
    if let Ok((cols, rows)) = size() {
        send(registry, peer, Command::PtyResize(TerminalSize::new(rows, cols))).await;
    }

    if let Err(e) = enter_raw_mode() {
        send(registry, peer, Command::PtyExit).await;
        registry.exit_pty_mode(peer);
        return Err(e).context("Failed to enter raw mode");
    }
    Ok(remote)
}

async fn send(registry: &SessionRegistry, peer: &str, command: Command) {
    if let Err(e) = registry.enqueue(peer, Outbound::Line(command.to_line())).await {
        tracing::debug!("Dropping terminal input for {}: {}", peer, e);
    }
}

/// Convert a key event to the bytes a terminal would send
fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    use KeyCode::*;

    match code {
        Char(c) => {
            if modifiers.contains(KeyModifiers::CONTROL) {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                vec![(c.to_ascii_lowercase() as u8).wrapping_sub(b'a' - 1)]
            } else if modifiers.contains(KeyModifiers::ALT) {
                let mut bytes = vec![0x1b];
                bytes.extend(c.to_string().into_bytes());
                bytes
            } else {
                c.to_string().into_bytes()
            }
        }
        Enter => vec![b'\r'],
        Tab => vec![b'\t'],
        BackTab => b"\x1b[Z".to_vec(),
        Backspace => vec![0x7f],
        Esc => vec![0x1b],
        Up => b"\x1b[A".to_vec(),
        Down => b"\x1b[B".to_vec(),
        Right => b"\x1b[C".to_vec(),
        Left => b"\x1b[D".to_vec(),
        Home => b"\x1b[H".to_vec(),
        End => b"\x1b[F".to_vec(),
        PageUp => b"\x1b[5~".to_vec(),
        PageDown => b"\x1b[6~".to_vec(),
        Delete => b"\x1b[3~".to_vec(),
        Insert => b"\x1b[2~".to_vec(),
        F(n) => match n {
            1 => b"\x1bOP".to_vec(),
            2 => b"\x1bOQ".to_vec(),
            3 => b"\x1bOR".to_vec(),
            4 => b"\x1bOS".to_vec(),
            5 => b"\x1b[15~".to_vec(),
            6 => b"\x1b[17~".to_vec(),
            7 => b"\x1b[18~".to_vec(),
            8 => b"\x1b[19~".to_vec(),
            9 => b"\x1b[20~".to_vec(),
            10 => b"\x1b[21~".to_vec(),
            11 => b"\x1b[23~".to_vec(),
            12 => b"\x1b[24~".to_vec(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_key_to_bytes() {
        assert_eq!(key_to_bytes(KeyCode::Char('a'), KeyModifiers::NONE), b"a");
        assert_eq!(key_to_bytes(KeyCode::Char('c'), KeyModifiers::CONTROL), vec![0x03]);
        assert_eq!(key_to_bytes(KeyCode::Char('x'), KeyModifiers::ALT), b"\x1bx");
        assert_eq!(key_to_bytes(KeyCode::Char('é'), KeyModifiers::NONE), "é".as_bytes());
        assert_eq!(key_to_bytes(KeyCode::Enter, KeyModifiers::NONE), b"\r");
        assert_eq!(key_to_bytes(KeyCode::Up, KeyModifiers::NONE), b"\x1b[A");
        assert_eq!(key_to_bytes(KeyCode::F(5), KeyModifiers::NONE), b"\x1b[15~");
        assert!(key_to_bytes(KeyCode::F(20), KeyModifiers::NONE).is_empty());
    }

    #[tokio::test]
    async fn test_raw_mode_failure_restores_session() {
        let registry = SessionRegistry::new();
        let (handle, mut channels) = SessionHandle::new("10.0.0.9:4000", CancellationToken::new());
        registry.register(Arc::new(handle));
        let peer = "10.0.0.9:4000";

        let err = open_terminal(&registry, peer, || {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "not a terminal"))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("raw mode"));
        assert!(!registry.is_in_pty_mode(peer));

        // The agent was asked for a terminal and then told to drop it
        let mut lines = Vec::new();
        while let Ok(entry) = channels.outbound_rx.try_recv() {
            lines.push(entry.to_line());
        }
        assert_eq!(lines.first().map(String::as_str), Some("PTY_MODE"));
        assert_eq!(lines.last().map(String::as_str), Some("PTY_EXIT"));

        // Normal commands are accepted again
        assert!(registry.send(peer, "whoami").is_ok());
    }
}
