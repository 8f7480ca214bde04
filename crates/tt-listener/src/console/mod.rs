//! Operator console
//!
//! A line-oriented prompt on stdin. At the top level the operator lists
//! agents and selects one; inside a session, lines are shell commands
//! except for the console verbs (`upload`, `download`, `pty`, `forward`,
//! `socks`, `tunnels`, `stop`, `bg`, `exit`).
//!
//! The helpers are written against [`CommandChannel`] and report whether
//! the console should stay attached to the session.

mod output;
mod pty;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use tt_core::error::TransferError;
use tt_core::traits::CommandChannel;
use tt_protocol::constants::CMD_EXIT;
use tt_protocol::strip_terminator;

use crate::session::Outbound;
use crate::state::ListenerState;
use crate::transfer::{download_file, upload_file, UploadOptions};

pub use output::{format_clients, format_tunnels, print_error, print_info, print_success};
pub use pty::run_pty;

/// Print connected agents with their console numbers
pub fn list_clients<C>(channel: &C, out: &mut impl Write)
where
    C: CommandChannel + ?Sized,
{
    let _ = writeln!(out, "{}", format_clients(&channel.clients()));
}

/// Resolve `use <id>` to a peer address. `<id>` is a 1-based console
/// number or an exact address.
pub fn use_client<C>(channel: &C, args: &[&str], out: &mut impl Write) -> Option<String>
where
    C: CommandChannel + ?Sized,
{
    let Some(selector) = args.get(1) else {
        print_error(out, "Usage: use <id>");
        return None;
    };

    let clients = channel.clients();
    let selected = match selector.parse::<usize>() {
        Ok(n) if n >= 1 => clients.get(n - 1).cloned(),
        Ok(_) => None,
        Err(_) => clients.iter().find(|c| c.as_str() == *selector).cloned(),
    };
    if selected.is_none() {
        print_error(out, &format!("No client {}", selector));
    }
    selected
}

/// Run one shell command and print its output. Returns `false` when the
/// command could not be sent or its response never arrived.
pub async fn send_shell_command<C>(
    channel: &C,
    peer: &str,
    command: &str,
    timeout: Duration,
    out: &mut impl Write,
) -> bool
where
    C: CommandChannel + ?Sized,
{
    if let Err(e) = channel.send(peer, command) {
        print_error(out, &format!("Failed to send command: {}", e));
        return false;
    }
    match channel.await_response(peer, timeout).await {
        Ok(response) => {
            let _ = writeln!(out, "{}", strip_terminator(&response));
            true
        }
        Err(e) => {
            print_error(out, &format!("No response: {}", e));
            false
        }
    }
}

/// `upload <local> <remote>`. Returns `false` on any transfer failure.
pub async fn handle_upload<C>(
    channel: &C,
    peer: &str,
    args: &[&str],
    options: &UploadOptions,
    out: &mut impl Write,
) -> bool
where
    C: CommandChannel + ?Sized,
{
    let [_, local, remote] = args else {
        print_error(out, "Usage: upload <local_path> <remote_path>");
        return true;
    };

    match upload_file(channel, peer, Path::new(local), remote, options).await {
        Ok(report) => {
            print_success(
                out,
                &format!(
                    "Uploaded {} bytes in {} chunks to {}",
                    report.bytes, report.chunks, remote
                ),
            );
            true
        }
        Err(e) => {
            print_error(out, &format!("Upload failed: {}", e));
            false
        }
    }
}

/// `download <remote> <local>`. Only a failure to send or await the
/// request returns `false`; bad payloads and local write errors keep the
/// session.
pub async fn handle_download<C>(
    channel: &C,
    peer: &str,
    args: &[&str],
    timeout: Duration,
    out: &mut impl Write,
) -> bool
where
    C: CommandChannel + ?Sized,
{
    let [_, remote, local] = args else {
        print_error(out, "Usage: download <remote_path> <local_path>");
        return true;
    };

    match download_file(channel, peer, remote, Path::new(local), timeout).await {
        Ok(bytes) => {
            print_success(out, &format!("Downloaded {} bytes to {}", bytes, local));
            true
        }
        Err(e @ TransferError::Channel { .. }) => {
            print_error(out, &format!("Download failed: {}", e));
            false
        }
        Err(e) => {
            print_error(out, &format!("Download failed: {}", e));
            true
        }
    }
}

fn print_help(out: &mut impl Write) {
    let _ = writeln!(
        out,
        "Commands:
  list                              list connected agents
  use <id|address>                  open a session
  exit                              stop the listener
Inside a session:
  <command>                         run a shell command
  upload <local> <remote>           send a file
  download <remote> <local>         fetch a file
  pty                               interactive terminal (Ctrl+] to leave)
  forward <id> <port> <host:port>   forward 127.0.0.1:<port> through the agent
  socks <id> <port>                 SOCKS5 proxy on 127.0.0.1:<port>
  tunnels                           list tunnels
  stop <id>                         stop a tunnel
  bg                                return to the main prompt
  exit                              disconnect the agent"
    );
}

/// Interactive console over stdin/stdout
pub struct Console {
    state: Arc<ListenerState>,
    cancel: CancellationToken,
}

impl Console {
    pub fn new(state: Arc<ListenerState>, cancel: CancellationToken) -> Self {
        Self { state, cancel }
    }

    /// Run until the operator exits or the listener shuts down. Exiting
    /// cancels the listener; closed stdin leaves it running unattended.
    pub async fn run(self) -> Result<()> {
        let mut stdout = std::io::stdout();
        print_info(&mut stdout, "Type 'help' for commands");

        loop {
            let Some(line) = self.prompt("tether> ").await? else {
                if !self.cancel.is_cancelled() {
                    tracing::info!("Console input closed; running until interrupted");
                    self.cancel.cancelled().await;
                }
                return Ok(());
            };
            let args: Vec<&str> = line.split_whitespace().collect();
            match args.first().copied() {
                None => {}
                Some("help") => print_help(&mut stdout),
                Some("list") => list_clients(self.state.sessions.as_ref(), &mut stdout),
                Some("use") => {
                    if let Some(peer) =
                        use_client(self.state.sessions.as_ref(), &args, &mut stdout)
                    {
                        self.session(&peer).await?;
                    }
                }
                Some(CMD_EXIT) => break,
                Some(other) => print_error(&mut stdout, &format!("Unknown command: {}", other)),
            }
        }

        self.cancel.cancel();
        Ok(())
    }

    /// Read one line without holding stdin between prompts, so the PTY
    /// bridge can own the terminal. `None` on EOF or shutdown.
    async fn prompt(&self, prompt: &str) -> Result<Option<String>> {
        print!("{}", prompt);
        std::io::stdout().flush()?;

        let read = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|n| (n, line))
        });
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            joined = read => match joined?? {
                (0, _) => Ok(None),
                (_, line) => Ok(Some(line.trim().to_string())),
            }
        }
    }

    async fn session(&self, peer: &str) -> Result<()> {
        let mut stdout = std::io::stdout();
        let sessions = self.state.sessions.as_ref();
        let tunnels = &self.state.tunnels;
        let config = &self.state.config;
        let upload_options = UploadOptions {
            chunk_size: config.chunk_size,
            timeout: config.response_timeout,
        };
        print_info(&mut stdout, &format!("Session with {} (bg to return)", peer));

        while let Some(line) = self.prompt(&format!("{}> ", peer)).await? {
            if sessions.get(peer).is_none() {
                print_error(&mut stdout, &format!("{} disconnected", peer));
                break;
            }
            let args: Vec<&str> = line.split_whitespace().collect();
            let keep = match args.first().copied() {
                None => true,
                Some("bg") | Some("background") => break,
                Some("help") => {
                    print_help(&mut stdout);
                    true
                }
                Some(CMD_EXIT) => {
                    if let Err(e) = sessions.try_enqueue(peer, Outbound::Line(CMD_EXIT.into())) {
                        print_error(&mut stdout, &format!("Failed to send exit: {}", e));
                    }
                    break;
                }
                Some("upload") => {
                    handle_upload(sessions, peer, &args, &upload_options, &mut stdout).await
                }
                Some("download") => {
                    handle_download(sessions, peer, &args, config.response_timeout, &mut stdout)
                        .await
                }
                Some("pty") => {
                    if let Err(e) = run_pty(sessions, peer).await {
                        print_error(&mut stdout, &format!("{:#}", e));
                    }
                    true
                }
                Some("forward") => {
                    self.start_forward(peer, &args, &mut stdout).await;
                    true
                }
                Some("socks") => {
                    self.start_socks(peer, &args, &mut stdout).await;
                    true
                }
                Some("tunnels") => {
                    let table = format_tunnels(
                        &tunnels.forward.list_forwards(),
                        &tunnels.socks.list_socks(),
                    );
                    let _ = writeln!(stdout, "{}", table);
                    true
                }
                Some("stop") => {
                    self.stop_tunnel(&args, &mut stdout);
                    true
                }
                Some(_) => {
                    send_shell_command(sessions, peer, &line, config.command_timeout, &mut stdout)
                        .await
                }
            };
            if !keep {
                print_info(&mut stdout, &format!("Leaving session with {}", peer));
                break;
            }
        }
        Ok(())
    }

    async fn start_forward(&self, peer: &str, args: &[&str], out: &mut impl Write) {
        let [_, id, port, target] = args else {
            print_error(out, "Usage: forward <id> <local_port> <host:port>");
            return;
        };
        let Ok(port) = port.parse::<u16>() else {
            print_error(out, &format!("Invalid port: {}", port));
            return;
        };
        let Some(session) = self.state.sessions.get(peer) else {
            print_error(out, &format!("{} disconnected", peer));
            return;
        };

        match self
            .state
            .tunnels
            .start_forward(id, port, target, session.notifier())
            .await
        {
            Ok(addr) => print_success(out, &format!("Forwarding {} -> {}", addr, target)),
            Err(e) => print_error(out, &format!("Forward failed: {}", e)),
        }
    }

    async fn start_socks(&self, peer: &str, args: &[&str], out: &mut impl Write) {
        let [_, id, port] = args else {
            print_error(out, "Usage: socks <id> <local_port>");
            return;
        };
        let Ok(port) = port.parse::<u16>() else {
            print_error(out, &format!("Invalid port: {}", port));
            return;
        };
        let Some(session) = self.state.sessions.get(peer) else {
            print_error(out, &format!("{} disconnected", peer));
            return;
        };

        match self
            .state
            .tunnels
            .start_socks(id, port, session.notifier())
            .await
        {
            Ok(addr) => print_success(out, &format!("SOCKS5 proxy on {}", addr)),
            Err(e) => print_error(out, &format!("SOCKS5 failed: {}", e)),
        }
    }

    fn stop_tunnel(&self, args: &[&str], out: &mut impl Write) {
        let [_, id] = args else {
            print_error(out, "Usage: stop <id>");
            return;
        };
        let tunnels = &self.state.tunnels;
        let result = match tunnels.forward.stop_forward(id) {
            Err(tt_core::error::TunnelError::NotFound(_)) => tunnels.socks.stop_socks(id),
            other => other,
        };
        match result {
            Ok(()) => print_success(out, &format!("Stopped {}", id)),
            Err(e) => print_error(out, &e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;
    use tt_protocol::constants::DATA_PREFIX;
    use tt_protocol::{encode_payload, END_OF_OUTPUT};

    const PEER: &str = "192.168.1.2:1234";
    const TIMEOUT: Duration = Duration::from_millis(50);

    fn text(out: Vec<u8>) -> String {
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_list_clients() {
        let mut out = Vec::new();
        list_clients(&MockChannel::with_clients(&[]), &mut out);
        assert!(text(out).contains("No clients connected"));

        let mut out = Vec::new();
        let channel = MockChannel::with_clients(&["192.168.1.2:1234", "10.0.0.5:5678"]);
        list_clients(&channel, &mut out);
        let out = text(out);
        assert!(out.contains("192.168.1.2:1234"));
        assert!(out.contains("10.0.0.5:5678"));
    }

    #[test]
    fn test_use_client() {
        let channel = MockChannel::with_clients(&["192.168.1.2:1234", "10.0.0.5:5678"]);
        let mut out = Vec::new();

        assert_eq!(
            use_client(&channel, &["use", "1"], &mut out).as_deref(),
            Some("192.168.1.2:1234")
        );
        assert_eq!(
            use_client(&channel, &["use", "10.0.0.5:5678"], &mut out).as_deref(),
            Some("10.0.0.5:5678")
        );
        assert_eq!(use_client(&channel, &["use", "5"], &mut out), None);
        assert_eq!(use_client(&channel, &["use", "0"], &mut out), None);
        assert_eq!(use_client(&channel, &["use", "abc"], &mut out), None);
        assert_eq!(use_client(&channel, &["use"], &mut out), None);
    }

    #[tokio::test]
    async fn test_send_shell_command() {
        let channel = MockChannel::new().respond(&format!("output{}", END_OF_OUTPUT));
        let mut out = Vec::new();
        assert!(send_shell_command(&channel, PEER, "ls", TIMEOUT, &mut out).await);
        assert_eq!(channel.sent(), vec!["ls"]);
        assert!(text(out).contains("output"));

        let channel = MockChannel::new().fail_all_sends();
        assert!(!send_shell_command(&channel, PEER, "ls", TIMEOUT, &mut Vec::new()).await);

        let channel = MockChannel::new().fail_awaits();
        assert!(!send_shell_command(&channel, PEER, "ls", TIMEOUT, &mut Vec::new()).await);

        // An agent that answers nothing still keeps the session
        let channel = MockChannel::new();
        assert!(send_shell_command(&channel, PEER, "ls", TIMEOUT, &mut Vec::new()).await);
    }

    #[tokio::test]
    async fn test_handle_upload_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, b"test data").unwrap();
        let local = path.to_str().unwrap();
        let args = ["upload", local, "/remote/path.txt"];
        let options = UploadOptions::default();

        let channel = MockChannel::new().fail_awaits();
        assert!(!handle_upload(&channel, PEER, &args, &options, &mut Vec::new()).await);

        let channel = MockChannel::new().respond(&format!("ERROR{}", END_OF_OUTPUT));
        assert!(!handle_upload(&channel, PEER, &args, &options, &mut Vec::new()).await);

        let ok = format!("OK{}", END_OF_OUTPUT);
        let channel = MockChannel::new().respond(&ok).respond(&ok).respond(&ok);
        assert!(handle_upload(&channel, PEER, &args, &options, &mut Vec::new()).await);

        // Missing arguments print usage and keep the session
        assert!(handle_upload(&channel, PEER, &["upload"], &options, &mut Vec::new()).await);
    }

    #[tokio::test]
    async fn test_handle_download_keeps_session_on_bad_payload() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.txt");
        let local = local.to_str().unwrap();
        let args = ["download", "/remote/file.txt", local];

        let channel = MockChannel::new().fail_awaits();
        assert!(!handle_download(&channel, PEER, &args, TIMEOUT, &mut Vec::new()).await);

        let channel = MockChannel::new().fail_all_sends();
        assert!(!handle_download(&channel, PEER, &args, TIMEOUT, &mut Vec::new()).await);

        let channel =
            MockChannel::new().respond(&format!("INVALID_RESPONSE\n{}", END_OF_OUTPUT));
        assert!(handle_download(&channel, PEER, &args, TIMEOUT, &mut Vec::new()).await);

        let channel = MockChannel::new()
            .respond(&format!("{}INVALID_HEX!@#\n{}", DATA_PREFIX, END_OF_OUTPUT));
        assert!(handle_download(&channel, PEER, &args, TIMEOUT, &mut Vec::new()).await);

        let payload = encode_payload(b"test data").unwrap();
        let response = format!("{}{}\n{}", DATA_PREFIX, payload, END_OF_OUTPUT);
        let channel = MockChannel::new().respond(&response);
        let unwritable = ["download", "/remote/file.txt", "/nonexistent/dir/file.txt"];
        assert!(handle_download(&channel, PEER, &unwritable, TIMEOUT, &mut Vec::new()).await);

        let channel = MockChannel::new().respond(&response);
        assert!(handle_download(&channel, PEER, &args, TIMEOUT, &mut Vec::new()).await);
        assert_eq!(std::fs::read(local).unwrap(), b"test data");
    }
}
