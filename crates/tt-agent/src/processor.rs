//! Remote command processor
//!
//! Reads control lines from the listener and answers them. The processor is
//! either in normal mode, where lines are shell commands and transfer steps,
//! or in PTY mode, where only terminal traffic is honoured. Keepalive, `exit`
//! and tunnel frames work in both.
//!
//! All outbound lines go through one writer task, so the PTY reader and
//! tunnel connections can write concurrently with command replies.

use std::io;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tt_core::config::AgentConfig;
use tt_core::{SessionEnd, TetherError};
use tt_protocol::constants::{READ_TIMEOUT, REPLY_ERROR};
use tt_protocol::{terminate, Command, LineCodec, ProtocolError};

use crate::pty::{resolve_shell, PtyBridge};
use crate::shell;
use crate::transfer::{self, UploadState};
use crate::tunnel::TunnelEndpoint;

/// Outbound lines buffered ahead of the writer
const OUTPUT_QUEUE_CAPACITY: usize = 256;

/// How long queued output may take to drain once the loop ends
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Processor settings
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Poll interval of the read loop; cancellation is checked this often
    pub read_timeout: Duration,
    /// Shell for `PTY_MODE`; `$SHELL` or the platform default when unset
    pub pty_shell: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            pty_shell: None,
        }
    }
}

impl From<&AgentConfig> for ProcessorConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            pty_shell: config.pty_shell.clone(),
        }
    }
}

/// Serve the listener on `framed` until it exits, the stream ends or
/// `cancel` fires. Cancellation ends the loop as an exit.
pub async fn run<S>(
    framed: Framed<S, LineCodec>,
    config: &ProcessorConfig,
    cancel: CancellationToken,
) -> Result<SessionEnd, TetherError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut lines) = framed.split();
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
    let writer = tokio::spawn(write_lines(sink, output_rx));

    let mut processor = Processor::new(config.clone(), output_tx);
    let result = processor.read_loop(&mut lines, &cancel).await;
    processor.shutdown().await;
    drop(processor);

    match tokio::time::timeout(FLUSH_TIMEOUT, writer).await {
        Ok(Ok(Err(e))) => tracing::debug!("Writer stopped with error: {}", e),
        Ok(Err(e)) => tracing::warn!("Writer task failed: {}", e),
        Err(_) => tracing::warn!("Timed out flushing output to the listener"),
        Ok(Ok(Ok(()))) => {}
    }
    result
}

async fn write_lines<S>(
    mut sink: SplitSink<Framed<S, LineCodec>, String>,
    mut lines: mpsc::Receiver<String>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        sink.send(line).await?;
    }
    sink.close().await
}

enum Flow {
    Continue,
    Exit,
}

struct Processor {
    config: ProcessorConfig,
    output: mpsc::Sender<String>,
    uploads: UploadState,
    tunnels: TunnelEndpoint,
    /// Present while in PTY mode
    pty: Option<PtyBridge>,
    /// Running shell commands
    tasks: JoinSet<()>,
}

impl Processor {
    fn new(config: ProcessorConfig, output: mpsc::Sender<String>) -> Self {
        Self {
            config,
            tunnels: TunnelEndpoint::new(output.clone()),
            output,
            uploads: UploadState::new(),
            pty: None,
            tasks: JoinSet::new(),
        }
    }

    async fn read_loop<S>(
        &mut self,
        lines: &mut SplitStream<Framed<S, LineCodec>>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, TetherError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read_timeout = self.config.read_timeout;
        loop {
            if cancel.is_cancelled() {
                tracing::info!("Command loop cancelled");
                return Ok(SessionEnd::Exit);
            }

            tokio::select! {
                _ = pty_exited(&mut self.pty) => self.on_pty_exit().await?,
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
                read = tokio::time::timeout(read_timeout, lines.next()) => match read {
                    Err(_) => continue,
                    Ok(None) => {
                        tracing::info!("Listener closed the connection");
                        return Ok(SessionEnd::PeerClosed);
                    }
                    Ok(Some(Err(e))) => return Err(read_error(e)),
                    Ok(Some(Ok(line))) => {
                        if let Flow::Exit = self.dispatch(&line).await? {
                            tracing::info!("Listener requested exit");
                            return Ok(SessionEnd::Exit);
                        }
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<Flow, TetherError> {
        if line.trim().is_empty() {
            return Ok(Flow::Continue);
        }
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Malformed command from listener: {}", e);
                if self.pty.is_none() {
                    self.send(terminate(&format!("{} {}", REPLY_ERROR, e)))
                        .await?;
                }
                return Ok(Flow::Continue);
            }
        };

        match command {
            Command::Ping => self.send(Command::Pong.to_line()).await?,
            Command::Pong => tracing::trace!("Keepalive answered"),
            Command::Exit => return Ok(Flow::Exit),
            Command::Tunnel(frame) => self.tunnels.handle(frame).await,
            Command::PtyMode => self.enter_pty().await?,
            command if self.pty.is_some() => self.handle_pty(command).await?,
            command => self.handle_normal(command).await?,
        }
        Ok(Flow::Continue)
    }

    async fn enter_pty(&mut self) -> Result<(), TetherError> {
        if let Some(mut previous) = self.pty.take() {
            tracing::warn!("Replacing running terminal");
            previous.close().await;
        }

        let bridge = resolve_shell(self.config.pty_shell.as_deref())
            .and_then(|shell| PtyBridge::spawn(&shell, self.output.clone()));
        match bridge {
            Ok(bridge) => {
                tracing::info!("Entered PTY mode");
                self.pty = Some(bridge);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to start terminal: {}", e);
                self.send(terminate(&format!("{} {}", REPLY_ERROR, e)))
                    .await
            }
        }
    }

    async fn handle_pty(&mut self, command: Command) -> Result<(), TetherError> {
        let Some(bridge) = self.pty.as_mut() else {
            return Ok(());
        };
        match command {
            Command::PtyData(data) => {
                if let Err(e) = bridge.write(&data) {
                    tracing::warn!("Terminal write failed: {}", e);
                }
            }
            Command::PtyResize(size) => {
                if let Err(e) = bridge.resize(size) {
                    tracing::warn!("Ignoring resize: {}", e);
                }
            }
            Command::PtyExit => {
                bridge.close().await;
                self.pty = None;
                tracing::info!("Listener left PTY mode");
            }
            other => tracing::debug!("Ignoring {:?} in PTY mode", other),
        }
        Ok(())
    }

    /// The shell ended on its own; tell the listener
    async fn on_pty_exit(&mut self) -> Result<(), TetherError> {
        if let Some(mut bridge) = self.pty.take() {
            bridge.close().await;
        }
        tracing::info!("Terminal exited, leaving PTY mode");
        self.send(Command::PtyExit.to_line()).await
    }

    async fn handle_normal(&mut self, command: Command) -> Result<(), TetherError> {
        match command {
            Command::Shell(cmd) => {
                let output = self.output.clone();
                self.tasks.spawn(async move {
                    let reply = terminate(&shell::execute(&cmd).await);
                    if output.send(reply).await.is_err() {
                        tracing::debug!("Dropped output of {:?}: connection gone", cmd);
                    }
                });
                Ok(())
            }
            Command::Info => self.send(terminate(&shell::host_info())).await,
            Command::StartUpload(path) => {
                let reply = self.uploads.start(&path).await;
                self.send(reply).await
            }
            Command::UploadChunk(payload) => {
                let reply = self.uploads.chunk(&payload).await;
                self.send(reply).await
            }
            Command::EndUpload => {
                let reply = self.uploads.finish().await;
                self.send(reply).await
            }
            Command::Download(path) => self.send(transfer::download(&path).await).await,
            other => {
                tracing::debug!("Ignoring {:?} outside PTY mode", other);
                Ok(())
            }
        }
    }

    async fn send(&mut self, line: String) -> Result<(), TetherError> {
        self.output.send(line).await.map_err(|_| {
            TetherError::transport(
                "write error",
                io::Error::new(io::ErrorKind::BrokenPipe, "connection writer stopped"),
            )
        })
    }

    async fn shutdown(&mut self) {
        if let Some(mut bridge) = self.pty.take() {
            bridge.close().await;
        }
        self.tunnels.close();
        self.tasks.abort_all();
    }
}

async fn pty_exited(pty: &mut Option<PtyBridge>) {
    match pty {
        Some(bridge) => bridge.exited().await,
        None => std::future::pending().await,
    }
}

fn read_error(err: ProtocolError) -> TetherError {
    let source = match err {
        ProtocolError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    };
    TetherError::transport("read error", source)
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    use tt_protocol::constants::DATA_PREFIX;
    use tt_protocol::{decode_payload, encode_payload, strip_terminator, END_OF_OUTPUT};

    use super::*;

    struct Harness {
        listener: Framed<DuplexStream, LineCodec>,
        agent: JoinHandle<Result<SessionEnd, TetherError>>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn start() -> Self {
            let config = ProcessorConfig {
                read_timeout: Duration::from_millis(50),
                pty_shell: Some("/bin/sh".into()),
            };
            let (listener, agent) = tokio::io::duplex(64 * 1024);
            let cancel = CancellationToken::new();
            let agent = tokio::spawn({
                let cancel = cancel.clone();
                async move { run(Framed::new(agent, LineCodec::new()), &config, cancel).await }
            });
            Self {
                listener: Framed::new(listener, LineCodec::new()),
                agent,
                cancel,
            }
        }

        async fn send(&mut self, line: &str) {
            self.listener.send(line).await.unwrap();
        }

        async fn line(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.listener.next())
                .await
                .expect("agent did not answer")
                .expect("stream ended")
                .unwrap()
        }

        /// Lines up to and including the terminator, joined
        async fn response(&mut self) -> String {
            let mut lines = Vec::new();
            loop {
                let line = self.line().await;
                let done = line.contains(END_OF_OUTPUT);
                lines.push(line);
                if done {
                    return lines.join("\n");
                }
            }
        }

        /// First line that is not terminal output
        async fn non_pty_line(&mut self) -> String {
            loop {
                let line = self.line().await;
                if !line.starts_with("PTY_DATA") {
                    return line;
                }
            }
        }

        async fn finish(self) -> Result<SessionEnd, TetherError> {
            tokio::time::timeout(Duration::from_secs(5), self.agent)
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_ping_and_exit() {
        let mut h = Harness::start();
        h.send("PING").await;
        assert_eq!(h.line().await, "PONG");

        h.send("exit").await;
        assert_eq!(h.finish().await.unwrap(), SessionEnd::Exit);
    }

    #[tokio::test]
    async fn test_eof_is_peer_closed() {
        let h = Harness::start();
        let Harness {
            listener, agent, ..
        } = h;
        drop(listener);
        let end = tokio::time::timeout(Duration::from_secs(5), agent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.unwrap(), SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop() {
        let h = Harness::start();
        h.cancel.cancel();
        assert_eq!(h.finish().await.unwrap(), SessionEnd::Exit);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_commands() {
        let mut h = Harness::start();

        h.send("echo bare").await;
        assert_eq!(strip_terminator(&h.response().await), "bare");

        h.send("SHELL echo prefixed").await;
        assert_eq!(strip_terminator(&h.response().await), "prefixed");

        h.send("false").await;
        assert!(strip_terminator(&h.response().await).starts_with("Error: "));

        h.send("INFO").await;
        assert!(h.response().await.contains("Hostname: "));
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/upload.txt");
        let path = path.to_str().unwrap();
        let mut h = Harness::start();

        h.send(&format!("START_UPLOAD {}", path)).await;
        assert_eq!(strip_terminator(&h.response().await), "OK");
        h.send(&format!("UPLOAD_CHUNK {}", encode_payload(b"payload").unwrap()))
            .await;
        assert_eq!(strip_terminator(&h.response().await), "OK");
        h.send("END_UPLOAD").await;
        assert_eq!(strip_terminator(&h.response().await), "OK");

        h.send(&format!("DOWNLOAD {}", path)).await;
        let response = h.response().await;
        let hex = strip_terminator(&response).strip_prefix(DATA_PREFIX).unwrap();
        assert_eq!(decode_payload(hex).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_malformed_command_gets_error_reply() {
        let mut h = Harness::start();
        h.send("START_UPLOAD").await;
        assert!(strip_terminator(&h.response().await).starts_with(REPLY_ERROR));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_mode_lifecycle() {
        let mut h = Harness::start();

        h.send("PTY_MODE").await;
        h.send("PTY_RESIZE 0 0").await;
        h.send(&Command::PtyData(b"echo in-pty\n".to_vec()).to_line())
            .await;
        // Shell commands are ignored while the terminal is attached
        h.send("INFO").await;
        h.send("PTY_EXIT").await;

        h.send("PING").await;
        assert_eq!(h.non_pty_line().await, "PONG");

        // Back in normal mode
        h.send("echo normal").await;
        assert_eq!(strip_terminator(&h.response_skipping_pty().await), "normal");

        // The shell exiting on its own is reported
        h.send("PTY_MODE").await;
        h.send(&Command::PtyData(b"exit\n".to_vec()).to_line()).await;
        assert_eq!(h.non_pty_line().await, "PTY_EXIT");
    }

    impl Harness {
        async fn response_skipping_pty(&mut self) -> String {
            let mut lines = Vec::new();
            loop {
                let line = self.non_pty_line().await;
                let done = line.contains(END_OF_OUTPUT);
                lines.push(line);
                if done {
                    return lines.join("\n");
                }
            }
        }
    }
}
