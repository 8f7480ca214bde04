//! Reader and writer tasks for one session
//!
//! The reader turns agent lines into completed responses, PTY events and
//! tunnel frames. The writer drains the send queue in FIFO order and
//! injects a `PING` whenever the session has been idle for the keepalive
//! interval and no foreground command is waiting.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use tt_core::TetherError;
use tt_protocol::constants::{
    CMD_PING, CMD_PONG, CMD_PTY_DATA, CMD_PTY_EXIT, CMD_SOCKS_START, CMD_TUNNEL_CLOSE,
    CMD_TUNNEL_DATA, CMD_TUNNEL_OPEN, CMD_TUNNEL_STOP, MAX_BUFFER_SIZE, PING_INTERVAL,
};
use tt_protocol::{unescape_output_line, Command, LineCodec, ProtocolError, END_OF_OUTPUT};

use super::handle::{Outbound, PtyEvent, SessionChannels, SessionHandle};
use crate::tunnel::TunnelManagers;

/// Limits applied to one session's traffic
#[derive(Debug, Clone, Copy)]
pub struct MultiplexerConfig {
    /// Largest accumulated response before it is reset
    pub max_buffer_size: usize,
    /// Idle time before a keepalive probe
    pub ping_interval: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: MAX_BUFFER_SIZE,
            ping_interval: PING_INTERVAL,
        }
    }
}

/// Drive a session until the agent disconnects or the session is closed.
///
/// The writer runs on its own task; the reader runs on the caller's.
pub async fn run<S>(
    handle: Arc<SessionHandle>,
    framed: Framed<S, LineCodec>,
    channels: SessionChannels,
    tunnels: Arc<TunnelManagers>,
    config: MultiplexerConfig,
) -> Result<(), TetherError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (sink, stream) = framed.split();

    let writer = tokio::spawn({
        let handle = Arc::clone(&handle);
        async move {
            let result = write_loop(&handle, sink, channels.outbound_rx, config.ping_interval).await;
            if let Err(e) = &result {
                tracing::warn!("Writer for {} failed: {}", handle.peer(), e);
                handle.cancel_token().cancel();
            }
            result
        }
    });

    let result = read_loop(&handle, stream, channels.response_tx, &tunnels, config).await;

    handle.cancel_token().cancel();
    if let Err(e) = writer.await {
        tracing::error!("Writer task for {} panicked: {}", handle.peer(), e);
    }
    result
}

async fn read_loop<S>(
    handle: &SessionHandle,
    mut stream: SplitStream<Framed<S, LineCodec>>,
    response_tx: mpsc::Sender<String>,
    tunnels: &TunnelManagers,
    config: MultiplexerConfig,
) -> Result<(), TetherError>
where
    S: AsyncRead + AsyncWrite,
{
    let mut buffer = String::new();

    loop {
        let line = tokio::select! {
            _ = handle.cancel_token().cancelled() => return Ok(()),
            next = stream.next() => match next {
                None => {
                    tracing::debug!("{} closed the connection", handle.peer());
                    return Ok(());
                }
                Some(Err(ProtocolError::Io(e))) => {
                    return Err(TetherError::transport("read error", e));
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) => line,
            }
        };
        handle.touch();

        let verb = line.split(' ').next().unwrap_or_default();
        match verb {
            CMD_PONG => {
                tracing::trace!("PONG from {}", handle.peer());
            }
            CMD_PING => {
                let _ = handle.try_enqueue(Outbound::Line(CMD_PONG.to_string()));
            }
            CMD_PTY_DATA | CMD_PTY_EXIT => route_pty(handle, &line).await,
            CMD_TUNNEL_OPEN | CMD_TUNNEL_DATA | CMD_TUNNEL_CLOSE | CMD_TUNNEL_STOP
            | CMD_SOCKS_START => route_tunnel(handle, tunnels, &line).await,
            _ => accumulate(handle, &mut buffer, &line, &response_tx, config.max_buffer_size),
        }
    }
}

async fn route_pty(handle: &SessionHandle, line: &str) {
    let event = match Command::parse(line) {
        Ok(Command::PtyData(bytes)) => PtyEvent::Data(bytes),
        Ok(Command::PtyExit) => PtyEvent::Exit,
        Ok(_) => return,
        Err(e) => {
            tracing::warn!("Malformed PTY line from {}: {}", handle.peer(), e);
            return;
        }
    };
    if !handle.route_pty(event).await {
        tracing::debug!("Dropping PTY traffic from {} outside PTY mode", handle.peer());
    }
}

async fn route_tunnel(handle: &SessionHandle, tunnels: &TunnelManagers, line: &str) {
    match Command::parse(line) {
        Ok(Command::Tunnel(frame)) => {
            if !tunnels.dispatch(frame).await {
                tracing::debug!("No relayed connection for tunnel frame from {}", handle.peer());
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Malformed tunnel line from {}: {}", handle.peer(), e),
    }
}

fn accumulate(
    handle: &SessionHandle,
    buffer: &mut String,
    line: &str,
    response_tx: &mpsc::Sender<String>,
    max_buffer_size: usize,
) {
    // Escaped lines are output that only looked like protocol traffic
    let escaped = unescape_output_line(line);
    buffer.push_str(escaped.unwrap_or(line));
    buffer.push('\n');

    if escaped.is_none() && line.contains(END_OF_OUTPUT) {
        let response = std::mem::take(buffer);
        if let Err(mpsc::error::TrySendError::Full(_)) = response_tx.try_send(response) {
            tracing::warn!("Response queue for {} is full; dropping response", handle.peer());
        }
        return;
    }

    if buffer.len() > max_buffer_size {
        tracing::warn!(
            "Response from {} exceeded {} bytes without a terminator; resetting buffer",
            handle.peer(),
            max_buffer_size
        );
        buffer.clear();
    }
}

async fn write_loop<S>(
    handle: &SessionHandle,
    mut sink: SplitSink<Framed<S, LineCodec>, String>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    ping_interval: Duration,
) -> Result<(), TetherError>
where
    S: AsyncRead + AsyncWrite,
{
    let mut paused = handle.keepalive_watch();

    loop {
        let deadline = handle.last_activity() + ping_interval;
        let keepalive_paused = *paused.borrow();

        tokio::select! {
            _ = handle.cancel_token().cancelled() => break,

            entry = outbound_rx.recv() => {
                let Some(entry) = entry else { break };
                sink.send(entry.to_line()).await.map_err(write_error)?;
                handle.touch();
                if entry.is_exit() {
                    tracing::debug!("Sent exit to {}; writer stopping", handle.peer());
                    let _ = sink.close().await;
                    break;
                }
            }

            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            _ = tokio::time::sleep_until(deadline), if !keepalive_paused => {
                if handle.last_activity().elapsed() >= ping_interval {
                    tracing::trace!("PING to {}", handle.peer());
                    sink.send(CMD_PING.to_string()).await.map_err(write_error)?;
                    handle.touch();
                }
            }
        }
    }
    Ok(())
}

fn write_error(e: ProtocolError) -> TetherError {
    match e {
        ProtocolError::Io(e) => TetherError::transport("write error", e),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio_util::sync::CancellationToken;

    use tt_core::SessionMode;

    struct Harness {
        handle: Arc<SessionHandle>,
        agent: BufReader<DuplexStream>,
        task: tokio::task::JoinHandle<Result<(), TetherError>>,
    }

    fn start(config: MultiplexerConfig) -> Harness {
        let (listener_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (handle, channels) = SessionHandle::new("10.0.0.2:4000", CancellationToken::new());
        let handle = Arc::new(handle);
        let framed = Framed::new(listener_side, LineCodec::with_max_length(config.max_buffer_size));
        let task = tokio::spawn(run(
            Arc::clone(&handle),
            framed,
            channels,
            Arc::new(TunnelManagers::new()),
            config,
        ));
        Harness {
            handle,
            agent: BufReader::new(agent_side),
            task,
        }
    }

    async fn read_line(agent: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        agent.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let mut h = start(MultiplexerConfig::default());

        h.handle.send("uname").unwrap();
        assert_eq!(read_line(&mut h.agent).await, "uname");

        h.agent
            .get_mut()
            .write_all(b"Linux\n<<<END_OF_OUTPUT>>>\n")
            .await
            .unwrap();
        let response = h.handle.await_response(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response, "Linux\n<<<END_OF_OUTPUT>>>\n");
        assert_eq!(h.handle.mode(), SessionMode::Ready);
    }

    #[tokio::test]
    async fn test_pong_is_not_a_response() {
        let mut h = start(MultiplexerConfig::default());
        h.handle.send("id").unwrap();
        assert_eq!(read_line(&mut h.agent).await, "id");

        h.agent
            .get_mut()
            .write_all(b"PONG\nuid=0\n<<<END_OF_OUTPUT>>>\n")
            .await
            .unwrap();
        let response = h.handle.await_response(Duration::from_secs(2)).await.unwrap();
        assert!(!response.contains("PONG"));
        assert!(response.starts_with("uid=0"));
    }

    #[tokio::test]
    async fn test_protocol_lookalikes_stay_in_output() {
        let mut h = start(MultiplexerConfig::default());
        h.handle.send("cat notes.txt").unwrap();
        assert_eq!(read_line(&mut h.agent).await, "cat notes.txt");

        let output = "line one\nPONG\nTUNNEL_CLOSE t 1\nPTY_EXIT\n\\server\\share\nline five\n";
        let reply = tt_protocol::terminate(output) + "\n";
        h.agent.get_mut().write_all(reply.as_bytes()).await.unwrap();

        let response = h.handle.await_response(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response, format!("{}<<<END_OF_OUTPUT>>>\n", output));
        assert!(!h.handle.is_closed());
    }

    #[tokio::test]
    async fn test_overflow_resets_without_disconnect() {
        let mut h = start(MultiplexerConfig {
            max_buffer_size: 1024,
            ..MultiplexerConfig::default()
        });

        // Many short lines and one over-long line, none terminated
        let burst = "x".repeat(100) + "\n";
        for _ in 0..30 {
            h.agent.get_mut().write_all(burst.as_bytes()).await.unwrap();
        }
        h.agent
            .get_mut()
            .write_all(format!("{}\n", "y".repeat(4096)).as_bytes())
            .await
            .unwrap();

        h.handle.send("echo ok").unwrap();
        assert_eq!(read_line(&mut h.agent).await, "echo ok");
        h.agent
            .get_mut()
            .write_all(b"ok\n<<<END_OF_OUTPUT>>>\n")
            .await
            .unwrap();

        let response = h.handle.await_response(Duration::from_secs(2)).await.unwrap();
        assert!(response.len() < 1024);
        assert!(response.ends_with("ok\n<<<END_OF_OUTPUT>>>\n"));
        assert!(!h.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping_when_idle() {
        let mut h = start(MultiplexerConfig {
            ping_interval: Duration::from_secs(30),
            ..MultiplexerConfig::default()
        });
        assert_eq!(read_line(&mut h.agent).await, "PING");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ping_while_command_in_flight() {
        let mut h = start(MultiplexerConfig {
            ping_interval: Duration::from_secs(1),
            ..MultiplexerConfig::default()
        });
        h.handle.send("sleep 5").unwrap();
        assert_eq!(read_line(&mut h.agent).await, "sleep 5");

        let mut line = String::new();
        let quiet = tokio::time::timeout(Duration::from_secs(5), h.agent.read_line(&mut line)).await;
        assert!(quiet.is_err(), "unexpected line while paused: {:?}", line);
    }

    #[tokio::test]
    async fn test_eof_ends_session() {
        let h = start(MultiplexerConfig::default());
        drop(h.agent);
        let result = tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(h.handle.is_closed());
    }

    #[tokio::test]
    async fn test_pty_lines_reach_bridge() {
        let mut h = start(MultiplexerConfig::default());
        let mut pty = h.handle.enter_pty().unwrap();

        h.agent
            .get_mut()
            .write_all(b"PTY_DATA 6869\nPTY_EXIT\n")
            .await
            .unwrap();
        assert_eq!(pty.recv().await, Some(PtyEvent::Data(b"hi".to_vec())));
        assert_eq!(pty.recv().await, Some(PtyEvent::Exit));
        assert!(!h.handle.is_in_pty_mode());
    }

    #[tokio::test]
    async fn test_exit_stops_writer() {
        let mut h = start(MultiplexerConfig::default());
        h.handle.send("exit").unwrap();
        assert_eq!(read_line(&mut h.agent).await, "exit");
        assert_eq!(read_line(&mut h.agent).await, "");
    }
}
