//! Per-session state shared by the multiplexer tasks and callers

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tt_core::error::SessionError;
use tt_core::SessionMode;
use tt_protocol::constants::{CMD_EXIT, RESPONSE_QUEUE_CAPACITY, SEND_QUEUE_CAPACITY};
use tt_protocol::{Command, TunnelFrame};

/// Capacity of the PTY data channel handed to the operator bridge
const PTY_CHANNEL_CAPACITY: usize = 256;

/// One entry of a session's send queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A command line, written verbatim
    Line(String),
    /// A relayed tunnel frame
    Tunnel(TunnelFrame),
}

impl Outbound {
    /// Render as a protocol line
    pub fn to_line(&self) -> String {
        match self {
            Self::Line(line) => line.clone(),
            Self::Tunnel(frame) => frame.to_line(),
        }
    }

    /// Whether writing this entry ends the writer
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Line(line) if line.trim() == CMD_EXIT)
    }
}

/// Traffic from the agent's terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw terminal output
    Data(Vec<u8>),
    /// The remote terminal exited
    Exit,
}

struct SessionState {
    mode: SessionMode,
    pty_tx: Option<mpsc::Sender<PtyEvent>>,
}

/// Receiving ends owned by the multiplexer tasks
pub struct SessionChannels {
    pub outbound_rx: mpsc::Receiver<Outbound>,
    pub response_tx: mpsc::Sender<String>,
}

/// Handle to one authenticated session.
///
/// Mode and PTY channel live under one lock so that entering and leaving
/// PTY mode are atomic with respect to each other.
pub struct SessionHandle {
    peer: String,
    outbound: mpsc::Sender<Outbound>,
    responses: tokio::sync::Mutex<mpsc::Receiver<String>>,
    state: Mutex<SessionState>,
    /// `true` while keepalive probes are suspended
    keepalive_paused: watch::Sender<bool>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Create a handle in `Ready` mode, plus the channel ends the
    /// multiplexer consumes
    pub fn new(peer: impl Into<String>, cancel: CancellationToken) -> (Self, SessionChannels) {
        let (outbound, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (response_tx, responses) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
        let (keepalive_paused, _) = watch::channel(false);

        let handle = Self {
            peer: peer.into(),
            outbound,
            responses: tokio::sync::Mutex::new(responses),
            state: Mutex::new(SessionState {
                mode: SessionMode::Ready,
                pty_tx: None,
            }),
            keepalive_paused,
            last_activity: Mutex::new(Instant::now()),
            cancel,
        };

        (
            handle,
            SessionChannels {
                outbound_rx,
                response_tx,
            },
        )
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn mode(&self) -> SessionMode {
        self.lock_state().mode
    }

    /// Queue a command line without blocking.
    ///
    /// Foreground commands mark the session `CommandInFlight` and pause the
    /// keepalive until [`await_response`](Self::await_response) returns.
    pub fn send(&self, text: &str) -> Result<(), SessionError> {
        let command = Command::parse(text).ok();
        let foreground = command.as_ref().map_or(true, Command::is_foreground);
        let allowed_in_pty = command.as_ref().map_or(false, Command::allowed_in_pty);

        {
            let mut state = self.lock_state();
            match state.mode {
                SessionMode::Closed => return Err(SessionError::Closed(self.peer.clone())),
                SessionMode::PtyActive if !allowed_in_pty => {
                    return Err(self.invalid_mode(state.mode));
                }
                SessionMode::AwaitingAuth => return Err(self.invalid_mode(state.mode)),
                SessionMode::CommandInFlight if foreground => {
                    return Err(SessionError::Busy(self.peer.clone()));
                }
                _ => {}
            }
            if foreground {
                state.mode = SessionMode::CommandInFlight;
                self.keepalive_paused.send_replace(true);
            }
        }

        if foreground {
            self.discard_stale_responses();
        }

        match self.outbound.try_send(Outbound::Line(text.to_string())) {
            Ok(()) => Ok(()),
            Err(err) => {
                if foreground {
                    self.finish_foreground();
                }
                Err(match err {
                    TrySendError::Full(_) => SessionError::QueueFull(self.peer.clone()),
                    TrySendError::Closed(_) => SessionError::Closed(self.peer.clone()),
                })
            }
        }
    }

    /// Wait for the next completed response.
    ///
    /// Whatever the outcome, the keepalive resumes and a foreground command
    /// in flight is considered finished.
    pub async fn await_response(&self, timeout: Duration) -> Result<String, SessionError> {
        let result = {
            let mut responses = self.responses.lock().await;
            tokio::time::timeout(timeout, responses.recv()).await
        };
        self.finish_foreground();

        match result {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(SessionError::Closed(self.peer.clone())),
            Err(_) => Err(SessionError::Timeout {
                peer: self.peer.clone(),
                after: timeout,
            }),
        }
    }

    /// Queue an entry outside the foreground protocol, waiting for room
    pub async fn enqueue(&self, entry: Outbound) -> Result<(), SessionError> {
        self.outbound
            .send(entry)
            .await
            .map_err(|_| SessionError::Closed(self.peer.clone()))
    }

    /// Queue an entry outside the foreground protocol without waiting
    pub fn try_enqueue(&self, entry: Outbound) -> Result<(), SessionError> {
        self.outbound.try_send(entry).map_err(|err| match err {
            TrySendError::Full(_) => SessionError::QueueFull(self.peer.clone()),
            TrySendError::Closed(_) => SessionError::Closed(self.peer.clone()),
        })
    }

    /// A sender into this session's queue, for tunnel relays
    pub fn notifier(&self) -> mpsc::Sender<Outbound> {
        self.outbound.clone()
    }

    /// Switch to PTY mode and return the channel carrying terminal output
    pub fn enter_pty(&self) -> Result<mpsc::Receiver<PtyEvent>, SessionError> {
        let mut state = self.lock_state();
        match state.mode {
            SessionMode::Ready => {
                let (tx, rx) = mpsc::channel(PTY_CHANNEL_CAPACITY);
                state.mode = SessionMode::PtyActive;
                state.pty_tx = Some(tx);
                Ok(rx)
            }
            mode => Err(self.invalid_mode(mode)),
        }
    }

    /// Leave PTY mode. Returns whether the session was in PTY mode.
    pub fn exit_pty(&self) -> bool {
        let mut state = self.lock_state();
        if state.mode != SessionMode::PtyActive {
            return false;
        }
        state.mode = SessionMode::Ready;
        state.pty_tx = None;
        true
    }

    pub fn is_in_pty_mode(&self) -> bool {
        self.mode() == SessionMode::PtyActive
    }

    /// Deliver terminal traffic from the agent. A remote exit clears PTY
    /// mode before the bridge is told.
    ///
    /// Returns `false` when no PTY is attached.
    pub(crate) async fn route_pty(&self, event: PtyEvent) -> bool {
        let tx = {
            let mut state = self.lock_state();
            if state.mode != SessionMode::PtyActive {
                return false;
            }
            if event == PtyEvent::Exit {
                state.mode = SessionMode::Ready;
                state.pty_tx.take()
            } else {
                state.pty_tx.clone()
            }
        };

        if let Some(tx) = tx {
            if tx.send(event).await.is_err() {
                tracing::debug!("PTY bridge for {} is gone", self.peer);
            }
        }
        true
    }

    /// Mark the session closed and stop its tasks
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            state.mode = SessionMode::Closed;
            state.pty_tx = None;
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn keepalive_watch(&self) -> watch::Receiver<bool> {
        self.keepalive_paused.subscribe()
    }

    pub fn is_keepalive_paused(&self) -> bool {
        *self.keepalive_paused.borrow()
    }

    /// Record traffic in either direction
    pub(crate) fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    fn finish_foreground(&self) {
        {
            let mut state = self.lock_state();
            if state.mode == SessionMode::CommandInFlight {
                state.mode = SessionMode::Ready;
            }
        }
        self.keepalive_paused.send_replace(false);
    }

    /// Drop responses nobody waited for, so a new command reads its own
    fn discard_stale_responses(&self) {
        if let Ok(mut responses) = self.responses.try_lock() {
            while let Ok(stale) = responses.try_recv() {
                tracing::debug!(
                    "Discarding unclaimed response from {} ({} bytes)",
                    self.peer,
                    stale.len()
                );
            }
        }
    }

    fn invalid_mode(&self, mode: SessionMode) -> SessionError {
        SessionError::InvalidMode {
            peer: self.peer.clone(),
            mode,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
