//! Protocol constants shared by both ends of a control channel

use std::time::Duration;

/// Marks the end of one logical response from the agent.
pub const END_OF_OUTPUT: &str = "<<<END_OF_OUTPUT>>>";

/// Prefix the agent puts on response lines the listener would otherwise
/// route or treat as the terminator. Removed again before accumulation.
pub const OUTPUT_ESCAPE: char = '\\';

/// Prefix of a download response payload.
pub const DATA_PREFIX: &str = "DATA ";

/// Acknowledgement for a file-transfer step.
pub const REPLY_OK: &str = "OK";

/// Prefix of a failed file-transfer step.
pub const REPLY_ERROR: &str = "ERROR";

pub const CMD_AUTH: &str = "AUTH";
pub const CMD_AUTH_OK: &str = "AUTH_OK";
pub const CMD_AUTH_FAILED: &str = "AUTH_FAILED";
pub const CMD_PING: &str = "PING";
pub const CMD_PONG: &str = "PONG";
pub const CMD_EXIT: &str = "exit";
pub const CMD_INFO: &str = "INFO";
pub const CMD_SHELL: &str = "SHELL";

pub const CMD_PTY_MODE: &str = "PTY_MODE";
pub const CMD_PTY_DATA: &str = "PTY_DATA";
pub const CMD_PTY_RESIZE: &str = "PTY_RESIZE";
pub const CMD_PTY_EXIT: &str = "PTY_EXIT";

pub const CMD_START_UPLOAD: &str = "START_UPLOAD";
pub const CMD_UPLOAD_CHUNK: &str = "UPLOAD_CHUNK";
pub const CMD_END_UPLOAD: &str = "END_UPLOAD";
pub const CMD_DOWNLOAD: &str = "DOWNLOAD";

pub const CMD_TUNNEL_OPEN: &str = "TUNNEL_OPEN";
pub const CMD_TUNNEL_DATA: &str = "TUNNEL_DATA";
pub const CMD_TUNNEL_CLOSE: &str = "TUNNEL_CLOSE";
pub const CMD_TUNNEL_STOP: &str = "TUNNEL_STOP";
pub const CMD_SOCKS_START: &str = "SOCKS_START";

/// Verbs the listener routes away from the response buffer
pub const ROUTED_VERBS: &[&str] = &[
    CMD_PING,
    CMD_PONG,
    CMD_PTY_DATA,
    CMD_PTY_EXIT,
    CMD_TUNNEL_OPEN,
    CMD_TUNNEL_DATA,
    CMD_TUNNEL_CLOSE,
    CMD_TUNNEL_STOP,
    CMD_SOCKS_START,
];

/// Scratch buffer size for large transfers (1 MiB)
pub const BUFFER_SIZE_1MB: usize = 1024 * 1024;

/// Maximum accumulated response size before the buffer is reset (10 MiB)
pub const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Source bytes per upload chunk, measured before compression
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Bytes read from a relayed socket per tunnel frame
pub const TUNNEL_READ_SIZE: usize = 32 * 1024;

/// Capacity of a session's outbound command queue.
///
/// Foreground commands are awaited one at a time, so the queue mostly holds
/// keepalive, PTY and tunnel traffic. A full queue is reported to the caller
/// instead of blocking it.
pub const SEND_QUEUE_CAPACITY: usize = 10;

/// Capacity of a session's completed-response channel
pub const RESPONSE_QUEUE_CAPACITY: usize = 10;

/// Agent-side read poll interval
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for a file-transfer step
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a shell command
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Idle time before a keepalive probe is sent
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
