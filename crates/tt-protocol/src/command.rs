//! Control-channel commands
//!
//! Each command is one newline-terminated line. Verbs are case-sensitive and
//! separated from their argument by a single space. Any line whose first word
//! is not a known verb is a bare shell command.

use crate::constants::*;
use crate::error::ProtocolError;
use crate::payload::{decode_raw, encode_raw};
use crate::tunnel::TunnelFrame;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Both dimensions non-zero
    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// A parsed control-channel line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth(String),
    AuthOk,
    AuthFailed,
    Ping,
    Pong,
    Exit,
    Info,
    /// `SHELL <cmd>` or a bare command line
    Shell(String),
    PtyMode,
    PtyData(Vec<u8>),
    PtyResize(TerminalSize),
    PtyExit,
    StartUpload(String),
    /// Compressed, hex-encoded chunk; decoded by the receiver
    UploadChunk(String),
    EndUpload,
    Download(String),
    Tunnel(TunnelFrame),
}

impl Command {
    /// Parse one line (trailing `\r`/`\n` already stripped or not)
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args),
            None => (line, ""),
        };

        let command = match verb {
            CMD_PING if args.is_empty() => Self::Ping,
            CMD_PONG if args.is_empty() => Self::Pong,
            CMD_EXIT if args.is_empty() => Self::Exit,
            CMD_INFO if args.is_empty() => Self::Info,
            CMD_AUTH_OK => Self::AuthOk,
            CMD_AUTH_FAILED => Self::AuthFailed,
            CMD_AUTH => {
                if args.is_empty() {
                    return Err(ProtocolError::malformed(CMD_AUTH, "missing secret"));
                }
                Self::Auth(args.to_string())
            }
            CMD_SHELL => Self::Shell(args.to_string()),
            CMD_PTY_MODE => Self::PtyMode,
            CMD_PTY_EXIT => Self::PtyExit,
            CMD_PTY_DATA => Self::PtyData(decode_raw(args)?),
            CMD_PTY_RESIZE => Self::PtyResize(parse_size(args)?),
            CMD_START_UPLOAD => Self::StartUpload(required(CMD_START_UPLOAD, args, "path")?),
            CMD_UPLOAD_CHUNK => Self::UploadChunk(required(CMD_UPLOAD_CHUNK, args, "payload")?),
            CMD_END_UPLOAD => Self::EndUpload,
            CMD_DOWNLOAD => Self::Download(required(CMD_DOWNLOAD, args, "path")?),
            CMD_TUNNEL_OPEN => Self::Tunnel(TunnelFrame::parse(CMD_TUNNEL_OPEN, args)?),
            CMD_TUNNEL_DATA => Self::Tunnel(TunnelFrame::parse(CMD_TUNNEL_DATA, args)?),
            CMD_TUNNEL_CLOSE => Self::Tunnel(TunnelFrame::parse(CMD_TUNNEL_CLOSE, args)?),
            CMD_TUNNEL_STOP => Self::Tunnel(TunnelFrame::parse(CMD_TUNNEL_STOP, args)?),
            CMD_SOCKS_START => Self::Tunnel(TunnelFrame::parse(CMD_SOCKS_START, args)?),
            _ => Self::Shell(line.to_string()),
        };
        Ok(command)
    }

    /// Render as a protocol line (without the trailing newline)
    pub fn to_line(&self) -> String {
        match self {
            Self::Auth(secret) => format!("{} {}", CMD_AUTH, secret),
            Self::AuthOk => CMD_AUTH_OK.to_string(),
            Self::AuthFailed => CMD_AUTH_FAILED.to_string(),
            Self::Ping => CMD_PING.to_string(),
            Self::Pong => CMD_PONG.to_string(),
            Self::Exit => CMD_EXIT.to_string(),
            Self::Info => CMD_INFO.to_string(),
            Self::Shell(cmd) => format!("{} {}", CMD_SHELL, cmd),
            Self::PtyMode => CMD_PTY_MODE.to_string(),
            Self::PtyData(bytes) => format!("{} {}", CMD_PTY_DATA, encode_raw(bytes)),
            Self::PtyResize(size) => format!("{} {} {}", CMD_PTY_RESIZE, size.rows, size.cols),
            Self::PtyExit => CMD_PTY_EXIT.to_string(),
            Self::StartUpload(path) => format!("{} {}", CMD_START_UPLOAD, path),
            Self::UploadChunk(hex) => format!("{} {}", CMD_UPLOAD_CHUNK, hex),
            Self::EndUpload => CMD_END_UPLOAD.to_string(),
            Self::Download(path) => format!("{} {}", CMD_DOWNLOAD, path),
            Self::Tunnel(frame) => frame.to_line(),
        }
    }

    /// Whether the caller waits for a terminated response to this command
    pub fn is_foreground(&self) -> bool {
        !matches!(
            self,
            Self::Ping
                | Self::Pong
                | Self::Exit
                | Self::PtyMode
                | Self::PtyData(_)
                | Self::PtyResize(_)
                | Self::PtyExit
                | Self::Tunnel(_)
        )
    }

    /// Commands that may be sent while a PTY is attached
    pub fn allowed_in_pty(&self) -> bool {
        matches!(
            self,
            Self::Ping
                | Self::Pong
                | Self::Exit
                | Self::PtyData(_)
                | Self::PtyResize(_)
                | Self::PtyExit
                | Self::Tunnel(_)
        )
    }
}

fn required(command: &'static str, args: &str, what: &str) -> Result<String, ProtocolError> {
    let value = args.trim();
    if value.is_empty() {
        return Err(ProtocolError::malformed(command, format!("missing {}", what)));
    }
    Ok(value.to_string())
}

fn parse_size(args: &str) -> Result<TerminalSize, ProtocolError> {
    let mut parts = args.split_whitespace();
    let mut dim = |name: &str| -> Result<u16, ProtocolError> {
        parts
            .next()
            .ok_or_else(|| ProtocolError::malformed(CMD_PTY_RESIZE, format!("missing {}", name)))?
            .parse()
            .map_err(|_| ProtocolError::malformed(CMD_PTY_RESIZE, format!("invalid {}", name)))
    };
    let rows = dim("rows")?;
    let cols = dim("cols")?;
    Ok(TerminalSize::new(rows, cols))
}

/// Append the response terminator to command output.
///
/// Output lines that start with a routed verb, start with
/// [`OUTPUT_ESCAPE`] or contain the terminator are escaped so the listener
/// keeps them in the response.
pub fn terminate(output: &str) -> String {
    let mut response = String::with_capacity(output.len() + END_OF_OUTPUT.len() + 1);
    for line in output.split_inclusive('\n') {
        if needs_escape(line.trim_end_matches(['\r', '\n'])) {
            response.push(OUTPUT_ESCAPE);
        }
        response.push_str(line);
    }
    if !response.is_empty() && !response.ends_with('\n') {
        response.push('\n');
    }
    response.push_str(END_OF_OUTPUT);
    response
}

fn needs_escape(line: &str) -> bool {
    let verb = line.split(' ').next().unwrap_or_default();
    line.starts_with(OUTPUT_ESCAPE) || line.contains(END_OF_OUTPUT) || ROUTED_VERBS.contains(&verb)
}

/// Undo [`terminate`]'s escaping for one received line. Returns `None` for
/// lines that were sent as-is.
pub fn unescape_output_line(line: &str) -> Option<&str> {
    line.strip_prefix(OUTPUT_ESCAPE)
}

/// Strip the terminator and surrounding whitespace from a completed response
pub fn strip_terminator(response: &str) -> &str {
    let body = match response.find(END_OF_OUTPUT) {
        Some(idx) => &response[..idx],
        None => response,
    };
    body.trim()
}
