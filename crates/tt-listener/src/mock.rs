//! Scripted `CommandChannel` for unit tests

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use tt_core::error::SessionError;
use tt_core::traits::CommandChannel;

#[derive(Default)]
struct Script {
    clients: Vec<String>,
    sent: Vec<String>,
    responses: VecDeque<String>,
    /// Zero-based send calls that fail
    failing_sends: Vec<usize>,
    send_calls: usize,
    fail_all_sends: bool,
    fail_awaits: bool,
}

/// Records sent lines and replays canned responses. With no responses
/// left, `await_response` yields an empty string.
#[derive(Default)]
pub struct MockChannel {
    script: Mutex<Script>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clients(clients: &[&str]) -> Self {
        let mock = Self::new();
        mock.script.lock().unwrap().clients = clients.iter().map(|c| c.to_string()).collect();
        mock
    }

    pub fn respond(self, response: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .responses
            .push_back(response.to_string());
        self
    }

    pub fn fail_send(self, call: usize) -> Self {
        self.script.lock().unwrap().failing_sends.push(call);
        self
    }

    pub fn fail_all_sends(self) -> Self {
        self.script.lock().unwrap().fail_all_sends = true;
        self
    }

    pub fn fail_awaits(self) -> Self {
        self.script.lock().unwrap().fail_awaits = true;
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.script.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    fn clients(&self) -> Vec<String> {
        self.script.lock().unwrap().clients.clone()
    }

    fn send(&self, peer: &str, command: &str) -> Result<(), SessionError> {
        let mut script = self.script.lock().unwrap();
        let call = script.send_calls;
        script.send_calls += 1;
        if script.fail_all_sends || script.failing_sends.contains(&call) {
            return Err(SessionError::QueueFull(peer.to_string()));
        }
        script.sent.push(command.to_string());
        Ok(())
    }

    async fn await_response(&self, peer: &str, timeout: Duration) -> Result<String, SessionError> {
        let mut script = self.script.lock().unwrap();
        if script.fail_awaits {
            return Err(SessionError::Timeout {
                peer: peer.to_string(),
                after: timeout,
            });
        }
        Ok(script.responses.pop_front().unwrap_or_default())
    }
}
