//! Scripted connector for hardware-free operation and tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::Connector;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Plain `:A` acknowledgement.
    Ack,
    /// `:A` with a payload, e.g. `AckWith("X=1")` replies `:A X=1`.
    AckWith(String),
    /// Card fault, replies `:N-<code>`.
    Fault(i32),
    /// Arbitrary raw line (for malformed-reply tests).
    Raw(String),
    /// Never replies within any realistic command timeout.
    Hang,
}

impl MockReply {
    fn render(&self) -> String {
        match self {
            MockReply::Ack => ":A".to_string(),
            MockReply::AckWith(payload) => format!(":A {}", payload),
            MockReply::Fault(code) => format!(":N{}", code),
            MockReply::Raw(line) => line.clone(),
            MockReply::Hang => String::new(),
        }
    }
}

#[derive(Default)]
struct Shared {
    log: Vec<String>,
    /// Prefix-matched reply scripts, consulted before the default `:A`.
    rules: Vec<(String, VecDeque<MockReply>)>,
}

/// Handle for scripting replies and inspecting the command log from tests,
/// kept after the connector itself moves into the session.
#[derive(Clone, Default)]
pub struct MockController {
    shared: Arc<Mutex<Shared>>,
}

impl MockController {
    /// Queue a reply for the next command whose encoded line starts with
    /// `prefix`. Multiple stubs for the same prefix are consumed in order.
    pub fn stub(&self, prefix: &str, reply: MockReply) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, queue)) = shared.rules.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(reply);
        } else {
            shared
                .rules
                .push((prefix.to_string(), VecDeque::from([reply])));
        }
    }

    /// Snapshot of every command line sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .log
            .clone()
    }

    /// Number of command lines sent so far.
    pub fn sent_count(&self) -> usize {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .log
            .len()
    }

    fn record(&self, line: &str) -> MockReply {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.log.push(line.to_string());
        for (prefix, queue) in shared.rules.iter_mut() {
            if line.starts_with(prefix.as_str()) {
                if let Some(reply) = queue.pop_front() {
                    return reply;
                }
            }
        }
        MockReply::Ack
    }
}

/// Connector that answers every command from its script, defaulting to `:A`.
#[derive(Clone, Default)]
pub struct MockConnector {
    controller: MockController,
    connected: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripting/inspection handle; clone before handing the connector to
    /// the session.
    pub fn controller(&self) -> MockController {
        self.controller.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn send_raw(&mut self, line: &str) -> anyhow::Result<String> {
        anyhow::ensure!(self.connected, "mock connector not connected");
        let reply = self.controller.record(line);
        debug!(command = line, ?reply, "mock connector");
        if matches!(reply, MockReply::Hang) {
            // Outlive any realistic command timeout; the session gives up first.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(reply.render())
    }

    async fn send_raw_no_reply(&mut self, line: &str) -> anyhow::Result<()> {
        anyhow::ensure!(self.connected, "mock connector not connected");
        let _ = self.controller.record(line);
        Ok(())
    }
}
