//! In-process connector for tests.
//!
//! [`LoopbackConnector`] hands out channel-backed sockets. Each successful
//! open queues a [`RemoteEnd`] that the test drives as the server: it reads
//! what the client sent and injects frames, errors and closes.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use chatlink_proto::codec;
use chatlink_proto::frame::{ClientFrame, ServerFrame};

use super::{ConnectionError, Connector, Link, LinkCommand, LinkEvent};

#[derive(Default)]
struct Behaviour {
    refuse: bool,
    stall: bool,
    attempts: Vec<(Url, Instant)>,
}

/// Channel-backed [`Connector`]. Clones share state.
#[derive(Clone)]
pub struct LoopbackConnector {
    behaviour: Arc<Mutex<Behaviour>>,
    accepted_tx: mpsc::UnboundedSender<RemoteEnd>,
    accepted_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RemoteEnd>>>,
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConnector {
    /// Creates a connector that accepts every open.
    #[must_use]
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            behaviour: Arc::new(Mutex::new(Behaviour::default())),
            accepted_tx,
            accepted_rx: Arc::new(tokio::sync::Mutex::new(accepted_rx)),
        }
    }

    /// Makes subsequent opens fail with a transport error.
    pub fn refuse(&self, refuse: bool) {
        self.behaviour.lock().refuse = refuse;
    }

    /// Makes subsequent opens hang until the caller's timeout fires.
    pub fn stall(&self, stall: bool) {
        self.behaviour.lock().stall = stall;
    }

    /// Times of every open attempt, successful or not.
    #[must_use]
    pub fn open_attempts(&self) -> Vec<Instant> {
        self.behaviour.lock().attempts.iter().map(|(_, at)| *at).collect()
    }

    /// URL of the most recent open attempt.
    #[must_use]
    pub fn last_url(&self) -> Option<Url> {
        self.behaviour.lock().attempts.last().map(|(url, _)| url.clone())
    }

    /// Waits for the next successfully opened socket.
    pub async fn accept(&self) -> Option<RemoteEnd> {
        self.accepted_rx.lock().await.recv().await
    }
}

impl Connector for LoopbackConnector {
    async fn open(&self, url: &Url) -> Result<Link, ConnectionError> {
        let (refuse, stall) = {
            let mut behaviour = self.behaviour.lock();
            behaviour.attempts.push((url.clone(), Instant::now()));
            (behaviour.refuse, behaviour.stall)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if refuse {
            return Err(ConnectionError::Transport("connection refused".into()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.accepted_tx
            .send(RemoteEnd {
                to_client,
                from_client,
            })
            .map_err(|_| ConnectionError::Transport("loopback server gone".into()))?;
        Ok(Link { outbound, inbound })
    }
}

/// The server side of one loopback socket.
pub struct RemoteEnd {
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<LinkCommand>,
}

impl RemoteEnd {
    /// Sends raw text to the client.
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(LinkEvent::Text(text.to_string()));
    }

    /// Sends an encoded frame to the client.
    pub fn send_frame(&self, frame: &ServerFrame) {
        if let Ok(text) = codec::encode(frame) {
            let _ = self.to_client.send(LinkEvent::Text(text));
        }
    }

    /// Reports a transport error to the client without closing.
    pub fn error(&self, reason: &str) {
        let _ = self.to_client.send(LinkEvent::Error(reason.to_string()));
    }

    /// Closes the socket with `code` (`None` simulates a dropped connection).
    pub fn close(&self, code: Option<u16>) {
        let _ = self.to_client.send(LinkEvent::Closed { code });
    }

    /// Next command from the client, without waiting.
    pub fn try_recv(&mut self) -> Option<LinkCommand> {
        self.from_client.try_recv().ok()
    }

    /// Waits for the next command from the client.
    pub async fn recv(&mut self) -> Option<LinkCommand> {
        self.from_client.recv().await
    }

    /// Waits for the next decodable frame from the client. Returns `None`
    /// once the client closes the socket.
    pub async fn recv_frame(&mut self) -> Option<ClientFrame> {
        loop {
            match self.from_client.recv().await? {
                LinkCommand::Text(text) => match codec::decode(&text) {
                    Ok(frame) => return Some(frame),
                    Err(e) => tracing::debug!(error = %e, "loopback server skipped frame"),
                },
                LinkCommand::Close { .. } => return None,
            }
        }
    }
}
