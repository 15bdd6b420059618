//! In-process transport with a scriptable handshake.
//!
//! Each accepted handshake replaces the "current" session; frames and drops are
//! injected into whichever session is current. Messages are lost when no session
//! is open, the same as on a real socket.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::dispatcher::Event;

use super::{Transport, TransportError, TransportSession};

/// Scripted result of the next handshake
#[derive(Debug, Clone)]
pub enum HandshakeOutcome {
    Accept,
    Reject(TransportError),
    /// Never resolves; exercises the handshake timeout
    Hang,
}

enum SessionInput {
    Frame(String),
    Fail(TransportError),
    Close,
}

#[derive(Default)]
struct MemoryState {
    script: VecDeque<HandshakeOutcome>,
    current: Option<mpsc::UnboundedSender<SessionInput>>,
    attempts: u32,
    credentials_seen: Vec<String>,
}

/// In-memory transport. Handshakes accept by default once the script is empty.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next handshakes, in order
    pub fn script(&self, outcomes: impl IntoIterator<Item = HandshakeOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Total handshakes attempted so far
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Credentials presented at each handshake, oldest first
    pub fn credentials_seen(&self) -> Vec<String> {
        self.lock().credentials_seen.clone()
    }

    pub fn has_session(&self) -> bool {
        self.lock()
            .current
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Deliver a raw text frame to the current session
    pub fn push_frame(&self, frame: impl Into<String>) -> bool {
        self.send(SessionInput::Frame(frame.into()))
    }

    /// Deliver an event to the current session
    pub fn push_event(&self, name: &str, body: serde_json::Value) -> bool {
        self.push_frame(Event::new(name, body).to_frame())
    }

    /// Break the current session with an error
    pub fn drop_connection(&self, error: TransportError) -> bool {
        let sent = self.send(SessionInput::Fail(error));
        self.lock().current = None;
        sent
    }

    /// Close the current session cleanly from the server side
    pub fn close_connection(&self) -> bool {
        let sent = self.send(SessionInput::Close);
        self.lock().current = None;
        sent
    }

    fn send(&self, input: SessionInput) -> bool {
        match self.lock().current.as_ref() {
            Some(tx) => tx.send(input).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, credential: &str) -> Result<Box<dyn TransportSession>, TransportError> {
        let outcome = {
            let mut state = self.lock();
            state.attempts += 1;
            state.credentials_seen.push(credential.to_string());
            state.script.pop_front().unwrap_or(HandshakeOutcome::Accept)
        };

        match outcome {
            HandshakeOutcome::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.lock().current = Some(tx);
                Ok(Box::new(MemorySession { rx }))
            }
            HandshakeOutcome::Reject(error) => Err(error),
            HandshakeOutcome::Hang => {
                futures::future::pending::<()>().await;
                Err(TransportError::Timeout)
            }
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    rx: mpsc::UnboundedReceiver<SessionInput>,
}

#[async_trait]
impl TransportSession for MemorySession {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        match self.rx.recv().await? {
            SessionInput::Frame(frame) => Some(Ok(frame)),
            SessionInput::Fail(error) => Some(Err(error)),
            SessionInput::Close => None,
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
