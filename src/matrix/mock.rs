//! Mock Matrix transport for testing
//!
//! Records every lifecycle call in order so tests can assert on sequencing.

use super::traits::*;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Handshake verdict the mock should return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockHandshake {
    #[default]
    Accept,
    TokenRejected,
    ExclusivityRejected,
    Unreachable,
}

/// A call made against the mock, in order of arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Start(SocketAddr),
    Handshake,
    InitAsBot,
    Ready(bool),
    Notice(RoomId, String),
    Stop,
}

/// Mock transport for testing
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    bot: UserId,
}

#[derive(Default)]
struct MockState {
    events: Vec<TransportEvent>,
    handshake: MockHandshake,
    fail_init_as_bot: bool,
    listening: Option<SocketAddr>,
    ready: bool,
}

impl MockTransport {
    pub fn new(bot: UserId) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            bot,
        }
    }

    /// Set the verdict of the next handshakes
    pub fn set_handshake(&self, verdict: MockHandshake) {
        self.state.lock().unwrap().handshake = verdict;
    }

    /// Make `init_as_bot` fail
    pub fn fail_init_as_bot(&self) {
        self.state.lock().unwrap().fail_init_as_bot = true;
    }

    /// Recorded calls
    pub fn events(&self) -> Vec<TransportEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Notices sent, as (room, text)
    pub fn notices(&self) -> Vec<(RoomId, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Notice(room, text) => Some((room, text)),
                _ => None,
            })
            .collect()
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().unwrap().listening.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, addr: SocketAddr) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(TransportEvent::Start(addr));
        state.listening = Some(addr);
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(TransportEvent::Stop);
        state.listening = None;
        state.ready = false;
        Ok(())
    }

    async fn wait_for_connection(&self) -> Result<(), HandshakeError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(TransportEvent::Handshake);
        match state.handshake {
            MockHandshake::Accept => Ok(()),
            MockHandshake::TokenRejected => Err(HandshakeError::TokenRejected),
            MockHandshake::ExclusivityRejected => Err(HandshakeError::ExclusivityRejected),
            MockHandshake::Unreachable => Err(HandshakeError::Transport(TransportError::Network(
                "connection refused".to_string(),
            ))),
        }
    }

    async fn init_as_bot(&self) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(TransportEvent::InitAsBot);
        if state.fail_init_as_bot {
            return Err(TransportError::Matrix {
                status: 500,
                errcode: "M_UNKNOWN".to_string(),
                message: "profile update failed".to_string(),
            });
        }
        Ok(())
    }

    fn set_ready(&self, ready: bool) {
        let mut state = self.state.lock().unwrap();
        state.events.push(TransportEvent::Ready(ready));
        state.ready = ready;
    }

    async fn send_notice(&self, room: &RoomId, text: &str) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .push(TransportEvent::Notice(room.clone(), text.to_string()));
        Ok(())
    }

    fn bot_user_id(&self) -> &UserId {
        &self.bot
    }
}
