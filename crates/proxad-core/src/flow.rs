use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;
use uuid::Uuid;

use crate::value::Value;

/// Lifecycle of an intercepted connection.
///
/// Transitions are monotonic: once a flow reaches `Closed` or `Killed` it
/// never leaves that state, and no further filter invocations happen for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Accepted, TLS/upstream setup still in progress.
    Opening,
    /// Both directions pumping.
    Open,
    /// Client sent EOF; the server→client direction may still drain.
    HalfClosedClient,
    /// Upstream sent EOF; the client→server direction may still drain.
    HalfClosedServer,
    /// Both directions done.
    Closed,
    /// A filter returned Kill.
    Killed,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Closed | FlowState::Killed)
    }
}

/// Why a flow ended. Passed to the close hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Clean EOF on both directions.
    Closed,
    /// A filter returned Kill.
    Killed,
    /// I/O or protocol failure on either side.
    Errored,
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseCause::Closed => "closed",
            CloseCause::Killed => "killed",
            CloseCause::Errored => "errored",
        })
    }
}

/// One intercepted client-to-upstream connection.
///
/// The engine owns the streams; the flow carries everything filters may see:
/// the append-only byte histories of both directions, the peer addresses, and
/// an open `user_attrs` map that filters read and write freely (the engine
/// never interprets it).
pub struct Flow {
    id: Uuid,
    state: FlowState,
    client_history: BytesMut,
    server_history: BytesMut,
    pub user_attrs: HashMap<String, Value>,
    pub client_endpoint: SocketAddr,
    pub server_endpoint: SocketAddr,
}

impl Flow {
    pub fn new(client_endpoint: SocketAddr, server_endpoint: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: FlowState::Opening,
            client_history: BytesMut::new(),
            server_history: BytesMut::new(),
            user_attrs: HashMap::new(),
            client_endpoint,
            server_endpoint,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Everything received from the client so far, pre-filter.
    pub fn client_history(&self) -> &[u8] {
        &self.client_history
    }

    /// Everything received from the upstream so far, pre-filter.
    pub fn server_history(&self) -> &[u8] {
        &self.server_history
    }

    /// Engine-side: append bytes received from the client. Appends after the
    /// flow reached a terminal state are ignored.
    pub fn record_client(&mut self, chunk: &[u8]) {
        if !self.state.is_terminal() {
            self.client_history.extend_from_slice(chunk);
        }
    }

    /// Engine-side: append bytes received from the upstream.
    pub fn record_server(&mut self, chunk: &[u8]) {
        if !self.state.is_terminal() {
            self.server_history.extend_from_slice(chunk);
        }
    }

    /// Advance the lifecycle. Backwards transitions and transitions out of a
    /// terminal state are ignored; returns whether the state changed.
    pub fn advance(&mut self, next: FlowState) -> bool {
        if self.state.is_terminal() || self.state == next {
            return false;
        }
        // Half-close states only follow Opening/Open.
        if matches!(
            next,
            FlowState::HalfClosedClient | FlowState::HalfClosedServer
        ) && matches!(
            self.state,
            FlowState::HalfClosedClient | FlowState::HalfClosedServer
        ) {
            return false;
        }
        if next == FlowState::Opening {
            return false;
        }
        self.state = next;
        true
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("client", &self.client_endpoint)
            .field("server", &self.server_endpoint)
            .field("client_history_len", &self.client_history.len())
            .field("server_history_len", &self.server_history.len())
            .finish()
    }
}

/// A flow whose byte stream is being interpreted as HTTP/1.x.
///
/// Wraps the raw [`Flow`] (histories keep accumulating the wire bytes) and
/// adds the request ordinal. Operator slots like `session_id` live in
/// `user_attrs`, same as in raw mode.
#[derive(Debug)]
pub struct HttpFlow {
    pub flow: Flow,
    request_count: u64,
}

impl HttpFlow {
    pub fn new(flow: Flow) -> Self {
        Self {
            flow,
            request_count: 0,
        }
    }

    /// Ordinal of the most recently parsed request, starting at 1.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Engine-side: called once per fully parsed request.
    pub fn next_request(&mut self) -> u64 {
        self.request_count += 1;
        self.request_count
    }

    pub fn session_id(&self) -> Option<&str> {
        match self.flow.user_attrs.get("session_id") {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.flow
            .user_attrs
            .insert("session_id".into(), Value::Str(session_id.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn histories_accumulate_in_order() {
        let mut flow = Flow::new(addr(1000), addr(2000));
        flow.record_client(b"PING-1\n");
        flow.record_client(b"PING-2\n");
        flow.record_server(b"PONG");
        assert_eq!(flow.client_history(), b"PING-1\nPING-2\n");
        assert_eq!(flow.server_history(), b"PONG");
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut flow = Flow::new(addr(1), addr(2));
        assert!(flow.advance(FlowState::Open));
        assert!(flow.advance(FlowState::Killed));
        assert!(!flow.advance(FlowState::Closed));
        assert_eq!(flow.state(), FlowState::Killed);

        flow.record_client(b"late");
        assert!(flow.client_history().is_empty());
    }

    #[test]
    fn half_close_does_not_flip_sides() {
        let mut flow = Flow::new(addr(1), addr(2));
        flow.advance(FlowState::Open);
        assert!(flow.advance(FlowState::HalfClosedClient));
        assert!(!flow.advance(FlowState::HalfClosedServer));
        assert!(flow.advance(FlowState::Closed));
    }

    #[test]
    fn request_ordinals_are_monotonic() {
        let mut flow = HttpFlow::new(Flow::new(addr(1), addr(2)));
        assert_eq!(flow.request_count(), 0);
        assert_eq!(flow.next_request(), 1);
        assert_eq!(flow.next_request(), 2);
    }

    #[test]
    fn session_id_lives_in_user_attrs() {
        let mut flow = HttpFlow::new(Flow::new(addr(1), addr(2)));
        assert!(flow.session_id().is_none());
        flow.set_session_id("deadbeef");
        assert_eq!(flow.session_id(), Some("deadbeef"));
        assert!(flow.flow.user_attrs.contains_key("session_id"));
    }
}
