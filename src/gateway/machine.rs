//! Connection state machine.
//!
//! `SessionMachine` performs no I/O. The session driver feeds it transport
//! events and decoded frames and carries out the `Action`s it returns, in
//! order. Keeping it synchronous makes every transition testable without a
//! socket or a clock.

use crate::core::config::ClientConfig;
use crate::gateway::dispatcher::DispatchEvent;
use crate::gateway::events::EventName;
use crate::gateway::protocol::{
    build_heartbeat, build_identify, build_resume, close_reason, is_fatal_close, GatewayPayload,
    HelloPayload, OpCode,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Connected,
    Reidentifying,
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(GatewayPayload),
    StartHeartbeat(Duration),
    StopHeartbeat,
    Dispatch(DispatchEvent),
    /// Drop the connection and open a new one after `delay`
    Reconnect { delay: Duration, resume: bool },
    /// Unrecoverable close; no reconnect may follow
    Fatal { code: u16, reason: String },
}

/// Point-in-time view of a session, published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub seq: Option<u64>,
    pub session_id: Option<String>,
    pub heartbeat_interval: Option<Duration>,
    pub last_ack: Option<Instant>,
    pub last_close: Option<u16>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            seq: None,
            session_id: None,
            heartbeat_interval: None,
            last_ack: None,
            last_close: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionMachine {
    config: Arc<ClientConfig>,
    state: SessionState,
    seq: Option<u64>,
    session_id: Option<String>,
    heartbeat_interval: Option<Duration>,
    last_ack: Option<Instant>,
    last_close: Option<u16>,
}

impl SessionMachine {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            seq: None,
            session_id: None,
            heartbeat_interval: None,
            last_ack: None,
            last_close: None,
        }
    }

    /// A fresh machine for the next connection, keeping what a resume needs
    pub fn carry_over(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            state: SessionState::Disconnected,
            seq: self.seq,
            session_id: self.session_id.clone(),
            heartbeat_interval: self.heartbeat_interval,
            last_ack: None,
            last_close: self.last_close,
        }
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub const fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub const fn last_close(&self) -> Option<u16> {
        self.last_close
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            seq: self.seq,
            session_id: self.session_id.clone(),
            heartbeat_interval: self.heartbeat_interval,
            last_ack: self.last_ack,
            last_close: self.last_close,
        }
    }

    /// Delay before the next connection attempt
    pub fn reconnect_delay(&self) -> Duration {
        self.heartbeat_interval
            .unwrap_or(self.config.fallback_reconnect_delay)
    }

    pub fn on_connecting(&mut self) {
        self.state = SessionState::Connecting;
    }

    pub fn on_connected(&mut self) {
        self.state = SessionState::AwaitingHello;
    }

    pub fn heartbeat_payload(&self) -> GatewayPayload {
        build_heartbeat(self.seq)
    }

    /// Handle one decoded inbound frame
    pub fn on_payload(&mut self, payload: GatewayPayload) -> Vec<Action> {
        if let Some(s) = payload.s {
            // Never move backwards
            self.seq = Some(self.seq.map_or(s, |cur| cur.max(s)));
        }

        let Some(op) = payload.opcode() else {
            warn!(op = payload.op, "Unknown opcode ignored");
            return Vec::new();
        };

        match op {
            OpCode::Dispatch => self.on_dispatch(payload),
            OpCode::Hello => self.on_hello(&payload),
            OpCode::HeartbeatAck => {
                self.last_ack = Some(Instant::now());
                debug!(seq = ?self.seq, "Heartbeat acknowledged");
                Vec::new()
            }
            OpCode::Heartbeat => {
                debug!("Server heartbeat received");
                Vec::new()
            }
            OpCode::Reconnect => {
                info!("Server requested reconnect");
                self.state = SessionState::Resuming;
                vec![
                    Action::StopHeartbeat,
                    Action::Reconnect {
                        delay: Duration::ZERO,
                        resume: self.session_id.is_some(),
                    },
                ]
            }
            OpCode::InvalidSession => {
                warn!(session_id = ?self.session_id, "Session invalidated, identifying again");
                self.session_id = None;
                self.seq = None;
                self.state = SessionState::Reidentifying;
                vec![Action::Send(build_identify(&self.config))]
            }
            OpCode::Identify
            | OpCode::StatusUpdate
            | OpCode::VoiceStateUpdate
            | OpCode::Resume
            | OpCode::RequestGuildMembers => {
                warn!(%op, "Outbound-only opcode received, ignored");
                Vec::new()
            }
        }
    }

    fn on_hello(&mut self, payload: &GatewayPayload) -> Vec<Action> {
        let hello: HelloPayload = match payload.data() {
            Ok(hello) => hello,
            Err(e) => {
                warn!(error = %e, "Malformed HELLO dropped");
                return Vec::new();
            }
        };
        if hello.heartbeat_interval == 0 {
            warn!("HELLO with a zero heartbeat interval dropped");
            return Vec::new();
        }
        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.heartbeat_interval = Some(interval);

        let handshake = match &self.session_id {
            Some(session_id) => {
                self.state = SessionState::Resuming;
                info!(session_id, seq = ?self.seq, "Resuming session");
                build_resume(self.config.token(), session_id, self.seq)
            }
            None => {
                self.state = SessionState::Identifying;
                self.seq = None;
                info!(
                    shard = ?[self.config.shard_index, self.config.shard_count],
                    "Identifying"
                );
                build_identify(&self.config)
            }
        };

        vec![Action::StartHeartbeat(interval), Action::Send(handshake)]
    }

    fn on_dispatch(&mut self, payload: GatewayPayload) -> Vec<Action> {
        let Some(name) = payload.t.as_deref().map(EventName::parse) else {
            warn!(seq = ?payload.s, "DISPATCH without event name dropped");
            return Vec::new();
        };

        let mut actions = Vec::with_capacity(2);
        match name {
            EventName::Ready => {
                let session_id = payload
                    .d
                    .as_ref()
                    .and_then(|d| d.get("session_id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                match session_id {
                    Some(id) => {
                        info!(session_id = %id, "Session ready");
                        self.session_id = Some(id);
                    }
                    None => warn!("READY without session_id"),
                }
                self.state = SessionState::Connected;
                if let Some(interval) = self.heartbeat_interval {
                    actions.push(Action::StartHeartbeat(interval));
                }
            }
            EventName::Resumed => {
                info!(seq = ?self.seq, "Session resumed");
                self.state = SessionState::Connected;
            }
            _ => {}
        }

        actions.push(Action::Dispatch(DispatchEvent {
            name,
            seq: payload.s,
            data: payload.d.unwrap_or_default(),
        }));
        actions
    }

    /// Handle the end of the connection
    pub fn on_close(&mut self, code: Option<u16>, reason: &str) -> Action {
        self.state = SessionState::Disconnected;
        self.last_close = code;

        if let Some(code) = code.filter(|c| is_fatal_close(*c)) {
            return Action::Fatal {
                code,
                reason: close_reason(code).to_string(),
            };
        }

        let delay = self.reconnect_delay();
        info!(?code, reason, ?delay, "Connection closed, scheduling reconnect");
        Action::Reconnect {
            delay,
            resume: self.session_id.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn machine() -> SessionMachine {
        SessionMachine::new(Arc::new(ClientConfig::new("tok").shards(1, 2)))
    }

    fn frame(value: Value) -> GatewayPayload {
        serde_json::from_value(value).unwrap()
    }

    fn hello(ms: u64) -> GatewayPayload {
        frame(json!({"op": 10, "d": {"heartbeat_interval": ms}}))
    }

    fn ready(seq: u64, session_id: &str) -> GatewayPayload {
        frame(json!({
            "op": 0, "s": seq, "t": "READY",
            "d": {"v": 6, "user": {"id": "1"}, "session_id": session_id, "guilds": []}
        }))
    }

    fn sent(actions: &[Action]) -> Vec<Option<OpCode>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(p) => Some(p.opcode()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_identify_flow() {
        let mut m = machine();
        m.on_connecting();
        m.on_connected();
        assert_eq!(m.state(), SessionState::AwaitingHello);

        let actions = m.on_payload(hello(41250));
        assert_eq!(
            actions[0],
            Action::StartHeartbeat(Duration::from_millis(41250))
        );
        assert_eq!(sent(&actions), vec![Some(OpCode::Identify)]);
        assert_eq!(m.state(), SessionState::Identifying);

        let actions = m.on_payload(ready(1, "abc"));
        assert_eq!(m.state(), SessionState::Connected);
        assert_eq!(m.session_id(), Some("abc"));
        assert!(matches!(actions[0], Action::StartHeartbeat(_)));
        assert!(matches!(&actions[1], Action::Dispatch(e) if e.name == EventName::Ready));
    }

    #[test]
    fn test_zero_heartbeat_interval_is_dropped() {
        let mut m = machine();
        m.on_connected();
        assert!(m.on_payload(hello(0)).is_empty());
        assert_eq!(m.state(), SessionState::AwaitingHello);
        assert_eq!(m.status().heartbeat_interval, None);
        assert_eq!(m.reconnect_delay(), Duration::from_secs(5));

        // A later valid HELLO still completes the handshake
        let actions = m.on_payload(hello(1000));
        assert_eq!(sent(&actions), vec![Some(OpCode::Identify)]);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let mut m = machine();
        m.on_payload(hello(1000));
        m.on_payload(ready(1, "abc"));
        for s in [2, 5, 3, 9, 4] {
            m.on_payload(frame(json!({"op": 0, "s": s, "t": "TYPING_START", "d": {}})));
        }
        assert_eq!(m.seq(), Some(9));
        assert_eq!(m.heartbeat_payload(), build_heartbeat(Some(9)));
    }

    #[test]
    fn test_resume_after_recoverable_close() {
        let mut m = machine();
        m.on_payload(hello(1000));
        m.on_payload(ready(7, "abc"));

        let action = m.on_close(Some(4000), "unknown error");
        assert_eq!(
            action,
            Action::Reconnect {
                delay: Duration::from_millis(1000),
                resume: true
            }
        );

        let mut next = m.carry_over();
        next.on_connected();
        let actions = next.on_payload(hello(1000));
        assert_eq!(next.state(), SessionState::Resuming);
        let resume = actions
            .iter()
            .find_map(|a| match a {
                Action::Send(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(resume, build_resume("tok", "abc", Some(7)));

        next.on_payload(frame(json!({"op": 0, "s": 8, "t": "RESUMED", "d": {}})));
        assert_eq!(next.state(), SessionState::Connected);
        assert_eq!(next.seq(), Some(8));
    }

    #[test]
    fn test_fatal_close() {
        let mut m = machine();
        m.on_payload(hello(1000));
        assert_eq!(
            m.on_close(Some(4010), ""),
            Action::Fatal {
                code: 4010,
                reason: "invalid shard".to_string()
            }
        );
        assert_eq!(m.last_close(), Some(4010));
    }

    #[test]
    fn test_close_before_hello_uses_fallback_delay() {
        let mut m = machine();
        m.on_connected();
        assert_eq!(
            m.on_close(None, "stream ended"),
            Action::Reconnect {
                delay: Duration::from_secs(5),
                resume: false
            }
        );
    }

    #[test]
    fn test_invalid_session_reidentifies() {
        let mut m = machine();
        m.on_payload(hello(1000));
        m.on_payload(ready(3, "abc"));

        let actions = m.on_payload(frame(json!({"op": 9, "d": false})));
        assert_eq!(sent(&actions), vec![Some(OpCode::Identify)]);
        assert_eq!(m.state(), SessionState::Reidentifying);
        assert_eq!(m.session_id(), None);
        assert_eq!(m.seq(), None);
    }

    #[test]
    fn test_reconnect_opcode_resumes_immediately() {
        let mut m = machine();
        m.on_payload(hello(1000));
        m.on_payload(ready(3, "abc"));

        let actions = m.on_payload(frame(json!({"op": 7, "d": null})));
        assert_eq!(
            actions,
            vec![
                Action::StopHeartbeat,
                Action::Reconnect {
                    delay: Duration::ZERO,
                    resume: true
                }
            ]
        );
    }

    #[test]
    fn test_unknown_and_informational_opcodes() {
        let mut m = machine();
        assert!(m.on_payload(frame(json!({"op": 5, "d": null}))).is_empty());
        assert!(m.on_payload(frame(json!({"op": 1, "d": null}))).is_empty());
        assert!(m.on_payload(frame(json!({"op": 11}))).is_empty());
        assert!(m.status().last_ack.is_some());
    }
}
