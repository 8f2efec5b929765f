//! Gateway wire protocol: opcodes, close codes and payload shapes.

use crate::core::config::{clamp_large_threshold, validate_shard, ClientConfig, ClientProperties};
use crate::core::types::{Channel, UnavailableGuild, User};
use secrecy::ExposeSecret;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// Gateway operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Named application event (server only)
    Dispatch = 0,
    /// Keep-alive carrying the last sequence number (both directions)
    Heartbeat = 1,
    /// Start a new session (client only)
    Identify = 2,
    /// Update the client's presence (client only)
    StatusUpdate = 3,
    /// Join, move or leave a voice channel (client only)
    VoiceStateUpdate = 4,
    /// Replay missed events on an existing session (client only)
    Resume = 6,
    /// Server asks the client to reconnect and resume (server only)
    Reconnect = 7,
    /// Ask for offline members of a large guild (client only)
    RequestGuildMembers = 8,
    /// Session can no longer be resumed (server only)
    InvalidSession = 9,
    /// First frame on a connection, carries the heartbeat interval (server only)
    Hello = 10,
    /// Heartbeat acknowledged (server only)
    HeartbeatAck = 11,
}

impl OpCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::StatusUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Opcodes the client never expects to receive
    #[must_use]
    pub const fn is_outbound_only(self) -> bool {
        matches!(
            self,
            Self::Identify
                | Self::StatusUpdate
                | Self::VoiceStateUpdate
                | Self::Resume
                | Self::RequestGuildMembers
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "DISPATCH",
            Self::Heartbeat => "HEARTBEAT",
            Self::Identify => "IDENTIFY",
            Self::StatusUpdate => "STATUS_UPDATE",
            Self::VoiceStateUpdate => "VOICE_STATE_UPDATE",
            Self::Resume => "RESUME",
            Self::Reconnect => "RECONNECT",
            Self::RequestGuildMembers => "REQUEST_GUILD_MEMBERS",
            Self::InvalidSession => "INVALID_SESSION",
            Self::Hello => "HELLO",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
        }
    }
}

impl Serialize for OpCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid op code: {}", value)))
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// Gateway close codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimeout = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

impl CloseCode {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimeout),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Misconfiguration the client cannot recover from by reconnecting
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::UnknownError => "unknown error",
            Self::UnknownOpcode => "unknown opcode",
            Self::DecodeError => "decode error",
            Self::NotAuthenticated => "not authenticated",
            Self::AuthenticationFailed => "authentication failed",
            Self::AlreadyAuthenticated => "already authenticated",
            Self::InvalidSequence => "invalid seq",
            Self::RateLimited => "rate limited",
            Self::SessionTimeout => "session timeout",
            Self::InvalidShard => "invalid shard",
            Self::ShardingRequired => "sharding required",
            Self::InvalidApiVersion => "invalid API version",
            Self::InvalidIntents => "invalid intents",
            Self::DisallowedIntents => "disallowed intents",
        }
    }
}

/// Fatal-close check on a raw code; codes outside the table are recoverable
#[must_use]
pub fn is_fatal_close(code: u16) -> bool {
    CloseCode::from_u16(code).is_some_and(CloseCode::is_fatal)
}

/// Human-readable reason for a raw close code
#[must_use]
pub fn close_reason(code: u16) -> &'static str {
    CloseCode::from_u16(code).map_or("unrecognized close code", CloseCode::reason)
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason(), self.as_u16())
    }
}

/// Frame envelope, both directions.
///
/// `op` is kept raw so that unknown opcodes can be reported for the single
/// frame rather than failing JSON decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op.as_u8(),
            d: Some(d),
            s: None,
            t: None,
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    /// Decode the `d` field into a typed payload
    pub fn data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.d.clone().unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: ClientProperties,
    pub compress: bool,
    pub large_threshold: u16,
    pub shard: [u32; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intents: Option<u64>,
}

impl IdentifyPayload {
    /// Shard pair and threshold are validated again; the config fields
    /// are public and may have been set without the builders.
    pub fn from_config(config: &ClientConfig) -> Self {
        let (shard_index, shard_count) = validate_shard(config.shard_index, config.shard_count);
        Self {
            token: config.token.expose_secret().clone(),
            properties: config.properties.clone(),
            compress: config.compress,
            large_threshold: clamp_large_threshold(config.large_threshold),
            shard: [shard_index, shard_count],
            intents: config.intents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HelloPayload {
    /// Milliseconds
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    #[serde(default)]
    pub v: u8,
    pub user: User,
    #[serde(default)]
    pub private_channels: Vec<Channel>,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    pub session_id: String,
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

pub fn build_identify(config: &ClientConfig) -> GatewayPayload {
    GatewayPayload::new(OpCode::Identify, json!(IdentifyPayload::from_config(config)))
}

pub fn build_resume(token: &str, session_id: &str, seq: Option<u64>) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::Resume,
        json!(ResumePayload {
            token: token.to_string(),
            session_id: session_id.to_string(),
            seq,
        }),
    )
}

pub fn build_heartbeat(seq: Option<u64>) -> GatewayPayload {
    GatewayPayload::new(OpCode::Heartbeat, json!(seq))
}

/// Op 3. `since` is the idle-since epoch in milliseconds
pub fn build_status_update(
    status: &str,
    since: Option<u64>,
    game: Option<Value>,
    afk: bool,
) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::StatusUpdate,
        json!({
            "since": since,
            "game": game,
            "status": status,
            "afk": afk,
        }),
    )
}

/// Op 4. A `None` channel leaves voice in the guild
pub fn build_voice_state_update(
    guild_id: &str,
    channel_id: Option<&str>,
    self_mute: bool,
    self_deaf: bool,
) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::VoiceStateUpdate,
        json!({
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }),
    )
}

/// Op 8. An empty `query` with `limit = 0` requests all members
pub fn build_request_guild_members(guild_id: &str, query: &str, limit: u32) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::RequestGuildMembers,
        json!({
            "guild_id": guild_id,
            "query": query,
            "limit": limit,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table() {
        assert_eq!(OpCode::from_u8(6), Some(OpCode::Resume));
        assert_eq!(OpCode::from_u8(5), None);
        assert_eq!(OpCode::from_u8(12), None);
        assert!(OpCode::Identify.is_outbound_only());
        assert!(!OpCode::Hello.is_outbound_only());
        assert_eq!(OpCode::HeartbeatAck.to_string(), "HEARTBEAT_ACK (11)");
    }

    #[test]
    fn test_fatal_close_codes() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert!(is_fatal_close(code), "{} should be fatal", code);
        }
        for code in [1000, 1001, 1006, 4000, 4007, 4009, 4999] {
            assert!(!is_fatal_close(code), "{} should be recoverable", code);
        }
        assert_eq!(close_reason(4010), "invalid shard");
    }

    #[test]
    fn test_unknown_opcode_still_decodes() {
        let payload: GatewayPayload =
            serde_json::from_str(r#"{"op":42,"d":null,"s":null,"t":null}"#).unwrap();
        assert_eq!(payload.op, 42);
        assert!(payload.opcode().is_none());
    }

    #[test]
    fn test_identify_round_trip() {
        let config = ClientConfig::new("secret-token")
            .shards(2, 4)
            .compress(true);
        let frame = serde_json::to_string(&build_identify(&config)).unwrap();

        let decoded: GatewayPayload = serde_json::from_str(&frame).unwrap();
        assert_eq!(decoded.opcode(), Some(OpCode::Identify));
        let identify: IdentifyPayload = decoded.data().unwrap();
        assert_eq!(identify.shard, [2, 4]);
        assert_eq!(identify.token, "secret-token");
        assert!(identify.compress);
        assert_eq!(identify, IdentifyPayload::from_config(&config));
    }

    #[test]
    fn test_identify_validates_fields_set_directly() {
        let mut config = ClientConfig::new("tok");
        config.shard_index = 5;
        config.shard_count = 2;
        config.large_threshold = 1000;

        let identify = IdentifyPayload::from_config(&config);
        assert_eq!(identify.shard, [0, 1]);
        assert_eq!(identify.large_threshold, 250);

        config.large_threshold = 10;
        assert_eq!(IdentifyPayload::from_config(&config).large_threshold, 50);
    }

    #[test]
    fn test_heartbeat_carries_null_before_first_dispatch() {
        let frame = serde_json::to_value(build_heartbeat(None)).unwrap();
        assert_eq!(frame, json!({"op": 1, "d": null}));
        let frame = serde_json::to_value(build_heartbeat(Some(7))).unwrap();
        assert_eq!(frame, json!({"op": 1, "d": 7}));
    }

    #[test]
    fn test_resume_shape() {
        let frame = serde_json::to_value(build_resume("t", "abc", Some(42))).unwrap();
        assert_eq!(
            frame,
            json!({"op": 6, "d": {"token": "t", "session_id": "abc", "seq": 42}})
        );
    }
}
