//! Dispatch event names.
//!
//! The set is closed: callbacks can only be registered for names listed
//! here, and anything else the server sends decodes to `Unknown`.

use std::str::FromStr;

macro_rules! event_names {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum EventName {
            $($variant,)+
            /// A name outside the known set, kept verbatim
            Unknown(String),
        }

        impl EventName {
            /// Every known event name
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $name,)+
                    Self::Unknown(name) => name,
                }
            }

            /// Map a wire name; unrecognized names become `Unknown`
            pub fn parse(name: &str) -> Self {
                match name {
                    $($name => Self::$variant,)+
                    other => Self::Unknown(other.to_string()),
                }
            }
        }
    };
}

event_names! {
    Ready => "READY",
    Resumed => "RESUMED",
    ChannelCreate => "CHANNEL_CREATE",
    ChannelUpdate => "CHANNEL_UPDATE",
    ChannelDelete => "CHANNEL_DELETE",
    ChannelPinsUpdate => "CHANNEL_PINS_UPDATE",
    GuildCreate => "GUILD_CREATE",
    GuildUpdate => "GUILD_UPDATE",
    GuildDelete => "GUILD_DELETE",
    GuildBanAdd => "GUILD_BAN_ADD",
    GuildBanRemove => "GUILD_BAN_REMOVE",
    GuildEmojisUpdate => "GUILD_EMOJIS_UPDATE",
    GuildIntegrationsUpdate => "GUILD_INTEGRATIONS_UPDATE",
    GuildMemberAdd => "GUILD_MEMBER_ADD",
    GuildMemberRemove => "GUILD_MEMBER_REMOVE",
    GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
    GuildMembersChunk => "GUILD_MEMBERS_CHUNK",
    GuildRoleCreate => "GUILD_ROLE_CREATE",
    GuildRoleUpdate => "GUILD_ROLE_UPDATE",
    GuildRoleDelete => "GUILD_ROLE_DELETE",
    MessageCreate => "MESSAGE_CREATE",
    MessageUpdate => "MESSAGE_UPDATE",
    MessageDelete => "MESSAGE_DELETE",
    MessageDeleteBulk => "MESSAGE_DELETE_BULK",
    MessageReactionAdd => "MESSAGE_REACTION_ADD",
    MessageReactionRemove => "MESSAGE_REACTION_REMOVE",
    MessageReactionRemoveAll => "MESSAGE_REACTION_REMOVE_ALL",
    PresenceUpdate => "PRESENCE_UPDATE",
    TypingStart => "TYPING_START",
    UserUpdate => "USER_UPDATE",
    VoiceStateUpdate => "VOICE_STATE_UPDATE",
    VoiceServerUpdate => "VOICE_SERVER_UPDATE",
    WebhooksUpdate => "WEBHOOKS_UPDATE",
}

impl EventName {
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl FromStr for EventName {
    type Err = crate::core::errors::ClientError;

    /// Strict parse used for callback registration
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse(s) {
            Self::Unknown(name) => Err(crate::core::errors::ClientError::UnknownEvent(name)),
            known => Ok(known),
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for name in EventName::ALL {
            assert_eq!(&EventName::parse(name.as_str()), name);
            assert!(name.is_known());
        }
        assert_eq!(EventName::ALL.len(), 33);
    }

    #[test]
    fn test_unknown_names() {
        let parsed = EventName::parse("INTERACTION_CREATE");
        assert_eq!(parsed, EventName::Unknown("INTERACTION_CREATE".to_string()));
        assert_eq!(parsed.as_str(), "INTERACTION_CREATE");
        assert!("message_create".parse::<EventName>().is_err());
        assert_eq!(
            "MESSAGE_CREATE".parse::<EventName>().unwrap(),
            EventName::MessageCreate
        );
    }
}
