//! In-memory view of the state delivered over the gateway.
//!
//! Every update function below is driven by exactly one dispatch event kind
//! and documents the fields it is allowed to touch.

use crate::core::types::{
    Channel, Guild, Member, Presence, Role, Snowflake, UnavailableGuild, User, VoiceState,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuildState {
    pub id: Snowflake,
    pub name: String,
    pub owner_id: Option<Snowflake>,
    pub unavailable: bool,
    pub member_count: Option<u64>,
    pub channels: HashMap<Snowflake, Channel>,
    pub members: HashMap<Snowflake, Member>,
    pub roles: HashMap<Snowflake, Role>,
    pub presences: HashMap<Snowflake, Presence>,
    pub voice_states: HashMap<Snowflake, VoiceState>,
    pub emojis: Vec<Value>,
}

impl GuildState {
    fn stub(id: &str) -> Self {
        Self {
            id: id.to_string(),
            unavailable: true,
            ..Self::default()
        }
    }

    fn from_wire(guild: Guild) -> Self {
        let mut state = Self {
            id: guild.id.clone(),
            ..Self::default()
        };
        state.apply_wire(guild);
        state
    }

    /// Replace scalar fields and any collection the wire object carries.
    /// GUILD_UPDATE omits channels/members/presences; those stay untouched.
    fn apply_wire(&mut self, guild: Guild) {
        self.name = guild.name;
        self.owner_id = guild.owner_id;
        self.unavailable = guild.unavailable;
        if guild.member_count.is_some() {
            self.member_count = guild.member_count;
        }
        if !guild.roles.is_empty() {
            self.roles = guild.roles.into_iter().map(|r| (r.id.clone(), r)).collect();
        }
        if !guild.emojis.is_empty() {
            self.emojis = guild.emojis;
        }
        if !guild.channels.is_empty() {
            let guild_id = self.id.clone();
            self.channels = guild
                .channels
                .into_iter()
                .map(|mut c| {
                    c.guild_id.get_or_insert_with(|| guild_id.clone());
                    (c.id.clone(), c)
                })
                .collect();
        }
        for member in guild.members {
            if let Some(id) = member.user_id().map(str::to_string) {
                self.members.insert(id, member);
            }
        }
        for presence in guild.presences {
            self.presences.insert(presence.user.id.clone(), presence);
        }
        for voice in guild.voice_states {
            self.voice_states.insert(voice.user_id.clone(), voice);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cache {
    /// The connected account, set by READY and USER_UPDATE
    pub user: Option<User>,
    pub session_id: Option<String>,
    pub guilds: HashMap<Snowflake, GuildState>,
    /// Direct-message channels indexed by channel id
    pub dm_channels: HashMap<Snowflake, Channel>,
    /// Users seen in members, presences and DM recipients
    pub users: HashMap<Snowflake, User>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guild(&self, guild_id: &str) -> Option<&GuildState> {
        self.guilds.get(guild_id)
    }

    /// Look up a channel in the DM index or any guild
    pub fn channel(&self, channel_id: &str) -> Option<&Channel> {
        self.dm_channels
            .get(channel_id)
            .or_else(|| self.guilds.values().find_map(|g| g.channels.get(channel_id)))
    }

    /// The DM channel whose single recipient is `user_id`
    pub fn dm_channel_for(&self, user_id: &str) -> Option<&Channel> {
        self.dm_channels
            .values()
            .find(|c| c.recipients.iter().any(|u| u.id == user_id))
    }

    fn remember_user(&mut self, user: &User) {
        self.users.insert(user.id.clone(), user.clone());
    }

    /// READY: sets `user`, `session_id`, `dm_channels` and registers a stub
    /// for every guild the account belongs to.
    pub fn on_ready(
        &mut self,
        user: User,
        session_id: String,
        private_channels: Vec<Channel>,
        guilds: Vec<UnavailableGuild>,
    ) {
        self.remember_user(&user);
        self.user = Some(user);
        self.session_id = Some(session_id);
        self.dm_channels.clear();
        for channel in private_channels {
            for recipient in &channel.recipients {
                self.users.insert(recipient.id.clone(), recipient.clone());
            }
            self.dm_channels.insert(channel.id.clone(), channel);
        }
        for stub in guilds {
            self.guilds
                .entry(stub.id.clone())
                .or_insert_with(|| GuildState::stub(&stub.id));
        }
    }

    /// USER_UPDATE: replaces `user`.
    pub fn on_user_update(&mut self, user: User) {
        self.remember_user(&user);
        self.user = Some(user);
    }

    /// CHANNEL_CREATE / CHANNEL_UPDATE: inserts or replaces one channel in
    /// its guild's `channels`, or in `dm_channels` when it has no guild.
    pub fn on_channel_upsert(&mut self, channel: Channel) {
        match channel.guild_id.clone() {
            Some(guild_id) => {
                self.guilds
                    .entry(guild_id.clone())
                    .or_insert_with(|| GuildState::stub(&guild_id))
                    .channels
                    .insert(channel.id.clone(), channel);
            }
            None => {
                for recipient in &channel.recipients {
                    self.users.insert(recipient.id.clone(), recipient.clone());
                }
                self.dm_channels.insert(channel.id.clone(), channel);
            }
        }
    }

    /// CHANNEL_DELETE: removes one channel.
    pub fn on_channel_delete(&mut self, channel: &Channel) {
        match &channel.guild_id {
            Some(guild_id) => {
                if let Some(guild) = self.guilds.get_mut(guild_id) {
                    guild.channels.remove(&channel.id);
                }
            }
            None => {
                self.dm_channels.remove(&channel.id);
            }
        }
    }

    /// CHANNEL_PINS_UPDATE: sets `last_pin_timestamp` on one channel.
    pub fn on_channel_pins_update(&mut self, channel_id: &str, timestamp: Option<String>) {
        let channel = self.dm_channels.get_mut(channel_id).or_else(|| {
            self.guilds
                .values_mut()
                .find_map(|g| g.channels.get_mut(channel_id))
        });
        if let Some(channel) = channel {
            channel.last_pin_timestamp = timestamp;
        }
    }

    /// MESSAGE_CREATE: sets `last_message_id` on the target channel.
    pub fn on_message_create(&mut self, channel_id: &str, message_id: &str) {
        let channel = self.dm_channels.get_mut(channel_id).or_else(|| {
            self.guilds
                .values_mut()
                .find_map(|g| g.channels.get_mut(channel_id))
        });
        if let Some(channel) = channel {
            channel.last_message_id = Some(message_id.to_string());
        }
    }

    /// GUILD_CREATE: replaces the guild entry wholesale.
    pub fn on_guild_create(&mut self, guild: Guild) {
        for member in &guild.members {
            if let Some(user) = &member.user {
                self.users.insert(user.id.clone(), user.clone());
            }
        }
        self.guilds
            .insert(guild.id.clone(), GuildState::from_wire(guild));
    }

    /// GUILD_UPDATE: updates scalar fields, roles and emojis of an existing
    /// guild; channels, members and presences are left alone.
    pub fn on_guild_update(&mut self, guild: Guild) {
        match self.guilds.get_mut(&guild.id) {
            Some(state) => state.apply_wire(guild),
            None => self.on_guild_create(guild),
        }
    }

    /// GUILD_DELETE: an unavailable guild (outage) is kept as a stub,
    /// otherwise the guild is removed.
    pub fn on_guild_delete(&mut self, stub: &UnavailableGuild) {
        if stub.unavailable {
            if let Some(guild) = self.guilds.get_mut(&stub.id) {
                guild.unavailable = true;
            }
        } else {
            self.guilds.remove(&stub.id);
        }
    }

    /// GUILD_EMOJIS_UPDATE: replaces `emojis`.
    pub fn on_guild_emojis_update(&mut self, guild_id: &str, emojis: Vec<Value>) {
        if let Some(guild) = self.guilds.get_mut(guild_id) {
            guild.emojis = emojis;
        }
    }

    /// GUILD_MEMBER_ADD / GUILD_MEMBER_UPDATE: inserts or merges one member.
    /// Updates only carry user, nick and roles.
    pub fn on_member_upsert(&mut self, guild_id: &str, member: Member) {
        let Some(user_id) = member.user_id().map(str::to_string) else {
            debug!(guild_id, "Member without user ignored");
            return;
        };
        if let Some(user) = &member.user {
            self.users.insert(user_id.clone(), user.clone());
        }
        let guild = self
            .guilds
            .entry(guild_id.to_string())
            .or_insert_with(|| GuildState::stub(guild_id));
        match guild.members.get_mut(&user_id) {
            Some(existing) => {
                existing.user = member.user;
                existing.nick = member.nick;
                existing.roles = member.roles;
                existing.extra.extend(member.extra);
            }
            None => {
                guild.members.insert(user_id, member);
                if let Some(count) = guild.member_count.as_mut() {
                    *count += 1;
                }
            }
        }
    }

    /// GUILD_MEMBER_REMOVE: removes one member.
    pub fn on_member_remove(&mut self, guild_id: &str, user_id: &str) {
        if let Some(guild) = self.guilds.get_mut(guild_id) {
            if guild.members.remove(user_id).is_some() {
                if let Some(count) = guild.member_count.as_mut() {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// GUILD_MEMBERS_CHUNK: inserts a batch of members.
    pub fn on_members_chunk(&mut self, guild_id: &str, members: Vec<Member>) {
        let guild = self
            .guilds
            .entry(guild_id.to_string())
            .or_insert_with(|| GuildState::stub(guild_id));
        for member in members {
            if let Some(user) = &member.user {
                self.users.insert(user.id.clone(), user.clone());
                guild.members.insert(user.id.clone(), member);
            }
        }
    }

    /// GUILD_ROLE_CREATE / GUILD_ROLE_UPDATE: inserts or replaces one role.
    pub fn on_role_upsert(&mut self, guild_id: &str, role: Role) {
        if let Some(guild) = self.guilds.get_mut(guild_id) {
            guild.roles.insert(role.id.clone(), role);
        }
    }

    /// GUILD_ROLE_DELETE: removes one role and strips it from members.
    pub fn on_role_delete(&mut self, guild_id: &str, role_id: &str) {
        if let Some(guild) = self.guilds.get_mut(guild_id) {
            guild.roles.remove(role_id);
            for member in guild.members.values_mut() {
                member.roles.retain(|r| r != role_id);
            }
        }
    }

    /// PRESENCE_UPDATE: replaces the user's presence in the guild and merges
    /// any user fields it carries into `users`.
    pub fn on_presence_update(&mut self, presence: Presence) {
        if !presence.user.username.is_empty() {
            self.remember_user(&presence.user);
        }
        if let Some(guild_id) = presence.guild_id.clone() {
            if let Some(guild) = self.guilds.get_mut(&guild_id) {
                guild
                    .presences
                    .insert(presence.user.id.clone(), presence);
            }
        }
    }

    /// VOICE_STATE_UPDATE: records or clears (channel left) one voice state.
    pub fn on_voice_state_update(&mut self, state: VoiceState) {
        let Some(guild_id) = state.guild_id.clone() else {
            return;
        };
        if let Some(guild) = self.guilds.get_mut(&guild_id) {
            if state.channel_id.is_some() {
                guild.voice_states.insert(state.user_id.clone(), state);
            } else {
                guild.voice_states.remove(&state.user_id);
            }
        }
    }
}

/// Cache shared between the session loop (writer) and callbacks (readers)
#[derive(Debug, Clone, Default)]
pub struct SharedCache(Arc<RwLock<Cache>>);

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Cache> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Cache> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guild(value: Value) -> Guild {
        serde_json::from_value(value).unwrap()
    }

    fn seeded() -> Cache {
        let mut cache = Cache::new();
        cache.on_guild_create(guild(json!({
            "id": "g1",
            "name": "Guild",
            "member_count": 1,
            "roles": [{"id": "r1", "name": "mod"}],
            "channels": [{"id": "c1", "type": 0, "name": "general"}],
            "members": [{"user": {"id": "u1", "username": "alice"}, "roles": ["r1"]}],
        })));
        cache
    }

    #[test]
    fn test_ready_populates_self_and_dm_index() {
        let mut cache = Cache::new();
        let user: User = serde_json::from_value(json!({"id": "me", "username": "bot"})).unwrap();
        let dm: Channel = serde_json::from_value(json!({
            "id": "dm1", "type": 1, "recipients": [{"id": "u9", "username": "bob"}]
        }))
        .unwrap();
        cache.on_ready(
            user,
            "sess".into(),
            vec![dm],
            vec![UnavailableGuild { id: "g1".into(), unavailable: true }],
        );

        assert_eq!(cache.user.as_ref().unwrap().id, "me");
        assert_eq!(cache.session_id.as_deref(), Some("sess"));
        assert_eq!(cache.dm_channel_for("u9").unwrap().id, "dm1");
        assert!(cache.guild("g1").unwrap().unavailable);
        assert!(cache.users.contains_key("u9"));
    }

    #[test]
    fn test_guild_create_indexes_collections() {
        let cache = seeded();
        let g = cache.guild("g1").unwrap();
        assert_eq!(g.channels["c1"].guild_id.as_deref(), Some("g1"));
        assert!(g.members.contains_key("u1"));
        assert!(g.roles.contains_key("r1"));
        assert_eq!(cache.channel("c1").unwrap().name.as_deref(), Some("general"));
    }

    #[test]
    fn test_guild_update_keeps_channels() {
        let mut cache = seeded();
        cache.on_guild_update(guild(json!({"id": "g1", "name": "Renamed"})));
        let g = cache.guild("g1").unwrap();
        assert_eq!(g.name, "Renamed");
        assert!(g.channels.contains_key("c1"));
        assert!(g.roles.contains_key("r1"));
    }

    #[test]
    fn test_guild_delete_outage_keeps_stub() {
        let mut cache = seeded();
        cache.on_guild_delete(&UnavailableGuild { id: "g1".into(), unavailable: true });
        assert!(cache.guild("g1").unwrap().unavailable);

        cache.on_guild_delete(&UnavailableGuild { id: "g1".into(), unavailable: false });
        assert!(cache.guild("g1").is_none());
    }

    #[test]
    fn test_member_lifecycle() {
        let mut cache = seeded();
        let member: Member =
            serde_json::from_value(json!({"user": {"id": "u2", "username": "carol"}, "roles": []}))
                .unwrap();
        cache.on_member_upsert("g1", member);
        assert_eq!(cache.guild("g1").unwrap().member_count, Some(2));

        let update: Member = serde_json::from_value(
            json!({"user": {"id": "u2", "username": "carol"}, "nick": "c", "roles": ["r1"]}),
        )
        .unwrap();
        cache.on_member_upsert("g1", update);
        let g = cache.guild("g1").unwrap();
        assert_eq!(g.members["u2"].nick.as_deref(), Some("c"));
        assert_eq!(g.member_count, Some(2));

        cache.on_member_remove("g1", "u2");
        assert_eq!(cache.guild("g1").unwrap().member_count, Some(1));
    }

    #[test]
    fn test_role_delete_strips_members() {
        let mut cache = seeded();
        cache.on_role_delete("g1", "r1");
        let g = cache.guild("g1").unwrap();
        assert!(g.roles.is_empty());
        assert!(g.members["u1"].roles.is_empty());
    }

    #[test]
    fn test_channel_delete_and_message_tracking() {
        let mut cache = seeded();
        cache.on_message_create("c1", "m42");
        assert_eq!(cache.channel("c1").unwrap().last_message_id.as_deref(), Some("m42"));

        let channel = cache.channel("c1").unwrap().clone();
        cache.on_channel_delete(&channel);
        assert!(cache.channel("c1").is_none());
    }

    #[test]
    fn test_voice_state_leave_clears_entry() {
        let mut cache = seeded();
        let join: VoiceState = serde_json::from_value(
            json!({"guild_id": "g1", "channel_id": "v1", "user_id": "u1", "session_id": "x"}),
        )
        .unwrap();
        cache.on_voice_state_update(join);
        assert!(cache.guild("g1").unwrap().voice_states.contains_key("u1"));

        let leave: VoiceState = serde_json::from_value(
            json!({"guild_id": "g1", "channel_id": null, "user_id": "u1", "session_id": "x"}),
        )
        .unwrap();
        cache.on_voice_state_update(leave);
        assert!(cache.guild("g1").unwrap().voice_states.is_empty());
    }
}
