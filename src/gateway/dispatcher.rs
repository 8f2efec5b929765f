//! Dispatch event fan-out.
//!
//! Each DISPATCH frame first runs its built-in cache handler inline, in
//! frame order, then the user callback (or the default callback) is queued
//! to a worker task. The worker runs callbacks one at a time in arrival
//! order, each inside its own task so a panic is reported instead of
//! killing the queue.

use crate::core::cache::{Cache, SharedCache};
use crate::core::errors::ClientError;
use crate::core::kernel::rest::ReqwestRest;
use crate::core::types::{Channel, Guild, Member, Presence, Role, UnavailableGuild, User, VoiceState};
use crate::gateway::events::EventName;
use crate::gateway::protocol::ReadyPayload;
use crate::gateway::session::GatewayHandle;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A decoded DISPATCH frame
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub name: EventName,
    pub seq: Option<u64>,
    pub data: Value,
}

/// Handles given to every callback invocation
#[derive(Debug, Clone)]
pub struct EventContext {
    pub shard: [u32; 2],
    pub cache: SharedCache,
    pub rest: ReqwestRest,
    pub gateway: GatewayHandle,
}

pub type EventCallback =
    Arc<dyn Fn(EventContext, DispatchEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an `EventCallback`
pub fn callback<F, Fut>(f: F) -> EventCallback
where
    F: Fn(EventContext, DispatchEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, event| Box::pin(f(ctx, event)))
}

/// Event name to callback mapping plus the fallback callback
#[derive(Default)]
pub struct CallbackTable {
    callbacks: DashMap<EventName, EventCallback>,
    default: RwLock<Option<EventCallback>>,
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("registered", &self.callbacks.len())
            .field("has_default", &self.has_default())
            .finish()
    }
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback by wire name. Unknown names fail and leave the
    /// table untouched.
    pub fn set_callback(&self, name: &str, callback: EventCallback) -> Result<(), ClientError> {
        let name: EventName = name.parse()?;
        self.callbacks.insert(name, callback);
        Ok(())
    }

    /// Remove a registered callback; the default callback applies again
    pub fn clear_callback(&self, name: &str) -> Result<(), ClientError> {
        let name: EventName = name.parse()?;
        self.callbacks.remove(&name);
        Ok(())
    }

    pub fn set_default(&self, callback: EventCallback) {
        *self.default.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn has_default(&self) -> bool {
        self.default
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_registered(&self, name: &EventName) -> bool {
        self.callbacks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// The callback that should run for `name`, if any
    pub fn resolve(&self, name: &EventName) -> Option<EventCallback> {
        if let Some(cb) = self.callbacks.get(name) {
            return Some(Arc::clone(cb.value()));
        }
        self.default
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct Job {
    callback: EventCallback,
    context: EventContext,
    event: DispatchEvent,
}

/// Applies built-in state handling and queues user callbacks
pub struct Dispatcher {
    cache: SharedCache,
    callbacks: Arc<CallbackTable>,
    context: EventContext,
    queue: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Start the callback worker. Must be called inside a tokio runtime.
    pub fn new(callbacks: Arc<CallbackTable>, context: EventContext) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(rx));
        Self {
            cache: context.cache.clone(),
            callbacks,
            context,
            queue,
            worker,
        }
    }

    /// Handle one DISPATCH frame
    pub fn dispatch(&self, event: DispatchEvent) {
        if !event.name.is_known() {
            warn!(event = %event.name, seq = ?event.seq, "Unknown dispatch event skipped");
            return;
        }

        if let Err(e) = apply_builtin(&mut self.cache.write(), &event) {
            warn!(event = %event.name, error = %e, "Built-in handler could not apply event");
        }

        let Some(callback) = self.callbacks.resolve(&event.name) else {
            debug!(event = %event.name, "No callback registered");
            return;
        };
        let job = Job {
            callback,
            context: self.context.clone(),
            event,
        };
        if self.queue.send(job).is_err() {
            warn!("Callback worker is gone, event dropped");
        }
    }

    /// Stop accepting events; queued callbacks still run
    pub fn close(self) -> JoinHandle<()> {
        drop(self.queue);
        self.worker
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let name = job.event.name.clone();
        let seq = job.event.seq;
        if let Err(e) = tokio::spawn((job.callback)(job.context, job.event)).await {
            if e.is_panic() {
                error!(event = %name, ?seq, "Event callback panicked");
            }
        }
    }
    debug!("Callback worker finished");
}

#[derive(Deserialize)]
struct GuildMemberEvent {
    guild_id: String,
    #[serde(flatten)]
    member: Member,
}

#[derive(Deserialize)]
struct GuildMemberRemove {
    guild_id: String,
    user: User,
}

#[derive(Deserialize)]
struct GuildMembersChunk {
    guild_id: String,
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Deserialize)]
struct GuildRoleEvent {
    guild_id: String,
    role: Role,
}

#[derive(Deserialize)]
struct GuildRoleDelete {
    guild_id: String,
    role_id: String,
}

#[derive(Deserialize)]
struct GuildEmojisUpdate {
    guild_id: String,
    #[serde(default)]
    emojis: Vec<Value>,
}

#[derive(Deserialize)]
struct ChannelPinsUpdate {
    channel_id: String,
    #[serde(default)]
    last_pin_timestamp: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
    channel_id: String,
}

fn decode<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, ClientError> {
    Ok(T::deserialize(data)?)
}

/// Built-in state handling: exactly one handler per known event name.
/// Events with no cached state are accepted without change.
pub fn apply_builtin(cache: &mut Cache, event: &DispatchEvent) -> Result<(), ClientError> {
    let data = &event.data;
    match &event.name {
        EventName::Ready => {
            let ready: ReadyPayload = decode(data)?;
            cache.on_ready(ready.user, ready.session_id, ready.private_channels, ready.guilds);
        }
        EventName::ChannelCreate | EventName::ChannelUpdate => {
            cache.on_channel_upsert(decode::<Channel>(data)?);
        }
        EventName::ChannelDelete => cache.on_channel_delete(&decode::<Channel>(data)?),
        EventName::ChannelPinsUpdate => {
            let pins: ChannelPinsUpdate = decode(data)?;
            cache.on_channel_pins_update(&pins.channel_id, pins.last_pin_timestamp);
        }
        EventName::GuildCreate => cache.on_guild_create(decode::<Guild>(data)?),
        EventName::GuildUpdate => cache.on_guild_update(decode::<Guild>(data)?),
        EventName::GuildDelete => cache.on_guild_delete(&decode::<UnavailableGuild>(data)?),
        EventName::GuildEmojisUpdate => {
            let update: GuildEmojisUpdate = decode(data)?;
            cache.on_guild_emojis_update(&update.guild_id, update.emojis);
        }
        EventName::GuildMemberAdd | EventName::GuildMemberUpdate => {
            let update: GuildMemberEvent = decode(data)?;
            cache.on_member_upsert(&update.guild_id, update.member);
        }
        EventName::GuildMemberRemove => {
            let removed: GuildMemberRemove = decode(data)?;
            cache.on_member_remove(&removed.guild_id, &removed.user.id);
        }
        EventName::GuildMembersChunk => {
            let chunk: GuildMembersChunk = decode(data)?;
            cache.on_members_chunk(&chunk.guild_id, chunk.members);
        }
        EventName::GuildRoleCreate | EventName::GuildRoleUpdate => {
            let update: GuildRoleEvent = decode(data)?;
            cache.on_role_upsert(&update.guild_id, update.role);
        }
        EventName::GuildRoleDelete => {
            let deleted: GuildRoleDelete = decode(data)?;
            cache.on_role_delete(&deleted.guild_id, &deleted.role_id);
        }
        EventName::MessageCreate => {
            let message: MessageRef = decode(data)?;
            cache.on_message_create(&message.channel_id, &message.id);
        }
        EventName::PresenceUpdate => cache.on_presence_update(decode::<Presence>(data)?),
        EventName::UserUpdate => cache.on_user_update(decode::<User>(data)?),
        EventName::VoiceStateUpdate => cache.on_voice_state_update(decode::<VoiceState>(data)?),
        EventName::Resumed
        | EventName::GuildBanAdd
        | EventName::GuildBanRemove
        | EventName::GuildIntegrationsUpdate
        | EventName::MessageUpdate
        | EventName::MessageDelete
        | EventName::MessageDeleteBulk
        | EventName::MessageReactionAdd
        | EventName::MessageReactionRemove
        | EventName::MessageReactionRemoveAll
        | EventName::TypingStart
        | EventName::VoiceServerUpdate
        | EventName::WebhooksUpdate => {}
        EventName::Unknown(name) => return Err(ClientError::UnknownEvent(name.clone())),
    }
    Ok(())
}
