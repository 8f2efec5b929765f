use crate::client::registry::{SessionId, SessionRegistry};
use crate::core::cache::SharedCache;
use crate::core::config::ClientConfig;
use crate::core::errors::ClientError;
use crate::core::kernel::rest::{ReqwestRest, RestClientBuilder, RestClientConfig};
use crate::core::kernel::signer::BotTokenSigner;
use crate::core::kernel::ws::{TungsteniteConnector, WsConnector};
use crate::gateway::dispatcher::{callback, CallbackTable, DispatchEvent, EventContext};
use crate::gateway::machine::SessionStatus;
use crate::gateway::protocol::{
    build_request_guild_members, build_status_update, build_voice_state_update, GatewayPayload,
};
use crate::gateway::session::{GatewayHandle, GatewaySession};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// One bot connection: gateway session, callbacks, cache and REST sender.
///
/// Callbacks may be registered before or after `connect`; they survive
/// reconnects and resumes.
#[derive(Debug)]
pub struct Session {
    config: Arc<ClientConfig>,
    rest: ReqwestRest,
    cache: SharedCache,
    callbacks: Arc<CallbackTable>,
    registry: Arc<SessionRegistry>,
    id: Option<SessionId>,
}

impl Session {
    /// Create a session with its own registry
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let registry = Arc::new(SessionRegistry::new(config.rest_burst));
        Self::with_registry(config, registry)
    }

    /// Create a session tracked by a shared registry, e.g. one per shard
    pub fn with_registry(
        config: ClientConfig,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, ClientError> {
        if !config.has_credentials() {
            return Err(ClientError::InvalidParameters(
                "A token is required to open a session".to_string(),
            ));
        }

        let rest = RestClientBuilder::new(RestClientConfig::from_client_config(&config))
            .with_signer(Arc::new(BotTokenSigner::new(config.token.clone())))
            .with_rate_limiter(registry.rate_limiter())
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            rest,
            cache: SharedCache::new(),
            callbacks: Arc::new(CallbackTable::new()),
            registry,
            id: None,
        })
    }

    /// Register the callback for one event name
    pub fn set_callback<F, Fut>(&self, event: &str, f: F) -> Result<(), ClientError>
    where
        F: Fn(EventContext, DispatchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.set_callback(event, callback(f))
    }

    /// Callback for every event without a specific one
    pub fn set_default_callback<F, Fut>(&self, f: F)
    where
        F: Fn(EventContext, DispatchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.set_default(callback(f));
    }

    pub fn clear_callback(&self, event: &str) -> Result<(), ClientError> {
        self.callbacks.clear_callback(event)
    }

    /// Connect over a real WebSocket
    pub async fn connect(&mut self) -> Result<SessionId, ClientError> {
        self.connect_with(Arc::new(TungsteniteConnector::new()))
            .await
    }

    /// Connect through a custom transport
    pub async fn connect_with(
        &mut self,
        connector: Arc<dyn WsConnector>,
    ) -> Result<SessionId, ClientError> {
        if let Some(id) = self.id {
            return Err(ClientError::InvalidParameters(format!(
                "{} is already running",
                id
            )));
        }

        let (session, handle, status) = GatewaySession::new(
            Arc::clone(&self.config),
            connector,
            self.rest.clone(),
            Arc::clone(&self.callbacks),
            self.cache.clone(),
        );
        let id = self.registry.spawn(session, handle, status);
        info!(
            %id,
            shard = ?[self.config.shard_index, self.config.shard_count],
            "Connecting"
        );
        self.id = Some(id);
        Ok(id)
    }

    /// Close the connection; no reconnect follows
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        match self.id.take() {
            Some(id) => self.registry.remove(id).await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }

    /// Wait until the session stops by itself (fatal close, or disconnect
    /// from a callback). Cancel-safe: dropping the future leaves the
    /// session running and connected to this facade.
    pub async fn wait(&mut self) -> Result<(), ClientError> {
        let Some(id) = self.id else {
            return Ok(());
        };
        if let Some(mut status) = self.registry.watch_status(id) {
            // Closed once the session task drops its sender
            while status.changed().await.is_ok() {}
        }
        self.id = None;
        self.registry.wait(id).await.unwrap_or(Ok(()))
    }

    pub const fn id(&self) -> Option<SessionId> {
        self.id
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.registry.status(self.id?)
    }

    pub fn watch_status(&self) -> Option<watch::Receiver<SessionStatus>> {
        self.registry.watch_status(self.id?)
    }

    pub fn rest(&self) -> &ReqwestRest {
        &self.rest
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn gateway(&self) -> Result<GatewayHandle, ClientError> {
        self.id
            .and_then(|id| self.registry.handle(id))
            .ok_or(ClientError::SessionClosed)
    }

    /// Send a raw frame through the gateway send limiter
    pub async fn send(&self, payload: GatewayPayload) -> Result<(), ClientError> {
        self.gateway()?.send(payload).await
    }

    /// Op 3: presence update
    pub async fn update_status(
        &self,
        status: &str,
        since: Option<u64>,
        game: Option<Value>,
        afk: bool,
    ) -> Result<(), ClientError> {
        self.send(build_status_update(status, since, game, afk))
            .await
    }

    /// Op 4: join, move or leave (`channel_id = None`) a voice channel
    pub async fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), ClientError> {
        self.send(build_voice_state_update(
            guild_id, channel_id, self_mute, self_deaf,
        ))
        .await
    }

    /// Op 8: members arrive as GUILD_MEMBERS_CHUNK events
    pub async fn request_guild_members(
        &self,
        guild_id: &str,
        query: &str,
        limit: u32,
    ) -> Result<(), ClientError> {
        self.send(build_request_guild_members(guild_id, query, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_required() {
        assert!(matches!(
            Session::new(ClientConfig::new("")),
            Err(ClientError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_unknown_callback_name_rejected() {
        let session = Session::new(ClientConfig::new("tok")).unwrap();
        assert!(session.set_callback("MESSAGE_CREATE", |_, _| async {}).is_ok());
        assert!(matches!(
            session.set_callback("MESAGE_CREATE", |_, _| async {}),
            Err(ClientError::UnknownEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_commands_need_a_running_session() {
        let session = Session::new(ClientConfig::new("tok")).unwrap();
        assert!(session.status().is_none());
        assert!(matches!(
            session.update_status("online", None, None, false).await,
            Err(ClientError::SessionClosed)
        ));
    }
}
