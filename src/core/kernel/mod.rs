/// Transport kernel shared by the gateway and REST layers
///
/// The kernel knows nothing about gateway opcodes or API resources. It
/// provides:
///
/// - `WsConnector` / `WsConnection`: duplex frame transport over channels
/// - `WsCodec`: conversion between frames and protocol messages
/// - `RestClient` / `ReqwestRest`: authenticated, rate-limited HTTP sender
/// - `Signer`: credential headers and a credential fingerprint
/// - `RestRateLimiter` / `GatewaySendLimiter`: outbound throttling
///
/// # Sending a request
/// ```rust,no_run
/// use cordkit::core::kernel::*;
/// use secrecy::Secret;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), cordkit::core::errors::ClientError> {
/// let rest = RestClientBuilder::new(RestClientConfig::new("https://discord.com/api/v6"))
///     .with_signer(Arc::new(BotTokenSigner::new(Secret::new("token".to_string()))))
///     .build()?;
///
/// let request = RestRequest::new(HttpMethod::Get, "/channels/81384788765712384")?;
/// let channel = rest.request(request).await?;
/// println!("{}", channel["name"]);
///
/// // Deferred: returns immediately, resolves once
/// let pending = rest.send_deferred(RestRequest::new(HttpMethod::Get, "/gateway")?);
/// let gateway = pending.wait().await?;
/// # let _ = gateway;
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod rate_limit;
pub mod rest;
pub mod signer;
pub mod ws;

pub use codec::WsCodec;
pub use rate_limit::{
    now_epoch, route_for, CredentialKey, GatewaySendLimiter, RestRateLimiter, SendWindow,
    ServerQuota,
};
pub use rest::{
    GatewayInfo, HttpMethod, PendingRequest, ReqwestRest, RestClient, RestClientBuilder,
    RestClientConfig, RestRequest,
};
pub use signer::{BotTokenSigner, SignatureResult, Signer};
pub use ws::{TransportEvent, TungsteniteConnector, WsConfig, WsConnection, WsConnector, WsPeer};
