use crate::core::config::ClientConfig;
use crate::core::errors::ClientError;
use crate::core::kernel::rest::ReqwestRest;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Cached results of the gateway URL lookup.
///
/// Entries are keyed by where the base comes from (the configured override,
/// or the API base and version used for `GET /gateway`), so sessions with
/// different configs can share one cache.
#[derive(Debug, Default)]
pub struct GatewayUrlCache {
    bases: Mutex<HashMap<String, String>>,
}

fn lookup_key(config: &ClientConfig) -> String {
    match &config.gateway_url {
        Some(url) => url.clone(),
        None => format!(
            "{}/v{}",
            config.api_base.trim_end_matches('/'),
            config.api_version
        ),
    }
}

impl GatewayUrlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streaming URL for `config`, looking the base up on a cache miss
    pub async fn resolve(
        &self,
        rest: &ReqwestRest,
        config: &ClientConfig,
    ) -> Result<String, ClientError> {
        let key = lookup_key(config);
        let mut bases = self.bases.lock().await;
        let base = match bases.get(&key).cloned() {
            Some(url) => url,
            None => {
                let url = match &config.gateway_url {
                    Some(url) => url.clone(),
                    None => rest.get_gateway_url().await?,
                };
                debug!(url = %url, "Gateway URL resolved");
                bases.insert(key, url.clone());
                url
            }
        };
        Ok(connect_url(&base, config.api_version, config.compress))
    }

    /// Forget the base cached for `config`; the next `resolve` looks it up again
    pub async fn invalidate(&self, config: &ClientConfig) {
        self.bases.lock().await.remove(&lookup_key(config));
    }

    pub async fn cached(&self, config: &ClientConfig) -> Option<String> {
        self.bases.lock().await.get(&lookup_key(config)).cloned()
    }
}

/// `{base}/?v={version}&encoding=json[&compress=zlib-stream]`
pub fn connect_url(base: &str, version: u8, compress: bool) -> String {
    let mut url = format!(
        "{}/?v={}&encoding=json",
        base.trim_end_matches('/'),
        version
    );
    if compress {
        url.push_str("&compress=zlib-stream");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::rest::{RestClientBuilder, RestClientConfig};

    #[test]
    fn test_connect_url() {
        assert_eq!(
            connect_url("wss://gateway.discord.gg", 6, false),
            "wss://gateway.discord.gg/?v=6&encoding=json"
        );
        assert_eq!(
            connect_url("wss://gateway.discord.gg/", 6, true),
            "wss://gateway.discord.gg/?v=6&encoding=json&compress=zlib-stream"
        );
    }

    #[tokio::test]
    async fn test_override_skips_lookup_and_invalidate_clears() {
        let rest = RestClientBuilder::new(RestClientConfig::new("http://127.0.0.1:9"))
            .build()
            .unwrap();
        let config = ClientConfig::new("t").gateway_url("ws://localhost:1");
        let cache = GatewayUrlCache::new();

        let url = cache.resolve(&rest, &config).await.unwrap();
        assert_eq!(url, "ws://localhost:1/?v=6&encoding=json");
        assert_eq!(
            cache.cached(&config).await.as_deref(),
            Some("ws://localhost:1")
        );

        cache.invalidate(&config).await;
        assert!(cache.cached(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_configs_do_not_share_bases() {
        let rest = RestClientBuilder::new(RestClientConfig::new("http://127.0.0.1:9"))
            .build()
            .unwrap();
        let first = ClientConfig::new("t").gateway_url("ws://first");
        let second = ClientConfig::new("t").gateway_url("ws://second");
        let cache = GatewayUrlCache::new();

        cache.resolve(&rest, &first).await.unwrap();
        let url = cache.resolve(&rest, &second).await.unwrap();
        assert_eq!(url, "ws://second/?v=6&encoding=json");
        assert_eq!(cache.cached(&first).await.as_deref(), Some("ws://first"));

        cache.invalidate(&second).await;
        assert!(cache.cached(&second).await.is_none());
        assert!(cache.cached(&first).await.is_some());
    }
}
