use crate::core::errors::ClientError;
use crate::core::kernel::rate_limit::CredentialKey;
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;

/// Headers to attach to an authenticated request
pub type SignatureResult = Result<HashMap<String, String>, ClientError>;

/// Signer trait for request authentication
///
/// Implementations produce the headers the API expects and a stable,
/// non-reversible key used to scope rate-limit state to the credential.
pub trait Signer: Send + Sync {
    /// Produce authentication headers for a request
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `endpoint` - API endpoint path
    fn sign_request(&self, method: &str, endpoint: &str) -> SignatureResult;

    /// Key identifying the credential without exposing it
    fn fingerprint(&self) -> CredentialKey;
}

/// Bot token authentication (`Authorization: Bot <token>`)
pub struct BotTokenSigner {
    token: Secret<String>,
    key: CredentialKey,
}

impl BotTokenSigner {
    pub fn new(token: Secret<String>) -> Self {
        let key = CredentialKey::from_token(token.expose_secret());
        Self { token, key }
    }
}

impl std::fmt::Debug for BotTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotTokenSigner")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Signer for BotTokenSigner {
    fn sign_request(&self, _method: &str, _endpoint: &str) -> SignatureResult {
        let token = self.token.expose_secret();
        if token.is_empty() {
            return Err(ClientError::InvalidParameters(
                "Authentication requires a non-empty token".to_string(),
            ));
        }

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bot {}", token));
        Ok(headers)
    }

    fn fingerprint(&self) -> CredentialKey {
        self.key
    }
}
