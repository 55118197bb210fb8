//! Service-account JWT exchange and the process-wide access-token cache.

use std::collections::HashMap;
use std::sync::Arc;

use aigate_provider_core::{ProviderError, ProviderResult};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::http_client::AuxiliaryClient;

pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: String,
    pub project_id: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn parse(credential: &str) -> ProviderResult<Self> {
        serde_json::from_str(credential).map_err(|err| {
            ProviderError::InvalidConfig(format!("vertex service account json: {err}"))
        })
    }

    fn token_uri(&self) -> &str {
        self.token_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .unwrap_or(DEFAULT_TOKEN_URI)
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    aud: String,
    scope: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexToken {
    pub access_token: String,
    pub project_id: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: VertexToken,
    expires_at: i64,
}

/// Tokens keyed by the BLAKE3 digest of the credential text, so rotating a
/// key never serves a token minted for the previous one.
///
/// Hits only take the read lock. Refreshes are single-flight per key.
pub struct VertexTokenCache {
    client: Arc<dyn AuxiliaryClient>,
    entries: RwLock<HashMap<String, CachedToken>>,
    refreshing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VertexTokenCache {
    pub fn new(client: Arc<dyn AuxiliaryClient>) -> Self {
        Self {
            client,
            entries: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_key(credential: &str) -> String {
        blake3::hash(credential.as_bytes()).to_hex().to_string()
    }

    async fn fresh(&self, key: &str) -> Option<VertexToken> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.entries
            .read()
            .await
            .get(key)
            .filter(|entry| entry.expires_at - REFRESH_SKEW_SECS > now)
            .map(|entry| entry.token.clone())
    }

    async fn refresh_guard(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .refreshing
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// A token valid for at least the refresh skew.
    pub async fn token(&self, credential: &str) -> ProviderResult<VertexToken> {
        let key = Self::cache_key(credential);
        if let Some(token) = self.fresh(&key).await {
            return Ok(token);
        }

        let _guard = self.refresh_guard(&key).await;
        // Another caller may have refreshed while this one waited.
        if let Some(token) = self.fresh(&key).await {
            return Ok(token);
        }

        let account = ServiceAccountKey::parse(credential)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let (access_token, expires_in) = self.exchange(&account, now).await?;
        let token = VertexToken {
            access_token,
            project_id: account.project_id.clone(),
        };
        tracing::info!(
            event = "vertex_token_refreshed",
            client_email = %account.client_email,
            project_id = %account.project_id,
            expires_in,
        );
        self.entries.write().await.insert(
            key,
            CachedToken {
                token: token.clone(),
                expires_at: now + expires_in,
            },
        );
        Ok(token)
    }

    async fn exchange(&self, account: &ServiceAccountKey, now: i64) -> ProviderResult<(String, i64)> {
        let token_uri = account.token_uri();
        let assertion = sign_assertion(account, token_uri, now)?;
        let response = self
            .client
            .post_form(
                token_uri,
                &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
            )
            .await?;
        if !(200..300).contains(&response.status) {
            return Err(ProviderError::Upstream(format!(
                "vertex token exchange failed ({}): {}",
                response.status,
                String::from_utf8_lossy(&response.body)
            )));
        }
        let token: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|err| ProviderError::Upstream(format!("vertex token response: {err}")))?;
        Ok((
            token.access_token,
            token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS),
        ))
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, credential: &str, token: VertexToken, expires_at: i64) {
        self.entries
            .write()
            .await
            .insert(Self::cache_key(credential), CachedToken { token, expires_at });
    }
}

fn sign_assertion(account: &ServiceAccountKey, token_uri: &str, now: i64) -> ProviderResult<String> {
    let claims = JwtClaims {
        iss: account.client_email.clone(),
        sub: account.client_email.clone(),
        aud: token_uri.to_string(),
        scope: DEFAULT_SCOPE.to_string(),
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };
    let mut header = Header::new(Algorithm::RS256);
    if !account.private_key_id.is_empty() {
        header.kid = Some(account.private_key_id.clone());
    }
    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
        .map_err(|err| ProviderError::Signing(format!("vertex private key: {err}")))?;
    jsonwebtoken::encode(&header, &claims, &key)
        .map_err(|err| ProviderError::Signing(format!("vertex assertion: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{FetchedAsset, AuxiliaryResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingClient {
        posts: AtomicUsize,
    }

    #[async_trait]
    impl AuxiliaryClient for CountingClient {
        async fn fetch(&self, _url: &str) -> ProviderResult<FetchedAsset> {
            unreachable!("token exchange never fetches")
        }

        async fn post_form(&self, _url: &str, _form: &[(&str, &str)]) -> ProviderResult<AuxiliaryResponse> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(AuxiliaryResponse {
                status: 200,
                body: bytes::Bytes::from_static(br#"{"access_token":"ya29.x","expires_in":3600}"#),
            })
        }

        async fn get(&self, _url: &str, _headers: &[(String, String)]) -> ProviderResult<AuxiliaryResponse> {
            unreachable!("token exchange never polls")
        }
    }

    fn credential(private_key: &str) -> String {
        serde_json::json!({
            "type": "service_account",
            "client_email": "svc@proj.iam.gserviceaccount.com",
            "private_key": private_key,
            "private_key_id": "kid-1",
            "project_id": "proj-1"
        })
        .to_string()
    }

    #[test]
    fn token_uri_defaults_to_google() {
        let account = ServiceAccountKey::parse(&credential("pem")).unwrap();
        assert_eq!(account.token_uri(), DEFAULT_TOKEN_URI);
        assert_eq!(account.project_id, "proj-1");
    }

    #[test]
    fn cache_key_is_content_hash() {
        let a = VertexTokenCache::cache_key("one");
        assert_eq!(a.len(), 64);
        assert_eq!(a, VertexTokenCache::cache_key("one"));
        assert_ne!(a, VertexTokenCache::cache_key("two"));
    }

    #[tokio::test]
    async fn fresh_entries_are_served_from_cache() {
        let client = Arc::new(CountingClient::default());
        let cache = VertexTokenCache::new(client.clone());
        let credential = credential("not-a-pem");
        let cached = VertexToken {
            access_token: "cached".into(),
            project_id: "proj-1".into(),
        };
        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + 600;
        cache.seed(&credential, cached.clone(), expires_at).await;

        assert_eq!(cache.token(&credential).await.unwrap(), cached);
        assert_eq!(client.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn entries_inside_the_skew_are_refreshed() {
        let client = Arc::new(CountingClient::default());
        let cache = VertexTokenCache::new(client.clone());
        let credential = credential("not-a-pem");
        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + 30;
        let stale = VertexToken {
            access_token: "stale".into(),
            project_id: "proj-1".into(),
        };
        cache.seed(&credential, stale, expires_at).await;

        // Refresh is attempted, and fails at signing before any network call.
        let err = cache.token(&credential).await.unwrap_err();
        assert!(matches!(err, ProviderError::Signing(_)));
        assert_eq!(client.posts.load(Ordering::SeqCst), 0);
    }

    fn token(access_token: &str) -> VertexToken {
        VertexToken {
            access_token: access_token.into(),
            project_id: "proj-1".into(),
        }
    }

    #[tokio::test]
    async fn hits_are_served_while_another_key_refreshes() {
        let cache = VertexTokenCache::new(Arc::new(CountingClient::default()));
        let busy = credential("busy-key");
        let idle = credential("idle-key");
        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + 600;
        cache.seed(&idle, token("idle"), expires_at).await;

        let _refreshing = cache.refresh_guard(&VertexTokenCache::cache_key(&busy)).await;
        let served = tokio::time::timeout(std::time::Duration::from_secs(1), cache.token(&idle))
            .await
            .expect("cache hit must not wait on an unrelated refresh")
            .unwrap();
        assert_eq!(served, token("idle"));
    }

    #[tokio::test]
    async fn waiters_reuse_the_token_minted_by_the_refresh_in_flight() {
        let client = Arc::new(CountingClient::default());
        let cache = Arc::new(VertexTokenCache::new(client.clone()));
        let credential = credential("not-a-pem");
        let key = VertexTokenCache::cache_key(&credential);

        let refreshing = cache.refresh_guard(&key).await;
        let waiter = {
            let cache = cache.clone();
            let credential = credential.clone();
            tokio::spawn(async move { cache.token(&credential).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + 600;
        cache.seed(&credential, token("minted"), expires_at).await;
        drop(refreshing);

        assert_eq!(waiter.await.unwrap().unwrap(), token("minted"));
        assert_eq!(client.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_credential_is_a_config_error() {
        let cache = VertexTokenCache::new(Arc::new(CountingClient::default()));
        let err = cache.token("{not json").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
    }
}
