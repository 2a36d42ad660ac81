//! TURN credentials handed to clients for NAT traversal
//!
//! The relay never touches the credentials beyond passing them on; it only
//! needs something that can mint short-lived ones on request.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::CredentialsError;

const CLOUDFLARE_API: &str = "https://rtc.live.cloudflare.com/v1/turn/keys";

/// ICE server entry as browsers expect it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    /// Seconds the credentials stay valid
    pub lifetime: u64,
}

#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_credentials(&self) -> Result<Credentials, CredentialsError>;
}

/// Used when no TURN service is configured
pub struct NoCredentials;

#[async_trait]
impl CredentialsProvider for NoCredentials {
    async fn get_credentials(&self) -> Result<Credentials, CredentialsError> {
        Err(CredentialsError::NotConfigured)
    }
}

/// Shared-secret TURN REST credentials (coturn `use-auth-secret`)
pub struct TurnRestCredentials {
    secret: String,
    urls: Vec<String>,
    ttl: Duration,
    label: String,
}

impl TurnRestCredentials {
    pub fn new(secret: impl Into<String>, urls: Vec<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            urls,
            ttl,
            label: "pulsar".to_string(),
        }
    }

    fn sign(&self, expires_at: u64) -> Result<Credentials, CredentialsError> {
        type HmacSha1 = Hmac<Sha1>;

        let username = format!("{expires_at}:{}", self.label);
        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes())
            .map_err(|_| CredentialsError::InvalidSecret)?;
        mac.update(username.as_bytes());

        Ok(Credentials {
            urls: self.urls.clone(),
            username,
            credential: STANDARD.encode(mac.finalize().into_bytes()),
            lifetime: self.ttl.as_secs(),
        })
    }
}

#[async_trait]
impl CredentialsProvider for TurnRestCredentials {
    async fn get_credentials(&self) -> Result<Credentials, CredentialsError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.sign(now + self.ttl.as_secs())
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    ttl: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    ice_servers: IceServers,
}

#[derive(Deserialize)]
struct IceServers {
    urls: Vec<String>,
    username: String,
    credential: String,
}

struct Cached {
    credentials: Credentials,
    fetched_at: Instant,
}

/// Cloudflare TURN keys, cached until half their lifetime is used up
pub struct CloudflareCredentials {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

impl CloudflareCredentials {
    pub fn new(app_id: &str, token: impl Into<String>, ttl: Duration) -> Self {
        Self::with_endpoint(
            format!("{CLOUDFLARE_API}/{app_id}/credentials/generate"),
            token,
            ttl,
        )
    }

    pub fn with_endpoint(endpoint: impl Into<String>, token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
            token: token.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<Credentials, CredentialsError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&GenerateRequest {
                ttl: self.ttl.as_secs(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialsError::Upstream(format!(
                "credentials endpoint returned {status}"
            )));
        }

        let body: GenerateResponse = response.json().await?;
        Ok(Credentials {
            urls: body.ice_servers.urls,
            username: body.ice_servers.username,
            credential: body.ice_servers.credential,
            lifetime: self.ttl.as_secs(),
        })
    }
}

#[async_trait]
impl CredentialsProvider for CloudflareCredentials {
    async fn get_credentials(&self) -> Result<Credentials, CredentialsError> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            let age = cached.fetched_at.elapsed();
            if age < self.ttl / 2 {
                let mut credentials = cached.credentials.clone();
                credentials.lifetime = credentials.lifetime.saturating_sub(age.as_secs());
                return Ok(credentials);
            }
        }

        debug!("fetching fresh TURN credentials");
        let credentials = self.fetch().await?;
        *cache = Some(Cached {
            credentials: credentials.clone(),
            fetched_at: Instant::now(),
        });
        Ok(credentials)
    }
}

/// Pick the provider the configuration asks for
pub fn from_config(config: &Config) -> Arc<dyn CredentialsProvider> {
    let ttl = config.turn_ttl();

    if let (Some(app_id), Some(token)) = (&config.cloudflare_app_id, &config.cloudflare_token) {
        info!(app_id = %app_id, "using Cloudflare TURN credentials");
        return Arc::new(CloudflareCredentials::new(app_id, token.clone(), ttl));
    }

    if let Some(secret) = &config.turn_secret {
        info!(urls = ?config.turn_urls, "using shared-secret TURN credentials");
        return Arc::new(TurnRestCredentials::new(
            secret.clone(),
            config.turn_urls.clone(),
            ttl,
        ));
    }

    info!("no TURN service configured, credential requests will fail");
    Arc::new(NoCredentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_no_credentials() {
        assert!(matches!(
            NoCredentials.get_credentials().await,
            Err(CredentialsError::NotConfigured)
        ));
    }

    #[test]
    fn test_turn_rest_signature() {
        let provider = TurnRestCredentials::new(
            "north",
            vec!["turn:turn.example.com:3478".into()],
            Duration::from_secs(600),
        );
        let creds = provider.sign(1_700_000_000).unwrap();

        assert_eq!(creds.username, "1700000000:pulsar");
        assert_eq!(creds.lifetime, 600);
        assert_eq!(creds.urls, vec!["turn:turn.example.com:3478"]);

        let mut mac = Hmac::<Sha1>::new_from_slice(b"north").unwrap();
        mac.update(b"1700000000:pulsar");
        let expected = STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(creds.credential, expected);
    }

    #[tokio::test]
    async fn test_turn_rest_expiry_in_future() {
        let provider = TurnRestCredentials::new("s", vec![], Duration::from_secs(60));
        let creds = provider.get_credentials().await.unwrap();
        let expiry: u64 = creds.username.split(':').next().unwrap().parse().unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(expiry > now && expiry <= now + 60);
    }

    #[tokio::test]
    async fn test_cloudflare_credentials_are_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/generate",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({
                        "iceServers": {
                            "urls": ["turn:turn.cloudflare.com:3478"],
                            "username": "user",
                            "credential": "pass"
                        }
                    }))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let provider = CloudflareCredentials::with_endpoint(
            format!("http://{addr}/generate"),
            "token",
            Duration::from_secs(3600),
        );

        let first = provider.get_credentials().await.unwrap();
        let second = provider.get_credentials().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.username, "user");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cloudflare_cached_lifetime_counts_down() {
        let provider = CloudflareCredentials::with_endpoint(
            "http://127.0.0.1:9/generate",
            "token",
            Duration::from_secs(3600),
        );
        let fetched_at = Instant::now()
            .checked_sub(Duration::from_secs(600))
            .unwrap();
        *provider.cache.lock().await = Some(Cached {
            credentials: Credentials {
                urls: vec!["turn:turn.cloudflare.com:3478".into()],
                username: "user".into(),
                credential: "pass".into(),
                lifetime: 3600,
            },
            fetched_at,
        });

        let credentials = provider.get_credentials().await.unwrap();
        assert_eq!(credentials.username, "user");
        assert!(credentials.lifetime <= 3000);
        assert!(credentials.lifetime > 2900);
    }

    #[tokio::test]
    async fn test_cloudflare_upstream_error() {
        let app = Router::new().route(
            "/generate",
            post(|| async { axum::http::StatusCode::UNAUTHORIZED }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let provider = CloudflareCredentials::with_endpoint(
            format!("http://{addr}/generate"),
            "bad-token",
            Duration::from_secs(3600),
        );
        assert!(matches!(
            provider.get_credentials().await,
            Err(CredentialsError::Upstream(_))
        ));
    }
}
