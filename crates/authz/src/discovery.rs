//! OAuth2 issuer discovery cache.
//!
//! Fetches RFC 8414 authorization-server metadata and the issuer's JWK set,
//! keyed by issuer-config URL. Concurrent cold readers share one fetch;
//! before an entry expires, a speculative background rotation re-fetches it
//! so readers rarely block on a cold fetch at the cache boundary.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use fail::fail_point;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AuthzError, AuthzResult, BoxError};

/// Default lifetime of a cached issuer record (5 minutes).
pub const DEFAULT_DISCOVERY_MAX_AGE: Duration = Duration::from_secs(300);

/// Default lead time before expiry at which rotation starts (1 minute).
pub const DEFAULT_ROTATION_LEAD: Duration = Duration::from_secs(60);

/// Default timeout for one metadata or JWK-set fetch (5 seconds).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default size bound per fetched document (8 KiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 8192;

/// Tuning for the discovery cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, serde::Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiscoveryConfig {
    /// Lifetime of a cached issuer record.
    #[builder(default = DEFAULT_DISCOVERY_MAX_AGE)]
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// How far before expiry a speculative rotation starts. Rotation is
    /// disabled unless `max_age > 2 * rotation_lead`.
    #[builder(default = DEFAULT_ROTATION_LEAD)]
    #[serde(with = "humantime_serde")]
    pub rotation_lead: Duration,

    /// Timeout for one metadata or JWK-set fetch.
    #[builder(default = DEFAULT_FETCH_TIMEOUT)]
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Size bound per fetched document.
    #[builder(default = DEFAULT_MAX_RESPONSE_BYTES)]
    pub max_response_bytes: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_DISCOVERY_MAX_AGE,
            rotation_lead: DEFAULT_ROTATION_LEAD,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

/// The RFC 8414 metadata fields this cache consumes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuerMetadata {
    /// The issuer identifier the server asserts.
    pub issuer: String,

    /// Where the issuer publishes its JWK set.
    pub jwks_uri: Url,
}

/// A discovered issuer: validated identifier plus published keys.
#[derive(Debug, Clone)]
pub struct IssuerRecord {
    /// The validated issuer identifier.
    pub issuer: String,

    /// The issuer's published JWK set.
    pub jwks: JwkSet,
}

/// Fetch seam for metadata and JWK-set documents.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Fetches and parses the authorization-server metadata document.
    async fn fetch_metadata(&self, url: &Url) -> Result<IssuerMetadata, BoxError>;

    /// Fetches and parses a JWK set.
    async fn fetch_jwks(&self, url: &Url) -> Result<JwkSet, BoxError>;
}

/// Production [`MetadataFetcher`] over reqwest, with time and size bounds.
pub struct HttpMetadataFetcher {
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl HttpMetadataFetcher {
    /// Builds a fetcher honoring the config's fetch timeout and response
    /// size bound.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError::Operation`] when the HTTP client cannot be
    /// constructed.
    pub fn new(config: &DiscoveryConfig) -> AuthzResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|err| AuthzError::operation_with("could not build discovery client", err))?;
        Ok(Self { client, max_response_bytes: config.max_response_bytes })
    }

    async fn fetch_bounded(&self, url: &Url) -> Result<Vec<u8>, BoxError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| Arc::new(err) as BoxError)?;
        let body = response.bytes().await.map_err(|err| Arc::new(err) as BoxError)?;
        if body.len() > self.max_response_bytes {
            return Err(Arc::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("document exceeds {} bytes", self.max_response_bytes),
            )));
        }
        Ok(body.to_vec())
    }
}

#[async_trait]
impl MetadataFetcher for HttpMetadataFetcher {
    async fn fetch_metadata(&self, url: &Url) -> Result<IssuerMetadata, BoxError> {
        let body = self.fetch_bounded(url).await?;
        serde_json::from_slice(&body).map_err(|err| Arc::new(err) as BoxError)
    }

    async fn fetch_jwks(&self, url: &Url) -> Result<JwkSet, BoxError> {
        let body = self.fetch_bounded(url).await?;
        serde_json::from_slice(&body).map_err(|err| Arc::new(err) as BoxError)
    }
}

#[derive(Default)]
struct RotationSlot {
    /// A completed speculative re-fetch awaiting promotion.
    next: Option<Arc<IssuerRecord>>,
    /// Guards against scheduling duplicate rotations for the same URL.
    rotating: bool,
}

/// Caches discovered issuers per issuer-config URL.
///
/// One instance per process. Explicit lifecycle: [`shutdown`](Self::shutdown)
/// cancels outstanding rotation tasks and awaits them.
pub struct IssuerDiscoveryCache {
    cache: moka::future::Cache<String, Arc<IssuerRecord>>,
    slots: Arc<Mutex<HashMap<String, RotationSlot>>>,
    fetcher: Arc<dyn MetadataFetcher>,
    config: DiscoveryConfig,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IssuerDiscoveryCache {
    /// Creates a cache over the given fetcher.
    #[must_use]
    pub fn new(fetcher: Arc<dyn MetadataFetcher>, config: DiscoveryConfig) -> Self {
        let cache = moka::future::Cache::builder().time_to_live(config.max_age).build();
        Self {
            cache,
            slots: Arc::new(Mutex::new(HashMap::new())),
            fetcher,
            config,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Gets the issuer record for an issuer-config URL.
    ///
    /// Served from the cache when possible; a completed rotation is promoted
    /// instead of re-fetching. Concurrent cold readers for the same URL share
    /// one fetch, and a failed fetch is observed by all of them without being
    /// cached.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError::Operation`] when the fetch fails, a document is
    /// oversize or malformed, or the metadata's issuer does not match the
    /// well-known URL pattern.
    #[tracing::instrument(skip_all, fields(url = %url))]
    pub async fn get(&self, url: &Url) -> AuthzResult<Arc<IssuerRecord>> {
        let key = url.as_str().to_owned();

        let promoted = self.slots.lock().get_mut(&key).and_then(|slot| slot.next.take());
        if let Some(record) = promoted {
            tracing::debug!("promoting rotated issuer record");
            self.cache.insert(key.clone(), Arc::clone(&record)).await;
            self.schedule_rotation(&key, url);
            return Ok(record);
        }

        if let Some(record) = self.cache.get(&key).await {
            return Ok(record);
        }

        let fetcher = Arc::clone(&self.fetcher);
        let record = self
            .cache
            .try_get_with(key.clone(), async move {
                fail_point!("discovery-before-fetch", |_| {
                    Err(AuthzError::operation("injected failure before discovery fetch"))
                });
                fetch_issuer(&fetcher, url).await
            })
            .await
            .map_err(|err: Arc<AuthzError>| (*err).clone())?;

        self.schedule_rotation(&key, url);
        Ok(record)
    }

    /// Schedules a speculative re-fetch `max_age - rotation_lead` ahead,
    /// unless one is already pending or the lifetime is too short to rotate
    /// safely.
    fn schedule_rotation(&self, key: &str, url: &Url) {
        if self.config.max_age <= self.config.rotation_lead * 2 {
            return;
        }
        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_owned()).or_default();
            if slot.rotating {
                return;
            }
            slot.rotating = true;
        }

        let delay = self.config.max_age - self.config.rotation_lead;
        let fetcher = Arc::clone(&self.fetcher);
        let slots = Arc::clone(&self.slots);
        let token = self.cancel_token.clone();
        let key = key.to_owned();
        let url = url.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    slots.lock().entry(key).or_default().rotating = false;
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            match fetch_issuer(&fetcher, &url).await {
                Ok(record) => {
                    let mut slots = slots.lock();
                    let slot = slots.entry(key).or_default();
                    slot.next = Some(record);
                    slot.rotating = false;
                }
                Err(err) => {
                    // Dropped; the next cold read re-fetches.
                    tracing::warn!(url = %url, error = %err, "issuer rotation failed");
                    slots.lock().entry(key).or_default().rotating = false;
                }
            }
        });
        // One rotation is pushed per issuer per lifetime cycle; drop the
        // finished handles so the vector never grows with process age.
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Cancels all rotation tasks and awaits their termination.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "issuer rotation task panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    #[cfg(test)]
    pub(crate) fn rotation_task_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl std::fmt::Debug for IssuerDiscoveryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerDiscoveryCache").field("config", &self.config).finish_non_exhaustive()
    }
}

async fn fetch_issuer(
    fetcher: &Arc<dyn MetadataFetcher>,
    url: &Url,
) -> AuthzResult<Arc<IssuerRecord>> {
    let expected = expected_issuer(url)?;

    let metadata = fetcher.fetch_metadata(url).await.map_err(|err| AuthzError::Operation {
        message: format!("could not fetch issuer metadata from {url}"),
        source: Some(err),
    })?;

    if !issuer_matches(&metadata.issuer, &expected) {
        return Err(AuthzError::operation(format!(
            "issuer {:?} does not match the well-known URL (expected {expected:?})",
            metadata.issuer
        )));
    }

    let jwks =
        fetcher.fetch_jwks(&metadata.jwks_uri).await.map_err(|err| AuthzError::Operation {
            message: format!("could not fetch JWK set from {}", metadata.jwks_uri),
            source: Some(err),
        })?;

    tracing::debug!(issuer = %metadata.issuer, keys = jwks.keys.len(), "issuer discovered");
    Ok(Arc::new(IssuerRecord { issuer: metadata.issuer, jwks }))
}

/// The issuer a well-known config URL implies:
/// `<origin>/.well-known/<segment><path>` → `<origin><path>`.
fn expected_issuer(url: &Url) -> AuthzResult<String> {
    let origin = url.origin().ascii_serialization();
    let suffix = url
        .path()
        .strip_prefix("/.well-known/")
        .filter(|rest| !rest.is_empty())
        .map(|rest| match rest.split_once('/') {
            Some((_, tail)) => format!("/{tail}"),
            None => String::new(),
        })
        .ok_or_else(|| {
            AuthzError::operation(format!("{url} is not a well-known configuration URL"))
        })?;
    Ok(format!("{origin}{suffix}"))
}

/// Exact match, tolerating one trailing slash when the expected issuer is a
/// bare origin.
fn issuer_matches(issuer: &str, expected: &str) -> bool {
    if issuer == expected {
        return true;
    }
    let bare_origin =
        expected.split_once("://").is_some_and(|(_, rest)| !rest.contains('/'));
    bare_origin && issuer.strip_suffix('/').is_some_and(|trimmed| trimmed == expected)
}
