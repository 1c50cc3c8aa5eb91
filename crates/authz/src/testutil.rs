//! Shared test utilities for authorization testing.
//!
//! A deterministic test issuer (Ed25519 keypair, JWK set, token signing)
//! and a canned [`MetadataFetcher`], plus assertion macros. Feature-gated
//! behind `testutil` to prevent leaking into production builds.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signer, SigningKey};
use jsonwebtoken::jwk::JwkSet;
use parking_lot::Mutex;
use rand_core::OsRng;
use url::Url;

use crate::{
    discovery::{IssuerMetadata, MetadataFetcher},
    error::BoxError,
    token::ACCESS_TOKEN_TYPE,
};

/// A self-contained OAuth2 issuer for tests: Ed25519 keypair, well-known
/// URLs, and token signing.
pub struct TestIssuer {
    signing_key: SigningKey,
    /// Key id published in the JWK set.
    pub kid: String,
    /// Issuer identifier matching [`config_url`](Self::config_url).
    pub issuer: String,
    /// Well-known metadata URL.
    pub config_url: Url,
    /// JWK set URL named in the metadata document.
    pub jwks_uri: Url,
}

impl TestIssuer {
    /// Creates an issuer at `https://as.example.com` with a fresh keypair.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            kid: "test-key-1".into(),
            issuer: "https://as.example.com".into(),
            config_url: "https://as.example.com/.well-known/oauth-authorization-server"
                .parse()
                .expect("static url"),
            jwks_uri: "https://as.example.com/jwks".parse().expect("static url"),
        }
    }

    /// The RFC 8414 metadata document this issuer serves.
    #[must_use]
    pub fn metadata(&self) -> IssuerMetadata {
        IssuerMetadata { issuer: self.issuer.clone(), jwks_uri: self.jwks_uri.clone() }
    }

    /// The issuer's published JWK set (one Ed25519 key).
    #[must_use]
    pub fn jwk_set(&self) -> JwkSet {
        let x = URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().to_bytes());
        serde_json::from_value(serde_json::json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "x": x,
                "kid": self.kid,
                "alg": "EdDSA",
                "use": "sig",
            }]
        }))
        .expect("valid JWK set")
    }

    /// Signs a token with an explicit header and claims, for tampering
    /// tests.
    #[must_use]
    pub fn sign_custom(&self, header: &serde_json::Value, claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).expect("header json"));
        let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims json"));
        let message = format!("{header}.{claims}");
        let signature = URL_SAFE_NO_PAD.encode(self.signing_key.sign(message.as_bytes()).to_bytes());
        format!("{message}.{signature}")
    }

    /// Signs a well-formed access token for `audience` with the given scope,
    /// valid for five minutes.
    #[must_use]
    pub fn access_token(&self, audience: &str, scope: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        self.sign_custom(
            &self.access_token_header(),
            &serde_json::json!({
                "iss": self.issuer,
                "aud": audience,
                "sub": "did:example:token-subject",
                "iat": now,
                "exp": now + 300,
                "scope": scope,
            }),
        )
    }

    /// The header a well-formed access token carries.
    #[must_use]
    pub fn access_token_header(&self) -> serde_json::Value {
        serde_json::json!({
            "alg": "EdDSA",
            "typ": ACCESS_TOKEN_TYPE,
            "kid": self.kid,
        })
    }
}

impl Default for TestIssuer {
    fn default() -> Self {
        Self::new()
    }
}

/// Canned [`MetadataFetcher`] serving one issuer, with fetch counters and
/// switchable failure.
pub struct StaticMetadataFetcher {
    metadata: Mutex<IssuerMetadata>,
    jwks: JwkSet,
    delay: Mutex<Duration>,
    fail: Mutex<bool>,
    metadata_fetches: AtomicU64,
    jwks_fetches: AtomicU64,
}

impl StaticMetadataFetcher {
    /// Builds a fetcher serving the given issuer's documents.
    #[must_use]
    pub fn for_issuer(issuer: &TestIssuer) -> Self {
        Self {
            metadata: Mutex::new(issuer.metadata()),
            jwks: issuer.jwk_set(),
            delay: Mutex::new(Duration::ZERO),
            fail: Mutex::new(false),
            metadata_fetches: AtomicU64::new(0),
            jwks_fetches: AtomicU64::new(0),
        }
    }

    /// Overrides the served `issuer` field, for mismatch tests.
    pub fn set_issuer(&self, issuer: impl Into<String>) {
        self.metadata.lock().issuer = issuer.into();
    }

    /// Adds an artificial delay to every fetch, widening race windows.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Arms or disarms fetch failure.
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Number of metadata-document fetches served.
    #[must_use]
    pub fn metadata_fetches(&self) -> u64 {
        self.metadata_fetches.load(Ordering::SeqCst)
    }

    /// Number of JWK-set fetches served.
    #[must_use]
    pub fn jwks_fetches(&self) -> u64 {
        self.jwks_fetches.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<(), BoxError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail.lock() {
            return Err(std::sync::Arc::new(std::io::Error::other("injected fetch failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataFetcher for StaticMetadataFetcher {
    async fn fetch_metadata(&self, _url: &Url) -> Result<IssuerMetadata, BoxError> {
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        Ok(self.metadata.lock().clone())
    }

    async fn fetch_jwks(&self, _url: &Url) -> Result<JwkSet, BoxError> {
        self.jwks_fetches.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        Ok(self.jwks.clone())
    }
}

/// Asserts that a result is an `Err(AuthzError::NotAllowed)` carrying the
/// given [`DenialCode`](crate::DenialCode) variant.
#[macro_export]
macro_rules! assert_denied {
    ($result:expr, $code:ident) => {
        match &$result {
            Err($crate::AuthzError::NotAllowed { denial, .. }) => assert_eq!(
                denial.code,
                $crate::DenialCode::$code,
                "expected denial code {}, got: {:?}",
                stringify!($code),
                denial,
            ),
            other => panic!(
                "expected NotAllowed with code {}, got: {:?}",
                stringify!($code),
                other,
            ),
        }
    };
}
