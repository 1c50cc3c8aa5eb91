//! Integration tests for credential dispatch: exactly-one-credential
//! enforcement, routing, and the capability default.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use async_trait::async_trait;
use servicekit_authz::{
    Action, Authorization, AuthorizationDispatcher, AuthzError, BoxError, CapabilityAuthorizer,
    CapabilityInvocation, CapabilityVerifier, ChainLink, DiscoveryConfig, ExpectedValues,
    IssuerDiscoveryCache, RequestContext, RootControllerResolver, TokenAuthorizer,
    TokenVerifierConfig, VerifiedCapability, assert_denied,
    testutil::{StaticMetadataFetcher, TestIssuer},
};
use servicekit_registry::{
    AuthorizationOptions, MemoryRevocationStore, OAuth2Options, RevocationStore, ServiceConfig,
};

const CONFIG_ID: &str = "https://registry.example.com/objects/z1";

struct AcceptingVerifier;

#[async_trait]
impl CapabilityVerifier for AcceptingVerifier {
    async fn verify(
        &self,
        _invocation: &CapabilityInvocation,
        expected: &ExpectedValues,
        root_controller: &str,
    ) -> Result<VerifiedCapability, BoxError> {
        Ok(VerifiedCapability {
            invoker: root_controller.to_owned(),
            root_invocation_target: expected.root_invocation_target.clone(),
            chain: vec![ChainLink {
                capability_id: format!("urn:root:{}", expected.root_invocation_target),
                delegator: None,
            }],
        })
    }
}

struct ConfigControllerResolver;

#[async_trait]
impl RootControllerResolver for ConfigControllerResolver {
    async fn resolve(&self, _root_invocation_target: &str) -> Result<String, BoxError> {
        Ok("did:example:alice".into())
    }
}

fn dispatcher(issuer: &TestIssuer) -> AuthorizationDispatcher {
    let capability = Arc::new(CapabilityAuthorizer::new(
        Arc::new(AcceptingVerifier),
        Arc::new(ConfigControllerResolver),
        Arc::new(MemoryRevocationStore::new()) as Arc<dyn RevocationStore>,
    ));
    let fetcher = Arc::new(StaticMetadataFetcher::for_issuer(issuer));
    let token = Arc::new(TokenAuthorizer::new(
        Arc::new(IssuerDiscoveryCache::new(fetcher, DiscoveryConfig::default())),
        TokenVerifierConfig::default(),
    ));
    AuthorizationDispatcher::new(capability, token)
}

fn oauth_config(issuer: &TestIssuer) -> ServiceConfig {
    ServiceConfig::builder()
        .id(CONFIG_ID)
        .controller("did:example:alice")
        .sequence(0)
        .meter_id("https://meters.example.com/m1")
        .authorization(AuthorizationOptions {
            oauth2: Some(OAuth2Options { issuer_config_url: issuer.config_url.clone() }),
        })
        .build()
}

fn request(invocation: Option<CapabilityInvocation>, bearer: Option<String>) -> RequestContext {
    RequestContext {
        method: "GET".into(),
        url: CONFIG_ID.parse().unwrap(),
        host: "registry.example.com".into(),
        capability_invocation: invocation,
        bearer_token: bearer,
    }
}

fn invocation() -> CapabilityInvocation {
    CapabilityInvocation {
        host: "registry.example.com".into(),
        invocation_target: CONFIG_ID.into(),
        action: Action::Read,
        proof: "proof-bytes".into(),
    }
}

fn expected() -> ExpectedValues {
    ExpectedValues {
        host: "registry.example.com".into(),
        root_invocation_target: CONFIG_ID.into(),
        action: Action::Read,
    }
}

#[tokio::test]
async fn both_credential_types_are_rejected() {
    let issuer = TestIssuer::new();
    let config = oauth_config(&issuer);
    let request = request(Some(invocation()), Some(issuer.access_token(CONFIG_ID, "read:/")));

    let result = dispatcher(&issuer).authorize(&request, &config, &expected()).await;
    assert_denied!(result, MultipleCredentials);
}

#[tokio::test]
async fn bearer_token_routes_to_the_token_authorizer() {
    let issuer = TestIssuer::new();
    let config = oauth_config(&issuer);
    let request = request(None, Some(issuer.access_token(CONFIG_ID, "read:/")));

    let outcome = dispatcher(&issuer).authorize(&request, &config, &expected()).await.unwrap();
    match outcome {
        Authorization::Token(verified) => assert_eq!(verified.issuer, "https://as.example.com"),
        other => panic!("expected a token authorization, got: {other:?}"),
    }
}

#[tokio::test]
async fn bearer_token_without_oauth2_settings_is_not_supported() {
    let issuer = TestIssuer::new();
    let mut config = oauth_config(&issuer);
    config.authorization = None;
    let request = request(None, Some(issuer.access_token(CONFIG_ID, "read:/")));

    let result = dispatcher(&issuer).authorize(&request, &config, &expected()).await;
    match result {
        Err(AuthzError::NotSupported { method }) => assert_eq!(method, "oauth2"),
        other => panic!("expected NotSupported, got: {other:?}"),
    }
}

#[tokio::test]
async fn capability_invocation_routes_to_the_capability_authorizer() {
    let issuer = TestIssuer::new();
    let config = oauth_config(&issuer);
    let request = request(Some(invocation()), None);

    let outcome = dispatcher(&issuer).authorize(&request, &config, &expected()).await.unwrap();
    match outcome {
        Authorization::Capability(verified) => {
            assert_eq!(verified.invoker, "did:example:alice");
        }
        other => panic!("expected a capability authorization, got: {other:?}"),
    }
}

#[tokio::test]
async fn no_credentials_defaults_to_capability_and_is_denied() {
    let issuer = TestIssuer::new();
    let config = oauth_config(&issuer);
    let request = request(None, None);

    let result = dispatcher(&issuer).authorize(&request, &config, &expected()).await;
    assert_denied!(result, MissingCredential);
}
