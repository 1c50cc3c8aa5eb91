//! # Servicekit Authz
//!
//! Dual-mode request authorization for servicekit services.
//!
//! Inbound requests carry either a delegated-capability invocation or an
//! OAuth2 bearer token (never both). The [`AuthorizationDispatcher`]
//! classifies the credentials and routes to the matching authorizer:
//!
//! - [`CapabilityAuthorizer`] checks the invocation against expected
//!   host/target/action values, resolves the chain's root controller, runs
//!   proof verification behind the [`CapabilityVerifier`] seam, and inspects
//!   the delegation chain for revocations.
//! - [`TokenAuthorizer`] verifies a signed access token against the issuer
//!   discovered for the target object (via [`IssuerDiscoveryCache`]) and
//!   enforces hierarchical `action:path` scope matching.
//!
//! Every policy failure surfaces as the opaque public
//! [`AuthzError::NotAllowed`]; the [`Denial`] inside carries the
//! machine-readable reason for diagnostics.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Capability invocation authorization.
pub mod capability;
/// Credential dispatch.
pub mod dispatcher;
/// Issuer metadata and key discovery.
pub mod discovery;
/// Authorization error types.
pub mod error;
/// Request attributes and credential classification.
pub mod request;
/// Scope matching.
pub mod scope;
/// Access-token authorization.
pub mod token;

/// Shared test utilities (feature `testutil`).
#[cfg(feature = "testutil")]
pub mod testutil;

// Re-export key types for convenience
pub use capability::{
    CapabilityAuthorizer, CapabilityInvocation, CapabilityVerifier, ChainLink, MAX_CHAIN_LENGTH,
    RootControllerResolver, VerifiedCapability,
};
pub use dispatcher::{Authorization, AuthorizationDispatcher};
pub use discovery::{
    DEFAULT_DISCOVERY_MAX_AGE, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_RESPONSE_BYTES,
    DEFAULT_ROTATION_LEAD, DiscoveryConfig, HttpMetadataFetcher, IssuerDiscoveryCache,
    IssuerMetadata, IssuerRecord, MetadataFetcher,
};
pub use error::{AuthzError, AuthzResult, BoxError, Denial, DenialCode};
pub use request::{Action, Credentials, ExpectedValues, RequestContext, target_under_root};
pub use scope::{any_scope_grants, relative_resource_path, scope_grants};
pub use token::{
    ACCESS_TOKEN_TYPE, Audience, DEFAULT_MAX_CLOCK_SKEW, TokenAuthorizer, TokenVerifierConfig,
    VerifiedToken,
};
