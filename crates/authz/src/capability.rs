//! Delegated-capability authorization.
//!
//! Proof and delegation-chain cryptography live behind the
//! [`CapabilityVerifier`] seam; this module implements the policy around it:
//! expected-value checks, root controller resolution, and revocation
//! inspection over the verified chain. Every failure is normalized to the
//! public [`AuthzError::NotAllowed`] with the specific cause retained as its
//! source.

use std::sync::Arc;

use async_trait::async_trait;
use servicekit_registry::{ChainPair, RevocationStore};

use crate::{
    error::{AuthzError, AuthzResult, BoxError, Denial, DenialCode},
    request::{Action, ExpectedValues, target_under_root},
};

/// Maximum number of links accepted in a delegation chain.
pub const MAX_CHAIN_LENGTH: usize = 10;

/// A capability invocation as presented on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityInvocation {
    /// Host the invocation is bound to.
    pub host: String,

    /// URL the capability is invoked against.
    pub invocation_target: String,

    /// Action the invocation claims.
    pub action: Action,

    /// Serialized proof material, passed through to the verifier opaquely.
    pub proof: String,
}

/// One link of a verified delegation chain, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    /// The capability's id.
    pub capability_id: String,

    /// The entity that delegated this capability; `None` on the root.
    pub delegator: Option<String>,
}

/// The outcome of successful proof verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCapability {
    /// The entity that invoked the capability.
    pub invoker: String,

    /// The chain's root invocation target.
    pub root_invocation_target: String,

    /// The delegation chain, root first.
    pub chain: Vec<ChainLink>,
}

/// Proof and delegation-chain verification seam.
///
/// Implemented over an external capability/signature library; this crate only
/// consumes the verified chain.
#[async_trait]
pub trait CapabilityVerifier: Send + Sync {
    /// Verifies the invocation's proof and delegation chain against the
    /// expected values and the resolved root controller.
    async fn verify(
        &self,
        invocation: &CapabilityInvocation,
        expected: &ExpectedValues,
        root_controller: &str,
    ) -> Result<VerifiedCapability, BoxError>;
}

/// Resolves the controller that roots a delegation chain for a target.
///
/// Typically the config's `controller`; object-creation endpoints resolve the
/// meter's controller instead.
#[async_trait]
pub trait RootControllerResolver: Send + Sync {
    /// Resolves the root controller for `root_invocation_target`.
    async fn resolve(&self, root_invocation_target: &str) -> Result<String, BoxError>;
}

/// Authorizes capability invocations.
pub struct CapabilityAuthorizer {
    verifier: Arc<dyn CapabilityVerifier>,
    resolver: Arc<dyn RootControllerResolver>,
    revocations: Arc<dyn RevocationStore>,
}

impl CapabilityAuthorizer {
    /// Creates an authorizer over the given verifier, resolver, and
    /// revocation store.
    #[must_use]
    pub fn new(
        verifier: Arc<dyn CapabilityVerifier>,
        resolver: Arc<dyn RootControllerResolver>,
        revocations: Arc<dyn RevocationStore>,
    ) -> Self {
        Self { verifier, resolver, revocations }
    }

    /// Authorizes one invocation against the expected values.
    ///
    /// Checks run in order: host, target-under-root, action, root controller
    /// resolution, proof verification, chain length, revocation inspection.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError::NotAllowed`] for every policy failure, including
    /// a missing invocation, and [`AuthzError::Operation`] when the
    /// revocation store itself fails.
    #[tracing::instrument(skip_all, fields(target = %expected.root_invocation_target))]
    pub async fn authorize(
        &self,
        invocation: Option<&CapabilityInvocation>,
        expected: &ExpectedValues,
    ) -> AuthzResult<VerifiedCapability> {
        let Some(invocation) = invocation else {
            return Err(AuthzError::not_allowed(Denial::new(
                DenialCode::MissingCredential,
                "no capability invocation was presented",
            )));
        };

        if invocation.host != expected.host {
            return Err(mismatch(format!(
                "invocation host {:?} does not match expected host {:?}",
                invocation.host, expected.host
            )));
        }
        if !target_under_root(&invocation.invocation_target, &expected.root_invocation_target) {
            return Err(mismatch(format!(
                "invocation target {:?} is not under root target {:?}",
                invocation.invocation_target, expected.root_invocation_target
            )));
        }
        if invocation.action != expected.action {
            return Err(mismatch(format!(
                "invocation action {} does not match expected action {}",
                invocation.action, expected.action
            )));
        }

        let root_controller = self
            .resolver
            .resolve(&expected.root_invocation_target)
            .await
            .map_err(|err| AuthzError::NotAllowed {
                denial: Denial::new(
                    DenialCode::VerificationFailed,
                    "root controller could not be resolved",
                ),
                source: Some(err),
            })?;

        let verified = self
            .verifier
            .verify(invocation, expected, &root_controller)
            .await
            .map_err(|err| AuthzError::NotAllowed {
                denial: Denial::new(DenialCode::VerificationFailed, "proof verification failed"),
                source: Some(err),
            })?;

        if verified.chain.len() > MAX_CHAIN_LENGTH {
            return Err(AuthzError::not_allowed(Denial::new(
                DenialCode::ChainTooLong,
                format!("delegation chain has {} links", verified.chain.len()),
            )));
        }

        // Every delegated link is a revocation-lookup key; the root is not
        // revocable.
        let pairs: Vec<ChainPair> = verified
            .chain
            .iter()
            .filter_map(|link| {
                link.delegator.as_ref().map(|delegator| ChainPair {
                    capability_id: link.capability_id.clone(),
                    delegator: delegator.clone(),
                })
            })
            .collect();

        if !pairs.is_empty()
            && self
                .revocations
                .is_revoked(&pairs)
                .await
                .map_err(|err| AuthzError::operation_with("revocation lookup failed", err))?
        {
            tracing::debug!(invoker = %verified.invoker, "revoked capability in chain");
            return Err(AuthzError::not_allowed(Denial::new(
                DenialCode::RevokedCapability,
                "One or more capabilities in the chain have been revoked.",
            )));
        }

        Ok(verified)
    }
}

impl std::fmt::Debug for CapabilityAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityAuthorizer").finish_non_exhaustive()
    }
}

fn mismatch(detail: String) -> AuthzError {
    AuthzError::not_allowed(Denial::new(DenialCode::ExpectedValueMismatch, detail))
}
