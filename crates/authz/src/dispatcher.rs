//! Credential dispatch.
//!
//! Routes a classified request to the capability or token authorizer and
//! returns whichever structured outcome applies. Composition is an ordered
//! decision over the closed [`Credentials`] enum, never header sniffing.

use std::sync::Arc;

use servicekit_registry::ServiceConfig;

use crate::{
    capability::{CapabilityAuthorizer, VerifiedCapability},
    error::{AuthzError, AuthzResult},
    request::{Credentials, ExpectedValues, RequestContext},
    token::{TokenAuthorizer, VerifiedToken},
};

/// The structured outcome of a successful authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Authorization {
    /// Authorized by a capability invocation.
    Capability(VerifiedCapability),

    /// Authorized by an OAuth2 access token.
    Token(VerifiedToken),
}

/// Routes requests to the authorizer matching their credentials.
pub struct AuthorizationDispatcher {
    capability: Arc<CapabilityAuthorizer>,
    token: Arc<TokenAuthorizer>,
}

impl AuthorizationDispatcher {
    /// Creates a dispatcher over both authorizers.
    #[must_use]
    pub fn new(capability: Arc<CapabilityAuthorizer>, token: Arc<TokenAuthorizer>) -> Self {
        Self { capability, token }
    }

    /// Authorizes one request against the object described by `config`.
    ///
    /// Exactly one credential type may be presented. A bearer token requires
    /// the config to carry OAuth2 settings; capability invocation is the
    /// default, so a request with no credentials fails capability
    /// verification like any other denial.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError::NotAllowed`] when more than one credential type
    /// is presented or the selected authorizer denies the request, and
    /// [`AuthzError::NotSupported`] for a bearer token against a config
    /// without OAuth2 settings.
    #[tracing::instrument(skip_all, fields(id = %config.id, method = %request.method))]
    pub async fn authorize(
        &self,
        request: &RequestContext,
        config: &ServiceConfig,
        expected: &ExpectedValues,
    ) -> AuthzResult<Authorization> {
        match request.credentials()? {
            Credentials::Bearer { token } => {
                let oauth2_configured = config
                    .authorization
                    .as_ref()
                    .is_some_and(|authorization| authorization.oauth2.is_some());
                if !oauth2_configured {
                    return Err(AuthzError::not_supported("oauth2"));
                }
                let verified = self
                    .token
                    .authorize(token, config, request.url.as_str(), expected.action)
                    .await?;
                Ok(Authorization::Token(verified))
            }
            Credentials::Capability { invocation } => {
                let verified = self.capability.authorize(invocation, expected).await?;
                Ok(Authorization::Capability(verified))
            }
        }
    }
}

impl std::fmt::Debug for AuthorizationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationDispatcher").finish_non_exhaustive()
    }
}
