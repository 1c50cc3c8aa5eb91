//! Request attributes and credential classification.
//!
//! The host's HTTP layer builds a [`RequestContext`] from the inbound
//! request; the dispatcher classifies its credentials into the closed
//! [`Credentials`] enum. Classification is an ordered decision, not header
//! sniffing: exactly one credential type may be presented, and capability
//! invocation is the explicit default when none is.

use url::Url;

use crate::{
    capability::CapabilityInvocation,
    error::{AuthzError, AuthzResult, Denial, DenialCode},
};

/// The access class a request demands, derived from its HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Safe methods (GET, HEAD, OPTIONS).
    Read,
    /// Everything else.
    Write,
}

impl Action {
    /// Derives the action from an HTTP method name (case-insensitive).
    #[must_use]
    pub fn from_method(method: &str) -> Self {
        if method.eq_ignore_ascii_case("GET")
            || method.eq_ignore_ascii_case("HEAD")
            || method.eq_ignore_ascii_case("OPTIONS")
        {
            Self::Read
        } else {
            Self::Write
        }
    }

    /// The scope-string form of this action.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request attributes the authorization engine consumes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method.
    pub method: String,

    /// Full request URL.
    pub url: Url,

    /// Host the request was addressed to (from the Host header or equivalent).
    pub host: String,

    /// Parsed capability invocation, when the request carries one.
    pub capability_invocation: Option<CapabilityInvocation>,

    /// Bearer token from the Authorization header, when present.
    pub bearer_token: Option<String>,
}

impl RequestContext {
    /// Classifies this request's credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError::NotAllowed`] when more than one credential type
    /// is presented.
    pub fn credentials(&self) -> AuthzResult<Credentials<'_>> {
        match (&self.capability_invocation, &self.bearer_token) {
            (Some(_), Some(_)) => Err(AuthzError::not_allowed(Denial::new(
                DenialCode::MultipleCredentials,
                "Only one authorization method is permitted.",
            ))),
            (_, Some(token)) => Ok(Credentials::Bearer { token }),
            // Capability is the default: a missing invocation fails
            // verification downstream like any other capability denial.
            (invocation, None) => Ok(Credentials::Capability { invocation: invocation.as_ref() }),
        }
    }

    /// The action this request's method implies.
    #[must_use]
    pub fn action(&self) -> Action {
        Action::from_method(&self.method)
    }
}

/// Closed classification of a request's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credentials<'a> {
    /// Capability invocation (also the default when nothing is presented).
    Capability {
        /// The parsed invocation, absent when nothing was presented.
        invocation: Option<&'a CapabilityInvocation>,
    },

    /// OAuth2 bearer token.
    Bearer {
        /// The raw token.
        token: &'a str,
    },
}

/// What the request is expected to prove: host, root target, and action.
///
/// Handlers build one per route. The root invocation target is typically the
/// config's own URL; object-creation endpoints use the collection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedValues {
    /// Host the credential must be bound to.
    pub host: String,

    /// Root URL the invoked target must equal or sit under.
    pub root_invocation_target: String,

    /// Action the credential must grant.
    pub action: Action,
}

impl ExpectedValues {
    /// Builds expected values for a request against a root target, deriving
    /// the action from the request method.
    #[must_use]
    pub fn for_request(request: &RequestContext, root_invocation_target: impl Into<String>) -> Self {
        Self {
            host: request.host.clone(),
            root_invocation_target: root_invocation_target.into(),
            action: request.action(),
        }
    }
}

/// Whether `target` equals `root` or is a path under it.
///
/// "Under" means the remainder after the root prefix starts with `/`, so
/// `https://x/objects/z1` never admits `https://x/objects/z10`.
#[must_use]
pub fn target_under_root(target: &str, root: &str) -> bool {
    if target == root {
        return true;
    }
    match target.strip_prefix(root) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}
