//! Authorization error types.
//!
//! All capability and token verification failures are normalized to
//! [`AuthzError::NotAllowed`] at the public boundary: clients always see the
//! same opaque 403 message, while the [`Denial`] and the retained source
//! carry the specific cause for diagnostics and structured logging.

use thiserror::Error;

pub use servicekit_registry::BoxError;

/// Result type alias for authorization operations.
pub type AuthzResult<T> = std::result::Result<T, AuthzError>;

/// Authorization errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]` — new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AuthzError {
    /// The request is not authorized. The public message never reveals why;
    /// the denial and source do.
    #[error("Authorization error.")]
    NotAllowed {
        /// Machine-readable reason for the denial.
        denial: Denial,

        /// The underlying verification error, when one exists.
        #[source]
        source: Option<BoxError>,
    },

    /// The requested authorization method is not configured for the target
    /// object (e.g. a bearer token presented to a config without OAuth2
    /// settings).
    #[error("Authorization method \"{method}\" is not supported for this object.")]
    NotSupported {
        /// The unsupported method name.
        method: String,
    },

    /// Upstream metadata or key material could not be obtained or was
    /// malformed. Not a policy decision; typically transient or an issuer
    /// misconfiguration.
    #[error("{message}")]
    Operation {
        /// Human-readable description.
        message: String,

        /// The underlying error, when one exists.
        #[source]
        source: Option<BoxError>,
    },
}

impl AuthzError {
    /// Builds a [`NotAllowed`](Self::NotAllowed) error from a denial.
    #[must_use]
    pub fn not_allowed(denial: Denial) -> Self {
        Self::NotAllowed { denial, source: None }
    }

    /// Builds a [`NotAllowed`](Self::NotAllowed) error retaining the
    /// underlying cause.
    pub fn not_allowed_with(
        denial: Denial,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::NotAllowed { denial, source: Some(std::sync::Arc::new(source)) }
    }

    /// Builds a [`NotSupported`](Self::NotSupported) error.
    #[must_use]
    pub fn not_supported(method: impl Into<String>) -> Self {
        Self::NotSupported { method: method.into() }
    }

    /// Builds an [`Operation`](Self::Operation) error.
    #[must_use]
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation { message: message.into(), source: None }
    }

    /// Builds an [`Operation`](Self::Operation) error retaining the
    /// underlying cause.
    pub fn operation_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Operation { message: message.into(), source: Some(std::sync::Arc::new(source)) }
    }

    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAllowed { .. } => "not_allowed",
            Self::NotSupported { .. } => "not_supported",
            Self::Operation { .. } => "operation",
        }
    }

    /// HTTP status associated with this error.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotAllowed { .. } => 403,
            Self::NotSupported { .. } => 400,
            Self::Operation { .. } => 500,
        }
    }

    /// The denial carried by a [`NotAllowed`](Self::NotAllowed) error.
    #[must_use]
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::NotAllowed { denial, .. } => Some(denial),
            _ => None,
        }
    }
}

/// The machine-readable reason behind a [`AuthzError::NotAllowed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Token claim the denial is about, when one applies (`"iss"`, `"aud"`,
    /// `"exp"`, `"nbf"`, `"iat"`, `"scope"`, `"typ"`, `"kid"`).
    pub claim: Option<&'static str>,

    /// Reason code.
    pub code: DenialCode,

    /// Human-readable detail, for diagnostics only.
    pub detail: String,
}

impl Denial {
    /// Builds a denial with no associated claim.
    #[must_use]
    pub fn new(code: DenialCode, detail: impl Into<String>) -> Self {
        Self { claim: None, code, detail: detail.into() }
    }

    /// Builds a denial about a specific token claim.
    #[must_use]
    pub fn claim(claim: &'static str, code: DenialCode, detail: impl Into<String>) -> Self {
        Self { claim: Some(claim), code, detail: detail.into() }
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.claim {
            Some(claim) => write!(f, "{} ({claim}): {}", self.code.as_str(), self.detail),
            None => write!(f, "{}: {}", self.code.as_str(), self.detail),
        }
    }
}

/// Reason codes for authorization denials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DenialCode {
    /// More than one credential type was presented.
    MultipleCredentials,
    /// The required credential is missing from the request.
    MissingCredential,
    /// A request attribute does not match its expected value (host, target,
    /// or action).
    ExpectedValueMismatch,
    /// A capability in the delegation chain has been revoked.
    RevokedCapability,
    /// The delegation chain exceeds the maximum allowed length.
    ChainTooLong,
    /// Capability proof verification failed.
    VerificationFailed,
    /// The token could not be decoded at all.
    MalformedToken,
    /// The token's `typ` header is not the access-token marker.
    InvalidTokenType,
    /// The token's `kid` does not select any published key.
    UnknownKey,
    /// Signature verification failed or the algorithm is not acceptable.
    InvalidSignature,
    /// The token's issuer does not match the discovered issuer.
    IssuerMismatch,
    /// The token's audience does not include the target object.
    AudienceMismatch,
    /// The token has expired.
    Expired,
    /// The token is not yet valid.
    NotYetValid,
    /// No granted scope covers the requested action and path.
    InsufficientScope,
    /// The request target is outside the object's URL.
    TargetOutOfScope,
}

impl DenialCode {
    /// Stable string form, suitable for logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MultipleCredentials => "multiple_credentials",
            Self::MissingCredential => "missing_credential",
            Self::ExpectedValueMismatch => "expected_value_mismatch",
            Self::RevokedCapability => "revoked_capability",
            Self::ChainTooLong => "chain_too_long",
            Self::VerificationFailed => "verification_failed",
            Self::MalformedToken => "malformed_token",
            Self::InvalidTokenType => "invalid_token_type",
            Self::UnknownKey => "unknown_key",
            Self::InvalidSignature => "invalid_signature",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::InsufficientScope => "insufficient_scope",
            Self::TargetOutOfScope => "target_out_of_scope",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthzError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        let denial = match err.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => {
                Denial::new(DenialCode::MalformedToken, "token could not be decoded")
            }
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName | ErrorKind::InvalidKeyFormat => {
                Denial::new(DenialCode::InvalidSignature, "signature verification failed")
            }
            ErrorKind::ExpiredSignature => {
                Denial::claim("exp", DenialCode::Expired, "token has expired")
            }
            ErrorKind::ImmatureSignature => {
                Denial::claim("nbf", DenialCode::NotYetValid, "token is not yet valid")
            }
            ErrorKind::InvalidIssuer => {
                Denial::claim("iss", DenialCode::IssuerMismatch, "issuer mismatch")
            }
            ErrorKind::InvalidAudience => {
                Denial::claim("aud", DenialCode::AudienceMismatch, "audience mismatch")
            }
            _ => Denial::new(DenialCode::MalformedToken, format!("token rejected: {err}")),
        };
        Self::not_allowed_with(denial, err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn not_allowed_display_is_opaque() {
        let err = AuthzError::not_allowed(Denial::claim(
            "scope",
            DenialCode::InsufficientScope,
            "no granted scope covers write:/docs",
        ));
        assert_eq!(err.to_string(), "Authorization error.");
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.denial().unwrap().code, DenialCode::InsufficientScope);
    }

    #[test]
    fn not_allowed_preserves_source_chain() {
        use std::error::Error;

        let jwt_err =
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::ExpiredSignature);
        let err: AuthzError = jwt_err.into();

        assert_eq!(err.to_string(), "Authorization error.");
        assert_eq!(err.denial().unwrap().code, DenialCode::Expired);
        assert!(err.source().is_some(), "source chain must be preserved");
    }

    #[test]
    fn jwt_error_kinds_map_to_denial_codes() {
        use jsonwebtoken::errors::ErrorKind;

        let cases = [
            (ErrorKind::InvalidToken, DenialCode::MalformedToken),
            (ErrorKind::InvalidSignature, DenialCode::InvalidSignature),
            (ErrorKind::ImmatureSignature, DenialCode::NotYetValid),
            (ErrorKind::InvalidIssuer, DenialCode::IssuerMismatch),
            (ErrorKind::InvalidAudience, DenialCode::AudienceMismatch),
        ];
        for (kind, code) in cases {
            let err: AuthzError = jsonwebtoken::errors::Error::from(kind).into();
            assert_eq!(err.denial().unwrap().code, code);
        }
    }

    #[test]
    fn not_supported_names_the_method() {
        let err = AuthzError::not_supported("oauth2");
        assert_eq!(
            err.to_string(),
            "Authorization method \"oauth2\" is not supported for this object."
        );
        assert_eq!(err.code(), "not_supported");
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn errors_are_cloneable() {
        let err = AuthzError::operation_with(
            "metadata fetch failed",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        );
        let clone = err.clone();
        assert_eq!(clone.to_string(), "metadata fetch failed");
        assert_eq!(clone.code(), "operation");
    }
}
