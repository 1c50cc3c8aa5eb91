//! OAuth2 access-token authorization.
//!
//! Verifies a signed access token against the issuer discovered for the
//! target object: token type, signature, issuer, audience, time claims with
//! bounded clock skew, and hierarchical scope matching against the resource
//! path. Every failure is a [`AuthzError::NotAllowed`] carrying the claim
//! name and reason code.

use std::{sync::Arc, time::Duration};

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use servicekit_registry::ServiceConfig;

use crate::{
    discovery::IssuerDiscoveryCache,
    error::{AuthzError, AuthzResult, Denial, DenialCode},
    request::Action,
    scope::{any_scope_grants, relative_resource_path},
};

/// The `typ` header value marking an OAuth2 access token (RFC 9068).
pub const ACCESS_TOKEN_TYPE: &str = "at+jwt";

/// Default tolerance for clock drift between this service and the issuer.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Tuning for token verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, serde::Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TokenVerifierConfig {
    /// Accepted clock drift when checking `exp`, `nbf`, and `iat`.
    #[builder(default = DEFAULT_MAX_CLOCK_SKEW)]
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
}

impl Default for TokenVerifierConfig {
    fn default() -> Self {
        Self { max_clock_skew: DEFAULT_MAX_CLOCK_SKEW }
    }
}

/// The `aud` claim: a single value or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// Single audience.
    One(String),
    /// Multiple audiences.
    Many(Vec<String>),
}

impl Audience {
    /// Whether the claim includes `value`.
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::One(aud) => aud == value,
            Self::Many(auds) => auds.iter().any(|aud| aud == value),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    iss: String,
    #[serde(default)]
    aud: Option<Audience>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// The outcome of successful token verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    /// The verified issuer.
    pub issuer: String,

    /// The token's subject, when present.
    pub subject: Option<String>,

    /// The granted scope claim (space-separated).
    pub scope: String,
}

/// Authorizes OAuth2 bearer tokens.
pub struct TokenAuthorizer {
    discovery: Arc<IssuerDiscoveryCache>,
    config: TokenVerifierConfig,
}

impl TokenAuthorizer {
    /// Creates an authorizer over the given discovery cache.
    #[must_use]
    pub fn new(discovery: Arc<IssuerDiscoveryCache>, config: TokenVerifierConfig) -> Self {
        Self { discovery, config }
    }

    /// Authorizes one bearer token for `action` on `target` against the
    /// object described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError::NotSupported`] when the config carries no OAuth2
    /// settings, [`AuthzError::Operation`] when issuer discovery fails, and
    /// [`AuthzError::NotAllowed`] for every verification failure.
    #[tracing::instrument(skip_all, fields(id = %config.id))]
    pub async fn authorize(
        &self,
        token: &str,
        config: &ServiceConfig,
        target: &str,
        action: Action,
    ) -> AuthzResult<VerifiedToken> {
        let Some(oauth2) =
            config.authorization.as_ref().and_then(|authorization| authorization.oauth2.as_ref())
        else {
            return Err(AuthzError::not_supported("oauth2"));
        };

        // A token can never authorize anything outside the object's own URL.
        let resource_path = relative_resource_path(target, &config.id).ok_or_else(|| {
            AuthzError::not_allowed(Denial::new(
                DenialCode::TargetOutOfScope,
                format!("target {target:?} is not under the object URL"),
            ))
        })?;

        let issuer = self.discovery.get(&oauth2.issuer_config_url).await?;

        let header = jsonwebtoken::decode_header(token)?;
        check_token_type(header.typ.as_deref())?;
        check_algorithm(header.alg)?;

        let kid = header.kid.as_deref().ok_or_else(|| {
            AuthzError::not_allowed(Denial::claim(
                "kid",
                DenialCode::UnknownKey,
                "token header carries no key id",
            ))
        })?;
        let jwk = issuer.jwks.find(kid).ok_or_else(|| {
            AuthzError::not_allowed(Denial::claim(
                "kid",
                DenialCode::UnknownKey,
                format!("issuer publishes no key {kid:?}"),
            ))
        })?;
        let key = DecodingKey::from_jwk(jwk).map_err(|err| {
            AuthzError::operation_with(format!("issuer key {kid:?} is unusable"), err)
        })?;

        // Signature only; every claim is checked explicitly below so the
        // denial can name the claim and honor the skew budget.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        let data = jsonwebtoken::decode::<AccessTokenClaims>(token, &key, &validation)?;
        let claims = data.claims;

        if claims.iss != issuer.issuer {
            return Err(AuthzError::not_allowed(Denial::claim(
                "iss",
                DenialCode::IssuerMismatch,
                format!("token issuer {:?} does not match {:?}", claims.iss, issuer.issuer),
            )));
        }

        if !claims.aud.as_ref().is_some_and(|aud| aud.contains(&config.id)) {
            return Err(AuthzError::not_allowed(Denial::claim(
                "aud",
                DenialCode::AudienceMismatch,
                "token audience does not include the object",
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let skew = self.config.max_clock_skew.as_secs() as i64;

        let exp = claims.exp.ok_or_else(|| {
            AuthzError::not_allowed(Denial::claim(
                "exp",
                DenialCode::Expired,
                "token carries no expiry",
            ))
        })?;
        if exp + skew < now {
            return Err(AuthzError::not_allowed(Denial::claim(
                "exp",
                DenialCode::Expired,
                "token has expired",
            )));
        }
        if let Some(nbf) = claims.nbf
            && nbf - skew > now
        {
            return Err(AuthzError::not_allowed(Denial::claim(
                "nbf",
                DenialCode::NotYetValid,
                "token is not yet valid",
            )));
        }
        if let Some(iat) = claims.iat
            && iat - skew > now
        {
            return Err(AuthzError::not_allowed(Denial::claim(
                "iat",
                DenialCode::NotYetValid,
                "token was issued in the future",
            )));
        }

        let scope = claims.scope.unwrap_or_default();
        if !any_scope_grants(&scope, action, &resource_path) {
            return Err(AuthzError::not_allowed(Denial::claim(
                "scope",
                DenialCode::InsufficientScope,
                format!("no granted scope covers {action}:{resource_path}"),
            )));
        }

        tracing::debug!(issuer = %claims.iss, "access token authorized");
        Ok(VerifiedToken { issuer: claims.iss, subject: claims.sub, scope })
    }
}

impl std::fmt::Debug for TokenAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthorizer").field("config", &self.config).finish_non_exhaustive()
    }
}

/// The `typ` header must be the access-token marker, with an optional
/// `application/` media-type prefix, ASCII case-insensitive.
fn check_token_type(typ: Option<&str>) -> AuthzResult<()> {
    let matches_marker = typ.is_some_and(|typ| {
        typ.eq_ignore_ascii_case(ACCESS_TOKEN_TYPE)
            || typ.eq_ignore_ascii_case(&format!("application/{ACCESS_TOKEN_TYPE}"))
    });
    if matches_marker {
        Ok(())
    } else {
        Err(AuthzError::not_allowed(Denial::claim(
            "typ",
            DenialCode::InvalidTokenType,
            format!("token type {typ:?} is not an access token"),
        )))
    }
}

/// Symmetric algorithms are never acceptable: the issuer publishes public
/// keys only.
fn check_algorithm(alg: Algorithm) -> AuthzResult<()> {
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            Err(AuthzError::not_allowed(Denial::new(
                DenialCode::InvalidSignature,
                format!("symmetric algorithm {alg:?} is not acceptable"),
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn token_type_accepts_the_marker_and_media_type_form() {
        assert!(check_token_type(Some("at+jwt")).is_ok());
        assert!(check_token_type(Some("AT+JWT")).is_ok());
        assert!(check_token_type(Some("application/at+jwt")).is_ok());
        assert!(check_token_type(Some("Application/AT+JWT")).is_ok());

        assert!(check_token_type(Some("JWT")).is_err());
        assert!(check_token_type(Some("text/at+jwt")).is_err());
        assert!(check_token_type(None).is_err());
    }

    #[test]
    fn symmetric_algorithms_are_rejected() {
        assert!(check_algorithm(Algorithm::HS256).is_err());
        assert!(check_algorithm(Algorithm::HS512).is_err());
        assert!(check_algorithm(Algorithm::EdDSA).is_ok());
        assert!(check_algorithm(Algorithm::RS256).is_ok());
        assert!(check_algorithm(Algorithm::ES256).is_ok());
    }

    #[test]
    fn audience_matches_single_and_list_forms() {
        let one = Audience::One("https://x/objects/z1".into());
        assert!(one.contains("https://x/objects/z1"));
        assert!(!one.contains("https://x/objects/z2"));

        let many =
            Audience::Many(vec!["https://x/objects/z1".into(), "https://x/objects/z2".into()]);
        assert!(many.contains("https://x/objects/z2"));
        assert!(!many.contains("https://x/objects/z3"));
    }

    #[test]
    fn audience_deserializes_both_wire_forms() {
        let one: Audience = serde_json::from_str(r#""a""#).unwrap();
        assert_eq!(one, Audience::One("a".into()));

        let many: Audience = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert!(many.contains("b"));
    }
}
