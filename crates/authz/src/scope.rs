//! Hierarchical `action:path` scope matching.
//!
//! A granted scope `read:/a` covers `/a` and everything under it (`/a/b`,
//! `/a?x=1`, `/a#frag`) but never a sibling whose name merely extends the
//! prefix (`/ab`). The grant `action:/` covers every path.

use crate::request::Action;

/// Whether a single granted scope covers `action` on `resource_path`.
///
/// `resource_path` is the request target relative to the object root and
/// always starts with `/`.
#[must_use]
pub fn scope_grants(granted: &str, action: Action, resource_path: &str) -> bool {
    let Some((scope_action, scope_path)) = granted.split_once(':') else {
        return false;
    };
    if scope_action != action.as_str() {
        return false;
    }
    if scope_path == "/" {
        return true;
    }
    match resource_path.strip_prefix(scope_path) {
        // Exact match.
        Some("") => true,
        // Prefix match only at a path, query, or fragment boundary.
        Some(rest) => matches!(rest.as_bytes().first(), Some(b'/' | b'?' | b'#')),
        None => false,
    }
}

/// Whether any scope in a space-separated `scope` claim covers `action` on
/// `resource_path`.
#[must_use]
pub fn any_scope_grants(scope_claim: &str, action: Action, resource_path: &str) -> bool {
    scope_claim.split(' ').any(|granted| scope_grants(granted, action, resource_path))
}

/// The request target relative to the object's own URL.
///
/// Strips the `config_id` prefix from `target`; an empty remainder becomes
/// `/`. Returns `None` when the target is not the object or a path under it
/// (boundary `/`, `?`, or `#`), which callers treat as out of scope.
#[must_use]
pub fn relative_resource_path(target: &str, config_id: &str) -> Option<String> {
    let rest = target.strip_prefix(config_id)?;
    if rest.is_empty() {
        return Some("/".to_owned());
    }
    if matches!(rest.as_bytes().first(), Some(b'/' | b'?' | b'#')) {
        return Some(rest.to_owned());
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn root_scope_grants_every_path() {
        assert!(scope_grants("read:/", Action::Read, "/"));
        assert!(scope_grants("read:/", Action::Read, "/a"));
        assert!(scope_grants("read:/", Action::Read, "/a/b/c?x=1"));
    }

    #[test]
    fn prefix_grants_stop_at_boundaries() {
        assert!(scope_grants("read:/a", Action::Read, "/a"));
        assert!(scope_grants("read:/a", Action::Read, "/a/b"));
        assert!(scope_grants("read:/a", Action::Read, "/a?x=1"));
        assert!(scope_grants("read:/a", Action::Read, "/a#frag"));
        assert!(!scope_grants("read:/a", Action::Read, "/ab"));
        assert!(!scope_grants("read:/a", Action::Read, "/b"));
    }

    #[test]
    fn action_must_match_exactly() {
        assert!(!scope_grants("read:/", Action::Write, "/"));
        assert!(!scope_grants("write:/a", Action::Read, "/a"));
        assert!(scope_grants("write:/a", Action::Write, "/a/b"));
    }

    #[test]
    fn malformed_scopes_never_grant() {
        assert!(!scope_grants("read", Action::Read, "/"));
        assert!(!scope_grants("", Action::Read, "/"));
        assert!(!scope_grants("READ:/", Action::Read, "/"));
    }

    #[test]
    fn claim_is_split_on_spaces() {
        let claim = "write:/docs read:/";
        assert!(any_scope_grants(claim, Action::Read, "/anything"));
        assert!(any_scope_grants(claim, Action::Write, "/docs/1"));
        assert!(!any_scope_grants(claim, Action::Write, "/other"));
    }

    #[test]
    fn relative_path_strips_the_object_prefix() {
        let id = "https://registry.example.com/objects/z1";
        assert_eq!(relative_resource_path(id, id).unwrap(), "/");
        assert_eq!(
            relative_resource_path("https://registry.example.com/objects/z1/docs", id).unwrap(),
            "/docs"
        );
        assert_eq!(
            relative_resource_path("https://registry.example.com/objects/z1?x=1", id).unwrap(),
            "?x=1"
        );
        assert!(relative_resource_path("https://registry.example.com/objects/z10", id).is_none());
        assert!(relative_resource_path("https://other.example.com/objects/z1", id).is_none());
    }

    proptest! {
        /// A grant for a path prefix covers exactly the paths that extend it
        /// at a boundary character.
        #[test]
        fn prefix_grant_matches_only_boundary_extensions(
            prefix in "/[a-z]{1,8}",
            rest in "[a-z0-9/?#._-]{0,12}",
        ) {
            let scope = format!("read:{prefix}");
            let path = format!("{prefix}{rest}");
            let expected = rest.is_empty()
                || matches!(rest.as_bytes()[0], b'/' | b'?' | b'#');
            prop_assert_eq!(scope_grants(&scope, Action::Read, &path), expected);
        }

        /// The root grant covers any path, for either action but never the
        /// other action.
        #[test]
        fn root_grant_is_action_bound(path in "/[a-z0-9/._-]{0,16}") {
            prop_assert!(scope_grants("read:/", Action::Read, &path));
            prop_assert!(!scope_grants("read:/", Action::Write, &path));
        }
    }
}
