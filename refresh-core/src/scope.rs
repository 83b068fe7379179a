//! Encoding and decoding of cluster-prefixed scope strings.
//!
//! A canonical scope is always `"<cluster-token>|<body>"`, where `<cluster-token>` is either a
//! single cluster id or `clusters=id1,id2,...` for multi-cluster fan-out. The body is usually
//! empty, a bare string, or a `namespace:<name>` sub-form.

use std::fmt;

const MULTI_PREFIX: &str = "clusters=";

/// The cluster-token half of a parsed scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterToken {
    /// No cluster binding at all (the scope was a bare body with no `|`).
    None,
    /// A single cluster id.
    Single(String),
    /// An ordered, deduplicated list of cluster ids (`clusters=a,b,c`).
    Multi(Vec<String>),
}

impl ClusterToken {
    /// `true` if this token names exactly one cluster (`Single`, or `Multi` of length 1).
    pub fn is_single_cluster(&self) -> bool {
        match self {
            ClusterToken::Single(_) => true,
            ClusterToken::Multi(ids) => ids.len() == 1,
            ClusterToken::None => false,
        }
    }

    /// The cluster id, if this token names exactly one cluster.
    pub fn single_cluster_id(&self) -> Option<&str> {
        match self {
            ClusterToken::Single(id) => Some(id),
            ClusterToken::Multi(ids) if ids.len() == 1 => Some(ids[0].as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterToken::None => Ok(()),
            ClusterToken::Single(id) => write!(f, "{id}"),
            ClusterToken::Multi(ids) => write!(f, "{MULTI_PREFIX}{}", ids.join(",")),
        }
    }
}

/// The result of parsing a canonical scope string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScope {
    /// The cluster token (`None` if the scope carried no `|`).
    pub token: ClusterToken,
    /// The body after the `|` (or the whole string, if there was no `|`).
    pub body: String,
}

impl ParsedScope {
    /// `true` when the token names more than one cluster.
    pub fn is_multi_cluster(&self) -> bool {
        matches!(&self.token, ClusterToken::Multi(ids) if ids.len() > 1)
    }

    /// The single cluster id bound to this scope, if any.
    pub fn cluster_id(&self) -> Option<&str> {
        self.token.single_cluster_id()
    }
}

fn dedup_trim(ids: &[impl AsRef<str>]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for id in ids {
        let trimmed = id.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Does `body` already carry a cluster token (i.e. contain a `|` with a non-empty left side)?
fn body_has_cluster_token(body: &str) -> bool {
    match body.split_once('|') {
        Some((lhs, _)) => !lhs.is_empty(),
        None => false,
    }
}

/// Build a single-cluster scope `"<id>|<body>"`.
///
/// If `body` already carries a cluster token it is returned unchanged (never re-prefixed). If
/// `cluster_id` is absent, the bare (trimmed) body is returned with no `|`.
pub fn build_cluster_scope(cluster_id: Option<&str>, body: &str) -> String {
    let body = body.trim();
    if body_has_cluster_token(body) {
        return body.to_string();
    }
    match cluster_id {
        Some(id) if !id.trim().is_empty() => format!("{}|{}", id.trim(), body),
        _ => body.to_string(),
    }
}

/// Build a (possibly multi-cluster) scope from an ordered list of cluster ids.
///
/// `ids` is deduplicated and trimmed, preserving first-seen order. A single surviving id
/// produces `"<id>|<body>"`; more than one produces `"clusters=id1,id2|<body>"`. If `body`
/// already carries a cluster token, it is preserved as-is.
pub fn build_cluster_scope_list(ids: &[impl AsRef<str>], body: &str) -> String {
    let body = body.trim();
    if body_has_cluster_token(body) {
        return body.to_string();
    }
    let ids = dedup_trim(ids);
    match ids.len() {
        0 => body.to_string(),
        1 => format!("{}|{}", ids[0], body),
        _ => format!("{MULTI_PREFIX}{}|{}", ids.join(","), body),
    }
}

/// Parse a canonical scope string into its cluster token and body.
pub fn parse_cluster_scope(scope: &str) -> ParsedScope {
    match scope.split_once('|') {
        None => ParsedScope {
            token: ClusterToken::None,
            body: scope.to_string(),
        },
        Some((lhs, rhs)) if lhs.is_empty() => ParsedScope {
            token: ClusterToken::None,
            body: rhs.to_string(),
        },
        Some((lhs, rhs)) => {
            let token = if let Some(rest) = lhs.strip_prefix(MULTI_PREFIX) {
                ClusterToken::Multi(dedup_trim(&rest.split(',').collect::<Vec<_>>()))
            } else {
                ClusterToken::Single(lhs.to_string())
            };
            ParsedScope {
                token,
                body: rhs.to_string(),
            }
        }
    }
}

/// Strip the cluster token from a scope, returning only the body.
pub fn strip_cluster_scope(scope: &str) -> String {
    parse_cluster_scope(scope).body
}

/// Rewrite a bare namespace name into the `namespace:<name>` sub-form, unless it already is one.
pub fn namespace_body(name: &str) -> String {
    let name = name.trim();
    if name.starts_with("namespace:") {
        name.to_string()
    } else {
        format!("namespace:{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_single_cluster_scope() {
        assert_eq!(build_cluster_scope(Some("cluster-a"), ""), "cluster-a|");
        assert_eq!(build_cluster_scope(None, "body"), "body");
    }

    #[test]
    fn build_does_not_reprefix_existing_token() {
        assert_eq!(
            build_cluster_scope(Some("cluster-b"), "cluster-a|ns:x"),
            "cluster-a|ns:x"
        );
    }

    #[test]
    fn build_list_dedupes_and_trims() {
        let a = build_cluster_scope_list(&["cluster-a", "cluster-a", " cluster-b "], "ns:x");
        let b = build_cluster_scope_list(&["cluster-a", "cluster-b"], "ns:x");
        assert_eq!(a, b);
        assert_eq!(a, "clusters=cluster-a,cluster-b|ns:x");
    }

    #[test]
    fn build_list_single_survivor_is_not_multi() {
        assert_eq!(
            build_cluster_scope_list(&["cluster-a", "cluster-a"], "x"),
            "cluster-a|x"
        );
    }

    #[test]
    fn round_trip_single_and_multi() {
        for s in [
            "cluster-a|",
            "cluster-a|ns:team",
            "clusters=a,b,c|",
            "clusters=a,b|ns:team",
        ] {
            let parsed = parse_cluster_scope(s);
            let ids: Vec<String> = match &parsed.token {
                ClusterToken::None => vec![],
                ClusterToken::Single(id) => vec![id.clone()],
                ClusterToken::Multi(ids) => ids.clone(),
            };
            assert_eq!(build_cluster_scope_list(&ids, &parsed.body), s);
        }
    }

    #[test]
    fn strip_roundtrips_with_build() {
        for body in ["", "ns:team", "cluster"] {
            assert_eq!(
                strip_cluster_scope(&build_cluster_scope(Some("cluster-a"), body)),
                body.trim()
            );
        }
    }

    #[test]
    fn multi_token_with_single_id_parses_as_single_cluster() {
        let parsed = parse_cluster_scope("clusters=only|ns:x");
        assert!(parsed.token.is_single_cluster());
        assert_eq!(parsed.cluster_id(), Some("only"));
        assert!(!parsed.is_multi_cluster());
    }

    #[test]
    fn namespace_body_rewrites_bare_names() {
        assert_eq!(namespace_body("team-a"), "namespace:team-a");
        assert_eq!(namespace_body("namespace:team-a"), "namespace:team-a");
    }
}
