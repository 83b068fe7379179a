//! Scope normalization rules layered on top of the plain scope codec (§4.2).
//!
//! The codec in `refresh_core::scope` only knows how to build and parse canonical strings; the
//! orchestrator-specific rules here (pinned bodies, namespace rewriting, the non-scoped default
//! cluster fallback) decide WHAT body and cluster ids a given domain fetch should actually use.

use refresh_core::{scope, DomainConfig, RefreshContext};

/// A domain tried to fetch without a usable scope body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("scoped domain {0:?} requires a non-empty scope")]
pub struct EmptyScopeError(pub String);

/// Compute the normalized scope string a fetch for `domain` should use, given the orchestrator's
/// current context and an optional caller-supplied raw scope (e.g. from `fetchScopedDomain`).
pub fn normalize(
    domain: &DomainConfig,
    context: &RefreshContext,
    requested: Option<&str>,
) -> Result<String, EmptyScopeError> {
    let body = resolve_body(domain, context, requested);

    if domain.scoped && body.trim().is_empty() {
        return Err(EmptyScopeError(domain.name.clone()));
    }

    if scope_body_has_cluster_token(&body) {
        return Ok(body);
    }

    let cluster_ids = selected_cluster_ids(context);
    Ok(scope::build_cluster_scope_list(&cluster_ids, &body))
}

fn scope_body_has_cluster_token(body: &str) -> bool {
    matches!(body.split_once('|'), Some((lhs, _)) if !lhs.is_empty())
}

fn resolve_body(domain: &DomainConfig, context: &RefreshContext, requested: Option<&str>) -> String {
    if let Some(pinned) = &domain.pinned_body {
        return pinned.clone();
    }

    let raw = requested
        .map(str::to_string)
        .unwrap_or_else(|| default_body_for_category(domain, context));

    if domain.name.contains("namespace") || raw.starts_with("namespace:") {
        maybe_namespace_body(&raw)
    } else {
        raw
    }
}

fn maybe_namespace_body(raw: &str) -> String {
    if raw.is_empty() {
        raw.to_string()
    } else {
        scope::namespace_body(raw)
    }
}

fn default_body_for_category(domain: &DomainConfig, context: &RefreshContext) -> String {
    use refresh_core::DomainCategory;
    match domain.category {
        DomainCategory::Namespace => context
            .selected_namespace
            .clone()
            .map(|ns| scope::namespace_body(&ns))
            .unwrap_or_default(),
        DomainCategory::Cluster | DomainCategory::System => String::new(),
    }
}

fn selected_cluster_ids(context: &RefreshContext) -> Vec<String> {
    if !context.selected_cluster_ids.is_empty() {
        context.selected_cluster_ids.clone()
    } else if let Some(id) = &context.selected_cluster_id {
        vec![id.clone()]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refresh_core::DomainCategory;

    fn ctx() -> RefreshContext {
        let mut c = RefreshContext::default();
        c.selected_cluster_id = Some("cluster-a".into());
        c
    }

    #[test]
    fn non_scoped_domain_defaults_to_selected_cluster() {
        let domain = DomainConfig::new("nodes", DomainCategory::Cluster).with_pinned_body("");
        let normalized = normalize(&domain, &ctx(), None).unwrap();
        assert_eq!(normalized, "cluster-a|");
    }

    #[test]
    fn scoped_domain_without_body_is_an_error() {
        let domain = DomainConfig::new("namespace-config", DomainCategory::Namespace).scoped();
        let err = normalize(&domain, &ctx(), None).unwrap_err();
        assert_eq!(err.0, "namespace-config");
    }

    #[test]
    fn pinned_body_overrides_everything() {
        let domain = DomainConfig::new("cluster-events", DomainCategory::Cluster)
            .with_pinned_body("cluster");
        let normalized = normalize(&domain, &ctx(), Some("ignored")).unwrap();
        assert_eq!(normalized, "cluster-a|cluster");
    }

    #[test]
    fn existing_cluster_token_is_preserved() {
        let domain = DomainConfig::new("pods", DomainCategory::Namespace).scoped();
        let normalized = normalize(&domain, &ctx(), Some("cluster-b|namespace:team")).unwrap();
        assert_eq!(normalized, "cluster-b|namespace:team");
    }

    #[test]
    fn bare_namespace_request_is_rewritten() {
        let domain = DomainConfig::new("namespace-config", DomainCategory::Namespace).scoped();
        let normalized = normalize(&domain, &ctx(), Some("team-a")).unwrap();
        assert_eq!(normalized, "cluster-a|namespace:team-a");
    }
}
