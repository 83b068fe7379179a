//! The refresh context: the subset of navigation/selection state the core reacts to.

use serde::{Deserialize, Serialize};

/// The active top-level UI section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    /// Inside a single namespace.
    Namespace,
    /// Inside a single cluster (but not a particular namespace).
    Cluster,
    /// The multi-cluster overview landing page.
    Overview,
    /// The settings section.
    Settings,
}

/// The floating object inspector panel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPanel {
    /// Whether the panel is currently open.
    pub is_open: bool,
    /// The object kind, normalized to lowercase by [`RefreshContext::merge`].
    pub object_kind: Option<String>,
    /// The object's name.
    pub object_name: Option<String>,
    /// The object's namespace, if namespaced.
    pub object_namespace: Option<String>,
}

impl ObjectPanel {
    fn identity(&self) -> Option<(&str, &str, Option<&str>)> {
        if !self.is_open {
            return None;
        }
        Some((
            self.object_kind.as_deref()?,
            self.object_name.as_deref()?,
            self.object_namespace.as_deref(),
        ))
    }
}

/// A partial update to a [`RefreshContext`]; every field is independently optional so callers
/// only need to mention what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUpdate {
    /// New top-level view, if changing.
    pub current_view: Option<View>,
    /// New namespace-section sub-tab, if changing.
    pub active_namespace_view: Option<Option<String>>,
    /// New cluster-section sub-tab, if changing.
    pub active_cluster_view: Option<Option<String>>,
    /// New selected namespace, if changing.
    pub selected_namespace: Option<Option<String>>,
    /// New cluster id the selected namespace lives on, if changing.
    pub selected_namespace_cluster_id: Option<Option<String>>,
    /// New foreground cluster id, if changing.
    pub selected_cluster_id: Option<Option<String>>,
    /// New multi-cluster selection, if changing.
    pub selected_cluster_ids: Option<Vec<String>>,
    /// New object panel state, if changing.
    pub object_panel: Option<ObjectPanel>,
}

/// The full, merged refresh context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshContext {
    /// The active top-level UI section.
    pub current_view: Option<View>,
    /// The active namespace-section sub-tab.
    pub active_namespace_view: Option<String>,
    /// The active cluster-section sub-tab.
    pub active_cluster_view: Option<String>,
    /// The namespace the user is looking at, if any.
    pub selected_namespace: Option<String>,
    /// The cluster id that namespace belongs to.
    pub selected_namespace_cluster_id: Option<String>,
    /// The foreground cluster id.
    pub selected_cluster_id: Option<String>,
    /// An ordered set of clusters for multi-cluster fan-out.
    pub selected_cluster_ids: Vec<String>,
    /// The floating object inspector panel.
    pub object_panel: ObjectPanel,
}

/// The set of refreshers/domains that a context transition should trigger as manual refreshes,
/// together with the abort scope that transition demands (see §4.1 `updateContext`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextTransition {
    /// Refresher/domain names to trigger as manual refreshes.
    pub targets: Vec<String>,
    /// `true` if the namespace (or its cluster binding) changed: aborts ALL targets.
    pub namespace_changed: bool,
    /// `true` if the top-level view changed: aborts only namespace-prefixed targets.
    pub view_changed: bool,
}

impl RefreshContext {
    /// Merge a partial update into this context, returning the transition it implies.
    pub fn merge(&mut self, update: ContextUpdate) -> ContextTransition {
        let prev = self.clone();
        if let Some(view) = update.current_view {
            self.current_view = Some(view);
        }
        if let Some(v) = update.active_namespace_view {
            self.active_namespace_view = v;
        }
        if let Some(v) = update.active_cluster_view {
            self.active_cluster_view = v;
        }
        if let Some(v) = update.selected_namespace {
            self.selected_namespace = v;
        }
        if let Some(v) = update.selected_namespace_cluster_id {
            self.selected_namespace_cluster_id = v;
        }
        if let Some(v) = update.selected_cluster_id {
            self.selected_cluster_id = v;
        }
        if let Some(v) = update.selected_cluster_ids {
            self.selected_cluster_ids = v;
        }
        if let Some(v) = update.object_panel {
            self.object_panel = v;
        }

        let mut transition = ContextTransition::default();

        let namespace_changed = prev.selected_namespace != self.selected_namespace
            || prev.selected_namespace_cluster_id != self.selected_namespace_cluster_id;
        if namespace_changed && self.current_view == Some(View::Namespace) {
            if let Some(view) = &self.active_namespace_view {
                transition.targets.push(view.clone());
            }
        }

        let cluster_view_changed = prev.active_cluster_view != self.active_cluster_view;
        if cluster_view_changed && self.current_view == Some(View::Cluster) {
            if let Some(view) = &self.active_cluster_view {
                transition.targets.push(view.clone());
            }
        }

        let panel_identity_changed = prev.object_panel.identity() != self.object_panel.identity();
        if panel_identity_changed {
            if let Some((kind, _, _)) = self.object_panel.identity() {
                transition.targets.push(format!("object-{kind}"));
                transition.targets.push(format!("object-{kind}-events"));
            }
        }

        transition.namespace_changed = namespace_changed && self.current_view == Some(View::Namespace);
        transition.view_changed = prev.current_view != self.current_view;
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_change_targets_active_namespace_view() {
        let mut ctx = RefreshContext {
            current_view: Some(View::Namespace),
            active_namespace_view: Some("pods".into()),
            selected_namespace: Some("team-a".into()),
            ..Default::default()
        };
        // Re-merge a no-op update first to establish the baseline in `prev`.
        ctx.merge(ContextUpdate::default());
        let transition = ctx.merge(ContextUpdate {
            selected_namespace: Some(Some("team-b".into())),
            ..Default::default()
        });
        assert_eq!(transition.targets, vec!["pods".to_string()]);
        assert!(transition.namespace_changed);
    }

    #[test]
    fn object_panel_open_close_transition_targets_both_refreshers() {
        let mut ctx = RefreshContext::default();
        let transition = ctx.merge(ContextUpdate {
            object_panel: Some(ObjectPanel {
                is_open: true,
                object_kind: Some("Pod".into()),
                object_name: Some("web-0".into()),
                object_namespace: Some("team-a".into()),
            }),
            ..Default::default()
        });
        assert_eq!(
            transition.targets,
            vec!["object-Pod".to_string(), "object-Pod-events".to_string()]
        );
    }
}
