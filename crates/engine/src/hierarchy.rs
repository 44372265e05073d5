//! Self-referential trees (classifications, locations, departments) kept as
//! flat rows: a parent id plus a materialized path computed once from the
//! parent's own path. Trees are rebuilt from the flat rows on demand.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use db::repository::directory::Hierarchy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    /// `/<root-id>/<child-id>/…/<id>/`
    pub path: String,
}

impl HierarchyNode {
    pub fn root(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            parent_id: None,
            name: name.into(),
            path: materialized_path(None, id),
        }
    }

    pub fn child_of(parent: &HierarchyNode, name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            parent_id: Some(parent.id),
            name: name.into(),
            path: materialized_path(Some(&parent.path), id),
        }
    }

    /// True for the node itself and every descendant of `ancestor`.
    pub fn is_within(&self, ancestor: &HierarchyNode) -> bool {
        self.path.starts_with(&ancestor.path)
    }

    pub fn depth(&self) -> usize {
        self.path.split('/').filter(|s| !s.is_empty()).count()
    }
}

pub fn materialized_path(parent_path: Option<&str>, id: Uuid) -> String {
    match parent_path {
        Some(parent) => format!("{parent}{id}/"),
        None => format!("/{id}/"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub node: HierarchyNode,
    pub children: Vec<TreeNode>,
}

/// Rebuild the forest from flat rows, descending at most `max_depth` levels.
///
/// Rows whose parent is missing from `rows` are treated as roots. Siblings
/// keep the order they have in `rows`.
pub fn build_tree(rows: &[HierarchyNode], max_depth: usize) -> Vec<TreeNode> {
    let ids: std::collections::HashSet<Uuid> = rows.iter().map(|r| r.id).collect();
    let mut by_parent: HashMap<Option<Uuid>, Vec<&HierarchyNode>> = HashMap::new();
    for row in rows {
        let parent = row.parent_id.filter(|p| ids.contains(p));
        by_parent.entry(parent).or_default().push(row);
    }

    fn attach(
        parent: Option<Uuid>,
        by_parent: &HashMap<Option<Uuid>, Vec<&HierarchyNode>>,
        depth: usize,
        max_depth: usize,
    ) -> Vec<TreeNode> {
        if depth >= max_depth {
            return Vec::new();
        }
        by_parent
            .get(&parent)
            .map(|children| {
                children
                    .iter()
                    .map(|node| TreeNode {
                        node: (*node).clone(),
                        children: attach(Some(node.id), by_parent, depth + 1, max_depth),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    attach(None, &by_parent, 0, max_depth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_path_extends_parent_path() {
        let network = HierarchyNode::root("Network");
        let wifi = HierarchyNode::child_of(&network, "WiFi");

        assert_eq!(network.path, format!("/{}/", network.id));
        assert_eq!(wifi.path, format!("/{}/{}/", network.id, wifi.id));
        assert_eq!(wifi.depth(), 2);
        assert!(wifi.is_within(&network));
        assert!(!network.is_within(&wifi));
    }

    #[test]
    fn tree_is_rebuilt_from_flat_rows() {
        let root = HierarchyNode::root("Facilities");
        let hvac = HierarchyNode::child_of(&root, "HVAC");
        let filters = HierarchyNode::child_of(&hvac, "Filters");
        let other = HierarchyNode::root("IT");

        let rows = vec![filters.clone(), root.clone(), hvac.clone(), other.clone()];
        let forest = build_tree(&rows, 10);

        assert_eq!(forest.len(), 2);
        let facilities = forest.iter().find(|t| t.node.id == root.id).unwrap();
        assert_eq!(facilities.children.len(), 1);
        assert_eq!(facilities.children[0].node.id, hvac.id);
        assert_eq!(facilities.children[0].children[0].node.id, filters.id);
    }

    #[test]
    fn tree_depth_is_bounded() {
        let root = HierarchyNode::root("a");
        let b = HierarchyNode::child_of(&root, "b");
        let c = HierarchyNode::child_of(&b, "c");

        let forest = build_tree(&[root, b, c], 2);
        assert_eq!(forest[0].children.len(), 1);
        assert!(forest[0].children[0].children.is_empty());
    }
}
