use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HierarchyError, Result};

/// Identifier of a category in the hierarchy source.
pub type NodeId = String;

/// One row of the hierarchy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: NodeId,
    /// `None` only for the root
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub name: Option<String>,
}

impl CategoryNode {
    pub fn root(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: None,
        }
    }

    pub fn child(id: impl Into<NodeId>, parent_id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent_id.into()),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A parent -> child relationship. Serialized as a `[parent, child]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(NodeId, NodeId)", into = "(NodeId, NodeId)")]
pub struct Edge {
    pub parent: NodeId,
    pub child: NodeId,
}

impl Edge {
    pub fn new(parent: impl Into<NodeId>, child: impl Into<NodeId>) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
        }
    }
}

impl From<(NodeId, NodeId)> for Edge {
    fn from((parent, child): (NodeId, NodeId)) -> Self {
        Self { parent, child }
    }
}

impl From<Edge> for (NodeId, NodeId) {
    fn from(edge: Edge) -> Self {
        (edge.parent, edge.child)
    }
}

/// An immutable category tree.
///
/// Nodes are stored in an arena keyed by id. Each node only knows its parent's id;
/// child lists are derived once at construction and kept sorted so every traversal
/// (and therefore every label index and mask column) is deterministic.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: HashMap<NodeId, CategoryNode>,
    children: HashMap<NodeId, Vec<NodeId>>,
    root: NodeId,
}

impl Tree {
    /// Loads a hierarchy from a delimited file with an `id,parent_id[,name]` header.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading hierarchy from {:?}", path);
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    /// Loads a hierarchy from CSV rows. An empty `parent_id` marks the root.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        for required in ["id", "parent_id"] {
            if !headers.iter().any(|h| h == required) {
                return Err(HierarchyError::MalformedHierarchy(format!(
                    "Missing required column '{}'",
                    required
                )));
            }
        }

        let mut rows = Vec::new();
        for row in rdr.deserialize::<CategoryNode>() {
            rows.push(row?);
        }
        Self::from_nodes(rows)
    }

    /// Builds the tree, validating that exactly one root exists, every parent
    /// reference resolves and every node is reachable from the root.
    pub fn from_nodes(rows: impl IntoIterator<Item = CategoryNode>) -> Result<Self> {
        let mut nodes: HashMap<NodeId, CategoryNode> = HashMap::new();
        let mut roots = Vec::new();

        for mut node in rows {
            if node.id.trim().is_empty() {
                return Err(HierarchyError::MalformedHierarchy(
                    "Node with empty id".to_string(),
                ));
            }
            if node.parent_id.as_deref().map_or(false, |p| p.trim().is_empty()) {
                node.parent_id = None;
            }
            if node.parent_id.is_none() {
                roots.push(node.id.clone());
            }
            if nodes.contains_key(&node.id) {
                return Err(HierarchyError::MalformedHierarchy(format!(
                    "Duplicate node id '{}'",
                    node.id
                )));
            }
            nodes.insert(node.id.clone(), node);
        }

        let root = match roots.len() {
            1 => roots.remove(0),
            0 => {
                return Err(HierarchyError::MalformedHierarchy(
                    "No root node (row with empty parent_id) found".to_string(),
                ))
            }
            _ => {
                roots.sort();
                return Err(HierarchyError::MalformedHierarchy(format!(
                    "Expected exactly one root, found {}: {}",
                    roots.len(),
                    roots.join(", ")
                )));
            }
        };

        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in nodes.values() {
            if let Some(parent) = &node.parent_id {
                if !nodes.contains_key(parent) {
                    return Err(HierarchyError::MalformedHierarchy(format!(
                        "Node '{}' references missing parent '{}'",
                        node.id, parent
                    )));
                }
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }
        for list in children.values_mut() {
            list.sort();
        }

        let tree = Self {
            nodes,
            children,
            root,
        };
        tree.check_reachable()?;

        debug!(
            "Hierarchy loaded: {} nodes, {} leaves, root '{}'",
            tree.len(),
            tree.leaf_count(),
            tree.root
        );
        Ok(tree)
    }

    /// With a single root and resolvable parents, any node the root cannot reach
    /// must sit on a parent cycle.
    fn check_reachable(&self) -> Result<()> {
        let reached: HashSet<&str> = self.bfs_order_refs().into_iter().collect();
        if reached.len() == self.nodes.len() {
            return Ok(());
        }
        let mut detached: Vec<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| !reached.contains(id))
            .collect();
        detached.sort_unstable();
        Err(HierarchyError::CyclicHierarchy(format!(
            "Nodes not reachable from root '{}': {}",
            self.root,
            detached.join(", ")
        )))
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Result<&CategoryNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| HierarchyError::UnknownNode(id.to_string()))
    }

    pub fn parent(&self, id: &str) -> Result<Option<&str>> {
        Ok(self.node(id)?.parent_id.as_deref())
    }

    /// Children sorted by id. Empty for a leaf.
    pub fn children(&self, id: &str) -> Result<&[NodeId]> {
        self.node(id)?;
        Ok(self.children_unchecked(id))
    }

    fn children_unchecked(&self, id: &str) -> &[NodeId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_leaf(&self, id: &str) -> Result<bool> {
        Ok(self.children(id)?.is_empty())
    }

    /// Children that have children of their own, i.e. subtrees that still need models.
    pub fn non_leaf_children(&self, id: &str) -> Result<Vec<NodeId>> {
        Ok(self
            .children(id)?
            .iter()
            .filter(|child| !self.children_unchecked(child).is_empty())
            .cloned()
            .collect())
    }

    /// All leaves under `id`, sorted. A leaf is its own only descendant.
    pub fn leaf_descendants(&self, id: &str) -> Result<Vec<NodeId>> {
        self.node(id)?;
        let mut leaves = Vec::new();
        self.collect_leaves(id, 0, &mut leaves)?;
        leaves.sort();
        Ok(leaves)
    }

    fn collect_leaves(&self, id: &str, depth: usize, out: &mut Vec<NodeId>) -> Result<()> {
        if depth > self.nodes.len() {
            return Err(HierarchyError::CyclicHierarchy(format!(
                "Descent below '{}' exceeded {} levels",
                id,
                self.nodes.len()
            )));
        }
        let children = self.children_unchecked(id);
        if children.is_empty() {
            out.push(id.to_string());
            return Ok(());
        }
        for child in children {
            self.collect_leaves(child, depth + 1, out)?;
        }
        Ok(())
    }

    fn bfs_order_refs(&self) -> Vec<&str> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.root.as_str()]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            order.push(node);
            queue.extend(self.children_unchecked(node).iter().map(String::as_str));
        }
        order
    }

    /// Every node in breadth-first order from the root, siblings sorted.
    pub fn bfs_order(&self) -> Vec<NodeId> {
        self.bfs_order_refs().into_iter().map(str::to_string).collect()
    }

    /// Every edge in breadth-first discovery order. The position of an edge in this
    /// list is its mask column.
    pub fn edges(&self) -> Vec<Edge> {
        self.bfs_order_refs()
            .into_iter()
            .flat_map(|parent| {
                self.children_unchecked(parent)
                    .iter()
                    .map(move |child| Edge::new(parent, child.as_str()))
            })
            .collect()
    }

    /// Leaves in breadth-first discovery order (the mask row order).
    pub fn leaves(&self) -> Vec<NodeId> {
        self.bfs_order_refs()
            .into_iter()
            .filter(|id| self.children_unchecked(id).is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Nodes with at least one child, in breadth-first order.
    pub fn internal_nodes(&self) -> Vec<NodeId> {
        self.bfs_order_refs()
            .into_iter()
            .filter(|id| !self.children_unchecked(id).is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes
            .keys()
            .filter(|id| self.children_unchecked(id).is_empty())
            .count()
    }

    /// Human readable name, falling back to the id.
    pub fn display_name(&self, id: &str) -> Result<&str> {
        let node = self.node(id)?;
        Ok(node.name.as_deref().unwrap_or(&node.id))
    }

    /// SHA-256 over the sorted `(id, parent)` rows. Independent of source row order
    /// and display names.
    pub fn fingerprint(&self) -> String {
        let mut rows: Vec<(&str, &str)> = self
            .nodes
            .values()
            .map(|n| (n.id.as_str(), n.parent_id.as_deref().unwrap_or("")))
            .collect();
        rows.sort_unstable();

        let mut hasher = Sha256::new();
        for (id, parent) in rows {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
            hasher.update(parent.as_bytes());
            hasher.update([b'\n']);
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCTS: &str = "\
id,parent_id,name
products,,All products
clothing,products,Clothing
shoes,clothing,Shoes
shirts,clothing,Shirts
electronics,products,Electronics
phones,electronics,
laptops,electronics,Laptops
gift_cards,products,Gift cards
";

    fn products() -> Tree {
        Tree::from_reader(PRODUCTS.as_bytes()).unwrap()
    }

    #[test]
    fn test_load_and_basic_queries() {
        let tree = products();
        assert_eq!(tree.root(), "products");
        assert_eq!(tree.len(), 8);
        assert_eq!(tree.parent("shoes").unwrap(), Some("clothing"));
        assert_eq!(tree.parent("products").unwrap(), None);
        assert_eq!(
            tree.children("products").unwrap(),
            &["clothing", "electronics", "gift_cards"]
        );
        assert!(tree.is_leaf("gift_cards").unwrap());
        assert!(!tree.is_leaf("clothing").unwrap());
        assert_eq!(tree.display_name("laptops").unwrap(), "Laptops");
        assert_eq!(tree.display_name("phones").unwrap(), "phones");
    }

    #[test]
    fn test_unknown_node() {
        let tree = products();
        assert!(matches!(
            tree.parent("furniture"),
            Err(HierarchyError::UnknownNode(id)) if id == "furniture"
        ));
        assert!(tree.children("furniture").is_err());
    }

    #[test]
    fn test_non_leaf_children() {
        let tree = products();
        assert_eq!(
            tree.non_leaf_children("products").unwrap(),
            vec!["clothing", "electronics"]
        );
        assert!(tree.non_leaf_children("shoes").unwrap().is_empty());
    }

    #[test]
    fn test_leaf_descendants() {
        let tree = products();
        let leaves = tree.leaf_descendants("products").unwrap();
        assert_eq!(
            leaves,
            vec!["gift_cards", "laptops", "phones", "shirts", "shoes"]
        );
        assert_eq!(leaves.len(), tree.leaf_count());
        assert_eq!(tree.leaf_descendants("phones").unwrap(), vec!["phones"]);
    }

    #[test]
    fn test_bfs_edges_and_leaves() {
        let tree = products();
        let edges = tree.edges();
        assert_eq!(edges.len(), tree.len() - 1);
        assert_eq!(edges[0], Edge::new("products", "clothing"));
        assert_eq!(edges[2], Edge::new("products", "gift_cards"));
        assert_eq!(edges[3], Edge::new("clothing", "shirts"));
        assert_eq!(edges[6], Edge::new("electronics", "phones"));
        assert_eq!(
            tree.leaves(),
            vec!["gift_cards", "shirts", "shoes", "laptops", "phones"]
        );
        assert_eq!(
            tree.internal_nodes(),
            vec!["products", "clothing", "electronics"]
        );
    }

    #[test]
    fn test_two_roots_is_malformed() {
        let csv = "id,parent_id\na,\nb,\nc,a\n";
        let err = Tree::from_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, HierarchyError::MalformedHierarchy(msg) if msg.contains("a, b")));
    }

    #[test]
    fn test_no_root_is_malformed() {
        let rows = vec![CategoryNode::child("a", "b"), CategoryNode::child("b", "a")];
        assert!(matches!(
            Tree::from_nodes(rows),
            Err(HierarchyError::MalformedHierarchy(_))
        ));
    }

    #[test]
    fn test_missing_parent_is_malformed() {
        let csv = "id,parent_id\nroot,\nx,root\ny,ghost\n";
        let err = Tree::from_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, HierarchyError::MalformedHierarchy(msg) if msg.contains("ghost")));
    }

    #[test]
    fn test_duplicate_id_is_malformed() {
        let rows = vec![
            CategoryNode::root("root"),
            CategoryNode::child("x", "root"),
            CategoryNode::child("x", "root"),
        ];
        assert!(matches!(
            Tree::from_nodes(rows),
            Err(HierarchyError::MalformedHierarchy(_))
        ));
    }

    #[test]
    fn test_missing_column_is_malformed() {
        let csv = "id,name\nroot,Root\n";
        assert!(matches!(
            Tree::from_reader(csv.as_bytes()),
            Err(HierarchyError::MalformedHierarchy(_))
        ));
    }

    #[test]
    fn test_detached_cycle_is_rejected() {
        let rows = vec![
            CategoryNode::root("root"),
            CategoryNode::child("leaf", "root"),
            CategoryNode::child("a", "b"),
            CategoryNode::child("b", "a"),
        ];
        let err = Tree::from_nodes(rows).unwrap_err();
        assert!(matches!(err, HierarchyError::CyclicHierarchy(msg) if msg.contains("a, b")));
    }

    #[test]
    fn test_fingerprint_ignores_row_order_and_names() {
        let shuffled = "\
id,parent_id,name
gift_cards,products,
laptops,electronics,
phones,electronics,Phones
electronics,products,
shirts,clothing,
shoes,clothing,
clothing,products,
products,,
";
        let other = Tree::from_reader(shuffled.as_bytes()).unwrap();
        assert_eq!(products().fingerprint(), other.fingerprint());

        let changed = Tree::from_nodes(vec![
            CategoryNode::root("products"),
            CategoryNode::child("clothing", "products"),
        ])
        .unwrap();
        assert_ne!(products().fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_single_node_tree() {
        let tree = Tree::from_nodes(vec![CategoryNode::root("only")]).unwrap();
        assert!(tree.is_leaf("only").unwrap());
        assert!(tree.edges().is_empty());
        assert_eq!(tree.leaves(), vec!["only"]);
        assert_eq!(tree.leaf_descendants("only").unwrap(), vec!["only"]);
    }
}
