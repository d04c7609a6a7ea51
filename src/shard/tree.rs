use crate::codec::{NodePath, NormalizedNode, PathArgument, QName};
use crate::shard::payload::{Modification, ModificationBatch};
use std::sync::Arc;

pub const ROOT_NAMESPACE: &str = "urn:shard-raft:data";
pub const ROOT_LOCAL_NAME: &str = "data";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TreeError {
    #[error("Parent of {0} does not exist")]
    MissingParent(NodePath),
    #[error("Parent of {0} is a scalar node and cannot have children")]
    ScalarParent(NodePath),
    #[error("Node {node:?} cannot be stored at {path}")]
    IdentifierMismatch { path: NodePath, node: PathArgument },
    #[error("Node at {path} is invalid: {reason}")]
    InvalidNode { path: NodePath, reason: String },
}

/// DataTree is the shard's state. Readers get immutable snapshots of the root. A batch is applied
/// to a private copy and swapped in only if every modification in it succeeds.
#[derive(Clone, Debug)]
pub struct DataTree {
    root: Arc<NormalizedNode>,
}

/// An immutable view of the tree as of one point in the log.
#[derive(Clone, Debug, PartialEq)]
pub struct DataTreeSnapshot {
    root: Arc<NormalizedNode>,
}

impl DataTree {
    pub fn new() -> Self {
        DataTree {
            root: Arc::new(empty_root()),
        }
    }

    /// Builds a tree from a decoded root, e.g. one restored from a snapshot.
    pub fn from_root(root: NormalizedNode) -> Result<Self, TreeError> {
        check_node(&NodePath::root(), &root)?;
        Ok(DataTree { root: Arc::new(root) })
    }

    pub fn snapshot(&self) -> DataTreeSnapshot {
        DataTreeSnapshot {
            root: self.root.clone(),
        }
    }

    pub fn root(&self) -> &NormalizedNode {
        &self.root
    }

    pub fn apply(&mut self, batch: &ModificationBatch) -> Result<(), TreeError> {
        self.root = Arc::new(self.snapshot().prepare(batch)?);
        Ok(())
    }
}

impl Default for DataTree {
    fn default() -> Self {
        DataTree::new()
    }
}

impl DataTreeSnapshot {
    pub fn root(&self) -> &NormalizedNode {
        &self.root
    }

    pub fn read(&self, path: &NodePath) -> Option<&NormalizedNode> {
        self.root.find(path.arguments())
    }

    /// Returns the root that results from applying `batch` on top of this snapshot, leaving the
    /// snapshot untouched.
    pub fn prepare(&self, batch: &ModificationBatch) -> Result<NormalizedNode, TreeError> {
        let mut root = NormalizedNode::clone(&self.root);
        for modification in batch.modifications() {
            apply_modification(&mut root, modification)?;
        }
        Ok(root)
    }
}

fn empty_root() -> NormalizedNode {
    NormalizedNode::container(QName::new(ROOT_NAMESPACE, ROOT_LOCAL_NAME), Vec::new())
}

fn apply_modification(root: &mut NormalizedNode, modification: &Modification) -> Result<(), TreeError> {
    match modification {
        Modification::Write { path, data } => {
            check_node(path, data)?;
            match path.split_last() {
                None => *root = data.clone(),
                Some((parent, _)) => {
                    let siblings = children_of(root, path, parent)?;
                    upsert(siblings, data.clone());
                }
            }
        }
        Modification::Merge { path, data } => {
            check_node(path, data)?;
            match path.split_last() {
                None => merge_into(root, data),
                Some((parent, last)) => {
                    let siblings = children_of(root, path, parent)?;
                    match siblings.iter_mut().find(|c| &c.identifier() == last) {
                        Some(existing) => merge_into(existing, data),
                        None => siblings.push(data.clone()),
                    }
                }
            }
            check_node(path, root_or_child(root, path))?;
        }
        Modification::Delete { path } => match path.split_last() {
            None => *root = empty_root(),
            Some((parent, last)) => {
                // Deleting something that isn't there is fine.
                if let Some(parent) = find_mut(root, parent) {
                    if let Some(siblings) = parent.children_mut() {
                        siblings.retain(|c| &c.identifier() != last);
                    }
                }
            }
        },
    }
    Ok(())
}

fn check_node(path: &NodePath, node: &NormalizedNode) -> Result<(), TreeError> {
    if let Some((_, last)) = path.split_last() {
        let identifier = node.identifier();
        if &identifier != last {
            return Err(TreeError::IdentifierMismatch {
                path: path.clone(),
                node: identifier,
            });
        }
    }
    node.validate().map_err(|reason| TreeError::InvalidNode {
        path: path.clone(),
        reason,
    })
}

fn root_or_child<'a>(root: &'a NormalizedNode, path: &NodePath) -> &'a NormalizedNode {
    root.find(path.arguments()).unwrap_or(root)
}

fn children_of<'a>(
    root: &'a mut NormalizedNode,
    path: &NodePath,
    parent: &[PathArgument],
) -> Result<&'a mut Vec<NormalizedNode>, TreeError> {
    find_mut(root, parent)
        .ok_or_else(|| TreeError::MissingParent(path.clone()))?
        .children_mut()
        .ok_or_else(|| TreeError::ScalarParent(path.clone()))
}

fn find_mut<'a>(node: &'a mut NormalizedNode, path: &[PathArgument]) -> Option<&'a mut NormalizedNode> {
    let mut current = node;
    for argument in path {
        current = current
            .children_mut()?
            .iter_mut()
            .find(|c| &c.identifier() == argument)?;
    }
    Some(current)
}

fn upsert(siblings: &mut Vec<NormalizedNode>, node: NormalizedNode) {
    let identifier = node.identifier();
    match siblings.iter_mut().find(|c| c.identifier() == identifier) {
        Some(existing) => *existing = node,
        None => siblings.push(node),
    }
}

/// Scalars are replaced. Interior nodes keep children the update doesn't mention.
fn merge_into(existing: &mut NormalizedNode, update: &NormalizedNode) {
    if existing.kind() != update.kind() || existing.children_mut().is_none() {
        *existing = update.clone();
        return;
    }

    if let Some(children) = existing.children_mut() {
        for child in update.children() {
            let identifier = child.identifier();
            match children.iter_mut().find(|c| c.identifier() == identifier) {
                Some(current) => merge_into(current, child),
                None => children.push(child.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use std::collections::BTreeMap;

    fn qname(local: &str) -> QName {
        QName::new("urn:test", local)
    }

    fn person(name: &str, age: i32) -> NormalizedNode {
        let mut keys = BTreeMap::new();
        keys.insert(qname("name"), Value::from(name));
        NormalizedNode::map_entry(qname("person"), keys, vec![NormalizedNode::leaf(qname("age"), age)])
    }

    fn tree_with_people() -> DataTree {
        let mut tree = DataTree::new();
        // Map entries carry the map's name.
        let batch = ModificationBatch::new().write(
            NodePath::root().child(PathArgument::Node(qname("person"))),
            NormalizedNode::map(qname("person"), vec![]),
        );
        tree.apply(&batch).unwrap();
        tree
    }

    #[test]
    fn write_then_read() {
        let mut tree = DataTree::new();
        let path = NodePath::root().child(PathArgument::Node(qname("name")));
        let batch = ModificationBatch::new().write(path.clone(), NormalizedNode::leaf(qname("name"), "alpha"));

        tree.apply(&batch).unwrap();
        assert_eq!(
            tree.snapshot().read(&path).and_then(|n| n.value()),
            Some(&Value::from("alpha"))
        );
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let mut tree = DataTree::new();
        let path = NodePath::root().child(PathArgument::Node(qname("counter")));
        tree.apply(&ModificationBatch::new().write(path.clone(), NormalizedNode::leaf(qname("counter"), 1)))
            .unwrap();
        let before = tree.snapshot();

        tree.apply(&ModificationBatch::new().write(path.clone(), NormalizedNode::leaf(qname("counter"), 2)))
            .unwrap();

        assert_eq!(before.read(&path).and_then(|n| n.value()), Some(&Value::Int32(1)));
        assert_eq!(tree.snapshot().read(&path).and_then(|n| n.value()), Some(&Value::Int32(2)));
    }

    #[test]
    fn failed_batch_leaves_tree_untouched() {
        let mut tree = DataTree::new();
        let ok_path = NodePath::root().child(PathArgument::Node(qname("a")));
        let orphan = NodePath::root()
            .child(PathArgument::Node(qname("missing")))
            .child(PathArgument::Node(qname("b")));
        let batch = ModificationBatch::new()
            .write(ok_path.clone(), NormalizedNode::leaf(qname("a"), 1))
            .write(orphan.clone(), NormalizedNode::leaf(qname("b"), 2));

        assert_eq!(tree.apply(&batch), Err(TreeError::MissingParent(orphan)));
        assert!(tree.snapshot().read(&ok_path).is_none());
    }

    #[test]
    fn write_rejects_mismatched_identifier() {
        let mut tree = DataTree::new();
        let path = NodePath::root().child(PathArgument::Node(qname("a")));
        let batch = ModificationBatch::new().write(path, NormalizedNode::leaf(qname("b"), 1));

        assert!(matches!(tree.apply(&batch), Err(TreeError::IdentifierMismatch { .. })));
    }

    #[test]
    fn merge_keeps_unmentioned_children() {
        let mut tree = DataTree::new();
        let config = NodePath::root().child(PathArgument::Node(qname("config")));
        tree.apply(&ModificationBatch::new().write(
            config.clone(),
            NormalizedNode::container(
                qname("config"),
                vec![
                    NormalizedNode::leaf(qname("x"), 1),
                    NormalizedNode::leaf(qname("y"), 2),
                ],
            ),
        ))
        .unwrap();

        tree.apply(&ModificationBatch::new().merge(
            config.clone(),
            NormalizedNode::container(
                qname("config"),
                vec![
                    NormalizedNode::leaf(qname("y"), 20),
                    NormalizedNode::leaf(qname("z"), 30),
                ],
            ),
        ))
        .unwrap();

        let snapshot = tree.snapshot();
        let read = |name: &str| {
            snapshot
                .read(&config.child(PathArgument::Node(qname(name))))
                .and_then(|n| n.value())
                .cloned()
        };
        assert_eq!(read("x"), Some(Value::Int32(1)));
        assert_eq!(read("y"), Some(Value::Int32(20)));
        assert_eq!(read("z"), Some(Value::Int32(30)));
    }

    #[test]
    fn map_entries_are_addressed_by_predicates() {
        let mut tree = tree_with_people();
        let map_path = NodePath::root().child(PathArgument::Node(qname("person")));
        let mut keys = BTreeMap::new();
        keys.insert(qname("name"), Value::from("ann"));
        let entry_path = map_path.child(PathArgument::NodeWithPredicates(qname("person"), keys));

        tree.apply(&ModificationBatch::new().write(entry_path.clone(), person("ann", 30)))
            .unwrap();
        assert_eq!(tree.snapshot().read(&entry_path), Some(&person("ann", 30)));

        tree.apply(&ModificationBatch::new().delete(entry_path.clone())).unwrap();
        assert!(tree.snapshot().read(&entry_path).is_none());
        assert!(tree.snapshot().read(&map_path).is_some());
    }

    #[test]
    fn deleting_missing_node_is_a_no_op() {
        let mut tree = DataTree::new();
        let path = NodePath::root()
            .child(PathArgument::Node(qname("nothing")))
            .child(PathArgument::Node(qname("here")));

        tree.apply(&ModificationBatch::new().delete(path)).unwrap();
        assert_eq!(tree.root(), &empty_root());
    }
}
