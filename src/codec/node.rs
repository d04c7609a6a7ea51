use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

/// QName is a namespace-qualified node name. The optional revision pins the schema revision the
/// namespace was defined in.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QName {
    namespace: Arc<str>,
    revision: Option<Arc<str>>,
    local_name: Arc<str>,
}

impl QName {
    pub fn new(namespace: &str, local_name: &str) -> Self {
        QName {
            namespace: Arc::from(namespace),
            revision: None,
            local_name: Arc::from(local_name),
        }
    }

    pub fn with_revision(namespace: &str, revision: &str, local_name: &str) -> Self {
        QName {
            namespace: Arc::from(namespace),
            revision: Some(Arc::from(revision)),
            local_name: Arc::from(local_name),
        }
    }

    pub(crate) fn from_parts(namespace: Arc<str>, revision: Option<Arc<str>>, local_name: Arc<str>) -> Self {
        QName {
            namespace,
            revision,
            local_name,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Same namespace and revision, different local name.
    pub fn sibling(&self, local_name: &str) -> Self {
        QName {
            namespace: self.namespace.clone(),
            revision: self.revision.clone(),
            local_name: Arc::from(local_name),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(revision) => write!(f, "({}?revision={}){}", self.namespace, revision, self.local_name),
            None => write!(f, "({}){}", self.namespace, self.local_name),
        }
    }
}

impl fmt::Debug for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Leaf values.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    String(String),
    Binary(Vec<u8>),
    Bits(BTreeSet<String>),
    QName(QName),
    /// Kept in canonical string form to avoid precision loss.
    Decimal(String),
    /// Kept in canonical string form to avoid precision loss.
    BigInteger(String),
    Identifier(NodePath),
    Empty,
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Binary(bytes) => {
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Value::Bits(bits) => {
                let joined: Vec<&str> = bits.iter().map(String::as_str).collect();
                write!(f, "{}", joined.join(" "))
            }
            Value::QName(qname) => write!(f, "{}", qname),
            Value::Decimal(v) | Value::BigInteger(v) => write!(f, "{}", v),
            Value::Identifier(path) => write!(f, "{}", path),
            Value::Empty => Ok(()),
        }
    }
}

/// One step of a `NodePath`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathArgument {
    Node(QName),
    /// A list entry, addressed by its key leaves.
    NodeWithPredicates(QName, BTreeMap<QName, Value>),
    /// A leaf-set entry, addressed by its value.
    NodeWithValue(QName, Value),
    /// An augmentation, addressed by the names of the children it contributes.
    Augmentation(BTreeSet<QName>),
}

impl PathArgument {
    /// Name of the node addressed. Augmentations have none.
    pub fn node_type(&self) -> Option<&QName> {
        match self {
            PathArgument::Node(name)
            | PathArgument::NodeWithPredicates(name, _)
            | PathArgument::NodeWithValue(name, _) => Some(name),
            PathArgument::Augmentation(_) => None,
        }
    }
}

impl fmt::Display for PathArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathArgument::Node(name) => write!(f, "{}", name),
            PathArgument::NodeWithPredicates(name, keys) => {
                write!(f, "{}[{{", name)?;
                for (i, (key, value)) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", key, value)?;
                }
                write!(f, "}}]")
            }
            PathArgument::NodeWithValue(name, value) => write!(f, "{}[{}]", name, value),
            PathArgument::Augmentation(names) => {
                write!(f, "AugmentationIdentifier{{childNames=[")?;
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", name)?;
                }
                write!(f, "]}}")
            }
        }
    }
}

impl fmt::Debug for PathArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// NodePath addresses a node in the data tree, from the root. The empty path is the root.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(Vec<PathArgument>);

impl NodePath {
    pub fn root() -> Self {
        NodePath(Vec::new())
    }

    pub fn new(arguments: Vec<PathArgument>) -> Self {
        NodePath(arguments)
    }

    pub fn arguments(&self) -> &[PathArgument] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, argument: PathArgument) -> Self {
        let mut arguments = self.0.clone();
        arguments.push(argument);
        NodePath(arguments)
    }

    /// Splits into parent path and last argument. None for the root.
    pub fn split_last(&self) -> Option<(&[PathArgument], &PathArgument)> {
        self.0.split_last().map(|(last, parent)| (parent, last))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for argument in self.0.iter() {
            write!(f, "/{}", argument)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// NormalizedNode is a node of the shard's data tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizedNode {
    Leaf(QName, Value),
    LeafSet(QName, Vec<NormalizedNode>),
    LeafSetEntry(QName, Value),
    Container(QName, Vec<NormalizedNode>),
    UnkeyedList(QName, Vec<NormalizedNode>),
    UnkeyedListItem(QName, Vec<NormalizedNode>),
    Map(QName, Vec<NormalizedNode>),
    OrderedMap(QName, Vec<NormalizedNode>),
    MapEntry(QName, BTreeMap<QName, Value>, Vec<NormalizedNode>),
    Choice(QName, Vec<NormalizedNode>),
    Augmentation(BTreeSet<QName>, Vec<NormalizedNode>),
    AnyXml(QName, String),
}

impl NormalizedNode {
    pub fn leaf(name: QName, value: impl Into<Value>) -> Self {
        NormalizedNode::Leaf(name, value.into())
    }

    pub fn container(name: QName, children: Vec<NormalizedNode>) -> Self {
        NormalizedNode::Container(name, children)
    }

    pub fn map(name: QName, entries: Vec<NormalizedNode>) -> Self {
        NormalizedNode::Map(name, entries)
    }

    /// Builds a map entry, adding the key leaves to `children` if they're missing.
    pub fn map_entry(name: QName, keys: BTreeMap<QName, Value>, mut children: Vec<NormalizedNode>) -> Self {
        for (key, value) in keys.iter() {
            let present = children
                .iter()
                .any(|c| matches!(c, NormalizedNode::Leaf(n, _) if n == key));
            if !present {
                children.insert(0, NormalizedNode::Leaf(key.clone(), value.clone()));
            }
        }
        NormalizedNode::MapEntry(name, keys, children)
    }

    pub fn identifier(&self) -> PathArgument {
        match self {
            NormalizedNode::LeafSetEntry(name, value) => PathArgument::NodeWithValue(name.clone(), value.clone()),
            NormalizedNode::MapEntry(name, keys, _) => PathArgument::NodeWithPredicates(name.clone(), keys.clone()),
            NormalizedNode::Augmentation(names, _) => PathArgument::Augmentation(names.clone()),
            NormalizedNode::Leaf(name, _)
            | NormalizedNode::LeafSet(name, _)
            | NormalizedNode::Container(name, _)
            | NormalizedNode::UnkeyedList(name, _)
            | NormalizedNode::UnkeyedListItem(name, _)
            | NormalizedNode::Map(name, _)
            | NormalizedNode::OrderedMap(name, _)
            | NormalizedNode::Choice(name, _)
            | NormalizedNode::AnyXml(name, _) => PathArgument::Node(name.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedNode::Leaf(..) => "leaf",
            NormalizedNode::LeafSet(..) => "leaf-set",
            NormalizedNode::LeafSetEntry(..) => "leaf-set-entry",
            NormalizedNode::Container(..) => "container",
            NormalizedNode::UnkeyedList(..) => "unkeyed-list",
            NormalizedNode::UnkeyedListItem(..) => "unkeyed-list-item",
            NormalizedNode::Map(..) => "map",
            NormalizedNode::OrderedMap(..) => "ordered-map",
            NormalizedNode::MapEntry(..) => "map-entry",
            NormalizedNode::Choice(..) => "choice",
            NormalizedNode::Augmentation(..) => "augmentation",
            NormalizedNode::AnyXml(..) => "anyxml",
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            NormalizedNode::Leaf(_, value) | NormalizedNode::LeafSetEntry(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn children(&self) -> &[NormalizedNode] {
        match self {
            NormalizedNode::LeafSet(_, children)
            | NormalizedNode::Container(_, children)
            | NormalizedNode::UnkeyedList(_, children)
            | NormalizedNode::UnkeyedListItem(_, children)
            | NormalizedNode::Map(_, children)
            | NormalizedNode::OrderedMap(_, children)
            | NormalizedNode::MapEntry(_, _, children)
            | NormalizedNode::Choice(_, children)
            | NormalizedNode::Augmentation(_, children) => children,
            NormalizedNode::Leaf(..) | NormalizedNode::LeafSetEntry(..) | NormalizedNode::AnyXml(..) => &[],
        }
    }

    /// None for scalar nodes.
    pub fn children_mut(&mut self) -> Option<&mut Vec<NormalizedNode>> {
        match self {
            NormalizedNode::LeafSet(_, children)
            | NormalizedNode::Container(_, children)
            | NormalizedNode::UnkeyedList(_, children)
            | NormalizedNode::UnkeyedListItem(_, children)
            | NormalizedNode::Map(_, children)
            | NormalizedNode::OrderedMap(_, children)
            | NormalizedNode::MapEntry(_, _, children)
            | NormalizedNode::Choice(_, children)
            | NormalizedNode::Augmentation(_, children) => Some(children),
            NormalizedNode::Leaf(..) | NormalizedNode::LeafSetEntry(..) | NormalizedNode::AnyXml(..) => None,
        }
    }

    pub fn child(&self, argument: &PathArgument) -> Option<&NormalizedNode> {
        self.children().iter().find(|c| &c.identifier() == argument)
    }

    pub fn find(&self, path: &[PathArgument]) -> Option<&NormalizedNode> {
        let mut current = self;
        for argument in path {
            current = current.child(argument)?;
        }
        Some(current)
    }

    /// Checks sibling uniqueness and map-entry key consistency for the whole subtree.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            NormalizedNode::MapEntry(name, keys, children) => {
                for (key, value) in keys.iter() {
                    let matches_leaf = children
                        .iter()
                        .any(|c| matches!(c, NormalizedNode::Leaf(n, v) if n == key && v == value));
                    if !matches_leaf {
                        return Err(format!("Map entry {} has no leaf matching key {}={}", name, key, value));
                    }
                }
            }
            NormalizedNode::Map(name, entries) | NormalizedNode::OrderedMap(name, entries) => {
                let mut key_set: Option<BTreeSet<&QName>> = None;
                for entry in entries {
                    match entry {
                        NormalizedNode::MapEntry(entry_name, keys, _) if entry_name == name => {
                            let names: BTreeSet<&QName> = keys.keys().collect();
                            match &key_set {
                                None => key_set = Some(names),
                                Some(expected) if expected != &names => {
                                    return Err(format!("Entries of map {} use different key leaves", name));
                                }
                                Some(_) => {}
                            }
                        }
                        other => {
                            return Err(format!("Map {} holds a {} named {:?}", name, other.kind(), other.identifier()))
                        }
                    }
                }
            }
            NormalizedNode::LeafSet(name, entries) => {
                if let Some(bad) = entries
                    .iter()
                    .find(|e| !matches!(e, NormalizedNode::LeafSetEntry(n, _) if n == name))
                {
                    return Err(format!("Leaf-set {} holds a {}", name, bad.kind()));
                }
            }
            NormalizedNode::UnkeyedList(name, items) => {
                if let Some(bad) = items
                    .iter()
                    .find(|e| !matches!(e, NormalizedNode::UnkeyedListItem(n, _) if n == name))
                {
                    return Err(format!("Unkeyed list {} holds a {}", name, bad.kind()));
                }
            }
            _ => {}
        }

        // Unkeyed list items share one identifier; everything else must be unique.
        if !matches!(self, NormalizedNode::UnkeyedList(..)) {
            let mut seen = HashSet::with_capacity(self.children().len());
            for child in self.children() {
                if !seen.insert(child.identifier()) {
                    return Err(format!("Duplicate child {:?} under {:?}", child.identifier(), self.identifier()));
                }
            }
        }

        for child in self.children() {
            child.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qname(local: &str) -> QName {
        QName::with_revision("urn:test:inventory", "2013-08-19", local)
    }

    #[test]
    fn map_entry_builder_adds_key_leaves() {
        let mut keys = BTreeMap::new();
        keys.insert(qname("id"), Value::from("node-1"));
        let entry = NormalizedNode::map_entry(qname("node"), keys, vec![]);

        assert_eq!(
            entry.child(&PathArgument::Node(qname("id"))),
            Some(&NormalizedNode::leaf(qname("id"), "node-1"))
        );
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_siblings() {
        let node = NormalizedNode::container(
            qname("nodes"),
            vec![
                NormalizedNode::leaf(qname("a"), 1i64),
                NormalizedNode::leaf(qname("a"), 2i64),
            ],
        );
        assert!(node.validate().is_err());
    }

    #[test]
    fn validate_rejects_key_mismatch() {
        let mut keys = BTreeMap::new();
        keys.insert(qname("id"), Value::from("node-1"));
        let entry = NormalizedNode::MapEntry(
            qname("node"),
            keys,
            vec![NormalizedNode::leaf(qname("id"), "node-2")],
        );
        assert!(entry.validate().is_err());
    }

    #[test]
    fn validate_rejects_mixed_key_sets() {
        let mut keys_a = BTreeMap::new();
        keys_a.insert(qname("id"), Value::from("a"));
        let mut keys_b = BTreeMap::new();
        keys_b.insert(qname("name"), Value::from("b"));

        let map = NormalizedNode::map(
            qname("node"),
            vec![
                NormalizedNode::map_entry(qname("node"), keys_a, vec![]),
                NormalizedNode::map_entry(qname("node"), keys_b, vec![]),
            ],
        );
        assert!(map.validate().is_err());
    }

    #[test]
    fn path_display() {
        let mut keys = BTreeMap::new();
        keys.insert(qname("id"), Value::from("node-1"));
        let path = NodePath::new(vec![
            PathArgument::Node(qname("nodes")),
            PathArgument::NodeWithPredicates(qname("node"), keys),
        ]);

        assert_eq!(
            path.to_string(),
            "/(urn:test:inventory?revision=2013-08-19)nodes\
             /(urn:test:inventory?revision=2013-08-19)node[{(urn:test:inventory?revision=2013-08-19)id=node-1}]"
        );
    }
}
