use crate::codec::node::{NodePath, PathArgument, QName, Value};
use crate::codec::CodecError;
use lru::LruCache;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const AUGMENTATION_PREFIX: &str = "AugmentationIdentifier{childNames=[";
const AUGMENTATION_SUFFIX: &str = "]}";

/// QNameCache interns QNames by their textual form so repeated parses share one allocation.
/// Holds at most `capacity` names, evicting the least recently used.
pub struct QNameCache {
    interned: Mutex<LruCache<String, QName>>,
}

impl QNameCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        QNameCache {
            interned: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Parses `(namespace[?revision=rev])localName`.
    pub fn parse(&self, text: &str) -> Result<QName, CodecError> {
        let mut interned = self.interned.lock().expect("QNameCache mutex guard poison");
        if let Some(qname) = interned.get(text) {
            return Ok(qname.clone());
        }

        let qname = parse_qname(text)?;
        interned.put(text.to_string(), qname.clone());
        Ok(qname)
    }

    pub fn len(&self) -> usize {
        self.interned.lock().expect("QNameCache mutex guard poison").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_qname(text: &str) -> Result<QName, CodecError> {
    if !text.starts_with('(') {
        return Err(malformed(text, "QName must start with '('"));
    }
    let close = text
        .find(')')
        .ok_or_else(|| malformed(text, "QName namespace is not closed"))?;
    let module = &text[1..close];
    let local_name = &text[close + 1..];
    if local_name.is_empty() {
        return Err(malformed(text, "QName has no local name"));
    }

    match module.find("?revision=") {
        Some(at) => Ok(QName::with_revision(
            &module[..at],
            &module[at + "?revision=".len()..],
            local_name,
        )),
        None => Ok(QName::new(module, local_name)),
    }
}

fn malformed(input: &str, reason: &str) -> CodecError {
    CodecError::MalformedPath {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

/// PathCodec converts node paths to and from their textual form. Parsed path arguments are kept
/// in a bounded LRU cache owned by the codec.
pub struct PathCodec {
    qnames: Arc<QNameCache>,
    identifiers: Mutex<LruCache<String, PathArgument>>,
}

impl PathCodec {
    pub fn new(qnames: Arc<QNameCache>, identifier_cache_size: NonZeroUsize) -> Self {
        PathCodec {
            qnames,
            identifiers: Mutex::new(LruCache::new(identifier_cache_size)),
        }
    }

    pub fn format_path(&self, path: &NodePath) -> String {
        path.to_string()
    }

    pub fn parse_path(&self, text: &str) -> Result<NodePath, CodecError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Ok(NodePath::root());
        }

        let mut arguments = Vec::new();
        for segment in split_top_level(trimmed, '/') {
            if segment.is_empty() {
                continue;
            }
            arguments.push(self.parse_argument(segment)?);
        }
        Ok(NodePath::new(arguments))
    }

    pub fn cached_identifiers(&self) -> usize {
        self.identifiers.lock().expect("PathCodec mutex guard poison").len()
    }

    fn parse_argument(&self, text: &str) -> Result<PathArgument, CodecError> {
        {
            let mut identifiers = self.identifiers.lock().expect("PathCodec mutex guard poison");
            if let Some(argument) = identifiers.get(text) {
                return Ok(argument.clone());
            }
        }

        let argument = self.parse_argument_uncached(text)?;
        self.identifiers
            .lock()
            .expect("PathCodec mutex guard poison")
            .put(text.to_string(), argument.clone());
        Ok(argument)
    }

    fn parse_argument_uncached(&self, text: &str) -> Result<PathArgument, CodecError> {
        if let Some(inner) = text.strip_prefix(AUGMENTATION_PREFIX) {
            let inner = inner
                .strip_suffix(AUGMENTATION_SUFFIX)
                .ok_or_else(|| malformed(text, "Augmentation identifier is not closed"))?;
            let mut names = BTreeSet::new();
            for name in split_top_level(inner, ',') {
                let name = name.trim();
                if !name.is_empty() {
                    names.insert(self.qnames.parse(name)?);
                }
            }
            return Ok(PathArgument::Augmentation(names));
        }

        let close = text
            .find(')')
            .ok_or_else(|| malformed(text, "QName namespace is not closed"))?;
        let (qname_text, rest) = match text[close..].find('[') {
            Some(open) => text.split_at(close + open),
            None => (text, ""),
        };
        let qname = self.qnames.parse(qname_text)?;

        if rest.is_empty() {
            return Ok(PathArgument::Node(qname));
        }

        if let Some(predicates) = rest.strip_prefix("[{").and_then(|r| r.strip_suffix("}]")) {
            let mut keys = BTreeMap::new();
            for predicate in split_top_level(predicates, ',') {
                let predicate = predicate.trim();
                if predicate.is_empty() {
                    continue;
                }
                let key_close = predicate
                    .find(')')
                    .ok_or_else(|| malformed(text, "Predicate key is not a QName"))?;
                let eq = predicate[key_close..]
                    .find('=')
                    .map(|at| key_close + at)
                    .ok_or_else(|| malformed(text, "Predicate has no '='"))?;
                let key = self.qnames.parse(&predicate[..eq])?;
                keys.insert(key, Value::String(predicate[eq + 1..].to_string()));
            }
            return Ok(PathArgument::NodeWithPredicates(qname, keys));
        }

        if let Some(value) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            return Ok(PathArgument::NodeWithValue(qname, Value::String(value.to_string())));
        }

        Err(malformed(text, "Unrecognized path argument suffix"))
    }
}

/// Splits on `separator` only where it is not nested inside `()`, `[]` or `{}`.
fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth: usize = 0;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "urn:opendaylight:inventory";

    fn codec() -> PathCodec {
        PathCodec::new(Arc::new(QNameCache::new(NonZeroUsize::new(16).unwrap())), NonZeroUsize::new(4).unwrap())
    }

    #[test]
    fn parses_and_formats_all_argument_forms() {
        let codec = codec();
        let text = format!(
            "/({ns}?revision=2013-08-19)nodes\
             /({ns}?revision=2013-08-19)node[{{({ns}?revision=2013-08-19)id=openflow:1}}]\
             /({ns})tags[edge/core]\
             /AugmentationIdentifier{{childNames=[(urn:flow)a, (urn:flow)b]}}",
            ns = NS
        );

        let path = codec.parse_path(&text).unwrap();
        let args = path.arguments();
        assert_eq!(args.len(), 4);

        let nodes = QName::with_revision(NS, "2013-08-19", "nodes");
        assert_eq!(args[0], PathArgument::Node(nodes.clone()));

        let mut keys = BTreeMap::new();
        keys.insert(nodes.sibling("id"), Value::from("openflow:1"));
        assert_eq!(args[1], PathArgument::NodeWithPredicates(nodes.sibling("node"), keys));

        assert_eq!(
            args[2],
            PathArgument::NodeWithValue(QName::new(NS, "tags"), Value::from("edge/core"))
        );

        let mut names = BTreeSet::new();
        names.insert(QName::new("urn:flow", "a"));
        names.insert(QName::new("urn:flow", "b"));
        assert_eq!(args[3], PathArgument::Augmentation(names));

        assert_eq!(codec.format_path(&path), text);
    }

    #[test]
    fn namespace_slashes_are_not_separators() {
        let codec = codec();
        let path = codec.parse_path("/(http://example.com/ns/a)top/(http://example.com/ns/a)leaf").unwrap();
        assert_eq!(path.arguments().len(), 2);
        assert_eq!(
            path.arguments()[1],
            PathArgument::Node(QName::new("http://example.com/ns/a", "leaf"))
        );
    }

    #[test]
    fn root_path() {
        let codec = codec();
        assert!(codec.parse_path("/").unwrap().is_root());
        assert_eq!(codec.format_path(&NodePath::root()), "/");
    }

    #[test]
    fn caches_are_bounded_and_shared() {
        let qnames = Arc::new(QNameCache::new(NonZeroUsize::new(3).unwrap()));
        let codec = PathCodec::new(qnames.clone(), NonZeroUsize::new(2).unwrap());

        for i in 0..5 {
            codec.parse_path(&format!("/(urn:a)n{}", i)).unwrap();
        }
        assert_eq!(codec.cached_identifiers(), 2);
        assert_eq!(qnames.len(), 3);

        // Repeated parse hits the caches and yields the same value.
        let first = codec.parse_path("/(urn:a)n4").unwrap();
        let second = codec.parse_path("/(urn:a)n4").unwrap();
        assert_eq!(first, second);
        assert_eq!(qnames.len(), 3);

        // An evicted name parses again to an equal value.
        assert_eq!(qnames.parse("(urn:a)n0").unwrap(), QName::new("urn:a", "n0"));
        assert_eq!(qnames.len(), 3);
    }

    #[test]
    fn rejects_malformed_input() {
        let codec = codec();
        for bad in &["/nodes", "/(urn:a", "/(urn:a)", "/(urn:a)x[{(urn:a)k}]", "/(urn:a)x[y"] {
            match codec.parse_path(bad) {
                Err(CodecError::MalformedPath { .. }) => {}
                other => panic!("Expected MalformedPath for {}, got {:?}", bad, other),
            }
        }
    }
}
