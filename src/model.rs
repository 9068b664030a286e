//! Data model for graph entities.
//!
//! Nodes are unordered attribute maps with two mandatory string attributes,
//! `key` and `kind`. Edges are nodes with additional `end1*`/`end2*`
//! attributes describing their endpoints. Attribute values are runtime typed
//! and serialise canonically as JSON.
//!
//! # Key Types
//!
//! - [`Node`] - attribute map with mandatory `key` and `kind`
//! - [`Edge`] - node with endpoint attributes and spec strings
//! - [`AttrValue`] - sum type over the supported attribute value shapes

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Mandatory node attribute holding the unique key within a kind.
pub const ATTR_KEY: &str = "key";
/// Mandatory node attribute holding the kind (type tag).
pub const ATTR_KIND: &str = "kind";

/// Edge endpoint attribute names, first endpoint.
pub const ATTR_END1_KEY: &str = "end1key";
pub const ATTR_END1_KIND: &str = "end1kind";
pub const ATTR_END1_ROLE: &str = "end1role";
pub const ATTR_END1_CASCADING: &str = "end1cascading";
pub const ATTR_END1_CASCADING_LAST: &str = "end1cascadinglast";

/// Edge endpoint attribute names, second endpoint.
pub const ATTR_END2_KEY: &str = "end2key";
pub const ATTR_END2_KIND: &str = "end2kind";
pub const ATTR_END2_ROLE: &str = "end2role";
pub const ATTR_END2_CASCADING: &str = "end2cascading";
pub const ATTR_END2_CASCADING_LAST: &str = "end2cascadinglast";

/// A runtime-typed attribute value.
///
/// The canonical storage encoding is JSON; integers are kept distinct from
/// floats on the way in and out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Absent / null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered list of values.
    List(Vec<AttrValue>),
    /// Nested map of values.
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    /// Returns the string content if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns a numeric view used by comparisons and ordering.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    fn type_rank(&self) -> u8 {
        match self {
            AttrValue::Null => 0,
            AttrValue::Bool(_) => 1,
            AttrValue::Int(_) | AttrValue::Float(_) => 2,
            AttrValue::Str(_) => 3,
            AttrValue::List(_) => 4,
            AttrValue::Map(_) => 5,
        }
    }

    /// Total ordering used for query result sorting: numbers compare
    /// numerically, otherwise values compare within their type, and mixed
    /// types compare by a fixed type rank.
    pub fn cmp_order(&self, other: &AttrValue) -> Ordering {
        match (self, other) {
            (AttrValue::Bool(a), AttrValue::Bool(b)) => a.cmp(b),
            (AttrValue::Str(a), AttrValue::Str(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.type_rank().cmp(&b.type_rank()),
            },
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => write!(f, ""),
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(x) => write!(f, "{x}"),
            AttrValue::Str(s) => write!(f, "{s}"),
            other => {
                let json = serde_json::to_string(other).map_err(|_| fmt::Error)?;
                write!(f, "{json}")
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// A graph node: an unordered mapping from attribute name to value.
///
/// Two nodes are equal iff their attribute maps are equal.
///
/// # Examples
///
/// ```rust
/// use strata::model::{AttrValue, Node};
///
/// let mut node = Node::new("fox", "Animal");
/// node.set_attr("legs", AttrValue::Int(4));
/// assert_eq!(node.key(), "fox");
/// assert_eq!(node.kind(), "Animal");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Node {
    attrs: BTreeMap<String, AttrValue>,
}

impl Node {
    /// Creates a node with the mandatory `key` and `kind` attributes set.
    pub fn new(key: impl Into<String>, kind: impl Into<String>) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert(ATTR_KEY.to_string(), AttrValue::Str(key.into()));
        attrs.insert(ATTR_KIND.to_string(), AttrValue::Str(kind.into()));
        Self { attrs }
    }

    /// Creates a node directly from an attribute map.
    pub fn from_attrs(attrs: BTreeMap<String, AttrValue>) -> Self {
        Self { attrs }
    }

    /// The node key; empty if unset.
    pub fn key(&self) -> &str {
        self.str_attr(ATTR_KEY)
    }

    /// The node kind; empty if unset.
    pub fn kind(&self) -> &str {
        self.str_attr(ATTR_KIND)
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: AttrValue) {
        self.attrs.insert(name.into(), value);
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<AttrValue> {
        self.attrs.remove(name)
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    pub fn into_attrs(self) -> BTreeMap<String, AttrValue> {
        self.attrs
    }

    /// Merges `other`'s attributes into this node (update semantics).
    pub fn merge(&mut self, other: &Node) {
        for (k, v) in &other.attrs {
            self.attrs.insert(k.clone(), v.clone());
        }
    }

    /// Compares two nodes on the given attribute subset only.
    pub fn equals_on(&self, other: &Node, attrs: &[&str]) -> bool {
        attrs.iter().all(|a| self.attr(a) == other.attr(a))
    }

    fn str_attr(&self, name: &str) -> &str {
        self.attrs.get(name).and_then(AttrValue::as_str).unwrap_or("")
    }

    fn bool_attr(&self, name: &str) -> bool {
        matches!(self.attrs.get(name), Some(AttrValue::Bool(true)))
    }

    /// Validates the mandatory attributes and the kind name.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.key().is_empty() {
            return Err(GraphError::InvalidData("Node is missing a key value".into()));
        }
        if self.kind().is_empty() {
            return Err(GraphError::InvalidData(
                "Node is missing a kind value".into(),
            ));
        }
        validate_name("kind", self.kind())
    }
}

/// A graph edge: a node with endpoint attributes.
///
/// Both endpoints carry `key`, `kind` and `role`; the cascading flags drive
/// the follow-on deletion rule. The *spec* of an edge from one endpoint's
/// point of view is the string `ownRole:edgeKind:otherRole:otherKind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Edge {
    node: Node,
}

/// Selects one of the two edge endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    First,
    Second,
}

impl End {
    pub fn other(self) -> End {
        match self {
            End::First => End::Second,
            End::Second => End::First,
        }
    }
}

impl Edge {
    /// Builds an edge between two endpoints, each given as
    /// `(key, kind, role)`. Cascading flags default to off.
    pub fn new(
        key: impl Into<String>,
        kind: impl Into<String>,
        end1: (&str, &str, &str),
        end2: (&str, &str, &str),
    ) -> Self {
        let mut node = Node::new(key, kind);
        node.set_attr(ATTR_END1_KEY, end1.0.into());
        node.set_attr(ATTR_END1_KIND, end1.1.into());
        node.set_attr(ATTR_END1_ROLE, end1.2.into());
        node.set_attr(ATTR_END1_CASCADING, AttrValue::Bool(false));
        node.set_attr(ATTR_END2_KEY, end2.0.into());
        node.set_attr(ATTR_END2_KIND, end2.1.into());
        node.set_attr(ATTR_END2_ROLE, end2.2.into());
        node.set_attr(ATTR_END2_CASCADING, AttrValue::Bool(false));
        Self { node }
    }

    pub fn from_node(node: Node) -> Self {
        Self { node }
    }

    pub fn as_node(&self) -> &Node {
        &self.node
    }

    pub fn as_node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }

    pub fn key(&self) -> &str {
        self.node.key()
    }

    pub fn kind(&self) -> &str {
        self.node.kind()
    }

    pub fn end_key(&self, end: End) -> &str {
        match end {
            End::First => self.node.str_attr(ATTR_END1_KEY),
            End::Second => self.node.str_attr(ATTR_END2_KEY),
        }
    }

    pub fn end_kind(&self, end: End) -> &str {
        match end {
            End::First => self.node.str_attr(ATTR_END1_KIND),
            End::Second => self.node.str_attr(ATTR_END2_KIND),
        }
    }

    pub fn end_role(&self, end: End) -> &str {
        match end {
            End::First => self.node.str_attr(ATTR_END1_ROLE),
            End::Second => self.node.str_attr(ATTR_END2_ROLE),
        }
    }

    /// Whether deleting the endpoint at `end` cascades to the other endpoint.
    pub fn end_cascading(&self, end: End) -> bool {
        match end {
            End::First => self.node.bool_attr(ATTR_END1_CASCADING),
            End::Second => self.node.bool_attr(ATTR_END2_CASCADING),
        }
    }

    /// Whether this cascade fires even when other cascading edges remain.
    pub fn end_cascading_last(&self, end: End) -> bool {
        match end {
            End::First => self.node.bool_attr(ATTR_END1_CASCADING_LAST),
            End::Second => self.node.bool_attr(ATTR_END2_CASCADING_LAST),
        }
    }

    pub fn set_cascading(&mut self, end: End, cascading: bool, cascading_last: bool) {
        let (c, cl) = match end {
            End::First => (ATTR_END1_CASCADING, ATTR_END1_CASCADING_LAST),
            End::Second => (ATTR_END2_CASCADING, ATTR_END2_CASCADING_LAST),
        };
        self.node.set_attr(c, AttrValue::Bool(cascading));
        self.node.set_attr(cl, AttrValue::Bool(cascading_last));
    }

    /// Returns the endpoint selector matching `(key, kind)`, if any.
    ///
    /// For self loops the first endpoint wins.
    pub fn end_of(&self, key: &str, kind: &str) -> Option<End> {
        if self.end_key(End::First) == key && self.end_kind(End::First) == kind {
            Some(End::First)
        } else if self.end_key(End::Second) == key && self.end_kind(End::Second) == kind {
            Some(End::Second)
        } else {
            None
        }
    }

    /// The spec string of this edge as seen from the given endpoint:
    /// `ownRole:edgeKind:otherRole:otherKind`.
    pub fn spec_from(&self, end: End) -> String {
        format!(
            "{}:{}:{}:{}",
            self.end_role(end),
            self.kind(),
            self.end_role(end.other()),
            self.end_kind(end.other())
        )
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.node.validate()?;
        for end in [End::First, End::Second] {
            if self.end_key(end).is_empty()
                || self.end_kind(end).is_empty()
                || self.end_role(end).is_empty()
            {
                return Err(GraphError::InvalidData(
                    "Edge endpoint is missing a key, kind or role value".into(),
                ));
            }
            validate_name("endpoint kind", self.end_kind(end))?;
        }
        Ok(())
    }
}

/// Checks a partition or kind name against `[a-zA-Z0-9_]+`.
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(GraphError::InvalidData(format!(
            "{what} name '{name}' is not alphanumeric"
        )));
    }
    Ok(())
}

/// Matches a stored spec against a traversal pattern; empty pattern
/// components are wildcards, so `:::` matches any edge of any kind.
pub fn spec_matches(pattern: &str, spec: &str) -> bool {
    let pat: Vec<&str> = pattern.split(':').collect();
    let got: Vec<&str> = spec.split(':').collect();
    if pat.len() != 4 || got.len() != 4 {
        return false;
    }
    pat.iter()
        .zip(got.iter())
        .all(|(p, g)| p.is_empty() || p == g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_value_json_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), AttrValue::Int(42));
        let value = AttrValue::List(vec![
            AttrValue::Null,
            AttrValue::Bool(true),
            AttrValue::Float(1.5),
            AttrValue::Str("x".into()),
            AttrValue::Map(map),
        ]);
        let json = serde_json::to_string(&value).expect("serialize");
        let back: AttrValue = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, value);
    }

    #[test]
    fn integers_stay_integers() {
        let back: AttrValue = serde_json::from_str("3").expect("deserialize");
        assert_eq!(back, AttrValue::Int(3));
        let back: AttrValue = serde_json::from_str("3.25").expect("deserialize");
        assert_eq!(back, AttrValue::Float(3.25));
    }

    #[test]
    fn edge_spec_strings() {
        let edge = Edge::new(
            "e1",
            "wrote",
            ("a1", "Author", "author"),
            ("s1", "Song", "song"),
        );
        assert_eq!(edge.spec_from(End::First), "author:wrote:song:Song");
        assert_eq!(edge.spec_from(End::Second), "song:wrote:author:Author");
    }

    #[test]
    fn spec_wildcards() {
        assert!(spec_matches(":::", "author:wrote:song:Song"));
        assert!(spec_matches("author:::", "author:wrote:song:Song"));
        assert!(spec_matches(":wrote::", "author:wrote:song:Song"));
        assert!(!spec_matches("song:::", "author:wrote:song:Song"));
        assert!(!spec_matches("::", "author:wrote:song:Song"));
    }

    #[test]
    fn validation_errors() {
        let node = Node::from_attrs(BTreeMap::from([(
            ATTR_KEY.to_string(),
            AttrValue::Str("k".into()),
        )]));
        let err = node.validate().expect_err("missing kind");
        assert!(err.to_string().contains("missing a kind value"));

        assert!(validate_name("partition", "main_1").is_ok());
        assert!(validate_name("partition", "bad name").is_err());
        assert!(validate_name("partition", "").is_err());
    }
}
