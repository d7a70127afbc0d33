//! Query identity: ordering, range bounds, and limits.

use crate::error::{CoreError, CoreResult};
use crate::index::{compare_child_keys, compare_nodes, Index};
use crate::node::{Node, Scalar};
use crate::path::Path;
use std::cmp::Ordering;

/// Which end of the ordered window a limit anchors to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitAnchor {
    /// Keep the first `n` children.
    Left,
    /// Keep the last `n` children.
    Right,
}

/// One end of a range constraint: an index value with an optional key
/// tie-break.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Bound {
    /// The index value to compare against.
    pub value: Scalar,
    /// Optional key tie-break; absent means the extreme key for that end.
    pub key: Option<String>,
}

/// The immutable parameters identifying one query shape at a path.
///
/// Default parameters mean "load everything, priority order". Each builder
/// returns a new value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct QueryParams {
    limit: Option<u32>,
    anchor: Option<LimitAnchor>,
    start: Option<Bound>,
    end: Option<Bound>,
    index: Index,
}

impl QueryParams {
    /// Parameters that load all data in priority order.
    pub fn default_params() -> Self {
        Self::default()
    }

    /// Limits to the first `n` children.
    pub fn limit_to_first(&self, n: u32) -> Self {
        let mut p = self.clone();
        p.limit = Some(n);
        p.anchor = Some(LimitAnchor::Left);
        p
    }

    /// Limits to the last `n` children.
    pub fn limit_to_last(&self, n: u32) -> Self {
        let mut p = self.clone();
        p.limit = Some(n);
        p.anchor = Some(LimitAnchor::Right);
        p
    }

    /// Limits to `n` children, anchored to whichever bound is set.
    ///
    /// With neither or both bounds set the anchor stays undetermined; see
    /// [`QueryParams::is_valid`].
    pub fn limit(&self, n: u32) -> Self {
        let mut p = self.clone();
        p.limit = Some(n);
        p.anchor = None;
        p
    }

    /// Starts the range at `value`, optionally tie-broken by `key`.
    pub fn start_at(&self, value: impl Into<Scalar>, key: Option<&str>) -> Self {
        let mut p = self.clone();
        p.start = Some(Bound {
            value: value.into(),
            key: key.map(str::to_owned),
        });
        p
    }

    /// Ends the range at `value`, optionally tie-broken by `key`.
    pub fn end_at(&self, value: impl Into<Scalar>, key: Option<&str>) -> Self {
        let mut p = self.clone();
        p.end = Some(Bound {
            value: value.into(),
            key: key.map(str::to_owned),
        });
        p
    }

    /// Orders by a different index.
    pub fn order_by(&self, index: Index) -> Self {
        let mut p = self.clone();
        p.index = index;
        p
    }

    /// The ordering index.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The limit, if set.
    pub fn limit_value(&self) -> Option<u32> {
        self.limit
    }

    /// Whether a start bound is set.
    pub fn has_start(&self) -> bool {
        self.start.is_some()
    }

    /// Whether an end bound is set.
    pub fn has_end(&self) -> bool {
        self.end.is_some()
    }

    /// The effective limit anchor: an explicit anchor wins, otherwise the
    /// side a lone bound is set on, otherwise the right end.
    pub fn effective_anchor(&self) -> LimitAnchor {
        match self.anchor {
            Some(a) => a,
            None => {
                if self.start.is_some() && self.end.is_none() {
                    LimitAnchor::Left
                } else {
                    LimitAnchor::Right
                }
            }
        }
    }

    /// A limit combined with both bounds is only valid when anchored.
    pub fn is_valid(&self) -> bool {
        !(self.start.is_some()
            && self.end.is_some()
            && self.limit.is_some()
            && self.anchor.is_none())
    }

    /// Validates, returning a typed error for invalid combinations.
    pub fn validate(&self) -> CoreResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CoreError::InvalidQuery(
                "limit with both start and end bounds must be anchored".to_owned(),
            ))
        }
    }

    /// True when these are the default parameters.
    pub fn is_default(&self) -> bool {
        self.loads_all_data() && self.index == Index::Priority
    }

    /// True when no limit or bound restricts the result.
    pub fn loads_all_data(&self) -> bool {
        self.limit.is_none() && self.start.is_none() && self.end.is_none()
    }

    /// Whether a child falls inside the range bounds (ignores the limit).
    pub fn bounds_contain(&self, key: &str, node: &Node) -> bool {
        let indexed = self.index.value_for(key, node);
        if let Some(start) = &self.start {
            let bound_node = Node::leaf(start.value.clone());
            match compare_nodes(&bound_node, &indexed) {
                Ordering::Greater => return false,
                Ordering::Equal => {
                    if let Some(bound_key) = &start.key {
                        if compare_child_keys(key, bound_key) == Ordering::Less {
                            return false;
                        }
                    }
                }
                Ordering::Less => {}
            }
        }
        if let Some(end) = &self.end {
            let bound_node = Node::leaf(end.value.clone());
            match compare_nodes(&bound_node, &indexed) {
                Ordering::Less => return false,
                Ordering::Equal => {
                    if let Some(bound_key) = &end.key {
                        if compare_child_keys(key, bound_key) == Ordering::Greater {
                            return false;
                        }
                    }
                }
                Ordering::Greater => {}
            }
        }
        true
    }

    /// The wire map form. Absent fields are omitted; the index is encoded
    /// only when it is not the default priority index.
    pub fn to_wire(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        if let Some(start) = &self.start {
            map.insert("sp".to_owned(), scalar_json(&start.value));
            if let Some(key) = &start.key {
                map.insert("sn".to_owned(), serde_json::Value::String(key.clone()));
            }
        }
        if let Some(end) = &self.end {
            map.insert("ep".to_owned(), scalar_json(&end.value));
            if let Some(key) = &end.key {
                map.insert("en".to_owned(), serde_json::Value::String(key.clone()));
            }
        }
        if let Some(limit) = self.limit {
            map.insert("l".to_owned(), serde_json::json!(limit));
            let vf = match self.effective_anchor() {
                LimitAnchor::Left => "l",
                LimitAnchor::Right => "r",
            };
            map.insert("vf".to_owned(), serde_json::Value::String(vf.to_owned()));
        }
        if let Some(id) = self.index.wire_id() {
            map.insert("i".to_owned(), serde_json::Value::String(id));
        }
        map
    }
}

fn scalar_json(scalar: &Scalar) -> serde_json::Value {
    Node::leaf(scalar.clone()).to_json(false)
}

/// A query identity: a path plus the parameters applied there.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QuerySpec {
    /// Location being queried.
    pub path: Path,
    /// Parameter set.
    pub params: QueryParams,
}

impl QuerySpec {
    /// A query at `path` with explicit parameters.
    pub fn new(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    /// The default (load-everything) query at `path`.
    pub fn default_at(path: Path) -> Self {
        Self {
            path,
            params: QueryParams::default_params(),
        }
    }

    /// True when the parameters are the defaults.
    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    /// True when no limit or bound restricts the result.
    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }
}

impl std::fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // A default query is identified by its path alone.
        if self.params.is_default() {
            write!(f, "{}", self.path)
        } else {
            write!(
                f,
                "{}:{}",
                self.path,
                serde_json::Value::Object(self.params.to_wire())
            )
        }
    }
}
