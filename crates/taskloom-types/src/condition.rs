//! Wait-conditions: the composable predicates that gate task starts and
//! durable suspensions.
//!
//! A `Condition` is a tree of leaves (`Event`, `Sleep`) combined with `And` /
//! `Or`. The tree is immutable once attached; evaluation lives in
//! `taskloom-core`. This module owns the data shape, the wire format and the
//! canonical ordering used to correlate a replayed suspension with its
//! original registration.
//!
//! Wire format (shared with the engine):
//! ```json
//! { "op": "OR", "children": [
//!     { "type": "event", "key": "user:update", "expression": "payload.id == 1" },
//!     { "type": "sleep", "duration": "10s" }
//! ] }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::format_duration;

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A wait-condition tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireCondition", from = "WireCondition")]
pub enum Condition {
    /// Satisfied when an external event with `key` arrives and, if present,
    /// `expression` is truthy against `{ "payload": <event payload> }`.
    Event {
        key: String,
        expression: Option<String>,
    },
    /// Satisfied once `duration` has elapsed since the engine-anchored start.
    Sleep { duration: Duration },
    /// Satisfied iff every child is satisfied.
    And(Vec<Condition>),
    /// Satisfied by the first child to become satisfied.
    Or(Vec<Condition>),
}

impl Condition {
    /// Wait for any event with the given key.
    pub fn event(key: impl Into<String>) -> Self {
        Condition::Event {
            key: key.into(),
            expression: None,
        }
    }

    /// Wait for an event with the given key whose payload matches `expression`.
    pub fn event_matching(key: impl Into<String>, expression: impl Into<String>) -> Self {
        Condition::Event {
            key: key.into(),
            expression: Some(expression.into()),
        }
    }

    /// Wait for a fixed duration.
    pub fn sleep(duration: Duration) -> Self {
        Condition::Sleep { duration }
    }

    /// All of `children`.
    pub fn and(children: impl IntoIterator<Item = Condition>) -> Self {
        Condition::And(children.into_iter().collect())
    }

    /// Any of `children`.
    pub fn or(children: impl IntoIterator<Item = Condition>) -> Self {
        Condition::Or(children.into_iter().collect())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Condition::Event { .. } | Condition::Sleep { .. })
    }

    /// Stable identifier for a leaf, used as the key of its payload in a
    /// resolved outcome (`"event:user:update"`, `"sleep:10s"`).
    ///
    /// Groups return `None`.
    pub fn readable_id(&self) -> Option<String> {
        match self {
            Condition::Event { key, .. } => Some(format!("event:{key}")),
            Condition::Sleep { duration } => Some(format!("sleep:{}", format_duration(*duration))),
            Condition::And(_) | Condition::Or(_) => None,
        }
    }

    /// All leaves of the tree, depth-first in declaration order.
    pub fn leaves(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            Condition::Event { .. } | Condition::Sleep { .. } => out.push(self),
            Condition::And(children) | Condition::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }

    /// Structural evaluation given a satisfaction oracle for leaves.
    ///
    /// `And` requires every child (an empty `And` is satisfied), `Or` requires
    /// at least one (an empty `Or` is never satisfied). The oracle is only
    /// consulted for leaves.
    pub fn is_satisfied_with<F>(&self, leaf: &mut F) -> bool
    where
        F: FnMut(&Condition) -> bool,
    {
        match self {
            Condition::Event { .. } | Condition::Sleep { .. } => leaf(self),
            Condition::And(children) => children.iter().all(|c| c.is_satisfied_with(leaf)),
            Condition::Or(children) => children.iter().any(|c| c.is_satisfied_with(leaf)),
        }
    }

    /// Return the canonical form of the tree: group children are recursively
    /// sorted by their canonical JSON text. Leaves are unchanged and no node
    /// is added or removed.
    pub fn canonicalize(&self) -> Condition {
        match self {
            Condition::Event { .. } | Condition::Sleep { .. } => self.clone(),
            Condition::And(children) => Condition::And(canonical_children(children)),
            Condition::Or(children) => Condition::Or(canonical_children(children)),
        }
    }

    /// Deterministic JSON text of the canonical form.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.canonicalize()).unwrap_or_default()
    }
}

fn canonical_children(children: &[Condition]) -> Vec<Condition> {
    let mut keyed: Vec<(String, Condition)> = children
        .iter()
        .map(|c| {
            let canonical = c.canonicalize();
            let text = serde_json::to_string(&canonical).unwrap_or_default();
            (text, canonical)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, c)| c).collect()
}

// ---------------------------------------------------------------------------
// Wire representation
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireCondition {
    Leaf(WireLeaf),
    Group(WireGroup),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireLeaf {
    Event {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    Sleep {
        #[serde(with = "crate::duration::serde_str")]
        duration: Duration,
    },
}

#[derive(Serialize, Deserialize)]
struct WireGroup {
    op: GroupOp,
    children: Vec<Condition>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum GroupOp {
    And,
    Or,
}

impl From<Condition> for WireCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Event { key, expression } => {
                WireCondition::Leaf(WireLeaf::Event { key, expression })
            }
            Condition::Sleep { duration } => WireCondition::Leaf(WireLeaf::Sleep { duration }),
            Condition::And(children) => WireCondition::Group(WireGroup {
                op: GroupOp::And,
                children,
            }),
            Condition::Or(children) => WireCondition::Group(WireGroup {
                op: GroupOp::Or,
                children,
            }),
        }
    }
}

impl From<WireCondition> for Condition {
    fn from(wire: WireCondition) -> Self {
        match wire {
            WireCondition::Leaf(WireLeaf::Event { key, expression }) => {
                Condition::Event { key, expression }
            }
            WireCondition::Leaf(WireLeaf::Sleep { duration }) => Condition::Sleep { duration },
            WireCondition::Group(WireGroup {
                op: GroupOp::And,
                children,
            }) => Condition::And(children),
            WireCondition::Group(WireGroup {
                op: GroupOp::Or,
                children,
            }) => Condition::Or(children),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_update_or_timeout() -> Condition {
        Condition::or([
            Condition::event_matching("user:update", "payload.id == 1"),
            Condition::sleep(Duration::from_secs(10)),
        ])
    }

    #[test]
    fn test_wire_format_matches_engine_shape() {
        let value = serde_json::to_value(user_update_or_timeout()).unwrap();
        assert_eq!(
            value,
            json!({
                "op": "OR",
                "children": [
                    { "type": "event", "key": "user:update", "expression": "payload.id == 1" },
                    { "type": "sleep", "duration": "10s" }
                ]
            })
        );
    }

    #[test]
    fn test_event_without_expression_omits_field() {
        let value = serde_json::to_value(Condition::event("order:paid")).unwrap();
        assert_eq!(value, json!({ "type": "event", "key": "order:paid" }));
    }

    #[test]
    fn test_deserialize_nested_groups() {
        let raw = json!({
            "op": "AND",
            "children": [
                { "type": "sleep", "duration": "1m" },
                { "op": "OR", "children": [
                    { "type": "event", "key": "a" },
                    { "type": "event", "key": "b" }
                ] }
            ]
        });
        let condition: Condition = serde_json::from_value(raw).unwrap();
        assert_eq!(
            condition,
            Condition::and([
                Condition::sleep(Duration::from_secs(60)),
                Condition::or([Condition::event("a"), Condition::event("b")]),
            ])
        );
    }

    #[test]
    fn test_canonical_form_ignores_child_order() {
        let a = Condition::or([
            Condition::sleep(Duration::from_secs(10)),
            Condition::and([Condition::event("b"), Condition::event("a")]),
        ]);
        let b = Condition::or([
            Condition::and([Condition::event("a"), Condition::event("b")]),
            Condition::sleep(Duration::from_secs(10)),
        ]);
        assert_ne!(a, b);
        assert_eq!(a.canonicalize(), b.canonicalize());
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let c = user_update_or_timeout();
        let once = c.canonicalize();
        assert_eq!(once.canonicalize(), once);
    }

    #[test]
    fn test_structural_evaluation() {
        let c = Condition::and([
            Condition::event("a"),
            Condition::or([Condition::event("b"), Condition::event("c")]),
        ]);
        let only = |keys: &'static [&'static str]| {
            move |leaf: &Condition| match leaf {
                Condition::Event { key, .. } => keys.contains(&key.as_str()),
                _ => false,
            }
        };
        assert!(c.is_satisfied_with(&mut only(&["a", "c"])));
        assert!(!c.is_satisfied_with(&mut only(&["b", "c"])));
        assert!(!c.is_satisfied_with(&mut only(&["a"])));
    }

    #[test]
    fn test_empty_groups() {
        assert!(Condition::And(vec![]).is_satisfied_with(&mut |_| false));
        assert!(!Condition::Or(vec![]).is_satisfied_with(&mut |_| true));
    }

    #[test]
    fn test_readable_ids_and_leaves() {
        let c = user_update_or_timeout();
        let ids: Vec<String> = c.leaves().iter().filter_map(|l| l.readable_id()).collect();
        assert_eq!(ids, vec!["event:user:update", "sleep:10s"]);
        assert_eq!(c.readable_id(), None);
    }
}
