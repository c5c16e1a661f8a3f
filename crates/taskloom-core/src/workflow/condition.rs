//! Concrete evaluation of wait-conditions against time and received events.
//!
//! Used in two places: start gates on tasks (`wait_for`, `skip_if`,
//! `cancel_if`) and durable suspensions (`DurableContext::wait_for`). Both
//! evaluate the same `Condition` tree against an engine-anchored start time,
//! the current time and the events received so far.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use taskloom_types::condition::Condition;
use taskloom_types::workflow::TaskSpec;

use super::definition::WorkflowError;
use super::expression::{ExpressionError, ExpressionEvaluator};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An external event as seen by the condition evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub key: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl ReceivedEvent {
    pub fn new(key: impl Into<String>, payload: Value, received_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            payload,
            received_at,
        }
    }
}

/// Result of evaluating a condition at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionEvaluation {
    pub satisfied: bool,
    /// When the condition became satisfied.
    pub satisfied_at: Option<DateTime<Utc>>,
    /// Object of leaf payloads keyed by readable id. Empty while unsatisfied.
    pub payload: Value,
    /// Earliest sleep deadline still pending, for scheduling a re-check.
    pub next_deadline: Option<DateTime<Utc>>,
}

/// Errors raised while evaluating a condition.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("event filter for '{key}' failed: {source}")]
    Expression {
        key: String,
        #[source]
        source: ExpressionError,
    },
}

/// Start-gate decision for a task whose parents have finished.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Start now. `payload` carries the `wait_for` outcome (or `{}`).
    Proceed { payload: Value },
    /// Not decided yet; re-check at `next_deadline` or on the next event.
    Wait { next_deadline: Option<DateTime<Utc>> },
    Skip,
    Cancel,
}

// ---------------------------------------------------------------------------
// Fingerprint and validation
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of the canonical JSON form.
///
/// Equal for trees that differ only in group child order.
pub fn fingerprint(condition: &Condition) -> String {
    let digest = Sha256::digest(condition.canonical_json().as_bytes());
    format!("{:x}", digest)
}

/// Check every event filter in the tree against an empty sample payload.
///
/// Leaves are keyed by their readable id in a resolved payload, so two
/// leaves sharing one (same event key, or same sleep duration) are refused.
pub fn validate_condition(condition: &Condition) -> Result<(), WorkflowError> {
    let evaluator = ExpressionEvaluator::new();
    let sample = json!({ "payload": {} });
    let mut seen = HashSet::new();
    for leaf in condition.leaves() {
        if let Some(id) = leaf.readable_id() {
            if !seen.insert(id.clone()) {
                return Err(WorkflowError::ValidationError(format!(
                    "duplicate condition leaf '{id}'"
                )));
            }
        }
        if let Condition::Event {
            expression: Some(expression),
            ..
        } = leaf
        {
            evaluator
                .check(expression, &sample)
                .map_err(|e| WorkflowError::MalformedExpression {
                    expression: expression.clone(),
                    reason: e.to_string(),
                })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates condition trees.
///
/// - `Sleep(d)` is satisfied at `anchored_at + d` once `now` reaches it.
/// - `Event(key, expr)` is satisfied by the earliest event with that key
///   received at or after the anchor whose payload makes `expr` truthy.
/// - `Or` takes the child satisfied earliest (ties go to canonical order)
///   and ignores the rest.
/// - `And` is satisfied when the last child is, with every child's payload.
pub struct ConditionEvaluator {
    expressions: ExpressionEvaluator,
}

struct Resolution {
    at: Option<DateTime<Utc>>,
    payload: Map<String, Value>,
    next_deadline: Option<DateTime<Utc>>,
}

impl Resolution {
    fn pending(next_deadline: Option<DateTime<Utc>>) -> Self {
        Self {
            at: None,
            payload: Map::new(),
            next_deadline,
        }
    }
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self {
            expressions: ExpressionEvaluator::new(),
        }
    }

    pub fn evaluate(
        &self,
        condition: &Condition,
        anchored_at: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &[ReceivedEvent],
    ) -> Result<ConditionEvaluation, ConditionError> {
        let canonical = condition.canonicalize();
        let resolution = self.resolve(&canonical, anchored_at, now, events)?;
        let satisfied = resolution.at.is_some();
        Ok(ConditionEvaluation {
            satisfied,
            satisfied_at: resolution.at,
            payload: Value::Object(resolution.payload),
            next_deadline: if satisfied { None } else { resolution.next_deadline },
        })
    }

    /// Decide whether a ready task may start.
    ///
    /// `cancel_if` takes precedence over `skip_if`, which takes precedence
    /// over `wait_for`. A task without `wait_for` proceeds as soon as neither
    /// of the other gates holds.
    pub fn evaluate_gate(
        &self,
        task: &TaskSpec,
        anchored_at: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &[ReceivedEvent],
    ) -> Result<GateDecision, ConditionError> {
        let mut next_deadline = None;

        if let Some(cancel_if) = &task.cancel_if {
            let eval = self.evaluate(cancel_if, anchored_at, now, events)?;
            if eval.satisfied {
                return Ok(GateDecision::Cancel);
            }
            next_deadline = earliest(next_deadline, eval.next_deadline);
        }

        if let Some(skip_if) = &task.skip_if {
            let eval = self.evaluate(skip_if, anchored_at, now, events)?;
            if eval.satisfied {
                return Ok(GateDecision::Skip);
            }
            next_deadline = earliest(next_deadline, eval.next_deadline);
        }

        match &task.wait_for {
            None => Ok(GateDecision::Proceed {
                payload: Value::Object(Map::new()),
            }),
            Some(wait_for) => {
                let eval = self.evaluate(wait_for, anchored_at, now, events)?;
                if eval.satisfied {
                    Ok(GateDecision::Proceed {
                        payload: eval.payload,
                    })
                } else {
                    Ok(GateDecision::Wait {
                        next_deadline: earliest(next_deadline, eval.next_deadline),
                    })
                }
            }
        }
    }

    fn resolve(
        &self,
        condition: &Condition,
        anchored_at: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &[ReceivedEvent],
    ) -> Result<Resolution, ConditionError> {
        match condition {
            Condition::Sleep { duration } => {
                let deadline = chrono::Duration::from_std(*duration)
                    .ok()
                    .and_then(|d| anchored_at.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                if now >= deadline {
                    Ok(Resolution {
                        at: Some(deadline),
                        payload: leaf_payload(condition, Value::Null),
                        next_deadline: None,
                    })
                } else {
                    Ok(Resolution::pending(Some(deadline)))
                }
            }
            Condition::Event { key, expression } => {
                let mut best: Option<&ReceivedEvent> = None;
                for event in events {
                    if event.key != *key || event.received_at < anchored_at || event.received_at > now
                    {
                        continue;
                    }
                    if best.is_some_and(|b| b.received_at <= event.received_at) {
                        continue;
                    }
                    if let Some(expression) = expression {
                        let ctx = json!({ "payload": event.payload });
                        let matched = self.expressions.evaluate_bool(expression, &ctx).map_err(
                            |source| ConditionError::Expression {
                                key: key.clone(),
                                source,
                            },
                        )?;
                        if !matched {
                            continue;
                        }
                    }
                    best = Some(event);
                }
                Ok(match best {
                    Some(event) => Resolution {
                        at: Some(event.received_at),
                        payload: leaf_payload(condition, event.payload.clone()),
                        next_deadline: None,
                    },
                    None => Resolution::pending(None),
                })
            }
            Condition::Or(children) => {
                let mut winner: Option<Resolution> = None;
                let mut next_deadline = None;
                for child in children {
                    let r = self.resolve(child, anchored_at, now, events)?;
                    match (r.at, winner.as_ref().and_then(|w| w.at)) {
                        (Some(at), Some(best)) if at < best => winner = Some(r),
                        (Some(_), None) => winner = Some(r),
                        (Some(_), Some(_)) => {}
                        (None, _) => next_deadline = earliest(next_deadline, r.next_deadline),
                    }
                }
                Ok(winner.unwrap_or_else(|| Resolution::pending(next_deadline)))
            }
            Condition::And(children) => {
                let mut latest = anchored_at;
                let mut payload = Map::new();
                let mut pending = false;
                let mut next_deadline = None;
                for child in children {
                    let r = self.resolve(child, anchored_at, now, events)?;
                    match r.at {
                        Some(at) => {
                            latest = latest.max(at);
                            payload.extend(r.payload);
                        }
                        None => {
                            pending = true;
                            next_deadline = earliest(next_deadline, r.next_deadline);
                        }
                    }
                }
                if pending {
                    Ok(Resolution::pending(next_deadline))
                } else {
                    Ok(Resolution {
                        at: Some(latest),
                        payload,
                        next_deadline: None,
                    })
                }
            }
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn leaf_payload(leaf: &Condition, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(id) = leaf.readable_id() {
        map.insert(id, value);
    }
    map
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(secs)
    }

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new()
    }

    fn user_update_or_ten_seconds() -> Condition {
        Condition::or([
            Condition::event("user:update"),
            Condition::sleep(Duration::from_secs(10)),
        ])
    }

    #[test]
    fn test_sleep_satisfied_at_deadline() {
        let c = Condition::sleep(Duration::from_secs(10));
        let before = evaluator().evaluate(&c, t0(), at(9), &[]).unwrap();
        assert!(!before.satisfied);
        assert_eq!(before.next_deadline, Some(at(10)));

        let after = evaluator().evaluate(&c, t0(), at(10), &[]).unwrap();
        assert!(after.satisfied);
        assert_eq!(after.satisfied_at, Some(at(10)));
        assert_eq!(after.payload, json!({ "sleep:10s": null }));
    }

    #[test]
    fn test_event_before_anchor_is_ignored() {
        let c = Condition::event("order:paid");
        let events = vec![ReceivedEvent::new("order:paid", json!({}), at(-1))];
        let eval = evaluator().evaluate(&c, t0(), at(5), &events).unwrap();
        assert!(!eval.satisfied);
    }

    #[test]
    fn test_event_filter_selects_matching_payload() {
        let c = Condition::event_matching("user:update", "payload.user == 'alice'");
        let events = vec![
            ReceivedEvent::new("user:update", json!({ "user": "bob" }), at(1)),
            ReceivedEvent::new("user:update", json!({ "user": "alice" }), at(2)),
        ];
        let eval = evaluator().evaluate(&c, t0(), at(3), &events).unwrap();
        assert!(eval.satisfied);
        assert_eq!(eval.satisfied_at, Some(at(2)));
        assert_eq!(eval.payload, json!({ "event:user:update": { "user": "alice" } }));
    }

    #[test]
    fn test_or_event_wins_before_sleep() {
        let events = vec![ReceivedEvent::new("user:update", json!({ "id": "1" }), at(3))];
        let eval = evaluator()
            .evaluate(&user_update_or_ten_seconds(), t0(), at(20), &events)
            .unwrap();
        assert!(eval.satisfied);
        assert_eq!(eval.satisfied_at, Some(at(3)));
        assert_eq!(eval.payload, json!({ "event:user:update": { "id": "1" } }));
    }

    #[test]
    fn test_or_sleep_wins_without_event() {
        let eval = evaluator()
            .evaluate(&user_update_or_ten_seconds(), t0(), at(10), &[])
            .unwrap();
        assert!(eval.satisfied);
        assert_eq!(eval.payload, json!({ "sleep:10s": null }));
    }

    #[test]
    fn test_or_ignores_later_children() {
        // Event arrives after the sleep fired: the sleep is the winner.
        let events = vec![ReceivedEvent::new("user:update", json!({}), at(12))];
        let eval = evaluator()
            .evaluate(&user_update_or_ten_seconds(), t0(), at(15), &events)
            .unwrap();
        assert_eq!(eval.satisfied_at, Some(at(10)));
        assert_eq!(eval.payload, json!({ "sleep:10s": null }));
    }

    #[test]
    fn test_and_attributes_all_payloads_at_latest_time() {
        let c = Condition::and([
            Condition::event("a"),
            Condition::event("b"),
            Condition::sleep(Duration::from_secs(1)),
        ]);
        let events = vec![
            ReceivedEvent::new("b", json!("B"), at(4)),
            ReceivedEvent::new("a", json!("A"), at(2)),
        ];
        let eval = evaluator().evaluate(&c, t0(), at(5), &events).unwrap();
        assert!(eval.satisfied);
        assert_eq!(eval.satisfied_at, Some(at(4)));
        assert_eq!(
            eval.payload,
            json!({ "event:a": "A", "event:b": "B", "sleep:1s": null })
        );
    }

    #[test]
    fn test_and_pending_reports_next_deadline() {
        let c = Condition::and([
            Condition::event("a"),
            Condition::sleep(Duration::from_secs(30)),
        ]);
        let eval = evaluator().evaluate(&c, t0(), at(1), &[]).unwrap();
        assert!(!eval.satisfied);
        assert_eq!(eval.next_deadline, Some(at(30)));
        assert_eq!(eval.payload, json!({}));
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = user_update_or_ten_seconds();
        let b = Condition::or([
            Condition::sleep(Duration::from_secs(10)),
            Condition::event("user:update"),
        ]);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
        assert_ne!(fingerprint(&a), fingerprint(&Condition::event("user:update")));
    }

    #[test]
    fn test_validate_condition_rejects_bad_filter() {
        let c = Condition::or([
            Condition::event_matching("a", "payload.id =="),
            Condition::sleep(Duration::from_secs(1)),
        ]);
        assert!(matches!(
            validate_condition(&c),
            Err(WorkflowError::MalformedExpression { .. })
        ));
        assert!(validate_condition(&user_update_or_ten_seconds()).is_ok());
    }

    #[test]
    fn test_validate_condition_rejects_colliding_leaves() {
        let same_key = Condition::or([
            Condition::event("order"),
            Condition::event_matching("order", "payload.vip == true"),
        ]);
        assert!(matches!(
            validate_condition(&same_key),
            Err(WorkflowError::ValidationError(ref m)) if m.contains("event:order")
        ));

        let same_sleep = Condition::and([
            Condition::sleep(Duration::from_secs(60)),
            Condition::or([
                Condition::event("a"),
                Condition::sleep(Duration::from_secs(60)),
            ]),
        ]);
        assert!(matches!(
            validate_condition(&same_sleep),
            Err(WorkflowError::ValidationError(ref m)) if m.contains("sleep:1m")
        ));
    }

    #[test]
    fn test_gate_precedence() {
        let mut task = TaskSpec::new("gated");
        task.wait_for = Some(Condition::event("go"));
        task.skip_if = Some(Condition::event("skip"));
        task.cancel_if = Some(Condition::event("stop"));

        let all = vec![
            ReceivedEvent::new("go", json!(1), at(1)),
            ReceivedEvent::new("skip", json!(2), at(1)),
            ReceivedEvent::new("stop", json!(3), at(1)),
        ];
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_gate(&task, t0(), at(2), &all).unwrap(),
            GateDecision::Cancel
        );
        assert_eq!(
            eval.evaluate_gate(&task, t0(), at(2), &all[..2]).unwrap(),
            GateDecision::Skip
        );
        assert_eq!(
            eval.evaluate_gate(&task, t0(), at(2), &all[..1]).unwrap(),
            GateDecision::Proceed {
                payload: json!({ "event:go": 1 })
            }
        );
        assert_eq!(
            eval.evaluate_gate(&task, t0(), at(2), &[]).unwrap(),
            GateDecision::Wait { next_deadline: None }
        );
    }

    #[test]
    fn test_ungated_task_proceeds() {
        let task = TaskSpec::new("plain");
        assert_eq!(
            evaluator().evaluate_gate(&task, t0(), t0(), &[]).unwrap(),
            GateDecision::Proceed { payload: json!({}) }
        );
    }

    // Structural property: Or holds iff some leaf holds, And iff all hold.
    proptest! {
        #[test]
        fn prop_or_any_and_all(assignment in proptest::collection::vec(any::<bool>(), 1..12)) {
            let leaves: Vec<Condition> = (0..assignment.len())
                .map(|i| Condition::event(format!("k{i}")))
                .collect();
            let events: Vec<ReceivedEvent> = assignment
                .iter()
                .enumerate()
                .filter(|(_, hit)| **hit)
                .map(|(i, _)| ReceivedEvent::new(format!("k{i}"), json!(i), at(i as i64)))
                .collect();
            let now = at(100);

            let or = Condition::or(leaves.clone());
            let and = Condition::and(leaves);
            let eval = ConditionEvaluator::new();

            let or_eval = eval.evaluate(&or, t0(), now, &events).unwrap();
            let and_eval = eval.evaluate(&and, t0(), now, &events).unwrap();
            prop_assert_eq!(or_eval.satisfied, assignment.iter().any(|b| *b));
            prop_assert_eq!(and_eval.satisfied, assignment.iter().all(|b| *b));

            // The structural oracle agrees with the concrete evaluator.
            let mut oracle = |leaf: &Condition| match leaf {
                Condition::Event { key, .. } => events.iter().any(|e| &e.key == key),
                _ => false,
            };
            prop_assert_eq!(or.is_satisfied_with(&mut oracle), or_eval.satisfied);
            prop_assert_eq!(and.is_satisfied_with(&mut oracle), and_eval.satisfied);
        }
    }
}
