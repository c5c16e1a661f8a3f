//! Admission policy resolution.
//!
//! Turns the concurrency expressions and rate-limit declarations of a
//! workflow into concrete group keys and bucket requests for one trigger
//! input. Everything here runs before submission; any failure rejects the
//! run without contacting the engine.
//!
//! Expressions see `{ "input": <trigger input>, "additional_metadata": {..} }`.
//! All resolved concurrency entries apply conjunctively: workflow-level
//! entries first, then each task's entries in declaration order.

use dashmap::DashMap;
use serde_json::{Map, Value, json};
use taskloom_types::run::{AdmissionPlan, ConcurrencyScope, ResolvedConcurrency, ResolvedRateLimit};
use taskloom_types::workflow::{
    ConcurrencyExpression, RateLimitDuration, RateLimitKey, StaticRateLimit, TaskSpec, WorkflowSpec,
};

use super::expression::{ExpressionError, ExpressionEvaluator};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("{scope} expression '{expression}' failed: {source}")]
    ExpressionEvaluation {
        expression: String,
        /// Human-readable owner, e.g. `workflow 'orders'` or `task 'ship'`.
        scope: String,
        #[source]
        source: ExpressionError,
    },

    #[error("task '{task}' references unregistered rate limit '{key}'")]
    UnknownStaticKey { task: String, key: String },

    #[error("task '{task}': dynamic rate limit '{expression}' has no limit")]
    MissingLimit { task: String, expression: String },
}

// ---------------------------------------------------------------------------
// RateLimitRegistry
// ---------------------------------------------------------------------------

/// Pre-registered static rate-limit buckets known to this worker.
#[derive(Debug, Default)]
pub struct RateLimitRegistry {
    limits: DashMap<String, StaticRateLimit>,
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, limit: StaticRateLimit) {
        self.limits.insert(limit.key.clone(), limit);
    }

    pub fn get(&self, key: &str) -> Option<StaticRateLimit> {
        self.limits.get(key).map(|l| l.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.limits.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

// ---------------------------------------------------------------------------
// AdmissionResolver
// ---------------------------------------------------------------------------

pub struct AdmissionResolver {
    expressions: ExpressionEvaluator,
}

impl AdmissionResolver {
    pub fn new() -> Self {
        Self {
            expressions: ExpressionEvaluator::new(),
        }
    }

    /// Resolve the full plan for a run of `workflow`.
    pub fn resolve(
        &self,
        workflow: &WorkflowSpec,
        input: &Value,
        additional_metadata: &Map<String, Value>,
        registry: &RateLimitRegistry,
    ) -> Result<AdmissionPlan, AdmissionError> {
        let context = admission_context(input, additional_metadata);
        let mut plan = AdmissionPlan::default();

        let owner = format!("workflow '{}'", workflow.name);
        for expr in &workflow.concurrency {
            plan.concurrency
                .push(self.resolve_concurrency(ConcurrencyScope::Workflow, &owner, expr, &context)?);
        }

        let all_tasks = workflow
            .tasks
            .iter()
            .chain(workflow.on_failure.iter())
            .chain(workflow.on_success.iter());
        for task in all_tasks {
            self.resolve_task_into(&mut plan, task, &context, registry)?;
        }

        tracing::debug!(
            workflow = %workflow.name,
            concurrency = plan.concurrency.len(),
            rate_limits = plan.rate_limits.len(),
            "admission resolved"
        );
        Ok(plan)
    }

    /// Resolve workflow-level entries plus those of a single task.
    pub fn resolve_task(
        &self,
        workflow: &WorkflowSpec,
        task: &TaskSpec,
        input: &Value,
        additional_metadata: &Map<String, Value>,
        registry: &RateLimitRegistry,
    ) -> Result<AdmissionPlan, AdmissionError> {
        let context = admission_context(input, additional_metadata);
        let mut plan = AdmissionPlan::default();
        let owner = format!("workflow '{}'", workflow.name);
        for expr in &workflow.concurrency {
            plan.concurrency
                .push(self.resolve_concurrency(ConcurrencyScope::Workflow, &owner, expr, &context)?);
        }
        self.resolve_task_into(&mut plan, task, &context, registry)?;
        Ok(plan)
    }

    fn resolve_task_into(
        &self,
        plan: &mut AdmissionPlan,
        task: &TaskSpec,
        context: &Value,
        registry: &RateLimitRegistry,
    ) -> Result<(), AdmissionError> {
        let owner = format!("task '{}'", task.name);
        for expr in &task.concurrency {
            plan.concurrency.push(self.resolve_concurrency(
                ConcurrencyScope::Task(task.name.clone()),
                &owner,
                expr,
                context,
            )?);
        }

        for limit in &task.rate_limits {
            let resolved = match &limit.key {
                RateLimitKey::Static(key) => {
                    if !registry.contains(key) {
                        return Err(AdmissionError::UnknownStaticKey {
                            task: task.name.clone(),
                            key: key.clone(),
                        });
                    }
                    ResolvedRateLimit {
                        task: task.name.clone(),
                        bucket_key: key.clone(),
                        units: limit.units,
                        limit: None,
                        duration: None,
                    }
                }
                RateLimitKey::Dynamic(expression) => {
                    let Some(max) = limit.limit else {
                        return Err(AdmissionError::MissingLimit {
                            task: task.name.clone(),
                            expression: expression.clone(),
                        });
                    };
                    let bucket_key = self
                        .expressions
                        .evaluate_key(expression, context)
                        .map_err(|source| AdmissionError::ExpressionEvaluation {
                            expression: expression.clone(),
                            scope: owner.clone(),
                            source,
                        })?;
                    ResolvedRateLimit {
                        task: task.name.clone(),
                        bucket_key,
                        units: limit.units,
                        limit: Some(max),
                        duration: Some(limit.duration.unwrap_or(RateLimitDuration::Minute)),
                    }
                }
            };
            plan.rate_limits.push(resolved);
        }
        Ok(())
    }

    fn resolve_concurrency(
        &self,
        scope: ConcurrencyScope,
        owner: &str,
        expr: &ConcurrencyExpression,
        context: &Value,
    ) -> Result<ResolvedConcurrency, AdmissionError> {
        let group_key = self
            .expressions
            .evaluate_key(&expr.expression, context)
            .map_err(|source| AdmissionError::ExpressionEvaluation {
                expression: expr.expression.clone(),
                scope: owner.to_string(),
                source,
            })?;
        Ok(ResolvedConcurrency {
            scope,
            expression: expr.expression.clone(),
            group_key,
            max_runs: expr.max_runs,
            strategy: expr.limit_strategy,
        })
    }
}

impl Default for AdmissionResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn admission_context(input: &Value, additional_metadata: &Map<String, Value>) -> Value {
    json!({
        "input": input,
        "additional_metadata": additional_metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_types::workflow::{ConcurrencyLimitStrategy, RateLimitSpec};

    fn workflow() -> WorkflowSpec {
        let mut wf = WorkflowSpec::new("orders");
        wf.concurrency.push(ConcurrencyExpression::new(
            "input.tenant",
            5,
            ConcurrencyLimitStrategy::CancelInProgress,
        ));
        let mut ship = TaskSpec::new("ship");
        ship.concurrency.push(ConcurrencyExpression::new(
            "input.region|upper",
            2,
            ConcurrencyLimitStrategy::GroupRoundRobin,
        ));
        ship.rate_limits.push(RateLimitSpec::fixed("carrier-api", 1));
        ship.rate_limits.push(RateLimitSpec::dynamic(
            "additional_metadata.user",
            2,
            10,
            RateLimitDuration::Hour,
        ));
        wf.tasks.push(TaskSpec::new("pack"));
        wf.tasks.push(ship);
        wf
    }

    fn registry() -> RateLimitRegistry {
        let registry = RateLimitRegistry::new();
        registry.put(StaticRateLimit {
            key: "carrier-api".into(),
            limit: 100,
            duration: RateLimitDuration::Minute,
        });
        registry
    }

    fn metadata() -> Map<String, Value> {
        Map::from_iter([("user".to_string(), json!("u-7"))])
    }

    #[test]
    fn resolves_all_entries_in_order() {
        let input = json!({ "tenant": "acme", "region": "eu" });
        let plan = AdmissionResolver::new()
            .resolve(&workflow(), &input, &metadata(), &registry())
            .unwrap();

        assert_eq!(plan.concurrency.len(), 2);
        assert_eq!(plan.concurrency[0].scope, ConcurrencyScope::Workflow);
        assert_eq!(plan.concurrency[0].group_key, "acme");
        assert_eq!(plan.concurrency[0].max_runs, 5);
        assert_eq!(plan.concurrency[1].scope, ConcurrencyScope::Task("ship".into()));
        assert_eq!(plan.concurrency[1].group_key, "EU");

        let limits: Vec<_> = plan.task_rate_limits("ship").collect();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].bucket_key, "carrier-api");
        assert_eq!(limits[0].limit, None);
        assert_eq!(limits[1].bucket_key, "u-7");
        assert_eq!(limits[1].units, 2);
        assert_eq!(limits[1].limit, Some(10));
        assert_eq!(limits[1].duration, Some(RateLimitDuration::Hour));
    }

    #[test]
    fn numeric_keys_render_as_text() {
        let input = json!({ "tenant": 42, "region": "us" });
        let plan = AdmissionResolver::new()
            .resolve(&workflow(), &input, &metadata(), &registry())
            .unwrap();
        assert_eq!(plan.concurrency[0].group_key, "42");
    }

    #[test]
    fn missing_field_is_expression_error() {
        let input = json!({ "region": "us" });
        let err = AdmissionResolver::new()
            .resolve(&workflow(), &input, &metadata(), &registry())
            .unwrap_err();
        match err {
            AdmissionError::ExpressionEvaluation { expression, scope, .. } => {
                assert_eq!(expression, "input.tenant");
                assert_eq!(scope, "workflow 'orders'");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn object_key_is_rejected() {
        let input = json!({ "tenant": { "id": 1 }, "region": "us" });
        assert!(matches!(
            AdmissionResolver::new().resolve(&workflow(), &input, &metadata(), &registry()),
            Err(AdmissionError::ExpressionEvaluation {
                source: ExpressionError::NotAKey { .. },
                ..
            })
        ));
    }

    #[test]
    fn unregistered_static_key_is_rejected() {
        let input = json!({ "tenant": "acme", "region": "eu" });
        let err = AdmissionResolver::new()
            .resolve(&workflow(), &input, &metadata(), &RateLimitRegistry::new())
            .unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::UnknownStaticKey { ref task, ref key } if task == "ship" && key == "carrier-api"
        ));
    }

    #[test]
    fn resolve_task_limits_scope() {
        let wf = workflow();
        let pack = wf.task("pack").unwrap();
        let input = json!({ "tenant": "acme" });
        let plan = AdmissionResolver::new()
            .resolve_task(&wf, pack, &input, &metadata(), &registry())
            .unwrap();
        assert_eq!(plan.workflow_concurrency().count(), 1);
        assert_eq!(plan.task_concurrency("pack").count(), 0);
        assert!(plan.rate_limits.is_empty());
    }
}
