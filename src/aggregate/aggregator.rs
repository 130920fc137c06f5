use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::pool::{Deadline, WorkerPool, CHUNK_SIZE};
use crate::config::EngineConfig;
use crate::data::{StoreError, ValueStore};
use crate::expr::{compile, evaluate, recover, CompiledExpr, ExprError, GroupContext, RecordView};

/// What to compute for every member of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Calculation {
    /// Pick a statistic as-is
    Name(String),
    /// Evaluate a formula per member
    Formula(String),
}

impl Calculation {
    /// A statistic present in `store` is picked; anything else is a formula
    pub fn resolve(text: &str, store: &ValueStore) -> Self {
        let trimmed = text.trim();
        if store.contains(trimmed) {
            Calculation::Name(trimmed.to_string())
        } else {
            Calculation::Formula(text.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Calculation::Name(s) | Calculation::Formula(s) => s,
        }
    }
}

/// How a leaf's values were produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Exact,
    /// Recovered from a malformed formula; values are best-effort
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub values: Vec<f64>,
    pub evaluation: Evaluation,
}

impl Computed {
    fn exact(values: Vec<f64>) -> Self {
        Self {
            values,
            evaluation: Evaluation::Exact,
        }
    }
}

/// A calculation checked against a store, ready to run for many groups
#[derive(Debug, Clone)]
pub enum Plan {
    Pick(String),
    Formula(Arc<CompiledExpr>),
    Recover(String),
}

/// Errors from computing a group's values
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Unknown statistic '{0}'")]
    UnknownStatistic(String),

    #[error("Aggregation deadline exceeded")]
    Timeout,

    #[error("Worker dispatch failed: {0}")]
    WorkerDispatchFailure(String),

    #[error("Could not recover values from formula '{formula}': {reason}")]
    FallbackFailed { formula: String, reason: String },

    #[error(transparent)]
    Expr(ExprError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AggregateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownStatistic(name) => AggregateError::UnknownStatistic(name),
            other => AggregateError::Store(other),
        }
    }
}

impl From<ExprError> for AggregateError {
    fn from(e: ExprError) -> Self {
        match e {
            ExprError::Store(store) => store.into(),
            other => AggregateError::Expr(other),
        }
    }
}

/// Computes per-member values for one group at a time
#[derive(Debug, Clone)]
pub struct Aggregator {
    pool: Option<Arc<WorkerPool>>,
    parallel_threshold: usize,
    deadline: Option<Duration>,
}

impl Aggregator {
    pub fn new(pool: Option<Arc<WorkerPool>>) -> Self {
        let defaults = EngineConfig::default();
        Self {
            pool,
            parallel_threshold: defaults.parallel_threshold,
            deadline: defaults.deadline,
        }
    }

    /// Everything on the calling task
    pub fn synchronous() -> Self {
        Self::new(None)
    }

    pub fn from_config(config: &EngineConfig, pool: Option<Arc<WorkerPool>>) -> Self {
        Self {
            pool,
            parallel_threshold: config.parallel_threshold,
            deadline: config.deadline,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    /// Compile and check a calculation once.
    ///
    /// Unknown statistics fail here. A formula that does not parse yields a
    /// recovery plan instead of an error.
    pub fn prepare(&self, calc: &Calculation, store: &ValueStore) -> Result<Plan, AggregateError> {
        match calc {
            Calculation::Name(name) => {
                if !store.contains(name) {
                    return Err(AggregateError::UnknownStatistic(name.clone()));
                }
                Ok(Plan::Pick(name.clone()))
            }
            Calculation::Formula(formula) => match compile(formula) {
                Ok(expr) => {
                    expr.check(store)?;
                    Ok(Plan::Formula(Arc::new(expr)))
                }
                Err(e) if e.is_parse_error() => {
                    warn!(formula = %formula, error = %e, "Formula did not compile, using fallback evaluation");
                    Ok(Plan::Recover(formula.clone()))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Values for every member of `group`, in member order
    pub async fn compute(
        &self,
        group: &[usize],
        calc: &Calculation,
        store: &Arc<ValueStore>,
    ) -> Result<Computed, AggregateError> {
        let plan = self.prepare(calc, store)?;
        self.compute_planned(group, &plan, store).await
    }

    pub async fn compute_planned(
        &self,
        group: &[usize],
        plan: &Plan,
        store: &Arc<ValueStore>,
    ) -> Result<Computed, AggregateError> {
        match plan {
            Plan::Pick(name) => {
                let values = store.get(name)?;
                Ok(Computed::exact(
                    group
                        .iter()
                        .map(|&i| values.get(i).copied().unwrap_or(f64::NAN))
                        .collect(),
                ))
            }
            Plan::Formula(expr) => {
                let deadline = Deadline::from_option(self.deadline);
                let values = match self.pool.as_ref() {
                    Some(pool) if group.len() >= self.parallel_threshold => {
                        debug!(members = group.len(), "Dispatching group to worker pool");
                        pool.evaluate(expr.clone(), store.clone(), group.into(), deadline)
                            .await?
                    }
                    _ => evaluate_sync(expr, group, store, &deadline)?,
                };
                Ok(Computed::exact(values))
            }
            Plan::Recover(formula) => {
                let values = recover(formula, group, store).map_err(|e| AggregateError::FallbackFailed {
                    formula: formula.clone(),
                    reason: e.to_string(),
                })?;
                Ok(Computed {
                    values,
                    evaluation: Evaluation::Fallback,
                })
            }
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::synchronous()
    }
}

fn evaluate_sync(
    expr: &CompiledExpr,
    group: &[usize],
    store: &ValueStore,
    deadline: &Deadline,
) -> Result<Vec<f64>, AggregateError> {
    let mut ctx = GroupContext::new(group, store);
    let mut values = Vec::with_capacity(group.len());
    for (n, &index) in group.iter().enumerate() {
        if n % CHUNK_SIZE == 0 && deadline.is_expired() {
            return Err(AggregateError::Timeout);
        }
        values.push(evaluate(expr, RecordView::new(index, store), &mut ctx)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ValueStoreBuilder;

    fn store() -> Arc<ValueStore> {
        Arc::new(
            ValueStoreBuilder::new()
                .column("sales", vec![10.0, 20.0, 5.0, 40.0])
                .column("cost", vec![1.0, 2.0, 3.0, 4.0])
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_resolve() {
        let store = store();
        assert_eq!(Calculation::resolve("sales", &store), Calculation::Name("sales".into()));
        assert_eq!(
            Calculation::resolve("sales * 2", &store),
            Calculation::Formula("sales * 2".into())
        );
    }

    #[tokio::test]
    async fn test_pick_matches_store() {
        let store = store();
        let agg = Aggregator::synchronous();
        let computed = agg
            .compute(&[3, 0, 9], &Calculation::Name("sales".into()), &store)
            .await
            .unwrap();
        assert_eq!(computed.evaluation, Evaluation::Exact);
        assert_eq!(computed.values[..2], [40.0, 10.0]);
        assert!(computed.values[2].is_nan());
    }

    #[tokio::test]
    async fn test_formula_and_pick_agree() {
        let store = store();
        let agg = Aggregator::synchronous();
        let picked = agg
            .compute(&[0, 1, 2], &Calculation::Name("sales".into()), &store)
            .await
            .unwrap();
        let formula = agg
            .compute(&[0, 1, 2], &Calculation::Formula("sales".into()), &store)
            .await
            .unwrap();
        assert_eq!(picked, formula);
    }

    #[tokio::test]
    async fn test_unknown_statistic() {
        let store = store();
        let agg = Aggregator::synchronous();
        for calc in [
            Calculation::Name("profit".into()),
            Calculation::Formula("profit / groupSum(sales)".into()),
        ] {
            let err = agg.compute(&[0], &calc, &store).await.unwrap_err();
            assert!(matches!(err, AggregateError::UnknownStatistic(ref n) if n == "profit"), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_malformed_formula_falls_back() {
        let store = store();
        let agg = Aggregator::synchronous();
        let computed = agg
            .compute(&[0, 1], &Calculation::Formula("sales +".into()), &store)
            .await
            .unwrap();
        assert_eq!(computed.evaluation, Evaluation::Fallback);
        assert_eq!(computed.values, vec![10.0, 20.0]);

        let err = agg
            .compute(&[0], &Calculation::Formula("* /".into()), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::FallbackFailed { .. }));
    }

    #[tokio::test]
    async fn test_pool_and_sync_paths_are_identical() {
        let len = 3000;
        let store = Arc::new(
            ValueStoreBuilder::new()
                .column("x", (0..len).map(|i| (i as f64).sin() * 1e3).collect())
                .build()
                .unwrap(),
        );
        let group: Vec<usize> = (0..len).collect();
        let calc = Calculation::Formula("x / groupSum(x) * 100".into());

        let sync = Aggregator::synchronous().compute(&group, &calc, &store).await.unwrap();
        let pool = Arc::new(WorkerPool::new(4).unwrap());
        let pooled = Aggregator::new(Some(pool.clone()))
            .with_threshold(1000)
            .compute(&group, &calc, &store)
            .await
            .unwrap();

        assert_eq!(pool.stats().completed, 1);
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&sync.values), bits(&pooled.values));
    }

    #[tokio::test]
    async fn test_small_groups_stay_on_task() {
        let store = store();
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let agg = Aggregator::new(Some(pool.clone())).with_threshold(1000);
        agg.compute(&[0, 1], &Calculation::Formula("sales * 2".into()), &store)
            .await
            .unwrap();
        assert_eq!(pool.stats().completed, 0);
    }

    #[tokio::test]
    async fn test_deadline_surfaces_timeout() {
        let store = store();
        let agg = Aggregator::synchronous().with_deadline(Some(Duration::ZERO));
        let err = agg
            .compute(&[0, 1], &Calculation::Formula("sales * 2".into()), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::Timeout));
    }
}
