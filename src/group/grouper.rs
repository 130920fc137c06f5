//! Recursive, concurrent grouping.
//!
//! Each level partitions its indices with [`GroupIndexer`] and fans out one
//! future per group. Leaves call the [`Aggregator`]; a leaf that fails becomes
//! [`GroupResult::Invalid`] without affecting its siblings.

use futures::future::{join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::indexer::GroupIndexer;
use super::key::{CompositeKey, KeyFn};
use super::result::GroupResult;
use crate::aggregate::{AggregateError, Aggregator, Calculation, Evaluation, Plan};
use crate::data::ValueStore;

#[derive(Error, Debug)]
pub enum GroupError {
    #[error("Unknown statistic '{0}'")]
    UnknownStatistic(String),

    #[error(transparent)]
    Aggregate(AggregateError),
}

impl From<AggregateError> for GroupError {
    fn from(e: AggregateError) -> Self {
        match e {
            AggregateError::UnknownStatistic(name) => GroupError::UnknownStatistic(name),
            other => GroupError::Aggregate(other),
        }
    }
}

pub struct RecursiveGrouper {
    store: Arc<ValueStore>,
    aggregator: Aggregator,
}

impl RecursiveGrouper {
    pub fn new(store: Arc<ValueStore>, aggregator: Aggregator) -> Self {
        Self { store, aggregator }
    }

    pub fn store(&self) -> &Arc<ValueStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Group `indices` by each key function in turn and compute `calc` for
    /// every leaf. With no levels the result is a single leaf.
    pub async fn group(
        &self,
        levels: &[KeyFn],
        calc: &Calculation,
        indices: &[usize],
    ) -> Result<GroupResult, GroupError> {
        let plan = self.aggregator.prepare(calc, &self.store)?;
        debug!(
            levels = levels.len(),
            records = indices.len(),
            calculation = calc.as_str(),
            "Grouping"
        );
        Ok(self
            .group_level(levels, &plan, indices.to_vec(), CompositeKey::root())
            .await)
    }

    fn group_level<'a>(
        &'a self,
        levels: &'a [KeyFn],
        plan: &'a Plan,
        indices: Vec<usize>,
        path: CompositeKey,
    ) -> BoxFuture<'a, GroupResult> {
        async move {
            let Some((level, rest)) = levels.split_first() else {
                return self.leaf(plan, indices, path).await;
            };

            let groups = GroupIndexer::index(&indices, level);
            let children = groups.into_iter().map(move |(label, members)| {
                let child_path = path.child(&label);
                async move {
                    let result = self.group_level(rest, plan, members, child_path).await;
                    (label, result)
                }
            });

            GroupResult::Branch(join_all(children).await.into_iter().collect())
        }
        .boxed()
    }

    async fn leaf(&self, plan: &Plan, members: Vec<usize>, path: CompositeKey) -> GroupResult {
        match self.aggregator.compute_planned(&members, plan, &self.store).await {
            Ok(computed) => match computed.evaluation {
                Evaluation::Exact => GroupResult::Leaf(computed.values),
                Evaluation::Fallback => {
                    warn!(group = %path, members = members.len(), "Leaf computed by fallback evaluation");
                    GroupResult::Fallback(computed.values)
                }
            },
            Err(e) => {
                warn!(group = %path, members = members.len(), error = %e, "Leaf could not be computed");
                GroupResult::Invalid(e.to_string())
            }
        }
    }
}
