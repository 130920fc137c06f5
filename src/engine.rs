use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use crate::aggregate::{AggregateError, Aggregator, Calculation, PoolStats, Summary, WorkerPool};
use crate::cache::{CacheKey, CacheStats, ResultCache};
use crate::config::EngineConfig;
use crate::data::{FeatureTable, StoreError, ValueStore};
use crate::filter::{FilterEngine, FilterError, FilterNode};
use crate::group::{GroupError, GroupResult, KeyFn, RecursiveGrouper};

/// A grouping level: one feature, or several combined into one label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupBy {
    Feature(String),
    Features(Vec<String>),
}

impl GroupBy {
    pub fn name(&self) -> String {
        match self {
            GroupBy::Feature(name) => name.clone(),
            GroupBy::Features(names) => names.join("+"),
        }
    }
}

/// One grouped aggregation, as accepted over JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequest {
    #[serde(default)]
    pub group_by: Vec<GroupBy>,
    /// Statistic name or formula
    pub calculation: String,
    #[serde(default)]
    pub filters: Vec<FilterNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    /// Restrict to these records instead of the whole store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indices: Option<Vec<usize>>,
    /// Also drop groups whose label fails a feature filter on that level
    #[serde(default)]
    pub filter_groups: bool,
}

impl GroupRequest {
    pub fn new(calculation: impl Into<String>) -> Self {
        Self {
            group_by: Vec::new(),
            calculation: calculation.into(),
            filters: Vec::new(),
            summary: None,
            indices: None,
            filter_groups: false,
        }
    }

    pub fn group_by(mut self, feature: impl Into<String>) -> Self {
        self.group_by.push(GroupBy::Feature(feature.into()));
        self
    }

    pub fn group_by_all(mut self, features: &[&str]) -> Self {
        self.group_by
            .push(GroupBy::Features(features.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn filter(mut self, node: impl Into<FilterNode>) -> Self {
        self.filters.push(node.into());
        self
    }

    pub fn summary(mut self, summary: Summary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn indices(mut self, indices: Vec<usize>) -> Self {
        self.indices = Some(indices);
        self
    }

    pub fn filter_groups(mut self) -> Self {
        self.filter_groups = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    #[error("Aggregate error: {0}")]
    Aggregate(#[from] AggregateError),
}

/// Filters, groups and aggregates one dataset
pub struct StatsEngine {
    store: Arc<ValueStore>,
    features: Arc<FeatureTable>,
    grouper: RecursiveGrouper,
    cache: Option<ResultCache>,
    config: EngineConfig,
}

impl StatsEngine {
    pub fn new(store: ValueStore, features: FeatureTable, config: EngineConfig) -> Result<Self, EngineError> {
        if !features.names().is_empty() && features.len() != store.len() {
            return Err(StoreError::InconsistentShape {
                name: "features".to_string(),
                expected: store.len(),
                actual: features.len(),
            }
            .into());
        }

        let pool = if config.parallel_enabled() {
            Some(Arc::new(WorkerPool::new(config.worker_threads)?))
        } else {
            None
        };
        let cache = config
            .cache_enabled()
            .then(|| ResultCache::new(config.cache_capacity, config.cache_ttl));

        info!(
            records = store.len(),
            statistics = store.statistic_count(),
            features = features.names().len(),
            workers = config.worker_threads,
            "Stats engine ready"
        );

        let store = Arc::new(store);
        let aggregator = Aggregator::from_config(&config, pool);
        Ok(Self {
            grouper: RecursiveGrouper::new(store.clone(), aggregator),
            store,
            features: Arc::new(features),
            cache,
            config,
        })
    }

    pub fn store(&self) -> &Arc<ValueStore> {
        &self.store
    }

    pub fn features(&self) -> &Arc<FeatureTable> {
        &self.features
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Filter, group, compute, then summarize if asked
    pub async fn run(&self, request: &GroupRequest) -> Result<Arc<GroupResult>, EngineError> {
        let key = CacheKey::new(self.store.generation(), request);
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key) {
                debug!(calculation = %request.calculation, "Result cache hit");
                return Ok(hit);
            }
        }

        let start = Instant::now();
        let indices = self.filter_indices(&request.filters, request.indices.as_deref())?;
        let levels = self.key_fns(&request.group_by);
        let calc = Calculation::resolve(&request.calculation, &self.store);

        let mut result = self.grouper.group(&levels, &calc, &indices).await?;

        if request.filter_groups && !request.filters.is_empty() {
            let names: Vec<String> = request.group_by.iter().map(GroupBy::name).collect();
            result = FilterEngine::new(&self.store, &self.features).retain_groups(&result, &names, &request.filters);
        }
        if let Some(summary) = request.summary {
            result = result.summarize(summary);
        }

        info!(
            records = indices.len(),
            levels = levels.len(),
            leaves = result.leaf_count(),
            degraded = result.is_degraded(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Grouped aggregation complete"
        );

        let result = Arc::new(result);
        // Invalid leaves come from timeouts and worker failures, so they may
        // succeed on the next run
        if let (Some(cache), Some(key), false) = (&self.cache, key, result.has_invalid()) {
            cache.put(key, result.clone());
        }
        Ok(result)
    }

    /// Records passing `filters`, drawn from `base` or the whole store
    pub fn filter_indices(&self, filters: &[FilterNode], base: Option<&[usize]>) -> Result<Vec<usize>, EngineError> {
        let engine = FilterEngine::new(&self.store, &self.features);
        let indices = match base {
            Some(base) => engine.apply(filters, base)?,
            None if filters.is_empty() => self.store.all_indices(),
            None => engine.mask(filters, self.store.len())?.indices(),
        };
        Ok(indices)
    }

    pub fn key_fns(&self, group_by: &[GroupBy]) -> Vec<KeyFn> {
        group_by
            .iter()
            .map(|selector| match selector {
                GroupBy::Feature(name) => KeyFn::from_feature(self.features.clone(), name),
                GroupBy::Features(names) => KeyFn::from_features(self.features.clone(), names),
            })
            .collect()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.grouper.aggregator().pool().map(|p| p.stats())
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}
