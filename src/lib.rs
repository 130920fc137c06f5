//! Shoal: In-Memory Grouped Statistics
//!
//! Slices the per-record output statistics of a simulation session by any
//! number of categorical features and computes, for every group, either a
//! raw statistic or a formula over statistics.
//!
//! # Features
//!
//! - **Nested Grouping**: one level per feature, groups in first-seen order
//! - **Formulas**: arithmetic over statistics with the `groupSum(name)` aggregate
//! - **Filters**: numeric, date and group-membership conditions with AND/OR nesting
//! - **Worker Pool**: large groups evaluated on a rayon pool with deadlines
//! - **Summaries**: SUM, MEAN, MEDIAN, MODE, COUNT, MIN, MAX, PERCENTILE
//! - **Result Cache**: repeated requests served from memory
//!
//! # Example
//!
//! ```no_run
//! use shoal::{EngineConfig, FeatureColumn, FeatureTable, GroupRequest, StatsEngine, ValueStoreBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ValueStoreBuilder::new()
//!     .column("sales", vec![10.0, 20.0, 5.0, 40.0])
//!     .build()?;
//! let features = FeatureTable::new(4)
//!     .with_column("segment", FeatureColumn::categorical(&[Some("A"), Some("A"), Some("B"), Some("B")]))?;
//!
//! let engine = StatsEngine::new(store, features, EngineConfig::default())?;
//! let request = GroupRequest::new("sales / groupSum(sales)").group_by("segment");
//! let result = engine.run(&request).await?;
//! println!("{}", serde_json::to_string(result.as_ref())?);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod data;
pub mod engine;
pub mod expr;
pub mod filter;
pub mod group;

// Re-export commonly used types
pub use aggregate::{AggregateError, Aggregator, Calculation, Summary, WorkerPool};
pub use config::EngineConfig;
pub use data::{FeatureColumn, FeatureTable, FeatureValue, StoreError, ValueStore, ValueStoreBuilder};
pub use engine::{EngineError, GroupBy, GroupRequest, StatsEngine};
pub use expr::{compile, CompiledExpr, ExprError};
pub use filter::{FilterDescriptor, FilterEngine, FilterError, FilterNode, Relation};
pub use group::{GroupError, GroupResult, KeyFn, RecursiveGrouper};
