mod aggregator;
mod pool;
mod summary;

pub use aggregator::{AggregateError, Aggregator, Calculation, Computed, Evaluation, Plan};
pub use pool::{Deadline, PoolStats, WorkerPool};
pub use summary::{
    Accumulator, CountAccumulator, MaxAccumulator, MeanAccumulator, MinAccumulator,
    ModeAccumulator, PercentileAccumulator, SumAccumulator, Summary,
};
