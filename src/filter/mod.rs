//! Record and group filtering.

mod descriptor;
mod engine;
mod mask;

pub use descriptor::{parse_date_millis, FilterDescriptor, FilterFormat, FilterNode, FilterValue, Logic, Relation};
pub use engine::{FilterEngine, FilterError};
pub use mask::RowMask;
