mod grouper;
mod indexer;
mod key;
mod result;

pub use grouper::{GroupError, RecursiveGrouper};
pub use indexer::GroupIndexer;
pub use key::{CompositeKey, KeyFn, COMPOSITE_DELIMITER};
pub use result::{FlatRow, GroupResult};
