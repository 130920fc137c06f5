pub mod dictionary;
pub mod features;
pub mod store;

pub use dictionary::LabelDictionary;
pub use features::{FeatureColumn, FeatureTable, FeatureValue, MISSING_LABEL};
pub use store::{StoreError, ValueStore, ValueStoreBuilder};
