use indexmap::IndexMap;

use super::key::KeyFn;

/// Partitions record indices by a key function
pub struct GroupIndexer;

impl GroupIndexer {
    /// Bucket `indices` by label. Groups appear in order of first occurrence
    /// and members keep their input order.
    pub fn index(indices: &[usize], key: &KeyFn) -> IndexMap<String, Vec<usize>> {
        let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
        for &index in indices {
            groups.entry(key.label(index)).or_default().push(index);
        }
        groups
    }
}
