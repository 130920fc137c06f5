use thiserror::Error;
use tracing::debug;

use super::descriptor::{FilterDescriptor, FilterFormat, FilterNode, Logic, Relation};
use super::mask::RowMask;
use crate::data::{FeatureTable, FeatureValue, ValueStore, MISSING_LABEL};
use crate::group::GroupResult;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Unknown statistic '{0}' in filter")]
    UnknownStatistic(String),
}

/// Evaluates filter trees against records of a store and its features
pub struct FilterEngine<'a> {
    store: &'a ValueStore,
    features: &'a FeatureTable,
}

impl<'a> FilterEngine<'a> {
    pub fn new(store: &'a ValueStore, features: &'a FeatureTable) -> Self {
        Self { store, features }
    }

    /// Fail on statistic filters whose source is not in the store
    pub fn validate(&self, filters: &[FilterNode]) -> Result<(), FilterError> {
        for node in filters {
            match node {
                FilterNode::Group { filters, .. } => self.validate(filters)?,
                FilterNode::Condition(d) => {
                    if d.relation.is_some()
                        && d.format == FilterFormat::Stat
                        && !self.store.contains(&d.source_key)
                    {
                        return Err(FilterError::UnknownStatistic(d.source_key.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether record `index` passes every filter
    pub fn matches(&self, filters: &[FilterNode], index: usize) -> Result<bool, FilterError> {
        self.validate(filters)?;
        Ok(self.all(filters, index))
    }

    /// The subset of `indices` passing every filter, in input order
    pub fn apply(&self, filters: &[FilterNode], indices: &[usize]) -> Result<Vec<usize>, FilterError> {
        self.validate(filters)?;
        if filters.is_empty() {
            return Ok(indices.to_vec());
        }
        let kept: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&index| self.all(filters, index))
            .collect();
        debug!(before = indices.len(), after = kept.len(), "Applied filters");
        Ok(kept)
    }

    /// Bitmask over records `0..len`, built node by node
    pub fn mask(&self, filters: &[FilterNode], len: usize) -> Result<RowMask, FilterError> {
        self.validate(filters)?;
        let mut mask = RowMask::all_true(len);
        for node in filters {
            if !mask.any() {
                break;
            }
            mask.and(&self.node_mask(node, len));
        }
        Ok(mask)
    }

    /// Drop groups whose label fails a feature filter on that level's source.
    ///
    /// `level_names[d]` names the feature that produced depth `d`. Only
    /// top-level feature conditions take part; everything else was already
    /// applied to the records.
    pub fn retain_groups(
        &self,
        result: &GroupResult,
        level_names: &[String],
        filters: &[FilterNode],
    ) -> GroupResult {
        let conditions: Vec<&FilterDescriptor> = filters
            .iter()
            .filter_map(|node| match node {
                FilterNode::Condition(d) if d.format == FilterFormat::Group && d.relation.is_some() => Some(d),
                _ => None,
            })
            .collect();
        if conditions.is_empty() {
            return result.clone();
        }

        result.retain_labels(|depth, label| {
            let Some(level) = level_names.get(depth) else {
                return true;
            };
            let value = if label == MISSING_LABEL {
                FeatureValue::Missing
            } else {
                FeatureValue::Text(label.to_string())
            };
            conditions
                .iter()
                .filter(|d| &d.source_key == level)
                .all(|d| test_feature(d, &value))
        })
    }

    fn all(&self, filters: &[FilterNode], index: usize) -> bool {
        filters.iter().all(|node| self.node(node, index))
    }

    fn node(&self, node: &FilterNode, index: usize) -> bool {
        match node {
            FilterNode::Group { logic: Logic::And, filters } => self.all(filters, index),
            FilterNode::Group { logic: Logic::Or, filters } => {
                filters.is_empty() || filters.iter().any(|child| self.node(child, index))
            }
            FilterNode::Condition(d) => self.condition(d, index),
        }
    }

    fn node_mask(&self, node: &FilterNode, len: usize) -> RowMask {
        match node {
            FilterNode::Group { logic: Logic::And, filters } => {
                let mut mask = RowMask::all_true(len);
                for child in filters {
                    mask.and(&self.node_mask(child, len));
                }
                mask
            }
            FilterNode::Group { logic: Logic::Or, filters } => {
                if filters.is_empty() {
                    return RowMask::all_true(len);
                }
                let mut mask = RowMask::all_false(len);
                for child in filters {
                    mask.or(&self.node_mask(child, len));
                }
                mask
            }
            FilterNode::Condition(d) if d.relation.is_none() => RowMask::all_true(len),
            FilterNode::Condition(d) => RowMask::from_fn(len, |index| self.condition(d, index)),
        }
    }

    fn condition(&self, d: &FilterDescriptor, index: usize) -> bool {
        match d.format {
            FilterFormat::Stat => {
                // Validated up front; an unreadable value fails the condition
                let value = self.store.value_at(&d.source_key, index).unwrap_or(f64::NAN);
                test_stat(d, value)
            }
            FilterFormat::Group => test_feature(d, &self.features.value(&d.source_key, index)),
        }
    }
}

fn test_stat(d: &FilterDescriptor, value: f64) -> bool {
    let Some(relation) = d.relation else {
        return true;
    };
    if relation.is_membership() {
        let found = d
            .value
            .as_set()
            .iter()
            .any(|v| v.as_f64().map(|x| x == value).unwrap_or(false));
        return found == (relation == Relation::Inc);
    }
    match d.value.as_f64() {
        Some(target) => relation.compare(value, target),
        None => false,
    }
}

fn test_feature(d: &FilterDescriptor, value: &FeatureValue) -> bool {
    let Some(relation) = d.relation else {
        return true;
    };

    if relation.is_membership() {
        let tags = match value {
            FeatureValue::Missing => vec![MISSING_LABEL.to_string()],
            other => other.tags(),
        };
        let set = d.value.as_set();
        let found = tags.iter().any(|tag| {
            let numeric = tag.parse::<f64>().ok();
            set.iter().any(|v| v.matches_label(tag, numeric))
        });
        return found == (relation == Relation::Inc);
    }

    if relation == Relation::Eq {
        let label = value.label().unwrap_or_else(|| MISSING_LABEL.to_string());
        return d.value.matches_label(&label, value.as_f64());
    }

    match (value.as_f64(), d.value.as_f64()) {
        (Some(v), Some(target)) => relation.compare(v, target),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FeatureColumn, ValueStoreBuilder};
    use indexmap::IndexMap;

    fn dataset() -> (ValueStore, FeatureTable) {
        let store = ValueStoreBuilder::new()
            .column("sales", vec![10.0, 20.0, 5.0, 40.0, f64::NAN])
            .column("opened", vec![0.0, 86_400_000.0, 172_800_000.0, 0.0, 0.0])
            .build()
            .unwrap();
        let features = FeatureTable::new(5)
            .with_column(
                "region",
                FeatureColumn::categorical(&[Some("west"), Some("east"), Some("west"), None, Some("north")]),
            )
            .unwrap()
            .with_column(
                "tags",
                FeatureColumn::tags(&[vec!["hub"], vec!["hub", "coastal"], vec![], vec!["coastal"], vec![]]),
            )
            .unwrap()
            .with_column(
                "year",
                FeatureColumn::numeric(vec![Some(2020.0), Some(2030.0), Some(2040.0), None, Some(2030.0)]),
            )
            .unwrap();
        (store, features)
    }

    fn all_indices() -> Vec<usize> {
        (0..5).collect()
    }

    #[test]
    fn test_conjunction() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);
        let filters = vec![
            FilterDescriptor::stat("sales", Relation::Gte, 10.0).into(),
            FilterDescriptor::feature("region", Relation::Eq, "west").into(),
        ];
        assert_eq!(engine.apply(&filters, &all_indices()).unwrap(), vec![0]);

        let each: Vec<usize> = all_indices()
            .into_iter()
            .filter(|&i| filters.iter().all(|f| engine.matches(std::slice::from_ref(f), i).unwrap()))
            .collect();
        assert_eq!(each, vec![0]);
    }

    #[test]
    fn test_range_is_intersection() {
        let store = ValueStoreBuilder::new()
            .column("v", (0..20).map(|i| i as f64).collect())
            .build()
            .unwrap();
        let features = FeatureTable::new(20);
        let engine = FilterEngine::new(&store, &features);
        let indices: Vec<usize> = (0..20).collect();

        let gt = engine
            .apply(&[FilterDescriptor::stat("v", Relation::Gt, 5.0).into()], &indices)
            .unwrap();
        let lt = engine
            .apply(&[FilterDescriptor::stat("v", Relation::Lt, 10.0).into()], &indices)
            .unwrap();
        let both = engine
            .apply(
                &[
                    FilterDescriptor::stat("v", Relation::Gt, 5.0).into(),
                    FilterDescriptor::stat("v", Relation::Lt, 10.0).into(),
                ],
                &indices,
            )
            .unwrap();

        let intersection: Vec<usize> = gt.into_iter().filter(|i| lt.contains(i)).collect();
        assert_eq!(both, intersection);
        assert_eq!(both, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_nested_or() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);
        let filters = vec![FilterNode::or(vec![
            FilterDescriptor::stat("sales", Relation::Gt, 30.0).into(),
            FilterDescriptor::feature("region", Relation::Eq, "east").into(),
        ])];
        assert_eq!(engine.apply(&filters, &all_indices()).unwrap(), vec![1, 3]);
        assert_eq!(engine.mask(&filters, 5).unwrap().indices(), vec![1, 3]);
    }

    #[test]
    fn test_inc_exc() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);

        let inc = vec![FilterDescriptor::feature("tags", Relation::Inc, vec!["coastal", "depot"]).into()];
        assert_eq!(engine.apply(&inc, &all_indices()).unwrap(), vec![1, 3]);

        let exc = vec![FilterDescriptor::feature("tags", Relation::Exc, vec!["hub"]).into()];
        assert_eq!(engine.apply(&exc, &all_indices()).unwrap(), vec![2, 3, 4]);

        // Missing values are members of the placeholder group
        let missing = vec![FilterDescriptor::feature("region", Relation::Inc, vec![MISSING_LABEL]).into()];
        assert_eq!(engine.apply(&missing, &all_indices()).unwrap(), vec![3]);

        let years = vec![FilterDescriptor::feature("year", Relation::Inc, vec![2030.0]).into()];
        assert_eq!(engine.apply(&years, &all_indices()).unwrap(), vec![1, 4]);

        let stat = vec![FilterDescriptor::stat("sales", Relation::Exc, vec![10.0, 20.0]).into()];
        assert_eq!(engine.apply(&stat, &all_indices()).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_numeric_feature_and_dates() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);

        let filters = vec![FilterDescriptor::feature("year", Relation::Gte, "2030").into()];
        assert_eq!(engine.apply(&filters, &all_indices()).unwrap(), vec![1, 2, 4]);

        let filters = vec![FilterDescriptor::stat("opened", Relation::Gte, "1970-01-02").into()];
        assert_eq!(engine.apply(&filters, &all_indices()).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_nan_fails_comparisons() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);
        let filters = vec![FilterDescriptor::stat("sales", Relation::Lt, 100.0).into()];
        assert_eq!(engine.apply(&filters, &all_indices()).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_without_relation_always_passes() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);
        let filters = FilterNode::parse_list(r#"[{"sourceKey": "profit", "value": 3}]"#).unwrap();
        assert_eq!(engine.apply(&filters, &all_indices()).unwrap(), all_indices());
        assert!(engine.mask(&filters, 5).unwrap().all());
    }

    #[test]
    fn test_unknown_statistic() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);
        let filters = vec![FilterNode::and(vec![
            FilterDescriptor::stat("profit", Relation::Gt, 1.0).into(),
        ])];
        assert_eq!(
            engine.apply(&filters, &all_indices()).unwrap_err(),
            FilterError::UnknownStatistic("profit".into())
        );
        assert!(engine.matches(&filters, 0).is_err());
    }

    #[test]
    fn test_mask_agrees_with_apply() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);
        let filters = vec![
            FilterDescriptor::feature("tags", Relation::Exc, vec!["coastal"]).into(),
            FilterNode::or(vec![
                FilterDescriptor::stat("sales", Relation::Lt, 8.0).into(),
                FilterDescriptor::feature("region", Relation::Eq, "west").into(),
            ]),
        ];
        let mask = engine.mask(&filters, 5).unwrap();
        assert_eq!(mask.indices(), engine.apply(&filters, &all_indices()).unwrap());
        assert_eq!(mask.indices(), vec![0, 2]);
    }

    #[test]
    fn test_retain_groups() {
        let (store, features) = dataset();
        let engine = FilterEngine::new(&store, &features);
        let result = GroupResult::Branch(
            vec![
                ("west", GroupResult::Leaf(vec![10.0, 5.0])),
                ("east", GroupResult::Leaf(vec![20.0])),
                (MISSING_LABEL, GroupResult::Leaf(vec![40.0])),
            ]
            .into_iter()
            .map(|(label, leaf)| (label.to_string(), leaf))
            .collect::<IndexMap<_, _>>(),
        );
        let filters = vec![
            FilterDescriptor::feature("region", Relation::Exc, vec!["east"]).into(),
            FilterDescriptor::feature("tags", Relation::Inc, vec!["hub"]).into(),
        ];

        let kept = engine.retain_groups(&result, &["region".to_string()], &filters);
        let labels: Vec<&str> = kept.children().unwrap().keys().map(String::as_str).collect();
        assert_eq!(labels, vec!["west", MISSING_LABEL]);
    }
}
