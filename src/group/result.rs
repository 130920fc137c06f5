use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use super::key::CompositeKey;
use crate::aggregate::{Accumulator, Summary};

/// Nested output of a grouped aggregation
#[derive(Debug, Clone, PartialEq)]
pub enum GroupResult {
    /// Exact values, one per member
    Leaf(Vec<f64>),
    /// Values recovered from a malformed formula
    Fallback(Vec<f64>),
    /// The leaf could not be computed
    Invalid(String),
    Branch(IndexMap<String, GroupResult>),
}

/// One leaf of a flattened result
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow<'a> {
    pub labels: Vec<String>,
    pub result: &'a GroupResult,
}

impl GroupResult {
    pub fn is_leaf(&self) -> bool {
        !matches!(self, GroupResult::Branch(_))
    }

    /// Leaf values, exact or recovered
    pub fn values(&self) -> Option<&[f64]> {
        match self {
            GroupResult::Leaf(v) | GroupResult::Fallback(v) => Some(v),
            _ => None,
        }
    }

    pub fn children(&self) -> Option<&IndexMap<String, GroupResult>> {
        match self {
            GroupResult::Branch(children) => Some(children),
            _ => None,
        }
    }

    /// Follow a path of labels from this node
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&GroupResult> {
        let mut node = self;
        for label in path {
            node = node.children()?.get(label.as_ref())?;
        }
        Some(node)
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            GroupResult::Branch(children) => children.values().map(|c| c.leaf_count()).sum(),
            _ => 1,
        }
    }

    /// Values across all leaves that produced any
    pub fn member_count(&self) -> usize {
        match self {
            GroupResult::Branch(children) => children.values().map(|c| c.member_count()).sum(),
            other => other.values().map(|v| v.len()).unwrap_or(0),
        }
    }

    /// True if any leaf is a fallback or invalid
    pub fn is_degraded(&self) -> bool {
        match self {
            GroupResult::Leaf(_) => false,
            GroupResult::Fallback(_) | GroupResult::Invalid(_) => true,
            GroupResult::Branch(children) => children.values().any(|c| c.is_degraded()),
        }
    }

    /// Every leaf with its label path, depth first in result order
    pub fn flatten(&self) -> Vec<FlatRow<'_>> {
        let mut leaves = Vec::new();
        collect_leaves(self, CompositeKey::root(), &mut leaves);
        leaves
            .into_iter()
            .map(|(key, result)| FlatRow {
                labels: key.labels().into_iter().map(str::to_string).collect(),
                result,
            })
            .collect()
    }

    /// Reduce each leaf to a single value; invalid leaves stay invalid
    pub fn summarize(&self, summary: Summary) -> GroupResult {
        match self {
            GroupResult::Leaf(v) => GroupResult::Leaf(vec![summary.apply(v)]),
            GroupResult::Fallback(v) => GroupResult::Fallback(vec![summary.apply(v)]),
            GroupResult::Invalid(reason) => GroupResult::Invalid(reason.clone()),
            GroupResult::Branch(children) => {
                GroupResult::Branch(
                    children
                        .iter()
                        .map(|(label, child)| (label.clone(), child.summarize(summary)))
                        .collect(),
                )
            }
        }
    }

    /// One summary over every value in the tree
    pub fn rollup(&self, summary: Summary) -> f64 {
        let mut total = summary.accumulator();
        for row in self.flatten() {
            if let Some(values) = row.result.values() {
                let mut part = summary.accumulator();
                for &v in values {
                    part.accumulate(v);
                }
                total.merge(part.as_ref());
            }
        }
        total.result()
    }

    /// True if any leaf could not be computed
    pub fn has_invalid(&self) -> bool {
        match self {
            GroupResult::Invalid(_) => true,
            GroupResult::Branch(children) => children.values().any(|c| c.has_invalid()),
            _ => false,
        }
    }

    /// Structural equality comparing floats by bit pattern, so NaN equals NaN
    pub fn identical(&self, other: &GroupResult) -> bool {
        fn same_bits(a: &[f64], b: &[f64]) -> bool {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
        }
        match (self, other) {
            (GroupResult::Leaf(a), GroupResult::Leaf(b)) => same_bits(a, b),
            (GroupResult::Fallback(a), GroupResult::Fallback(b)) => same_bits(a, b),
            (GroupResult::Invalid(a), GroupResult::Invalid(b)) => a == b,
            (GroupResult::Branch(a), GroupResult::Branch(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.identical(vb))
            }
            _ => false,
        }
    }

    /// Drop branches for which `keep(depth, label)` is false
    pub fn retain_labels<F>(&self, keep: F) -> GroupResult
    where
        F: Fn(usize, &str) -> bool,
    {
        self.retain_at(0, &keep)
    }

    fn retain_at<F>(&self, depth: usize, keep: &F) -> GroupResult
    where
        F: Fn(usize, &str) -> bool,
    {
        match self {
            GroupResult::Branch(children) => GroupResult::Branch(
                children
                    .iter()
                    .filter(|(label, _)| keep(depth, label))
                    .map(|(label, child)| (label.clone(), child.retain_at(depth + 1, keep)))
                    .collect(),
            ),
            leaf => leaf.clone(),
        }
    }
}

fn collect_leaves<'a>(node: &'a GroupResult, key: CompositeKey, out: &mut Vec<(CompositeKey, &'a GroupResult)>) {
    match node {
        GroupResult::Branch(children) => {
            for (label, child) in children.iter() {
                collect_leaves(child, key.child(label), out);
            }
        }
        leaf => out.push((key, leaf)),
    }
}

impl Serialize for GroupResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GroupResult::Leaf(values) => values.serialize(serializer),
            GroupResult::Fallback(values) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("fallback", values)?;
                map.end()
            }
            GroupResult::Invalid(reason) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("invalid", reason)?;
                map.end()
            }
            GroupResult::Branch(children) => children.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(children: Vec<(&str, GroupResult)>) -> GroupResult {
        GroupResult::Branch(
            children
                .into_iter()
                .map(|(label, child)| (label.to_string(), child))
                .collect(),
        )
    }

    fn sample() -> GroupResult {
        branch(vec![
            (
                "west",
                branch(vec![
                    ("gas", GroupResult::Leaf(vec![1.0, 2.0])),
                    ("wind", GroupResult::Fallback(vec![3.0])),
                ]),
            ),
            ("east", GroupResult::Invalid("Aggregation deadline exceeded".into())),
        ])
    }

    #[test]
    fn test_counts_and_paths() {
        let result = sample();
        assert_eq!(result.leaf_count(), 3);
        assert_eq!(result.member_count(), 3);
        assert!(result.is_degraded());
        assert!(result.has_invalid());
        assert!(!result.get(&["west"]).unwrap().has_invalid());
        assert_eq!(result.get(&["west", "gas"]), Some(&GroupResult::Leaf(vec![1.0, 2.0])));
        assert!(result.get(&["west", "coal"]).is_none());
        assert!(result.get(&["east", "gas"]).is_none());
        assert_eq!(result.get::<&str>(&[]), Some(&result));
    }

    #[test]
    fn test_flatten_order() {
        let result = sample();
        let rows = result.flatten();
        let labels: Vec<Vec<String>> = rows.iter().map(|r| r.labels.clone()).collect();
        assert_eq!(
            labels,
            vec![
                vec!["west".to_string(), "gas".to_string()],
                vec!["west".to_string(), "wind".to_string()],
                vec!["east".to_string()],
            ]
        );
        assert!(GroupResult::Leaf(vec![]).flatten()[0].labels.is_empty());
    }

    #[test]
    fn test_summarize_and_rollup() {
        let result = sample();
        let summarized = result.summarize(Summary::Sum);
        assert_eq!(summarized.get(&["west", "gas"]), Some(&GroupResult::Leaf(vec![3.0])));
        assert_eq!(summarized.get(&["west", "wind"]), Some(&GroupResult::Fallback(vec![3.0])));
        assert!(matches!(summarized.get(&["east"]), Some(GroupResult::Invalid(_))));

        assert_eq!(result.rollup(Summary::Sum), 6.0);
        assert_eq!(result.rollup(Summary::Max), 3.0);
    }

    #[test]
    fn test_identical_treats_nan_as_equal() {
        let a = GroupResult::Leaf(vec![f64::NAN, 1.0]);
        assert_ne!(a, a.clone());
        assert!(a.identical(&a.clone()));
        assert!(!a.identical(&GroupResult::Fallback(vec![f64::NAN, 1.0])));
    }

    #[test]
    fn test_retain_labels() {
        let result = sample().retain_labels(|depth, label| !(depth == 1 && label == "wind"));
        assert_eq!(result.leaf_count(), 2);
        assert!(result.get(&["west", "wind"]).is_none());
    }

    #[test]
    fn test_json_keeps_first_seen_order() {
        let result = branch(vec![
            ("zeta", GroupResult::Leaf(vec![1.0])),
            ("alpha", GroupResult::Leaf(vec![2.0])),
        ]);
        assert_eq!(serde_json::to_string(&result).unwrap(), r#"{"zeta":[1.0],"alpha":[2.0]}"#);
    }

    #[test]
    fn test_json() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "west": {"gas": [1.0, 2.0], "wind": {"fallback": [3.0]}},
                "east": {"invalid": "Aggregation deadline exceeded"}
            })
        );
    }
}
