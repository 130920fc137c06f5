use std::fmt;
use std::sync::Arc;

use crate::data::FeatureTable;

/// Separator for composite keys built while walking the group tree.
/// Not expected to appear in any label.
pub const COMPOSITE_DELIMITER: char = '\u{1f}';

/// Maps a record index to its group label at one level
#[derive(Clone)]
pub struct KeyFn {
    name: String,
    func: Arc<dyn Fn(usize) -> String + Send + Sync>,
}

impl KeyFn {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Label each record by one feature; missing values read as the placeholder
    pub fn from_feature(features: Arc<FeatureTable>, feature: &str) -> Self {
        let owned = feature.to_string();
        Self::new(feature, move |index| features.label(&owned, index))
    }

    /// Label each record by several features at once, joined with ", "
    pub fn from_features(features: Arc<FeatureTable>, names: &[String]) -> Self {
        if let [single] = names {
            return Self::from_feature(features, single);
        }
        let owned = names.to_vec();
        Self::new(names.join("+"), move |index| {
            owned
                .iter()
                .map(|name| features.label(name, index))
                .collect::<Vec<_>>()
                .join(", ")
        })
    }

    /// Source name shown in logs and used to match grouped filters
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn label(&self, index: usize) -> String {
        (self.func)(index)
    }
}

impl fmt::Debug for KeyFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFn").field("name", &self.name).finish()
    }
}

/// Path of labels from the root of a group tree, packed into one string
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CompositeKey(String);

impl CompositeKey {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut key = Self::root();
        for label in labels {
            key = key.child(label.as_ref());
        }
        key
    }

    /// Key one level deeper
    pub fn child(&self, label: &str) -> Self {
        let mut key = String::with_capacity(self.0.len() + label.len() + 1);
        key.push_str(&self.0);
        key.push(COMPOSITE_DELIMITER);
        key.push_str(label);
        Self(key)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.0.split(COMPOSITE_DELIMITER).skip(1).collect()
    }

    pub fn depth(&self) -> usize {
        self.labels().len()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "<root>");
        }
        write!(f, "{}", self.labels().join(" / "))
    }
}
