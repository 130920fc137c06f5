//! Filter payloads as they arrive over JSON.
//!
//! A filter list is a tree: leaves are conditions on one source, inner nodes
//! combine children with `and`/`or`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::data::features::format_number;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Group { logic: Logic, filters: Vec<FilterNode> },
    Condition(FilterDescriptor),
}

impl FilterNode {
    pub fn and(filters: Vec<FilterNode>) -> Self {
        FilterNode::Group {
            logic: Logic::And,
            filters,
        }
    }

    pub fn or(filters: Vec<FilterNode>) -> Self {
        FilterNode::Group {
            logic: Logic::Or,
            filters,
        }
    }

    /// Parse a JSON array of filters
    pub fn parse_list(json: &str) -> Result<Vec<FilterNode>, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl From<FilterDescriptor> for FilterNode {
    fn from(descriptor: FilterDescriptor) -> Self {
        FilterNode::Condition(descriptor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

/// One condition on a statistic or a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterDescriptor {
    pub source_key: String,
    /// `None` (absent or unrecognized) means the condition always passes
    #[serde(default, deserialize_with = "lenient_relation")]
    pub relation: Option<Relation>,
    #[serde(default)]
    pub value: FilterValue,
    #[serde(default)]
    pub format: FilterFormat,
}

impl FilterDescriptor {
    pub fn stat(source_key: impl Into<String>, relation: Relation, value: impl Into<FilterValue>) -> Self {
        Self {
            source_key: source_key.into(),
            relation: Some(relation),
            value: value.into(),
            format: FilterFormat::Stat,
        }
    }

    pub fn feature(source_key: impl Into<String>, relation: Relation, value: impl Into<FilterValue>) -> Self {
        Self {
            source_key: source_key.into(),
            relation: Some(relation),
            value: value.into(),
            format: FilterFormat::Group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Lt,
    Lte,
    Eq,
    Gt,
    Gte,
    /// Any of the record's values is in the set
    Inc,
    /// None of the record's values is in the set
    Exc,
}

impl Relation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "lt" | "<" => Some(Relation::Lt),
            "lte" | "<=" => Some(Relation::Lte),
            "eq" | "=" | "==" => Some(Relation::Eq),
            "gt" | ">" => Some(Relation::Gt),
            "gte" | ">=" => Some(Relation::Gte),
            "inc" => Some(Relation::Inc),
            "exc" => Some(Relation::Exc),
            _ => None,
        }
    }

    pub fn is_membership(&self) -> bool {
        matches!(self, Relation::Inc | Relation::Exc)
    }

    /// Numeric comparison; false whenever either side is NaN
    pub fn compare(&self, left: f64, right: f64) -> bool {
        match self {
            Relation::Lt => left < right,
            Relation::Lte => left <= right,
            Relation::Eq => left == right,
            Relation::Gt => left > right,
            Relation::Gte => left >= right,
            Relation::Inc => left == right,
            Relation::Exc => left != right,
        }
    }
}

fn lenient_relation<'de, D>(deserializer: D) -> Result<Option<Relation>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(Relation::parse))
}

/// Where a condition reads its value from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterFormat {
    /// A statistic in the value store
    #[default]
    Stat,
    /// Membership in a feature's groups; any format other than "stat"
    #[serde(other)]
    Group,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    #[default]
    Null,
    Number(f64),
    Text(String),
    List(Vec<FilterValue>),
}

impl FilterValue {
    /// Numeric form: numbers, numeric strings, and dates as epoch milliseconds
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FilterValue::Number(v) => Some(*v),
            FilterValue::Text(s) => s.trim().parse().ok().or_else(|| parse_date_millis(s)),
            FilterValue::List(items) if items.len() == 1 => items[0].as_f64(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            FilterValue::Null => None,
            FilterValue::Number(v) => Some(format_number(*v)),
            FilterValue::Text(s) => Some(s.clone()),
            FilterValue::List(items) if items.len() == 1 => items[0].as_text(),
            FilterValue::List(_) => None,
        }
    }

    /// The value as a membership set; scalars are one-element sets
    pub fn as_set(&self) -> Vec<FilterValue> {
        match self {
            FilterValue::Null => Vec::new(),
            FilterValue::List(items) => items.iter().flat_map(|i| i.as_set()).collect(),
            scalar => vec![scalar.clone()],
        }
    }

    /// Whether a record value (as text and, when numeric, as a number) equals this value
    pub fn matches_label(&self, label: &str, numeric: Option<f64>) -> bool {
        match (self.as_f64(), numeric) {
            (Some(a), Some(b)) if a == b => true,
            _ => self.as_text().map(|t| t == label).unwrap_or(false),
        }
    }
}

impl From<f64> for FilterValue {
    fn from(v: f64) -> Self {
        FilterValue::Number(v)
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Text(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        FilterValue::Text(s)
    }
}

impl<T: Into<FilterValue>> From<Vec<T>> for FilterValue {
    fn from(items: Vec<T>) -> Self {
        FilterValue::List(items.into_iter().map(Into::into).collect())
    }
}

/// RFC 3339 timestamps, `YYYY-MM-DD HH:MM:SS`, or plain dates (midnight UTC)
pub fn parse_date_millis(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis() as f64);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive).timestamp_millis() as f64);
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight).timestamp_millis() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree() {
        let filters = FilterNode::parse_list(
            r#"[
                {"sourceKey": "sales", "relation": "gt", "value": 10, "format": "stat"},
                {"logic": "or", "filters": [
                    {"sourceKey": "region", "relation": "inc", "value": ["west"], "format": "group"},
                    {"sourceKey": "year", "relation": "gte", "value": "2030", "format": "feature"}
                ]}
            ]"#,
        )
        .unwrap();

        assert_eq!(filters.len(), 2);
        assert_eq!(
            filters[0],
            FilterNode::Condition(FilterDescriptor::stat("sales", Relation::Gt, 10.0))
        );
        match &filters[1] {
            FilterNode::Group { logic, filters } => {
                assert_eq!(*logic, Logic::Or);
                assert_eq!(
                    filters[0],
                    FilterNode::Condition(FilterDescriptor::feature("region", Relation::Inc, vec!["west"]))
                );
                // Unknown formats are feature filters
                assert!(matches!(
                    &filters[1],
                    FilterNode::Condition(FilterDescriptor { format: FilterFormat::Group, .. })
                ));
            }
            other => panic!("expected group, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_or_unknown_relation() {
        let filters =
            FilterNode::parse_list(r#"[{"sourceKey": "sales"}, {"sourceKey": "sales", "relation": "neq", "value": 1}]"#)
                .unwrap();
        for node in filters {
            match node {
                FilterNode::Condition(d) => {
                    assert!(d.relation.is_none());
                    assert_eq!(d.format, FilterFormat::Stat);
                }
                other => panic!("expected condition, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(FilterValue::from("12.5").as_f64(), Some(12.5));
        assert_eq!(FilterValue::from(2030.0).as_text(), Some("2030".to_string()));
        assert_eq!(FilterValue::from(vec![3.0]).as_f64(), Some(3.0));
        assert_eq!(FilterValue::Null.as_f64(), None);
        assert_eq!(
            FilterValue::from(vec!["a", "b"]).as_set(),
            vec![FilterValue::from("a"), FilterValue::from("b")]
        );
        assert!(FilterValue::from(7.0).matches_label("7", Some(7.0)));
        assert!(FilterValue::from("gas").matches_label("gas", None));
        assert!(!FilterValue::from("gas").matches_label("coal", None));
    }

    #[test]
    fn test_dates() {
        assert_eq!(parse_date_millis("1970-01-02"), Some(86_400_000.0));
        assert_eq!(parse_date_millis("1970-01-01T00:00:01Z"), Some(1000.0));
        assert_eq!(parse_date_millis("1970-01-01 00:01:00"), Some(60_000.0));
        assert_eq!(FilterValue::from("1970-01-02").as_f64(), Some(86_400_000.0));
        assert_eq!(parse_date_millis("yesterday"), None);
    }
}
