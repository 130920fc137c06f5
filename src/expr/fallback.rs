//! Best-effort recovery for formulas that do not compile.
//!
//! A malformed formula is reduced to the longest prefix that still compiles
//! (with parentheses rebalanced), evaluated for the group, and rendered as a
//! literal array. The literal array text is then parsed back into numbers.
//! Nothing here guarantees the recovered values mean what the user intended;
//! callers flag results produced this way.

use std::sync::OnceLock;

use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::eval::{evaluate, GroupContext, RecordView};
use super::parser::{compile, CompiledExpr, ExprError};
use crate::data::ValueStore;

/// Outer `[ ... ]` of a literal array, brackets optional
fn literal_array_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)^\s*(?:\[(?P<bracketed>.*)\]|(?P<bare>.*?))\s*$")
            .expect("literal array pattern is valid")
    })
}

/// Parse comma-separated numbers, optionally wrapped in brackets.
/// Returns `None` if any element is not a number.
pub fn parse_literal_array(text: &str) -> Option<Vec<f64>> {
    let caps = literal_array_pattern().captures(text)?;
    let (inner, bracketed) = match (caps.name("bracketed"), caps.name("bare")) {
        (Some(m), _) => (m.as_str(), true),
        (None, Some(m)) => (m.as_str(), false),
        (None, None) => return None,
    };

    if inner.trim().is_empty() {
        return if bracketed { Some(Vec::new()) } else { None };
    }

    inner
        .split(',')
        .map(|item| item.trim().parse::<f64>().ok())
        .collect()
}

/// Derive a simplified textual form of `formula` for this group.
///
/// Returns a literal array when some prefix of the formula compiles against
/// `store`, otherwise the formula text unchanged.
pub fn simplify(formula: &str, members: &[usize], store: &ValueStore) -> String {
    let Some(expr) = longest_compiling_prefix(formula, store) else {
        return formula.to_string();
    };

    let mut ctx = GroupContext::new(members, store);
    let mut values = Vec::with_capacity(members.len());
    for &index in members {
        match evaluate(&expr, RecordView::new(index, store), &mut ctx) {
            Ok(v) => values.push(v),
            Err(_) => return formula.to_string(),
        }
    }

    render_literal_array(&values)
}

/// Fallback evaluation: the formula itself as a literal array if it is one,
/// otherwise the parsed simplified form.
///
/// The result always has one value per member. A single recovered value is
/// repeated for every member; any other length mismatch is an error.
pub fn recover(formula: &str, members: &[usize], store: &ValueStore) -> Result<Vec<f64>, ExprError> {
    let values = match parse_literal_array(formula) {
        Some(values) => values,
        None => {
            let simplified = simplify(formula, members, store);
            parse_literal_array(&simplified)
                .ok_or_else(|| ExprError::UnsupportedExpression(formula.trim().to_string()))?
        }
    };

    match values.len() {
        n if n == members.len() => Ok(values),
        1 => Ok(vec![values[0]; members.len()]),
        found => Err(ExprError::RecoveredLength {
            expected: members.len(),
            found,
        }),
    }
}

pub fn render_literal_array(values: &[f64]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

fn longest_compiling_prefix(formula: &str, store: &ValueStore) -> Option<CompiledExpr> {
    let dialect = GenericDialect {};
    let tokens: Vec<Token> = Tokenizer::new(&dialect, formula)
        .tokenize()
        .ok()?
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();

    for end in (1..=tokens.len()).rev() {
        let Some(text) = rebalanced(&tokens[..end]) else {
            continue;
        };
        if let Ok(expr) = compile(&text) {
            if expr.check(store).is_ok() {
                return Some(expr);
            }
        }
    }
    None
}

/// Join tokens back into text, closing any parentheses left open.
/// `None` if a closing paren has no opener.
fn rebalanced(tokens: &[Token]) -> Option<String> {
    let mut depth: usize = 0;
    for token in tokens {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.checked_sub(1)?,
            _ => {}
        }
    }

    let mut text = tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    for _ in 0..depth {
        text.push(')');
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ValueStoreBuilder;

    fn store() -> ValueStore {
        ValueStoreBuilder::new()
            .column("sales", vec![10.0, 20.0, 5.0, 40.0])
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_literal_array() {
        assert_eq!(parse_literal_array("[1, 2.5, -3]"), Some(vec![1.0, 2.5, -3.0]));
        assert_eq!(parse_literal_array("4,5"), Some(vec![4.0, 5.0]));
        assert_eq!(parse_literal_array(" [ ] "), Some(vec![]));
        assert_eq!(parse_literal_array(""), None);
        assert_eq!(parse_literal_array("[1, x]"), None);
        assert_eq!(parse_literal_array("sales +"), None);

        let parsed = parse_literal_array("[NaN, inf]").unwrap();
        assert!(parsed[0].is_nan());
        assert!(parsed[1].is_infinite());
    }

    #[test]
    fn test_simplify_drops_dangling_operator() {
        let store = store();
        assert_eq!(simplify("sales +", &[0, 1], &store), "[10, 20]");
    }

    #[test]
    fn test_simplify_closes_parens() {
        let store = store();
        assert_eq!(simplify("(sales * 2", &[2], &store), "[10]");
    }

    #[test]
    fn test_simplify_without_usable_prefix_returns_text() {
        let store = store();
        assert_eq!(simplify("+ * )", &[0], &store), "+ * )");
        // Prefixes that only reference unknown statistics are not usable
        assert_eq!(simplify("profit +", &[0], &store), "profit +");
    }

    #[test]
    fn test_recover() {
        let store = store();
        assert_eq!(recover("sales *", &[2, 3], &store).unwrap(), vec![5.0, 40.0]);
        assert_eq!(recover("[1, 2, 3]", &[0, 1, 2], &store).unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(recover("* /", &[0], &store).is_err());
    }

    #[test]
    fn test_recover_yields_one_value_per_member() {
        let store = store();
        assert_eq!(recover("[7]", &[0, 1, 3], &store).unwrap(), vec![7.0; 3]);
        assert_eq!(
            recover("7, 8, 9", &[0, 1], &store).unwrap_err(),
            ExprError::RecoveredLength { expected: 2, found: 3 }
        );
        assert!(matches!(
            recover("[1, 2]", &[], &store),
            Err(ExprError::RecoveredLength { expected: 0, found: 2 })
        ));
    }
}
