//! Formula compilation.
//!
//! Formulas use SQL scalar-expression syntax and are parsed with `sqlparser`,
//! then lowered into a small tree that only knows about statistics, numbers,
//! arithmetic and a fixed set of functions.

use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::data::{StoreError, ValueStore};

/// Name of the group aggregate primitive, matched case-insensitively
pub const GROUP_SUM: &str = "groupsum";

/// A compiled formula, independent of any particular store
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    pub(crate) root: Node,
    source: String,
    /// Statistics read per record, in first-reference order
    record_stats: Vec<String>,
    /// Statistics referenced through groupSum, in first-reference order
    group_stats: Vec<String>,
}

impl CompiledExpr {
    /// The formula text this was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every statistic the formula references, without duplicates
    pub fn statistics(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for name in self.record_stats.iter().chain(self.group_stats.iter()) {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }

    /// Statistics summed over the group by groupSum
    pub fn group_statistics(&self) -> &[String] {
        &self.group_stats
    }

    /// Whether evaluation needs the group context at all
    pub fn uses_group_sum(&self) -> bool {
        !self.group_stats.is_empty()
    }

    /// Verify every referenced statistic exists in `store`
    pub fn check(&self, store: &ValueStore) -> Result<(), ExprError> {
        for name in self.statistics() {
            if !store.contains(name) {
                return Err(StoreError::UnknownStatistic(name.to_string()).into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Number(f64),
    Stat(String),
    GroupSum(String),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Func {
    Abs,
    Sqrt,
    Ln,
    Log10,
    Exp,
    Pow,
    Min,
    Max,
    Round,
    Floor,
    Ceil,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Func::Abs),
            "sqrt" => Some(Func::Sqrt),
            "ln" => Some(Func::Ln),
            "log10" => Some(Func::Log10),
            "exp" => Some(Func::Exp),
            "pow" | "power" => Some(Func::Pow),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            "round" => Some(Func::Round),
            "floor" => Some(Func::Floor),
            "ceil" | "ceiling" => Some(Func::Ceil),
            _ => None,
        }
    }

    fn check_arity(self, name: &str, found: usize) -> Result<(), ExprError> {
        let (ok, expected) = match self {
            Func::Pow => (found == 2, "2"),
            Func::Min | Func::Max => (found >= 1, "at least 1"),
            _ => (found == 1, "1"),
        };
        if ok {
            Ok(())
        } else {
            Err(ExprError::Arity {
                function: name.to_string(),
                expected,
                found,
            })
        }
    }
}

/// Compile a formula string
pub fn compile(formula: &str) -> Result<CompiledExpr, ExprError> {
    let source = formula.trim();
    if source.is_empty() {
        return Err(ExprError::Empty);
    }

    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(source)?;
    let expr = parser.parse_expr()?;

    let next = parser.peek_token();
    if next.token != Token::EOF {
        return Err(ExprError::TrailingInput(next.token.to_string()));
    }

    let mut record_stats = Vec::new();
    let mut group_stats = Vec::new();
    let root = lower(&expr, &mut record_stats, &mut group_stats)?;

    Ok(CompiledExpr {
        root,
        source: source.to_string(),
        record_stats,
        group_stats,
    })
}

fn lower(
    expr: &Expr,
    record_stats: &mut Vec<String>,
    group_stats: &mut Vec<String>,
) -> Result<Node, ExprError> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n
            .parse::<f64>()
            .map(Node::Number)
            .map_err(|_| ExprError::InvalidNumber(n.clone())),
        Expr::Value(SqlValue::Boolean(b)) => Ok(Node::Number(if *b { 1.0 } else { 0.0 })),
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            let name = extract_statistic_name(expr)?;
            remember(record_stats, &name);
            Ok(Node::Stat(name))
        }
        Expr::Nested(inner) => lower(inner, record_stats, group_stats),
        Expr::UnaryOp { op, expr } => match op {
            UnaryOperator::Minus => Ok(Node::Neg(Box::new(lower(expr, record_stats, group_stats)?))),
            UnaryOperator::Plus => lower(expr, record_stats, group_stats),
            _ => Err(ExprError::UnsupportedOperator(op.to_string())),
        },
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Plus => BinOp::Add,
                BinaryOperator::Minus => BinOp::Sub,
                BinaryOperator::Multiply => BinOp::Mul,
                BinaryOperator::Divide => BinOp::Div,
                BinaryOperator::Modulo => BinOp::Mod,
                BinaryOperator::Eq => BinOp::Eq,
                BinaryOperator::NotEq => BinOp::NotEq,
                BinaryOperator::Lt => BinOp::Lt,
                BinaryOperator::LtEq => BinOp::LtEq,
                BinaryOperator::Gt => BinOp::Gt,
                BinaryOperator::GtEq => BinOp::GtEq,
                other => return Err(ExprError::UnsupportedOperator(other.to_string())),
            };
            Ok(Node::Binary(
                op,
                Box::new(lower(left, record_stats, group_stats)?),
                Box::new(lower(right, record_stats, group_stats)?),
            ))
        }
        Expr::Function(func) => {
            let name = func.name.to_string();
            let lowered = name.to_lowercase();

            if lowered == GROUP_SUM {
                let stat = parse_group_sum_arg(&func.args)?;
                remember(group_stats, &stat);
                return Ok(Node::GroupSum(stat));
            }

            let f = Func::from_name(&lowered).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
            f.check_arity(&name, func.args.len())?;

            let args = func
                .args
                .iter()
                .map(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
                        lower(e, record_stats, group_stats)
                    }
                    other => Err(ExprError::UnsupportedExpression(other.to_string())),
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Node::Call(f, args))
        }
        other => Err(ExprError::UnsupportedExpression(other.to_string())),
    }
}

fn remember(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

fn extract_statistic_name(expr: &Expr) -> Result<String, ExprError> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => {
            Ok(idents.iter().map(|i| i.value.clone()).collect::<Vec<_>>().join("."))
        }
        _ => Err(ExprError::ExpectedStatistic),
    }
}

fn parse_group_sum_arg(args: &[FunctionArg]) -> Result<String, ExprError> {
    if args.len() != 1 {
        return Err(ExprError::Arity {
            function: "groupSum".to_string(),
            expected: "1",
            found: args.len(),
        });
    }

    match &args[0] {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Value(
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s),
        ))) => Ok(s.clone()),
        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => extract_statistic_name(e),
        _ => Err(ExprError::ExpectedStatistic),
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("Formula parse error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("Empty formula")]
    Empty,

    #[error("Unexpected trailing input: {0}")]
    TrailingInput(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("{function} expects {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: &'static str,
        found: usize,
    },

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("Expected a statistic name")]
    ExpectedStatistic,

    #[error("Recovered {found} value(s) for a group of {expected}")]
    RecoveredLength { expected: usize, found: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExprError {
    /// True for malformed formulas (as opposed to a formula that references
    /// data the store does not have)
    pub fn is_parse_error(&self) -> bool {
        !matches!(self, ExprError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ValueStoreBuilder;

    #[test]
    fn test_compile_arithmetic() {
        let expr = compile("sales * 2 + cost").unwrap();
        assert_eq!(expr.source(), "sales * 2 + cost");
        assert_eq!(expr.statistics(), vec!["sales", "cost"]);
        assert!(!expr.uses_group_sum());
    }

    #[test]
    fn test_compile_group_sum() {
        let expr = compile("sales / groupSum(sales) * 100").unwrap();
        assert_eq!(expr.statistics(), vec!["sales"]);
        assert_eq!(expr.group_statistics(), &["sales".to_string()]);
        assert!(expr.uses_group_sum());

        let expr = compile("GROUPSUM(cost)").unwrap();
        assert_eq!(expr.group_statistics(), &["cost".to_string()]);
    }

    #[test]
    fn test_compile_quoted_and_dotted_names() {
        let expr = compile("\"peak-load\" + node.capacity").unwrap();
        assert_eq!(expr.statistics(), vec!["peak-load", "node.capacity"]);
    }

    #[test]
    fn test_incomplete_expression_fails() {
        let err = compile("sales +").unwrap_err();
        assert!(matches!(err, ExprError::Parse(_)));
        assert!(err.is_parse_error());
    }

    #[test]
    fn test_unmatched_parens_fail() {
        assert!(compile("(sales + cost").is_err());
        assert!(matches!(
            compile("sales + cost)"),
            Err(ExprError::TrailingInput(_))
        ));
    }

    #[test]
    fn test_empty_formula_fails() {
        assert_eq!(compile("   "), Err(ExprError::Empty));
    }

    #[test]
    fn test_unknown_function_and_arity() {
        assert!(matches!(
            compile("median(sales)"),
            Err(ExprError::UnknownFunction(f)) if f == "median"
        ));
        assert!(matches!(compile("pow(sales)"), Err(ExprError::Arity { .. })));
        assert!(matches!(
            compile("groupSum(sales, cost)"),
            Err(ExprError::Arity { .. })
        ));
        assert!(matches!(
            compile("groupSum(1 + 2)"),
            Err(ExprError::ExpectedStatistic)
        ));
    }

    #[test]
    fn test_check_against_store() {
        let store = ValueStoreBuilder::new()
            .column("sales", vec![1.0])
            .build()
            .unwrap();

        assert!(compile("sales * 2").unwrap().check(&store).is_ok());

        let err = compile("sales + groupSum(profit)").unwrap().check(&store).unwrap_err();
        assert_eq!(
            err,
            ExprError::Store(StoreError::UnknownStatistic("profit".to_string()))
        );
        assert!(!err.is_parse_error());
    }
}
