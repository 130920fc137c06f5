//! Formula compilation and evaluation.
//!
//! A formula is an arithmetic expression over statistic names, evaluated
//! once per record, plus the group aggregate `groupSum(name)`.

pub mod eval;
pub mod fallback;
pub mod parser;

pub use eval::{evaluate, evaluate_primed, GroupContext, GroupSums, RecordView};
pub use fallback::{parse_literal_array, recover, simplify};
pub use parser::{compile, CompiledExpr, ExprError};
