//! Per-record formula evaluation.

use fxhash::FxHashMap;

use super::parser::{BinOp, CompiledExpr, ExprError, Func, Node};
use crate::data::{StoreError, ValueStore};

/// One record as seen by a formula: identifiers resolve to scalars at `index`
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    index: usize,
    store: &'a ValueStore,
}

impl<'a> RecordView<'a> {
    pub fn new(index: usize, store: &'a ValueStore) -> Self {
        Self { index, store }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Value of `name` for this record; NaN if the record has no value
    #[inline]
    pub fn get(&self, name: &str) -> Result<f64, StoreError> {
        self.store.value_at(name, self.index)
    }
}

/// Evaluation context for one group: its members plus the groupSum memo.
///
/// Built fresh for every group and dropped with it.
#[derive(Debug)]
pub struct GroupContext<'a> {
    members: &'a [usize],
    store: &'a ValueStore,
    sums: FxHashMap<String, f64>,
}

impl<'a> GroupContext<'a> {
    pub fn new(members: &'a [usize], store: &'a ValueStore) -> Self {
        Self {
            members,
            store,
            sums: FxHashMap::default(),
        }
    }

    pub fn members(&self) -> &[usize] {
        self.members
    }

    /// Sum of `name` over the group's members, computed once per group
    pub fn group_sum(&mut self, name: &str) -> Result<f64, StoreError> {
        if let Some(sum) = self.sums.get(name) {
            return Ok(*sum);
        }

        let values = self.store.get(name)?;
        let sum = sum_members(values, self.members);
        self.sums.insert(name.to_string(), sum);
        Ok(sum)
    }

    /// Number of memoized sums
    pub fn memo_len(&self) -> usize {
        self.sums.len()
    }

    /// Compute every groupSum the formula needs and freeze the memo so it
    /// can be shared read-only across threads
    pub fn prime(mut self, expr: &CompiledExpr) -> Result<GroupSums, StoreError> {
        for name in expr.group_statistics() {
            self.group_sum(name)?;
        }
        Ok(GroupSums { sums: self.sums })
    }
}

/// Sums in member order so every execution path produces identical bits
#[inline]
fn sum_members(values: &[f64], members: &[usize]) -> f64 {
    members
        .iter()
        .map(|&i| values.get(i).copied().unwrap_or(f64::NAN))
        .sum()
}

/// Frozen groupSum results for one group
#[derive(Debug, Clone, Default)]
pub struct GroupSums {
    sums: FxHashMap<String, f64>,
}

impl GroupSums {
    pub fn get(&self, name: &str) -> Result<f64, StoreError> {
        self.sums
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::UnknownStatistic(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

/// Evaluate a compiled formula for one record of the group in `ctx`
pub fn evaluate(
    expr: &CompiledExpr,
    view: RecordView<'_>,
    ctx: &mut GroupContext<'_>,
) -> Result<f64, ExprError> {
    eval_node(&expr.root, &view, &mut |name| ctx.group_sum(name))
}

/// Evaluate against precomputed group sums (worker path)
pub fn evaluate_primed(
    expr: &CompiledExpr,
    view: RecordView<'_>,
    sums: &GroupSums,
) -> Result<f64, ExprError> {
    eval_node(&expr.root, &view, &mut |name| sums.get(name))
}

fn eval_node(
    node: &Node,
    view: &RecordView<'_>,
    group_sum: &mut dyn FnMut(&str) -> Result<f64, StoreError>,
) -> Result<f64, ExprError> {
    Ok(match node {
        Node::Number(v) => *v,
        Node::Stat(name) => view.get(name)?,
        Node::GroupSum(name) => group_sum(name)?,
        Node::Neg(inner) => -eval_node(inner, view, group_sum)?,
        Node::Binary(op, left, right) => {
            let l = eval_node(left, view, group_sum)?;
            let r = eval_node(right, view, group_sum)?;
            apply_binary(*op, l, r)
        }
        Node::Call(func, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_node(arg, view, group_sum)?);
            }
            apply_function(*func, &values)
        }
    })
}

#[inline]
fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn apply_binary(op: BinOp, l: f64, r: f64) -> f64 {
    match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div => l / r,
        BinOp::Mod => l % r,
        BinOp::Eq => truth(l == r),
        BinOp::NotEq => truth(l != r),
        BinOp::Lt => truth(l < r),
        BinOp::LtEq => truth(l <= r),
        BinOp::Gt => truth(l > r),
        BinOp::GtEq => truth(l >= r),
    }
}

fn apply_function(func: Func, args: &[f64]) -> f64 {
    let first = args.first().copied().unwrap_or(f64::NAN);
    match func {
        Func::Abs => first.abs(),
        Func::Sqrt => first.sqrt(),
        Func::Ln => first.ln(),
        Func::Log10 => first.log10(),
        Func::Exp => first.exp(),
        Func::Pow => first.powf(args.get(1).copied().unwrap_or(f64::NAN)),
        Func::Round => first.round(),
        Func::Floor => first.floor(),
        Func::Ceil => first.ceil(),
        // NaN propagates instead of being skipped by f64::min/max
        Func::Min => args
            .iter()
            .copied()
            .fold(f64::INFINITY, |acc, v| if v.is_nan() || acc.is_nan() { f64::NAN } else { acc.min(v) }),
        Func::Max => args
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, |acc, v| if v.is_nan() || acc.is_nan() { f64::NAN } else { acc.max(v) }),
    }
}
