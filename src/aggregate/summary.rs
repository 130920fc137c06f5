use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Reduction of a leaf's values to one number
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Summary {
    Sum,
    Mean,
    Median,
    Mode,
    Count,
    Min,
    Max,
    /// Linear-interpolated percentile, 0 to 100
    Percentile(f64),
}

impl Summary {
    /// Reduce `values`, skipping NaN. Empty input gives NaN (0 for Count).
    pub fn apply(&self, values: &[f64]) -> f64 {
        let mut acc = self.accumulator();
        for &v in values {
            acc.accumulate(v);
        }
        acc.result()
    }

    pub fn accumulator(&self) -> Box<dyn Accumulator> {
        match *self {
            Summary::Sum => Box::new(SumAccumulator::new()),
            Summary::Mean => Box::new(MeanAccumulator::new()),
            Summary::Median => Box::new(PercentileAccumulator::new(50.0)),
            Summary::Mode => Box::new(ModeAccumulator::new()),
            Summary::Count => Box::new(CountAccumulator::new()),
            Summary::Min => Box::new(MinAccumulator::new()),
            Summary::Max => Box::new(MaxAccumulator::new()),
            Summary::Percentile(p) => Box::new(PercentileAccumulator::new(p)),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_lowercase();
        let summary = match lower.as_str() {
            "sum" | "total" => Summary::Sum,
            "mean" | "avg" | "average" => Summary::Mean,
            "median" => Summary::Median,
            "mode" => Summary::Mode,
            "count" => Summary::Count,
            "min" => Summary::Min,
            "max" => Summary::Max,
            other => {
                let p = other.strip_prefix('p')?.parse::<f64>().ok()?;
                if !(0.0..=100.0).contains(&p) {
                    return None;
                }
                Summary::Percentile(p)
            }
        };
        Some(summary)
    }
}

/// Streaming reduction over f64 values
pub trait Accumulator: Send + Sync + AsAny {
    fn accumulate(&mut self, value: f64);

    fn result(&self) -> f64;

    /// Fold another accumulator of the same kind into this one
    fn merge(&mut self, other: &dyn Accumulator);
}

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: 'static> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CountAccumulator {
    count: u64,
}

impl CountAccumulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Accumulator for CountAccumulator {
    fn accumulate(&mut self, value: f64) {
        if !value.is_nan() {
            self.count += 1;
        }
    }

    fn result(&self) -> f64 {
        self.count as f64
    }

    fn merge(&mut self, other: &dyn Accumulator) {
        if let Some(other) = other.as_any().downcast_ref::<CountAccumulator>() {
            self.count += other.count;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SumAccumulator {
    sum: f64,
    has_value: bool,
}

impl SumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Accumulator for SumAccumulator {
    fn accumulate(&mut self, value: f64) {
        if !value.is_nan() {
            self.sum += value;
            self.has_value = true;
        }
    }

    fn result(&self) -> f64 {
        if self.has_value {
            self.sum
        } else {
            f64::NAN
        }
    }

    fn merge(&mut self, other: &dyn Accumulator) {
        if let Some(other) = other.as_any().downcast_ref::<SumAccumulator>() {
            if other.has_value {
                self.sum += other.sum;
                self.has_value = true;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeanAccumulator {
    sum: f64,
    count: u64,
}

impl MeanAccumulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Accumulator for MeanAccumulator {
    fn accumulate(&mut self, value: f64) {
        if !value.is_nan() {
            self.sum += value;
            self.count += 1;
        }
    }

    fn result(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            f64::NAN
        }
    }

    fn merge(&mut self, other: &dyn Accumulator) {
        if let Some(other) = other.as_any().downcast_ref::<MeanAccumulator>() {
            self.sum += other.sum;
            self.count += other.count;
        }
    }
}

#[derive(Debug, Clone)]
pub struct MinAccumulator {
    min: Option<f64>,
}

impl MinAccumulator {
    pub fn new() -> Self {
        Self { min: None }
    }
}

impl Default for MinAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator for MinAccumulator {
    fn accumulate(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.min = Some(match self.min {
            Some(m) => m.min(value),
            None => value,
        });
    }

    fn result(&self) -> f64 {
        self.min.unwrap_or(f64::NAN)
    }

    fn merge(&mut self, other: &dyn Accumulator) {
        if let Some(other) = other.as_any().downcast_ref::<MinAccumulator>() {
            if let Some(v) = other.min {
                self.accumulate(v);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaxAccumulator {
    max: Option<f64>,
}

impl MaxAccumulator {
    pub fn new() -> Self {
        Self { max: None }
    }
}

impl Default for MaxAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator for MaxAccumulator {
    fn accumulate(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.max = Some(match self.max {
            Some(m) => m.max(value),
            None => value,
        });
    }

    fn result(&self) -> f64 {
        self.max.unwrap_or(f64::NAN)
    }

    fn merge(&mut self, other: &dyn Accumulator) {
        if let Some(other) = other.as_any().downcast_ref::<MaxAccumulator>() {
            if let Some(v) = other.max {
                self.accumulate(v);
            }
        }
    }
}

/// Exact percentile; keeps every value
#[derive(Debug, Clone)]
pub struct PercentileAccumulator {
    percentile: f64,
    values: Vec<f64>,
}

impl PercentileAccumulator {
    pub fn new(percentile: f64) -> Self {
        Self {
            percentile: percentile.clamp(0.0, 100.0),
            values: Vec::new(),
        }
    }
}

impl Accumulator for PercentileAccumulator {
    fn accumulate(&mut self, value: f64) {
        if !value.is_nan() {
            self.values.push(value);
        }
    }

    fn result(&self) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);

        let rank = self.percentile / 100.0 * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
    }

    fn merge(&mut self, other: &dyn Accumulator) {
        if let Some(other) = other.as_any().downcast_ref::<PercentileAccumulator>() {
            self.values.extend_from_slice(&other.values);
        }
    }
}

/// Most frequent value; ties go to the smallest
#[derive(Debug, Clone, Default)]
pub struct ModeAccumulator {
    counts: FxHashMap<u64, u64>,
}

impl ModeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Accumulator for ModeAccumulator {
    fn accumulate(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        // -0.0 and 0.0 count as one value
        let value = if value == 0.0 { 0.0 } else { value };
        *self.counts.entry(value.to_bits()).or_insert(0) += 1;
    }

    fn result(&self) -> f64 {
        self.counts
            .iter()
            .map(|(&bits, &count)| (f64::from_bits(bits), count))
            .fold(None, |best: Option<(f64, u64)>, (value, count)| match best {
                Some((bv, bc)) if bc > count || (bc == count && bv < value) => Some((bv, bc)),
                _ => Some((value, count)),
            })
            .map(|(value, _)| value)
            .unwrap_or(f64::NAN)
    }

    fn merge(&mut self, other: &dyn Accumulator) {
        if let Some(other) = other.as_any().downcast_ref::<ModeAccumulator>() {
            for (&bits, &count) in &other.counts {
                *self.counts.entry(bits).or_insert(0) += count;
            }
        }
    }
}
