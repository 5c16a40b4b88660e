//! Fixed-shape float32 time series.
//!
//! A [`TimeSeries`] is a `(from, step, data)` triple where `data[i]` is the
//! sample at `from + i*step` and `NaN` means "no sample".

mod time;

use std::fmt;

use serde::{Serialize, Serializer};

pub use time::{Duration, Time};

pub const NAN: f32 = f32::NAN;

/// Reduce function: `(t, accumulator, value) -> accumulator`.
pub type F = fn(Time, f32, f32) -> f32;

#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
    from: Time,
    step: Duration,
    data: Vec<f32>,
    last: f32,
}

impl TimeSeries {
    /// A series of `len` NaN points.
    pub fn new(from: Time, len: usize, step: Duration) -> Self {
        Self {
            from,
            step,
            data: vec![NAN; len],
            last: NAN,
        }
    }

    pub fn with_data(from: Time, step: Duration, data: Vec<f32>) -> Self {
        let last = data.last().copied().unwrap_or(NAN);
        Self { from, step, data, last }
    }

    /// A series filled with a constant value.
    pub fn with_value(from: Time, len: usize, step: Duration, value: f32) -> Self {
        Self::with_data(from, step, vec![value; len])
    }

    pub fn from(&self) -> Time {
        self.from
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Timestamp of the last point.
    pub fn to(&self) -> Time {
        self.from + self.step * (self.data.len() as i64 - 1)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn last(&self) -> f32 {
        self.last
    }

    pub fn get(&self, t: Time) -> f32 {
        let t = t.truncate(self.step);
        if t < self.from {
            return NAN;
        }
        let idx = ((t - self.from) / self.step) as usize;
        self.data.get(idx).copied().unwrap_or(NAN)
    }

    pub fn set(&mut self, t: Time, v: f32) {
        let t = t.truncate(self.step);
        if t < self.from {
            return;
        }
        let idx = ((t - self.from) / self.step) as usize;
        let l = self.data.len();
        if idx < l {
            self.data[idx] = v;
            if idx == l - 1 {
                self.last = v;
            }
        }
    }

    /// Copies the defined samples of `data` (starting at `from` with `step`)
    /// that fall into this series. A coarser destination keeps the first
    /// sample of every bucket. Returns whether any point was written.
    pub fn fill(&mut self, from: Time, step: Duration, data: &[f32]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        let mut changed = false;
        let to = self.to();
        let l = self.data.len() - 1;
        let mut t_next = Time(0);
        let mut i_next: Option<usize> = None;
        let mut t = from - step;
        for &v in data {
            t += step;
            if t > to {
                break;
            }
            if t < self.from || t < t_next {
                continue;
            }
            let idx = *i_next.get_or_insert_with(|| {
                t_next = t.truncate(self.step);
                ((t - self.from) / self.step) as usize
            });
            if idx <= l {
                if !v.is_nan() {
                    self.data[idx] = v;
                    changed = true;
                    if idx == l {
                        self.last = v;
                    }
                }
                t_next += self.step;
                i_next = Some(idx + 1);
            }
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (Time, f32)> + '_ {
        let (from, step) = (self.from, self.step);
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (from + step * i as i64, v))
    }

    /// Iterates from the point containing `t`; empty when `t` is outside.
    pub fn iter_from(&self, t: Time) -> impl Iterator<Item = (Time, f32)> + '_ {
        let skip = if self.data.is_empty() || t < self.from || t > self.to() {
            self.data.len()
        } else {
            ((t.truncate(self.step) - self.from) / self.step) as usize
        };
        self.iter().skip(skip)
    }

    pub fn reduce(&self, f: F) -> f32 {
        self.iter().fold(NAN, |acc, (t, v)| f(t, acc, v))
    }

    pub fn map(&self, f: fn(Time, f32) -> f32) -> TimeSeries {
        let data = self.iter().map(|(t, v)| f(t, v)).collect();
        TimeSeries::with_data(self.from, self.step, data)
    }

    /// Latest defined value with its timestamp.
    pub fn last_not_nan(&self) -> Option<(Time, f32)> {
        self.iter().filter(|(_, v)| !v.is_nan()).last()
    }

    /// True when none of the last three points are defined.
    pub fn tail_is_empty(&self) -> bool {
        self.data.iter().rev().take(3).all(|v| v.is_nan())
    }
}

impl fmt::Display for TimeSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.data.iter().map(|&v| format_value(v)).collect();
        write!(
            f,
            "TimeSeries({}, {}, {}, [{}])",
            self.from,
            self.data.len(),
            self.step.0,
            values.join(" ")
        )
    }
}

impl Serialize for TimeSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let values: Vec<Option<f32>> = self
            .data
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect();
        values.serialize(serializer)
    }
}

/// NaN prints as `.`, integral values without decimals.
pub fn format_value(v: f32) -> String {
    if v.is_nan() {
        return ".".to_string();
    }
    if v == 0.0 {
        return "0".to_string();
    }
    if v.fract() == 0.0 && v.abs() < i64::MAX as f32 {
        return format!("{:.0}", v);
    }
    format!("{:.6}", v)
}

// ----------------------------------------------------------------------------
// Reduce functions
// ----------------------------------------------------------------------------

pub fn any(_: Time, v1: f32, v2: f32) -> f32 {
    if !v1.is_nan() {
        v1
    } else {
        v2
    }
}

pub fn nan_sum(_: Time, sum: f32, v: f32) -> f32 {
    let sum = if sum.is_nan() { 0.0 } else { sum };
    if v.is_nan() {
        sum
    } else {
        sum + v
    }
}

pub fn max(_: Time, max: f32, v: f32) -> f32 {
    if max.is_nan() || (!v.is_nan() && v > max) {
        v
    } else {
        max
    }
}

pub fn min(_: Time, min: f32, v: f32) -> f32 {
    if min.is_nan() || (!v.is_nan() && v < min) {
        v
    } else {
        min
    }
}

pub fn defined(_: Time, v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        1.0
    }
}

pub fn zero_to_nan(_: Time, v: f32) -> f32 {
    if v == 0.0 {
        NAN
    } else {
        v
    }
}

// ----------------------------------------------------------------------------
// Aggregate
// ----------------------------------------------------------------------------

/// Point-wise combination of series sharing the same shape.
#[derive(Debug, Clone)]
pub struct Aggregate {
    f: F,
    input: Vec<TimeSeries>,
}

impl Aggregate {
    pub fn new(f: F) -> Self {
        Self { f, input: Vec::new() }
    }

    pub fn add(&mut self, ts: &TimeSeries) -> &mut Self {
        if !ts.is_empty() {
            self.input.push(ts.clone());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn get(&self) -> Option<TimeSeries> {
        let first = self.input.first()?;
        if self.input.len() == 1 {
            return Some(first.clone());
        }
        let mut data = vec![NAN; first.len()];
        for src in &self.input {
            for (i, (t, v)) in src.iter().enumerate().take(data.len()) {
                data[i] = (self.f)(t, data[i], v);
            }
        }
        Some(TimeSeries::with_data(first.from, first.step, data))
    }

    pub fn reduce(&self, f: F) -> f32 {
        self.get().map(|ts| ts.reduce(f)).unwrap_or(NAN)
    }
}

// ----------------------------------------------------------------------------
// Linear regression
// ----------------------------------------------------------------------------

/// Least-squares fit `v = alpha + beta*t` over the defined points.
#[derive(Debug, Clone, Copy)]
pub struct LinearRegression {
    alpha: f64,
    beta: f64,
}

impl LinearRegression {
    pub fn new(ts: &TimeSeries) -> Option<Self> {
        let points: Vec<(f64, f64)> = ts
            .iter()
            .filter(|(_, v)| !v.is_nan())
            .map(|(t, v)| (t.0 as f64, v as f64))
            .collect();
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
        let mut cov = 0.0;
        let mut var = 0.0;
        for (x, y) in &points {
            cov += (x - mean_x) * (y - mean_y);
            var += (x - mean_x) * (x - mean_x);
        }
        let beta = if var == 0.0 { 0.0 } else { cov / var };
        Some(Self {
            alpha: mean_y - beta * mean_x,
            beta,
        })
    }

    pub fn calc(&self, t: Time) -> f32 {
        (self.alpha + self.beta * t.0 as f64) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_display() {
        let ts = TimeSeries::with_data(Time(60), Duration(30), vec![NAN, 1.0, 2.5, 0.0]);
        assert_eq!(ts.to_string(), "TimeSeries(60, 4, 30, [. 1 2.500000 0])");
    }

    #[test]
    fn test_set_and_get() {
        let mut ts = TimeSeries::new(Time(0), 5, Duration(30));
        ts.set(Time(65), 3.0);
        ts.set(Time(500), 9.0);
        assert_eq!(ts.get(Time(60)), 3.0);
        assert!(ts.get(Time(90)).is_nan());
        assert_eq!(ts.to(), Time(120));
    }

    #[test]
    fn test_fill_intersection() {
        let mut ts = TimeSeries::new(Time(60), 4, Duration(30));
        let changed = ts.fill(Time(0), Duration(30), &[1.0, 2.0, NAN, 4.0, 5.0, 6.0, 7.0]);
        assert!(changed);
        assert_eq!(ts.to_string(), "TimeSeries(60, 4, 30, [. 4 5 6])");
        assert_eq!(ts.last(), 6.0);

        let mut ts = TimeSeries::new(Time(600), 4, Duration(30));
        assert!(!ts.fill(Time(0), Duration(30), &[1.0, 2.0]));
    }

    #[test]
    fn test_fill_coarser_destination() {
        let mut ts = TimeSeries::new(Time(0), 2, Duration(60));
        ts.fill(Time(0), Duration(30), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ts.to_string(), "TimeSeries(0, 2, 60, [1 3])");
    }

    #[test]
    fn test_reduce() {
        let ts = TimeSeries::with_data(Time(0), Duration(1), vec![NAN, 1.0, 3.0, NAN]);
        assert_eq!(ts.reduce(nan_sum), 4.0);
        assert_eq!(ts.reduce(max), 3.0);
        assert_eq!(ts.reduce(min), 1.0);
        assert_eq!(ts.map(defined).reduce(nan_sum), 2.0);
        let empty = TimeSeries::new(Time(0), 3, Duration(1));
        assert_eq!(empty.reduce(nan_sum), 0.0);
        assert!(empty.reduce(max).is_nan());
    }

    #[test]
    fn test_aggregate() {
        let a = TimeSeries::with_data(Time(1), Duration(1), vec![1.0, NAN, 1.0]);
        let b = TimeSeries::with_data(Time(1), Duration(1), vec![NAN, NAN, 2.0]);
        let mut agg = Aggregate::new(nan_sum);
        agg.add(&a).add(&b);
        let sum = agg.get().unwrap();
        assert_eq!(sum.data(), &[1.0, 0.0, 3.0]);
    }

    #[test]
    fn test_linear_regression() {
        let ts = TimeSeries::with_data(Time(0), Duration(10), vec![0.0, 10.0, NAN, 30.0]);
        let lr = LinearRegression::new(&ts).unwrap();
        assert!((lr.calc(Time(50)) - 50.0).abs() < 1e-3);
        assert!(LinearRegression::new(&TimeSeries::new(Time(0), 3, Duration(1))).is_none());
    }

    #[test]
    fn test_iter_from() {
        let ts = TimeSeries::with_data(Time(0), Duration(10), vec![1.0, 2.0, 3.0]);
        let v: Vec<f32> = ts.iter_from(Time(15)).map(|(_, v)| v).collect();
        assert_eq!(v, vec![2.0, 3.0]);
        assert_eq!(ts.iter_from(Time(100)).count(), 0);
        assert_eq!(ts.last_not_nan(), Some((Time(20), 3.0)));
    }
}
