//! Observational counters reported by stack entries.

use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// A single named value reported by a stack entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistic {
    /// Name of the stage that reported the value.
    pub owner: Arc<str>,
    /// Name of the value within the stage.
    pub name: Cow<'static, str>,
    /// The reported value.
    pub value: StatisticValue,
}

impl Statistic {
    pub fn new(
        owner: &Arc<str>,
        name: impl Into<Cow<'static, str>>,
        value: impl Into<StatisticValue>,
    ) -> Self {
        Self {
            owner: owner.clone(),
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Display for Statistic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}: {}", self.owner, self.name, self.value)
    }
}

/// The value of a [`Statistic`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatisticValue {
    Integer(i64),
    ByteSize(u64),
    /// A ratio in the `0..=100` range.
    Percentage(f64),
    Float(f64),
    Boolean(bool),
}

impl StatisticValue {
    /// An integer statistic from a count of items.
    pub fn count(count: usize) -> Self {
        StatisticValue::Integer(i64::try_from(count).unwrap_or(i64::MAX))
    }

    /// Returns the value as an `i64` if it is integral.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            StatisticValue::Integer(v) => Some(*v),
            StatisticValue::ByteSize(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl From<i64> for StatisticValue {
    fn from(value: i64) -> Self {
        StatisticValue::Integer(value)
    }
}

impl From<bool> for StatisticValue {
    fn from(value: bool) -> Self {
        StatisticValue::Boolean(value)
    }
}

impl From<f64> for StatisticValue {
    fn from(value: f64) -> Self {
        StatisticValue::Float(value)
    }
}

impl Display for StatisticValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StatisticValue::Integer(v) => write!(f, "{v}"),
            StatisticValue::ByteSize(v) => write!(f, "{v}B"),
            StatisticValue::Percentage(v) => write!(f, "{v:.1}%"),
            StatisticValue::Float(v) => write!(f, "{v:.3}"),
            StatisticValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// Running average over the last `N` pushed samples.
#[derive(Debug, Clone)]
pub struct AverageWindow<const N: usize> {
    samples: [f64; N],
    next: usize,
    len: usize,
    sum: f64,
}

impl<const N: usize> Default for AverageWindow<N> {
    fn default() -> Self {
        Self {
            samples: [0.0; N],
            next: 0,
            len: 0,
            sum: 0.0,
        }
    }
}

impl<const N: usize> AverageWindow<N> {
    pub fn push(&mut self, sample: f64) {
        if N == 0 {
            return;
        }
        if self.len == N {
            self.sum -= self.samples[self.next];
        } else {
            self.len += 1;
        }
        self.samples[self.next] = sample;
        self.sum += sample;
        self.next = (self.next + 1) % N;
    }

    /// Returns the mean of the retained samples, or zero when empty.
    pub fn average(&self) -> f64 {
        if self.len == 0 {
            0.0
        } else {
            self.sum / self.len as f64
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
