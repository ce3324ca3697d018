//! Miscellaneous utility structs and functions.

use std::fmt::Debug;

use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};

/// An interval on the real number line.
#[derive(Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interval<T> {
    pub min: T,
    pub max: T,
}

impl<T> Interval<T> {
    /// Creates a new interval.
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: std::cmp::PartialOrd> Interval<T> {
    /// Returns true if this interval contains the value.
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }

    /// Returns true if the value lies inside the interval, excluding its end points.
    pub fn contains_strictly(&self, value: T) -> bool {
        value > self.min && value < self.max
    }
}

impl<T: std::ops::Sub<T, Output = T> + Copy> Interval<T> {
    /// Gets the magnitude of the interval.
    pub fn length(&self) -> T {
        self.max - self.min
    }
}

impl Interval<f64> {
    /// The smallest interval containing every finite value, or `None` if there are none.
    pub fn spanning(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let finite = values.into_iter().filter(|v| v.is_finite());
        match finite.minmax_by(|a, b| a.total_cmp(b)) {
            MinMaxResult::NoElements => None,
            MinMaxResult::OneElement(v) => Some(Self::new(v, v)),
            MinMaxResult::MinMax(min, max) => Some(Self::new(min, max)),
        }
    }

    /// Clamps a value into the interval.
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

impl<T: Debug> Debug for Interval<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interval({:?}, {:?})", &self.min, &self.max)
    }
}

#[cfg(test)]
mod test {
    use super::Interval;

    #[test]
    fn spanning_ignores_non_finite() {
        let span = Interval::spanning([3.0, f64::NAN, -1.0, 7.5, f64::INFINITY]).unwrap();
        assert_eq!(span, Interval::new(-1.0, 7.5));
        assert!(Interval::spanning([f64::NAN]).is_none());
    }

    #[test]
    fn strict_containment() {
        let range = Interval::new(10.0, 20.0);
        assert!(range.contains(10.0));
        assert!(!range.contains_strictly(10.0));
        assert!(range.contains_strictly(15.0));
        assert!(!range.contains_strictly(20.0));
    }
}
