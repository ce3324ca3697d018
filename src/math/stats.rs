use serde::{Deserialize, Serialize};

/// The `q`-th quantile (0 ≤ q ≤ 1) of the finite values, linearly interpolated
/// between the closest ranks. Returns `None` when there are no finite values.
pub fn percentile(values: impl IntoIterator<Item = f64>, q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = usize::min(lo + 1, sorted.len() - 1);
    let t = rank - lo as f64;
    Some(sorted[lo] + t * (sorted[hi] - sorted[lo]))
}

/// An incrementally updated arithmetic mean.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    count: usize,
    mean: f64,
}

impl RunningMean {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }

    /// The mean of all pushed values, or zero if none were pushed.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn percentiles() {
        let values = (1..=101).map(|v| v as f64);
        assert_approx_eq!(percentile(values.clone(), 0.99).unwrap(), 100.0);
        assert_approx_eq!(percentile(values.clone(), 0.5).unwrap(), 51.0);
        assert_approx_eq!(percentile([4.0, 2.0], 0.5).unwrap(), 3.0);
        assert!(percentile([f64::NAN], 0.5).is_none());
    }

    #[test]
    fn running_mean() {
        let mut mean = RunningMean::default();
        assert_eq!(mean.mean(), 0.0);
        for v in [10.0, 20.0, 30.0, 40.0] {
            mean.push(v);
        }
        assert_eq!(mean.count(), 4);
        assert_approx_eq!(mean.mean(), 25.0);
    }
}
