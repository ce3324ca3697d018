use crate::util::Interval;

/// A lookup table of evenly spaced samples, linearly interpolated between nodes.
#[derive(Clone, Debug)]
pub struct LookupTable {
    range: Interval<f64>,
    step: f64,
    values: Vec<f64>,
}

impl LookupTable {
    /// Creates a lookup table by sampling `f` at nodes no further than `step` apart.
    /// Both ends of `range` are sampled exactly.
    pub fn from_fn(range: Interval<f64>, step: f64, mut f: impl FnMut(f64) -> f64) -> Self {
        let intervals = (range.length() / step).ceil().max(1.0) as usize;
        let step = range.length() / intervals as f64;
        let values = (0..=intervals)
            .map(|i| f(range.min + i as f64 * step))
            .collect();
        Self {
            range,
            step,
            values,
        }
    }

    /// The domain of the table.
    pub fn range(&self) -> Interval<f64> {
        self.range
    }

    /// The sampled values, one per node.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// The x coordinate of the node with the given index.
    pub fn node(&self, idx: usize) -> f64 {
        self.range.min + idx as f64 * self.step
    }

    /// Samples the lookup table. Values outside the domain are clamped to it.
    pub fn sample(&self, x: f64) -> f64 {
        if self.values.len() < 2 || self.step <= 0.0 {
            return self.values[0];
        }
        let pos = (self.range.clamp(x) - self.range.min) / self.step;
        let idx = usize::min(pos as usize, self.values.len() - 2);
        let t = pos - idx as f64;
        let (a, b) = (self.values[idx], self.values[idx + 1]);
        a + t * (b - a)
    }

    /// A table whose node values are the running maximum of this one, from the left.
    pub fn running_max(&self) -> Self {
        let values = self
            .values
            .iter()
            .scan(f64::NEG_INFINITY, |max, v| {
                *max = f64::max(*max, *v);
                Some(*max)
            })
            .collect();
        Self { values, ..*self }
    }

    /// A table whose node values are the running maximum of this one, from the right.
    pub fn running_max_rev(&self) -> Self {
        let mut values: Vec<f64> = self
            .values
            .iter()
            .rev()
            .scan(f64::NEG_INFINITY, |max, v| {
                *max = f64::max(*max, *v);
                Some(*max)
            })
            .collect();
        values.reverse();
        Self { values, ..*self }
    }
}

#[cfg(test)]
mod test {
    use super::LookupTable;
    use crate::util::Interval;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn interpolates_between_nodes() {
        let range = Interval::new(50.0, 200.0);
        let lut = LookupTable::from_fn(range, 5.0, |x| 2.0 * x);

        assert_eq!(lut.values().len(), 31);
        assert_approx_eq!(lut.sample(50.0), 100.0);
        assert_approx_eq!(lut.sample(52.0), 104.0);
        assert_approx_eq!(lut.sample(197.5), 395.0);
        assert_approx_eq!(lut.sample(200.0), 400.0);
    }

    #[test]
    fn clamps_outside_domain() {
        let lut = LookupTable::from_fn(Interval::new(0.0, 10.0), 1.0, |x| x * x);
        assert_approx_eq!(lut.sample(-5.0), 0.0);
        assert_approx_eq!(lut.sample(888.0), 100.0);
    }

    #[test]
    fn running_maxima() {
        let lut = LookupTable::from_fn(Interval::new(0.0, 4.0), 1.0, |x| x * (4.0 - x));
        assert_eq!(lut.values(), &[0.0, 3.0, 4.0, 3.0, 0.0]);
        assert_eq!(lut.running_max().values(), &[0.0, 3.0, 4.0, 4.0, 4.0]);
        assert_eq!(lut.running_max_rev().values(), &[4.0, 4.0, 4.0, 3.0, 0.0]);
    }
}
