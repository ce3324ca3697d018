use serde::{Deserialize, Serialize};

/// A parabola through the origin, `y = a·x + b·x²`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parabola {
    pub a: f64,
    pub b: f64,
}

impl Parabola {
    pub fn y(&self, x: f64) -> f64 {
        self.a * x + self.b * x * x
    }

    /// The derivative `dy/dx` at `x`.
    pub fn dy(&self, x: f64) -> f64 {
        self.a + 2.0 * self.b * x
    }

    /// The stationary point `x = -a / 2b`, if the parabola opens downwards.
    pub fn vertex(&self) -> Option<f64> {
        (self.b < 0.0).then(|| -self.a / (2.0 * self.b))
    }

    /// The non-zero root `x = -a / b`, if there is one.
    pub fn root(&self) -> Option<f64> {
        (self.b != 0.0).then(|| -self.a / self.b)
    }
}

/// Least-squares fit of `y = a·x + b·x²` to the given points.
///
/// Returns `None` if the normal equations are singular, which happens when the
/// points do not contain at least two distinct non-zero `x` values.
pub fn fit_parabola_through_origin(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Parabola> {
    let (mut s2, mut s3, mut s4, mut sxy, mut sx2y) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y) in points {
        let x2 = x * x;
        s2 += x2;
        s3 += x2 * x;
        s4 += x2 * x2;
        sxy += x * y;
        sx2y += x2 * y;
    }

    // | s2 s3 | |a|   | sxy  |
    // | s3 s4 | |b| = | sx2y |
    let det = s2 * s4 - s3 * s3;
    if !det.is_finite() || det.abs() <= 1e-12 * s2 * s4 {
        return None;
    }
    Some(Parabola {
        a: (sxy * s4 - s3 * sx2y) / det,
        b: (s2 * sx2y - s3 * sxy) / det,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::{Rng, SeedableRng};

    #[test]
    fn recovers_exact_parabolas() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..100 {
            let a = rng.gen_range(20.0..120.0);
            let b = rng.gen_range(-2.0..-0.1);
            let points = (1..40).map(|i| {
                let x = i as f64 * 2.5;
                (x, a * x + b * x * x)
            });
            let fit = fit_parabola_through_origin(points).unwrap();
            assert_approx_eq!(fit.a, a, 1e-4);
            assert_approx_eq!(fit.b, b, 1e-4);
        }
    }

    #[test]
    fn singular_input() {
        assert!(fit_parabola_through_origin([(0.0, 0.0), (0.0, 5.0)]).is_none());
        assert!(fit_parabola_through_origin([(3.0, 10.0), (3.0, 12.0)]).is_none());
    }

    #[test]
    fn vertex_and_root() {
        let p = Parabola { a: 90.0, b: -1.0 };
        assert_approx_eq!(p.vertex().unwrap(), 45.0);
        assert_approx_eq!(p.root().unwrap(), 90.0);
        assert_approx_eq!(p.dy(45.0), 0.0);
        assert!(Parabola { a: 90.0, b: 0.5 }.vertex().is_none());
    }
}
