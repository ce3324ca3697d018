//! Mathematical structs and functions.

pub use fit::{fit_parabola_through_origin, Parabola};
pub use lut::LookupTable;
pub use stats::{percentile, RunningMean};

mod fit;
mod lut;
mod stats;
