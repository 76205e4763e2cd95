use std::collections::BTreeMap;

use ndarray::Array2;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};

/// Exogenous forcing, sampled on a shared time grid
///
/// Every series has shape `(batch, time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forcing {
    pub time: Vec<f64>,
    pub series: BTreeMap<String, Array2<f64>>,
}

impl Forcing {
    pub fn new(time: Vec<f64>) -> Self {
        Forcing {
            time,
            series: BTreeMap::new(),
        }
    }

    /// Add a series of shape `(batch, time)`
    pub fn add(mut self, name: impl Into<String>, values: Array2<f64>) -> Result<Self> {
        let name = name.into();
        if values.ncols() != self.time.len() {
            return Err(SimulationError::shape(format!(
                "forcing '{}' has {} samples, the forcing time grid has {}",
                name,
                values.ncols(),
                self.time.len()
            )));
        }
        if self.time.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SimulationError::config(
                "forcing time points must be strictly increasing",
            ));
        }
        self.series.insert(name, values);
        Ok(self)
    }

    /// Length of the batch axis, if all series agree on it
    pub fn batch_size(&self) -> Option<usize> {
        let mut sizes = self.series.values().map(|s| s.nrows());
        let first = sizes.next()?;
        sizes.all(|n| n == first).then_some(first)
    }

    /// The interpolant of batch element `b`
    pub fn interpolant(&self, b: usize) -> Interpolant {
        Interpolant {
            ts: self.time.clone(),
            ys: self
                .series
                .iter()
                .map(|(name, values)| (name.clone(), values.row(b).to_vec()))
                .collect(),
        }
    }
}

/// Piecewise linear interpolation of forcing series, constant beyond the end points
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolant {
    ts: Vec<f64>,
    ys: BTreeMap<String, Vec<f64>>,
}

impl Interpolant {
    pub fn evaluate(&self, name: &str, t: f64) -> Option<f64> {
        let ys = self.ys.get(name)?;
        let n = self.ts.len();
        if n == 0 {
            return None;
        }
        if t <= self.ts[0] {
            return Some(ys[0]);
        }
        if t >= self.ts[n - 1] {
            return Some(ys[n - 1]);
        }
        // first index with ts[i] > t
        let i = self.ts.partition_point(|&x| x <= t);
        let (t0, t1) = (self.ts[i - 1], self.ts[i]);
        let w = (t - t0) / (t1 - t0);
        Some(ys[i - 1] + w * (ys[i] - ys[i - 1]))
    }

    /// Breakpoints strictly inside `(t_min, t_max)`, where the integrator has to step exactly
    pub fn jump_times(&self, t_min: f64, t_max: f64) -> Vec<f64> {
        self.ts
            .iter()
            .copied()
            .filter(|&t| t > t_min && t < t_max)
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.ys.keys().cloned().collect()
    }
}
