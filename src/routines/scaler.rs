use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};
use crate::routines::settings::Bounds;
use crate::structs::dataset::Dataset;

/// Scaled values above this bound are reported as infeasible
const UPPER_FEASIBLE: f64 = 2.0;
/// Scaled values below this bound are reported as infeasible
const LOWER_FEASIBLE: f64 = -1.0;

/// Per variable min-max scaling into `[0, 1]`
///
/// The range of a variable spans its finite observations and its declared bounds, so results
/// inside the declared bounds always land inside `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    ranges: BTreeMap<String, (f64, f64)>,
}

impl MinMaxScaler {
    pub fn fit(
        observations: &Dataset,
        data_variables: &[String],
        bounds: &BTreeMap<String, Bounds>,
    ) -> Result<Self> {
        let mut ranges = BTreeMap::new();
        for var in data_variables {
            let array = observations.get(var).ok_or_else(|| {
                SimulationError::config(format!(
                    "data variable '{}' is missing from the observations",
                    var
                ))
            })?;
            let declared = bounds.get(var).copied().unwrap_or_default();
            let candidates = array
                .values
                .iter()
                .copied()
                .chain(declared.min)
                .chain(declared.max)
                .filter(|v| v.is_finite());

            let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
            for v in candidates {
                min = min.min(v);
                max = max.max(v);
            }
            if min > max {
                // nothing finite to fit on
                min = 0.0;
                max = 0.0;
            }
            tracing::info!("Scaling '{}' from [{}, {}] to [0, 1]", var, min, max);
            ranges.insert(var.clone(), (min, max));
        }
        Ok(MinMaxScaler { ranges })
    }

    pub fn range(&self, var: &str) -> Option<(f64, f64)> {
        self.ranges.get(var).copied()
    }

    pub fn variables(&self) -> Vec<String> {
        self.ranges.keys().cloned().collect()
    }

    pub fn transform(&self, dataset: &Dataset) -> Result<Dataset> {
        self.map(dataset, |v, min, scale| (v - min) / scale)
    }

    pub fn inverse_transform(&self, dataset: &Dataset) -> Result<Dataset> {
        self.map(dataset, |v, min, scale| v * scale + min)
    }

    fn map<F>(&self, dataset: &Dataset, f: F) -> Result<Dataset>
    where
        F: Fn(f64, f64, f64) -> f64,
    {
        let mut scaled = Dataset::new(dataset.coords.clone());
        for (var, array) in dataset.iter() {
            let (min, max) = self.range(var).ok_or_else(|| {
                SimulationError::config(format!("the scaler was not fitted on '{}'", var))
            })?;
            let scale = if max > min { max - min } else { 1.0 };
            let values: ArrayD<f64> = array.values.mapv(|v| f(v, min, scale));
            scaled.insert(var.clone(), array.dims.clone(), values)?;
        }
        Ok(scaled)
    }
}

/// Warn about scaled values far outside `[0, 1]`, returns `false` if any were found
pub fn check_feasibility(scaled: &Dataset) -> bool {
    let mut feasible = true;
    for (var, array) in scaled.iter() {
        let above = array.values.iter().filter(|v| **v > UPPER_FEASIBLE).count();
        let below = array.values.iter().filter(|v| **v < LOWER_FEASIBLE).count();
        if above > 0 {
            tracing::warn!(
                "{} scaled value(s) of '{}' exceed {}, the result is likely far out of bounds",
                above,
                var,
                UPPER_FEASIBLE
            );
            feasible = false;
        }
        if below > 0 {
            tracing::warn!(
                "{} scaled value(s) of '{}' are below {}, the result is likely far out of bounds",
                below,
                var,
                LOWER_FEASIBLE
            );
            feasible = false;
        }
    }
    feasible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::dataset::{Coordinates, Label};
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};

    fn dataset(values: Vec<f64>) -> Dataset {
        let coords =
            Coordinates::new().with("time", (0..values.len() as i64).map(Label::Int).collect());
        let mut ds = Dataset::new(coords);
        let n = values.len();
        ds.insert(
            "cext",
            vec!["time".to_string()],
            ArrayD::from_shape_vec(IxDyn(&[n]), values).unwrap(),
        )
        .unwrap();
        ds
    }

    fn bounds(min: f64, max: f64) -> BTreeMap<String, Bounds> {
        let mut b = BTreeMap::new();
        b.insert(
            "cext".to_string(),
            Bounds {
                min: Some(min),
                max: Some(max),
            },
        );
        b
    }

    #[test]
    fn test_declared_bounds_map_to_unit_interval() {
        let obs = dataset(vec![100.0, 500.0, f64::NAN]);
        let scaler = MinMaxScaler::fit(&obs, &["cext".to_string()], &bounds(0.0, 1000.0)).unwrap();
        assert_eq!(scaler.range("cext"), Some((0.0, 1000.0)));

        let scaled = scaler.transform(&dataset(vec![0.0, 1000.0, 250.0])).unwrap();
        let values = &scaled.get("cext").unwrap().values;
        assert_relative_eq!(values[0], 0.0);
        assert_relative_eq!(values[1], 1.0);
        assert_relative_eq!(values[2], 0.25);

        let restored = scaler.inverse_transform(&scaled).unwrap();
        assert_relative_eq!(restored.get("cext").unwrap().values[2], 250.0);
    }

    #[test]
    fn test_zero_range_uses_unit_scale() {
        let obs = dataset(vec![3.0, 3.0]);
        let scaler = MinMaxScaler::fit(&obs, &["cext".to_string()], &BTreeMap::new()).unwrap();
        let scaled = scaler.transform(&obs).unwrap();
        assert!(scaled.get("cext").unwrap().values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_feasibility() {
        assert!(check_feasibility(&dataset(vec![0.0, 1.5, -0.5])));
        assert!(!check_feasibility(&dataset(vec![0.0, 2.5])));
        assert!(!check_feasibility(&dataset(vec![-3.0])));
    }
}
