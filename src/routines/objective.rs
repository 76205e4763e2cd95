use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};
use crate::simulation::Simulation;
use crate::structs::dataset::Dataset;

/// Value of an objective function, a single number or one number per variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectiveValue {
    Scalar(f64),
    Named(BTreeMap<String, f64>),
}

impl ObjectiveValue {
    /// Names of the objectives, `scalar_name` for a single value
    pub fn names(&self, scalar_name: &str) -> Vec<String> {
        match self {
            ObjectiveValue::Scalar(_) => vec![scalar_name.to_string()],
            ObjectiveValue::Named(values) => values.keys().cloned().collect(),
        }
    }

    /// Sum of all components
    pub fn total(&self) -> f64 {
        match self {
            ObjectiveValue::Scalar(v) => *v,
            ObjectiveValue::Named(values) => values.values().sum(),
        }
    }
}

/// Compares simulation results against the observations of a [Simulation]
pub trait Objective: Send + Sync {
    fn name(&self) -> &str;

    fn objective(&self, simulation: &Simulation, results: &Dataset) -> Result<ObjectiveValue>;
}

/// Mean squared difference over all data variables, in scaled units
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalAverage;

/// Mean squared difference per data variable, in scaled units
#[derive(Debug, Clone, Copy, Default)]
pub struct PerVariable;

impl Objective for TotalAverage {
    fn name(&self) -> &str {
        "total_average"
    }

    fn objective(&self, simulation: &Simulation, results: &Dataset) -> Result<ObjectiveValue> {
        let (sum, count) = squared_differences(simulation, results)?
            .values()
            .fold((0.0, 0usize), |(s, n), (vs, vn)| (s + vs, n + vn));
        Ok(ObjectiveValue::Scalar(mean(sum, count)))
    }
}

impl Objective for PerVariable {
    fn name(&self) -> &str {
        "per_variable"
    }

    fn objective(&self, simulation: &Simulation, results: &Dataset) -> Result<ObjectiveValue> {
        let values = squared_differences(simulation, results)?
            .into_iter()
            .map(|(var, (sum, count))| (var, mean(sum, count)))
            .collect();
        Ok(ObjectiveValue::Named(values))
    }
}

/// Look up an objective by its settings name
pub fn objective_by_name(name: &str) -> Result<Box<dyn Objective>> {
    match name {
        "total_average" => Ok(Box::new(TotalAverage)),
        "per_variable" => Ok(Box::new(PerVariable)),
        _ => Err(SimulationError::UnknownIdentifier {
            kind: "objective",
            name: name.to_string(),
        }),
    }
}

fn mean(sum: f64, count: usize) -> f64 {
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Sum of squared scaled differences and number of observed values, per data variable
///
/// Missing (NaN) observations are skipped.
fn squared_differences(
    simulation: &Simulation,
    results: &Dataset,
) -> Result<BTreeMap<String, (f64, usize)>> {
    let scaled_results = simulation.scale_results(results)?;
    let observations = simulation.scaled_observations();

    let mut differences = BTreeMap::new();
    for var in &simulation.settings().simulation.data_variables {
        let y = scaled_results.get(var).ok_or_else(|| {
            SimulationError::config(format!("data variable '{}' is missing from the results", var))
        })?;
        let obs = observations.get(var).ok_or_else(|| {
            SimulationError::config(format!(
                "data variable '{}' is missing from the observations",
                var
            ))
        })?;
        if y.dims != obs.dims || y.values.shape() != obs.values.shape() {
            return Err(SimulationError::shape(format!(
                "results of '{}' have dimensions {:?} {:?}, observations {:?} {:?}",
                var,
                y.dims,
                y.values.shape(),
                obs.dims,
                obs.values.shape()
            )));
        }
        let (sum, count) = y
            .values
            .iter()
            .zip(obs.values.iter())
            .filter(|(_, o)| !o.is_nan())
            .fold((0.0, 0usize), |(s, n), (y, o)| (s + (y - o).powi(2), n + 1));
        differences.insert(var.clone(), (sum, count));
    }
    Ok(differences)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(objective_by_name("total_average").unwrap().name(), "total_average");
        assert_eq!(objective_by_name("per_variable").unwrap().name(), "per_variable");
        assert!(matches!(
            objective_by_name("likelihood"),
            Err(SimulationError::UnknownIdentifier { .. })
        ));
    }

    #[test]
    fn test_value_names_and_total() {
        let scalar = ObjectiveValue::Scalar(0.5);
        assert_eq!(scalar.names("total_average"), vec!["total_average".to_string()]);
        assert_eq!(scalar.total(), 0.5);

        let mut values = BTreeMap::new();
        values.insert("cext".to_string(), 0.25);
        values.insert("cint".to_string(), 0.5);
        let named = ObjectiveValue::Named(values);
        assert_eq!(named.names(""), vec!["cext".to_string(), "cint".to_string()]);
        assert_eq!(named.total(), 0.75);
    }
}
