use argmin::{
    core::{CostFunction, Error, Executor},
    solver::neldermead::NelderMead,
};
use ndarray::Array1;

use crate::simulation::Simulation;
use crate::structs::parameters::FlatParameters;

/// Objective of a [Simulation] as a function of its free parameters
///
/// The parameter vector follows the order of [Simulation::free_parameter_names]. Named
/// objectives are summed into a single cost.
pub struct Calibration<'a> {
    simulation: &'a Simulation,
    names: Vec<String>,
}

impl<'a> CostFunction for Calibration<'a> {
    type Param = Array1<f64>;
    type Output = f64;
    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        let theta = self.theta(param);
        let evaluator = self.simulation.dispatch(&theta)?;
        let results = self.simulation.evaluate(&evaluator)?;
        let value = self.simulation.objective_function(&results)?;
        let cost = value.total();
        if cost.is_nan() {
            tracing::warn!("Objective is NaN for {:?}", theta);
            return Ok(f64::INFINITY);
        }
        Ok(cost)
    }
}

impl<'a> Calibration<'a> {
    pub fn new(simulation: &'a Simulation) -> Self {
        Self {
            names: simulation.free_parameter_names(),
            simulation,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Zip a parameter vector with the free parameter names
    pub fn theta(&self, param: &Array1<f64>) -> FlatParameters {
        self.names
            .iter()
            .cloned()
            .zip(param.iter().copied())
            .collect()
    }

    /// Minimize the objective with Nelder-Mead, starting at the configured free values
    pub fn optimize(self, max_iters: u64, tolerance: f64) -> Result<FlatParameters, Error> {
        let start: Array1<f64> = self
            .simulation
            .free_parameter_values()
            .values()
            .copied()
            .collect();
        let simplex = create_initial_simplex(&start, &self.simulation.free_parameter_steps());
        let solver = NelderMead::new(simplex).with_sd_tolerance(tolerance)?;
        let names = self.names.clone();
        let res = Executor::new(self, solver)
            .configure(|state| state.max_iters(max_iters))
            .run()?;
        let best = res
            .state
            .best_param
            .ok_or_else(|| Error::msg("Nelder-Mead finished without a best parameter vector"))?;
        tracing::info!(
            "Calibration finished after {} iterations with objective {}",
            res.state.iter,
            res.state.best_cost
        );
        Ok(names.into_iter().zip(best.iter().copied()).collect())
    }
}

/// Initial simplex around `initial_point`, one vertex perturbed along each parameter
fn create_initial_simplex(initial_point: &Array1<f64>, steps: &[f64]) -> Vec<Array1<f64>> {
    let num_dimensions = initial_point.len();
    let perturbation_percentage = 0.05;

    let mut vertices = Vec::with_capacity(num_dimensions + 1);
    vertices.push(initial_point.to_owned());

    for i in 0..num_dimensions {
        let perturbation = match steps.get(i) {
            Some(step) if *step > 0.0 => *step,
            _ if initial_point[i] == 0.0 => 0.00025,
            _ => perturbation_percentage * initial_point[i],
        };

        let mut perturbed_point = initial_point.to_owned();
        perturbed_point[i] += perturbation;
        vertices.push(perturbed_point);
    }

    vertices
}
