use std::collections::BTreeMap;

use ndarray::{Array2, ArrayD, IxDyn};
use rayon::prelude::*;

use crate::error::{Result, SimulationError};
use crate::simulator::integrator::{integrate, IntegrationOptions, Outcome};
use crate::simulator::interpolation::Forcing;
use crate::simulator::{OdeArgs, OdeModel, PostProcessing, Trajectories};
use crate::structs::coordinates::Dimensionality;

/// Named inputs with a leading batch axis, shape `(batch, k)`
pub type Batch = BTreeMap<String, Array2<f64>>;

/// Solver output, one array per state or post-processed variable
pub type SolverOutput = BTreeMap<String, ArrayD<f64>>;

/// Batch-parallel solver of an [OdeModel] on a fixed time grid
///
/// The solver is immutable once built, [Solver::solve] is a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct Solver {
    options: IntegrationOptions,
    throw_exception: bool,
    model: OdeModel,
    post_processing: Option<PostProcessing>,
    time: Vec<f64>,
    dimensionality: Dimensionality,
}

impl Solver {
    pub fn new(
        options: IntegrationOptions,
        throw_exception: bool,
        model: OdeModel,
        post_processing: Option<PostProcessing>,
        time: Vec<f64>,
        dimensionality: Dimensionality,
    ) -> Result<Self> {
        if time.is_empty() {
            return Err(SimulationError::config("the time grid of the solver is empty"));
        }
        if time.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SimulationError::config(
                "the time grid of the solver must be strictly increasing",
            ));
        }
        Ok(Solver {
            options,
            throw_exception,
            model,
            post_processing,
            time,
            dimensionality,
        })
    }

    pub fn options(&self) -> &IntegrationOptions {
        &self.options
    }

    pub fn throw_exception(&self) -> bool {
        self.throw_exception
    }

    pub fn model(&self) -> &OdeModel {
        &self.model
    }

    pub fn post_processing(&self) -> Option<&PostProcessing> {
        self.post_processing.as_ref()
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn dimensionality(&self) -> &Dimensionality {
        &self.dimensionality
    }

    /// Solve every batch element and reshape the results to their declared dimensionality
    ///
    /// `parameters`, `y0` and the forcing series share the length of their leading axis. Each
    /// state in `y0` holds a single column. Variables without a declared dimensionality are
    /// returned with shape `(batch, time)`.
    pub fn solve(
        &self,
        parameters: &Batch,
        y0: &Batch,
        x_in: Option<&Forcing>,
        seed: Option<u64>,
    ) -> Result<SolverOutput> {
        let batch_size = self.batch_size(parameters, y0, x_in)?;

        let states = self.initial_states(y0, batch_size)?;
        let ode_names = self.model.parameters().to_vec();
        let ode_args = gather(parameters, &ode_names, batch_size, "model")?;
        let (pp_names, pp_args) = match &self.post_processing {
            Some(pp) => {
                let names = pp.parameters().to_vec();
                let args = gather(parameters, &names, batch_size, "post-processing")?;
                (names, args)
            }
            None => (Vec::new(), Vec::new()),
        };

        tracing::debug!(
            "Solving '{}' for {} batch element(s) with {}",
            self.model.name(),
            batch_size,
            self.options.method
        );

        let results: Vec<Trajectories> = (0..batch_size)
            .into_par_iter()
            .map(|b| {
                let pp_values = pp_args.get(b).map(|v| v.as_slice()).unwrap_or(&[]);
                self.solve_element(
                    b,
                    &states[b],
                    &ode_names,
                    &ode_args[b],
                    &pp_names,
                    pp_values,
                    x_in,
                    seed,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        self.stack(results, batch_size)
    }

    fn batch_size(&self, parameters: &Batch, y0: &Batch, x_in: Option<&Forcing>) -> Result<usize> {
        let mut sizes: Vec<(String, usize)> = parameters
            .iter()
            .chain(y0.iter())
            .map(|(name, values)| (name.clone(), values.nrows()))
            .collect();
        if let Some(forcing) = x_in {
            sizes.extend(
                forcing
                    .series
                    .iter()
                    .map(|(name, values)| (name.clone(), values.nrows())),
            );
        }
        let (_, first) = sizes
            .first()
            .cloned()
            .ok_or_else(|| SimulationError::config("no initial values were passed to the solver"))?;
        if let Some((name, n)) = sizes.iter().find(|(_, n)| *n != first) {
            return Err(SimulationError::shape(format!(
                "input '{}' has a batch axis of length {}, expected {}",
                name, n, first
            )));
        }
        Ok(first)
    }

    /// Initial values per batch element, in the declared state order
    fn initial_states(&self, y0: &Batch, batch_size: usize) -> Result<Vec<Vec<f64>>> {
        let mut columns = Vec::with_capacity(self.model.nstates());
        for state in self.model.states() {
            let values = y0.get(state).ok_or_else(|| {
                SimulationError::config(format!(
                    "no initial value for state '{}' of model '{}'",
                    state,
                    self.model.name()
                ))
            })?;
            if values.ncols() != 1 {
                return Err(SimulationError::shape(format!(
                    "initial value of '{}' has {} entries per batch element, expected 1",
                    state,
                    values.ncols()
                )));
            }
            columns.push(values.column(0).to_vec());
        }
        Ok((0..batch_size)
            .map(|b| columns.iter().map(|c| c[b]).collect())
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn solve_element(
        &self,
        element: usize,
        y0: &[f64],
        ode_names: &[String],
        ode_values: &[Vec<f64>],
        pp_names: &[String],
        pp_values: &[Vec<f64>],
        x_in: Option<&Forcing>,
        seed: Option<u64>,
    ) -> Result<Trajectories> {
        let interpolant = x_in.map(|f| f.interpolant(element));
        let args = OdeArgs::new(ode_names, ode_values, interpolant.as_ref(), seed);

        let t0 = self.time[0];
        let t1 = self.time[self.time.len() - 1];
        let jumps = interpolant
            .as_ref()
            .map(|i| i.jump_times(t0, t1))
            .unwrap_or_default();

        let result = integrate(
            |t, y, dy| self.model.rhs(t, y, &args, dy),
            y0,
            &self.time,
            &jumps,
            &self.options,
        );

        tracing::trace!(
            "Batch element {}: {} accepted, {} rejected steps, {} evaluations",
            element,
            result.stats.accepted,
            result.stats.rejected,
            result.stats.evaluations
        );
        if let Outcome::Diverged { time } = result.outcome {
            if self.throw_exception {
                return Err(SimulationError::SolverDivergence {
                    element,
                    time,
                    max_steps: self.options.max_steps,
                });
            }
            tracing::debug!(
                "Batch element {} reached the step limit at t = {}, remaining values set to inf",
                element,
                time
            );
        }

        let mut trajectories: Trajectories = self
            .model
            .states()
            .iter()
            .cloned()
            .zip(result.ys)
            .collect();

        if let Some(pp) = &self.post_processing {
            let pp_args = OdeArgs::new(pp_names, pp_values, interpolant.as_ref(), seed);
            let derived = pp.apply(&trajectories, &self.time, interpolant.as_ref(), &pp_args)?;
            trajectories.extend(derived);
        }

        Ok(trajectories)
    }

    fn stack(&self, results: Vec<Trajectories>, batch_size: usize) -> Result<SolverOutput> {
        let mut output = SolverOutput::new();
        let Some(first) = results.first() else {
            return Ok(output);
        };

        for (name, values) in first {
            let len = values.len();
            let mut data = Vec::with_capacity(batch_size * len);
            for element in &results {
                let row = element.get(name).ok_or_else(|| {
                    SimulationError::shape(format!(
                        "variable '{}' is missing from some batch elements",
                        name
                    ))
                })?;
                if row.len() != len {
                    return Err(SimulationError::shape(format!(
                        "variable '{}' has {} values in one batch element and {} in another",
                        name,
                        len,
                        row.len()
                    )));
                }
                data.extend_from_slice(row);
            }

            let shape = self
                .dimensionality
                .shape(name)
                .unwrap_or_else(|| vec![batch_size, len]);
            if shape.iter().product::<usize>() != data.len() {
                return Err(SimulationError::shape(format!(
                    "cannot reshape '{}' with {} values into {:?}",
                    name,
                    data.len(),
                    shape
                )));
            }
            let array = ArrayD::from_shape_vec(IxDyn(&shape), data)
                .map_err(|e| SimulationError::shape(format!("variable '{}': {}", name, e)))?;
            output.insert(name.clone(), array);
        }
        Ok(output)
    }
}

/// Argument values of each batch element, in the order of `names`
fn gather(
    parameters: &Batch,
    names: &[String],
    batch_size: usize,
    consumer: &str,
) -> Result<Vec<Vec<Vec<f64>>>> {
    let mut columns = Vec::with_capacity(names.len());
    for name in names {
        let values = parameters.get(name).ok_or_else(|| {
            SimulationError::config(format!(
                "parameter '{}' required by the {} was not passed to the solver",
                name, consumer
            ))
        })?;
        columns.push(values);
    }
    Ok((0..batch_size)
        .map(|b| columns.iter().map(|c| c.row(b).to_vec()).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch_params;
    use crate::simulator::interpolation::Interpolant;
    use crate::simulator::T;
    use ndarray::array;

    fn tktd(_t: T, y: &[f64], args: &OdeArgs, dy: &mut [f64]) {
        fetch_params!(args, alpha, beta);
        dy[0] = -beta * y[0];
        dy[1] = alpha * (y[0] - y[1]);
    }

    fn scaled(
        trajectories: &Trajectories,
        _time: &[f64],
        _forcing: Option<&Interpolant>,
        args: &OdeArgs,
    ) -> Result<Trajectories> {
        fetch_params!(args, scale);
        let mut out = Trajectories::new();
        let cint = &trajectories["cint"];
        out.insert("response".to_string(), cint.iter().map(|c| c * scale).collect());
        Ok(out)
    }

    fn solver(max_steps: usize, throw_exception: bool) -> Solver {
        let model = OdeModel::new("tktd", &["cext", "cint"], &["alpha", "beta"], tktd);
        let options = IntegrationOptions {
            max_steps,
            ..Default::default()
        };
        let time = (0..20).map(|t| t as f64).collect();
        Solver::new(
            options,
            throw_exception,
            model,
            None,
            time,
            Dimensionality::default(),
        )
        .unwrap()
    }

    fn inputs(alpha: f64) -> (Batch, Batch) {
        let mut parameters = Batch::new();
        parameters.insert("alpha".to_string(), array![[alpha], [alpha]]);
        parameters.insert("beta".to_string(), array![[0.02], [0.1]]);
        let mut y0 = Batch::new();
        y0.insert("cext".to_string(), array![[1000.0], [500.0]]);
        y0.insert("cint".to_string(), array![[0.0], [0.0]]);
        (parameters, y0)
    }

    #[test]
    fn test_solve_is_deterministic() {
        let (parameters, y0) = inputs(5.0);
        let s = solver(5000, true);
        let first = s.solve(&parameters, &y0, None, None).unwrap();
        let second = s.solve(&parameters, &y0, None, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first["cext"].shape(), &[2, 20]);
        assert_eq!(first["cext"][[0, 0]], 1000.0);
        assert_eq!(first["cint"].iter().filter(|v| v.is_infinite()).count(), 0);
    }

    #[test]
    fn test_batch_length_mismatch() {
        let (mut parameters, y0) = inputs(5.0);
        parameters.insert("beta".to_string(), array![[0.02]]);
        let result = solver(5000, true).solve(&parameters, &y0, None, None);
        assert!(matches!(result, Err(SimulationError::ShapeMismatch(_))));
    }

    #[test]
    fn test_missing_model_parameter() {
        let (mut parameters, y0) = inputs(5.0);
        parameters.remove("beta");
        let result = solver(5000, true).solve(&parameters, &y0, None, None);
        assert!(matches!(result, Err(SimulationError::Configuration(_))));
    }

    #[test]
    fn test_divergence_policy() {
        let (parameters, y0) = inputs(500.0);
        let result = solver(200, true).solve(&parameters, &y0, None, None);
        assert!(matches!(result, Err(SimulationError::SolverDivergence { .. })));

        let output = solver(200, false).solve(&parameters, &y0, None, None).unwrap();
        assert!(output["cint"].iter().any(|v| v.is_infinite()));
    }

    #[test]
    fn test_post_processing_is_merged() {
        let (mut parameters, y0) = inputs(5.0);
        parameters.insert("scale".to_string(), array![[2.0], [2.0]]);
        let s = solver(5000, true);
        let s = Solver {
            post_processing: Some(PostProcessing::new("scaled", &["scale"], scaled)),
            ..s
        };
        let output = s.solve(&parameters, &y0, None, None).unwrap();
        assert_eq!(output.len(), 3);
        assert_eq!(output["response"][[1, 5]], 2.0 * output["cint"][[1, 5]]);
    }

    #[test]
    fn test_post_processing_after_divergence() {
        let (mut parameters, y0) = inputs(500.0);
        parameters.insert("scale".to_string(), array![[2.0], [2.0]]);
        let s = Solver {
            post_processing: Some(PostProcessing::new("scaled", &["scale"], scaled)),
            ..solver(200, false)
        };
        let output = s.solve(&parameters, &y0, None, None).unwrap();

        let cint = &output["cint"];
        let response = &output["response"];
        assert!(cint.iter().any(|v| v.is_infinite()));
        assert_eq!(response.shape(), cint.shape());
        for (c, r) in cint.iter().zip(response.iter()) {
            assert_eq!(c.is_infinite(), r.is_infinite());
            if c.is_finite() {
                assert_eq!(*r, 2.0 * c);
            }
        }
    }

    #[test]
    fn test_output_reshaped_to_dimensionality() {
        let (parameters, y0) = inputs(5.0);
        let mut dimensionality = Dimensionality::default();
        dimensionality.insert("cext", vec![("id".to_string(), 2), ("time".to_string(), 20)]);
        dimensionality.insert("cint", vec![("id".to_string(), 2), ("time".to_string(), 19)]);
        let s = Solver {
            dimensionality,
            ..solver(5000, true)
        };
        let result = s.solve(&parameters, &y0, None, None);
        assert!(matches!(result, Err(SimulationError::ShapeMismatch(_))));
    }
}
