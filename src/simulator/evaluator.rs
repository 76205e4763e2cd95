use std::collections::BTreeMap;

use ndarray::{Array2, IxDyn};
use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};
use crate::simulator::assemble::dataset_from_map;
use crate::simulator::integrator::IntegrationOptions;
use crate::simulator::interpolation::Forcing;
use crate::simulator::solver::{Batch, Solver, SolverOutput};
use crate::simulator::Registry;
use crate::structs::coordinates::{DataStructure, Dimensionality, VarDimMapper};
use crate::structs::dataset::{Coordinates, Dataset};
use crate::structs::parameters::{ModelParameters, ParameterValue};

/// Everything an [Evaluator] is made of, without the model functions
///
/// The functions are referenced by their registry names, so a spec can be serialized, sent to
/// another process and restored with [Evaluator::from_spec].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    pub model: String,
    pub post_processing: Option<String>,
    pub options: IntegrationOptions,
    pub throw_exception: bool,
    pub time: Vec<f64>,
    pub parameters: ModelParameters,
    pub x_in: Option<Forcing>,
    pub dimensions: Vec<String>,
    pub evaluator_dims: Vec<String>,
    pub batch_dimension: String,
    pub n_ode_states: usize,
    pub dimensionality: Dimensionality,
    pub var_dim_mapper: VarDimMapper,
    pub data_structure: DataStructure,
    pub coordinates: Coordinates,
    pub indices: BTreeMap<String, Vec<usize>>,
    pub stochastic: bool,
}

/// A solver bound to one set of parameters
///
/// Evaluators are built per parameter vector and never mutated. Calling one several times with
/// different seeds is how stochastic models are sampled.
#[derive(Debug, Clone)]
pub struct Evaluator {
    solver: Solver,
    parameters: ModelParameters,
    x_in: Option<Forcing>,
    dimensions: Vec<String>,
    evaluator_dims: Vec<String>,
    batch_dimension: String,
    n_ode_states: usize,
    var_dim_mapper: VarDimMapper,
    data_structure: DataStructure,
    coordinates: Coordinates,
    indices: BTreeMap<String, Vec<usize>>,
    stochastic: bool,
}

impl Evaluator {
    /// Resolve the model functions of `spec` in `registry`
    pub fn from_spec(spec: EvaluatorSpec, registry: &Registry) -> Result<Self> {
        let model = registry.model(&spec.model)?.clone();
        let post_processing = match &spec.post_processing {
            Some(name) => Some(registry.post_processing(name)?.clone()),
            None => None,
        };
        let solver = Solver::new(
            spec.options,
            spec.throw_exception,
            model,
            post_processing,
            spec.time,
            spec.dimensionality,
        )?;
        Ok(Evaluator {
            solver,
            parameters: spec.parameters,
            x_in: spec.x_in,
            dimensions: spec.dimensions,
            evaluator_dims: spec.evaluator_dims,
            batch_dimension: spec.batch_dimension,
            n_ode_states: spec.n_ode_states,
            var_dim_mapper: spec.var_dim_mapper,
            data_structure: spec.data_structure,
            coordinates: spec.coordinates,
            indices: spec.indices,
            stochastic: spec.stochastic,
        })
    }

    pub fn to_spec(&self) -> EvaluatorSpec {
        EvaluatorSpec {
            model: self.solver.model().name().to_string(),
            post_processing: self.solver.post_processing().map(|p| p.name().to_string()),
            options: self.solver.options().clone(),
            throw_exception: self.solver.throw_exception(),
            time: self.solver.time().to_vec(),
            parameters: self.parameters.clone(),
            x_in: self.x_in.clone(),
            dimensions: self.dimensions.clone(),
            evaluator_dims: self.evaluator_dims.clone(),
            batch_dimension: self.batch_dimension.clone(),
            n_ode_states: self.n_ode_states,
            dimensionality: self.solver.dimensionality().clone(),
            var_dim_mapper: self.var_dim_mapper.clone(),
            data_structure: self.data_structure.clone(),
            coordinates: self.coordinates.clone(),
            indices: self.indices.clone(),
            stochastic: self.stochastic,
        }
    }

    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    pub fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    pub fn n_ode_states(&self) -> usize {
        self.n_ode_states
    }

    pub fn is_stochastic(&self) -> bool {
        self.stochastic
    }

    /// Solve and return the labeled dataset of the data variables, in observation axis order
    pub fn call(&self, seed: Option<u64>) -> Result<Dataset> {
        let raw = self.raw(seed)?;

        let mut ordered = SolverOutput::new();
        for (var, _) in self.data_structure.iter() {
            let values = raw.get(var).ok_or_else(|| {
                SimulationError::config(format!(
                    "data variable '{}' is not produced by model '{}'",
                    var,
                    self.solver.model().name()
                ))
            })?;
            let perm = self.var_dim_mapper.permutation(var).ok_or_else(|| {
                SimulationError::shape(format!("no axis mapping for data variable '{}'", var))
            })?;
            if perm.len() != values.ndim() {
                return Err(SimulationError::shape(format!(
                    "data variable '{}' has {} axes, its mapping covers {}",
                    var,
                    values.ndim(),
                    perm.len()
                )));
            }
            let permuted = values
                .view()
                .permuted_axes(IxDyn(&perm))
                .as_standard_layout()
                .into_owned();
            ordered.insert(var.clone(), permuted);
        }

        dataset_from_map(&ordered, &self.data_structure, &self.coordinates)
    }

    /// Solve and return every model output in evaluator axis order
    pub fn raw(&self, seed: Option<u64>) -> Result<SolverOutput> {
        if let Some(dim) = self
            .dimensions
            .iter()
            .find(|d| !self.evaluator_dims.contains(d))
        {
            return Err(SimulationError::config(format!(
                "simulation dimension '{}' is missing from the evaluator dimension order {:?}",
                dim, self.evaluator_dims
            )));
        }
        // the solver stacks its output batch first
        if self.evaluator_dims.first() != Some(&self.batch_dimension) {
            return Err(SimulationError::config(format!(
                "the evaluator dimension order {:?} must start with the batch dimension '{}'",
                self.evaluator_dims, self.batch_dimension
            )));
        }

        let batch_size = self.batch_size()?;
        let parameters = self.broadcast_parameters(batch_size)?;
        let y0 = self.broadcast_y0(batch_size)?;

        tracing::debug!(
            "Evaluating '{}' on {} '{}' element(s), seed {:?}",
            self.solver.model().name(),
            batch_size,
            self.batch_dimension,
            seed
        );

        self.solver.solve(&parameters, &y0, self.x_in.as_ref(), seed)
    }

    fn batch_size(&self) -> Result<usize> {
        self.coordinates
            .len_of(&self.batch_dimension)
            .ok_or_else(|| {
                SimulationError::config(format!(
                    "batch dimension '{}' has no coordinates",
                    self.batch_dimension
                ))
            })
    }

    /// Give every parameter a leading batch axis
    ///
    /// Scalars repeat, vectors with a broadcast index take one element per batch element and
    /// other vectors repeat as a whole.
    fn broadcast_parameters(&self, batch_size: usize) -> Result<Batch> {
        let mut batch = Batch::new();
        for (name, value) in &self.parameters.parameters {
            let array = match (value, self.parameters.broadcast.get(name)) {
                (ParameterValue::Scalar(v), _) => Array2::from_elem((batch_size, 1), *v),
                (ParameterValue::Vector(values), Some(index)) => {
                    let idx = self.indices.get(index).ok_or_else(|| {
                        SimulationError::config(format!(
                            "parameter '{}' is broadcast over the unknown index '{}'",
                            name, index
                        ))
                    })?;
                    if idx.len() != batch_size {
                        return Err(SimulationError::shape(format!(
                            "index '{}' has {} entries, the batch has {}",
                            index,
                            idx.len(),
                            batch_size
                        )));
                    }
                    let mut column = Vec::with_capacity(batch_size);
                    for &i in idx {
                        let v = values.get(i).ok_or_else(|| {
                            SimulationError::shape(format!(
                                "index '{}' selects element {} of parameter '{}' with {} elements",
                                index,
                                i,
                                name,
                                values.len()
                            ))
                        })?;
                        column.push(*v);
                    }
                    Array2::from_shape_vec((batch_size, 1), column)
                        .map_err(|e| SimulationError::shape(e.to_string()))?
                }
                (ParameterValue::Vector(values), None) => {
                    let row = ndarray::aview1(values);
                    let mut array = Array2::zeros((batch_size, values.len()));
                    array.rows_mut().into_iter().for_each(|mut r| r.assign(&row));
                    array
                }
            };
            batch.insert(name.clone(), array);
        }
        Ok(batch)
    }

    fn broadcast_y0(&self, batch_size: usize) -> Result<Batch> {
        let mut batch = Batch::new();
        for (state, values) in &self.parameters.y0 {
            let column = match values.len() {
                1 => vec![values[0]; batch_size],
                n if n == batch_size => values.clone(),
                n => {
                    return Err(SimulationError::shape(format!(
                        "initial value of '{}' has {} entries, expected 1 or {}",
                        state, n, batch_size
                    )))
                }
            };
            let array = Array2::from_shape_vec((batch_size, 1), column)
                .map_err(|e| SimulationError::shape(e.to_string()))?;
            batch.insert(state.clone(), array);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch_params;
    use crate::simulator::{OdeArgs, OdeModel, T};
    use crate::structs::dataset::Label;

    fn uptake(_t: T, y: &[f64], args: &OdeArgs, dy: &mut [f64]) {
        fetch_params!(args, k);
        dy[0] = -k * y[0];
    }

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    fn spec() -> EvaluatorSpec {
        let coordinates = Coordinates::new()
            .with("time", (0..5).map(Label::Int).collect())
            .with("id", vec![Label::Int(0), Label::Int(1), Label::Int(2)]);
        let mut data_structure = DataStructure::default();
        data_structure.insert("c", names(&["time", "id"]));
        let evaluator_dims = names(&["id", "time"]);
        let var_dim_mapper = VarDimMapper::create(&data_structure, &evaluator_dims);
        let dimensionality =
            Dimensionality::create(&data_structure, &coordinates, &evaluator_dims).unwrap();

        let mut parameters = ModelParameters::default();
        parameters
            .parameters
            .insert("k".to_string(), ParameterValue::Vector(vec![0.1, 0.5]));
        parameters.broadcast.insert("k".to_string(), "substance".to_string());
        parameters.y0.insert("c".to_string(), vec![10.0]);

        let mut indices = BTreeMap::new();
        indices.insert("substance".to_string(), vec![0, 1, 1]);

        EvaluatorSpec {
            model: "uptake".to_string(),
            post_processing: None,
            options: IntegrationOptions::default(),
            throw_exception: true,
            time: (0..5).map(|t| t as f64).collect(),
            parameters,
            x_in: None,
            dimensions: names(&["time", "id"]),
            evaluator_dims,
            batch_dimension: "id".to_string(),
            n_ode_states: 1,
            dimensionality,
            var_dim_mapper,
            data_structure,
            coordinates,
            indices,
            stochastic: false,
        }
    }

    fn registry() -> Registry {
        Registry::new().register_model(OdeModel::new("uptake", &["c"], &["k"], uptake))
    }

    #[test]
    fn test_call_returns_observation_order() {
        let evaluator = Evaluator::from_spec(spec(), &registry()).unwrap();
        let ds = evaluator.call(None).unwrap();
        let c = ds.get("c").unwrap();
        assert_eq!(c.dims, names(&["time", "id"]));
        assert_eq!(c.values.shape(), &[5, 3]);
        // ids 1 and 2 share the second substance
        assert_eq!(c.values[[4, 1]], c.values[[4, 2]]);
        assert!(c.values[[4, 0]] > c.values[[4, 1]]);
    }

    #[test]
    fn test_missing_evaluator_dimension() {
        let mut spec = spec();
        spec.evaluator_dims = names(&["id"]);
        let evaluator = Evaluator::from_spec(spec, &registry()).unwrap();
        assert!(matches!(
            evaluator.call(None),
            Err(SimulationError::Configuration(_))
        ));
    }

    #[test]
    fn test_batch_dimension_leads() {
        let mut spec = spec();
        spec.evaluator_dims = names(&["time", "id"]);
        let evaluator = Evaluator::from_spec(spec, &registry()).unwrap();
        assert!(matches!(
            evaluator.call(None),
            Err(SimulationError::Configuration(_))
        ));
    }

    #[test]
    fn test_spec_round_trip() {
        let evaluator = Evaluator::from_spec(spec(), &registry()).unwrap();
        let json = serde_json::to_string(&evaluator.to_spec()).unwrap();
        let restored: EvaluatorSpec = serde_json::from_str(&json).unwrap();
        let restored = Evaluator::from_spec(restored, &registry()).unwrap();
        assert_eq!(restored.call(None).unwrap(), evaluator.call(None).unwrap());
    }

    #[test]
    fn test_unknown_model() {
        let mut spec = spec();
        spec.model = "growth".to_string();
        assert!(matches!(
            Evaluator::from_spec(spec, &registry()),
            Err(SimulationError::UnknownIdentifier { .. })
        ));
    }

    #[test]
    fn test_y0_length_is_checked() {
        let mut spec = spec();
        spec.parameters.y0.insert("c".to_string(), vec![1.0, 2.0]);
        let evaluator = Evaluator::from_spec(spec, &registry()).unwrap();
        assert!(matches!(
            evaluator.call(None),
            Err(SimulationError::ShapeMismatch(_))
        ));
    }
}
