//! The simulation context
//!
//! A [Simulation] owns the settings, the model registry and the observations, together with
//! everything derived from them (coordinates, data structure, axis mapping, scaler). It hands out
//! one [Evaluator] per parameter vector and never changes while evaluators run.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{Result, SimulationError};
use crate::routines::initialization::sobol;
use crate::routines::objective::{objective_by_name, Objective, ObjectiveValue};
use crate::routines::scaler::{check_feasibility, MinMaxScaler};
use crate::routines::seeds::SeedPool;
use crate::routines::settings::{ModelType, Settings};
use crate::simulator::evaluator::{Evaluator, EvaluatorSpec};
use crate::simulator::interpolation::Forcing;
use crate::simulator::{OdeModel, Registry};
use crate::structs::coordinates::{
    check_dimensions, set_coordinates, DataStructure, Dimensionality, VarDimMapper,
};
use crate::structs::dataset::{Coordinates, Dataset};
use crate::structs::parameters::{
    flatten, FlatParameters, InitialValues, ModelParameters, Param, ParameterMap,
};

/// Right-hand side of an input expression
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Number(f64),
    List(Vec<f64>),
    /// Name of an observation variable
    Variable(String),
}

/// Parse an input expression of the form `name=value`
///
/// The value is a number, a bracketed list of numbers or the name of an observation variable.
pub fn parse_input(expression: &str) -> Result<(String, InputValue)> {
    let (name, value) = expression.split_once('=').ok_or_else(|| {
        SimulationError::config(format!(
            "input '{}' is not of the form 'name=value'",
            expression
        ))
    })?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || value.is_empty() {
        return Err(SimulationError::config(format!(
            "input '{}' is not of the form 'name=value'",
            expression
        )));
    }

    let parsed = if let Ok(number) = value.parse::<f64>() {
        InputValue::Number(number)
    } else if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        let list = inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>().map_err(|_| {
                    SimulationError::config(format!(
                        "'{}' in input '{}' is not a number",
                        s, expression
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        InputValue::List(list)
    } else {
        InputValue::Variable(value.to_string())
    };
    Ok((name.to_string(), parsed))
}

/// Simulation context, see the [module documentation](self)
pub struct Simulation {
    settings: Settings,
    registry: Registry,
    observations: Dataset,
    scaled_observations: Dataset,
    coordinates: Coordinates,
    data_structure: DataStructure,
    var_dim_mapper: VarDimMapper,
    dimensionality: Dimensionality,
    scaler: MinMaxScaler,
    indices: BTreeMap<String, Vec<usize>>,
    y0: InitialValues,
    x_in: Option<Forcing>,
    n_ode_states: usize,
    seeds: SeedPool,
    pool: rayon::ThreadPool,
    objective: Box<dyn Objective>,
    objective_names: OnceLock<Vec<String>>,
}

impl Simulation {
    pub fn new(settings: Settings, registry: Registry, observations: Dataset) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| SimulationError::config(format!("{:#}", e)))?;
        let model = registry.model(&settings.simulation.model)?.clone();
        if let Some(name) = &settings.simulation.post_processing {
            registry.post_processing(name)?;
        }
        let objective = objective_by_name(&settings.inference.objective_function)?;
        let seeds = SeedPool::new(settings.simulation.seed, settings.multiprocessing.cores);
        let n_ode_states = infer_ode_states(&settings, &model)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.multiprocessing.cores)
            .build()
            .map_err(|e| {
                SimulationError::config(format!("could not build the thread pool: {}", e))
            })?;

        let mut simulation = Simulation {
            settings,
            registry,
            observations: Dataset::default(),
            scaled_observations: Dataset::default(),
            coordinates: Coordinates::new(),
            data_structure: DataStructure::default(),
            var_dim_mapper: VarDimMapper::default(),
            dimensionality: Dimensionality::default(),
            scaler: MinMaxScaler::default(),
            indices: BTreeMap::new(),
            y0: InitialValues::new(),
            x_in: None,
            n_ode_states,
            seeds,
            pool,
            objective,
            objective_names: OnceLock::new(),
        };
        simulation.validate()?;
        simulation.set_observations(observations)?;

        if simulation.free_parameters().is_empty() {
            tracing::warn!("No free parameters were declared, inference has nothing to vary");
        }
        tracing::info!(
            "Simulation of '{}' set up with dimensions {:?} and data variables {:?}",
            simulation.settings.simulation.model,
            simulation.settings.simulation.dimensions,
            simulation.settings.simulation.data_variables
        );
        Ok(simulation)
    }

    /// Data variables and dimensions must be declared
    pub fn validate(&self) -> Result<()> {
        let sim = &self.settings.simulation;
        if sim.data_variables.is_empty() {
            return Err(SimulationError::config("no data variables were declared"));
        }
        if sim.dimensions.is_empty() {
            return Err(SimulationError::config("no dimensions were declared"));
        }
        if !sim.dimensions.contains(&sim.batch_dimension) {
            return Err(SimulationError::config(format!(
                "batch dimension '{}' is not one of the dimensions {:?}",
                sim.batch_dimension, sim.dimensions
            )));
        }
        Ok(())
    }

    /// Replace the observations and recompute everything derived from them
    ///
    /// Inputs declared in the settings are parsed again against the new observations.
    pub fn set_observations(&mut self, observations: Dataset) -> Result<()> {
        let dimensions = self.settings.simulation.dimensions.clone();
        let data_variables = self.settings.simulation.data_variables.clone();
        let evaluator_dims = self.settings.simulation.evaluator_dims();

        check_dimensions(&observations, &dimensions)?;
        let coordinates = set_coordinates(&dimensions, &observations)?;
        let data_structure =
            DataStructure::from_observations(&observations, &dimensions, &data_variables)?;
        let var_dim_mapper = VarDimMapper::create(&data_structure, &evaluator_dims);
        let dimensionality =
            Dimensionality::create(&data_structure, &coordinates, &evaluator_dims)?;
        let scaler = MinMaxScaler::fit(
            &observations,
            &data_variables,
            &self.settings.data_structure,
        )?;
        let ordered = observations.select(&data_variables)?.transpose(&dimensions);
        let scaled_observations = scaler.transform(&ordered)?;

        self.coordinates = coordinates;
        self.data_structure = data_structure;
        self.var_dim_mapper = var_dim_mapper;
        self.dimensionality = dimensionality;
        self.scaler = scaler;
        self.scaled_observations = scaled_observations;
        self.observations = observations;

        if !self.settings.simulation.y0.is_empty() {
            self.y0 = self.parse_y0(&self.settings.simulation.y0)?;
        }
        if !self.settings.simulation.x_in.is_empty() {
            self.x_in = Some(self.parse_x_in(&self.settings.simulation.x_in)?);
        }
        Ok(())
    }

    /// Initial values from `state=value` expressions
    ///
    /// Observation variables are read at the first time point and must span at most the batch
    /// dimension.
    pub fn parse_y0(&self, expressions: &[String]) -> Result<InitialValues> {
        let batch_size = self.batch_size()?;
        let mut y0 = InitialValues::new();
        for expression in expressions {
            let (name, value) = parse_input(expression)?;
            let values = match value {
                InputValue::Number(v) => vec![v],
                InputValue::List(list) => {
                    if list.len() != 1 && list.len() != batch_size {
                        return Err(SimulationError::shape(format!(
                            "initial value of '{}' has {} entries, expected 1 or {}",
                            name,
                            list.len(),
                            batch_size
                        )));
                    }
                    list
                }
                InputValue::Variable(var) => self.batch_series(&var)?.column(0).to_vec(),
            };
            y0.insert(name, values);
        }
        Ok(y0)
    }

    /// Forcing series from `name=value` expressions, sampled on the time coordinates
    pub fn parse_x_in(&self, expressions: &[String]) -> Result<Forcing> {
        let batch_size = self.batch_size()?;
        let time = self.time()?;
        let mut forcing = Forcing::new(time.clone());
        for expression in expressions {
            let (name, value) = parse_input(expression)?;
            let series = match value {
                InputValue::Number(v) => Array2::from_elem((batch_size, time.len()), v),
                InputValue::List(list) => {
                    if list.len() != time.len() {
                        return Err(SimulationError::shape(format!(
                            "forcing '{}' has {} entries, the time coordinates have {}",
                            name,
                            list.len(),
                            time.len()
                        )));
                    }
                    let row = ndarray::aview1(&list);
                    let mut series = Array2::zeros((batch_size, time.len()));
                    series.rows_mut().into_iter().for_each(|mut r| r.assign(&row));
                    series
                }
                InputValue::Variable(var) => {
                    let series = self.batch_series(&var)?;
                    if series.ncols() == 1 && time.len() > 1 {
                        // constant in time
                        let column = series.column(0).to_owned();
                        Array2::from_shape_fn((batch_size, time.len()), |(b, _)| column[b])
                    } else {
                        series
                    }
                }
            };
            forcing = forcing.add(name, series)?;
        }
        Ok(forcing)
    }

    /// An observation variable as `(batch, time)`, with a single column if it has no time axis
    fn batch_series(&self, var: &str) -> Result<Array2<f64>> {
        let sim = &self.settings.simulation;
        let array = self.observations.get(var).ok_or_else(|| {
            SimulationError::config(format!(
                "input variable '{}' is missing from the observations",
                var
            ))
        })?;
        let batch_size = self.batch_size()?;
        let order = [sim.batch_dimension.clone(), sim.x_dimension.clone()];
        let ordered = array.transpose(&order);
        if let Some(extra) = ordered.dims.iter().find(|d| !order.contains(d)) {
            return Err(SimulationError::config(format!(
                "input variable '{}' spans dimension '{}', only '{}' and '{}' are allowed",
                var, extra, sim.batch_dimension, sim.x_dimension
            )));
        }

        let has_batch = ordered.dims.contains(&sim.batch_dimension);
        let has_time = ordered.dims.contains(&sim.x_dimension);
        let values = ordered.values;
        let series = match (has_batch, has_time) {
            (true, true) => values.into_dimensionality::<ndarray::Ix2>(),
            (true, false) => values.into_shape((batch_size, 1)),
            (false, true) => {
                let row = values.iter().copied().collect::<Vec<f64>>();
                let n = row.len();
                return Ok(Array2::from_shape_fn((batch_size, n), |(_, t)| row[t]));
            }
            (false, false) => {
                let v = values.iter().next().copied().unwrap_or(f64::NAN);
                return Ok(Array2::from_elem((batch_size, 1), v));
            }
        };
        series.map_err(|e| SimulationError::shape(format!("input variable '{}': {}", var, e)))
    }

    /// Merge the fixed parameters with the free values in `theta` and build an evaluator
    ///
    /// `theta` may name vector elements as `name___i`. Free parameters missing from `theta` keep
    /// their configured value.
    pub fn dispatch(&self, theta: &FlatParameters) -> Result<Evaluator> {
        let free = self.free_parameter_map();
        let (mut flat, unflatten) = flatten(&free, &[]);
        for (name, value) in theta {
            match flat.get_mut(name) {
                Some(entry) => *entry = *value,
                None => return Err(SimulationError::ParameterNotFound(name.clone())),
            }
        }
        let mut parameters = unflatten.apply(&flat)?;
        for (name, value) in &self.settings.parameters.fixed {
            parameters.insert(name.clone(), value.clone());
        }

        let sim = &self.settings.simulation;
        let spec = EvaluatorSpec {
            model: sim.model.clone(),
            post_processing: sim.post_processing.clone(),
            options: self.settings.solver.options()?,
            throw_exception: self.settings.solver.throw_exception,
            time: self.time()?,
            parameters: ModelParameters {
                parameters,
                y0: self.y0.clone(),
                broadcast: self.settings.parameters.broadcast.clone(),
            },
            x_in: self.x_in.clone(),
            dimensions: sim.dimensions.clone(),
            evaluator_dims: sim.evaluator_dims(),
            batch_dimension: sim.batch_dimension.clone(),
            n_ode_states: self.n_ode_states,
            dimensionality: self.dimensionality.clone(),
            var_dim_mapper: self.var_dim_mapper.clone(),
            data_structure: self.data_structure.clone(),
            coordinates: self.coordinates.clone(),
            indices: self.indices.clone(),
            stochastic: sim.modeltype == ModelType::Stochastic,
        };
        tracing::debug!("Dispatching evaluator for {:?}", theta);
        Evaluator::from_spec(spec, &self.registry)
    }

    /// Run an evaluator, drawing a seed from the pool for stochastic models
    pub fn evaluate(&self, evaluator: &Evaluator) -> Result<Dataset> {
        let seed = if evaluator.is_stochastic() {
            Some(self.seeds.draw())
        } else {
            None
        };
        evaluator.call(seed)
    }

    /// Dispatch and evaluate several parameter vectors on `multiprocessing.cores` threads
    pub fn evaluate_batch(&self, thetas: &[FlatParameters]) -> Result<Vec<Dataset>> {
        self.pool.install(|| {
            thetas
                .par_iter()
                .map(|theta| {
                    let evaluator = self.dispatch(theta)?;
                    self.evaluate(&evaluator)
                })
                .collect()
        })
    }

    /// Scale simulation results like the observations, warning about values far out of range
    pub fn scale_results(&self, results: &Dataset) -> Result<Dataset> {
        let selected = results.select(&self.settings.simulation.data_variables)?;
        let scaled = self.scaler.transform(&selected)?;
        check_feasibility(&scaled);
        Ok(scaled)
    }

    /// Evaluate the configured objective, recording the objective names on first use
    pub fn objective_function(&self, results: &Dataset) -> Result<ObjectiveValue> {
        let value = self.objective.objective(self, results)?;
        self.objective_names
            .get_or_init(|| value.names(self.objective.name()));
        Ok(value)
    }

    /// Names of the objectives, known after the first objective evaluation
    pub fn objective_names(&self) -> Option<&[String]> {
        self.objective_names.get().map(|n| n.as_slice())
    }

    /// Sobol draws of the free parameters within their bounds
    pub fn sample_free_parameters(&self, points: usize, seed: u32) -> Result<Vec<FlatParameters>> {
        sobol::generate(&self.free_parameters(), points, seed)
    }

    pub fn free_parameters(&self) -> Vec<Param> {
        self.settings.parameters.free.values().cloned().collect()
    }

    fn free_parameter_map(&self) -> ParameterMap {
        self.settings
            .parameters
            .free
            .iter()
            .map(|(name, p)| (name.clone(), p.value.clone()))
            .collect()
    }

    /// Configured values of the free parameters, flattened
    pub fn free_parameter_values(&self) -> FlatParameters {
        flatten(&self.free_parameter_map(), &[]).0
    }

    /// Flat names of the free parameters, in the order of [Simulation::free_parameter_values]
    pub fn free_parameter_names(&self) -> Vec<String> {
        self.free_parameter_values().into_keys().collect()
    }

    /// Step size of each flat free parameter, zero where none is configured
    pub fn free_parameter_steps(&self) -> Vec<f64> {
        let mut steps = Vec::new();
        for param in self.settings.parameters.free.values() {
            let step = param.step.unwrap_or(0.0);
            steps.extend(std::iter::repeat(step).take(param.value.len()));
        }
        steps
    }

    /// Register an index used to broadcast vector parameters over the batch dimension
    pub fn set_index(&mut self, name: impl Into<String>, values: Vec<usize>) -> Result<()> {
        let name = name.into();
        let batch_size = self.batch_size()?;
        if values.len() != batch_size {
            return Err(SimulationError::shape(format!(
                "index '{}' has {} entries, the batch dimension has {}",
                name,
                values.len(),
                batch_size
            )));
        }
        self.indices.insert(name, values);
        Ok(())
    }

    pub fn set_y0(&mut self, y0: InitialValues) {
        self.y0 = y0;
    }

    pub fn set_x_in(&mut self, x_in: Option<Forcing>) {
        self.x_in = x_in;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observations(&self) -> &Dataset {
        &self.observations
    }

    /// Observations of the data variables in simulation dimension order, scaled
    pub fn scaled_observations(&self) -> &Dataset {
        &self.scaled_observations
    }

    pub fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    pub fn data_structure(&self) -> &DataStructure {
        &self.data_structure
    }

    pub fn dimensionality(&self) -> &Dimensionality {
        &self.dimensionality
    }

    pub fn scaler(&self) -> &MinMaxScaler {
        &self.scaler
    }

    pub fn y0(&self) -> &InitialValues {
        &self.y0
    }

    pub fn x_in(&self) -> Option<&Forcing> {
        self.x_in.as_ref()
    }

    pub fn n_ode_states(&self) -> usize {
        self.n_ode_states
    }

    fn batch_size(&self) -> Result<usize> {
        let dim = &self.settings.simulation.batch_dimension;
        self.coordinates.len_of(dim).ok_or_else(|| {
            SimulationError::config(format!("batch dimension '{}' has no coordinates", dim))
        })
    }

    fn time(&self) -> Result<Vec<f64>> {
        self.coordinates.numeric(&self.settings.simulation.x_dimension)
    }
}

/// Number of ODE states, from the settings or else from the model declaration
fn infer_ode_states(settings: &Settings, model: &OdeModel) -> Result<usize> {
    match settings.simulation.n_ode_states {
        Some(n) if n == model.nstates() => Ok(n),
        Some(n) => Err(SimulationError::config(format!(
            "n_ode_states is {}, but model '{}' declares {} states {:?}",
            n,
            model.name(),
            model.nstates(),
            model.states()
        ))),
        None => {
            tracing::warn!(
                "n_ode_states was not specified, using the {} states declared by model '{}'",
                model.nstates(),
                model.name()
            );
            Ok(model.nstates())
        }
    }
}
