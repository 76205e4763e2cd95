use std::collections::BTreeMap;

use config::Config as eConfig;
use eyre::{bail, Result, WrapErr};
use serde::Deserialize;
use serde_derive::Serialize;

use crate::simulator::integrator::{IntegrationOptions, Method};
use crate::structs::parameters::{Param, ParameterValue};

/// Contains all settings of a simulation
#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Model, dimensions and inputs of the simulation
    pub simulation: Simulation,
    /// Integration method, tolerances and failure policy
    pub solver: Solver,
    /// Optional bounds of each data variable, used when scaling
    pub data_structure: BTreeMap<String, Bounds>,
    /// Free and fixed model parameters
    pub parameters: Parameters,
    pub inference: Inference,
    pub multiprocessing: Multiprocessing,
    /// Configuration for logging
    pub log: Log,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        self.solver.validate()?;
        self.parameters.validate()?;
        for (var, bounds) in &self.data_structure {
            if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
                if min > max {
                    bail!(
                        "Lower bound ({}) of data variable '{}' exceeds its upper bound ({})",
                        min,
                        var,
                        max
                    );
                }
            }
        }
        if self.multiprocessing.cores == 0 {
            bail!("The number of cores must be at least one");
        }
        Ok(())
    }

    /// Write a JSON copy of the resolved settings
    pub fn write(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), serialized)
            .wrap_err_with(|| format!("Could not write settings to {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Copy the table keys into the names of the free parameters
    fn fill_parameter_names(&mut self) {
        for (name, param) in self.parameters.free.iter_mut() {
            if param.name.is_empty() {
                param.name = name.clone();
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Deterministic,
    /// Every evaluation draws a fresh seed
    Stochastic,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Simulation {
    /// Registry name of the ODE model
    pub model: String,
    /// Registry name of the post-processing step, if any
    pub post_processing: Option<String>,
    /// Dimensions of the simulation, in the order of the observations
    pub dimensions: Vec<String>,
    /// Axis order of the raw solver output, a permutation of `dimensions` that starts with the
    /// batch dimension
    pub evaluator_dim_order: Option<Vec<String>>,
    /// Dimension mapped over in parallel
    pub batch_dimension: String,
    /// Dimension holding the time points
    pub x_dimension: String,
    /// Variables compared against the observations
    pub data_variables: Vec<String>,
    /// Number of ODE states, checked against the model declaration
    pub n_ode_states: Option<usize>,
    pub modeltype: ModelType,
    /// Seed of the pool from which stochastic evaluations draw
    pub seed: u64,
    /// Initial values, as `state=value` expressions
    pub y0: Vec<String>,
    /// Forcing series, as `name=value` expressions
    pub x_in: Vec<String>,
}

impl Default for Simulation {
    fn default() -> Self {
        Simulation {
            model: String::new(),
            post_processing: None,
            dimensions: Vec::new(),
            evaluator_dim_order: None,
            batch_dimension: String::from("id"),
            x_dimension: String::from("time"),
            data_variables: Vec::new(),
            n_ode_states: None,
            modeltype: ModelType::Deterministic,
            seed: 1,
            y0: Vec::new(),
            x_in: Vec::new(),
        }
    }
}

impl Simulation {
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            bail!("No model was specified in [simulation]");
        }
        if self.dimensions.is_empty() {
            bail!("At least one dimension must be specified in [simulation]");
        }
        if self.data_variables.is_empty() {
            bail!("At least one data variable must be specified in [simulation]");
        }
        if !self.dimensions.contains(&self.batch_dimension) {
            bail!(
                "The batch dimension '{}' is not one of the dimensions {:?}",
                self.batch_dimension,
                self.dimensions
            );
        }
        if !self.dimensions.contains(&self.x_dimension) {
            bail!(
                "The x dimension '{}' is not one of the dimensions {:?}",
                self.x_dimension,
                self.dimensions
            );
        }
        if let Some(order) = &self.evaluator_dim_order {
            let mut sorted_order = order.clone();
            sorted_order.sort();
            let mut sorted_dims = self.dimensions.clone();
            sorted_dims.sort();
            if sorted_order != sorted_dims {
                bail!(
                    "The evaluator dimension order {:?} is not a permutation of the dimensions {:?}",
                    order,
                    self.dimensions
                );
            }
            if order.first() != Some(&self.batch_dimension) {
                bail!(
                    "The evaluator dimension order {:?} must start with the batch dimension '{}'",
                    order,
                    self.batch_dimension
                );
            }
        }
        Ok(())
    }

    /// Evaluator axis order, by default the batch dimension followed by the others
    pub fn evaluator_dims(&self) -> Vec<String> {
        match &self.evaluator_dim_order {
            Some(order) => order.clone(),
            None => std::iter::once(self.batch_dimension.clone())
                .chain(
                    self.dimensions
                        .iter()
                        .filter(|d| **d != self.batch_dimension)
                        .cloned(),
                )
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Solver {
    /// One of `Dopri5`, `Tsit5`, `Bosh3` or `Heun`
    pub method: String,
    pub rtol: f64,
    pub atol: f64,
    pub pcoeff: f64,
    pub icoeff: f64,
    pub dcoeff: f64,
    /// Initial step size, chosen automatically if not set
    pub dt0: Option<f64>,
    /// Step budget per batch element, rejected steps included
    pub max_steps: usize,
    /// Fail on divergence instead of returning infinite values
    pub throw_exception: bool,
}

impl Default for Solver {
    fn default() -> Self {
        Solver {
            method: String::from("Dopri5"),
            rtol: 1e-6,
            atol: 1e-7,
            pcoeff: 0.0,
            icoeff: 1.0,
            dcoeff: 0.0,
            dt0: Some(0.1),
            max_steps: 100_000,
            throw_exception: true,
        }
    }
}

impl Solver {
    pub fn validate(&self) -> Result<()> {
        self.method.parse::<Method>()?;
        if !(self.rtol > 0.0) || !(self.atol > 0.0) {
            bail!("Tolerances must be positive, got rtol = {} and atol = {}", self.rtol, self.atol);
        }
        if self.max_steps == 0 {
            bail!("The step budget of the solver must be at least one");
        }
        if let Some(dt0) = self.dt0 {
            if !(dt0 > 0.0) {
                bail!("The initial step size must be positive, got {}", dt0);
            }
        }
        Ok(())
    }

    pub fn options(&self) -> crate::error::Result<IntegrationOptions> {
        Ok(IntegrationOptions {
            method: self.method.parse()?,
            rtol: self.rtol,
            atol: self.atol,
            pcoeff: self.pcoeff,
            icoeff: self.icoeff,
            dcoeff: self.dcoeff,
            dt0: self.dt0,
            max_steps: self.max_steps,
        })
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, Default, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Parameters {
    /// Parameters varied by inference
    pub free: BTreeMap<String, Param>,
    /// Parameters set once
    pub fixed: BTreeMap<String, ParameterValue>,
    /// Vector parameter name to the index selecting its element per batch element
    pub broadcast: BTreeMap<String, String>,
}

impl Parameters {
    pub fn validate(&self) -> Result<()> {
        for (name, param) in &self.free {
            if self.fixed.contains_key(name) {
                bail!("Parameter '{}' is declared both free and fixed", name);
            }
            if let (Some(min), Some(max)) = (param.min, param.max) {
                if min >= max {
                    bail!(
                        "In key '{}', lower bound ({}) is not less than upper bound ({})",
                        name,
                        min,
                        max
                    );
                }
            }
        }
        for name in self.broadcast.keys() {
            let value = self
                .free
                .get(name)
                .map(|p| &p.value)
                .or_else(|| self.fixed.get(name));
            match value {
                Some(ParameterValue::Vector(_)) => {}
                Some(ParameterValue::Scalar(_)) => {
                    bail!("Only vector parameters can be broadcast, '{}' is a scalar", name)
                }
                None => bail!("Broadcast parameter '{}' is not declared", name),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Inference {
    /// Name of the objective, `total_average` or `per_variable`
    pub objective_function: String,
}

impl Default for Inference {
    fn default() -> Self {
        Inference {
            objective_function: String::from("total_average"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Multiprocessing {
    /// Threads used to evaluate several parameter vectors at once
    pub cores: usize,
}

impl Default for Multiprocessing {
    fn default() -> Self {
        Multiprocessing { cores: 1 }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Log {
    /// The maximum log level to display
    ///
    /// The log level is defined as a string, and can be one of the following:
    /// - `trace`
    /// - `debug`
    /// - `info`
    /// - `warn`
    /// - `error`
    pub level: String,
    /// The file to write the log to, in addition to stdout
    pub file: Option<String>,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            level: String::from("info"),
            file: None,
        }
    }
}

/// Parses the settings from a TOML configuration file
///
/// Entries in the TOML file may be overridden by environment variables prefixed with `TKTD_`,
/// using a double underscore between nested keys, e.g. `TKTD_SOLVER__MAX_STEPS=5000`.
pub fn read_settings(path: impl Into<String>) -> Result<Settings> {
    let settings_path = path.into();

    let parsed = eConfig::builder()
        .add_source(config::File::with_name(&settings_path).format(config::FileFormat::Toml))
        .add_source(
            config::Environment::with_prefix("TKTD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .wrap_err_with(|| format!("Could not read settings from {}", settings_path))?;

    let mut settings: Settings = parsed.try_deserialize()?;
    settings.fill_parameter_names();
    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
[simulation]
model = "tktd_rna"
dimensions = ["time", "id"]
data_variables = ["cext", "cint"]
n_ode_states = 2
y0 = ["cext=cext_nom", "cint=0.0"]

[solver]
method = "Tsit5"
max_steps = 5000
throw_exception = false

[data_structure.cext]
min = 0.0
max = 1000.0

[parameters.free.alpha]
value = 5.0
min = 0.1
max = 50.0

[parameters.fixed]
beta = 0.02

[log]
level = "debug"
"#;

    fn write_settings(contents: &str, name: &str) -> String {
        let path =
            std::env::temp_dir().join(format!("tktdcore_{}_{}.toml", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_read_settings() {
        let path = write_settings(SETTINGS, "read");
        let settings = read_settings(path.as_str()).unwrap();

        assert_eq!(settings.simulation.model, "tktd_rna");
        assert_eq!(settings.simulation.batch_dimension, "id");
        assert_eq!(settings.simulation.evaluator_dims(), vec!["id", "time"]);
        assert_eq!(settings.solver.options().unwrap().method, Method::Tsit5);
        assert_eq!(settings.solver.rtol, 1e-6);
        assert!(!settings.solver.throw_exception);
        assert_eq!(settings.parameters.free["alpha"].name, "alpha");
        assert_eq!(settings.parameters.free["alpha"].range(), Some((0.1, 50.0)));
        assert_eq!(settings.parameters.fixed["beta"], ParameterValue::Scalar(0.02));
        assert_eq!(settings.data_structure["cext"].max, Some(1000.0));
        assert_eq!(settings.inference.objective_function, "total_average");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let contents = SETTINGS.replace("max_steps = 5000", "max_stepz = 5000");
        let path = write_settings(&contents, "unknown");
        assert!(read_settings(path.as_str()).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::new();
        assert!(settings.validate().is_err());

        settings.simulation.model = "tktd".to_string();
        settings.simulation.dimensions = vec!["time".to_string(), "id".to_string()];
        settings.simulation.data_variables = vec!["cext".to_string()];
        assert!(settings.validate().is_ok());

        settings.solver.method = "Kvaerno5".to_string();
        assert!(settings.validate().is_err());
        settings.solver.method = "Heun".to_string();

        settings
            .parameters
            .free
            .insert("alpha".to_string(), Param::new("alpha", 1.0).bounds(2.0, 1.0));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_evaluator_dim_order() {
        let mut settings = Settings::new();
        settings.simulation.model = "tktd".to_string();
        settings.simulation.dimensions = vec!["time".to_string(), "id".to_string()];
        settings.simulation.data_variables = vec!["cext".to_string()];

        settings.simulation.evaluator_dim_order = Some(vec!["id".to_string(), "time".to_string()]);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.simulation.evaluator_dims(), vec!["id", "time"]);

        // the batch axis must lead
        settings.simulation.evaluator_dim_order = Some(vec!["time".to_string(), "id".to_string()]);
        assert!(settings.validate().is_err());

        settings.simulation.evaluator_dim_order = Some(vec!["id".to_string()]);
        assert!(settings.validate().is_err());

        settings.simulation.evaluator_dim_order =
            Some(vec!["id".to_string(), "time".to_string(), "substance".to_string()]);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_solver_validation() {
        let mut solver = Solver::default();
        assert!(solver.validate().is_ok());
        solver.rtol = 0.0;
        solver.atol = 0.0;
        assert!(solver.validate().is_err());

        let mut solver = Solver::default();
        solver.max_steps = 0;
        assert!(solver.validate().is_err());

        let mut solver = Solver::default();
        solver.dt0 = Some(-0.1);
        assert!(solver.validate().is_err());
    }
}
