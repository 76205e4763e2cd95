pub mod assemble;
pub mod evaluator;
pub mod integrator;
pub mod interpolation;
pub mod solver;

use std::collections::BTreeMap;

use crate::error::{Result, SimulationError};
use interpolation::Interpolant;

pub type T = f64;

/// Right-hand side of an ODE system, writes `dy/dt` at `(t, y)` into `dy`
pub type RightHandSide = fn(T, &[f64], &OdeArgs, &mut [f64]);

/// State (or derived) variable name to its values at the saved time points
pub type Trajectories = BTreeMap<String, Vec<f64>>;

/// Derives secondary output variables from the solved state trajectories
pub type PostProcessingFn =
    fn(&Trajectories, &[f64], Option<&Interpolant>, &OdeArgs) -> Result<Trajectories>;

/// An ODE model with its declared states and parameters
///
/// The order of `states` is the order of `y` and `dy` in the right-hand side, the order of
/// `parameters` is the positional order of [OdeArgs].
#[derive(Debug, Clone)]
pub struct OdeModel {
    name: String,
    states: Vec<String>,
    parameters: Vec<String>,
    rhs: RightHandSide,
}

impl OdeModel {
    pub fn new(name: &str, states: &[&str], parameters: &[&str], rhs: RightHandSide) -> Self {
        OdeModel {
            name: name.to_string(),
            states: states.iter().map(|s| s.to_string()).collect(),
            parameters: parameters.iter().map(|s| s.to_string()).collect(),
            rhs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn nstates(&self) -> usize {
        self.states.len()
    }

    #[inline(always)]
    pub fn rhs(&self, t: T, y: &[f64], args: &OdeArgs, dy: &mut [f64]) {
        (self.rhs)(t, y, args, dy)
    }
}

/// A post-processing step with its declared parameters
#[derive(Debug, Clone)]
pub struct PostProcessing {
    name: String,
    parameters: Vec<String>,
    func: PostProcessingFn,
}

impl PostProcessing {
    pub fn new(name: &str, parameters: &[&str], func: PostProcessingFn) -> Self {
        PostProcessing {
            name: name.to_string(),
            parameters: parameters.iter().map(|s| s.to_string()).collect(),
            func,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn apply(
        &self,
        trajectories: &Trajectories,
        time: &[f64],
        forcing: Option<&Interpolant>,
        args: &OdeArgs,
    ) -> Result<Trajectories> {
        (self.func)(trajectories, time, forcing, args)
    }
}

/// Arguments of a single batch element, in the declared parameter order
#[derive(Debug, Clone, Copy)]
pub struct OdeArgs<'a> {
    names: &'a [String],
    values: &'a [Vec<f64>],
    forcing: Option<&'a Interpolant>,
    seed: Option<u64>,
}

impl<'a> OdeArgs<'a> {
    pub fn new(
        names: &'a [String],
        values: &'a [Vec<f64>],
        forcing: Option<&'a Interpolant>,
        seed: Option<u64>,
    ) -> Self {
        OdeArgs {
            names,
            values,
            forcing,
            seed,
        }
    }

    /// First element of the `i`-th argument
    #[inline(always)]
    pub fn scalar(&self, i: usize) -> f64 {
        self.values[i][0]
    }

    #[inline(always)]
    pub fn vector(&self, i: usize) -> &[f64] {
        &self.values[i]
    }

    /// Look up an argument by name
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i].as_slice())
    }

    /// Value of the forcing series `name` at time `t`
    pub fn forcing(&self, name: &str, t: T) -> Option<f64> {
        self.forcing.and_then(|f| f.evaluate(name, t))
    }

    pub fn interpolant(&self) -> Option<&Interpolant> {
        self.forcing
    }

    /// Seed of a stochastic evaluation
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Bind the scalar arguments of an [OdeArgs] to local variables, in declaration order
#[macro_export]
macro_rules! fetch_params {
    ($args:expr, $($name:ident),*) => {
        let args = &$args;
        let mut _idx = 0;
        $(
            let $name = args.scalar(_idx);
            _idx += 1;
        )*
    };
}

/// Lookup table from configured identifiers to model and post-processing functions
#[derive(Debug, Clone, Default)]
pub struct Registry {
    models: BTreeMap<String, OdeModel>,
    post_processing: BTreeMap<String, PostProcessing>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register_model(mut self, model: OdeModel) -> Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    pub fn register_post_processing(mut self, post_processing: PostProcessing) -> Self {
        self.post_processing
            .insert(post_processing.name.clone(), post_processing);
        self
    }

    pub fn model(&self, name: &str) -> Result<&OdeModel> {
        self.models
            .get(name)
            .ok_or_else(|| SimulationError::UnknownIdentifier {
                kind: "model",
                name: name.to_string(),
            })
    }

    pub fn post_processing(&self, name: &str) -> Result<&PostProcessing> {
        self.post_processing
            .get(name)
            .ok_or_else(|| SimulationError::UnknownIdentifier {
                kind: "post-processing",
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decay(_t: T, y: &[f64], args: &OdeArgs, dy: &mut [f64]) {
        fetch_params!(args, k);
        dy[0] = -k * y[0];
    }

    #[test]
    fn test_registry_lookup() {
        let registry =
            Registry::new().register_model(OdeModel::new("decay", &["y"], &["k"], decay));
        assert_eq!(registry.model("decay").unwrap().nstates(), 1);
        assert!(matches!(
            registry.model("growth"),
            Err(SimulationError::UnknownIdentifier { .. })
        ));
        assert!(registry.post_processing("none").is_err());
    }

    #[test]
    fn test_fetch_params_binds_in_order() {
        let names = vec!["k".to_string(), "c".to_string()];
        let values = vec![vec![0.5], vec![2.0, 3.0]];
        let args = OdeArgs::new(&names, &values, None, None);
        fetch_params!(args, k, c);
        assert_eq!(k, 0.5);
        assert_eq!(c, 2.0);
        assert_eq!(args.get("c").unwrap(), &[2.0, 3.0]);

        let model = OdeModel::new("decay", &["y"], &["k"], decay);
        let mut dy = [0.0];
        model.rhs(0.0, &[4.0], &args, &mut dy);
        assert_eq!(dy[0], -2.0);
    }
}
