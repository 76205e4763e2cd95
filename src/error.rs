use thiserror::Error;

/// Errors raised while setting up or running a simulation
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The configuration is inconsistent with the model or the observations
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A parameter name was not found among the declared parameters
    #[error("parameter name not found: '{0}'")]
    ParameterNotFound(String),
    /// A registry lookup (model, post-processing, method, objective) failed
    #[error("unknown {kind} identifier '{name}'")]
    UnknownIdentifier { kind: &'static str, name: String },
    /// Declared and actual array shapes disagree
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// The integrator did not reach the final time within the step budget
    #[error("solver diverged at t = {time} for batch element {element}: maximum number of steps ({max_steps}) reached")]
    SolverDivergence {
        element: usize,
        time: f64,
        max_steps: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, SimulationError>;

impl SimulationError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SimulationError::Configuration(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        SimulationError::ShapeMismatch(msg.into())
    }
}
