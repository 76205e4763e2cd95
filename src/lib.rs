//! Building blocks for simulating and calibrating toxicokinetic-toxicodynamic (TKTD) ODE models
//! against observations with labeled dimensions.
//!
//! A [Simulation](simulation::Simulation) is built from [Settings](routines::settings::Settings),
//! a [Registry](simulator::Registry) of model functions and a [Dataset](structs::dataset::Dataset)
//! of observations. Each parameter vector is dispatched into an
//! [Evaluator](simulator::evaluator::Evaluator), which solves the model for every element of the
//! batch dimension in parallel and returns the results labeled like the observations.

pub mod error;
pub mod simulation;
pub mod simulator;

pub mod routines {
    pub mod initialization {
        pub mod sobol;
    }
    pub mod optimization {
        pub mod calibrate;
    }
    pub mod logger;
    pub mod objective;
    pub mod scaler;
    pub mod seeds;
    pub mod settings;
}

pub mod structs {
    pub mod coordinates;
    pub mod dataset;
    pub mod parameters;
}

pub mod prelude {
    pub use crate::error::{Result, SimulationError};
    pub use crate::fetch_params;
    pub use crate::routines::logger::setup_log;
    pub use crate::routines::objective::{Objective, ObjectiveValue, PerVariable, TotalAverage};
    pub use crate::routines::optimization::calibrate::Calibration;
    pub use crate::routines::scaler::{check_feasibility, MinMaxScaler};
    pub use crate::routines::settings::{read_settings, Bounds, ModelType, Settings};
    pub use crate::simulation::{parse_input, InputValue, Simulation};
    pub use crate::simulator::assemble::{dataset_from_array, dataset_from_map};
    pub use crate::simulator::evaluator::{Evaluator, EvaluatorSpec};
    pub use crate::simulator::integrator::{IntegrationOptions, Method};
    pub use crate::simulator::interpolation::{Forcing, Interpolant};
    pub use crate::simulator::solver::{Batch, Solver, SolverOutput};
    pub use crate::simulator::{
        OdeArgs, OdeModel, PostProcessing, Registry, Trajectories, T,
    };
    pub use crate::structs::coordinates::{
        check_dimensions, create_coordinates, set_coordinates, DataStructure, Dimensionality,
        VarDimMapper,
    };
    pub use crate::structs::dataset::{Coordinates, DataArray, Dataset, Label};
    pub use crate::structs::parameters::{
        flatten, FlatParameters, InitialValues, ModelParameters, Param, ParameterMap,
        ParameterValue, Unflatten,
    };
}
