use std::collections::BTreeMap;
use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};

/// Separator between a vector parameter name and the element index in flat names
pub const INDEX_SEPARATOR: &str = "___";

/// A parameter value is either a scalar or a fixed-length vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl ParameterValue {
    /// Number of elements, one for scalars
    pub fn len(&self) -> usize {
        match self {
            ParameterValue::Scalar(_) => 1,
            ParameterValue::Vector(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            ParameterValue::Scalar(v) => std::slice::from_ref(v),
            ParameterValue::Vector(v) => v.as_slice(),
        }
    }

    fn nan_like(&self) -> Self {
        match self {
            ParameterValue::Scalar(_) => ParameterValue::Scalar(f64::NAN),
            ParameterValue::Vector(v) => ParameterValue::Vector(vec![f64::NAN; v.len()]),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Scalar(value)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        ParameterValue::Vector(value)
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParameterValue::Scalar(v) => write!(f, "{}", v),
            ParameterValue::Vector(v) => write!(f, "{:?}", v),
        }
    }
}

/// Mapping from parameter name to value
pub type ParameterMap = BTreeMap<String, ParameterValue>;

/// Flat view of a [ParameterMap], vector elements are named `{name}___{i}`
pub type FlatParameters = BTreeMap<String, f64>;

/// A model parameter, as declared in the settings
///
/// Free parameters are traversed by inference algorithms, using the bounds and the step size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Param {
    #[serde(default)]
    pub name: String,
    pub value: ParameterValue,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub prior: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        Param {
            name: name.into(),
            value: value.into(),
            min: None,
            max: None,
            step: None,
            prior: None,
        }
    }

    pub fn bounds(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn prior(mut self, prior: impl Into<String>) -> Self {
        self.prior = Some(prior.into());
        self
    }

    /// Bounds of the parameter, if both are given and ordered
    pub fn range(&self) -> Option<(f64, f64)> {
        match (self.min, self.max) {
            (Some(min), Some(max)) if min < max => Some((min, max)),
            _ => None,
        }
    }
}

/// Initial values of the ODE states, one value or one value per batch element
pub type InitialValues = BTreeMap<String, Vec<f64>>;

/// Parameters and initial values handed to an evaluator
///
/// `broadcast` maps a vector parameter to the name of a simulation index, which selects one
/// element of the vector per batch element (e.g. one value per substance).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub parameters: ParameterMap,
    pub y0: InitialValues,
    #[serde(default)]
    pub broadcast: BTreeMap<String, String>,
}

/// Flatten a parameter mapping into scalar entries
///
/// Vectors of length `k` become `k` entries named `{name}___{i}`, scalars are kept and names
/// listed in `exclude` are dropped. The returned [Unflatten] rebuilds the nested mapping.
pub fn flatten(params: &ParameterMap, exclude: &[&str]) -> (FlatParameters, Unflatten) {
    let mut flat = FlatParameters::new();
    let mut template = ParameterMap::new();

    for (name, value) in params {
        if exclude.contains(&name.as_str()) {
            continue;
        }
        match value {
            ParameterValue::Scalar(v) => {
                flat.insert(name.clone(), *v);
            }
            ParameterValue::Vector(values) => {
                for (i, v) in values.iter().enumerate() {
                    flat.insert(format!("{name}{INDEX_SEPARATOR}{i}"), *v);
                }
            }
        }
        template.insert(name.clone(), value.nan_like());
    }

    (flat, Unflatten { template })
}

/// Inverse of [flatten], built from a NaN-filled template of the original mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unflatten {
    template: ParameterMap,
}

impl Unflatten {
    /// Rebuild a nested mapping from (possibly partial) flat parameters
    ///
    /// Entries that are missing in `flat` stay NaN.
    pub fn apply(&self, flat: &FlatParameters) -> Result<ParameterMap> {
        let mut params = self.template.clone();
        for (key, value) in flat {
            let (name, index) = split_flat_name(key);
            let entry = params
                .get_mut(name)
                .ok_or_else(|| SimulationError::ParameterNotFound(key.clone()))?;
            match (entry, index) {
                (ParameterValue::Scalar(v), None) => *v = *value,
                (ParameterValue::Vector(values), Some(i)) if i < values.len() => {
                    values[i] = *value
                }
                _ => return Err(SimulationError::ParameterNotFound(key.clone())),
            }
        }
        Ok(params)
    }

    /// Names of the parameters in the template
    pub fn names(&self) -> Vec<String> {
        self.template.keys().cloned().collect()
    }
}

/// Split `alpha___2` into (`alpha`, Some(2)), plain names into (name, None)
///
/// Only a numeric suffix after the last separator counts as an index, so base
/// names may contain the separator themselves.
pub fn split_flat_name(key: &str) -> (&str, Option<usize>) {
    match key.rsplit_once(INDEX_SEPARATOR) {
        Some((name, index)) => match index.parse::<usize>() {
            Ok(index) => (name, Some(index)),
            Err(_) => (key, None),
        },
        None => (key, None),
    }
}
