use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};

/// A single coordinate label along a dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Label {
    /// Parse a label from text, preferring integers over floats over plain text
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            Label::Int(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            Label::Float(f)
        } else {
            Label::Text(raw.to_string())
        }
    }

    /// Numeric value of the label, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Label::Int(i) => Some(*i as f64),
            Label::Float(f) => Some(*f),
            Label::Text(_) => None,
        }
    }

    /// Sort order of labels: numbers by value, then text
    pub fn compare(&self, other: &Label) -> Ordering {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Label::Int(i) => write!(f, "{}", i),
            Label::Float(x) => write!(f, "{}", x),
            Label::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Label {
    fn from(value: i64) -> Self {
        Label::Int(value)
    }
}

impl From<f64> for Label {
    fn from(value: f64) -> Self {
        Label::Float(value)
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Label::Text(value.to_string())
    }
}

/// Ordered mapping from dimension name to the labels along that dimension
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    entries: Vec<(String, Vec<Label>)>,
}

impl Coordinates {
    pub fn new() -> Self {
        Coordinates::default()
    }

    /// Add or replace the labels of a dimension, keeping the position of existing dimensions
    pub fn insert(&mut self, dim: impl Into<String>, labels: Vec<Label>) {
        let dim = dim.into();
        match self.entries.iter_mut().find(|(d, _)| *d == dim) {
            Some(entry) => entry.1 = labels,
            None => self.entries.push((dim, labels)),
        }
    }

    /// Builder variant of [Coordinates::insert]
    pub fn with(mut self, dim: impl Into<String>, labels: Vec<Label>) -> Self {
        self.insert(dim, labels);
        self
    }

    pub fn get(&self, dim: &str) -> Option<&[Label]> {
        self.entries
            .iter()
            .find(|(d, _)| d == dim)
            .map(|(_, labels)| labels.as_slice())
    }

    pub fn contains(&self, dim: &str) -> bool {
        self.get(dim).is_some()
    }

    /// Number of labels along `dim`
    pub fn len_of(&self, dim: &str) -> Option<usize> {
        self.get(dim).map(|labels| labels.len())
    }

    pub fn dims(&self) -> Vec<String> {
        self.entries.iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Label>)> {
        self.entries.iter().map(|(d, l)| (d, l))
    }

    /// Numeric values along `dim`, fails for text labels
    pub fn numeric(&self, dim: &str) -> Result<Vec<f64>> {
        let labels = self.get(dim).ok_or_else(|| {
            SimulationError::config(format!("dimension '{dim}' has no coordinates"))
        })?;
        labels
            .iter()
            .map(|l| {
                l.as_f64().ok_or_else(|| {
                    SimulationError::config(format!(
                        "coordinate '{l}' along '{dim}' is not numeric"
                    ))
                })
            })
            .collect()
    }

    /// Shape of an array spanning `dims`
    pub fn shape_of(&self, dims: &[String]) -> Result<Vec<usize>> {
        dims.iter()
            .map(|d| {
                self.len_of(d).ok_or_else(|| {
                    SimulationError::config(format!("dimension '{d}' has no coordinates"))
                })
            })
            .collect()
    }
}

/// A labeled n-dimensional array of a single variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArray {
    pub dims: Vec<String>,
    pub values: ArrayD<f64>,
}

impl DataArray {
    pub fn new(dims: Vec<String>, values: ArrayD<f64>) -> Result<Self> {
        if dims.len() != values.ndim() {
            return Err(SimulationError::shape(format!(
                "{} dimension names given for an array with {} axes",
                dims.len(),
                values.ndim()
            )));
        }
        Ok(DataArray { dims, values })
    }

    /// Reorder the axes following the relative order of the dimensions in `order`
    ///
    /// Dimensions of the array that are not in `order` keep their place at the end.
    pub fn transpose(&self, order: &[String]) -> DataArray {
        let mut target: Vec<String> = order
            .iter()
            .filter(|d| self.dims.contains(d))
            .cloned()
            .collect();
        for d in &self.dims {
            if !target.contains(d) {
                target.push(d.clone());
            }
        }
        let perm: Vec<usize> = target
            .iter()
            .filter_map(|d| self.dims.iter().position(|x| x == d))
            .collect();
        let values = self
            .values
            .view()
            .permuted_axes(IxDyn(&perm))
            .as_standard_layout()
            .into_owned();
        DataArray {
            dims: target,
            values,
        }
    }

    pub fn count_infinite(&self) -> usize {
        self.values.iter().filter(|v| v.is_infinite()).count()
    }
}

/// A collection of [DataArray]s sharing a set of [Coordinates]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub coords: Coordinates,
    data_vars: BTreeMap<String, DataArray>,
}

impl Dataset {
    pub fn new(coords: Coordinates) -> Self {
        Dataset {
            coords,
            data_vars: BTreeMap::new(),
        }
    }

    /// Insert a variable, checking its dimensions against the coordinates
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        dims: Vec<String>,
        values: ArrayD<f64>,
    ) -> Result<()> {
        let name = name.into();
        let array = DataArray::new(dims, values)?;
        let expected = self.coords.shape_of(&array.dims)?;
        if expected != array.values.shape() {
            return Err(SimulationError::shape(format!(
                "variable '{}' has shape {:?}, coordinates {:?} imply {:?}",
                name,
                array.values.shape(),
                array.dims,
                expected
            )));
        }
        self.data_vars.insert(name, array);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&DataArray> {
        self.data_vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data_vars.contains_key(name)
    }

    pub fn variables(&self) -> Vec<String> {
        self.data_vars.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DataArray)> {
        self.data_vars.iter()
    }

    /// Names of all dimensions used by at least one variable, in coordinate order
    pub fn dims(&self) -> Vec<String> {
        self.coords
            .dims()
            .into_iter()
            .filter(|d| self.data_vars.values().any(|v| v.dims.contains(d)))
            .collect()
    }

    /// Transpose every variable into the relative order of `order`
    pub fn transpose(&self, order: &[String]) -> Dataset {
        Dataset {
            coords: self.coords.clone(),
            data_vars: self
                .data_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.transpose(order)))
                .collect(),
        }
    }

    /// Keep only the listed variables, failing if one of them is missing
    pub fn select(&self, names: &[String]) -> Result<Dataset> {
        let mut selected = Dataset::new(self.coords.clone());
        for name in names {
            let var = self.get(name).ok_or_else(|| {
                SimulationError::config(format!("data variable '{name}' is missing"))
            })?;
            selected.data_vars.insert(name.clone(), var.clone());
        }
        Ok(selected)
    }

    pub fn count_infinite(&self) -> usize {
        self.data_vars.values().map(|v| v.count_infinite()).sum()
    }

    /// Read a long-format table into a dataset
    ///
    /// Every column listed in `dims` is a dimension, every other column a variable spanning all
    /// dimensions. The labels of each dimension are sorted, numbers before text. Combinations
    /// missing from the table are NaN.
    pub fn read_csv(path: impl AsRef<Path>, dims: &[String]) -> Result<Dataset> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let mut dim_columns = Vec::with_capacity(dims.len());
        for dim in dims {
            let position = headers.iter().position(|h| h == dim).ok_or_else(|| {
                SimulationError::config(format!(
                    "dimension '{}' is not a column of {}",
                    dim,
                    path.as_ref().display()
                ))
            })?;
            dim_columns.push(position);
        }
        let var_columns: Vec<usize> = (0..headers.len())
            .filter(|i| !dim_columns.contains(i))
            .collect();

        let mut labels: Vec<Vec<Label>> = vec![Vec::new(); dims.len()];
        let mut rows: Vec<(Vec<usize>, Vec<f64>)> = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut index = Vec::with_capacity(dims.len());
            for (d, &col) in dim_columns.iter().enumerate() {
                let label = Label::parse(record.get(col).unwrap_or_default());
                let position = match labels[d].iter().position(|l| *l == label) {
                    Some(p) => p,
                    None => {
                        labels[d].push(label);
                        labels[d].len() - 1
                    }
                };
                index.push(position);
            }
            let mut values = Vec::with_capacity(var_columns.len());
            for &col in &var_columns {
                let raw = record.get(col).unwrap_or_default();
                let value = if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
                    f64::NAN
                } else {
                    raw.parse::<f64>().map_err(|_| {
                        SimulationError::config(format!(
                            "value '{}' in column '{}' is not numeric",
                            raw, headers[col]
                        ))
                    })?
                };
                values.push(value);
            }
            rows.push((index, values));
        }

        // labels are sorted, so rows may come in any order
        for (d, dim_labels) in labels.iter_mut().enumerate() {
            let mut order: Vec<usize> = (0..dim_labels.len()).collect();
            order.sort_by(|a, b| dim_labels[*a].compare(&dim_labels[*b]));
            let mut rank = vec![0; order.len()];
            for (new, old) in order.iter().enumerate() {
                rank[*old] = new;
            }
            let sorted = order.iter().map(|i| dim_labels[*i].clone()).collect();
            *dim_labels = sorted;
            for (index, _) in rows.iter_mut() {
                index[d] = rank[index[d]];
            }
        }

        let mut coords = Coordinates::new();
        for (dim, l) in dims.iter().zip(labels) {
            coords.insert(dim.clone(), l);
        }
        let shape = coords.shape_of(dims)?;

        let mut dataset = Dataset::new(coords);
        for (v, &col) in var_columns.iter().enumerate() {
            let mut array = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
            for (index, values) in &rows {
                array[IxDyn(index)] = values[v];
            }
            dataset.insert(headers[col].clone(), dims.to_vec(), array)?;
        }
        tracing::debug!(
            "Read {} rows with variables {:?} from {}",
            rows.len(),
            dataset.variables(),
            path.as_ref().display()
        );
        Ok(dataset)
    }
}
