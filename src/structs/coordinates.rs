use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};
use crate::structs::dataset::{Coordinates, Dataset, Label};

/// Zip the declared dimensions with one coordinate array each
///
/// The number of declared dimensions must match the number of coordinate arrays.
pub fn create_coordinates(
    dimensions: &[String],
    coordinate_data: Vec<Vec<Label>>,
) -> Result<Coordinates> {
    if dimensions.len() != coordinate_data.len() {
        return Err(SimulationError::config(format!(
            "number of dimensions specified in the settings ({}) must match the number of coordinate arrays ({})",
            dimensions.len(),
            coordinate_data.len()
        )));
    }
    let mut coords = Coordinates::new();
    for (dim, labels) in dimensions.iter().zip(coordinate_data) {
        coords.insert(dim.clone(), labels);
    }
    Ok(coords)
}

/// Read the coordinates of the declared dimensions out of the observations
pub fn set_coordinates(dimensions: &[String], observations: &Dataset) -> Result<Coordinates> {
    let mut data = Vec::with_capacity(dimensions.len());
    for dim in dimensions {
        let labels = observations.coords.get(dim).ok_or_else(|| {
            SimulationError::config(format!("dimension '{dim}' is missing from the observations"))
        })?;
        data.push(labels.to_vec());
    }
    create_coordinates(dimensions, data)
}

/// Fails if the dataset uses a dimension that is not a simulation dimension
pub fn check_dimensions(dataset: &Dataset, dimensions: &[String]) -> Result<()> {
    let unknown: Vec<String> = dataset
        .dims()
        .into_iter()
        .filter(|d| !dimensions.contains(d))
        .collect();
    if !unknown.is_empty() {
        return Err(SimulationError::config(format!(
            "dataset dimensions {:?} were not found in the simulation dimensions {:?}",
            unknown, dimensions
        )));
    }
    Ok(())
}

/// Variable name to its ordered dimension names, as found in the observations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataStructure(BTreeMap<String, Vec<String>>);

impl DataStructure {
    /// Derive the structure from the observations transposed into the simulation dimension order
    pub fn from_observations(
        observations: &Dataset,
        dimensions: &[String],
        data_variables: &[String],
    ) -> Result<Self> {
        let ordered = observations.select(data_variables)?.transpose(dimensions);
        let mut structure = BTreeMap::new();
        for var in data_variables {
            if let Some(array) = ordered.get(var) {
                structure.insert(var.clone(), array.dims.clone());
            }
        }
        Ok(DataStructure(structure))
    }

    pub fn get(&self, var: &str) -> Option<&[String]> {
        self.0.get(var).map(|d| d.as_slice())
    }

    pub fn insert(&mut self, var: impl Into<String>, dims: Vec<String>) {
        self.0.insert(var.into(), dims);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn variables(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

/// Variable name to the positions of its (observation ordered) dimensions, in evaluator order
///
/// Raw solver output has its axes in evaluator order; the inverse of the mapping permutes it back
/// into the native order of the observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarDimMapper(BTreeMap<String, Vec<usize>>);

impl VarDimMapper {
    pub fn create(data_structure: &DataStructure, evaluator_dims: &[String]) -> Self {
        let mut mapper = BTreeMap::new();
        for (var, obs_dims) in data_structure.iter() {
            let positions = evaluator_dims
                .iter()
                .filter_map(|e| obs_dims.iter().position(|d| d == e))
                .collect();
            mapper.insert(var.clone(), positions);
        }
        VarDimMapper(mapper)
    }

    pub fn get(&self, var: &str) -> Option<&[usize]> {
        self.0.get(var).map(|p| p.as_slice())
    }

    /// Axis permutation taking an evaluator ordered array into observation order
    pub fn permutation(&self, var: &str) -> Option<Vec<usize>> {
        let mapper = self.get(var)?;
        let mut perm = vec![0; mapper.len()];
        for (raw_axis, &obs_axis) in mapper.iter().enumerate() {
            if obs_axis >= perm.len() {
                return None;
            }
            perm[obs_axis] = raw_axis;
        }
        Some(perm)
    }
}

/// Variable name to its `(dimension, size)` pairs in evaluator order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensionality(BTreeMap<String, Vec<(String, usize)>>);

impl Dimensionality {
    pub fn create(
        data_structure: &DataStructure,
        coordinates: &Coordinates,
        evaluator_dims: &[String],
    ) -> Result<Self> {
        let mut dimensionality = BTreeMap::new();
        for (var, dims) in data_structure.iter() {
            let mut sizes = Vec::with_capacity(dims.len());
            for e in evaluator_dims.iter().filter(|e| dims.contains(e)) {
                let size = coordinates.len_of(e).ok_or_else(|| {
                    SimulationError::config(format!("dimension '{e}' has no coordinates"))
                })?;
                sizes.push((e.clone(), size));
            }
            dimensionality.insert(var.clone(), sizes);
        }
        Ok(Dimensionality(dimensionality))
    }

    pub fn get(&self, var: &str) -> Option<&[(String, usize)]> {
        self.0.get(var).map(|d| d.as_slice())
    }

    /// Expected shape of a variable in evaluator order
    pub fn shape(&self, var: &str) -> Option<Vec<usize>> {
        self.get(var).map(|d| d.iter().map(|(_, n)| *n).collect())
    }

    pub fn insert(&mut self, var: impl Into<String>, dims: Vec<(String, usize)>) {
        self.0.insert(var.into(), dims);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    fn observations() -> Dataset {
        let coords = Coordinates::new()
            .with("id", vec![Label::Int(0), Label::Int(1)])
            .with("time", (0..4).map(Label::Int).collect());
        let mut ds = Dataset::new(coords);
        ds.insert("cext", names(&["id", "time"]), ArrayD::zeros(IxDyn(&[2, 4])))
            .unwrap();
        ds
    }

    #[test]
    fn test_dimension_count_mismatch() {
        let result = create_coordinates(&names(&["time", "id"]), vec![vec![Label::Int(0)]]);
        assert!(matches!(result, Err(SimulationError::Configuration(_))));
    }

    #[test]
    fn test_missing_dimension_in_observations() {
        let result = set_coordinates(&names(&["time", "substance"]), &observations());
        assert!(result.is_err());
    }

    #[test]
    fn test_data_structure_follows_simulation_order() {
        let ds = DataStructure::from_observations(
            &observations(),
            &names(&["time", "id"]),
            &names(&["cext"]),
        )
        .unwrap();
        assert_eq!(ds.get("cext").unwrap(), &names(&["time", "id"])[..]);
    }

    #[test]
    fn test_var_dim_mapper_permutation() {
        let mut ds = DataStructure::default();
        ds.insert("cext", names(&["time", "id"]));
        let mapper = VarDimMapper::create(&ds, &names(&["id", "time"]));

        // evaluator axis 0 (id) is observation axis 1
        assert_eq!(mapper.get("cext").unwrap(), &[1, 0]);
        assert_eq!(mapper.permutation("cext").unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_dimensionality_uses_evaluator_order() {
        let mut ds = DataStructure::default();
        ds.insert("cext", names(&["time", "id"]));
        let coords = set_coordinates(&names(&["time", "id"]), &observations()).unwrap();
        let dimensionality =
            Dimensionality::create(&ds, &coords, &names(&["id", "time"])).unwrap();
        assert_eq!(dimensionality.shape("cext").unwrap(), vec![2, 4]);
    }
}
