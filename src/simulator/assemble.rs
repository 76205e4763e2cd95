use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis};

use crate::error::{Result, SimulationError};
use crate::structs::coordinates::DataStructure;
use crate::structs::dataset::{Coordinates, Dataset};

/// Build a dataset from one array whose trailing axis enumerates the variables
///
/// Every variable spans all coordinate dimensions, in coordinate order.
pub fn dataset_from_array(
    y: &ArrayD<f64>,
    names: &[String],
    coordinates: &Coordinates,
) -> Result<Dataset> {
    let last = y.ndim().checked_sub(1).ok_or_else(|| {
        SimulationError::shape("cannot split a zero-dimensional array into variables")
    })?;
    if y.len_of(Axis(last)) != names.len() {
        return Err(SimulationError::shape(format!(
            "the last axis has length {}, but {} variable names were given",
            y.len_of(Axis(last)),
            names.len()
        )));
    }

    let dims = coordinates.dims();
    let mut dataset = Dataset::new(coordinates.clone());
    for (i, name) in names.iter().enumerate() {
        let values = y.index_axis(Axis(last), i).to_owned();
        dataset.insert(name.clone(), dims.clone(), values)?;
    }
    Ok(dataset)
}

/// Build a dataset from named arrays, labelling their axes with the recorded dimensions
pub fn dataset_from_map(
    y: &BTreeMap<String, ArrayD<f64>>,
    data_structure: &DataStructure,
    coordinates: &Coordinates,
) -> Result<Dataset> {
    let mut dataset = Dataset::new(coordinates.clone());
    for (name, values) in y {
        let dims = data_structure.get(name).ok_or_else(|| {
            SimulationError::config(format!("variable '{}' has no recorded dimensions", name))
        })?;
        if dims.len() != values.ndim() {
            return Err(SimulationError::shape(format!(
                "variable '{}' has {} axes, its dimensions are {:?}",
                name,
                values.ndim(),
                dims
            )));
        }
        dataset.insert(name.clone(), dims.to_vec(), values.clone())?;
    }
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::dataset::Label;
    use ndarray::IxDyn;

    fn coordinates() -> Coordinates {
        Coordinates::new()
            .with("id", vec![Label::Int(0)])
            .with("time", (0..4).map(Label::Int).collect())
    }

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_trailing_axis_matches_names() {
        let y = ArrayD::from_elem(IxDyn(&[1, 4, 3]), 1.0);
        let ds = dataset_from_array(&y, &names(&["cext", "cint", "nzd"]), &coordinates()).unwrap();
        assert_eq!(ds.variables().len(), 3);
        assert_eq!(ds.get("cint").unwrap().values.shape(), &[1, 4]);
    }

    #[test]
    fn test_trailing_axis_mismatch() {
        let y = ArrayD::from_elem(IxDyn(&[1, 4, 2]), 1.0);
        let result = dataset_from_array(&y, &names(&["cext", "cint", "nzd"]), &coordinates());
        assert!(matches!(result, Err(SimulationError::ShapeMismatch(_))));
    }

    #[test]
    fn test_from_map_checks_axis_count() {
        let mut structure = DataStructure::default();
        structure.insert("cext", names(&["time", "id"]));

        let mut y = BTreeMap::new();
        y.insert("cext".to_string(), ArrayD::zeros(IxDyn(&[4, 1])));
        let ds = dataset_from_map(&y, &structure, &coordinates()).unwrap();
        assert_eq!(ds.get("cext").unwrap().dims, names(&["time", "id"]));

        y.insert("cext".to_string(), ArrayD::zeros(IxDyn(&[4])));
        assert!(matches!(
            dataset_from_map(&y, &structure, &coordinates()),
            Err(SimulationError::ShapeMismatch(_))
        ));
    }
}
