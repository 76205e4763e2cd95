use eyre::Result;
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;
use tktdcore::prelude::*;

fn names(n: &[&str]) -> Vec<String> {
    n.iter().map(|s| s.to_string()).collect()
}

/// Coordinate arrays must pair up with the declared dimensions
#[test]
fn test_create_coordinates() -> Result<()> {
    let coords = create_coordinates(
        &names(&["time", "id"]),
        vec![
            vec![Label::Float(0.0), Label::Float(0.5)],
            vec![Label::Text("a".to_string())],
        ],
    )?;
    assert_eq!(coords.dims(), names(&["time", "id"]));
    assert_eq!(coords.numeric("time")?, vec![0.0, 0.5]);

    let result = create_coordinates(&names(&["time", "id"]), vec![vec![Label::Int(0)]]);
    assert!(matches!(result, Err(SimulationError::Configuration(_))));
    Ok(())
}

/// The trailing axis of the array must enumerate exactly the given variables
#[test]
fn test_dataset_from_array() -> Result<()> {
    let coords = Coordinates::new()
        .with("time", (0..4).map(Label::Int).collect())
        .with("id", vec![Label::Int(0), Label::Int(1)]);
    let y = ArrayD::from_shape_fn(IxDyn(&[4, 2, 2]), |i| (i[0] * 10 + i[1] + 100 * i[2]) as f64);

    let dataset = dataset_from_array(&y, &names(&["cext", "cint"]), &coords)?;
    assert_eq!(dataset.variables(), names(&["cext", "cint"]));
    assert_eq!(dataset.get("cint").unwrap().values[[3, 1]], 131.0);

    let result = dataset_from_array(&y, &names(&["cext", "cint", "nzd"]), &coords);
    assert!(matches!(result, Err(SimulationError::ShapeMismatch(_))));
    Ok(())
}

#[test]
fn test_dataset_from_map() -> Result<()> {
    let coords = Coordinates::new()
        .with("time", (0..3).map(Label::Int).collect())
        .with("id", vec![Label::Int(0)]);
    let mut structure = DataStructure::default();
    structure.insert("cint", names(&["time", "id"]));
    structure.insert("survival", names(&["id"]));

    let mut y = BTreeMap::new();
    y.insert("cint".to_string(), ArrayD::zeros(IxDyn(&[3, 1])));
    y.insert("survival".to_string(), ArrayD::ones(IxDyn(&[1])));
    let dataset = dataset_from_map(&y, &structure, &coords)?;
    assert_eq!(dataset.get("survival").unwrap().dims, names(&["id"]));

    y.insert("survival".to_string(), ArrayD::ones(IxDyn(&[3, 1])));
    assert!(dataset_from_map(&y, &structure, &coords).is_err());
    Ok(())
}

/// Flattening a mixed mapping and rebuilding it from a partial update
#[test]
fn test_flatten_and_rebuild() -> Result<()> {
    let mut params = ParameterMap::new();
    params.insert("alpha".to_string(), ParameterValue::Vector(vec![1.0, 2.0]));
    params.insert("beta".to_string(), ParameterValue::Scalar(0.02));
    params.insert("sigma".to_string(), ParameterValue::Scalar(0.1));

    let (flat, unflatten) = flatten(&params, &["sigma"]);
    assert_eq!(
        flat.keys().cloned().collect::<Vec<_>>(),
        names(&["alpha___0", "alpha___1", "beta"])
    );
    assert_eq!(unflatten.names(), names(&["alpha", "beta"]));

    let rebuilt = unflatten.apply(&flat)?;
    assert_eq!(rebuilt["alpha"], ParameterValue::Vector(vec![1.0, 2.0]));

    let mut partial = FlatParameters::new();
    partial.insert("alpha___1".to_string(), 5.0);
    let rebuilt = unflatten.apply(&partial)?;
    match &rebuilt["alpha"] {
        ParameterValue::Vector(values) => {
            assert!(values[0].is_nan());
            assert_eq!(values[1], 5.0);
        }
        other => panic!("expected a vector, got {}", other),
    }

    partial.insert("alpha___7".to_string(), 1.0);
    assert!(matches!(
        unflatten.apply(&partial),
        Err(SimulationError::ParameterNotFound(_))
    ));
    Ok(())
}

/// Axes are permuted from the evaluator order into the order of each observed variable
#[test]
fn test_var_dim_mapper() {
    let mut structure = DataStructure::default();
    structure.insert("cint", names(&["time", "id"]));
    structure.insert("survival", names(&["id"]));
    let mapper = VarDimMapper::create(&structure, &names(&["id", "time"]));
    assert_eq!(mapper.get("cint"), Some(&[1, 0][..]));
    assert_eq!(mapper.get("survival"), Some(&[0][..]));
}

#[test]
fn test_dimensionality() -> Result<()> {
    let coords = Coordinates::new()
        .with("time", (0..5).map(Label::Int).collect())
        .with("id", (0..3).map(Label::Int).collect());
    let mut structure = DataStructure::default();
    structure.insert("cint", names(&["time", "id"]));
    let dimensionality = Dimensionality::create(&structure, &coords, &names(&["id", "time"]))?;
    assert_eq!(dimensionality.shape("cint"), Some(vec![3, 5]));
    assert_eq!(dimensionality.shape("nzd"), None);
    Ok(())
}
