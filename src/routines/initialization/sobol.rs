use sobol_burley::{sample, NUM_DIMENSIONS};

use crate::error::{Result, SimulationError};
use crate::structs::parameters::{flatten, FlatParameters, Param, ParameterMap};

/// Draws `points` parameter sets from a Sobol sequence within the bounds of the free parameters.
///
/// Vector parameters are expanded into their elements (`{name}___{i}`), each element spanning
/// its own dimension of the sequence. Every parameter must declare both bounds.
///
/// # Arguments
///
/// * `free` - The free parameters, with their bounds.
/// * `points` - The number of points in the Sobol sequence.
/// * `seed` - The seed for the Sobol sequence generator.
///
/// # Returns
///
/// One flat parameter set per point, ready to be dispatched.
pub fn generate(free: &[Param], points: usize, seed: u32) -> Result<Vec<FlatParameters>> {
    let mut dimensions: Vec<(String, f64, f64)> = Vec::new();
    for param in free {
        let (lower, upper) = param.range().ok_or_else(|| {
            SimulationError::config(format!(
                "free parameter '{}' needs a lower and an upper bound to be sampled",
                param.name
            ))
        })?;
        let mut single = ParameterMap::new();
        single.insert(param.name.clone(), param.value.clone());
        let (flat, _) = flatten(&single, &[]);
        for name in flat.into_keys() {
            dimensions.push((name, lower, upper));
        }
    }

    if dimensions.len() > NUM_DIMENSIONS as usize {
        return Err(SimulationError::config(format!(
            "cannot sample {} dimensions, the Sobol sequence supports {}",
            dimensions.len(),
            NUM_DIMENSIONS
        )));
    }

    let mut draws = Vec::with_capacity(points);
    for i in 0..points {
        let index = u32::try_from(i)
            .map_err(|_| SimulationError::config(format!("too many Sobol points: {}", points)))?;
        let point = dimensions
            .iter()
            .enumerate()
            .map(|(j, (name, lower, upper))| {
                let unscaled = sample(index, j as u32, seed) as f64;
                (name.clone(), lower + unscaled * (upper - lower))
            })
            .collect();
        draws.push(point);
    }
    Ok(draws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draws_stay_in_bounds() {
        let free = vec![
            Param::new("alpha", 5.0).bounds(0.1, 50.0),
            Param::new("k", vec![1.0, 1.0]).bounds(0.0, 2.0),
        ];
        let draws = generate(&free, 64, 22).unwrap();
        assert_eq!(draws.len(), 64);
        for draw in &draws {
            assert_eq!(draw.len(), 3);
            assert!((0.1..50.0).contains(&draw["alpha"]));
            assert!((0.0..2.0).contains(&draw["k___1"]));
        }
        assert_eq!(draws, generate(&free, 64, 22).unwrap());
    }

    #[test]
    fn test_unbounded_parameter() {
        let free = vec![Param::new("alpha", 5.0)];
        assert!(generate(&free, 4, 0).is_err());
    }
}
