use crate::codec::{CodecError, TensorMap, decode_gradients};

/// Sample-weighted federated average of weight deltas.
///
/// Each input is a raw float32 layered blob plus its sample count. The
/// result holds every layer present in any input, weighted by
/// `samples / total_samples`; inputs missing a layer contribute zero to it.
/// A zero total yields the empty map.
pub fn aggregate_deltas(submissions: &[(Vec<u8>, u32)]) -> Result<TensorMap, CodecError> {
    let total_samples: u64 = submissions.iter().map(|(_, n)| *n as u64).sum();
    if total_samples == 0 {
        return Ok(TensorMap::new());
    }

    // Accumulate in f64 so aggregation order cannot change the result
    // beyond float32 rounding.
    let mut sums: std::collections::BTreeMap<String, Vec<f64>> = Default::default();
    for (blob, samples) in submissions {
        let weight = *samples as f64 / total_samples as f64;
        for (name, values) in decode_gradients(blob)? {
            let sum = sums.entry(name).or_insert_with(|| vec![0.0; values.len()]);
            if sum.len() < values.len() {
                sum.resize(values.len(), 0.0);
            }
            for (acc, v) in sum.iter_mut().zip(values) {
                *acc += weight * v as f64;
            }
        }
    }

    Ok(sums
        .into_iter()
        .map(|(name, values)| (name, values.into_iter().map(|v| v as f32).collect()))
        .collect())
}

/// Apply averaged weight deltas: `new = old + delta`, element-wise. Layers
/// absent from `deltas` are copied unchanged; delta layers unknown to the
/// weights are ignored.
pub fn apply_deltas(weights: &TensorMap, deltas: &TensorMap) -> TensorMap {
    weights
        .iter()
        .map(|(name, values)| {
            let updated = match deltas.get(name) {
                Some(delta) => values
                    .iter()
                    .zip(delta.iter().chain(std::iter::repeat(&0.0)))
                    .map(|(w, d)| w + d)
                    .collect(),
                None => values.clone(),
            };
            (name.clone(), updated)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_gradients;
    use approx::assert_relative_eq;

    fn blob(name: &str, values: Vec<f32>) -> Vec<u8> {
        encode_gradients([name], &TensorMap::from([(name.to_string(), values)]))
    }

    #[test]
    fn zero_samples_yield_empty_map() {
        let submissions = vec![(blob("hidden_bias", vec![1.0, 2.0]), 0)];
        assert!(aggregate_deltas(&submissions).unwrap().is_empty());
    }

    #[test]
    fn single_submission_is_identity() {
        let g = blob("hidden_bias", vec![1.0, 2.0, 3.0]);
        let averaged = aggregate_deltas(&[(g.clone(), 7)]).unwrap();
        assert_eq!(averaged["hidden_bias"], vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn same_blob_any_weights_is_identity() {
        let g = blob("hidden_bias", vec![0.5, -1.5]);
        let averaged = aggregate_deltas(&[(g.clone(), 3), (g.clone(), 11)]).unwrap();
        assert_relative_eq!(averaged["hidden_bias"][0], 0.5);
        assert_relative_eq!(averaged["hidden_bias"][1], -1.5);
    }

    #[test]
    fn weighting_follows_sample_counts() {
        let a = blob("output_bias", vec![1.0]);
        let b = blob("output_bias", vec![4.0]);
        // (1*1 + 3*4) / 4 = 3.25
        let averaged = aggregate_deltas(&[(a, 1), (b, 3)]).unwrap();
        assert_relative_eq!(averaged["output_bias"][0], 3.25);
    }

    #[test]
    fn missing_layers_contribute_zero() {
        let a = blob("hidden_bias", vec![2.0, 2.0]);
        let b = blob("output_bias", vec![6.0]);
        let averaged = aggregate_deltas(&[(a, 1), (b, 1)]).unwrap();
        assert_relative_eq!(averaged["hidden_bias"][0], 1.0);
        assert_relative_eq!(averaged["output_bias"][0], 3.0);
    }

    #[test]
    fn apply_adds_deltas_and_keeps_untouched_layers() {
        let weights = TensorMap::from([
            ("hidden_bias".to_string(), vec![1.0, 1.0]),
            ("output_bias".to_string(), vec![5.0]),
        ]);
        let deltas = TensorMap::from([("hidden_bias".to_string(), vec![0.5, -0.5])]);

        let updated = apply_deltas(&weights, &deltas);
        assert_eq!(updated["hidden_bias"], vec![1.5, 0.5]);
        assert_eq!(updated["output_bias"], vec![5.0]);
    }

    #[test]
    fn apply_with_empty_deltas_is_identity() {
        let weights = TensorMap::from([("hidden_bias".to_string(), vec![1.0, 2.0])]);
        assert_eq!(apply_deltas(&weights, &TensorMap::new()), weights);
    }
}
