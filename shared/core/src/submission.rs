use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One device's per-round gradient upload, JSON-encoded into the round's
/// bucket. `gradients` is base64 of the decompressed layered float32 blob.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GradientSubmission {
    pub device_id: String,
    pub gradients: String,
    pub num_samples: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let sub = GradientSubmission {
            device_id: "d-1".to_string(),
            gradients: "AAAA".to_string(),
            num_samples: 32,
            metrics: BTreeMap::from([("loss".to_string(), 0.25)]),
        };
        let json = serde_json::to_string(&sub).unwrap();
        let back: GradientSubmission = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sub);
    }
}
