use crate::codec::{CodecError, narrow_f32_to_f16, widen_f16_to_f32};

/// First byte of a compressed payload. A float32 blob can never start with
/// this byte in practice because it would imply a 4-billion-layer count.
pub const COMPRESSION_MAGIC: u8 = 0x01;

/// Quantize a float32 layered blob to float16, block-compress it, and wrap
/// it with the magic + original-size header:
///
/// ```text
/// u8  0x01
/// u32 original_size          (decompressed float16 payload length)
/// lz4-block-compressed float16 payload
/// ```
pub fn compress_gradients(raw_float32: &[u8]) -> Result<Vec<u8>, CodecError> {
    let f16_payload = narrow_f32_to_f16(raw_float32)?;
    let compressed = lz4_flex::block::compress(&f16_payload);

    let mut out = Vec::with_capacity(5 + compressed.len());
    out.push(COMPRESSION_MAGIC);
    out.extend_from_slice(&(f16_payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Undo [`compress_gradients`]. Payloads without the magic byte are treated
/// as legacy uncompressed float32 and returned as-is.
pub fn decompress_gradients(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.first() != Some(&COMPRESSION_MAGIC) {
        return Ok(data.to_vec());
    }
    if data.len() < 5 {
        return Err(CodecError::Truncated {
            needed: 5 - data.len(),
        });
    }

    let advertised = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let f16_payload = lz4_flex::block::decompress(&data[5..], advertised)?;
    if f16_payload.len() != advertised {
        return Err(CodecError::SizeMismatch {
            advertised,
            actual: f16_payload.len(),
        });
    }
    widen_f16_to_f32(&f16_payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TensorMap, decode_gradients, encode_gradients};
    use approx::assert_relative_eq;

    #[test]
    fn compressed_round_trip_within_f16_precision() {
        let tensors = TensorMap::from([
            (
                "hidden_weight".to_string(),
                (0..512).map(|i| (i as f32 - 256.0) * 0.013).collect(),
            ),
            ("hidden_bias".to_string(), vec![0.125, -3.5, 7.75]),
        ]);
        let raw = encode_gradients(["hidden_weight", "hidden_bias"], &tensors);

        let compressed = compress_gradients(&raw).unwrap();
        assert_eq!(compressed[0], COMPRESSION_MAGIC);

        let restored = decode_gradients(&decompress_gradients(&compressed).unwrap()).unwrap();
        for (name, values) in &tensors {
            let restored_values = &restored[name];
            for (a, b) in values.iter().zip(restored_values) {
                assert_relative_eq!(*a, *b, max_relative = 2e-3);
            }
        }
    }

    #[test]
    fn uncompressed_passthrough_is_byte_exact() {
        let raw = encode_gradients(
            ["output_bias"],
            &TensorMap::from([("output_bias".to_string(), vec![1.0, -1.0])]),
        );
        assert_eq!(decompress_gradients(&raw).unwrap(), raw);
    }

    #[test]
    fn advertised_size_mismatch_rejected() {
        let raw = encode_gradients(
            ["output_bias"],
            &TensorMap::from([("output_bias".to_string(), vec![1.0, -1.0])]),
        );
        let mut compressed = compress_gradients(&raw).unwrap();
        // Shrink the advertised size; the lz4 block no longer fits.
        compressed[1..5].copy_from_slice(&4u32.to_le_bytes());
        assert!(decompress_gradients(&compressed).is_err());
    }

    #[test]
    fn compression_shrinks_redundant_payloads() {
        let tensors = TensorMap::from([("hidden_weight".to_string(), vec![0.5f32; 4096])]);
        let raw = encode_gradients(["hidden_weight"], &tensors);
        let compressed = compress_gradients(&raw).unwrap();
        assert!(compressed.len() < raw.len() / 4);
    }
}
