use std::collections::BTreeMap;

use thiserror::Error;

/// Decoded gradient payload: layer name to row-major flattened values.
pub type TensorMap = BTreeMap<String, Vec<f32>>;

/// Layered tensor wire format, little-endian throughout:
///
/// ```text
/// u32 layer_count
/// repeat layer_count times:
///   u32 name_length
///   name_length bytes of UTF-8 name
///   u32 element_count
///   element_count * 4 bytes of float32 values
/// ```
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("gradient blob truncated (needed {needed} more bytes)")]
    Truncated { needed: usize },

    #[error("{0} trailing bytes after the last layer")]
    TrailingBytes(usize),

    #[error("layer name is not valid UTF-8")]
    InvalidName(#[from] std::string::FromUtf8Error),

    #[error("compressed payload advertises {advertised} bytes, decompressed to {actual}")]
    SizeMismatch { advertised: usize, actual: usize },

    #[error("block decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.data.len() - self.offset;
        if remaining < len {
            return Err(CodecError::Truncated {
                needed: len - remaining,
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// Serialize tensors in the caller-supplied name order so the output is
/// deterministic. Names absent from `tensors` are skipped.
pub fn encode_gradients<'a, I>(names: I, tensors: &TensorMap) -> Vec<u8>
where
    I: IntoIterator<Item = &'a str>,
{
    let present: Vec<(&str, &Vec<f32>)> = names
        .into_iter()
        .filter_map(|name| tensors.get(name).map(|values| (name, values)))
        .collect();

    let total: usize = present
        .iter()
        .map(|(name, values)| 8 + name.len() + values.len() * 4)
        .sum();
    let mut out = Vec::with_capacity(4 + total);

    out.extend_from_slice(&(present.len() as u32).to_le_bytes());
    for (name, values) in present {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

/// Parse a float32 layered blob. Trailing bytes are an error.
pub fn decode_gradients(data: &[u8]) -> Result<TensorMap, CodecError> {
    let mut cursor = Cursor::new(data);
    let layer_count = cursor.read_u32()?;

    let mut tensors = TensorMap::new();
    for _ in 0..layer_count {
        let name_len = cursor.read_u32()? as usize;
        let name = String::from_utf8(cursor.take(name_len)?.to_vec())?;
        let elem_count = cursor.read_u32()? as usize;

        let raw = cursor.take(elem_count * 4)?;
        let values = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        tensors.insert(name, values);
    }

    if cursor.remaining() > 0 {
        return Err(CodecError::TrailingBytes(cursor.remaining()));
    }
    Ok(tensors)
}

/// Rewrite a float32 layered blob with float16 values, preserving layout.
pub(crate) fn narrow_f32_to_f16(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    transcode(data, 4, 2, |chunk, out| {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out.extend_from_slice(&half::f16::from_f32(value).to_le_bytes());
    })
}

/// Rewrite a float16 layered blob back to float32.
pub(crate) fn widen_f16_to_f32(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    transcode(data, 2, 4, |chunk, out| {
        let value = half::f16::from_le_bytes([chunk[0], chunk[1]]);
        out.extend_from_slice(&value.to_f32().to_le_bytes());
    })
}

fn transcode(
    data: &[u8],
    src_width: usize,
    dst_width: usize,
    convert: impl Fn(&[u8], &mut Vec<u8>),
) -> Result<Vec<u8>, CodecError> {
    let mut cursor = Cursor::new(data);
    let layer_count = cursor.read_u32()?;

    let mut out = Vec::with_capacity(4 + cursor.remaining() / src_width * dst_width);
    out.extend_from_slice(&layer_count.to_le_bytes());

    for _ in 0..layer_count {
        let name_len = cursor.read_u32()?;
        let name = cursor.take(name_len as usize)?;
        let elem_count = cursor.read_u32()?;

        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&elem_count.to_le_bytes());

        let raw = cursor.take(elem_count as usize * src_width)?;
        for chunk in raw.chunks_exact(src_width) {
            convert(chunk, &mut out);
        }
    }

    if cursor.remaining() > 0 {
        return Err(CodecError::TrailingBytes(cursor.remaining()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TensorMap {
        TensorMap::from([
            ("hidden_bias".to_string(), vec![1.0, 2.0, 3.0]),
            ("hidden_weight".to_string(), vec![0.5, -0.5, 0.25, -0.25]),
        ])
    }

    #[test]
    fn float32_round_trip_is_exact() {
        let tensors = sample();
        let encoded = encode_gradients(["hidden_weight", "hidden_bias"], &tensors);
        let decoded = decode_gradients(&encoded).unwrap();
        assert_eq!(decoded, tensors);
    }

    #[test]
    fn encoding_order_follows_caller() {
        let tensors = sample();
        let a = encode_gradients(["hidden_weight", "hidden_bias"], &tensors);
        let b = encode_gradients(["hidden_bias", "hidden_weight"], &tensors);
        assert_ne!(a, b);
        assert_eq!(decode_gradients(&a).unwrap(), decode_gradients(&b).unwrap());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut encoded = encode_gradients(["hidden_bias"], &sample());
        encoded.push(0);
        assert!(matches!(
            decode_gradients(&encoded),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let encoded = encode_gradients(["hidden_bias"], &sample());
        assert!(matches!(
            decode_gradients(&encoded[..encoded.len() - 2]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn empty_blob_decodes_to_empty_map() {
        let encoded = encode_gradients(std::iter::empty::<&str>(), &TensorMap::new());
        assert_eq!(encoded, 0u32.to_le_bytes());
        assert!(decode_gradients(&encoded).unwrap().is_empty());
    }
}
