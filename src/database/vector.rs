// Embedding vectors are stored as little-endian f32 blobs.

use anyhow::{Result, bail};

#[inline]
pub fn encode_f32_le(values: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 4);
    for value in values {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

#[inline]
pub fn decode_f32_le(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        bail!("Embedding blob length {} is not a multiple of 4", blob.len());
    }

    let mut values = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        let bytes: [u8; 4] = chunk.try_into().expect("chunk size verified");
        values.push(f32::from_le_bytes(bytes));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let values = vec![0.5_f32, -1.25, 0.0, 3.75];
        let blob = encode_f32_le(&values);
        assert_eq!(blob.len(), 16);
        assert_eq!(decode_f32_le(&blob).expect("can decode blob"), values);
    }

    #[test]
    fn empty_vector() {
        assert!(encode_f32_le(&[]).is_empty());
        assert_eq!(decode_f32_le(&[]).expect("can decode empty blob"), vec![]);
    }

    #[test]
    fn misaligned_blob_rejected() {
        assert!(decode_f32_le(&[0, 1, 2]).is_err());
    }
}
