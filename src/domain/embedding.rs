//! C1: embedding codec. Converts between raw embedding vectors and the byte
//! form stored in face records. The element type and dimensionality are
//! inferred from the byte length alone (spec.md §4.1) — there is no side
//! channel carrying the encoding's provenance.

use super::ports::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    /// 512 dims, f32, ArcFace (server-side detector).
    ArcFace512,
    /// 128 dims, f64, legacy dlib/face_recognition detector.
    Legacy128F64,
    /// 128 dims, f32, browser-side detector.
    Browser128,
}

impl EmbeddingKind {
    pub fn dims(&self) -> usize {
        match self {
            EmbeddingKind::ArcFace512 => 512,
            EmbeddingKind::Legacy128F64 => 128,
            EmbeddingKind::Browser128 => 128,
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            EmbeddingKind::ArcFace512 => 2048,
            EmbeddingKind::Legacy128F64 => 1024,
            EmbeddingKind::Browser128 => 512,
        }
    }
}

/// Serialises a vector of f32 components as little-endian bytes. Callers
/// choose the element width implicitly by the length of `vector`: this crate
/// only ever produces 512-d f32 (ArcFace) embeddings on the write path, so
/// `encode_embedding` always emits the f32 layout. The f64 legacy layout is
/// decode-only, preserved for reading catalogues seeded by the legacy
/// detector.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decodes raw embedding bytes, inferring element type and dimensionality
/// from the byte length per the table in spec.md §4.1. Any other length is a
/// decode error: the face remains readable but cannot participate in
/// clustering.
pub fn decode_embedding(bytes: &[u8]) -> Result<(Vec<f32>, EmbeddingKind), CatalogError> {
    match bytes.len() {
        2048 => {
            let v = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Ok((v, EmbeddingKind::ArcFace512))
        }
        1024 => {
            let v = bytes
                .chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                })
                .collect();
            Ok((v, EmbeddingKind::Legacy128F64))
        }
        512 => {
            let v = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Ok((v, EmbeddingKind::Browser128))
        }
        other => Err(CatalogError::Decode(format!(
            "unsupported embedding byte length: {other}"
        ))),
    }
}

/// L2-normalises a vector in place. The worker runtime calls this for 512-d
/// embeddings on insertion so that dot product equals cosine similarity; the
/// codec itself does not enforce normalisation.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arcface_512() {
        let v: Vec<f32> = (0..512).map(|i| i as f32 * 0.001).collect();
        let bytes = encode_embedding(&v);
        assert_eq!(bytes.len(), 2048);
        let (decoded, kind) = decode_embedding(&bytes).unwrap();
        assert_eq!(kind, EmbeddingKind::ArcFace512);
        assert_eq!(decoded, v);
    }

    #[test]
    fn round_trips_browser_128() {
        let v: Vec<f32> = (0..128).map(|i| i as f32 * 0.01).collect();
        let bytes = encode_embedding(&v);
        assert_eq!(bytes.len(), 512);
        let (decoded, kind) = decode_embedding(&bytes).unwrap();
        assert_eq!(kind, EmbeddingKind::Browser128);
        assert_eq!(decoded, v);
    }

    #[test]
    fn decodes_legacy_128_f64() {
        let v: Vec<f64> = (0..128).map(|i| i as f64 * 0.01).collect();
        let mut bytes = Vec::with_capacity(1024);
        for x in &v {
            bytes.extend_from_slice(&x.to_le_bytes());
        }
        let (decoded, kind) = decode_embedding(&bytes).unwrap();
        assert_eq!(kind, EmbeddingKind::Legacy128F64);
        assert_eq!(decoded.len(), 128);
        assert!((decoded[1] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn rejects_unsupported_length() {
        let bytes = vec![0u8; 37];
        assert!(decode_embedding(&bytes).is_err());
    }

    #[test]
    fn l2_normalize_produces_unit_vector() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
