//! Core memory engine — fragment construction, indexing, storage, search,
//! lifecycle, and the agent-facing facade.
//!
//! The write path flows [`factory`] → [`store`] → [`index`]; the read path is
//! the [`search`] cascade. Lifecycle runs through [`consolidate`] and the
//! background [`evaluator`]. [`manager`] composes everything behind the
//! eleven agent operations. Type definitions live in [`types`].

pub mod consolidate;
pub mod error;
pub mod evaluator;
pub mod factory;
pub mod index;
pub mod keywords;
pub mod manager;
pub mod redact;
pub mod reflect;
pub mod search;
pub mod session;
pub mod stats;
pub mod store;
pub mod tokens;
pub mod types;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert raw little-endian bytes back to an f32 embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("4-byte chunk")))
        .collect()
}

/// Convert a cosine similarity threshold to an L2 distance threshold.
///
/// sqlite-vec defaults to L2 distance. For L2-normalized vectors:
///   L2_dist = sqrt(2 * (1 - cosine_similarity))
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).sqrt()
}

/// Recover cosine similarity from an L2 distance between unit vectors.
pub fn l2_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}
