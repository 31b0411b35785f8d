pub mod embedding;
pub mod models;
pub mod ports;
pub mod similarity;
pub mod thumbnail;

pub use embedding::{decode_embedding, encode_embedding, EmbeddingKind};
pub use models::*;
pub use ports::*;
pub use similarity::match_candidate;
pub use thumbnail::{apply_orientation, face_thumbnail, whole_image_thumbnail, BBox};
