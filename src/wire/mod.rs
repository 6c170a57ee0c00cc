pub mod decoder;
pub mod schema;

pub use decoder::{DecodeFailure, Decoder};
pub use schema::SchemaRevision;
