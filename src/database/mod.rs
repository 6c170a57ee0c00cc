pub mod connection;
pub mod operations;

pub use connection::{DatabaseError, SharedConnection};
pub use operations::store_reading;
