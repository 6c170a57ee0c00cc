pub mod advertisement;
pub mod service;

pub use service::{IntakeError, IntakeService};
