pub mod armv7;
pub mod error;
pub mod memory;

pub use error::EmulationError;
