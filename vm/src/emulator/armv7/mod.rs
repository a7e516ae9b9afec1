pub mod active;
pub mod context;
pub mod process;
pub mod registers;
pub mod thread;
pub mod tls;

pub use context::{Apsr, Armv7Context, InstructionSet, ItState};
pub use process::ProcessImage;
pub use registers::Register;
pub use thread::{ArmThread, ExecutionLoop, RunStatus, ThreadParams};
pub use tls::{TlsAllocator, TlsError, TLS_MAX};
