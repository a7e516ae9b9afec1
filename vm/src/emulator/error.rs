use thiserror::Error;

use crate::emulator::armv7::tls::TlsError;

/// Errors that the thread core and the seams it drives can surface.
#[derive(Error, Debug)]
pub enum EmulationError {
    /// TLS slot pool failure, typically exhaustion.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// A guest address fell outside the mapped address space.
    #[error("invalid guest memory access at {addr:#010x}")]
    InvalidMemoryAccess { addr: u32 },

    /// The guest allocator could not satisfy an allocation request.
    #[error("guest address space exhausted")]
    OutOfGuestMemory,

    /// A register name did not resolve to an ARMv7 core register.
    #[error("unknown register {0:?}")]
    UnknownRegister(String),

    /// The execution loop was stopped from outside before the dispatched
    /// code ran to completion.
    #[error("execution stopped externally")]
    Stopped,
}
