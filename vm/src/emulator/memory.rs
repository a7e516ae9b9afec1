use std::sync::Mutex;

use crate::emulator::error::EmulationError;

/// Byte-addressable guest memory, little-endian per the target ABI.
///
/// Methods take `&self` because the guest address space is shared between
/// every OS thread dispatching guest code; implementations synchronize
/// internally. Allocation of stack and TLS backing memory is delegated here
/// as well; the thread core only keeps logical bookkeeping.
pub trait GuestMemory: Send + Sync {
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), EmulationError>;

    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), EmulationError>;

    /// Writes `len` copies of `byte` starting at `addr`.
    fn fill(&self, addr: u32, len: u32, byte: u8) -> Result<(), EmulationError>;

    /// Reserves `size` bytes of guest address space at the given alignment
    /// and returns the base address. Never returns the null address.
    fn alloc_aligned(&self, size: u32, align: u32) -> Result<u32, EmulationError>;

    fn read_u32(&self, addr: u32) -> Result<u32, EmulationError> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, addr: u32, value: u32) -> Result<(), EmulationError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }
}

/// Guest addresses below this value are never handed out, so a zero TLS base
/// or stack pointer faults instead of silently reading mapped memory.
const NULL_GUARD: u32 = 0x1000;

/// A flat, bounds-checked guest address space backed by one boxed slice,
/// with a bump allocator for stack and TLS reservations.
pub struct LinearMemory {
    inner: Mutex<LinearMemoryInner>,
}

struct LinearMemoryInner {
    data: Box<[u8]>,
    next_alloc: u32,
}

impl LinearMemory {
    /// Creates a zeroed address space of `size` bytes.
    pub fn new(size: u32) -> Self {
        Self {
            inner: Mutex::new(LinearMemoryInner {
                data: vec![0u8; size as usize].into_boxed_slice(),
                next_alloc: NULL_GUARD,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinearMemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LinearMemoryInner {
    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>, EmulationError> {
        let start = addr as usize;
        let end = start.checked_add(len);
        match end {
            Some(end) if addr >= NULL_GUARD && end <= self.data.len() => Ok(start..end),
            _ => Err(EmulationError::InvalidMemoryAccess { addr }),
        }
    }
}

impl GuestMemory for LinearMemory {
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), EmulationError> {
        let inner = self.lock();
        let range = inner.range(addr, buf.len())?;
        buf.copy_from_slice(&inner.data[range]);
        Ok(())
    }

    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), EmulationError> {
        let mut inner = self.lock();
        let range = inner.range(addr, data.len())?;
        inner.data[range].copy_from_slice(data);
        Ok(())
    }

    fn fill(&self, addr: u32, len: u32, byte: u8) -> Result<(), EmulationError> {
        let mut inner = self.lock();
        let range = inner.range(addr, len as usize)?;
        inner.data[range].fill(byte);
        Ok(())
    }

    fn alloc_aligned(&self, size: u32, align: u32) -> Result<u32, EmulationError> {
        let mut inner = self.lock();
        let base = match inner.next_alloc.checked_next_multiple_of(align.max(1)) {
            Some(base) => base,
            None => return Err(EmulationError::OutOfGuestMemory),
        };
        let end = base
            .checked_add(size)
            .ok_or(EmulationError::OutOfGuestMemory)?;
        if end as usize > inner.data.len() {
            return Err(EmulationError::OutOfGuestMemory);
        }
        inner.next_alloc = end;
        Ok(base)
    }
}
