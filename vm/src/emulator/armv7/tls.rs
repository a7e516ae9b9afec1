use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tracing::{debug, trace};

use crate::emulator::{error::EmulationError, memory::GuestMemory};

use super::process::ProcessImage;

/// Number of TLS regions in the shared pool.
pub const TLS_MAX: usize = 128;

/// Errors raised by the TLS slot pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsError {
    /// Every slot in the pool is owned by a live thread.
    #[error("thread-local storage pool exhausted")]
    ResourceExhausted,
}

/// Lock-free pool of per-thread TLS regions.
///
/// Slot `i` covers guest addresses `base + i * region_size ..`. Ownership is
/// tracked in a table of atomic thread ids (0 = free) claimed and returned
/// with per-slot compare-and-swap, so any OS thread may acquire or release
/// concurrently without blocking. Scans are O([`TLS_MAX`]); thread churn is
/// rare next to execution.
pub struct TlsAllocator {
    base: u32,
    region_size: u32,
    image_addr: u32,
    image_size: u32,
    owners: [AtomicU32; TLS_MAX],
}

impl TlsAllocator {
    /// Reserves the backing pool for [`TLS_MAX`] regions, page-aligned, from
    /// guest address space. A process that declares no TLS
    /// (`tls_region_size == 0`) gets a disabled allocator whose operations
    /// all return the null address.
    pub fn new(process: &ProcessImage, mem: &dyn GuestMemory) -> Result<Self, EmulationError> {
        let base = if process.tls_region_size == 0 {
            0
        } else {
            mem.alloc_aligned(process.tls_region_size * TLS_MAX as u32, 4096)?
        };
        debug!(
            base,
            region_size = process.tls_region_size,
            "reserved TLS pool"
        );
        Ok(Self {
            base,
            region_size: process.tls_region_size,
            image_addr: process.tls_image_addr,
            // The initialized prefix never exceeds the region.
            image_size: process.tls_file_size.min(process.tls_region_size),
            owners: std::array::from_fn(|_| AtomicU32::new(0)),
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.region_size == 0
    }

    fn slot_addr(&self, index: usize) -> u32 {
        self.base + index as u32 * self.region_size
    }

    /// Claims a region for `thread_id` and initializes it from the process
    /// TLS image: the region is zero-filled, then the template's
    /// initialized prefix is copied in. Re-acquiring without an intervening
    /// release returns the address already owned, untouched.
    pub fn acquire(&self, thread_id: u32, mem: &dyn GuestMemory) -> Result<u32, EmulationError> {
        debug_assert_ne!(thread_id, 0);
        if self.is_disabled() {
            return Ok(0);
        }

        for (i, owner) in self.owners.iter().enumerate() {
            if owner.load(Ordering::Acquire) == thread_id {
                return Ok(self.slot_addr(i));
            }
        }

        for (i, owner) in self.owners.iter().enumerate() {
            if owner
                .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let addr = self.slot_addr(i);
                mem.fill(addr, self.region_size, 0)?;
                if self.image_size != 0 {
                    let mut image = vec![0u8; self.image_size as usize];
                    mem.read_bytes(self.image_addr, &mut image)?;
                    mem.write_bytes(addr, &image)?;
                }
                trace!(thread_id, slot = i, addr, "claimed TLS region");
                return Ok(addr);
            }
        }

        Err(TlsError::ResourceExhausted.into())
    }

    /// Returns `thread_id`'s region to the pool. Releasing an identity that
    /// owns nothing is a no-op.
    pub fn release(&self, thread_id: u32) {
        if self.is_disabled() {
            return;
        }
        for (i, owner) in self.owners.iter().enumerate() {
            if owner
                .compare_exchange(thread_id, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                trace!(thread_id, slot = i, "released TLS region");
                return;
            }
        }
    }
}
