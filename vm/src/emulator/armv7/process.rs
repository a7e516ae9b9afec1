use serde::{Deserialize, Serialize};

/// Default sentinel recognized by the execution loop as "return from a
/// nested call". Lives outside any mappable guest region.
pub const DEFAULT_STOP_ADDR: u32 = 0xffff_0000;

const DEFAULT_STACK_SIZE: u32 = 0x10000;
const DEFAULT_PRIORITY: u32 = 160;

/// Static description of the loaded guest process consumed by the thread
/// core: the TLS template image, the reserved stop sentinel, and the
/// defaults applied to newly spawned threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessImage {
    /// Guest address of the TLS template image.
    pub tls_image_addr: u32,
    /// Initialized prefix of the template; the rest of a region stays zero.
    pub tls_file_size: u32,
    /// Full per-thread TLS region size. Zero means the process declares no
    /// TLS and the allocator is disabled.
    pub tls_region_size: u32,
    /// Program-counter value that halts a nested run of the execution loop.
    pub stop_addr: u32,
    /// Stack size applied to threads spawned without an explicit one.
    pub primary_stack_size: u32,
    /// Priority applied to threads spawned without an explicit one.
    pub primary_priority: u32,
}

impl Default for ProcessImage {
    fn default() -> Self {
        Self {
            tls_image_addr: 0,
            tls_file_size: 0,
            tls_region_size: 0,
            stop_addr: DEFAULT_STOP_ADDR,
            primary_stack_size: DEFAULT_STACK_SIZE,
            primary_priority: DEFAULT_PRIORITY,
        }
    }
}
