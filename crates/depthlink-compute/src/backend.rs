//! The GPU compute collaborator.
//!
//! [`ComputeBackend`] is the narrow surface the dispatcher needs from a GPU
//! API: resolve a kernel by name, allocate and fill buffers, bind buffers to
//! named kernel slots, dispatch a work-group grid, and copy a buffer back to
//! host memory.  A Vulkan/wgpu backend implements it against real device
//! memory; [`CpuBackend`][crate::cpu::CpuBackend] executes kernels on the
//! host.

use depthlink_types::DepthError;

/// Opaque kernel entry point returned by [`ComputeBackend::find_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u32);

/// Opaque device buffer returned by [`ComputeBackend::allocate_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Memory layout hint for a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Byte-addressed buffer read as packed 32-bit words.
    Raw,
    /// Array of fixed-size structured elements.
    Structured,
}

pub trait ComputeBackend: Send {
    /// Resolve `name` to a kernel entry point.
    ///
    /// # Errors
    ///
    /// [`DepthError::KernelNotFound`] when the program has no such kernel.
    fn find_kernel(&self, name: &str) -> Result<KernelId, DepthError>;

    /// Reserve `element_count * element_size` bytes of device memory.
    ///
    /// # Errors
    ///
    /// [`DepthError::AllocationFailed`] when the memory cannot be reserved.
    fn allocate_buffer(
        &mut self,
        element_count: usize,
        element_size: usize,
        kind: BufferKind,
    ) -> Result<BufferId, DepthError>;

    /// Copy `bytes` into the start of `buffer`.
    fn write_buffer(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<(), DepthError>;

    /// Bind `buffer` to the kernel parameter named `slot`.
    fn set_buffer(&mut self, kernel: KernelId, slot: &str, buffer: BufferId) -> Result<(), DepthError>;

    /// Run `kernel` over a `groups[0] × groups[1] × groups[2]` grid.  Returns
    /// once the results are visible to subsequent reads.
    fn dispatch(&mut self, kernel: KernelId, groups: [u32; 3]) -> Result<(), DepthError>;

    /// Blocking copy of the whole buffer into host memory.
    fn read_buffer(&self, buffer: BufferId) -> Result<Vec<u8>, DepthError>;

    /// Free `buffer`.  Unknown handles are ignored.
    fn release(&mut self, buffer: BufferId);

    /// Number of buffers currently allocated.
    fn live_buffers(&self) -> usize;
}
