//! [`CpuBackend`] – host-memory reference implementation of
//! [`ComputeBackend`].
//!
//! Kernels are plain Rust closures registered under a name.  A dispatch
//! temporarily moves every buffer bound to the kernel into a [`Bindings`]
//! table, runs the closure over the whole grid, and moves the buffers back.
//! Execution is single-threaded and deterministic, which makes the backend
//! suitable for CI and for validating kernels against a GPU port.

use std::collections::HashMap;
use std::sync::Arc;

use depthlink_types::DepthError;
use tracing::debug;

use crate::backend::{BufferId, BufferKind, ComputeBackend, KernelId};
use crate::reprojection::{reprojection_kernel, PinholeIntrinsics};

/// Default ceiling on host memory handed out by a [`CpuBackend`].
pub const DEFAULT_MEMORY_LIMIT: usize = 256 * 1024 * 1024;

/// Work-group grid of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub groups: [u32; 3],
    pub threads_per_group: u32,
}

impl Grid {
    /// Total number of kernel threads in the grid.
    pub fn total_threads(&self) -> u64 {
        self.groups.iter().map(|&g| u64::from(g)).product::<u64>() * u64::from(self.threads_per_group)
    }
}

/// A host kernel body.  It receives the bound buffers and the grid and is
/// expected to emulate every thread of the grid.
pub type KernelFn = Arc<dyn Fn(&mut Bindings, Grid) -> Result<(), DepthError> + Send + Sync>;

struct RegisteredKernel {
    name: String,
    threads_per_group: u32,
    body: KernelFn,
}

/// Buffers bound to a kernel for the duration of one dispatch.
#[derive(Default)]
pub struct Bindings {
    slots: Vec<(String, Vec<u8>)>,
}

impl Bindings {
    fn index(&self, slot: &str) -> Result<usize, DepthError> {
        self.slots
            .iter()
            .position(|(name, _)| name == slot)
            .ok_or_else(|| DepthError::InvalidConfig(format!("kernel slot '{slot}' is not bound")))
    }

    /// Read-only view of the buffer bound to `slot`.
    pub fn get(&self, slot: &str) -> Result<&[u8], DepthError> {
        let i = self.index(slot)?;
        Ok(self.slots[i].1.as_slice())
    }

    /// Mutable view of the buffer bound to `slot`.
    pub fn get_mut(&mut self, slot: &str) -> Result<&mut [u8], DepthError> {
        let i = self.index(slot)?;
        Ok(self.slots[i].1.as_mut_slice())
    }

    /// Borrow an input slot and a distinct output slot at the same time.
    pub fn split(&mut self, input: &str, output: &str) -> Result<(&[u8], &mut [u8]), DepthError> {
        let i = self.index(input)?;
        let o = self.index(output)?;
        if i == o {
            return Err(DepthError::InvalidConfig(format!(
                "slots '{input}' and '{output}' alias the same buffer"
            )));
        }
        if i < o {
            let (head, tail) = self.slots.split_at_mut(o);
            Ok((head[i].1.as_slice(), tail[0].1.as_mut_slice()))
        } else {
            let (head, tail) = self.slots.split_at_mut(i);
            Ok((tail[0].1.as_slice(), head[o].1.as_mut_slice()))
        }
    }
}

struct CpuBuffer {
    bytes: Vec<u8>,
    kind: BufferKind,
}

/// Host-side compute backend.
pub struct CpuBackend {
    kernels: Vec<RegisteredKernel>,
    buffers: HashMap<BufferId, CpuBuffer>,
    bindings: HashMap<(KernelId, String), BufferId>,
    next_buffer: u64,
    allocated: usize,
    memory_limit: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

impl CpuBackend {
    /// Create a backend that refuses allocations beyond `memory_limit` bytes.
    pub fn new(memory_limit: usize) -> Self {
        Self {
            kernels: Vec::new(),
            buffers: HashMap::new(),
            bindings: HashMap::new(),
            next_buffer: 1,
            allocated: 0,
            memory_limit,
        }
    }

    /// Register (or replace) a kernel under `name`.
    pub fn register_kernel(&mut self, name: impl Into<String>, threads_per_group: u32, body: KernelFn) -> KernelId {
        let name = name.into();
        if let Some(pos) = self.kernels.iter().position(|k| k.name == name) {
            self.kernels[pos] = RegisteredKernel {
                name,
                threads_per_group,
                body,
            };
            return KernelId(pos as u32);
        }
        self.kernels.push(RegisteredKernel {
            name,
            threads_per_group,
            body,
        });
        KernelId(self.kernels.len() as u32 - 1)
    }

    /// Builder: register the depth reprojection kernel under `name`.
    pub fn with_reprojection_kernel(
        mut self,
        name: impl Into<String>,
        threads_per_group: u32,
        intrinsics: PinholeIntrinsics,
    ) -> Self {
        self.register_kernel(name, threads_per_group, reprojection_kernel(intrinsics));
        self
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    fn buffer_mut(&mut self, buffer: BufferId) -> Result<&mut CpuBuffer, DepthError> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| DepthError::InvalidConfig(format!("unknown buffer {}", buffer.0)))
    }
}

impl ComputeBackend for CpuBackend {
    fn find_kernel(&self, name: &str) -> Result<KernelId, DepthError> {
        self.kernels
            .iter()
            .position(|k| k.name == name)
            .map(|pos| KernelId(pos as u32))
            .ok_or_else(|| DepthError::KernelNotFound(name.to_string()))
    }

    fn allocate_buffer(
        &mut self,
        element_count: usize,
        element_size: usize,
        kind: BufferKind,
    ) -> Result<BufferId, DepthError> {
        let size = element_count
            .checked_mul(element_size)
            .filter(|&s| s > 0)
            .ok_or_else(|| {
                DepthError::AllocationFailed(format!(
                    "invalid buffer size {element_count} x {element_size}"
                ))
            })?;
        if self.allocated + size > self.memory_limit {
            return Err(DepthError::AllocationFailed(format!(
                "{size} bytes requested, {} of {} in use",
                self.allocated, self.memory_limit
            )));
        }
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.allocated += size;
        self.buffers.insert(
            id,
            CpuBuffer {
                bytes: vec![0; size],
                kind,
            },
        );
        debug!(buffer = id.0, bytes = size, kind = ?kind, "cpu buffer allocated");
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<(), DepthError> {
        let target = self.buffer_mut(buffer)?;
        if bytes.len() > target.bytes.len() {
            return Err(DepthError::BufferOverflow {
                required: bytes.len(),
                capacity: target.bytes.len(),
            });
        }
        target.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn set_buffer(&mut self, kernel: KernelId, slot: &str, buffer: BufferId) -> Result<(), DepthError> {
        if kernel.0 as usize >= self.kernels.len() {
            return Err(DepthError::KernelNotFound(format!("#{}", kernel.0)));
        }
        self.buffer_mut(buffer)?;
        self.bindings.insert((kernel, slot.to_string()), buffer);
        Ok(())
    }

    fn dispatch(&mut self, kernel: KernelId, groups: [u32; 3]) -> Result<(), DepthError> {
        let registered = self
            .kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| DepthError::KernelNotFound(format!("#{}", kernel.0)))?;
        let body = Arc::clone(&registered.body);
        let grid = Grid {
            groups,
            threads_per_group: registered.threads_per_group,
        };

        let bound: Vec<(String, BufferId)> = self
            .bindings
            .iter()
            .filter(|((k, _), _)| *k == kernel)
            .map(|((_, slot), id)| (slot.clone(), *id))
            .collect();

        let mut table = Bindings::default();
        for (slot, id) in &bound {
            let buffer = self.buffer_mut(*id)?;
            table.slots.push((slot.clone(), std::mem::take(&mut buffer.bytes)));
        }

        let result = body(&mut table, grid);

        // Hand the storage back even when the kernel failed.
        for ((slot, id), (_, bytes)) in bound.iter().zip(table.slots) {
            if let Some(buffer) = self.buffers.get_mut(id) {
                buffer.bytes = bytes;
            } else {
                debug!(slot = %slot, "buffer released during dispatch");
            }
        }
        result
    }

    fn read_buffer(&self, buffer: BufferId) -> Result<Vec<u8>, DepthError> {
        self.buffers
            .get(&buffer)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| DepthError::InvalidConfig(format!("unknown buffer {}", buffer.0)))
    }

    fn release(&mut self, buffer: BufferId) {
        if let Some(released) = self.buffers.remove(&buffer) {
            self.allocated -= released.bytes.len();
            self.bindings.retain(|_, id| *id != buffer);
            debug!(buffer = buffer.0, kind = ?released.kind, "cpu buffer released");
        }
    }

    fn live_buffers(&self) -> usize {
        self.buffers.len()
    }
}
