//! `depthlink-compute` – Depth-to-point-cloud compute pipeline.
//!
//! # Modules
//!
//! - [`backend`] – [`ComputeBackend`]: the GPU collaborator contract (kernel
//!   lookup, buffer allocation, binding, dispatch, readback).
//! - [`cpu`] – [`CpuBackend`]: deterministic host implementation used in CI
//!   and headless runs.
//! - [`reprojection`] – [`PinholeIntrinsics`] and the built-in kernel that
//!   lifts packed depth samples into `float3` points.
//! - [`dispatcher`] – [`ComputeDispatcher`]: owns the raw and point buffers,
//!   uploads frames, dispatches the kernel and hands out dispatch-scoped
//!   [`PointBufferHandle`]s.

pub mod backend;
pub mod cpu;
pub mod dispatcher;
pub mod reprojection;

pub use backend::{BufferId, BufferKind, ComputeBackend, KernelId};
pub use cpu::{Bindings, CpuBackend, Grid, KernelFn};
pub use dispatcher::{ComputeConfig, ComputeDispatcher, PointBufferHandle};
pub use reprojection::{PinholeIntrinsics, reprojection_kernel};
