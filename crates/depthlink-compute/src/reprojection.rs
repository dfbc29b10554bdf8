//! Depth → point reprojection kernel for the [`CpuBackend`][crate::cpu::CpuBackend].
//!
//! Each kernel thread owns one packed 32-bit word of the raw buffer, i.e. two
//! consecutive `u16` depth samples, and writes the two matching `float3`
//! records of the point buffer.  Sample `i` maps to pixel
//! `(i % width, i / width)` and is lifted through a pinhole model.  Samples
//! with zero depth, or past the last sensor row, become the origin.

use std::sync::Arc;

use depthlink_types::DepthError;

use crate::cpu::{Bindings, Grid, KernelFn};

/// Kernel parameter holding the packed depth samples.
pub const RAW_SLOT: &str = "depthBufferInt";
/// Kernel parameter receiving the `float3` points.
pub const POINT_SLOT: &str = "outBuffer";
/// Depth samples carried by each kernel thread.
pub const ELEMENTS_PER_THREAD: usize = 2;

const SAMPLE_BYTES: usize = 2;
const POINT_BYTES: usize = 12;

/// Pinhole camera model used to lift depth samples into 3-D.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeIntrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    /// Metres per raw depth unit.
    pub depth_scale: f32,
}

impl Default for PinholeIntrinsics {
    /// Nominal Kinect v2 depth camera (512×424, millimetre samples).
    fn default() -> Self {
        Self {
            width: 512,
            height: 424,
            fx: 365.5,
            fy: 365.5,
            cx: 256.0,
            cy: 212.0,
            depth_scale: 0.001,
        }
    }
}

impl PinholeIntrinsics {
    /// Reproject pixel `(u, v)` with raw depth `raw` into camera space
    /// (x right, y up, z forward).
    pub fn project(&self, u: u32, v: u32, raw: u16) -> [f32; 3] {
        if raw == 0 || u >= self.width || v >= self.height {
            return [0.0; 3];
        }
        let z = f32::from(raw) * self.depth_scale;
        let x = (u as f32 - self.cx) * z / self.fx;
        let y = (self.cy - v as f32) * z / self.fy;
        [x, y, z]
    }
}

/// Build the reprojection kernel body for `intrinsics`.
pub fn reprojection_kernel(intrinsics: PinholeIntrinsics) -> KernelFn {
    Arc::new(move |bindings: &mut Bindings, grid: Grid| {
        if intrinsics.width == 0 {
            return Err(DepthError::InvalidConfig("intrinsics width is zero".to_string()));
        }
        let (raw, points) = bindings.split(RAW_SLOT, POINT_SLOT)?;
        let sample_count = raw.len() / SAMPLE_BYTES;
        let point_count = points.len() / POINT_BYTES;

        for thread in 0..grid.total_threads() as usize {
            for lane in 0..ELEMENTS_PER_THREAD {
                let i = thread * ELEMENTS_PER_THREAD + lane;
                if i >= sample_count || i >= point_count {
                    continue;
                }
                let offset = i * SAMPLE_BYTES;
                let sample = u16::from_ne_bytes([raw[offset], raw[offset + 1]]);
                let u = i as u32 % intrinsics.width;
                let v = i as u32 / intrinsics.width;
                let xyz = intrinsics.project(u, v, sample);
                points[i * POINT_BYTES..(i + 1) * POINT_BYTES]
                    .copy_from_slice(bytemuck::bytes_of(&xyz));
            }
        }
        Ok(())
    })
}
