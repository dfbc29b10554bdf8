//! Rendering seam.
//!
//! The renderer binds the GPU point buffer directly; it never reads points
//! back to the host.  Vertex and colour inputs are both fed from the same
//! buffer, so the cloud is coloured by position.

use depthlink_compute::PointBufferHandle;

pub trait RenderBackend: Send {
    /// Draw `vertices.point_count()` points.  Handles are only valid for the
    /// current tick.
    fn draw_points(&mut self, vertices: &PointBufferHandle, colors: &PointBufferHandle);
}

/// Renderer for headless runs: counts frames and draws nothing.
#[derive(Debug, Default)]
pub struct NullRenderer {
    frames: u64,
    last_point_count: usize,
}

impl NullRenderer {
    pub fn frames_drawn(&self) -> u64 {
        self.frames
    }

    pub fn last_point_count(&self) -> usize {
        self.last_point_count
    }
}

impl RenderBackend for NullRenderer {
    fn draw_points(&mut self, vertices: &PointBufferHandle, _colors: &PointBufferHandle) {
        self.frames += 1;
        self.last_point_count = vertices.point_count();
    }
}
