//! [`ComputeDispatcher`] – depth frame upload and kernel dispatch.
//!
//! The dispatcher owns two device buffers:
//!
//! | Buffer | Layout | Capacity |
//! |---|---|---|
//! | raw input | packed 32-bit words, two `u16` samples each | `max_buffer_size / 2` words |
//! | point output | `float3` records | `max_buffer_size` points |
//!
//! Every tick the capture loop calls [`upload`][ComputeDispatcher::upload]
//! then [`dispatch`][ComputeDispatcher::dispatch] from the same thread.  A
//! dispatch returns a [`PointBufferHandle`] that stays valid only until the
//! next dispatch; [`readback`][ComputeDispatcher::readback] refuses stale
//! handles instead of returning points from a different frame.

use depthlink_types::{DepthError, DepthFrame, Point3};
use tracing::{debug, info, instrument};

use crate::backend::{BufferId, BufferKind, ComputeBackend, KernelId};
use crate::reprojection::{ELEMENTS_PER_THREAD, POINT_SLOT, RAW_SLOT};

/// Bytes per depth sample.
pub const SAMPLE_SIZE: usize = std::mem::size_of::<u16>();
/// Bytes per packed raw word.
pub const WORD_SIZE: usize = std::mem::size_of::<u32>();
/// Bytes per output point.
pub const POINT_SIZE: usize = 3 * std::mem::size_of::<f32>();

/// Buffer sizing and kernel selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeConfig {
    /// Maximum depth samples per frame; also the point buffer capacity.
    pub max_buffer_size: usize,
    /// Threads per work-group declared by the kernel.
    pub num_threads: u32,
    /// Entry point name in the compute program.
    pub kernel_name: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 512 * 512,
            num_threads: 64,
            kernel_name: "CSMain".to_string(),
        }
    }
}

impl ComputeConfig {
    /// Work-groups along X: `ceil(max_buffer_size / num_threads / 2)`.
    pub fn groups_x(&self) -> u32 {
        let per_group = self.num_threads as usize * ELEMENTS_PER_THREAD;
        self.max_buffer_size.div_ceil(per_group.max(1)) as u32
    }

    /// Capacity of the raw input buffer in bytes.
    pub fn raw_capacity_bytes(&self) -> usize {
        (self.max_buffer_size / 2) * WORD_SIZE
    }

    fn validate(&self) -> Result<(), DepthError> {
        if self.max_buffer_size == 0 || self.max_buffer_size % 2 != 0 {
            return Err(DepthError::InvalidConfig(format!(
                "max_buffer_size must be a positive even number, got {}",
                self.max_buffer_size
            )));
        }
        if self.num_threads == 0 {
            return Err(DepthError::InvalidConfig("num_threads must be positive".to_string()));
        }
        Ok(())
    }
}

/// Read-only reference to the point buffer produced by one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointBufferHandle {
    buffer: BufferId,
    generation: u64,
    point_count: usize,
}

impl PointBufferHandle {
    /// Device buffer for render paths that bind it directly.
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Dispatch counter this handle belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }
}

struct Resources {
    config: ComputeConfig,
    kernel: KernelId,
    raw: BufferId,
    points: BufferId,
}

pub struct ComputeDispatcher {
    backend: Box<dyn ComputeBackend>,
    resources: Option<Resources>,
    generation: u64,
    staging: Vec<u16>,
}

impl ComputeDispatcher {
    pub fn new(backend: Box<dyn ComputeBackend>) -> Self {
        Self {
            backend,
            resources: None,
            generation: 0,
            staging: Vec::new(),
        }
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.resources.is_some()
    }

    /// Active configuration, if initialised.
    pub fn config(&self) -> Option<&ComputeConfig> {
        self.resources.as_ref().map(|r| &r.config)
    }

    /// Resolve the kernel and allocate both buffers.  Re-initialising releases
    /// the previous buffers first.
    ///
    /// # Errors
    ///
    /// * [`DepthError::InvalidConfig`] for a zero/odd buffer size or zero threads.
    /// * [`DepthError::KernelNotFound`] when the program lacks the kernel.
    /// * [`DepthError::AllocationFailed`] when device memory is exhausted; no
    ///   buffer is left allocated in that case.
    #[instrument(skip(self), fields(kernel = %config.kernel_name))]
    pub fn initialize(&mut self, config: ComputeConfig) -> Result<(), DepthError> {
        config.validate()?;
        self.teardown();

        let kernel = self.backend.find_kernel(&config.kernel_name)?;
        let raw = self
            .backend
            .allocate_buffer(config.max_buffer_size / 2, WORD_SIZE, BufferKind::Raw)?;
        let points = match self
            .backend
            .allocate_buffer(config.max_buffer_size, POINT_SIZE, BufferKind::Structured)
        {
            Ok(points) => points,
            Err(e) => {
                self.backend.release(raw);
                return Err(e);
            }
        };

        let bound = self
            .backend
            .set_buffer(kernel, RAW_SLOT, raw)
            .and_then(|_| self.backend.set_buffer(kernel, POINT_SLOT, points));
        if let Err(e) = bound {
            self.backend.release(raw);
            self.backend.release(points);
            return Err(e);
        }

        info!(
            max_buffer_size = config.max_buffer_size,
            num_threads = config.num_threads,
            groups_x = config.groups_x(),
            "compute buffers allocated"
        );
        self.staging = vec![0; config.max_buffer_size];
        self.resources = Some(Resources {
            config,
            kernel,
            raw,
            points,
        });
        Ok(())
    }

    /// Check that frames of `pixel_count` samples fit the raw buffer.
    pub fn ensure_capacity(&self, pixel_count: usize) -> Result<(), DepthError> {
        let res = self.resources.as_ref().ok_or(DepthError::NotInitialized)?;
        let required = pixel_count * SAMPLE_SIZE;
        let capacity = res.config.raw_capacity_bytes();
        if required > capacity {
            return Err(DepthError::BufferOverflow { required, capacity });
        }
        Ok(())
    }

    /// Copy `frame` into the raw buffer.  Samples past the end of the frame
    /// are zeroed so no data from an earlier frame survives.
    ///
    /// # Errors
    ///
    /// [`DepthError::BufferOverflow`] when the frame does not fit; nothing is
    /// written in that case.
    pub fn upload(&mut self, frame: &DepthFrame) -> Result<(), DepthError> {
        let res = self.resources.as_ref().ok_or(DepthError::NotInitialized)?;
        let required = frame.len() * SAMPLE_SIZE;
        let capacity = res.config.raw_capacity_bytes();
        if required > capacity {
            return Err(DepthError::BufferOverflow { required, capacity });
        }

        self.staging[..frame.len()].copy_from_slice(frame.samples());
        self.staging[frame.len()..].fill(0);
        self.backend
            .write_buffer(res.raw, bytemuck::cast_slice::<u16, u8>(&self.staging))?;
        debug!(sequence = frame.sequence(), samples = frame.len(), "depth frame uploaded");
        Ok(())
    }

    /// Run the kernel over the raw buffer.  Any handle from a previous
    /// dispatch becomes stale.
    pub fn dispatch(&mut self) -> Result<PointBufferHandle, DepthError> {
        let res = self.resources.as_ref().ok_or(DepthError::NotInitialized)?;
        let groups_x = res.config.groups_x();
        self.backend.dispatch(res.kernel, [groups_x, 1, 1])?;
        self.generation += 1;
        Ok(PointBufferHandle {
            buffer: res.points,
            generation: self.generation,
            point_count: res.config.max_buffer_size,
        })
    }

    /// Blocking copy of the point buffer into host memory.
    ///
    /// # Errors
    ///
    /// * [`DepthError::NotInitialized`] after `teardown`.
    /// * [`DepthError::StaleHandle`] when a newer dispatch has run.
    pub fn readback(&self, handle: &PointBufferHandle) -> Result<Vec<Point3>, DepthError> {
        let res = self.resources.as_ref().ok_or(DepthError::NotInitialized)?;
        if handle.generation != self.generation || handle.buffer != res.points {
            return Err(DepthError::StaleHandle {
                handle: handle.generation,
                current: self.generation,
            });
        }
        let bytes = self.backend.read_buffer(res.points)?;
        Ok(bytes
            .chunks_exact(POINT_SIZE)
            .take(handle.point_count)
            .map(|chunk| {
                let [x, y, z] = bytemuck::pod_read_unaligned::<[f32; 3]>(chunk);
                Point3::new(x, y, z)
            })
            .collect())
    }

    /// Release both buffers.  Idempotent, and safe after a failed
    /// `initialize`.
    pub fn teardown(&mut self) {
        if let Some(res) = self.resources.take() {
            self.backend.release(res.raw);
            self.backend.release(res.points);
            self.staging = Vec::new();
            info!("compute buffers released");
        }
    }
}

impl Drop for ComputeDispatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::reprojection::PinholeIntrinsics;

    fn kinect_dispatcher(config: &ComputeConfig) -> ComputeDispatcher {
        let backend = CpuBackend::default().with_reprojection_kernel(
            config.kernel_name.clone(),
            config.num_threads,
            PinholeIntrinsics::default(),
        );
        ComputeDispatcher::new(Box::new(backend))
    }

    fn small_config() -> ComputeConfig {
        ComputeConfig {
            max_buffer_size: 16,
            num_threads: 4,
            kernel_name: "CSMain".to_string(),
        }
    }

    fn frame(width: u32, height: u32, fill: u16) -> DepthFrame {
        DepthFrame::new(width, height, 0, vec![fill; (width * height) as usize]).unwrap()
    }

    #[test]
    fn groups_x_matches_kinect_sizing() {
        let config = ComputeConfig::default();
        assert_eq!(config.groups_x(), 2048);
        assert_eq!(config.raw_capacity_bytes(), 524_288);
    }

    #[test]
    fn groups_x_rounds_up() {
        let config = ComputeConfig {
            max_buffer_size: 130,
            num_threads: 64,
            kernel_name: "k".into(),
        };
        assert_eq!(config.groups_x(), 2);
    }

    #[test]
    fn missing_kernel_fails_initialize_without_leaking() {
        let mut dispatcher = ComputeDispatcher::new(Box::new(CpuBackend::default()));
        assert_eq!(
            dispatcher.initialize(small_config()).unwrap_err(),
            DepthError::KernelNotFound("CSMain".to_string())
        );
        assert_eq!(dispatcher.backend().live_buffers(), 0);
        dispatcher.teardown();
    }

    #[test]
    fn allocation_failure_releases_partial_buffers() {
        let config = small_config();
        // Room for the raw buffer (32 bytes) but not the point buffer.
        let backend = CpuBackend::new(64).with_reprojection_kernel(
            "CSMain",
            4,
            PinholeIntrinsics::default(),
        );
        let mut dispatcher = ComputeDispatcher::new(Box::new(backend));
        assert!(matches!(
            dispatcher.initialize(config),
            Err(DepthError::AllocationFailed(_))
        ));
        assert_eq!(dispatcher.backend().live_buffers(), 0);
        assert!(!dispatcher.is_initialized());
    }

    #[test]
    fn odd_buffer_size_is_rejected() {
        let mut dispatcher = kinect_dispatcher(&small_config());
        let config = ComputeConfig {
            max_buffer_size: 15,
            ..small_config()
        };
        assert!(matches!(
            dispatcher.initialize(config),
            Err(DepthError::InvalidConfig(_))
        ));
    }

    #[test]
    fn oversized_frame_overflows_and_writes_nothing() {
        let config = small_config();
        let mut dispatcher = kinect_dispatcher(&config);
        dispatcher.initialize(config).unwrap();

        dispatcher.upload(&frame(4, 2, 1000)).unwrap();
        let before = dispatcher.dispatch().unwrap();
        let expected = dispatcher.readback(&before).unwrap();

        let err = dispatcher.upload(&frame(5, 4, 3000)).unwrap_err();
        assert_eq!(
            err,
            DepthError::BufferOverflow {
                required: 40,
                capacity: 32
            }
        );

        let after = dispatcher.dispatch().unwrap();
        assert_eq!(dispatcher.readback(&after).unwrap(), expected);
    }

    #[test]
    fn upload_before_initialize_fails() {
        let mut dispatcher = kinect_dispatcher(&small_config());
        assert_eq!(
            dispatcher.upload(&frame(1, 1, 1)).unwrap_err(),
            DepthError::NotInitialized
        );
        assert_eq!(dispatcher.dispatch().unwrap_err(), DepthError::NotInitialized);
    }

    #[test]
    fn repeated_dispatch_is_deterministic() {
        let config = small_config();
        let mut dispatcher = kinect_dispatcher(&config);
        dispatcher.initialize(config).unwrap();
        dispatcher.upload(&frame(4, 4, 1500)).unwrap();

        let first = dispatcher.dispatch().unwrap();
        let a = dispatcher.readback(&first).unwrap();
        let second = dispatcher.dispatch().unwrap();
        let b = dispatcher.readback(&second).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn handle_goes_stale_after_next_dispatch() {
        let config = small_config();
        let mut dispatcher = kinect_dispatcher(&config);
        dispatcher.initialize(config).unwrap();
        let old = dispatcher.dispatch().unwrap();
        let new = dispatcher.dispatch().unwrap();
        assert!(matches!(
            dispatcher.readback(&old),
            Err(DepthError::StaleHandle { handle: 1, current: 2 })
        ));
        assert!(dispatcher.readback(&new).is_ok());
    }

    #[test]
    fn shorter_frame_zeroes_the_tail() {
        let config = small_config();
        let mut dispatcher = kinect_dispatcher(&config);
        dispatcher.initialize(config).unwrap();
        dispatcher.upload(&frame(4, 4, 2000)).unwrap();
        dispatcher.dispatch().unwrap();

        dispatcher.upload(&frame(2, 2, 2000)).unwrap();
        let handle = dispatcher.dispatch().unwrap();
        let points = dispatcher.readback(&handle).unwrap();
        assert!(points[..4].iter().all(|p| p.z > 0.0));
        assert!(points[4..].iter().all(|p| *p == Point3::default()));
    }

    #[test]
    fn teardown_is_idempotent_and_releases_everything() {
        let config = small_config();
        let mut dispatcher = kinect_dispatcher(&config);
        dispatcher.initialize(config).unwrap();
        assert_eq!(dispatcher.backend().live_buffers(), 2);
        let handle = dispatcher.dispatch().unwrap();

        dispatcher.teardown();
        dispatcher.teardown();
        assert_eq!(dispatcher.backend().live_buffers(), 0);
        assert_eq!(dispatcher.readback(&handle).unwrap_err(), DepthError::NotInitialized);
    }

    #[test]
    fn ensure_capacity_guards_sensor_resolution() {
        let config = small_config();
        let mut dispatcher = kinect_dispatcher(&config);
        dispatcher.initialize(config).unwrap();
        assert!(dispatcher.ensure_capacity(16).is_ok());
        assert!(matches!(
            dispatcher.ensure_capacity(17),
            Err(DepthError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn kinect_frame_end_to_end() {
        let config = ComputeConfig::default();
        let mut dispatcher = kinect_dispatcher(&config);
        dispatcher.initialize(config).unwrap();

        let frame = frame(512, 424, 1200);
        assert_eq!(frame.len(), 217_088);
        dispatcher.ensure_capacity(frame.len()).unwrap();
        dispatcher.upload(&frame).unwrap();
        let handle = dispatcher.dispatch().unwrap();
        let points = dispatcher.readback(&handle).unwrap();

        assert_eq!(points.len(), 262_144);
        assert!(points[..217_088].iter().all(|p| (p.z - 1.2).abs() < 1e-6));
        assert!(points[217_088..].iter().all(|p| *p == Point3::default()));
    }
}
