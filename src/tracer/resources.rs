//! Device objects owned by one tracer.
//!
//! Objects are created in a fixed order and released in exactly the reverse
//! order:
//! ```text
//! context -> queue -> program -> kernel -> output -> frustum -> materials -> primitives
//! ```
//! A failing setup step releases everything created before it, so a
//! [`DeviceResourceSet`] is either complete or does not exist.

use std::sync::Arc;

use super::TRACE_KERNEL_ABI;
use crate::compute::{ApiError, ComputeApi, ContextId, KernelId, MemAccess, MemId, ProgramId, QueueId};
use crate::config::TracerConfig;
use crate::device::Device;
use crate::scene::{pack_scene, Camera, Scene, FRUSTUM_BYTES};
use crate::util::{Result, TracerError, TEXEL_BYTES};

/// Handles created so far; `None` slots were never created or are already released.
#[derive(Default)]
struct Handles {
    context: Option<ContextId>,
    queue: Option<QueueId>,
    program: Option<ProgramId>,
    kernel: Option<KernelId>,
    output: Option<MemId>,
    frustum: Option<MemId>,
    materials: Option<MemId>,
    primitives: Option<MemId>,
}

impl Handles {
    /// Release every present handle in reverse creation order.
    ///
    /// Each release is attempted regardless of earlier failures. Returns the
    /// number of failed releases.
    fn release(&mut self, api: &dyn ComputeApi) -> usize {
        let results: [(&str, Option<std::result::Result<(), ApiError>>); 8] = [
            ("primitive image", self.primitives.take().map(|m| api.release_mem(m))),
            ("material image", self.materials.take().map(|m| api.release_mem(m))),
            ("frustum buffer", self.frustum.take().map(|m| api.release_mem(m))),
            ("output buffer", self.output.take().map(|m| api.release_mem(m))),
            ("kernel", self.kernel.take().map(|k| api.release_kernel(k))),
            ("program", self.program.take().map(|p| api.release_program(p))),
            ("queue", self.queue.take().map(|q| api.release_queue(q))),
            ("context", self.context.take().map(|c| api.release_context(c))),
        ];

        let mut failures = 0;
        for (what, result) in results {
            if let Some(Err(err)) = result {
                tracing::warn!(object = what, error = %err, "failed to release device object");
                failures += 1;
            }
        }
        failures
    }
}

/// Handles every block dispatch needs.
struct Core {
    queue: QueueId,
    kernel: KernelId,
    output: MemId,
    frustum: MemId,
    primitive_count: i32,
}

/// Complete set of device objects for one attached tracer.
pub struct DeviceResourceSet {
    api: Arc<dyn ComputeApi>,
    pub(crate) queue: QueueId,
    pub(crate) kernel: KernelId,
    pub(crate) output: MemId,
    pub(crate) frustum: MemId,
    /// Absent when the scene has no primitives
    pub(crate) primitives: Option<MemId>,
    /// Absent when the scene has no materials
    pub(crate) materials: Option<MemId>,
    pub(crate) primitive_count: i32,
    pub(crate) width: u32,
    pub(crate) height: u32,
    handles: Handles,
}

impl DeviceResourceSet {
    /// Compile the kernel, allocate buffers, upload the packed scene and the
    /// initial frustum.
    pub fn create(
        api: Arc<dyn ComputeApi>,
        device: &Device,
        config: &TracerConfig,
        scene: &Scene,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let mut handles = Handles::default();
        match Self::build(&*api, &mut handles, device, config, scene, width, height) {
            Ok(core) => Ok(Self {
                api,
                queue: core.queue,
                kernel: core.kernel,
                output: core.output,
                frustum: core.frustum,
                primitives: handles.primitives,
                materials: handles.materials,
                primitive_count: core.primitive_count,
                width,
                height,
                handles,
            }),
            Err(err) => {
                handles.release(&*api);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        api: &dyn ComputeApi,
        handles: &mut Handles,
        device: &Device,
        config: &TracerConfig,
        scene: &Scene,
        width: u32,
        height: u32,
    ) -> Result<Core> {
        let context = api.create_context(device).map_err(TracerError::ContextCreationFailed)?;
        handles.context = Some(context);
        let queue = api.create_queue(context, device).map_err(TracerError::CmdQueueCreationFailed)?;
        handles.queue = Some(queue);

        let source = std::fs::read_to_string(&config.kernel_source).map_err(|source| {
            TracerError::KernelSourceUnavailable {
                path: config.kernel_source.clone(),
                source,
            }
        })?;

        let program = api.create_program(context, &source).map_err(TracerError::ProgramCreationFailed)?;
        handles.program = Some(program);
        if let Err(err) = api.build_program(program, device) {
            let log = match api.build_log(program) {
                Ok(log) if !log.trim().is_empty() => log,
                _ => err.to_string(),
            };
            tracing::error!(path = %config.kernel_source.display(), "kernel build failed:\n{}", log);
            return Err(TracerError::ProgramBuildFailed { log });
        }

        let kernel = api
            .create_kernel(program, &config.entry_point, &TRACE_KERNEL_ABI)
            .map_err(TracerError::KernelCreationFailed)?;
        handles.kernel = Some(kernel);

        let output_bytes = TEXEL_BYTES as u64 * width as u64 * height as u64;
        let output = api
            .create_buffer(context, MemAccess::WriteOnly, output_bytes)
            .map_err(TracerError::AllocatingBuffers)?;
        handles.output = Some(output);
        let frustum = api
            .create_buffer(context, MemAccess::ReadOnly, FRUSTUM_BYTES)
            .map_err(TracerError::AllocatingBuffers)?;
        handles.frustum = Some(frustum);

        let packed = pack_scene(scene);
        if !packed.materials.is_empty() {
            let image = api
                .create_image_1d(context, packed.material_texels())
                .map_err(TracerError::AllocatingBuffers)?;
            handles.materials = Some(image);
        }
        if !packed.primitives.is_empty() {
            let image = api
                .create_image_1d(context, packed.primitive_texels())
                .map_err(TracerError::AllocatingBuffers)?;
            handles.primitives = Some(image);
        }

        upload_frustum(api, queue, frustum, &scene.camera)?;

        tracing::debug!(
            primitives = packed.primitives.len(),
            materials = packed.materials.len(),
            output_bytes,
            "device resources created"
        );
        Ok(Core {
            queue,
            kernel,
            output,
            frustum,
            primitive_count: packed.primitive_count(),
        })
    }

    pub(crate) fn api(&self) -> &dyn ComputeApi {
        &*self.api
    }

    /// Re-upload the camera frustum.
    pub fn sync_frustum(&self, camera: &Camera) -> Result<()> {
        upload_frustum(&*self.api, self.queue, self.frustum, camera)
    }

    /// Release every object in reverse creation order. Returns the number of
    /// releases that failed.
    pub fn release(mut self) -> usize {
        self.handles.release(&*self.api)
    }
}

fn upload_frustum(api: &dyn ComputeApi, queue: QueueId, frustum: MemId, camera: &Camera) -> Result<()> {
    api.write_buffer(queue, frustum, 0, camera.frustum_bytes())
        .map_err(TracerError::CopyingDataToDevice)
}
