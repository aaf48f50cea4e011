//! Per-device tracer controller.
//!
//! A [`TracerController`] binds one compute device. `setup` compiles the
//! trace kernel and uploads the packed scene; after that a dedicated worker
//! thread renders [`BlockRequest`]s one at a time until `close`.
//!
//! ## Kernel ABI
//! | index | argument            | type              |
//! |-------|---------------------|-------------------|
//! | 0     | output buffer       | RGBA f32 per pixel, full frame |
//! | 1     | frustum buffer      | 4 x vec4 corner rays |
//! | 2     | primitive image     | 1D RGBA f32, may be absent |
//! | 3     | material image      | 1D RGBA f32, may be absent |
//! | 4     | primitive count     | i32               |
//! | 5     | eye position        | vec4              |
//! | 6     | block row offset    | u32               |
//! | 7     | samples per pixel   | u32               |
//! | 8     | exposure            | f32               |
//! | 9     | seed                | u32               |

mod controller;
mod render_target;
mod request;
mod resources;

pub use controller::{TracerController, TracerState};
pub use render_target::RenderTarget;
pub use request::{BlockCompletion, BlockRequest, RenderParams};
pub use resources::DeviceResourceSet;

use crate::compute::ArgKind;
use crate::scene::SharedScene;
use crate::util::Result;

/// Parameter list of the trace kernel, in binding order.
pub const TRACE_KERNEL_ABI: [ArgKind; 10] = [
    ArgKind::Buffer { writable: true },
    ArgKind::Buffer { writable: false },
    ArgKind::Image,
    ArgKind::Image,
    ArgKind::I32,
    ArgKind::Vec4,
    ArgKind::U32,
    ArgKind::U32,
    ArgKind::F32,
    ArgKind::U32,
];

/// Contract every per-device tracer honors towards the orchestrator.
pub trait Tracer: Send + Sync {
    /// Identity used in logs and by the orchestrator.
    fn id(&self) -> &str;

    /// Relative throughput of the bound device.
    fn speed_estimate(&self) -> f32;

    /// Compile the kernel, upload `scene` and start the worker for a
    /// `width x height` frame.
    fn setup(&self, scene: SharedScene, width: u32, height: u32) -> Result<()>;

    /// Hand `request` to the worker without blocking.
    ///
    /// A worker that is not idle (busy, not set up yet, or closed) does not
    /// take the request; it comes back as `Err` and neither of its
    /// completion channels fires.
    fn enqueue(&self, request: BlockRequest) -> std::result::Result<(), BlockRequest>;

    /// Re-upload the camera frustum of the bound scene.
    fn sync_scene(&self) -> Result<()>;

    /// Stop the worker and release all device objects. Idempotent.
    fn close(&self);
}
