//! # pathtrace-device
//!
//! Host-side controller for a GPU path tracer. One [`TracerController`] is
//! bound to one compute device: it compiles the trace kernel, uploads a
//! packed scene and renders horizontal blocks of the frame on request.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math re-exports, texel helpers
//! - [`device`] - Compute device descriptors
//! - [`scene`] - Host scene types and the packed scene encoder
//! - [`compute`] - Explicit-handle compute API (wgpu and mock backends)
//! - [`tracer`] - Tracer controller, block requests, render targets
//! - [`config`] - JSON / environment configuration
//!
//! ## Example
//!
//! ```ignore
//! use std::{sync::Arc, time::Duration};
//! use pathtrace_device::prelude::*;
//!
//! let api = Arc::new(WgpuApi::new());
//! let device = api.devices().remove(0);
//! let tracer = TracerController::new("gpu0", device, api, TracerConfig::from_env());
//! tracer.setup(scene.clone(), 640, 480)?;
//!
//! let target = Arc::new(RenderTarget::new(640, 480));
//! let (request, completion) = BlockRequest::new(target.clone(), 0, 32, RenderParams::default());
//! if tracer.enqueue(request).is_ok() {
//!     completion.wait(Duration::from_secs(5));
//! }
//! tracer.close();
//! ```

pub mod util;
pub mod device;
pub mod scene;
pub mod compute;
pub mod tracer;
pub mod config;
mod logging;

pub use logging::{init_logging, BUILD_DATE, VERSION};

// Re-export commonly used types
pub use util::{Result, TracerError};
pub use tracer::{BlockRequest, RenderTarget, Tracer, TracerController};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::compute::mock::MockApi;
    #[cfg(feature = "wgpu")]
    pub use crate::compute::wgpu::WgpuApi;
    pub use crate::compute::ComputeApi;
    pub use crate::config::TracerConfig;
    pub use crate::device::{Device, DeviceId, DeviceKind};
    pub use crate::scene::{Camera, Material, MaterialKind, Primitive, Scene, SharedScene};
    pub use crate::tracer::{BlockCompletion, BlockRequest, RenderParams, RenderTarget, Tracer, TracerController};
    pub use crate::util::{Result, TracerError};
}
