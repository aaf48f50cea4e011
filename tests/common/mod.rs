//! Shared fixtures for tracer integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pathtrace_device::compute::mock::MockApi;
use pathtrace_device::config::TracerConfig;
use pathtrace_device::device::{Device, DeviceId, DeviceKind};
use pathtrace_device::scene::{Camera, Material, Primitive, Scene, SharedScene};
use pathtrace_device::tracer::{BlockRequest, Tracer, TracerController};
use pathtrace_device::util::Vec3;

use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const GOOD_KERNEL: &str = "// mock kernel\nfn trace_pixel() {}\n";
pub const BROKEN_KERNEL: &str = "fn trace_pixel() {\n#error unknown identifier `radiance`\n}\n";

/// Kernel source in a temp dir; keep the dir alive for the test's duration.
pub fn kernel(source: &str) -> (TempDir, TracerConfig) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("trace.wgsl");
    std::fs::write(&path, source).expect("Failed to write kernel source");
    (dir, TracerConfig::default().with_kernel_source(path))
}

pub fn device(index: u32) -> Device {
    Device::new(DeviceId(index), format!("mock{index}"), DeviceKind::DiscreteGpu)
}

pub fn tracer(id: &str, api: &Arc<MockApi>, config: TracerConfig) -> TracerController {
    TracerController::new(id, device(0), api.clone(), config)
}

/// Floor, lit sphere and a box: 3 primitives, 2 materials.
pub fn scene() -> SharedScene {
    let camera = Camera::look_at(Vec3::new(0.0, 1.0, 6.0), Vec3::ZERO, Vec3::Y, 40.0, 1.0);
    let mut scene = Scene::new(camera);
    let grey = scene.add_material(Material::diffuse(Vec3::splat(0.7)));
    let light = scene.add_material(Material::emissive(Vec3::splat(5.0)));
    scene.add_primitive(Primitive::plane(Vec3::Y, 0.0, grey));
    scene.add_primitive(Primitive::sphere(Vec3::new(0.0, 1.0, 0.0), 1.0, light));
    scene.add_primitive(Primitive::aabb(Vec3::new(1.5, 0.0, -0.5), Vec3::new(2.5, 1.0, 0.5), grey));
    scene.into_shared()
}

/// Offer `request` until the worker takes it. Returns the request if it
/// was never accepted.
pub fn enqueue_retry(tracer: &dyn Tracer, mut request: BlockRequest) -> Result<(), BlockRequest> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match tracer.enqueue(request) {
            Ok(()) => return Ok(()),
            Err(back) if Instant::now() < deadline => {
                request = back;
                thread::sleep(Duration::from_millis(1));
            }
            Err(back) => return Err(back),
        }
    }
}
