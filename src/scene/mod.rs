//! Host-side scene description consumed by the tracer.
//!
//! The scene is owned by the orchestrator and shared with every tracer
//! through [`SharedScene`]. Tracers only read it: primitives and materials
//! are packed once at setup, the camera is re-read for every block.

mod camera;
pub mod packing;

pub use camera::{Camera, FRUSTUM_BYTES};
pub use packing::{pack_scene, PackedMaterial, PackedPrimitive, PackedScene};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::util::Vec3;

/// Scene handle shared between the orchestrator and its tracers.
pub type SharedScene = Arc<RwLock<Scene>>;

/// Geometric shape of a primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Sphere { center: Vec3, radius: f32 },
    /// Infinite plane `dot(normal, p) = offset`
    Plane { normal: Vec3, offset: f32 },
    /// Axis-aligned box
    Box { min: Vec3, max: Vec3 },
}

/// A renderable object referencing a material by index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Primitive {
    pub shape: Shape,
    pub material: u32,
}

impl Primitive {
    pub fn sphere(center: Vec3, radius: f32, material: u32) -> Self {
        Self { shape: Shape::Sphere { center, radius }, material }
    }

    pub fn plane(normal: Vec3, offset: f32, material: u32) -> Self {
        Self { shape: Shape::Plane { normal, offset }, material }
    }

    pub fn aabb(min: Vec3, max: Vec3, material: u32) -> Self {
        Self { shape: Shape::Box { min, max }, material }
    }
}

/// Surface response model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    Diffuse,
    Specular,
    Refractive,
    Emissive,
}

/// Surface material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub kind: MaterialKind,
    pub albedo: Vec3,
    pub emission: Vec3,
    pub roughness: f32,
    pub ior: f32,
}

impl Material {
    pub fn diffuse(albedo: Vec3) -> Self {
        Self { kind: MaterialKind::Diffuse, albedo, ..Default::default() }
    }

    pub fn emissive(emission: Vec3) -> Self {
        Self { kind: MaterialKind::Emissive, albedo: Vec3::ZERO, emission, ..Default::default() }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self {
            kind: MaterialKind::Diffuse,
            albedo: Vec3::splat(0.8),
            emission: Vec3::ZERO,
            roughness: 1.0,
            ior: 1.5,
        }
    }
}

/// Everything a tracer needs to render a frame.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub camera: Camera,
    pub primitives: Vec<Primitive>,
    pub materials: Vec<Material>,
}

impl Scene {
    pub fn new(camera: Camera) -> Self {
        Self { camera, ..Default::default() }
    }

    /// Add a material and return its index for use by primitives.
    pub fn add_material(&mut self, material: Material) -> u32 {
        self.materials.push(material);
        (self.materials.len() - 1) as u32
    }

    pub fn add_primitive(&mut self, primitive: Primitive) {
        self.primitives.push(primitive);
    }

    /// Wrap the scene for sharing with tracers.
    pub fn into_shared(self) -> SharedScene {
        Arc::new(RwLock::new(self))
    }
}
