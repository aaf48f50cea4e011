//! Flatten scene primitives and materials into device records.
//!
//! Each record is a run of RGBA f32 texels so it can be uploaded as a 1D
//! image. Record `i` always describes source element `i`: the kernel looks
//! materials up by the index stored in each primitive.

use bytemuck::{Pod, Zeroable};

use super::{Material, MaterialKind, Primitive, Scene, Shape};
use crate::util::{texel, Texel, Vec3, TEXEL_BYTES};

/// Packed primitive (48 bytes, 3 texels).
///
/// - `header`: x = kind (0 sphere, 1 plane, 2 box), y = material index
/// - `params0`: sphere center + radius | plane normal + offset | box min
/// - `params1`: box max, zero otherwise
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedPrimitive {
    pub header: Texel,
    pub params0: Texel,
    pub params1: Texel,
}

/// Packed material (48 bytes, 3 texels).
///
/// - `albedo_kind`: rgb = albedo, a = kind (0 diffuse, 1 specular, 2 refractive, 3 emissive)
/// - `emission_roughness`: rgb = emission, a = roughness
/// - `ior_pad`: x = index of refraction
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedMaterial {
    pub albedo_kind: Texel,
    pub emission_roughness: Texel,
    pub ior_pad: Texel,
}

pub const PRIMITIVE_SPHERE: f32 = 0.0;
pub const PRIMITIVE_PLANE: f32 = 1.0;
pub const PRIMITIVE_BOX: f32 = 2.0;

impl PackedPrimitive {
    pub fn pack(primitive: &Primitive) -> Self {
        let material = primitive.material as f32;
        let (kind, params0, params1) = match primitive.shape {
            Shape::Sphere { center, radius } => (PRIMITIVE_SPHERE, texel(center, radius), [0.0; 4]),
            Shape::Plane { normal, offset } => (PRIMITIVE_PLANE, texel(normal.normalize_or_zero(), offset), [0.0; 4]),
            Shape::Box { min, max } => (PRIMITIVE_BOX, texel(min, 0.0), texel(max, 0.0)),
        };
        Self {
            header: [kind, material, 0.0, 0.0],
            params0,
            params1,
        }
    }
}

impl PackedMaterial {
    pub fn pack(material: &Material) -> Self {
        let kind = match material.kind {
            MaterialKind::Diffuse => 0.0,
            MaterialKind::Specular => 1.0,
            MaterialKind::Refractive => 2.0,
            MaterialKind::Emissive => 3.0,
        };
        Self {
            albedo_kind: texel(material.albedo, kind),
            emission_roughness: texel(material.emission, material.roughness),
            ior_pad: texel(Vec3::new(material.ior, 0.0, 0.0), 0.0),
        }
    }
}

/// Scene data ready for device upload.
#[derive(Debug, Clone, Default)]
pub struct PackedScene {
    pub primitives: Vec<PackedPrimitive>,
    pub materials: Vec<PackedMaterial>,
}

impl PackedScene {
    /// Primitive records as texels (image width = `len()`).
    pub fn primitive_texels(&self) -> &[Texel] {
        bytemuck::cast_slice(&self.primitives)
    }

    /// Material records as texels (image width = `len()`).
    pub fn material_texels(&self) -> &[Texel] {
        bytemuck::cast_slice(&self.materials)
    }

    /// Primitive count as passed to the kernel.
    pub fn primitive_count(&self) -> i32 {
        self.primitives.len() as i32
    }
}

/// Texels per packed record.
pub const fn texels_per_record<T>() -> usize {
    std::mem::size_of::<T>() / TEXEL_BYTES
}

/// Pack a scene's primitives and materials, preserving element order.
pub fn pack_scene(scene: &Scene) -> PackedScene {
    PackedScene {
        primitives: scene.primitives.iter().map(PackedPrimitive::pack).collect(),
        materials: scene.materials.iter().map(PackedMaterial::pack).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Material;

    #[test]
    fn test_record_stride() {
        assert_eq!(std::mem::size_of::<PackedPrimitive>() % TEXEL_BYTES, 0);
        assert_eq!(std::mem::size_of::<PackedMaterial>() % TEXEL_BYTES, 0);
        assert_eq!(texels_per_record::<PackedPrimitive>(), 3);
        assert_eq!(texels_per_record::<PackedMaterial>(), 3);
    }

    #[test]
    fn test_empty_scene() {
        let packed = pack_scene(&Scene::default());
        assert!(packed.primitives.is_empty());
        assert!(packed.materials.is_empty());
        assert!(packed.primitive_texels().is_empty());
        assert_eq!(packed.primitive_count(), 0);
    }

    #[test]
    fn test_counts_and_order() {
        let mut scene = Scene::default();
        let red = scene.add_material(Material::diffuse(Vec3::X));
        let green = scene.add_material(Material::diffuse(Vec3::Y));
        scene.add_primitive(Primitive::sphere(Vec3::ZERO, 1.0, green));
        scene.add_primitive(Primitive::plane(Vec3::new(0.0, 2.0, 0.0), -1.0, red));
        scene.add_primitive(Primitive::aabb(Vec3::splat(-1.0), Vec3::splat(1.0), green));

        let packed = pack_scene(&scene);
        assert_eq!(packed.primitives.len(), 3);
        assert_eq!(packed.materials.len(), 2);
        assert_eq!(packed.primitive_texels().len(), 9);
        assert_eq!(packed.material_texels().len(), 6);

        for (src, rec) in scene.primitives.iter().zip(&packed.primitives) {
            assert_eq!(rec.header[1], src.material as f32);
        }
        assert_eq!(packed.primitives[0].header[0], PRIMITIVE_SPHERE);
        assert_eq!(packed.primitives[0].params0, [0.0, 0.0, 0.0, 1.0]);
        // plane normals are normalized on the way out
        assert_eq!(packed.primitives[1].params0, [0.0, 1.0, 0.0, -1.0]);
        assert_eq!(packed.primitives[2].header[0], PRIMITIVE_BOX);
        assert_eq!(packed.primitives[2].params1, [1.0, 1.0, 1.0, 0.0]);

        assert_eq!(packed.materials[red as usize].albedo_kind, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(packed.materials[green as usize].albedo_kind, [0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_material_fields() {
        let glass = Material {
            kind: MaterialKind::Refractive,
            albedo: Vec3::ONE,
            emission: Vec3::ZERO,
            roughness: 0.1,
            ior: 1.33,
        };
        let rec = PackedMaterial::pack(&glass);
        assert_eq!(rec.albedo_kind[3], 2.0);
        assert_eq!(rec.emission_roughness[3], 0.1);
        assert_eq!(rec.ior_pad[0], 1.33);
    }
}
