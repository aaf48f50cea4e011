//! Math type re-exports and device texel helpers.

pub use glam::{Vec3, Vec4};

/// One RGBA f32 texel, the unit every packed record and output pixel is built from.
pub type Texel = [f32; 4];

/// Bytes in one [`Texel`].
pub const TEXEL_BYTES: usize = std::mem::size_of::<Texel>();

/// Pack a vector and a trailing scalar into one texel.
#[inline]
pub fn texel(xyz: Vec3, w: f32) -> Texel {
    [xyz.x, xyz.y, xyz.z, w]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texel_layout() {
        assert_eq!(TEXEL_BYTES, 16);
        assert_eq!(texel(Vec3::new(1.0, 2.0, 3.0), 4.0), [1.0, 2.0, 3.0, 4.0]);
    }
}
