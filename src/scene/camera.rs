//! Pinhole camera and its frustum corner rays.

use crate::util::{Vec3, Vec4};

/// Size in bytes of the uploaded frustum (4 x vec4).
pub const FRUSTUM_BYTES: u64 = 4 * 16;

/// Pinhole camera.
///
/// The kernel never sees the camera basis directly; it receives the eye
/// position and four corner rays (top-left, top-right, bottom-left,
/// bottom-right) and interpolates between them per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    eye: Vec3,
    target: Vec3,
    up: Vec3,
    /// Vertical field of view in degrees
    fov_y: f32,
    aspect: f32,
    frustum: [Vec4; 4],
}

impl Camera {
    /// Create a camera at `eye` looking at `target`.
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3, fov_y: f32, aspect: f32) -> Self {
        let mut camera = Self {
            eye,
            target,
            up,
            fov_y,
            aspect,
            frustum: [Vec4::ZERO; 4],
        };
        camera.update();
        camera
    }

    /// Move the eye, keeping the target.
    pub fn set_position(&mut self, eye: Vec3) {
        self.eye = eye;
        self.update();
    }

    /// Re-aim the camera.
    pub fn set_target(&mut self, target: Vec3) {
        self.target = target;
        self.update();
    }

    /// Eye position as passed to the kernel (w = 1).
    pub fn position(&self) -> Vec4 {
        self.eye.extend(1.0)
    }

    /// Corner rays in TL, TR, BL, BR order.
    pub fn frustum(&self) -> &[Vec4; 4] {
        &self.frustum
    }

    /// Frustum corners as raw bytes for device upload.
    pub fn frustum_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.frustum)
    }

    fn update(&mut self) {
        let forward = (self.target - self.eye).normalize_or_zero();
        let right = forward.cross(self.up).normalize_or_zero();
        let up = right.cross(forward);

        let half_h = (self.fov_y.to_radians() * 0.5).tan();
        let half_w = half_h * self.aspect;

        let corner = |sx: f32, sy: f32| (forward + right * (sx * half_w) + up * (sy * half_h)).extend(0.0);
        self.frustum = [
            corner(-1.0, 1.0),
            corner(1.0, 1.0),
            corner(-1.0, -1.0),
            corner(1.0, -1.0),
        ];
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y, 45.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frustum_bytes() {
        let cam = Camera::default();
        assert_eq!(cam.frustum_bytes().len() as u64, FRUSTUM_BYTES);
    }

    #[test]
    fn test_frustum_symmetry() {
        let cam = Camera::look_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y, 90.0, 2.0);
        let [tl, tr, bl, br] = *cam.frustum();

        // 90 degree fov: half height 1, aspect 2: half width 2
        assert!((tl - Vec4::new(-2.0, 1.0, -1.0, 0.0)).length() < 1e-5);
        assert!((tr - Vec4::new(2.0, 1.0, -1.0, 0.0)).length() < 1e-5);
        assert!((bl - Vec4::new(-2.0, -1.0, -1.0, 0.0)).length() < 1e-5);
        assert!((br - Vec4::new(2.0, -1.0, -1.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_move_updates_frustum() {
        let mut cam = Camera::default();
        let before = *cam.frustum();
        cam.set_position(Vec3::new(5.0, 0.0, 0.0));
        assert_ne!(before, *cam.frustum());
        assert_eq!(cam.position(), Vec4::new(5.0, 0.0, 0.0, 1.0));
    }
}
