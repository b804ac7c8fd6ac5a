//! Math utilities and types
//!
//! Provides the matrix and vector types used for transforms, cameras and
//! projections, plus the Vulkan clip-space helpers the renderer relies on.

pub use nalgebra::{Matrix4, Vector3, Vector4};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Build a right-handed perspective projection for Vulkan clip space
///
/// `hfov_degrees` is the horizontal field of view. The result maps view-space
/// depth `-near..-far` to `0..1` and flips Y so that +Y points up on screen.
pub fn vulkan_perspective(hfov_degrees: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let half_h = (hfov_degrees.to_radians() * 0.5).tan();
    let half_v = half_h / aspect;

    let mut m = Mat4::zeros();
    m[(0, 0)] = 1.0 / half_h;
    m[(1, 1)] = -1.0 / half_v;
    m[(2, 2)] = far / (near - far);
    m[(2, 3)] = near * far / (near - far);
    m[(3, 2)] = -1.0;
    m
}

/// Build a right-handed view matrix looking from `eye` towards `target`
pub fn look_at(eye: &Vec3, target: &Vec3, up: &Vec3) -> Mat4 {
    Mat4::look_at_rh(&Point3::from(*eye), &Point3::from(*target), up)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn project(m: &Mat4, p: Vec3) -> Vec3 {
        let clip = m * Vec4::new(p.x, p.y, p.z, 1.0);
        Vec3::new(clip.x / clip.w, clip.y / clip.w, clip.z / clip.w)
    }

    #[test]
    fn perspective_maps_near_and_far_planes_to_unit_depth() {
        let proj = vulkan_perspective(90.0, 1.0, 0.1, 100.0);

        assert_relative_eq!(project(&proj, Vec3::new(0.0, 0.0, -0.1)).z, 0.0, epsilon = 1e-5);
        assert_relative_eq!(project(&proj, Vec3::new(0.0, 0.0, -100.0)).z, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn perspective_uses_horizontal_fov_and_flips_y() {
        let proj = vulkan_perspective(90.0, 2.0, 0.1, 10.0);

        // 90 degree hfov: x == -z lands on the right edge
        let right = project(&proj, Vec3::new(1.0, 0.0, -1.0));
        assert_relative_eq!(right.x, 1.0, epsilon = 1e-5);

        // Aspect 2 halves the vertical extent, and +Y maps to the top (-1 in Vulkan)
        let top = project(&proj, Vec3::new(0.0, 0.5, -1.0));
        assert_relative_eq!(top.y, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn look_at_moves_target_onto_negative_z() {
        let view = look_at(&Vec3::new(0.0, 5.0, 0.0), &Vec3::zeros(), &Vec3::new(0.0, 0.0, -1.0));
        let target = view * Vec4::new(0.0, 0.0, 0.0, 1.0);

        assert_relative_eq!(target.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(target.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(target.z, -5.0, epsilon = 1e-5);
    }
}
