//! Batch planning and per-frame data staging
//!
//! A render call first turns its environments into a [`BatchPlan`]: which tile
//! each active camera gets, where each environment's instances and lights land
//! in the frame buffers, and which indexed draws to issue. Every capacity check
//! happens here, so a rejected batch never touches frame memory.
//! [`FrameDataLayout`] then copies the planned data into a slot's host-visible
//! region.

use crate::foundation::math::Mat4;
use crate::render::config::EngineLimits;
use crate::render::error::{RenderError, RenderResult};
use crate::scene::EnvironmentState;
use bytemuck::{Pod, Zeroable};
use std::mem;
use std::ops::Range;

/// View and projection of one tile, mirrors `ViewInfo` in the vertex shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ViewInfo {
    /// Column-major view matrix
    pub view: [[f32; 4]; 4],
    /// Column-major projection matrix
    pub projection: [[f32; 4]; 4],
}

/// Affine instance transform as three rows
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceTransform {
    /// Rows 0..3 of the 4x4 transform
    pub rows: [[f32; 4]; 3],
}

impl From<&Mat4> for InstanceTransform {
    fn from(m: &Mat4) -> Self {
        let row = |r: usize| [m[(r, 0)], m[(r, 1)], m[(r, 2)], m[(r, 3)]];
        Self { rows: [row(0), row(1), row(2)] }
    }
}

/// Point light record, mirrors `LightProperties` in the fragment shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightProperties {
    /// xyz position, w unused
    pub position: [f32; 4],
    /// rgb color, a unused
    pub color: [f32; 4],
}

/// Push constants for one camera's draws
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RenderPushConstant {
    /// Tile index, also the index into the view array
    pub batch_idx: u32,
    /// First light of the environment
    pub light_offset: u32,
    /// Lights in the environment
    pub light_count: u32,
    /// Pads the block to 16 bytes
    pub pad: u32,
}

/// One instanced draw of a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshDraw {
    /// Mesh index in the scene
    pub mesh: u32,
    /// First instance in the frame's transform array
    pub first_instance: u32,
    /// Instances drawn
    pub instance_count: u32,
}

/// Placement of one environment in the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentPlan {
    /// Position in the caller's environment list
    pub environment: usize,
    /// Tiles of this environment's active cameras, in camera order
    pub tiles: Range<u32>,
    /// First light in the frame's light array
    pub light_offset: u32,
    /// Lights of this environment
    pub light_count: u32,
    /// Draws for non-empty meshes
    pub draws: Vec<MeshDraw>,
}

impl EnvironmentPlan {
    /// Push constants for the camera rendering into `tile`
    pub fn push_constants(&self, tile: u32) -> RenderPushConstant {
        RenderPushConstant {
            batch_idx: tile,
            light_offset: self.light_offset,
            light_count: self.light_count,
            pad: 0,
        }
    }
}

/// Layout of one render call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchPlan {
    environments: Vec<EnvironmentPlan>,
    view_count: u32,
    instance_count: u32,
    light_count: u32,
}

impl BatchPlan {
    /// Plan a batch, failing before any frame memory is written
    ///
    /// Environments without an active camera are skipped entirely.
    pub fn new(envs: &[&EnvironmentState], batch_size: u32, limits: &EngineLimits) -> RenderResult<Self> {
        let active: usize = envs.iter().map(|e| e.active_camera_count()).sum();
        if active > batch_size as usize {
            return Err(RenderError::BatchOverflow { requested: active, capacity: batch_size as usize });
        }

        let drawn = || envs.iter().filter(|e| e.active_camera_count() > 0);

        let instances: usize = drawn().map(|e| e.instance_count()).sum();
        if instances > limits.max_instances as usize {
            return Err(RenderError::OutOfInstanceSpace { requested: instances, capacity: limits.max_instances as usize });
        }

        let lights: usize = drawn().map(|e| e.lights().len()).sum();
        if lights > limits.max_lights as usize {
            return Err(RenderError::TooManyLights { requested: lights, capacity: limits.max_lights as usize });
        }

        let mut plan = Self::default();
        for (index, env) in envs.iter().enumerate() {
            let views = env.active_camera_count() as u32;
            if views == 0 {
                continue;
            }

            let mut draws = Vec::new();
            for mesh in 0..env.layout().mesh_count {
                let count = env.mesh_instances(mesh).0.len() as u32;
                if count == 0 {
                    continue;
                }
                draws.push(MeshDraw { mesh: mesh as u32, first_instance: plan.instance_count, instance_count: count });
                plan.instance_count += count;
            }

            let light_count = env.lights().len() as u32;
            plan.environments.push(EnvironmentPlan {
                environment: index,
                tiles: plan.view_count..plan.view_count + views,
                light_offset: plan.light_count,
                light_count,
                draws,
            });
            plan.view_count += views;
            plan.light_count += light_count;
        }

        Ok(plan)
    }

    /// Environments that are drawn, in caller order
    pub fn environments(&self) -> &[EnvironmentPlan] {
        &self.environments
    }

    /// Tiles used
    pub fn view_count(&self) -> u32 {
        self.view_count
    }

    /// Instances staged
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Lights staged
    pub fn light_count(&self) -> u32 {
        self.light_count
    }
}

/// A sub-range of the frame data buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRegion {
    /// Byte offset
    pub offset: usize,
    /// Byte size
    pub size: usize,
}

impl FrameRegion {
    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Placement of views, transforms, material indices and lights in a frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDataLayout {
    /// `ViewInfo` per tile
    pub views: FrameRegion,
    /// `InstanceTransform` per instance
    pub transforms: FrameRegion,
    /// `u32` material index per instance
    pub materials: FrameRegion,
    /// `LightProperties` per light
    pub lights: FrameRegion,
    total: usize,
}

impl FrameDataLayout {
    /// Size regions for the batch and limits, aligning each to `alignment`
    pub fn new(batch_size: u32, limits: &EngineLimits, alignment: usize) -> Self {
        let mut cursor = 0;
        let mut region = |size: usize| {
            let offset = align_up(cursor, alignment.max(1));
            cursor = offset + size;
            FrameRegion { offset, size }
        };

        let views = region(batch_size as usize * mem::size_of::<ViewInfo>());
        let transforms = region(limits.max_instances as usize * mem::size_of::<InstanceTransform>());
        let materials = region(limits.max_instances as usize * mem::size_of::<u32>());
        let lights = region(limits.max_lights as usize * mem::size_of::<LightProperties>());

        Self { views, transforms, materials, lights, total: cursor }
    }

    /// Bytes needed for one frame slot
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Copy the planned batch into `bytes`
    ///
    /// `envs` must be the slice the plan was built from.
    pub fn write(&self, bytes: &mut [u8], plan: &BatchPlan, envs: &[&EnvironmentState]) {
        let views = &mut bytes[self.views.range()];
        for env_plan in plan.environments() {
            let env = envs[env_plan.environment];
            let projection: [[f32; 4]; 4] = (*env.projection()).into();
            for (tile, view) in env_plan.tiles.clone().zip(env.active_views()) {
                let info = ViewInfo { view: (*view).into(), projection };
                write_pod(views, tile as usize * mem::size_of::<ViewInfo>(), &info);
            }
        }

        let transforms = &mut bytes[self.transforms.range()];
        for env_plan in plan.environments() {
            let env = envs[env_plan.environment];
            for draw in &env_plan.draws {
                let (mats, _) = env.mesh_instances(draw.mesh as usize);
                for (i, m) in mats.iter().enumerate() {
                    let offset = (draw.first_instance as usize + i) * mem::size_of::<InstanceTransform>();
                    write_pod(transforms, offset, &InstanceTransform::from(m));
                }
            }
        }

        let materials = &mut bytes[self.materials.range()];
        for env_plan in plan.environments() {
            let env = envs[env_plan.environment];
            for draw in &env_plan.draws {
                let (_, indices) = env.mesh_instances(draw.mesh as usize);
                let offset = draw.first_instance as usize * mem::size_of::<u32>();
                let src: &[u8] = bytemuck::cast_slice(indices);
                materials[offset..offset + src.len()].copy_from_slice(src);
            }
        }

        let lights = &mut bytes[self.lights.range()];
        for env_plan in plan.environments() {
            let env = envs[env_plan.environment];
            for (i, light) in env.lights().iter().enumerate() {
                let record = LightProperties {
                    position: [light.position.x, light.position.y, light.position.z, 1.0],
                    color: [light.color.x, light.color.y, light.color.z, 1.0],
                };
                let offset = (env_plan.light_offset as usize + i) * mem::size_of::<LightProperties>();
                write_pod(lights, offset, &record);
            }
        }
    }
}

fn write_pod<T: Pod>(bytes: &mut [u8], offset: usize, value: &T) {
    let src = bytemuck::bytes_of(value);
    bytes[offset..offset + src.len()].copy_from_slice(src);
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::scene::SceneLayout;

    fn limits() -> EngineLimits {
        EngineLimits { max_instances: 16, max_lights: 4, ..EngineLimits::default() }
    }

    fn env_with_cameras(cameras: usize) -> EnvironmentState {
        let mut env = EnvironmentState::new(SceneLayout { mesh_count: 2, material_count: 2 }, limits(), Mat4::identity());
        for i in 0..cameras {
            env.add_camera(Mat4::new_translation(&Vec3::new(i as f32, 0.0, 0.0))).unwrap();
        }
        env
    }

    fn tiles(plan: &BatchPlan) -> Vec<(usize, Range<u32>)> {
        plan.environments().iter().map(|e| (e.environment, e.tiles.clone())).collect()
    }

    #[test]
    fn tiles_follow_environment_then_camera_order() {
        let a = env_with_cameras(2);
        let b = env_with_cameras(3);
        let plan = BatchPlan::new(&[&a, &b], 8, &limits()).unwrap();

        assert_eq!(tiles(&plan), vec![(0, 0..2), (1, 2..5)]);
        assert_eq!(plan.view_count(), 5);
    }

    #[test]
    fn deactivated_camera_shifts_later_tiles_and_reactivation_restores_them() {
        let mut a = env_with_cameras(2);
        let b = env_with_cameras(2);
        let extra = a.add_camera(Mat4::identity()).unwrap();

        let before = tiles(&BatchPlan::new(&[&a, &b], 8, &limits()).unwrap());
        assert_eq!(before, vec![(0, 0..3), (1, 3..5)]);

        a.set_camera_active(extra, false).unwrap();
        let shifted = tiles(&BatchPlan::new(&[&a, &b], 8, &limits()).unwrap());
        assert_eq!(shifted, vec![(0, 0..2), (1, 2..4)]);

        a.set_camera_active(extra, true).unwrap();
        assert_eq!(tiles(&BatchPlan::new(&[&a, &b], 8, &limits()).unwrap()), before);
    }

    #[test]
    fn environment_without_active_cameras_is_skipped() {
        let a = env_with_cameras(0);
        let b = env_with_cameras(1);
        let plan = BatchPlan::new(&[&a, &b], 4, &limits()).unwrap();

        assert_eq!(tiles(&plan), vec![(1, 0..1)]);
    }

    #[test]
    fn overflow_is_rejected() {
        let a = env_with_cameras(3);
        let b = env_with_cameras(2);

        assert!(matches!(
            BatchPlan::new(&[&a, &b], 4, &limits()),
            Err(RenderError::BatchOverflow { requested: 5, capacity: 4 })
        ));
        assert!(BatchPlan::new(&[&a, &b], 5, &limits()).is_ok());
    }

    #[test]
    fn batch_instance_space_is_shared_across_environments() {
        let mut a = env_with_cameras(1);
        let mut b = env_with_cameras(1);
        for _ in 0..10 {
            a.add_instance(0, 0, Mat4::identity()).unwrap();
            b.add_instance(1, 1, Mat4::identity()).unwrap();
        }

        assert!(matches!(
            BatchPlan::new(&[&a, &b], 4, &limits()),
            Err(RenderError::OutOfInstanceSpace { requested: 20, capacity: 16 })
        ));
    }

    #[test]
    fn batch_light_count_is_limited() {
        let mut a = env_with_cameras(1);
        let mut b = env_with_cameras(1);
        for _ in 0..3 {
            a.add_light(Vec3::zeros(), Vec3::x()).unwrap();
            b.add_light(Vec3::zeros(), Vec3::y()).unwrap();
        }

        assert!(matches!(BatchPlan::new(&[&a, &b], 4, &limits()), Err(RenderError::TooManyLights { .. })));
    }

    #[test]
    fn draws_are_contiguous_per_mesh() {
        let mut a = env_with_cameras(1);
        let mut b = env_with_cameras(1);
        a.add_instance(1, 0, Mat4::identity()).unwrap();
        a.add_instance(1, 0, Mat4::identity()).unwrap();
        b.add_instance(0, 1, Mat4::identity()).unwrap();
        b.add_instance(1, 1, Mat4::identity()).unwrap();
        b.add_light(Vec3::zeros(), Vec3::x()).unwrap();

        let plan = BatchPlan::new(&[&a, &b], 4, &limits()).unwrap();
        let envs = plan.environments();

        assert_eq!(envs[0].draws, vec![MeshDraw { mesh: 1, first_instance: 0, instance_count: 2 }]);
        assert_eq!(
            envs[1].draws,
            vec![
                MeshDraw { mesh: 0, first_instance: 2, instance_count: 1 },
                MeshDraw { mesh: 1, first_instance: 3, instance_count: 1 },
            ]
        );
        assert_eq!(envs[1].push_constants(1), RenderPushConstant { batch_idx: 1, light_offset: 0, light_count: 1, pad: 0 });
        assert_eq!(plan.instance_count(), 4);
    }

    #[test]
    fn layout_regions_are_aligned_and_disjoint() {
        let layout = FrameDataLayout::new(3, &limits(), 256);

        assert_eq!(layout.views, FrameRegion { offset: 0, size: 3 * 128 });
        assert_eq!(layout.transforms.offset, 512);
        assert_eq!(layout.transforms.size, 16 * 48);
        assert_eq!(layout.materials.offset % 256, 0);
        assert!(layout.materials.offset >= layout.transforms.offset + layout.transforms.size);
        assert_eq!(layout.total_size(), layout.lights.offset + 4 * 32);
    }

    #[test]
    fn staged_frame_data_matches_environment() {
        let mut env = env_with_cameras(2);
        let moved = Mat4::new_translation(&Vec3::new(4.0, 5.0, 6.0));
        env.add_instance(0, 1, moved).unwrap();
        env.add_light(Vec3::new(0.0, 2.0, 1.0), Vec3::new(1.0, 0.5, 0.25)).unwrap();

        let layout = FrameDataLayout::new(2, &limits(), 64);
        let plan = BatchPlan::new(&[&env], 2, &limits()).unwrap();
        let mut bytes = vec![0u8; layout.total_size()];
        layout.write(&mut bytes, &plan, &[&env]);

        let view: ViewInfo = bytemuck::pod_read_unaligned(&bytes[layout.views.offset + 128..][..128]);
        assert_eq!(view.view[3][0], 1.0);

        let transform: InstanceTransform = bytemuck::pod_read_unaligned(&bytes[layout.transforms.offset..][..48]);
        assert_eq!(transform.rows[0], [1.0, 0.0, 0.0, 4.0]);
        assert_eq!(transform.rows[2], [0.0, 0.0, 1.0, 6.0]);

        let material: u32 = bytemuck::pod_read_unaligned(&bytes[layout.materials.offset..][..4]);
        assert_eq!(material, 1);

        let light: LightProperties = bytemuck::pod_read_unaligned(&bytes[layout.lights.offset..][..32]);
        assert_eq!(light.color, [1.0, 0.5, 0.25, 1.0]);
    }

    #[test]
    fn staging_unchanged_inputs_is_idempotent() {
        let mut env = env_with_cameras(1);
        env.add_instance(1, 0, Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0))).unwrap();

        let layout = FrameDataLayout::new(1, &limits(), 16);
        let plan = BatchPlan::new(&[&env], 1, &limits()).unwrap();
        let mut first = vec![0u8; layout.total_size()];
        let mut second = vec![0xAAu8; layout.total_size()];
        layout.write(&mut first, &plan, &[&env]);
        layout.write(&mut second, &plan, &[&env]);

        let used = |b: &[u8]| -> Vec<u8> {
            [
                &b[layout.views.offset..][..128],
                &b[layout.transforms.offset..][..48],
                &b[layout.materials.offset..][..4],
            ]
            .concat()
        };
        assert_eq!(used(&first), used(&second));
    }
}
