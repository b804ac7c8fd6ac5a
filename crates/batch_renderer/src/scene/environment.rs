//! Environments: instances, cameras and lights over a shared scene
//!
//! Instances are stored grouped by mesh so a frame can copy each mesh's
//! transforms contiguously and draw them with one instanced call. An
//! [`InstanceHandle`] maps to its (mesh, slot) position through a slot map,
//! which keeps lookups O(1) and lets removal swap the last instance into the
//! freed slot.

use crate::foundation::math::{self, Mat4, Vec3};
use crate::render::config::EngineLimits;
use crate::render::error::{RenderError, RenderResult};
use crate::scene::{Scene, SceneLayout};
use nalgebra::{Rotation3, Unit};
use slotmap::{new_key_type, SlotMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

new_key_type! {
    /// Stable handle to one instance in an environment
    pub struct InstanceHandle;
}

/// Index of a camera within its environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraHandle(u32);

impl CameraHandle {
    /// Position in the environment's camera list
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a light within its environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightHandle(u32);

impl LightHandle {
    /// Position in the environment's light list
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Point light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    /// World-space position
    pub position: Vec3,
    /// Linear RGB intensity
    pub color: Vec3,
}

#[derive(Debug, Clone, Copy)]
struct InstanceSlot {
    mesh: u32,
    slot: u32,
}

#[derive(Debug, Clone, Default)]
struct MeshInstances {
    transforms: Vec<Mat4>,
    materials: Vec<u32>,
    handles: Vec<InstanceHandle>,
}

#[derive(Debug, Clone, Copy)]
struct Camera {
    view: Mat4,
    active: bool,
}

/// Host-side contents of an environment
///
/// Independent of the GPU so it can be built and inspected without a device.
#[derive(Debug, Clone)]
pub struct EnvironmentState {
    layout: SceneLayout,
    limits: EngineLimits,
    meshes: Vec<MeshInstances>,
    index: SlotMap<InstanceHandle, InstanceSlot>,
    cameras: Vec<Camera>,
    lights: Vec<Light>,
    projection: Mat4,
}

impl EnvironmentState {
    /// Create an empty environment for a scene of the given shape
    pub fn new(layout: SceneLayout, limits: EngineLimits, projection: Mat4) -> Self {
        Self {
            layout,
            limits,
            meshes: vec![MeshInstances::default(); layout.mesh_count],
            index: SlotMap::with_key(),
            cameras: Vec::new(),
            lights: Vec::new(),
            projection,
        }
    }

    /// Shape of the underlying scene
    pub fn layout(&self) -> SceneLayout {
        self.layout
    }

    /// Add an instance of `mesh` drawn with `material`
    pub fn add_instance(&mut self, mesh: u32, material: u32, transform: Mat4) -> RenderResult<InstanceHandle> {
        self.check_mesh(mesh)?;
        self.check_material(material)?;

        let capacity = self.limits.max_instances as usize;
        if self.index.len() + 1 > capacity {
            return Err(RenderError::OutOfInstanceSpace { requested: self.index.len() + 1, capacity });
        }

        let instances = &mut self.meshes[mesh as usize];
        let slot = instances.transforms.len() as u32;
        let handle = self.index.insert(InstanceSlot { mesh, slot });
        instances.transforms.push(transform);
        instances.materials.push(material);
        instances.handles.push(handle);

        Ok(handle)
    }

    /// Remove an instance; the mesh's last instance takes its slot
    pub fn remove_instance(&mut self, handle: InstanceHandle) -> RenderResult<()> {
        let InstanceSlot { mesh, slot } = self.index.remove(handle).ok_or(RenderError::InvalidHandle { kind: "instance" })?;
        let instances = &mut self.meshes[mesh as usize];
        let slot = slot as usize;

        instances.transforms.swap_remove(slot);
        instances.materials.swap_remove(slot);
        instances.handles.swap_remove(slot);

        if let Some(&moved) = instances.handles.get(slot) {
            if let Some(entry) = self.index.get_mut(moved) {
                entry.slot = slot as u32;
            }
        }
        Ok(())
    }

    /// Whether `handle` refers to a live instance
    pub fn contains_instance(&self, handle: InstanceHandle) -> bool {
        self.index.contains_key(handle)
    }

    /// Current transform of an instance
    pub fn instance_transform(&self, handle: InstanceHandle) -> RenderResult<Mat4> {
        let InstanceSlot { mesh, slot } = self.lookup(handle)?;
        Ok(self.meshes[mesh as usize].transforms[slot as usize])
    }

    /// Replace the transform of an instance
    pub fn update_instance_transform(&mut self, handle: InstanceHandle, transform: Mat4) -> RenderResult<()> {
        let InstanceSlot { mesh, slot } = self.lookup(handle)?;
        self.meshes[mesh as usize].transforms[slot as usize] = transform;
        Ok(())
    }

    /// Current material of an instance
    pub fn instance_material(&self, handle: InstanceHandle) -> RenderResult<u32> {
        let InstanceSlot { mesh, slot } = self.lookup(handle)?;
        Ok(self.meshes[mesh as usize].materials[slot as usize])
    }

    /// Change the material of an instance
    pub fn set_instance_material(&mut self, handle: InstanceHandle, material: u32) -> RenderResult<()> {
        self.check_material(material)?;
        let InstanceSlot { mesh, slot } = self.lookup(handle)?;
        self.meshes[mesh as usize].materials[slot as usize] = material;
        Ok(())
    }

    /// Total live instances
    pub fn instance_count(&self) -> usize {
        self.index.len()
    }

    /// Transforms and material indices of every instance of `mesh`, in slot order
    pub fn mesh_instances(&self, mesh: usize) -> (&[Mat4], &[u32]) {
        self.meshes
            .get(mesh)
            .map_or((&[][..], &[][..]), |m| (m.transforms.as_slice(), m.materials.as_slice()))
    }

    /// Add an active camera with the given view matrix
    pub fn add_camera(&mut self, view: Mat4) -> RenderResult<CameraHandle> {
        let capacity = self.limits.max_cameras as usize;
        if self.cameras.len() + 1 > capacity {
            return Err(RenderError::TooManyCameras { requested: self.cameras.len() + 1, capacity });
        }
        self.cameras.push(Camera { view, active: true });
        Ok(CameraHandle((self.cameras.len() - 1) as u32))
    }

    /// Include or exclude a camera from rendering
    pub fn set_camera_active(&mut self, camera: CameraHandle, active: bool) -> RenderResult<()> {
        self.camera_mut(camera)?.active = active;
        Ok(())
    }

    /// Whether a camera is rendered
    pub fn is_camera_active(&self, camera: CameraHandle) -> RenderResult<bool> {
        Ok(self.camera(camera)?.active)
    }

    /// Replace a camera's view matrix
    pub fn set_camera_view(&mut self, camera: CameraHandle, view: Mat4) -> RenderResult<()> {
        self.camera_mut(camera)?.view = view;
        Ok(())
    }

    /// Current view matrix of a camera
    pub fn camera_view(&self, camera: CameraHandle) -> RenderResult<Mat4> {
        Ok(self.camera(camera)?.view)
    }

    /// Point a camera from `eye` at `target`
    pub fn look_at(&mut self, camera: CameraHandle, eye: Vec3, target: Vec3, up: Vec3) -> RenderResult<()> {
        self.set_camera_view(camera, math::look_at(&eye, &target, &up))
    }

    /// Post-multiply a camera's view by a rotation of `angle` radians about `axis`
    pub fn rotate_camera(&mut self, camera: CameraHandle, angle: f32, axis: Vec3) -> RenderResult<()> {
        let axis = Unit::try_new(axis, f32::EPSILON)
            .ok_or_else(|| RenderError::InvalidConfig("camera rotation axis has zero length".to_string()))?;
        let rotation = Rotation3::from_axis_angle(&axis, angle).to_homogeneous();
        let cam = self.camera_mut(camera)?;
        cam.view *= rotation;
        Ok(())
    }

    /// Post-multiply a camera's view by a translation
    pub fn translate_camera(&mut self, camera: CameraHandle, offset: Vec3) -> RenderResult<()> {
        let cam = self.camera_mut(camera)?;
        cam.view *= Mat4::new_translation(&offset);
        Ok(())
    }

    /// Number of cameras, active or not
    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    /// View matrices of active cameras in index order
    pub fn active_views(&self) -> impl Iterator<Item = &Mat4> + '_ {
        self.cameras.iter().filter(|c| c.active).map(|c| &c.view)
    }

    /// Number of active cameras
    pub fn active_camera_count(&self) -> usize {
        self.cameras.iter().filter(|c| c.active).count()
    }

    /// Add a point light
    pub fn add_light(&mut self, position: Vec3, color: Vec3) -> RenderResult<LightHandle> {
        let capacity = self.limits.max_lights as usize;
        if self.lights.len() + 1 > capacity {
            return Err(RenderError::TooManyLights { requested: self.lights.len() + 1, capacity });
        }
        self.lights.push(Light { position, color });
        Ok(LightHandle((self.lights.len() - 1) as u32))
    }

    /// Move or recolor a light
    pub fn update_light(&mut self, light: LightHandle, position: Vec3, color: Vec3) -> RenderResult<()> {
        let entry = self.lights.get_mut(light.index()).ok_or(RenderError::InvalidHandle { kind: "light" })?;
        *entry = Light { position, color };
        Ok(())
    }

    /// Lights in insertion order
    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    /// Replace the projection shared by every camera
    pub fn set_projection(&mut self, projection: Mat4) {
        self.projection = projection;
    }

    /// Projection shared by every camera
    pub fn projection(&self) -> &Mat4 {
        &self.projection
    }

    fn lookup(&self, handle: InstanceHandle) -> RenderResult<InstanceSlot> {
        self.index.get(handle).copied().ok_or(RenderError::InvalidHandle { kind: "instance" })
    }

    fn camera(&self, camera: CameraHandle) -> RenderResult<&Camera> {
        self.cameras.get(camera.index()).ok_or(RenderError::InvalidHandle { kind: "camera" })
    }

    fn camera_mut(&mut self, camera: CameraHandle) -> RenderResult<&mut Camera> {
        self.cameras.get_mut(camera.index()).ok_or(RenderError::InvalidHandle { kind: "camera" })
    }

    fn check_mesh(&self, mesh: u32) -> RenderResult<()> {
        if mesh as usize >= self.layout.mesh_count {
            return Err(RenderError::InvalidMesh { mesh, mesh_count: self.layout.mesh_count });
        }
        Ok(())
    }

    fn check_material(&self, material: u32) -> RenderResult<()> {
        if material as usize >= self.layout.material_count {
            return Err(RenderError::InvalidMaterial { material, material_count: self.layout.material_count });
        }
        Ok(())
    }
}

/// Instances, cameras and lights placed in a [`Scene`]
///
/// Dereferences to [`EnvironmentState`] for all mutation. Holding the scene
/// keeps its GPU resources alive for as long as the environment exists.
pub struct Environment {
    scene: Arc<Scene>,
    state: EnvironmentState,
}

impl Environment {
    pub(crate) fn new(scene: Arc<Scene>, limits: EngineLimits, projection: Mat4) -> Self {
        let state = EnvironmentState::new(scene.layout(), limits, projection);
        Self { scene, state }
    }

    /// Scene this environment draws from
    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    /// Host-side contents
    pub fn state(&self) -> &EnvironmentState {
        &self.state
    }
}

impl Deref for Environment {
    type Target = EnvironmentState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl DerefMut for Environment {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}
