//! GPU scenario tests
//!
//! Every test builds a real engine and returns early, with a log line, when no
//! device satisfies the queue requirements or the shaders were not compiled.

use crate::foundation::logging;
use crate::foundation::math::{Mat4, Vec3};
use crate::render::{
    BatchRenderer, ColorSource, EngineLimits, ErrorKind, FrameOutput, LoggingCapture, Outputs, RenderConfig,
    RenderError, RenderOptions, Shading,
};
use crate::scene::{Environment, MaterialDescription, SceneDescription, TextureData, TextureFormat, Vertex};

const TILE: u32 = 32;
const RED: [u8; 4] = [255, 0, 0, 255];
const GREEN: [u8; 4] = [0, 255, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];
const BACKGROUND: [u8; 4] = [0, 0, 0, 255];

fn config(batch_size: u32) -> RenderConfig {
    RenderConfig::new(batch_size, TILE, TILE).with_limits(EngineLimits {
        max_instances: 64,
        max_cameras: 16,
        max_lights: 16,
        max_materials: 16,
        max_textures: 4,
    })
}

fn try_renderer(config: RenderConfig) -> Option<BatchRenderer> {
    logging::init_for_tests();
    match BatchRenderer::new(config) {
        Ok(renderer) => Some(renderer),
        Err(e) => {
            log::warn!("Skipping GPU test: {}", e);
            None
        }
    }
}

fn quad_scene(colors: &[[f32; 4]]) -> SceneDescription {
    let white = [1.0; 3];
    let mut desc = SceneDescription::default();
    desc.add_mesh(
        &[
            Vertex::new([-0.5, -0.5, 0.0], [0.0, 0.0], white),
            Vertex::new([0.5, -0.5, 0.0], [1.0, 0.0], white),
            Vertex::new([0.5, 0.5, 0.0], [1.0, 1.0], white),
            Vertex::new([-0.5, 0.5, 0.0], [0.0, 1.0], white),
        ],
        &[0, 1, 2, 0, 2, 3],
    );
    for &color in colors {
        desc.add_material(MaterialDescription::color(color));
    }
    desc
}

fn in_front(x: f32) -> Mat4 {
    Mat4::new_translation(&Vec3::new(x, 0.0, -2.0))
}

fn pixel(output: &FrameOutput, tile: u32, x: u32, y: u32) -> [u8; 4] {
    let texels = output.color_tile(tile).expect("tile was drawn");
    let i = ((y * TILE + x) * 4) as usize;
    [texels[i], texels[i + 1], texels[i + 2], texels[i + 3]]
}

fn center(output: &FrameOutput, tile: u32) -> [u8; 4] {
    pixel(output, tile, TILE / 2, TILE / 2)
}

#[test]
fn single_triangle_draws_material_color_over_background() {
    let Some(renderer) = try_renderer(config(1).with_outputs(Outputs::COLOR | Outputs::DEPTH)) else {
        return;
    };

    let mut desc = SceneDescription::default();
    let mesh = desc.add_mesh(
        &[
            Vertex::new([-0.5, -0.5, 0.0], [0.0, 0.0], [1.0; 3]),
            Vertex::new([0.5, -0.5, 0.0], [1.0, 0.0], [1.0; 3]),
            Vertex::new([0.0, 0.5, 0.0], [0.5, 1.0], [1.0; 3]),
        ],
        &[0, 1, 2],
    );
    let red = desc.add_material(MaterialDescription::color([1.0, 0.0, 0.0, 1.0]));
    let scene = renderer.make_loader().unwrap().build_scene(&desc).unwrap();

    let mut stream = renderer.make_command_stream().unwrap();
    let mut env = stream.make_environment(&scene);
    env.add_instance(mesh, red, in_front(0.0)).unwrap();
    env.add_camera(Mat4::identity()).unwrap();

    let output = stream.render(&[env]).unwrap().wait().unwrap();
    assert_eq!(output.tile_count(), 1);
    assert_eq!(center(&output, 0), RED);
    assert_eq!(pixel(&output, 0, 0, 0), BACKGROUND);

    let depth = output.depth_tile(0).unwrap();
    assert!(depth[(TILE / 2 * TILE + TILE / 2) as usize] < 1.0);
    assert_eq!(depth[0], 1.0);
}

#[test]
fn unchanged_inputs_render_identical_tiles() {
    let Some(renderer) = try_renderer(config(2)) else {
        return;
    };
    let scene = renderer.make_loader().unwrap().build_scene(&quad_scene(&[[0.2, 0.4, 0.6, 1.0]])).unwrap();

    let mut stream = renderer.make_command_stream().unwrap();
    let mut env = stream.make_environment(&scene);
    env.add_instance(0, 0, in_front(0.1)).unwrap();
    env.add_camera(Mat4::identity()).unwrap();
    env.add_camera(Mat4::new_rotation(Vec3::new(0.0, 0.0, 0.3))).unwrap();
    let envs = [env];

    let first = stream.render(&envs).unwrap().wait().unwrap();
    let second = stream.render(&envs).unwrap().wait().unwrap();
    assert_eq!(first.tile_count(), 2);
    assert_eq!(first.color(), second.color());
}

#[test]
fn double_buffered_renders_keep_their_own_readback() {
    let Some(renderer) = try_renderer(config(1)) else {
        return;
    };
    assert!(renderer.config().features.options.contains(RenderOptions::DOUBLE_BUFFERED));

    let scene = renderer
        .make_loader()
        .unwrap()
        .build_scene(&quad_scene(&[[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0]]))
        .unwrap();
    let mut stream = renderer.make_command_stream().unwrap();
    assert_eq!(stream.slot_count(), 2);

    let make = |material: u32| -> Environment {
        let mut env = stream.make_environment(&scene);
        env.add_instance(0, material, in_front(0.0)).unwrap();
        env.add_camera(Mat4::identity()).unwrap();
        env
    };
    let a = [make(0)];
    let b = [make(1)];

    let sync_a = stream.render(&a).unwrap();
    let sync_b = stream.render(&b).unwrap();
    assert_ne!(sync_a.slot(), sync_b.slot());

    let out_a = sync_a.wait().unwrap();
    let out_b = sync_b.wait().unwrap();
    assert_eq!(center(&out_a, 0), RED);
    assert_eq!(center(&out_b, 0), GREEN);

    // Slot of A is pinned by its readback
    let err = stream.render(&a).unwrap_err();
    assert!(matches!(err, RenderError::ReadbackOutstanding { .. }));
    assert_eq!(err.kind(), ErrorKind::Synchronization);

    drop(out_a);
    let again = stream.render(&a).unwrap().wait().unwrap();
    assert_eq!(center(&again, 0), RED);
}

#[test]
fn reused_slot_makes_old_sync_stale() {
    let Some(renderer) = try_renderer(config(1)) else {
        return;
    };
    let scene = renderer.make_loader().unwrap().build_scene(&quad_scene(&[[1.0; 4]])).unwrap();
    let mut stream = renderer.make_command_stream().unwrap();
    let mut env = stream.make_environment(&scene);
    env.add_camera(Mat4::identity()).unwrap();
    let envs = [env];

    let first = stream.render(&envs).unwrap();
    let _second = stream.render(&envs).unwrap();
    let third = stream.render(&envs).unwrap();
    assert_eq!(first.slot(), third.slot());

    assert!(matches!(first.poll(), Err(RenderError::StaleSync { .. })));
    assert!(matches!(first.wait(), Err(RenderError::StaleSync { .. })));
    assert!(third.wait().is_ok());
}

#[test]
fn four_cameras_see_four_quads_in_tile_order() {
    let Some(renderer) = try_renderer(config(4).with_options(RenderOptions::CPU_SYNCHRONIZATION)) else {
        return;
    };
    let colors = [[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0], [1.0, 1.0, 1.0, 1.0]];
    let scene = renderer.make_loader().unwrap().build_scene(&quad_scene(&colors)).unwrap();

    let mut stream = renderer.make_command_stream().unwrap();
    assert_eq!(stream.slot_count(), 1);
    let mut env = stream.make_environment(&scene);
    for k in 0..4u32 {
        let x = k as f32 * 10.0;
        env.add_instance(0, k, in_front(x)).unwrap();
        let camera = env.add_camera(Mat4::identity()).unwrap();
        env.look_at(camera, Vec3::new(x, 0.0, 0.0), Vec3::new(x, 0.0, -2.0), Vec3::y()).unwrap();
    }
    let envs = [env];

    let sync = stream.render(&envs).unwrap();
    assert!(sync.poll().unwrap());

    let output = sync.wait().unwrap();
    assert_eq!(output.tile_count(), 4);
    assert_eq!(center(&output, 0), RED);
    assert_eq!(center(&output, 1), GREEN);
    assert_eq!(center(&output, 2), BLUE);
    assert_eq!(center(&output, 3), [255, 255, 255, 255]);
    assert_eq!(pixel(&output, 3, 0, 0), BACKGROUND);
}

#[test]
fn overhead_camera_sees_four_instances_of_one_quad() {
    let Some(renderer) = try_renderer(config(1).with_outputs(Outputs::COLOR | Outputs::DEPTH)) else {
        return;
    };
    let scene = renderer.make_loader().unwrap().build_scene(&quad_scene(&[[1.0, 0.0, 0.0, 1.0]])).unwrap();

    let mut stream = renderer.make_command_stream().unwrap();
    let mut env = stream.make_environment(&scene);
    for (x, y) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
        let transform = Mat4::new_translation(&Vec3::new(x, y, 0.0)) * Mat4::new_scaling(0.5);
        env.add_instance(0, 0, transform).unwrap();
    }
    let camera = env.add_camera(Mat4::identity()).unwrap();
    env.look_at(camera, Vec3::new(0.5, 0.5, 2.0), Vec3::new(0.5, 0.5, 0.0), Vec3::y()).unwrap();

    let output = stream.render(&[env]).unwrap().wait().unwrap();
    assert_eq!(output.tile_count(), 1);

    // 90 degree view from 2 units up: 8 pixels per unit, +Y towards row 0
    for (px, py) in [(12, 20), (20, 20), (12, 12), (20, 12)] {
        assert_eq!(pixel(&output, 0, px, py), RED, "quad at pixel ({px}, {py})");
    }
    for (px, py) in [(16, 16), (16, 12), (12, 16), (0, 0), (31, 31)] {
        assert_eq!(pixel(&output, 0, px, py), BACKGROUND, "gap at pixel ({px}, {py})");
    }

    let depth = output.depth_tile(0).unwrap();
    assert!(depth[(20 * TILE + 12) as usize] < 1.0);
    assert_eq!(depth[(16 * TILE + 16) as usize], 1.0);
}

#[test]
fn environments_in_one_batch_keep_their_scenes_and_instances() {
    let Some(renderer) = try_renderer(config(4)) else {
        return;
    };
    let mut loader = renderer.make_loader().unwrap();
    let red_scene = loader.build_scene(&quad_scene(&[[1.0, 0.0, 0.0, 1.0]])).unwrap();
    let green_scene = loader.build_scene(&quad_scene(&[[0.0, 1.0, 0.0, 1.0]])).unwrap();

    let mut stream = renderer.make_command_stream().unwrap();
    let mut first = stream.make_environment(&red_scene);
    first.add_instance(0, 0, in_front(0.0)).unwrap();
    first.add_instance(0, 0, in_front(50.0)).unwrap();
    first.add_camera(Mat4::identity()).unwrap();

    let mut second = stream.make_environment(&green_scene);
    second.add_instance(0, 0, in_front(0.0)).unwrap();
    second.add_camera(Mat4::identity()).unwrap();
    let away = second.add_camera(Mat4::identity()).unwrap();
    second.look_at(away, Vec3::new(100.0, 0.0, 0.0), Vec3::new(100.0, 0.0, -2.0), Vec3::y()).unwrap();

    let output = stream.render(&[first, second]).unwrap().wait().unwrap();
    assert_eq!(output.tile_count(), 3);
    assert_eq!(center(&output, 0), RED);
    assert_eq!(center(&output, 1), GREEN);
    assert_eq!(center(&output, 2), BACKGROUND);
}

#[test]
fn lit_environments_use_only_their_own_lights() {
    let Some(renderer) = try_renderer(config(2).with_shading(Shading::Lit)) else {
        return;
    };
    let scene = renderer.make_loader().unwrap().build_scene(&quad_scene(&[[1.0; 4]])).unwrap();
    let mut stream = renderer.make_command_stream().unwrap();

    let lit = |color: Vec3| -> Environment {
        let mut env = stream.make_environment(&scene);
        env.add_instance(0, 0, in_front(0.0)).unwrap();
        env.add_camera(Mat4::identity()).unwrap();
        env.add_light(Vec3::new(0.0, 0.0, -1.0), color).unwrap();
        env
    };
    let envs = [lit(Vec3::new(1.0, 0.0, 0.0)), lit(Vec3::new(0.0, 0.0, 1.0))];

    let output = stream.render(&envs).unwrap().wait().unwrap();
    let [r, g, b, _] = center(&output, 0);
    assert_eq!(r, 255);
    assert!(g < 128 && b < 128, "red light gave {:?}", [r, g, b]);

    let [r, g, b, _] = center(&output, 1);
    assert_eq!(b, 255);
    assert!(r < 128 && g < 128, "blue light gave {:?}", [r, g, b]);
}

#[test]
fn overflowing_batch_is_rejected_and_stream_stays_usable() {
    let Some(renderer) = try_renderer(config(2)) else {
        return;
    };
    let scene = renderer.make_loader().unwrap().build_scene(&quad_scene(&[[1.0; 4]])).unwrap();
    let mut stream = renderer.make_command_stream().unwrap();

    let mut env = stream.make_environment(&scene);
    env.add_instance(0, 0, in_front(0.0)).unwrap();
    let cameras: Vec<_> = (0..3).map(|_| env.add_camera(Mat4::identity()).unwrap()).collect();
    let mut envs = [env];

    let err = stream.render(&envs).unwrap_err();
    assert!(matches!(err, RenderError::BatchOverflow { requested: 3, capacity: 2 }));
    assert_eq!(err.kind(), ErrorKind::Capacity);

    envs[0].set_camera_active(cameras[1], false).unwrap();
    let sync = stream.render(&envs).unwrap();
    assert_eq!(sync.serial(), 1);
    assert_eq!(sync.wait().unwrap().tile_count(), 2);
}

#[test]
fn textured_material_samples_its_texture() {
    let Some(renderer) = try_renderer(config(1).with_color_source(ColorSource::Texture)) else {
        return;
    };

    let mut desc = quad_scene(&[[1.0; 4]]);
    let texture = desc.add_texture(TextureData {
        bytes: BLUE.repeat(4),
        width: 2,
        height: 2,
        format: TextureFormat::Rgba8Unorm,
    });
    let textured = desc.add_material(MaterialDescription::textured(texture));
    let scene = renderer.make_loader().unwrap().build_scene(&desc).unwrap();

    let mut stream = renderer.make_command_stream().unwrap();
    let mut env = stream.make_environment(&scene);
    env.add_instance(0, textured, in_front(0.0)).unwrap();
    env.add_camera(Mat4::identity()).unwrap();
    let mut plain = stream.make_environment(&scene);
    plain.add_instance(0, 0, in_front(0.0)).unwrap();
    plain.add_camera(Mat4::identity()).unwrap();

    let output = stream.render(&[env]).unwrap().wait().unwrap();
    assert_eq!(center(&output, 0), BLUE);

    // Untextured materials sample the white default texture
    let output = stream.render(&[plain]).unwrap().wait().unwrap();
    assert_eq!(center(&output, 0), [255, 255, 255, 255]);
}

#[test]
fn captured_render_is_bracketed_once() {
    let Some(renderer) = try_renderer(config(1)) else {
        return;
    };
    let scene = renderer.make_loader().unwrap().build_scene(&quad_scene(&[[1.0, 0.0, 0.0, 1.0]])).unwrap();
    let mut stream = renderer.make_command_stream().unwrap();
    let mut env = stream.make_environment(&scene);
    env.add_instance(0, 0, in_front(0.0)).unwrap();
    env.add_camera(Mat4::identity()).unwrap();

    let mut capture = LoggingCapture::default();
    let output = stream.render_captured(&[env], &mut capture).unwrap();
    assert_eq!(capture.frames(), 1);
    assert_eq!(center(&output, 0), RED);

    let dir = std::env::temp_dir().join(format!("batch_renderer_capture_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("tile0.png");
    output.save_color_png(0, &path).unwrap();
    assert_eq!(image::open(&path).unwrap().to_rgba8().get_pixel(TILE / 2, TILE / 2).0, RED);
    assert!(matches!(output.save_depth_png(0, dir.join("depth.png")), Err(RenderError::ImageExport(_))));
    std::fs::remove_dir_all(&dir).ok();
}
