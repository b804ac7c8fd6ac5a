// build.rs
// Build script for Vulkan shader compilation

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Fragment shader variants: output stem and preprocessor defines
const FRAGMENT_VARIANTS: [(&str, &[&str]); 4] = [
    ("unlit_vertex", &[]),
    ("unlit_textured", &["TEXTURED"]),
    ("lit_vertex", &["LIT"]),
    ("lit_textured", &["LIT", "TEXTURED"]),
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is always set by cargo"));
    let target_dir = out_dir.join("shaders");

    // The engine reads this at compile time, so export it even when nothing gets compiled
    println!("cargo:rustc-env=BATCH_RENDERER_SHADER_DIR={}", target_dir.display());
    println!("cargo:rerun-if-changed=../../resources/shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        eprintln!("warning: Failed to create shader output directory: {}", e);
        return;
    }

    if env::var("SKIP_SHADERS").is_ok() {
        eprintln!("info: Skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    let vulkan_sdk = match env::var("VULKAN_SDK") {
        Ok(sdk) => sdk,
        Err(_) => {
            eprintln!("warning: VULKAN_SDK not set, shader compilation skipped");
            eprintln!("hint: Install Vulkan SDK and set VULKAN_SDK environment variable");
            return;
        }
    };

    let glslc = if cfg!(target_os = "windows") {
        format!("{}\\Bin\\glslc.exe", vulkan_sdk)
    } else {
        format!("{}/bin/glslc", vulkan_sdk)
    };

    if !Path::new(&glslc).exists() {
        eprintln!("warning: glslc not found at: {}", glslc);
        return;
    }

    let shader_dir = PathBuf::from("../../resources/shaders");
    let mut compiled_count = 0;

    compile(&glslc, &shader_dir.join("batch.vert"), &target_dir.join("batch.vert.spv"), &[]);
    compiled_count += 1;

    for (stem, defines) in FRAGMENT_VARIANTS {
        let out_file = target_dir.join(format!("{}.frag.spv", stem));
        compile(&glslc, &shader_dir.join("batch.frag"), &out_file, defines);
        compiled_count += 1;
    }

    eprintln!("info: Compiled {} shader(s) into {:?}", compiled_count, target_dir);
}

fn compile(glslc: &str, source: &Path, out_file: &Path, defines: &[&str]) {
    let mut command = Command::new(glslc);
    command.arg("--target-env=vulkan1.2").arg(source).arg("-o").arg(out_file);
    for define in defines {
        command.arg(format!("-D{}", define));
    }

    match command.status() {
        Ok(s) if s.success() => {
            eprintln!("info: Compiled {:?} -> {:?}", source.file_name().unwrap_or_default(), out_file.file_name().unwrap_or_default());
        }
        Ok(s) => {
            eprintln!("error: glslc failed for {:?} with exit code: {}", source, s.code().unwrap_or(-1));
            panic!("Shader compilation failed");
        }
        Err(e) => {
            eprintln!("error: Failed to run glslc for {:?}: {}", source, e);
            panic!("Failed to execute shader compiler");
        }
    }
}
