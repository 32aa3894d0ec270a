// Shader compilation - GLSL to SPIR-V through an external compiler
//
// The device only needs SPIR-V words. Anything that can turn source into
// words implements `ShaderCompiler`; `GlslcCompiler` shells out to glslc from
// the Vulkan SDK.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[derive(Clone, Debug, Default)]
pub struct CompileOptions {
    pub defines: Vec<(String, Option<String>)>,
    pub include_paths: Vec<PathBuf>,
}

impl CompileOptions {
    pub fn define(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.defines.push((name.into(), value.map(str::to_owned)));
        self
    }

    pub fn include(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_paths.push(path.into());
        self
    }
}

pub trait ShaderCompiler {
    /// Compile one stage. An empty vector means compilation failed.
    fn compile(
        &self,
        stage: vk::ShaderStageFlags,
        source: &str,
        options: &CompileOptions,
    ) -> Vec<u32>;
}

/// Invokes `glslc` with source on stdin and SPIR-V on stdout
#[derive(Clone, Debug)]
pub struct GlslcCompiler {
    pub executable: PathBuf,
}

impl Default for GlslcCompiler {
    fn default() -> Self {
        let executable = std::env::var_os("VULKAN_SDK")
            .map(|sdk| PathBuf::from(sdk).join("bin").join("glslc"))
            .filter(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from("glslc"));
        Self { executable }
    }
}

impl GlslcCompiler {
    fn run(
        &self,
        stage: vk::ShaderStageFlags,
        source: &str,
        options: &CompileOptions,
    ) -> Result<Vec<u32>> {
        let stage_name = glslc_stage(stage).with_context(|| format!("Unsupported shader stage {:?}", stage))?;

        let mut command = Command::new(&self.executable);
        command
            .arg(format!("-fshader-stage={}", stage_name))
            .arg("--target-env=vulkan1.3");
        for (name, value) in &options.defines {
            match value {
                Some(value) => command.arg(format!("-D{}={}", name, value)),
                None => command.arg(format!("-D{}", name)),
            };
        }
        for path in &options.include_paths {
            command.arg("-I").arg(path);
        }
        command
            .arg("-")
            .arg("-o")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to launch {:?}", self.executable))?;
        child
            .stdin
            .take()
            .context("glslc stdin unavailable")?
            .write_all(source.as_bytes())
            .context("Failed to write shader source to glslc")?;

        let output = child.wait_with_output().context("glslc did not finish")?;
        if !output.status.success() {
            bail!(
                "glslc exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        spirv_from_bytes(&output.stdout)
    }
}

impl ShaderCompiler for GlslcCompiler {
    fn compile(
        &self,
        stage: vk::ShaderStageFlags,
        source: &str,
        options: &CompileOptions,
    ) -> Vec<u32> {
        match self.run(stage, source, options) {
            Ok(words) => words,
            Err(e) => {
                log::warn!("Shader compilation failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// Reinterpret a SPIR-V byte blob as words, fixing byte order if needed
pub fn spirv_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V blob")?;
    Ok(words)
}

fn glslc_stage(stage: vk::ShaderStageFlags) -> Option<&'static str> {
    match stage {
        vk::ShaderStageFlags::VERTEX => Some("vert"),
        vk::ShaderStageFlags::FRAGMENT => Some("frag"),
        vk::ShaderStageFlags::COMPUTE => Some("comp"),
        vk::ShaderStageFlags::GEOMETRY => Some("geom"),
        vk::ShaderStageFlags::TESSELLATION_CONTROL => Some("tesc"),
        vk::ShaderStageFlags::TESSELLATION_EVALUATION => Some("tese"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_blob_must_be_whole_words() {
        let good = [0x07230203u32, 0x00010000, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect::<Vec<u8>>();
        assert_eq!(spirv_from_bytes(&good).unwrap().len(), 5);

        assert!(spirv_from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn missing_compiler_yields_empty_output() {
        let compiler = GlslcCompiler {
            executable: PathBuf::from("/nonexistent/glslc"),
        };
        let words = compiler.compile(vk::ShaderStageFlags::VERTEX, "void main() {}", &CompileOptions::default());
        assert!(words.is_empty());
    }

    #[test]
    fn multi_stage_flags_are_rejected() {
        assert!(glslc_stage(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT).is_none());
        assert_eq!(glslc_stage(vk::ShaderStageFlags::COMPUTE), Some("comp"));
    }
}
