// Shader module loading
//
// Vulkan consumes SPIR-V as 32-bit words; byte code arriving from disk is
// validated (non-empty, length a multiple of 4) before module creation.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

use super::VulkanDevice;

/// Convert raw SPIR-V bytes into the word stream Vulkan expects.
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    if code.is_empty() {
        anyhow::bail!("SPIR-V byte code is empty");
    }
    if code.len() % 4 != 0 {
        anyhow::bail!(
            "SPIR-V byte code length {} is not a multiple of 4",
            code.len()
        );
    }

    Ok(code
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Create a shader module from SPIR-V bytes.
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    let words = spirv_words(code)?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Read a compiled shader binary from disk. A missing file is a fatal
/// configuration error for the caller.
pub fn load_shader_bytes<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).with_context(|| format!("Shader not found: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_code() {
        assert!(spirv_words(&[]).is_err());
    }

    #[test]
    fn rejects_unaligned_length() {
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
        assert!(spirv_words(&[0; 5]).is_err());
    }

    #[test]
    fn converts_little_endian_words() {
        // SPIR-V magic number followed by one zero word
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x00, 0x00];
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0]);
    }
}
