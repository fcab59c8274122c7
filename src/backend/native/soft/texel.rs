//! Texel encoding for software clears

use half::f16;

use crate::rhi::TextureFormat;

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn linear_to_srgb(value: f32) -> f32 {
    let value = value.clamp(0.0, 1.0);
    if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}

/// Bytes of one texel of `format` holding `color` (RGBA, linear).
pub fn encode_color(format: TextureFormat, color: [f32; 4]) -> Vec<u8> {
    let [r, g, b, a] = color;
    match format {
        TextureFormat::Rgba8Unorm => vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)],
        TextureFormat::Rgba8UnormSrgb => vec![
            unorm8(linear_to_srgb(r)),
            unorm8(linear_to_srgb(g)),
            unorm8(linear_to_srgb(b)),
            unorm8(a),
        ],
        TextureFormat::Bgra8Unorm => vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)],
        TextureFormat::Bgra8UnormSrgb => vec![
            unorm8(linear_to_srgb(b)),
            unorm8(linear_to_srgb(g)),
            unorm8(linear_to_srgb(r)),
            unorm8(a),
        ],
        TextureFormat::Rgba16Float => color
            .iter()
            .flat_map(|c| f16::from_f32(*c).to_le_bytes())
            .collect(),
        TextureFormat::Rgba32Float => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
        TextureFormat::R32Float => r.to_le_bytes().to_vec(),
        TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8 => encode_depth(format, r),
    }
}

/// Bytes of one depth texel. Stencil is cleared to zero.
pub fn encode_depth(format: TextureFormat, depth: f32) -> Vec<u8> {
    match format {
        TextureFormat::Depth24PlusStencil8 => {
            let depth = (depth.clamp(0.0, 1.0) * 0x00ff_ffff as f32).round() as u32;
            depth.to_le_bytes().to_vec()
        }
        _ => depth.to_le_bytes().to_vec(),
    }
}
