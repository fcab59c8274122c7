//! WGSL compilation and graphics pipeline creation.
//!
//! All pipelines share one descriptor set layout that mirrors the fixed
//! root signature of the explicit API:
//!
//! ```text
//! binding 0        uniform buffer, per-draw constants (b0)
//! bindings 1..=20  sampled images, tables t0..t19 holding texture views
//! bindings 21..=40 storage buffers, tables t0..t19 holding structured buffer views
//! bindings 41..=44 immutable samplers s0..s3
//! ```
//!
//! Vertex attributes are read from `@location(i)` where `i` is the
//! attribute's position in the input layout.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use crate::backend::native::gpu::{GpuPipelineDesc, ShaderBlob, MAX_VIEW_INSTANCES};
use crate::error::{RhiError, RhiResult};
use crate::rhi::{ShaderModel, ShaderStage, MAX_TEXTURE_SLOTS};

use super::conversion::{
    convert_compare_op, convert_cull_mode, convert_front_face, convert_texture_format,
    convert_topology_type, convert_vertex_format,
};

pub const CONSTANTS_BINDING: u32 = 0;
pub const TEXTURE_BINDING_BASE: u32 = 1;
pub const BUFFER_BINDING_BASE: u32 = TEXTURE_BINDING_BASE + MAX_TEXTURE_SLOTS;
pub const SAMPLER_BINDING_BASE: u32 = BUFFER_BINDING_BASE + MAX_TEXTURE_SLOTS;
pub const STATIC_SAMPLER_COUNT: u32 = 4;

fn compile_error(what: &str, err: impl std::fmt::Display) -> RhiError {
    RhiError::ShaderCompilationFailed(format!("{}: {}", what, err))
}

/// Compile WGSL `source` to SPIR-V for one entry point.
pub fn compile_wgsl(
    stage: ShaderStage,
    source: &str,
    entry_point: &str,
    model: ShaderModel,
) -> RhiResult<ShaderBlob> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| compile_error("WGSL parse error", e.emit_to_string(source)))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| compile_error("Validation error", e.emit_to_string(source)))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Pixel => naga::ShaderStage::Fragment,
    };
    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
    {
        return Err(RhiError::ShaderCompilationFailed(format!(
            "entry point '{}' not found for stage {:?}",
            entry_point, stage
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };
    let words = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| compile_error("SPIR-V generation error", e))?;

    Ok(ShaderBlob {
        stage,
        model,
        entry_point: entry_point.to_string(),
        code: Arc::from(bytemuck::cast_slice::<u32, u8>(&words)),
    })
}

/// Create the shared set layout, with `samplers` baked in as immutable samplers.
pub fn create_set_layout(
    device: &ash::Device,
    samplers: &[vk::Sampler],
) -> RhiResult<vk::DescriptorSetLayout> {
    let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
    let mut bindings = vec![vk::DescriptorSetLayoutBinding::default()
        .binding(CONSTANTS_BINDING)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(stages)];
    for slot in 0..MAX_TEXTURE_SLOTS {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(TEXTURE_BINDING_BASE + slot)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(stages),
        );
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(BUFFER_BINDING_BASE + slot)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(stages),
        );
    }
    for (index, sampler) in samplers.iter().enumerate() {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING_BASE + index as u32)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(stages)
                .immutable_samplers(std::slice::from_ref(sampler)),
        );
    }

    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&create_info, None) }
        .map_err(|e| RhiError::Gpu(format!("Failed to create descriptor set layout: {:?}", e)))
}

/// Static samplers s0..s3.
pub fn create_static_samplers(device: &ash::Device) -> RhiResult<Vec<vk::Sampler>> {
    let linear_wrap = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(vk::LOD_CLAMP_NONE);
    let shadow = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::NEAREST)
        .min_filter(vk::Filter::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
        .compare_enable(true)
        .compare_op(vk::CompareOp::LESS_OR_EQUAL);
    let point_border = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::NEAREST)
        .min_filter(vk::Filter::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
    let linear_clamp = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_lod(vk::LOD_CLAMP_NONE);

    let mut samplers = Vec::with_capacity(STATIC_SAMPLER_COUNT as usize);
    for info in [linear_wrap, shadow, point_border, linear_clamp] {
        match unsafe { device.create_sampler(&info, None) } {
            Ok(sampler) => samplers.push(sampler),
            Err(e) => {
                for sampler in samplers {
                    unsafe { device.destroy_sampler(sampler, None) };
                }
                return Err(RhiError::Gpu(format!("Failed to create sampler: {:?}", e)));
            }
        }
    }
    Ok(samplers)
}

fn create_module(device: &ash::Device, blob: &ShaderBlob) -> RhiResult<vk::ShaderModule> {
    let words = ash::util::read_spv(&mut std::io::Cursor::new(&blob.code[..]))
        .map_err(|e| compile_error("Invalid SPIR-V", e))?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|e| RhiError::Gpu(format!("Failed to create shader module: {:?}", e)))
}

/// View mask rendering must use with a pipeline built for `view_instance_count` views.
pub fn view_mask(view_instance_count: u32) -> u32 {
    if view_instance_count > 1 {
        (1u32 << view_instance_count.min(MAX_VIEW_INSTANCES)) - 1
    } else {
        0
    }
}

pub fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &GpuPipelineDesc,
) -> RhiResult<vk::Pipeline> {
    let vertex_entry = CString::new(desc.vertex.entry_point.as_str())
        .map_err(|e| RhiError::InvalidParameter(format!("vertex entry point: {}", e)))?;
    let pixel_entry = CString::new(desc.pixel.entry_point.as_str())
        .map_err(|e| RhiError::InvalidParameter(format!("pixel entry point: {}", e)))?;

    let vertex_module = create_module(device, &desc.vertex)?;
    let pixel_module = match create_module(device, &desc.pixel) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(&vertex_entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(pixel_module)
            .name(&pixel_entry),
    ];

    // Slot 0 advances per vertex, slot 1 per instance. Strides are bound dynamically.
    let slot_count = desc
        .input_layout
        .iter()
        .map(|a| a.input_slot + 1)
        .max()
        .unwrap_or(0);
    let bindings: Vec<vk::VertexInputBindingDescription> = (0..slot_count)
        .map(|slot| {
            vk::VertexInputBindingDescription::default()
                .binding(slot)
                .stride(0)
                .input_rate(if slot == 0 {
                    vk::VertexInputRate::VERTEX
                } else {
                    vk::VertexInputRate::INSTANCE
                })
        })
        .collect();
    let attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .input_layout
        .iter()
        .enumerate()
        .map(|(location, attribute)| {
            vk::VertexInputAttributeDescription::default()
                .location(location as u32)
                .binding(attribute.input_slot)
                .format(convert_vertex_format(attribute.format))
                .offset(attribute.offset_bytes)
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert_topology_type(desc.topology_type));

    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(convert_cull_mode(desc.state.rasterizer.cull_mode))
        .front_face(convert_front_face(desc.state.rasterizer.front_face));

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let has_depth = desc.dsv_format.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(has_depth && desc.state.depth.test_enable)
        .depth_write_enable(has_depth && desc.state.depth.write_enable)
        .depth_compare_op(convert_compare_op(desc.state.depth.compare_op));

    let blend_attachment = if desc.state.blend.enable {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA)
    };
    let blend_attachments = vec![blend_attachment; desc.rtv_formats.len()];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::PRIMITIVE_TOPOLOGY,
        vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE,
    ];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc
        .rtv_formats
        .iter()
        .map(|format| convert_texture_format(*format))
        .collect();
    let depth_format = desc
        .dsv_format
        .map(convert_texture_format)
        .unwrap_or(vk::Format::UNDEFINED);
    let mut rendering = vk::PipelineRenderingCreateInfo::default()
        .view_mask(view_mask(desc.view_instance_count))
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering);

    let result =
        unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None) };

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(pixel_module, None);
    }

    let pipelines = result.map_err(|(_, e)| {
        RhiError::Gpu(format!("Failed to create pipeline '{}': {:?}", desc.name, e))
    })?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| RhiError::Gpu(format!("No pipeline returned for '{}'", desc.name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADER: &str = r#"
@vertex
fn VSMain(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(i32(index) - 1);
    return vec4<f32>(x, 0.0, 0.0, 1.0);
}

@fragment
fn PSMain() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 0.0, 1.0);
}
"#;

    #[test]
    fn test_binding_ranges_do_not_overlap() {
        assert_eq!(TEXTURE_BINDING_BASE, 1);
        assert_eq!(BUFFER_BINDING_BASE, 21);
        assert_eq!(SAMPLER_BINDING_BASE, 41);
    }

    #[test]
    fn test_view_mask() {
        assert_eq!(view_mask(1), 0);
        assert_eq!(view_mask(6), 0b11_1111);
    }

    #[test]
    fn test_compile_wgsl() {
        let blob = compile_wgsl(ShaderStage::Vertex, SHADER, "VSMain", ShaderModel::Sm5_1).unwrap();
        assert_eq!(blob.code.len() % 4, 0);
        assert_eq!(&blob.code[..4], &0x0723_0203u32.to_le_bytes());

        // stage must match the entry point
        assert!(compile_wgsl(ShaderStage::Pixel, SHADER, "VSMain", ShaderModel::Sm5_1).is_err());
        assert!(compile_wgsl(ShaderStage::Vertex, "not wgsl", "VSMain", ShaderModel::Sm5_1).is_err());
    }
}
