// Pipeline creation
//
// Graphics pipelines target dynamic rendering (no render pass objects) with
// viewport and scissor as dynamic state. A pipeline with a compute stage is
// built as a compute pipeline.

use anyhow::{bail, Context, Result};
use ash::vk;

use crate::backend::PipelineBuild;
use crate::resources::{NativePipeline, PipelineCreation};

const ENTRY_POINT: &std::ffi::CStr = c"main";

pub(super) fn create_pipeline(
    device: &ash::Device,
    build: &PipelineBuild<'_>,
) -> Result<NativePipeline> {
    let compute = build
        .modules
        .iter()
        .find(|(stage, _)| *stage == vk::ShaderStageFlags::COMPUTE);

    let push_constant_stages = if compute.is_some() {
        vk::ShaderStageFlags::COMPUTE
    } else {
        vk::ShaderStageFlags::ALL_GRAPHICS
    };
    let layout = create_layout(device, build, push_constant_stages)?;

    let created = match compute {
        Some(&(_, module)) => create_compute(device, layout, module),
        None => create_graphics(device, layout, build),
    };

    match created {
        Ok(pipeline) => Ok(NativePipeline {
            pipeline,
            layout,
            bind_point: if compute.is_some() {
                vk::PipelineBindPoint::COMPUTE
            } else {
                vk::PipelineBindPoint::GRAPHICS
            },
            push_constant_stages,
        }),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(e).with_context(|| format!("Failed to create pipeline '{}'", build.creation.name))
        }
    }
}

fn create_layout(
    device: &ash::Device,
    build: &PipelineBuild<'_>,
    stages: vk::ShaderStageFlags,
) -> Result<vk::PipelineLayout> {
    let size = build.creation.push_constant_size;
    let push_constant_ranges = [vk::PushConstantRange::builder()
        .stage_flags(stages)
        .offset(0)
        .size(size)
        .build()];

    let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(build.set_layouts);
    if size > 0 {
        layout_info = layout_info.push_constant_ranges(&push_constant_ranges);
    }

    unsafe { device.create_pipeline_layout(&layout_info, None) }.context("Failed to create pipeline layout")
}

fn create_compute(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    module: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(ENTRY_POINT)
        .build();

    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout)
        .build();

    let pipelines = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) }
        .map_err(|(_, e)| e)
        .context("Failed to create compute pipeline")?;

    pipelines.first().copied().context("No compute pipeline returned")
}

fn create_graphics(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    build: &PipelineBuild<'_>,
) -> Result<vk::Pipeline> {
    let creation = build.creation;
    if creation.color_formats.is_empty() && creation.depth_format.is_none() {
        bail!("graphics pipeline without color or depth attachments");
    }

    let shader_stages: Vec<_> = build
        .modules
        .iter()
        .map(|&(stage, module)| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(stage)
                .module(module)
                .name(ENTRY_POINT)
                .build()
        })
        .collect();

    // Vertex input
    let (bindings, attributes) = vertex_input(creation);
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(creation.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor are set while recording
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(creation.rasterization.polygon_mode)
        .line_width(1.0)
        .cull_mode(creation.rasterization.cull_mode)
        .front_face(creation.rasterization.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(creation.depth_stencil.depth_test)
        .depth_write_enable(creation.depth_stencil.depth_write)
        .depth_compare_op(creation.depth_stencil.compare_op)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments: Vec<_> = creation
        .blend
        .iter()
        .map(|blend| {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(blend.enabled)
                .src_color_blend_factor(blend.src_color)
                .dst_color_blend_factor(blend.dst_color)
                .color_blend_op(blend.color_op)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build()
        })
        .collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&creation.color_formats)
        .depth_attachment_format(creation.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;

    pipelines.first().copied().context("No graphics pipeline returned")
}

fn vertex_input(
    creation: &PipelineCreation<'_>,
) -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
    let bindings = creation
        .vertex_input
        .streams
        .iter()
        .map(|stream| {
            vk::VertexInputBindingDescription::builder()
                .binding(stream.binding)
                .stride(stream.stride)
                .input_rate(stream.input_rate)
                .build()
        })
        .collect();

    let attributes = creation
        .vertex_input
        .attributes
        .iter()
        .map(|attribute| {
            vk::VertexInputAttributeDescription::builder()
                .binding(attribute.binding)
                .location(attribute.location)
                .format(attribute.format)
                .offset(attribute.offset)
                .build()
        })
        .collect();

    (bindings, attributes)
}
