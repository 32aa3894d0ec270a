// Resource kinds, creation descriptors and the per-kind hot/cold records
//
// Creation descriptors are plain structs with chained setters; the device
// turns them into native objects (hot half) plus engine metadata (cold half)
// stored side by side in one `ResourcePool` per kind.

use ash::vk;
use bitflags::bitflags;
use std::ptr::NonNull;

use crate::pool::{Handle, Kind};
use crate::shader::CompileOptions;

macro_rules! resource_kinds {
    ($($kind:ident => $alias:ident, $name:literal;)*) => {
        $(
            pub enum $kind {}
            impl Kind for $kind {
                const NAME: &'static str = $name;
            }
            pub type $alias = Handle<$kind>;
        )*
    };
}

resource_kinds! {
    BufferKind => BufferHandle, "Buffer";
    TextureKind => TextureHandle, "Texture";
    SamplerKind => SamplerHandle, "Sampler";
    PipelineKind => PipelineHandle, "Pipeline";
    ShaderStateKind => ShaderStateHandle, "ShaderState";
    DescriptorSetLayoutKind => DescriptorSetLayoutHandle, "DescriptorSetLayout";
    DescriptorSetKind => DescriptorSetHandle, "DescriptorSet";
}

// =============================================================================
// QUEUES & STATES
// =============================================================================

/// Hardware queue a command buffer is recorded for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QueueKind {
    #[default]
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const COUNT: usize = 3;
    pub const ALL: [QueueKind; Self::COUNT] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Compute => "compute",
            QueueKind::Transfer => "transfer",
        }
    }

    /// Pipeline stages a queue of this kind is allowed to reference
    fn supported_stages(self) -> vk::PipelineStageFlags2 {
        let common = vk::PipelineStageFlags2::TOP_OF_PIPE
            | vk::PipelineStageFlags2::BOTTOM_OF_PIPE
            | vk::PipelineStageFlags2::ALL_TRANSFER
            | vk::PipelineStageFlags2::ALL_COMMANDS;
        match self {
            QueueKind::Graphics => vk::PipelineStageFlags2::from_raw(!0),
            QueueKind::Compute => {
                common | vk::PipelineStageFlags2::COMPUTE_SHADER | vk::PipelineStageFlags2::DRAW_INDIRECT
            }
            QueueKind::Transfer => common,
        }
    }
}

/// Access/layout class a resource is currently synchronized for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceState {
    #[default]
    Undefined,
    VertexBuffer,
    IndexBuffer,
    UniformBuffer,
    IndirectArgument,
    RenderTarget,
    DepthWrite,
    DepthRead,
    ShaderResource,
    UnorderedAccess,
    CopySource,
    CopyDest,
    Present,
    General,
}

impl ResourceState {
    pub fn image_layout(self) -> vk::ImageLayout {
        match self {
            ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
            ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ResourceState::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ResourceState::DepthRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ResourceState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            ResourceState::UnorderedAccess | ResourceState::General => vk::ImageLayout::GENERAL,
            // Buffer-only states never reach an image barrier
            ResourceState::VertexBuffer
            | ResourceState::IndexBuffer
            | ResourceState::UniformBuffer
            | ResourceState::IndirectArgument => vk::ImageLayout::GENERAL,
        }
    }

    pub fn access_mask(self) -> vk::AccessFlags2 {
        match self {
            ResourceState::Undefined | ResourceState::Present => vk::AccessFlags2::NONE,
            ResourceState::VertexBuffer => vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
            ResourceState::IndexBuffer => vk::AccessFlags2::INDEX_READ,
            ResourceState::UniformBuffer => vk::AccessFlags2::UNIFORM_READ,
            ResourceState::IndirectArgument => vk::AccessFlags2::INDIRECT_COMMAND_READ,
            ResourceState::RenderTarget => {
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            }
            ResourceState::DepthWrite => {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            ResourceState::DepthRead => vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ResourceState::ShaderResource => vk::AccessFlags2::SHADER_READ,
            ResourceState::UnorderedAccess => vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            ResourceState::CopySource => vk::AccessFlags2::TRANSFER_READ,
            ResourceState::CopyDest => vk::AccessFlags2::TRANSFER_WRITE,
            ResourceState::General => vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        }
    }

    /// Stages touching a resource in this state, clamped to what `queue` supports
    pub fn stage_mask(self, queue: QueueKind) -> vk::PipelineStageFlags2 {
        let stages = match self {
            ResourceState::Undefined => vk::PipelineStageFlags2::TOP_OF_PIPE,
            ResourceState::Present => vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            ResourceState::VertexBuffer => vk::PipelineStageFlags2::VERTEX_INPUT,
            ResourceState::IndexBuffer => vk::PipelineStageFlags2::VERTEX_INPUT,
            ResourceState::UniformBuffer => {
                vk::PipelineStageFlags2::VERTEX_SHADER
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::COMPUTE_SHADER
            }
            ResourceState::IndirectArgument => vk::PipelineStageFlags2::DRAW_INDIRECT,
            ResourceState::RenderTarget => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ResourceState::DepthWrite | ResourceState::DepthRead => {
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
            }
            ResourceState::ShaderResource | ResourceState::UnorderedAccess => {
                vk::PipelineStageFlags2::VERTEX_SHADER
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::COMPUTE_SHADER
            }
            ResourceState::CopySource | ResourceState::CopyDest => vk::PipelineStageFlags2::ALL_TRANSFER,
            ResourceState::General => vk::PipelineStageFlags2::ALL_COMMANDS,
        };

        let clamped = stages & queue.supported_stages();
        if clamped.is_empty() {
            vk::PipelineStageFlags2::ALL_COMMANDS
        } else {
            clamped
        }
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            ResourceState::RenderTarget
                | ResourceState::DepthWrite
                | ResourceState::UnorderedAccess
                | ResourceState::CopyDest
                | ResourceState::General
        )
    }
}

// =============================================================================
// BUFFERS
// =============================================================================

/// Where a buffer lives and how the CPU reaches it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceUsage {
    /// Device local; initial data goes through the transfer queue
    #[default]
    Immutable,
    /// No native object; every map sub-allocates from the per-frame dynamic ring
    Dynamic,
    /// Host visible and persistently mapped
    Stream,
}

#[derive(Clone, Debug, Default)]
pub struct BufferCreation<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub residency: ResourceUsage,
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> BufferCreation<'a> {
    pub fn new(
        name: &'a str,
        usage: vk::BufferUsageFlags,
        residency: ResourceUsage,
        size: u64,
    ) -> Self {
        Self {
            name,
            size,
            usage,
            residency,
            initial_data: None,
        }
    }

    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.initial_data = Some(data);
        self
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NativeBuffer {
    pub buffer: vk::Buffer,
    /// Base of the persistent mapping, host-visible buffers only
    pub mapped: Option<NonNull<u8>>,
}

#[derive(Clone, Debug, Default)]
pub struct BufferDescription {
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub residency: ResourceUsage,
    pub state: ResourceState,
    pub queue_owner: QueueKind,
    /// Set on dynamic buffers: the ring buffer they alias
    pub parent_buffer: Option<BufferHandle>,
    /// Offset of the last dynamic allocation inside the parent
    pub global_offset: u64,
}

// =============================================================================
// TEXTURES
// =============================================================================

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TextureFlags: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const STORAGE = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextureType {
    #[default]
    Texture2D,
    Texture2DArray,
    Texture3D,
    TextureCube,
}

impl TextureType {
    pub fn image_type(self) -> vk::ImageType {
        match self {
            TextureType::Texture3D => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        }
    }

    pub fn view_type(self) -> vk::ImageViewType {
        match self {
            TextureType::Texture2D => vk::ImageViewType::TYPE_2D,
            TextureType::Texture2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
            TextureType::Texture3D => vk::ImageViewType::TYPE_3D,
            TextureType::TextureCube => vk::ImageViewType::CUBE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

#[derive(Clone, Debug)]
pub struct TextureCreation<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub texture_type: TextureType,
    pub flags: TextureFlags,
    pub initial_data: Option<&'a [u8]>,
    /// Share the memory of an existing texture instead of allocating
    pub alias: Option<TextureHandle>,
    /// Sampler written next to the image in the bindless table
    pub sampler: Option<SamplerHandle>,
}

impl Default for TextureCreation<'_> {
    fn default() -> Self {
        Self {
            name: "",
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            texture_type: TextureType::Texture2D,
            flags: TextureFlags::SAMPLED,
            initial_data: None,
            alias: None,
            sampler: None,
        }
    }
}

impl<'a> TextureCreation<'a> {
    pub fn new(name: &'a str, width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            name,
            width,
            height,
            format,
            ..Default::default()
        }
    }

    pub fn flags(mut self, flags: TextureFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn layers(mut self, texture_type: TextureType, array_layers: u32) -> Self {
        self.texture_type = texture_type;
        self.array_layers = array_layers.max(1);
        self
    }

    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn alias(mut self, texture: TextureHandle) -> Self {
        self.alias = Some(texture);
        self
    }

    pub fn sampler(mut self, sampler: SamplerHandle) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub(crate) fn image_usage(&self) -> vk::ImageUsageFlags {
        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if self.flags.contains(TextureFlags::SAMPLED) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.flags.contains(TextureFlags::STORAGE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        if self.flags.contains(TextureFlags::RENDER_TARGET) {
            if is_depth_format(self.format) {
                usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            } else {
                usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
        }
        usage
    }
}

/// A view onto a subresource range of an existing texture
#[derive(Clone, Debug)]
pub struct TextureViewCreation<'a> {
    pub name: &'a str,
    pub parent: TextureHandle,
    pub texture_type: TextureType,
    pub range: SubresourceRange,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NativeTexture {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

#[derive(Clone, Debug, Default)]
pub struct TextureDescription {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub texture_type: TextureType,
    pub flags: TextureFlags,
    pub range: SubresourceRange,
    pub state: ResourceState,
    pub queue_owner: QueueKind,
    pub sampler: Option<SamplerHandle>,
    /// Non-owning: set on views, the texture owning the image
    pub parent_texture: Option<TextureHandle>,
    /// Non-owning: set on aliases, the texture owning the memory
    pub alias_texture: Option<TextureHandle>,
    /// Image owned by the swapchain, never destroyed through the device
    pub swapchain: bool,
    /// Currently referenced by the bindless table
    pub bindless: bool,
}

impl TextureDescription {
    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }

    #[inline]
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Bytes per texel for the formats the upload path understands
pub fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => Some(1),
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

// =============================================================================
// SAMPLERS
// =============================================================================

#[derive(Clone, Debug)]
pub struct SamplerCreation<'a> {
    pub name: &'a str,
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mip_filter: vk::SamplerMipmapMode,
    pub address_u: vk::SamplerAddressMode,
    pub address_v: vk::SamplerAddressMode,
    pub address_w: vk::SamplerAddressMode,
}

impl Default for SamplerCreation<'_> {
    fn default() -> Self {
        Self {
            name: "",
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mip_filter: vk::SamplerMipmapMode::LINEAR,
            address_u: vk::SamplerAddressMode::REPEAT,
            address_v: vk::SamplerAddressMode::REPEAT,
            address_w: vk::SamplerAddressMode::REPEAT,
        }
    }
}

impl<'a> SamplerCreation<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn filters(mut self, min: vk::Filter, mag: vk::Filter, mip: vk::SamplerMipmapMode) -> Self {
        self.min_filter = min;
        self.mag_filter = mag;
        self.mip_filter = mip;
        self
    }

    pub fn address(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_u = mode;
        self.address_v = mode;
        self.address_w = mode;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct SamplerDescription {
    pub name: String,
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mip_filter: vk::SamplerMipmapMode,
    pub address_u: vk::SamplerAddressMode,
    pub address_v: vk::SamplerAddressMode,
    pub address_w: vk::SamplerAddressMode,
}

// =============================================================================
// SHADER STATES
// =============================================================================

#[derive(Clone, Debug)]
pub enum ShaderCode {
    /// Pre-compiled SPIR-V words
    Spirv(Vec<u32>),
    /// GLSL source handed to the device's shader compiler
    Glsl { source: String, options: CompileOptions },
}

#[derive(Clone, Debug)]
pub struct ShaderStageCreation {
    pub stage: vk::ShaderStageFlags,
    pub code: ShaderCode,
}

#[derive(Clone, Debug, Default)]
pub struct ShaderStateCreation<'a> {
    pub name: &'a str,
    pub stages: Vec<ShaderStageCreation>,
}

impl<'a> ShaderStateCreation<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            stages: Vec::new(),
        }
    }

    pub fn spirv(mut self, stage: vk::ShaderStageFlags, words: Vec<u32>) -> Self {
        self.stages.push(ShaderStageCreation {
            stage,
            code: ShaderCode::Spirv(words),
        });
        self
    }

    pub fn glsl(
        mut self,
        stage: vk::ShaderStageFlags,
        source: impl Into<String>,
        options: CompileOptions,
    ) -> Self {
        self.stages.push(ShaderStageCreation {
            stage,
            code: ShaderCode::Glsl {
                source: source.into(),
                options,
            },
        });
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct NativeShaderState {
    pub modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
}

#[derive(Clone, Debug, Default)]
pub struct ShaderStateDescription {
    pub name: String,
    pub graphics: bool,
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Clone, Debug, Default)]
pub struct DescriptorSetLayoutCreation<'a> {
    pub name: &'a str,
    pub bindings: Vec<DescriptorBinding>,
}

impl<'a> DescriptorSetLayoutCreation<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            bindings: Vec::new(),
        }
    }

    pub fn binding(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            ty,
            count: 1,
            stages,
        });
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct DescriptorSetLayoutDescription {
    pub name: String,
    pub bindings: Vec<DescriptorBinding>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer(BufferHandle),
    Texture {
        texture: TextureHandle,
        sampler: Option<SamplerHandle>,
    },
    StorageTexture(TextureHandle),
}

#[derive(Clone, Debug)]
pub struct DescriptorSetCreation<'a> {
    pub name: &'a str,
    pub layout: DescriptorSetLayoutHandle,
    pub resources: Vec<(u32, DescriptorResource)>,
}

impl<'a> DescriptorSetCreation<'a> {
    pub fn new(name: &'a str, layout: DescriptorSetLayoutHandle) -> Self {
        Self {
            name,
            layout,
            resources: Vec::new(),
        }
    }

    pub fn buffer(mut self, binding: u32, buffer: BufferHandle) -> Self {
        self.resources.push((binding, DescriptorResource::Buffer(buffer)));
        self
    }

    pub fn texture(
        mut self,
        binding: u32,
        texture: TextureHandle,
        sampler: Option<SamplerHandle>,
    ) -> Self {
        self.resources
            .push((binding, DescriptorResource::Texture { texture, sampler }));
        self
    }

    pub fn storage_texture(mut self, binding: u32, texture: TextureHandle) -> Self {
        self.resources.push((binding, DescriptorResource::StorageTexture(texture)));
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct DescriptorSetDescription {
    pub name: String,
    pub layout: DescriptorSetLayoutHandle,
    pub resources: Vec<(u32, DescriptorResource)>,
}

// =============================================================================
// PIPELINES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexStream {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub offset: u32,
    pub format: vk::Format,
}

#[derive(Clone, Debug, Default)]
pub struct VertexInput {
    pub streams: Vec<VertexStream>,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Clone, Copy, Debug)]
pub struct RasterizationState {
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub polygon_mode: vk::PolygonMode,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            polygon_mode: vk::PolygonMode::FILL,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BlendState {
    pub enabled: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
}

impl BlendState {
    pub fn alpha() -> Self {
        Self {
            enabled: true,
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_op: vk::BlendOp::ADD,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineCreation<'a> {
    pub name: &'a str,
    pub shaders: ShaderStateCreation<'a>,
    /// User layouts bound from set 1; set 0 is always the bindless table
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub vertex_input: VertexInput,
    pub topology: vk::PrimitiveTopology,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub blend: Vec<BlendState>,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub push_constant_size: u32,
}

impl<'a> PipelineCreation<'a> {
    pub fn new(name: &'a str, shaders: ShaderStateCreation<'a>) -> Self {
        Self {
            name,
            shaders,
            set_layouts: Vec::new(),
            vertex_input: VertexInput::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            rasterization: RasterizationState::default(),
            depth_stencil: DepthStencilState::default(),
            blend: Vec::new(),
            color_formats: Vec::new(),
            depth_format: None,
            push_constant_size: 0,
        }
    }

    pub fn color_format(mut self, format: vk::Format, blend: BlendState) -> Self {
        self.color_formats.push(format);
        self.blend.push(blend);
        self
    }

    pub fn depth(mut self, format: vk::Format, state: DepthStencilState) -> Self {
        self.depth_format = Some(format);
        self.depth_stencil = state;
        self
    }

    pub fn set_layout(mut self, layout: DescriptorSetLayoutHandle) -> Self {
        self.set_layouts.push(layout);
        self
    }

    pub fn push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NativePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub push_constant_stages: vk::ShaderStageFlags,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineDescription {
    pub name: String,
    pub shader_state: ShaderStateHandle,
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub graphics: bool,
}

// =============================================================================
// RECORDING DESCRIPTORS
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadOp {
    #[default]
    Load,
    Clear,
    DontCare,
}

impl LoadOp {
    pub fn vk(self) -> vk::AttachmentLoadOp {
        match self {
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
            LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
            LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ColorTarget {
    pub texture: TextureHandle,
    pub load_op: LoadOp,
    pub clear_color: [f32; 4],
}

impl ColorTarget {
    pub fn clear(texture: TextureHandle, clear_color: [f32; 4]) -> Self {
        Self {
            texture,
            load_op: LoadOp::Clear,
            clear_color,
        }
    }

    pub fn load(texture: TextureHandle) -> Self {
        Self {
            texture,
            load_op: LoadOp::Load,
            clear_color: [0.0; 4],
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DepthTarget {
    pub texture: TextureHandle,
    pub load_op: LoadOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl DepthTarget {
    pub fn clear(texture: TextureHandle, depth: f32) -> Self {
        Self {
            texture,
            load_op: LoadOp::Clear,
            clear_depth: depth,
            clear_stencil: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassDesc {
    pub color_targets: Vec<ColorTarget>,
    pub depth_target: Option<DepthTarget>,
}

impl RenderPassDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color(mut self, target: ColorTarget) -> Self {
        self.color_targets.push(target);
        self
    }

    pub fn depth(mut self, target: DepthTarget) -> Self {
        self.depth_target = Some(target);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub texture: TextureHandle,
    pub new_state: ResourceState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub new_state: ResourceState,
}

/// Image and buffer transitions submitted as one pipeline barrier
#[derive(Clone, Debug, Default)]
pub struct ExecutionBarrier {
    pub images: Vec<ImageBarrier>,
    pub buffers: Vec<BufferBarrier>,
}

impl ExecutionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(mut self, texture: TextureHandle, new_state: ResourceState) -> Self {
        self.images.push(ImageBarrier { texture, new_state });
        self
    }

    pub fn buffer(mut self, buffer: BufferHandle, new_state: ResourceState) -> Self {
        self.buffers.push(BufferBarrier { buffer, new_state });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty()
    }
}
