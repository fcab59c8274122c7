//! Value types shared by the device contract, the command stream and the backends

use bytemuck::{Pod, Zeroable};

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8
        )
    }

    pub fn is_srgb(&self) -> bool {
        matches!(
            self,
            TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb
        )
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::R32Float
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8 => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    /// Stable numeric code, zero reserved for "no format".
    pub fn code(&self) -> u64 {
        match self {
            TextureFormat::Rgba8Unorm => 1,
            TextureFormat::Rgba8UnormSrgb => 2,
            TextureFormat::Bgra8Unorm => 3,
            TextureFormat::Bgra8UnormSrgb => 4,
            TextureFormat::Rgba16Float => 5,
            TextureFormat::Rgba32Float => 6,
            TextureFormat::R32Float => 7,
            TextureFormat::Depth32Float => 8,
            TextureFormat::Depth24PlusStencil8 => 9,
        }
    }
}

/// Number of bytes in one tightly packed layer of a texture.
pub fn layer_size_bytes(extent: Extent2D, format: TextureFormat) -> usize {
    extent.width as usize * extent.height as usize * format.bytes_per_pixel() as usize
}

/// Description of a sampled (shader-read-only) texture fed by the asset pipeline
#[derive(Debug, Clone)]
pub struct SampledTextureDesc {
    pub extent: Extent2D,
    pub format: TextureFormat,
    pub debug_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    /// Entry point tried when the debug name is not an entry point of the source.
    pub fn default_entry_point(&self) -> &'static str {
        match self {
            ShaderStage::Vertex => "VSMain",
            ShaderStage::Pixel => "PSMain",
        }
    }
}

/// Shader model a shader is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShaderModel {
    #[default]
    Sm5_1,
    /// Required for view instancing and render-target-array-index output
    Sm6_1,
}

/// Primitive class a pipeline is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopologyType {
    Point,
    Line,
    #[default]
    Triangle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveTopology {
    pub fn topology_type(&self) -> PrimitiveTopologyType {
        match self {
            PrimitiveTopology::PointList => PrimitiveTopologyType::Point,
            PrimitiveTopology::LineList | PrimitiveTopology::LineStrip => {
                PrimitiveTopologyType::Line
            }
            PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip => {
                PrimitiveTopologyType::Triangle
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    Clockwise,
    #[default]
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RasterizerState {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test_enable: bool,
    pub write_enable: bool,
    pub compare_op: CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enable: true,
            write_enable: true,
            compare_op: CompareOp::Less,
        }
    }
}

/// Alpha blending (source alpha over inverse source alpha) on or off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendState {
    pub enable: bool,
}

/// Fixed-function state folded into the pipeline state object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GraphicsState {
    pub rasterizer: RasterizerState,
    pub depth: DepthState,
    pub blend: BlendState,
}

impl GraphicsState {
    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.rasterizer.cull_mode = cull_mode;
        self
    }

    pub fn with_depth(mut self, test_enable: bool, write_enable: bool, compare_op: CompareOp) -> Self {
        self.depth = DepthState {
            test_enable,
            write_enable,
            compare_op,
        };
        self
    }

    pub fn with_blend(mut self, enable: bool) -> Self {
        self.blend.enable = enable;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexType {
    #[default]
    Uint16,
    Uint32,
}

impl IndexType {
    pub fn size_bytes(&self) -> u64 {
        match self {
            IndexType::Uint16 => 2,
            IndexType::Uint32 => 4,
        }
    }
}

/// How a buffer is bound by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferBindFlag {
    #[default]
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    /// Read by shaders through a structured-buffer view
    StructuredBuffer,
}

/// Update frequency hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferUsageHint {
    #[default]
    Static,
    Dynamic,
    Stream,
}

#[derive(Debug, Clone, Default)]
pub struct BufferDesc {
    pub bind_flag: BufferBindFlag,
    pub usage: BufferUsageHint,
    pub size_bytes: u64,
    /// Element stride, only meaningful for structured buffers
    pub structured_stride_bytes: u32,
    pub debug_name: String,
}

impl BufferDesc {
    pub fn new(bind_flag: BufferBindFlag, size_bytes: u64) -> Self {
        Self {
            bind_flag,
            size_bytes,
            ..Default::default()
        }
    }

    pub fn structured(size_bytes: u64, stride_bytes: u32) -> Self {
        Self {
            bind_flag: BufferBindFlag::StructuredBuffer,
            size_bytes,
            structured_stride_bytes: stride_bytes,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: BufferUsageHint) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    Normal,
    Tangent,
    TexCoord,
    Color,
}

impl VertexSemantic {
    pub fn name(&self) -> &'static str {
        match self {
            VertexSemantic::Position => "POSITION",
            VertexSemantic::Normal => "NORMAL",
            VertexSemantic::Tangent => "TANGENT",
            VertexSemantic::TexCoord => "TEXCOORD",
            VertexSemantic::Color => "COLOR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Unorm8x4,
    Uint32,
}

impl VertexFormat {
    pub fn size_bytes(&self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Unorm8x4 | VertexFormat::Uint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// One vertex attribute. Attributes on input slot 0 advance per vertex,
/// attributes on any other slot advance once per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub semantic: VertexSemantic,
    pub semantic_index: u32,
    pub format: VertexFormat,
    pub input_slot: u32,
    pub offset_bytes: u32,
}

impl VertexAttribute {
    pub fn new(semantic: VertexSemantic, format: VertexFormat, offset_bytes: u32) -> Self {
        Self {
            semantic,
            semantic_index: 0,
            format,
            input_slot: 0,
            offset_bytes,
        }
    }

    pub fn per_instance(mut self, input_slot: u32) -> Self {
        self.input_slot = input_slot;
        self
    }

    pub fn with_semantic_index(mut self, index: u32) -> Self {
        self.semantic_index = index;
        self
    }

    pub fn is_per_instance(&self) -> bool {
        self.input_slot != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputLayoutDesc {
    pub attributes: Vec<VertexAttribute>,
    /// Stride of slot 0 when not given at bind time
    pub stride_bytes: u32,
}

impl InputLayoutDesc {
    /// Number of vertex-buffer slots the layout reads from.
    pub fn slot_count(&self) -> u32 {
        self.attributes
            .iter()
            .map(|a| a.input_slot + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Which part of a color texture a framebuffer renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttachmentLayout {
    /// The whole 2D texture
    #[default]
    Whole,
    /// One face (0..6) of a cube
    CubeFace(u32),
    /// All six faces of a cube as a layered target
    CubeAllFaces,
}

/// Clear behavior of a pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearDesc {
    pub clear_color: bool,
    pub clear_depth: bool,
    pub color: [f32; 4],
    pub depth: f32,
}

impl ClearDesc {
    pub fn color(color: [f32; 4]) -> Self {
        Self {
            clear_color: true,
            clear_depth: true,
            color,
            depth: 1.0,
        }
    }

    pub fn depth_only(depth: f32) -> Self {
        Self {
            clear_color: false,
            clear_depth: true,
            color: [0.0; 4],
            depth,
        }
    }

    pub fn load() -> Self {
        Self {
            clear_color: false,
            clear_depth: false,
            color: [0.0; 4],
            depth: 1.0,
        }
    }
}

impl Default for ClearDesc {
    fn default() -> Self {
        Self::color([0.0, 0.0, 0.0, 1.0])
    }
}

/// Optional features probed at device creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities {
    /// Shader model 6.1 compilation
    pub shader_model_6_1: bool,
    /// Multi-view pipelines (one draw broadcast to several array layers)
    pub view_instancing: bool,
    /// Render-target array index writable from any shader stage
    pub layered_rendering: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            shader_model_6_1: true,
            view_instancing: true,
            layered_rendering: true,
        }
    }
}

/// Live object counts of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCounts {
    pub textures: usize,
    pub buffers: usize,
    pub shaders: usize,
    pub pipelines: usize,
    pub input_layouts: usize,
    pub framebuffers: usize,
    pub fences: usize,
}

/// Viewport rectangle with depth range, as consumed by per-draw constants helpers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_rect(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}
