//! Renderer module interface.

use color::{Rgba, Rgba8};
use oneshot::Sender;
use static_assertions::const_assert;
use zerocopy::{Immutable, IntoBytes};

pub use oneshot;

/// Identifies a color render target owned by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

/// Identifies a depth buffer owned by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepthId(pub u32);

/// Identifies a texture owned by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// A rectangle in native (unscaled) target pixels. `x1` and `y1` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Smallest rectangle containing both `self` and `other`.
    pub fn union(self, other: Self) -> Self {
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

/// A vertex as consumed by the renderer. Triangle and line positions are in clip space, rectangle
/// positions in native target pixels with `w` set to 1. Texture coordinates are in texels relative
/// to the bound tile.
#[derive(Debug, Clone, Copy, PartialEq, Default, Immutable, IntoBytes)]
#[repr(C)]
pub struct DrawVertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
    pub s: f32,
    pub t: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 320.0,
            height: 240.0,
            near: 0.0,
            far: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cull {
    #[default]
    None,
    Front,
    Back,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthState {
    pub compare: bool,
    pub update: bool,
    /// Raw Z mode of the blender: opaque, interpenetrating, transparent or decal.
    pub mode: u8,
    /// Use `prim_z` instead of per vertex depth.
    pub source_prim: bool,
    pub prim_z: f32,
    pub buffer: Option<DepthId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSource {
    Cached(TextureId),
    /// A render target sampled as a texture.
    Target(TargetId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureBinding {
    pub source: TextureSource,
    pub width: u32,
    pub height: u32,
    pub clamp_s: bool,
    pub clamp_t: bool,
    pub mirror_s: bool,
    pub mirror_t: bool,
    pub mask_s: u8,
    pub mask_t: u8,
    pub bilinear: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChromaKey {
    pub center: Rgba,
    pub scale: Rgba,
    pub width: [f32; 3],
}

/// Lights in eye space, for renderers lighting vertices themselves. Vertex colors then carry
/// eye space normals.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HardwareLights {
    pub count: u8,
    pub colors: [[f32; 3]; 8],
    pub directions: [[f32; 3]; 8],
    pub ambient: [f32; 3],
}

/// Every piece of pipeline state a draw depends on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DrawState {
    pub target: Option<TargetId>,
    /// Raw color combiner mux.
    pub combine: u64,
    /// Raw other mode, high word in the upper 32 bits.
    pub other_mode: u64,
    pub prim: Rgba,
    pub prim_min_level: f32,
    pub prim_lod_fraction: f32,
    pub env: Rgba,
    pub blend: Rgba,
    pub fog: Rgba,
    pub fill: Rgba,
    pub key: ChromaKey,
    pub convert: [i32; 6],
    pub textures: [Option<TextureBinding>; 2],
    pub noise: Option<TextureId>,
    pub viewport: Viewport,
    pub scissor: Rect,
    pub cull: Cull,
    pub depth: DepthState,
    pub fog_enabled: bool,
    pub flat_shading: bool,
    pub lights: Option<HardwareLights>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriangleDraw {
    pub state: DrawState,
    pub vertices: Vec<DrawVertex>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RectDraw {
    pub state: DrawState,
    /// Quads in the order top-left, top-right, bottom-left, bottom-right.
    pub quads: Vec<[DrawVertex; 4]>,
    /// When set, the renderer clears a one pixel border around this area after drawing, removing
    /// filtering seams between the batched rectangles.
    pub seam_clear: Option<Rect>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineDraw {
    pub state: DrawState,
    pub vertices: Vec<DrawVertex>,
    pub width: f32,
}

/// Optional renderer features. Missing features make the core degrade instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub multisampling: bool,
    pub depth_textures: bool,
    pub max_target_width: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            multisampling: true,
            depth_textures: true,
            max_target_width: 8192,
        }
    }
}

pub enum Action {
    CreateTarget {
        id: TargetId,
        width: u32,
        height: u32,
        scale: f32,
        samples: u8,
    },
    DeleteTarget(TargetId),
    CreateDepth {
        id: DepthId,
        width: u32,
        height: u32,
    },
    DeleteDepth(DepthId),
    AttachDepth {
        target: TargetId,
        depth: Option<DepthId>,
    },
    BindTarget(Option<TargetId>),
    ClearColor {
        target: TargetId,
        color: Rgba,
        rect: Rect,
    },
    ClearDepth {
        depth: DepthId,
        rect: Rect,
    },
    DrawTriangles(Box<TriangleDraw>),
    DrawRects(Box<RectDraw>),
    DrawLines(Box<LineDraw>),
    UploadTexture {
        id: TextureId,
        width: u32,
        height: u32,
        data: Vec<Rgba8>,
    },
    DeleteTexture(TextureId),
    /// Overwrites the contents of a target with pixels coming from guest memory.
    UploadColor {
        target: TargetId,
        width: u32,
        height: u32,
        data: Vec<Rgba8>,
    },
    /// Resolves a multisampled target into its sampleable texture.
    Resolve(TargetId),
    /// Copies a depth buffer into a texture that can be read while the buffer is written.
    CopyDepth(DepthId),
    ReadColor {
        target: TargetId,
        width: u32,
        height: u32,
        response: Sender<Vec<Rgba8>>,
    },
    ReadDepth {
        depth: DepthId,
        width: u32,
        height: u32,
        response: Sender<Vec<f32>>,
    },
    Present {
        target: Option<TargetId>,
        width: u32,
        height: u32,
    },
}

const_assert!(size_of::<Action>() <= 64);

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateTarget {
                id, width, height, ..
            } => write!(f, "CreateTarget({id:?}, {width}x{height})"),
            Self::DeleteTarget(id) => write!(f, "DeleteTarget({id:?})"),
            Self::CreateDepth { id, width, height } => {
                write!(f, "CreateDepth({id:?}, {width}x{height})")
            }
            Self::DeleteDepth(id) => write!(f, "DeleteDepth({id:?})"),
            Self::AttachDepth { target, depth } => write!(f, "AttachDepth({target:?}, {depth:?})"),
            Self::BindTarget(id) => write!(f, "BindTarget({id:?})"),
            Self::ClearColor { target, color, .. } => write!(f, "ClearColor({target:?}, {color:?})"),
            Self::ClearDepth { depth, .. } => write!(f, "ClearDepth({depth:?})"),
            Self::DrawTriangles(draw) => write!(f, "DrawTriangles({})", draw.vertices.len() / 3),
            Self::DrawRects(draw) => write!(f, "DrawRects({})", draw.quads.len()),
            Self::DrawLines(draw) => write!(f, "DrawLines({})", draw.vertices.len() / 2),
            Self::UploadTexture {
                id, width, height, ..
            } => write!(f, "UploadTexture({id:?}, {width}x{height})"),
            Self::DeleteTexture(id) => write!(f, "DeleteTexture({id:?})"),
            Self::UploadColor { target, .. } => write!(f, "UploadColor({target:?})"),
            Self::Resolve(id) => write!(f, "Resolve({id:?})"),
            Self::CopyDepth(id) => write!(f, "CopyDepth({id:?})"),
            Self::ReadColor { target, .. } => write!(f, "ReadColor({target:?})"),
            Self::ReadDepth { depth, .. } => write!(f, "ReadDepth({depth:?})"),
            Self::Present { target, .. } => write!(f, "Present({target:?})"),
        }
    }
}

pub trait RenderModule: Send {
    fn exec(&mut self, action: Action);

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// An implementation of [`RenderModule`] that does nothing.
#[derive(Debug, Clone, Copy)]
pub struct NopRenderModule;

impl RenderModule for NopRenderModule {
    fn exec(&mut self, _: Action) {}
}
