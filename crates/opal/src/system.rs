//! State of the graphics pipeline.

pub mod depth;
pub mod dlist;
pub mod drawer;
pub mod framebuffer;
pub mod gbi;
pub mod hash;
pub mod math;
pub mod mem;
pub mod noise;
pub mod rdp;
pub mod rsp;
pub mod snapshot;
pub mod texcache;
pub mod texrect;
pub mod vi;

use crate::{
    config::Config,
    modules::render::RenderModule,
    system::{
        depth::DepthBuffers, dlist::Interpreter, drawer::Drawer, framebuffer::FrameBuffers,
        hash::HashEngine, math::Kernel, mem::Rdram, texcache::TextureCache,
    },
};

/// System state.
pub struct System {
    /// Configuration. Only ever read by the pipeline.
    pub config: Config,
    /// Guest memory.
    pub mem: Rdram,
    /// Geometry processor state.
    pub rsp: rsp::State,
    /// Rasterizer state.
    pub rdp: rdp::State,
    /// The display list interpreter.
    pub dlist: Interpreter,
    /// Pending draws.
    pub drawer: Drawer,
    /// Render targets standing in for color images.
    pub framebuffers: FrameBuffers,
    /// Depth buffers standing in for depth images.
    pub depth_buffers: DepthBuffers,
    pub textures: TextureCache,
    /// Video interface state.
    pub vi: vi::State,
    pub perf: vi::PerfCounters,
    /// Numeric kernel, resolved once.
    pub kernel: &'static dyn Kernel,
    /// Fingerprint engine, resolved once.
    pub hasher: Box<dyn HashEngine>,
    pub render: Box<dyn RenderModule>,
}

impl System {
    pub fn new(config: Config, mem: Rdram, render: Box<dyn RenderModule>) -> Self {
        let kernel = math::select(config.backends.math);
        let hasher = hash::select(config.backends.hash);

        let mut system = Self {
            config,
            mem,
            rsp: rsp::State::default(),
            rdp: rdp::State::default(),
            dlist: Interpreter::default(),
            drawer: Drawer::default(),
            framebuffers: FrameBuffers::default(),
            depth_buffers: DepthBuffers::default(),
            textures: TextureCache::default(),
            vi: vi::State::default(),
            perf: vi::PerfCounters::default(),
            kernel,
            hasher,
            render,
        };

        noise::init(&mut system);
        system
    }
}
