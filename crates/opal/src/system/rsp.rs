//! Geometry processor (RSP) state and the handlers of its state commands.
//!
//! Matrices live in [`matrix`], lights in [`light`] and the vertex buffer with its loaders in
//! [`vertex`].

pub mod light;
pub mod matrix;
pub mod obj;
pub mod vertex;

use bitos::bitos;
use tracing::{debug, trace, warn};

use crate::{
    System,
    system::{
        drawer,
        gbi::{Dialect, GeometryBits},
        math::{IDENTITY, Matrix},
        mem::ADDRESS_MASK,
        rdp::regs::{OtherModeH, OtherModeL},
    },
};

pub use light::{Light, LookAt};
pub use vertex::{ClipFlags, Vertex};

/// Number of vertex slots.
pub const VERTEX_COUNT: usize = 80;

/// Capacity of the model view stack. The usable depth depends on the dialect.
pub const MATRIX_STACK_LEN: usize = 32;

/// Number of light slots: twelve lights and the ambient color after the last one in use.
pub const LIGHT_COUNT: usize = 13;

/// RSP state that changed since derived state was last rebuilt.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RspChanged {
    #[bits(0)]
    pub matrix: bool,
    #[bits(1)]
    pub light: bool,
    #[bits(2)]
    pub lookat: bool,
    #[bits(3)]
    pub viewport: bool,
    #[bits(4)]
    pub geometry_mode: bool,
    #[bits(5)]
    pub texture: bool,
    #[bits(6)]
    pub fog_position: bool,
    #[bits(7)]
    pub hw_light: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub vscale: [f32; 4],
    pub vtrans: [f32; 4],
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub near: f32,
    pub far: f32,
}

/// Texture parameters set by `gSPTexture`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Texture {
    pub scale_s: f32,
    pub scale_t: f32,
    pub level: u8,
    /// First of the two texture tiles.
    pub tile: u8,
    pub on: bool,
}

impl Default for Texture {
    fn default() -> Self {
        Self {
            scale_s: 1.0,
            scale_t: 1.0,
            level: 0,
            tile: 0,
            on: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Matrices {
    pub modelview: Box<[Matrix; MATRIX_STACK_LEN]>,
    /// Index of the top of the model view stack.
    pub index: usize,
    pub stack_size: usize,
    pub projection: Matrix,
    /// `modelview[index] · projection`, rebuilt lazily.
    pub combined: Matrix,
    /// Offset transformed vertices by the position of vertex 0.
    pub billboard: bool,
}

impl Default for Matrices {
    fn default() -> Self {
        Self {
            modelview: util::boxed_array(IDENTITY),
            index: 0,
            stack_size: 10,
            projection: IDENTITY,
            combined: IDENTITY,
            billboard: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaOffsets {
    pub matrix: u32,
    pub vertex: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fog {
    pub multiplier: f32,
    pub offset: f32,
}

/// The sprite set up by the sprite microcode, see [`vertex::sprite_base`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sprite {
    pub image: u32,
    pub stride: u16,
    pub width: u16,
    pub height: u16,
    pub image_x: u16,
    pub image_y: u16,
    pub scale_x: f32,
    pub scale_y: f32,
    pub flip_x: bool,
    pub flip_y: bool,
    /// Whether the sprite image fits in TMEM and was loaded.
    pub loaded: bool,
}

pub struct State {
    pub dialect: Dialect,
    pub segments: [u32; 16],
    pub viewport: Viewport,
    pub texture: Texture,
    /// Geometry mode in the dialect's native bit layout.
    pub geometry_mode: u32,
    pub matrix: Matrices,
    pub lights: [Light; LIGHT_COUNT],
    pub num_lights: usize,
    pub lookat: LookAt,
    pub vertices: Box<[Vertex; VERTEX_COUNT]>,
    /// Next slot of an appending DMA vertex load.
    pub vertex_append: u32,
    pub dma: DmaOffsets,
    pub vertex_color_base: u32,
    pub vertex_normal_base: u32,
    pub coord_mod: [f32; 16],
    pub fog: Fog,
    pub persp_norm: f32,
    pub status: [u32; 4],
    pub sprite: Sprite,
    /// 2D object state of the S2DEX microcodes.
    pub obj: obj::State,
    pub changed: RspChanged,
}

impl Default for State {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            segments: [0; 16],
            viewport: Viewport::default(),
            texture: Texture::default(),
            geometry_mode: 0,
            matrix: Matrices::default(),
            lights: [Light::default(); LIGHT_COUNT],
            num_lights: 0,
            lookat: LookAt::default(),
            vertices: util::boxed_array(Vertex::default()),
            vertex_append: 0,
            dma: DmaOffsets::default(),
            vertex_color_base: 0,
            vertex_normal_base: 0,
            coord_mod: [0.0; 16],
            fog: Fog::default(),
            persp_norm: 1.0,
            status: [0; 4],
            sprite: Sprite::default(),
            obj: obj::State::default(),
            changed: RspChanged::from_bits(u32::MAX),
        }
    }
}

impl State {
    /// Converts a segmented address into a physical one.
    #[inline(always)]
    pub fn segment_address(&self, address: u32) -> u32 {
        let segment = self.segments[((address >> 24) & 0xF) as usize];
        segment.wrapping_add(address & ADDRESS_MASK) & ADDRESS_MASK
    }

    /// Geometry mode bit positions of the current dialect.
    #[inline(always)]
    pub fn bits(&self) -> &'static GeometryBits {
        self.dialect.geometry_bits()
    }

    /// Whether the geometry mode flag selected by `select` is set. Flags the dialect does not
    /// have are never set.
    #[inline(always)]
    pub fn geometry(&self, select: impl FnOnce(&GeometryBits) -> u32) -> bool {
        self.geometry_mode & select(self.bits()) != 0
    }
}

pub fn segment(sys: &mut System, index: u8, base: u32) {
    sys.rsp.segments[index as usize & 0xF] = base & ADDRESS_MASK;
    trace!(index, base = format_args!("{base:#08X}"), "segment");
}

pub fn viewport(sys: &mut System, address: u32) {
    let address = sys.rsp.segment_address(address);
    let Ok(bytes) = sys.mem.slice(address, 16) else {
        warn!(address = format_args!("{address:#08X}"), "viewport outside of RDRAM");
        return;
    };

    let half = |offset: usize| i16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as f32;
    let vp = &mut sys.rsp.viewport;
    vp.vscale = [half(2) / 4.0, half(0) / 4.0, half(6) / 1024.0, half(4)];
    vp.vtrans = [half(10) / 4.0, half(8) / 4.0, half(14) / 1024.0, half(12)];

    // only negative x scales are meaningful to the supported dialects
    vp.vscale[1] = vp.vscale[1].abs();

    vp.x = vp.vtrans[0] - vp.vscale[0];
    vp.y = vp.vtrans[1] - vp.vscale[1];
    vp.width = vp.vscale[0].abs() * 2.0;
    vp.height = vp.vscale[1] * 2.0;
    vp.near = vp.vtrans[2] - vp.vscale[2];
    vp.far = vp.vtrans[2] + vp.vscale[2];

    sys.rsp.changed.set_viewport(true);
    debug!(x = vp.x, y = vp.y, width = vp.width, height = vp.height, "viewport");
}

pub fn texture(sys: &mut System, scale_s: u16, scale_t: u16, level: u8, tile: u8, on: bool) {
    let texture = &mut sys.rsp.texture;
    texture.on = on;
    if !on {
        return;
    }

    let scale = |raw: u16| if raw == 0 { 1.0 } else { raw as f32 / 65536.0 };
    texture.scale_s = scale(scale_s);
    texture.scale_t = scale(scale_t);
    texture.level = level;
    texture.tile = tile & 7;

    sys.rsp.changed.set_texture(true);
}

pub fn geometry_mode(sys: &mut System, clear: u32, set: u32) {
    sys.rsp.geometry_mode = (sys.rsp.geometry_mode & !clear) | set;
    sys.rsp.changed.set_geometry_mode(true);
}

#[inline(always)]
fn other_mode_mask(shift: u32, len: u32) -> u32 {
    ((1u64 << len.min(32)).wrapping_sub(1) << shift.min(63)) as u32
}

pub fn set_other_mode_h(sys: &mut System, shift: u32, len: u32, data: u32) {
    let mask = other_mode_mask(shift, len);
    let h = (sys.rdp.other_mode_h.to_bits() & !mask) | data;
    sys.rdp.other_mode_h = OtherModeH::from_bits(h);

    if mask & 0x0030_0000 != 0 {
        sys.rdp.changed.set_cycle_type(true);
    }
}

pub fn set_other_mode_l(sys: &mut System, shift: u32, len: u32, data: u32) {
    let mask = other_mode_mask(shift, len);
    let l = (sys.rdp.other_mode_l.to_bits() & !mask) | data;
    sys.rdp.other_mode_l = OtherModeL::from_bits(l);

    if mask & 0x0000_0003 != 0 {
        sys.rdp.changed.set_alpha_compare(true);
    }

    if mask & 0xFFFF_FFF8 != 0 {
        sys.rdp.changed.set_render_mode(true);
    }
}

pub fn fog(sys: &mut System, multiplier: i16, offset: i16) {
    sys.rsp.fog = Fog {
        multiplier: multiplier as f32 / 256.0,
        offset: offset as f32 / 256.0,
    };
    sys.rsp.changed.set_fog_position(true);
}

pub fn num_lights(sys: &mut System, count: u32) {
    if count < 12 {
        sys.rsp.num_lights = count as usize;
        sys.rsp.changed.set_light(true);
    } else {
        warn!(count, "invalid number of lights");
    }
}

pub fn persp_norm(sys: &mut System, scale: u16) {
    sys.rsp.persp_norm = scale as f32 / 65536.0;
}

/// Updates the coordinate modifiers used by the Conker lighting model.
pub fn coord_mod(sys: &mut System, offset: u32, value: u32) {
    if offset & 8 != 0 {
        return;
    }

    let index = ((offset >> 1) & 3) as usize;
    let hi = (value >> 16) as i16 as f32;
    let lo = value as i16 as f32;
    let cm = &mut sys.rsp.coord_mod;
    match offset & 0x30 {
        0x00 => {
            cm[index] = hi;
            cm[index + 1] = lo;
        }
        0x10 => {
            cm[index + 4] = (value >> 16) as f32 / 65536.0;
            cm[index + 5] = (value & 0xFFFF) as f32 / 65536.0;
            cm[index + 12] = cm[index] + cm[index + 4];
            cm[index + 13] = cm[index + 1] + cm[index + 5];
        }
        0x20 => {
            cm[index + 8] = hi;
            cm[index + 9] = lo;
        }
        _ => (),
    }
}

pub fn dma_offsets(sys: &mut System, matrix: u32, vertex: u32) {
    sys.rsp.dma = DmaOffsets { matrix, vertex };
}

pub fn vertex_color_base(sys: &mut System, address: u32) {
    sys.rsp.vertex_color_base = sys.rsp.segment_address(address);
}

pub fn vertex_normal_base(sys: &mut System, address: u32) {
    sys.rsp.vertex_normal_base = sys.rsp.segment_address(address);
}

/// Switches the dialect and resets the transform state, as loading new microcode does.
pub fn load_ucode(sys: &mut System, dialect: Dialect) {
    drawer::flush(sys);

    let rsp = &mut sys.rsp;
    rsp.dialect = dialect;
    rsp.matrix.index = 0;
    rsp.matrix.stack_size = dialect.matrix_stack_size();
    rsp.matrix.billboard = false;
    rsp.status = [0; 4];
    if dialect.is_s2dex() {
        rsp.obj = obj::State::default();
    }
    rsp.changed.set_matrix(true);
    rsp.changed.set_light(true);
    rsp.changed.set_lookat(true);

    debug!(%dialect, "loaded microcode");
}

/// Handles a LOAD_UCODE command: the new microcode text is at `address` and its data at the
/// address of the preceding RDPHALF_1.
pub fn load_ucode_command(sys: &mut System, data_address: u32, size: u32) {
    let address = sys.rsp.segment_address(data_address);
    let Ok(data) = sys.mem.slice(address, size as usize) else {
        warn!(address = format_args!("{address:#08X}"), size, "microcode data outside of RDRAM");
        return;
    };

    let dialect = Dialect::detect(data).unwrap_or_else(|| {
        debug!("unknown microcode signature, keeping the current dialect");
        sys.rsp.dialect
    });

    load_ucode(sys, dialect);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Opal, config::Config, modules::render::NopRenderModule, system::mem::Rdram};

    fn opal() -> Opal {
        Opal::new(Config::default(), Rdram::new(0x10000), Box::new(NopRenderModule))
    }

    #[test]
    fn segmented_addresses() {
        let mut state = State::default();
        state.segments[6] = 0x0010_0000;
        assert_eq!(state.segment_address(0x0600_1234), 0x0010_1234);
        assert_eq!(state.segment_address(0x8000_0040), 0x40);
        // the result wraps into the physical range
        state.segments[1] = 0x00FF_FFF0;
        assert_eq!(state.segment_address(0x0100_0020), 0x10);
    }

    #[test]
    fn viewport_from_memory() {
        let mut opal = opal();
        let sys = opal.system_mut();

        // y, x, w, z of the scale and then of the translation
        let words: [i16; 8] = [480, 640, 0, 511, 480, 640, 0, 511];
        for (i, w) in words.iter().enumerate() {
            sys.mem.write_u16(0x100 + 2 * i as u32, *w as u16).unwrap();
        }

        sys.rsp.changed = RspChanged::from_bits(0);
        viewport(sys, 0x100);

        let vp = sys.rsp.viewport;
        assert_eq!(vp.vscale[0], 160.0);
        assert_eq!(vp.vscale[1], 120.0);
        assert_eq!(vp.vtrans[0], 160.0);
        assert_eq!((vp.x, vp.y), (0.0, 0.0));
        assert_eq!((vp.width, vp.height), (320.0, 240.0));
        assert!(sys.rsp.changed.viewport());
    }

    #[test]
    fn texture_zero_scale_is_one() {
        let mut opal = opal();
        let sys = opal.system_mut();

        texture(sys, 0, 0x8000, 0, 9, true);
        assert_eq!(sys.rsp.texture.scale_s, 1.0);
        assert_eq!(sys.rsp.texture.scale_t, 0.5);
        assert_eq!(sys.rsp.texture.tile, 1);

        // turning textures off keeps the previous parameters
        texture(sys, 0x4000, 0x4000, 0, 0, false);
        assert!(!sys.rsp.texture.on);
        assert_eq!(sys.rsp.texture.scale_t, 0.5);
    }

    #[test]
    fn other_mode_masking() {
        let mut opal = opal();
        let sys = opal.system_mut();

        sys.rdp.other_mode_h = OtherModeH::from_bits(0x00FF_FFFF);
        sys.rdp.changed = crate::system::rdp::regs::RdpChanged::from_bits(0);

        // cycle type: shift 20, two bits, set to copy
        set_other_mode_h(sys, 20, 2, 2 << 20);
        assert_eq!(sys.rdp.other_mode_h.to_bits(), 0x00EF_FFFF);
        assert!(sys.rdp.changed.cycle_type());

        // alpha compare only
        set_other_mode_l(sys, 0, 2, 1);
        assert!(sys.rdp.changed.alpha_compare());
        assert!(!sys.rdp.changed.render_mode());
        assert_eq!(sys.rdp.other_mode_l.to_bits(), 1);

        set_other_mode_l(sys, 3, 29, 0xFFFF_FFF8);
        assert!(sys.rdp.changed.render_mode());
        assert_eq!(sys.rdp.other_mode_l.to_bits(), 0xFFFF_FFF9);
    }

    #[test]
    fn coordinate_modifiers() {
        let mut opal = opal();
        let sys = opal.system_mut();

        coord_mod(sys, 0x00, 0x0002_FFFF);
        assert_eq!(sys.rsp.coord_mod[0], 2.0);
        assert_eq!(sys.rsp.coord_mod[1], -1.0);

        coord_mod(sys, 0x10, 0x8000_4000);
        assert_eq!(sys.rsp.coord_mod[4], 0.5);
        assert_eq!(sys.rsp.coord_mod[5], 0.25);
        assert_eq!(sys.rsp.coord_mod[12], 2.5);
        assert_eq!(sys.rsp.coord_mod[13], -0.75);

        // bit 3 of the offset disables the write
        coord_mod(sys, 0x28, 0x0001_0001);
        assert_eq!(sys.rsp.coord_mod[8], 0.0);
    }

    #[test]
    fn light_count_is_bounded() {
        let mut opal = opal();
        let sys = opal.system_mut();

        num_lights(sys, 2);
        assert_eq!(sys.rsp.num_lights, 2);
        num_lights(sys, 12);
        assert_eq!(sys.rsp.num_lights, 2);
    }

    #[test]
    fn ucode_load_resets_transform_state() {
        let mut opal = opal();
        let sys = opal.system_mut();

        sys.rsp.matrix.index = 3;
        sys.rsp.changed = RspChanged::from_bits(0);
        load_ucode(sys, Dialect::F3dex2);

        assert_eq!(sys.rsp.dialect, Dialect::F3dex2);
        assert_eq!(sys.rsp.matrix.index, 0);
        assert_eq!(sys.rsp.matrix.stack_size, 18);
        assert!(sys.rsp.changed.matrix());
        assert!(sys.rsp.changed.light());
        assert!(sys.rsp.changed.lookat());
    }
}
