//! 2D objects of the S2DEX microcodes: backgrounds, object rectangles, sprites and the texture
//! loads feeding them.
//!
//! Object coordinates are computed in the same fixed point steps the microcode takes, rounding
//! terms included, so that neighbouring objects line up exactly. Backgrounds and object
//! rectangles are drawn as texture rectangles and batch with them.

use bitos::{
    bitos,
    integer::{u2, u3, u4, u9},
};
use static_assertions::const_assert_eq;
use tracing::{debug, trace, warn};
use zerocopy::{
    FromBytes, Immutable, KnownLayout,
    big_endian::{I16, I32, U16, U32},
};

use crate::{
    System,
    system::{
        drawer, framebuffer,
        gbi::obj::{MOVE_MATRIX, MOVE_SUB_MATRIX, MOVE_VIEWPORT},
        rdp::{
            self, LoadType, TextureMode,
            regs::{CycleType, ImageFormat, TexelSize, TextureFilter, TileCommand},
            tmem,
        },
        rsp::{self, Vertex},
        texrect::{self, TexturedRect},
    },
};

/// Object texture load kinds.
const LOAD_BLOCK: u32 = 0x0000_1033;
const LOAD_TILE: u32 = 0x00FC_1034;
const LOAD_TLUT: u32 = 0x0000_0030;

/// Image flip flags of backgrounds and objects.
const FLIP_S: u16 = 0x01;
const FLIP_T: u16 = 0x10;

const RECIPROCAL: u32 = 0x8000_7FFF;

/// A background (`uObjScaleBg`).
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ObjBg {
    /// u10.5
    pub image_x: U16,
    /// u10.2
    pub image_w: U16,
    /// s10.2
    pub frame_x: I16,
    /// u10.2
    pub frame_w: U16,
    pub image_y: U16,
    pub image_h: U16,
    pub frame_y: I16,
    pub frame_h: U16,
    pub image_ptr: U32,
    pub image_load: U16,
    pub image_fmt: u8,
    pub image_siz: u8,
    pub image_pal: U16,
    pub image_flip: U16,
    /// u5.10
    pub scale_w: U16,
    pub scale_h: U16,
    pub image_y_orig: I32,
    _padding: [u8; 4],
}

/// An object (`uObjSprite`).
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ObjSprite {
    /// s10.2
    pub obj_x: I16,
    /// u5.10
    pub scale_w: U16,
    /// u10.5
    pub image_w: U16,
    _padding_x: U16,
    pub obj_y: I16,
    pub scale_h: U16,
    pub image_h: U16,
    _padding_y: U16,
    /// Row length in 64-bit words.
    pub image_stride: U16,
    /// TMEM address in 64-bit words.
    pub image_adrs: U16,
    pub image_fmt: u8,
    pub image_siz: u8,
    pub image_pal: u8,
    pub image_flags: u8,
}

/// A texture load (`uObjTxtr`). The meaning of the middle fields depends on the kind of load.
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ObjTxtr {
    pub kind: U32,
    pub image: U32,
    /// TMEM address, or first palette entry of a TLUT load.
    pub tmem: U16,
    /// Block size, tile width or palette entry count.
    pub size: U16,
    /// Block line increment or tile height.
    pub line: U16,
    pub sid: U16,
    pub flag: U32,
    pub mask: U32,
}

/// The object matrix (`uObjMtx`).
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ObjMtx {
    /// s15.16
    pub a: I32,
    pub b: I32,
    pub c: I32,
    pub d: I32,
    /// s10.2
    pub x: I16,
    pub y: I16,
    /// u5.10
    pub base_scale_x: U16,
    pub base_scale_y: U16,
}

/// The translation and scale part of the object matrix (`uObjSubMtx`).
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ObjSubMtx {
    pub x: I16,
    pub y: I16,
    pub base_scale_x: U16,
    pub base_scale_y: U16,
}

const_assert_eq!(size_of::<ObjBg>(), 40);
const_assert_eq!(size_of::<ObjSprite>(), 24);
const_assert_eq!(size_of::<ObjTxtr>(), 24);
const_assert_eq!(size_of::<ObjMtx>(), 24);
const_assert_eq!(size_of::<ObjSubMtx>(), 8);

/// Object render mode.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderMode {
    #[bits(0)]
    pub no_texture_clamp: bool,
    #[bits(1)]
    pub translucent: bool,
    #[bits(2)]
    pub antialias: bool,
    #[bits(3)]
    pub bilerp: bool,
    #[bits(4)]
    pub shrink_half: bool,
    #[bits(5)]
    pub shrink_one: bool,
    #[bits(6)]
    pub widen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjMatrix {
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub d: i32,
    pub x: i16,
    pub y: i16,
    pub base_scale_x: u16,
    pub base_scale_y: u16,
}

impl ObjMatrix {
    pub const IDENTITY: Self = Self {
        a: 1 << 16,
        b: 0,
        c: 0,
        d: 1 << 16,
        x: 0,
        y: 0,
        base_scale_x: 1 << 10,
        base_scale_y: 1 << 10,
    };
}

impl Default for ObjMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// The image of the last background.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BgImage {
    pub address: u32,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub size: TexelSize,
    pub palette: u8,
    /// Texel coordinates of the upper left corner.
    pub image_x: f32,
    pub image_y: f32,
    pub scale_w: f32,
    pub scale_h: f32,
}

impl BgImage {
    /// Bytes per row.
    #[inline(always)]
    pub fn stride(&self) -> usize {
        (self.width as usize * self.size.bits() as usize).div_ceil(8)
    }
}

/// The first half of a SELECT_DL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectDl {
    pub address: u16,
    pub sid: u8,
    pub flag: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct State {
    pub matrix: ObjMatrix,
    pub render_mode: RenderMode,
    pub select_dl: SelectDl,
    pub bg: BgImage,
}

/// Rounding terms of the fixed point coordinate math, selected by the render mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Corrector {
    a0: i16,
    a1: i16,
    a2: i16,
    a3: i16,
    b0: i16,
    b2: i16,
    b3: i16,
}

const A01: [(i16, i16); 8] = [
    (0x00, 0x00),
    (0x10, 0x20),
    (0x20, 0x40),
    (0x30, 0x60),
    (0x00, -0x0C),
    (0x10, 0x14),
    (0x20, 0x34),
    (0x30, 0x54),
];

const A23: [(i16, i16); 4] = [(1, -2), (-2, -2), (1, 0), (0, 0)];

const B03: [(i16, i16, i16); 2] = [(-4, 0, 1), (-1, -16, 0)];

const B03_REVISED: [(i16, i16, i16); 8] = [
    (-4, 0, 0),
    (-4, 0, 0),
    (-4, 3, 0),
    (-4, 3, 0),
    (-1, 0, -16),
    (-1, 0, -16),
    (-1, 0, -16),
    (-1, 0, -16),
];

impl Corrector {
    fn new(mode: RenderMode, revised: bool) -> Self {
        let bits = mode.to_bits();
        let (a0, a1) = A01[(bits >> 4) as usize & 7];
        let (a2, a3) = A23[(bits >> 3) as usize & 3];
        let (b0, b2, b3) = if revised {
            B03_REVISED[(bits >> 1) as usize & 7]
        } else {
            B03[(bits >> 3) as usize & 1]
        };

        Self {
            a0,
            a1,
            a2,
            a3,
            b0,
            b2,
            b3,
        }
    }
}

#[inline(always)]
fn reciprocal(scale: u32) -> u32 {
    RECIPROCAL / scale.max(1)
}

/// `(extent - a1) * 2^shift * (RECIPROCAL / scale)`, in the unsigned 64-bit arithmetic of the
/// microcode.
#[inline(always)]
fn scaled_extent(extent: u16, a1: i16, shift: u32, scale: u32) -> u64 {
    (extent as u64)
        .wrapping_sub(a1 as i64 as u64)
        .wrapping_shl(shift)
        .wrapping_mul(reciprocal(scale) as u64)
}

/// Corners of an object rectangle: screen coordinates in 10.2 and texture coordinates in 10.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjCoords {
    pub xh: i16,
    pub xl: i16,
    pub yh: i16,
    pub yl: i16,
    pub sh: i16,
    pub sl: i16,
    pub th: i16,
    pub tl: i16,
}

/// Computes the corners of an object, placed by the object matrix when `use_matrix` is set.
pub fn obj_coords(
    sprite: &ObjSprite,
    matrix: &ObjMatrix,
    mode: RenderMode,
    revised: bool,
    use_matrix: bool,
) -> ObjCoords {
    let cc = Corrector::new(mode, revised);
    let (obj_x, obj_y) = (sprite.obj_x.get() as i64, sprite.obj_y.get() as i64);
    let (image_w, image_h) = (sprite.image_w.get(), sprite.image_h.get());

    let (xh, xl, yh, yl, b, scale_h) = if use_matrix {
        let scale_w = (matrix.base_scale_x as u32)
            .wrapping_mul(0x40)
            .wrapping_mul(sprite.scale_w.get() as u32)
            >> 16;
        let scale_h = (matrix.base_scale_y as u32)
            .wrapping_mul(0x40)
            .wrapping_mul(sprite.scale_h.get() as u32)
            >> 16;

        if revised {
            let high = |obj: i64, base: u16, origin: i16| {
                let scaled = (obj << 27).wrapping_mul(reciprocal(base as u32) as i64) >> 48;
                ((scaled + origin as i64 + cc.a2 as i64) & cc.b0 as i64) as i16
            };
            let low = |extent: u16, scale: u32| {
                let scaled = ((extent as i64 - cc.a1 as i64) << 8).wrapping_mul(reciprocal(scale) as i64) >> 32;
                ((scaled + cc.b2 as i64) & cc.b0 as i64) as i16
            };

            let xh = high(obj_x, matrix.base_scale_x, matrix.x);
            let yh = high(obj_y, matrix.base_scale_y, matrix.y);
            let xl = low(image_w, scale_w).wrapping_add(xh);
            let yl = low(image_h, scale_h).wrapping_add(yh);
            (xh, xl, yh, yl, cc.b3, scale_h)
        } else {
            let high = |obj: i64, base: u16, origin: i16| {
                let scaled = ((obj << 16) * 0x0800).wrapping_mul(reciprocal(base as u32) as i64) >> 32;
                let origin = ((origin as i32 + cc.a2 as i32) & cc.b0 as i32) << 16;
                scaled.wrapping_add(origin as i64) as i32
            };
            let low = |high: i32, extent: u16, scale: u32| {
                let scaled = scaled_extent(extent, cc.a1, 24, scale) >> 32;
                (high as i64 as u64).wrapping_add(scaled) as i32
            };

            let xhp = high(obj_x, matrix.base_scale_x, matrix.x);
            let yhp = high(obj_y, matrix.base_scale_y, matrix.y);
            let xlp = low(xhp, image_w, scale_w);
            let ylp = low(yhp, image_h, scale_h);
            (
                (xhp >> 16) as i16,
                (xlp >> 16) as i16,
                (yhp >> 16) as i16,
                (ylp >> 16) as i16,
                cc.b2,
                scale_h,
            )
        }
    } else {
        let high = |obj: i64| ((obj as i32 + cc.a2 as i32) & cc.b0 as i32) as i16;
        let low = |extent: u16, scale: u16| (scaled_extent(extent, cc.a1, 24, scale as u32) >> 48) as i16;

        let xh = high(obj_x);
        let yh = high(obj_y);
        let xl = low(image_w, sprite.scale_w.get()).wrapping_add(xh);
        let yl = low(image_h, sprite.scale_h.get()).wrapping_add(yh);
        (xh, xl, yh, yl, cc.b2, sprite.scale_h.get() as u32)
    };

    let inset = cc.a0 as i32 - cc.a1 as i32 - 1;
    let sh = cc.a0.wrapping_add(b);
    let sl = (sh as i32 + image_w as i32 + inset) as i16;
    let carry = ((yh as u32 & 3) * 0x0200).wrapping_mul(scale_h) >> 16;
    let th = (sh as u32).wrapping_sub(carry) as i16;
    let tl = (th as i32 + image_h as i32 + inset) as i16;

    ObjCoords {
        xh,
        xl,
        yh,
        yl,
        sh,
        sl,
        th,
        tl,
    }
}

/// Reads a guest structure.
fn read<T: FromBytes>(sys: &System, address: u32, what: &'static str) -> Option<T> {
    let address = sys.rsp.segment_address(address);
    let object = sys
        .mem
        .slice(address, size_of::<T>())
        .ok()
        .and_then(|bytes| T::read_from_bytes(bytes).ok());

    if object.is_none() {
        warn!(address = format_args!("{address:#08X}"), what, "object outside of RDRAM");
    }

    object
}

#[inline(always)]
fn format(raw: u8) -> ImageFormat {
    ImageFormat::from_bits(u3::new(raw & 7))
}

#[inline(always)]
fn size(raw: u8) -> TexelSize {
    TexelSize::from_bits(u2::new(raw & 3))
}

#[inline(always)]
fn span(texels: f32, pixels: f32) -> f32 {
    if pixels != 0.0 { texels / pixels } else { 0.0 }
}

/// Converts texels to s10.5.
#[inline(always)]
fn s10_5(texels: f32) -> i16 {
    (texels * 32.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn set_cycle_type(sys: &mut System, cycle: CycleType) {
    sys.rdp.other_mode_h = sys.rdp.other_mode_h.with_cycle_type(cycle);
    sys.rdp.changed.set_cycle_type(true);
}

pub fn render_mode(sys: &mut System, mode: u32) {
    sys.rsp.obj.render_mode = RenderMode::from_bits(mode);
    trace!(mode = format_args!("{mode:#04X}"), "object render mode");
}

pub fn move_mem(sys: &mut System, index: u16, address: u32) {
    match index {
        MOVE_MATRIX => {
            let Some(mtx) = read::<ObjMtx>(sys, address, "matrix") else {
                return;
            };

            sys.rsp.obj.matrix = ObjMatrix {
                a: mtx.a.get(),
                b: mtx.b.get(),
                c: mtx.c.get(),
                d: mtx.d.get(),
                x: mtx.x.get(),
                y: mtx.y.get(),
                base_scale_x: mtx.base_scale_x.get(),
                base_scale_y: mtx.base_scale_y.get(),
            };
        }
        MOVE_SUB_MATRIX => {
            let Some(sub) = read::<ObjSubMtx>(sys, address, "sub-matrix") else {
                return;
            };

            let matrix = &mut sys.rsp.obj.matrix;
            matrix.x = sub.x.get();
            matrix.y = sub.y.get();
            matrix.base_scale_x = sub.base_scale_x.get();
            matrix.base_scale_y = sub.base_scale_y.get();
        }
        MOVE_VIEWPORT => rsp::viewport(sys, address),
        _ => debug!(index, "unknown object movemem"),
    }
}

/// Loads a texture block, tile or palette into TMEM, unless the status word says it is already
/// there.
pub fn load_texture(sys: &mut System, address: u32) {
    let Some(txtr) = read::<ObjTxtr>(sys, address, "texture") else {
        return;
    };

    let slot = (txtr.sid.get() as usize >> 2) & 3;
    let (flag, mask) = (txtr.flag.get(), txtr.mask.get());
    if sys.rsp.status[slot] & mask == flag {
        trace!(slot, "object texture already loaded");
        return;
    }

    let image = txtr.image.get();
    let tmem = u9::new(txtr.tmem.get() & 0x1FF);
    let size = txtr.size.get() as u32;
    let rgba8 = TileCommand::default()
        .with_format(ImageFormat::Rgba)
        .with_size(TexelSize::Bits8)
        .with_tmem(tmem);

    match txtr.kind.get() {
        LOAD_BLOCK => {
            rdp::set_texture_image(sys, ImageFormat::Rgba, TexelSize::Bits8, 0, image);
            rdp::set_tile(sys, rgba8.with_tile(u3::new(7)));
            let lrs = ((size + 1) << 3).saturating_sub(1) as u16;
            tmem::load_block(sys, 7, 0, 0, lrs, txtr.line.get());
        }
        LOAD_TILE => {
            let line = u9::new((((size + 1) >> 2) & 0x1FF) as u16);
            rdp::set_texture_image(sys, ImageFormat::Rgba, TexelSize::Bits8, (size + 1) << 1, image);
            rdp::set_tile(sys, rgba8.with_line(line).with_tile(u3::new(0)));
            rdp::set_tile(sys, rgba8.with_line(line).with_tile(u3::new(7)));

            let lrs = ((((size + 1) << 1).saturating_sub(1)) << 2) as u16;
            let lrt = (((txtr.line.get() as u32 + 1) >> 2).saturating_sub(1) << 2) as u16;
            tmem::load_tile(sys, 7, 0, 0, lrs, lrt);
        }
        LOAD_TLUT => {
            rdp::set_texture_image(sys, ImageFormat::Rgba, TexelSize::Bits16, 1, image);
            let cmd = TileCommand::default()
                .with_format(ImageFormat::Rgba)
                .with_size(TexelSize::Bits16)
                .with_tmem(tmem)
                .with_tile(u3::new(7));
            rdp::set_tile(sys, cmd);
            tmem::load_tlut(sys, 7, 0, 0, (size << 2) as u16, 0);
        }
        kind => {
            warn!(kind = format_args!("{kind:#010X}"), "unknown object texture load");
            return;
        }
    }

    let status = &mut sys.rsp.status[slot];
    *status = (*status & !mask) | (flag & mask);
}

/// Points the render tile at the image of an object.
fn set_sprite_tile(sys: &mut System, sprite: &ObjSprite) {
    let width = (sprite.image_w.get() >> 5).max(1);
    let height = (sprite.image_h.get() >> 5).max(1);

    let cmd = TileCommand::default()
        .with_format(format(sprite.image_fmt))
        .with_size(size(sprite.image_siz))
        .with_line(u9::new(sprite.image_stride.get() & 0x1FF))
        .with_tmem(u9::new(sprite.image_adrs.get() & 0x1FF))
        .with_tile(u3::new(0))
        .with_palette(u4::new(sprite.image_pal & 0xF))
        .with_clamp_s(true)
        .with_clamp_t(true);

    rdp::set_tile(sys, cmd);
    rdp::set_tile_size(sys, 0, 0, 0, (width - 1) << 2, (height - 1) << 2);
    rsp::texture(sys, 0, 0, 0, 0, true);
}

fn draw_rectangle(sys: &mut System, address: u32, use_matrix: bool) {
    let Some(sprite) = read::<ObjSprite>(sys, address, "rectangle") else {
        return;
    };

    set_sprite_tile(sys, &sprite);

    let obj = &sys.rsp.obj;
    let revised = sys.rsp.dialect.revised_objects();
    let coords = obj_coords(&sprite, &obj.matrix, obj.render_mode, revised, use_matrix);

    let flags = sprite.image_flags as u16;
    let (s0, s1) = if flags & FLIP_S != 0 {
        (coords.sl, coords.sh)
    } else {
        (coords.sh, coords.sl)
    };
    let (t0, t1) = if flags & FLIP_T != 0 {
        (coords.tl, coords.th)
    } else {
        (coords.th, coords.tl)
    };

    let ulx = util::fixed_to_f32::<2>(coords.xh as i32);
    let uly = util::fixed_to_f32::<2>(coords.yh as i32);
    let lrx = util::fixed_to_f32::<2>(coords.xl as i32);
    let lry = util::fixed_to_f32::<2>(coords.yl as i32);

    let rect = TexturedRect {
        ulx,
        uly,
        lrx,
        lry,
        tile: 0,
        s: s0,
        t: t0,
        dsdx: span((s1 as f32 - s0 as f32) / 32.0, lrx - ulx),
        dtdy: span((t1 as f32 - t0 as f32) / 32.0, lry - uly),
        flip: false,
    };

    texrect::draw_textured_rect(sys, rect);
}

/// Draws an object rectangle.
pub fn rectangle(sys: &mut System, address: u32) {
    draw_rectangle(sys, address, false);
}

/// Draws an object rectangle placed and scaled by the object matrix.
pub fn rectangle_r(sys: &mut System, address: u32) {
    draw_rectangle(sys, address, true);
}

/// Draws an object transformed by the full object matrix, which can rotate it.
pub fn sprite(sys: &mut System, address: u32) {
    let Some(sprite) = read::<ObjSprite>(sys, address, "sprite") else {
        return;
    };

    set_sprite_tile(sys, &sprite);

    let matrix = sys.rsp.obj.matrix;
    let revised = sys.rsp.dialect.revised_objects();
    let cc = Corrector::new(sys.rsp.obj.render_mode, revised);

    let x0 = ((matrix.x as i32 + cc.b3 as i32) & cc.b0 as i32) as i16;
    let y0 = ((matrix.y as i32 + cc.b3 as i32) & cc.b0 as i32) as i16;
    let ulx = sprite.obj_x.get().wrapping_add(cc.a3);
    let uly = sprite.obj_y.get().wrapping_add(cc.a3);
    let extent = |extent: u16, scale: u16| (scaled_extent(extent, cc.a1, 8, scale as u32) >> 32) as i16;
    let lrx = extent(sprite.image_w.get(), sprite.scale_w.get()).wrapping_add(ulx);
    let lry = extent(sprite.image_h.get(), sprite.scale_h.get()).wrapping_add(uly);

    let project = |origin: i16, x: i16, y: i16, m0: i32, m1: i32| {
        let position = origin
            .wrapping_add(((x as i32).wrapping_mul(m0) >> 16) as i16)
            .wrapping_add(((y as i32).wrapping_mul(m1) >> 16) as i16);
        util::fixed_to_f32::<2>(position as i32)
    };

    let mut uls = 0.0;
    let mut lrs = util::ufixed_to_f32::<5>(sprite.image_w.get() as u32) - 1.0;
    let mut ult = 0.0;
    let mut lrt = util::ufixed_to_f32::<5>(sprite.image_h.get() as u32) - 1.0;
    let flags = sprite.image_flags as u16;
    if flags & FLIP_S != 0 {
        std::mem::swap(&mut uls, &mut lrs);
    }
    if flags & FLIP_T != 0 {
        std::mem::swap(&mut ult, &mut lrt);
    }

    let z = if sys.rdp.other_mode_l.depth_source_prim() {
        sys.rdp.prim_depth.z
    } else {
        sys.rsp.viewport.near
    };

    let corner = |x: i16, y: i16, s: f32, t: f32| Vertex {
        x: project(x0, x, y, matrix.a, matrix.b),
        y: project(y0, x, y, matrix.c, matrix.d),
        z,
        w: 1.0,
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
        s,
        t,
        ..Default::default()
    };

    let quad = [
        corner(ulx, uly, uls, ult),
        corner(lrx, uly, lrs, ult),
        corner(ulx, lry, uls, lrt),
        corner(lrx, lry, lrs, lrt),
    ];

    drawer::draw_screen_quad(sys, quad);
    trace!(x = quad[0].x, y = quad[0].y, "object sprite");
}

/// Loads a texture and draws an object with it.
pub fn load_and_draw(sys: &mut System, address: u32, draw: fn(&mut System, u32)) {
    load_texture(sys, address);
    draw(sys, address.wrapping_add(size_of::<ObjTxtr>() as u32));
}

/// The render target backing a background image, if it can be sampled directly.
fn bg_frame_buffer(sys: &mut System, image: &BgImage) -> Option<u32> {
    if !sys.config.frame_buffer.enable {
        return None;
    }

    let (start, fb_size, cfb, stale_depth) = framebuffer::find_buffer(sys, image.address)
        .map(|fb| (fb.start, fb.size, fb.cfb, fb.is_depth && !fb.changed))?;

    if fb_size != image.size || stale_depth {
        return None;
    }

    // 8-bit color indexed targets can't be sampled
    if image.format == ImageFormat::ColorIndexed && image.size == TexelSize::Bits8 {
        return None;
    }

    if cfb || !framebuffer::is_valid(sys, start, false) {
        framebuffer::remove_buffer(sys, start);
        return None;
    }

    Some(start)
}

fn load_bg_image(sys: &mut System, bg: &ObjBg, scaled: bool) {
    let width = (bg.image_w.get() >> 2) as u32;
    let height = (bg.image_h.get() >> 2) as u32;
    let scale = |raw: U16| {
        let scale = util::ufixed_to_f32::<10>(raw.get() as u32);
        if scaled && scale > 0.0 { scale } else { 1.0 }
    };

    let image = BgImage {
        address: sys.rsp.segment_address(bg.image_ptr.get()),
        width: width - width % 2,
        height: height - height % 2,
        format: format(bg.image_fmt),
        size: size(bg.image_siz),
        palette: (bg.image_pal.get() & 0xF) as u8,
        image_x: util::ufixed_to_f32::<5>(bg.image_x.get() as u32),
        image_y: util::ufixed_to_f32::<5>(bg.image_y.get() as u32),
        scale_w: scale(bg.scale_w),
        scale_h: scale(bg.scale_h),
    };
    sys.rsp.obj.bg = image;

    let cmd = TileCommand::default()
        .with_format(image.format)
        .with_size(image.size)
        .with_palette(u4::new(image.palette))
        .with_clamp_s(true)
        .with_clamp_t(true)
        .with_tile(u3::new(0));
    rdp::set_tile(sys, cmd);
    rdp::set_tile_size(sys, 0, 0, 0, 0, 0);

    let frame_buffer = bg_frame_buffer(sys, &image);
    let tile = &mut sys.rdp.tiles[0];
    tile.load_type = LoadType::Tile;
    tile.image_address = image.address;
    match frame_buffer {
        Some(start) => {
            tile.texture_mode = TextureMode::FrameBuffer;
            tile.frame_buffer = start;
            trace!(start = format_args!("{start:#08X}"), "background reads from a render target");
        }
        None => {
            tile.texture_mode = TextureMode::BgImage;
            tile.frame_buffer = 0;
        }
    }
    sys.rdp.changed.set_tmem(true);
}

/// The rectangle a background covers, with texture coordinates into the background image.
fn bg_rect(sys: &System, bg: &ObjBg) -> TexturedRect {
    let image = &sys.rsp.obj.bg;
    let mode = sys.rsp.obj.render_mode;
    let filter = sys.rdp.other_mode_h.texture_filter();
    let copy = sys.rdp.other_mode_h.cycle_type() == CycleType::Copy;

    // copy mode can't scale
    let (scale_w, scale_h) = if copy {
        (1.0, 1.0)
    } else {
        (image.scale_w, image.scale_h)
    };

    let frame_w = util::ufixed_to_f32::<2>(bg.frame_w.get() as u32);
    let frame_h = util::ufixed_to_f32::<2>(bg.frame_h.get() as u32);
    let image_w = (bg.image_w.get() >> 2) as f32;
    let image_h = (bg.image_h.get() >> 2) as f32;

    let mut uls = image.image_x;
    let mut ult = image.image_y;
    let mut lrs = uls + image_w.min(frame_w * scale_w) - 1.0;
    let mut lrt = ult + image_h.min(frame_h * scale_h) - 1.0;

    if !copy {
        let mut inset = 0.0;
        if filter == TextureFilter::Bilerp {
            inset -= 0.5;
        }
        if mode.shrink_half() {
            inset += 0.5;
        } else if mode.shrink_one() {
            inset += 1.0;
        }

        uls += inset;
        ult += inset;
        lrs -= inset;
        lrt -= inset;
    }

    let ulx = util::fixed_to_f32::<2>(bg.frame_x.get() as i32);
    let uly = util::fixed_to_f32::<2>(bg.frame_y.get() as i32);
    let mut lrx = ulx + (lrs - uls) / scale_w;
    let mut lry = uly + (lrt - ult) / scale_h;

    let point_sampled = if mode.bilerp() {
        filter == TextureFilter::Point && mode.no_texture_clamp()
    } else {
        filter != TextureFilter::Bilerp
    };
    if point_sampled {
        lrx += 1.0 / scale_w;
        lry += 1.0 / scale_h;
    }

    let dsdx = span(lrs - uls, lrx - ulx);
    let dtdy = span(lrt - ult, lry - uly);

    // only horizontal flips are supported by backgrounds
    let flip = bg.image_flip.get() & FLIP_S != 0;
    TexturedRect {
        ulx,
        uly,
        lrx,
        lry,
        tile: 0,
        s: s10_5(if flip { lrs } else { uls }),
        t: s10_5(ult),
        dsdx: if flip { -dsdx } else { dsdx },
        dtdy,
        flip: false,
    }
}

fn draw_bg(sys: &mut System, address: u32, cycle: CycleType) {
    let Some(bg) = read::<ObjBg>(sys, address, "background") else {
        return;
    };

    load_bg_image(sys, &bg, cycle != CycleType::Copy);
    set_cycle_type(sys, cycle);
    rsp::texture(sys, 0, 0, 0, 0, true);

    let rect = bg_rect(sys, &bg);
    trace!(ulx = rect.ulx, uly = rect.uly, lrx = rect.lrx, lry = rect.lry, ?cycle, "background");
    texrect::draw_textured_rect(sys, rect);
}

/// Draws a scaled background.
pub fn bg_rect_1cycle(sys: &mut System, address: u32) {
    draw_bg(sys, address, CycleType::One);
}

/// Draws an unscaled background in copy mode.
pub fn bg_rect_copy(sys: &mut System, address: u32) {
    draw_bg(sys, address, CycleType::Copy);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Opal,
        config::Config,
        modules::render::NopRenderModule,
        system::{gbi::Dialect, mem::Rdram},
    };

    fn opal() -> Opal {
        let mut opal = Opal::new(Config::default(), Rdram::new(0x10000), Box::new(NopRenderModule));
        opal.load_ucode(Dialect::S2dex2);
        opal
    }

    fn write_words(sys: &mut System, address: u32, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            sys.mem.write_u32(address + 4 * i as u32, word).unwrap();
        }
    }

    fn sprite(x: i16, y: i16, width: u16, height: u16, scale: u16) -> ObjSprite {
        ObjSprite {
            obj_x: I16::new(x << 2),
            scale_w: U16::new(scale),
            image_w: U16::new(width << 5),
            _padding_x: U16::ZERO,
            obj_y: I16::new(y << 2),
            scale_h: U16::new(scale),
            image_h: U16::new(height << 5),
            _padding_y: U16::ZERO,
            image_stride: U16::new(4),
            image_adrs: U16::ZERO,
            image_fmt: 0,
            image_siz: 2,
            image_pal: 0,
            image_flags: 0,
        }
    }

    #[test]
    fn guest_layouts_are_big_endian() {
        let mut bytes = [0u8; 24];
        bytes[0..2].copy_from_slice(&(-8i16).to_be_bytes());
        bytes[2..4].copy_from_slice(&0x0400u16.to_be_bytes());
        bytes[23] = FLIP_S as u8;

        let sprite = ObjSprite::read_from_bytes(&bytes).unwrap();
        assert_eq!(sprite.obj_x.get(), -8);
        assert_eq!(sprite.scale_w.get(), 0x400);
        assert_eq!(sprite.image_flags, 1);
    }

    #[test]
    fn unscaled_rectangle_covers_its_image() {
        // 16x8 texels at (10, 20), scale 1.0
        let coords = obj_coords(
            &sprite(10, 20, 16, 8, 0x400),
            &ObjMatrix::IDENTITY,
            RenderMode::default(),
            true,
            false,
        );

        assert_eq!((coords.xh, coords.yh), (40, 80));
        assert_eq!((coords.xl, coords.yl), (40 + 64, 80 + 32));
        assert_eq!(coords.sh, 0);
        assert_eq!(coords.sl, (16 << 5) - 1);
        assert_eq!(coords.tl, (8 << 5) - 1);
    }

    #[test]
    fn half_scale_doubles_the_rectangle() {
        let coords = obj_coords(
            &sprite(0, 0, 16, 16, 0x200),
            &ObjMatrix::IDENTITY,
            RenderMode::default(),
            true,
            false,
        );

        assert_eq!(coords.xl - coords.xh, 128);
    }

    #[test]
    fn object_matrix_translates_rectangles() {
        let matrix = ObjMatrix {
            x: 100 << 2,
            y: 50 << 2,
            ..ObjMatrix::IDENTITY
        };

        for revised in [false, true] {
            let placed = obj_coords(&sprite(0, 0, 16, 16, 0x400), &matrix, RenderMode::default(), revised, true);
            let plain = obj_coords(
                &sprite(0, 0, 16, 16, 0x400),
                &ObjMatrix::IDENTITY,
                RenderMode::default(),
                revised,
                true,
            );

            assert_eq!(placed.xh - plain.xh, 400, "revised: {revised}");
            assert_eq!(placed.yh - plain.yh, 200, "revised: {revised}");
            assert_eq!(placed.xl - placed.xh, plain.xl - plain.xh);
        }
    }

    #[test]
    fn corrections_follow_the_render_mode() {
        let plain = Corrector::new(RenderMode::default(), true);
        assert_eq!((plain.a0, plain.a1, plain.a2, plain.b0), (0, 0, 1, -4));

        let bilerp = Corrector::new(RenderMode::default().with_bilerp(true), true);
        assert_eq!((bilerp.a2, bilerp.a3), (-2, -2));
        assert_eq!(bilerp.b0, -1);

        let shrunk = Corrector::new(RenderMode::default().with_shrink_half(true), false);
        assert_eq!((shrunk.a0, shrunk.a1), (0x10, 0x20));
        assert_eq!((shrunk.b0, shrunk.b2, shrunk.b3), (-4, 0, 1));
    }

    #[test]
    fn zero_scales_do_not_divide_by_zero() {
        let coords = obj_coords(
            &sprite(0, 0, 8, 8, 0),
            &ObjMatrix {
                base_scale_x: 0,
                base_scale_y: 0,
                ..ObjMatrix::IDENTITY
            },
            RenderMode::default(),
            false,
            true,
        );

        assert_eq!(coords.sh, 0);
    }

    #[test]
    fn loads_are_skipped_while_the_status_matches() {
        let mut opal = opal();
        let sys = opal.system_mut();
        // 16 palette entries into the first bank, status slot 1
        write_words(sys, 0x200, &[LOAD_TLUT, 0x400, 0x0100_000F, 0x0000_0004, 0xAB, 0xFF]);
        sys.mem.write_u16(0x400, 0x1234).unwrap();

        load_texture(sys, 0x200);
        assert_eq!(n64tex::palette_entry(&sys.rdp.tmem, 0), 0x1234);
        assert_eq!(sys.rsp.status[1], 0xAB);

        sys.mem.write_u16(0x400, 0x5678).unwrap();
        load_texture(sys, 0x200);
        assert_eq!(n64tex::palette_entry(&sys.rdp.tmem, 0), 0x1234);

        sys.rsp.status[1] = 0;
        load_texture(sys, 0x200);
        assert_eq!(n64tex::palette_entry(&sys.rdp.tmem, 0), 0x5678);
    }

    #[test]
    fn matrices_are_moved_in() {
        let mut opal = opal();
        let sys = opal.system_mut();
        write_words(
            sys,
            0x300,
            &[0x0002_0000, 0, 0, 0x0001_0000, 0x0008_FFFC, 0x0400_0200],
        );
        write_words(sys, 0x340, &[0x0010_0020, 0x0800_0800]);

        move_mem(sys, MOVE_MATRIX, 0x300);
        assert_eq!(
            sys.rsp.obj.matrix,
            ObjMatrix {
                a: 2 << 16,
                x: 8,
                y: -4,
                base_scale_y: 0x200,
                ..ObjMatrix::IDENTITY
            }
        );

        move_mem(sys, MOVE_SUB_MATRIX, 0x340);
        let matrix = sys.rsp.obj.matrix;
        assert_eq!((matrix.a, matrix.x, matrix.y), (2 << 16, 16, 32));
        assert_eq!((matrix.base_scale_x, matrix.base_scale_y), (0x800, 0x800));

        // outside of RDRAM keeps the matrix
        move_mem(sys, MOVE_MATRIX, 0x00FF_FFF0);
        assert_eq!(sys.rsp.obj.matrix, matrix);
    }
}
