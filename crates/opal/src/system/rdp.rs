//! Rasterizer (RDP) state and command handlers.

pub mod regs;
pub mod tmem;

use color::Rgba;
use tracing::{debug, trace, warn};

use crate::{
    System,
    config::CopyMode,
    modules::render::Rect,
    system::{
        depth, drawer, framebuffer,
        rdp::regs::{
            Combine, CycleType, ImageFormat, OtherModeH, OtherModeL, RdpChanged, TexelSize,
            TileCommand,
        },
        texrect::{self, TexturedRect},
    },
};

pub use tmem::LoadInfo;

/// Fill color which marks a fill rectangle as a depth buffer clear.
pub const DEPTH_CLEAR_COLOR: u32 = 0xFFFC_FFFC;

/// Number of tile descriptors.
pub const TILE_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadType {
    #[default]
    Tile,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureMode {
    #[default]
    Normal,
    /// The tile was loaded from memory backing a render target.
    FrameBuffer,
    /// The tile samples the current background image straight from RDRAM.
    BgImage,
}

/// A tile descriptor: a view into TMEM.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Tile {
    pub format: ImageFormat,
    pub size: TexelSize,
    /// Row length in 64-bit words.
    pub line: u16,
    /// TMEM address in 64-bit words.
    pub tmem: u16,
    pub palette: u8,
    pub clamp_s: bool,
    pub mirror_s: bool,
    pub clamp_t: bool,
    pub mirror_t: bool,
    pub mask_s: u8,
    pub mask_t: u8,
    pub shift_s: u8,
    pub shift_t: u8,
    /// Integer tile coordinates.
    pub uls: u16,
    pub ult: u16,
    pub lrs: u16,
    pub lrt: u16,
    /// Tile coordinates with their 2 fractional bits.
    pub fuls: f32,
    pub fult: f32,
    pub flrs: f32,
    pub flrt: f32,
    pub load_type: LoadType,
    pub texture_mode: TextureMode,
    /// Start address of the render target this tile was loaded from.
    pub frame_buffer: u32,
    pub image_address: u32,
}

/// An image in RDRAM: the color image, or the source of texture loads.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Image {
    pub address: u32,
    pub format: ImageFormat,
    pub size: TexelSize,
    pub width: u32,
    pub height: u32,
}

impl Image {
    /// Bytes per line.
    #[inline(always)]
    pub fn bpl(&self) -> u32 {
        (self.width << self.size as u32) >> 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FillColor {
    pub raw: u32,
    pub z: f32,
    pub dz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PrimColor {
    pub color: Rgba,
    /// Minimum LOD level, scaled by 1/32.
    pub m: f32,
    /// LOD fraction.
    pub l: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PrimDepth {
    pub z: f32,
    pub dz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Scissor {
    pub mode: u8,
    pub ulx: f32,
    pub uly: f32,
    pub lrx: f32,
    pub lry: f32,
}

impl Scissor {
    pub fn rect(&self) -> Rect {
        Rect::new(self.ulx, self.uly, self.lrx, self.lry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Key {
    pub center: [f32; 3],
    pub scale: [f32; 3],
    pub width: [f32; 3],
}

pub struct State {
    pub other_mode_h: OtherModeH,
    pub other_mode_l: OtherModeL,
    pub combine: Combine,
    pub tiles: [Tile; TILE_COUNT],
    /// Tile used by the most recent load.
    pub load_tile: usize,
    pub color_image: Image,
    pub depth_image: u32,
    pub texture_image: Image,
    pub fill: FillColor,
    pub prim: PrimColor,
    pub env: Rgba,
    pub blend: Rgba,
    pub fog: Rgba,
    pub prim_depth: PrimDepth,
    pub scissor: Scissor,
    pub convert: [i32; 6],
    pub key: Key,
    pub tmem: Box<n64tex::Tmem>,
    pub load_info: Box<[LoadInfo; tmem::LOAD_INFO_LEN]>,
    pub palette_crc: [u32; 16],
    pub palette_crc256: u32,
    pub changed: RdpChanged,
}

impl Default for State {
    fn default() -> Self {
        Self {
            other_mode_h: OtherModeH::default(),
            other_mode_l: OtherModeL::default(),
            combine: Combine::default(),
            tiles: [Tile::default(); TILE_COUNT],
            load_tile: 7,
            color_image: Image::default(),
            depth_image: 0,
            texture_image: Image::default(),
            fill: FillColor::default(),
            prim: PrimColor::default(),
            env: Rgba::default(),
            blend: Rgba::default(),
            fog: Rgba::default(),
            prim_depth: PrimDepth::default(),
            scissor: Scissor::default(),
            convert: [0; 6],
            key: Key::default(),
            tmem: util::boxed_array(0),
            load_info: util::boxed_array(LoadInfo::default()),
            palette_crc: [0; 16],
            palette_crc256: 0,
            changed: RdpChanged::from_bits(u32::MAX),
        }
    }
}

impl State {
    /// The full other mode register, high word first.
    #[inline(always)]
    pub fn other_mode(&self) -> u64 {
        ((self.other_mode_h.to_bits() as u64) << 32) | self.other_mode_l.to_bits() as u64
    }

    #[inline(always)]
    pub fn cycle_type(&self) -> CycleType {
        self.other_mode_h.cycle_type()
    }

    /// The fill color unpacked according to the color image size.
    pub fn fill_color(&self) -> Rgba {
        let c = self.fill.raw;
        if self.color_image.size != TexelSize::Bits32 {
            Rgba::new(
                ((c >> 11) & 0x1F) as f32 / 31.0,
                ((c >> 6) & 0x1F) as f32 / 31.0,
                ((c >> 1) & 0x1F) as f32 / 31.0,
                (c & 1) as f32,
            )
        } else {
            Rgba::from_word(c)
        }
    }
}

/// Converts a texture image address through the segment table.
fn physical(sys: &System, address: u32) -> u32 {
    sys.rsp.segment_address(address)
}

pub fn set_color_image(sys: &mut System, format: ImageFormat, size: TexelSize, width: u32, address: u32) {
    let address = physical(sys, address);
    drawer::flush(sys);

    framebuffer::save_buffer(sys, address, format, size, width, false);

    sys.rdp.color_image = Image {
        address,
        format,
        size,
        width,
        height: 0,
    };
    sys.rdp.changed.set_color_buffer(true);
    debug!(address = format_args!("{address:#08X}"), ?format, ?size, width, "set color image");
}

pub fn set_depth_image(sys: &mut System, address: u32) {
    let address = physical(sys, address);
    sys.rdp.depth_image = address;
    depth::save_buffer(sys, address);
    debug!(address = format_args!("{address:#08X}"), "set depth image");
}

pub fn set_texture_image(sys: &mut System, format: ImageFormat, size: TexelSize, width: u32, address: u32) {
    sys.rdp.texture_image = Image {
        address: physical(sys, address),
        format,
        size,
        width,
        height: 0,
    };
}

pub fn set_combine(sys: &mut System, mux: u64) {
    sys.rdp.combine = Combine::from_bits(mux);
    sys.rdp.changed.set_combine(true);
}

pub fn set_other_mode(sys: &mut System, h: u32, l: u32) {
    sys.rdp.other_mode_h = OtherModeH::from_bits(h);
    sys.rdp.other_mode_l = OtherModeL::from_bits(l);

    let changed = &mut sys.rdp.changed;
    changed.set_render_mode(true);
    changed.set_cycle_type(true);
    changed.set_alpha_compare(true);
}

pub fn set_env_color(sys: &mut System, color: u32) {
    sys.rdp.env = Rgba::from_word(color);
}

pub fn set_blend_color(sys: &mut System, color: u32) {
    sys.rdp.blend = Rgba::from_word(color);
    sys.rdp.changed.set_blend_color(true);
}

pub fn set_fog_color(sys: &mut System, color: u32) {
    sys.rdp.fog = Rgba::from_word(color);
    sys.rdp.changed.set_fog_color(true);
}

pub fn set_fill_color(sys: &mut System, color: u32) {
    sys.rdp.fill = FillColor {
        raw: color,
        z: ((color >> 2) & 0x3FFF) as f32,
        dz: (color & 3) as f32,
    };
}

pub fn set_prim_color(sys: &mut System, m: u8, l: u8, color: u32) {
    sys.rdp.prim = PrimColor {
        color: Rgba::from_word(color),
        m: m as f32 * 0.03125,
        l: l as f32 / 255.0,
    };
}

pub fn set_prim_depth(sys: &mut System, z: u16, dz: u16) {
    let raw = util::ufixed_to_f32::<15>((z & 0x7FFF) as u32);
    let vscale = sys.rsp.viewport.vscale[2];
    let vtrans = sys.rsp.viewport.vtrans[2];

    sys.rdp.prim_depth = PrimDepth {
        z: if vscale == 0.0 {
            raw
        } else {
            ((raw - vtrans) / vscale).clamp(-1.0, 1.0)
        },
        dz: util::ufixed_to_f32::<15>((dz & 0x7FFF) as u32),
    };
}

pub fn set_tile(sys: &mut System, cmd: TileCommand) {
    let index = cmd.tile().value() as usize;
    let tmem = cmd.tmem().value();

    let tile = &mut sys.rdp.tiles[index];
    tile.format = cmd.format();
    tile.size = cmd.size();
    tile.line = cmd.line().value();
    tile.tmem = tmem;
    tile.palette = cmd.palette().value();
    tile.mask_s = cmd.mask_s().value();
    tile.mask_t = cmd.mask_t().value();
    tile.shift_s = cmd.shift_s().value();
    tile.shift_t = cmd.shift_t().value();
    tile.mirror_s = cmd.mirror_s();
    tile.mirror_t = cmd.mirror_t();
    // a zero mask always clamps
    tile.clamp_s = cmd.clamp_s() || tile.mask_s == 0;
    tile.clamp_t = cmd.clamp_t() || tile.mask_t == 0;

    // texture tiles inherit the origin of the load that wrote their TMEM area
    let texture_tile = sys.rsp.texture.tile as usize;
    if index == texture_tile || index == texture_tile + 1 {
        let mut source = sys.rdp.load_tile;
        while sys.rdp.tiles[source].tmem != tmem && source > texture_tile + 1 {
            source -= 1;
        }

        if source > texture_tile + 1 {
            let source = sys.rdp.tiles[source];
            let tile = &mut sys.rdp.tiles[index];
            tile.texture_mode = source.texture_mode;
            tile.load_type = source.load_type;
            tile.frame_buffer = source.frame_buffer;
            tile.image_address = source.image_address;
        }
    }

    sys.rdp.changed.set_tile(true);
}

/// Updates the coordinates of a tile. Coordinates are 10.2 fixed point.
pub fn set_tile_size(sys: &mut System, tile: u8, uls: u16, ult: u16, lrs: u16, lrt: u16) {
    let tile = &mut sys.rdp.tiles[tile as usize & 7];
    tile.uls = (uls >> 2) & 0x3FF;
    tile.ult = (ult >> 2) & 0x3FF;
    tile.lrs = (lrs >> 2) & 0x3FF;
    tile.lrt = (lrt >> 2) & 0x3FF;
    tile.fuls = util::ufixed_to_f32::<2>(uls as u32);
    tile.fult = util::ufixed_to_f32::<2>(ult as u32);
    tile.flrs = util::ufixed_to_f32::<2>(lrs as u32);
    tile.flrt = util::ufixed_to_f32::<2>(lrt as u32);

    sys.rdp.changed.set_tile(true);
}

pub fn set_scissor(sys: &mut System, mode: u8, ulx: f32, uly: f32, lrx: f32, lry: f32) {
    sys.rdp.scissor = Scissor {
        mode,
        ulx,
        uly,
        lrx,
        lry,
    };
    sys.rdp.changed.set_scissor(true);
}

/// Sets the YUV conversion coefficients from their raw 9-bit values.
pub fn set_convert(sys: &mut System, k: [u16; 6]) {
    let signed = |x: u16| (util::sign_extend::<9>(x as u32) << 1) + 1;
    sys.rdp.convert = [
        signed(k[0]),
        signed(k[1]),
        signed(k[2]),
        signed(k[3]),
        k[4] as i32 & 0x1FF,
        k[5] as i32 & 0x1FF,
    ];
}

pub fn set_key_r(sys: &mut System, center: u8, scale: u8, width: u16) {
    let key = &mut sys.rdp.key;
    key.center[0] = center as f32 / 255.0;
    key.scale[0] = scale as f32 / 255.0;
    key.width[0] = width as f32 / 255.0;
}

pub fn set_key_gb(sys: &mut System, center: [u8; 2], scale: [u8; 2], width: [u16; 2]) {
    let key = &mut sys.rdp.key;
    for i in 0..2 {
        key.center[i + 1] = center[i] as f32 / 255.0;
        key.scale[i + 1] = scale[i] as f32 / 255.0;
        key.width[i + 1] = width[i] as f32 / 255.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepthClear {
    None,
    Found,
    Cleared,
}

/// Handles a fill rectangle. Coordinates are integer pixels.
pub fn fill_rect(sys: &mut System, ulx: i32, uly: i32, mut lrx: i32, mut lry: i32) {
    let cycle = sys.rdp.cycle_type();
    if cycle == CycleType::Fill {
        lrx += 1;
        lry += 1;
    } else if lry == uly {
        lry += 1;
    }

    let rect = Rect::new(ulx as f32, uly as f32, lrx as f32, lry as f32);
    let scissor = sys.rdp.scissor;
    let full_screen = ulx == 0 && uly == 0 && lrx as f32 == scissor.lrx && lry as f32 == scissor.lry;
    let depth_clear = sys.rdp.fill.raw == DEPTH_CLEAR_COLOR;

    let mut depth = DepthClear::None;
    let color_is_depth = sys.rdp.depth_image == sys.rdp.color_image.address;
    if (color_is_depth && depth_clear) || (!color_is_depth && depth_clear && cycle == CycleType::Fill) {
        if !color_is_depth {
            let address = sys.rdp.color_image.address;
            depth::save_buffer(sys, address);
        }

        framebuffer::fill_rdram(sys, ulx, uly, lrx, lry);
        depth = DepthClear::Found;
        if sys.config.frame_buffer.n64_depth_compare {
            depth::clear_buffer(sys, rect);
        } else {
            drawer::clear_depth(sys, rect);
            depth = DepthClear::Cleared;
        }
    }

    if depth != DepthClear::Cleared {
        if cycle == CycleType::Fill {
            let color = sys.rdp.fill_color();
            if depth == DepthClear::None && full_screen {
                framebuffer::fill_rdram(sys, ulx, uly, lrx, lry);
                drawer::clear_color(sys, color);
            } else {
                drawer::draw_rect(sys, rect, color);
            }
        } else {
            drawer::draw_rect(sys, rect, Rgba::default());
        }
    }

    framebuffer::set_buffer_changed(sys, lry as f32);
    trace!(ulx, uly, lrx, lry, ?depth, "fill rectangle");
}

/// Handles a texture rectangle, whose coordinates are already converted to pixels.
pub fn texture_rect(sys: &mut System, mut rect: TexturedRect) {
    if sys.rdp.cycle_type() == CycleType::Copy {
        rect.dsdx = 1.0;
        rect.lrx += 1.0;
        rect.lry += 1.0;
    }
    rect.lry = rect.lry.max(rect.uly + 1.0);

    let tile = &sys.rdp.tiles[rect.tile as usize & 7];
    if rect.s == 0x4000 && sys.rdp.color_image.width + (tile.uls as u32) < 512 {
        rect.s = 0;
    }

    texrect::correct(sys, &mut rect);
    texrect::draw_textured_rect(sys, rect);
    framebuffer::set_buffer_changed(sys, rect.lry);
}

/// Ends the frame's rasterization: flushes pending draws and performs copy-backs.
pub fn full_sync(sys: &mut System) {
    if sys.config.frame_buffer.copy_aux_to_rdram {
        framebuffer::copy_aux(sys);
        framebuffer::remove_aux(sys);
    }

    drawer::flush(sys);

    let copy = sys.config.frame_buffer.copy_to_rdram;
    let current_is_main = framebuffer::current(sys).is_some_and(|fb| !fb.is_auxiliary(&sys.vi));
    if copy != CopyMode::Disabled && current_is_main {
        let address = sys.rdp.color_image.address;
        framebuffer::copy_to_rdram(sys, address, copy == CopyMode::Sync);
    }

    if sys.config.frame_buffer.copy_depth_to_rdram {
        depth::copy_to_rdram(sys);
    }

    debug!("full sync");
}

/// Logs a command this core does not emulate.
pub fn unsupported(name: &'static str, w0: u32, w1: u32) {
    warn!(name, w0 = format_args!("{w0:08X}"), w1 = format_args!("{w1:08X}"), "ignored command");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fill_color_follows_color_image_size() {
        let mut state = State::default();
        state.fill.raw = 0xF801_F801;
        state.color_image.size = TexelSize::Bits16;
        assert_eq!(state.fill_color(), Rgba::new(1.0, 0.0, 0.0, 1.0));

        state.fill.raw = 0x00FF_00FF;
        state.color_image.size = TexelSize::Bits32;
        assert_eq!(state.fill_color(), Rgba::new(0.0, 1.0, 0.0, 1.0));
    }

    #[test]
    fn image_bytes_per_line() {
        let image = Image {
            width: 320,
            size: TexelSize::Bits16,
            ..Default::default()
        };
        assert_eq!(image.bpl(), 640);

        let image = Image {
            width: 64,
            size: TexelSize::Bits4,
            ..Default::default()
        };
        assert_eq!(image.bpl(), 32);
    }

    #[test]
    fn other_mode_packs_both_words() {
        let mut state = State::default();
        state.other_mode_h = OtherModeH::from_bits(0x0010_0000);
        state.other_mode_l = OtherModeL::from_bits(0x0000_0030);
        assert_eq!(state.other_mode(), 0x0010_0000_0000_0030);
        assert_eq!(state.cycle_type(), CycleType::Two);
    }
}
