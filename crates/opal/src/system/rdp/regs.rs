//! Register layouts of the RDP.

use bitos::{
    bitos,
    integer::{u2, u3, u4, u5, u9},
};

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CycleType {
    #[default]
    One = 0b00,
    Two = 0b01,
    Copy = 0b10,
    Fill = 0b11,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureLut {
    #[default]
    None = 0b00,
    Reserved = 0b01,
    Rgba16 = 0b10,
    Ia16 = 0b11,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFilter {
    #[default]
    Point = 0b00,
    Reserved = 0b01,
    Bilerp = 0b10,
    Average = 0b11,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AlphaCompare {
    #[default]
    None = 0b00,
    Threshold = 0b01,
    Reserved = 0b10,
    Dither = 0b11,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ZMode {
    #[default]
    Opaque = 0b00,
    Interpenetrating = 0b01,
    Transparent = 0b10,
    Decal = 0b11,
}

/// Pixel format of an image in memory or a tile in TMEM.
#[bitos(3)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    #[default]
    Rgba = 0,
    Yuv = 1,
    ColorIndexed = 2,
    IntensityAlpha = 3,
    Intensity = 4,
    Reserved0 = 5,
    Reserved1 = 6,
    Reserved2 = 7,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TexelSize {
    #[default]
    Bits4 = 0,
    Bits8 = 1,
    Bits16 = 2,
    Bits32 = 3,
}

impl TexelSize {
    #[inline(always)]
    pub fn bits(self) -> u32 {
        4 << self as u32
    }

    /// Bytes per texel, where 4-bit texels count as zero.
    #[inline(always)]
    pub fn bytes(self) -> u32 {
        (1 << self as u32) >> 1
    }
}

/// High word of the other mode register.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OtherModeH {
    #[bits(4..6)]
    pub alpha_dither: u2,
    #[bits(6..8)]
    pub rgb_dither: u2,
    #[bits(8)]
    pub combine_key: bool,
    #[bits(9..12)]
    pub texture_convert: u3,
    #[bits(12..14)]
    pub texture_filter: TextureFilter,
    #[bits(14..16)]
    pub texture_lut: TextureLut,
    #[bits(16)]
    pub texture_lod: bool,
    #[bits(17..19)]
    pub texture_detail: u2,
    #[bits(19)]
    pub texture_persp: bool,
    #[bits(20..22)]
    pub cycle_type: CycleType,
    #[bits(22)]
    pub color_dither: bool,
    #[bits(23)]
    pub pipeline_mode: bool,
}

/// Low word of the other mode register.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OtherModeL {
    #[bits(0..2)]
    pub alpha_compare: AlphaCompare,
    /// Use the primitive depth instead of the per pixel depth.
    #[bits(2)]
    pub depth_source_prim: bool,
    #[bits(3)]
    pub aa_enable: bool,
    #[bits(4)]
    pub z_compare: bool,
    #[bits(5)]
    pub z_update: bool,
    #[bits(6)]
    pub image_read: bool,
    #[bits(7)]
    pub clear_on_cvg: bool,
    #[bits(8..10)]
    pub cvg_dest: u2,
    #[bits(10..12)]
    pub z_mode: ZMode,
    #[bits(12)]
    pub cvg_x_alpha: bool,
    #[bits(13)]
    pub alpha_cvg_select: bool,
    #[bits(14)]
    pub force_blend: bool,
    /// Blender configuration for both cycles.
    #[bits(16..32)]
    pub blender: u16,
}

/// The color combiner mux. Cycle 0 and cycle 1 each compute `(a - b) * c + d` for both color and
/// alpha.
#[bitos(64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Combine {
    #[bits(0..3)]
    pub alpha_add_1: u3,
    #[bits(3..6)]
    pub alpha_sub_b_1: u3,
    #[bits(6..9)]
    pub rgb_add_1: u3,
    #[bits(9..12)]
    pub alpha_add_0: u3,
    #[bits(12..15)]
    pub alpha_sub_b_0: u3,
    #[bits(15..18)]
    pub rgb_add_0: u3,
    #[bits(18..21)]
    pub alpha_mul_1: u3,
    #[bits(21..24)]
    pub alpha_sub_a_1: u3,
    #[bits(24..28)]
    pub rgb_sub_b_1: u4,
    #[bits(28..32)]
    pub rgb_sub_b_0: u4,
    #[bits(32..37)]
    pub rgb_mul_1: u5,
    #[bits(37..41)]
    pub rgb_sub_a_1: u4,
    #[bits(41..44)]
    pub alpha_mul_0: u3,
    #[bits(44..47)]
    pub alpha_sub_a_0: u3,
    #[bits(47..52)]
    pub rgb_mul_0: u5,
    #[bits(52..56)]
    pub rgb_sub_a_0: u4,
}

impl Combine {
    const TEXEL0: u8 = 1;
    const TEXEL1: u8 = 2;
    const NOISE: u8 = 7;

    /// Inputs of one cycle, as `[rgb a, rgb b, rgb c, rgb d, alpha a, alpha b, alpha c, alpha d]`.
    fn cycle(&self, cycle: usize) -> [u8; 8] {
        if cycle == 0 {
            [
                self.rgb_sub_a_0().value(),
                self.rgb_sub_b_0().value(),
                self.rgb_mul_0().value(),
                self.rgb_add_0().value(),
                self.alpha_sub_a_0().value(),
                self.alpha_sub_b_0().value(),
                self.alpha_mul_0().value(),
                self.alpha_add_0().value(),
            ]
        } else {
            [
                self.rgb_sub_a_1().value(),
                self.rgb_sub_b_1().value(),
                self.rgb_mul_1().value(),
                self.rgb_add_1().value(),
                self.alpha_sub_a_1().value(),
                self.alpha_sub_b_1().value(),
                self.alpha_mul_1().value(),
                self.alpha_add_1().value(),
            ]
        }
    }

    /// Whether the combiner samples texture `unit` (0 or 1).
    pub fn uses_texel(&self, unit: u8, two_cycle: bool) -> bool {
        let texel = if unit == 0 { Self::TEXEL0 } else { Self::TEXEL1 };
        let cycles = if two_cycle { 2 } else { 1 };

        (0..cycles).any(|cycle| {
            let [a, b, c, d, aa, ab, ac, ad] = self.cycle(cycle);
            // rgb multiplier also selects texel alpha at 8 + unit
            a == texel
                || b == texel
                || c == texel
                || c == texel + 7
                || d == texel
                || aa == texel
                || ab == texel
                || ac == texel
                || ad == texel
        })
    }

    /// Whether the combiner reads the noise input.
    pub fn uses_noise(&self, two_cycle: bool) -> bool {
        let cycles = if two_cycle { 2 } else { 1 };
        (0..cycles).any(|cycle| self.cycle(cycle)[0] == Self::NOISE)
    }
}

/// The SETTILE command, with the first command word in the upper 32 bits.
#[bitos(64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileCommand {
    #[bits(0..4)]
    pub shift_s: u4,
    #[bits(4..8)]
    pub mask_s: u4,
    #[bits(8)]
    pub mirror_s: bool,
    #[bits(9)]
    pub clamp_s: bool,
    #[bits(10..14)]
    pub shift_t: u4,
    #[bits(14..18)]
    pub mask_t: u4,
    #[bits(18)]
    pub mirror_t: bool,
    #[bits(19)]
    pub clamp_t: bool,
    #[bits(20..24)]
    pub palette: u4,
    #[bits(24..27)]
    pub tile: u3,
    /// TMEM address in 64-bit words.
    #[bits(32..41)]
    pub tmem: u9,
    /// Row length in 64-bit words.
    #[bits(41..50)]
    pub line: u9,
    #[bits(51..53)]
    pub size: TexelSize,
    #[bits(53..56)]
    pub format: ImageFormat,
}

/// RDP state that changed since derived state was last rebuilt.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdpChanged {
    #[bits(0)]
    pub combine: bool,
    #[bits(1)]
    pub render_mode: bool,
    #[bits(2)]
    pub cycle_type: bool,
    #[bits(3)]
    pub alpha_compare: bool,
    #[bits(4)]
    pub scissor: bool,
    #[bits(5)]
    pub tile: bool,
    #[bits(6)]
    pub tmem: bool,
    #[bits(7)]
    pub fog_color: bool,
    #[bits(8)]
    pub blend_color: bool,
    #[bits(9)]
    pub color_buffer: bool,
    #[bits(10)]
    pub fb_texture: bool,
}

impl RdpChanged {
    /// Whether anything the draw state depends on changed.
    pub fn any(&self) -> bool {
        self.to_bits() != 0
    }
}
