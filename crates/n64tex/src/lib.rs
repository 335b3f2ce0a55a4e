//! Decoding of texels stored in TMEM, the 4 KiB texture memory of the RDP.
//!
//! Texels are stored in rows of 64-bit words. Odd rows have their 32-bit halves swapped, which
//! every format has to undo when addressing. 32-bit texels are split across both halves of TMEM:
//! red and green in the low half, blue and alpha in the high half. Palettes live in the high half
//! with every 16-bit entry replicated four times.

use std::marker::PhantomData;

use bitut::BitUtils;
use color::Rgba8;

/// Size of TMEM in bytes.
pub const TMEM_LEN: usize = 4096;

/// Byte offset of the high half of TMEM.
pub const HIGH_HALF: usize = TMEM_LEN / 2;

/// Contents of TMEM, in big endian byte order.
pub type Tmem = [u8; TMEM_LEN];

/// Where a texture lives inside TMEM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Layout {
    /// Byte offset of the first row.
    pub base: usize,
    /// Distance between rows, in bytes.
    pub stride: usize,
    pub width: usize,
    pub height: usize,
    /// Palette bank for 4-bit color indexed textures.
    pub palette: u8,
}

impl Layout {
    /// Address of the byte holding texel `x` of row `y` for a format with `bits` per texel.
    #[inline(always)]
    fn address(&self, x: usize, y: usize, bits: usize) -> usize {
        let mut address = self.base + y * self.stride + x * bits / 8;
        if y & 1 == 1 {
            address ^= 4;
        }

        address & (TMEM_LEN - 1)
    }

    /// Like [`Layout::address`], but wrapping inside one half of TMEM.
    #[inline(always)]
    fn split_address(&self, x: usize, y: usize) -> usize {
        let mut address = self.base + y * self.stride + x * 2;
        if y & 1 == 1 {
            address ^= 4;
        }

        address & (HIGH_HALF - 1)
    }
}

#[inline(always)]
fn read_u16(tmem: &Tmem, address: usize) -> u16 {
    let address = address & (TMEM_LEN - 2);
    u16::from_be_bytes([tmem[address], tmem[address + 1]])
}

#[inline(always)]
fn read_nibble(tmem: &Tmem, address: usize, x: usize) -> u8 {
    let value = tmem[address];
    if x & 1 == 0 {
        value.bits(4, 8)
    } else {
        value.bits(0, 4)
    }
}

/// Returns the 16-bit palette entry at `index`.
#[inline(always)]
pub fn palette_entry(tmem: &Tmem, index: u8) -> u16 {
    read_u16(tmem, HIGH_HALF + index as usize * 8)
}

pub trait Format {
    const BITS_PER_TEXEL: usize;

    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8;
}

/// Decodes a whole texture described by `layout`.
pub fn decode<F: Format>(tmem: &Tmem, layout: &Layout) -> Vec<Rgba8> {
    let mut pixels = Vec::with_capacity(layout.width * layout.height);
    for y in 0..layout.height {
        for x in 0..layout.width {
            pixels.push(F::texel(tmem, layout, x, y));
        }
    }

    pixels
}

/// Number of bytes a row of `width` texels of format `F` occupies, rounded up to whole words.
pub fn row_bytes<F: Format>(width: usize) -> usize {
    (width * F::BITS_PER_TEXEL).div_ceil(64) * 8
}

pub struct Rgba16;

impl Format for Rgba16 {
    const BITS_PER_TEXEL: usize = 16;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.address(x, y, Self::BITS_PER_TEXEL);
        Rgba8::from_rgba5551(read_u16(tmem, address))
    }
}

pub struct Rgba32;

impl Format for Rgba32 {
    const BITS_PER_TEXEL: usize = 32;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.split_address(x, y);
        let [r, g] = read_u16(tmem, address).to_be_bytes();
        let [b, a] = read_u16(tmem, address | HIGH_HALF).to_be_bytes();
        Rgba8::new(r, g, b, a)
    }
}

pub struct IntensityAlpha4;

impl Format for IntensityAlpha4 {
    const BITS_PER_TEXEL: usize = 4;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.address(x, y, Self::BITS_PER_TEXEL);
        Rgba8::from_ia4(read_nibble(tmem, address, x))
    }
}

pub struct IntensityAlpha8;

impl Format for IntensityAlpha8 {
    const BITS_PER_TEXEL: usize = 8;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.address(x, y, Self::BITS_PER_TEXEL);
        Rgba8::from_ia8(tmem[address])
    }
}

pub struct IntensityAlpha16;

impl Format for IntensityAlpha16 {
    const BITS_PER_TEXEL: usize = 16;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.address(x, y, Self::BITS_PER_TEXEL);
        Rgba8::from_ia16(read_u16(tmem, address))
    }
}

pub struct Intensity4;

impl Format for Intensity4 {
    const BITS_PER_TEXEL: usize = 4;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.address(x, y, Self::BITS_PER_TEXEL);
        Rgba8::from_i4(read_nibble(tmem, address, x))
    }
}

pub struct Intensity8;

impl Format for Intensity8 {
    const BITS_PER_TEXEL: usize = 8;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.address(x, y, Self::BITS_PER_TEXEL);
        Rgba8::from_i8(tmem[address])
    }
}

/// Interpretation of palette entries.
pub trait Lut {
    fn convert(value: u16) -> Rgba8;
}

pub struct Rgba16Lut;

impl Lut for Rgba16Lut {
    #[inline(always)]
    fn convert(value: u16) -> Rgba8 {
        Rgba8::from_rgba5551(value)
    }
}

pub struct IntensityAlpha16Lut;

impl Lut for IntensityAlpha16Lut {
    #[inline(always)]
    fn convert(value: u16) -> Rgba8 {
        Rgba8::from_ia16(value)
    }
}

/// 4-bit color indexed texels. The tile's palette selects one of 16 banks of 16 entries.
pub struct ColorIndexed4<L>(PhantomData<L>);

impl<L: Lut> Format for ColorIndexed4<L> {
    const BITS_PER_TEXEL: usize = 4;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.address(x, y, Self::BITS_PER_TEXEL);
        let index = (layout.palette << 4) | read_nibble(tmem, address, x);
        L::convert(palette_entry(tmem, index))
    }
}

/// 8-bit color indexed texels.
pub struct ColorIndexed8<L>(PhantomData<L>);

impl<L: Lut> Format for ColorIndexed8<L> {
    const BITS_PER_TEXEL: usize = 8;

    #[inline(always)]
    fn texel(tmem: &Tmem, layout: &Layout, x: usize, y: usize) -> Rgba8 {
        let address = layout.address(x, y, Self::BITS_PER_TEXEL);
        L::convert(palette_entry(tmem, tmem[address]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn layout(width: usize, height: usize, stride: usize) -> Layout {
        Layout {
            base: 0,
            stride,
            width,
            height,
            palette: 0,
        }
    }

    #[test]
    fn rgba16_odd_rows_are_swapped() {
        let mut tmem = [0u8; TMEM_LEN];
        // row 0, texel 0: red
        tmem[0..2].copy_from_slice(&0xF801u16.to_be_bytes());
        // row 1, texel 0 lives in the second dword of the row
        tmem[8 + 4..8 + 6].copy_from_slice(&0x07C1u16.to_be_bytes());

        let pixels = decode::<Rgba16>(&tmem, &layout(4, 2, 8));
        assert_eq!(pixels[0], Rgba8::new(255, 0, 0, 255));
        assert_eq!(pixels[4], Rgba8::new(0, 255, 0, 255));
    }

    #[test]
    fn rgba32_is_split() {
        let mut tmem = [0u8; TMEM_LEN];
        tmem[0..2].copy_from_slice(&[0x10, 0x20]);
        tmem[HIGH_HALF..HIGH_HALF + 2].copy_from_slice(&[0x30, 0x40]);

        let pixels = decode::<Rgba32>(&tmem, &layout(1, 1, 8));
        assert_eq!(pixels[0], Rgba8::new(0x10, 0x20, 0x30, 0x40));
    }

    #[test]
    fn nibbles() {
        let mut tmem = [0u8; TMEM_LEN];
        tmem[0] = 0xF0;

        let pixels = decode::<Intensity4>(&tmem, &layout(2, 1, 8));
        assert_eq!(pixels[0], Rgba8::new(255, 255, 255, 255));
        assert_eq!(pixels[1], Rgba8::new(0, 0, 0, 0));
    }

    #[test]
    fn color_indexed_uses_palette_bank() {
        let mut tmem = [0u8; TMEM_LEN];
        tmem[0] = 0x12;
        let index = (3 << 4) | 1;
        let entry = HIGH_HALF + index * 8;
        tmem[entry..entry + 2].copy_from_slice(&0x003Fu16.to_be_bytes());

        let layout = Layout {
            palette: 3,
            ..layout(1, 1, 8)
        };

        let pixels = decode::<ColorIndexed4<Rgba16Lut>>(&tmem, &layout);
        assert_eq!(pixels[0], Rgba8::new(0, 0, 255, 255));
    }

    #[test]
    fn row_sizes() {
        assert_eq!(row_bytes::<Intensity4>(16), 8);
        assert_eq!(row_bytes::<Intensity4>(17), 16);
        assert_eq!(row_bytes::<Rgba16>(4), 8);
    }
}
