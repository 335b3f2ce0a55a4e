use bitut::BitUtils;
use ordered_float::OrderedFloat;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Converts a value in range `0..=OLD_MAX` to a value in the range `0..=NEW_MAX`.
#[inline(always)]
pub fn convert_range<const OLD_MAX: u32, const NEW_MAX: u32>(value: u8) -> u8 {
    const {
        assert!(OLD_MAX != 0);
        assert!(OLD_MAX <= 255);
        assert!(NEW_MAX <= 255);
    };

    let value = value as u32;
    ((value * NEW_MAX + OLD_MAX / 2) / OLD_MAX) as u8
}

#[inline(always)]
fn fast_range_conv_31_to_255(value: u8) -> u8 {
    // replicate the top bits into the low bits
    (value << 3) | (value >> 2)
}

/// A single RGBA8 pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Immutable, IntoBytes, FromBytes, Default)]
#[repr(C)]
pub struct Rgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba8 {
    pub const TRANSPARENT: Self = Self::new(0, 0, 0, 0);

    #[inline(always)]
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Decodes a 16-bit RGBA 5/5/5/1 texel.
    #[inline(always)]
    pub fn from_rgba5551(value: u16) -> Self {
        Self {
            r: fast_range_conv_31_to_255(value.bits(11, 16) as u8),
            g: fast_range_conv_31_to_255(value.bits(6, 11) as u8),
            b: fast_range_conv_31_to_255(value.bits(1, 6) as u8),
            a: if value.bit(0) { 255 } else { 0 },
        }
    }

    /// Encodes this pixel as a 16-bit RGBA 5/5/5/1 value.
    #[inline(always)]
    pub fn to_rgba5551(self) -> u16 {
        0u16.with_bit(0, self.a >= 128)
            .with_bits(1, 6, (self.b >> 3) as u16)
            .with_bits(6, 11, (self.g >> 3) as u16)
            .with_bits(11, 16, (self.r >> 3) as u16)
    }

    /// Decodes a 32-bit RGBA 8/8/8/8 value, red in the most significant byte.
    #[inline(always)]
    pub fn from_rgba8888(value: u32) -> Self {
        let [r, g, b, a] = value.to_be_bytes();
        Self { r, g, b, a }
    }

    #[inline(always)]
    pub fn to_rgba8888(self) -> u32 {
        u32::from_be_bytes([self.r, self.g, self.b, self.a])
    }

    /// Decodes a 16-bit intensity/alpha texel, intensity in the high byte.
    #[inline(always)]
    pub fn from_ia16(value: u16) -> Self {
        let [intensity, alpha] = value.to_be_bytes();
        Self::new(intensity, intensity, intensity, alpha)
    }

    /// Decodes an 8-bit intensity/alpha texel, intensity in the high nibble.
    #[inline(always)]
    pub fn from_ia8(value: u8) -> Self {
        let intensity = convert_range::<15, 255>(value.bits(4, 8));
        let alpha = convert_range::<15, 255>(value.bits(0, 4));
        Self::new(intensity, intensity, intensity, alpha)
    }

    /// Decodes a 4-bit intensity/alpha texel: three bits of intensity and one of alpha.
    #[inline(always)]
    pub fn from_ia4(value: u8) -> Self {
        let intensity = convert_range::<7, 255>(value.bits(1, 4));
        let alpha = if value.bit(0) { 255 } else { 0 };
        Self::new(intensity, intensity, intensity, alpha)
    }

    /// Decodes a 4-bit intensity texel. Alpha equals intensity.
    #[inline(always)]
    pub fn from_i4(value: u8) -> Self {
        let intensity = convert_range::<15, 255>(value.bits(0, 4));
        Self::new(intensity, intensity, intensity, intensity)
    }

    /// Decodes an 8-bit intensity texel. Alpha equals intensity.
    #[inline(always)]
    pub fn from_i8(value: u8) -> Self {
        Self::new(value, value, value, value)
    }
}

impl From<Rgba> for Rgba8 {
    fn from(value: Rgba) -> Self {
        let conv = |x: f32| (x.clamp(0.0, 1.0) * 255.0).round() as u8;
        Self {
            r: conv(value.r),
            g: conv(value.g),
            b: conv(value.b),
            a: conv(value.a),
        }
    }
}

/// A floating point RGBA color, each channel normally in `0.0..=1.0`.
#[derive(Clone, Copy, Immutable, IntoBytes, Default)]
#[repr(C)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);

    #[inline(always)]
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Unpacks a command word holding `r, g, b, a` bytes from most to least significant.
    #[inline(always)]
    pub fn from_word(word: u32) -> Self {
        Self::from(Rgba8::from_rgba8888(word))
    }

    #[inline(always)]
    pub fn rgb(self) -> Self {
        Self {
            r: self.r,
            g: self.g,
            b: self.b,
            a: 1.0,
        }
    }

    /// Clamps every channel to `0.0..=1.0`.
    #[inline(always)]
    pub fn saturate(self) -> Self {
        Self {
            r: self.r.clamp(0.0, 1.0),
            g: self.g.clamp(0.0, 1.0),
            b: self.b.clamp(0.0, 1.0),
            a: self.a.clamp(0.0, 1.0),
        }
    }
}

impl std::fmt::Debug for Rgba {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rgba({}, {}, {}, {})", self.r, self.g, self.b, self.a)
    }
}

impl PartialEq for Rgba {
    fn eq(&self, other: &Self) -> bool {
        OrderedFloat(self.r) == OrderedFloat(other.r)
            && OrderedFloat(self.g) == OrderedFloat(other.g)
            && OrderedFloat(self.b) == OrderedFloat(other.b)
            && OrderedFloat(self.a) == OrderedFloat(other.a)
    }
}

impl Eq for Rgba {}

impl std::hash::Hash for Rgba {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        OrderedFloat(self.r).hash(state);
        OrderedFloat(self.g).hash(state);
        OrderedFloat(self.b).hash(state);
        OrderedFloat(self.a).hash(state);
    }
}

impl From<Rgba8> for Rgba {
    fn from(value: Rgba8) -> Self {
        Self {
            r: value.r as f32 / 255.0,
            g: value.g as f32 / 255.0,
            b: value.b as f32 / 255.0,
            a: value.a as f32 / 255.0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rgba5551() {
        assert_eq!(Rgba8::from_rgba5551(0xF801), Rgba8::new(255, 0, 0, 255));
        assert_eq!(Rgba8::from_rgba5551(0x07C0), Rgba8::new(0, 255, 0, 0));
        assert_eq!(Rgba8::from_rgba5551(0x003E), Rgba8::new(0, 0, 255, 0));

        for value in [0x0000, 0xFFFF, 0x8421, 0x1234 & !1] {
            assert_eq!(Rgba8::from_rgba5551(value).to_rgba5551(), value);
        }
    }

    #[test]
    fn intensity_alpha() {
        assert_eq!(Rgba8::from_ia16(0x80FF), Rgba8::new(0x80, 0x80, 0x80, 0xFF));
        assert_eq!(Rgba8::from_ia8(0xF0), Rgba8::new(255, 255, 255, 0));
        assert_eq!(Rgba8::from_ia4(0b1111), Rgba8::new(255, 255, 255, 255));
        assert_eq!(Rgba8::from_ia4(0b0001), Rgba8::new(0, 0, 0, 255));
        assert_eq!(Rgba8::from_i4(0xF), Rgba8::new(255, 255, 255, 255));
    }

    #[test]
    fn words() {
        let color = Rgba::from_word(0xFF00_00FF);
        assert_eq!(color, Rgba::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(Rgba8::from(color).to_rgba8888(), 0xFF00_00FF);
    }
}
