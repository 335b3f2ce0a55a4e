use bitos::{
    bitos,
    integer::{u10, u12},
};

/// Pixel size of the frame the VI scans out.
#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelType {
    #[default]
    Blank = 0b00,
    Reserved = 0b01,
    Rgba5551 = 0b10,
    Rgba8888 = 0b11,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntiAlias {
    /// Anti-aliasing and resampling, always fetching extra lines.
    #[default]
    Always = 0b00,
    /// Anti-aliasing and resampling, fetching extra lines when needed.
    Resample = 0b01,
    /// Resampling only.
    ResampleOnly = 0b10,
    /// Neither anti-aliasing nor resampling.
    Replicate = 0b11,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    #[bits(0..2)]
    pub pixel_type: PixelType,
    #[bits(2)]
    pub gamma_dither: bool,
    #[bits(3)]
    pub gamma: bool,
    #[bits(4)]
    pub divot: bool,
    /// Set for interlaced output.
    #[bits(6)]
    pub serrate: bool,
    #[bits(8..10)]
    pub anti_alias: AntiAlias,
}

/// Start and end of the active video, horizontally in pixels or vertically in half lines.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    #[bits(0..10)]
    pub end: u10,
    #[bits(16..26)]
    pub start: u10,
}

impl Span {
    /// Length of the span, zero when it is inverted.
    pub fn len(&self) -> u32 {
        (self.end().value() as u32).saturating_sub(self.start().value() as u32)
    }
}

/// A scale register: 2.10 fixed point increment and subpixel offset.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scale {
    #[bits(0..12)]
    pub increment: u12,
    #[bits(16..26)]
    pub offset: u10,
}

impl Scale {
    pub fn factor(&self) -> f32 {
        util::ufixed_to_f32::<10>(self.increment().value() as u32)
    }
}

/// The VI registers the pipeline core depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub status: Status,
    /// Address of the frame being scanned out.
    pub origin: u32,
    /// Width of the frame in memory, in pixels.
    pub width: u32,
    /// Number of half lines per field.
    pub v_sync: u32,
    pub h_start: Span,
    pub v_start: Span,
    pub x_scale: Scale,
    pub y_scale: Scale,
}
