//! Rasterizer commands, shared by every dialect and by raw RDP command lists.

use bitos::integer::{u2, u3};
use bitut::BitUtils;

use crate::system::rdp::regs::{ImageFormat, TexelSize, TileCommand};

/// A texture rectangle, with its coordinates still in hardware fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexRect {
    pub tile: u8,
    /// Screen coordinates, 10.2.
    pub ulx: u16,
    pub uly: u16,
    pub lrx: u16,
    pub lry: u16,
    /// Texture coordinates of the upper left corner, s10.5.
    pub s: i16,
    pub t: i16,
    /// Texture coordinate increments, s5.10.
    pub dsdx: i16,
    pub dtdy: i16,
    pub flip: bool,
}

/// Coordinates of a load or tile size command, 10.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub tile: u8,
    pub uls: u16,
    pub ult: u16,
    pub lrs: u16,
    pub lrt: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RdpCommand {
    Noop,
    SetColorImage {
        format: ImageFormat,
        size: TexelSize,
        width: u32,
        address: u32,
    },
    SetDepthImage(u32),
    SetTextureImage {
        format: ImageFormat,
        size: TexelSize,
        width: u32,
        address: u32,
    },
    SetCombine(u64),
    SetEnvColor(u32),
    SetPrimColor {
        m: u8,
        l: u8,
        color: u32,
    },
    SetBlendColor(u32),
    SetFogColor(u32),
    SetFillColor(u32),
    SetPrimDepth {
        z: u16,
        dz: u16,
    },
    SetTile(TileCommand),
    SetTileSize(TileRect),
    LoadTile(TileRect),
    /// `lrt` holds the line counter increment instead of a coordinate.
    LoadBlock(TileRect),
    LoadTlut(TileRect),
    SetOtherMode {
        h: u32,
        l: u32,
    },
    SetScissor {
        mode: u8,
        ulx: u16,
        uly: u16,
        lrx: u16,
        lry: u16,
    },
    SetConvert([u16; 6]),
    SetKeyR {
        center: u8,
        scale: u8,
        width: u16,
    },
    SetKeyGb {
        center: [u8; 2],
        scale: [u8; 2],
        width: [u16; 2],
    },
    FillRect {
        ulx: i32,
        uly: i32,
        lrx: i32,
        lry: i32,
    },
    TextureRect(TexRect),
    FullSync,
    TileSync,
    PipeSync,
    LoadSync,
    /// Rasterizer triangle commands, which are not emulated.
    Triangle(u8),
    Unknown(u8),
}

impl RdpCommand {
    /// Whether executing this command has no visible effect on drawing.
    pub fn is_transparent(&self) -> bool {
        matches!(
            self,
            Self::Noop | Self::TileSync | Self::PipeSync | Self::LoadSync
        )
    }
}

#[inline(always)]
fn tile_rect(w0: u32, w1: u32) -> TileRect {
    TileRect {
        tile: w1.bits(24, 27) as u8,
        uls: w0.bits(12, 24) as u16,
        ult: w0.bits(0, 12) as u16,
        lrs: w1.bits(12, 24) as u16,
        lrt: w1.bits(0, 12) as u16,
    }
}

#[inline(always)]
fn image(w0: u32) -> (ImageFormat, TexelSize, u32) {
    (
        ImageFormat::from_bits(u3::new(w0.bits(21, 24) as u8)),
        TexelSize::from_bits(u2::new(w0.bits(19, 21) as u8)),
        w0.bits(0, 12) + 1,
    )
}

/// Decodes a single-word rasterizer command. Texture rectangles are handled by
/// [`texture_rect`], as their length depends on where they appear.
pub fn decode(w0: u32, w1: u32) -> RdpCommand {
    let opcode = (w0 >> 24) as u8;
    match opcode {
        0xC0 => RdpCommand::Noop,
        0xC8..=0xCF => RdpCommand::Triangle(opcode),
        0xE6 => RdpCommand::LoadSync,
        0xE7 => RdpCommand::PipeSync,
        0xE8 => RdpCommand::TileSync,
        0xE9 => RdpCommand::FullSync,
        0xEA => RdpCommand::SetKeyGb {
            center: [w1.bits(24, 32) as u8, w1.bits(8, 16) as u8],
            scale: [w1.bits(16, 24) as u8, w1.bits(0, 8) as u8],
            width: [w0.bits(12, 24) as u16, w0.bits(0, 12) as u16],
        },
        0xEB => RdpCommand::SetKeyR {
            center: w1.bits(8, 16) as u8,
            scale: w1.bits(0, 8) as u8,
            width: w1.bits(16, 28) as u16,
        },
        0xEC => RdpCommand::SetConvert([
            w0.bits(13, 22) as u16,
            w0.bits(4, 13) as u16,
            ((w0.bits(0, 4) << 5) | w1.bits(27, 32)) as u16,
            w1.bits(18, 27) as u16,
            w1.bits(9, 18) as u16,
            w1.bits(0, 9) as u16,
        ]),
        0xED => RdpCommand::SetScissor {
            mode: w1.bits(24, 26) as u8,
            ulx: w0.bits(12, 24) as u16,
            uly: w0.bits(0, 12) as u16,
            lrx: w1.bits(12, 24) as u16,
            lry: w1.bits(0, 12) as u16,
        },
        0xEE => RdpCommand::SetPrimDepth {
            z: w1.bits(16, 32) as u16,
            dz: w1.bits(0, 16) as u16,
        },
        0xEF => RdpCommand::SetOtherMode {
            h: w0 & 0x00FF_FFFF,
            l: w1,
        },
        0xF0 => RdpCommand::LoadTlut(tile_rect(w0, w1)),
        0xF2 => RdpCommand::SetTileSize(tile_rect(w0, w1)),
        0xF3 => RdpCommand::LoadBlock(tile_rect(w0, w1)),
        0xF4 => RdpCommand::LoadTile(tile_rect(w0, w1)),
        0xF5 => RdpCommand::SetTile(TileCommand::from_bits(((w0 as u64) << 32) | w1 as u64)),
        0xF6 => RdpCommand::FillRect {
            ulx: w1.bits(14, 24) as i32,
            uly: w1.bits(2, 12) as i32,
            lrx: w0.bits(14, 24) as i32,
            lry: w0.bits(2, 12) as i32,
        },
        0xF7 => RdpCommand::SetFillColor(w1),
        0xF8 => RdpCommand::SetFogColor(w1),
        0xF9 => RdpCommand::SetBlendColor(w1),
        0xFA => RdpCommand::SetPrimColor {
            m: w0.bits(8, 13) as u8,
            l: w0.bits(0, 8) as u8,
            color: w1,
        },
        0xFB => RdpCommand::SetEnvColor(w1),
        0xFC => RdpCommand::SetCombine((((w0 & 0x00FF_FFFF) as u64) << 32) | w1 as u64),
        0xFD => {
            let (format, size, width) = image(w0);
            RdpCommand::SetTextureImage {
                format,
                size,
                width,
                address: w1,
            }
        }
        0xFE => RdpCommand::SetDepthImage(w1),
        0xFF => {
            let (format, size, width) = image(w0);
            RdpCommand::SetColorImage {
                format,
                size,
                width,
                address: w1,
            }
        }
        _ => RdpCommand::Unknown(opcode),
    }
}

/// Builds a texture rectangle from its four command words.
pub fn texture_rect(w0: u32, w1: u32, w2: u32, w3: u32) -> TexRect {
    TexRect {
        tile: w1.bits(24, 27) as u8,
        ulx: w1.bits(12, 24) as u16,
        uly: w1.bits(0, 12) as u16,
        lrx: w0.bits(12, 24) as u16,
        lry: w0.bits(0, 12) as u16,
        s: (w2 >> 16) as i16,
        t: w2 as i16,
        dsdx: (w3 >> 16) as i16,
        dtdy: w3 as i16,
        flip: (w0 >> 24) == 0xE5,
    }
}

/// Length in bytes of a raw rasterizer command with the given opcode.
pub fn raw_length(opcode: u8) -> u32 {
    match opcode {
        0xC8..=0xCF => {
            let mut length = 32;
            if opcode & 0x4 != 0 {
                length += 64;
            }
            if opcode & 0x2 != 0 {
                length += 64;
            }
            if opcode & 0x1 != 0 {
                length += 16;
            }
            length
        }
        0xE4 | 0xE5 => 16,
        _ => 8,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn images() {
        // rgba16, 320 wide
        let cmd = decode(0xFF10_013F, 0x0010_0000);
        assert_eq!(
            cmd,
            RdpCommand::SetColorImage {
                format: ImageFormat::Rgba,
                size: TexelSize::Bits16,
                width: 320,
                address: 0x0010_0000,
            }
        );

        // ci8, 32 wide
        let cmd = decode(0xFD48_001F, 0x0200_0000);
        assert_eq!(
            cmd,
            RdpCommand::SetTextureImage {
                format: ImageFormat::ColorIndexed,
                size: TexelSize::Bits8,
                width: 32,
                address: 0x0200_0000,
            }
        );
    }

    #[test]
    fn fill_and_scissor() {
        // fill (0, 0) to (319, 239)
        let cmd = decode(0xF64F_C3BC, 0x0000_0000);
        assert_eq!(
            cmd,
            RdpCommand::FillRect {
                ulx: 0,
                uly: 0,
                lrx: 319,
                lry: 239,
            }
        );

        let cmd = decode(0xED00_0000, 0x0050_03C0);
        assert_eq!(
            cmd,
            RdpCommand::SetScissor {
                mode: 0,
                ulx: 0,
                uly: 0,
                lrx: 320 << 2,
                lry: 240 << 2,
            }
        );
    }

    #[test]
    fn loads() {
        let cmd = decode(0xF300_0000, 0x0707_F800);
        assert_eq!(
            cmd,
            RdpCommand::LoadBlock(TileRect {
                tile: 7,
                uls: 0,
                ult: 0,
                lrs: 0x7F,
                lrt: 0x800,
            })
        );

        let cmd = decode(0xF000_0000, 0x0703_C000);
        assert_eq!(
            cmd,
            RdpCommand::LoadTlut(TileRect {
                tile: 7,
                uls: 0,
                ult: 0,
                lrs: 15 << 2,
                lrt: 0,
            })
        );
    }

    #[test]
    fn combine_drops_opcode() {
        assert_eq!(
            decode(0xFC12_7E24, 0xFFFF_F9FC),
            RdpCommand::SetCombine(0x0012_7E24_FFFF_F9FC)
        );
    }

    #[test]
    fn texture_rectangle() {
        let rect = texture_rect(0xE450_03C0, 0x0100_0000, 0x0000_0000, 0x0400_0400);
        assert_eq!(rect.tile, 1);
        assert_eq!((rect.lrx, rect.lry), (320 << 2, 240 << 2));
        assert_eq!((rect.dsdx, rect.dtdy), (1 << 10, 1 << 10));
        assert!(!rect.flip);
        assert!(texture_rect(0xE500_0000, 0, 0, 0).flip);
    }

    #[test]
    fn raw_lengths() {
        assert_eq!(raw_length(0xC8), 32);
        assert_eq!(raw_length(0xCF), 32 + 64 + 64 + 16);
        assert_eq!(raw_length(0xE4), 16);
        assert_eq!(raw_length(0xF6), 8);
    }
}
