//! Decoding of display list commands into typed [`Command`]s.
//!
//! Decoding is pure: it only reads guest memory. This lets the texture rectangle batcher look
//! ahead into the stream without executing anything.

pub mod obj;
pub mod rdp;

use bitut::BitUtils;
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::system::mem::{MemoryError, Rdram};

pub use obj::ObjCommand;
pub use rdp::{RdpCommand, TexRect, TileRect};

/// Opcode layout shared by a group of dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Fast3D layout: RSP opcodes in the low range and from 0xB0 up.
    F3d,
    /// F3DEX2 layout: RSP opcodes in the low range and from 0xD0 up.
    F3dex2,
}

/// How vertices are laid out in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Standard,
    ColorIndexed,
    Dma,
    Conker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightingModel {
    Standard,
    Conker,
    ZeldaMm,
    Acclaim,
}

/// Microcode dialect of the display lists being executed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    FromRepr,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum Dialect {
    #[default]
    F3d,
    F3dex,
    F3dex2,
    ZeldaMm,
    Conker,
    DiddyKong,
    PerfectDark,
    Acclaim,
    Sprite2d,
    /// 2D objects, Fast3D layout.
    S2dex,
    /// Revision 1.03 of [`Dialect::S2dex`], which rounds object coordinates differently.
    S2dex103,
    /// 2D objects, F3DEX2 layout.
    S2dex2,
}

/// Geometry mode bits, whose positions depend on the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBits {
    pub zbuffer: u32,
    pub shade: u32,
    pub shading_smooth: u32,
    pub cull_front: u32,
    pub cull_back: u32,
    pub fog: u32,
    pub lighting: u32,
    pub texture_gen: u32,
    pub texture_gen_linear: u32,
    pub lod: u32,
    pub point_lighting: u32,
    pub clipping: u32,
}

impl GeometryBits {
    pub const F3D: Self = Self {
        zbuffer: 0x0000_0001,
        shade: 0x0000_0004,
        shading_smooth: 0x0000_0200,
        cull_front: 0x0000_1000,
        cull_back: 0x0000_2000,
        fog: 0x0001_0000,
        lighting: 0x0002_0000,
        texture_gen: 0x0004_0000,
        texture_gen_linear: 0x0008_0000,
        lod: 0x0010_0000,
        point_lighting: 0,
        clipping: 0,
    };

    pub const F3DEX: Self = Self {
        clipping: 0x0080_0000,
        ..Self::F3D
    };

    pub const F3DEX2: Self = Self {
        zbuffer: 0x0000_0001,
        shade: 0x0000_0004,
        shading_smooth: 0x0020_0000,
        cull_front: 0x0000_0200,
        cull_back: 0x0000_0400,
        fog: 0x0001_0000,
        lighting: 0x0002_0000,
        texture_gen: 0x0004_0000,
        texture_gen_linear: 0x0008_0000,
        lod: 0x0010_0000,
        point_lighting: 0x0040_0000,
        clipping: 0x0080_0000,
    };

    #[inline(always)]
    pub fn cull_both(&self) -> u32 {
        self.cull_front | self.cull_back
    }
}

impl Dialect {
    pub fn family(self) -> Family {
        match self {
            Self::F3d
            | Self::F3dex
            | Self::DiddyKong
            | Self::PerfectDark
            | Self::Sprite2d
            | Self::S2dex
            | Self::S2dex103 => Family::F3d,
            Self::F3dex2 | Self::ZeldaMm | Self::Conker | Self::Acclaim | Self::S2dex2 => {
                Family::F3dex2
            }
        }
    }

    pub fn vertex_format(self) -> VertexFormat {
        match self {
            Self::PerfectDark => VertexFormat::ColorIndexed,
            Self::DiddyKong => VertexFormat::Dma,
            Self::Conker => VertexFormat::Conker,
            _ => VertexFormat::Standard,
        }
    }

    pub fn lighting_model(self) -> LightingModel {
        match self {
            Self::Conker => LightingModel::Conker,
            Self::ZeldaMm => LightingModel::ZeldaMm,
            Self::Acclaim => LightingModel::Acclaim,
            _ => LightingModel::Standard,
        }
    }

    pub fn is_s2dex(self) -> bool {
        matches!(self, Self::S2dex | Self::S2dex103 | Self::S2dex2)
    }

    /// Whether object coordinates are rounded the way revision 1.03 and later do.
    pub fn revised_objects(self) -> bool {
        matches!(self, Self::S2dex103 | Self::S2dex2)
    }

    /// Usable depth of the model view matrix stack.
    pub fn matrix_stack_size(self) -> usize {
        match self.family() {
            Family::F3d => 10,
            Family::F3dex2 => 18,
        }
    }

    pub fn geometry_bits(self) -> &'static GeometryBits {
        match self {
            Self::F3dex | Self::S2dex | Self::S2dex103 => &GeometryBits::F3DEX,
            _ => match self.family() {
                Family::F3d => &GeometryBits::F3D,
                Family::F3dex2 => &GeometryBits::F3DEX2,
            },
        }
    }

    /// Identifies a dialect from the signature string embedded in microcode data.
    pub fn detect(data: &[u8]) -> Option<Self> {
        const GFX: &[u8] = b"RSP Gfx ucode ";
        const SW: &[u8] = b"RSP SW Version: 2.0";

        if data.windows(SW.len()).any(|w| w == SW) {
            return Some(Self::F3d);
        }

        let start = data.windows(GFX.len()).position(|w| w == GFX)? + GFX.len();
        let signature = &data[start..];

        if signature.starts_with(b"F3DZEX") {
            let is_mm = signature
                .windows(5)
                .take(48)
                .any(|w| w == b"2.08I");
            return Some(if is_mm { Self::ZeldaMm } else { Self::F3dex2 });
        }

        if let Some(rest) = signature.strip_prefix(b"S2DEX") {
            // "S2DEX  fifo 2.05 ..." or "S2DEX       1.03 ..."
            let version = rest.iter().take(16).position(u8::is_ascii_digit)?;
            return Some(match &rest[version..] {
                [b'2', ..] => Self::S2dex2,
                [b'1', b'.', b'0', b'3', ..] => Self::S2dex103,
                _ => Self::S2dex,
            });
        }

        let known = [b"F3DEX".as_slice(), b"F3DLX", b"F3DLP"];
        if !known.iter().any(|name| signature.starts_with(name)) {
            return None;
        }

        // "F3DEX.Rej  fifo 2.05 ..." or "F3DEX       xbus 0.95 ..."
        let version = signature
            .windows(4)
            .take(32)
            .position(|w| w == b"fifo" || w == b"xbus")
            .and_then(|pos| signature[pos + 4..].iter().find(|c| c.is_ascii_digit()));

        Some(match version {
            Some(b'2') => Self::F3dex2,
            _ => Self::F3dex,
        })
    }
}

/// A MOVEWORD command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveWord {
    InsertMatrix { offset: u32, value: u32 },
    NumLights(u32),
    Clip,
    Segment { index: u8, base: u32 },
    Fog { multiplier: i16, offset: i16 },
    LightColor { light: u32, color: u32 },
    PerspNorm(u16),
    /// Fast3D vertex modification through MOVEWORD.
    Points { vertex: u32, field: u32, value: u32 },
    CoordMod { offset: u32, value: u32 },
    Billboard(bool),
    MatrixIndex(u8),
    /// Status word of the 2D object microcodes, tested by texture loads and SELECT_DL.
    Status { sid: u32, value: u32 },
    Ignored { index: u8 },
}

/// A MOVEMEM command. Addresses are still segmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMem {
    Viewport(u32),
    /// Zero based light slot.
    Light { light: u32, address: u32 },
    LookAt { axis: u8, address: u32 },
    ForceMatrix(u32),
    NormalBase(u32),
    Unknown { index: u8, address: u32 },
}

/// A decoded display list command. Addresses are still segmented.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Noop,
    Matrix {
        address: u32,
        projection: bool,
        load: bool,
        push: bool,
    },
    DmaMatrix {
        address: u32,
        index: u8,
        multiply: bool,
    },
    PopMatrix {
        count: u32,
    },
    Vertex {
        address: u32,
        count: u32,
        first: u32,
    },
    DmaVertex {
        address: u32,
        count: u32,
        first: u32,
        append: bool,
    },
    ModifyVertex {
        vertex: u32,
        field: u32,
        value: u32,
    },
    Triangle1([u32; 3]),
    Triangle2([u32; 3], [u32; 3]),
    Quad([u32; 4]),
    DmaTriangles {
        address: u32,
        count: u32,
    },
    Line3d {
        v0: u32,
        v1: u32,
        width: u32,
    },
    DisplayList {
        address: u32,
        push: bool,
    },
    DlCount {
        address: u32,
        count: u32,
    },
    EndDisplayList,
    CullDisplayList {
        first: u32,
        last: u32,
    },
    BranchZ {
        vertex: u32,
        zval: u32,
    },
    BranchW {
        vertex: u32,
        wval: i32,
    },
    GeometryMode {
        clear: u32,
        set: u32,
    },
    SetOtherModeH {
        shift: u32,
        len: u32,
        data: u32,
    },
    SetOtherModeL {
        shift: u32,
        len: u32,
        data: u32,
    },
    Texture {
        scale_s: u16,
        scale_t: u16,
        level: u8,
        tile: u8,
        on: bool,
    },
    MoveWord(MoveWord),
    MoveMem(MoveMem),
    LoadUcode {
        address: u32,
        size: u32,
    },
    RdpHalf1(u32),
    RdpHalf2(u32),
    RdpHalfCont(u32),
    VertexColorBase(u32),
    DmaOffsets {
        matrix: u32,
        vertex: u32,
    },
    SpriteBase(u32),
    SpriteScaleFlip {
        scale_x: f32,
        scale_y: f32,
        flip_x: bool,
        flip_y: bool,
    },
    SpriteDraw {
        x: f32,
        y: f32,
    },
    Obj(ObjCommand),
    Rdp(RdpCommand),
    Unknown(u8),
}

impl Command {
    pub fn is_triangle(&self) -> bool {
        matches!(
            self,
            Self::Triangle1(_) | Self::Triangle2(..) | Self::Quad(_) | Self::DmaTriangles { .. }
        )
    }

    pub fn is_texrect(&self) -> bool {
        matches!(self, Self::Rdp(RdpCommand::TextureRect(_)))
    }

    /// Texture rectangles and the 2D object commands drawn like them.
    pub fn draws_rect(&self) -> bool {
        match self {
            Self::Obj(obj) => obj.draws_rect(),
            _ => self.is_texrect(),
        }
    }

    /// Commands which can sit between two texture rectangles without breaking a batch.
    pub fn is_transparent(&self) -> bool {
        match self {
            Self::Noop | Self::RdpHalf1(_) | Self::RdpHalf2(_) | Self::RdpHalfCont(_) => true,
            Self::Rdp(rdp) => rdp.is_transparent(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decoded {
    pub command: Command,
    pub w0: u32,
    pub w1: u32,
    /// Bytes consumed from the stream.
    pub length: u32,
}

/// Length of a display list command.
pub const COMMAND_LEN: u32 = 8;

/// Length of a texture rectangle inside a display list: the command followed by two RDPHALF
/// commands carrying its texture coordinates.
pub const TEXRECT_LEN: u32 = 24;

#[inline(always)]
fn is_rdp(family: Family, opcode: u8) -> bool {
    match opcode {
        0xC0 | 0xC8..=0xCF => true,
        0xF1 => family == Family::F3d,
        0xE4..=0xFF => true,
        _ => false,
    }
}

#[inline(always)]
fn tri7(w: u32) -> [u32; 3] {
    [w.bits(17, 24), w.bits(9, 16), w.bits(1, 8)]
}

/// Decodes the command at `pc`.
pub fn decode(dialect: Dialect, mem: &Rdram, pc: u32) -> Result<Decoded, MemoryError> {
    let (w0, w1) = mem.read_command(pc)?;
    let opcode = (w0 >> 24) as u8;
    let family = dialect.family();

    let mut length = COMMAND_LEN;
    let command = if let Some(command) = decode_special(dialect, w0, w1) {
        command
    } else if opcode == 0xE4
        && dialect.is_s2dex()
        && mem
            .read_u32(pc + COMMAND_LEN)
            .is_ok_and(|next| (next >> 24) as u8 == obj::select_dl_opcode(dialect))
    {
        Command::Obj(obj::select_dl_half(w0, w1))
    } else if matches!(opcode, 0xE4 | 0xE5) {
        let w2 = mem.read_u32(pc + 12)?;
        let w3 = mem.read_u32(pc + 20)?;
        length = TEXRECT_LEN;
        Command::Rdp(RdpCommand::TextureRect(rdp::texture_rect(w0, w1, w2, w3)))
    } else if is_rdp(family, opcode) {
        Command::Rdp(rdp::decode(w0, w1))
    } else {
        match family {
            Family::F3d => decode_f3d(dialect, w0, w1),
            Family::F3dex2 => decode_f3dex2(dialect, w0, w1),
        }
    };

    // force matrix is spread over four MOVEMEM commands in Fast3D
    if family == Family::F3d && matches!(command, Command::MoveMem(MoveMem::ForceMatrix(_))) {
        length = 4 * COMMAND_LEN;
    }

    Ok(Decoded {
        command,
        w0,
        w1,
        length,
    })
}

/// Commands that only exist in a specific dialect.
fn decode_special(dialect: Dialect, w0: u32, w1: u32) -> Option<Command> {
    let opcode = (w0 >> 24) as u8;
    if dialect.is_s2dex() {
        if let Some(obj) = obj::decode(dialect, w0, w1) {
            return Some(Command::Obj(obj));
        }

        // the Fast3D layout only has LOAD_UCODE in the extended microcodes
        if dialect.family() == Family::F3d && opcode == 0xAF {
            return Some(Command::LoadUcode {
                address: w1,
                size: w0.bits(0, 16) + 1,
            });
        }

        return None;
    }

    let command = match (dialect, opcode) {
        (Dialect::DiddyKong, 0x01) => Command::DmaMatrix {
            address: w1,
            index: w0.bits(16, 20) as u8,
            multiply: w0 & (1 << 23) != 0,
        },
        (Dialect::DiddyKong, 0x04) => Command::DmaVertex {
            address: w1,
            count: w0.bits(19, 24) + 1,
            first: w0.bits(9, 14),
            append: w0 & (1 << 16) != 0,
        },
        (Dialect::DiddyKong, 0x05) => Command::DmaTriangles {
            address: w1,
            count: w0.bits(4, 16),
        },
        (Dialect::DiddyKong, 0x07) => Command::DlCount {
            address: w1,
            count: w0.bits(16, 24),
        },
        (Dialect::DiddyKong, 0xBF) => Command::DmaOffsets {
            matrix: w0 & 0x00FF_FFFF,
            vertex: w1 & 0x00FF_FFFF,
        },
        (Dialect::DiddyKong, 0xBC) => match w0.bits(0, 8) {
            0x02 => Command::MoveWord(MoveWord::Billboard(w1 & 1 != 0)),
            0x0A => Command::MoveWord(MoveWord::MatrixIndex(w1.bits(6, 8) as u8)),
            _ => return None,
        },
        (Dialect::PerfectDark, 0x04) => Command::Vertex {
            address: w1,
            count: w0.bits(20, 24) + 1,
            first: w0.bits(16, 20),
        },
        (Dialect::PerfectDark, 0x07) => Command::VertexColorBase(w1),
        (Dialect::Conker, 0x04) => Command::BranchW {
            vertex: w0.bits(1, 12),
            wval: w1 as i32,
        },
        (Dialect::Sprite2d, 0x09) => Command::SpriteBase(w1),
        (Dialect::Sprite2d, 0xBE) => Command::SpriteScaleFlip {
            scale_x: w1.bits(16, 32) as f32 / 1024.0,
            scale_y: w1.bits(0, 16) as f32 / 1024.0,
            flip_x: w0.bits(8, 16) != 0,
            flip_y: w0.bits(0, 8) != 0,
        },
        (Dialect::Sprite2d, 0xBD) => Command::SpriteDraw {
            x: (w1 >> 16) as i16 as f32 / 4.0,
            y: w1 as i16 as f32 / 4.0,
        },
        _ => return None,
    };

    Some(command)
}

fn decode_f3d(dialect: Dialect, w0: u32, w1: u32) -> Command {
    let opcode = (w0 >> 24) as u8;
    let ex = dialect == Dialect::F3dex;

    match opcode {
        0x00 => Command::Noop,
        0x01 => {
            let param = w0.bits(16, 24);
            Command::Matrix {
                address: w1,
                projection: param & 1 != 0,
                load: param & 2 != 0,
                push: param & 4 != 0,
            }
        }
        0x03 => Command::MoveMem(f3d_move_mem(w0, w1)),
        0x04 if ex => Command::Vertex {
            address: w1,
            count: w0.bits(10, 16),
            first: w0.bits(17, 24),
        },
        0x04 => Command::Vertex {
            address: w1,
            count: w0.bits(20, 24) + 1,
            first: w0.bits(16, 20),
        },
        0x06 => Command::DisplayList {
            address: w1,
            push: w0.bits(16, 24) == 0,
        },
        0xAF if ex => Command::LoadUcode {
            address: w1,
            size: w0.bits(0, 16) + 1,
        },
        0xB0 if ex => Command::BranchZ {
            vertex: w0.bits(1, 12),
            zval: w1,
        },
        0xB1 if ex => Command::Triangle2(tri7(w0), tri7(w1)),
        0xB2 if ex => Command::ModifyVertex {
            vertex: w0.bits(1, 16),
            field: w0.bits(16, 24),
            value: w1,
        },
        0xB2 => Command::RdpHalfCont(w1),
        0xB3 => Command::RdpHalf2(w1),
        0xB4 => Command::RdpHalf1(w1),
        0xB5 if ex => Command::Quad([
            w1.bits(24, 32) / 2,
            w1.bits(16, 24) / 2,
            w1.bits(8, 16) / 2,
            w1.bits(0, 8) / 2,
        ]),
        0xB5 => Command::Line3d {
            v0: w1.bits(16, 24) / 10,
            v1: w1.bits(8, 16) / 10,
            width: w1.bits(0, 8),
        },
        0xB6 => Command::GeometryMode { clear: w1, set: 0 },
        0xB7 => Command::GeometryMode { clear: 0, set: w1 },
        0xB8 => Command::EndDisplayList,
        0xB9 => Command::SetOtherModeL {
            shift: w0.bits(8, 16),
            len: w0.bits(0, 8),
            data: w1,
        },
        0xBA => Command::SetOtherModeH {
            shift: w0.bits(8, 16),
            len: w0.bits(0, 8),
            data: w1,
        },
        0xBB => Command::Texture {
            scale_s: w1.bits(16, 32) as u16,
            scale_t: w1.bits(0, 16) as u16,
            level: w0.bits(11, 14) as u8,
            tile: w0.bits(8, 11) as u8,
            on: w0.bits(0, 8) != 0,
        },
        0xBC => Command::MoveWord(f3d_move_word(dialect, w0, w1)),
        // only the model view stack can be popped
        0xBD => Command::PopMatrix {
            count: (w1 == 0) as u32,
        },
        0xBE if ex => Command::CullDisplayList {
            first: w0.bits(1, 16),
            last: w1.bits(1, 16),
        },
        0xBE => Command::CullDisplayList {
            first: (w0 & 0x00FF_FFFF) / 40,
            last: (w1 / 40).wrapping_sub(1),
        },
        0xBF => {
            let div = if ex { 2 } else { 10 };
            Command::Triangle1([
                w1.bits(16, 24) / div,
                w1.bits(8, 16) / div,
                w1.bits(0, 8) / div,
            ])
        }
        _ => Command::Unknown(opcode),
    }
}

fn f3d_move_mem(w0: u32, w1: u32) -> MoveMem {
    let index = w0.bits(16, 24) as u8;
    match index {
        0x80 => MoveMem::Viewport(w1),
        0x82 => MoveMem::LookAt { axis: 1, address: w1 },
        0x84 => MoveMem::LookAt { axis: 0, address: w1 },
        0x86..=0x94 if index % 2 == 0 => MoveMem::Light {
            light: (index as u32 - 0x86) / 2,
            address: w1,
        },
        0x9E => MoveMem::ForceMatrix(w1),
        _ => MoveMem::Unknown { index, address: w1 },
    }
}

fn f3d_move_word(dialect: Dialect, w0: u32, w1: u32) -> MoveWord {
    let index = w0.bits(0, 8) as u8;
    let offset = w0.bits(8, 24);
    match index {
        0x00 => MoveWord::InsertMatrix { offset, value: w1 },
        0x02 => MoveWord::NumLights((w1.wrapping_sub(0x8000_0000) >> 5).wrapping_sub(1)),
        0x04 => MoveWord::Clip,
        0x06 => MoveWord::Segment {
            index: ((offset >> 2) & 0xF) as u8,
            base: w1 & 0x00FF_FFFF,
        },
        0x08 if dialect.is_s2dex() => MoveWord::Status { sid: offset, value: w1 },
        0x08 => MoveWord::Fog {
            multiplier: (w1 >> 16) as i16,
            offset: w1 as i16,
        },
        0x0A if offset % 0x20 == 0 => MoveWord::LightColor {
            light: offset / 0x20,
            color: w1,
        },
        0x0C if dialect != Dialect::F3dex => MoveWord::Points {
            vertex: offset / 40,
            field: offset % 40,
            value: w1,
        },
        0x0E => MoveWord::PerspNorm(w1 as u16),
        _ => MoveWord::Ignored { index },
    }
}

fn decode_f3dex2(dialect: Dialect, w0: u32, w1: u32) -> Command {
    let opcode = (w0 >> 24) as u8;
    match opcode {
        0x00 | 0xE0 | 0xD6 => Command::Noop,
        0x01 => {
            let count = w0.bits(12, 20);
            Command::Vertex {
                address: w1,
                count,
                first: w0.bits(1, 8).wrapping_sub(count),
            }
        }
        0x02 => Command::ModifyVertex {
            vertex: w0.bits(1, 16),
            field: w0.bits(16, 24),
            value: w1,
        },
        0x03 => Command::CullDisplayList {
            first: w0.bits(1, 16),
            last: w1.bits(1, 16),
        },
        0x04 => Command::BranchZ {
            vertex: w0.bits(1, 12),
            zval: w1,
        },
        0x05 => Command::Triangle1(tri7(w0)),
        0x06 | 0x07 => Command::Triangle2(tri7(w0), tri7(w1)),
        0x08 => Command::Line3d {
            v0: w0.bits(17, 24),
            v1: w0.bits(9, 16),
            width: w0.bits(0, 8),
        },
        0xD7 => Command::Texture {
            scale_s: w1.bits(16, 32) as u16,
            scale_t: w1.bits(0, 16) as u16,
            level: w0.bits(11, 14) as u8,
            tile: w0.bits(8, 11) as u8,
            on: w0.bits(1, 8) != 0,
        },
        0xD8 => Command::PopMatrix { count: w1 >> 6 },
        0xD9 => Command::GeometryMode {
            clear: !(w0 & 0x00FF_FFFF),
            set: w1,
        },
        0xDA => {
            let param = w0.bits(0, 8);
            Command::Matrix {
                address: w1,
                projection: param & 4 != 0,
                load: param & 2 != 0,
                push: param & 1 == 0,
            }
        }
        0xDB => Command::MoveWord(f3dex2_move_word(dialect, w0, w1)),
        0xDC => Command::MoveMem(f3dex2_move_mem(dialect, w0, w1)),
        0xDD => Command::LoadUcode {
            address: w1,
            size: w0.bits(0, 16) + 1,
        },
        0xDE => Command::DisplayList {
            address: w1,
            push: w0.bits(16, 24) == 0,
        },
        0xDF => Command::EndDisplayList,
        0xE1 => Command::RdpHalf1(w1),
        0xF1 => Command::RdpHalf2(w1),
        0xE2 | 0xE3 => {
            let len = w0.bits(0, 8) + 1;
            let shift = 32u32.wrapping_sub(w0.bits(8, 16)).wrapping_sub(len);
            if opcode == 0xE2 {
                Command::SetOtherModeL {
                    shift,
                    len,
                    data: w1,
                }
            } else {
                Command::SetOtherModeH {
                    shift,
                    len,
                    data: w1,
                }
            }
        }
        _ => Command::Unknown(opcode),
    }
}

fn f3dex2_move_word(dialect: Dialect, w0: u32, w1: u32) -> MoveWord {
    let index = w0.bits(16, 24) as u8;
    let offset = w0.bits(0, 16);
    let light_stride = if dialect == Dialect::Conker { 48 } else { 24 };

    match index {
        0x00 => MoveWord::InsertMatrix { offset, value: w1 },
        0x02 => MoveWord::NumLights(w1 / light_stride),
        0x04 => MoveWord::Clip,
        0x06 => MoveWord::Segment {
            index: ((offset >> 2) & 0xF) as u8,
            base: w1 & 0x00FF_FFFF,
        },
        0x08 if dialect.is_s2dex() => MoveWord::Status { sid: offset, value: w1 },
        0x08 => MoveWord::Fog {
            multiplier: (w1 >> 16) as i16,
            offset: w1 as i16,
        },
        0x0A if offset % light_stride == 0 => MoveWord::LightColor {
            light: offset / light_stride,
            color: w1,
        },
        0x0E => MoveWord::PerspNorm(w1 as u16),
        0x10 if dialect == Dialect::Conker => MoveWord::CoordMod { offset, value: w1 },
        _ => MoveWord::Ignored { index },
    }
}

fn f3dex2_move_mem(dialect: Dialect, w0: u32, w1: u32) -> MoveMem {
    let index = w0.bits(0, 8) as u8;
    let offset = w0.bits(8, 16) * 8;

    match index {
        8 => MoveMem::Viewport(w1),
        10 => {
            let stride = if dialect == Dialect::Conker { 48 } else { 24 };
            match offset / stride {
                n @ 0..2 => MoveMem::LookAt {
                    axis: n as u8,
                    address: w1,
                },
                n => MoveMem::Light {
                    light: n - 2,
                    address: w1,
                },
            }
        }
        14 if dialect == Dialect::Conker => MoveMem::NormalBase(w1),
        14 => MoveMem::ForceMatrix(w1),
        _ => MoveMem::Unknown { index, address: w1 },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_words(dialect: Dialect, words: &[u32]) -> Decoded {
        let mut mem = Rdram::new(0x100);
        for (i, word) in words.iter().enumerate() {
            mem.write_u32(4 * i as u32, *word).unwrap();
        }

        decode(dialect, &mem, 0).unwrap()
    }

    fn command(dialect: Dialect, w0: u32, w1: u32) -> Command {
        decode_words(dialect, &[w0, w1]).command
    }

    #[test]
    fn detect_signatures() {
        let cases: [(&[u8], Option<Dialect>); 9] = [
            (b"..RSP SW Version: 2.0D, 04-01-96..", Some(Dialect::F3d)),
            (b"RSP Gfx ucode F3DEX       1.23 Yoshitaka Yasumoto", Some(Dialect::F3dex)),
            (b"RSP Gfx ucode F3DLX.Rej   fifo 2.06 Yoshitaka", Some(Dialect::F3dex2)),
            (b"RSP Gfx ucode F3DZEX.NoN  fifo 2.06H Yoshitaka", Some(Dialect::F3dex2)),
            (b"RSP Gfx ucode F3DZEX.NoN  fifo 2.08I Yoshitaka", Some(Dialect::ZeldaMm)),
            (b"RSP Gfx ucode S2DEX  fifo 2.05", Some(Dialect::S2dex2)),
            (b"RSP Gfx ucode S2DEX       1.03 Yoshitaka", Some(Dialect::S2dex103)),
            (b"RSP Gfx ucode S2DEX       1.07 Yoshitaka", Some(Dialect::S2dex)),
            (b"RSP Gfx ucode L3DEX       1.23", None),
        ];

        for (data, expected) in cases {
            assert_eq!(Dialect::detect(data), expected, "{}", String::from_utf8_lossy(data));
        }

        assert_eq!(Dialect::detect(&[0; 64]), None);
    }

    #[test]
    fn dialect_queries() {
        assert_eq!(Dialect::F3d.matrix_stack_size(), 10);
        assert_eq!(Dialect::ZeldaMm.matrix_stack_size(), 18);
        assert_eq!(Dialect::PerfectDark.vertex_format(), VertexFormat::ColorIndexed);
        assert_eq!(Dialect::Acclaim.lighting_model(), LightingModel::Acclaim);
        assert_eq!(Dialect::F3dex.geometry_bits().clipping, 0x0080_0000);
        assert_eq!(Dialect::Conker.geometry_bits().cull_back, 0x0400);
        assert_eq!(Dialect::from_repr(2), Some(Dialect::F3dex2));
        assert_eq!("zelda-mm".parse::<Dialect>().unwrap(), Dialect::ZeldaMm);
    }

    #[test]
    fn f3d_commands() {
        assert_eq!(
            command(Dialect::F3d, 0x0401_0040, 0x0600_0000),
            Command::Vertex {
                address: 0x0600_0000,
                count: 1,
                first: 1,
            }
        );
        assert_eq!(
            command(Dialect::F3d, 0xBF00_0000, 0x0000_0A14),
            Command::Triangle1([0, 1, 2])
        );
        assert_eq!(
            command(Dialect::F3d, 0x0101_0040, 0x0100_0000),
            Command::Matrix {
                address: 0x0100_0000,
                projection: true,
                load: false,
                push: false,
            }
        );
        assert_eq!(
            command(Dialect::F3d, 0xBC00_0406, 0x0010_0000),
            Command::MoveWord(MoveWord::Segment {
                index: 1,
                base: 0x0010_0000,
            })
        );
        assert_eq!(
            command(Dialect::F3d, 0xBC00_0002, 0x8000_0040),
            Command::MoveWord(MoveWord::NumLights(1))
        );
        assert_eq!(
            command(Dialect::F3d, 0x0388_0010, 0x0200_0000),
            Command::MoveMem(MoveMem::Light {
                light: 1,
                address: 0x0200_0000,
            })
        );
        assert_eq!(
            command(Dialect::F3d, 0xBA00_1402, 0x0010_0000),
            Command::SetOtherModeH {
                shift: 20,
                len: 2,
                data: 0x0010_0000,
            }
        );
    }

    #[test]
    fn f3d_force_matrix_spans_four_commands() {
        let decoded = decode_words(Dialect::F3d, &[0x039E_0010, 0x0100_0000]);
        assert_eq!(decoded.command, Command::MoveMem(MoveMem::ForceMatrix(0x0100_0000)));
        assert_eq!(decoded.length, 32);
    }

    #[test]
    fn f3dex_commands() {
        assert_eq!(
            command(Dialect::F3dex, 0x0402_0410, 0x0600_0000),
            Command::Vertex {
                address: 0x0600_0000,
                count: 1,
                first: 1,
            }
        );
        assert_eq!(
            command(Dialect::F3dex, 0xBF00_0000, 0x0000_0204),
            Command::Triangle1([0, 1, 2])
        );
        assert_eq!(
            command(Dialect::F3dex, 0xB100_0204, 0x0006_080A),
            Command::Triangle2([0, 1, 2], [3, 4, 5])
        );
        assert_eq!(
            command(Dialect::F3dex, 0xB500_0000, 0x0002_0406),
            Command::Quad([0, 1, 2, 3])
        );
    }

    #[test]
    fn f3dex2_commands() {
        // 4 vertices ending at slot 4
        assert_eq!(
            command(Dialect::F3dex2, 0x0100_4008, 0x0600_0000),
            Command::Vertex {
                address: 0x0600_0000,
                count: 4,
                first: 0,
            }
        );
        assert_eq!(
            command(Dialect::F3dex2, 0x0500_0204, 0),
            Command::Triangle1([0, 1, 2])
        );
        assert_eq!(
            command(Dialect::F3dex2, 0xDA38_0003, 0x0100_0000),
            Command::Matrix {
                address: 0x0100_0000,
                projection: false,
                load: true,
                push: false,
            }
        );
        assert_eq!(
            command(Dialect::F3dex2, 0xD9FF_FFFE, 0x0000_0400),
            Command::GeometryMode {
                clear: !0x00FF_FFFE,
                set: 0x400,
            }
        );
        assert_eq!(
            command(Dialect::F3dex2, 0xDC08_060A, 0x0200_0000),
            Command::MoveMem(MoveMem::Light {
                light: 0,
                address: 0x0200_0000,
            })
        );
        assert_eq!(
            command(Dialect::F3dex2, 0xDB02_0000, 0x0000_0030),
            Command::MoveWord(MoveWord::NumLights(2))
        );
        // G_SETOTHERMODE_H with G_MDSFT_CYCLETYPE
        assert_eq!(
            command(Dialect::F3dex2, 0xE300_0A01, 0x0010_0000),
            Command::SetOtherModeH {
                shift: 20,
                len: 2,
                data: 0x0010_0000,
            }
        );
        assert_eq!(command(Dialect::F3dex2, 0xE100_0000, 0x1234), Command::RdpHalf1(0x1234));
        assert_eq!(command(Dialect::F3d, 0xB400_0000, 0x1234), Command::RdpHalf1(0x1234));
    }

    #[test]
    fn dialect_specific_commands() {
        assert_eq!(
            command(Dialect::DiddyKong, 0x0538_0010, 0x0400_0000),
            Command::DmaTriangles {
                address: 0x0400_0000,
                count: 1,
            }
        );
        assert_eq!(
            command(Dialect::DiddyKong, 0x0418_0200, 0x0400_0000),
            Command::DmaVertex {
                address: 0x0400_0000,
                count: 4,
                first: 1,
                append: false,
            }
        );
        assert_eq!(
            command(Dialect::Conker, 0x0400_0004, 0xFFFF_FF00),
            Command::BranchW {
                vertex: 2,
                wval: -256,
            }
        );
        assert_eq!(
            command(Dialect::Conker, 0xDC08_0C0A, 0x0200_0000),
            Command::MoveMem(MoveMem::Light {
                light: 0,
                address: 0x0200_0000,
            })
        );
        assert_eq!(
            command(Dialect::PerfectDark, 0x0700_0000, 0x0400_0000),
            Command::VertexColorBase(0x0400_0000)
        );
        assert_eq!(
            command(Dialect::Sprite2d, 0xBD00_0000, 0x0028_0014),
            Command::SpriteDraw { x: 10.0, y: 5.0 }
        );

        // outside their dialect these are ordinary commands
        assert_eq!(command(Dialect::F3d, 0xBD00_0000, 0), Command::PopMatrix { count: 1 });
    }

    #[test]
    fn s2dex_commands() {
        assert_eq!(
            command(Dialect::S2dex, 0x0100_0000, 0x0400_0000),
            Command::Obj(ObjCommand::BgRect1Cycle(0x0400_0000))
        );
        assert_eq!(
            command(Dialect::S2dex2, 0x0A00_0000, 0x0400_0000),
            Command::Obj(ObjCommand::BgRectCopy(0x0400_0000))
        );
        assert_eq!(
            command(Dialect::S2dex103, 0xC300_0000, 0x0400_0030),
            Command::Obj(ObjCommand::LoadRectangle(0x0400_0030))
        );
        assert_eq!(
            command(Dialect::S2dex, 0x0517_0002, 0x0400_0000),
            Command::Obj(ObjCommand::MoveMem {
                index: obj::MOVE_SUB_MATRIX,
                address: 0x0400_0000,
            })
        );
        assert_eq!(
            command(Dialect::S2dex2, 0xDC10_0000, 0x0400_0000),
            Command::Obj(ObjCommand::MoveMem {
                index: obj::MOVE_MATRIX,
                address: 0x0400_0000,
            })
        );
        assert_eq!(
            command(Dialect::S2dex, 0xBC00_0408, 0x0000_0011),
            Command::MoveWord(MoveWord::Status { sid: 4, value: 0x11 })
        );
        assert_eq!(
            command(Dialect::S2dex2, 0xDB08_0004, 0x0000_0011),
            Command::MoveWord(MoveWord::Status { sid: 4, value: 0x11 })
        );
        // ordinary Fast3D commands keep their meaning
        assert_eq!(command(Dialect::S2dex, 0xB800_0000, 0), Command::EndDisplayList);
        assert_eq!(
            command(Dialect::S2dex, 0xAF00_0FFF, 0x0010_0000),
            Command::LoadUcode {
                address: 0x0010_0000,
                size: 0x1000,
            }
        );
    }

    #[test]
    fn s2dex_select_dl_takes_two_commands() {
        let words = [0xE404_1234, 0x0000_0001, 0xB000_0600, 0x0000_0003];
        let half = decode_words(Dialect::S2dex, &words);
        assert_eq!(
            half.command,
            Command::Obj(ObjCommand::SelectDlHalf {
                address: 0x1234,
                sid: 4,
                flag: 1,
            })
        );
        assert_eq!(half.length, COMMAND_LEN);

        // without SELECT_DL behind it the same command is a texture rectangle
        let rect = decode_words(
            Dialect::S2dex,
            &[0xE450_03C0, 0, 0xB400_0000, 0, 0xB300_0000, 0x0400_0400],
        );
        assert!(rect.command.is_texrect());
        assert!(rect.command.draws_rect());
        assert!(Command::Obj(ObjCommand::RectangleR(0)).draws_rect());
        assert!(!Command::Obj(ObjCommand::Sprite(0)).draws_rect());
    }

    #[test]
    fn texture_rectangle_spans_three_commands() {
        let decoded = decode_words(
            Dialect::F3dex2,
            &[0xE450_03C0, 0x0000_0000, 0xE100_0000, 0x0000_0000, 0xF100_0000, 0x0400_0400],
        );

        assert!(decoded.command.is_texrect());
        assert_eq!(decoded.length, TEXRECT_LEN);
        let Command::Rdp(RdpCommand::TextureRect(rect)) = decoded.command else {
            unreachable!()
        };
        assert_eq!((rect.dsdx, rect.dtdy), (0x400, 0x400));
    }

    #[test]
    fn classification() {
        assert!(Command::Quad([0; 4]).is_triangle());
        assert!(!Command::EndDisplayList.is_triangle());
        assert!(Command::RdpHalf2(0).is_transparent());
        assert!(Command::Rdp(RdpCommand::PipeSync).is_transparent());
        assert!(!Command::Rdp(RdpCommand::FullSync).is_transparent());
    }
}
