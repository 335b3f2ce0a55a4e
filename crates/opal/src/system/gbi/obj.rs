//! Decoding of the 2D object commands of the S2DEX microcodes.

use bitut::BitUtils;

use super::{Dialect, Family};

/// Object MOVEMEM targets.
pub const MOVE_MATRIX: u16 = 0;
pub const MOVE_SUB_MATRIX: u16 = 2;
pub const MOVE_VIEWPORT: u16 = 8;

/// A 2D object command. Addresses are still segmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjCommand {
    /// Scaled background rectangle drawn in one cycle mode.
    BgRect1Cycle(u32),
    /// Unscaled background rectangle drawn in copy mode.
    BgRectCopy(u32),
    Rectangle(u32),
    /// Object rectangle placed by the object matrix.
    RectangleR(u32),
    Sprite(u32),
    /// Loads the object matrix, sub-matrix or viewport.
    MoveMem {
        index: u16,
        address: u32,
    },
    LoadTexture(u32),
    LoadSprite(u32),
    LoadRectangle(u32),
    LoadRectangleR(u32),
    RenderMode(u32),
    /// First half of SELECT_DL: low half of the address and the status word to test.
    SelectDlHalf {
        address: u16,
        sid: u8,
        flag: u32,
    },
    SelectDl {
        address: u16,
        push: bool,
        mask: u32,
    },
}

impl ObjCommand {
    /// Commands drawing an axis aligned rectangle through the texture rectangle path.
    pub fn draws_rect(&self) -> bool {
        matches!(
            self,
            Self::BgRect1Cycle(_)
                | Self::BgRectCopy(_)
                | Self::Rectangle(_)
                | Self::RectangleR(_)
                | Self::LoadRectangle(_)
                | Self::LoadRectangleR(_)
        )
    }
}

/// Opcode of SELECT_DL in `dialect`.
pub fn select_dl_opcode(dialect: Dialect) -> u8 {
    match dialect.family() {
        Family::F3d => 0xB0,
        Family::F3dex2 => 0x04,
    }
}

/// Decodes an object command. `w0` of the first half of SELECT_DL only makes sense together with
/// the command following it, so it is decoded by [`select_dl_half`].
pub fn decode(dialect: Dialect, w0: u32, w1: u32) -> Option<ObjCommand> {
    let opcode = (w0 >> 24) as u8;
    let command = match (dialect.family(), opcode) {
        (Family::F3d, 0x01) | (Family::F3dex2, 0x09) => ObjCommand::BgRect1Cycle(w1),
        (Family::F3d, 0x02) | (Family::F3dex2, 0x0A) => ObjCommand::BgRectCopy(w1),
        (Family::F3d, 0x03) | (Family::F3dex2, 0x01) => ObjCommand::Rectangle(w1),
        (Family::F3d, 0x04) | (Family::F3dex2, 0x02) => ObjCommand::Sprite(w1),
        (Family::F3d, 0x05) => ObjCommand::MoveMem {
            index: w0.bits(0, 16) as u16,
            address: w1,
        },
        // the F3DEX2 layout only carries the size of the structure
        (Family::F3dex2, 0xDC) => ObjCommand::MoveMem {
            index: match w0.bits(19, 24) {
                0 => MOVE_SUB_MATRIX,
                1 => MOVE_VIEWPORT,
                _ => MOVE_MATRIX,
            },
            address: w1,
        },
        (Family::F3d, 0xB0) | (Family::F3dex2, 0x04) => ObjCommand::SelectDl {
            address: w0.bits(0, 16) as u16,
            push: w0.bits(16, 24) == 0,
            mask: w1,
        },
        (Family::F3d, 0xB1) | (Family::F3dex2, 0x0B) => ObjCommand::RenderMode(w1),
        (Family::F3d, 0xB2) | (Family::F3dex2, 0xDA) => ObjCommand::RectangleR(w1),
        (Family::F3d, 0xC1) | (Family::F3dex2, 0x05) => ObjCommand::LoadTexture(w1),
        (Family::F3d, 0xC2) | (Family::F3dex2, 0x06) => ObjCommand::LoadSprite(w1),
        (Family::F3d, 0xC3) | (Family::F3dex2, 0x07) => ObjCommand::LoadRectangle(w1),
        (Family::F3d, 0xC4) | (Family::F3dex2, 0x08) => ObjCommand::LoadRectangleR(w1),
        _ => return None,
    };

    Some(command)
}

/// Decodes the RDPHALF_0 command preceding SELECT_DL.
pub fn select_dl_half(w0: u32, w1: u32) -> ObjCommand {
    ObjCommand::SelectDlHalf {
        address: w0.bits(0, 16) as u16,
        sid: w0.bits(16, 24) as u8,
        flag: w1,
    }
}
