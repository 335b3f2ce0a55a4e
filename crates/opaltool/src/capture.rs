//! Captures: a snapshot of RDRAM and the VI registers, plus the display lists of the graphics
//! tasks to run on top of it.

use std::{io::BufReader, path::Path};

use binrw::{BinRead, BinWrite, binrw};
use eyre_pretty::{Context, ContextCompat, Result};
use opal::{
    Opal,
    config::Config,
    modules::render::RenderModule,
    system::{
        gbi::Dialect,
        mem::Rdram,
        vi::{Registers, Scale, Span, Status},
    },
};

pub const VERSION: u32 = 1;

/// The VI registers, in the order they are stored in a capture.
#[derive(Debug, Clone, Copy, Default, BinRead, BinWrite)]
#[brw(big)]
pub struct ViRegisters {
    pub status: u32,
    pub origin: u32,
    pub width: u32,
    pub v_sync: u32,
    pub h_start: u32,
    pub v_start: u32,
    pub x_scale: u32,
    pub y_scale: u32,
}

impl ViRegisters {
    pub fn registers(&self) -> Registers {
        Registers {
            status: Status::from_bits(self.status),
            origin: self.origin,
            width: self.width,
            v_sync: self.v_sync,
            h_start: Span::from_bits(self.h_start),
            v_start: Span::from_bits(self.v_start),
            x_scale: Scale::from_bits(self.x_scale),
            y_scale: Scale::from_bits(self.y_scale),
        }
    }
}

#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = b"OPAL")]
pub struct Capture {
    #[br(assert(version == VERSION, "unsupported capture version {}", version))]
    pub version: u32,
    /// Microcode dialect the display lists are written in.
    pub dialect: u8,
    #[br(temp)]
    #[bw(calc = entries.len() as u32)]
    entry_count: u32,
    /// Physical addresses of the display lists, one per task.
    #[br(count = entry_count)]
    pub entries: Vec<u32>,
    pub vi: ViRegisters,
    #[br(temp)]
    #[bw(calc = rdram.len() as u32)]
    rdram_len: u32,
    #[br(count = rdram_len)]
    pub rdram: Vec<u8>,
}

impl Capture {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("opening capture")?;
        Self::read(&mut BufReader::new(file)).context("parsing capture")
    }

    pub fn dialect(&self) -> Result<Dialect> {
        Dialect::from_repr(self.dialect).with_context(|| format!("unknown dialect {}", self.dialect))
    }

    /// Builds a core with the captured memory and registers loaded.
    pub fn load(self, config: Config, render: Box<dyn RenderModule>) -> Result<Opal> {
        let dialect = self.dialect()?;
        let vi = self.vi.registers();

        let mut opal = Opal::new(config, Rdram::from_bytes(self.rdram), render);
        opal.load_ucode(dialect);
        *opal.vi_mut() = vi;

        Ok(opal)
    }
}
