//! High level emulation of the N64 graphics pipeline.
//!
//! [`Opal`] interprets the display lists the game sends to the RSP and the raw command lists it
//! sends to the RDP, and turns them into [`Action`](modules::render::Action)s for a
//! [`RenderModule`].

pub mod config;
pub mod modules;
pub mod system;

use tracing::debug;

use crate::{
    config::Config,
    modules::render::RenderModule,
    system::{
        dlist, drawer, framebuffer,
        gbi::Dialect,
        mem::Rdram,
        rsp,
        snapshot::{self, SnapshotError},
        vi,
    },
};

pub use system::System;

/// The Opal graphics core.
pub struct Opal {
    system: System,
}

impl Opal {
    pub fn new(config: Config, rdram: Rdram, render: Box<dyn RenderModule>) -> Self {
        Self {
            system: System::new(config, rdram, render),
        }
    }

    /// Direct access to the pipeline state.
    pub fn system_mut(&mut self) -> &mut System {
        &mut self.system
    }

    /// Runs a graphics task: the display list at `entry` and everything it calls, until it ends.
    pub fn run_display_list(&mut self, entry: u32) {
        let sys = &mut self.system;
        let entry = sys.rsp.segment_address(entry);
        dlist::run(sys, entry);
        drawer::flush(sys);

        if sys.dlist.infinite_loop {
            debug!(entry = format_args!("{entry:#08X}"), "task ended in an infinite loop");
        }
    }

    /// Executes the next display list command. Returns false once the display list ended.
    pub fn step(&mut self) -> bool {
        dlist::step(&mut self.system)
    }

    /// Executes a raw RDP command list.
    pub fn process_rdp_list(&mut self, start: u32, end: u32) {
        dlist::process_rdp_list(&mut self.system, start, end);
    }

    /// Handles a vertical interrupt.
    pub fn update_screen(&mut self) {
        vi::update_screen(&mut self.system);
    }

    /// Switches to the given microcode dialect.
    pub fn load_ucode(&mut self, dialect: Dialect) {
        rsp::load_ucode(&mut self.system, dialect);
    }

    /// Switches to the dialect of the microcode with the given data section. Returns the
    /// dialect, or `None` if the microcode is not recognized.
    pub fn load_ucode_from(&mut self, data: &[u8]) -> Option<Dialect> {
        let dialect = Dialect::detect(data)?;
        self.load_ucode(dialect);
        Some(dialect)
    }

    /// Scale from native pixels to render target pixels.
    pub fn scale(&self) -> f32 {
        framebuffer::scale(&self.system)
    }

    /// Output size in native pixels.
    pub fn size(&self) -> (u32, u32) {
        (self.system.vi.width, self.system.vi.height)
    }

    pub fn save_state(&self) -> Result<Vec<u8>, SnapshotError> {
        snapshot::save(&self.system)
    }

    pub fn restore_state(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        snapshot::restore(&mut self.system, data)
    }

    pub fn rdram(&self) -> &Rdram {
        &self.system.mem
    }

    pub fn rdram_mut(&mut self) -> &mut Rdram {
        &mut self.system.mem
    }

    /// VI registers, written by the host on register writes.
    pub fn vi_mut(&mut self) -> &mut vi::Registers {
        &mut self.system.vi.regs
    }

    pub fn perf(&self) -> &vi::PerfCounters {
        &self.system.perf
    }

    pub fn config(&self) -> &Config {
        &self.system.config
    }
}
