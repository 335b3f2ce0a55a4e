#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use opal::{
    Opal,
    config::Config,
    modules::render::{Action, RenderModule},
    system::{gbi::Dialect, mem::Rdram},
};

/// Shared log of the actions a [`Recorder`] received.
pub type Log = Arc<Mutex<Vec<Action>>>;

/// A render module which keeps every action it is given.
pub struct Recorder(pub Log);

impl RenderModule for Recorder {
    fn exec(&mut self, action: Action) {
        self.0.lock().unwrap().push(action);
    }
}

pub const END: u32 = 0xDF00_0000;

pub fn config() -> Config {
    let mut config = Config::default();
    config.emulation.noise = false;
    config
}

/// Builds a core running F3DEX2 on top of a recorder.
pub fn recorded(config: Config, rdram_len: usize) -> (Opal, Log) {
    let log = Log::default();
    let mut opal = Opal::new(config, Rdram::new(rdram_len), Box::new(Recorder(log.clone())));
    opal.load_ucode(Dialect::F3dex2);
    (opal, log)
}

/// Writes a display list made of command word pairs.
pub fn write(opal: &mut Opal, address: u32, words: &[(u32, u32)]) {
    for (i, &(w0, w1)) in words.iter().enumerate() {
        let pc = address + 8 * i as u32;
        opal.rdram_mut().write_u32(pc, w0).unwrap();
        opal.rdram_mut().write_u32(pc + 4, w1).unwrap();
    }
}

/// The debug representation of every recorded action, optionally only those starting with
/// `prefix`.
pub fn names(log: &Log, prefix: &str) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .map(|action| format!("{action:?}"))
        .filter(|name| name.starts_with(prefix))
        .collect()
}

/// The three command pairs of a texture rectangle. Coordinates are in pixels, texture steps are
/// one texel per pixel.
pub fn texrect(tile: u32, ulx: u32, uly: u32, lrx: u32, lry: u32, s: u16, t: u16) -> [(u32, u32); 3] {
    [
        (0xE400_0000 | (lrx * 4) << 12 | lry * 4, tile << 24 | (ulx * 4) << 12 | uly * 4),
        (0xE100_0000, (s as u32) << 16 | t as u32),
        (0xF100_0000, 0x0400_0400),
    ]
}
