//! Texture loads from RDRAM into TMEM.
//!
//! TMEM is kept in guest byte order, in the layout the texel decoders of `n64tex` expect: rows
//! start at `tmem * 8`, odd rows have their 32-bit halves swapped, 32-bit texels keep red and
//! green in the low half and blue and alpha in the high half, and palette entries are replicated
//! four times.

use tracing::{trace, warn};
use zerocopy::IntoBytes;

use crate::{
    System,
    system::{
        framebuffer,
        mem::{MemoryError, Rdram},
        rdp::{self, LoadType, TextureMode, regs::{ImageFormat, TexelSize}},
    },
};

/// One entry per 64-bit word of TMEM.
pub const LOAD_INFO_LEN: usize = 512;

/// Byte offset of the palette area.
pub const PALETTE_BASE: usize = n64tex::HIGH_HALF;

const TMEM_MASK: usize = n64tex::TMEM_LEN - 1;
const QWORD_MASK: usize = LOAD_INFO_LEN - 1;

/// Describes the most recent load which wrote to a TMEM address.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadInfo {
    pub address: u32,
    pub uls: u16,
    pub ult: u16,
    pub lrs: u16,
    pub lrt: u16,
    pub width: u16,
    pub height: u16,
    /// Width of the source image.
    pub texture_width: u32,
    pub size: TexelSize,
    pub load_type: LoadType,
    pub bytes: u32,
    pub dxt: u16,
}

/// Copies `len` bytes from RDRAM into TMEM, wrapping around TMEM.
fn copy_wrapping(mem: &Rdram, address: u32, tmem: &mut n64tex::Tmem, dst: usize, len: usize) -> Result<(), MemoryError> {
    let src = mem.slice(address, len)?;
    for (i, &byte) in src.iter().enumerate() {
        tmem[(dst + i) & TMEM_MASK] = byte;
    }

    Ok(())
}

/// Swaps the 32-bit halves of `count` words starting at word `qword`.
fn interleave(tmem: &mut n64tex::Tmem, qword: usize, count: usize) {
    for q in qword..qword + count {
        let base = (q & QWORD_MASK) * 8;
        let (low, high) = tmem[base..base + 8].split_at_mut(4);
        low.swap_with_slice(high);
    }
}

/// Writes a 32-bit texel at 16-bit TMEM index `index`, splitting it between both halves.
#[inline(always)]
fn write_split(tmem: &mut n64tex::Tmem, index: usize, texel: u32) {
    let low = (index & 0x3FF) * 2;
    let high = ((index & 0x3FF) | 0x400) * 2;
    tmem[low..low + 2].copy_from_slice(&((texel >> 16) as u16).to_be_bytes());
    tmem[high..high + 2].copy_from_slice(&(texel as u16).to_be_bytes());
}

/// Checks whether a load reads from memory backing a render target, and marks the load tile as
/// sampling that target if it does.
pub fn check_frame_buffer_texture(sys: &mut System, address: u32, bytes: u32) -> bool {
    let load_index = sys.rdp.load_tile;
    {
        let load = &mut sys.rdp.tiles[load_index];
        load.texture_mode = TextureMode::Normal;
        load.frame_buffer = 0;
    }
    sys.rdp.changed.set_tmem(true);

    if !sys.config.frame_buffer.enable {
        return false;
    }

    let mut found = false;
    let candidate = framebuffer::find_buffer(sys, address)
        .map(|fb| (fb.start, fb.end, fb.width, fb.size, fb.readable, fb.cfb));

    if let Some((start, fb_end, fb_width, fb_size, readable, cfb)) = candidate {
        let mut valid = readable;
        if valid && cfb {
            framebuffer::remove_buffer(sys, start);
            valid = false;
        }

        let row = (fb_width << fb_size as u32) >> 1;
        let end = address.wrapping_add(bytes).wrapping_sub(1);
        if address > start && end > fb_end + row {
            valid = false;
        }

        let image = sys.rdp.texture_image;
        let load_type = sys.rdp.tiles[load_index].load_type;
        if valid && load_type == LoadType::Tile && image.width != fb_width && image.size != fb_size {
            valid = false;
        }

        if valid {
            valid = framebuffer::is_valid(sys, start, false);
            if !valid {
                framebuffer::remove_buffer(sys, start);
            }
        }

        if valid {
            let load = &mut sys.rdp.tiles[load_index];
            load.frame_buffer = start;
            load.texture_mode = TextureMode::FrameBuffer;
            trace!(start = format_args!("{start:#08X}"), "load reads from a render target");
        }

        found = valid;
    }

    let load = sys.rdp.tiles[load_index];
    let first = (sys.rsp.texture.tile as usize).min(rdp::TILE_COUNT);
    for tile in &mut sys.rdp.tiles[first..6.max(first)] {
        if tile.tmem == load.tmem {
            tile.texture_mode = load.texture_mode;
            tile.load_type = load.load_type;
            tile.frame_buffer = load.frame_buffer;
            tile.image_address = load.image_address;
        }
    }

    found
}

pub fn load_tile(sys: &mut System, tile: u8, uls: u16, ult: u16, lrs: u16, lrt: u16) {
    let index = tile as usize & 7;
    rdp::set_tile_size(sys, tile, uls, ult, lrs, lrt);

    let image = sys.rdp.texture_image;
    sys.rdp.load_tile = index;
    let load = {
        let load = &mut sys.rdp.tiles[index];
        load.load_type = LoadType::Tile;
        load.image_address = image.address;
        *load
    };

    if load.lrs < load.uls || load.lrt < load.ult {
        return;
    }

    let width = (load.lrs - load.uls + 1) as u32 & 0x3FF;
    let height = (load.lrt - load.ult + 1) as u32 & 0x3FF;
    let bpl = (load.line as u32) << 3;

    sys.rdp.load_info[load.tmem as usize & QWORD_MASK] = LoadInfo {
        address: image.address,
        uls: load.uls,
        ult: load.ult,
        lrs: load.lrs,
        lrt: load.lrt,
        width: (if load.mask_s != 0 { width.min(1 << load.mask_s) } else { width }) as u16,
        height: (if load.mask_t != 0 { height.min(1 << load.mask_t) } else { height }) as u16,
        texture_width: image.width,
        size: image.size,
        load_type: LoadType::Tile,
        bytes: bpl * height,
        dxt: 0,
    };

    if load.line == 0 {
        return;
    }

    let mut address = image.address + load.ult as u32 * image.bpl() + ((load.uls as u32) << image.size as u32 >> 1);
    let visible_bpl = if load.lrs as u32 > image.width {
        image.width.saturating_sub(load.uls as u32)
    } else {
        bpl
    };
    let visible_height = if load.lrt as f32 > sys.rdp.scissor.lry {
        (sys.rdp.scissor.lry as u32).saturating_sub(load.ult as u32)
    } else {
        height
    };

    if check_frame_buffer_texture(sys, address, visible_bpl * visible_height) {
        return;
    }

    if !sys.mem.contains(address, (height * image.bpl()) as usize) {
        warn!(address = format_args!("{address:#08X}"), "load tile out of bounds");
        return;
    }

    if load.size == TexelSize::Bits32 {
        load_tile_32b(sys, &load);
        return;
    }

    let mut tmem_address = load.tmem as usize;
    for y in 0..height {
        if let Err(e) = copy_wrapping(&sys.mem, address, &mut sys.rdp.tmem, tmem_address << 3, bpl as usize) {
            warn!("load tile: {e}");
            return;
        }

        if y & 1 == 1 {
            interleave(&mut sys.rdp.tmem, tmem_address, load.line as usize);
        }

        address += image.bpl();
        tmem_address += load.line as usize;
    }

    trace!(tile, uls = load.uls, ult = load.ult, lrs = load.lrs, lrt = load.lrt, "load tile");
}

fn load_tile_32b(sys: &mut System, load: &rdp::Tile) {
    let image = sys.rdp.texture_image;
    let width = (load.lrs - load.uls + 1) as usize;
    let height = (load.lrt - load.ult + 1) as usize;
    let line = (load.line as usize) << 2;
    let base = (load.tmem as usize) << 2;

    for j in 0..height {
        let row = base + line * j;
        let start = (j + load.ult as usize) * image.width as usize + load.uls as usize;
        let swap = if j & 1 == 1 { 2 } else { 0 };
        for i in 0..width {
            let Ok(texel) = sys.mem.read_u32(image.address + 4 * (start + i) as u32) else {
                warn!("32-bit load tile out of bounds");
                return;
            };

            write_split(&mut sys.rdp.tmem, (row + i) ^ swap, texel);
        }
    }
}

pub fn load_block(sys: &mut System, tile: u8, uls: u16, ult: u16, lrs: u16, dxt: u16) {
    let index = tile as usize & 7;
    rdp::set_tile_size(sys, tile, uls, ult, lrs, dxt);

    let image = sys.rdp.texture_image;
    sys.rdp.load_tile = index;
    let load = {
        let load = &mut sys.rdp.tiles[index];
        load.load_type = LoadType::Block;
        load.image_address = image.address;
        *load
    };

    let texels = (lrs as u32).wrapping_sub(uls as u32).wrapping_add(1) & 0xFFF;
    let bytes = ((texels << load.size as u32) >> 1).next_multiple_of(8);

    sys.rdp.load_info[load.tmem as usize & QWORD_MASK] = LoadInfo {
        address: image.address,
        uls: load.uls,
        ult: load.ult,
        lrs: load.lrs,
        lrt: load.lrt,
        width: load.lrs,
        height: 0,
        texture_width: image.width,
        size: image.size,
        load_type: LoadType::Block,
        bytes,
        dxt,
    };

    let address = image.address + ult as u32 * image.bpl() + ((uls as u32) << image.size as u32 >> 1);
    if bytes == 0 || !sys.mem.contains(address, bytes as usize) {
        warn!(address = format_args!("{address:#08X}"), bytes, "load block out of bounds");
        return;
    }

    sys.rdp.tiles[index].frame_buffer = 0;
    // TMEM is loaded even when the block comes from a render target
    check_frame_buffer_texture(sys, address, bytes);

    if load.size == TexelSize::Bits32 {
        load_block_32b(sys, &load, dxt);
        return;
    }

    if load.format == ImageFormat::Yuv {
        if let Err(e) = copy_wrapping(&sys.mem, address, &mut sys.rdp.tmem, 0, bytes as usize) {
            warn!("load block: {e}");
        }
        return;
    }

    let mut tmem_address = load.tmem as usize;
    if let Err(e) = copy_wrapping(&sys.mem, address, &mut sys.rdp.tmem, tmem_address << 3, bytes as usize) {
        warn!("load block: {e}");
        return;
    }

    if dxt == 0 {
        return;
    }

    // dxt advances a line counter by one per word; words of odd lines are swapped
    let mut counter = 0u32;
    let mut qwords = bytes >> 3;
    let mut line = 0;
    'outer: loop {
        loop {
            tmem_address += 1;
            qwords -= 1;
            if qwords == 0 {
                break 'outer;
            }

            counter += dxt as u32;
            if counter & 0x800 != 0 {
                break;
            }
        }

        loop {
            line += 1;
            qwords -= 1;
            if qwords == 0 {
                break 'outer;
            }

            counter += dxt as u32;
            if counter & 0x800 == 0 {
                break;
            }
        }

        interleave(&mut sys.rdp.tmem, tmem_address, line);
        tmem_address += line;
        line = 0;
    }

    interleave(&mut sys.rdp.tmem, tmem_address, line);
}

fn load_block_32b(sys: &mut System, load: &rdp::Tile, dxt: u16) {
    let base = (load.tmem as usize) << 2;
    let line = (load.line as usize) << 2;
    let address = load.image_address & !3;

    let mut width = ((load.lrs as usize).wrapping_sub(load.uls as usize).wrapping_add(1) << 2) & 0x3FFF;
    if width == 4 {
        width = 1;
    } else {
        width = width.next_multiple_of(8);
    }

    let read = |mem: &Rdram, i: usize| mem.read_u32(address + 4 * i as u32);
    if dxt == 0 {
        for i in 0..width {
            let Ok(texel) = read(&sys.mem, i) else {
                warn!("32-bit load block out of bounds");
                return;
            };

            write_split(&mut sys.rdp.tmem, base + i, texel);
        }

        return;
    }

    let mut counter = 0u32;
    let mut swap = None;
    let mut i = 0;
    while i < width {
        let odd = (counter >> 11) & 1 == 1;
        if swap != Some(odd) {
            // skipping a line whenever the parity changes, starting with the first
            i += line;
        }
        swap = Some(odd);

        let xor = if odd { 2 } else { 0 };
        for k in 0..2 {
            let Ok(texel) = read(&sys.mem, i + k) else {
                warn!("32-bit load block out of bounds");
                return;
            };

            write_split(&mut sys.rdp.tmem, (base + i + k) ^ xor, texel);
        }

        counter = counter.wrapping_add(dxt as u32);
        i += 2;
    }
}

pub fn load_tlut(sys: &mut System, tile: u8, uls: u16, ult: u16, lrs: u16, lrt: u16) {
    rdp::set_tile_size(sys, tile, uls, ult, lrs, lrt);

    let t = sys.rdp.tiles[tile as usize & 7];
    if t.tmem < 256 {
        warn!(tile, tmem = t.tmem, "palette load outside of the palette area");
        return;
    }

    let image = sys.rdp.texture_image;
    let mut count = (t.lrs.wrapping_sub(t.uls).wrapping_add(1) as usize)
        * (t.lrt.wrapping_sub(t.ult).wrapping_add(1) as usize);
    let mut address = image.address + t.ult as u32 * image.bpl() + ((t.uls as u32) << image.size as u32 >> 1);
    let mut palette = ((t.tmem - 256) >> 4) as usize;
    if palette != 0 {
        count = 16;
    }
    let count = count.min(256);

    let dest = (t.tmem as usize) << 3;
    let mut i = 0;
    let mut slot = 0;
    while i < count {
        for _ in 0..16 {
            if i >= count {
                break;
            }

            let entry = match sys.mem.read_u16(address) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("load tlut: {e}");
                    return;
                }
            };

            let offset = (dest + slot * 8) & TMEM_MASK & !7;
            for replica in sys.rdp.tmem[offset..offset + 8].chunks_exact_mut(2) {
                replica.copy_from_slice(&entry.to_be_bytes());
            }

            address += 2;
            slot += 1;
            i += 1;
        }

        let bank = PALETTE_BASE + palette * 16 * 8;
        sys.rdp.palette_crc[palette] =
            sys.hasher.palette_hash(u32::MAX, &sys.rdp.tmem[bank..bank + 16 * 8], 16);
        palette = (palette + 1) & 0xF;
    }

    sys.rdp.palette_crc256 = sys.hasher.hash(u32::MAX, sys.rdp.palette_crc.as_bytes());
    sys.rdp.changed.set_tmem(true);
    trace!(tile, count, "load tlut");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Opal,
        config::Config,
        modules::render::NopRenderModule,
        system::{mem::Rdram, rdp::regs::TileCommand},
    };

    fn opal() -> Opal {
        let mut config = Config::default();
        config.emulation.noise = false;
        Opal::new(config, Rdram::new(0x10000), Box::new(NopRenderModule))
    }

    fn set_tile(sys: &mut System, tile: u8, size: TexelSize, line: u16, tmem: u16) {
        let w0 = ((size as u64) << 19) | ((line as u64) << 9) | tmem as u64;
        let w1 = (tile as u64) << 24;
        rdp::set_tile(sys, TileCommand::from_bits((w0 << 32) | w1));
    }

    #[test]
    fn tile_load_swaps_odd_rows() {
        let mut opal = opal();
        let sys = opal.system_mut();
        for i in 0..32u32 {
            sys.mem.write_u8(0x1000 + i, i as u8).unwrap();
        }

        // 4x2 rgba16 texture, one word per row
        rdp::set_texture_image(sys, ImageFormat::Rgba, TexelSize::Bits16, 4, 0x1000);
        set_tile(sys, 7, TexelSize::Bits16, 1, 0);
        load_tile(sys, 7, 0, 0, 3 << 2, 1 << 2);

        assert_eq!(&sys.rdp.tmem[0..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&sys.rdp.tmem[8..16], &[12, 13, 14, 15, 8, 9, 10, 11]);

        let info = sys.rdp.load_info[0];
        assert_eq!(info.width, 4);
        assert_eq!(info.height, 2);
        assert_eq!(info.bytes, 16);
    }

    #[test]
    fn block_load_with_dxt() {
        let mut opal = opal();
        let sys = opal.system_mut();
        for i in 0..32u32 {
            sys.mem.write_u8(0x2000 + i, i as u8).unwrap();
        }

        // 16 rgba16 texels, 4 per line: dxt = 2048 / 1 word per line
        rdp::set_texture_image(sys, ImageFormat::Rgba, TexelSize::Bits16, 1, 0x2000);
        set_tile(sys, 7, TexelSize::Bits16, 0, 0);
        load_block(sys, 7, 0, 0, 15, 0x800);

        assert_eq!(&sys.rdp.tmem[0..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&sys.rdp.tmem[8..16], &[12, 13, 14, 15, 8, 9, 10, 11]);
        assert_eq!(&sys.rdp.tmem[16..24], &[16, 17, 18, 19, 20, 21, 22, 23]);
        assert_eq!(&sys.rdp.tmem[24..32], &[28, 29, 30, 31, 24, 25, 26, 27]);
        assert_eq!(sys.rdp.load_info[0].bytes, 32);
    }

    #[test]
    fn tlut_is_replicated_and_hashed() {
        let mut opal = opal();
        let sys = opal.system_mut();
        for i in 0..16u32 {
            sys.mem.write_u16(0x3000 + 2 * i, 0x1000 + i as u16).unwrap();
        }

        rdp::set_texture_image(sys, ImageFormat::Rgba, TexelSize::Bits16, 1, 0x3000);
        // palette 0 lives at tmem word 256
        set_tile(sys, 7, TexelSize::Bits4, 0, 256);
        load_tlut(sys, 7, 0, 0, 15 << 2, 0);

        assert_eq!(n64tex::palette_entry(&sys.rdp.tmem, 0), 0x1000);
        assert_eq!(n64tex::palette_entry(&sys.rdp.tmem, 15), 0x100F);
        assert_eq!(&sys.rdp.tmem[PALETTE_BASE + 8..PALETTE_BASE + 16], &[0x10, 0x01].repeat(4)[..]);

        let crc = sys.hasher.palette_hash(u32::MAX, &sys.rdp.tmem[PALETTE_BASE..PALETTE_BASE + 128], 16);
        assert_eq!(sys.rdp.palette_crc[0], crc);
        assert!(sys.rdp.changed.tmem());

        // reloading the same palette leaves the combined crc unchanged
        let crc256 = sys.rdp.palette_crc256;
        load_tlut(sys, 7, 0, 0, 15 << 2, 0);
        assert_eq!(sys.rdp.palette_crc256, crc256);
    }

    #[test]
    fn tlut_outside_palette_area_is_refused() {
        let mut opal = opal();
        let sys = opal.system_mut();
        set_tile(sys, 7, TexelSize::Bits4, 0, 0);
        sys.rdp.changed = rdp::regs::RdpChanged::from_bits(0);
        load_tlut(sys, 7, 0, 0, 15 << 2, 0);
        assert!(!sys.rdp.changed.tmem());
    }

    #[test]
    fn split_texels() {
        let mut tmem = [0u8; n64tex::TMEM_LEN];
        write_split(&mut tmem, 1, 0x1122_3344);
        assert_eq!(&tmem[2..4], &[0x11, 0x22]);
        assert_eq!(&tmem[0x802..0x804], &[0x33, 0x44]);
    }
}
