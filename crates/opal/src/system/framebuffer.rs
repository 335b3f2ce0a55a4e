//! Render targets standing in for guest color images.
//!
//! Targets are keyed by the guest address of the image they replace. The guest reuses and aliases
//! these addresses all the time, so every time a color image is selected the cache decides whether
//! the target it already has for that address still describes the same image, and whether the
//! guest memory behind a target was overwritten since the target was last drawn to.
//!
//! Validity is judged by fingerprint. A colliding fingerprint keeps a stale target alive, which is
//! accepted.

use color::Rgba8;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, trace, warn};

use crate::{
    System,
    modules::render::{Action, Rect, TargetId, oneshot},
    system::{
        depth,
        rdp::regs::{ImageFormat, TexelSize},
        vi,
    },
};

/// Widths above this are not color images.
pub const MAX_WIDTH: u32 = 640;

/// Words written at the start of an auxiliary buffer that is not copied back, to notice when the
/// guest overwrites it.
pub const FINGERPRINT: [u32; 4] = [2, 6, 0, 4];

/// Parameters of the fill which cleared a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearParams {
    pub fill: u32,
    pub ulx: u32,
    pub uly: u32,
    pub lrx: u32,
    pub lry: u32,
}

#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub id: TargetId,
    pub start: u32,
    /// Last byte of the image in guest memory.
    pub end: u32,
    pub format: ImageFormat,
    pub size: TexelSize,
    pub width: u32,
    /// Lines drawn so far.
    pub height: u32,
    /// Lines the target can hold.
    pub max_height: u32,
    pub scale: f32,
    /// Written by the CPU instead of the RDP.
    pub cfb: bool,
    pub cleared: Option<ClearParams>,
    pub fingerprint: bool,
    pub rdram_hash: Option<u32>,
    pub changed: bool,
    pub copied_to_rdram: bool,
    pub is_depth: bool,
    /// Can be sampled as a texture.
    pub readable: bool,
    pub resolved_frame: Option<u32>,
    pub validity_checked: Option<u32>,
    pub swap_count: u32,
    pub depth: Option<crate::modules::render::DepthId>,
}

impl FrameBuffer {
    /// Whether this buffer is not the size of the output.
    #[inline(always)]
    pub fn is_auxiliary(&self, vi: &vi::State) -> bool {
        self.width != vi.width
    }

    /// Bytes per line.
    #[inline(always)]
    pub fn bpl(&self) -> u32 {
        (self.width << self.size as u32) >> 1
    }

    #[inline(always)]
    pub fn contains(&self, address: u32) -> bool {
        self.start <= address && address <= self.end
    }

    fn update_end(&mut self, rdram_len: usize) {
        let bytes = (self.width * self.height.max(1)) << self.size as u32 >> 1;
        let last = (rdram_len as u32).saturating_sub(1);
        self.end = self.start.saturating_add(bytes.max(1) - 1).min(last);
    }

    fn len(&self) -> usize {
        self.end.checked_sub(self.start).map_or(0, |bytes| bytes as usize + 1)
    }
}

#[derive(Debug, Default)]
pub struct FrameBuffers {
    /// Buffers by start address, oldest first.
    pub list: IndexMap<u32, FrameBuffer, FxBuildHasher>,
    /// Start address of the buffer being drawn to.
    pub current: Option<u32>,
    next_id: u32,
    /// A color image was selected since the last swap.
    pub color_changed: bool,
}

impl FrameBuffers {
    fn allocate(&mut self) -> TargetId {
        let id = TargetId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

/// Resolution multiplier of full size render targets.
pub fn scale(sys: &System) -> f32 {
    let factor = sys.config.frame_buffer.native_res_factor;
    if factor > 0 {
        return factor as f32;
    }

    let width = if sys.vi.width == 0 { 320 } else { sys.vi.width };
    sys.config.video.window_width as f32 / width as f32
}

/// Number of lines a target of `width` pixels is allocated with.
pub fn max_height(sys: &System, width: u32) -> u32 {
    if width > 320 || sys.vi.height > 240 {
        480
    } else if sys.vi.pal {
        288
    } else {
        240
    }
}

pub fn current(sys: &System) -> Option<&FrameBuffer> {
    sys.framebuffers.list.get(&sys.framebuffers.current?)
}

fn current_mut(sys: &mut System) -> Option<&mut FrameBuffer> {
    sys.framebuffers.list.get_mut(&sys.framebuffers.current?)
}

/// The buffer starting exactly at `address`.
pub fn get_buffer(sys: &System, address: u32) -> Option<&FrameBuffer> {
    sys.framebuffers.list.get(&address)
}

/// The newest buffer whose memory contains `address`.
pub fn find_buffer(sys: &System, address: u32) -> Option<&FrameBuffer> {
    sys.framebuffers.list.values().rev().find(|fb| fb.contains(address))
}

/// Releases a buffer and its target.
pub fn remove_buffer(sys: &mut System, start: u32) {
    let Some(fb) = sys.framebuffers.list.shift_remove(&start) else {
        return;
    };

    if sys.framebuffers.current == Some(start) {
        sys.framebuffers.current = None;
    }

    sys.render.exec(Action::DeleteTarget(fb.id));
    trace!(start = format_args!("{start:#08X}"), width = fb.width, "removed render target");
}

fn remove_where(sys: &mut System, predicate: impl Fn(&FrameBuffer) -> bool) {
    let starts: Vec<u32> = sys
        .framebuffers
        .list
        .values()
        .filter(|fb| predicate(fb))
        .map(|fb| fb.start)
        .collect();

    for start in starts {
        remove_buffer(sys, start);
    }
}

pub fn remove_buffers(sys: &mut System, width: u32) {
    remove_where(sys, |fb| fb.width == width);
}

pub fn remove_aux(sys: &mut System) {
    let vi_width = sys.vi.width;
    remove_where(sys, |fb| fb.width != vi_width);
}

/// Removes every buffer overlapping the memory of the current one.
fn remove_intersections(sys: &mut System) {
    let Some((start, end)) = current(sys).map(|fb| (fb.start, fb.end)) else {
        return;
    };

    remove_where(sys, |fb| fb.start != start && fb.start <= end && start <= fb.end);
}

/// Copies every auxiliary buffer into guest memory.
pub fn copy_aux(sys: &mut System) {
    let vi_width = sys.vi.width;
    let starts: Vec<u32> = sys
        .framebuffers
        .list
        .values()
        .filter(|fb| fb.width != vi_width)
        .map(|fb| fb.start)
        .collect();

    for start in starts {
        copy_to_rdram(sys, start, true);
    }
}

/// Hashes the guest memory behind a buffer.
fn rdram_hash(sys: &System, fb: &FrameBuffer) -> Option<u32> {
    let bytes = sys.mem.slice(fb.start, fb.len()).ok()?;
    Some(sys.hasher.hash(u32::MAX, bytes))
}

fn create(sys: &mut System, address: u32, format: ImageFormat, size: TexelSize, width: u32, cfb: bool) -> bool {
    if !sys.mem.contains(address, 1) {
        warn!(address = format_args!("{address:#08X}"), "color image outside of RDRAM");
        return false;
    }

    let auxiliary = width != sys.vi.width;
    let scale = if auxiliary && sys.config.frame_buffer.copy_aux_to_rdram {
        1.0
    } else {
        scale(sys)
    };

    let max_height = max_height(sys, width);
    let caps = sys.render.capabilities();
    if (width as f32 * scale) as u32 > caps.max_target_width {
        debug!(width, scale, "render target too large for the renderer");
        return false;
    }

    let id = sys.framebuffers.allocate();
    sys.render.exec(Action::CreateTarget {
        id,
        width,
        height: max_height,
        scale,
        samples: sys.config.video.multisampling,
    });

    let mut fb = FrameBuffer {
        id,
        start: address,
        end: address,
        format,
        size,
        width,
        height: if cfb { sys.vi.height.min(max_height) } else { 1 },
        max_height,
        scale,
        cfb,
        cleared: None,
        fingerprint: false,
        rdram_hash: None,
        changed: false,
        copied_to_rdram: false,
        is_depth: false,
        readable: false,
        resolved_frame: None,
        validity_checked: None,
        swap_count: sys.vi.swap_count,
        depth: None,
    };
    fb.update_end(sys.mem.len());
    sys.framebuffers.list.insert(address, fb);

    debug!(address = format_args!("{address:#08X}"), width, max_height, scale, "created render target");
    true
}

/// Selects the render target standing in for the color image at `address`.
pub fn save_buffer(sys: &mut System, address: u32, format: ImageFormat, size: TexelSize, width: u32, cfb: bool) {
    if width > MAX_WIDTH {
        debug!(width, "color image too wide, ignored");
        return;
    }

    if !sys.config.frame_buffer.enable {
        screen_buffer(sys, address, format, size);
        return;
    }

    // an auxiliary buffer is done once the next color image is selected
    if sys.config.frame_buffer.copy_aux_to_rdram
        && let Some(start) = current(sys).filter(|fb| fb.is_auxiliary(&sys.vi)).map(|fb| fb.start)
        && start != address
    {
        copy_to_rdram(sys, start, true);
        remove_buffer(sys, start);
    }

    if current(sys).is_some() {
        let hash = current(sys)
            .filter(|fb| {
                fb.cleared.is_none() && !fb.cfb && !fb.is_depth && !fb.copied_to_rdram && fb.height > 1
            })
            .and_then(|fb| rdram_hash(sys, fb));

        if let Some(fb) = current_mut(sys) {
            fb.readable = true;
            if hash.is_some() {
                fb.rdram_hash = hash;
            }
        }

        remove_intersections(sys);
    }

    let scale = scale(sys);
    let existing = find_buffer(sys, address).map(|fb| (fb.start, fb.width, fb.size, fb.scale, fb.is_auxiliary(&sys.vi)));
    let mut reused = false;
    if let Some((start, fb_width, fb_size, fb_scale, auxiliary)) = existing {
        let aux_scale = auxiliary && sys.config.frame_buffer.copy_aux_to_rdram;
        let evict = start != address
            || fb_width != width
            || (fb_size as u32) < (size as u32)
            || (!aux_scale && fb_scale != scale);

        if evict {
            remove_buffer(sys, start);
        } else {
            reused = true;
            let fill = sys.rdp.fill_color();
            let len = sys.mem.len();
            if let Some(fb) = sys.framebuffers.list.get_mut(&address) {
                if fb.size != size {
                    let rect = Rect::new(0.0, 0.0, fb.width as f32, fb.max_height as f32);
                    sys.render.exec(Action::ClearColor {
                        target: fb.id,
                        color: fill,
                        rect,
                    });
                    fb.size = size;
                    fb.format = format;
                    fb.update_end(len);
                }
                fb.cfb = cfb;
            }
        }
    }

    if !reused && !create(sys, address, format, size, width, cfb) {
        sys.framebuffers.current = None;
        sys.render.exec(Action::BindTarget(None));
        return;
    }

    sys.framebuffers.current = Some(address);
    sys.framebuffers.color_changed = true;

    let is_depth = address == sys.rdp.depth_image;
    if is_depth {
        depth::save_buffer(sys, address);
    } else {
        attach_depth_buffer(sys);
    }

    let swap_count = sys.vi.swap_count;
    let Some(fb) = current_mut(sys) else {
        return;
    };
    fb.is_depth = is_depth;
    fb.copied_to_rdram = false;
    fb.swap_count = swap_count;
    let id = fb.id;

    if !reused && (cfb || sys.config.frame_buffer.copy_from_rdram) {
        copy_from_rdram(sys, address);
    }

    sys.render.exec(Action::BindTarget(Some(id)));
}

/// The single screen sized target used when render targets are not emulated.
fn screen_buffer(sys: &mut System, address: u32, format: ImageFormat, size: TexelSize) {
    if current(sys).is_some() {
        return;
    }

    let width = if sys.vi.width == 0 { 320 } else { sys.vi.width };
    if create(sys, address, format, size, width, false) {
        sys.framebuffers.current = Some(address);
        attach_depth_buffer(sys);
        let id = current(sys).map(|fb| fb.id);
        sys.render.exec(Action::BindTarget(id));
    }
}

/// Records that the current buffer was drawn to, down to line `max_y`.
pub fn set_buffer_changed(sys: &mut System, max_y: f32) {
    let lry = sys.rdp.scissor.lry.max(0.0) as u32;
    let image = &mut sys.rdp.color_image;
    image.height = image.height.max(max_y.max(0.0).ceil() as u32).min(lry);
    let height = image.height;

    let len = sys.mem.len();
    if let Some(fb) = current_mut(sys) {
        fb.height = fb.height.max(height).min(fb.max_height);
        fb.update_end(len);
        fb.cfb = false;
        fb.changed = true;
        fb.copied_to_rdram = false;
    }
}

/// Marks the presented buffer as unchanged.
pub fn clear_buffers_changed(sys: &mut System) {
    sys.framebuffers.color_changed = false;

    let origin = sys.vi.regs.origin & crate::system::mem::ADDRESS_MASK;
    let start = find_buffer(sys, origin).map(|fb| fb.start);
    if let Some(fb) = start.and_then(|start| sys.framebuffers.list.get_mut(&start)) {
        fb.changed = false;
    }
}

/// Attaches the current depth buffer to the current render target, when their widths match.
pub fn attach_depth_buffer(sys: &mut System) {
    let depth = depth::current(sys).map(|db| (db.id, db.width));
    let Some(fb) = current_mut(sys) else {
        return;
    };

    fb.depth = depth.filter(|&(_, width)| width == fb.width).map(|(id, _)| id);
    let (target, depth) = (fb.id, fb.depth);
    sys.render.exec(Action::AttachDepth { target, depth });
}

/// Writes the fill color into the guest color image, inside the scissor.
pub fn fill_rdram(sys: &mut System, ulx: i32, uly: i32, lrx: i32, lry: i32) {
    let Some(fb) = current(sys) else {
        return;
    };

    if sys.config.frame_buffer.copy_from_rdram && !fb.is_depth {
        return;
    }

    let image = sys.rdp.color_image;
    if image.size == TexelSize::Bits4 {
        return;
    }

    let scissor = sys.rdp.scissor;
    let ulx = ulx.max(scissor.ulx as i32).max(0) as u32;
    let uly = uly.max(scissor.uly as i32).max(0) as u32;
    let lrx = (lrx.min(scissor.lrx as i32).max(0) as u32).min(image.width);
    let lry = lry.min(scissor.lry as i32).max(0) as u32;
    if ulx >= lrx || uly >= lry {
        return;
    }

    // one fill word covers 32 bits worth of pixels
    let shift = 3 - image.size as u32;
    let row_words = image.width >> shift;
    let (x0, x1) = (ulx >> shift, lrx >> shift);
    let fill = sys.rdp.fill.raw.to_be_bytes();

    for y in uly..lry {
        let address = image.address + (y * row_words + x0) * 4;
        let Ok(row) = sys.mem.slice_mut(address, ((x1 - x0) * 4) as usize) else {
            warn!(address = format_args!("{address:#08X}"), "fill outside of RDRAM");
            break;
        };

        for word in row.chunks_exact_mut(4) {
            word.copy_from_slice(&fill);
        }
    }

    let clear = ClearParams {
        fill: sys.rdp.fill.raw,
        ulx,
        uly,
        lrx,
        lry,
    };

    if let Some(fb) = current_mut(sys) {
        fb.cleared = Some(clear);
    }
}

/// Checks whether the guest memory behind a buffer still holds what the buffer last wrote. Runs
/// once per swap unless forced.
pub fn is_valid(sys: &mut System, start: u32, force: bool) -> bool {
    let swap_count = sys.vi.swap_count;
    let Some(fb) = sys.framebuffers.list.get_mut(&start) else {
        return false;
    };

    if fb.validity_checked == Some(swap_count) && !force {
        return true;
    }
    fb.validity_checked = Some(swap_count);

    let fb = fb.clone();
    if let Some(clear) = fb.cleared {
        let shift = 3 - (fb.size as u32).max(1);
        let row_words = fb.width >> shift;
        let expected = clear.fill & 0xFFFE_FFFE;

        let mut wrong = 0u32;
        for y in clear.uly..clear.lry {
            for x in (clear.ulx >> shift)..(clear.lrx >> shift) {
                let address = fb.start + (y * row_words + x) * 4;
                match sys.mem.read_u32(address) {
                    Ok(word) if word & 0xFFFE_FFFE == expected => (),
                    _ => wrong += 1,
                }
            }
        }

        wrong < fb.end.saturating_sub(fb.start) / 400
    } else if fb.fingerprint {
        FINGERPRINT
            .iter()
            .enumerate()
            .all(|(i, &word)| matches!(sys.mem.read_u32(fb.start + 4 * i as u32), Ok(w) if w == word))
    } else {
        match fb.rdram_hash {
            Some(hash) => rdram_hash(sys, &fb) == Some(hash),
            None => true,
        }
    }
}

/// Reads a buffer back from the renderer and writes it into guest memory.
pub fn copy_to_rdram(sys: &mut System, address: u32, sync: bool) {
    let Some(fb) = find_buffer(sys, address).cloned() else {
        return;
    };

    if fb.height <= 1 || fb.is_depth {
        return;
    }

    // auxiliary buffers that are not copied get a fingerprint instead
    if fb.is_auxiliary(&sys.vi) && !sys.config.frame_buffer.copy_aux_to_rdram {
        let words = (fb.len() / 200).max(4);
        let Ok(dst) = sys.mem.slice_mut(fb.start, (words * 4).min(fb.len())) else {
            return;
        };

        dst.fill(0);
        for (word, value) in dst.chunks_exact_mut(4).zip(FINGERPRINT) {
            word.copy_from_slice(&value.to_be_bytes());
        }

        if let Some(fb) = sys.framebuffers.list.get_mut(&fb.start) {
            fb.fingerprint = true;
        }
        return;
    }

    let (width, height) = (fb.width, fb.height);
    let (response, receiver) = oneshot::channel();
    sys.render.exec(Action::ReadColor {
        target: fb.id,
        width,
        height,
        response,
    });

    let Ok(pixels) = receiver.recv() else {
        debug!(target = ?fb.id, "renderer did not read back the render target");
        return;
    };

    if pixels.len() < (width * height) as usize {
        debug!(len = pixels.len(), width, height, "short render target read back");
        return;
    }

    let bytes = match fb.size {
        TexelSize::Bits16 => pixels[..(width * height) as usize]
            .iter()
            .flat_map(|p| p.to_rgba5551().to_be_bytes())
            .collect::<Vec<_>>(),
        TexelSize::Bits32 => pixels[..(width * height) as usize]
            .iter()
            .flat_map(|p| p.to_rgba8888().to_be_bytes())
            .collect::<Vec<_>>(),
        size => {
            debug!(?size, "render target size cannot be copied back");
            return;
        }
    };

    let Ok(dst) = sys.mem.slice_mut(fb.start, bytes.len().min(fb.len())) else {
        warn!(start = format_args!("{:#08X}", fb.start), "render target outside of RDRAM");
        return;
    };

    let len = dst.len();
    dst.copy_from_slice(&bytes[..len]);

    let hash = rdram_hash(sys, &fb);
    if let Some(fb) = sys.framebuffers.list.get_mut(&fb.start) {
        fb.copied_to_rdram = true;
        fb.rdram_hash = hash;
        fb.validity_checked = None;
    }

    trace!(start = format_args!("{:#08X}", fb.start), width, height, sync, "copied render target to RDRAM");
}

/// Uploads the guest image behind a buffer into its target.
pub fn copy_from_rdram(sys: &mut System, address: u32) {
    let Some(fb) = find_buffer(sys, address).cloned() else {
        return;
    };

    let height = fb.height.max(1);
    let len = ((fb.width * height) << fb.size as u32 >> 1) as usize;
    let Ok(bytes) = sys.mem.slice(fb.start, len) else {
        debug!(start = format_args!("{:#08X}", fb.start), "render target outside of RDRAM");
        return;
    };

    let data: Vec<Rgba8> = match fb.size {
        TexelSize::Bits32 => bytes
            .chunks_exact(4)
            .map(|c| Rgba8::from_rgba8888(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
        _ => bytes
            .chunks_exact(2)
            .map(|c| Rgba8::from_rgba5551(u16::from_be_bytes([c[0], c[1]])))
            .collect(),
    };

    sys.render.exec(Action::UploadColor {
        target: fb.id,
        width: fb.width,
        height,
        data,
    });

    let hash = rdram_hash(sys, &fb);
    if let Some(fb) = sys.framebuffers.list.get_mut(&fb.start) {
        fb.rdram_hash = hash;
        fb.readable = true;
    }
}

/// Resolves a multisampled buffer, at most once per swap.
pub fn resolve(sys: &mut System, start: u32) {
    if sys.config.video.multisampling == 0 {
        return;
    }

    if !sys.render.capabilities().multisampling {
        debug!("renderer cannot resolve multisampled targets");
        return;
    }

    let swap_count = sys.vi.swap_count;
    let Some(fb) = sys.framebuffers.list.get_mut(&start) else {
        return;
    };

    if fb.resolved_frame != Some(swap_count) {
        fb.resolved_frame = Some(swap_count);
        let id = fb.id;
        sys.render.exec(Action::Resolve(id));
    }
}

/// Presents the buffer the VI is scanning out.
pub fn render_buffer(sys: &mut System) {
    let origin = sys.vi.regs.origin & crate::system::mem::ADDRESS_MASK;
    let start = find_buffer(sys, origin).map(|fb| fb.start);
    if let Some(start) = start {
        resolve(sys, start);
    }

    let target = start.and_then(|start| get_buffer(sys, start)).map(|fb| fb.id);
    if target.is_none() {
        trace!(origin = format_args!("{origin:#08X}"), "no render target at the vi origin");
    }

    let (width, height) = (sys.vi.width, sys.vi.height);
    sys.render.exec(Action::Present {
        target,
        width,
        height,
    });
}
