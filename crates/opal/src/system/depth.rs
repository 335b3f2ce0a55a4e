//! Depth buffers standing in for guest depth images.

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, trace, warn};

use crate::{
    System,
    modules::render::{Action, DepthId, Rect, oneshot},
    system::framebuffer,
};

#[derive(Debug, Clone)]
pub struct DepthBuffer {
    pub id: DepthId,
    pub address: u32,
    pub width: u32,
    pub height: u32,
    /// Area covered by the last clear.
    pub clear: Option<Rect>,
    pub resolved_frame: Option<u32>,
    pub copied_frame: Option<u32>,
}

#[derive(Debug, Default)]
pub struct DepthBuffers {
    pub list: IndexMap<u32, DepthBuffer, FxBuildHasher>,
    /// Address of the depth image in use.
    pub current: Option<u32>,
    next_id: u32,
}

pub fn current(sys: &System) -> Option<&DepthBuffer> {
    sys.depth_buffers.list.get(&sys.depth_buffers.current?)
}

fn current_mut(sys: &mut System) -> Option<&mut DepthBuffer> {
    sys.depth_buffers.list.get_mut(&sys.depth_buffers.current?)
}

fn remove(sys: &mut System, address: u32) {
    let Some(db) = sys.depth_buffers.list.shift_remove(&address) else {
        return;
    };

    if sys.depth_buffers.current == Some(address) {
        sys.depth_buffers.current = None;
    }

    sys.render.exec(Action::DeleteDepth(db.id));
    trace!(address = format_args!("{address:#08X}"), "removed depth buffer");
}

/// Selects the depth buffer for the depth image at `address`.
pub fn save_buffer(sys: &mut System, address: u32) {
    let width = framebuffer::current(sys)
        .map(|fb| fb.width)
        .filter(|&w| w != 0)
        .or(Some(sys.rdp.color_image.width).filter(|&w| w != 0))
        .unwrap_or(sys.vi.width);

    let hit = sys
        .depth_buffers
        .list
        .get(&address)
        .is_some_and(|db| db.width == width);

    if !hit {
        remove(sys, address);

        let id = DepthId(sys.depth_buffers.next_id);
        sys.depth_buffers.next_id = sys.depth_buffers.next_id.wrapping_add(1);

        let height = framebuffer::max_height(sys, width);
        sys.render.exec(Action::CreateDepth { id, width, height });
        sys.depth_buffers.list.insert(
            address,
            DepthBuffer {
                id,
                address,
                width,
                height,
                clear: None,
                resolved_frame: None,
                copied_frame: None,
            },
        );

        debug!(address = format_args!("{address:#08X}"), width, height, "created depth buffer");
    }

    sys.depth_buffers.current = Some(address);
    framebuffer::attach_depth_buffer(sys);
}

/// Clears an area of the current depth buffer.
pub fn clear_buffer(sys: &mut System, rect: Rect) {
    let Some(db) = current_mut(sys) else {
        return;
    };

    db.clear = Some(rect);
    let depth = db.id;
    sys.render.exec(Action::ClearDepth { depth, rect });
}

/// Resolves the current depth buffer to a single sample, once per frame.
pub fn resolve(sys: &mut System) {
    if sys.config.video.multisampling == 0 {
        return;
    }

    if !sys.render.capabilities().multisampling {
        debug!("renderer cannot resolve multisampled depth");
        return;
    }

    let frame = sys.vi.swap_count;
    let Some(db) = current_mut(sys) else {
        return;
    };

    if db.resolved_frame == Some(frame) {
        return;
    }
    db.resolved_frame = Some(frame);
    let id = db.id;

    // depth is resolved along with the target it is attached to
    let target = sys
        .framebuffers
        .list
        .values()
        .rev()
        .find(|fb| fb.depth == Some(id))
        .map(|fb| fb.id);

    if let Some(target) = target {
        sys.render.exec(Action::Resolve(target));
    }
}

/// Copies the current depth buffer so it can be sampled while being written, once per frame.
pub fn copy(sys: &mut System) {
    if !sys.render.capabilities().depth_textures {
        debug!("renderer has no depth textures");
        return;
    }

    let frame = sys.vi.swap_count;
    let Some(db) = current_mut(sys) else {
        return;
    };

    if db.copied_frame != Some(frame) {
        db.copied_frame = Some(frame);
        let id = db.id;
        sys.render.exec(Action::CopyDepth(id));
    }
}

/// Encodes a normalized depth into the 14 bit floating point format of depth images, shifted
/// into the upper bits of a 16 bit word.
pub fn encode_depth(z: f32) -> u16 {
    let z = (z.clamp(0.0, 1.0) * 0x3FFFF as f32) as u32;

    // exponent is the number of leading ones below bit 17
    let mut exponent = 0;
    while exponent < 7 && z & (1 << (17 - exponent)) != 0 {
        exponent += 1;
    }

    let mantissa = if exponent == 7 {
        z & 0x7FF
    } else {
        (z >> (6 - exponent)) & 0x7FF
    };

    (((exponent << 11) | mantissa) << 2) as u16
}

/// Reads the current depth buffer back and writes it into the guest depth image.
pub fn copy_to_rdram(sys: &mut System) {
    let Some(db) = current(sys).cloned() else {
        return;
    };

    let height = framebuffer::current(sys).map_or(sys.vi.height, |fb| fb.height).min(db.height);
    if height == 0 {
        return;
    }

    resolve(sys);

    let (response, receiver) = oneshot::channel();
    sys.render.exec(Action::ReadDepth {
        depth: db.id,
        width: db.width,
        height,
        response,
    });

    let Ok(depth) = receiver.recv() else {
        debug!(depth = ?db.id, "renderer did not read back the depth buffer");
        return;
    };

    let len = (db.width * height) as usize;
    let Ok(dst) = sys.mem.slice_mut(db.address, len * 2) else {
        warn!(address = format_args!("{:#08X}", db.address), "depth image outside of RDRAM");
        return;
    };

    for (bytes, &z) in dst.chunks_exact_mut(2).zip(&depth) {
        bytes.copy_from_slice(&encode_depth(z).to_be_bytes());
    }

    trace!(address = format_args!("{:#08X}", db.address), height, "copied depth buffer to RDRAM");
}
