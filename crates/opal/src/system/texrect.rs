//! Texture rectangles and their batching.
//!
//! Games draw 2D backgrounds and text as long runs of small texture rectangles. Runs of
//! rectangles which share every piece of state and touch each other are sent to the renderer as
//! a single draw, looking ahead into the display list to tell where a run ends.

use tracing::trace;

use crate::{
    System,
    config::TexrectCorrection,
    modules::render::{Action, DrawState, DrawVertex, Rect, RectDraw},
    system::{
        drawer,
        gbi::{self, Dialect, TexRect},
        mem::Rdram,
    },
};

/// Commands looked at past the current one when deciding whether a run continues.
pub const LOOKAHEAD: usize = 8;

/// Distance under which an edge snaps to the edge of the previous rectangle.
const SNAP_DISTANCE: f32 = 0.51;

/// A texture rectangle in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexturedRect {
    pub ulx: f32,
    pub uly: f32,
    pub lrx: f32,
    pub lry: f32,
    pub tile: u8,
    /// Texture coordinates of the upper left corner, s10.5.
    pub s: i16,
    pub t: i16,
    /// Texels per pixel.
    pub dsdx: f32,
    pub dtdy: f32,
    /// Swaps the texture axes.
    pub flip: bool,
}

impl TexturedRect {
    pub fn from_command(cmd: &TexRect) -> Self {
        Self {
            ulx: cmd.ulx as f32 / 4.0,
            uly: cmd.uly as f32 / 4.0,
            lrx: cmd.lrx as f32 / 4.0,
            lry: cmd.lry as f32 / 4.0,
            tile: cmd.tile & 7,
            s: cmd.s,
            t: cmd.t,
            dsdx: util::fixed_to_f32::<10>(cmd.dsdx as i32),
            dtdy: util::fixed_to_f32::<10>(cmd.dtdy as i32),
            flip: cmd.flip,
        }
    }

    #[inline(always)]
    pub fn bounds(&self) -> Rect {
        Rect::new(self.ulx, self.uly, self.lrx, self.lry)
    }
}

#[inline(always)]
fn near(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-3
}

/// Accumulates compatible texture rectangles into one draw.
#[derive(Debug, Default)]
pub struct TexrectBatcher {
    state: Option<DrawState>,
    quads: Vec<[DrawVertex; 4]>,
    /// Top right corners of the batched rectangles.
    corners: Vec<(f32, f32)>,
    bounds: Rect,
    last: Option<Rect>,
    /// The previous rectangle drawn, batched or not.
    pub previous: Option<Rect>,
}

impl TexrectBatcher {
    pub fn is_empty(&self) -> bool {
        self.quads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.quads.len()
    }

    /// Whether `rect` continues the batch: same left edge and touching the previous rectangle
    /// from below, or starting at the top right corner of a batched one.
    fn adjacent(&self, rect: &Rect) -> bool {
        let below = self
            .last
            .is_some_and(|last| near(rect.x0, last.x0) && near(rect.y0, last.y1));

        below
            || self
                .corners
                .iter()
                .any(|&(x, y)| near(rect.x0, x) && near(rect.y0, y))
    }

    /// Adds a rectangle drawn with `state`. Returns false, leaving the batch untouched, when the
    /// rectangle is not compatible with the batch.
    pub fn add(&mut self, rect: Rect, quad: [DrawVertex; 4], state: &DrawState) -> bool {
        if let Some(batch) = &self.state {
            if batch != state || !self.adjacent(&rect) {
                return false;
            }
            self.bounds = self.bounds.union(rect);
        } else {
            self.state = Some(state.clone());
            self.bounds = rect;
        }

        self.quads.push(quad);
        self.corners.push((rect.x1, rect.y0));
        self.last = Some(rect);
        true
    }

    /// Empties the batch into a draw.
    pub fn take(&mut self) -> Option<RectDraw> {
        let state = self.state.take()?;
        let quads = std::mem::take(&mut self.quads);
        self.corners.clear();
        self.last = None;

        let seam_clear = (quads.len() > 1).then_some(self.bounds);
        Some(RectDraw {
            state,
            quads,
            seam_clear,
        })
    }
}

/// Whether the next meaningful command at or after `pc` draws a texture rectangle. Commands without
/// visible effect are skipped. Anything that can't be decoded ends the run.
pub fn peek_continues(mem: &Rdram, dialect: Dialect, mut pc: u32) -> bool {
    for _ in 0..LOOKAHEAD {
        let Ok(decoded) = gbi::decode(dialect, mem, pc) else {
            return false;
        };

        if decoded.command.draws_rect() {
            return true;
        }

        if !decoded.command.is_transparent() {
            return false;
        }

        pc = pc.wrapping_add(decoded.length);
    }

    false
}

/// Adjusts the edges of a rectangle to close gaps left by rounding in the guest.
pub fn correct(sys: &System, rect: &mut TexturedRect) {
    match sys.config.emulation.texrect_correction {
        TexrectCorrection::Off => (),
        TexrectCorrection::Force => {
            rect.lrx += 0.25;
            rect.lry += 0.25;
        }
        TexrectCorrection::Smart => {
            let Some(previous) = sys.drawer.texrects.previous else {
                return;
            };

            let snap = |value: &mut f32, edge: f32| {
                let distance = (*value - edge).abs();
                if distance > 0.0 && distance < SNAP_DISTANCE {
                    *value = edge;
                }
            };

            snap(&mut rect.ulx, previous.x1);
            snap(&mut rect.uly, previous.y1);
            snap(&mut rect.lrx, previous.x0);
            snap(&mut rect.lry, previous.y0);
        }
    }
}

/// Texture coordinates of the corners of a rectangle, relative to the tile, in the order
/// top-left, top-right, bottom-left, bottom-right.
fn corners(sys: &System, rect: &TexturedRect) -> [(f32, f32); 4] {
    let tile = &sys.rdp.tiles[rect.tile as usize & 7];
    let scale_s = drawer::shift_scale(tile.shift_s);
    let scale_t = drawer::shift_scale(tile.shift_t);

    let s0 = rect.s as f32 / 32.0;
    let t0 = rect.t as f32 / 32.0;
    let width = rect.lrx - rect.ulx;
    let height = rect.lry - rect.uly;

    let (tr, bl, br) = if rect.flip {
        let s1 = s0 + height * rect.dsdx;
        let t1 = t0 + width * rect.dtdy;
        ((s0, t1), (s1, t0), (s1, t1))
    } else {
        let s1 = s0 + width * rect.dsdx;
        let t1 = t0 + height * rect.dtdy;
        ((s1, t0), (s0, t1), (s1, t1))
    };

    [(s0, t0), tr, bl, br].map(|(s, t)| (s * scale_s - tile.fuls, t * scale_t - tile.fult))
}

/// Builds the quad of a rectangle, in target pixels.
fn quad(sys: &System, rect: &TexturedRect) -> [DrawVertex; 4] {
    let z = if sys.rdp.other_mode_l.depth_source_prim() {
        sys.rdp.prim_depth.z
    } else {
        0.0
    };

    let positions = [
        (rect.ulx, rect.uly),
        (rect.lrx, rect.uly),
        (rect.ulx, rect.lry),
        (rect.lrx, rect.lry),
    ];

    let coords = corners(sys, rect);
    std::array::from_fn(|i| DrawVertex {
        x: positions[i].0,
        y: positions[i].1,
        z,
        w: 1.0,
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
        s: coords[i].0,
        t: coords[i].1,
    })
}

/// Draws a texture rectangle, batching it with the rectangles around it when possible.
pub fn draw_textured_rect(sys: &mut System, rect: TexturedRect) {
    drawer::flush_triangles(sys);

    let state = drawer::draw_state(sys, Some(rect.tile));
    let quad = quad(sys, &rect);
    let bounds = rect.bounds();
    sys.drawer.texrects.previous = Some(bounds);

    if !sys.config.emulation.batch_texrects {
        sys.render.exec(Action::DrawRects(Box::new(RectDraw {
            state,
            quads: vec![quad],
            seam_clear: None,
        })));
        return;
    }

    if !sys.drawer.texrects.add(bounds, quad, &state) {
        drawer::flush_rects(sys);
        sys.drawer.texrects.add(bounds, quad, &state);
    }

    let continues = sys
        .dlist
        .next_pc()
        .is_some_and(|pc| peek_continues(&sys.mem, sys.rsp.dialect, pc));

    if !continues {
        drawer::flush_rects(sys);
    }

    trace!(ulx = rect.ulx, uly = rect.uly, lrx = rect.lrx, lry = rect.lry, continues, "texture rectangle");
}
