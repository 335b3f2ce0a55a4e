//! Emission of draws: triangle buffering, the draw state derived from the pipeline state, and
//! the primitive helpers used by the command handlers.

use color::Rgba;
use tracing::{trace, warn};

use crate::{
    System,
    modules::render::{
        Action, ChromaKey, Cull, DepthState, DrawState, DrawVertex, LineDraw, Rect, RectDraw,
        TextureId, TriangleDraw, Viewport,
    },
    system::{
        depth, framebuffer,
        rdp::regs::{CycleType, ZMode},
        rsp::{ClipFlags, VERTEX_COUNT, Vertex, light},
        texcache,
        texrect::TexrectBatcher,
    },
};

/// Length of an entry of a DMA triangle list.
const DMA_TRIANGLE_LEN: usize = 16;

#[derive(Debug, Default)]
pub struct Drawer {
    /// Buffered triangles, three vertices each.
    triangles: Vec<DrawVertex>,
    pub texrects: TexrectBatcher,
    /// Noise textures, cycled through once per frame.
    pub noise: Vec<TextureId>,
}

impl Drawer {
    /// Number of buffered triangles.
    pub fn pending_triangles(&self) -> usize {
        self.triangles.len() / 3
    }
}

/// Texture coordinate multiplier of a tile shift.
#[inline(always)]
pub fn shift_scale(shift: u8) -> f32 {
    match shift {
        0 => 1.0,
        1..=10 => 1.0 / (1u32 << shift) as f32,
        _ => (1u32 << (16 - shift.min(16))) as f32,
    }
}

/// Builds the state of the next draw from the pipeline state. Texture units sample the tile
/// `tile` and the one after it. Clears the state change flags.
pub fn draw_state(sys: &mut System, tile: Option<u8>) -> DrawState {
    let cycle = sys.rdp.cycle_type();
    let two_cycle = cycle == CycleType::Two;
    let combine = sys.rdp.combine;

    let mut textures = [None; 2];
    if let Some(tile) = tile {
        for (unit, texture) in textures.iter_mut().enumerate() {
            let copy = unit == 0 && cycle == CycleType::Copy;
            if copy || combine.uses_texel(unit as u8, two_cycle) {
                *texture = texcache::bind(sys, unit, (tile as usize + unit) & 7);
            }
        }
    }

    let noise = &sys.drawer.noise;
    let noise = (combine.uses_noise(two_cycle) && !noise.is_empty())
        .then(|| noise[sys.vi.swap_count as usize % noise.len()]);

    let l = sys.rdp.other_mode_l;
    let depth = DepthState {
        compare: l.z_compare(),
        update: l.z_update(),
        mode: match l.z_mode() {
            ZMode::Opaque => 0,
            ZMode::Interpenetrating => 1,
            ZMode::Transparent => 2,
            ZMode::Decal => 3,
        },
        source_prim: l.depth_source_prim(),
        prim_z: sys.rdp.prim_depth.z,
        buffer: depth::current(sys).map(|db| db.id),
    };

    if depth.compare && sys.config.frame_buffer.n64_depth_compare {
        depth::copy(sys);
    }

    let rsp = &sys.rsp;
    let cull = match (rsp.geometry(|b| b.cull_front), rsp.geometry(|b| b.cull_back)) {
        (true, true) => Cull::Both,
        (true, false) => Cull::Front,
        (false, true) => Cull::Back,
        (false, false) => Cull::None,
    };

    let lights = (sys.config.emulation.hardware_lighting && rsp.geometry(|b| b.lighting))
        .then(|| light::hardware_lights(rsp));

    let vp = &rsp.viewport;
    let rdp = &sys.rdp;
    let key = &rdp.key;
    let state = DrawState {
        target: framebuffer::current(sys).map(|fb| fb.id),
        combine: combine.to_bits(),
        other_mode: rdp.other_mode(),
        prim: rdp.prim.color,
        prim_min_level: rdp.prim.m,
        prim_lod_fraction: rdp.prim.l,
        env: rdp.env,
        blend: rdp.blend,
        fog: rdp.fog,
        fill: rdp.fill_color(),
        key: ChromaKey {
            center: Rgba::new(key.center[0], key.center[1], key.center[2], 0.0),
            scale: Rgba::new(key.scale[0], key.scale[1], key.scale[2], 0.0),
            width: key.width,
        },
        convert: rdp.convert,
        textures,
        noise,
        viewport: Viewport {
            x: vp.x,
            y: vp.y,
            width: vp.width,
            height: vp.height,
            near: vp.near,
            far: vp.far,
        },
        scissor: rdp.scissor.rect(),
        cull,
        depth,
        fog_enabled: rsp.geometry(|b| b.fog),
        flat_shading: !rsp.geometry(|b| b.shading_smooth),
        lights,
    };

    // the drawing state is rebuilt from scratch, only the buffer change survives for the vi
    let color_buffer = sys.rdp.changed.color_buffer();
    sys.rdp.changed = Default::default();
    sys.rdp.changed.set_color_buffer(color_buffer);

    let changed = &mut sys.rsp.changed;
    changed.set_viewport(false);
    changed.set_geometry_mode(false);
    changed.set_texture(false);
    changed.set_fog_position(false);
    changed.set_hw_light(false);

    state
}

/// Texture tile of triangles, if texturing is on.
#[inline(always)]
fn triangle_tile(sys: &System) -> Option<u8> {
    sys.rsp.texture.on.then_some(sys.rsp.texture.tile)
}

/// Converts a processed vertex for the renderer.
fn draw_vertex(sys: &System, vtx: &Vertex) -> DrawVertex {
    let texture = &sys.rsp.texture;
    let tile = &sys.rdp.tiles[texture.tile as usize & 7];

    DrawVertex {
        x: vtx.x,
        y: vtx.y,
        z: vtx.z,
        w: vtx.w,
        r: vtx.r,
        g: vtx.g,
        b: vtx.b,
        a: vtx.a,
        s: vtx.s * texture.scale_s * shift_scale(tile.shift_s) - tile.fuls,
        t: vtx.t * texture.scale_t * shift_scale(tile.shift_t) - tile.fult,
    }
}

/// Buffers a triangle between three vertex slots. Triangles entirely outside of one clip plane
/// are dropped.
pub fn add_triangle(sys: &mut System, indices: [u32; 3]) {
    if let Some(&index) = indices.iter().find(|&&i| i as usize >= VERTEX_COUNT) {
        warn!(index, "triangle vertex outside of the vertex buffer");
        return;
    }

    let [v0, v1, v2] = indices.map(|i| sys.rsp.vertices[i as usize]);
    let outside = v0.clip.to_bits() & v1.clip.to_bits() & v2.clip.to_bits() & ClipFlags::ALL;
    if outside != 0 {
        return;
    }

    if !sys.drawer.texrects.is_empty() {
        flush_rects(sys);
    }

    for vtx in [v0, v1, v2] {
        let vertex = draw_vertex(sys, &vtx);
        sys.drawer.triangles.push(vertex);
    }
}

/// Sends the buffered triangles to the renderer.
pub fn flush_triangles(sys: &mut System) {
    if sys.drawer.triangles.is_empty() {
        return;
    }

    let mut state = draw_state(sys, triangle_tile(sys));
    if !sys.rsp.geometry(|b| b.zbuffer) {
        state.depth.compare = false;
        state.depth.update = false;
    }

    let vertices = std::mem::take(&mut sys.drawer.triangles);
    trace!(count = vertices.len() / 3, "drawing triangles");
    sys.render.exec(Action::DrawTriangles(Box::new(TriangleDraw { state, vertices })));

    let lry = sys.rdp.scissor.lry;
    framebuffer::set_buffer_changed(sys, lry);
}

/// Sends the batched texture rectangles to the renderer.
pub fn flush_rects(sys: &mut System) {
    if let Some(draw) = sys.drawer.texrects.take() {
        trace!(count = draw.quads.len(), "drawing rectangles");
        sys.render.exec(Action::DrawRects(Box::new(draw)));
    }
}

/// Sends everything pending to the renderer.
pub fn flush(sys: &mut System) {
    flush_triangles(sys);
    flush_rects(sys);
}

/// Draws a list of triangles carrying their own texture coordinates.
pub fn draw_dma_triangles(sys: &mut System, address: u32, count: u32) {
    let address = sys.rsp.segment_address(address);
    let Ok(data) = sys.mem.slice(address, count as usize * DMA_TRIANGLE_LEN) else {
        warn!(address = format_args!("{address:#08X}"), count, "triangle list outside of RDRAM");
        return;
    };
    let data = data.to_vec();

    for entry in data.chunks_exact(DMA_TRIANGLE_LEN) {
        let flags = entry[0];
        let indices = [entry[1], entry[2], entry[3]].map(|i| (i & 0x1F) as u32);

        // the entry decides culling by itself
        let bits = sys.rsp.bits();
        let mode = sys.rsp.geometry_mode & !bits.cull_both();
        sys.rsp.geometry_mode = if flags & 0x40 != 0 {
            mode
        } else if sys.rsp.viewport.vscale[0] > 0.0 {
            mode | bits.cull_back
        } else {
            mode | bits.cull_front
        };

        for (i, &index) in indices.iter().enumerate() {
            let s = i16::from_be_bytes([entry[4 + 4 * i], entry[5 + 4 * i]]);
            let t = i16::from_be_bytes([entry[6 + 4 * i], entry[7 + 4 * i]]);
            let vtx = &mut sys.rsp.vertices[index as usize];
            vtx.s = util::fixed_to_f32::<5>(s as i32);
            vtx.t = util::fixed_to_f32::<5>(t as i32);
        }

        add_triangle(sys, indices);
    }

    sys.rsp.vertex_append = 0;
}

/// Draws a line between two vertex slots. `width` is in half pixels.
pub fn draw_line(sys: &mut System, v0: u32, v1: u32, width: u32) {
    let (Some(&a), Some(&b)) = (sys.rsp.vertices.get(v0 as usize), sys.rsp.vertices.get(v1 as usize)) else {
        warn!(v0, v1, "line vertex outside of the vertex buffer");
        return;
    };

    flush(sys);
    let vertices = vec![draw_vertex(sys, &a), draw_vertex(sys, &b)];
    let state = draw_state(sys, triangle_tile(sys));
    sys.render.exec(Action::DrawLines(Box::new(LineDraw {
        state,
        vertices,
        width: ((width + 1) as f32 * 0.5).max(1.0),
    })));

    let lry = sys.rdp.scissor.lry;
    framebuffer::set_buffer_changed(sys, lry);
}

/// Draws a quad whose vertices are already in screen pixels, with texture coordinates in texels
/// of the image loaded into the texture tile.
pub fn draw_screen_quad(sys: &mut System, quad: [Vertex; 4]) {
    flush(sys);

    let state = draw_state(sys, triangle_tile(sys));
    let tile = &sys.rdp.tiles[sys.rsp.texture.tile as usize & 7];
    let max_y = quad.iter().map(|v| v.y).fold(0.0, f32::max);
    let quad = quad.map(|v| DrawVertex {
        x: v.x,
        y: v.y,
        z: v.z,
        w: 1.0,
        r: v.r,
        g: v.g,
        b: v.b,
        a: v.a,
        s: v.s - tile.fuls,
        t: v.t - tile.fult,
    });

    sys.render.exec(Action::DrawRects(Box::new(RectDraw {
        state,
        quads: vec![quad],
        seam_clear: None,
    })));

    framebuffer::set_buffer_changed(sys, max_y);
}

/// Draws an untextured rectangle in screen pixels.
pub fn draw_rect(sys: &mut System, rect: Rect, color: Rgba) {
    flush(sys);

    let state = draw_state(sys, None);
    let z = if sys.rdp.other_mode_l.depth_source_prim() {
        sys.rdp.prim_depth.z
    } else {
        0.0
    };

    let corner = |x: f32, y: f32| DrawVertex {
        x,
        y,
        z,
        w: 1.0,
        r: color.r,
        g: color.g,
        b: color.b,
        a: color.a,
        s: 0.0,
        t: 0.0,
    };

    let quad = [
        corner(rect.x0, rect.y0),
        corner(rect.x1, rect.y0),
        corner(rect.x0, rect.y1),
        corner(rect.x1, rect.y1),
    ];

    sys.render.exec(Action::DrawRects(Box::new(RectDraw {
        state,
        quads: vec![quad],
        seam_clear: None,
    })));
}

pub fn clear_depth(sys: &mut System, rect: Rect) {
    flush(sys);
    depth::clear_buffer(sys, rect);
}

/// Clears the whole current render target.
pub fn clear_color(sys: &mut System, color: Rgba) {
    flush(sys);

    let Some(fb) = framebuffer::current(sys) else {
        return;
    };

    let rect = Rect::new(0.0, 0.0, fb.width as f32, fb.max_height as f32);
    let target = fb.id;
    sys.render.exec(Action::ClearColor { target, color, rect });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Opal,
        config::Config,
        modules::render::{NopRenderModule, RenderModule},
        system::mem::Rdram,
    };
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl RenderModule for Recorder {
        fn exec(&mut self, action: Action) {
            self.0.lock().unwrap().push(format!("{action:?}"));
        }
    }

    fn opal() -> Opal {
        let mut config = Config::default();
        config.emulation.noise = false;
        Opal::new(config, Rdram::new(0x10000), Box::new(NopRenderModule))
    }

    fn visible(x: f32) -> Vertex {
        Vertex {
            x,
            w: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn shift_scales() {
        assert_eq!(shift_scale(0), 1.0);
        assert_eq!(shift_scale(1), 0.5);
        assert_eq!(shift_scale(10), 1.0 / 1024.0);
        assert_eq!(shift_scale(15), 2.0);
        assert_eq!(shift_scale(11), 32.0);
    }

    #[test]
    fn triangles_outside_one_plane_are_dropped() {
        let mut opal = opal();
        let sys = opal.system_mut();

        let outside = Vertex {
            clip: ClipFlags::default().with_pos_x(true),
            ..visible(2.0)
        };
        sys.rsp.vertices[0] = outside;
        sys.rsp.vertices[1] = outside;
        sys.rsp.vertices[2] = outside;
        sys.rsp.vertices[3] = visible(0.0);

        add_triangle(sys, [0, 1, 2]);
        assert_eq!(sys.drawer.pending_triangles(), 0);

        add_triangle(sys, [0, 1, 3]);
        assert_eq!(sys.drawer.pending_triangles(), 1);

        add_triangle(sys, [0, 1, 80]);
        assert_eq!(sys.drawer.pending_triangles(), 1);
    }

    #[test]
    fn flush_emits_one_draw() {
        let recorder = Recorder::default();
        let mut config = Config::default();
        config.emulation.noise = false;
        let mut opal = Opal::new(config, Rdram::new(0x10000), Box::new(recorder.clone()));
        let sys = opal.system_mut();

        for i in 0..6 {
            sys.rsp.vertices[i] = visible(i as f32 * 0.1);
        }

        add_triangle(sys, [0, 1, 2]);
        add_triangle(sys, [3, 4, 5]);
        flush(sys);
        flush(sys);

        let actions = recorder.0.lock().unwrap();
        let draws: Vec<_> = actions.iter().filter(|a| a.starts_with("DrawTriangles")).collect();
        assert_eq!(draws, ["DrawTriangles(2)"]);
    }

    #[test]
    fn draw_state_clears_changes_but_keeps_buffer_change() {
        let mut opal = opal();
        let sys = opal.system_mut();
        sys.rdp.changed = Default::default();
        sys.rdp.changed.set_combine(true);
        sys.rdp.changed.set_color_buffer(true);

        draw_state(sys, None);
        assert!(!sys.rdp.changed.combine());
        assert!(sys.rdp.changed.color_buffer());
    }
}
