//! Display list interpreter.
//!
//! The interpreter walks display lists in guest memory through a bounded stack of frames,
//! decoding each command with [`gbi::decode`] and dispatching it to its handler.

use tinyvec::ArrayVec;
use tracing::{debug, trace, warn};

use crate::{
    System,
    system::{
        drawer,
        gbi::{self, Command, MoveMem, MoveWord, ObjCommand, RdpCommand},
        rdp::{self, tmem},
        rsp::{self, VERTEX_COUNT, light, matrix, obj, vertex},
        texrect::TexturedRect,
    },
};

/// Maximum display list nesting.
pub const STACK_LEN: usize = 18;

/// A display list being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    /// Address of the next command.
    pub pc: u32,
    /// Commands left before the frame returns by itself, or -1 for frames which only return on
    /// an end command.
    pub count: i32,
}

impl Frame {
    #[inline(always)]
    fn expired(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Clone)]
pub struct Interpreter {
    pub stack: ArrayVec<[Frame; STACK_LEN]>,
    pub halted: bool,
    /// Set when execution stopped at a branch to itself.
    pub infinite_loop: bool,
    /// The command following the one being executed, if it decodes.
    pub next_command: Option<Command>,
    pub rdp_half_1: u32,
    pub rdp_half_2: u32,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self {
            stack: ArrayVec::new(),
            halted: true,
            infinite_loop: false,
            next_command: None,
            rdp_half_1: 0,
            rdp_half_2: 0,
        }
    }
}

impl Interpreter {
    /// Resets the interpreter to a single frame at `entry`.
    pub fn start(&mut self, entry: u32) {
        self.stack.clear();
        self.stack.push(Frame { pc: entry, count: -1 });
        self.halted = false;
        self.infinite_loop = false;
        self.next_command = None;
    }

    /// Address of the next command to execute.
    pub fn next_pc(&self) -> Option<u32> {
        if self.halted {
            return None;
        }

        self.stack.iter().rev().find(|f| !f.expired()).map(|f| f.pc)
    }

    /// Pushes a frame. Refuses when the stack is full.
    pub fn call(&mut self, address: u32, count: i32) -> bool {
        if self.stack.len() == STACK_LEN {
            warn!(address = format_args!("{address:#08X}"), "display list stack overflow");
            return false;
        }

        self.stack.push(Frame { pc: address, count });
        true
    }

    /// Pops the current frame, halting once the outermost one returns.
    pub fn end(&mut self) {
        self.stack.pop();
        if self.stack.is_empty() {
            self.halted = true;
        }
    }

    /// Continues the current frame at `address`.
    pub fn branch(&mut self, address: u32) {
        if let Some(top) = self.stack.last_mut() {
            top.pc = address;
        }
    }

    fn pop_expired(&mut self) {
        while self.stack.last().is_some_and(Frame::expired) {
            self.stack.pop();
        }

        if self.stack.is_empty() {
            self.halted = true;
        }
    }
}

/// Executes the next command. Returns false once the interpreter is halted.
pub fn step(sys: &mut System) -> bool {
    sys.dlist.pop_expired();
    if sys.dlist.halted {
        return false;
    }

    let depth = sys.dlist.stack.len() - 1;
    let pc = sys.dlist.stack[depth].pc;
    let dialect = sys.rsp.dialect;

    let decoded = match gbi::decode(dialect, &sys.mem, pc) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(pc = format_args!("{pc:#08X}"), ?err, "display list outside of RDRAM");
            sys.dlist.halted = true;
            return false;
        }
    };

    let next = pc.wrapping_add(decoded.length);
    let frame = &mut sys.dlist.stack[depth];
    frame.pc = next;
    if frame.count > 0 {
        frame.count -= 1;
    }

    sys.dlist.next_command = gbi::decode(dialect, &sys.mem, next).ok().map(|d| d.command);

    trace!(pc = format_args!("{pc:#08X}"), command = ?decoded.command, "executing");
    execute(sys, pc, decoded.command, decoded.w0, decoded.w1);
    true
}

/// Runs display lists until the interpreter halts.
pub fn run(sys: &mut System, entry: u32) {
    sys.dlist.start(entry);
    while step(sys) {}
}

/// Draws the buffered triangles unless more are coming.
fn triangles_added(sys: &mut System) {
    let smooth = sys.rsp.geometry(|b| b.shading_smooth);
    let more = sys.dlist.next_command.is_some_and(|c| c.is_triangle());
    if !smooth || !more {
        drawer::flush_triangles(sys);
    }
}

/// Resolves the segmented address of a display list, or `None` when it is not in RDRAM.
fn target(sys: &System, address: u32) -> Option<u32> {
    let target = sys.rsp.segment_address(address);
    if sys.mem.contains(target, 8) {
        return Some(target);
    }

    warn!(
        address = format_args!("{address:#08X}"),
        target = format_args!("{target:#08X}"),
        "display list outside of RDRAM, ignored"
    );
    None
}

/// Calls or jumps to a display list. A jump to the jump itself halts.
fn display_list(sys: &mut System, pc: u32, address: u32, push: bool) {
    let Some(target) = target(sys, address) else {
        return;
    };

    if push {
        sys.dlist.call(target, -1);
        return;
    }

    if target == pc && sys.config.emulation.detect_self_branch {
        warn!(pc = format_args!("{pc:#08X}"), "display list branches to itself, halting");
        let dlist = &mut sys.dlist;
        dlist.branch(pc);
        dlist.infinite_loop = true;
        dlist.halted = true;
        return;
    }

    sys.dlist.branch(target);
}

/// Returns from the current display list when every vertex in `first..=last` lies outside of a
/// common clip plane.
fn cull(sys: &mut System, mut first: u32, mut last: u32) {
    if first > last {
        std::mem::swap(&mut first, &mut last);
    }

    if last as usize >= VERTEX_COUNT {
        warn!(first, last, "culled vertices outside of the vertex buffer");
        return;
    }

    let outside = sys.rsp.vertices[first as usize..=last as usize]
        .iter()
        .fold(rsp::ClipFlags::ALL, |acc, v| acc & v.clip.to_bits());

    if outside != 0 {
        trace!(first, last, "culled display list");
        sys.dlist.end();
    }
}

fn branch_z(sys: &mut System, index: u32, zval: u32) {
    let Some(vtx) = sys.rsp.vertices.get(index as usize) else {
        warn!(index, "branch vertex outside of the vertex buffer");
        return;
    };

    let ztest = (vtx.z / vtx.w * 1023.0) as i32 as u32;
    if (ztest > 0x3FF || ztest <= zval)
        && let Some(target) = target(sys, sys.dlist.rdp_half_1)
    {
        sys.dlist.branch(target);
    }
}

fn branch_w(sys: &mut System, index: u32, wval: i32) {
    let Some(vtx) = sys.rsp.vertices.get(index as usize) else {
        warn!(index, "branch vertex outside of the vertex buffer");
        return;
    };

    if vtx.w < wval as f32
        && let Some(target) = target(sys, sys.dlist.rdp_half_1)
    {
        sys.dlist.branch(target);
    }
}

fn move_word(sys: &mut System, word: MoveWord) {
    match word {
        MoveWord::InsertMatrix { offset, value } => matrix::insert_matrix(sys, offset, value),
        MoveWord::NumLights(count) => rsp::num_lights(sys, count),
        MoveWord::Clip => (),
        MoveWord::Segment { index, base } => rsp::segment(sys, index, base),
        MoveWord::Fog { multiplier, offset } => rsp::fog(sys, multiplier, offset),
        MoveWord::LightColor { light, color } => light::light_color(sys, light, color),
        MoveWord::PerspNorm(scale) => rsp::persp_norm(sys, scale),
        MoveWord::Points {
            vertex,
            field,
            value,
        } => vertex::modify_vertex(sys, vertex, field, value),
        MoveWord::CoordMod { offset, value } => rsp::coord_mod(sys, offset, value),
        MoveWord::Billboard(on) => sys.rsp.matrix.billboard = on,
        MoveWord::MatrixIndex(index) => {
            let matrices = &mut sys.rsp.matrix;
            matrices.index = (index as usize).min(matrices.stack_size.saturating_sub(1));
            sys.rsp.changed.set_matrix(true);
        }
        MoveWord::Status { sid, value } => sys.rsp.status[(sid as usize >> 2) & 3] = value,
        MoveWord::Ignored { index } => trace!(index, "ignored moveword"),
    }
}

fn move_mem(sys: &mut System, mem: MoveMem) {
    match mem {
        MoveMem::Viewport(address) => rsp::viewport(sys, address),
        MoveMem::Light { light, address } => light::light(sys, light, address),
        MoveMem::LookAt { axis, address } => light::lookat(sys, axis, address),
        MoveMem::ForceMatrix(address) => matrix::force_matrix(sys, address),
        MoveMem::NormalBase(address) => rsp::vertex_normal_base(sys, address),
        MoveMem::Unknown { index, address } => {
            debug!(index, address = format_args!("{address:#08X}"), "unknown movemem");
        }
    }
}

/// Calls or jumps to a display list unless the status word already matches `flag` under `mask`.
fn select_dl(sys: &mut System, pc: u32, address: u16, push: bool, mask: u32) {
    let half = sys.rsp.obj.select_dl;
    let slot = (half.sid as usize >> 2) & 3;
    let status = sys.rsp.status[slot];
    if status & mask == half.flag {
        trace!(slot, "display list already selected");
        return;
    }

    sys.rsp.status[slot] = (status & !mask) | (half.flag & mask);
    let address = ((address as u32) << 16) | half.address as u32;
    display_list(sys, pc, address, push);
}

fn execute_obj(sys: &mut System, pc: u32, cmd: ObjCommand) {
    match cmd {
        ObjCommand::BgRect1Cycle(address) => obj::bg_rect_1cycle(sys, address),
        ObjCommand::BgRectCopy(address) => obj::bg_rect_copy(sys, address),
        ObjCommand::Rectangle(address) => obj::rectangle(sys, address),
        ObjCommand::RectangleR(address) => obj::rectangle_r(sys, address),
        ObjCommand::Sprite(address) => obj::sprite(sys, address),
        ObjCommand::MoveMem { index, address } => obj::move_mem(sys, index, address),
        ObjCommand::LoadTexture(address) => obj::load_texture(sys, address),
        ObjCommand::LoadSprite(address) => obj::load_and_draw(sys, address, obj::sprite),
        ObjCommand::LoadRectangle(address) => obj::load_and_draw(sys, address, obj::rectangle),
        ObjCommand::LoadRectangleR(address) => obj::load_and_draw(sys, address, obj::rectangle_r),
        ObjCommand::RenderMode(mode) => obj::render_mode(sys, mode),
        ObjCommand::SelectDlHalf { address, sid, flag } => {
            sys.rsp.obj.select_dl = obj::SelectDl { address, sid, flag };
        }
        ObjCommand::SelectDl { address, push, mask } => select_dl(sys, pc, address, push, mask),
    }
}

/// Executes a decoded command found at `pc`.
pub fn execute(sys: &mut System, pc: u32, command: Command, w0: u32, w1: u32) {
    match command {
        Command::Noop => (),
        Command::Matrix {
            address,
            projection,
            load,
            push,
        } => matrix::matrix(sys, address, projection, load, push),
        Command::DmaMatrix {
            address,
            index,
            multiply,
        } => matrix::dma_matrix(sys, address, index, multiply),
        Command::PopMatrix { count } => matrix::pop_matrix(sys, count),
        Command::Vertex {
            address,
            count,
            first,
        } => vertex::vertex(sys, address, count, first),
        Command::DmaVertex {
            address,
            count,
            first,
            append,
        } => vertex::dma_vertex(sys, address, count, first, append),
        Command::ModifyVertex {
            vertex,
            field,
            value,
        } => vertex::modify_vertex(sys, vertex, field, value),
        Command::Triangle1(tri) => {
            drawer::add_triangle(sys, tri);
            triangles_added(sys);
        }
        Command::Triangle2(a, b) => {
            drawer::add_triangle(sys, a);
            drawer::add_triangle(sys, b);
            triangles_added(sys);
        }
        Command::Quad([a, b, c, d]) => {
            drawer::add_triangle(sys, [a, b, c]);
            drawer::add_triangle(sys, [a, c, d]);
            triangles_added(sys);
        }
        Command::DmaTriangles { address, count } => {
            drawer::draw_dma_triangles(sys, address, count);
            triangles_added(sys);
        }
        Command::Line3d { v0, v1, width } => drawer::draw_line(sys, v0, v1, width),
        Command::DisplayList { address, push } => display_list(sys, pc, address, push),
        Command::DlCount { address, count } => {
            if let Some(target) = target(sys, address) {
                sys.dlist.call(target, count as i32);
            }
        }
        Command::EndDisplayList => sys.dlist.end(),
        Command::CullDisplayList { first, last } => cull(sys, first, last),
        Command::BranchZ { vertex, zval } => branch_z(sys, vertex, zval),
        Command::BranchW { vertex, wval } => branch_w(sys, vertex, wval),
        Command::GeometryMode { clear, set } => rsp::geometry_mode(sys, clear, set),
        Command::SetOtherModeH { shift, len, data } => rsp::set_other_mode_h(sys, shift, len, data),
        Command::SetOtherModeL { shift, len, data } => rsp::set_other_mode_l(sys, shift, len, data),
        Command::Texture {
            scale_s,
            scale_t,
            level,
            tile,
            on,
        } => rsp::texture(sys, scale_s, scale_t, level, tile, on),
        Command::MoveWord(word) => move_word(sys, word),
        Command::MoveMem(mem) => move_mem(sys, mem),
        Command::LoadUcode { size, .. } => {
            let data = sys.dlist.rdp_half_1;
            rsp::load_ucode_command(sys, data, size);
        }
        Command::RdpHalf1(value) => sys.dlist.rdp_half_1 = value,
        Command::RdpHalf2(value) => sys.dlist.rdp_half_2 = value,
        Command::RdpHalfCont(_) => (),
        Command::VertexColorBase(address) => rsp::vertex_color_base(sys, address),
        Command::DmaOffsets { matrix, vertex } => rsp::dma_offsets(sys, matrix, vertex),
        Command::SpriteBase(address) => vertex::sprite_base(sys, address),
        Command::SpriteScaleFlip {
            scale_x,
            scale_y,
            flip_x,
            flip_y,
        } => vertex::sprite_scale_flip(sys, scale_x, scale_y, flip_x, flip_y),
        Command::SpriteDraw { x, y } => vertex::sprite_draw(sys, x, y),
        Command::Rdp(cmd) => execute_rdp(sys, cmd, w0, w1),
        Command::Obj(cmd) => execute_obj(sys, pc, cmd),
        Command::Unknown(opcode) => {
            debug!(
                opcode = format_args!("{opcode:02X}"),
                w0 = format_args!("{w0:08X}"),
                w1 = format_args!("{w1:08X}"),
                "unknown command"
            );
        }
    }
}

/// Executes a rasterizer command, from a display list or a raw command list.
pub fn execute_rdp(sys: &mut System, cmd: RdpCommand, w0: u32, w1: u32) {
    match cmd {
        RdpCommand::Noop | RdpCommand::TileSync | RdpCommand::PipeSync | RdpCommand::LoadSync => (),
        RdpCommand::SetColorImage {
            format,
            size,
            width,
            address,
        } => rdp::set_color_image(sys, format, size, width, address),
        RdpCommand::SetDepthImage(address) => rdp::set_depth_image(sys, address),
        RdpCommand::SetTextureImage {
            format,
            size,
            width,
            address,
        } => rdp::set_texture_image(sys, format, size, width, address),
        RdpCommand::SetCombine(mux) => rdp::set_combine(sys, mux),
        RdpCommand::SetEnvColor(color) => rdp::set_env_color(sys, color),
        RdpCommand::SetPrimColor { m, l, color } => rdp::set_prim_color(sys, m, l, color),
        RdpCommand::SetBlendColor(color) => rdp::set_blend_color(sys, color),
        RdpCommand::SetFogColor(color) => rdp::set_fog_color(sys, color),
        RdpCommand::SetFillColor(color) => rdp::set_fill_color(sys, color),
        RdpCommand::SetPrimDepth { z, dz } => rdp::set_prim_depth(sys, z, dz),
        RdpCommand::SetTile(tile) => rdp::set_tile(sys, tile),
        RdpCommand::SetTileSize(r) => rdp::set_tile_size(sys, r.tile, r.uls, r.ult, r.lrs, r.lrt),
        RdpCommand::LoadTile(r) => tmem::load_tile(sys, r.tile, r.uls, r.ult, r.lrs, r.lrt),
        RdpCommand::LoadBlock(r) => tmem::load_block(sys, r.tile, r.uls, r.ult, r.lrs, r.lrt),
        RdpCommand::LoadTlut(r) => tmem::load_tlut(sys, r.tile, r.uls, r.ult, r.lrs, r.lrt),
        RdpCommand::SetOtherMode { h, l } => rdp::set_other_mode(sys, h, l),
        RdpCommand::SetScissor {
            mode,
            ulx,
            uly,
            lrx,
            lry,
        } => rdp::set_scissor(
            sys,
            mode,
            ulx as f32 / 4.0,
            uly as f32 / 4.0,
            lrx as f32 / 4.0,
            lry as f32 / 4.0,
        ),
        RdpCommand::SetConvert(k) => rdp::set_convert(sys, k),
        RdpCommand::SetKeyR {
            center,
            scale,
            width,
        } => rdp::set_key_r(sys, center, scale, width),
        RdpCommand::SetKeyGb {
            center,
            scale,
            width,
        } => rdp::set_key_gb(sys, center, scale, width),
        RdpCommand::FillRect { ulx, uly, lrx, lry } => rdp::fill_rect(sys, ulx, uly, lrx, lry),
        RdpCommand::TextureRect(cmd) => rdp::texture_rect(sys, TexturedRect::from_command(&cmd)),
        RdpCommand::FullSync => rdp::full_sync(sys),
        RdpCommand::Triangle(_) => rdp::unsupported("rdp triangle", w0, w1),
        RdpCommand::Unknown(opcode) => {
            debug!(
                opcode = format_args!("{opcode:02X}"),
                w0 = format_args!("{w0:08X}"),
                w1 = format_args!("{w1:08X}"),
                "unknown rdp command"
            );
        }
    }
}

/// Executes a raw rasterizer command list in `start..end`.
pub fn process_rdp_list(sys: &mut System, start: u32, end: u32) {
    let mut pc = start;
    while pc < end {
        let Ok((w0, w1)) = sys.mem.read_command(pc) else {
            warn!(pc = format_args!("{pc:#08X}"), "rdp command list outside of RDRAM");
            break;
        };

        let opcode = (w0 >> 24) as u8;
        let length = gbi::rdp::raw_length(opcode);
        if pc + length > end {
            debug!(pc = format_args!("{pc:#08X}"), "truncated rdp command");
            break;
        }

        let cmd = if matches!(opcode, 0xE4 | 0xE5) {
            match (sys.mem.read_u32(pc + 8), sys.mem.read_u32(pc + 12)) {
                (Ok(w2), Ok(w3)) => RdpCommand::TextureRect(gbi::rdp::texture_rect(w0, w1, w2, w3)),
                _ => break,
            }
        } else {
            gbi::rdp::decode(w0, w1)
        };

        execute_rdp(sys, cmd, w0, w1);
        pc += length;
    }

    drawer::flush(sys);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Opal,
        config::Config,
        modules::render::NopRenderModule,
        system::{gbi::Dialect, mem::Rdram},
    };
    use proptest::prelude::*;

    const END: u32 = 0xDF00_0000;
    const CALL: u32 = 0xDE00_0000;
    const JUMP: u32 = 0xDE01_0000;

    fn opal() -> Opal {
        let mut config = Config::default();
        config.emulation.noise = false;
        let mut opal = Opal::new(config, Rdram::new(0x10000), Box::new(NopRenderModule));
        opal.load_ucode(Dialect::F3dex2);
        opal
    }

    fn write(opal: &mut Opal, address: u32, words: &[(u32, u32)]) {
        for (i, &(w0, w1)) in words.iter().enumerate() {
            let pc = address + 8 * i as u32;
            opal.rdram_mut().write_u32(pc, w0).unwrap();
            opal.rdram_mut().write_u32(pc + 4, w1).unwrap();
        }
    }

    #[test]
    fn self_branch_halts() {
        let mut opal = opal();
        write(&mut opal, 0x100, &[(0, 0), (JUMP, 0x108)]);

        opal.run_display_list(0x100);

        let sys = opal.system_mut();
        assert!(sys.dlist.halted);
        assert!(sys.dlist.infinite_loop);
        assert_eq!(sys.dlist.stack.last().map(|f| f.pc), Some(0x108));
    }

    #[test]
    fn self_branch_detection_can_be_disabled() {
        let mut opal = opal();
        write(&mut opal, 0x100, &[(JUMP, 0x100)]);
        opal.system_mut().config.emulation.detect_self_branch = false;

        let sys = opal.system_mut();
        sys.dlist.start(0x100);
        for _ in 0..100 {
            assert!(step(sys));
        }
        assert!(!sys.dlist.infinite_loop);
    }

    #[test]
    fn call_and_return() {
        let mut opal = opal();
        write(&mut opal, 0x100, &[(CALL, 0x200), (END, 0)]);
        write(&mut opal, 0x200, &[(0, 0), (END, 0)]);

        let sys = opal.system_mut();
        sys.dlist.start(0x100);

        assert!(step(sys));
        assert_eq!(sys.dlist.stack.len(), 2);
        assert_eq!(sys.dlist.next_pc(), Some(0x200));

        while step(sys) {}
        assert!(sys.dlist.halted);
        assert!(!sys.dlist.infinite_loop);
        assert!(sys.dlist.stack.is_empty());
    }

    #[test]
    fn dl_count_returns_by_itself() {
        let mut opal = opal();
        opal.load_ucode(Dialect::DiddyKong);
        // count 2
        write(&mut opal, 0x100, &[(0x0702_0000, 0x200), (0xB800_0000, 0)]);
        write(&mut opal, 0x200, &[(0, 0), (0, 0), (0, 0)]);

        let sys = opal.system_mut();
        sys.dlist.start(0x100);
        assert!(step(sys));
        assert_eq!(sys.dlist.stack.len(), 2);
        assert!(step(sys));
        assert!(step(sys));

        // the counted frame expired, execution continues after the call
        assert_eq!(sys.dlist.next_pc(), Some(0x108));
        assert!(step(sys));
        assert!(!step(sys));
    }

    #[test]
    fn culls_when_outside_one_plane() {
        let mut opal = opal();
        let sys = opal.system_mut();
        sys.dlist.start(0x100);
        sys.dlist.call(0x200, -1);

        for vtx in &mut sys.rsp.vertices[0..4] {
            vtx.clip = rsp::ClipFlags::default().with_neg_y(true);
        }
        sys.rsp.vertices[2].clip = rsp::ClipFlags::default().with_neg_y(true).with_pos_x(true);

        cull(sys, 0, 3);
        assert_eq!(sys.dlist.stack.len(), 1);

        sys.dlist.call(0x200, -1);
        sys.rsp.vertices[3].clip = rsp::ClipFlags::default();
        cull(sys, 0, 3);
        assert_eq!(sys.dlist.stack.len(), 2);

        // out of range is ignored
        cull(sys, 0, 200);
        assert_eq!(sys.dlist.stack.len(), 2);
    }

    #[test]
    fn lists_outside_of_rdram_are_skipped() {
        let mut opal = opal();
        write(
            &mut opal,
            0x100,
            &[
                (CALL, 0x0080_0000),
                (JUMP, 0x00FF_FFF8),
                (0xFB00_0000, 0xFF00_00FF),
                (END, 0),
            ],
        );
        opal.run_display_list(0x100);

        let sys = opal.system_mut();
        assert!(sys.dlist.halted);
        assert!(!sys.dlist.infinite_loop);
        assert_eq!(sys.rdp.env, color::Rgba::new(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn counted_lists_outside_of_rdram_are_skipped() {
        let mut opal = opal();
        opal.load_ucode(Dialect::DiddyKong);
        write(&mut opal, 0x100, &[(0x0702_0000, 0x0080_0000), (0xB800_0000, 0)]);

        let sys = opal.system_mut();
        sys.dlist.start(0x100);
        assert!(step(sys));
        assert_eq!(sys.dlist.stack.len(), 1);
        assert_eq!(sys.dlist.next_pc(), Some(0x108));
    }

    #[test]
    fn branch_w_outside_of_rdram_falls_through() {
        let mut opal = opal();
        let sys = opal.system_mut();
        sys.dlist.start(0x100);
        sys.rsp.vertices[0].w = 1.0;

        sys.dlist.rdp_half_1 = 0x0080_0000;
        branch_w(sys, 0, 100);
        assert_eq!(sys.dlist.next_pc(), Some(0x100));

        sys.dlist.rdp_half_1 = 0x400;
        branch_w(sys, 0, 100);
        assert_eq!(sys.dlist.next_pc(), Some(0x400));
    }

    #[test]
    fn reversed_cull_bounds_are_swapped() {
        let mut opal = opal();
        let sys = opal.system_mut();
        sys.dlist.start(0x100);
        sys.dlist.call(0x200, -1);

        for vtx in &mut sys.rsp.vertices[0..4] {
            vtx.clip = rsp::ClipFlags::default().with_pos_x(true);
        }

        cull(sys, 3, 0);
        assert_eq!(sys.dlist.stack.len(), 1);
    }

    #[test]
    fn raw_rdp_list() {
        let mut opal = opal();
        // set env color, then full sync
        write(&mut opal, 0x400, &[(0xFB00_0000, 0xFF00_00FF), (0xE900_0000, 0)]);
        opal.process_rdp_list(0x400, 0x410);

        let sys = opal.system_mut();
        assert_eq!(sys.rdp.env, color::Rgba::new(1.0, 0.0, 0.0, 1.0));
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Call(u32),
        End,
        Nop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..16).prop_map(|i| Op::Call(0x1000 + i * 0x100)),
            Just(Op::End),
            Just(Op::Nop),
        ]
    }

    proptest! {
        #[test]
        fn stack_matches_reference_model(ops in proptest::collection::vec(op(), 0..64)) {
            let mut dlist = Interpreter::default();
            dlist.start(0);
            let mut model: Vec<u32> = vec![0];
            let mut halted = false;

            for op in ops {
                if halted {
                    break;
                }

                match op {
                    Op::Call(address) => {
                        let pushed = dlist.call(address, -1);
                        prop_assert_eq!(pushed, model.len() < STACK_LEN);
                        if pushed {
                            model.push(address);
                        }
                    }
                    Op::End => {
                        dlist.end();
                        model.pop();
                        halted = model.is_empty();
                    }
                    Op::Nop => (),
                }

                prop_assert_eq!(dlist.halted, halted);
                prop_assert!(dlist.stack.len() <= STACK_LEN);
                let pcs: Vec<u32> = dlist.stack.iter().map(|f| f.pc).collect();
                prop_assert_eq!(&pcs, &model);
            }
        }
    }
}
