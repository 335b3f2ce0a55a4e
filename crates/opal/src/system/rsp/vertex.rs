//! The vertex buffer: loaders for every vertex layout, the per vertex transform and lighting
//! stage, and the screen space sprites of the sprite microcode.

use bitos::{
    bitos,
    integer::{u3, u9},
};
use tracing::{trace, warn};

use crate::{
    System,
    config::Aspect,
    system::{
        drawer,
        gbi::{LightingModel, VertexFormat},
        rdp::{
            self,
            regs::{ImageFormat, TexelSize, TextureLut, TileCommand},
            tmem,
        },
        rsp::{self, VERTEX_COUNT, light, matrix},
    },
};

/// Vertices processed together through the batched kernel methods.
const GROUP: usize = 4;

const STANDARD_LEN: usize = 16;
const COLOR_INDEXED_LEN: usize = 12;
const DMA_LEN: usize = 10;
const SPRITE_LEN: usize = 24;

/// Clip space planes a vertex lies outside of.
#[bitos(8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClipFlags {
    #[bits(0)]
    pub neg_x: bool,
    #[bits(1)]
    pub pos_x: bool,
    #[bits(2)]
    pub neg_y: bool,
    #[bits(3)]
    pub pos_y: bool,
    #[bits(4)]
    pub w: bool,
}

impl ClipFlags {
    /// Every plane.
    pub const ALL: u8 = 0x1F;
}

/// Vertex fields written directly in screen space by a vertex modification.
#[bitos(8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modify {
    #[bits(0)]
    pub xy: bool,
    #[bits(1)]
    pub z: bool,
    #[bits(2)]
    pub st: bool,
    #[bits(3)]
    pub rgba: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
    pub nx: f32,
    pub ny: f32,
    pub nz: f32,
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
    pub s: f32,
    pub t: f32,
    pub clip: ClipFlags,
    pub modify: Modify,
    /// Number of lights the renderer applies to this vertex. Zero when lit by the core.
    pub hw_light: u8,
}

#[inline(always)]
fn half(bytes: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline(always)]
fn color(byte: u8) -> f32 {
    byte as f32 / 255.0
}

#[inline(always)]
fn normal(byte: u8) -> f32 {
    byte as i8 as f32 / 127.0
}

/// Whether lit vertices carry their normal in the color for the renderer to light.
#[inline(always)]
fn hardware_lighting(sys: &System) -> bool {
    sys.config.emulation.hardware_lighting
        && sys.rsp.dialect.lighting_model() == LightingModel::Standard
}

/// Validates a load of `count` vertices of `stride` bytes into the slots starting at `first`.
fn check(sys: &System, address: u32, count: u32, first: u32, stride: usize) -> bool {
    if first as usize + count as usize > VERTEX_COUNT {
        warn!(first, count, "vertex load outside of the vertex buffer");
        return false;
    }

    if !sys.mem.contains(address, count as usize * stride) {
        warn!(address = format_args!("{address:#08X}"), count, "vertex load outside of RDRAM");
        return false;
    }

    true
}

/// Brings light and look-at vectors up to date before lit vertices are loaded.
fn prepare_lighting(sys: &mut System) {
    if !sys.rsp.geometry(|b| b.lighting) {
        return;
    }

    let kernel = sys.kernel;
    if sys.rsp.changed.light() {
        light::update_light_vectors(kernel, &mut sys.rsp);
    }

    if sys.rsp.geometry(|b| b.texture_gen) && sys.rsp.changed.lookat() {
        light::update_lookat_vectors(kernel, &mut sys.rsp);
    }
}

/// Loads vertices in the layout of the current dialect.
pub fn vertex(sys: &mut System, address: u32, count: u32, first: u32) {
    match sys.rsp.dialect.vertex_format() {
        VertexFormat::Standard => standard(sys, address, count, first),
        VertexFormat::ColorIndexed => color_indexed(sys, address, count, first),
        VertexFormat::Conker => conker(sys, address, count, first),
        VertexFormat::Dma => dma_vertex(sys, address, count, first, false),
    }
}

fn standard(sys: &mut System, address: u32, count: u32, first: u32) {
    let address = sys.rsp.segment_address(address);
    if !check(sys, address, count, first, STANDARD_LEN) {
        return;
    }

    prepare_lighting(sys);

    let lighting = sys.rsp.geometry(|b| b.lighting);
    let hardware = hardware_lighting(sys);
    let Ok(data) = sys.mem.slice(address, count as usize * STANDARD_LEN) else {
        return;
    };

    let slots = &mut sys.rsp.vertices[first as usize..][..count as usize];
    for (vtx, bytes) in slots.iter_mut().zip(data.chunks_exact(STANDARD_LEN)) {
        vtx.x = half(bytes, 0) as f32;
        vtx.y = half(bytes, 2) as f32;
        vtx.z = half(bytes, 4) as f32;
        vtx.s = util::fixed_to_f32::<5>(half(bytes, 8) as i32);
        vtx.t = util::fixed_to_f32::<5>(half(bytes, 10) as i32);

        if lighting {
            vtx.nx = normal(bytes[12]);
            vtx.ny = normal(bytes[13]);
            vtx.nz = normal(bytes[14]);
            if hardware {
                vtx.r = bytes[12] as i8 as f32;
                vtx.g = bytes[13] as i8 as f32;
                vtx.b = bytes[14] as i8 as f32;
            }
        } else {
            vtx.r = color(bytes[12]);
            vtx.g = color(bytes[13]);
            vtx.b = color(bytes[14]);
        }
        vtx.a = color(bytes[15]);
    }

    process_vertices(sys, first as usize, count as usize);
    trace!(first, count, "loaded vertices");
}

/// Color indexed vertices: colors or normals come from a table at the vertex color base.
fn color_indexed(sys: &mut System, address: u32, count: u32, first: u32) {
    let address = sys.rsp.segment_address(address);
    if !check(sys, address, count, first, COLOR_INDEXED_LEN) {
        return;
    }

    let Ok(data) = sys.mem.slice(address, count as usize * COLOR_INDEXED_LEN) else {
        return;
    };

    let base = sys.rsp.vertex_color_base;
    let mut colors = [[0u8; 4]; VERTEX_COUNT];
    for (entry, bytes) in colors.iter_mut().zip(data.chunks_exact(COLOR_INDEXED_LEN)) {
        let index = bytes[7] as u32;
        match sys.mem.slice(base + index, 4) {
            Ok(c) => entry.copy_from_slice(c),
            Err(e) => {
                warn!("vertex color table: {e}");
                return;
            }
        }
    }

    prepare_lighting(sys);

    let lighting = sys.rsp.geometry(|b| b.lighting);
    let hardware = hardware_lighting(sys);
    let Ok(data) = sys.mem.slice(address, count as usize * COLOR_INDEXED_LEN) else {
        return;
    };

    let slots = &mut sys.rsp.vertices[first as usize..][..count as usize];
    for ((vtx, bytes), c) in slots.iter_mut().zip(data.chunks_exact(COLOR_INDEXED_LEN)).zip(colors) {
        vtx.x = half(bytes, 0) as f32;
        vtx.y = half(bytes, 2) as f32;
        vtx.z = half(bytes, 4) as f32;
        vtx.s = util::fixed_to_f32::<5>(half(bytes, 8) as i32);
        vtx.t = util::fixed_to_f32::<5>(half(bytes, 10) as i32);

        if lighting {
            vtx.nx = normal(c[0]);
            vtx.ny = normal(c[1]);
            vtx.nz = normal(c[2]);
            if hardware {
                vtx.r = c[0] as i8 as f32;
                vtx.g = c[1] as i8 as f32;
                vtx.b = c[2] as i8 as f32;
            }
        } else {
            vtx.r = color(c[0]);
            vtx.g = color(c[1]);
            vtx.b = color(c[2]);
        }
        vtx.a = color(c[3]);
    }

    process_vertices(sys, first as usize, count as usize);
}

/// Conker vertices: the standard layout, with x and y of the normal stored per slot at the vertex
/// normal base and z in the flag.
fn conker(sys: &mut System, address: u32, count: u32, first: u32) {
    let address = sys.rsp.segment_address(address);
    if !check(sys, address, count, first, STANDARD_LEN) {
        return;
    }

    let lighting = sys.rsp.geometry(|b| b.lighting);
    let normals = sys.rsp.vertex_normal_base + 2 * first;
    if lighting && !sys.mem.contains(normals, 2 * count as usize) {
        warn!(address = format_args!("{normals:#08X}"), "vertex normals outside of RDRAM");
        return;
    }

    prepare_lighting(sys);

    let Ok(data) = sys.mem.slice(address, count as usize * STANDARD_LEN) else {
        return;
    };
    let normals = if lighting {
        sys.mem.slice(normals, 2 * count as usize).unwrap_or_default()
    } else {
        &[]
    };

    let slots = &mut sys.rsp.vertices[first as usize..][..count as usize];
    for (i, (vtx, bytes)) in slots.iter_mut().zip(data.chunks_exact(STANDARD_LEN)).enumerate() {
        vtx.x = half(bytes, 0) as f32;
        vtx.y = half(bytes, 2) as f32;
        vtx.z = half(bytes, 4) as f32;
        vtx.s = util::fixed_to_f32::<5>(half(bytes, 8) as i32);
        vtx.t = util::fixed_to_f32::<5>(half(bytes, 10) as i32);

        if lighting {
            vtx.nx = normal(normals[2 * i]);
            vtx.ny = normal(normals[2 * i + 1]);
            vtx.nz = normal(bytes[7]);
        }

        vtx.r = color(bytes[12]);
        vtx.g = color(bytes[13]);
        vtx.b = color(bytes[14]);
        vtx.a = color(bytes[15]);
    }

    process_vertices(sys, first as usize, count as usize);
}

/// Vertices loaded through the DMA offset. When `append` is set, the slots continue after the
/// previous appending load.
pub fn dma_vertex(sys: &mut System, address: u32, count: u32, first: u32, append: bool) {
    // appending loads after a billboard keep the anchor in slot 0
    let base = match (append, sys.rsp.matrix.billboard) {
        (false, _) => 0,
        (true, true) => 1,
        (true, false) => sys.rsp.vertex_append,
    };

    let first = first + base;
    let address = sys.rsp.dma.vertex.wrapping_add(sys.rsp.segment_address(address));
    if !check(sys, address, count, first, DMA_LEN) {
        return;
    }

    let Ok(data) = sys.mem.slice(address, count as usize * DMA_LEN) else {
        return;
    };

    let slots = &mut sys.rsp.vertices[first as usize..][..count as usize];
    for (vtx, bytes) in slots.iter_mut().zip(data.chunks_exact(DMA_LEN)) {
        vtx.x = half(bytes, 0) as f32;
        vtx.y = half(bytes, 2) as f32;
        vtx.z = half(bytes, 4) as f32;
        vtx.r = color(bytes[6]);
        vtx.g = color(bytes[7]);
        vtx.b = color(bytes[8]);
        vtx.a = color(bytes[9]);
    }

    sys.rsp.vertex_append = base + count;
    process_vertices(sys, first as usize, count as usize);
}

/// Transforms, clips and lights the loaded vertices in `first..first + count`.
pub fn process_vertices(sys: &mut System, first: usize, count: usize) {
    process::<GROUP>(sys, first, count);
}

/// Runs the vertex stage over groups of `N` vertices with the batched kernel methods, and over
/// the remainder one vertex at a time.
fn process<const N: usize>(sys: &mut System, first: usize, count: usize) {
    let kernel = sys.kernel;
    matrix::combine(kernel, &mut sys.rsp);

    let end = first + count;
    let split = end - count % N;

    let mut index = first;
    while index < split {
        let mut positions = [[0.0f32; 4]; N];
        for (p, vtx) in positions.iter_mut().zip(&sys.rsp.vertices[index..index + N]) {
            *p = [vtx.x, vtx.y, vtx.z, 0.0];
        }

        let models = positions.map(|p| [p[0], p[1], p[2]]);
        kernel.transform_vertices(&sys.rsp.matrix.combined, &mut positions);
        for (j, (p, model)) in positions.into_iter().zip(models).enumerate() {
            finish(sys, index + j, p, model);
        }

        index += N;
    }

    for index in split..end {
        let vtx = sys.rsp.vertices[index];
        let model = [vtx.x, vtx.y, vtx.z];
        let p = kernel.transform_vector(model, &sys.rsp.matrix.combined);
        finish(sys, index, p, model);
    }
}

/// Horizontal scale which keeps 4:3 content at its aspect on a wider output, if it applies.
pub fn adjust_scale(sys: &System) -> Option<f32> {
    if sys.config.video.aspect != Aspect::Adjust {
        return None;
    }

    let video = &sys.config.video;
    let scale = (4 * video.window_height) as f32 / (3 * video.window_width.max(1)) as f32;
    (scale < 1.0).then_some(scale)
}

/// Everything after the transform: screen adjustments, clipping, lighting and texgen.
fn finish(sys: &mut System, index: usize, position: [f32; 4], model: [f32; 3]) {
    let kernel = sys.kernel;
    let mut vtx = sys.rsp.vertices[index];
    [vtx.x, vtx.y, vtx.z, vtx.w] = position;
    vtx.modify = Modify::default();

    let wide = sys.rdp.color_image.width * 100 > sys.vi.width * 98;
    if let Some(scale) = adjust_scale(sys)
        && wide
    {
        vtx.x *= scale;
        if sys.rsp.matrix.projection[3][2] == -1.0 {
            vtx.w *= scale;
        }
    }

    let viewport = &sys.rsp.viewport;
    if viewport.vscale[0] < 0.0 {
        vtx.x = -vtx.x;
    }
    if viewport.vscale[1] < 0.0 {
        vtx.y = -vtx.y;
    }

    if sys.rsp.matrix.billboard && index != 0 {
        let anchor = sys.rsp.vertices[0];
        vtx.x += anchor.x;
        vtx.y += anchor.y;
        vtx.z += anchor.z;
        vtx.w += anchor.w;
    }

    vtx.clip = ClipFlags::default()
        .with_pos_x(vtx.x > vtx.w)
        .with_neg_x(vtx.x < -vtx.w)
        .with_pos_y(vtx.y > vtx.w)
        .with_neg_y(vtx.y < -vtx.w)
        .with_w(vtx.w < 0.01);

    let rsp = &sys.rsp;
    let acclaim = rsp.dialect.lighting_model() == LightingModel::Acclaim
        && rsp.geometry(|b| b.point_lighting);

    if rsp.geometry(|b| b.lighting) {
        let model_kind = rsp.dialect.lighting_model();
        if rsp.geometry(|b| b.point_lighting) && !acclaim {
            match model_kind {
                LightingModel::Conker => light::conker_point(kernel, rsp, &mut vtx),
                _ => light::zelda_point(kernel, rsp, &mut vtx, model),
            }
        } else if hardware_lighting(sys) {
            light::hardware(kernel, rsp, &mut vtx);
        } else {
            match model_kind {
                LightingModel::Conker => light::conker(kernel, rsp, &mut vtx),
                _ => light::standard(kernel, rsp, &mut vtx),
            }
        }

        if acclaim {
            light::acclaim(kernel, rsp, &mut vtx);
        }

        if rsp.geometry(|b| b.texture_gen) {
            let linear = rsp.geometry(|b| b.texture_gen_linear);
            light::texgen(kernel, rsp, &mut vtx, linear);
        }
    } else if acclaim {
        light::acclaim(kernel, rsp, &mut vtx);
    } else {
        vtx.hw_light = 0;
    }

    sys.rsp.vertices[index] = vtx;
}

/// Vertex fields a modification can write.
pub mod field {
    pub const RGBA: u32 = 0x10;
    pub const ST: u32 = 0x14;
    pub const XY_SCREEN: u32 = 0x18;
    pub const Z_SCREEN: u32 = 0x1C;
}

/// Overwrites a field of an already processed vertex.
pub fn modify_vertex(sys: &mut System, index: u32, which: u32, value: u32) {
    let Some(&vtx) = sys.rsp.vertices.get(index as usize) else {
        warn!(index, "modified vertex outside of the vertex buffer");
        return;
    };

    let mut vtx = vtx;
    let hi = (value >> 16) as i16;
    let lo = value as i16;
    let viewport = sys.rsp.viewport;

    match which {
        field::RGBA => {
            vtx.r = color((value >> 24) as u8);
            vtx.g = color((value >> 16) as u8);
            vtx.b = color((value >> 8) as u8);
            vtx.a = color(value as u8);
            vtx.modify.set_rgba(true);
        }
        field::ST => {
            vtx.s = util::fixed_to_f32::<5>(hi as i32) / sys.rsp.texture.scale_s;
            vtx.t = util::fixed_to_f32::<5>(lo as i32) / sys.rsp.texture.scale_t;
        }
        field::XY_SCREEN => {
            let mut x = (util::fixed_to_f32::<2>(hi as i32) - viewport.vtrans[0]) / viewport.vscale[0];
            if viewport.vscale[0] < 0.0 {
                x = -x;
            }
            vtx.x = x * vtx.w;

            if let Some(scale) = adjust_scale(sys) {
                vtx.x *= scale;
                if sys.rsp.matrix.projection[3][2] == -1.0 {
                    vtx.w *= scale;
                }
            }

            let mut y = -(util::fixed_to_f32::<2>(lo as i32) - viewport.vtrans[1]) / viewport.vscale[1];
            if viewport.vscale[1] < 0.0 {
                y = -y;
            }
            vtx.y = y * vtx.w;

            vtx.clip = ClipFlags::default().with_w(vtx.clip.w());
        }
        field::Z_SCREEN => {
            let z = util::fixed_to_f32::<15>(hi as i32);
            vtx.z = (z - viewport.vtrans[2]) / viewport.vscale[2];
            vtx.clip.set_w(false);
            vtx.modify.set_z(true);
        }
        _ => {
            warn!(which, "unknown vertex field");
            return;
        }
    }

    sys.rsp.vertices[index as usize] = vtx;
}

/// Sets up the sprite at `address`: loads its palette and, when it fits, its image into TMEM.
pub fn sprite_base(sys: &mut System, address: u32) {
    let address = sys.rsp.segment_address(address);
    let Ok(bytes) = sys.mem.slice(address, SPRITE_LEN) else {
        warn!(address = format_args!("{address:#08X}"), "sprite outside of RDRAM");
        return;
    };

    let word = |offset: usize| u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]]);
    let image = word(0);
    let tlut = word(4);
    let stride = half(bytes, 8);
    let width = half(bytes, 10) as u16;
    let height = half(bytes, 12) as u16;
    let format = ImageFormat::from_bits(u3::new(bytes[14] & 7));
    let size = TexelSize::from_bits(bitos::integer::u2::new(bytes[15] & 3));
    let image_x = half(bytes, 16) as u16;
    let image_y = half(bytes, 18) as u16;

    let lut = if tlut != 0 {
        rdp::set_texture_image(sys, ImageFormat::Rgba, TexelSize::Bits16, 1, tlut);
        let cmd = TileCommand::default()
            .with_format(ImageFormat::Rgba)
            .with_size(TexelSize::Bits16)
            .with_tmem(u9::new(256))
            .with_tile(u3::new(7));
        rdp::set_tile(sys, cmd);
        tmem::load_tlut(sys, 7, 0, 0, 1020, 0);

        if format != ImageFormat::Rgba {
            TextureLut::Rgba16
        } else {
            TextureLut::None
        }
    } else {
        TextureLut::None
    };

    sys.rdp.other_mode_h = sys.rdp.other_mode_h.with_texture_lut(lut).with_texture_persp(true);
    sys.rdp.changed.set_render_mode(true);

    // the image area of TMEM shrinks to its low half when a palette is in use
    let capacity = if tlut != 0 { n64tex::HIGH_HALF } else { n64tex::TMEM_LEN };
    let row = ((width as usize) << size as usize >> 1).next_multiple_of(8);
    let loaded = stride > 0 && row * height as usize <= capacity && width > 0 && height > 0;
    if loaded {
        rdp::set_texture_image(sys, format, size, stride as u32, image);
        let cmd = TileCommand::default()
            .with_format(format)
            .with_size(size)
            .with_line(u9::new((row / 8) as u16))
            .with_tile(u3::new(0));
        rdp::set_tile(sys, cmd);

        let (uls, ult) = (image_x << 2, image_y << 2);
        let (lrs, lrt) = ((image_x + width - 1) << 2, (image_y + height - 1) << 2);
        tmem::load_tile(sys, 0, uls, ult, lrs, lrt);
    } else {
        warn!(width, height, ?size, "sprite image does not fit in TMEM");
    }

    rsp::texture(sys, 0, 0, 0, 0, true);

    sys.rsp.sprite = rsp::Sprite {
        image,
        stride: stride.max(0) as u16,
        width,
        height,
        image_x,
        image_y,
        scale_x: 1.0,
        scale_y: 1.0,
        flip_x: false,
        flip_y: false,
        loaded,
    };
}

pub fn sprite_scale_flip(sys: &mut System, scale_x: f32, scale_y: f32, flip_x: bool, flip_y: bool) {
    let sprite = &mut sys.rsp.sprite;
    sprite.scale_x = scale_x;
    sprite.scale_y = scale_y;
    sprite.flip_x = flip_x;
    sprite.flip_y = flip_y;
}

/// Draws the current sprite with its upper left corner at `(x, y)`, in screen pixels.
pub fn sprite_draw(sys: &mut System, x: f32, y: f32) {
    let sprite = sys.rsp.sprite;
    if sprite.stride == 0 {
        return;
    }

    let frame_w = sprite.width as f32 / sprite.scale_x;
    let frame_h = sprite.height as f32 / sprite.scale_y;
    let (ulx, lrx) = if sprite.flip_x {
        (x + frame_w, x)
    } else {
        (x, x + frame_w)
    };
    let (uly, lry) = if sprite.flip_y {
        (y + frame_h, y)
    } else {
        (y, y + frame_h)
    };

    let uls = sprite.image_x as f32;
    let ult = sprite.image_y as f32;
    let lrs = uls + sprite.width as f32 - 1.0;
    let lrt = ult + sprite.height as f32 - 1.0;

    let z = if sys.rdp.other_mode_l.depth_source_prim() {
        sys.rdp.prim_depth.z
    } else {
        sys.rsp.viewport.near
    };

    let corner = |x: f32, y: f32, s: f32, t: f32| Vertex {
        x,
        y,
        z,
        w: 1.0,
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
        s,
        t,
        ..Default::default()
    };

    let quad = [
        corner(ulx, uly, uls, ult),
        corner(lrx, uly, lrs, ult),
        corner(ulx, lry, uls, lrt),
        corner(lrx, lry, lrs, lrt),
    ];

    drawer::draw_screen_quad(sys, quad);
    trace!(ulx, uly, lrx, lry, "sprite");
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        Opal,
        config::Config,
        modules::render::NopRenderModule,
        system::{
            gbi::Dialect,
            math::{IDENTITY, MATRIX_LEN, Matrix, encode_matrix},
            mem::Rdram,
        },
    };

    fn opal() -> Opal {
        let mut config = Config::default();
        config.emulation.noise = false;
        Opal::new(config, Rdram::new(0x10000), Box::new(NopRenderModule))
    }

    fn store_matrix(sys: &mut System, address: u32, mtx: &Matrix) {
        sys.mem
            .slice_mut(address, MATRIX_LEN)
            .unwrap()
            .copy_from_slice(&encode_matrix(mtx));
    }

    fn store_vertex(sys: &mut System, address: u32, pos: [i16; 3], st: [i16; 2], rgba: [u8; 4]) {
        for (i, c) in pos.iter().enumerate() {
            sys.mem.write_u16(address + 2 * i as u32, *c as u16).unwrap();
        }
        sys.mem.write_u16(address + 8, st[0] as u16).unwrap();
        sys.mem.write_u16(address + 10, st[1] as u16).unwrap();
        for (i, c) in rgba.iter().enumerate() {
            sys.mem.write_u8(address + 12 + i as u32, *c).unwrap();
        }
    }

    #[test]
    fn identity_transform() {
        let mut opal = opal();
        let sys = opal.system_mut();
        store_matrix(sys, 0x100, &IDENTITY);
        rsp::matrix::matrix(sys, 0x100, false, true, false);
        rsp::matrix::matrix(sys, 0x100, true, true, false);

        store_vertex(sys, 0x200, [10, 20, 30], [64, 32], [255, 0, 0, 255]);
        vertex(sys, 0x200, 1, 0);

        let vtx = sys.rsp.vertices[0];
        assert_eq!([vtx.x, vtx.y, vtx.z, vtx.w], [10.0, 20.0, 30.0, 1.0]);
        assert_eq!([vtx.s, vtx.t], [2.0, 1.0]);
        assert_eq!([vtx.r, vtx.g, vtx.b, vtx.a], [1.0, 0.0, 0.0, 1.0]);
        // x, y and z lie outside of the unit w
        assert!(vtx.clip.pos_x() && vtx.clip.pos_y());
        assert!(!vtx.clip.w());
    }

    #[test]
    fn red_light_from_memory() {
        let mut opal = opal();
        let sys = opal.system_mut();
        store_matrix(sys, 0x100, &IDENTITY);
        rsp::matrix::matrix(sys, 0x100, false, true, false);

        // light 0: red, pointing at +z. ambient: black
        sys.mem.write_u32(0x300, 0xFF00_0000).unwrap();
        sys.mem.write_u32(0x308, 0x0000_7F00).unwrap();
        light::light(sys, 0, 0x300);
        light::light(sys, 1, 0x310);
        rsp::num_lights(sys, 1);

        let lighting = sys.rsp.bits().lighting;
        rsp::geometry_mode(sys, 0, lighting);

        // normal (0, 0, 127)
        store_vertex(sys, 0x200, [0, 0, 0], [0, 0], [0, 0, 127, 255]);
        vertex(sys, 0x200, 1, 0);

        let vtx = sys.rsp.vertices[0];
        assert_eq!([vtx.r, vtx.g, vtx.b], [1.0, 0.0, 0.0]);
        assert!(!sys.rsp.changed.light());
    }

    #[test]
    fn out_of_range_loads_write_nothing() {
        let mut opal = opal();
        let sys = opal.system_mut();
        store_vertex(sys, 0x200, [1, 2, 3], [0, 0], [0; 4]);
        let before = *sys.rsp.vertices;

        // past the end of the vertex buffer
        vertex(sys, 0x200, 4, 78);
        // past the end of RDRAM
        vertex(sys, 0xFFF8, 2, 0);

        assert_eq!(*sys.rsp.vertices, before);
    }

    #[test]
    fn color_indexed_vertices() {
        let mut opal = opal();
        let sys = opal.system_mut();
        rsp::load_ucode(sys, Dialect::PerfectDark);
        rsp::vertex_color_base(sys, 0x400);

        sys.mem.write_u32(0x408, 0x00FF_0080).unwrap();
        store_vertex(sys, 0x200, [0, 0, 0], [0, 0], [0; 4]);
        sys.mem.write_u8(0x207, 8).unwrap();
        vertex(sys, 0x200, 1, 2);

        let vtx = sys.rsp.vertices[2];
        assert_eq!([vtx.r, vtx.g, vtx.b], [0.0, 1.0, 0.0]);
        assert_eq!(vtx.a, 128.0 / 255.0);
    }

    #[test]
    fn dma_vertices_append() {
        let mut opal = opal();
        let sys = opal.system_mut();
        rsp::load_ucode(sys, Dialect::DiddyKong);
        rsp::dma_offsets(sys, 0, 0x100);

        for i in 0..4u32 {
            sys.mem.write_u16(0x300 + 10 * i, (i + 1) as u16).unwrap();
        }

        dma_vertex(sys, 0x200, 2, 0, false);
        dma_vertex(sys, 0x214, 2, 0, true);

        let xs: Vec<f32> = sys.rsp.vertices[..4].iter().map(|v| v.x).collect();
        assert_eq!(xs, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(sys.rsp.vertex_append, 4);
    }

    #[test]
    fn modify_screen_coordinates() {
        let mut opal = opal();
        let sys = opal.system_mut();
        sys.rsp.viewport.vscale = [160.0, 120.0, 511.0, 0.0];
        sys.rsp.viewport.vtrans = [160.0, 120.0, 511.0, 0.0];
        sys.rsp.vertices[3] = Vertex {
            w: 2.0,
            clip: ClipFlags::from_bits(ClipFlags::ALL),
            ..Default::default()
        };

        // (320, 0) in 10.2 fixed point
        modify_vertex(sys, 3, field::XY_SCREEN, (320 << 2) << 16);
        let vtx = sys.rsp.vertices[3];
        assert_eq!((vtx.x, vtx.y), (2.0, 2.0));
        assert_eq!(vtx.clip.to_bits(), ClipFlags::default().with_w(true).to_bits());

        modify_vertex(sys, 3, field::RGBA, 0xFF00_00FF);
        let vtx = sys.rsp.vertices[3];
        assert_eq!([vtx.r, vtx.g, vtx.b, vtx.a], [1.0, 0.0, 0.0, 1.0]);
        assert!(vtx.modify.rgba());

        modify_vertex(sys, 90, field::RGBA, 0);
    }

    #[test]
    fn billboard_offsets_by_the_first_vertex() {
        let mut opal = opal();
        let sys = opal.system_mut();
        store_matrix(sys, 0x100, &IDENTITY);
        rsp::matrix::matrix(sys, 0x100, false, true, false);

        store_vertex(sys, 0x200, [5, 0, 0], [0, 0], [0; 4]);
        vertex(sys, 0x200, 1, 0);

        sys.rsp.matrix.billboard = true;
        store_vertex(sys, 0x210, [1, 0, 0], [0, 0], [0; 4]);
        vertex(sys, 0x210, 1, 1);

        assert_eq!(sys.rsp.vertices[1].x, 6.0);
        assert_eq!(sys.rsp.vertices[1].w, 2.0);
    }

    fn arbitrary_matrix() -> impl Strategy<Value = Matrix> {
        prop::array::uniform4(prop::array::uniform4(-4.0f32..4.0))
    }

    proptest! {
        #[test]
        fn groups_match_single_vertices(
            mtx in arbitrary_matrix(),
            positions in prop::collection::vec(prop::array::uniform3(any::<i16>()), 1..24),
            lit in any::<bool>(),
        ) {
            let mut opal = opal();
            let sys = opal.system_mut();
            sys.rsp.matrix.projection = mtx;
            sys.rsp.lights[0] = light::Light {
                rgb: [0.5, 0.25, 1.0],
                xyz: [0.0, 0.6, 0.8],
                ..Default::default()
            };
            sys.rsp.num_lights = 1;
            if lit {
                let lighting = sys.rsp.bits().lighting;
                rsp::geometry_mode(sys, 0, lighting);
            }
            let kernel = sys.kernel;
            light::update_light_vectors(kernel, &mut sys.rsp);

            let load = |sys: &mut System| {
                for (vtx, p) in sys.rsp.vertices.iter_mut().zip(&positions) {
                    *vtx = Vertex {
                        x: p[0] as f32,
                        y: p[1] as f32,
                        z: p[2] as f32,
                        nx: 0.0,
                        ny: 1.0,
                        nz: 0.0,
                        ..Default::default()
                    };
                }
            };

            load(sys);
            process::<GROUP>(sys, 0, positions.len());
            let grouped = *sys.rsp.vertices;

            load(sys);
            process::<1>(sys, 0, positions.len());
            prop_assert_eq!(&grouped[..], &sys.rsp.vertices[..]);
        }
    }
}
