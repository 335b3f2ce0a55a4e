//! Lights and the lighting models of the supported dialects.

use tracing::{trace, warn};

use crate::{
    System,
    modules::render::HardwareLights,
    system::{
        gbi::Dialect,
        math::{Kernel, Matrix},
        rsp::{LIGHT_COUNT, State, Vertex},
    },
};

/// Size of a light structure in guest memory.
const LIGHT_LEN: usize = 16;
const CBFD_LIGHT_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Light {
    pub rgb: [f32; 3],
    /// Direction in model space.
    pub xyz: [f32; 3],
    /// Normalized direction in eye space.
    pub i_xyz: [f32; 3],
    /// Position of a point light.
    pub pos: [f32; 4],
    /// Constant, linear and quadratic attenuation.
    pub ca: f32,
    pub la: f32,
    pub qa: f32,
}

/// The look-at vectors used by texture coordinate generation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LookAt {
    pub xyz: [[f32; 3]; 2],
    pub i_xyz: [[f32; 3]; 2],
    pub enabled: bool,
}

#[inline(always)]
fn color(byte: u8) -> f32 {
    byte as f32 / 255.0
}

#[inline(always)]
fn half(bytes: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline(always)]
fn add_scaled(acc: &mut [f32; 3], rgb: [f32; 3], factor: f32) {
    for (a, c) in acc.iter_mut().zip(rgb) {
        *a += c * factor;
    }
}

#[inline(always)]
fn saturate(c: [f32; 3]) -> [f32; 3] {
    c.map(|x| x.min(1.0))
}

/// Loads light `light` (zero based) from guest memory, in the layout of the current dialect.
pub fn light(sys: &mut System, light: u32, address: u32) {
    let address = sys.rsp.segment_address(address);
    let dialect = sys.rsp.dialect;
    let (limit, len) = match dialect {
        Dialect::Conker => (12, CBFD_LIGHT_LEN),
        Dialect::Acclaim => (10, LIGHT_LEN),
        _ => (8, LIGHT_LEN),
    };

    if light >= limit {
        warn!(light, "light index out of range");
        return;
    }

    let Ok(bytes) = sys.mem.slice(address, len) else {
        warn!(address = format_args!("{address:#08X}"), "light outside of RDRAM");
        return;
    };

    let kernel = sys.kernel;
    let slot = &mut sys.rsp.lights[light as usize];
    match dialect {
        Dialect::Conker => {
            slot.rgb = [color(bytes[0]), color(bytes[1]), color(bytes[2])];
            let dir = [bytes[8] as i8 as f32, bytes[9] as i8 as f32, bytes[10] as i8 as f32];
            slot.xyz = kernel.normalize(dir);
            slot.pos = [
                half(bytes, 32) as f32,
                half(bytes, 34) as f32,
                half(bytes, 36) as f32,
                half(bytes, 38) as f32,
            ];
            slot.ca = bytes[12] as f32 / 16.0;
        }
        Dialect::Acclaim => {
            slot.pos = [
                half(bytes, 0) as f32,
                half(bytes, 2) as f32,
                half(bytes, 4) as f32,
                1.0,
            ];
            slot.rgb = [color(bytes[6]), color(bytes[7]), color(bytes[8])];
            slot.ca = half(bytes, 10) as f32;
            slot.la = half(bytes, 12) as u16 as f32 / 65536.0;
            slot.qa = half(bytes, 14) as u16 as f32;
        }
        _ => {
            slot.rgb = [color(bytes[0]), color(bytes[1]), color(bytes[2])];
            let dir = [bytes[8] as i8 as f32, bytes[9] as i8 as f32, bytes[10] as i8 as f32];
            slot.xyz = kernel.normalize(dir);
            slot.pos = [
                half(bytes, 8) as f32,
                half(bytes, 10) as f32,
                half(bytes, 12) as f32,
                1.0,
            ];
            slot.ca = bytes[3] as f32;
            slot.la = bytes[7] as f32;
            slot.qa = bytes[14] as f32;
        }
    }

    sys.rsp.changed.set_light(true);
    trace!(light, ?dialect, "loaded light");
}

/// Replaces the color of light `light` (zero based) with the RGB part of `packed`.
pub fn light_color(sys: &mut System, light: u32, packed: u32) {
    if light >= 8 {
        warn!(light, "light index out of range");
        return;
    }

    let slot = &mut sys.rsp.lights[light as usize];
    slot.rgb = [
        color((packed >> 24) as u8),
        color((packed >> 16) as u8),
        color((packed >> 8) as u8),
    ];
    sys.rsp.changed.set_hw_light(true);
}

pub fn lookat(sys: &mut System, axis: u8, address: u32) {
    let address = sys.rsp.segment_address(address);
    let Ok(bytes) = sys.mem.slice(address, LIGHT_LEN) else {
        warn!(address = format_args!("{address:#08X}"), "look-at outside of RDRAM");
        return;
    };

    let axis = axis as usize & 1;
    let (x, y, z) = (bytes[8] as i8, bytes[9] as i8, bytes[10] as i8);

    let lookat = &mut sys.rsp.lookat;
    lookat.enabled = axis == 0 || x != 0 || y != 0;
    lookat.xyz[axis] = sys.kernel.normalize([x as f32, y as f32, z as f32]);
    sys.rsp.changed.set_lookat(true);
}

/// Brings the eye space light directions up to date with the model view matrix.
pub fn update_light_vectors(kernel: &dyn Kernel, rsp: &mut State) {
    let mv = rsp.matrix.modelview[rsp.matrix.index];
    let count = rsp.num_lights.min(rsp.lights.len());
    let mut directions = [[0.0; 3]; LIGHT_COUNT];
    for (dir, light) in directions.iter_mut().zip(&rsp.lights[..count]) {
        *dir = light.xyz;
    }

    kernel.inverse_transform_normalize_batch(&mv, &mut directions[..count]);
    for (light, dir) in rsp.lights[..count].iter_mut().zip(directions) {
        light.i_xyz = dir;
    }

    rsp.changed.set_light(false);
    rsp.changed.set_hw_light(true);
}

pub fn update_lookat_vectors(kernel: &dyn Kernel, rsp: &mut State) {
    if rsp.lookat.enabled {
        let mv = rsp.matrix.modelview[rsp.matrix.index];
        for axis in 0..2 {
            rsp.lookat.i_xyz[axis] = kernel.inverse_transform_normalize(rsp.lookat.xyz[axis], &mv);
        }
    }

    rsp.changed.set_lookat(false);
}

#[inline(always)]
fn ambient(rsp: &State) -> [f32; 3] {
    rsp.lights[rsp.num_lights.min(rsp.lights.len() - 1)].rgb
}

#[inline(always)]
fn active(rsp: &State) -> &[Light] {
    &rsp.lights[..rsp.num_lights.min(rsp.lights.len() - 1)]
}

/// Directional lights plus ambient.
pub fn standard(kernel: &dyn Kernel, rsp: &State, vtx: &mut Vertex) {
    let normal = [vtx.nx, vtx.ny, vtx.nz];
    let mut acc = ambient(rsp);
    for light in active(rsp) {
        let intensity = kernel.dot(normal, light.i_xyz);
        if intensity > 0.0 {
            add_scaled(&mut acc, light.rgb, intensity);
        }
    }

    [vtx.r, vtx.g, vtx.b] = saturate(acc);
}

/// Leaves lighting to the renderer: the vertex color carries the eye space normal.
pub fn hardware(kernel: &dyn Kernel, rsp: &State, vtx: &mut Vertex) {
    let mv = &rsp.matrix.modelview[rsp.matrix.index];
    [vtx.r, vtx.g, vtx.b] = kernel.transform_direction_normalize([vtx.r, vtx.g, vtx.b], mv);
    vtx.hw_light = rsp.num_lights as u8;
}

/// Distance term of the Conker lights, measured between the modified vertex position and the
/// light position.
#[inline(always)]
fn cbfd_distance(rsp: &State, vtx: &Vertex, light: &Light) -> f32 {
    let cm = &rsp.coord_mod;
    let pos = [vtx.x, vtx.y, vtx.z, vtx.w];
    let mut len = 0.0;
    for k in 0..4 {
        let v = (pos[k] + cm[8 + k]) * cm[12 + k] - light.pos[k];
        len += v * v;
    }

    len / 65536.0
}

/// Conker lighting: attenuated by distance, modulating the vertex color.
pub fn conker(_: &dyn Kernel, rsp: &State, vtx: &mut Vertex) {
    let mut acc = ambient(rsp);
    for light in active(rsp) {
        let len = cbfd_distance(rsp, vtx, light);
        let intensity = (light.ca / len).min(1.0);
        if intensity > 0.0 {
            add_scaled(&mut acc, light.rgb, intensity);
        }
    }

    let acc = saturate(acc);
    vtx.r *= acc[0];
    vtx.g *= acc[1];
    vtx.b *= acc[2];
}

/// Majora's Mask point lights. Lights with a zero constant attenuation are directional.
pub fn zelda_point(kernel: &dyn Kernel, rsp: &State, vtx: &mut Vertex, model: [f32; 3]) {
    let mv = &rsp.matrix.modelview[rsp.matrix.index];
    let eye = kernel.transform_vector(model, mv);
    let normal = [vtx.nx, vtx.ny, vtx.nz];

    let mut acc = ambient(rsp);
    for light in active(rsp) {
        let intensity = if light.ca != 0.0 {
            let lvec = [
                light.pos[0] - eye[0],
                light.pos[1] - eye[1],
                light.pos[2] - eye[2],
            ];

            let k = lvec[0] * lvec[0] + lvec[1] * lvec[1] + lvec[2] * lvec[2] * 2.0;
            let ks = k.sqrt();

            let lvec = kernel
                .inverse_transform(lvec, mv)
                .map(|c| (4.0 * c / ks).clamp(-1.0, 1.0));
            let v = kernel.dot(lvec, normal).clamp(-1.0, 1.0);

            let ksf = ks.floor();
            let d = (ksf * light.la * 2.0 + ksf * ksf * light.qa / 8.0) / 65536.0 + 1.0;
            v / d
        } else {
            kernel.dot(normal, light.i_xyz)
        };

        if intensity > 0.0 {
            add_scaled(&mut acc, light.rgb, intensity);
        }
    }

    [vtx.r, vtx.g, vtx.b] = saturate(acc);
}

/// Conker point lights. The last light in use is a plain directional light.
pub fn conker_point(kernel: &dyn Kernel, rsp: &State, vtx: &mut Vertex) {
    let normal = [vtx.nx, vtx.ny, vtx.nz];
    let lights = active(rsp);

    let mut acc = ambient(rsp);
    if let Some((last, points)) = lights.split_last() {
        for light in points {
            let mut intensity = kernel.dot(normal, light.xyz);
            if light.rgb == [0.0; 3] || intensity < 0.0 {
                continue;
            }

            if light.ca > 0.0 {
                let len = cbfd_distance(rsp, vtx, light);
                intensity *= (light.ca / len).min(1.0);
            }

            add_scaled(&mut acc, light.rgb, intensity);
        }

        let intensity = kernel.dot(normal, last.i_xyz);
        if last.i_xyz != [0.0; 3] && intensity > 0.0 {
            add_scaled(&mut acc, last.rgb, intensity);
        }
    }

    let acc = saturate(acc);
    vtx.r *= acc[0];
    vtx.g *= acc[1];
    vtx.b *= acc[2];
}

/// Acclaim point lights, added on top of the current vertex color.
pub fn acclaim(_: &dyn Kernel, rsp: &State, vtx: &mut Vertex) {
    let mut acc = [vtx.r, vtx.g, vtx.b];
    for light in &rsp.lights[2..10] {
        if light.ca < 0.0 {
            continue;
        }

        let distance = (light.pos[0] - vtx.x).abs()
            + (light.pos[1] - vtx.y).abs()
            + (light.pos[2] - vtx.z).abs()
            - light.ca;
        if distance < 0.0 {
            add_scaled(&mut acc, light.rgb, -distance * light.la);
        }
    }

    [vtx.r, vtx.g, vtx.b] = saturate(acc);
}

/// Generates texture coordinates from the vertex normal.
pub fn texgen(kernel: &dyn Kernel, rsp: &State, vtx: &mut Vertex, linear: bool) {
    let normal = [vtx.nx, vtx.ny, vtx.nz];
    let (x, y) = if rsp.lookat.enabled {
        (
            kernel.dot(rsp.lookat.i_xyz[0], normal),
            kernel.dot(rsp.lookat.i_xyz[1], normal),
        )
    } else {
        let mv: &Matrix = &rsp.matrix.modelview[rsp.matrix.index];
        let dir = kernel.transform_direction_normalize(normal.map(|c| c * 128.0), mv);
        (dir[0], dir[1])
    };

    if linear {
        vtx.s = (-x).acos() * 325.949_3;
        vtx.t = (-y).acos() * 325.949_3;
    } else {
        vtx.s = (x + 1.0) * 512.0;
        vtx.t = (y + 1.0) * 512.0;
    }
}

/// Eye space lights handed to the renderer when it lights vertices itself.
pub fn hardware_lights(rsp: &State) -> HardwareLights {
    let count = rsp.num_lights.min(8);
    let mut lights = HardwareLights {
        count: count as u8,
        ambient: ambient(rsp),
        ..Default::default()
    };

    for (i, light) in rsp.lights[..count].iter().enumerate() {
        lights.colors[i] = light.rgb;
        lights.directions[i] = light.i_xyz;
    }

    lights
}
