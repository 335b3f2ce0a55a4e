mod common;

use common::*;
use opal::{
    Opal,
    system::math::{self, IDENTITY, MATRIX_LEN},
};

const MATRIX: u32 = 0x2000;
const VERTICES: u32 = 0x3000;
const LIGHTS: u32 = 0x4000;

/// The identity matrix in the guest layout: integer halves, then fractional halves.
fn identity_bytes() -> [u8; MATRIX_LEN] {
    let mut bytes = [0; MATRIX_LEN];
    for i in 0..4 {
        bytes[2 * (i * 4 + i) + 1] = 1;
    }
    bytes
}

fn store_vertex(opal: &mut Opal, address: u32, pos: [i16; 3], rgba: [u8; 4]) {
    let mem = opal.rdram_mut();
    for (i, c) in pos.iter().enumerate() {
        mem.write_u16(address + 2 * i as u32, *c as u16).unwrap();
    }
    for (i, c) in rgba.iter().enumerate() {
        mem.write_u8(address + 12 + i as u32, *c).unwrap();
    }
}

#[test]
fn identity_matrix_decodes() {
    assert_eq!(math::decode_matrix(&identity_bytes()), IDENTITY);
    assert_eq!(math::encode_matrix(&IDENTITY), identity_bytes());
}

#[test]
fn vertices_pass_through_identity_transform() {
    let (mut opal, _) = recorded(config(), 0x10000);
    opal.rdram_mut()
        .slice_mut(MATRIX, MATRIX_LEN)
        .unwrap()
        .copy_from_slice(&identity_bytes());
    store_vertex(&mut opal, VERTICES, [10, -20, 30], [0, 255, 0, 255]);

    write(
        &mut opal,
        0x1000,
        &[
            // load modelview, then projection
            (0xDA38_0003, MATRIX),
            (0xDA38_0007, MATRIX),
            // one vertex into slot 0
            (0x0100_1002, VERTICES),
            (END, 0),
        ],
    );
    opal.run_display_list(0x1000);

    let vtx = opal.system_mut().rsp.vertices[0];
    assert_eq!([vtx.x, vtx.y, vtx.z, vtx.w], [10.0, -20.0, 30.0, 1.0]);
    assert_eq!([vtx.r, vtx.g, vtx.b, vtx.a], [0.0, 1.0, 0.0, 1.0]);
}

#[test]
fn directional_red_light() {
    let (mut opal, _) = recorded(config(), 0x10000);
    opal.rdram_mut()
        .slice_mut(MATRIX, MATRIX_LEN)
        .unwrap()
        .copy_from_slice(&identity_bytes());

    // light 0: red, pointing down +z. the ambient light after it stays black
    opal.rdram_mut().write_u32(LIGHTS, 0xFF00_0000).unwrap();
    opal.rdram_mut().write_u32(LIGHTS + 4, 0xFF00_0000).unwrap();
    opal.rdram_mut().write_u32(LIGHTS + 8, 0x0000_7F00).unwrap();

    // normal (0, 0, 127) in place of the color
    store_vertex(&mut opal, VERTICES, [0, 0, 0], [0, 0, 127, 255]);

    write(
        &mut opal,
        0x1000,
        &[
            (0xDA38_0003, MATRIX),
            (0xDA38_0007, MATRIX),
            (0xDC08_060A, LIGHTS),
            (0xDC08_090A, LIGHTS + 0x18),
            (0xDB02_0000, 24),
            // set G_LIGHTING
            (0xD9FF_FFFF, 0x0002_0000),
            (0x0100_1002, VERTICES),
            (END, 0),
        ],
    );
    opal.run_display_list(0x1000);

    let sys = opal.system_mut();
    assert_eq!(sys.rsp.num_lights, 1);

    let vtx = sys.rsp.vertices[0];
    assert_eq!([vtx.r, vtx.g, vtx.b], [1.0, 0.0, 0.0]);
    assert_eq!(vtx.a, 1.0);
}

/// Three vertices in slots 0..3 through identity matrices, then `commands`.
fn draw_triangles(commands: &[(u32, u32)]) -> Vec<String> {
    let (mut opal, log) = recorded(config(), 0x10000);
    opal.rdram_mut()
        .slice_mut(MATRIX, MATRIX_LEN)
        .unwrap()
        .copy_from_slice(&identity_bytes());
    store_vertex(&mut opal, VERTICES, [0, 0, 0], [255; 4]);
    store_vertex(&mut opal, VERTICES + 16, [1, 0, 0], [255; 4]);
    store_vertex(&mut opal, VERTICES + 32, [0, 1, 0], [255; 4]);

    let mut words = vec![
        (0xDA38_0003, MATRIX),
        (0xDA38_0007, MATRIX),
        (0x0100_3006, VERTICES),
    ];
    words.extend_from_slice(commands);
    words.push((END, 0));
    write(&mut opal, 0x1000, &words);
    opal.run_display_list(0x1000);

    names(&log, "DrawTriangles")
}

const TRI1: (u32, u32) = (0x0500_0204, 0);
const SMOOTH: (u32, u32) = (0xD9FF_FFFF, 0x0020_0000);

#[test]
fn smooth_triangles_are_drawn_together() {
    let draws = draw_triangles(&[SMOOTH, TRI1, TRI1, TRI1, (0xE700_0000, 0), TRI1]);
    assert_eq!(draws, ["DrawTriangles(3)", "DrawTriangles(1)"]);
}

#[test]
fn flat_triangles_are_drawn_one_command_at_a_time() {
    let draws = draw_triangles(&[TRI1, TRI1, TRI1]);
    assert_eq!(draws, ["DrawTriangles(1)"; 3]);
}
