mod common;

use common::*;
use opal::system::{depth, framebuffer, mem::RDRAM_4MB};

const COLOR_IMAGE: u32 = 0x0010_0000;

/// SetColorImage for a 16 bit RGBA image of the given width.
fn set_color_image(width: u32) -> (u32, u32) {
    (0xFF10_0000 | (width - 1), COLOR_IMAGE)
}

#[test]
fn same_image_reuses_its_target() {
    let (mut opal, log) = recorded(config(), RDRAM_4MB);
    write(
        &mut opal,
        0x1000,
        &[set_color_image(320), (0xE700_0000, 0), set_color_image(320), (END, 0)],
    );
    opal.run_display_list(0x1000);

    assert_eq!(names(&log, "CreateTarget"), ["CreateTarget(TargetId(0), 320x240)"]);
    assert!(names(&log, "DeleteTarget").is_empty());
    assert_eq!(
        names(&log, "BindTarget"),
        ["BindTarget(Some(TargetId(0)))", "BindTarget(Some(TargetId(0)))"]
    );
}

#[test]
fn width_change_replaces_the_target() {
    let (mut opal, log) = recorded(config(), RDRAM_4MB);
    write(&mut opal, 0x1000, &[set_color_image(320), set_color_image(640), (END, 0)]);
    opal.run_display_list(0x1000);

    assert_eq!(
        names(&log, "CreateTarget"),
        ["CreateTarget(TargetId(0), 320x240)", "CreateTarget(TargetId(1), 640x480)"]
    );
    assert_eq!(names(&log, "DeleteTarget"), ["DeleteTarget(TargetId(0))"]);

    // the old target is gone before the new one is made
    let targets: Vec<_> = names(&log, "")
        .into_iter()
        .filter(|name| name.contains("Target("))
        .collect();
    let deleted = targets.iter().position(|name| name.starts_with("DeleteTarget"));
    let created = targets.iter().position(|name| name.contains("640x480"));
    assert!(deleted < created);

    let sys = opal.system_mut();
    assert_eq!(sys.framebuffers.current, Some(COLOR_IMAGE));
    assert_eq!(sys.framebuffers.list.len(), 1);
}

#[test]
fn too_wide_images_are_ignored() {
    let (mut opal, log) = recorded(config(), RDRAM_4MB);
    write(&mut opal, 0x1000, &[set_color_image(1024), (END, 0)]);
    opal.run_display_list(0x1000);

    assert!(names(&log, "CreateTarget").is_empty());
}

const DEPTH_IMAGE: u32 = 0x0020_0000;

/// Selects fill mode with a 320x240 scissor and fills the whole screen with `fill`.
fn fill_screen(fill: u32) -> [(u32, u32); 4] {
    [
        (0xE300_0A01, 0x0030_0000),
        (0xED00_0000, 0x0050_03C0),
        (0xF700_0000, fill),
        (0xF64F_C3BC, 0),
    ]
}

#[test]
fn filling_the_depth_image_clears_depth() {
    let (mut opal, log) = recorded(config(), RDRAM_4MB);
    let mut words = vec![
        set_color_image(320),
        (0xFE00_0000, DEPTH_IMAGE),
        (0xFF10_013F, DEPTH_IMAGE),
    ];
    words.extend(fill_screen(0xFFFC_FFFC));
    words.push((END, 0));
    write(&mut opal, 0x1000, &words);
    opal.run_display_list(0x1000);

    assert_eq!(names(&log, "CreateDepth"), ["CreateDepth(DepthId(0), 320x240)"]);
    assert_eq!(names(&log, "ClearDepth"), ["ClearDepth(DepthId(0))"]);
    assert!(names(&log, "Draw").is_empty());
    assert!(names(&log, "ClearColor").is_empty());

    // the clear value lands in guest memory too
    assert_eq!(opal.rdram().read_u32(DEPTH_IMAGE).unwrap(), 0xFFFC_FFFC);
}

#[test]
fn full_screen_fill_clears_color() {
    let (mut opal, log) = recorded(config(), RDRAM_4MB);
    let mut words = vec![set_color_image(320)];
    words.extend(fill_screen(0xF801_F801));
    words.push((END, 0));
    write(&mut opal, 0x1000, &words);
    opal.run_display_list(0x1000);

    let clears = names(&log, "ClearColor");
    assert_eq!(clears.len(), 1);
    assert!(clears[0].starts_with("ClearColor(TargetId(0)"));
    assert!(names(&log, "ClearDepth").is_empty());
    assert!(names(&log, "Draw").is_empty());
}

#[test]
fn images_past_the_end_of_rdram_get_no_target() {
    let (mut opal, log) = recorded(config(), 0x10000);
    let mut words = vec![(0xFF10_013F, 0x0002_0000)];
    words.extend(fill_screen(0xF801_F801));
    words.extend([(0xFF10_013F, 0x0000_1000), (END, 0)]);
    write(&mut opal, 0x8000, &words);
    opal.run_display_list(0x8000);

    assert_eq!(names(&log, "CreateTarget"), ["CreateTarget(TargetId(0), 320x240)"]);
    assert_eq!(
        names(&log, "BindTarget"),
        ["BindTarget(None)", "BindTarget(Some(TargetId(0)))"]
    );

    let sys = opal.system_mut();
    assert_eq!(sys.framebuffers.current, Some(0x1000));
    assert!(sys.framebuffers.list.values().all(|fb| fb.start <= fb.end));
}

#[test]
fn resolves_happen_once_per_frame() {
    let mut config = config();
    config.video.multisampling = 4;
    let (mut opal, log) = recorded(config, RDRAM_4MB);
    write(
        &mut opal,
        0x1000,
        &[set_color_image(320), (0xFE00_0000, DEPTH_IMAGE), (END, 0)],
    );
    opal.run_display_list(0x1000);

    let sys = opal.system_mut();
    framebuffer::resolve(sys, COLOR_IMAGE);
    framebuffer::resolve(sys, COLOR_IMAGE);
    assert_eq!(names(&log, "Resolve"), ["Resolve(TargetId(0))"]);

    depth::resolve(sys);
    depth::resolve(sys);
    depth::copy(sys);
    depth::copy(sys);
    assert_eq!(names(&log, "Resolve").len(), 2);
    assert_eq!(names(&log, "CopyDepth"), ["CopyDepth(DepthId(0))"]);

    // a new frame resolves again
    sys.vi.swap_count += 1;
    framebuffer::resolve(sys, COLOR_IMAGE);
    depth::copy(sys);
    assert_eq!(names(&log, "Resolve").len(), 3);
    assert_eq!(names(&log, "CopyDepth").len(), 2);
}
