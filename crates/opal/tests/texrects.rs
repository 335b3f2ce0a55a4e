mod common;

use common::*;
use opal::modules::render::{Action, DrawVertex};

const WIDTH: usize = 64;
const HEIGHT: usize = 32;

/// What the software rasterizer stores per pixel: the sampled texel and the combiner.
type Pixel = Option<(i32, i32, u64)>;

/// Point samples every rectangle draw in `log` into a small target.
fn rasterize(log: &Log) -> Vec<Pixel> {
    let mut target = vec![None; WIDTH * HEIGHT];
    for action in log.lock().unwrap().iter() {
        let Action::DrawRects(draw) = action else {
            continue;
        };

        for quad in &draw.quads {
            raster_quad(&mut target, quad, draw.state.combine);
        }
    }

    target
}

fn raster_quad(target: &mut [Pixel], quad: &[DrawVertex; 4], combine: u64) {
    let [tl, _, _, br] = quad;
    let (width, height) = (br.x - tl.x, br.y - tl.y);

    for y in tl.y.max(0.0) as usize..(br.y as usize).min(HEIGHT) {
        for x in tl.x.max(0.0) as usize..(br.x as usize).min(WIDTH) {
            let u = (x as f32 + 0.5 - tl.x) / width;
            let v = (y as f32 + 0.5 - tl.y) / height;
            let s = tl.s + u * (br.s - tl.s);
            let t = tl.t + v * (br.t - tl.t);
            target[y * WIDTH + x] = Some((s.floor() as i32, t.floor() as i32, combine));
        }
    }
}

/// A grid of 8x8 rectangles covering the target, with a combiner change halfway through.
fn tiled_background() -> Vec<(u32, u32)> {
    let mut words = Vec::new();
    for row in 0..(HEIGHT / 8) as u32 {
        for column in 0..(WIDTH / 8) as u32 {
            if row == 2 && column == 3 {
                words.push((0xFC12_1824, 0xFF33_FFFF));
            }

            let (x, y) = (column * 8, row * 8);
            let [a, b, c] = texrect(0, x, y, x + 8, y + 8, (x * 32) as u16, (y * 32) as u16);
            words.extend([a, b, c]);
        }

        // a sync between rows doesn't end a run
        words.push((0xE700_0000, 0));
    }

    words.push((END, 0));
    words
}

fn render(batch: bool, words: &[(u32, u32)]) -> Log {
    let mut config = config();
    config.emulation.batch_texrects = batch;
    let (mut opal, log) = recorded(config, 0x10000);
    write(&mut opal, 0x1000, words);
    opal.run_display_list(0x1000);
    log
}

#[test]
fn runs_end_at_visible_commands() {
    let [a0, a1, a2] = texrect(0, 0, 0, 16, 16, 0, 0);
    let [b0, b1, b2] = texrect(0, 16, 0, 32, 16, 16 * 32, 0);
    let [c0, c1, c2] = texrect(0, 32, 0, 48, 16, 32 * 32, 0);

    let words = [
        a0,
        a1,
        a2,
        b0,
        b1,
        b2,
        // set blend color
        (0xF900_0000, 0xFF00_00FF),
        c0,
        c1,
        c2,
        (END, 0),
    ];

    let log = render(true, &words);
    assert_eq!(names(&log, "DrawRects"), ["DrawRects(2)", "DrawRects(1)"]);

    let log = render(false, &words);
    assert_eq!(names(&log, "DrawRects"), ["DrawRects(1)"; 3]);
}

#[test]
fn batched_seams_are_cleared() {
    let [a0, a1, a2] = texrect(0, 0, 0, 16, 16, 0, 0);
    let [b0, b1, b2] = texrect(0, 16, 0, 32, 16, 16 * 32, 0);
    let log = render(true, &[a0, a1, a2, b0, b1, b2, (END, 0)]);

    let log = log.lock().unwrap();
    let draw = log
        .iter()
        .find_map(|action| match action {
            Action::DrawRects(draw) => Some(draw),
            _ => None,
        })
        .unwrap();

    let seam = draw.seam_clear.unwrap();
    assert_eq!((seam.x0, seam.y0, seam.x1, seam.y1), (0.0, 0.0, 32.0, 16.0));
}

#[test]
fn batching_does_not_change_the_image() {
    let words = tiled_background();
    let batched = render(true, &words);
    let separate = render(false, &words);

    let image = rasterize(&batched);
    assert!(image.iter().all(Option::is_some));
    assert_eq!(image, rasterize(&separate));

    let draws = |log: &Log| names(log, "DrawRects").len();
    assert_eq!(draws(&separate), (WIDTH / 8) * (HEIGHT / 8));
    assert!(draws(&batched) < draws(&separate));
}
