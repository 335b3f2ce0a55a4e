//! Video interface: output geometry, buffer swaps and frame rate counters.

mod regs;

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{
    System,
    config::{CopyMode, SwapMode},
    modules::render::Action,
    system::{depth, drawer, framebuffer, mem::ADDRESS_MASK, rdp::regs::{ImageFormat, TexelSize}},
};

pub use regs::*;

/// Half lines per field above which the signal is PAL.
const PAL_V_SYNC: u32 = 550;

#[derive(Debug, Clone, Default)]
pub struct State {
    pub regs: Registers,
    /// Width of the output, in pixels.
    pub width: u32,
    /// Height of the output, in lines.
    pub height: u32,
    pub pal: bool,
    pub interlaced: bool,
    /// Origin at the last swap.
    pub last_origin: u32,
    /// Number of buffer swaps so far.
    pub swap_count: u32,
}

impl State {
    /// Nominal rate of vertical interrupts.
    pub fn nominal_rate(&self) -> f32 {
        if self.pal { 50.0 } else { 60.0 }
    }
}

/// Recomputes the output size from the VI registers.
pub fn update_size(sys: &mut System) {
    let regs = sys.vi.regs;
    let old_width = sys.vi.width;

    let vi = &mut sys.vi;
    vi.interlaced = regs.status.serrate();
    vi.pal = (regs.v_sync & 0x3FF) > PAL_V_SYNC;

    let width = (regs.h_start.len() as f32 * regs.x_scale.factor() + 0.5).floor() as u32;
    vi.width = if width == 0 { regs.width } else { width };

    // vertical coordinates are in half lines
    let lines = if vi.interlaced {
        regs.v_start.len() as f32
    } else {
        regs.v_start.len() as f32 / 2.0
    };
    let height = (lines * regs.y_scale.factor() + 0.5).floor() as u32;
    vi.height = match height {
        0 if vi.pal => 288,
        0 => 240,
        h => h,
    };

    let (width, height) = (vi.width, vi.height);
    if old_width != 0 && old_width != width && sys.config.frame_buffer.enable {
        framebuffer::remove_buffers(sys, old_width);
    }

    debug!(width, height, pal = sys.vi.pal, interlaced = sys.vi.interlaced, "vi size");
}

/// Handles a vertical interrupt: presents the frame when it is time to swap.
pub fn update_screen(sys: &mut System) {
    let origin = sys.vi.regs.origin & ADDRESS_MASK;
    if origin == 0 {
        return;
    }

    if origin != sys.vi.last_origin || sys.vi.width == 0 {
        update_size(sys);
    }

    let fb_config = &sys.config.frame_buffer;
    let swap = if fb_config.enable {
        match fb_config.swap_mode {
            SwapMode::OnVerticalInterrupt => true,
            SwapMode::OnViOriginChange => origin != sys.vi.last_origin,
            SwapMode::OnColorImageChange => sys.framebuffers.color_changed,
        }
    } else {
        sys.rdp.changed.color_buffer()
    };

    if swap {
        drawer::flush(sys);

        if sys.config.frame_buffer.enable {
            if sys.config.frame_buffer.detect_cfb {
                detect_cpu_frame(sys, origin);
            }

            if sys.config.frame_buffer.copy_to_rdram == CopyMode::Async {
                framebuffer::copy_to_rdram(sys, origin, false);
            }

            if sys.config.frame_buffer.copy_depth_to_rdram {
                depth::copy_to_rdram(sys);
            }

            framebuffer::render_buffer(sys);
            framebuffer::clear_buffers_changed(sys);
        } else {
            let target = framebuffer::current(sys).map(|fb| fb.id);
            let (width, height) = (sys.vi.width, sys.vi.height);
            sys.render.exec(Action::Present {
                target,
                width,
                height,
            });
            sys.rdp.changed.set_color_buffer(false);
        }

        sys.vi.last_origin = origin;
        sys.vi.swap_count = sys.vi.swap_count.wrapping_add(1);
        trace!(swap_count = sys.vi.swap_count, "swapped buffers");
    }

    if sys.config.osd.any() {
        let pal = sys.vi.pal;
        sys.perf.record(Instant::now(), swap, pal);
    }
}

/// Uploads frames the CPU wrote directly into guest memory.
fn detect_cpu_frame(sys: &mut System, origin: u32) {
    let known = framebuffer::find_buffer(sys, origin).map(|fb| (fb.start, fb.cfb));
    match known {
        Some((start, false)) => {
            if !framebuffer::is_valid(sys, start, false) {
                debug!(start = format_args!("{start:#08X}"), "render target overwritten by the cpu");
                framebuffer::copy_from_rdram(sys, start);
            }
        }
        Some((start, true)) => framebuffer::copy_from_rdram(sys, start),
        None => {
            let size = match sys.vi.regs.status.pixel_type() {
                PixelType::Rgba8888 => TexelSize::Bits32,
                _ => TexelSize::Bits16,
            };

            let width = sys.vi.width;
            framebuffer::save_buffer(sys, origin, ImageFormat::Rgba, size, width, true);
        }
    }
}

/// Frame rate counters, averaged over half a second.
#[derive(Debug, Clone, Default)]
pub struct PerfCounters {
    window_start: Option<Instant>,
    frames: u32,
    vis: u32,
    /// Presented frames per second.
    pub fps: f32,
    /// Vertical interrupts per second.
    pub vis_per_second: f32,
    /// Vertical interrupt rate relative to the nominal one, in percent.
    pub percent: f32,
}

impl PerfCounters {
    const WINDOW: Duration = Duration::from_millis(500);

    /// Records a vertical interrupt at `now`.
    pub fn record(&mut self, now: Instant, swapped: bool, pal: bool) {
        let start = *self.window_start.get_or_insert(now);

        self.vis += 1;
        if swapped {
            self.frames += 1;
        }

        let elapsed = now.saturating_duration_since(start);
        if elapsed >= Self::WINDOW {
            let seconds = elapsed.as_secs_f32();
            let nominal = if pal { 50.0 } else { 60.0 };

            self.fps = self.frames as f32 / seconds;
            self.vis_per_second = self.vis as f32 / seconds;
            self.percent = self.vis_per_second / nominal * 100.0;

            self.window_start = Some(now);
            self.frames = 0;
            self.vis = 0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Opal,
        config::Config,
        modules::render::NopRenderModule,
        system::mem::Rdram,
    };

    fn opal() -> Opal {
        Opal::new(Config::default(), Rdram::new(0x10000), Box::new(NopRenderModule))
    }

    fn ntsc_320(sys: &mut System) {
        let regs = &mut sys.vi.regs;
        regs.origin = 0x1000;
        regs.width = 320;
        regs.v_sync = 0x20D;
        regs.h_start = Span::from_bits(0x006C_02EC);
        regs.v_start = Span::from_bits(0x0025_01FF);
        regs.x_scale = Scale::from_bits(0x0200);
        regs.y_scale = Scale::from_bits(0x0400);
    }

    #[test]
    fn ntsc_low_resolution() {
        let mut opal = opal();
        let sys = opal.system_mut();
        ntsc_320(sys);

        update_size(sys);
        assert_eq!(sys.vi.width, 320);
        assert_eq!(sys.vi.height, 237);
        assert!(!sys.vi.pal);
        assert!(!sys.vi.interlaced);
    }

    #[test]
    fn pal_interlaced() {
        let mut opal = opal();
        let sys = opal.system_mut();
        ntsc_320(sys);
        sys.vi.regs.v_sync = 0x271;
        sys.vi.regs.status = Status::default().with_serrate(true);
        sys.vi.regs.x_scale = Scale::from_bits(0x0400);

        update_size(sys);
        assert_eq!(sys.vi.width, 640);
        assert_eq!(sys.vi.height, 474);
        assert!(sys.vi.pal);
        assert!(sys.vi.interlaced);
        assert_eq!(sys.vi.nominal_rate(), 50.0);
    }

    #[test]
    fn zero_scale_falls_back_to_width_register() {
        let mut opal = opal();
        let sys = opal.system_mut();
        ntsc_320(sys);
        sys.vi.regs.x_scale = Scale::default();
        sys.vi.regs.y_scale = Scale::default();

        update_size(sys);
        assert_eq!(sys.vi.width, 320);
        assert_eq!(sys.vi.height, 240);
    }

    #[test]
    fn no_swap_without_origin() {
        let mut opal = opal();
        let sys = opal.system_mut();
        ntsc_320(sys);
        sys.vi.regs.origin = 0;

        update_screen(sys);
        assert_eq!(sys.vi.swap_count, 0);
        assert_eq!(sys.vi.width, 0);
    }

    #[test]
    fn swap_modes() {
        let mut opal = opal();
        let sys = opal.system_mut();
        ntsc_320(sys);

        update_screen(sys);
        update_screen(sys);
        assert_eq!(sys.vi.swap_count, 2);

        sys.config.frame_buffer.swap_mode = SwapMode::OnViOriginChange;
        update_screen(sys);
        assert_eq!(sys.vi.swap_count, 2);
        sys.vi.regs.origin = 0x2000;
        update_screen(sys);
        assert_eq!(sys.vi.swap_count, 3);

        sys.config.frame_buffer.swap_mode = SwapMode::OnColorImageChange;
        update_screen(sys);
        assert_eq!(sys.vi.swap_count, 3);
        sys.framebuffers.color_changed = true;
        update_screen(sys);
        assert_eq!(sys.vi.swap_count, 4);
        assert!(!sys.framebuffers.color_changed);
    }

    #[test]
    fn counters_average_over_the_window() {
        let mut perf = PerfCounters::default();
        let start = Instant::now();

        // 30 interrupts over half a second, every other one presenting a frame
        for i in 0..=30u32 {
            let now = start + Duration::from_micros(500_000 * i as u64 / 30);
            perf.record(now, i % 2 == 0, false);
        }

        assert!((perf.vis_per_second - 62.0).abs() < 0.01);
        assert!((perf.fps - 32.0).abs() < 0.01);
        assert!((perf.percent - 62.0 / 60.0 * 100.0).abs() < 0.01);
    }

    #[test]
    fn counters_stay_idle_when_disabled() {
        let mut opal = opal();
        let sys = opal.system_mut();
        ntsc_320(sys);

        update_screen(sys);
        assert_eq!(sys.perf.fps, 0.0);
        assert!(sys.perf.window_start.is_none());
    }
}
