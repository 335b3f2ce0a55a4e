//! Cache of decoded TMEM textures, keyed by a fingerprint of their contents.

use std::collections::HashMap;

use color::Rgba8;
use n64tex::{
    ColorIndexed4, ColorIndexed8, HIGH_HALF, Intensity4, Intensity8, IntensityAlpha4,
    IntensityAlpha8, IntensityAlpha16, IntensityAlpha16Lut, Layout, Rgba16, Rgba16Lut, Rgba32,
    TMEM_LEN, Tmem,
};
use rustc_hash::FxBuildHasher;
use tracing::{debug, trace};
use zerocopy::IntoBytes;

use crate::{
    System,
    modules::render::{Action, TextureBinding, TextureId, TextureSource},
    system::{
        framebuffer,
        rdp::{
            Tile, TextureMode,
            regs::{ImageFormat, TexelSize, TextureFilter, TextureLut},
            tmem::LOAD_INFO_LEN,
        },
        rsp::obj::BgImage,
    },
};

/// Largest texture dimension a tile can describe.
const MAX_EXTENT: u32 = 1024;

#[derive(Debug, Clone)]
pub struct CachedTexture {
    pub id: TextureId,
    pub crc: u32,
    /// Dimensions of the decoded image.
    pub width: u32,
    pub height: u32,
    /// Dimensions of the area the tile covers.
    pub real_width: u32,
    pub real_height: u32,
    pub format: ImageFormat,
    pub size: TexelSize,
    pub mask_s: u8,
    pub mask_t: u8,
    pub mirror_s: bool,
    pub mirror_t: bool,
    pub clamp_s: bool,
    pub clamp_t: bool,
    /// Size of the decoded image.
    pub bytes: usize,
    pub last_used: u64,
}

#[derive(Debug, Default)]
pub struct TextureCache {
    entries: HashMap<u32, CachedTexture, FxBuildHasher>,
    next_id: u32,
    tick: u64,
    /// Fingerprints of the textures bound to each unit.
    bound: [Option<u32>; 2],
}

impl TextureCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, crc: u32) -> Option<&CachedTexture> {
        self.entries.get(&crc)
    }

    /// Fingerprint of the texture bound to `unit`.
    pub fn bound(&self, unit: usize) -> Option<u32> {
        self.bound.get(unit).copied().flatten()
    }

    /// Reserves a texture id.
    pub fn allocate_id(&mut self) -> TextureId {
        let id = TextureId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Total size of the decoded textures.
    pub fn bytes(&self) -> usize {
        self.entries.values().map(|t| t.bytes).sum()
    }
}

/// Dimensions of a tile: the decoded size and the covered size.
fn dimensions(sys: &System, tile: &Tile) -> ((u32, u32), (u32, u32)) {
    let info = sys.rdp.load_info[tile.tmem as usize % LOAD_INFO_LEN];

    let extent_s = if tile.lrs >= tile.uls {
        (tile.lrs - tile.uls) as u32 + 1
    } else {
        (info.width as u32).max(1)
    };
    let extent_t = if tile.lrt >= tile.ult {
        (tile.lrt - tile.ult) as u32 + 1
    } else {
        (info.height as u32).max(1)
    };

    let masked = |mask: u8, extent: u32, clamp: bool| {
        let size = 1u32 << mask.min(10);
        if mask > 0 && (size <= extent || !clamp) {
            size
        } else {
            extent
        }
    };

    let mut width = masked(tile.mask_s, extent_s, tile.clamp_s).clamp(1, MAX_EXTENT);
    let mut height = masked(tile.mask_t, extent_t, tile.clamp_t).clamp(1, MAX_EXTENT);

    // wider rows than a line holds wrap into the next line
    let line_bytes = (tile.line as u32) * 8;
    if line_bytes > 0 {
        let line_texels = line_bytes * 8 / tile.size.bits();
        width = width.min(line_texels.max(1));

        // the area a tile can address, 32-bit and palette textures only use half of TMEM
        let half = tile.size == TexelSize::Bits32 || sys.rdp.other_mode_h.texture_lut() != TextureLut::None;
        let area = (if half { HIGH_HALF } else { TMEM_LEN }) as u32;
        let available = area.saturating_sub(tile.tmem as u32 * 8).max(line_bytes);
        height = height.min(available / line_bytes);
    }

    ((width, height.max(1)), (extent_s.min(MAX_EXTENT), extent_t.min(MAX_EXTENT)))
}

fn layout(tile: &Tile, width: u32, height: u32) -> Layout {
    let stride = if tile.line == 0 {
        (width * tile.size.bits()).div_ceil(64) as usize * 8
    } else {
        tile.line as usize * 8
    };

    Layout {
        base: tile.tmem as usize * 8,
        stride,
        width: width as usize,
        height: height as usize,
        palette: tile.palette,
    }
}

/// Decodes the texels a tile describes from `tmem`.
fn decode(sys: &System, tmem: &Tmem, tile: &Tile, layout: &Layout) -> Vec<Rgba8> {
    let lut = sys.rdp.other_mode_h.texture_lut();
    let indexed = tile.format == ImageFormat::ColorIndexed
        || (lut != TextureLut::None && matches!(tile.size, TexelSize::Bits4 | TexelSize::Bits8));

    match (tile.format, tile.size) {
        (_, TexelSize::Bits4) if indexed => match lut {
            TextureLut::Ia16 => n64tex::decode::<ColorIndexed4<IntensityAlpha16Lut>>(tmem, layout),
            TextureLut::None => n64tex::decode::<Intensity4>(tmem, layout),
            _ => n64tex::decode::<ColorIndexed4<Rgba16Lut>>(tmem, layout),
        },
        (_, TexelSize::Bits8) if indexed => match lut {
            TextureLut::Ia16 => n64tex::decode::<ColorIndexed8<IntensityAlpha16Lut>>(tmem, layout),
            TextureLut::None => n64tex::decode::<Intensity8>(tmem, layout),
            _ => n64tex::decode::<ColorIndexed8<Rgba16Lut>>(tmem, layout),
        },
        (ImageFormat::Rgba, TexelSize::Bits16) => n64tex::decode::<Rgba16>(tmem, layout),
        (ImageFormat::Rgba, TexelSize::Bits32) => n64tex::decode::<Rgba32>(tmem, layout),
        (ImageFormat::IntensityAlpha, TexelSize::Bits4) => n64tex::decode::<IntensityAlpha4>(tmem, layout),
        (ImageFormat::IntensityAlpha, TexelSize::Bits8) => n64tex::decode::<IntensityAlpha8>(tmem, layout),
        (ImageFormat::IntensityAlpha, TexelSize::Bits16) => n64tex::decode::<IntensityAlpha16>(tmem, layout),
        (ImageFormat::Intensity, TexelSize::Bits4) => n64tex::decode::<Intensity4>(tmem, layout),
        (ImageFormat::Intensity, TexelSize::Bits8) => n64tex::decode::<Intensity8>(tmem, layout),
        (format, size) => {
            debug!(?format, ?size, "unsupported texture format, decoding as rgba16");
            n64tex::decode::<Rgba16>(tmem, layout)
        }
    }
}

/// Dimensions of a background image.
fn bg_dimensions(bg: &BgImage) -> (u32, u32) {
    (bg.width.clamp(1, MAX_EXTENT), bg.height.clamp(1, MAX_EXTENT))
}

/// Decodes a background image straight from RDRAM. Rows are staged into a TMEM shaped buffer a
/// strip at a time, sharing the palette of the real TMEM.
fn decode_bg(sys: &System, tile: &Tile, bg: &BgImage) -> Vec<Rgba8> {
    let (width, height) = bg_dimensions(bg);
    let (width, height) = (width as usize, height as usize);
    let source_stride = bg.stride();
    let mut pixels = Vec::with_capacity(width * height);

    if tile.size == TexelSize::Bits32 {
        for y in 0..height {
            let row = sys
                .mem
                .slice((bg.address as usize + y * source_stride) as u32, width * 4)
                .unwrap_or(&[]);
            pixels.extend((0..width).map(|x| match row.get(x * 4..x * 4 + 4) {
                Some(&[r, g, b, a]) => Rgba8::new(r, g, b, a),
                _ => Rgba8::default(),
            }));
        }

        return pixels;
    }

    let row_len = (width * tile.size.bits() as usize).div_ceil(8).min(source_stride);
    let stride = row_len.div_ceil(8).max(1) * 8;
    let rows = (HIGH_HALF / stride).max(1);

    let mut strip: Box<Tmem> = util::boxed_array(0);
    strip[HIGH_HALF..].copy_from_slice(&sys.rdp.tmem[HIGH_HALF..]);

    for first in (0..height).step_by(rows) {
        let count = rows.min(height - first);
        strip[..HIGH_HALF].fill(0);

        for y in 0..count {
            let address = bg.address as usize + (first + y) * source_stride;
            let Ok(bytes) = sys.mem.slice(address as u32, row_len) else {
                continue;
            };

            let row = &mut strip[y * stride..(y + 1) * stride];
            row[..row_len].copy_from_slice(bytes);
            if y & 1 == 1 {
                for word in row.chunks_exact_mut(8) {
                    word.rotate_left(4);
                }
            }
        }

        let layout = Layout {
            base: 0,
            stride,
            width,
            height: count,
            palette: tile.palette,
        };
        pixels.extend(decode(sys, &strip, tile, &layout));
    }

    pixels
}

/// Fingerprint of the RDRAM rows of a background image.
fn bg_contents(sys: &System, bg: &BgImage) -> u32 {
    let (_, height) = bg_dimensions(bg);
    let stride = bg.stride();
    let len = stride * height as usize;

    match sys.mem.slice(bg.address, len) {
        Ok(bytes) => sys.hasher.hash(0xFFFF_FFFF, bytes),
        Err(_) => {
            let end = sys.mem.len().min(bg.address as usize + len);
            let start = (bg.address as usize).min(end);
            sys.hasher.hash(0xFFFF_FFFF, &sys.mem.ram()[start..end])
        }
    }
}

/// Fingerprint of the TMEM area, palette and parameters of a tile.
fn fingerprint(sys: &System, tile: &Tile, layout: &Layout, width: u32, height: u32) -> u32 {
    let mut crc = if tile.texture_mode == TextureMode::BgImage {
        bg_contents(sys, &sys.rsp.obj.bg)
    } else {
        let start = layout.base.min(TMEM_LEN);
        let end = (layout.base + layout.stride * layout.height).min(TMEM_LEN);
        sys.hasher.hash(0xFFFF_FFFF, &sys.rdp.tmem[start..end])
    };

    let lut = sys.rdp.other_mode_h.texture_lut();
    if lut != TextureLut::None {
        crc ^= match tile.size {
            TexelSize::Bits4 => sys.rdp.palette_crc[tile.palette as usize & 0xF],
            _ => sys.rdp.palette_crc256,
        };
    }

    let params = [
        width,
        height,
        tile.format as u32,
        tile.size as u32,
        lut as u32,
        tile.mask_s as u32 | (tile.mask_t as u32) << 8,
        tile.clamp_s as u32 | (tile.clamp_t as u32) << 1 | (tile.mirror_s as u32) << 2 | (tile.mirror_t as u32) << 3,
        tile.texture_mode as u32,
    ];

    sys.hasher.hash(crc, params.as_bytes())
}

fn binding(sys: &System, source: TextureSource, width: u32, height: u32, tile: &Tile) -> TextureBinding {
    let filter = sys.rdp.other_mode_h.texture_filter();
    TextureBinding {
        source,
        width,
        height,
        clamp_s: tile.clamp_s,
        clamp_t: tile.clamp_t,
        mirror_s: tile.mirror_s,
        mirror_t: tile.mirror_t,
        mask_s: tile.mask_s,
        mask_t: tile.mask_t,
        bilinear: sys.config.texture.bilinear && filter != TextureFilter::Point,
    }
}

/// Evicts the least recently used texture that is not bound.
fn evict(sys: &mut System) {
    let cache = &mut sys.textures;
    let victim = cache
        .entries
        .values()
        .filter(|t| !cache.bound.contains(&Some(t.crc)))
        .min_by_key(|t| t.last_used)
        .map(|t| t.crc);

    if let Some(texture) = victim.and_then(|crc| cache.entries.remove(&crc)) {
        sys.render.exec(Action::DeleteTexture(texture.id));
        trace!(crc = format_args!("{:08X}", texture.crc), "evicted texture");
    }
}

/// Binds the texture tile `tile_index` describes to texture unit `unit`, decoding and uploading
/// it when it is not cached.
pub fn bind(sys: &mut System, unit: usize, tile_index: usize) -> Option<TextureBinding> {
    let unit = unit.min(1);
    let tile = sys.rdp.tiles[tile_index & 7];

    if tile.texture_mode == TextureMode::FrameBuffer
        && let Some(fb) = framebuffer::find_buffer(sys, tile.frame_buffer)
    {
        let binding = binding(sys, TextureSource::Target(fb.id), fb.width, fb.height, &tile);
        sys.textures.bound[unit] = None;
        return Some(binding);
    }

    let bg = tile.texture_mode == TextureMode::BgImage;
    let ((width, height), (real_width, real_height)) = if bg {
        let size = bg_dimensions(&sys.rsp.obj.bg);
        (size, size)
    } else {
        dimensions(sys, &tile)
    };
    let layout = layout(&tile, width, height);
    let crc = fingerprint(sys, &tile, &layout, width, height);

    sys.textures.tick += 1;
    let tick = sys.textures.tick;

    if let Some(texture) = sys.textures.entries.get_mut(&crc) {
        texture.last_used = tick;
        let id = texture.id;
        sys.textures.bound[unit] = Some(crc);
        return Some(binding(sys, TextureSource::Cached(id), width, height, &tile));
    }

    let max = sys.config.texture.max_cached.max(1);
    while sys.textures.entries.len() >= max {
        let before = sys.textures.entries.len();
        evict(sys);
        if sys.textures.entries.len() == before {
            break;
        }
    }

    let data = if bg {
        decode_bg(sys, &tile, &sys.rsp.obj.bg)
    } else {
        decode(sys, &sys.rdp.tmem, &tile, &layout)
    };
    let id = sys.textures.allocate_id();

    sys.textures.entries.insert(
        crc,
        CachedTexture {
            id,
            crc,
            width,
            height,
            real_width,
            real_height,
            format: tile.format,
            size: tile.size,
            mask_s: tile.mask_s,
            mask_t: tile.mask_t,
            mirror_s: tile.mirror_s,
            mirror_t: tile.mirror_t,
            clamp_s: tile.clamp_s,
            clamp_t: tile.clamp_t,
            bytes: data.len() * size_of::<Rgba8>(),
            last_used: tick,
        },
    );
    sys.textures.bound[unit] = Some(crc);

    sys.render.exec(Action::UploadTexture {
        id,
        width,
        height,
        data,
    });

    trace!(crc = format_args!("{crc:08X}"), width, height, format = ?tile.format, size = ?tile.size, "cached texture");
    Some(binding(sys, TextureSource::Cached(id), width, height, &tile))
}

/// Releases every cached texture.
pub fn clear(sys: &mut System) {
    for (_, texture) in sys.textures.entries.drain() {
        sys.render.exec(Action::DeleteTexture(texture.id));
    }
    sys.textures.bound = [None; 2];
}
