//! Save states: a flat copy of the pipeline state, without pointers, optionally compressed.
//!
//! A save state is a [`Header`] followed by the bytes of a [`Snapshot`], compressed with zstd
//! when the header says so. Render targets and cached textures are not part of it: they are
//! rebuilt from guest memory as the game keeps drawing.

use bitos::integer::{u2, u3};
use color::Rgba;
use easyerr::{Error, ResultExt};
use tracing::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    System,
    system::{
        drawer,
        gbi::Dialect,
        math::Matrix,
        rdp::{
            FillColor, Image, Key, LoadType, PrimColor, PrimDepth, Scissor, TextureMode, Tile,
            regs::{Combine, ImageFormat, OtherModeH, OtherModeL, RdpChanged, TexelSize},
        },
        rsp::{
            DmaOffsets, Fog, LIGHT_COUNT, Light, LookAt, MATRIX_STACK_LEN, RspChanged, Texture,
            Viewport,
        },
    },
};

pub const MAGIC: [u8; 4] = *b"OPSS";
pub const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("data is not a save state")]
    BadMagic,
    #[error("unsupported save state version {f0}")]
    Version(u32),
    #[error("save state has {f1} bytes, expected {f0}")]
    Size(usize, usize),
    #[error("save state has an invalid {f0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Compression { source: std::io::Error },
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u32,
    pub compressed: u32,
    /// Length of the payload following the header.
    pub len: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlatLight {
    pub rgb: [f32; 3],
    pub xyz: [f32; 3],
    pub i_xyz: [f32; 3],
    pub pos: [f32; 4],
    pub attenuation: [f32; 3],
}

impl From<&Light> for FlatLight {
    fn from(light: &Light) -> Self {
        Self {
            rgb: light.rgb,
            xyz: light.xyz,
            i_xyz: light.i_xyz,
            pos: light.pos,
            attenuation: [light.ca, light.la, light.qa],
        }
    }
}

impl From<&FlatLight> for Light {
    fn from(light: &FlatLight) -> Self {
        Self {
            rgb: light.rgb,
            xyz: light.xyz,
            i_xyz: light.i_xyz,
            pos: light.pos,
            ca: light.attenuation[0],
            la: light.attenuation[1],
            qa: light.attenuation[2],
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlatTile {
    pub format: u32,
    pub size: u32,
    pub line: u32,
    pub tmem: u32,
    pub palette: u32,
    /// Clamp and mirror of s, then of t.
    pub flags: u32,
    pub mask: [u32; 2],
    pub shift: [u32; 2],
    pub coords: [u32; 4],
    pub fcoords: [f32; 4],
    pub load_type: u32,
    pub texture_mode: u32,
    pub frame_buffer: u32,
    pub image_address: u32,
}

impl From<&Tile> for FlatTile {
    fn from(tile: &Tile) -> Self {
        let flags = tile.clamp_s as u32
            | (tile.mirror_s as u32) << 1
            | (tile.clamp_t as u32) << 2
            | (tile.mirror_t as u32) << 3;

        Self {
            format: tile.format as u32,
            size: tile.size as u32,
            line: tile.line as u32,
            tmem: tile.tmem as u32,
            palette: tile.palette as u32,
            flags,
            mask: [tile.mask_s as u32, tile.mask_t as u32],
            shift: [tile.shift_s as u32, tile.shift_t as u32],
            coords: [tile.uls, tile.ult, tile.lrs, tile.lrt].map(u32::from),
            fcoords: [tile.fuls, tile.fult, tile.flrs, tile.flrt],
            load_type: (tile.load_type == LoadType::Block) as u32,
            texture_mode: (tile.texture_mode == TextureMode::FrameBuffer) as u32,
            frame_buffer: tile.frame_buffer,
            image_address: tile.image_address,
        }
    }
}

impl From<&FlatTile> for Tile {
    fn from(tile: &FlatTile) -> Self {
        let [uls, ult, lrs, lrt] = tile.coords.map(|c| c as u16);
        let [fuls, fult, flrs, flrt] = tile.fcoords;

        Self {
            format: format(tile.format),
            size: size(tile.size),
            line: tile.line as u16,
            tmem: tile.tmem as u16,
            palette: tile.palette as u8,
            clamp_s: tile.flags & 1 != 0,
            mirror_s: tile.flags & 2 != 0,
            clamp_t: tile.flags & 4 != 0,
            mirror_t: tile.flags & 8 != 0,
            mask_s: tile.mask[0] as u8,
            mask_t: tile.mask[1] as u8,
            shift_s: tile.shift[0] as u8,
            shift_t: tile.shift[1] as u8,
            uls,
            ult,
            lrs,
            lrt,
            fuls,
            fult,
            flrs,
            flrt,
            load_type: if tile.load_type != 0 {
                LoadType::Block
            } else {
                LoadType::Tile
            },
            texture_mode: if tile.texture_mode != 0 {
                TextureMode::FrameBuffer
            } else {
                TextureMode::Normal
            },
            frame_buffer: tile.frame_buffer,
            image_address: tile.image_address,
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlatImage {
    pub address: u32,
    pub format: u32,
    pub size: u32,
    pub width: u32,
    pub height: u32,
}

impl From<&Image> for FlatImage {
    fn from(image: &Image) -> Self {
        Self {
            address: image.address,
            format: image.format as u32,
            size: image.size as u32,
            width: image.width,
            height: image.height,
        }
    }
}

impl From<&FlatImage> for Image {
    fn from(image: &FlatImage) -> Self {
        Self {
            address: image.address,
            format: format(image.format),
            size: size(image.size),
            width: image.width,
            height: image.height,
        }
    }
}

#[inline(always)]
fn format(raw: u32) -> ImageFormat {
    ImageFormat::from_bits(u3::new((raw & 7) as u8))
}

#[inline(always)]
fn size(raw: u32) -> TexelSize {
    TexelSize::from_bits(u2::new((raw & 3) as u8))
}

#[inline(always)]
fn rgba(c: Rgba) -> [f32; 4] {
    [c.r, c.g, c.b, c.a]
}

#[inline(always)]
fn from_rgba([r, g, b, a]: [f32; 4]) -> Rgba {
    Rgba::new(r, g, b, a)
}

/// The pipeline state, flattened.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Snapshot {
    // rsp
    pub dialect: u32,
    pub segments: [u32; 16],
    pub geometry_mode: u32,
    pub vscale: [f32; 4],
    pub vtrans: [f32; 4],
    /// x, y, width, height, near and far.
    pub viewport: [f32; 6],
    pub texture_scale: [f32; 2],
    /// Level, tile and whether texturing is on.
    pub texture: [u32; 3],
    pub modelview: [Matrix; MATRIX_STACK_LEN],
    pub projection: Matrix,
    pub matrix_index: u32,
    pub stack_size: u32,
    pub billboard: u32,
    pub lights: [FlatLight; LIGHT_COUNT],
    pub num_lights: u32,
    pub lookat: [[f32; 3]; 2],
    pub lookat_enabled: u32,
    pub dma_offsets: [u32; 2],
    pub vertex_color_base: u32,
    pub vertex_normal_base: u32,
    pub coord_mod: [f32; 16],
    pub fog: [f32; 2],
    pub persp_norm: f32,
    pub status: [u32; 4],

    // rdp
    pub other_mode: [u32; 2],
    pub combine: [u32; 2],
    pub tiles: [FlatTile; 8],
    pub load_tile: u32,
    pub color_image: FlatImage,
    pub depth_image: u32,
    pub texture_image: FlatImage,
    pub fill: u32,
    pub prim: [f32; 4],
    pub prim_lod: [f32; 2],
    pub env: [f32; 4],
    pub blend: [f32; 4],
    pub fog_color: [f32; 4],
    pub prim_depth: [f32; 2],
    pub scissor_mode: u32,
    pub scissor: [f32; 4],
    pub convert: [i32; 6],
    pub key: [[f32; 3]; 3],
    pub palette_crc: [u32; 16],
    pub palette_crc256: u32,
    pub tmem: n64tex::Tmem,
}

impl Snapshot {
    pub fn capture(sys: &System) -> Self {
        let rsp = &sys.rsp;
        let rdp = &sys.rdp;
        let vp = &rsp.viewport;
        let combine = rdp.combine.to_bits();

        Self {
            dialect: rsp.dialect as u32,
            segments: rsp.segments,
            geometry_mode: rsp.geometry_mode,
            vscale: vp.vscale,
            vtrans: vp.vtrans,
            viewport: [vp.x, vp.y, vp.width, vp.height, vp.near, vp.far],
            texture_scale: [rsp.texture.scale_s, rsp.texture.scale_t],
            texture: [
                rsp.texture.level as u32,
                rsp.texture.tile as u32,
                rsp.texture.on as u32,
            ],
            modelview: *rsp.matrix.modelview,
            projection: rsp.matrix.projection,
            matrix_index: rsp.matrix.index as u32,
            stack_size: rsp.matrix.stack_size as u32,
            billboard: rsp.matrix.billboard as u32,
            lights: rsp.lights.each_ref().map(FlatLight::from),
            num_lights: rsp.num_lights as u32,
            lookat: rsp.lookat.xyz,
            lookat_enabled: rsp.lookat.enabled as u32,
            dma_offsets: [rsp.dma.matrix, rsp.dma.vertex],
            vertex_color_base: rsp.vertex_color_base,
            vertex_normal_base: rsp.vertex_normal_base,
            coord_mod: rsp.coord_mod,
            fog: [rsp.fog.multiplier, rsp.fog.offset],
            persp_norm: rsp.persp_norm,
            status: rsp.status,

            other_mode: [rdp.other_mode_h.to_bits(), rdp.other_mode_l.to_bits()],
            combine: [(combine >> 32) as u32, combine as u32],
            tiles: rdp.tiles.each_ref().map(FlatTile::from),
            load_tile: rdp.load_tile as u32,
            color_image: FlatImage::from(&rdp.color_image),
            depth_image: rdp.depth_image,
            texture_image: FlatImage::from(&rdp.texture_image),
            fill: rdp.fill.raw,
            prim: rgba(rdp.prim.color),
            prim_lod: [rdp.prim.m, rdp.prim.l],
            env: rgba(rdp.env),
            blend: rgba(rdp.blend),
            fog_color: rgba(rdp.fog),
            prim_depth: [rdp.prim_depth.z, rdp.prim_depth.dz],
            scissor_mode: rdp.scissor.mode as u32,
            scissor: [
                rdp.scissor.ulx,
                rdp.scissor.uly,
                rdp.scissor.lrx,
                rdp.scissor.lry,
            ],
            convert: rdp.convert,
            key: [rdp.key.center, rdp.key.scale, rdp.key.width],
            palette_crc: rdp.palette_crc,
            palette_crc256: rdp.palette_crc256,
            tmem: *rdp.tmem,
        }
    }

    /// Writes this snapshot into the pipeline state. Derived state is rebuilt lazily.
    pub fn apply(&self, sys: &mut System) -> Result<(), SnapshotError> {
        let dialect = u8::try_from(self.dialect)
            .ok()
            .and_then(Dialect::from_repr)
            .ok_or(SnapshotError::Invalid("dialect"))?;

        // a push writes one slot above the stack size
        let stack_size = self.stack_size as usize;
        if !(1..MATRIX_STACK_LEN).contains(&stack_size) {
            return Err(SnapshotError::Invalid("matrix stack size"));
        }

        if self.matrix_index > self.stack_size {
            return Err(SnapshotError::Invalid("matrix index"));
        }

        if self.num_lights as usize >= LIGHT_COUNT {
            return Err(SnapshotError::Invalid("light count"));
        }

        let rsp = &mut sys.rsp;
        rsp.dialect = dialect;
        rsp.segments = self.segments;
        rsp.geometry_mode = self.geometry_mode;

        let [x, y, width, height, near, far] = self.viewport;
        rsp.viewport = Viewport {
            vscale: self.vscale,
            vtrans: self.vtrans,
            x,
            y,
            width,
            height,
            near,
            far,
        };

        rsp.texture = Texture {
            scale_s: self.texture_scale[0],
            scale_t: self.texture_scale[1],
            level: self.texture[0] as u8,
            tile: (self.texture[1] & 7) as u8,
            on: self.texture[2] != 0,
        };

        *rsp.matrix.modelview = self.modelview;
        rsp.matrix.projection = self.projection;
        rsp.matrix.index = self.matrix_index as usize;
        rsp.matrix.stack_size = stack_size;
        rsp.matrix.billboard = self.billboard != 0;

        rsp.lights = self.lights.each_ref().map(Light::from);
        rsp.num_lights = self.num_lights as usize;
        rsp.lookat = LookAt {
            xyz: self.lookat,
            i_xyz: self.lookat,
            enabled: self.lookat_enabled != 0,
        };

        rsp.dma = DmaOffsets {
            matrix: self.dma_offsets[0],
            vertex: self.dma_offsets[1],
        };
        rsp.vertex_color_base = self.vertex_color_base;
        rsp.vertex_normal_base = self.vertex_normal_base;
        rsp.coord_mod = self.coord_mod;
        rsp.fog = Fog {
            multiplier: self.fog[0],
            offset: self.fog[1],
        };
        rsp.persp_norm = self.persp_norm;
        rsp.status = self.status;
        rsp.changed = RspChanged::from_bits(u32::MAX);

        let rdp = &mut sys.rdp;
        rdp.other_mode_h = OtherModeH::from_bits(self.other_mode[0]);
        rdp.other_mode_l = OtherModeL::from_bits(self.other_mode[1]);
        rdp.combine = Combine::from_bits(((self.combine[0] as u64) << 32) | self.combine[1] as u64);
        rdp.tiles = self.tiles.each_ref().map(Tile::from);
        rdp.load_tile = (self.load_tile & 7) as usize;
        rdp.color_image = Image::from(&self.color_image);
        rdp.depth_image = self.depth_image;
        rdp.texture_image = Image::from(&self.texture_image);
        rdp.fill = FillColor {
            raw: self.fill,
            z: ((self.fill >> 2) & 0x3FFF) as f32,
            dz: (self.fill & 3) as f32,
        };
        rdp.prim = PrimColor {
            color: from_rgba(self.prim),
            m: self.prim_lod[0],
            l: self.prim_lod[1],
        };
        rdp.env = from_rgba(self.env);
        rdp.blend = from_rgba(self.blend);
        rdp.fog = from_rgba(self.fog_color);
        rdp.prim_depth = PrimDepth {
            z: self.prim_depth[0],
            dz: self.prim_depth[1],
        };

        let [ulx, uly, lrx, lry] = self.scissor;
        rdp.scissor = Scissor {
            mode: self.scissor_mode as u8,
            ulx,
            uly,
            lrx,
            lry,
        };
        rdp.convert = self.convert;
        rdp.key = Key {
            center: self.key[0],
            scale: self.key[1],
            width: self.key[2],
        };
        rdp.palette_crc = self.palette_crc;
        rdp.palette_crc256 = self.palette_crc256;
        *rdp.tmem = self.tmem;
        rdp.changed = RdpChanged::from_bits(u32::MAX);

        Ok(())
    }
}

/// Saves the pipeline state.
pub fn save(sys: &System) -> Result<Vec<u8>, SnapshotError> {
    let snapshot = Snapshot::capture(sys);
    let config = &sys.config.snapshot;

    let payload = if config.compress {
        zstd::bulk::compress(snapshot.as_bytes(), config.level).context(SnapshotCtx::Compression)?
    } else {
        snapshot.as_bytes().to_vec()
    };

    let header = Header {
        magic: MAGIC,
        version: VERSION,
        compressed: config.compress as u32,
        len: payload.len() as u32,
    };

    let mut out = Vec::with_capacity(size_of::<Header>() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&payload);

    debug!(len = out.len(), compressed = config.compress, "saved state");
    Ok(out)
}

/// Restores a state produced by [`save`]. The pipeline state is untouched on error.
pub fn restore(sys: &mut System, data: &[u8]) -> Result<(), SnapshotError> {
    let Ok((header, rest)) = Header::read_from_prefix(data) else {
        return Err(SnapshotError::Size(size_of::<Header>(), data.len()));
    };

    if header.magic != MAGIC {
        return Err(SnapshotError::BadMagic);
    }

    if header.version != VERSION {
        return Err(SnapshotError::Version(header.version));
    }

    let payload = rest
        .get(..header.len as usize)
        .ok_or(SnapshotError::Size(header.len as usize, rest.len()))?;

    let expected = size_of::<Snapshot>();
    let decompressed;
    let bytes = if header.compressed != 0 {
        decompressed = zstd::bulk::decompress(payload, expected).context(SnapshotCtx::Compression)?;
        decompressed.as_slice()
    } else {
        payload
    };

    let snapshot = Snapshot::read_from_bytes(bytes).map_err(|_| SnapshotError::Size(expected, bytes.len()))?;

    // pending draws belong to the state being replaced
    drawer::flush(sys);
    snapshot.apply(sys)?;

    debug!(len = data.len(), "restored state");
    Ok(())
}
