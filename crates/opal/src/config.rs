//! Configuration of the pipeline core.

use std::path::Path;

use easyerr::{Error, ResultExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io { source: std::io::Error },
    #[error(transparent)]
    Decode {
        source: ciborium::de::Error<std::io::Error>,
    },
    #[error(transparent)]
    Encode {
        source: ciborium::ser::Error<std::io::Error>,
    },
}

/// Which implementation of the numeric kernel to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MathBackend {
    /// Vector kernel when the host supports it, scalar otherwise.
    #[default]
    Auto,
    Scalar,
    Vector,
}

/// Which implementation of the fingerprint hash to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashBackend {
    /// Hardware CRC32C when available, table driven CRC32 otherwise.
    #[default]
    Auto,
    Table,
    Hardware,
    Xxh3,
}

/// When render targets are written back into guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CopyMode {
    Disabled,
    #[default]
    Sync,
    Async,
}

/// When the current frame is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwapMode {
    #[default]
    OnVerticalInterrupt,
    OnViOriginChange,
    OnColorImageChange,
}

/// Adjustment applied to texture rectangle coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TexrectCorrection {
    Off,
    /// Snap edges that almost touch the previous rectangle.
    #[default]
    Smart,
    /// Grow every rectangle by a quarter pixel.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Aspect {
    #[default]
    Stretch,
    /// Keep 4:3 content at its original aspect, scaling horizontally.
    Adjust,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub window_width: u32,
    pub window_height: u32,
    pub multisampling: u8,
    pub aspect: Aspect,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            window_width: 640,
            window_height: 480,
            multisampling: 0,
            aspect: Aspect::Stretch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameBufferConfig {
    /// Emulate render targets at all. When disabled, a single screen sized target is used.
    pub enable: bool,
    pub copy_to_rdram: CopyMode,
    pub copy_aux_to_rdram: bool,
    pub copy_depth_to_rdram: bool,
    pub copy_from_rdram: bool,
    /// Detect frames written directly by the CPU.
    pub detect_cfb: bool,
    /// Render at a multiple of the native resolution. Zero follows the window size.
    pub native_res_factor: u32,
    pub swap_mode: SwapMode,
    pub n64_depth_compare: bool,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            enable: true,
            copy_to_rdram: CopyMode::Sync,
            copy_aux_to_rdram: false,
            copy_depth_to_rdram: false,
            copy_from_rdram: false,
            detect_cfb: false,
            native_res_factor: 0,
            swap_mode: SwapMode::OnVerticalInterrupt,
            n64_depth_compare: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulationConfig {
    /// Merge runs of adjacent texture rectangles into one draw.
    pub batch_texrects: bool,
    pub texrect_correction: TexrectCorrection,
    /// Light vertices on the renderer instead of the core.
    pub hardware_lighting: bool,
    pub noise: bool,
    /// Halt display lists that branch to themselves.
    pub detect_self_branch: bool,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            batch_texrects: true,
            texrect_correction: TexrectCorrection::Smart,
            hardware_lighting: false,
            noise: true,
            detect_self_branch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureConfig {
    /// Maximum number of cached textures.
    pub max_cached: usize,
    pub bilinear: bool,
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self {
            max_cached: 1500,
            bilinear: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OsdConfig {
    pub fps: bool,
    pub vis: bool,
    pub percent: bool,
}

impl OsdConfig {
    /// Whether any counter has to be tracked.
    pub fn any(&self) -> bool {
        self.fps || self.vis || self.percent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub math: MathBackend,
    pub hash: HashBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub compress: bool,
    pub level: i32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            compress: true,
            level: 3,
        }
    }
}

/// Configuration of the pipeline core. The core only ever reads it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub frame_buffer: FrameBufferConfig,
    pub emulation: EmulationConfig,
    pub texture: TextureConfig,
    pub osd: OsdConfig,
    pub backends: BackendConfig,
    pub snapshot: SnapshotConfig,
}

impl Config {
    /// Reads a CBOR encoded configuration.
    pub fn read(reader: impl std::io::Read) -> Result<Self, ConfigError> {
        ciborium::from_reader(reader).context(ConfigCtx::Decode)
    }

    /// Writes this configuration as CBOR.
    pub fn write(&self, writer: impl std::io::Write) -> Result<(), ConfigError> {
        ciborium::into_writer(self, writer).context(ConfigCtx::Encode)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).context(ConfigCtx::Io)?;
        Self::read(std::io::BufReader::new(file))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let file = std::fs::File::create(path).context(ConfigCtx::Io)?;
        self.write(std::io::BufWriter::new(file))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opal.cbor");

        let mut config = Config::default();
        config.frame_buffer.swap_mode = SwapMode::OnColorImageChange;
        config.backends.hash = HashBackend::Xxh3;
        config.osd.fps = true;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_fields_use_defaults() {
        #[derive(Serialize)]
        struct Partial {
            osd: OsdConfig,
        }

        let mut bytes = Vec::new();
        ciborium::into_writer(
            &Partial {
                osd: OsdConfig {
                    vis: true,
                    ..Default::default()
                },
            },
            &mut bytes,
        )
        .unwrap();

        let config = Config::read(bytes.as_slice()).unwrap();
        assert!(config.osd.vis);
        assert_eq!(config.frame_buffer, FrameBufferConfig::default());
    }
}
