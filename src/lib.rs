pub mod callbacks;
pub mod capture;
pub mod channel;
pub mod display;
pub mod driver;
pub mod error;
pub mod hwi;
pub mod mem;
pub mod pipeline;
pub mod postproc;
pub mod registry;
pub mod state_machine;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use error::{HalError, HalResult, Status};
pub use hwi::Camera;
pub use registry::CameraRegistry;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<HalConfig>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(HalConfig::default()));

/// HAL configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalConfig {
    pub camera: CameraConfig,
    pub postproc: PostprocConfig,
    pub state_machine: StateMachineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Sensor frame rate of the simulated driver
    pub fps: u32,
    pub preview_size: String,
    pub picture_size: String,
    pub video_size: String,
    pub preview_buffers: usize,
    pub video_buffers: usize,
    pub snapshot_buffers: usize,
    pub metadata_buffers: usize,
    /// Matched sets kept for zero-shutter-lag capture
    pub zsl_depth: usize,
    /// Streams allowed in one channel
    pub bundle_cap: usize,
    /// Buffers the display keeps for itself
    pub min_undequeued: usize,
    /// Stride alignment in bytes
    pub padding: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostprocConfig {
    pub jpeg_quality: u8,
    pub thumbnail_quality: u8,
    /// Send snapshots through the reprocess channel before encode
    pub reprocess: bool,
    pub encoder_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateMachineConfig {
    /// Restart-requiring parameter changes during recording restart the
    /// pipeline instead of being rejected
    pub allow_restart_while_recording: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                fps: 30,
                preview_size: "640x480".into(),
                picture_size: "1280x720".into(),
                video_size: "640x480".into(),
                preview_buffers: 6,
                video_buffers: 8,
                snapshot_buffers: 2,
                metadata_buffers: 6,
                zsl_depth: 2,
                bundle_cap: 4,
                min_undequeued: 2,
                padding: 32,
            },
            postproc: PostprocConfig {
                jpeg_quality: 85,
                thumbnail_quality: 75,
                reprocess: false,
                encoder_workers: 1,
            },
            state_machine: StateMachineConfig::default(),
            logging: LoggingConfig {
                filter: "camhal=debug".into(),
            },
        }
    }
}

impl HalConfig {
    /// Defaults, then `path` (TOML) if given, then `CAMHAL__SECTION__KEY` variables.
    pub fn load(path: Option<&Path>) -> HalResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&HalConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix("CAMHAL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: HalConfig = cfg.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> HalResult<()> {
        use capture::frame::Dimension;
        for (key, size) in [
            ("preview_size", &self.camera.preview_size),
            ("picture_size", &self.camera.picture_size),
            ("video_size", &self.camera.video_size),
        ] {
            if Dimension::parse(size).is_none() {
                return Err(HalError::Config(format!("camera.{key}: bad size {size:?}")));
            }
        }
        if !(1..=100).contains(&self.postproc.jpeg_quality) {
            return Err(HalError::Config("postproc.jpeg_quality must be 1..=100".into()));
        }
        if self.camera.zsl_depth == 0 || self.camera.bundle_cap == 0 {
            return Err(HalError::Config("camera.zsl_depth and camera.bundle_cap must be positive".into()));
        }
        Ok(())
    }
}
