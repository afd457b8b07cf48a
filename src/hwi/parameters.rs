//! Framework parameter set: `key=value;` strings with typed views.

use std::collections::BTreeMap;

use crate::capture::frame::{Dimension, PixelFormat};
use crate::driver::Capabilities;
use crate::error::{HalError, HalResult};
use crate::{CameraConfig, PostprocConfig};

pub const KEY_PREVIEW_SIZE: &str = "preview-size";
pub const KEY_PREVIEW_FORMAT: &str = "preview-format";
pub const KEY_PICTURE_SIZE: &str = "picture-size";
pub const KEY_PICTURE_FORMAT: &str = "picture-format";
pub const KEY_VIDEO_SIZE: &str = "video-size";
pub const KEY_JPEG_QUALITY: &str = "jpeg-quality";
pub const KEY_THUMBNAIL_SIZE: &str = "jpeg-thumbnail-size";
pub const KEY_THUMBNAIL_QUALITY: &str = "jpeg-thumbnail-quality";
pub const KEY_ROTATION: &str = "rotation";
pub const KEY_ZOOM: &str = "zoom";
pub const KEY_ZSL: &str = "zsl";
pub const KEY_RECORDING_HINT: &str = "recording-hint";
pub const KEY_NUM_SNAPSHOTS: &str = "num-snaps-per-shutter";
pub const KEY_FOCUS_MODE: &str = "focus-mode";

/// Keys whose change needs the preview torn down and rebuilt
pub const RESTART_KEYS: [&str; 5] = [
    KEY_PREVIEW_SIZE,
    KEY_PREVIEW_FORMAT,
    KEY_VIDEO_SIZE,
    KEY_ZSL,
    KEY_RECORDING_HINT,
];

/// Advertised by the HAL; framework writes to these are ignored
const READ_ONLY_KEYS: [&str; 6] = [
    "preview-size-values",
    "picture-size-values",
    "video-size-values",
    "preview-format-values",
    "max-zoom",
    "max-num-detected-faces-hw",
];

pub const MAX_SNAPSHOTS_PER_SHUTTER: u32 = 8;

const FOCUS_MODES: [&str; 4] = ["auto", "fixed", "infinity", "continuous-picture"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureFormat {
    Jpeg,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Parameters {
    map: BTreeMap<String, String>,
}

fn join_sizes(sizes: &[Dimension]) -> String {
    sizes.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")
}

fn bad(key: &str, value: &str) -> HalError {
    HalError::BadValue(format!("{key}={value}"))
}

impl Parameters {
    /// Parse `k1=v1;k2=v2`. Empty segments are skipped.
    pub fn unflatten(s: &str) -> HalResult<Self> {
        let mut map = BTreeMap::new();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| HalError::BadValue(format!("malformed parameter {part:?}")))?;
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
        Ok(Self { map })
    }

    pub fn flatten(&self) -> String {
        self.map
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Initial set from configuration. Fails when the configured sizes are not supported.
    pub fn defaults(
        caps: &Capabilities,
        camera: &CameraConfig,
        postproc: &PostprocConfig,
    ) -> HalResult<Self> {
        let mut p = Self::default();
        p.set(KEY_PREVIEW_SIZE, &camera.preview_size);
        p.set(
            KEY_PREVIEW_FORMAT,
            caps.preview_formats
                .first()
                .copied()
                .unwrap_or(PixelFormat::Nv21)
                .as_param(),
        );
        p.set(KEY_PICTURE_SIZE, &camera.picture_size);
        p.set(KEY_PICTURE_FORMAT, "jpeg");
        p.set(KEY_VIDEO_SIZE, &camera.video_size);
        p.set(KEY_JPEG_QUALITY, &postproc.jpeg_quality.to_string());
        p.set(KEY_THUMBNAIL_SIZE, "320x240");
        p.set(KEY_THUMBNAIL_QUALITY, &postproc.thumbnail_quality.to_string());
        p.set(KEY_ROTATION, "0");
        p.set(KEY_ZOOM, "0");
        p.set(KEY_ZSL, "off");
        p.set(KEY_RECORDING_HINT, "false");
        p.set(KEY_NUM_SNAPSHOTS, "1");
        p.set(
            KEY_FOCUS_MODE,
            if caps.supports_auto_focus { "auto" } else { "fixed" },
        );

        p.set("preview-size-values", &join_sizes(&caps.preview_sizes));
        p.set("picture-size-values", &join_sizes(&caps.picture_sizes));
        p.set("video-size-values", &join_sizes(&caps.video_sizes));
        let formats: Vec<&str> = caps.preview_formats.iter().map(|f| f.as_param()).collect();
        p.set("preview-format-values", &formats.join(","));
        p.set("max-zoom", &caps.max_zoom.to_string());
        p.set("max-num-detected-faces-hw", &caps.max_num_faces.to_string());
        p.validate(caps)?;
        Ok(p)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    fn size(&self, key: &str) -> Dimension {
        self.get(key).and_then(Dimension::parse).unwrap_or_default()
    }

    fn number(&self, key: &str) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("on" | "true"))
    }

    pub fn preview_size(&self) -> Dimension {
        self.size(KEY_PREVIEW_SIZE)
    }

    pub fn preview_format(&self) -> PixelFormat {
        self.get(KEY_PREVIEW_FORMAT)
            .and_then(PixelFormat::from_param)
            .unwrap_or(PixelFormat::Nv21)
    }

    pub fn picture_size(&self) -> Dimension {
        self.size(KEY_PICTURE_SIZE)
    }

    pub fn picture_format(&self) -> PictureFormat {
        match self.get(KEY_PICTURE_FORMAT) {
            Some("raw") => PictureFormat::Raw,
            _ => PictureFormat::Jpeg,
        }
    }

    pub fn video_size(&self) -> Dimension {
        self.size(KEY_VIDEO_SIZE)
    }

    /// `None` when thumbnails are switched off with `0x0`.
    pub fn thumbnail_size(&self) -> Option<Dimension> {
        let d = self.size(KEY_THUMBNAIL_SIZE);
        (d.width > 0 && d.height > 0).then_some(d)
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.number(KEY_JPEG_QUALITY).clamp(1, 100) as u8
    }

    pub fn thumbnail_quality(&self) -> u8 {
        self.number(KEY_THUMBNAIL_QUALITY).clamp(1, 100) as u8
    }

    pub fn rotation(&self) -> u32 {
        self.number(KEY_ROTATION)
    }

    pub fn zoom(&self) -> u32 {
        self.number(KEY_ZOOM)
    }

    pub fn zsl_enabled(&self) -> bool {
        self.flag(KEY_ZSL)
    }

    pub fn recording_hint(&self) -> bool {
        self.flag(KEY_RECORDING_HINT)
    }

    pub fn num_snapshots(&self) -> u32 {
        self.number(KEY_NUM_SNAPSHOTS).max(1)
    }

    pub fn focus_mode(&self) -> &str {
        self.get(KEY_FOCUS_MODE).unwrap_or("fixed")
    }

    /// Apply `update` on top of `self` and validate the result against `caps`.
    ///
    /// Returns the merged set and whether any restart key changed.
    pub fn merge(&self, update: &Parameters, caps: &Capabilities) -> HalResult<(Parameters, bool)> {
        let mut merged = self.clone();
        for (k, v) in &update.map {
            if READ_ONLY_KEYS.contains(&k.as_str()) {
                continue;
            }
            merged.map.insert(k.clone(), v.clone());
        }
        merged.validate(caps)?;
        let restart = RESTART_KEYS.iter().any(|k| merged.get(k) != self.get(k));
        Ok((merged, restart))
    }

    fn validate(&self, caps: &Capabilities) -> HalResult<()> {
        let check_size = |key: &str, allowed: &[Dimension]| -> HalResult<()> {
            let v = self.get(key).unwrap_or_default();
            match Dimension::parse(v) {
                Some(d) if allowed.contains(&d) => Ok(()),
                _ => Err(bad(key, v)),
            }
        };
        check_size(KEY_PREVIEW_SIZE, &caps.preview_sizes)?;
        check_size(KEY_PICTURE_SIZE, &caps.picture_sizes)?;
        check_size(KEY_VIDEO_SIZE, &caps.video_sizes)?;

        let fmt = self.get(KEY_PREVIEW_FORMAT).unwrap_or_default();
        if !PixelFormat::from_param(fmt).is_some_and(|f| caps.preview_formats.contains(&f)) {
            return Err(bad(KEY_PREVIEW_FORMAT, fmt));
        }
        if let Some(v) = self.get(KEY_PICTURE_FORMAT) {
            if !matches!(v, "jpeg" | "raw") {
                return Err(bad(KEY_PICTURE_FORMAT, v));
            }
        }
        if let Some(v) = self.get(KEY_THUMBNAIL_SIZE) {
            if Dimension::parse(v).is_none() {
                return Err(bad(KEY_THUMBNAIL_SIZE, v));
            }
        }
        for key in [KEY_JPEG_QUALITY, KEY_THUMBNAIL_QUALITY] {
            let v = self.get(key).unwrap_or_default();
            if !v.parse::<u32>().is_ok_and(|q| (1..=100).contains(&q)) {
                return Err(bad(key, v));
            }
        }
        let rot = self.get(KEY_ROTATION).unwrap_or("0");
        if !matches!(rot, "0" | "90" | "180" | "270") {
            return Err(bad(KEY_ROTATION, rot));
        }
        let zoom = self.get(KEY_ZOOM).unwrap_or("0");
        if !zoom.parse::<u32>().is_ok_and(|z| z <= caps.max_zoom) {
            return Err(bad(KEY_ZOOM, zoom));
        }
        for key in [KEY_ZSL, KEY_RECORDING_HINT] {
            if let Some(v) = self.get(key) {
                if !matches!(v, "on" | "off" | "true" | "false") {
                    return Err(bad(key, v));
                }
            }
        }
        if self.zsl_enabled() && !caps.supports_zsl {
            return Err(bad(KEY_ZSL, "on"));
        }
        let snaps = self.get(KEY_NUM_SNAPSHOTS).unwrap_or("1");
        if !snaps
            .parse::<u32>()
            .is_ok_and(|n| (1..=MAX_SNAPSHOTS_PER_SHUTTER).contains(&n))
        {
            return Err(bad(KEY_NUM_SNAPSHOTS, snaps));
        }
        let focus = self.focus_mode();
        if !FOCUS_MODES.contains(&focus) {
            return Err(bad(KEY_FOCUS_MODE, focus));
        }
        Ok(())
    }

    /// Entries of `self` that differ from `older`, read-only keys excluded.
    pub fn diff(&self, older: &Parameters) -> BTreeMap<String, String> {
        self.map
            .iter()
            .filter(|(k, v)| !READ_ONLY_KEYS.contains(&k.as_str()) && older.map.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
