use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::MAX_TRACKED_FACES;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} must be inside (0.0, 1.0), got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f32 },
    #[error("{name} must not be negative, got {value}")]
    NegativeThreshold { name: &'static str, value: f32 },
    #[error("max_faces must be between 1 and 10, got {0}")]
    MaxFaces(usize),
    #[error("{0} must be at least 1")]
    ZeroValue(&'static str),
    #[error("face_size_limit must not be negative, got {0}")]
    FaceSizeLimit(i32),
    #[error("display size must be non-zero, got {0}x{1}")]
    DisplaySize(u32, u32),
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Orientation the detector should prefer when scanning a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
    AllOut,
}

impl Orientation {
    /// Image-mode sub-handles accept a single orientation only.
    pub fn single(self) -> Orientation {
        match self {
            Orientation::AllOut => Orientation::Deg0,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessType {
    None,
    Rgb,
    Ir,
}

/// Pixel offsets applied after camera-to-display transformation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectOffsets {
    pub rgb_x: i32,
    pub rgb_y: i32,
    pub ir_x: i32,
    pub ir_y: i32,
}

/// Immutable recognition settings, supplied once when the pipeline is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub detect_orientation: Orientation,
    pub enable_recognize: bool,
    pub liveness_type: LivenessType,
    pub rgb_liveness_threshold: f32,
    pub ir_liveness_threshold: f32,
    pub fq_liveness_threshold: f32,
    pub enable_image_quality: bool,
    pub image_quality_no_mask_threshold: f32,
    pub image_quality_mask_threshold: f32,
    pub max_faces: usize,
    pub keep_max_face: bool,
    pub enable_area_limit: bool,
    /// Side of the centred square recognition area, as a share of the
    /// shorter display dimension.
    pub area_ratio: f32,
    pub rgb_mirror: bool,
    pub ir_mirror: bool,
    pub rect_offsets: RectOffsets,
    /// Display (canvas) size the rectangles are mapped into; frame size when unset.
    pub display_size: Option<(u32, u32)>,
    pub extract_feature_retry_count: u32,
    pub recognize_failed_retry_interval_ms: u64,
    pub liveness_retry_count: u32,
    pub liveness_failed_retry_interval_ms: u64,
    pub enable_compare: bool,
    pub enable_mask: bool,
    pub face_size_limit: i32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            detect_orientation: Orientation::Deg0,
            enable_recognize: true,
            liveness_type: LivenessType::None,
            rgb_liveness_threshold: 0.6,
            ir_liveness_threshold: 0.7,
            fq_liveness_threshold: 0.6,
            enable_image_quality: false,
            image_quality_no_mask_threshold: 0.49,
            image_quality_mask_threshold: 0.29,
            max_faces: 1,
            keep_max_face: true,
            enable_area_limit: false,
            area_ratio: 0.625,
            rgb_mirror: false,
            ir_mirror: false,
            rect_offsets: RectOffsets::default(),
            display_size: None,
            extract_feature_retry_count: 3,
            recognize_failed_retry_interval_ms: 1000,
            liveness_retry_count: 3,
            liveness_failed_retry_interval_ms: 1000,
            enable_compare: true,
            enable_mask: false,
            face_size_limit: 160,
        }
    }
}

impl RecognitionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("rgb_liveness_threshold", self.rgb_liveness_threshold),
            ("ir_liveness_threshold", self.ir_liveness_threshold),
            ("fq_liveness_threshold", self.fq_liveness_threshold),
            ("area_ratio", self.area_ratio),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        for (name, value) in [
            (
                "image_quality_no_mask_threshold",
                self.image_quality_no_mask_threshold,
            ),
            ("image_quality_mask_threshold", self.image_quality_mask_threshold),
        ] {
            if value < 0.0 || value.is_nan() {
                return Err(ConfigError::NegativeThreshold { name, value });
            }
        }
        if self.max_faces == 0 || self.max_faces > MAX_TRACKED_FACES {
            return Err(ConfigError::MaxFaces(self.max_faces));
        }
        if self.extract_feature_retry_count == 0 {
            return Err(ConfigError::ZeroValue("extract_feature_retry_count"));
        }
        if self.liveness_retry_count == 0 {
            return Err(ConfigError::ZeroValue("liveness_retry_count"));
        }
        if self.recognize_failed_retry_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("recognize_failed_retry_interval_ms"));
        }
        if self.liveness_failed_retry_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("liveness_failed_retry_interval_ms"));
        }
        if self.face_size_limit < 0 {
            return Err(ConfigError::FaceSizeLimit(self.face_size_limit));
        }
        if let Some((w, h)) = self.display_size {
            if w == 0 || h == 0 {
                return Err(ConfigError::DisplaySize(w, h));
            }
        }
        Ok(())
    }

    pub fn liveness_enabled(&self) -> bool {
        self.liveness_type != LivenessType::None
    }

    pub fn recognize_retry_interval(&self) -> Duration {
        Duration::from_millis(self.recognize_failed_retry_interval_ms)
    }

    pub fn liveness_retry_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_failed_retry_interval_ms)
    }
}
