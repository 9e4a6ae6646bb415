use crate::error::CcdError;
use crate::header::HeaderOverrides;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of frame the camera takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureKind {
    #[serde(rename = "exp", alias = "exposure")]
    Exposure,
    Dark,
    Bias,
    Flat,
    Fe55,
}

impl ExposureKind {
    /// Short tag used in file names
    pub fn tag(&self) -> &'static str {
        match self {
            ExposureKind::Exposure => "exp",
            ExposureKind::Dark => "dark",
            ExposureKind::Bias => "bias",
            ExposureKind::Flat => "flat",
            ExposureKind::Fe55 => "fe55",
        }
    }

    /// Whether the shutter opens during the exposure
    pub fn shutter_open(&self) -> bool {
        matches!(self, ExposureKind::Exposure | ExposureKind::Flat)
    }

    /// Value for the IMGTYPE header key
    pub fn image_type(&self) -> &'static str {
        match self {
            ExposureKind::Exposure => "EXP",
            ExposureKind::Dark => "DARK",
            ExposureKind::Bias => "BIAS",
            ExposureKind::Flat => "FLAT",
            ExposureKind::Fe55 => "FE55",
        }
    }

    /// Value for the TESTTYPE header key
    pub fn test_type(&self) -> &'static str {
        match self {
            ExposureKind::Exposure => "OBS",
            ExposureKind::Dark | ExposureKind::Bias => "DARK",
            ExposureKind::Flat => "FLAT",
            ExposureKind::Fe55 => "FE55",
        }
    }
}

impl fmt::Display for ExposureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ExposureKind {
    type Err = CcdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exp" | "exposure" => Ok(ExposureKind::Exposure),
            "dark" => Ok(ExposureKind::Dark),
            "bias" => Ok(ExposureKind::Bias),
            "flat" => Ok(ExposureKind::Flat),
            "fe55" => Ok(ExposureKind::Fe55),
            other => Err(CcdError::InvalidRequest(format!(
                "unknown exposure kind '{}'",
                other
            ))),
        }
    }
}

/// One bias-voltage sweep axis of a voltage scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl SweepAxis {
    pub fn new(name: impl Into<String>, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            step,
        }
    }
}

/// Parses `NAME:MIN:MAX:STEP`
impl FromStr for SweepAxis {
    type Err = CcdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(CcdError::InvalidRequest(format!(
                "sweep axis '{}' must look like NAME:MIN:MAX:STEP",
                s
            )));
        }
        let number = |field: &str, text: &str| {
            text.trim().parse::<f64>().map_err(|_| {
                CcdError::InvalidRequest(format!("sweep axis '{}': bad {} '{}'", s, field, text))
            })
        };
        Ok(SweepAxis {
            name: parts[0].trim().to_string(),
            min: number("min", parts[1])?,
            max: number("max", parts[2])?,
            step: number("step", parts[3])?,
        })
    }
}

/// Requested exposure mode with its mode-specific parameters
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureMode {
    Single,
    Stack {
        image_count: u32,
    },
    Series {
        min_time: f64,
        max_time: f64,
        time_step: f64,
    },
    VoltageScan {
        axes: Vec<SweepAxis>,
    },
}

impl ExposureMode {
    pub fn name(&self) -> &'static str {
        match self {
            ExposureMode::Single => "single",
            ExposureMode::Stack { .. } => "stack",
            ExposureMode::Series { .. } => "series",
            ExposureMode::VoltageScan { .. } => "voltage_scan",
        }
    }
}

/// Output file stem, or the fixed scratch test image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTitle {
    Title(String),
    Test,
}

impl FileTitle {
    pub fn is_test(&self) -> bool {
        matches!(self, FileTitle::Test)
    }
}

/// User intent for one press of "expose"
#[derive(Debug, Clone)]
pub struct ExposureRequest {
    kind: ExposureKind,
    mode: ExposureMode,
    exposure_time_s: f64,
    start_seq_num: u64,
    title: FileTitle,
    directory: PathBuf,
    metadata: HeaderOverrides,
}

impl ExposureRequest {
    pub fn new(
        kind: ExposureKind,
        mode: ExposureMode,
        title: FileTitle,
        directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind,
            mode,
            exposure_time_s: 0.0,
            start_seq_num: 0,
            title,
            directory: directory.into(),
            metadata: HeaderOverrides::default(),
        }
    }

    pub fn with_exposure_time(mut self, seconds: f64) -> Self {
        self.exposure_time_s = seconds;
        self
    }

    pub fn with_start_seq_num(mut self, seq_num: u64) -> Self {
        self.start_seq_num = seq_num;
        self
    }

    pub fn with_metadata(mut self, metadata: HeaderOverrides) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn kind(&self) -> ExposureKind {
        self.kind
    }

    pub fn mode(&self) -> &ExposureMode {
        &self.mode
    }

    /// Exposure time, forced to zero for bias frames
    pub fn exposure_time(&self) -> f64 {
        if self.kind == ExposureKind::Bias {
            0.0
        } else {
            self.exposure_time_s
        }
    }

    pub fn start_seq_num(&self) -> u64 {
        self.start_seq_num
    }

    pub fn title(&self) -> &FileTitle {
        &self.title
    }

    pub fn is_test(&self) -> bool {
        self.title.is_test()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn metadata(&self) -> &HeaderOverrides {
        &self.metadata
    }
}

/// One planned acquisition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShotDescriptor {
    pub sequence_index: usize,
    pub seq_num: u64,
    pub exposure_time_s: f64,
    pub voltage_overrides: BTreeMap<String, f64>,
    pub file_path: PathBuf,
}

/// Renders a number the way the stand scripts always did: `10.0`, `0.25`
pub fn format_decimal(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}
