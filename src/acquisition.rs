use crate::error::CcdError;
use crate::types::{ExposureKind, format_decimal};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const DEFAULT_EXP_PROGRAM: &str = "exp_acq";
pub const DEFAULT_DARK_PROGRAM: &str = "dark_acq";

/// Everything the acquisition service needs for one shot
#[derive(Debug, Clone)]
pub struct AcquisitionRequest<'a> {
    pub kind: ExposureKind,
    pub exposure_time_s: f64,
    pub seq_num: u64,
    pub target_path: &'a Path,
    pub voltages: &'a BTreeMap<String, f64>,
    /// Replace whatever is at `target_path` (scratch test image)
    pub allow_overwrite: bool,
}

/// A successfully acquired image
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionHandle {
    pub path: PathBuf,
    pub kind: ExposureKind,
    pub exposure_time_s: f64,
    pub seq_num: u64,
    pub acquired_at: DateTime<Utc>,
}

pub trait AcquisitionClient {
    fn acquire(&mut self, request: &AcquisitionRequest<'_>) -> Result<AcquisitionHandle, CcdError>;
}

/// Runs the stand's `exp_acq` / `dark_acq` executables
#[derive(Debug, Clone)]
pub struct ProcessAcquisitionClient {
    exp_program: String,
    dark_program: String,
    bin_dir: Option<PathBuf>,
}

impl Default for ProcessAcquisitionClient {
    fn default() -> Self {
        Self::new(DEFAULT_EXP_PROGRAM, DEFAULT_DARK_PROGRAM, None)
    }
}

impl ProcessAcquisitionClient {
    pub fn new(
        exp_program: impl Into<String>,
        dark_program: impl Into<String>,
        bin_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            exp_program: exp_program.into(),
            dark_program: dark_program.into(),
            bin_dir,
        }
    }

    /// Shutter-open kinds go through the exposure program, the rest through the dark program
    pub fn program_for(&self, kind: ExposureKind) -> &str {
        if kind.shutter_open() {
            &self.exp_program
        } else {
            &self.dark_program
        }
    }

    fn prepare_target(&self, target: &Path, allow_overwrite: bool) -> Result<(), CcdError> {
        if target.exists() {
            if !allow_overwrite {
                return Err(CcdError::OutputAlreadyExists(target.to_path_buf()));
            }
            debug!("Removing previous image {}", target.display());
            fs::remove_file(target)
                .map_err(|e| CcdError::io(e, format!("removing {}", target.display())))?;
        }
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| CcdError::io(e, format!("creating {}", parent.display())))?;
        }
        Ok(())
    }
}

impl AcquisitionClient for ProcessAcquisitionClient {
    fn acquire(&mut self, request: &AcquisitionRequest<'_>) -> Result<AcquisitionHandle, CcdError> {
        self.prepare_target(request.target_path, request.allow_overwrite)?;

        let program = self.program_for(request.kind);
        let acquired_at = Utc::now();
        let args = [
            format_decimal(request.exposure_time_s),
            request.target_path.display().to_string(),
        ];
        if !request.voltages.is_empty() {
            debug!("Acquiring with rail overrides {:?}", request.voltages);
        }

        if let Err(e) = run_program(self.bin_dir.as_deref(), program, &args) {
            warn!("Error in executable {}. Image not taken.", program);
            return Err(e);
        }

        info!("Image written to {}", request.target_path.display());
        Ok(AcquisitionHandle {
            path: request.target_path.to_path_buf(),
            kind: request.kind,
            exposure_time_s: request.exposure_time_s,
            seq_num: request.seq_num,
            acquired_at,
        })
    }
}

/// Runs an external stand program to completion and returns its trimmed stdout
pub(crate) fn run_program(
    bin_dir: Option<&Path>,
    program: &str,
    args: &[String],
) -> Result<String, CcdError> {
    let executable = match bin_dir {
        Some(dir) => dir.join(program),
        None => PathBuf::from(program),
    };
    debug!("Running {} {}", executable.display(), args.join(" "));

    let output = Command::new(&executable)
        .args(args)
        .output()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CcdError::ExecutableMissing {
                program: program.to_string(),
            },
            _ => CcdError::io(e, format!("starting {}", executable.display())),
        })?;

    if !output.status.success() {
        return Err(CcdError::ProcessFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
