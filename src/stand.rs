use crate::acquisition::run_program;
use crate::error::CcdError;
use log::{error, info};
use std::path::PathBuf;

pub const DEFAULT_SETUP_PROGRAM: &str = "sta3800_setup";
pub const DEFAULT_OFF_PROGRAM: &str = "sta3800_off";

/// Powers the CCD controller down and back up
#[derive(Debug, Clone)]
pub struct StandController {
    setup_program: String,
    off_program: String,
    bin_dir: Option<PathBuf>,
}

impl Default for StandController {
    fn default() -> Self {
        Self::new(DEFAULT_SETUP_PROGRAM, DEFAULT_OFF_PROGRAM, None)
    }
}

impl StandController {
    pub fn new(
        setup_program: impl Into<String>,
        off_program: impl Into<String>,
        bin_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            setup_program: setup_program.into(),
            off_program: off_program.into(),
            bin_dir,
        }
    }

    /// Power off, then run the setup program
    pub fn reset(&self) -> Result<(), CcdError> {
        info!("Resetting controller");
        self.power_off()?;
        self.run(&self.setup_program)?;
        info!("Controller setup complete");
        Ok(())
    }

    pub fn power_off(&self) -> Result<(), CcdError> {
        self.run(&self.off_program)?;
        info!("Controller powered off");
        Ok(())
    }

    fn run(&self, program: &str) -> Result<(), CcdError> {
        match run_program(self.bin_dir.as_deref(), program, &[]) {
            Ok(status) => {
                if !status.is_empty() {
                    info!("{}", status);
                }
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                Err(e)
            }
        }
    }
}
