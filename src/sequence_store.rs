use crate::error::CcdError;
use crate::voltage::{Rail, parse_rail_map};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoredState {
    next_seq_num: u64,
    /// Last rail values the stand was set to, keyed by FITS keyword
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    voltages: BTreeMap<String, f64>,
}

/// Persistent stand state kept as a small JSON file: the sequence-number
/// watermark and the last-known rail voltages
#[derive(Debug, Clone)]
pub struct SequenceStore {
    path: PathBuf,
}

impl SequenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next free sequence number; a store that was never saved starts at 0
    pub fn load(&self) -> Result<u64, CcdError> {
        Ok(self.read_state()?.next_seq_num)
    }

    pub fn save(&self, next_seq_num: u64) -> Result<(), CcdError> {
        let mut state = self.read_state()?;
        state.next_seq_num = next_seq_num;
        self.write_state(&state)?;
        info!("Next sequence number {} saved", next_seq_num);
        Ok(())
    }

    /// Rail values recorded by the last invocation; empty when none were saved
    pub fn load_voltages(&self) -> Result<BTreeMap<Rail, f64>, CcdError> {
        parse_rail_map(&self.read_state()?.voltages)
    }

    pub fn save_voltages(&self, values: &BTreeMap<Rail, f64>) -> Result<(), CcdError> {
        let mut state = self.read_state()?;
        state.voltages = values
            .iter()
            .map(|(rail, volts)| (rail.header_key().to_string(), *volts))
            .collect();
        self.write_state(&state)?;
        debug!("{} rail value(s) saved to {}", values.len(), self.path.display());
        Ok(())
    }

    fn read_state(&self) -> Result<StoredState, CcdError> {
        if !self.path.exists() {
            debug!("No stand state at {}, starting fresh", self.path.display());
            return Ok(StoredState::default());
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| CcdError::io(e, format!("reading {}", self.path.display())))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write_state(&self, state: &StoredState) -> Result<(), CcdError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| CcdError::io(e, format!("creating {}", parent.display())))?;
        }
        let text = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, text)
            .map_err(|e| CcdError::io(e, format!("writing {}", self.path.display())))
    }
}
