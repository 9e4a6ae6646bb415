pub mod acquisition;
pub mod config;
pub mod error;
pub mod fits;
pub mod header;
pub mod journal;
pub mod plan;
pub mod runner;
pub mod sequence_store;
pub mod stand;
pub mod types;
pub mod voltage;

#[cfg(all(test, unix))]
mod testutil;

pub use acquisition::{
    AcquisitionClient, AcquisitionHandle, AcquisitionRequest, ProcessAcquisitionClient,
};
pub use config::{AppConfig, load_config, load_config_or_default};
pub use error::{CcdError, ErrorKind};
pub use header::{FitsHeaderAnnotator, HeaderAnnotator, HeaderFields, HeaderOverrides, Illumination};
pub use journal::{Journal, ShotOutcome, ShotRecord};
pub use plan::{SequencePlan, expand};
pub use runner::{RunError, RunEvent, RunReport, RunState, SequenceRunner};
pub use sequence_store::SequenceStore;
pub use stand::StandController;
pub use types::{
    ExposureKind, ExposureMode, ExposureRequest, FileTitle, ShotDescriptor, SweepAxis,
};
pub use voltage::{ProcessRailDriver, Rail, RailCommand, RailDriver, VoltageController};
