//! Sequence execution.
//!
//! A [`SequenceRunner`] walks a [`SequencePlan`] one shot at a time: set any
//! per-shot rail values, acquire, annotate the header, journal the outcome.
//! A failed acquisition or rail change ends the run as `Failed`; a failed
//! header write is reported and the run goes on. Cancellation is read at
//! the top of every iteration, so an in-flight acquisition always finishes.
//!
//! At most one run is active per runner. Observers receive [`RunEvent`]s
//! over a crossbeam channel with `try_send`; the run never waits on them.

use crate::acquisition::{AcquisitionClient, AcquisitionRequest};
use crate::error::{CcdError, ErrorKind};
use crate::header::{HeaderAnnotator, HeaderFields};
use crate::journal::{Journal, ShotOutcome, ShotRecord};
use crate::plan::SequencePlan;
use crate::types::ShotDescriptor;
use crate::voltage::{Rail, VoltageController};
use chrono::Utc;
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Canceled | RunState::Failed
        )
    }
}

/// Error summary carried by events and reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&CcdError> for RunError {
    fn from(e: &CcdError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted {
        total: usize,
    },
    ShotStarted {
        index: usize,
        total: usize,
        seq_num: u64,
        path: PathBuf,
    },
    ShotCompleted {
        completed: usize,
        total: usize,
    },
    SequenceNumberAdvanced(u64),
    HeaderWriteFailed {
        index: usize,
        message: String,
    },
    RunFinished {
        state: RunState,
        completed: usize,
        error: Option<RunError>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub completed: usize,
    pub total: usize,
    pub header_failures: usize,
    pub next_seq_num: u64,
    pub error: Option<RunError>,
}

/// Collaborators owned by the active run
struct Devices {
    acquisition: Box<dyn AcquisitionClient + Send>,
    annotator: Box<dyn HeaderAnnotator + Send>,
    voltages: Option<VoltageController>,
    journal: Option<Journal<ShotRecord>>,
}

pub struct SequenceRunner {
    state: Mutex<RunState>,
    devices: Mutex<Devices>,
    cancel_requested: Arc<AtomicBool>,
    next_seq_num: AtomicU64,
    auto_increment: bool,
    event_sender: Option<Sender<RunEvent>>,
}

impl SequenceRunner {
    pub fn new(
        acquisition: Box<dyn AcquisitionClient + Send>,
        annotator: Box<dyn HeaderAnnotator + Send>,
    ) -> Self {
        Self {
            state: Mutex::new(RunState::Idle),
            devices: Mutex::new(Devices {
                acquisition,
                annotator,
                voltages: None,
                journal: None,
            }),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            next_seq_num: AtomicU64::new(0),
            auto_increment: true,
            event_sender: None,
        }
    }

    pub fn with_voltage_controller(self, controller: VoltageController) -> Self {
        self.devices.lock().voltages = Some(controller);
        self
    }

    pub fn with_journal(self, journal: Journal<ShotRecord>) -> Self {
        self.devices.lock().journal = Some(journal);
        self
    }

    /// Set a channel to send run events to
    pub fn with_event_sender(mut self, sender: Sender<RunEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    /// Share the cancellation flag with another owner (signal handler, UI)
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_requested = flag;
        self
    }

    pub fn with_next_seq_num(self, next_seq_num: u64) -> Self {
        self.next_seq_num.store(next_seq_num, Ordering::SeqCst);
        self
    }

    pub fn with_auto_increment(mut self, enabled: bool) -> Self {
        self.auto_increment = enabled;
        self
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// The persistent watermark: the next unused sequence number
    pub fn next_seq_num(&self) -> u64 {
        self.next_seq_num.load(Ordering::SeqCst)
    }

    /// Ask the active run to stop before its next shot
    pub fn cancel(&self) {
        if !self.cancel_requested.swap(true, Ordering::SeqCst) {
            info!("Cancel requested");
        }
    }

    /// Cached rail values, if a voltage controller is attached.
    ///
    /// Blocks while a run is in progress.
    pub fn voltage_snapshot(&self) -> Option<BTreeMap<Rail, f64>> {
        self.devices.lock().voltages.as_ref().map(|v| v.snapshot())
    }

    /// Execute the plan on the calling thread
    pub fn run(&self, plan: &SequencePlan) -> Result<RunReport, CcdError> {
        self.begin(plan)?;
        Ok(self.execute(plan))
    }

    /// Execute the plan on a worker thread. Rejections are reported here,
    /// before the worker starts.
    pub fn spawn(self: &Arc<Self>, plan: SequencePlan) -> Result<JoinHandle<RunReport>, CcdError> {
        self.begin(&plan)?;
        let runner = Arc::clone(self);
        Ok(thread::spawn(move || runner.execute(&plan)))
    }

    fn begin(&self, plan: &SequencePlan) -> Result<(), CcdError> {
        let mut state = self.state.lock();
        if *state == RunState::Running {
            warn!("A sequence is already running");
            return Err(CcdError::AlreadyRunning);
        }
        self.validate(plan)?;
        *state = RunState::Running;
        self.cancel_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn validate(&self, plan: &SequencePlan) -> Result<(), CcdError> {
        if plan.total_count() == 0 {
            return Err(CcdError::InvalidRequest("plan has no shots".to_string()));
        }
        let names = plan.voltage_names();
        if names.is_empty() {
            return Ok(());
        }
        if self.devices.lock().voltages.is_none() {
            return Err(CcdError::InvalidRequest(
                "voltage overrides need a voltage controller".to_string(),
            ));
        }
        for name in names {
            name.parse::<Rail>()?;
        }
        Ok(())
    }

    fn execute(&self, plan: &SequencePlan) -> RunReport {
        let total = plan.total_count();
        info!(
            "Starting {} sequence of {} {} image(s)",
            plan.mode_name(),
            total,
            plan.kind()
        );
        self.emit(RunEvent::RunStarted { total });

        let mut devices = self.devices.lock();
        let mut completed = 0;
        let mut header_failures = 0;
        let mut state = RunState::Completed;
        let mut run_error = None;

        for shot in plan.shots() {
            if self.cancel_requested.load(Ordering::SeqCst) {
                info!("Exposure canceled.");
                state = RunState::Canceled;
                break;
            }

            info!("Starting image {} of {}.", shot.sequence_index + 1, total);
            self.emit(RunEvent::ShotStarted {
                index: shot.sequence_index,
                total,
                seq_num: shot.seq_num,
                path: shot.file_path.clone(),
            });

            let (voltages, result) = take_shot(&mut devices, plan, shot);
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        "Image {} of {} not taken: {}",
                        shot.sequence_index + 1,
                        total,
                        e
                    );
                    let failure = RunError::from(&e);
                    record(&mut devices, plan, shot, voltages, ShotOutcome::Failed {
                        error_kind: failure.kind,
                        message: failure.message.clone(),
                    });
                    state = RunState::Failed;
                    run_error = Some(failure);
                    break;
                }
            };

            completed += 1;
            if let ShotOutcome::HeaderWriteFailed { message } = &outcome {
                header_failures += 1;
                warn!(
                    "Header not updated for {}: {}",
                    shot.file_path.display(),
                    message
                );
                self.emit(RunEvent::HeaderWriteFailed {
                    index: shot.sequence_index,
                    message: message.clone(),
                });
            }
            record(&mut devices, plan, shot, voltages, outcome);
            self.emit(RunEvent::ShotCompleted { completed, total });

            if !plan.is_test() && self.auto_increment {
                self.advance_watermark(shot.seq_num);
            }
        }

        if let Some(journal) = devices.journal.as_mut() {
            if let Err(e) = journal.flush() {
                warn!("Run journal not flushed: {}", e);
            }
        }
        drop(devices);

        match state {
            RunState::Completed => info!("Exposure sequence complete."),
            RunState::Canceled => info!("Sequence canceled after {} of {} image(s)", completed, total),
            _ => error!("Sequence failed after {} of {} image(s)", completed, total),
        }

        *self.state.lock() = state;
        self.emit(RunEvent::RunFinished {
            state,
            completed,
            error: run_error.clone(),
        });

        RunReport {
            state,
            completed,
            total,
            header_failures,
            next_seq_num: self.next_seq_num(),
            error: run_error,
        }
    }

    /// Watermark becomes `max(watermark, seq_num + 1)`
    fn advance_watermark(&self, seq_num: u64) {
        let candidate = seq_num.saturating_add(1);
        let previous = self.next_seq_num.fetch_max(candidate, Ordering::SeqCst);
        if candidate > previous {
            debug!("Sequence number advanced to {}", candidate);
            self.emit(RunEvent::SequenceNumberAdvanced(candidate));
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.try_send(event);
        }
    }
}

/// Returns the rail values in effect for the shot alongside its outcome
fn take_shot(
    devices: &mut Devices,
    plan: &SequencePlan,
    shot: &ShotDescriptor,
) -> (BTreeMap<String, f64>, Result<ShotOutcome, CcdError>) {
    if let Some(controller) = devices.voltages.as_mut() {
        if !shot.voltage_overrides.is_empty() {
            if let Err(e) = controller.set_voltages(&shot.voltage_overrides) {
                return (shot.voltage_overrides.clone(), Err(e));
            }
        }
    }
    let voltages = devices
        .voltages
        .as_ref()
        .map(|v| v.header_values())
        .unwrap_or_default();

    let request = AcquisitionRequest {
        kind: plan.kind(),
        exposure_time_s: shot.exposure_time_s,
        seq_num: shot.seq_num,
        target_path: &shot.file_path,
        voltages: &voltages,
        allow_overwrite: plan.is_test(),
    };
    let handle = match devices.acquisition.acquire(&request) {
        Ok(handle) => handle,
        Err(e) => return (voltages, Err(e)),
    };

    let fields = HeaderFields::resolve(plan.metadata(), &handle, voltages.clone());
    let outcome = match devices.annotator.annotate(&handle, &fields) {
        Ok(()) => ShotOutcome::Acquired,
        Err(e) => ShotOutcome::HeaderWriteFailed {
            message: e.to_string(),
        },
    };
    (voltages, Ok(outcome))
}

fn record(
    devices: &mut Devices,
    plan: &SequencePlan,
    shot: &ShotDescriptor,
    voltages: BTreeMap<String, f64>,
    outcome: ShotOutcome,
) {
    let Some(journal) = devices.journal.as_mut() else {
        return;
    };
    let entry = ShotRecord {
        timestamp: Utc::now(),
        mode: plan.mode_name().to_string(),
        kind: plan.kind(),
        index: shot.sequence_index,
        seq_num: shot.seq_num,
        path: shot.file_path.clone(),
        exposure_time_s: shot.exposure_time_s,
        voltages,
        outcome,
    };
    if let Err(e) = journal.add(entry) {
        warn!("Shot not journaled: {}", e);
    }
}
