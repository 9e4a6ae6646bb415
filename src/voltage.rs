use crate::acquisition::run_program;
use crate::error::CcdError;
use crate::types::format_decimal;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Bias rails on the CCD controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rail {
    Vod,
    Vog,
    Vrd,
    Vdd,
    ParLo,
    ParHi,
    SerLo,
    SerHi,
    RgLo,
    RgHi,
}

impl Rail {
    pub const ALL: [Rail; 10] = [
        Rail::Vod,
        Rail::Vog,
        Rail::Vrd,
        Rail::Vdd,
        Rail::ParLo,
        Rail::ParHi,
        Rail::SerLo,
        Rail::SerHi,
        Rail::RgLo,
        Rail::RgHi,
    ];

    /// FITS keyword the rail value is recorded under
    pub fn header_key(&self) -> &'static str {
        match self {
            Rail::Vod => "VOD",
            Rail::Vog => "VOG",
            Rail::Vrd => "VRD",
            Rail::Vdd => "VDD",
            Rail::ParLo => "PAR_LO",
            Rail::ParHi => "PAR_HI",
            Rail::SerLo => "SER_LO",
            Rail::SerHi => "SER_HI",
            Rail::RgLo => "RG_LO",
            Rail::RgHi => "RG_HI",
        }
    }

    /// Executable that drives the rail
    pub fn program(&self) -> &'static str {
        match self {
            Rail::Vod => "vod",
            Rail::Vog => "vog",
            Rail::Vrd => "vrd",
            Rail::Vdd => "vdd",
            Rail::ParLo | Rail::ParHi => "par_clks",
            Rail::SerLo | Rail::SerHi => "ser_clks",
            Rail::RgLo | Rail::RgHi => "rg",
        }
    }

    /// `(low, high)` for clock rails that are always set together
    pub fn pair(&self) -> Option<(Rail, Rail)> {
        match self {
            Rail::ParLo | Rail::ParHi => Some((Rail::ParLo, Rail::ParHi)),
            Rail::SerLo | Rail::SerHi => Some((Rail::SerLo, Rail::SerHi)),
            Rail::RgLo | Rail::RgHi => Some((Rail::RgLo, Rail::RgHi)),
            _ => None,
        }
    }
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_key())
    }
}

/// Accepts `VOD`, `par lo`, `PAR_HI`, `rg-hi`
impl FromStr for Rail {
    type Err = CcdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_uppercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        Rail::ALL
            .iter()
            .copied()
            .find(|rail| {
                rail.header_key() == normalized || rail.header_key().replace('_', "") == normalized
            })
            .ok_or_else(|| CcdError::UnknownRail(s.to_string()))
    }
}

/// Nominal start-up values for the STA3800 stand
pub fn nominal_defaults() -> BTreeMap<Rail, f64> {
    BTreeMap::from([
        (Rail::Vdd, 19.0),
        (Rail::Vrd, 13.0),
        (Rail::Vod, 25.0),
        (Rail::Vog, 0.0),
        (Rail::ParLo, -8.0),
        (Rail::ParHi, 4.0),
        (Rail::SerLo, -4.0),
        (Rail::SerHi, 6.0),
        (Rail::RgLo, -2.0),
        (Rail::RgHi, 8.0),
    ])
}

/// Parse a name → volts map into rails, rejecting unknown names
pub fn parse_rail_map(values: &BTreeMap<String, f64>) -> Result<BTreeMap<Rail, f64>, CcdError> {
    values
        .iter()
        .map(|(name, value)| Ok((name.parse::<Rail>()?, *value)))
        .collect()
}

/// One call into the stand's rail programs
#[derive(Debug, Clone, PartialEq)]
pub enum RailCommand {
    Single { rail: Rail, value: f64 },
    Pair { lo: Rail, hi: Rail, lo_value: f64, hi_value: f64 },
}

impl RailCommand {
    pub fn program(&self) -> &'static str {
        match self {
            RailCommand::Single { rail, .. } => rail.program(),
            RailCommand::Pair { lo, .. } => lo.program(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            RailCommand::Single { value, .. } => vec![format_decimal(*value)],
            RailCommand::Pair {
                lo_value, hi_value, ..
            } => vec![format_decimal(*lo_value), format_decimal(*hi_value)],
        }
    }

    fn assignments(&self) -> Vec<(Rail, f64)> {
        match self {
            RailCommand::Single { rail, value } => vec![(*rail, *value)],
            RailCommand::Pair {
                lo,
                hi,
                lo_value,
                hi_value,
            } => vec![(*lo, *lo_value), (*hi, *hi_value)],
        }
    }
}

pub trait RailDriver {
    /// Run the command and return the program's status text
    fn execute(&mut self, command: &RailCommand) -> Result<String, CcdError>;
}

/// Runs `vod`, `par_clks`, ... as external processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRailDriver {
    bin_dir: Option<PathBuf>,
}

impl ProcessRailDriver {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }
}

impl RailDriver for ProcessRailDriver {
    fn execute(&mut self, command: &RailCommand) -> Result<String, CcdError> {
        run_program(self.bin_dir.as_deref(), command.program(), &command.args())
    }
}

/// Last-known rail values plus the driver that changes them.
///
/// Reads are served from the cache; the hardware is never queried.
pub struct VoltageController {
    driver: Box<dyn RailDriver + Send>,
    values: BTreeMap<Rail, f64>,
    defaults: BTreeMap<Rail, f64>,
}

impl VoltageController {
    /// The cache starts out holding `defaults`
    pub fn new(driver: Box<dyn RailDriver + Send>, defaults: BTreeMap<Rail, f64>) -> Self {
        Self {
            driver,
            values: defaults.clone(),
            defaults,
        }
    }

    /// Overlay previously recorded rail values onto the cache.
    ///
    /// The defaults pushed by [`apply_defaults`](Self::apply_defaults) are unchanged.
    pub fn with_cached(mut self, values: BTreeMap<Rail, f64>) -> Self {
        self.values.extend(values);
        self
    }

    pub fn get(&self, rail: Rail) -> Option<f64> {
        self.values.get(&rail).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<Rail, f64> {
        self.values.clone()
    }

    /// Cached values keyed by FITS keyword
    pub fn header_values(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .map(|(rail, value)| (rail.header_key().to_string(), *value))
            .collect()
    }

    /// Set rails given by operator name
    pub fn set_voltages(&mut self, overrides: &BTreeMap<String, f64>) -> Result<(), CcdError> {
        let rails = parse_rail_map(overrides)?;
        self.set_rails(&rails)
    }

    pub fn set_rails(&mut self, values: &BTreeMap<Rail, f64>) -> Result<(), CcdError> {
        for (rail, value) in values {
            if !value.is_finite() {
                return Err(CcdError::InvalidRequest(format!(
                    "{} must be a finite voltage, got {}",
                    rail, value
                )));
            }
        }

        for command in self.plan_commands(values)? {
            let program = command.program();
            match self.driver.execute(&command) {
                Ok(status) => {
                    for (rail, value) in command.assignments() {
                        info!("{} set to {}", rail, value);
                        self.values.insert(rail, value);
                    }
                    if !status.is_empty() {
                        info!("{}", status);
                    }
                }
                Err(e) => {
                    match &e {
                        CcdError::ExecutableMissing { .. } => {
                            error!("Executable {} not found. Voltage not changed.", program)
                        }
                        _ => error!("Error in executable {}. Voltage not changed.", program),
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Push every configured default to the controller
    pub fn apply_defaults(&mut self) -> Result<(), CcdError> {
        info!("Setting default voltages");
        let defaults = self.defaults.clone();
        self.set_rails(&defaults)
    }

    fn plan_commands(&self, values: &BTreeMap<Rail, f64>) -> Result<Vec<RailCommand>, CcdError> {
        let mut handled = BTreeSet::new();
        let mut commands = Vec::new();

        for (&rail, &value) in values {
            if !handled.insert(rail) {
                continue;
            }
            let command = match rail.pair() {
                None => RailCommand::Single { rail, value },
                Some((lo, hi)) => {
                    handled.insert(lo);
                    handled.insert(hi);
                    RailCommand::Pair {
                        lo,
                        hi,
                        lo_value: self.requested_or_cached(values, lo)?,
                        hi_value: self.requested_or_cached(values, hi)?,
                    }
                }
            };
            commands.push(command);
        }
        Ok(commands)
    }

    fn requested_or_cached(&self, values: &BTreeMap<Rail, f64>, rail: Rail) -> Result<f64, CcdError> {
        values
            .get(&rail)
            .or_else(|| self.values.get(&rail))
            .copied()
            .ok_or_else(|| {
                CcdError::InvalidRequest(format!("no known value for paired rail {}", rail))
            })
    }
}

impl fmt::Debug for VoltageController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoltageController")
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingDriver {
        calls: Arc<Mutex<Vec<RailCommand>>>,
        fail_program: Option<&'static str>,
    }

    impl RailDriver for RecordingDriver {
        fn execute(&mut self, command: &RailCommand) -> Result<String, CcdError> {
            self.calls.lock().push(command.clone());
            if self.fail_program == Some(command.program()) {
                return Err(CcdError::ProcessFailed {
                    program: command.program().to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: String::new(),
                });
            }
            Ok(String::new())
        }
    }

    fn controller(driver: &RecordingDriver) -> VoltageController {
        VoltageController::new(Box::new(driver.clone()), nominal_defaults())
    }

    #[test]
    fn test_rail_name_parsing() {
        assert_eq!("VOD".parse::<Rail>().unwrap(), Rail::Vod);
        assert_eq!("par lo".parse::<Rail>().unwrap(), Rail::ParLo);
        assert_eq!("RG_HI".parse::<Rail>().unwrap(), Rail::RgHi);
        assert_eq!("ser-hi".parse::<Rail>().unwrap(), Rail::SerHi);
        assert_eq!("parhi".parse::<Rail>().unwrap(), Rail::ParHi);
        let err = "VV1".parse::<Rail>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_pair_uses_cached_partner() {
        let driver = RecordingDriver::default();
        let mut volts = controller(&driver);

        volts
            .set_voltages(&BTreeMap::from([("PAR HI".to_string(), 5.0)]))
            .unwrap();

        let calls = driver.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program(), "par_clks");
        assert_eq!(calls[0].args(), vec!["-8.0".to_string(), "5.0".to_string()]);
        drop(calls);
        assert_eq!(volts.get(Rail::ParHi), Some(5.0));
        assert_eq!(volts.get(Rail::ParLo), Some(-8.0));
    }

    #[test]
    fn test_both_halves_one_call() {
        let driver = RecordingDriver::default();
        let mut volts = controller(&driver);
        volts
            .set_rails(&BTreeMap::from([
                (Rail::SerLo, -5.0),
                (Rail::SerHi, 7.0),
                (Rail::Vod, 24.5),
            ]))
            .unwrap();

        let calls = driver.calls.lock();
        assert_eq!(
            *calls,
            vec![
                RailCommand::Single {
                    rail: Rail::Vod,
                    value: 24.5
                },
                RailCommand::Pair {
                    lo: Rail::SerLo,
                    hi: Rail::SerHi,
                    lo_value: -5.0,
                    hi_value: 7.0
                },
            ]
        );
    }

    #[test]
    fn test_failure_stops_batch_and_keeps_cache() {
        let driver = RecordingDriver {
            fail_program: Some("vrd"),
            ..Default::default()
        };
        let mut volts = controller(&driver);
        let err = volts
            .set_rails(&BTreeMap::from([
                (Rail::Vod, 26.0),
                (Rail::Vrd, 14.0),
                (Rail::Vdd, 20.0),
            ]))
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::ProcessFailed);
        assert_eq!(volts.get(Rail::Vod), Some(26.0));
        assert_eq!(volts.get(Rail::Vrd), Some(13.0));
        assert_eq!(volts.get(Rail::Vdd), Some(19.0));
        assert_eq!(driver.calls.lock().len(), 2);
    }

    #[test]
    fn test_apply_defaults_and_header_values() {
        let driver = RecordingDriver::default();
        let mut volts = controller(&driver);
        volts.apply_defaults().unwrap();
        assert_eq!(driver.calls.lock().len(), 7);

        let header = volts.header_values();
        assert_eq!(header.get("RG_LO"), Some(&-2.0));
        assert_eq!(header.get("VDD"), Some(&19.0));
    }

    #[test]
    fn test_recorded_values_carry_into_next_controller() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::sequence_store::SequenceStore::new(dir.path().join("stand.json"));

        let first_driver = RecordingDriver::default();
        let mut first = controller(&first_driver)
            .with_cached(store.load_voltages().unwrap());
        first
            .set_voltages(&BTreeMap::from([("PAR HI".to_string(), 5.0)]))
            .unwrap();
        store.save_voltages(&first.snapshot()).unwrap();

        let second_driver = RecordingDriver::default();
        let mut second = controller(&second_driver)
            .with_cached(store.load_voltages().unwrap());
        second
            .set_voltages(&BTreeMap::from([("PAR LO".to_string(), -7.0)]))
            .unwrap();

        assert_eq!(
            *second_driver.calls.lock(),
            vec![RailCommand::Pair {
                lo: Rail::ParLo,
                hi: Rail::ParHi,
                lo_value: -7.0,
                hi_value: 5.0
            }]
        );
        assert_eq!(second.header_values().get("PAR_HI"), Some(&5.0));

        second.apply_defaults().unwrap();
        assert_eq!(second.get(Rail::ParHi), Some(4.0));
    }

    #[test]
    fn test_rejects_non_finite() {
        let driver = RecordingDriver::default();
        let mut volts = controller(&driver);
        assert!(volts
            .set_rails(&BTreeMap::from([(Rail::Vog, f64::NAN)]))
            .is_err());
        assert!(driver.calls.lock().is_empty());
    }

    #[test]
    fn test_missing_partner_value() {
        let driver = RecordingDriver::default();
        let mut volts = VoltageController::new(Box::new(driver.clone()), BTreeMap::new());
        let err = volts
            .set_rails(&BTreeMap::from([(Rail::RgHi, 9.0)]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_driver_invokes_program() {
        let bin = tempfile::tempdir().unwrap();
        let log = bin.path().join("calls.txt");
        crate::testutil::write_script(
            bin.path(),
            "rg",
            &format!(r#"echo "rg $1 $2" >> "{}""#, log.display()),
        );
        let mut driver = ProcessRailDriver::new(Some(bin.path().to_path_buf()));
        driver
            .execute(&RailCommand::Pair {
                lo: Rail::RgLo,
                hi: Rail::RgHi,
                lo_value: -2.0,
                hi_value: 8.5,
            })
            .unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "rg -2.0 8.5");
    }
}
