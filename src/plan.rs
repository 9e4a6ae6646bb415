use crate::error::CcdError;
use crate::header::HeaderOverrides;
use crate::types::{
    format_decimal, ExposureKind, ExposureMode, ExposureRequest, FileTitle, ShotDescriptor,
    SweepAxis,
};
use crate::voltage::Rail;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Relative slack, in units of the step, when comparing against a range bound
const STEP_TOLERANCE: f64 = 1e-9;

/// Times and voltages are kept to the microsecond / microvolt
const MIN_STEP: f64 = 1e-6;

/// Largest number of shots a single request may expand into
pub const MAX_PLANNED_SHOTS: usize = 100_000;

/// File name every test-image run overwrites
pub const TEST_IMAGE_NAME: &str = "test.fits";

/// Ordered list of shots for a single run
#[derive(Debug, Clone)]
pub struct SequencePlan {
    shots: Vec<ShotDescriptor>,
    kind: ExposureKind,
    mode: &'static str,
    is_test: bool,
    metadata: HeaderOverrides,
}

impl SequencePlan {
    pub fn total_count(&self) -> usize {
        self.shots.len()
    }

    pub fn shots(&self) -> &[ShotDescriptor] {
        &self.shots
    }

    pub fn kind(&self) -> ExposureKind {
        self.kind
    }

    pub fn mode_name(&self) -> &'static str {
        self.mode
    }

    pub fn is_test(&self) -> bool {
        self.is_test
    }

    pub fn metadata(&self) -> &HeaderOverrides {
        &self.metadata
    }

    /// Every voltage rail name any shot overrides
    pub fn voltage_names(&self) -> BTreeSet<&str> {
        self.shots
            .iter()
            .flat_map(|shot| shot.voltage_overrides.keys().map(String::as_str))
            .collect()
    }
}

/// Expand a request into its ordered shot list.
///
/// `prior_seq_num` is the live sequence counter. Single shots, series and
/// voltage scans number their files with it; stacks count up from the
/// request's own start number.
pub fn expand(request: &ExposureRequest, prior_seq_num: u64) -> Result<SequencePlan, CcdError> {
    let exposure_time = request.exposure_time();
    if !exposure_time.is_finite() || exposure_time < 0.0 {
        return Err(CcdError::InvalidRequest(format!(
            "exposure time must be >= 0, got {}",
            exposure_time
        )));
    }
    if let FileTitle::Title(title) = request.title() {
        if title.trim().is_empty() {
            return Err(CcdError::InvalidRequest("image title is empty".to_string()));
        }
        if title.contains(std::path::MAIN_SEPARATOR) || title.contains('/') {
            return Err(CcdError::InvalidRequest(format!(
                "image title '{}' must not contain a path separator",
                title
            )));
        }
    }

    let shots: Vec<ShotDescriptor> = match request.mode() {
        ExposureMode::Single => vec![shot(request, 0, prior_seq_num, exposure_time, BTreeMap::new())],

        ExposureMode::Stack { image_count } => {
            if *image_count == 0 {
                return Err(CcdError::InvalidRequest(
                    "stack image count must be at least 1".to_string(),
                ));
            }
            check_shot_count(*image_count as usize)?;
            let start = request.start_seq_num();
            (0..*image_count as usize)
                .map(|i| shot(request, i, start + i as u64, exposure_time, BTreeMap::new()))
                .collect()
        }

        ExposureMode::Series {
            min_time,
            max_time,
            time_step,
        } => series_times(*min_time, *max_time, *time_step)?
            .into_iter()
            .enumerate()
            .map(|(i, t)| shot(request, i, prior_seq_num, t, BTreeMap::new()))
            .collect(),

        ExposureMode::VoltageScan { axes } => cartesian_product(axes)?
            .into_iter()
            .enumerate()
            .map(|(i, overrides)| shot(request, i, prior_seq_num, exposure_time, overrides))
            .collect(),
    };

    debug!(
        "Expanded {} {} request into {} shots",
        request.mode().name(),
        request.kind(),
        shots.len()
    );

    Ok(SequencePlan {
        shots,
        kind: request.kind(),
        mode: request.mode().name(),
        is_test: request.is_test(),
        metadata: request.metadata().clone(),
    })
}

fn shot(
    request: &ExposureRequest,
    sequence_index: usize,
    seq_num: u64,
    exposure_time_s: f64,
    voltage_overrides: BTreeMap<String, f64>,
) -> ShotDescriptor {
    let file_path = derive_path(request, seq_num, exposure_time_s, &voltage_overrides);
    ShotDescriptor {
        sequence_index,
        seq_num,
        exposure_time_s,
        voltage_overrides,
        file_path,
    }
}

/// `{dir}/{title}[_{rail}{volts}...].{kind}.{time}s.{seq}.fits`, or the fixed test image
fn derive_path(
    request: &ExposureRequest,
    seq_num: u64,
    exposure_time_s: f64,
    voltage_overrides: &BTreeMap<String, f64>,
) -> PathBuf {
    let title = match request.title() {
        FileTitle::Test => return request.directory().join(TEST_IMAGE_NAME),
        FileTitle::Title(title) => title.trim(),
    };

    // Suffixes follow axis declaration order, not map order
    let mut suffix = String::new();
    if let ExposureMode::VoltageScan { axes } = request.mode() {
        for axis in axes {
            if let Some(value) = voltage_overrides.get(&axis.name) {
                let rail: String = axis.name.chars().filter(|c| !c.is_whitespace()).collect();
                suffix.push_str(&format!("_{}{}", rail, format_decimal(*value)));
            }
        }
    }

    request.directory().join(format!(
        "{}{}.{}.{}s.{}.fits",
        title,
        suffix,
        request.kind().tag(),
        format_decimal(exposure_time_s),
        seq_num
    ))
}

fn check_shot_count(count: usize) -> Result<(), CcdError> {
    if count > MAX_PLANNED_SHOTS {
        return Err(CcdError::InvalidRequest(format!(
            "request expands to {} images, more than the limit of {}",
            count, MAX_PLANNED_SHOTS
        )));
    }
    Ok(())
}

/// Number of range points, capped so huge ranges never get enumerated
fn range_len(span: f64, step: f64) -> usize {
    let count = (span / step).floor() + 1.0;
    if count >= (MAX_PLANNED_SHOTS + 1) as f64 {
        MAX_PLANNED_SHOTS + 1
    } else {
        count.max(0.0) as usize
    }
}

/// Round to the microsecond / microvolt so repeated steps render cleanly
fn round_micro(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

fn series_times(min_time: f64, max_time: f64, time_step: f64) -> Result<Vec<f64>, CcdError> {
    if !(min_time.is_finite() && max_time.is_finite() && time_step.is_finite()) {
        return Err(CcdError::InvalidRequest(
            "series times must be finite".to_string(),
        ));
    }
    if min_time < 0.0 {
        return Err(CcdError::InvalidRequest(format!(
            "minimum time must be >= 0, got {}",
            min_time
        )));
    }
    if min_time > max_time {
        return Err(CcdError::InvalidRequest(
            "Minimum time must be less than Maximum time. Series not started.".to_string(),
        ));
    }
    if time_step <= 0.0 {
        return Err(CcdError::InvalidRequest(
            "Time step must be greater than 0. Series not started.".to_string(),
        ));
    }
    if time_step < MIN_STEP {
        return Err(CcdError::InvalidRequest(format!(
            "time step {} is below the 1 us resolution",
            time_step
        )));
    }
    check_shot_count(range_len(max_time - min_time, time_step))?;

    let limit = max_time + time_step * STEP_TOLERANCE;
    let mut times = Vec::new();
    let mut i: u64 = 0;
    loop {
        let t = min_time + i as f64 * time_step;
        if t > limit {
            break;
        }
        times.push(round_micro(t).min(max_time));
        i += 1;
    }
    Ok(times)
}

/// Values of one sweep axis, `min` inclusive and `max` exclusive
fn axis_values(axis: &SweepAxis) -> Result<Vec<f64>, CcdError> {
    if !(axis.min.is_finite() && axis.max.is_finite() && axis.step.is_finite()) {
        return Err(CcdError::InvalidRequest(format!(
            "sweep axis {} has non-finite bounds",
            axis.name
        )));
    }
    if axis.step <= 0.0 {
        return Err(CcdError::InvalidRequest(format!(
            "sweep axis {} step must be greater than 0, got {}",
            axis.name, axis.step
        )));
    }
    if axis.step < MIN_STEP {
        return Err(CcdError::InvalidRequest(format!(
            "sweep axis {} step {} is below the 1 uV resolution",
            axis.name, axis.step
        )));
    }
    check_shot_count(range_len(axis.max - axis.min, axis.step))?;

    let limit = axis.max - axis.step * STEP_TOLERANCE;
    let mut values = Vec::new();
    let mut i: u64 = 0;
    loop {
        let v = axis.min + i as f64 * axis.step;
        if v >= limit {
            break;
        }
        values.push(round_micro(v));
        i += 1;
    }

    if values.is_empty() {
        return Err(CcdError::InvalidRequest(format!(
            "sweep axis {} yields no values ({} to {})",
            axis.name, axis.min, axis.max
        )));
    }
    Ok(values)
}

/// Nested enumeration of all axes, first declared axis outermost
fn cartesian_product(axes: &[SweepAxis]) -> Result<Vec<BTreeMap<String, f64>>, CcdError> {
    if axes.is_empty() {
        return Err(CcdError::InvalidRequest(
            "voltage scan needs at least one sweep axis".to_string(),
        ));
    }
    // Rail names are matched loosely, so `VOD` and `vod` are the same axis
    let mut seen = BTreeSet::new();
    for axis in axes {
        let key = axis
            .name
            .parse::<Rail>()
            .map(|rail| rail.header_key().to_string())
            .unwrap_or_else(|_| axis.name.trim().to_string());
        if !seen.insert(key) {
            return Err(CcdError::InvalidRequest(format!(
                "sweep axis {} declared twice",
                axis.name
            )));
        }
    }

    let grids: Vec<Vec<f64>> = axes.iter().map(axis_values).collect::<Result<_, _>>()?;
    let total = grids
        .iter()
        .try_fold(1usize, |acc, grid| acc.checked_mul(grid.len()))
        .unwrap_or(usize::MAX);
    check_shot_count(total)?;
    let mut points = Vec::with_capacity(total);
    let mut cursor = vec![0usize; grids.len()];

    loop {
        points.push(
            axes.iter()
                .zip(&grids)
                .zip(&cursor)
                .map(|((axis, grid), &i)| (axis.name.clone(), grid[i]))
                .collect(),
        );

        // Odometer step: innermost axis turns fastest
        let mut digit = grids.len();
        loop {
            if digit == 0 {
                return Ok(points);
            }
            digit -= 1;
            cursor[digit] += 1;
            if cursor[digit] < grids[digit].len() {
                break;
            }
            cursor[digit] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::Path;

    fn request(kind: ExposureKind, mode: ExposureMode) -> ExposureRequest {
        ExposureRequest::new(kind, mode, FileTitle::Title("sta3800".to_string()), "/data")
    }

    #[test]
    fn test_single_uses_prior_seq_num() {
        let req = request(ExposureKind::Dark, ExposureMode::Single).with_exposure_time(10.0);
        let plan = expand(&req, 42).unwrap();

        assert_eq!(plan.total_count(), 1);
        let shot = &plan.shots()[0];
        assert_eq!(shot.seq_num, 42);
        assert_eq!(shot.sequence_index, 0);
        assert_eq!(shot.file_path, Path::new("/data/sta3800.dark.10.0s.42.fits"));
    }

    #[test]
    fn test_stack_numbering() {
        for (count, start) in [(1u32, 0u64), (5, 17), (12, 1000)] {
            let req = request(ExposureKind::Exposure, ExposureMode::Stack { image_count: count })
                .with_exposure_time(2.5)
                .with_start_seq_num(start);
            let plan = expand(&req, 999_999).unwrap();

            assert_eq!(plan.total_count(), count as usize);
            let seqs: Vec<u64> = plan.shots().iter().map(|s| s.seq_num).collect();
            let expected: Vec<u64> = (start..start + count as u64).collect();
            assert_eq!(seqs, expected);
            assert!(plan.shots().iter().all(|s| s.exposure_time_s == 2.5));
        }
    }

    #[test]
    fn test_stack_paths_are_distinct() {
        let req = request(ExposureKind::Bias, ExposureMode::Stack { image_count: 3 })
            .with_exposure_time(5.0)
            .with_start_seq_num(7);
        let plan = expand(&req, 0).unwrap();
        let paths: Vec<_> = plan.shots().iter().map(|s| s.file_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/data/sta3800.bias.0.0s.7.fits"),
                PathBuf::from("/data/sta3800.bias.0.0s.8.fits"),
                PathBuf::from("/data/sta3800.bias.0.0s.9.fits"),
            ]
        );
    }

    #[test]
    fn test_zero_image_stack_rejected() {
        let req = request(ExposureKind::Dark, ExposureMode::Stack { image_count: 0 });
        assert_eq!(expand(&req, 0).unwrap_err().kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_series_inclusive_upper_bound() {
        let req = request(
            ExposureKind::Dark,
            ExposureMode::Series {
                min_time: 0.0,
                max_time: 1.0,
                time_step: 0.25,
            },
        );
        let plan = expand(&req, 9).unwrap();
        let times: Vec<f64> = plan.shots().iter().map(|s| s.exposure_time_s).collect();
        assert_eq!(times, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert!(plan.shots().iter().all(|s| s.seq_num == 9));
        assert_eq!(
            plan.shots()[1].file_path,
            Path::new("/data/sta3800.dark.0.25s.9.fits")
        );
    }

    #[test]
    fn test_series_tolerates_float_drift() {
        let req = request(
            ExposureKind::Exposure,
            ExposureMode::Series {
                min_time: 0.1,
                max_time: 0.7,
                time_step: 0.1,
            },
        );
        let plan = expand(&req, 0).unwrap();
        let times: Vec<f64> = plan.shots().iter().map(|s| s.exposure_time_s).collect();
        assert_eq!(times, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7]);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_series_stops_below_max() {
        let req = request(
            ExposureKind::Dark,
            ExposureMode::Series {
                min_time: 1.0,
                max_time: 2.0,
                time_step: 0.3,
            },
        );
        let plan = expand(&req, 0).unwrap();
        let times: Vec<f64> = plan.shots().iter().map(|s| s.exposure_time_s).collect();
        assert_eq!(times, vec![1.0, 1.3, 1.6, 1.9]);
    }

    #[test]
    fn test_series_invalid_bounds() {
        let inverted = request(
            ExposureKind::Dark,
            ExposureMode::Series {
                min_time: 5.0,
                max_time: 1.0,
                time_step: 1.0,
            },
        );
        assert_eq!(expand(&inverted, 0).unwrap_err().kind(), ErrorKind::InvalidRequest);

        let flat_step = request(
            ExposureKind::Dark,
            ExposureMode::Series {
                min_time: 0.0,
                max_time: 1.0,
                time_step: 0.0,
            },
        );
        assert_eq!(expand(&flat_step, 0).unwrap_err().kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_voltage_scan_nested_order() {
        let req = request(
            ExposureKind::Exposure,
            ExposureMode::VoltageScan {
                axes: vec![
                    SweepAxis::new("V1", 0.0, 2.0, 1.0),
                    SweepAxis::new("V2", 10.0, 12.0, 1.0),
                ],
            },
        )
        .with_exposure_time(1.0);
        let plan = expand(&req, 3).unwrap();

        let pairs: Vec<(f64, f64)> = plan
            .shots()
            .iter()
            .map(|s| (s.voltage_overrides["V1"], s.voltage_overrides["V2"]))
            .collect();
        assert_eq!(pairs, vec![(0.0, 10.0), (0.0, 11.0), (1.0, 10.0), (1.0, 11.0)]);
        assert!(plan.shots().iter().all(|s| s.seq_num == 3 && s.exposure_time_s == 1.0));
        assert_eq!(
            plan.shots()[1].file_path,
            Path::new("/data/sta3800_V10.0_V211.0.exp.1.0s.3.fits")
        );
        assert_eq!(plan.voltage_names().into_iter().collect::<Vec<_>>(), vec!["V1", "V2"]);
    }

    #[test]
    fn test_voltage_scan_axis_order_drives_nesting() {
        let req = request(
            ExposureKind::Exposure,
            ExposureMode::VoltageScan {
                axes: vec![
                    SweepAxis::new("VRD", 12.0, 14.0, 1.0),
                    SweepAxis::new("VOD", 24.0, 25.0, 0.5),
                ],
            },
        );
        let plan = expand(&req, 0).unwrap();
        let pairs: Vec<(f64, f64)> = plan
            .shots()
            .iter()
            .map(|s| (s.voltage_overrides["VRD"], s.voltage_overrides["VOD"]))
            .collect();
        assert_eq!(
            pairs,
            vec![(12.0, 24.0), (12.0, 24.5), (13.0, 24.0), (13.0, 24.5)]
        );
    }

    #[test]
    fn test_voltage_scan_rejects_bad_axes() {
        let zero_step = request(
            ExposureKind::Exposure,
            ExposureMode::VoltageScan {
                axes: vec![SweepAxis::new("VOD", 24.0, 26.0, 0.0)],
            },
        );
        assert_eq!(expand(&zero_step, 0).unwrap_err().kind(), ErrorKind::InvalidRequest);

        let empty = request(ExposureKind::Exposure, ExposureMode::VoltageScan { axes: vec![] });
        assert!(expand(&empty, 0).is_err());

        let duplicate = request(
            ExposureKind::Exposure,
            ExposureMode::VoltageScan {
                axes: vec![
                    SweepAxis::new("VOD", 24.0, 26.0, 1.0),
                    SweepAxis::new("VOD", 20.0, 21.0, 1.0),
                ],
            },
        );
        assert!(expand(&duplicate, 0).is_err());
    }

    #[test]
    fn test_voltage_scan_rejects_same_rail_spelled_differently() {
        for (first, second) in [("VOD", "vod"), ("RG HI", "RG_HI"), ("par-lo", "PAR LO")] {
            let req = request(
                ExposureKind::Exposure,
                ExposureMode::VoltageScan {
                    axes: vec![
                        SweepAxis::new(first, 24.0, 26.0, 1.0),
                        SweepAxis::new(second, 20.0, 22.0, 1.0),
                    ],
                },
            );
            assert_eq!(
                expand(&req, 0).unwrap_err().kind(),
                ErrorKind::InvalidRequest,
                "{first} / {second}"
            );
        }
    }

    #[test]
    fn test_sub_microsecond_step_rejected() {
        let req = request(
            ExposureKind::Dark,
            ExposureMode::Series {
                min_time: 0.0,
                max_time: 2e-6,
                time_step: 4e-7,
            },
        );
        assert_eq!(expand(&req, 0).unwrap_err().kind(), ErrorKind::InvalidRequest);

        let fine_axis = request(
            ExposureKind::Exposure,
            ExposureMode::VoltageScan {
                axes: vec![SweepAxis::new("VOG", 0.0, 1e-6, 1e-7)],
            },
        );
        assert_eq!(expand(&fine_axis, 0).unwrap_err().kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_microsecond_series_keeps_distinct_paths() {
        let req = request(
            ExposureKind::Dark,
            ExposureMode::Series {
                min_time: 0.0,
                max_time: 3e-6,
                time_step: 1e-6,
            },
        );
        let plan = expand(&req, 0).unwrap();
        let paths: BTreeSet<_> = plan.shots().iter().map(|s| s.file_path.clone()).collect();
        assert_eq!(plan.total_count(), 4);
        assert_eq!(paths.len(), 4);
    }

    #[test]
    fn test_oversized_requests_rejected() {
        let long_series = request(
            ExposureKind::Exposure,
            ExposureMode::Series {
                min_time: 0.0,
                max_time: 3600.0,
                time_step: 0.0001,
            },
        );
        assert_eq!(expand(&long_series, 0).unwrap_err().kind(), ErrorKind::InvalidRequest);

        let huge_stack = request(
            ExposureKind::Bias,
            ExposureMode::Stack {
                image_count: MAX_PLANNED_SHOTS as u32 + 1,
            },
        );
        assert!(expand(&huge_stack, 0).is_err());

        let wide_grid = request(
            ExposureKind::Exposure,
            ExposureMode::VoltageScan {
                axes: vec![
                    SweepAxis::new("VOD", 0.0, 1000.0, 1.0),
                    SweepAxis::new("VRD", 0.0, 1000.0, 1.0),
                ],
            },
        );
        assert!(expand(&wide_grid, 0).is_err());

        let at_limit = request(
            ExposureKind::Exposure,
            ExposureMode::Series {
                min_time: 0.0,
                max_time: 999.99,
                time_step: 0.01,
            },
        );
        assert_eq!(expand(&at_limit, 0).unwrap().total_count(), MAX_PLANNED_SHOTS);
    }

    #[test]
    fn test_test_image_uses_fixed_path() {
        let req = ExposureRequest::new(
            ExposureKind::Exposure,
            ExposureMode::Stack { image_count: 3 },
            FileTitle::Test,
            "/data",
        );
        let plan = expand(&req, 0).unwrap();
        assert!(plan.is_test());
        assert!(plan
            .shots()
            .iter()
            .all(|s| s.file_path == Path::new("/data/test.fits")));
    }

    #[test]
    fn test_title_validation() {
        let empty = ExposureRequest::new(
            ExposureKind::Dark,
            ExposureMode::Single,
            FileTitle::Title("  ".to_string()),
            "/data",
        );
        assert!(expand(&empty, 0).is_err());

        let nested = ExposureRequest::new(
            ExposureKind::Dark,
            ExposureMode::Single,
            FileTitle::Title("a/b".to_string()),
            "/data",
        );
        assert!(expand(&nested, 0).is_err());
    }
}
