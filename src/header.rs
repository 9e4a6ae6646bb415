use crate::acquisition::AcquisitionHandle;
use crate::error::CcdError;
use crate::fits::{self, CardValue, HeaderCard};
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// MJD of the Unix epoch, 1970-01-01T00:00:00Z
const MJD_UNIX_EPOCH: f64 = 40587.0;
const SECONDS_PER_DAY: f64 = 86_400.0;
const NOT_APPLICABLE: &str = "N/A";

/// Light source for the exposure; wavelength and filter are never both set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum Illumination {
    Monochromator { wavelength_nm: f64 },
    Filter { name: String },
}

impl Default for Illumination {
    fn default() -> Self {
        Illumination::Monochromator {
            wavelength_nm: 550.0,
        }
    }
}

/// Recognized header options; unset fields fall back to the stand defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderOverrides {
    pub imagetag: Option<String>,
    pub tstand: Option<String>,
    pub instrument: Option<String>,
    pub controller: Option<String>,
    pub contnum: Option<i64>,
    pub ccd_manu: Option<String>,
    pub ccd_type: Option<String>,
    pub ccd_sern: Option<String>,
    pub lsst_num: Option<String>,
    pub testtype: Option<String>,
    pub imgtype: Option<String>,
    pub temp_set: Option<f64>,
    pub ccdtemp: Option<f64>,
    pub mondiode: Option<f64>,
    pub illumination: Option<Illumination>,
    pub shut_del: Option<f64>,
    pub ctrlcfg: Option<String>,
    pub binx: Option<i64>,
    pub biny: Option<i64>,
    pub headver: Option<i64>,
    pub ccdgain: Option<f64>,
    pub ccdnoise: Option<f64>,
}

impl HeaderOverrides {
    /// Fields set in `top` win over fields set in `self`
    pub fn overlay(&self, top: &HeaderOverrides) -> HeaderOverrides {
        fn pick<T: Clone>(top: &Option<T>, base: &Option<T>) -> Option<T> {
            top.clone().or_else(|| base.clone())
        }
        HeaderOverrides {
            imagetag: pick(&top.imagetag, &self.imagetag),
            tstand: pick(&top.tstand, &self.tstand),
            instrument: pick(&top.instrument, &self.instrument),
            controller: pick(&top.controller, &self.controller),
            contnum: pick(&top.contnum, &self.contnum),
            ccd_manu: pick(&top.ccd_manu, &self.ccd_manu),
            ccd_type: pick(&top.ccd_type, &self.ccd_type),
            ccd_sern: pick(&top.ccd_sern, &self.ccd_sern),
            lsst_num: pick(&top.lsst_num, &self.lsst_num),
            testtype: pick(&top.testtype, &self.testtype),
            imgtype: pick(&top.imgtype, &self.imgtype),
            temp_set: pick(&top.temp_set, &self.temp_set),
            ccdtemp: pick(&top.ccdtemp, &self.ccdtemp),
            mondiode: pick(&top.mondiode, &self.mondiode),
            illumination: pick(&top.illumination, &self.illumination),
            shut_del: pick(&top.shut_del, &self.shut_del),
            ctrlcfg: pick(&top.ctrlcfg, &self.ctrlcfg),
            binx: pick(&top.binx, &self.binx),
            biny: pick(&top.biny, &self.biny),
            headver: pick(&top.headver, &self.headver),
            ccdgain: pick(&top.ccdgain, &self.ccdgain),
            ccdnoise: pick(&top.ccdnoise, &self.ccdnoise),
        }
    }
}

/// Fully resolved header content for one acquired image
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderFields {
    pub imagetag: String,
    pub tstand: String,
    pub instrument: String,
    pub controller: String,
    pub contnum: i64,
    pub ccd_manu: String,
    pub ccd_type: String,
    pub ccd_sern: String,
    pub lsst_num: String,
    pub testtype: String,
    pub imgtype: String,
    pub seqnum: u64,
    pub temp_set: f64,
    pub ccdtemp: f64,
    pub mondiode: f64,
    pub illumination: Illumination,
    pub exptime: f64,
    pub shut_del: f64,
    pub ctrlcfg: String,
    pub filename: String,
    pub binx: i64,
    pub biny: i64,
    pub headver: i64,
    pub ccdgain: f64,
    pub ccdnoise: f64,
    pub acquired_at: DateTime<Utc>,
    /// Rail values keyed by their header keyword
    pub voltages: BTreeMap<String, f64>,
}

impl HeaderFields {
    pub fn resolve(
        overrides: &HeaderOverrides,
        handle: &AcquisitionHandle,
        voltages: BTreeMap<String, f64>,
    ) -> Self {
        let o = overrides;
        let text = |v: &Option<String>, default: &str| v.clone().unwrap_or_else(|| default.to_string());
        let filename = handle
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            imagetag: text(&o.imagetag, "[lots of digits]"),
            tstand: text(&o.tstand, "Stanford-KGLab"),
            instrument: text(&o.instrument, "SAO16"),
            controller: text(&o.controller, "SAO16"),
            contnum: o.contnum.unwrap_or(1),
            ccd_manu: text(&o.ccd_manu, "ITL"),
            ccd_type: text(&o.ccd_type, "3800C"),
            ccd_sern: text(&o.ccd_sern, "19351"),
            lsst_num: text(&o.lsst_num, "3800C-033"),
            testtype: text(&o.testtype, handle.kind.test_type()),
            imgtype: text(&o.imgtype, handle.kind.image_type()),
            seqnum: handle.seq_num,
            temp_set: o.temp_set.unwrap_or(-95.0),
            ccdtemp: o.ccdtemp.unwrap_or(-95.12),
            mondiode: o.mondiode.unwrap_or(143.12),
            illumination: o.illumination.clone().unwrap_or_default(),
            exptime: handle.exposure_time_s,
            shut_del: o.shut_del.unwrap_or(0.0),
            ctrlcfg: text(&o.ctrlcfg, "abcde.xml"),
            filename,
            binx: o.binx.unwrap_or(1),
            biny: o.biny.unwrap_or(1),
            headver: o.headver.unwrap_or(1),
            ccdgain: o.ccdgain.unwrap_or(5.52),
            ccdnoise: o.ccdnoise.unwrap_or(6.0),
            acquired_at: handle.acquired_at,
            voltages,
        }
    }

    /// The fixed card schema, in writing order
    /// Header cards in schema order; fails when a value does not fit a FITS integer
    pub fn cards(&self) -> Result<Vec<HeaderCard>, CcdError> {
        let seqnum = i64::try_from(self.seqnum).map_err(|_| {
            CcdError::HeaderWriteFailed(format!(
                "sequence number {} does not fit in a FITS integer",
                self.seqnum
            ))
        })?;
        let (monowl, filter): (CardValue, CardValue) = match &self.illumination {
            Illumination::Monochromator { wavelength_nm } => {
                (CardValue::Float(*wavelength_nm), NOT_APPLICABLE.into())
            }
            Illumination::Filter { name } => (NOT_APPLICABLE.into(), name.as_str().into()),
        };

        let mut cards = vec![
            HeaderCard::new("IMAGETAG", self.imagetag.as_str(), "Image tag (CCS/VST)"),
            HeaderCard::new("TSTAND", self.tstand.as_str(), "Which test stand at the site was used."),
            HeaderCard::new("INSTRUME", self.instrument.as_str(), "CCD Controller type"),
            HeaderCard::new("CONTROLL", self.controller.as_str(), "Duplicates INSTRUME"),
            HeaderCard::new("CONTNUM", self.contnum, "CCD Controller Serial Number"),
            HeaderCard::new("CCD_MANU", self.ccd_manu.as_str(), "CCD Manufacturer"),
            HeaderCard::new("CCD_TYPE", self.ccd_type.as_str(), "CCD Model Number"),
            HeaderCard::new("CCD_SERN", self.ccd_sern.as_str(), "Manufacturers' CCD Serial Number"),
            HeaderCard::new("LSST_NUM", self.lsst_num.as_str(), "LSST Assigned CCD Number"),
            HeaderCard::new("TESTTYPE", self.testtype.as_str(), "dark:fe55:flat:lambda:spot:sflat_nnn:trap"),
            HeaderCard::new("IMGTYPE", self.imgtype.as_str(), "BIAS, DARK, ..."),
            HeaderCard::new("SEQNUM", seqnum, "Sequence number extracted from the original filename"),
            HeaderCard::new("TEMP_SET", self.temp_set, "Temperature set point"),
            HeaderCard::new("CCDTEMP", self.ccdtemp, "Measured temperature"),
            HeaderCard::new("MONDIODE", self.mondiode, "Current in the monitoring diode"),
            HeaderCard::new("MONOWL", monowl, "Monochromator wavelength"),
            HeaderCard::new("FILTER", filter, "Name of the filter"),
            HeaderCard::new("EXPTIME", self.exptime, "Exposure Time in Seconds"),
            HeaderCard::new("SHUT_DEL", self.shut_del, "Delay between shutter close command and readout"),
            HeaderCard::new("CTRLCFG", self.ctrlcfg.as_str(), "Name of the CCD controller configuration file"),
            HeaderCard::new("FILENAME", self.filename.as_str(), "Original name of the file"),
            HeaderCard::new("BINX", self.binx, "[pixels] binning along X axis"),
            HeaderCard::new("BINY", self.biny, "[pixels] binning along Y axis"),
            HeaderCard::new("HEADVER", self.headver, "Version number of header"),
            HeaderCard::new("CCDGAIN", self.ccdgain, "Rough guess at overall system gain"),
            HeaderCard::new("CCDNOISE", self.ccdnoise, "Rough guess at system noise"),
            HeaderCard::new(
                "DATE-OBS",
                self.acquired_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                "UTC date of the exposure",
            ),
            HeaderCard::new("MJD-OBS", modified_julian_date(self.acquired_at), "Modified Julian Date of the exposure"),
        ];

        for (key, volts) in &self.voltages {
            cards.push(HeaderCard::new(key, *volts, "[V] bias rail setting"));
        }
        Ok(cards)
    }
}

pub fn modified_julian_date(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0 / SECONDS_PER_DAY + MJD_UNIX_EPOCH
}

/// Writes identification and test-configuration metadata into an acquired image
pub trait HeaderAnnotator {
    fn annotate(&mut self, handle: &AcquisitionHandle, fields: &HeaderFields) -> Result<(), CcdError>;
}

/// Annotates the primary header of the FITS file in place
#[derive(Debug, Default, Clone)]
pub struct FitsHeaderAnnotator;

impl HeaderAnnotator for FitsHeaderAnnotator {
    fn annotate(&mut self, handle: &AcquisitionHandle, fields: &HeaderFields) -> Result<(), CcdError> {
        let cards = fields.cards()?;
        fits::update_header(&handle.path, &cards)?;
        debug!("Wrote {} header cards to {}", cards.len(), handle.path.display());
        Ok(())
    }
}
