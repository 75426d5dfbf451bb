//! STAR files -> entities.
//!
//! The reader streams entity rows off disk, resolves acquisition metadata
//! through the optics registry (or the legacy per-row labels), rebuilds
//! alignment transforms, and carries non-geometric extra labels through the
//! two-phase [`ExtraLabels`] protocol: the first row fixes which optional
//! labels exist for the whole batch, later rows never re-probe.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::debug;

use crate::model::{Acquisition, Coordinate, CtfModel, Micrograph, Particle};
use crate::optics::OpticsGroups;
use crate::star::{LabelRegistry, RowReader, StarError, StarRow, Value};
use crate::transform::{compose, record_from_row, required_labels, AlignmentMode};
use crate::version::{FormatVersion, MICROGRAPHS_TABLE, MOVIES_TABLE, OPTICS_TABLE};

use super::ConvertError;

/// Optional per-particle labels copied through without interpretation.
pub const PARTICLE_EXTRA_LABELS: &[&str] = &[
    "rlnNormCorrection",
    "rlnLogLikeliContribution",
    "rlnMaxValueProbDistribution",
    "rlnRandomSubset",
];

/// Detect a file's format version by scanning for a `data_optics` block.
///
/// This is the single version rule: row contents are never inspected and a
/// missing block is not an error, it selects the legacy path.
pub fn detect_version_path(path: &Path) -> Result<FormatVersion, StarError> {
    let file = File::open(path).map_err(|e| StarError::from(e).in_file(path))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| StarError::from(e).in_file(path))?;
        if line.trim() == format!("data_{OPTICS_TABLE}") {
            return Ok(FormatVersion::Relion31);
        }
    }
    Ok(FormatVersion::Relion30)
}

/// The label set fixed by a batch's first row.
#[derive(Debug, Clone)]
pub struct ExtraLabels {
    labels: Vec<String>,
}

impl ExtraLabels {
    /// Phase one: keep the candidates the first row actually has.
    pub fn discover(first_row: &StarRow, candidates: &[&str]) -> Self {
        Self {
            labels: candidates
                .iter()
                .filter(|l| first_row.has(l))
                .map(|l| l.to_string())
                .collect(),
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Phase two: copy the discovered labels from a row.
    pub fn apply(
        &self,
        row: &StarRow,
        extra: &mut BTreeMap<String, Value>,
    ) -> Result<(), StarError> {
        for label in &self.labels {
            extra.insert(label.clone(), row.get(label)?.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StarReader {
    registry: LabelRegistry,
}

impl StarReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: LabelRegistry) -> Self {
        Self { registry }
    }

    /// The optics registry of a 3.1 file; `None` on the legacy path.
    pub fn read_optics(&self, path: &Path) -> Result<Option<OpticsGroups>, ConvertError> {
        match detect_version_path(path)? {
            FormatVersion::Relion31 => {
                Ok(Some(OpticsGroups::from_star_path(path, &self.registry)?))
            }
            FormatVersion::Relion30 => Ok(None),
        }
    }

    pub fn read_micrographs(&self, path: &Path) -> Result<Vec<Micrograph>, ConvertError> {
        self.read_micrograph_like(path, "rlnMicrographName", MICROGRAPHS_TABLE)
    }

    pub fn read_movies(&self, path: &Path) -> Result<Vec<Micrograph>, ConvertError> {
        self.read_micrograph_like(path, "rlnMicrographMovieName", MOVIES_TABLE)
    }

    fn read_micrograph_like(
        &self,
        path: &Path,
        name_label: &str,
        table_name: &str,
    ) -> Result<Vec<Micrograph>, ConvertError> {
        let version = detect_version_path(path)?;
        let optics = self.read_optics(path)?;
        let table = version.has_optics().then_some(table_name);

        let mut out = Vec::new();
        for row in RowReader::open(path, table, &self.registry)? {
            let row = row?;
            let acquisition = self.acquisition_for(&row, &optics)?;
            out.push(Micrograph {
                id: row.index() as i64 + 1,
                file_name: row.get_str(name_label)?.to_string(),
                acquisition,
                ctf: ctf_from_row(&row)?,
            });
        }
        debug!("read {} rows from {}", out.len(), path.display());
        Ok(out)
    }

    /// Read a particle table, rebuilding transforms for the given alignment
    /// mode. Requesting alignment on a file without the needed columns is a
    /// schema mismatch naming the missing labels.
    pub fn read_particles(
        &self,
        path: &Path,
        mode: AlignmentMode,
    ) -> Result<Vec<Particle>, ConvertError> {
        let version = detect_version_path(path)?;
        let optics = self.read_optics(path)?;

        let reader = RowReader::open(path, version.data_table(), &self.registry)?;
        let mut extra_labels: Option<ExtraLabels> = None;
        let mut out = Vec::new();
        for row in reader {
            let row = row?;
            if extra_labels.is_none() {
                check_alignment_columns(&row, mode, version)?;
                extra_labels = Some(ExtraLabels::discover(&row, PARTICLE_EXTRA_LABELS));
            }
            let mut particle = self.particle_from_row(&row, version, &optics, mode)?;
            if let Some(labels) = &extra_labels {
                labels.apply(&row, &mut particle.extra)?;
            }
            out.push(particle);
        }
        debug!(
            "read {} particles from {} ({:?}, {:?})",
            out.len(),
            path.display(),
            version,
            mode
        );
        Ok(out)
    }

    fn particle_from_row(
        &self,
        row: &StarRow,
        version: FormatVersion,
        optics: &Option<OpticsGroups>,
        mode: AlignmentMode,
    ) -> Result<Particle, ConvertError> {
        let location = row.get_str("rlnImageName")?.parse()?;
        let id = row
            .opt_i64("rlnImageId")
            .unwrap_or(row.index() as i64 + 1);
        let acquisition = self.acquisition_for(row, optics)?;

        let mut particle = Particle::new(id, location, acquisition);
        if row.has("rlnCoordinateX") {
            particle.coordinate = Some(Coordinate {
                x: row.get_f64("rlnCoordinateX")?,
                y: row.get_f64("rlnCoordinateY")?,
                micrograph_name: row.opt_str("rlnMicrographName").map(str::to_string),
                micrograph_id: row.opt_i64("rlnMicrographId"),
            });
        }
        particle.ctf = ctf_from_row(row)?;
        particle.class_id = row.opt_i64("rlnClassNumber").map(|c| c as u32);
        if mode != AlignmentMode::None {
            let record = record_from_row(row, version, particle.acquisition.pixel_size)?;
            particle.transform = record.map(|r| compose(&r, mode));
        }
        Ok(particle)
    }

    /// Acquisition metadata for one row: via the optics reference on 3.1
    /// files, from the per-row legacy labels otherwise.
    fn acquisition_for(
        &self,
        row: &StarRow,
        optics: &Option<OpticsGroups>,
    ) -> Result<Acquisition, ConvertError> {
        match optics {
            Some(groups) => {
                let id = row.get_i64("rlnOpticsGroup")? as u32;
                let group = groups.check_reference(id, row.index())?;
                Ok(group.acquisition.clone())
            }
            None => Ok(legacy_acquisition(row)),
        }
    }
}

fn check_alignment_columns(
    row: &StarRow,
    mode: AlignmentMode,
    version: FormatVersion,
) -> Result<(), ConvertError> {
    if mode == AlignmentMode::None {
        return Ok(());
    }
    if !row.has_any(&required_labels(mode, version)) {
        return Err(ConvertError::MissingColumns {
            table: version.data_table().unwrap_or("").to_string(),
            columns: required_labels(mode, version)
                .iter()
                .map(|l| l.to_string())
                .collect(),
        });
    }
    Ok(())
}

fn legacy_acquisition(row: &StarRow) -> Acquisition {
    let defaults = Acquisition::default();
    let pixel_size = match (
        row.opt_f64("rlnDetectorPixelSize"),
        row.opt_f64("rlnMagnification"),
    ) {
        (Some(dps), Some(mag)) if mag > 0.0 => dps * 10000.0 / mag,
        _ => defaults.pixel_size,
    };
    Acquisition {
        pixel_size,
        voltage: row.opt_f64("rlnVoltage").unwrap_or(defaults.voltage),
        spherical_aberration: row
            .opt_f64("rlnSphericalAberration")
            .unwrap_or(defaults.spherical_aberration),
        amplitude_contrast: row
            .opt_f64("rlnAmplitudeContrast")
            .unwrap_or(defaults.amplitude_contrast),
        ..defaults
    }
}

fn ctf_from_row(row: &StarRow) -> Result<Option<CtfModel>, StarError> {
    if !row.has("rlnDefocusU") {
        return Ok(None);
    }
    let defocus_u = row.get_f64("rlnDefocusU")?;
    Ok(Some(CtfModel {
        defocus_u,
        defocus_v: row.opt_f64("rlnDefocusV").unwrap_or(defocus_u),
        defocus_angle: row.opt_f64("rlnDefocusAngle").unwrap_or(0.0),
        phase_shift: row
            .opt_f64("rlnPhaseShift")
            .or_else(|| row.opt_f64("rlnCtfPhaseShift")),
        fit_quality: row.opt_f64("rlnCtfFigureOfMerit").unwrap_or(0.0),
        max_resolution: row.opt_f64("rlnCtfMaxResolution").unwrap_or(0.0),
        psd_file: row.opt_str("rlnCtfImage").map(str::to_string),
    }))
}
