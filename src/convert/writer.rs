//! Entities -> STAR files.
//!
//! One writer per conversion, parameterized by the target [`FormatVersion`].
//! The 3.1 path emits an `optics` table plus a named entity table with
//! `rlnOpticsGroup` references; the legacy path writes a single unnamed
//! block with per-row acquisition labels. Pixel size in the legacy layout
//! rides on `rlnDetectorPixelSize` with `rlnMagnification` pinned at 10000,
//! so detector pixel size in microns equals image pixel size in Angstroms.

use std::io::Write;
use std::path::Path;

use log::debug;

use crate::model::{Acquisition, CtfModel, Micrograph, Particle};
use crate::optics::OpticsGroups;
use crate::star::{write_star, StarError, StarFile, StarTable, Value, ValueType};
use crate::transform::{decompose, shifts_for_row, AlignmentMode, AlignmentRecord};
use crate::version::{FormatVersion, MICROGRAPHS_TABLE, MOVIES_TABLE, PARTICLES_TABLE};

use super::ConvertError;

/// Magnification pinned by the legacy layout.
const LEGACY_MAGNIFICATION: f64 = 10000.0;

pub struct StarWriter {
    version: FormatVersion,
    optics: Option<OpticsGroups>,
}

impl StarWriter {
    pub fn new(version: FormatVersion) -> Self {
        Self {
            version,
            optics: None,
        }
    }

    /// Use a pre-built registry instead of deriving one from the images.
    pub fn with_optics(mut self, optics: OpticsGroups) -> Self {
        self.optics = Some(optics);
        self
    }

    pub fn write_movies(&self, movies: &[Micrograph], path: &Path) -> Result<(), ConvertError> {
        debug!("writing {} movies to {}", movies.len(), path.display());
        self.write_micrograph_like(movies, "rlnMicrographMovieName", MOVIES_TABLE, path)
    }

    pub fn write_micrographs(
        &self,
        micrographs: &[Micrograph],
        path: &Path,
    ) -> Result<(), ConvertError> {
        debug!(
            "writing {} micrographs to {}",
            micrographs.len(),
            path.display()
        );
        self.write_micrograph_like(micrographs, "rlnMicrographName", MICROGRAPHS_TABLE, path)
    }

    fn optics_for<'a, I>(&self, images: I) -> OpticsGroups
    where
        I: IntoIterator<Item = &'a Acquisition>,
    {
        match &self.optics {
            Some(o) => o.clone(),
            None => OpticsGroups::from_images(images),
        }
    }

    fn group_id(&self, optics: &OpticsGroups, acq: &Acquisition) -> Result<i64, ConvertError> {
        optics
            .id_for(acq)
            .map(|id| id as i64)
            .ok_or(ConvertError::Optics(crate::optics::OpticsError::Unassigned))
    }

    fn write_micrograph_like(
        &self,
        items: &[Micrograph],
        name_label: &str,
        table_name: &str,
        path: &Path,
    ) -> Result<(), ConvertError> {
        let mut file = StarFile::new();
        let optics = self.optics_for(items.iter().map(|m| &m.acquisition));

        let (table_name, with_optics) = match self.version {
            FormatVersion::Relion31 => {
                file.push(optics.to_table("rlnMicrographPixelSize")?);
                (table_name, true)
            }
            FormatVersion::Relion30 => ("", false),
        };

        let ctf = CtfColumns::probe(items.iter().map(|m| m.ctf.as_ref()));

        let mut t = StarTable::new(table_name);
        t.add_column(name_label, ValueType::Str, Value::from(""))?;
        if with_optics {
            t.add_column("rlnOpticsGroup", ValueType::Int, Value::from(0i64))?;
        } else {
            add_legacy_acquisition_columns(&mut t)?;
        }
        ctf.add_columns(&mut t)?;

        for m in items {
            let mut row: Vec<Value> = vec![m.file_name.as_str().into()];
            if with_optics {
                row.push(self.group_id(&optics, &m.acquisition)?.into());
            } else {
                push_legacy_acquisition(&mut row, &m.acquisition);
            }
            ctf.push_values(&mut row, m.ctf.as_ref());
            t.add_row(row)?;
        }
        file.push(t);

        self.write_file(&file, path)?;
        Ok(())
    }

    /// Write a particle set. `mode` selects which alignment columns are
    /// emitted; particles without a transform get identity geometry.
    pub fn write_particles(
        &self,
        particles: &[Particle],
        mode: AlignmentMode,
        path: &Path,
    ) -> Result<(), ConvertError> {
        debug!(
            "writing {} particles to {} ({:?} alignment)",
            particles.len(),
            path.display(),
            mode
        );
        let mut file = StarFile::new();
        let optics = self.optics_for(particles.iter().map(|p| &p.acquisition));

        let (table_name, with_optics) = match self.version {
            FormatVersion::Relion31 => {
                file.push(optics.to_table("rlnImagePixelSize")?);
                (PARTICLES_TABLE, true)
            }
            FormatVersion::Relion30 => ("", false),
        };

        let has_coord = particles.iter().any(|p| p.coordinate.is_some());
        let has_mic_name = particles
            .iter()
            .any(|p| p.coordinate.as_ref().is_some_and(|c| c.micrograph_name.is_some()));
        let has_class = particles.iter().any(|p| p.class_id.is_some());
        let ctf = CtfColumns::probe(particles.iter().map(|p| p.ctf.as_ref()));
        // First particle fixes the extra-label set and the column types.
        let extra_labels: Vec<(String, ValueType)> = particles
            .first()
            .map(|p| {
                p.extra
                    .iter()
                    .map(|(label, value)| {
                        let vtype = match value {
                            Value::Int(_) => ValueType::Int,
                            Value::Float(_) => ValueType::Float,
                            Value::Str(_) => ValueType::Str,
                        };
                        (label.clone(), vtype)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let shift_labels = self.version.shift_labels();

        let mut t = StarTable::new(table_name);
        t.add_column("rlnImageName", ValueType::Str, Value::from(""))?;
        t.add_column("rlnImageId", ValueType::Int, Value::from(0i64))?;
        if has_mic_name {
            t.add_column("rlnMicrographName", ValueType::Str, Value::from(""))?;
        }
        if has_coord {
            t.add_column("rlnCoordinateX", ValueType::Float, Value::from(0.0))?;
            t.add_column("rlnCoordinateY", ValueType::Float, Value::from(0.0))?;
        }
        if with_optics {
            t.add_column("rlnOpticsGroup", ValueType::Int, Value::from(0i64))?;
        } else {
            add_legacy_acquisition_columns(&mut t)?;
        }
        ctf.add_columns(&mut t)?;
        if has_class {
            t.add_column("rlnClassNumber", ValueType::Int, Value::from(0i64))?;
        }
        match mode {
            AlignmentMode::None => {}
            AlignmentMode::TwoD => {
                t.add_column(shift_labels[0], ValueType::Float, Value::from(0.0))?;
                t.add_column(shift_labels[1], ValueType::Float, Value::from(0.0))?;
                t.add_column("rlnAnglePsi", ValueType::Float, Value::from(0.0))?;
            }
            AlignmentMode::Proj => {
                for l in shift_labels {
                    t.add_column(l, ValueType::Float, Value::from(0.0))?;
                }
                t.add_column("rlnAngleRot", ValueType::Float, Value::from(0.0))?;
                t.add_column("rlnAngleTilt", ValueType::Float, Value::from(0.0))?;
                t.add_column("rlnAnglePsi", ValueType::Float, Value::from(0.0))?;
            }
        }
        for (label, vtype) in &extra_labels {
            t.add_column(label.clone(), *vtype, extra_default(*vtype))?;
        }

        for p in particles {
            let mut row: Vec<Value> = vec![p.location.to_string().into(), p.id.into()];
            if has_mic_name {
                let name = p
                    .coordinate
                    .as_ref()
                    .and_then(|c| c.micrograph_name.clone())
                    .unwrap_or_default();
                row.push(name.into());
            }
            if has_coord {
                let (x, y) = p
                    .coordinate
                    .as_ref()
                    .map(|c| (c.x, c.y))
                    .unwrap_or((0.0, 0.0));
                row.push(x.into());
                row.push(y.into());
            }
            if with_optics {
                row.push(self.group_id(&optics, &p.acquisition)?.into());
            } else {
                push_legacy_acquisition(&mut row, &p.acquisition);
            }
            ctf.push_values(&mut row, p.ctf.as_ref());
            if has_class {
                row.push((p.class_id.unwrap_or(0) as i64).into());
            }
            if mode != AlignmentMode::None {
                let record = p
                    .transform
                    .map(|m| decompose(&m, mode))
                    .unwrap_or_else(AlignmentRecord::identity);
                let shifts = shifts_for_row(&record, self.version, p.acquisition.pixel_size);
                row.push(shifts.x.into());
                row.push(shifts.y.into());
                if mode == AlignmentMode::Proj {
                    row.push(shifts.z.into());
                    row.push(record.rot.into());
                    row.push(record.tilt.into());
                }
                row.push(record.psi.into());
            }
            for (label, vtype) in &extra_labels {
                row.push(
                    p.extra
                        .get(label)
                        .cloned()
                        .unwrap_or_else(|| extra_default(*vtype)),
                );
            }
            t.add_row(row)?;
        }
        file.push(t);

        self.write_file(&file, path)?;
        Ok(())
    }

    fn write_file(&self, file: &StarFile, path: &Path) -> Result<(), StarError> {
        let f = std::fs::File::create(path).map_err(|e| StarError::from(e).in_file(path))?;
        let mut w = std::io::BufWriter::new(f);
        if self.version == FormatVersion::Relion31 {
            writeln!(w, "{}", crate::star::VERSION_STAMP)
                .map_err(|e| StarError::from(e).in_file(path))?;
        }
        write_star(file, &mut w).map_err(|e| e.in_file(path))?;
        w.flush().map_err(|e| StarError::from(e).in_file(path))
    }
}

/// Zero value matching an extra-label column's type, for particles that do
/// not carry the label.
fn extra_default(vtype: ValueType) -> Value {
    match vtype {
        ValueType::Int | ValueType::Bool => Value::from(0i64),
        ValueType::Float => Value::from(0.0),
        ValueType::Str => Value::from(""),
    }
}

fn add_legacy_acquisition_columns(t: &mut StarTable) -> Result<(), StarError> {
    t.add_column("rlnMagnification", ValueType::Float, Value::from(0.0))?;
    t.add_column("rlnDetectorPixelSize", ValueType::Float, Value::from(0.0))?;
    t.add_column("rlnVoltage", ValueType::Float, Value::from(0.0))?;
    t.add_column("rlnSphericalAberration", ValueType::Float, Value::from(0.0))?;
    t.add_column("rlnAmplitudeContrast", ValueType::Float, Value::from(0.0))?;
    Ok(())
}

fn push_legacy_acquisition(row: &mut Vec<Value>, acq: &Acquisition) {
    row.push(LEGACY_MAGNIFICATION.into());
    row.push(acq.pixel_size.into());
    row.push(acq.voltage.into());
    row.push(acq.spherical_aberration.into());
    row.push(acq.amplitude_contrast.into());
}

/// Which CTF columns the item set populates.
struct CtfColumns {
    present: bool,
    phase_shift: bool,
    psd_file: bool,
}

impl CtfColumns {
    fn probe<'a, I>(items: I) -> Self
    where
        I: IntoIterator<Item = Option<&'a CtfModel>>,
    {
        let mut out = Self {
            present: false,
            phase_shift: false,
            psd_file: false,
        };
        for ctf in items.into_iter().flatten() {
            out.present = true;
            out.phase_shift |= ctf.phase_shift.is_some();
            out.psd_file |= ctf.psd_file.is_some();
        }
        out
    }

    fn add_columns(&self, t: &mut StarTable) -> Result<(), StarError> {
        if !self.present {
            return Ok(());
        }
        t.add_column("rlnDefocusU", ValueType::Float, Value::from(0.0))?;
        t.add_column("rlnDefocusV", ValueType::Float, Value::from(0.0))?;
        t.add_column("rlnDefocusAngle", ValueType::Float, Value::from(0.0))?;
        t.add_column("rlnCtfFigureOfMerit", ValueType::Float, Value::from(0.0))?;
        t.add_column("rlnCtfMaxResolution", ValueType::Float, Value::from(0.0))?;
        if self.phase_shift {
            t.add_column("rlnPhaseShift", ValueType::Float, Value::from(0.0))?;
        }
        if self.psd_file {
            t.add_column("rlnCtfImage", ValueType::Str, Value::from(""))?;
        }
        Ok(())
    }

    fn push_values(&self, row: &mut Vec<Value>, ctf: Option<&CtfModel>) {
        if !self.present {
            return;
        }
        let default = CtfModel::new(0.0, 0.0, 0.0);
        let ctf = ctf.unwrap_or(&default);
        row.push(ctf.defocus_u.into());
        row.push(ctf.defocus_v.into());
        row.push(ctf.defocus_angle.into());
        row.push(ctf.fit_quality.into());
        row.push(ctf.max_resolution.into());
        if self.phase_shift {
            row.push(ctf.phase_shift.unwrap_or(0.0).into());
        }
        if self.psd_file {
            row.push(ctf.psd_file.clone().unwrap_or_default().into());
        }
    }
}
