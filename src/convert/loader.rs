//! Per-iteration class/data loader.
//!
//! Each refinement iteration produces a model file (per-class summaries in
//! `model_classes`) and a data file (per-particle rows). The loader reads
//! both, sorts the per-particle assignments by their stable id key, and
//! applies the result to a particle set in one pass. Loading an iteration
//! fully replaces any previously loaded state; there is no incremental
//! update between iterations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glam::DMat4;
use log::debug;

use crate::model::{ClassInfo, Particle};
use crate::optics::OpticsGroups;
use crate::star::{LabelRegistry, RowReader, StarRow, Value};
use crate::transform::{compose, record_from_row, AlignmentMode};
use crate::version::FormatVersion;

use super::reader::{detect_version_path, ExtraLabels, PARTICLE_EXTRA_LABELS};
use super::ConvertError;

/// Table holding the per-class rows inside a model file.
pub const MODEL_CLASSES_TABLE: &str = "model_classes";

/// Optional per-class attributes carried into [`ClassInfo::extra`].
const CLASS_EXTRA_LABELS: &[&str] = &[
    "rlnEstimatedResolution",
    "rlnOverallFourierCompleteness",
];

/// Model/data file pair of one iteration, `run_it025_model.star` style.
pub fn iteration_paths(dir: &Path, iteration: u32) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("run_it{iteration:03}_model.star")),
        dir.join(format!("run_it{iteration:03}_data.star")),
    )
}

/// One particle's class membership and geometry for a loaded iteration.
#[derive(Debug, Clone)]
pub struct ClassAssignment {
    pub particle_id: i64,
    pub class_id: u32,
    pub transform: Option<DMat4>,
    pub extra: BTreeMap<String, Value>,
}

/// Everything read from one iteration's file pair.
#[derive(Debug, Clone)]
pub struct IterationData {
    pub iteration: u32,
    pub version: FormatVersion,
    pub classes: Vec<ClassInfo>,
    /// Sorted by `particle_id`.
    pub assignments: Vec<ClassAssignment>,
}

/// Loads refinement iterations and applies them to particle sets.
pub struct ClassesLoader {
    registry: LabelRegistry,
    mode: AlignmentMode,
    loaded: Option<IterationData>,
}

impl ClassesLoader {
    pub fn new(mode: AlignmentMode) -> Self {
        Self {
            registry: LabelRegistry::default(),
            mode,
            loaded: None,
        }
    }

    pub fn with_registry(mode: AlignmentMode, registry: LabelRegistry) -> Self {
        Self {
            registry,
            mode,
            loaded: None,
        }
    }

    /// Currently loaded iteration, if any.
    pub fn loaded(&self) -> Option<&IterationData> {
        self.loaded.as_ref()
    }

    /// Read one iteration's model/data pair, replacing any loaded state.
    pub fn load_iteration(
        &mut self,
        model_path: &Path,
        data_path: &Path,
        iteration: u32,
    ) -> Result<&IterationData, ConvertError> {
        let version = detect_version_path(data_path)?;
        debug!(
            "loading iteration {iteration}: {} + {} ({version:?})",
            model_path.display(),
            data_path.display()
        );

        let classes = self.read_classes(model_path, version)?;
        let assignments = self.read_assignments(data_path, version)?;
        debug!(
            "iteration {iteration}: {} classes, {} particle assignments",
            classes.len(),
            assignments.len()
        );

        Ok(self.loaded.insert(IterationData {
            iteration,
            version,
            classes,
            assignments,
        }))
    }

    fn read_classes(
        &self,
        model_path: &Path,
        version: FormatVersion,
    ) -> Result<Vec<ClassInfo>, ConvertError> {
        let accuracy_label = version.accuracy_translations_label();
        let mut labels: Option<ExtraLabels> = None;
        let mut classes = Vec::new();
        for row in RowReader::open(model_path, Some(MODEL_CLASSES_TABLE), &self.registry)? {
            let row = row?;
            let labels =
                labels.get_or_insert_with(|| ExtraLabels::discover(&row, CLASS_EXTRA_LABELS));
            let mut info = ClassInfo {
                id: row.index() as u32 + 1,
                reference: row.get_str("rlnReferenceImage")?.parse()?,
                distribution: row.opt_f64("rlnClassDistribution").unwrap_or(0.0),
                accuracy_rotations: row.opt_f64("rlnAccuracyRotations").unwrap_or(0.0),
                accuracy_translations: row.opt_f64(accuracy_label).unwrap_or(0.0),
                extra: BTreeMap::new(),
            };
            labels.apply(&row, &mut info.extra)?;
            classes.push(info);
        }
        Ok(classes)
    }

    fn read_assignments(
        &self,
        data_path: &Path,
        version: FormatVersion,
    ) -> Result<Vec<ClassAssignment>, ConvertError> {
        let optics = match version {
            FormatVersion::Relion31 => {
                Some(OpticsGroups::from_star_path(data_path, &self.registry)?)
            }
            FormatVersion::Relion30 => None,
        };

        let mut labels: Option<ExtraLabels> = None;
        let mut assignments = Vec::new();
        for row in RowReader::open(data_path, version.data_table(), &self.registry)? {
            let row = row?;
            let labels =
                labels.get_or_insert_with(|| ExtraLabels::discover(&row, PARTICLE_EXTRA_LABELS));

            let particle_id = row
                .opt_i64("rlnImageId")
                .unwrap_or(row.index() as i64 + 1);
            let class_id = row.get_i64("rlnClassNumber")? as u32;

            let transform = if self.mode == AlignmentMode::None {
                None
            } else {
                let pixel_size = self.pixel_size_for(&row, &optics)?;
                record_from_row(&row, version, pixel_size)?.map(|r| compose(&r, self.mode))
            };

            let mut extra = BTreeMap::new();
            labels.apply(&row, &mut extra)?;
            assignments.push(ClassAssignment {
                particle_id,
                class_id,
                transform,
                extra,
            });
        }
        assignments.sort_by_key(|a| a.particle_id);
        Ok(assignments)
    }

    fn pixel_size_for(
        &self,
        row: &StarRow,
        optics: &Option<OpticsGroups>,
    ) -> Result<f64, ConvertError> {
        match optics {
            Some(groups) => {
                let id = row.get_i64("rlnOpticsGroup")? as u32;
                let group = groups.check_reference(id, row.index())?;
                Ok(group.acquisition.pixel_size)
            }
            None => Ok(1.0), // legacy shifts are already pixels
        }
    }

    /// Apply the loaded iteration to a particle set in a single pass.
    ///
    /// Matched particles get their class, transform and extra labels
    /// replaced; particles absent from the iteration lose their class
    /// assignment (the load is a full rebuild, not a diff).
    pub fn apply_to(&self, particles: &mut [Particle]) -> Result<(), ConvertError> {
        let data = self.loaded.as_ref().ok_or(ConvertError::NotLoaded)?;
        let by_id: BTreeMap<i64, &ClassAssignment> = data
            .assignments
            .iter()
            .map(|a| (a.particle_id, a))
            .collect();
        for p in particles {
            match by_id.get(&p.id) {
                Some(a) => {
                    p.class_id = Some(a.class_id);
                    p.transform = a.transform;
                    p.extra.extend(a.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                None => p.class_id = None,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::ImageLocation;
    use crate::model::Acquisition;
    use approx::assert_relative_eq;
    use std::io::Write;

    const MODEL_31: &str = "\
# version 30001

data_model_general

_rlnNrClasses 2
_rlnPixelSize 1.100000

data_model_classes

loop_
_rlnReferenceImage #1
_rlnClassDistribution #2
_rlnAccuracyRotations #3
_rlnAccuracyTranslationsAngst #4
_rlnEstimatedResolution #5
000001@run_it025_classes.mrcs 0.600000 2.500000 1.200000 8.500000
000002@run_it025_classes.mrcs 0.400000 3.100000 1.500000 9.800000
";

    const DATA_31: &str = "\
# version 30001

data_optics

loop_
_rlnOpticsGroup #1
_rlnOpticsGroupName #2
_rlnImagePixelSize #3
1 opticsGroup1 1.100000

data_particles

loop_
_rlnImageName #1
_rlnImageId #2
_rlnOpticsGroup #3
_rlnClassNumber #4
_rlnAngleRot #5
_rlnAngleTilt #6
_rlnAnglePsi #7
_rlnOriginXAngst #8
_rlnOriginYAngst #9
_rlnNormCorrection #10
000002@stack.mrcs 12 1 2 10.000000 60.000000 -20.000000 2.200000 -1.100000 1.010000
000001@stack.mrcs 4 1 1 0.000000 90.000000 45.000000 0.000000 1.100000 0.950000
";

    fn write_tmp(text: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f
    }

    #[test]
    fn iteration_file_names() {
        let (model, data) = iteration_paths(Path::new("Runs/004_class3d"), 25);
        assert_eq!(model, Path::new("Runs/004_class3d/run_it025_model.star"));
        assert_eq!(data, Path::new("Runs/004_class3d/run_it025_data.star"));
    }

    #[test]
    fn loads_classes_and_sorted_assignments() {
        let model = write_tmp(MODEL_31);
        let data = write_tmp(DATA_31);
        let mut loader = ClassesLoader::new(AlignmentMode::Proj);
        let it = loader
            .load_iteration(model.path(), data.path(), 25)
            .unwrap();

        assert_eq!(it.iteration, 25);
        assert_eq!(it.version, FormatVersion::Relion31);
        assert_eq!(it.classes.len(), 2);
        let c1 = &it.classes[0];
        assert_eq!(c1.id, 1);
        assert_eq!(
            c1.reference,
            ImageLocation::new(1, "run_it025_classes.mrcs")
        );
        assert_relative_eq!(c1.distribution, 0.6);
        assert_eq!(
            c1.extra.get("rlnEstimatedResolution"),
            Some(&Value::from(8.5))
        );

        // File order is 12 then 4; assignments come back sorted by id.
        let ids: Vec<i64> = it.assignments.iter().map(|a| a.particle_id).collect();
        assert_eq!(ids, vec![4, 12]);
        assert_eq!(it.assignments[0].class_id, 1);
        assert_eq!(it.assignments[1].class_id, 2);
        assert_eq!(
            it.assignments[1].extra.get("rlnNormCorrection"),
            Some(&Value::from(1.01))
        );

        // Angstrom shifts divided by the optics pixel size.
        let rec = crate::transform::decompose(
            &it.assignments[1].transform.unwrap(),
            AlignmentMode::Proj,
        );
        assert_relative_eq!(rec.shift.x, 2.2 / 1.1, epsilon = 1e-3);
        assert_relative_eq!(rec.tilt, 60.0, epsilon = 1e-4);
    }

    #[test]
    fn apply_is_a_full_rebuild() {
        let model = write_tmp(MODEL_31);
        let data = write_tmp(DATA_31);
        let mut loader = ClassesLoader::new(AlignmentMode::Proj);
        loader
            .load_iteration(model.path(), data.path(), 25)
            .unwrap();

        let mut particles = vec![
            Particle::new(4, ImageLocation::new(1, "stack.mrcs"), Acquisition::default()),
            Particle::new(12, ImageLocation::new(2, "stack.mrcs"), Acquisition::default()),
            Particle::new(99, ImageLocation::new(3, "stack.mrcs"), Acquisition::default()),
        ];
        particles[2].class_id = Some(7); // stale from a previous iteration

        loader.apply_to(&mut particles).unwrap();
        assert_eq!(particles[0].class_id, Some(1));
        assert_eq!(particles[1].class_id, Some(2));
        assert!(particles[1].transform.is_some());
        assert_eq!(particles[2].class_id, None);
        assert_eq!(
            particles[0].extra.get("rlnNormCorrection"),
            Some(&Value::from(0.95))
        );
    }

    #[test]
    fn apply_clears_stale_transform_when_iteration_has_none() {
        let model = write_tmp(MODEL_31);
        let data = write_tmp(DATA_31);
        // Unaligned load: assignments carry class ids but no geometry.
        let mut loader = ClassesLoader::new(AlignmentMode::None);
        loader
            .load_iteration(model.path(), data.path(), 25)
            .unwrap();

        let mut particles = vec![Particle::new(
            4,
            ImageLocation::new(1, "stack.mrcs"),
            Acquisition::default(),
        )];
        particles[0].transform = Some(glam::DMat4::IDENTITY); // from an earlier iteration

        loader.apply_to(&mut particles).unwrap();
        assert_eq!(particles[0].class_id, Some(1));
        assert!(particles[0].transform.is_none());
    }

    #[test]
    fn reload_replaces_state() {
        let model = write_tmp(MODEL_31);
        let data = write_tmp(DATA_31);
        let mut loader = ClassesLoader::new(AlignmentMode::Proj);
        assert!(loader.loaded().is_none());
        loader
            .load_iteration(model.path(), data.path(), 24)
            .unwrap();
        assert_eq!(loader.loaded().unwrap().iteration, 24);
        loader
            .load_iteration(model.path(), data.path(), 25)
            .unwrap();
        assert_eq!(loader.loaded().unwrap().iteration, 25);
    }

    #[test]
    fn apply_without_load_fails() {
        let loader = ClassesLoader::new(AlignmentMode::None);
        let mut particles = Vec::new();
        assert!(matches!(
            loader.apply_to(&mut particles),
            Err(ConvertError::NotLoaded)
        ));
    }

    #[test]
    fn legacy_data_table_is_first_block() {
        let model = write_tmp(
            "data_model_classes\nloop_\n_rlnReferenceImage #1\n_rlnClassDistribution #2\n_rlnAccuracyRotations #3\n_rlnAccuracyTranslations #4\n000001@cls.mrcs 1.000000 2.000000 1.000000\n",
        );
        let data = write_tmp(
            "data_\nloop_\n_rlnImageName #1\n_rlnClassNumber #2\n000001@s.mrcs 1\n000002@s.mrcs 1\n",
        );
        let mut loader = ClassesLoader::new(AlignmentMode::None);
        let it = loader
            .load_iteration(model.path(), data.path(), 1)
            .unwrap();
        assert_eq!(it.version, FormatVersion::Relion30);
        assert_eq!(it.classes.len(), 1);
        assert_relative_eq!(it.classes[0].accuracy_translations, 1.0);
        // No rlnImageId column: row order becomes the id key.
        let ids: Vec<i64> = it.assignments.iter().map(|a| a.particle_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
