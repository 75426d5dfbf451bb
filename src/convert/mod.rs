//! Entity <-> STAR conversion.
//!
//! This layer ties the table engine, location codec, optics registry and
//! alignment codec together: [`StarWriter`] serializes movie, micrograph and
//! particle sets into the format version the engine expects, [`StarReader`]
//! reads the engine's output files back into entities, and [`ClassesLoader`]
//! rebuilds per-class and per-particle state from one refinement iteration's
//! model/data file pair.

pub mod loader;
pub mod reader;
pub mod writer;

pub use loader::{iteration_paths, ClassAssignment, ClassesLoader, IterationData};
pub use reader::{detect_version_path, ExtraLabels, StarReader, PARTICLE_EXTRA_LABELS};
pub use writer::StarWriter;

use crate::location::LocationError;
use crate::optics::OpticsError;
use crate::star::StarError;
use crate::transform::TransformError;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error(transparent)]
    Star(#[from] StarError),
    #[error(transparent)]
    Optics(#[from] OpticsError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error("table {table:?} is missing required columns: {}", .columns.join(", "))]
    MissingColumns { table: String, columns: Vec<String> },
    #[error("no iteration loaded")]
    NotLoaded,
}
