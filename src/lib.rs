//! STAR metadata interchange for cryo-EM refinement pipelines.
//!
//! This crate converts between an image-processing object model (movies,
//! micrographs, particles, CTF parameters, alignments) and the multi-table
//! STAR text format a refinement engine reads and writes. The pieces:
//!
//! - [`star`]: the table engine (parse, serialize, streaming row reads)
//! - [`location`]: the `index@filename` stack-addressing codec
//! - [`version`]: format-version detection and per-version conventions
//! - [`optics`]: the optics-group registry and merge logic
//! - [`transform`]: Euler/shift <-> homogeneous transform codec
//! - [`defocus`]: defocus-based grouping
//! - [`convert`]: writers, readers and the per-iteration class loader

pub mod convert;
pub mod defocus;
pub mod location;
pub mod model;
pub mod optics;
pub mod star;
pub mod transform;
pub mod version;

pub use convert::{ClassesLoader, ConvertError, StarReader, StarWriter};
pub use defocus::{DefocusGroup, DefocusGroups, DefocusItem};
pub use location::{ImageLocation, LocationError};
pub use model::{Acquisition, ClassInfo, Coordinate, CtfModel, Micrograph, Particle};
pub use optics::{OpticsError, OpticsGroup, OpticsGroups};
pub use star::{LabelRegistry, StarError, StarFile, StarTable, Value, ValueType};
pub use transform::{AlignmentMode, AlignmentRecord, TransformError};
pub use version::FormatVersion;
