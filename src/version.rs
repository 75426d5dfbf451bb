//! Format version detection and per-version conventions.
//!
//! The engine changed its file layout at 3.1: acquisition parameters moved
//! into a `data_optics` block, origin shifts switched from pixels to
//! Angstroms, and the per-particle block gained the `particles` name. All of
//! those differences live in this one lookup; nothing else in the crate
//! re-derives version behavior ad hoc.

use crate::star::StarFile;

/// Names of the tables an optics-bearing file carries.
pub const OPTICS_TABLE: &str = "optics";
pub const PARTICLES_TABLE: &str = "particles";
pub const MICROGRAPHS_TABLE: &str = "micrographs";
pub const MOVIES_TABLE: &str = "movies";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Pre-optics-group layout (3.0 and older): one table, per-row
    /// acquisition labels, pixel shifts.
    Relion30,
    /// Optics-group layout (3.1+): `optics` + entity tables, Angstrom shifts.
    Relion31,
}

impl FormatVersion {
    /// Detect the version of a parsed file.
    ///
    /// The single rule: a `data_optics` block means 3.1, its absence means
    /// the legacy path. Absence is never an error and row contents are never
    /// inspected.
    pub fn detect(file: &StarFile) -> Self {
        if file.has_table(OPTICS_TABLE) {
            FormatVersion::Relion31
        } else {
            FormatVersion::Relion30
        }
    }

    pub fn has_optics(self) -> bool {
        self == FormatVersion::Relion31
    }

    /// Origin-shift labels for X/Y/Z, in this version's unit.
    pub fn shift_labels(self) -> [&'static str; 3] {
        match self {
            FormatVersion::Relion30 => ["rlnOriginX", "rlnOriginY", "rlnOriginZ"],
            FormatVersion::Relion31 => ["rlnOriginXAngst", "rlnOriginYAngst", "rlnOriginZAngst"],
        }
    }

    /// True when this version stores shifts in Angstroms rather than pixels.
    pub fn shifts_in_angstroms(self) -> bool {
        self == FormatVersion::Relion31
    }

    /// Name of the per-particle data table; `None` means the file's first
    /// (unnamed) block.
    pub fn data_table(self) -> Option<&'static str> {
        match self {
            FormatVersion::Relion30 => None,
            FormatVersion::Relion31 => Some(PARTICLES_TABLE),
        }
    }

    /// Per-class translation accuracy label (pixels vs Angstroms).
    pub fn accuracy_translations_label(self) -> &'static str {
        match self {
            FormatVersion::Relion30 => "rlnAccuracyTranslations",
            FormatVersion::Relion31 => "rlnAccuracyTranslationsAngst",
        }
    }
}
