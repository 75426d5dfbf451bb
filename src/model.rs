//! Entity types the conversion layer populates.
//!
//! These mirror the image-processing object model on the near side of the
//! interchange: micrographs/movies, particles with CTF and alignment state,
//! and per-class summaries rebuilt from each refinement iteration. Labels
//! the conversion does not interpret ride along in an `extra` side map.

use std::collections::BTreeMap;

use glam::DMat4;

use crate::location::ImageLocation;
use crate::star::Value;

/// Acquisition parameters shared by the images of one optics group.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// Pixel size in Angstroms per pixel.
    pub pixel_size: f64,
    /// Acceleration voltage in kV.
    pub voltage: f64,
    /// Spherical aberration in mm.
    pub spherical_aberration: f64,
    pub amplitude_contrast: f64,
    pub mtf_file: Option<String>,
    pub beam_tilt_x: Option<f64>,
    pub beam_tilt_y: Option<f64>,
    pub gain_file: Option<String>,
    pub defect_file: Option<String>,
    /// 1-based optics group assignment, once known.
    pub optics_group: Option<u32>,
    pub optics_group_name: Option<String>,
}

impl Default for Acquisition {
    fn default() -> Self {
        Self {
            pixel_size: 1.0,
            voltage: 300.0,
            spherical_aberration: 2.7,
            amplitude_contrast: 0.1,
            mtf_file: None,
            beam_tilt_x: None,
            beam_tilt_y: None,
            gain_file: None,
            defect_file: None,
            optics_group: None,
            optics_group_name: None,
        }
    }
}

/// CTF estimation results for one micrograph or particle.
#[derive(Debug, Clone, PartialEq)]
pub struct CtfModel {
    /// Defocus along the major/minor astigmatism axes, in Angstroms.
    pub defocus_u: f64,
    pub defocus_v: f64,
    /// Astigmatism angle in degrees.
    pub defocus_angle: f64,
    pub phase_shift: Option<f64>,
    pub fit_quality: f64,
    pub max_resolution: f64,
    pub psd_file: Option<String>,
}

impl CtfModel {
    pub fn new(defocus_u: f64, defocus_v: f64, defocus_angle: f64) -> Self {
        Self {
            defocus_u,
            defocus_v,
            defocus_angle,
            phase_shift: None,
            fit_quality: 0.0,
            max_resolution: 0.0,
            psd_file: None,
        }
    }

    /// Astigmatism as the defocus difference between the two axes.
    pub fn astigmatism(&self) -> f64 {
        self.defocus_u - self.defocus_v
    }
}

/// Picked-particle position on its source micrograph.
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
    pub micrograph_name: Option<String>,
    pub micrograph_id: Option<i64>,
}

/// A micrograph or movie; movies differ only in which label names the file.
#[derive(Debug, Clone)]
pub struct Micrograph {
    pub id: i64,
    pub file_name: String,
    pub acquisition: Acquisition,
    pub ctf: Option<CtfModel>,
}

/// One particle image with its metadata and (optional) alignment.
#[derive(Debug, Clone)]
pub struct Particle {
    pub id: i64,
    pub location: ImageLocation,
    pub acquisition: Acquisition,
    pub coordinate: Option<Coordinate>,
    pub ctf: Option<CtfModel>,
    pub class_id: Option<u32>,
    /// Homogeneous alignment transform in pixel units, when aligned.
    pub transform: Option<DMat4>,
    /// Non-geometric labels carried through without interpretation.
    pub extra: BTreeMap<String, Value>,
}

impl Particle {
    pub fn new(id: i64, location: ImageLocation, acquisition: Acquisition) -> Self {
        Self {
            id,
            location,
            acquisition,
            coordinate: None,
            ctf: None,
            class_id: None,
            transform: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Per-class summary for one refinement iteration; rebuilt on every load.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// 1-based class id.
    pub id: u32,
    /// Representative class average / reference volume.
    pub reference: ImageLocation,
    pub distribution: f64,
    pub accuracy_rotations: f64,
    /// In the unit of the source file's version (pixels or Angstroms).
    pub accuracy_translations: f64,
    pub extra: BTreeMap<String, Value>,
}
