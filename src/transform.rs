//! Alignment transform codec.
//!
//! Converts between the per-particle Euler/shift representation stored in
//! STAR rows and the homogeneous transform the object model carries. The
//! Euler convention is intrinsic Z-Y-Z, applied with negated angles, which
//! matches the refinement engine; projection alignments additionally invert
//! the composed matrix. Shifts are held internally in pixels — 3.1-format
//! rows store them in Angstroms and are converted using the pixel size in
//! scope.
//!
//! `decompose` is the exact left inverse of `compose`: angles come back
//! normalized to rot/psi in [-180, 180] and tilt in [0, 180].

use glam::{DMat3, DMat4, DVec3, DVec4};

use crate::star::{StarError, StarRow};
use crate::version::FormatVersion;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("alignment columns missing: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("pixel size must be positive, got {0}")]
    BadPixelSize(f64),
    #[error(transparent)]
    Star(#[from] StarError),
}

/// Which alignment the particles carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentMode {
    /// No alignment; rows carry no geometry.
    None,
    /// In-plane 2D alignment (classification averages).
    TwoD,
    /// Full projection alignment (3D refinement).
    Proj,
}

/// Euler angles in degrees plus a pixel-unit shift and an in-plane flip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentRecord {
    pub rot: f64,
    pub tilt: f64,
    pub psi: f64,
    /// Shift in pixels (internal unit, whatever the file stored).
    pub shift: DVec3,
    pub flip: bool,
}

impl AlignmentRecord {
    pub fn identity() -> Self {
        Self {
            rot: 0.0,
            tilt: 0.0,
            psi: 0.0,
            shift: DVec3::ZERO,
            flip: false,
        }
    }
}

const ANGLE_LABELS: [&str; 3] = ["rlnAngleRot", "rlnAngleTilt", "rlnAnglePsi"];

/// In-plane mirror applied before rotation when the flip flag is set.
fn flip_matrix() -> DMat3 {
    DMat3::from_diagonal(DVec3::new(-1.0, 1.0, 1.0))
}

/// Rotation for negated intrinsic Z-Y-Z angles given in degrees:
/// `Rz(-psi) * Ry(-tilt) * Rz(-rot)`.
fn rotation(rot: f64, tilt: f64, psi: f64) -> DMat3 {
    DMat3::from_rotation_z(-psi.to_radians())
        * DMat3::from_rotation_y(-tilt.to_radians())
        * DMat3::from_rotation_z(-rot.to_radians())
}

fn with_translation(r: DMat3, t: DVec3) -> DMat4 {
    DMat4::from_cols(
        DVec4::new(r.x_axis.x, r.x_axis.y, r.x_axis.z, 0.0),
        DVec4::new(r.y_axis.x, r.y_axis.y, r.y_axis.z, 0.0),
        DVec4::new(r.z_axis.x, r.z_axis.y, r.z_axis.z, 0.0),
        DVec4::new(t.x, t.y, t.z, 1.0),
    )
}

fn rotation_part(m: &DMat4) -> DMat3 {
    DMat3::from_cols(
        m.x_axis.truncate(),
        m.y_axis.truncate(),
        m.z_axis.truncate(),
    )
}

/// Build the homogeneous transform for a record.
pub fn compose(record: &AlignmentRecord, mode: AlignmentMode) -> DMat4 {
    match mode {
        AlignmentMode::None => DMat4::IDENTITY,
        AlignmentMode::TwoD => {
            let mut r = DMat3::from_rotation_z(record.psi.to_radians());
            if record.flip {
                r *= flip_matrix();
            }
            with_translation(r, record.shift)
        }
        AlignmentMode::Proj => {
            let mut r = rotation(record.rot, record.tilt, record.psi);
            if record.flip {
                r *= flip_matrix();
            }
            with_translation(r, -record.shift).inverse()
        }
    }
}

/// Recover the record from a transform; exact left inverse of [`compose`].
pub fn decompose(m: &DMat4, mode: AlignmentMode) -> AlignmentRecord {
    match mode {
        AlignmentMode::None => AlignmentRecord::identity(),
        AlignmentMode::TwoD => {
            let mut r = rotation_part(m);
            // A negative in-plane determinant means one mirrored axis.
            let det2 = r.x_axis.x * r.y_axis.y - r.y_axis.x * r.x_axis.y;
            let flip = det2 < 0.0;
            if flip {
                r *= flip_matrix();
            }
            let psi = r.x_axis.y.atan2(r.x_axis.x).to_degrees();
            AlignmentRecord {
                rot: 0.0,
                tilt: 0.0,
                psi: normalize_deg(psi),
                shift: m.w_axis.truncate(),
                flip,
            }
        }
        AlignmentMode::Proj => {
            let inv = m.inverse();
            let mut r = rotation_part(&inv);
            let flip = r.determinant() < 0.0;
            if flip {
                r *= flip_matrix();
            }
            let (rot, tilt, psi) = angles_from_rotation(&r);
            AlignmentRecord {
                rot,
                tilt,
                psi,
                shift: -inv.w_axis.truncate(),
                flip,
            }
        }
    }
}

/// Extract the negated-ZYZ angles from `Rz(-psi) * Ry(-tilt) * Rz(-rot)`,
/// choosing the branch that keeps tilt in [0, 180].
fn angles_from_rotation(r: &DMat3) -> (f64, f64, f64) {
    // With a = (-rot, -tilt, -psi) in radians and R = Rz(a3) Ry(a2) Rz(a1):
    //   R[2][2] = cos(a2), and for s2 = sin(a2) < 0 (a2 = -tilt, tilt > 0)
    //   a3 = atan2(-R[1][2], -R[0][2]),  a1 = atan2(-R[2][1], R[2][0]).
    // glam is column-major: R[row][col] = col_axis[row].
    let r00 = r.x_axis.x;
    let r10 = r.x_axis.y;
    let r02 = r.z_axis.x;
    let r12 = r.z_axis.y;
    let r20 = r.x_axis.z;
    let r21 = r.y_axis.z;
    let r22 = r.z_axis.z;

    let c2 = r22.clamp(-1.0, 1.0);
    let a2 = -c2.acos(); // in [-pi, 0]
    let s2 = a2.sin();

    const EPS: f64 = 1e-12;
    let (a1, a3) = if s2.abs() > EPS {
        (
            (-r21).atan2(r20),
            (-r12).atan2(-r02),
        )
    } else if c2 > 0.0 {
        // tilt = 0: pure in-plane rotation Rz(a1 + a3).
        (0.0, r10.atan2(r00))
    } else {
        // tilt = 180.
        (0.0, (-r10).atan2(-r00))
    };

    (
        normalize_deg(-a1.to_degrees()),
        -a2.to_degrees(),
        normalize_deg(-a3.to_degrees()),
    )
}

/// Wrap an angle into (-180, 180].
pub fn normalize_deg(a: f64) -> f64 {
    let mut a = a % 360.0;
    if a <= -180.0 {
        a += 360.0;
    } else if a > 180.0 {
        a -= 360.0;
    }
    a
}

/// Read an alignment record from a data row.
///
/// Returns `Ok(None)` when the row carries no alignment columns at all
/// (unaligned import); individual missing labels default to zero, matching
/// the engine's own convention. For 3.1-format rows the Angstrom shifts are
/// divided by `pixel_size`.
pub fn record_from_row(
    row: &StarRow,
    version: FormatVersion,
    pixel_size: f64,
) -> Result<Option<AlignmentRecord>, TransformError> {
    if pixel_size <= 0.0 {
        return Err(TransformError::BadPixelSize(pixel_size));
    }
    let shift_labels = version.shift_labels();
    let mut all: Vec<&str> = ANGLE_LABELS.to_vec();
    all.extend_from_slice(&shift_labels);
    if !row.has_any(&all) {
        return Ok(None);
    }

    let to_pixels = if version.shifts_in_angstroms() {
        1.0 / pixel_size
    } else {
        1.0
    };
    let shift = DVec3::new(
        row.opt_f64(shift_labels[0]).unwrap_or(0.0) * to_pixels,
        row.opt_f64(shift_labels[1]).unwrap_or(0.0) * to_pixels,
        row.opt_f64(shift_labels[2]).unwrap_or(0.0) * to_pixels,
    );
    Ok(Some(AlignmentRecord {
        rot: row.opt_f64("rlnAngleRot").unwrap_or(0.0),
        tilt: row.opt_f64("rlnAngleTilt").unwrap_or(0.0),
        psi: row.opt_f64("rlnAnglePsi").unwrap_or(0.0),
        shift,
        flip: false,
    }))
}

/// Convert a record's shifts back into the unit a version's rows use.
pub fn shifts_for_row(record: &AlignmentRecord, version: FormatVersion, pixel_size: f64) -> DVec3 {
    if version.shifts_in_angstroms() {
        record.shift * pixel_size
    } else {
        record.shift
    }
}

/// The columns [`record_from_row`] would need for a given mode; used to
/// report schema mismatches by name before any row is converted.
pub fn required_labels(mode: AlignmentMode, version: FormatVersion) -> Vec<&'static str> {
    let shifts = version.shift_labels();
    match mode {
        AlignmentMode::None => Vec::new(),
        AlignmentMode::TwoD => vec![shifts[0], shifts[1], "rlnAnglePsi"],
        AlignmentMode::Proj => {
            vec![shifts[0], shifts[1], "rlnAngleRot", "rlnAngleTilt", "rlnAnglePsi"]
        }
    }
}
