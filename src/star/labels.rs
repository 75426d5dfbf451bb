//! Label -> type registry.
//!
//! STAR columns are typed by label name. The registry is an explicit object
//! handed to the parser (no global state), with [`LabelRegistry::default`]
//! covering the standard RELION label set. Labels not in the registry are
//! read as strings and preserved verbatim, so unrecognized columns survive
//! a round-trip untouched.

use std::collections::HashMap;

use super::value::ValueType;

/// Maps `rlnXxx` label names to their semantic column type.
#[derive(Debug, Clone)]
pub struct LabelRegistry {
    types: HashMap<&'static str, ValueType>,
    overrides: HashMap<String, ValueType>,
}

const INT_LABELS: &[&str] = &[
    "rlnOpticsGroup",
    "rlnImageId",
    "rlnImageSize",
    "rlnImageFrameNr",
    "rlnClassNumber",
    "rlnGroupNumber",
    "rlnMicrographId",
    "rlnParticleId",
    "rlnRandomSubset",
    "rlnNrOfSignificantSamples",
    "rlnNrOfFrames",
];

const FLOAT_LABELS: &[&str] = &[
    "rlnVoltage",
    "rlnSphericalAberration",
    "rlnAmplitudeContrast",
    "rlnMagnification",
    "rlnDetectorPixelSize",
    "rlnMicrographPixelSize",
    "rlnMicrographOriginalPixelSize",
    "rlnImagePixelSize",
    "rlnDefocusU",
    "rlnDefocusV",
    "rlnDefocusAngle",
    "rlnCtfAstigmatism",
    "rlnCtfFigureOfMerit",
    "rlnCtfMaxResolution",
    "rlnCtfPhaseShift",
    "rlnCtfBfactor",
    "rlnCtfScalefactor",
    "rlnPhaseShift",
    "rlnAngleRot",
    "rlnAngleTilt",
    "rlnAnglePsi",
    "rlnAngleRotPrior",
    "rlnAngleTiltPrior",
    "rlnAnglePsiPrior",
    "rlnOriginX",
    "rlnOriginY",
    "rlnOriginZ",
    "rlnOriginXPrior",
    "rlnOriginYPrior",
    "rlnOriginXAngst",
    "rlnOriginYAngst",
    "rlnOriginZAngst",
    "rlnOriginXPriorAngst",
    "rlnOriginYPriorAngst",
    "rlnCoordinateX",
    "rlnCoordinateY",
    "rlnAutopickFigureOfMerit",
    "rlnParticleSelectZScore",
    "rlnNormCorrection",
    "rlnLogLikeliContribution",
    "rlnMaxValueProbDistribution",
    "rlnClassDistribution",
    "rlnAccuracyRotations",
    "rlnAccuracyTranslations",
    "rlnAccuracyTranslationsAngst",
    "rlnEstimatedResolution",
    "rlnOverallFourierCompleteness",
    "rlnBeamTiltX",
    "rlnBeamTiltY",
];

const STR_LABELS: &[&str] = &[
    "rlnImageName",
    "rlnMicrographName",
    "rlnMicrographMovieName",
    "rlnReferenceImage",
    "rlnCtfImage",
    "rlnOpticsGroupName",
    "rlnMtfFileName",
    "rlnMicrographGainName",
    "rlnMicrographDefectFile",
    "rlnGroupName",
    "rlnOriginalParticleName",
];

const BOOL_LABELS: &[&str] = &[
    "rlnCtfDataArePhaseFlipped",
    "rlnCtfDataAreCtfPremultiplied",
];

impl Default for LabelRegistry {
    fn default() -> Self {
        let mut types = HashMap::new();
        for &l in INT_LABELS {
            types.insert(l, ValueType::Int);
        }
        for &l in FLOAT_LABELS {
            types.insert(l, ValueType::Float);
        }
        for &l in STR_LABELS {
            types.insert(l, ValueType::Str);
        }
        for &l in BOOL_LABELS {
            types.insert(l, ValueType::Bool);
        }
        Self {
            types,
            overrides: HashMap::new(),
        }
    }
}

impl LabelRegistry {
    /// A registry with no known labels; every column reads as a string.
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Register or override the type of a label.
    pub fn set(&mut self, label: impl Into<String>, vtype: ValueType) {
        self.overrides.insert(label.into(), vtype);
    }

    /// Column type for a label, `Str` when unknown.
    pub fn type_of(&self, label: &str) -> ValueType {
        if let Some(&t) = self.overrides.get(label) {
            return t;
        }
        self.types.get(label).copied().unwrap_or(ValueType::Str)
    }

    pub fn is_known(&self, label: &str) -> bool {
        self.overrides.contains_key(label) || self.types.contains_key(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_types() {
        let reg = LabelRegistry::default();
        assert_eq!(reg.type_of("rlnOpticsGroup"), ValueType::Int);
        assert_eq!(reg.type_of("rlnDefocusU"), ValueType::Float);
        assert_eq!(reg.type_of("rlnMicrographName"), ValueType::Str);
        assert_eq!(reg.type_of("rlnCtfDataArePhaseFlipped"), ValueType::Bool);
    }

    #[test]
    fn unknown_labels_are_strings() {
        let reg = LabelRegistry::default();
        assert_eq!(reg.type_of("rlnSomethingNew"), ValueType::Str);
        assert!(!reg.is_known("rlnSomethingNew"));
    }

    #[test]
    fn local_override() {
        let mut reg = LabelRegistry::default();
        reg.set("rlnCustomScore", ValueType::Float);
        assert_eq!(reg.type_of("rlnCustomScore"), ValueType::Float);
        reg.set("rlnDefocusU", ValueType::Str);
        assert_eq!(reg.type_of("rlnDefocusU"), ValueType::Str);
    }
}
