//! Stack location codec.
//!
//! Images inside a multi-image stack are addressed as `index@filename` with
//! a six-digit, 1-based index (`000005@stack.mrcs`); a bare filename means
//! the whole file (volumes, micrographs). Encoding always re-pads the index
//! to six digits, so decode/encode round-trips are semantic rather than
//! byte-for-byte on oddly padded input.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("bad stack index {index:?} in location {location:?}")]
    BadIndex { index: String, location: String },
    #[error("stack index must be 1-based, got 0 in {0:?}")]
    ZeroIndex(String),
}

/// One image within a stack file, or a whole file when `index` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageLocation {
    /// 1-based slice index; `None` is the no-index sentinel.
    pub index: Option<u32>,
    pub path: String,
}

impl ImageLocation {
    pub fn new(index: u32, path: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            path: path.into(),
        }
    }

    /// A whole-file location with no stack index.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            index: None,
            path: path.into(),
        }
    }
}

impl fmt::Display for ImageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{i:06}@{}", self.path),
            None => f.write_str(&self.path),
        }
    }
}

impl FromStr for ImageLocation {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((idx, path)) => {
                let index = idx.parse::<u32>().map_err(|_| LocationError::BadIndex {
                    index: idx.to_string(),
                    location: s.to_string(),
                })?;
                if index == 0 {
                    return Err(LocationError::ZeroIndex(s.to_string()));
                }
                Ok(Self::new(index, path))
            }
            None => Ok(Self::file(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode() {
        assert_eq!(ImageLocation::new(5, "stack.mrcs").to_string(), "000005@stack.mrcs");
        assert_eq!(ImageLocation::file("vol.mrc").to_string(), "vol.mrc");
        // Indices wider than six digits are not truncated.
        assert_eq!(
            ImageLocation::new(1234567, "s.mrcs").to_string(),
            "1234567@s.mrcs"
        );
    }

    #[test]
    fn decode() {
        let loc: ImageLocation = "000005@stack.mrcs".parse().unwrap();
        assert_eq!(loc, ImageLocation::new(5, "stack.mrcs"));

        let loc: ImageLocation = "Runs/004/vol.mrc".parse().unwrap();
        assert_eq!(loc.index, None);
        assert_eq!(loc.path, "Runs/004/vol.mrc");
    }

    #[test]
    fn roundtrip() {
        for loc in [
            ImageLocation::new(1, "a.mrcs"),
            ImageLocation::new(999999, "dir/b.mrcs"),
            ImageLocation::file("c.mrc"),
        ] {
            let back: ImageLocation = loc.to_string().parse().unwrap();
            assert_eq!(back, loc);
        }
        // Well-formed strings re-encode bit-for-bit.
        let s = "000042@stack.mrcs";
        assert_eq!(s.parse::<ImageLocation>().unwrap().to_string(), s);
        // Differently padded input round-trips semantically, not textually.
        let odd = "42@stack.mrcs".parse::<ImageLocation>().unwrap();
        assert_eq!(odd.to_string(), "000042@stack.mrcs");
    }

    #[test]
    fn bad_index_fails_loudly() {
        assert!(matches!(
            "abc@stack.mrcs".parse::<ImageLocation>(),
            Err(LocationError::BadIndex { .. })
        ));
        assert!(matches!(
            "0@stack.mrcs".parse::<ImageLocation>(),
            Err(LocationError::ZeroIndex(_))
        ));
    }
}
