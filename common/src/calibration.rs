use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Reference distances that define the 0 % and 100 % fill marks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoints {
    pub empty_cm: f32,
    pub full_cm: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceLevel {
    Empty,
    Full,
}

impl ReferenceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Full => "full",
        }
    }
}

impl FromStr for ReferenceLevel {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "empty" => Ok(Self::Empty),
            "full" => Ok(Self::Full),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ReferenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CalibrationPoints {
    pub fn get(&self, level: ReferenceLevel) -> f32 {
        match level {
            ReferenceLevel::Empty => self.empty_cm,
            ReferenceLevel::Full => self.full_cm,
        }
    }

    pub fn set(&mut self, level: ReferenceLevel, cm: f32) {
        match level {
            ReferenceLevel::Empty => self.empty_cm = cm,
            ReferenceLevel::Full => self.full_cm = cm,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.full_cm == self.empty_cm
    }

    /// Maps a raw distance onto a 0..=100 fill percentage.
    ///
    /// A degenerate calibration (both marks equal) reads as 0 %.
    pub fn percentage(&self, raw_cm: f32) -> u8 {
        if self.is_degenerate() {
            return 0;
        }
        let span = self.full_cm - self.empty_cm;
        let pct = ((raw_cm - self.empty_cm) * 100.0 / span).round();
        if pct.is_nan() {
            return 0;
        }
        pct.clamp(0.0, 100.0) as u8
    }
}
