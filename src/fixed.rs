// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-point encoding of sweep values onto integer ports.
//!
//! A [`FixedFormat`] with `point` fractional bits represents the real number
//! `n * 2^-point` by the `width`-bit integer `n`, in two's complement when
//! signed.

use std::{fmt, ops::RangeInclusive};

use snafu::Snafu;

/// Fractional bit counts for which both `2^point` and `2^-point` are normal
/// `f64`s.
pub const POINT_RANGE: RangeInclusive<i32> = -1022..=1022;

/// How a real value is brought onto the fixed-point grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rounding {
    /// Nearest grid point, ties to even.
    #[default]
    Round,
    Floor,
    Ceil,
}

impl Rounding {
    /// Parses the names used in configuration files: `round`, `floor`,
    /// `ceil`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "round" => Some(Self::Round),
            "floor" => Some(Self::Floor),
            "ceil" => Some(Self::Ceil),
            _ => None,
        }
    }

    fn apply(self, scaled: f64) -> f64 {
        match self {
            Self::Round => scaled.round_ties_even(),
            Self::Floor => scaled.floor(),
            Self::Ceil => scaled.ceil(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum FixedPointError {
    #[snafu(display(
        "Fixed-point width {width} is outside the supported 1 to 64 bit range"
    ))]
    InvalidWidth { width: u32 },
    #[snafu(display(
        "Fixed-point point {point} is outside the supported {} to {} range",
        POINT_RANGE.start(),
        POINT_RANGE.end()
    ))]
    InvalidPoint { point: i32 },
    #[snafu(display("Cannot encode non-finite value {value} as fixed point"))]
    NonFinite { value: f64 },
    #[snafu(display(
        "Value {value} does not fit in {format}: {integer} is outside {min} to {max}"
    ))]
    OutOfRange {
        value: f64,
        integer: i128,
        min: i128,
        max: i128,
        format: FixedFormat,
    },
}

/// A fixed-point number format, displayed as `s16.8` (signed, 16 bits, 8
/// fractional) or `u8.(-2)` for a negative point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFormat {
    width: u32,
    point: i32,
    signed: bool,
    rounding: Rounding,
}

impl FixedFormat {
    pub fn new(
        width: u32,
        point: i32,
        signed: bool,
        rounding: Rounding,
    ) -> Result<Self, FixedPointError> {
        if !(1..=64).contains(&width) {
            return Err(FixedPointError::InvalidWidth { width });
        }
        if !POINT_RANGE.contains(&point) {
            return Err(FixedPointError::InvalidPoint { point });
        }
        Ok(Self {
            width,
            point,
            signed,
            rounding,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn point(&self) -> i32 {
        self.point
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn rounding(&self) -> Rounding {
        self.rounding
    }

    /// The value of one least significant bit.
    pub fn resolution(&self) -> f64 {
        2f64.powi(-self.point)
    }

    /// The smallest representable integer.
    pub fn min(&self) -> i128 {
        if self.signed {
            -(1i128 << (self.width - 1))
        } else {
            0
        }
    }

    /// The largest representable integer.
    pub fn max(&self) -> i128 {
        if self.signed {
            (1i128 << (self.width - 1)) - 1
        } else {
            (1i128 << self.width) - 1
        }
    }

    fn mask(&self) -> u64 {
        if self.width == 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    /// Quantizes `value` and returns its `width`-bit pattern.
    pub fn encode(&self, value: f64) -> Result<u64, FixedPointError> {
        if !value.is_finite() {
            return Err(FixedPointError::NonFinite { value });
        }

        // saturates far outside any 64-bit range, so the check below fails
        let integer = self.rounding.apply(value * 2f64.powi(self.point)) as i128;
        if integer < self.min() || integer > self.max() {
            return Err(FixedPointError::OutOfRange {
                value,
                integer,
                min: self.min(),
                max: self.max(),
                format: *self,
            });
        }

        Ok(integer as u64 & self.mask())
    }

    /// Interprets the low `width` bits of `bits` as a number in this format.
    pub fn decode(&self, bits: u64) -> f64 {
        let bits = bits & self.mask();
        let sign_bit = 1u64 << (self.width - 1);
        let integer = if self.signed && bits & sign_bit != 0 {
            bits as i128 - (1i128 << self.width)
        } else {
            bits as i128
        };
        integer as f64 * self.resolution()
    }
}

impl fmt::Display for FixedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.signed { 's' } else { 'u' };
        if self.point < 0 {
            write!(f, "{}{}.({})", sign, self.width, self.point)
        } else {
            write!(f, "{}{}.{}", sign, self.width, self.point)
        }
    }
}
