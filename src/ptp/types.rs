/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::{
    error::{PtpError, PtpResult},
    formats::FramesPerSecond,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// EUI-64 style clock identity, rendered canonically as
/// `XX-XX-XX-XX-XX-XX-XX-XX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ClockIdentity(pub [u8; 8]);

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.0;
        write!(
            f,
            "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
            d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl std::str::FromStr for ClockIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut data = [0u8; 8];
        let mut count = 0;
        for (i, part) in s.split('-').enumerate() {
            if i >= 8 || part.len() != 2 {
                return Err(format!("invalid clock identity: {s}"));
            }
            data[i] = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid clock identity: {s}"))?;
            count += 1;
        }
        if count != 8 {
            return Err(format!("invalid clock identity: {s}"));
        }
        Ok(ClockIdentity(data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.clock_identity, self.port_number)
    }
}

/// An absolute PTP time, seconds (48 bit on the wire) plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanos: u32,
}

impl PtpTimestamp {
    pub fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    pub fn from_nanos(total: i128) -> Self {
        let clamped = total.max(0);
        Self {
            seconds: (clamped / NANOS_PER_SEC as i128) as u64,
            nanos: (clamped % NANOS_PER_SEC as i128) as u32,
        }
    }

    pub fn as_nanos(&self) -> i128 {
        self.seconds as i128 * NANOS_PER_SEC as i128 + self.nanos as i128
    }

    /// The number of media clock samples elapsed since the PTP epoch at the
    /// given sample rate. This is what an RTP timestamp counts, modulo 2^32.
    pub fn to_media_time(&self, sample_rate: FramesPerSecond) -> u64 {
        ((self.as_nanos() * sample_rate as i128) / NANOS_PER_SEC as i128) as u64
    }
}

impl fmt::Display for PtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

const FRACTIONAL_SCALE: i64 = 0x10000;
const SCALED_NANOS_PER_SEC: i64 = NANOS_PER_SEC * FRACTIONAL_SCALE;

/// A signed span of PTP time with sub-nanosecond resolution. Stored as whole
/// seconds plus nanoseconds scaled by 2^16 so that the 16-bit binary fraction
/// of the PTP correction field survives arithmetic exactly.
///
/// Invariant: after construction and every operation the scaled nanos part is
/// normalized to `[0, 10^9 * 2^16)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct PtpTimeInterval {
    seconds: i64,
    scaled_nanos: i64,
}

impl PtpTimeInterval {
    pub fn new(seconds: i64, nanos: i32, fraction: u16) -> Self {
        let mut interval = Self {
            seconds,
            scaled_nanos: nanos as i64 * FRACTIONAL_SCALE + fraction as i64,
        };
        interval.normalize();
        interval
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self::new(nanos / NANOS_PER_SEC, (nanos % NANOS_PER_SEC) as i32, 0)
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Total nanoseconds including the seconds part, fraction truncated.
    /// Undefined for values that do not fit an i64.
    pub fn nanos(&self) -> i64 {
        self.seconds * NANOS_PER_SEC + self.scaled_nanos / FRACTIONAL_SCALE
    }

    /// Total nanoseconds, rounded to the nearest nanosecond.
    pub fn nanos_rounded(&self) -> i64 {
        if self.fraction_raw() as i64 >= FRACTIONAL_SCALE / 2 {
            self.nanos() + 1
        } else {
            self.nanos()
        }
    }

    /// Nanoseconds within the second, without the fraction.
    pub fn nanos_raw(&self) -> i64 {
        self.scaled_nanos / FRACTIONAL_SCALE
    }

    /// The 16-bit binary fraction of a nanosecond.
    pub fn fraction_raw(&self) -> u16 {
        (self.scaled_nanos % FRACTIONAL_SCALE) as u16
    }

    /// Reads the wire format: signed nanoseconds in the high 48 bits,
    /// fraction in the low 16 bits.
    pub fn from_wire_format(value: i64) -> Self {
        let nanoseconds = value >> 16;
        let seconds = nanoseconds / NANOS_PER_SEC;
        let nanos = nanoseconds - seconds * NANOS_PER_SEC;
        Self::new(seconds, nanos as i32, (value & 0xffff) as u16)
    }

    /// Converts to the wire format. Values outside the representable range
    /// are an overflow error; use [`Self::to_wire_format_saturating`] when a
    /// clamped value is acceptable.
    pub fn to_wire_format(&self) -> PtpResult<i64> {
        self.seconds
            .checked_mul(SCALED_NANOS_PER_SEC)
            .and_then(|s| s.checked_add(self.scaled_nanos))
            .ok_or(PtpError::WireOverflow)
    }

    pub fn to_wire_format_saturating(&self) -> i64 {
        match self.to_wire_format() {
            Ok(value) => value,
            Err(_) if self.seconds < 0 => i64::MIN,
            Err(_) => i64::MAX,
        }
    }

    fn total_scaled(&self) -> i128 {
        self.seconds as i128 * SCALED_NANOS_PER_SEC as i128 + self.scaled_nanos as i128
    }

    fn from_total_scaled(total: i128) -> Self {
        let seconds = total.div_euclid(SCALED_NANOS_PER_SEC as i128) as i64;
        let scaled_nanos = total.rem_euclid(SCALED_NANOS_PER_SEC as i128) as i64;
        Self {
            seconds,
            scaled_nanos,
        }
    }

    fn normalize(&mut self) {
        if self.scaled_nanos >= SCALED_NANOS_PER_SEC {
            let carry = self.scaled_nanos / SCALED_NANOS_PER_SEC;
            self.seconds += carry;
            self.scaled_nanos -= carry * SCALED_NANOS_PER_SEC;
        } else if self.scaled_nanos < 0 {
            let mut borrow = self.scaled_nanos.abs() / SCALED_NANOS_PER_SEC;
            if self.scaled_nanos % SCALED_NANOS_PER_SEC != 0 {
                borrow += 1;
            }
            self.seconds -= borrow;
            self.scaled_nanos += borrow * SCALED_NANOS_PER_SEC;
        }
    }
}

impl std::ops::Add for PtpTimeInterval {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        let mut r = Self {
            seconds: self.seconds + other.seconds,
            scaled_nanos: self.scaled_nanos + other.scaled_nanos,
        };
        r.normalize();
        r
    }
}

impl std::ops::Sub for PtpTimeInterval {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        let mut r = Self {
            seconds: self.seconds - other.seconds,
            scaled_nanos: self.scaled_nanos - other.scaled_nanos,
        };
        r.normalize();
        r
    }
}

impl std::ops::Mul<i64> for PtpTimeInterval {
    type Output = Self;

    fn mul(self, factor: i64) -> Self {
        Self::from_total_scaled(self.total_scaled() * factor as i128)
    }
}

impl std::ops::Div<i64> for PtpTimeInterval {
    type Output = Self;

    fn div(self, divisor: i64) -> Self {
        Self::from_total_scaled(self.total_scaled() / divisor as i128)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

impl Default for ClockQuality {
    fn default() -> Self {
        // Defaults of a slave-only clock that never wins the BMCA
        Self {
            clock_class: 255,
            clock_accuracy: 0xFE,
            offset_scaled_log_variance: 0xFFFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeSource {
    AtomicClock,
    Gps,
    TerrestrialRadio,
    Ptp,
    Ntp,
    HandSet,
    Other,
    InternalOscillator,
    Unknown(u8),
}

impl From<u8> for TimeSource {
    fn from(value: u8) -> Self {
        match value {
            0x10 => TimeSource::AtomicClock,
            0x20 => TimeSource::Gps,
            0x30 => TimeSource::TerrestrialRadio,
            0x40 => TimeSource::Ptp,
            0x50 => TimeSource::Ntp,
            0x60 => TimeSource::HandSet,
            0x90 => TimeSource::Other,
            0xA0 => TimeSource::InternalOscillator,
            other => TimeSource::Unknown(other),
        }
    }
}

impl From<TimeSource> for u8 {
    fn from(value: TimeSource) -> Self {
        match value {
            TimeSource::AtomicClock => 0x10,
            TimeSource::Gps => 0x20,
            TimeSource::TerrestrialRadio => 0x30,
            TimeSource::Ptp => 0x40,
            TimeSource::Ntp => 0x50,
            TimeSource::HandSet => 0x60,
            TimeSource::Other => 0x90,
            TimeSource::InternalOscillator => 0xA0,
            TimeSource::Unknown(other) => other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clock_identity_renders_canonically() {
        let id = ClockIdentity([0x39, 0xA7, 0x94, 0xFF, 0xFE, 0x07, 0xCB, 0xD0]);
        assert_eq!("39-A7-94-FF-FE-07-CB-D0", id.to_string());
    }

    #[test]
    fn clock_identity_parses_its_own_rendering() {
        let id = ClockIdentity([0x39, 0xA7, 0x94, 0xFF, 0xFE, 0x07, 0xCB, 0xD0]);
        let parsed: ClockIdentity = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn interval_normalizes_positive_overflow() {
        let interval = PtpTimeInterval::new(0, 1_500_000_000, 0);
        assert_eq!(1, interval.seconds());
        assert_eq!(500_000_000, interval.nanos_raw());
    }

    #[test]
    fn interval_normalizes_negative_nanos() {
        let interval = PtpTimeInterval::new(1, -250_000_000, 0);
        assert_eq!(0, interval.seconds());
        assert_eq!(750_000_000, interval.nanos_raw());
    }

    #[test]
    fn interval_invariant_holds_after_arithmetic() {
        let a = PtpTimeInterval::new(2, 900_000_000, 0x8000);
        let b = PtpTimeInterval::new(1, 200_000_000, 0xC000);
        for value in [a + b, a - b, a * 3, a / 7, b * -2] {
            assert!(value.nanos_raw() >= 0 && value.nanos_raw() < NANOS_PER_SEC);
            assert!((value.fraction_raw() as i64) < FRACTIONAL_SCALE);
        }
    }

    #[test]
    fn wire_format_roundtrip() {
        let values = [
            PtpTimeInterval::new(0, 0, 0),
            PtpTimeInterval::new(0, 2, 0x8000),
            PtpTimeInterval::new(12, 345_678, 0x0001),
            PtpTimeInterval::new(-3, 1, 0xFFFF),
            PtpTimeInterval::from_wire_format(0x28000),
        ];
        for value in values {
            let wire = value.to_wire_format().expect("wire");
            assert_eq!(value, PtpTimeInterval::from_wire_format(wire));
        }
    }

    #[test]
    fn wire_format_overflow_is_an_error() {
        let too_big = PtpTimeInterval::new(i64::MAX / NANOS_PER_SEC, 0, 0);
        assert!(too_big.to_wire_format().is_err());
        assert_eq!(i64::MAX, too_big.to_wire_format_saturating());
    }

    #[test]
    fn division_distributes_seconds_remainder() {
        let interval = PtpTimeInterval::new(3, 0, 0) / 2;
        assert_eq!(1, interval.seconds());
        assert_eq!(500_000_000, interval.nanos_raw());
    }

    #[test]
    fn multiplication_scales_fraction() {
        let interval = PtpTimeInterval::new(0, 0, 0x8000) * 2;
        assert_eq!(1, interval.nanos_raw());
        assert_eq!(0, interval.fraction_raw());
    }

    #[test]
    fn timestamp_to_media_time() {
        let ts = PtpTimestamp::new(1, 0);
        assert_eq!(48_000, ts.to_media_time(48_000));
        let ts = PtpTimestamp::new(0, 500_000_000);
        assert_eq!(24_000, ts.to_media_time(48_000));
    }
}
