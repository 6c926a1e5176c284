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

use super::types::PtpTimestamp;
use crate::error::{ClockError, ClockResult};
use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
use std::{
    io,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::debug;

/// Local monotonic time in nanoseconds, the x axis of the servo's linear fit.
pub fn monotonic_nanos() -> ClockResult<i128> {
    let mut tp = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { clock_gettime(CLOCK_MONOTONIC, &mut tp) } != 0 {
        return Err(ClockError::IoError(io::Error::last_os_error()));
    }
    Ok(tp.tv_sec as i128 * 1_000_000_000 + tp.tv_nsec as i128)
}

/// The linear fit `master = offset + rate * mono`, estimated from Sync event
/// ingress timestamps against corrected master origin timestamps. Rate and
/// offset are smoothed by a single-pole IIR filter; until `calibration_syncs`
/// pairs have been observed the raw offset of the latest pair is used.
#[derive(Debug)]
pub struct ClockServo {
    time_constant: Duration,
    calibration_syncs: u32,
    rate: f64,
    offset_ns: f64,
    samples: u32,
    last_mono: Option<i128>,
    last_master: Option<i128>,
    mean_path_delay_ns: f64,
}

impl ClockServo {
    pub fn new(time_constant: Duration, calibration_syncs: u32) -> Self {
        Self {
            time_constant,
            calibration_syncs,
            rate: 1.0,
            offset_ns: 0.0,
            samples: 0,
            last_mono: None,
            last_master: None,
            mean_path_delay_ns: 0.0,
        }
    }

    /// Feeds one Sync (or Sync + Follow_Up) observation: the local monotonic
    /// ingress time and the corrected master origin time.
    pub fn observe_sync(&mut self, ingress_mono_ns: i128, master_origin_ns: i128) {
        let master_at_ingress = master_origin_ns as f64 + self.mean_path_delay_ns;

        if let (Some(last_mono), Some(last_master)) = (self.last_mono, self.last_master) {
            let mono_delta = (ingress_mono_ns - last_mono) as f64;
            if mono_delta > 0.0 {
                let master_delta = master_at_ingress - last_master as f64;
                let instantaneous_rate = master_delta / mono_delta;
                let alpha = (mono_delta / self.time_constant.as_nanos() as f64).min(1.0);
                self.rate += alpha * (instantaneous_rate - self.rate);
            }
        }

        let raw_offset = master_at_ingress - self.rate * ingress_mono_ns as f64;
        if self.samples < self.calibration_syncs {
            self.offset_ns = raw_offset;
        } else {
            let alpha = 0.1;
            self.offset_ns += alpha * (raw_offset - self.offset_ns);
        }

        self.last_mono = Some(ingress_mono_ns);
        self.last_master = Some(master_at_ingress as i128);
        self.samples = self.samples.saturating_add(1);

        debug!(
            "Servo: rate {} offset {} ns after {} syncs",
            self.rate, self.offset_ns, self.samples
        );
    }

    pub fn observe_path_delay(&mut self, mean_path_delay_ns: f64) {
        self.mean_path_delay_ns = mean_path_delay_ns;
    }

    pub fn mean_path_delay_ns(&self) -> f64 {
        self.mean_path_delay_ns
    }

    pub fn is_calibrated(&self) -> bool {
        self.samples >= self.calibration_syncs
    }

    pub fn sync_count(&self) -> u32 {
        self.samples
    }

    fn local_to_ptp_ns(&self, mono_ns: i128) -> ClockResult<i128> {
        if self.samples == 0 {
            return Err(ClockError::NotCalibrated);
        }
        Ok((self.offset_ns + self.rate * mono_ns as f64) as i128)
    }

    fn ptp_to_local_ns(&self, ptp_ns: i128) -> ClockResult<i128> {
        if self.samples == 0 || self.rate == 0.0 {
            return Err(ClockError::NotCalibrated);
        }
        Ok(((ptp_ns as f64 - self.offset_ns) / self.rate) as i128)
    }

    /// Drops the fit so the next Sync pair starts a fresh calibration. Used
    /// when the parent changes.
    pub fn reset(&mut self) {
        self.rate = 1.0;
        self.offset_ns = 0.0;
        self.samples = 0;
        self.last_mono = None;
        self.last_master = None;
        self.mean_path_delay_ns = 0.0;
    }
}

/// Shared handle onto the node's monotonic-to-PTP mapping. Cheap to clone;
/// all stream endpoints read the same fit the PTP port maintains.
#[derive(Debug, Clone)]
pub struct LocalPtpClock {
    servo: Arc<RwLock<ClockServo>>,
}

impl LocalPtpClock {
    pub fn new(time_constant: Duration, calibration_syncs: u32) -> Self {
        Self {
            servo: Arc::new(RwLock::new(ClockServo::new(
                time_constant,
                calibration_syncs,
            ))),
        }
    }

    pub fn local_to_ptp(&self, mono_ns: i128) -> ClockResult<PtpTimestamp> {
        let servo = self.servo.read().expect("servo lock poisoned");
        Ok(PtpTimestamp::from_nanos(servo.local_to_ptp_ns(mono_ns)?))
    }

    pub fn ptp_to_local(&self, ptp: PtpTimestamp) -> ClockResult<i128> {
        let servo = self.servo.read().expect("servo lock poisoned");
        servo.ptp_to_local_ns(ptp.as_nanos())
    }

    /// The current PTP time according to the local fit.
    pub fn now(&self) -> ClockResult<PtpTimestamp> {
        self.local_to_ptp(monotonic_nanos()?)
    }

    pub fn is_calibrated(&self) -> bool {
        self.servo.read().expect("servo lock poisoned").is_calibrated()
    }

    pub(crate) fn with_servo<T>(&self, f: impl FnOnce(&mut ClockServo) -> T) -> T {
        let mut servo = self.servo.write().expect("servo lock poisoned");
        f(&mut servo)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SEC: i128 = 1_000_000_000;

    #[test]
    fn uncalibrated_clock_reports_error() {
        let clock = LocalPtpClock::new(Duration::from_secs(10), 8);
        assert!(matches!(
            clock.local_to_ptp(0),
            Err(ClockError::NotCalibrated)
        ));
    }

    #[test]
    fn single_sync_gives_raw_offset_mapping() {
        let clock = LocalPtpClock::new(Duration::from_secs(10), 8);
        clock.with_servo(|servo| servo.observe_sync(5 * SEC, 1_000 * SEC));
        let ptp = clock.local_to_ptp(6 * SEC).expect("mapping");
        assert_eq!(1_001, ptp.seconds);
    }

    #[test]
    fn rate_converges_towards_observed_drift() {
        let clock = LocalPtpClock::new(Duration::from_secs(4), 4);
        // Master advances 1.001 ns per local ns
        for i in 0..64i128 {
            let mono = i * SEC;
            let master = 1_000 * SEC + mono + mono / 1000;
            clock.with_servo(|servo| servo.observe_sync(mono, master));
        }
        assert!(clock.is_calibrated());
        let at = 64 * SEC;
        let expected = 1_000 * SEC + at + at / 1000;
        let mapped = clock.local_to_ptp(at).expect("mapping").as_nanos();
        let error = (mapped - expected).abs();
        assert!(error < SEC / 1_000, "error was {error} ns");
    }

    #[test]
    fn inverse_mapping_roundtrips() {
        let clock = LocalPtpClock::new(Duration::from_secs(10), 2);
        clock.with_servo(|servo| {
            servo.observe_sync(SEC, 500 * SEC);
            servo.observe_sync(2 * SEC, 501 * SEC);
        });
        let mono = 5 * SEC;
        let ptp = clock.local_to_ptp(mono).expect("forward");
        let back = clock.ptp_to_local(ptp).expect("inverse");
        assert!((back - mono).abs() < 1_000);
    }

    #[test]
    fn reset_drops_calibration() {
        let clock = LocalPtpClock::new(Duration::from_secs(10), 1);
        clock.with_servo(|servo| servo.observe_sync(0, 0));
        assert!(clock.is_calibrated());
        clock.with_servo(ClockServo::reset);
        assert!(!clock.is_calibrated());
    }
}
