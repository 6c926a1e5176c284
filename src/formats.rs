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

use crate::error::{RavennaError, RavennaResult};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub type MilliSeconds = f32;
pub type Frames = u64;
pub type FramesPerSecond = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AudioEncoding {
    PcmU8,
    PcmS16,
    PcmS24,
    PcmS32,
    PcmFloat,
    PcmDouble,
}

impl AudioEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::PcmU8 => 1,
            AudioEncoding::PcmS16 => 2,
            AudioEncoding::PcmS24 => 3,
            AudioEncoding::PcmS32 | AudioEncoding::PcmFloat => 4,
            AudioEncoding::PcmDouble => 8,
        }
    }

    /// The RFC 3551 / RFC 3190 encoding name used in rtpmap attributes.
    /// Floating point payloads have no linear PCM encoding name.
    pub fn encoding_name(&self) -> RavennaResult<&'static str> {
        match self {
            AudioEncoding::PcmU8 => Ok("L8"),
            AudioEncoding::PcmS16 => Ok("L16"),
            AudioEncoding::PcmS24 => Ok("L24"),
            AudioEncoding::PcmS32 => Ok("L32"),
            AudioEncoding::PcmFloat | AudioEncoding::PcmDouble => Err(
                RavennaError::UnsupportedAudioFormat(format!("{self:?} cannot be signaled in SDP")),
            ),
        }
    }
}

impl FromStr for AudioEncoding {
    type Err = RavennaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L8" => Ok(AudioEncoding::PcmU8),
            "L16" => Ok(AudioEncoding::PcmS16),
            "L24" => Ok(AudioEncoding::PcmS24),
            "L32" => Ok(AudioEncoding::PcmS32),
            other => Err(RavennaError::UnsupportedAudioFormat(other.to_owned())),
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encoding_name() {
            Ok(name) => write!(f, "{name}"),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum Interleaving {
    #[default]
    Interleaved,
    NonInterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: FramesPerSecond,
    pub num_channels: usize,
    pub interleaving: Interleaving,
}

impl AudioFormat {
    pub fn new(encoding: AudioEncoding, sample_rate: FramesPerSecond, num_channels: usize) -> Self {
        Self {
            encoding,
            sample_rate,
            num_channels,
            interleaving: Interleaving::Interleaved,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.num_channels
    }

    /// Whether this format can be carried on an AES67 stream. Only the PCM
    /// widths with an SDP encoding name up to 24 bit are transmittable.
    pub fn is_transmittable(&self) -> bool {
        matches!(
            self.encoding,
            AudioEncoding::PcmU8 | AudioEncoding::PcmS16 | AudioEncoding::PcmS24
        )
    }
}

/// The packet times an AES67 sender may signal. Each carries the number of
/// frames per packet at 48 kHz; other sample rates scale from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum PacketTime {
    Ptime125Us,
    Ptime250Us,
    Ptime333Us,
    #[default]
    Ptime1Ms,
    Ptime4Ms,
}

impl PacketTime {
    fn base_framecount_48k(&self) -> u32 {
        match self {
            PacketTime::Ptime125Us => 6,
            PacketTime::Ptime250Us => 12,
            PacketTime::Ptime333Us => 16,
            PacketTime::Ptime1Ms => 48,
            PacketTime::Ptime4Ms => 192,
        }
    }

    /// Frames per packet for the given sample rate. For rates that are not a
    /// multiple of 48 kHz the 48 kHz framecount of the next multiple is used,
    /// which keeps the framecount integral (44.1 kHz at nominal 1 ms sends
    /// 48-frame packets of ~1.088 ms).
    pub fn framecount(&self, sample_rate: FramesPerSecond) -> u32 {
        let multiplier = sample_rate.div_ceil(48_000).max(1) as u32;
        self.base_framecount_48k() * multiplier
    }

    /// The packet time to put into the SDP ptime attribute,
    /// `framecount / sample_rate * 1000`.
    pub fn signaled_ptime(&self, sample_rate: FramesPerSecond) -> MilliSeconds {
        self.framecount(sample_rate) as f32 * 1_000.0 / sample_rate as f32
    }
}

pub trait SampleReader<S> {
    fn read_sample(&self, buffer: &[u8]) -> S;
}

pub trait SampleWriter<S> {
    fn write_sample(&self, sample: S, buffer: &mut [u8]);
}

impl SampleReader<f32> for AudioEncoding {
    fn read_sample(&self, buffer: &[u8]) -> f32 {
        match self {
            AudioEncoding::PcmU8 => (buffer[0] as f32 - 128.0) / 127.0,
            AudioEncoding::PcmS16 => {
                let value = i16::from_be_bytes([buffer[0], buffer[1]]) as f32;
                if value >= 0.0 {
                    value / i16::MAX as f32
                } else {
                    (value + 1.0) / i16::MAX as f32
                }
            }
            AudioEncoding::PcmS24 => {
                let value = sign_extend_24(buffer) as f32;
                if value >= 0.0 {
                    value / 0x7FFFFF as f32
                } else {
                    (value + 1.0) / 0x7FFFFF as f32
                }
            }
            _ => 0.0,
        }
    }
}

impl SampleWriter<f32> for AudioEncoding {
    fn write_sample(&self, sample: f32, buffer: &mut [u8]) {
        let clamped = sample.clamp(-1.0, 1.0);
        match self {
            AudioEncoding::PcmU8 => buffer[0] = ((clamped * 127.0) + 128.0) as u8,
            AudioEncoding::PcmS16 => {
                let value = (clamped * i16::MAX as f32) as i16;
                buffer[..2].copy_from_slice(&value.to_be_bytes());
            }
            AudioEncoding::PcmS24 => {
                let value = (clamped * 0x7FFFFF as f32) as i32;
                let bytes = value.to_be_bytes();
                buffer[..3].copy_from_slice(&bytes[1..4]);
            }
            _ => {}
        }
    }
}

fn sign_extend_24(bytes: &[u8]) -> i32 {
    let mut value = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | (bytes[2] as i32);
    if value & 0x800000 != 0 {
        value |= !0xFFFFFF;
    }
    value
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn framecount_scales_with_sample_rate() {
        assert_eq!(48, PacketTime::Ptime1Ms.framecount(48_000));
        assert_eq!(96, PacketTime::Ptime1Ms.framecount(96_000));
        assert_eq!(6, PacketTime::Ptime125Us.framecount(48_000));
        assert_eq!(16, PacketTime::Ptime333Us.framecount(48_000));
    }

    #[test]
    fn framecount_stays_integral_for_44_1_khz() {
        assert_eq!(48, PacketTime::Ptime1Ms.framecount(44_100));
        let ptime = PacketTime::Ptime1Ms.signaled_ptime(44_100);
        assert!((ptime - 1.0884353).abs() < 1e-4);
    }

    #[test]
    fn signaled_ptime_is_nominal_for_48k_multiples() {
        assert!((PacketTime::Ptime1Ms.signaled_ptime(48_000) - 1.0).abs() < f32::EPSILON);
        assert!((PacketTime::Ptime4Ms.signaled_ptime(96_000) - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn encoding_names_map_per_rfc() {
        assert_eq!("L8", AudioEncoding::PcmU8.encoding_name().expect("name"));
        assert_eq!("L16", AudioEncoding::PcmS16.encoding_name().expect("name"));
        assert_eq!("L24", AudioEncoding::PcmS24.encoding_name().expect("name"));
        assert_eq!("L32", AudioEncoding::PcmS32.encoding_name().expect("name"));
        assert!(AudioEncoding::PcmFloat.encoding_name().is_err());
    }

    #[test]
    fn only_u8_s16_and_s24_are_transmittable() {
        for (encoding, expected) in [
            (AudioEncoding::PcmU8, true),
            (AudioEncoding::PcmS16, true),
            (AudioEncoding::PcmS24, true),
            (AudioEncoding::PcmS32, false),
            (AudioEncoding::PcmFloat, false),
            (AudioEncoding::PcmDouble, false),
        ] {
            let format = AudioFormat::new(encoding, 48_000, 2);
            assert_eq!(expected, format.is_transmittable(), "{encoding:?}");
        }
    }

    #[test]
    fn bytes_per_frame_is_sample_width_times_channels() {
        let format = AudioFormat::new(AudioEncoding::PcmS24, 48_000, 8);
        assert_eq!(24, format.bytes_per_frame());
    }

    #[test]
    fn sample_roundtrip_l24() {
        let mut buf = [0u8; 3];
        AudioEncoding::PcmS24.write_sample(0.5, &mut buf);
        let read: f32 = AudioEncoding::PcmS24.read_sample(&buf);
        assert!((read - 0.5).abs() < 1e-5);
    }
}
