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

//! Audio buffering: the byte FIFO between a producer and the packet
//! scheduler on the transmit side, and the media-time indexed jitter buffer
//! on the receive side.

use crate::{
    config::FillPolicy,
    formats::{AudioFormat, Frames},
    rtp::RtpPacket,
};
use tracing::{debug, info, warn};

/// Fixed capacity byte ring between the audio producer and the packet
/// scheduler. Overwrites nothing: writes beyond the free space are truncated
/// and counted, which surfaces a producer that outruns the scheduler.
#[derive(Debug)]
pub struct ByteFifo {
    buffer: Box<[u8]>,
    read_pos: usize,
    len: usize,
    pub truncated_writes: u64,
}

impl ByteFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into(),
            read_pos: 0,
            len: 0,
            truncated_writes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Appends as much of `data` as fits, returning the number of bytes
    /// written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let free = self.capacity() - self.len;
        let amount = data.len().min(free);
        if amount < data.len() {
            self.truncated_writes += 1;
        }

        let write_pos = (self.read_pos + self.len) % self.capacity();
        let first = amount.min(self.capacity() - write_pos);
        self.buffer[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        self.buffer[..amount - first].copy_from_slice(&data[first..amount]);
        self.len += amount;

        amount
    }

    /// Pops exactly `out.len()` bytes. Returns false (and consumes nothing)
    /// when not enough data is buffered.
    pub fn read(&mut self, out: &mut [u8]) -> bool {
        if out.len() > self.len {
            return false;
        }

        let out_len = out.len();
        let first = out_len.min(self.capacity() - self.read_pos);
        out[..first].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + first]);
        out[first..].copy_from_slice(&self.buffer[..out_len - first]);
        self.read_pos = (self.read_pos + out.len()) % self.capacity();
        self.len -= out.len();

        true
    }
}

const TIMESTAMP_WRAP: u64 = 1 << 32;

/// The receive side playout buffer. Packets land at the position their
/// unwrapped RTP timestamp maps to in media time, so reordering resolves
/// itself; the pull side reads the frames for `playout time - delay`. Late
/// packets are dropped and counted, early packets wait in place. Frames the
/// network never delivered are filled with zeros or the last known sample.
pub struct JitterBuffer {
    format: AudioFormat,
    delay_frames: Frames,
    fill_policy: FillPolicy,
    buffer: Box<[u8]>,
    capacity_frames: Frames,
    timestamp_offset: Option<u64>,
    last_rtp_timestamp: Option<u32>,
    latest_written: Frames,
    last_read: Frames,
    last_frame: Vec<u8>,
    pub late_packets: u64,
    pub underrun_frames: u64,
}

impl JitterBuffer {
    pub fn new(format: AudioFormat, delay_frames: Frames, fill_policy: FillPolicy) -> Self {
        // Enough room for four delay windows of early packets
        let capacity_frames = (delay_frames * 4).max(1_024);
        let bytes = capacity_frames as usize * format.bytes_per_frame();
        Self {
            format,
            delay_frames,
            fill_policy,
            buffer: vec![0u8; bytes].into(),
            capacity_frames,
            timestamp_offset: None,
            last_rtp_timestamp: None,
            latest_written: 0,
            last_read: 0,
            last_frame: vec![0u8; format.bytes_per_frame()],
            late_packets: 0,
            underrun_frames: 0,
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn delay_frames(&self) -> Frames {
        self.delay_frames
    }

    /// Inserts a packet at its media-time position. `current_media_time` is
    /// the receiver's clock in frames, used once to unwrap the 32-bit RTP
    /// timestamp into absolute media time.
    pub fn insert(&mut self, packet: &RtpPacket, current_media_time: Frames) {
        let timestamp = packet.timestamp;

        if let Some(last) = self.last_rtp_timestamp
            && timestamp < last
            && last - timestamp > u32::MAX / 2
        {
            info!("RTP timestamp wrapped");
            if let Some(offset) = &mut self.timestamp_offset {
                *offset += TIMESTAMP_WRAP;
            }
        }
        if self.timestamp_offset.is_none() {
            self.calibrate_timestamp_offset(timestamp, current_media_time);
        }
        // Only move the wrap tracker forward
        match self.last_rtp_timestamp {
            Some(last) if timestamp.wrapping_sub(last) > u32::MAX / 2 => {}
            _ => self.last_rtp_timestamp = Some(timestamp),
        }

        let offset = self.timestamp_offset.unwrap_or(0);
        let position = offset + timestamp as u64;
        let frames = (packet.payload.len() / self.format.bytes_per_frame()) as u64;

        if position + frames <= self.last_read {
            self.late_packets += 1;
            debug!("Dropping late packet at media time {position}");
            return;
        }

        let bytes_per_frame = self.format.bytes_per_frame();
        for frame in 0..frames {
            let target = (position + frame) % self.capacity_frames;
            let start = target as usize * bytes_per_frame;
            let src = frame as usize * bytes_per_frame;
            self.buffer[start..start + bytes_per_frame]
                .copy_from_slice(&packet.payload[src..src + bytes_per_frame]);
        }

        if frames > 0 {
            let last_start = (frames as usize - 1) * bytes_per_frame;
            self.last_frame
                .copy_from_slice(&packet.payload[last_start..last_start + bytes_per_frame]);
        }
        if position + frames > self.latest_written {
            self.latest_written = position + frames;
        }
    }

    /// Pulls the frames whose playout moment is `at_media_time`, i.e. the
    /// region starting `delay` frames earlier. `out` must be a whole number
    /// of frames.
    pub fn read(&mut self, at_media_time: Frames, out: &mut [u8]) {
        let bytes_per_frame = self.format.bytes_per_frame();
        let frames = (out.len() / bytes_per_frame) as u64;
        let start = at_media_time.saturating_sub(self.delay_frames);

        let available = self.latest_written.max(start);
        let missing = (start + frames).saturating_sub(available);
        if missing > 0 {
            self.underrun_frames += missing;
        }

        for frame in 0..frames {
            let position = start + frame;
            let target = &mut out
                [frame as usize * bytes_per_frame..(frame as usize + 1) * bytes_per_frame];
            if position >= self.latest_written.saturating_sub(self.capacity_frames)
                && position < self.latest_written
            {
                let source = (position % self.capacity_frames) as usize * bytes_per_frame;
                target.copy_from_slice(&self.buffer[source..source + bytes_per_frame]);
            } else {
                match self.fill_policy {
                    FillPolicy::Zero => target.fill(0),
                    FillPolicy::HoldLast => target.copy_from_slice(&self.last_frame),
                }
            }
        }

        self.last_read = start + frames;
    }

    fn calibrate_timestamp_offset(&mut self, rtp_timestamp: u32, current_media_time: Frames) {
        let wraps = current_media_time / TIMESTAMP_WRAP;
        let modulo = current_media_time % TIMESTAMP_WRAP;
        let diff = rtp_timestamp as i128 - modulo as i128;
        if diff.abs() >= modulo as i128 {
            warn!("Calibrating timestamp offset close to wrap, calibration may be inaccurate");
        }
        // The offset is the media time of the last timestamp wrap, so
        // offset + rtp timestamp is the packet's absolute media time
        let offset = wraps * TIMESTAMP_WRAP;
        info!("RTP timestamp offset calibrated to {offset}");
        self.timestamp_offset = Some(offset);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formats::AudioEncoding;

    fn format() -> AudioFormat {
        AudioFormat::new(AudioEncoding::PcmS16, 48_000, 1)
    }

    fn packet(timestamp: u32, frames: usize, value: u8) -> RtpPacket {
        RtpPacket {
            timestamp,
            payload: vec![value; frames * 2],
            ..Default::default()
        }
    }

    #[test]
    fn fifo_write_read_roundtrip() {
        let mut fifo = ByteFifo::new(8);
        assert_eq!(5, fifo.write(&[1, 2, 3, 4, 5]));
        let mut out = [0u8; 3];
        assert!(fifo.read(&mut out));
        assert_eq!([1, 2, 3], out);
        assert_eq!(2, fifo.len());
    }

    #[test]
    fn fifo_wraps_around_capacity() {
        let mut fifo = ByteFifo::new(4);
        fifo.write(&[1, 2, 3]);
        let mut out = [0u8; 2];
        assert!(fifo.read(&mut out));
        fifo.write(&[4, 5, 6]);
        let mut out = [0u8; 4];
        assert!(fifo.read(&mut out));
        assert_eq!([3, 4, 5, 6], out);
    }

    #[test]
    fn fifo_truncates_when_full() {
        let mut fifo = ByteFifo::new(4);
        assert_eq!(4, fifo.write(&[1, 2, 3, 4, 5]));
        assert_eq!(1, fifo.truncated_writes);
    }

    #[test]
    fn fifo_read_fails_short() {
        let mut fifo = ByteFifo::new(4);
        fifo.write(&[1]);
        let mut out = [0u8; 2];
        assert!(!fifo.read(&mut out));
        assert_eq!(1, fifo.len());
    }

    #[test]
    fn jitter_buffer_plays_out_after_delay() {
        let mut buffer = JitterBuffer::new(format(), 48, FillPolicy::Zero);
        // Stream begins at media time 1000
        buffer.insert(&packet(1_000, 48, 0xAA), 1_000);
        let mut out = vec![0u8; 48 * 2];
        // Playout for media time 1048 reads the region starting at 1000
        buffer.read(1_048, &mut out);
        assert!(out.iter().all(|&b| b == 0xAA));
        assert_eq!(0, buffer.underrun_frames);
    }

    #[test]
    fn out_of_order_packets_resolve_by_timestamp() {
        let mut buffer = JitterBuffer::new(format(), 48, FillPolicy::Zero);
        buffer.insert(&packet(1_048, 48, 0xBB), 1_000);
        buffer.insert(&packet(1_000, 48, 0xAA), 1_002);
        let mut out = vec![0u8; 96 * 2];
        buffer.read(1_048, &mut out);
        assert!(out[..96].iter().all(|&b| b == 0xAA));
        assert!(out[96..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn late_packets_are_dropped_and_counted() {
        let mut buffer = JitterBuffer::new(format(), 48, FillPolicy::Zero);
        buffer.insert(&packet(1_000, 48, 0xAA), 1_000);
        let mut out = vec![0u8; 48 * 2];
        buffer.read(1_048, &mut out);
        // This packet's frames were already played out
        buffer.insert(&packet(952, 48, 0xCC), 1_060);
        assert_eq!(1, buffer.late_packets);
    }

    #[test]
    fn missing_frames_are_zero_filled() {
        let mut buffer = JitterBuffer::new(format(), 48, FillPolicy::Zero);
        buffer.insert(&packet(1_000, 48, 0xAA), 1_000);
        let mut out = vec![0xFFu8; 96 * 2];
        buffer.read(1_048, &mut out);
        assert!(out[..96].iter().all(|&b| b == 0xAA));
        assert!(out[96..].iter().all(|&b| b == 0x00));
        assert_eq!(48, buffer.underrun_frames);
    }

    #[test]
    fn missing_frames_can_hold_the_last_sample() {
        let mut buffer = JitterBuffer::new(format(), 48, FillPolicy::HoldLast);
        buffer.insert(&packet(1_000, 48, 0xAA), 1_000);
        let mut out = vec![0u8; 96 * 2];
        buffer.read(1_048, &mut out);
        assert!(out[96..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn timestamp_wrap_extends_offset() {
        let mut buffer = JitterBuffer::new(format(), 48, FillPolicy::Zero);
        let near_wrap = u32::MAX - 47;
        let media_time = near_wrap as u64;
        buffer.insert(&packet(near_wrap, 48, 0xAA), media_time);
        // The next packet wraps to timestamp 0
        buffer.insert(&packet(0, 48, 0xBB), media_time + 48);
        assert_eq!(Some(TIMESTAMP_WRAP), buffer.timestamp_offset);
        let mut out = vec![0u8; 48 * 2];
        buffer.read(TIMESTAMP_WRAP + 48, &mut out);
        assert!(out.iter().all(|&b| b == 0xBB));
    }
}
