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

//! Example sender: advertises one session on the configured interface and
//! streams a 440 Hz sine tone.

use miette::{IntoDiagnostic, Result};
use ravenna_rs::{
    config::Config,
    error::RavennaResult,
    formats::{AudioEncoding, AudioFormat, PacketTime, SampleWriter},
    node::RavennaNode,
    telemetry,
};
use std::{f32::consts::PI, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    telemetry::init().into_diagnostic()?;
    let config = Config::load().await.into_diagnostic()?;

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("ravenna-sender", move |s| async move {
            run(s, config).await
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await?;

    Ok(())
}

async fn run(subsys: SubsystemHandle, config: Config) -> RavennaResult<()> {
    let mut node = RavennaNode::start(&subsys, config)?;

    let audio_format = AudioFormat::new(AudioEncoding::PcmS24, 48_000, 2);
    let packet_time = PacketTime::Ptime1Ms;

    let transmitter = node.create_transmitter(&subsys, "sine-test", packet_time)?;
    transmitter.set_audio_format(audio_format).await?;
    transmitter.start(None).await?;

    let mut player = SinePlayer::new(audio_format, packet_time);

    loop {
        tokio::select! {
            _ = player.interval.tick() => {
                transmitter.feed_audio(player.next_block()).await?;
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    transmitter.stop().await;

    Ok(())
}

struct SinePlayer {
    audio_format: AudioFormat,
    frames_per_block: usize,
    interval: tokio::time::Interval,
    pos: u64,
}

impl SinePlayer {
    fn new(audio_format: AudioFormat, packet_time: PacketTime) -> Self {
        let frames_per_block = packet_time.framecount(audio_format.sample_rate) as usize;
        let ptime = packet_time.signaled_ptime(audio_format.sample_rate);
        let mut interval = interval(Duration::from_nanos((ptime * 1_000_000.0) as u64));
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        Self {
            audio_format,
            frames_per_block,
            interval,
            pos: 0,
        }
    }

    fn next_block(&mut self) -> Vec<u8> {
        let bytes_per_sample = self.audio_format.encoding.bytes_per_sample();
        let mut block =
            vec![0u8; self.frames_per_block * self.audio_format.bytes_per_frame()];

        let frequency = 440.0;
        let vol = 0.5;

        for frame_buf in block.chunks_mut(self.audio_format.bytes_per_frame()) {
            let val = vol
                * (self.pos as f32 * (frequency / self.audio_format.sample_rate as f32)
                    * 2.0
                    * PI)
                    .sin();
            self.pos += 1;

            for ch_buf in frame_buf.chunks_mut(bytes_per_sample) {
                self.audio_format.encoding.write_sample(val, ch_buf);
            }
        }

        block
    }
}
