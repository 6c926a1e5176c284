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

//! The receiving stream endpoint. It fetches the session description over
//! RTSP, validates that the stream's clock domain matches the local PTP
//! domain, joins the multicast group and feeds a jitter buffer from which
//! the pull API serves samples at the PTP time the caller asks for.

use crate::{
    buffer::JitterBuffer,
    config::ReceiverConfig,
    error::{RavennaError, RavennaResult, RtspError},
    formats::AudioFormat,
    ptp::{LocalPtpClock, PtpTimestamp},
    rtp::{Depacketizer, RtpPacket, RtpReceiver, SequenceVerdict},
    rtsp::{RtspClient, client::RtspClientEvent},
    sdp::SessionDescription,
    utils::AverageCalculationBuffer,
};
use std::net::{IpAddr, Ipv4Addr};
use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

/// Everything the receiver needs from a parsed session description.
#[derive(Debug, Clone, PartialEq)]
pub struct RxDescriptor {
    pub session_name: String,
    pub audio_format: AudioFormat,
    pub multicast_addr: Ipv4Addr,
    pub port: u16,
    pub payload_type: u8,
    pub framecount: Option<u32>,
    pub media_clock_offset: i64,
    pub clock_domain: Option<i32>,
    pub source_filter: Vec<Ipv4Addr>,
}

impl RxDescriptor {
    /// Validates and extracts the receive parameters from an SDP document,
    /// the way a RAVENNA receiver reads a DESCRIBE response.
    pub fn from_sdp(sdp: &SessionDescription) -> RavennaResult<Self> {
        let media = sdp
            .audio_media()
            .ok_or_else(|| invalid_sdp("media description is missing"))?;

        if media.protocol != "RTP/AVP" {
            return Err(invalid_sdp(format!(
                "unsupported media protocol: {}; only RTP/AVP is supported",
                media.protocol
            )));
        }

        let connection = media
            .connection_info
            .as_ref()
            .or(sdp.connection_info.as_ref())
            .ok_or_else(|| invalid_sdp("connection data is missing"))?;
        if connection.address_type != "IP4" {
            return Err(invalid_sdp(format!(
                "unsupported addrtype: {}",
                connection.address_type
            )));
        }
        let multicast_addr: Ipv4Addr = connection
            .address
            .parse()
            .map_err(|_| invalid_sdp(format!("invalid ip address: {}", connection.address)))?;

        let format = media
            .formats
            .first()
            .ok_or_else(|| invalid_sdp("no payload format"))?;
        let audio_format = format.to_audio_format()?;

        let clock_domain = media
            .clock_domain
            .or(sdp.clock_domain)
            .map(|domain| domain.domain)
            .or_else(|| {
                media
                    .reference_clock
                    .as_ref()
                    .or(sdp.reference_clock.as_ref())
                    .and_then(|clock| clock.domain)
            });

        let media_clock_offset = media
            .media_clock
            .as_ref()
            .or(sdp.media_clock.as_ref())
            .and_then(|clock| clock.offset)
            .unwrap_or(0);

        let source_filter = media
            .source_filter
            .as_ref()
            .map(|filter| {
                filter
                    .sources
                    .iter()
                    .filter_map(|source| source.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            session_name: sdp.session_name.clone(),
            audio_format,
            multicast_addr,
            port: media.port,
            payload_type: format.payload_type,
            framecount: media.framecount,
            media_clock_offset,
            clock_domain,
            source_filter,
        })
    }
}

fn invalid_sdp(message: impl Into<String>) -> RavennaError {
    RavennaError::SdpError(crate::error::SdpError::ParseError {
        line: 0,
        message: message.into(),
    })
}

#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    /// The receiver joined the stream and is buffering.
    Ready,
    /// An ANNOUNCE changed the stream's audio format; consumers must re-read
    /// their buffer sizing.
    StreamUpdated { format: AudioFormat },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub late_packets: u64,
    pub underrun_frames: u64,
}

enum ApiMessage {
    Read {
        at: PtpTimestamp,
        frames: usize,
        reply: oneshot::Sender<Vec<u8>>,
    },
    GetStats(oneshot::Sender<ReceiverStats>),
}

/// Handle onto a receiving session. Keeps the RTSP control connection alive
/// for ANNOUNCE updates; dropping the handle leaves the multicast group.
pub struct RavennaReceiver {
    api: mpsc::Sender<ApiMessage>,
    events: broadcast::Sender<ReceiverEvent>,
    descriptor: RxDescriptor,
    rtp_rx: RtpReceiver,
    _rtsp_client: RtspClient,
}

impl RavennaReceiver {
    /// Issues DESCRIBE for the given path, validates the returned SDP
    /// against the local PTP domain and joins the stream.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(subsys, rtsp_client, rtp_rx, clock, config))]
    pub async fn create(
        subsys: &SubsystemHandle,
        rtsp_client: RtspClient,
        rtp_rx: RtpReceiver,
        clock: LocalPtpClock,
        ptp_domain: u8,
        config: ReceiverConfig,
        interface_addr: Ipv4Addr,
        path: &str,
    ) -> RavennaResult<Self> {
        let response = rtsp_client.describe(path).await?;
        if !response.is_success() {
            return Err(RavennaError::RtspError(RtspError::NoSuchPath(
                path.to_owned(),
            )));
        }

        let sdp = SessionDescription::parse(&response.data)?;
        let descriptor = RxDescriptor::from_sdp(&sdp)?;

        if let Some(domain) = descriptor.clock_domain
            && domain != ptp_domain as i32
        {
            return Err(RavennaError::ClockDomainMismatch {
                expected: ptp_domain,
                actual: domain,
            });
        }

        // The SDP source filter becomes a hard constraint on the ingress:
        // datagrams from senders outside it are counted and dropped
        let source_filter: Vec<IpAddr> = descriptor
            .source_filter
            .iter()
            .copied()
            .map(IpAddr::V4)
            .collect();
        let packets = rtp_rx.subscribe(
            subsys,
            descriptor.multicast_addr,
            interface_addr,
            descriptor.port,
            None,
            source_filter,
        )?;

        let (api_tx, api_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(16);

        let buffer = JitterBuffer::new(
            descriptor.audio_format,
            config.delay_frames,
            config.fill_policy,
        );
        let delay_window = descriptor
            .framecount
            .map(|framecount| {
                (descriptor.audio_format.sample_rate as u64 / framecount.max(1) as u64).max(1)
            })
            .unwrap_or(1_000);

        let actor = ReceiverActor {
            descriptor: descriptor.clone(),
            clock,
            packets,
            api_rx,
            events: events.clone(),
            rtsp_events: rtsp_client.subscribe(),
            buffer,
            depacketizer: Depacketizer::default(),
            delay_stats: AverageCalculationBuffer::new(vec![0i64; delay_window as usize].into()),
        };
        subsys.start(SubsystemBuilder::new(
            format!("receiver-{}", descriptor.session_name),
            |s| actor.run(s),
        ));

        info!(
            "Receiver joined '{}' at {}:{}",
            descriptor.session_name, descriptor.multicast_addr, descriptor.port
        );
        events.send(ReceiverEvent::Ready).ok();

        Ok(Self {
            api: api_tx,
            events,
            descriptor,
            rtp_rx,
            _rtsp_client: rtsp_client,
        })
    }

    pub fn descriptor(&self) -> &RxDescriptor {
        &self.descriptor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverEvent> {
        self.events.subscribe()
    }

    /// Pulls the frames whose playout moment is the given PTP time. Frames
    /// the network has not delivered come back filled per the configured
    /// fill policy.
    pub async fn read(&self, at: PtpTimestamp, frames: usize) -> RavennaResult<Vec<u8>> {
        let (reply, response) = oneshot::channel();
        self.api
            .send(ApiMessage::Read { at, frames, reply })
            .await
            .map_err(|_| RavennaError::Cancelled)?;
        response.await.map_err(|_| RavennaError::Cancelled)
    }

    pub async fn stats(&self) -> RavennaResult<ReceiverStats> {
        let (reply, response) = oneshot::channel();
        self.api
            .send(ApiMessage::GetStats(reply))
            .await
            .map_err(|_| RavennaError::Cancelled)?;
        response.await.map_err(|_| RavennaError::Cancelled)
    }
}

impl Drop for RavennaReceiver {
    fn drop(&mut self) {
        self.rtp_rx.unsubscribe(self.descriptor.port, None);
    }
}

struct ReceiverActor {
    descriptor: RxDescriptor,
    clock: LocalPtpClock,
    packets: mpsc::Receiver<RtpPacket>,
    api_rx: mpsc::Receiver<ApiMessage>,
    events: broadcast::Sender<ReceiverEvent>,
    rtsp_events: broadcast::Receiver<RtspClientEvent>,
    buffer: JitterBuffer,
    depacketizer: Depacketizer,
    delay_stats: AverageCalculationBuffer<i64>,
}

impl ReceiverActor {
    async fn run(mut self, subsys: SubsystemHandle) -> RavennaResult<()> {
        info!("Receiver actor '{}' started.", self.descriptor.session_name);

        loop {
            select! {
                packet = self.packets.recv() => match packet {
                    Some(packet) => self.packet_received(packet),
                    None => break,
                },
                api_msg = self.api_rx.recv() => match api_msg {
                    Some(msg) => self.process_api_message(msg),
                    None => break,
                },
                rtsp_event = self.rtsp_events.recv() => match rtsp_event {
                    Ok(RtspClientEvent::Request(request)) => self.server_request(&request.method, &request.data),
                    Ok(RtspClientEvent::Disconnected) => {
                        // The control connection is gone; the stream itself
                        // keeps playing, the caller re-establishes control
                        warn!("RTSP connection to sender lost");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Receiver missed {n} RTSP events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        info!("Receiver actor '{}' stopped.", self.descriptor.session_name);

        Ok(())
    }

    fn packet_received(&mut self, mut packet: RtpPacket) {
        if packet.payload_type != self.descriptor.payload_type {
            debug!(
                "Ignoring packet with payload type {}",
                packet.payload_type
            );
            return;
        }

        match self.depacketizer.update(packet.sequence_number) {
            SequenceVerdict::InSequence => {}
            SequenceVerdict::Gap(gap) => {
                warn!("{gap} packets lost before sequence {}", packet.sequence_number);
            }
            SequenceVerdict::Old => {
                debug!("Out-of-order packet {}", packet.sequence_number);
            }
        }

        let media_time = match self.clock.now() {
            Ok(now) => now.to_media_time(self.descriptor.audio_format.sample_rate),
            Err(_) => {
                // Without a calibrated clock there is no playout time yet
                return;
            }
        };

        // The SDP media clock offset maps RTP timestamps back onto the
        // shared media time axis
        packet.timestamp = packet
            .timestamp
            .wrapping_sub(self.descriptor.media_clock_offset as u32);

        self.buffer.insert(&packet, media_time);

        let delay = (media_time as u32).wrapping_sub(packet.timestamp) as i32 as i64;
        if let Some(average) = self.delay_stats.update(delay) {
            let micros =
                (average * 1_000_000) / self.descriptor.audio_format.sample_rate as i64;
            debug!("Network delay: {average} frames / {micros} µs");
        }
    }

    fn process_api_message(&mut self, msg: ApiMessage) {
        match msg {
            ApiMessage::Read { at, frames, reply } => {
                let media_time = at.to_media_time(self.descriptor.audio_format.sample_rate);
                let mut out =
                    vec![0u8; frames * self.descriptor.audio_format.bytes_per_frame()];
                self.buffer.read(media_time, &mut out);
                reply.send(out).ok();
            }
            ApiMessage::GetStats(reply) => {
                reply
                    .send(ReceiverStats {
                        packets_received: self.depacketizer.packets_received,
                        packets_lost: self.depacketizer.packets_lost,
                        late_packets: self.buffer.late_packets,
                        underrun_frames: self.buffer.underrun_frames,
                    })
                    .ok();
            }
        }
    }

    /// An ANNOUNCE from the sender carries a fresh SDP. A changed audio
    /// format is surfaced as a stream-updated event; consumers re-read their
    /// buffer sizing.
    fn server_request(&mut self, method: &str, body: &str) {
        if method != "ANNOUNCE" {
            debug!("Ignoring server request: {method}");
            return;
        }

        let sdp = match SessionDescription::parse(body) {
            Ok(it) => it,
            Err(e) => {
                warn!("Ignoring ANNOUNCE with invalid SDP: {e}");
                return;
            }
        };
        let descriptor = match RxDescriptor::from_sdp(&sdp) {
            Ok(it) => it,
            Err(e) => {
                warn!("Ignoring ANNOUNCE with unusable SDP: {e}");
                return;
            }
        };

        if descriptor.audio_format != self.descriptor.audio_format {
            info!(
                "Stream '{}' changed format to {:?}",
                self.descriptor.session_name, descriptor.audio_format
            );
            self.descriptor = descriptor.clone();
            self.events
                .send(ReceiverEvent::StreamUpdated {
                    format: descriptor.audio_format,
                })
                .ok();
        } else {
            self.descriptor = descriptor;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formats::AudioEncoding;

    fn example_sdp() -> &'static str {
        "v=0\r\n\
         o=- 7 0 IN IP4 192.168.15.52\r\n\
         s=studio-feed\r\n\
         c=IN IP4 239.15.52.7/15\r\n\
         t=0 0\r\n\
         a=ts-refclk:ptp=IEEE1588-2008:39-A7-94-FF-FE-07-CB-D0:0\r\n\
         a=mediaclk:direct=0\r\n\
         a=clock-domain:PTPv2 0\r\n\
         m=audio 5004 RTP/AVP 98\r\n\
         c=IN IP4 239.15.52.7/15\r\n\
         a=rtpmap:98 L24/48000/2\r\n\
         a=source-filter: incl IN IP4 239.15.52.7 192.168.15.52\r\n\
         a=clock-domain:PTPv2 0\r\n\
         a=sync-time:0\r\n\
         a=recvonly\r\n\
         a=ptime:1\r\n\
         a=framecount:48\r\n"
    }

    #[test]
    fn descriptor_extracts_receive_parameters() {
        let sdp = SessionDescription::parse(example_sdp()).expect("parse");
        let descriptor = RxDescriptor::from_sdp(&sdp).expect("descriptor");

        assert_eq!("studio-feed", descriptor.session_name);
        assert_eq!(
            AudioFormat::new(AudioEncoding::PcmS24, 48_000, 2),
            descriptor.audio_format
        );
        assert_eq!("239.15.52.7".parse::<Ipv4Addr>().expect("addr"), descriptor.multicast_addr);
        assert_eq!(5004, descriptor.port);
        assert_eq!(98, descriptor.payload_type);
        assert_eq!(Some(48), descriptor.framecount);
        assert_eq!(0, descriptor.media_clock_offset);
        assert_eq!(Some(0), descriptor.clock_domain);
        assert_eq!(
            vec!["192.168.15.52".parse::<Ipv4Addr>().expect("addr")],
            descriptor.source_filter
        );
    }

    #[test]
    fn descriptor_rejects_missing_connection_info() {
        let sdp = SessionDescription::parse(
            "v=0\r\no=- 7 0 IN IP4 10.0.0.1\r\ns=x\r\nt=0 0\r\nm=audio 5004 RTP/AVP 98\r\na=rtpmap:98 L16/48000/2\r\n",
        )
        .expect("parse");
        assert!(RxDescriptor::from_sdp(&sdp).is_err());
    }

    #[test]
    fn descriptor_rejects_non_rtp_avp() {
        let sdp = SessionDescription::parse(
            "v=0\r\no=- 7 0 IN IP4 10.0.0.1\r\ns=x\r\nc=IN IP4 239.0.0.1/15\r\nt=0 0\r\nm=audio 5004 udp 98\r\n",
        )
        .expect("parse");
        assert!(RxDescriptor::from_sdp(&sdp).is_err());
    }

    #[test]
    fn descriptor_falls_back_to_refclk_domain() {
        let sdp = SessionDescription::parse(
            "v=0\r\no=- 7 0 IN IP4 10.0.0.1\r\ns=x\r\nc=IN IP4 239.0.0.1/15\r\nt=0 0\r\n\
             a=ts-refclk:ptp=IEEE1588-2008:39-A7-94-FF-FE-07-CB-D0:5\r\n\
             m=audio 5004 RTP/AVP 98\r\na=rtpmap:98 L16/48000/2\r\n",
        )
        .expect("parse");
        let descriptor = RxDescriptor::from_sdp(&sdp).expect("descriptor");
        assert_eq!(Some(5), descriptor.clock_domain);
    }
}
