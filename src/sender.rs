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

//! The transmitting stream endpoint. It advertises its session over DNS-SD,
//! serves its SDP over RTSP under `/by-name/<session>` and `/by-id/<id>`,
//! and paces RTP packets against the PTP clock: the scheduler wakes at a
//! tenth of the packet time and emits at most one packet per wake once the
//! stream's next timestamp is due.

use crate::{
    buffer::ByteFifo,
    config::UnderrunPolicy,
    discovery::{DnssdAdvertiser, ServiceId, ServiceRegistration},
    error::{RavennaError, RavennaResult},
    formats::{AudioFormat, PacketTime},
    ptp::{ClockIdentity, LocalPtpClock, PortState, PtpEvent},
    rtp::{Packetizer, RtpTransmitter},
    rtsp::{RtspResponse, RtspServer, server::announce_request},
    sdp::{
        ClockDomain, ConnectionInfo, Direction, MediaClockSource, MediaDescription, Origin,
        ReferenceClock, SdpFormat, SessionDescription, SourceFilter, DEFAULT_PAYLOAD_TYPE,
    },
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, RwLock},
};
use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Duration, Interval, MissedTickBehavior, interval},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, error, info, instrument, warn};

pub type SharedAdvertiser = Arc<Mutex<dyn DnssdAdvertiser>>;

const MULTICAST_TTL: u32 = 15;
const FIFO_PACKET_TIMES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitterState {
    Idle,
    Configured,
    Running,
}

#[derive(Debug, Clone)]
pub struct TransmitterConfig {
    pub id: u32,
    pub session_name: String,
    pub packet_time: PacketTime,
    pub payload_type: u8,
    pub underrun_policy: UnderrunPolicy,
    pub rtp_port: u16,
    pub clock_domain: u8,
}

impl TransmitterConfig {
    pub fn new(id: u32, session_name: impl Into<String>) -> Self {
        Self {
            id,
            session_name: session_name.into(),
            packet_time: PacketTime::default(),
            payload_type: DEFAULT_PAYLOAD_TYPE,
            underrun_policy: UnderrunPolicy::default(),
            rtp_port: crate::config::DEFAULT_RTP_PORT,
            clock_domain: 0,
        }
    }
}

/// State the RTSP handlers read concurrently with the actor.
struct TransmitterShared {
    config: TransmitterConfig,
    interface_addr: Ipv4Addr,
    destination: Ipv4Addr,
    audio_format: Option<AudioFormat>,
    grandmaster_identity: Option<ClockIdentity>,
    ssrc: u32,
}

enum ApiMessage {
    SetAudioFormat(AudioFormat, oneshot::Sender<RavennaResult<()>>),
    Start(Option<u32>, oneshot::Sender<RavennaResult<()>>),
    Stop(oneshot::Sender<()>),
    GetState(oneshot::Sender<TransmitterState>),
}

/// Handle onto a transmitting session. Dropping it stops the stream,
/// removes the advertisement and unregisters the RTSP paths.
pub struct RavennaTransmitter {
    api: mpsc::Sender<ApiMessage>,
    audio: mpsc::Sender<Vec<u8>>,
    shared: Arc<RwLock<TransmitterShared>>,
    advertiser: SharedAdvertiser,
    advertisement_id: Option<ServiceId>,
    rtsp_server: RtspServer,
    by_name_path: String,
    by_id_path: String,
}

impl RavennaTransmitter {
    /// Wires the transmitter into the node: registers the RTSP paths,
    /// advertises `_rtsp._tcp,_ravenna_session` and starts the scheduler
    /// actor. The multicast destination is derived from the interface
    /// address as `239.<b2>.<b3>.<id mod 255>`.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(session = %config.session_name))]
    pub fn create(
        subsys: &SubsystemHandle,
        advertiser: SharedAdvertiser,
        rtsp_server: RtspServer,
        clock: LocalPtpClock,
        ptp_events: broadcast::Receiver<PtpEvent>,
        port_state: watch::Receiver<PortState>,
        grandmaster_identity: Option<ClockIdentity>,
        config: TransmitterConfig,
        interface_addr: Ipv4Addr,
    ) -> RavennaResult<Self> {
        let interface_bytes = interface_addr.octets();
        let destination = Ipv4Addr::new(
            239,
            interface_bytes[2],
            interface_bytes[3],
            (config.id % 255) as u8,
        );

        let shared = Arc::new(RwLock::new(TransmitterShared {
            config: config.clone(),
            interface_addr,
            destination,
            audio_format: None,
            grandmaster_identity,
            ssrc: rand::random(),
        }));

        let by_name_path = format!("/by-name/{}", config.session_name);
        let by_id_path = format!("/by-id/{}", config.id);
        for path in [&by_name_path, &by_id_path] {
            let handler_shared = shared.clone();
            rtsp_server.register_handler(
                path.clone(),
                Arc::new(move |_request: &crate::rtsp::RtspRequest| {
                    let shared = handler_shared.read().expect("transmitter state poisoned");
                    let mut response = RtspResponse::ok(build_sdp(&shared).serialize());
                    response.headers.set("Content-Type", "application/sdp");
                    response
                }),
            );
        }

        let advertisement_id = {
            let mut advertiser = advertiser.lock().expect("advertiser poisoned");
            advertiser.register_service(
                ServiceRegistration::new("_rtsp._tcp,_ravenna_session", rtsp_server.port())
                    .with_instance_name(config.session_name.clone()),
            )?
        };

        let rtp_tx = RtpTransmitter::new(interface_addr, MULTICAST_TTL)?;

        let (api_tx, api_rx) = mpsc::channel(16);
        let (audio_tx, audio_rx) = mpsc::channel(64);

        let actor = TransmitterActor {
            shared: shared.clone(),
            clock,
            ptp_events,
            port_state,
            api_rx,
            audio_rx,
            rtsp_server: rtsp_server.clone(),
            by_name_path: by_name_path.clone(),
            by_id_path: by_id_path.clone(),
            rtp_tx,
            destination: SocketAddr::new(IpAddr::V4(destination), config.rtp_port),
            fifo: ByteFifo::new(0),
            packetizer: None,
            packet_buffer: Vec::new(),
            state: TransmitterState::Idle,
            pending_start: None,
            underruns: 0,
        };
        subsys.start(SubsystemBuilder::new(
            format!("transmitter-{}", config.session_name),
            |s| actor.run(s),
        ));

        info!(
            "Transmitter '{}' created, streaming to {destination}",
            config.session_name
        );

        Ok(Self {
            api: api_tx,
            audio: audio_tx,
            shared,
            advertiser,
            advertisement_id: Some(advertisement_id),
            rtsp_server,
            by_name_path,
            by_id_path,
        })
    }

    pub fn session_name(&self) -> String {
        self.shared
            .read()
            .expect("transmitter state poisoned")
            .config
            .session_name
            .clone()
    }

    pub fn build_sdp(&self) -> SessionDescription {
        build_sdp(&self.shared.read().expect("transmitter state poisoned"))
    }

    /// idle -> configured. Fails for encodings AES67 cannot signal.
    pub async fn set_audio_format(&self, format: AudioFormat) -> RavennaResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(ApiMessage::SetAudioFormat(format, tx))
            .await
            .map_err(|_| RavennaError::Cancelled)?;
        rx.await.map_err(|_| RavennaError::Cancelled)?
    }

    /// configured -> running. With no anchor the current media time is used;
    /// if the PTP port is not yet SLAVE the start is deferred until it is.
    pub async fn start(&self, anchor_timestamp: Option<u32>) -> RavennaResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(ApiMessage::Start(anchor_timestamp, tx))
            .await
            .map_err(|_| RavennaError::Cancelled)?;
        rx.await.map_err(|_| RavennaError::Cancelled)?
    }

    /// running -> configured.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.api.send(ApiMessage::Stop(tx)).await.is_ok() {
            rx.await.ok();
        }
    }

    pub async fn state(&self) -> TransmitterState {
        let (tx, rx) = oneshot::channel();
        if self.api.send(ApiMessage::GetState(tx)).await.is_err() {
            return TransmitterState::Idle;
        }
        rx.await.unwrap_or(TransmitterState::Idle)
    }

    /// Queues PCM frames for transmission.
    pub async fn feed_audio(&self, data: Vec<u8>) -> RavennaResult<()> {
        self.audio
            .send(data)
            .await
            .map_err(|_| RavennaError::Cancelled)
    }
}

impl Drop for RavennaTransmitter {
    fn drop(&mut self) {
        if let (Some(id), Ok(mut advertiser)) =
            (self.advertisement_id.take(), self.advertiser.lock())
        {
            advertiser.unregister_service(id);
        }
        self.rtsp_server.unregister_handler(&self.by_name_path);
        self.rtsp_server.unregister_handler(&self.by_id_path);
    }
}

struct TransmitterActor {
    shared: Arc<RwLock<TransmitterShared>>,
    clock: LocalPtpClock,
    ptp_events: broadcast::Receiver<PtpEvent>,
    port_state: watch::Receiver<PortState>,
    api_rx: mpsc::Receiver<ApiMessage>,
    audio_rx: mpsc::Receiver<Vec<u8>>,
    rtsp_server: RtspServer,
    by_name_path: String,
    by_id_path: String,
    rtp_tx: RtpTransmitter,
    destination: SocketAddr,
    fifo: ByteFifo,
    packetizer: Option<Packetizer>,
    packet_buffer: Vec<u8>,
    state: TransmitterState,
    pending_start: Option<Option<u32>>,
    underruns: u64,
}

impl TransmitterActor {
    async fn run(mut self, subsys: SubsystemHandle) -> RavennaResult<()> {
        let mut scheduler = self.idle_scheduler();

        loop {
            select! {
                api_msg = self.api_rx.recv() => match api_msg {
                    Some(msg) => {
                        if let Some(new_scheduler) = self.process_api_message(msg) {
                            scheduler = new_scheduler;
                        }
                    }
                    None => break,
                },
                audio = self.audio_rx.recv() => if let Some(data) = audio {
                    self.fifo.write(&data);
                },
                event = self.ptp_events.recv() => match event {
                    Ok(event) => if let Some(new_scheduler) = self.ptp_event(event) {
                        scheduler = new_scheduler;
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Transmitter missed {n} PTP events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = scheduler.tick() => {
                    if self.state == TransmitterState::Running {
                        self.send_data();
                    }
                },
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        info!("Transmitter actor stopped.");

        Ok(())
    }

    fn idle_scheduler(&self) -> Interval {
        let mut idle = interval(Duration::from_secs(3600));
        idle.set_missed_tick_behavior(MissedTickBehavior::Skip);
        idle
    }

    fn process_api_message(&mut self, msg: ApiMessage) -> Option<Interval> {
        match msg {
            ApiMessage::SetAudioFormat(format, reply) => {
                reply.send(self.set_audio_format(format)).ok();
                None
            }
            ApiMessage::Start(anchor, reply) => {
                let (result, scheduler) = self.start(anchor);
                reply.send(result).ok();
                scheduler
            }
            ApiMessage::Stop(reply) => {
                if self.state == TransmitterState::Running {
                    self.state = TransmitterState::Configured;
                    info!("Transmitter stopped.");
                }
                self.pending_start = None;
                reply.send(()).ok();
                Some(self.idle_scheduler())
            }
            ApiMessage::GetState(reply) => {
                reply.send(self.state).ok();
                None
            }
        }
    }

    fn set_audio_format(&mut self, format: AudioFormat) -> RavennaResult<()> {
        if !format.is_transmittable() {
            return Err(RavennaError::UnsupportedAudioFormat(format!(
                "{:?}",
                format.encoding
            )));
        }
        if self.state == TransmitterState::Running {
            return Err(RavennaError::UnsupportedAudioFormat(
                "cannot change the audio format of a running stream".to_owned(),
            ));
        }

        let (packet_time, payload_type, ssrc) = {
            let mut shared = self.shared.write().expect("transmitter state poisoned");
            if shared.audio_format != Some(format) {
                shared.ssrc = rand::random();
            }
            shared.audio_format = Some(format);
            (
                shared.config.packet_time,
                shared.config.payload_type,
                shared.ssrc,
            )
        };

        let framecount = packet_time.framecount(format.sample_rate);
        let bytes_per_packet = framecount as usize * format.bytes_per_frame();
        self.fifo = ByteFifo::new(bytes_per_packet * FIFO_PACKET_TIMES);
        self.packet_buffer = vec![0u8; bytes_per_packet];
        self.packetizer = Some(Packetizer::new(ssrc, payload_type, framecount));
        self.state = TransmitterState::Configured;

        info!(
            "Audio format set to {format:?}, {framecount} frames per packet ({} ms)",
            packet_time.signaled_ptime(format.sample_rate)
        );

        Ok(())
    }

    /// Starting requires a configured format and a PTP port in SLAVE state.
    /// Until the port locks, the start request stays pending and completes
    /// on the port-state-changed event.
    fn start(&mut self, anchor: Option<u32>) -> (RavennaResult<()>, Option<Interval>) {
        if self.state == TransmitterState::Running {
            return (Ok(()), None);
        }
        if self.state == TransmitterState::Idle {
            return (
                Err(RavennaError::UnsupportedAudioFormat(
                    "no audio format configured".to_owned(),
                )),
                None,
            );
        }

        if *self.port_state.borrow() != PortState::Slave {
            info!("PTP port is not in slave state yet, deferring stream start");
            self.pending_start = Some(anchor);
            return (Ok(()), None);
        }

        let scheduler = self.do_start(anchor);
        (Ok(()), scheduler)
    }

    fn do_start(&mut self, anchor: Option<u32>) -> Option<Interval> {
        let format = self
            .shared
            .read()
            .expect("transmitter state poisoned")
            .audio_format?;
        let packetizer = self.packetizer.as_mut()?;

        let anchor = match anchor {
            Some(anchor) => anchor,
            None => match self.clock.now() {
                Ok(now) => now.to_media_time(format.sample_rate) as u32,
                Err(e) => {
                    // The port is slave, so the clock should be calibrated;
                    // stay pending and retry on the next port state event
                    warn!("Cannot anchor stream, PTP clock not readable: {e}");
                    self.pending_start = Some(None);
                    return None;
                }
            },
        };

        packetizer.set_timestamp(anchor);
        self.pending_start = None;
        self.state = TransmitterState::Running;

        let packet_time = {
            let shared = self.shared.read().expect("transmitter state poisoned");
            shared.config.packet_time
        };
        let ptime = packet_time.signaled_ptime(format.sample_rate);
        // Wake at a tenth of the packet time
        let period = Duration::from_nanos((ptime as f64 * 1_000_000.0 / 10.0) as u64);
        let mut scheduler = interval(period.max(Duration::from_micros(10)));
        scheduler.set_missed_tick_behavior(MissedTickBehavior::Burst);

        info!("Transmitter running, RTP timestamp anchored at {anchor}");

        Some(scheduler)
    }

    /// One scheduler wake: if the stream's next timestamp is due and a full
    /// packet of audio is buffered, emit exactly one packet. An underrun
    /// either sends silence or skips the slot, both counted.
    fn send_data(&mut self) {
        let Some(packetizer) = self.packetizer.as_mut() else {
            return;
        };

        let format = match self.shared.read().expect("transmitter state poisoned").audio_format {
            Some(it) => it,
            None => return,
        };

        let now = match self.clock.now() {
            Ok(it) => it,
            Err(e) => {
                debug!("PTP clock not readable: {e}");
                return;
            }
        };
        let now32 = now.to_media_time(format.sample_rate) as u32;
        // Not yet time for the next packet
        if now32.wrapping_sub(packetizer.next_timestamp()) >= u32::MAX / 2 {
            return;
        }

        let packet = if self.fifo.read(&mut self.packet_buffer) {
            packetizer.next_packet(&self.packet_buffer)
        } else {
            self.underruns += 1;
            let policy = self
                .shared
                .read()
                .expect("transmitter state poisoned")
                .config
                .underrun_policy;
            match policy {
                UnderrunPolicy::EmitSilence => {
                    self.packet_buffer.fill(0);
                    packetizer.next_packet(&self.packet_buffer)
                }
                UnderrunPolicy::Skip => {
                    // The slot passes unused; the gap shows up at the
                    // receiver as lost packets
                    self.packet_buffer.fill(0);
                    let _ = packetizer.next_packet(&self.packet_buffer);
                    return;
                }
            }
        };

        if let Err(e) = self.rtp_tx.send_to(&packet, self.destination) {
            error!("Could not send RTP packet: {e}");
        }
    }

    fn ptp_event(&mut self, event: PtpEvent) -> Option<Interval> {
        match event {
            PtpEvent::ParentChanged(parent) => {
                let changed = {
                    let mut shared = self.shared.write().expect("transmitter state poisoned");
                    let changed =
                        shared.grandmaster_identity != Some(parent.grandmaster_identity);
                    shared.grandmaster_identity = Some(parent.grandmaster_identity);
                    changed
                };
                if changed {
                    info!(
                        "Grandmaster changed to {}, announcing new SDP",
                        parent.grandmaster_identity
                    );
                    self.announce_sdp();
                }
                None
            }
            PtpEvent::PortStateChanged(PortState::Slave) => {
                if let Some(anchor) = self.pending_start.take() {
                    info!("PTP port reached slave state, completing deferred start");
                    self.do_start(anchor)
                } else {
                    None
                }
            }
            PtpEvent::PortStateChanged(_) => None,
        }
    }

    /// Pushes the current SDP to every peer that described this session.
    fn announce_sdp(&self) {
        let sdp = build_sdp(&self.shared.read().expect("transmitter state poisoned"))
            .serialize();
        for path in [&self.by_name_path, &self.by_id_path] {
            let request = announce_request(&self.rtsp_server, path, sdp.clone());
            self.rtsp_server.send_request(path, &request);
        }
    }
}

fn build_sdp(shared: &TransmitterShared) -> SessionDescription {
    let config = &shared.config;
    let destination = shared.destination.to_string();
    let interface = shared.interface_addr.to_string();

    let connection_info = ConnectionInfo::ipv4_multicast(destination.clone(), MULTICAST_TTL as u8);
    let grandmaster = shared
        .grandmaster_identity
        .map(|gm| gm.to_string())
        .unwrap_or_else(|| ClockIdentity::default().to_string());
    let reference_clock = ReferenceClock::ptp_2008(grandmaster, config.clock_domain as i32);
    let media_clock = MediaClockSource::direct(0);
    let clock_domain = ClockDomain::new(config.clock_domain as i32);

    let mut media = MediaDescription::audio(config.rtp_port);
    media.connection_info = Some(connection_info.clone());
    if let Some(format) = &shared.audio_format {
        if let Ok(sdp_format) = SdpFormat::from_audio_format(format, config.payload_type) {
            media.formats.push(sdp_format);
        }
        media.ptime = Some(config.packet_time.signaled_ptime(format.sample_rate));
        media.framecount = Some(config.packet_time.framecount(format.sample_rate));
    }
    media.source_filter = Some(SourceFilter::include_ipv4(destination, interface.clone()));
    media.clock_domain = Some(clock_domain);
    media.sync_time = Some(0);
    media.reference_clock = Some(reference_clock.clone());
    media.media_clock = Some(media_clock.clone());
    media.direction = Some(Direction::RecvOnly);

    SessionDescription {
        origin: Origin {
            username: "-".to_owned(),
            session_id: config.id.to_string(),
            session_version: 0,
            address_type: "IP4".to_owned(),
            unicast_address: interface,
        },
        session_name: config.session_name.clone(),
        connection_info: Some(connection_info),
        time_active: Default::default(),
        reference_clock: Some(reference_clock),
        media_clock: Some(media_clock),
        clock_domain: Some(clock_domain),
        groups: Vec::new(),
        unknown_attributes: Vec::new(),
        media: vec![media],
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formats::AudioEncoding;

    fn shared_for_test() -> TransmitterShared {
        TransmitterShared {
            config: TransmitterConfig::new(7, "studio-feed"),
            interface_addr: Ipv4Addr::new(192, 168, 15, 52),
            destination: Ipv4Addr::new(239, 15, 52, 7),
            audio_format: Some(AudioFormat::new(AudioEncoding::PcmS24, 48_000, 2)),
            grandmaster_identity: Some(ClockIdentity([
                0x39, 0xA7, 0x94, 0xFF, 0xFE, 0x07, 0xCB, 0xD0,
            ])),
            ssrc: 0x1234,
        }
    }

    #[test]
    fn multicast_destination_derives_from_interface_and_id() {
        let interface = Ipv4Addr::new(192, 168, 15, 52).octets();
        let id = 300u32;
        let destination = Ipv4Addr::new(239, interface[2], interface[3], (id % 255) as u8);
        assert_eq!(Ipv4Addr::new(239, 15, 52, 45), destination);
    }

    #[test]
    fn sdp_carries_the_session_parameters() {
        let sdp = build_sdp(&shared_for_test());
        let serialized = sdp.serialize();

        assert!(serialized.contains("s=studio-feed\r\n"));
        assert!(serialized.contains("c=IN IP4 239.15.52.7/15\r\n"));
        assert!(serialized.contains("m=audio 5004 RTP/AVP 98\r\n"));
        assert!(serialized.contains("a=rtpmap:98 L24/48000/2\r\n"));
        assert!(
            serialized
                .contains("a=ts-refclk:ptp=IEEE1588-2008:39-A7-94-FF-FE-07-CB-D0:0\r\n")
        );
        assert!(serialized.contains("a=mediaclk:direct=0\r\n"));
        assert!(serialized.contains("a=clock-domain:PTPv2 0\r\n"));
        assert!(
            serialized.contains("a=source-filter: incl IN IP4 239.15.52.7 192.168.15.52\r\n")
        );
        assert!(serialized.contains("a=recvonly\r\n"));
        assert!(serialized.contains("a=ptime:1\r\n"));
        assert!(serialized.contains("a=framecount:48\r\n"));
    }

    #[test]
    fn sdp_roundtrips_through_the_parser() {
        let sdp = build_sdp(&shared_for_test());
        let parsed = SessionDescription::parse(&sdp.serialize()).expect("parse");
        assert_eq!(sdp, parsed);
    }
}

