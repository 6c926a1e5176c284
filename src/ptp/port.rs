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

use super::{
    PTP_EVENT_PORT, PTP_GENERAL_PORT, PTP_PRIMARY_MULTICAST,
    bmca::{ForeignMasterDataset, is_better},
    clock::{LocalPtpClock, monotonic_nanos},
    messages::{PtpMessage, PtpMessageHeader, encode_delay_req},
    types::{ClockIdentity, ClockQuality, PortIdentity, PtpTimeInterval},
};
use crate::{
    config::PtpConfig,
    error::{PtpError, PtpResult},
    utils::{WrappingU16, find_network_interface},
};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    select,
    sync::{broadcast, watch},
    time::{Instant, interval, sleep, sleep_until},
};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, instrument, warn};

/// IEEE 1588 / 802.1AS port states. A slave-only ordinary clock never enters
/// MASTER or PASSIVE; they exist so the full state machine is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Initializing,
    Listening,
    Master,
    Passive,
    Uncalibrated,
    Slave,
    Faulty,
    Disabled,
}

/// The parent dataset, updated whenever a new master qualifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentDs {
    pub parent_port_identity: PortIdentity,
    pub grandmaster_identity: ClockIdentity,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority1: u8,
    pub grandmaster_priority2: u8,
    pub steps_removed: u16,
    pub current_utc_offset: i16,
}

impl From<&ForeignMasterDataset> for ParentDs {
    fn from(ds: &ForeignMasterDataset) -> Self {
        Self {
            parent_port_identity: ds.source_port_identity,
            grandmaster_identity: ds.grandmaster_identity,
            grandmaster_clock_quality: ds.grandmaster_clock_quality,
            grandmaster_priority1: ds.grandmaster_priority1,
            grandmaster_priority2: ds.grandmaster_priority2,
            steps_removed: ds.steps_removed,
            current_utc_offset: ds.current_utc_offset,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PtpEvent {
    PortStateChanged(PortState),
    ParentChanged(ParentDs),
}

#[derive(Debug, Default)]
pub struct PortCounters {
    pub malformed_messages: u64,
    pub foreign_domain_messages: u64,
}

pub(super) struct PtpPort {
    config: PtpConfig,
    interface_addr: Ipv4Addr,
    local_port_identity: PortIdentity,
    clock: LocalPtpClock,
    events: broadcast::Sender<PtpEvent>,
    state_tx: watch::Sender<PortState>,
    parent_tx: watch::Sender<Option<ParentDs>>,
    state: PortState,
    parent: Option<ForeignMasterDataset>,
    candidate: Option<ForeignMasterDataset>,
    candidate_deadline: Option<Instant>,
    announce_deadline: Option<Instant>,
    pending_sync: Option<PendingSync>,
    last_sync: Option<SyncObservation>,
    delay_req_sequence: WrappingU16,
    pending_delay_req: Option<PendingDelayReq>,
    counters: PortCounters,
}

struct PendingSync {
    sequence_id: u16,
    ingress_mono_ns: i128,
    correction: PtpTimeInterval,
}

struct SyncObservation {
    origin_master_ns: i128,
    ingress_mono_ns: i128,
}

struct PendingDelayReq {
    sequence_id: u16,
    egress_mono_ns: i128,
}

/// The two UDP sockets of a PTP port: event (319) and general (320), both
/// joined to 224.0.1.129 on the given interface.
pub(super) struct PortSockets {
    event: UdpSocket,
    general: UdpSocket,
}

fn create_ptp_socket(interface_addr: Ipv4Addr, port: u16) -> PtpResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.join_multicast_v4(&PTP_PRIMARY_MULTICAST, &interface_addr)?;
    socket.set_multicast_if_v4(&interface_addr)?;
    socket.set_multicast_loop_v4(false)?;
    socket.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port,
    )))?;
    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket)?)
}

impl PortSockets {
    pub(super) fn bind(interface_addr: Ipv4Addr) -> PtpResult<Self> {
        Ok(Self {
            event: create_ptp_socket(interface_addr, PTP_EVENT_PORT)?,
            general: create_ptp_socket(interface_addr, PTP_GENERAL_PORT)?,
        })
    }
}

/// Derives an EUI-64 port identity from the interface MAC address.
pub(super) fn port_identity_for_interface(interface_addr: Ipv4Addr) -> PtpResult<PortIdentity> {
    let nic = find_network_interface(IpAddr::V4(interface_addr))
        .map_err(|_| PtpError::AlreadyBound(format!("no NIC with address {interface_addr}")))?;
    let mut identity = [0u8; 8];
    if let Some(mac) = nic.mac {
        let octets = mac.octets();
        identity[0..3].copy_from_slice(&octets[0..3]);
        identity[3] = 0xFF;
        identity[4] = 0xFE;
        identity[5..8].copy_from_slice(&octets[3..6]);
    } else {
        let ip = interface_addr.octets();
        identity[4..8].copy_from_slice(&ip);
    }
    Ok(PortIdentity {
        clock_identity: ClockIdentity(identity),
        port_number: 1,
    })
}

impl PtpPort {
    pub(super) fn new(
        config: PtpConfig,
        interface_addr: Ipv4Addr,
        local_port_identity: PortIdentity,
        clock: LocalPtpClock,
        events: broadcast::Sender<PtpEvent>,
        state_tx: watch::Sender<PortState>,
        parent_tx: watch::Sender<Option<ParentDs>>,
    ) -> Self {
        Self {
            config,
            interface_addr,
            local_port_identity,
            clock,
            events,
            state_tx,
            parent_tx,
            state: PortState::Initializing,
            parent: None,
            candidate: None,
            candidate_deadline: None,
            announce_deadline: None,
            pending_sync: None,
            last_sync: None,
            delay_req_sequence: WrappingU16::default(),
            pending_delay_req: None,
            counters: PortCounters::default(),
        }
    }

    #[instrument(skip(self, subsys, sockets), fields(interface = %self.interface_addr))]
    pub(super) async fn run(
        mut self,
        subsys: SubsystemHandle,
        mut sockets: PortSockets,
    ) -> PtpResult<()> {
        self.set_state(PortState::Listening);
        info!("PTP port listening on {}", self.interface_addr);

        let mut event_buf = [0u8; 1500];
        let mut general_buf = [0u8; 1500];
        let mut delay_req_timer = interval(self.config.announce_interval);
        let mut backoff = Duration::from_secs(1);

        loop {
            let announce_deadline = self.announce_deadline.unwrap_or_else(far_future);
            let candidate_deadline = self.candidate_deadline.unwrap_or_else(far_future);

            select! {
                received = sockets.event.recv_from(&mut event_buf) => match received {
                    Ok((len, _)) => {
                        self.datagram_received(&event_buf[..len]);
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        sockets = self.recover_sockets(e, &mut backoff).await?;
                    }
                },
                received = sockets.general.recv_from(&mut general_buf) => match received {
                    Ok((len, _)) => self.datagram_received(&general_buf[..len]),
                    Err(e) => {
                        sockets = self.recover_sockets(e, &mut backoff).await?;
                    }
                },
                _ = sleep_until(announce_deadline) => self.announce_timeout(),
                _ = sleep_until(candidate_deadline) => self.qualify_candidate(),
                _ = delay_req_timer.tick() => {
                    if self.state == PortState::Slave {
                        self.send_delay_req(&sockets).await;
                    }
                },
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        info!(
            "PTP port on {} stopped ({} malformed, {} foreign-domain messages dropped).",
            self.interface_addr,
            self.counters.malformed_messages,
            self.counters.foreign_domain_messages
        );

        Ok(())
    }

    /// A socket error marks the port FAULTY; after a backoff the sockets are
    /// rebound and the port starts over from LISTENING.
    async fn recover_sockets(
        &mut self,
        error: std::io::Error,
        backoff: &mut Duration,
    ) -> PtpResult<PortSockets> {
        warn!("PTP socket error: {error}, rebinding in {backoff:?}");
        self.set_state(PortState::Faulty);
        self.drop_parent();

        loop {
            sleep(*backoff).await;
            *backoff = (*backoff * 2).min(Duration::from_secs(16));
            match PortSockets::bind(self.interface_addr) {
                Ok(sockets) => {
                    self.set_state(PortState::Listening);
                    return Ok(sockets);
                }
                Err(e) => warn!("PTP socket rebind failed: {e}, retrying in {backoff:?}"),
            }
        }
    }

    fn datagram_received(&mut self, data: &[u8]) {
        let ingress_mono_ns = match monotonic_nanos() {
            Ok(it) => it,
            Err(e) => {
                warn!("Could not read monotonic clock: {e}");
                return;
            }
        };

        let (header, message) = match PtpMessage::parse(data) {
            Ok(it) => it,
            Err(e) => {
                self.counters.malformed_messages += 1;
                debug!("Dropping malformed PTP message: {e}");
                return;
            }
        };

        if header.domain_number != self.config.domain {
            self.counters.foreign_domain_messages += 1;
            return;
        }

        if header.source_port_identity == self.local_port_identity {
            return; // Our own delay requests looped back
        }

        match message {
            PtpMessage::Announce(announce) => {
                self.announce_received(ForeignMasterDataset::from_announce(&header, &announce));
            }
            PtpMessage::Sync(sync) => self.sync_received(&header, ingress_mono_ns, sync.timestamp),
            PtpMessage::FollowUp(follow_up) => self.follow_up_received(&header, follow_up.timestamp),
            PtpMessage::DelayResp(resp) => self.delay_resp_received(&header, &resp),
            _ => {}
        }
    }

    fn announce_received(&mut self, dataset: ForeignMasterDataset) {
        if let Some(parent) = self.parent {
            if dataset.source_port_identity == parent.source_port_identity {
                // Parent refresh; a grandmaster change on the same port is
                // propagated without re-qualification.
                self.announce_deadline = Some(announce_deadline(&self.config));
                if dataset.grandmaster_identity != parent.grandmaster_identity {
                    info!(
                        "Grandmaster changed: {} -> {}",
                        parent.grandmaster_identity, dataset.grandmaster_identity
                    );
                    self.parent = Some(dataset);
                    self.clock.with_servo(|servo| servo.reset());
                    self.publish_parent();
                    self.emit(PtpEvent::ParentChanged(ParentDs::from(&dataset)));
                } else {
                    self.parent = Some(dataset);
                }
                return;
            }
            if !is_better(&dataset, &parent) {
                return;
            }
        }

        match self.candidate {
            Some(current) if !is_better(&dataset, &current) => {}
            _ => {
                debug!(
                    "New best master candidate: {} (gm {})",
                    dataset.source_port_identity, dataset.grandmaster_identity
                );
                self.candidate = Some(dataset);
                self.candidate_deadline = Some(Instant::now() + self.config.announce_interval);
            }
        }
    }

    /// The best candidate becomes parent after one announce interval during
    /// which no better Announce arrived.
    fn qualify_candidate(&mut self) {
        self.candidate_deadline = None;
        let Some(candidate) = self.candidate.take() else {
            return;
        };

        info!(
            "New PTP parent: {} (grandmaster {})",
            candidate.source_port_identity, candidate.grandmaster_identity
        );
        self.parent = Some(candidate);
        self.announce_deadline = Some(announce_deadline(&self.config));
        self.pending_sync = None;
        self.last_sync = None;
        self.clock.with_servo(|servo| servo.reset());
        self.set_state(PortState::Uncalibrated);
        self.publish_parent();
        self.emit(PtpEvent::ParentChanged(ParentDs::from(&candidate)));
    }

    fn announce_timeout(&mut self) {
        warn!("PTP announce receipt timeout, dropping parent");
        self.drop_parent();
        self.set_state(PortState::Listening);
    }

    fn drop_parent(&mut self) {
        self.parent = None;
        self.announce_deadline = None;
        self.pending_sync = None;
        self.last_sync = None;
        self.pending_delay_req = None;
        self.publish_parent();
    }

    fn is_from_parent(&self, header: &PtpMessageHeader) -> bool {
        self.parent
            .as_ref()
            .is_some_and(|parent| parent.source_port_identity == header.source_port_identity)
    }

    fn sync_received(
        &mut self,
        header: &PtpMessageHeader,
        ingress_mono_ns: i128,
        origin: super::types::PtpTimestamp,
    ) {
        if !self.is_from_parent(header) {
            return;
        }

        if header.flags.two_step {
            self.pending_sync = Some(PendingSync {
                sequence_id: header.sequence_id,
                ingress_mono_ns,
                correction: header.correction_field,
            });
        } else {
            let master_ns = origin.as_nanos() + header.correction_field.nanos() as i128;
            self.observe_sync(ingress_mono_ns, master_ns);
        }
    }

    fn follow_up_received(&mut self, header: &PtpMessageHeader, origin: super::types::PtpTimestamp) {
        if !self.is_from_parent(header) {
            return;
        }
        let Some(pending) = self.pending_sync.take() else {
            return;
        };
        if pending.sequence_id != header.sequence_id {
            debug!(
                "Follow_Up sequence {} does not match pending Sync {}",
                header.sequence_id, pending.sequence_id
            );
            return;
        }
        let correction = pending.correction + header.correction_field;
        let master_ns = origin.as_nanos() + correction.nanos() as i128;
        self.observe_sync(pending.ingress_mono_ns, master_ns);
    }

    fn observe_sync(&mut self, ingress_mono_ns: i128, master_ns: i128) {
        self.last_sync = Some(SyncObservation {
            origin_master_ns: master_ns,
            ingress_mono_ns,
        });
        self.clock
            .with_servo(|servo| servo.observe_sync(ingress_mono_ns, master_ns));

        if self.state == PortState::Uncalibrated && self.clock.is_calibrated() {
            self.set_state(PortState::Slave);
        }
    }

    async fn send_delay_req(&mut self, sockets: &PortSockets) {
        self.delay_req_sequence.increment(1);
        let sequence_id = self.delay_req_sequence.value();
        let message = encode_delay_req(self.config.domain, self.local_port_identity, sequence_id);
        let destination =
            SocketAddrV4::new(PTP_PRIMARY_MULTICAST, PTP_EVENT_PORT);

        let egress_mono_ns = match monotonic_nanos() {
            Ok(it) => it,
            Err(e) => {
                warn!("Could not read monotonic clock: {e}");
                return;
            }
        };

        if let Err(e) = sockets.event.send_to(&message, destination).await {
            warn!("Could not send Delay_Req: {e}");
            return;
        }

        self.pending_delay_req = Some(PendingDelayReq {
            sequence_id,
            egress_mono_ns,
        });
    }

    /// E2E delay measurement: the Sync path (master origin to local ingress)
    /// and the Delay_Req path (local egress to master receipt) average into
    /// the mean path delay, both measured through the current local fit.
    fn delay_resp_received(
        &mut self,
        header: &PtpMessageHeader,
        resp: &super::messages::PortTimestampMessage,
    ) {
        if resp.requesting_port_identity != self.local_port_identity {
            return;
        }
        let Some(pending) = self.pending_delay_req.take() else {
            return;
        };
        if pending.sequence_id != header.sequence_id {
            return;
        }
        let Some(sync) = &self.last_sync else {
            return;
        };

        let sync_ingress_master = match self
            .clock
            .local_to_ptp(sync.ingress_mono_ns)
            .map(|ts| ts.as_nanos())
        {
            Ok(it) => it,
            Err(_) => return,
        };
        let req_egress_master = match self
            .clock
            .local_to_ptp(pending.egress_mono_ns)
            .map(|ts| ts.as_nanos())
        {
            Ok(it) => it,
            Err(_) => return,
        };

        let t4 = resp.timestamp.as_nanos() - header.correction_field.nanos() as i128;
        let sync_path = sync_ingress_master - sync.origin_master_ns;
        let resp_path = t4 - req_egress_master;
        let mean_path_delay = (sync_path + resp_path) as f64 / 2.0;

        if mean_path_delay >= 0.0 {
            debug!("Mean path delay: {mean_path_delay} ns");
            self.clock
                .with_servo(|servo| servo.observe_path_delay(mean_path_delay));
        }
    }

    fn set_state(&mut self, state: PortState) {
        if self.state == state {
            return;
        }
        info!("PTP port state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(PtpEvent::PortStateChanged(state));
    }

    fn publish_parent(&self) {
        self.parent_tx
            .send_replace(self.parent.as_ref().map(ParentDs::from));
    }

    fn emit(&self, event: PtpEvent) {
        // A send error only means there are no subscribers right now
        self.events.send(event).ok();
    }
}

fn announce_deadline(config: &PtpConfig) -> Instant {
    Instant::now() + config.announce_interval * config.announce_receipt_timeout
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600 * 24 * 365)
}
