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

//! The node owns one instance of every component: the PTP time base, the
//! DNS-SD daemon, the RTSP server and the RTP ingress, and builds stream
//! endpoints on top of them. Teardown is LIFO: endpoint handles go first
//! (their Drop unregisters advertisements and RTSP paths), then the
//! transports, then the time base; the field order below encodes that.

use crate::{
    config::Config,
    discovery::{DiscoveryEvent, DnssdBrowser, mdns::MdnsDiscovery},
    error::{ConfigError, RavennaResult},
    formats::PacketTime,
    ptp::{LocalPtpClock, PtpInstance},
    receiver::RavennaReceiver,
    rtp::RtpReceiver,
    rtsp::{RtspClient, RtspServer},
    sender::{RavennaTransmitter, SharedAdvertiser, TransmitterConfig},
};
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
};
use tokio::sync::broadcast;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{info, instrument};

pub struct RavennaNode {
    config: Config,
    interface_addr: Ipv4Addr,
    discovery: Arc<Mutex<MdnsDiscovery>>,
    rtsp_server: RtspServer,
    rtp_receiver: RtpReceiver,
    next_transmitter_id: u32,
    // The time base is declared last so it outlives the transports on drop
    ptp: PtpInstance,
}

impl RavennaNode {
    /// Brings up all components on the configured interface. Only
    /// constructor-time configuration errors propagate; once running, the
    /// components log, count and carry on.
    #[instrument(skip(subsys, config), fields(interface = %config.interface_ip))]
    pub fn start(subsys: &SubsystemHandle, config: Config) -> RavennaResult<Self> {
        config.validate()?;
        let interface_addr = match config.interface_ip {
            IpAddr::V4(addr) => addr,
            IpAddr::V6(_) => return Err(ConfigError::Ipv6Interface.into()),
        };

        let mut ptp = PtpInstance::new(config.ptp.clone());
        ptp.add_port(subsys, interface_addr)?;

        let discovery = Arc::new(Mutex::new(MdnsDiscovery::new()?));
        let rtsp_server = RtspServer::bind(subsys, config.interface_ip, config.rtsp_port)?;
        let rtp_receiver = RtpReceiver::new();

        info!("RAVENNA node '{}' started.", config.instance_name());

        Ok(Self {
            config,
            interface_addr,
            discovery,
            rtsp_server,
            rtp_receiver,
            next_transmitter_id: 1,
            ptp,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ptp(&self) -> &PtpInstance {
        &self.ptp
    }

    pub fn clock(&self) -> LocalPtpClock {
        self.ptp.clock()
    }

    pub fn rtsp_server(&self) -> &RtspServer {
        &self.rtsp_server
    }

    pub fn rtp_receiver(&self) -> &RtpReceiver {
        &self.rtp_receiver
    }

    /// Begins browsing for RAVENNA sessions on the network.
    pub fn browse_for_sessions(&self) -> RavennaResult<broadcast::Receiver<DiscoveryEvent>> {
        let mut discovery = self.discovery.lock().expect("discovery poisoned");
        let events = discovery.subscribe();
        discovery.browse_for("_rtsp._tcp,_ravenna_session")?;
        Ok(events)
    }

    /// Creates a transmitting endpoint for a new session. The id is unique
    /// within the node's lifetime.
    pub fn create_transmitter(
        &mut self,
        subsys: &SubsystemHandle,
        session_name: impl Into<String>,
        packet_time: PacketTime,
    ) -> RavennaResult<RavennaTransmitter> {
        let id = self.next_transmitter_id;
        self.next_transmitter_id += 1;

        let mut config = TransmitterConfig::new(id, session_name);
        config.packet_time = packet_time;
        config.underrun_policy = self.config.underrun_policy;
        config.rtp_port = self.config.rtp_port;
        config.clock_domain = self.config.ptp.domain;

        let advertiser: SharedAdvertiser = self.discovery.clone();

        RavennaTransmitter::create(
            subsys,
            advertiser,
            self.rtsp_server.clone(),
            self.ptp.clock(),
            self.ptp.subscribe(),
            self.ptp.port_state_watch(),
            self.ptp.grandmaster_identity(),
            config,
            self.interface_addr,
        )
    }

    /// Connects to a remote RTSP endpoint (as learned from discovery) and
    /// creates a receiving endpoint for the session at the given path.
    pub async fn create_receiver(
        &self,
        subsys: &SubsystemHandle,
        host: &str,
        port: u16,
        path: &str,
    ) -> RavennaResult<RavennaReceiver> {
        let rtsp_client = RtspClient::connect(subsys, host, port).await?;
        RavennaReceiver::create(
            subsys,
            rtsp_client,
            self.rtp_receiver.clone(),
            self.ptp.clock(),
            self.ptp.domain(),
            self.config.receiver.clone(),
            self.interface_addr,
            path,
        )
        .await
    }
}
