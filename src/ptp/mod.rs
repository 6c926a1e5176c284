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

//! The node's PTP slave. One ordinary clock instance with at most one port,
//! maintaining the mapping from local monotonic time to the grandmaster's
//! timescale. Other components read the mapping through [`LocalPtpClock`]
//! and follow grandmaster changes through the instance's event channel.

pub mod bmca;
pub mod clock;
pub mod messages;
pub mod port;
pub mod types;

pub use clock::{LocalPtpClock, monotonic_nanos};
pub use port::{ParentDs, PortState, PtpEvent};
pub use types::{ClockIdentity, PortIdentity, PtpTimeInterval, PtpTimestamp};

use crate::{config::PtpConfig, error::PtpResult};
use port::{PortSockets, PtpPort, port_identity_for_interface};
use std::net::Ipv4Addr;
use tokio::sync::{broadcast, watch};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument};

pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;
pub const PTP_PRIMARY_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);

pub struct PtpInstance {
    config: PtpConfig,
    clock: LocalPtpClock,
    events: broadcast::Sender<PtpEvent>,
    state_rx: watch::Receiver<PortState>,
    state_tx: watch::Sender<PortState>,
    parent_rx: watch::Receiver<Option<ParentDs>>,
    parent_tx: watch::Sender<Option<ParentDs>>,
    bound_interface: Option<Ipv4Addr>,
}

impl PtpInstance {
    pub fn new(config: PtpConfig) -> Self {
        let clock = LocalPtpClock::new(config.servo_time_constant, config.calibration_syncs);
        let (events, _) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(PortState::Initializing);
        let (parent_tx, parent_rx) = watch::channel(None);
        Self {
            config,
            clock,
            events,
            state_rx,
            state_tx,
            parent_rx,
            parent_tx,
            bound_interface: None,
        }
    }

    /// Binds the PTP event and general sockets on the given interface, joins
    /// the PTPv2 multicast group and starts the port state machine. Fails if
    /// a port is already bound or the sockets cannot be created.
    #[instrument(skip(self, subsys))]
    pub fn add_port(
        &mut self,
        subsys: &SubsystemHandle,
        interface_addr: Ipv4Addr,
    ) -> PtpResult<()> {
        if let Some(bound) = self.bound_interface {
            return Err(crate::error::PtpError::AlreadyBound(bound.to_string()));
        }

        let sockets = PortSockets::bind(interface_addr)?;
        let local_port_identity = port_identity_for_interface(interface_addr)?;
        info!(
            "PTP port identity {} on interface {}",
            local_port_identity, interface_addr
        );

        let port = PtpPort::new(
            self.config.clone(),
            interface_addr,
            local_port_identity,
            self.clock.clone(),
            self.events.clone(),
            self.state_tx.clone(),
            self.parent_tx.clone(),
        );

        subsys.start(SubsystemBuilder::new("ptp-port", move |s| {
            port.run(s, sockets)
        }));

        self.bound_interface = Some(interface_addr);

        Ok(())
    }

    pub fn domain(&self) -> u8 {
        self.config.domain
    }

    /// A cheap clone-able handle onto the monotonic-to-PTP mapping.
    pub fn clock(&self) -> LocalPtpClock {
        self.clock.clone()
    }

    pub fn port_state(&self) -> PortState {
        *self.state_rx.borrow()
    }

    /// A watch receiver that resolves whenever the port state changes; used
    /// by endpoints that defer work until the port reaches SLAVE.
    pub fn port_state_watch(&self) -> watch::Receiver<PortState> {
        self.state_rx.clone()
    }

    pub fn parent(&self) -> Option<ParentDs> {
        *self.parent_rx.borrow()
    }

    pub fn grandmaster_identity(&self) -> Option<ClockIdentity> {
        self.parent().map(|parent| parent.grandmaster_identity)
    }

    /// Subscribes to parent-dataset-changed and port-state-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<PtpEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_instance_is_initializing_without_parent() {
        let instance = PtpInstance::new(PtpConfig::default());
        assert_eq!(PortState::Initializing, instance.port_state());
        assert!(instance.parent().is_none());
        assert!(instance.grandmaster_identity().is_none());
    }

    #[test]
    fn subscribers_receive_state_changes() {
        let instance = PtpInstance::new(PtpConfig::default());
        let mut events = instance.subscribe();
        instance
            .state_tx
            .send_replace(PortState::Listening);
        instance
            .events
            .send(PtpEvent::PortStateChanged(PortState::Listening))
            .expect("send");
        match events.try_recv().expect("event") {
            PtpEvent::PortStateChanged(state) => assert_eq!(PortState::Listening, state),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
