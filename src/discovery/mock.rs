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

//! A scriptable browser for tests. It implements the same contract as the
//! daemon-backed browser but emits exactly the events a test pushes into it,
//! in push order.

use super::{DiscoveryEvent, DnssdBrowser, ServiceDescription, TxtRecord};
use crate::error::{DiscoveryError, DiscoveryResult};
use std::{collections::HashSet, net::IpAddr};
use tokio::sync::broadcast;

pub struct MockBrowser {
    events: broadcast::Sender<DiscoveryEvent>,
    browsed: HashSet<String>,
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowser {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            browsed: HashSet::new(),
        }
    }

    pub fn is_browsing(&self, reg_type: &str) -> bool {
        self.browsed.contains(reg_type)
    }

    pub fn emit_discovered(&self, fullname: &str, reg_type: &str) {
        self.emit(DiscoveryEvent::ServiceDiscovered {
            fullname: fullname.to_owned(),
            reg_type: reg_type.to_owned(),
            domain: "local.".to_owned(),
        });
    }

    pub fn emit_resolved(&self, fullname: &str, host_target: &str, port: u16, txt: TxtRecord) {
        let parts: Vec<&str> = fullname.splitn(2, '.').collect();
        let description = ServiceDescription {
            fullname: fullname.to_owned(),
            instance_name: parts.first().copied().unwrap_or_default().to_owned(),
            reg_type: parts.get(1).copied().unwrap_or_default().to_owned(),
            domain: "local.".to_owned(),
            host_target: host_target.to_owned(),
            port,
            txt,
            addresses: Default::default(),
        };
        self.emit(DiscoveryEvent::ServiceResolved { description });
    }

    pub fn emit_address_added(&self, fullname: &str, interface_index: u32, address: IpAddr) {
        self.emit(DiscoveryEvent::AddressAdded {
            fullname: fullname.to_owned(),
            interface_index,
            address,
        });
    }

    pub fn emit_address_removed(&self, fullname: &str, interface_index: u32, address: IpAddr) {
        self.emit(DiscoveryEvent::AddressRemoved {
            fullname: fullname.to_owned(),
            interface_index,
            address,
        });
    }

    pub fn emit_removed(&self, fullname: &str) {
        self.emit(DiscoveryEvent::ServiceRemoved {
            fullname: fullname.to_owned(),
        });
    }

    pub fn emit_browse_error(&self, message: &str) {
        self.emit(DiscoveryEvent::BrowseError {
            message: message.to_owned(),
        });
    }

    fn emit(&self, event: DiscoveryEvent) {
        self.events.send(event).ok();
    }
}

impl DnssdBrowser for MockBrowser {
    fn browse_for(&mut self, reg_type: &str) -> DiscoveryResult<()> {
        if !self.browsed.insert(reg_type.to_owned()) {
            return Err(DiscoveryError::DuplicateBrowse(reg_type.to_owned()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_browse_fails() {
        let mut browser = MockBrowser::new();
        browser.browse_for("_rtsp._tcp").expect("first browse");
        assert!(browser.browse_for("_rtsp._tcp").is_err());
    }

    #[test]
    fn events_are_delivered_in_emission_order() {
        let mut browser = MockBrowser::new();
        let mut events = browser.subscribe();
        browser.browse_for("_rtsp._tcp").expect("browse");

        let fullname = "session-1._rtsp._tcp.local.";
        let address: IpAddr = "192.168.1.10".parse().expect("addr");

        browser.emit_discovered(fullname, "_rtsp._tcp");
        browser.emit_resolved(fullname, "host.local.", 5005, TxtRecord::new());
        browser.emit_address_added(fullname, 1, address);
        browser.emit_address_removed(fullname, 1, address);
        browser.emit_removed(fullname);

        assert!(matches!(
            events.try_recv().expect("event"),
            DiscoveryEvent::ServiceDiscovered { .. }
        ));
        assert!(matches!(
            events.try_recv().expect("event"),
            DiscoveryEvent::ServiceResolved { .. }
        ));
        assert!(matches!(
            events.try_recv().expect("event"),
            DiscoveryEvent::AddressAdded { .. }
        ));
        assert!(matches!(
            events.try_recv().expect("event"),
            DiscoveryEvent::AddressRemoved { .. }
        ));
        assert!(matches!(
            events.try_recv().expect("event"),
            DiscoveryEvent::ServiceRemoved { .. }
        ));
    }

    #[test]
    fn resolved_event_carries_service_details() {
        let browser = MockBrowser::new();
        let mut events = browser.subscribe();

        let mut txt = TxtRecord::new();
        txt.insert("clock-domain".to_owned(), "0".to_owned());
        browser.emit_resolved("stream._rtsp._tcp.local.", "host.local.", 5005, txt);

        match events.try_recv().expect("event") {
            DiscoveryEvent::ServiceResolved { description } => {
                assert_eq!("stream._rtsp._tcp.local.", description.fullname);
                assert_eq!("stream", description.instance_name);
                assert_eq!("host.local.", description.host_target);
                assert_eq!(5005, description.port);
                assert_eq!(Some(&"0".to_owned()), description.txt.get("clock-domain"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
