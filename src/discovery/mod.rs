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

//! DNS-SD service discovery. The advertiser and browser contracts are traits
//! so the platform daemon ([`mdns::MdnsDiscovery`]) and the scriptable
//! [`mock::MockBrowser`] are interchangeable from the endpoints' view.

pub mod mdns;
pub mod mock;

use crate::error::{DiscoveryError, DiscoveryResult};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::broadcast;

/// Stable identifier of a registration, never reused within a process.
pub type ServiceId = u64;

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_service_id() -> ServiceId {
    NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed)
}

pub type TxtRecord = BTreeMap<String, String>;

/// Everything known about a discovered service. Address state is kept per
/// interface; the service counts as gone when the table empties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceDescription {
    pub fullname: String,
    pub instance_name: String,
    pub reg_type: String,
    pub domain: String,
    pub host_target: String,
    pub port: u16,
    pub txt: TxtRecord,
    pub addresses: BTreeMap<u32, BTreeSet<IpAddr>>,
}

impl ServiceDescription {
    pub fn add_address(&mut self, interface_index: u32, address: IpAddr) -> bool {
        self.addresses
            .entry(interface_index)
            .or_default()
            .insert(address)
    }

    /// Removes an address and prunes the interface entry; returns true when
    /// the last address disappeared and the service should be reported
    /// removed.
    pub fn remove_address(&mut self, interface_index: u32, address: &IpAddr) -> bool {
        if let Some(addresses) = self.addresses.get_mut(&interface_index) {
            addresses.remove(address);
            if addresses.is_empty() {
                self.addresses.remove(&interface_index);
            }
        }
        self.addresses.is_empty()
    }

    pub fn all_addresses(&self) -> impl Iterator<Item = &IpAddr> {
        self.addresses.values().flatten()
    }
}

/// Browser and advertiser events, delivered per service strictly in the
/// order of this enum's browse-side variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    ServiceDiscovered {
        fullname: String,
        reg_type: String,
        domain: String,
    },
    ServiceResolved {
        description: ServiceDescription,
    },
    AddressAdded {
        fullname: String,
        interface_index: u32,
        address: IpAddr,
    },
    AddressRemoved {
        fullname: String,
        interface_index: u32,
        address: IpAddr,
    },
    ServiceRemoved {
        fullname: String,
    },
    BrowseError {
        message: String,
    },
    AdvertiserError {
        message: String,
    },
    NameConflict {
        reg_type: String,
        name: String,
    },
}

/// A service registration request. With no instance name the host name is
/// used; with `auto_rename` disabled a conflicting name aborts the
/// registration with a name-conflict event instead of renaming.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub reg_type: String,
    pub instance_name: Option<String>,
    pub domain: Option<String>,
    pub port: u16,
    pub txt: TxtRecord,
    pub auto_rename: bool,
    pub local_only: bool,
}

impl ServiceRegistration {
    pub fn new(reg_type: impl Into<String>, port: u16) -> Self {
        Self {
            reg_type: reg_type.into(),
            instance_name: None,
            domain: None,
            port,
            txt: TxtRecord::new(),
            auto_rename: false,
            local_only: false,
        }
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    pub fn with_txt(mut self, txt: TxtRecord) -> Self {
        self.txt = txt;
        self
    }
}

pub trait DnssdAdvertiser: Send {
    /// Registers a service and returns its stable id.
    fn register_service(&mut self, registration: ServiceRegistration)
    -> DiscoveryResult<ServiceId>;

    /// Atomically replaces the TXT record of a registration.
    fn update_txt_record(&mut self, id: ServiceId, txt: TxtRecord) -> DiscoveryResult<()>;

    /// Unregisters a service. Unknown ids are ignored.
    fn unregister_service(&mut self, id: ServiceId);
}

pub trait DnssdBrowser: Send {
    /// Begins continuous discovery for a registration type. Browsing for the
    /// same type twice is an error.
    fn browse_for(&mut self, reg_type: &str) -> DiscoveryResult<()>;

    /// Subscribes to discovery events. Events for a single service arrive in
    /// discovered, resolved, address-added, address-removed, removed order.
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

/// The registration type and its subtypes, split from the
/// `_svc._tcp,_subtype1,_subtype2` syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegType {
    pub primary: String,
    pub subtypes: Vec<String>,
}

impl RegType {
    pub fn parse(reg_type: &str) -> DiscoveryResult<Self> {
        let mut parts = reg_type.split(',');
        let primary = parts
            .next()
            .ok_or_else(|| DiscoveryError::BadRegType(reg_type.to_owned()))?;

        let mut split = primary.split('.');
        let service = split
            .next()
            .ok_or_else(|| DiscoveryError::BadRegType(reg_type.to_owned()))?;
        let protocol = split
            .next()
            .ok_or_else(|| DiscoveryError::BadRegType(reg_type.to_owned()))?;
        if split.next().is_some() {
            return Err(DiscoveryError::BadRegType(reg_type.to_owned()));
        }

        let name = service
            .strip_prefix('_')
            .ok_or_else(|| DiscoveryError::BadRegType(reg_type.to_owned()))?;
        if name.is_empty()
            || name.len() > 15
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(DiscoveryError::BadRegType(reg_type.to_owned()));
        }
        if protocol != "_tcp" && protocol != "_udp" {
            return Err(DiscoveryError::BadRegType(reg_type.to_owned()));
        }

        let subtypes = parts.map(str::to_owned).collect();

        Ok(Self {
            primary: primary.to_owned(),
            subtypes,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reg_type_without_subtypes() {
        let parsed = RegType::parse("_rtsp._tcp").expect("reg type");
        assert_eq!("_rtsp._tcp", parsed.primary);
        assert!(parsed.subtypes.is_empty());
    }

    #[test]
    fn reg_type_with_subtypes() {
        let parsed = RegType::parse("_rtsp._tcp,_ravenna_session").expect("reg type");
        assert_eq!("_rtsp._tcp", parsed.primary);
        assert_eq!(vec!["_ravenna_session".to_owned()], parsed.subtypes);
    }

    #[test]
    fn malformed_reg_types_are_rejected() {
        for bad in [
            "rtsp._tcp",
            "_rtsp._sctp",
            "_._tcp",
            "_this-name-is-way-too-long._tcp",
            "_rtsp",
            "_rtsp._tcp.local",
        ] {
            assert!(RegType::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn service_ids_are_never_reused() {
        let a = next_service_id();
        let b = next_service_id();
        assert!(b > a);
    }

    #[test]
    fn removing_last_address_empties_the_service() {
        let mut description = ServiceDescription::default();
        let addr: IpAddr = "192.168.1.10".parse().expect("addr");
        assert!(description.add_address(1, addr));
        assert!(!description.remove_address(2, &addr));
        assert!(description.remove_address(1, &addr));
    }
}
