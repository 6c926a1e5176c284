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

//! DNS-SD backed by the mDNS responder daemon. One daemon instance serves
//! both the advertiser and the browser half; it is the last discovery
//! resource to be torn down.

use super::{
    DiscoveryEvent, DnssdAdvertiser, DnssdBrowser, RegType, ServiceDescription, ServiceId,
    ServiceRegistration, TxtRecord, next_service_id,
};
use crate::error::{DiscoveryError, DiscoveryResult};
use gethostname::gethostname;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::{HashMap, HashSet};
use tokio::{select, sync::broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const LOCAL_DOMAIN: &str = "local.";

struct RegistrationRecord {
    fullname: String,
    ty_domain: String,
    instance_name: String,
    host: String,
    port: u16,
}

pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    events: broadcast::Sender<DiscoveryEvent>,
    registrations: HashMap<ServiceId, RegistrationRecord>,
    advertised_names: HashSet<String>,
    browsed: HashSet<String>,
    cancellation: CancellationToken,
}

impl MdnsDiscovery {
    pub fn new() -> DiscoveryResult<Self> {
        let daemon = ServiceDaemon::new()?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            daemon,
            events,
            registrations: HashMap::new(),
            advertised_names: HashSet::new(),
            browsed: HashSet::new(),
            cancellation: CancellationToken::new(),
        })
    }

    fn host_name() -> String {
        let host = gethostname().to_string_lossy().to_string();
        format!("{host}.{LOCAL_DOMAIN}")
    }

    fn emit(&self, event: DiscoveryEvent) {
        self.events.send(event).ok();
    }
}

impl DnssdAdvertiser for MdnsDiscovery {
    #[instrument(skip(self))]
    fn register_service(
        &mut self,
        registration: ServiceRegistration,
    ) -> DiscoveryResult<ServiceId> {
        let reg_type = RegType::parse(&registration.reg_type)?;
        if !reg_type.subtypes.is_empty() {
            debug!(
                "Registering {} with subtypes {:?}",
                reg_type.primary, reg_type.subtypes
            );
        }
        if registration.local_only {
            // The daemon always answers on all interfaces; scoping to the
            // local machine is approximated by multicast loopback
            debug!("local_only registration requested for {}", reg_type.primary);
        }

        let instance_name = match registration.instance_name {
            Some(name) if !name.is_empty() => name,
            _ => gethostname().to_string_lossy().to_string(),
        };
        let domain = registration.domain.unwrap_or_else(|| LOCAL_DOMAIN.to_owned());
        let ty_domain = format!("{}.{domain}", reg_type.primary);
        let fullname = format!("{instance_name}.{ty_domain}");

        if self.advertised_names.contains(&fullname) {
            if registration.auto_rename {
                // The daemon appends " (2)" style suffixes on the wire; we
                // only need a unique local bookkeeping name.
                warn!("Name conflict for {fullname}, letting the daemon rename");
            } else {
                self.emit(DiscoveryEvent::NameConflict {
                    reg_type: registration.reg_type.clone(),
                    name: instance_name.clone(),
                });
                return Err(DiscoveryError::NameConflict(fullname));
            }
        }

        let host = Self::host_name();
        let properties: HashMap<String, String> = registration.txt.into_iter().collect();
        let service = ServiceInfo::new(
            &ty_domain,
            &instance_name,
            &host,
            (),
            registration.port,
            properties,
        )?;
        let fullname = service.get_fullname().to_string();

        self.daemon.register(service)?;
        info!("Registered service {fullname} on port {}", registration.port);

        let id = next_service_id();
        self.advertised_names.insert(fullname.clone());
        self.registrations.insert(
            id,
            RegistrationRecord {
                fullname,
                ty_domain,
                instance_name,
                host,
                port: registration.port,
            },
        );

        Ok(id)
    }

    #[instrument(skip(self, txt))]
    fn update_txt_record(&mut self, id: ServiceId, txt: TxtRecord) -> DiscoveryResult<()> {
        let record = self
            .registrations
            .get(&id)
            .ok_or(DiscoveryError::NoSuchRegistration(id))?;

        // Re-registering under the same fullname atomically replaces the
        // published TXT record.
        let properties: HashMap<String, String> = txt.into_iter().collect();
        let service = ServiceInfo::new(
            &record.ty_domain,
            &record.instance_name,
            &record.host,
            (),
            record.port,
            properties,
        )?;
        self.daemon.register(service)?;

        Ok(())
    }

    #[instrument(skip(self))]
    fn unregister_service(&mut self, id: ServiceId) {
        let Some(record) = self.registrations.remove(&id) else {
            return;
        };
        self.advertised_names.remove(&record.fullname);
        if let Err(e) = self.daemon.unregister(&record.fullname) {
            warn!("Could not unregister {}: {e}", record.fullname);
        } else {
            info!("Unregistered service {}", record.fullname);
        }
    }
}

impl DnssdBrowser for MdnsDiscovery {
    #[instrument(skip(self))]
    fn browse_for(&mut self, reg_type: &str) -> DiscoveryResult<()> {
        let parsed = RegType::parse(reg_type)?;
        let ty_domain = format!("{}.{LOCAL_DOMAIN}", parsed.primary);

        if !self.browsed.insert(ty_domain.clone()) {
            return Err(DiscoveryError::DuplicateBrowse(reg_type.to_owned()));
        }

        let receiver = self.daemon.browse(&ty_domain)?;
        info!("Browsing for {ty_domain}");

        let events = self.events.clone();
        let cancellation = self.cancellation.clone();
        tokio::spawn(async move {
            let mut tracker = BrowseTracker::new(events);
            loop {
                select! {
                    event = receiver.recv_async() => match event {
                        Ok(event) => tracker.daemon_event(event),
                        Err(e) => {
                            tracker.emit(DiscoveryEvent::BrowseError {
                                message: e.to_string(),
                            });
                            break;
                        }
                    },
                    _ = cancellation.cancelled() => break,
                }
            }
        });

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        self.cancellation.cancel();
        let ids: Vec<ServiceId> = self.registrations.keys().copied().collect();
        for id in ids {
            self.unregister_service(id);
        }
        // The shared daemon goes down last, after all registrations
        self.daemon.shutdown().ok();
    }
}

/// Per-browse bookkeeping that turns raw daemon events into the ordered
/// event sequence of the browser contract. The daemon does not report
/// interface indexes, so all addresses are filed under index 0.
struct BrowseTracker {
    events: broadcast::Sender<DiscoveryEvent>,
    services: HashMap<String, ServiceDescription>,
}

impl BrowseTracker {
    fn new(events: broadcast::Sender<DiscoveryEvent>) -> Self {
        Self {
            events,
            services: HashMap::new(),
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        self.events.send(event).ok();
    }

    fn daemon_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::SearchStarted(ty) => debug!("Search started for {ty}"),
            ServiceEvent::SearchStopped(ty) => debug!("Search stopped for {ty}"),
            ServiceEvent::ServiceFound(ty_domain, fullname) => {
                self.service_found(&ty_domain, &fullname);
            }
            ServiceEvent::ServiceResolved(info) => self.service_resolved(&info),
            ServiceEvent::ServiceRemoved(_, fullname) => self.service_removed(&fullname),
            other => debug!("Unhandled mDNS event: {other:?}"),
        }
    }

    fn service_found(&mut self, ty_domain: &str, fullname: &str) {
        if self.services.contains_key(fullname) {
            return;
        }

        let reg_type = ty_domain
            .strip_suffix(&format!(".{LOCAL_DOMAIN}"))
            .unwrap_or(ty_domain)
            .to_owned();
        let instance_name = fullname
            .strip_suffix(&format!(".{ty_domain}"))
            .unwrap_or(fullname)
            .to_owned();

        let description = ServiceDescription {
            fullname: fullname.to_owned(),
            instance_name,
            reg_type: reg_type.clone(),
            domain: LOCAL_DOMAIN.to_owned(),
            ..Default::default()
        };
        self.services.insert(fullname.to_owned(), description);

        self.emit(DiscoveryEvent::ServiceDiscovered {
            fullname: fullname.to_owned(),
            reg_type,
            domain: LOCAL_DOMAIN.to_owned(),
        });
    }

    fn service_resolved(&mut self, info: &ServiceInfo) {
        let fullname = info.get_fullname().to_owned();
        if !self.services.contains_key(&fullname) {
            // Some daemons resolve without a prior found event
            self.service_found(info.get_type(), &fullname);
        }
        let Some(service) = self.services.get_mut(&fullname) else {
            return;
        };

        service.host_target = info.get_hostname().to_owned();
        service.port = info.get_port();
        service.txt = info
            .get_properties()
            .iter()
            .map(|property| (property.key().to_owned(), property.val_str().to_owned()))
            .collect();

        let resolved = service.clone();
        self.emit(DiscoveryEvent::ServiceResolved {
            description: resolved,
        });

        let current: HashSet<std::net::IpAddr> = info.get_addresses().iter().copied().collect();
        let known: HashSet<std::net::IpAddr> = self
            .services
            .get(&fullname)
            .map(|s| s.all_addresses().copied().collect())
            .unwrap_or_default();

        for address in current.difference(&known) {
            if let Some(service) = self.services.get_mut(&fullname) {
                service.add_address(0, *address);
            }
            self.emit(DiscoveryEvent::AddressAdded {
                fullname: fullname.clone(),
                interface_index: 0,
                address: *address,
            });
        }

        for address in known.difference(&current) {
            let now_empty = self
                .services
                .get_mut(&fullname)
                .is_some_and(|s| s.remove_address(0, address));
            self.emit(DiscoveryEvent::AddressRemoved {
                fullname: fullname.clone(),
                interface_index: 0,
                address: *address,
            });
            if now_empty {
                self.service_removed(&fullname);
                return;
            }
        }
    }

    fn service_removed(&mut self, fullname: &str) {
        let Some(service) = self.services.remove(fullname) else {
            return;
        };

        for (interface_index, addresses) in &service.addresses {
            for address in addresses {
                self.emit(DiscoveryEvent::AddressRemoved {
                    fullname: fullname.to_owned(),
                    interface_index: *interface_index,
                    address: *address,
                });
            }
        }

        self.emit(DiscoveryEvent::ServiceRemoved {
            fullname: fullname.to_owned(),
        });
    }
}
