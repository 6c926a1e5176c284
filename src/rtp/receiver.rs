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

//! The receive half of the RTP transport. One socket actor per RTP port
//! (plus the adjacent RTCP port) feeds a subscription registry keyed by
//! (port, SSRC); datagrams with no matching subscription and datagrams from
//! senders outside a subscription's source filter are counted and dropped.
//! Packets within a stream are delivered in arrival order, reordering is the
//! jitter buffer's responsibility.

use super::RtpPacket;
use crate::{
    error::{RtpError, RtpResult},
    socket::create_rx_socket,
};
use dashmap::DashMap;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

type SubscriptionKey = (u16, Option<u32>);

struct Subscription {
    packets: mpsc::Sender<RtpPacket>,
    /// Source addresses accepted for this stream, from the SDP source
    /// filter. Empty means any sender.
    sources: Vec<IpAddr>,
}

impl Subscription {
    fn accepts(&self, source: IpAddr) -> bool {
        self.sources.is_empty() || self.sources.contains(&source)
    }
}

#[derive(Default)]
struct Registry {
    subscriptions: DashMap<SubscriptionKey, Subscription>,
    ports: DashMap<u16, CancellationToken>,
    unmatched_datagrams: AtomicU64,
    filtered_datagrams: AtomicU64,
    malformed_datagrams: AtomicU64,
}

/// Cloneable handle onto the node's RTP ingress. Endpoints subscribe with
/// the (port, SSRC) pair from their session description and receive the
/// stream's packets over a bounded channel.
#[derive(Clone, Default)]
pub struct RtpReceiver {
    registry: Arc<Registry>,
}

impl RtpReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the multicast group on the given interface and subscribes to
    /// the stream identified by (port, SSRC). `None` subscribes to whatever
    /// single stream arrives on the port; the SSRC is then learned from its
    /// first packet. A non-empty `source_filter` restricts the sender
    /// addresses accepted for the stream. The first subscription for a port
    /// binds its socket pair.
    #[instrument(skip(self, subsys))]
    pub fn subscribe(
        &self,
        subsys: &SubsystemHandle,
        multicast_addr: Ipv4Addr,
        interface_addr: Ipv4Addr,
        port: u16,
        ssrc: Option<u32>,
        source_filter: Vec<IpAddr>,
    ) -> RtpResult<mpsc::Receiver<RtpPacket>> {
        if self.registry.subscriptions.contains_key(&(port, ssrc)) {
            return Err(RtpError::DuplicateSubscription {
                port,
                ssrc: ssrc.unwrap_or(0),
            });
        }

        if !self.registry.ports.contains_key(&port) {
            let rtp_socket = create_rx_socket(multicast_addr, interface_addr, port)?;
            let rtcp_socket = create_rx_socket(multicast_addr, interface_addr, port + 1)?;
            let rtp_socket = UdpSocket::from_std(rtp_socket)?;
            let rtcp_socket = UdpSocket::from_std(rtcp_socket)?;

            let cancellation = CancellationToken::new();
            self.registry.ports.insert(port, cancellation.clone());

            let registry = self.registry.clone();
            subsys.start(SubsystemBuilder::new(
                format!("rtp-port-{port}"),
                move |s| port_actor(s, registry, port, rtp_socket, rtcp_socket, cancellation),
            ));
        }

        let (packets_tx, packets_rx) = mpsc::channel(256);
        self.registry.subscriptions.insert(
            (port, ssrc),
            Subscription {
                packets: packets_tx,
                sources: source_filter,
            },
        );

        Ok(packets_rx)
    }

    /// Drops a subscription; the port's sockets close and the multicast
    /// group is left when the last subscriber on the port goes away.
    #[instrument(skip(self))]
    pub fn unsubscribe(&self, port: u16, ssrc: Option<u32>) {
        self.registry.subscriptions.remove(&(port, ssrc));

        let port_in_use = self
            .registry
            .subscriptions
            .iter()
            .any(|entry| entry.key().0 == port);
        if port_in_use {
            return;
        }
        if let Some((_, cancellation)) = self.registry.ports.remove(&port) {
            cancellation.cancel();
        }
    }

    /// Datagrams that matched no (port, SSRC) subscription.
    pub fn unmatched_datagrams(&self) -> u64 {
        self.registry.unmatched_datagrams.load(Ordering::Relaxed)
    }

    /// Datagrams rejected by a subscription's source filter.
    pub fn filtered_datagrams(&self) -> u64 {
        self.registry.filtered_datagrams.load(Ordering::Relaxed)
    }

    pub fn malformed_datagrams(&self) -> u64 {
        self.registry.malformed_datagrams.load(Ordering::Relaxed)
    }
}

async fn port_actor(
    subsys: SubsystemHandle,
    registry: Arc<Registry>,
    port: u16,
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    cancellation: CancellationToken,
) -> RtpResult<()> {
    let mut rtp_buffer = [0u8; 65_535];
    let mut rtcp_buffer = [0u8; 65_535];

    debug!("RTP port actor for port {port} started");

    loop {
        select! {
            received = rtp_socket.recv_from(&mut rtp_buffer) => match received {
                Ok((len, source)) => {
                    rtp_datagram(&registry, port, source, &rtp_buffer[..len]).await;
                }
                Err(e) => {
                    warn!("RTP socket error on port {port}: {e}");
                    break;
                }
            },
            received = rtcp_socket.recv_from(&mut rtcp_buffer) => match received {
                Ok((len, _)) => trace!("RTCP datagram of {len} bytes on port {}", port + 1),
                Err(e) => {
                    warn!("RTCP socket error on port {}: {e}", port + 1);
                    break;
                }
            },
            _ = cancellation.cancelled() => break,
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    debug!("RTP port actor for port {port} stopped");

    Ok(())
}

async fn rtp_datagram(registry: &Arc<Registry>, port: u16, source: SocketAddr, data: &[u8]) {
    let packet = match RtpPacket::decode(data) {
        Ok(it) => it,
        Err(e) => {
            registry.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping malformed RTP datagram: {e}");
            return;
        }
    };

    let subscription = match registry.subscriptions.get(&(port, Some(packet.ssrc))) {
        Some(it) => it,
        None => match registry.subscriptions.get(&(port, None)) {
            Some(it) => it,
            None => {
                registry.unmatched_datagrams.fetch_add(1, Ordering::Relaxed);
                return;
            }
        },
    };

    if !subscription.accepts(source.ip()) {
        registry.filtered_datagrams.fetch_add(1, Ordering::Relaxed);
        warn!("Received packet from wrong sender: {source}");
        return;
    }

    // A slow consumer drops packets rather than stalling the socket loop
    if subscription.packets.try_send(packet).is_err() {
        trace!("Subscriber on port {port} is not keeping up, dropping packet");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sender_addr(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().expect("addr"), 5004)
    }

    fn subscription(tx: mpsc::Sender<RtpPacket>, sources: Vec<IpAddr>) -> Subscription {
        Subscription {
            packets: tx,
            sources,
        }
    }

    #[test]
    fn duplicate_subscription_key_is_detected() {
        let receiver = RtpReceiver::new();
        let (tx, _rx) = mpsc::channel(1);
        receiver
            .registry
            .subscriptions
            .insert((5004, Some(42)), subscription(tx, Vec::new()));

        // subscribe() would return DuplicateSubscription for the same key
        assert!(
            receiver
                .registry
                .subscriptions
                .contains_key(&(5004, Some(42)))
        );
        receiver.unsubscribe(5004, Some(42));
        assert!(
            !receiver
                .registry
                .subscriptions
                .contains_key(&(5004, Some(42)))
        );
    }

    #[tokio::test]
    async fn unmatched_datagrams_are_counted_and_dropped() {
        let receiver = RtpReceiver::new();
        let packet = RtpPacket {
            ssrc: 7,
            ..Default::default()
        };
        let encoded = packet.encode().expect("encode");
        rtp_datagram(
            &receiver.registry,
            5004,
            sender_addr("192.168.1.20"),
            &encoded,
        )
        .await;
        assert_eq!(1, receiver.unmatched_datagrams());
    }

    #[tokio::test]
    async fn matching_datagram_is_dispatched_by_ssrc() {
        let receiver = RtpReceiver::new();
        let (tx, mut rx) = mpsc::channel(4);
        receiver
            .registry
            .subscriptions
            .insert((5004, Some(7)), subscription(tx, Vec::new()));

        let packet = RtpPacket {
            ssrc: 7,
            payload: vec![1, 2, 3],
            ..Default::default()
        };
        rtp_datagram(
            &receiver.registry,
            5004,
            sender_addr("192.168.1.20"),
            &packet.encode().expect("encode"),
        )
        .await;

        let received = rx.try_recv().expect("packet");
        assert_eq!(packet, received);
        assert_eq!(0, receiver.unmatched_datagrams());
    }

    #[tokio::test]
    async fn wildcard_subscription_receives_any_ssrc() {
        let receiver = RtpReceiver::new();
        let (tx, mut rx) = mpsc::channel(4);
        receiver
            .registry
            .subscriptions
            .insert((5004, None), subscription(tx, Vec::new()));

        let packet = RtpPacket {
            ssrc: 99,
            ..Default::default()
        };
        rtp_datagram(
            &receiver.registry,
            5004,
            sender_addr("192.168.1.20"),
            &packet.encode().expect("encode"),
        )
        .await;
        assert_eq!(99, rx.try_recv().expect("packet").ssrc);
    }

    #[tokio::test]
    async fn source_filter_rejects_foreign_senders() {
        let receiver = RtpReceiver::new();
        let (tx, mut rx) = mpsc::channel(4);
        let allowed: IpAddr = "192.168.15.52".parse().expect("addr");
        receiver
            .registry
            .subscriptions
            .insert((5004, None), subscription(tx, vec![allowed]));

        let packet = RtpPacket {
            ssrc: 7,
            ..Default::default()
        };
        let encoded = packet.encode().expect("encode");

        rtp_datagram(
            &receiver.registry,
            5004,
            sender_addr("192.168.1.20"),
            &encoded,
        )
        .await;
        assert_eq!(1, receiver.filtered_datagrams());
        assert!(rx.try_recv().is_err());

        rtp_datagram(
            &receiver.registry,
            5004,
            sender_addr("192.168.15.52"),
            &encoded,
        )
        .await;
        assert_eq!(7, rx.try_recv().expect("packet").ssrc);
        assert_eq!(1, receiver.filtered_datagrams());
        assert_eq!(0, receiver.unmatched_datagrams());
    }

    #[tokio::test]
    async fn malformed_datagrams_are_counted() {
        let receiver = RtpReceiver::new();
        rtp_datagram(
            &receiver.registry,
            5004,
            sender_addr("192.168.1.20"),
            &[0x42, 0x00],
        )
        .await;
        assert_eq!(1, receiver.malformed_datagrams());
    }
}
