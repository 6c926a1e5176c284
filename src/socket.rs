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

//! Socket bring-up. All sockets are configured through socket2 and then
//! converted into std/tokio sockets.

use crate::error::{RtpResult, RtspResult};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tokio::net::TcpListener;
use tracing::{info, instrument};

#[instrument]
pub fn init_tcp_listener(bind_addr: IpAddr, port: u16) -> RtspResult<TcpListener> {
    let addr = SocketAddr::new(bind_addr, port);

    let domain = match bind_addr {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(SockProto::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_tcp_nodelay(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1024)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener)?)
}

/// Transmit socket for RTP: bound to the outbound interface, multicast TTL
/// per the RAVENNA connection info, loopback disabled.
#[instrument]
pub fn create_tx_socket(interface_addr: Ipv4Addr, ttl: u32) -> RtpResult<UdpSocket> {
    info!("Creating RTP TX socket on {interface_addr}");

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_if_v4(&interface_addr)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(interface_addr),
        0,
    )))?;

    Ok(socket.into())
}

/// Receive socket for RTP or RTCP: bound to the wildcard address on the
/// stream's port, joined to the multicast group on the given interface.
#[instrument]
pub fn create_rx_socket(
    multicast_addr: Ipv4Addr,
    interface_addr: Ipv4Addr,
    port: u16,
) -> RtpResult<UdpSocket> {
    info!(
        "Creating RTP RX socket for {}:{port} on {interface_addr}",
        multicast_addr
    );

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if multicast_addr.is_multicast() {
        socket.join_multicast_v4(&multicast_addr, &interface_addr)?;
    }
    socket.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port,
    )))?;

    Ok(socket.into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn tcp_listener_binds_ephemeral_port() {
        let listener =
            init_tcp_listener(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).expect("listener");
        let port = listener.local_addr().expect("addr").port();
        assert_ne!(0, port);
    }

    #[test]
    fn tx_socket_binds_on_loopback() {
        let socket = create_tx_socket(Ipv4Addr::LOCALHOST, 15).expect("socket");
        assert_eq!(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            socket.local_addr().expect("addr").ip()
        );
    }

    #[test]
    fn rx_socket_is_nonblocking() {
        let socket =
            create_rx_socket(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 0).expect("socket");
        let mut buf = [0u8; 16];
        let result = socket.recv_from(&mut buf);
        assert!(matches!(
            result,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));
    }
}
