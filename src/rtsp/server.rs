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

//! RTSP server. Accepts TCP connections, parses requests per connection and
//! answers them through handlers registered by exact path. Connections that
//! described a path stay subscribed to it, so a changed session description
//! can be pushed to them as an ANNOUNCE request.

use super::{ParseOutcome, RtspMessage, RtspParser, RtspRequest, RtspResponse, encode_uri};
use crate::{error::RtspResult, socket::init_tcp_listener};
use dashmap::DashMap;
use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{Arc, RwLock, atomic::{AtomicU64, Ordering}},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

pub type RequestHandler = Arc<dyn Fn(&RtspRequest) -> RtspResponse + Send + Sync>;

type HandlerMap = Arc<RwLock<std::collections::HashMap<String, RequestHandler>>>;

struct ConnectionHandle {
    outbound: mpsc::Sender<String>,
    subscribed_paths: RwLock<HashSet<String>>,
}

type Connections = Arc<DashMap<u64, Arc<ConnectionHandle>>>;

/// The server half of session control. Cloneable handle; the accept loop and
/// per-connection actors run as subsystems.
#[derive(Clone)]
pub struct RtspServer {
    host: IpAddr,
    port: u16,
    handlers: HandlerMap,
    connections: Connections,
}

impl RtspServer {
    /// Binds the listener and starts accepting connections.
    #[instrument(skip(subsys))]
    pub fn bind(subsys: &SubsystemHandle, bind_addr: IpAddr, port: u16) -> RtspResult<Self> {
        let listener = init_tcp_listener(bind_addr, port)?;
        let port = listener.local_addr()?.port();
        let server = Self {
            host: bind_addr,
            port,
            handlers: Default::default(),
            connections: Default::default(),
        };

        let accept_server = server.clone();
        subsys.start(SubsystemBuilder::new("rtsp-server", move |s| {
            accept_server.accept_loop(s, listener)
        }));

        info!("RTSP server listening on {bind_addr}:{port}");

        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Registers a handler for an exact path, replacing any previous one.
    pub fn register_handler(&self, path: impl Into<String>, handler: RequestHandler) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .insert(path.into(), handler);
    }

    /// Removes the handler for a path. Unknown paths are ignored.
    pub fn unregister_handler(&self, path: &str) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .remove(path);
    }

    /// Pushes a request (e.g. an ANNOUNCE carrying a fresh SDP) to every
    /// connection that previously described the given path.
    pub fn send_request(&self, path: &str, request: &RtspRequest) {
        let encoded = request.encode();
        for entry in self.connections.iter() {
            let subscribed = entry
                .subscribed_paths
                .read()
                .expect("subscription lock poisoned")
                .contains(path);
            if subscribed {
                // A full outbound queue or a closed connection both mean the
                // peer is gone or stuck; drop rather than block the caller.
                entry.outbound.try_send(encoded.clone()).ok();
            }
        }
    }

    async fn accept_loop(self, subsys: SubsystemHandle, listener: TcpListener) -> RtspResult<()> {
        static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

        loop {
            select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                        debug!("RTSP connection {id} from {peer}");
                        let connection = ServerConnection::new(id, self.clone());
                        subsys.start(SubsystemBuilder::new(
                            format!("rtsp-connection-{id}"),
                            move |s| connection.run(s, stream),
                        ));
                    }
                    Err(e) => {
                        warn!("RTSP accept error: {e}");
                    }
                },
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        Ok(())
    }
}

struct ServerConnection {
    id: u64,
    server: RtspServer,
}

impl ServerConnection {
    fn new(id: u64, server: RtspServer) -> Self {
        Self { id, server }
    }

    async fn run(self, subsys: SubsystemHandle, stream: TcpStream) -> RtspResult<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(16);

        let handle = Arc::new(ConnectionHandle {
            outbound: outbound_tx,
            subscribed_paths: RwLock::new(HashSet::new()),
        });
        self.server.connections.insert(self.id, handle.clone());

        let mut parser = RtspParser::new();
        let mut buffer = [0u8; 2048];

        loop {
            select! {
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => {
                        debug!("RTSP connection {} closed by peer", self.id);
                        break;
                    }
                    Ok(len) => {
                        if !self
                            .data_received(&buffer[..len], &mut parser, &handle, &mut writer)
                            .await
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("RTSP connection {} read error: {e}", self.id);
                        break;
                    }
                },
                outbound = outbound_rx.recv() => match outbound {
                    Some(data) => {
                        if let Err(e) = writer.write_all(data.as_bytes()).await {
                            debug!("RTSP connection {} write error: {e}", self.id);
                            break;
                        }
                    }
                    None => break,
                },
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        self.server.connections.remove(&self.id);

        Ok(())
    }

    /// Feeds received bytes through the parser and answers every complete
    /// request on the same connection. Returns false when the connection
    /// should close.
    async fn data_received(
        &self,
        mut data: &[u8],
        parser: &mut RtspParser,
        handle: &Arc<ConnectionHandle>,
        writer: &mut OwnedWriteHalf,
    ) -> bool {
        while !data.is_empty() {
            match parser.parse(data) {
                Ok((ParseOutcome::Complete(message), consumed)) => {
                    data = &data[consumed..];
                    match message {
                        RtspMessage::Request(request) => {
                            let response = self.handle_request(&request, handle);
                            if let Err(e) = writer.write_all(response.encode().as_bytes()).await {
                                debug!("RTSP connection {} write error: {e}", self.id);
                                return false;
                            }
                        }
                        RtspMessage::Response(response) => {
                            // Responses to pushed ANNOUNCE requests
                            debug!(
                                "RTSP connection {} response: {} {}",
                                self.id, response.status_code, response.reason
                            );
                        }
                    }
                }
                Ok((ParseOutcome::Incomplete, _)) => return true,
                Err(e) => {
                    warn!("RTSP connection {} parse error: {e}", self.id);
                    return false;
                }
            }
        }
        true
    }

    fn handle_request(&self, request: &RtspRequest, handle: &Arc<ConnectionHandle>) -> RtspResponse {
        let mut response = match request.method.as_str() {
            "OPTIONS" => {
                let mut response = RtspResponse::ok("");
                response.headers.set("Public", "OPTIONS, DESCRIBE, ANNOUNCE");
                response
            }
            _ => {
                let path = request.path().to_owned();
                let handler = self
                    .server
                    .handlers
                    .read()
                    .expect("handler lock poisoned")
                    .get(&path)
                    .cloned();
                match handler {
                    Some(handler) => {
                        handle
                            .subscribed_paths
                            .write()
                            .expect("subscription lock poisoned")
                            .insert(path);
                        handler(request)
                    }
                    None => {
                        debug!("No handler for path {path}");
                        RtspResponse::not_found()
                    }
                }
            }
        };

        let cseq = request.headers.get("CSeq");
        if !cseq.is_empty() {
            response.headers.set("CSeq", cseq.to_owned());
        }

        response
    }
}

/// Builds the absolute request URI for an ANNOUNCE pushed from this server.
pub fn announce_request(server: &RtspServer, path: &str, sdp: String) -> RtspRequest {
    let mut request = RtspRequest::new(
        "ANNOUNCE",
        encode_uri(&server.host().to_string(), server.port(), path),
    );
    request.headers.set("Content-Type", "application/sdp");
    request.data = sdp;
    request
}
