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

//! RTSP client. Opens one TCP connection, correlates responses to requests
//! in FIFO order (one in-flight request at a time is assumed, CSeq is
//! emitted but not required for matching) and surfaces server-initiated
//! requests such as ANNOUNCE as events.

use super::{ParseOutcome, RtspMessage, RtspParser, RtspRequest, RtspResponse, encode_uri};
use crate::error::{RtspError, RtspResult};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub enum RtspClientEvent {
    /// A request pushed by the server, e.g. an ANNOUNCE with a new SDP.
    Request(RtspRequest),
    Disconnected,
}

type PendingRequest = (RtspRequest, oneshot::Sender<RtspResponse>);

pub struct RtspClient {
    host: String,
    port: u16,
    requests: mpsc::Sender<PendingRequest>,
    events: broadcast::Sender<RtspClientEvent>,
    cseq: AtomicU32,
}

impl RtspClient {
    /// Resolves the host and opens the control connection. The connection
    /// actor runs as a subsystem until EOF, error or shutdown; there is no
    /// automatic reconnect.
    #[instrument(skip(subsys))]
    pub async fn connect(subsys: &SubsystemHandle, host: &str, port: u16) -> RtspResult<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let peer = stream.peer_addr()?;
        info!("RTSP client connected to {peer}");

        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(16);

        let actor = ClientActor {
            requests: requests_rx,
            events: events.clone(),
            waiting: VecDeque::new(),
        };
        subsys.start(SubsystemBuilder::new(format!("rtsp-client-{peer}"), |s| {
            actor.run(s, stream)
        }));

        Ok(Self {
            host: host.to_owned(),
            port,
            requests: requests_tx,
            events,
            cseq: AtomicU32::new(1),
        })
    }

    /// Subscribes to server-pushed requests and the disconnect event.
    pub fn subscribe(&self) -> broadcast::Receiver<RtspClientEvent> {
        self.events.subscribe()
    }

    pub async fn describe(&self, path: &str) -> RtspResult<RtspResponse> {
        let mut request = self.request("DESCRIBE", path)?;
        request.headers.set("Accept", "application/sdp");
        self.send(request).await
    }

    pub async fn setup(&self, path: &str, client_port: u16) -> RtspResult<RtspResponse> {
        let mut request = self.request("SETUP", path)?;
        request.headers.set(
            "Transport",
            format!(
                "RTP/AVP;unicast;client_port={}-{}",
                client_port,
                client_port + 1
            ),
        );
        self.send(request).await
    }

    pub async fn play(&self, path: &str) -> RtspResult<RtspResponse> {
        let request = self.request("PLAY", path)?;
        self.send(request).await
    }

    pub async fn teardown(&self, path: &str) -> RtspResult<RtspResponse> {
        let request = self.request("TEARDOWN", path)?;
        self.send(request).await
    }

    fn request(&self, method: &str, path: &str) -> RtspResult<RtspRequest> {
        if !path.starts_with('/') {
            return Err(RtspError::BadPath(path.to_owned()));
        }
        let mut request = RtspRequest::new(method, encode_uri(&self.host, self.port, path));
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed);
        request.headers.set("CSeq", cseq.to_string());
        Ok(request)
    }

    async fn send(&self, request: RtspRequest) -> RtspResult<RtspResponse> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests
            .send((request, response_tx))
            .await
            .map_err(|_| RtspError::ConnectionClosed)?;
        Ok(response_rx.await?)
    }
}

struct ClientActor {
    requests: mpsc::Receiver<PendingRequest>,
    events: broadcast::Sender<RtspClientEvent>,
    waiting: VecDeque<oneshot::Sender<RtspResponse>>,
}

impl ClientActor {
    async fn run(mut self, subsys: SubsystemHandle, stream: TcpStream) -> RtspResult<()> {
        let (mut reader, mut writer) = stream.into_split();
        let mut parser = RtspParser::new();
        let mut buffer = [0u8; 2048];

        loop {
            select! {
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => {
                        debug!("RTSP server closed the connection");
                        break;
                    }
                    Ok(len) => {
                        if !self.data_received(&buffer[..len], &mut parser) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("RTSP client read error: {e}");
                        break;
                    }
                },
                pending = self.requests.recv() => match pending {
                    Some((request, response_tx)) => {
                        if let Err(e) = writer.write_all(request.encode().as_bytes()).await {
                            debug!("RTSP client write error: {e}");
                            break;
                        }
                        self.waiting.push_back(response_tx);
                    }
                    None => break,
                },
                _ = subsys.on_shutdown_requested() => break,
            }
        }

        // Dropping the waiters cancels every in-flight request
        self.waiting.clear();
        self.events.send(RtspClientEvent::Disconnected).ok();

        Ok(())
    }

    fn data_received(&mut self, mut data: &[u8], parser: &mut RtspParser) -> bool {
        while !data.is_empty() {
            match parser.parse(data) {
                Ok((ParseOutcome::Complete(message), consumed)) => {
                    data = &data[consumed..];
                    match message {
                        RtspMessage::Response(response) => match self.waiting.pop_front() {
                            Some(waiter) => {
                                waiter.send(response).ok();
                            }
                            None => warn!("Received RTSP response with no request in flight"),
                        },
                        RtspMessage::Request(request) => {
                            self.events.send(RtspClientEvent::Request(request)).ok();
                        }
                    }
                }
                Ok((ParseOutcome::Incomplete, _)) => return true,
                Err(e) => {
                    warn!("RTSP client parse error: {e}");
                    return false;
                }
            }
        }
        true
    }
}
