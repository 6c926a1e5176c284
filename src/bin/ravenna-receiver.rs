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

//! Example receiver: joins the first RAVENNA session discovered on the
//! network and periodically reports its stream statistics.

use miette::{IntoDiagnostic, Result};
use ravenna_rs::{
    config::Config,
    discovery::DiscoveryEvent,
    error::RavennaResult,
    node::RavennaNode,
    telemetry,
};
use std::time::Duration;
use tokio::time::interval;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    telemetry::init().into_diagnostic()?;
    let config = Config::load().await.into_diagnostic()?;

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new(
            "ravenna-receiver",
            move |s| async move { run(s, config).await },
        ));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await?;

    Ok(())
}

async fn run(subsys: SubsystemHandle, config: Config) -> RavennaResult<()> {
    let node = RavennaNode::start(&subsys, config)?;
    let mut discovery_events = node.browse_for_sessions()?;

    info!("Waiting for RAVENNA sessions on the network …");

    let receiver = loop {
        tokio::select! {
            event = discovery_events.recv() => match event {
                Ok(DiscoveryEvent::ServiceResolved { description }) => {
                    info!(
                        "Found session '{}' at {}:{}",
                        description.instance_name, description.host_target, description.port
                    );
                    let path = format!("/by-name/{}", description.instance_name);
                    match node
                        .create_receiver(
                            &subsys,
                            description.host_target.trim_end_matches('.'),
                            description.port,
                            &path,
                        )
                        .await
                    {
                        Ok(receiver) => break receiver,
                        Err(e) => warn!("Could not join session: {e}"),
                    }
                }
                Ok(_) => {}
                Err(_) => return Ok(()),
            },
            _ = subsys.on_shutdown_requested() => return Ok(()),
        }
    };

    info!(
        "Receiving '{}' ({:?})",
        receiver.descriptor().session_name,
        receiver.descriptor().audio_format
    );

    let clock = node.clock();
    let mut stats_interval = interval(Duration::from_secs(5));
    let mut events = receiver.subscribe();

    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                if let Ok(now) = clock.now() {
                    // Pull one packet worth of audio for the current moment
                    let frames = receiver.descriptor().framecount.unwrap_or(48) as usize;
                    receiver.read(now, frames).await?;
                }
                let stats = receiver.stats().await?;
                info!(
                    "{} packets received, {} lost, {} late, {} underrun frames",
                    stats.packets_received,
                    stats.packets_lost,
                    stats.late_packets,
                    stats.underrun_frames
                );
            }
            event = events.recv() => if let Ok(event) = event {
                info!("Receiver event: {event:?}");
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    Ok(())
}
