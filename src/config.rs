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

use crate::{
    error::{ConfigError, ConfigResult},
    utils::find_network_interface,
};
use clap::Parser;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{info, instrument, warn};

pub const DEFAULT_RTSP_PORT: u16 = 5005;
pub const DEFAULT_RTP_PORT: u16 = 5004;

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// IPv4 address of the network interface to stream on
    #[arg(short, long, env = "RAV_INTERFACE_ADDR")]
    pub interface_addr: Option<Ipv4Addr>,
    /// Path to config file
    #[arg(short, long, env = "RAV_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub instance: InstanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "ravenna-rs".to_owned(),
            instance: InstanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: gethostname().to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtpConfig {
    pub domain: u8,
    /// Nominal announce interval of the network. Parent loss is declared
    /// after announce_receipt_timeout announce intervals without an Announce.
    #[serde(with = "serde_millis")]
    pub announce_interval: Duration,
    pub announce_receipt_timeout: u32,
    /// Time constant of the rate estimation filter.
    #[serde(with = "serde_millis")]
    pub servo_time_constant: Duration,
    /// Number of Sync/Follow_Up pairs required before the servo switches
    /// from raw offsets to the filtered linear fit.
    pub calibration_syncs: u32,
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self {
            domain: 0,
            announce_interval: Duration::from_secs(1),
            announce_receipt_timeout: 3,
            servo_time_constant: Duration::from_secs(10),
            calibration_syncs: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UnderrunPolicy {
    /// Send a packet of silence when the FIFO runs dry.
    #[default]
    EmitSilence,
    /// Skip the packet slot entirely.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FillPolicy {
    /// Fill missing frames with zeros.
    #[default]
    Zero,
    /// Repeat the last received sample value.
    HoldLast,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverConfig {
    /// Playout delay in frames (480 frames = 10 ms at 48 kHz).
    pub delay_frames: u64,
    pub fill_policy: FillPolicy,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            delay_frames: 480,
            fill_policy: FillPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "AppConfig::default")]
    pub app: AppConfig,
    #[serde(default)]
    pub ptp: PtpConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub underrun_policy: UnderrunPolicy,
    #[serde(default = "default_rtsp_port")]
    pub rtsp_port: u16,
    #[serde(default = "default_rtp_port")]
    pub rtp_port: u16,
    pub interface_ip: IpAddr,
}

fn default_rtsp_port() -> u16 {
    DEFAULT_RTSP_PORT
}

fn default_rtp_port() -> u16 {
    DEFAULT_RTP_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: Default::default(),
            ptp: Default::default(),
            receiver: Default::default(),
            underrun_policy: Default::default(),
            rtsp_port: DEFAULT_RTSP_PORT,
            rtp_port: DEFAULT_RTP_PORT,
            interface_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl Config {
    #[instrument]
    pub async fn load() -> ConfigResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let mut config = Config::load_from_file(args.config.as_deref()).await?;

        if let Some(interface_addr) = args.interface_addr {
            config.interface_ip = IpAddr::V4(interface_addr);
        }

        config.validate()?;

        Ok(config)
    }

    #[instrument]
    async fn load_from_file(path: Option<&Path>) -> ConfigResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(&path).await?;
                let config = serde_yaml::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    "./config-dev.yaml"
                } else {
                    "/etc/ravenna-rs/config.yaml"
                };
                match fs::read_to_string(path).await {
                    Ok(it) => {
                        let config = serde_yaml::from_str(&it)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    /// Configuration errors are the only errors that propagate out of node
    /// construction, so interface problems are caught here, up front.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.interface_ip.is_unspecified() {
            return Err(ConfigError::UnspecifiedInterface);
        }
        if !self.interface_ip.is_loopback() {
            find_network_interface(self.interface_ip)?;
        }
        Ok(())
    }

    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.app.name, self.app.instance.name)
    }

    pub fn announce_timeout(&self) -> Duration {
        self.ptp.announce_interval * self.ptp.announce_receipt_timeout
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("default config");
    }

    #[test]
    fn unspecified_interface_is_rejected() {
        let config = Config {
            interface_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnspecifiedInterface)
        ));
    }

    #[test]
    fn announce_timeout_is_three_announce_intervals() {
        let config = Config::default();
        assert_eq!(Duration::from_secs(3), config.announce_timeout());
    }
}
