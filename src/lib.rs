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

pub mod buffer;
pub mod config;
pub mod discovery;
pub mod error;
pub mod formats;
pub mod node;
pub mod ptp;
pub mod receiver;
pub mod rtp;
pub mod rtsp;
pub mod sdp;
pub mod sender;
pub mod socket;
pub mod telemetry;
pub mod utils;

pub use error::{RavennaError, RavennaResult};
pub use node::RavennaNode;
