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

use crate::error::{ConfigError, ConfigResult};
use std::env;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV_VAR: &str = "RAV_LOG_LEVEL";

/// Installs the global tracing subscriber. The log level is taken from the
/// `RAV_LOG_LEVEL` environment variable (CRITICAL is an alias for ERROR,
/// matching the log levels of other RAVENNA tooling), defaulting to INFO.
pub fn init() -> ConfigResult<()> {
    let directive = match env::var(LOG_LEVEL_ENV_VAR) {
        Ok(level) => parse_log_level(&level)?,
        Err(_) => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_target(true)
        .init();

    Ok(())
}

fn parse_log_level(level: &str) -> ConfigResult<&'static str> {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => Ok("trace"),
        "DEBUG" => Ok("debug"),
        "INFO" => Ok("info"),
        "WARN" => Ok("warn"),
        "ERROR" | "CRITICAL" => Ok("error"),
        "OFF" => Ok("off"),
        other => Err(ConfigError::InvalidLogLevel(other.to_owned())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_log_levels_are_accepted() {
        assert_eq!("trace", parse_log_level("trace").expect("level"));
        assert_eq!("error", parse_log_level("CRITICAL").expect("level"));
        assert_eq!("off", parse_log_level("Off").expect("level"));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(parse_log_level("chatty").is_err());
    }
}
