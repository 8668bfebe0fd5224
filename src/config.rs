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

use serde::{Deserialize, Serialize};
use std::{net::IpAddr, time::Duration};

pub const DEFAULT_PORT: u16 = 9000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout", with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(default = "default_keepalive_interval", with = "duration_secs")]
    pub keep_alive_interval: Duration,
    #[serde(default = "default_keepalive_timeout", with = "duration_secs")]
    pub keep_alive_timeout: Duration,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default_with_host(String::new())
        }
    }

    fn default_with_host(host: String) -> Self {
        Self {
            host,
            port: default_port(),
            request_timeout: default_request_timeout(),
            keep_alive_interval: default_keepalive_interval(),
            keep_alive_timeout: default_keepalive_timeout(),
        }
    }

    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| std::net::SocketAddr::new(ip, self.port))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::default_with_host("127.0.0.1".to_owned())
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_keepalive_timeout() -> Duration {
    Duration::from_secs(10)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = SessionConfig::new("localhost");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.request_timeout, Duration::from_secs(3));
        assert_eq!(cfg.keep_alive_interval, Duration::from_secs(2));
        assert_eq!(cfg.keep_alive_timeout, Duration::from_secs(10));
    }

    #[test]
    fn json_roundtrip_with_partial_fields() {
        let json = r#"{"host": "10.0.0.5", "port": 9001}"#;
        let cfg: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.host, "10.0.0.5");
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.request_timeout, Duration::from_secs(3));
    }
}
