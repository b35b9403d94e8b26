use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Network address of a cluster node (`ip:port`).
///
/// The empty host is the sentinel written into an instance's host binding when failover detaches
/// it from a dead node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Host {
    pub ip: String,
    pub port: u16,
}

impl Host {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Host { ip: ip.into(), port }
    }

    pub fn empty() -> Self {
        Host::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ip.is_empty() && self.port == 0
    }

    pub fn address(&self) -> String {
        if self.is_empty() { String::new() } else { format!("{}:{}", self.ip, self.port) }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

impl FromStr for Host {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Host::empty());
        }

        let (ip, port) = s.rsplit_once(':').ok_or_else(|| Error::Config(format!("Host '{}' is not of the form ip:port", s)))?;
        let port = port.parse::<u16>().map_err(|e| Error::Config(format!("Host '{}' has an invalid port: {}", s, e)))?;

        if ip.is_empty() {
            return Err(Error::Config(format!("Host '{}' has an empty ip", s)));
        }

        Ok(Host::new(ip, port))
    }
}

impl Serialize for Host {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.address())
    }
}

impl<'de> Deserialize<'de> for Host {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_address() {
        let host: Host = "10.0.0.5:5678".parse().unwrap();
        assert_eq!(host, Host::new("10.0.0.5", 5678));
        assert_eq!(host.to_string(), "10.0.0.5:5678");
    }

    #[test]
    fn empty_string_is_the_sentinel() {
        let host: Host = "".parse().unwrap();
        assert!(host.is_empty());
        assert_eq!(serde_json::to_string(&host).unwrap(), "\"\"");
    }

    #[test]
    fn rejects_missing_port() {
        assert!("10.0.0.5".parse::<Host>().is_err());
        assert!("10.0.0.5:notaport".parse::<Host>().is_err());
    }
}
