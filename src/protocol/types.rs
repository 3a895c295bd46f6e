//! Port Mapping Types
//!
//! Mirrors the container port-publishing convention: a mapping from
//! `"<port>/<protocol>"` to an ordered list of host bindings.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Transport protocol of a port specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => bail!("unknown protocol: {}", other),
        }
    }
}

/// Identifies one forwarding rule: a port number and its protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(port, Protocol::Tcp)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortSpec {
    type Err = anyhow::Error;

    /// Parses `"8080/tcp"`; a bare `"8080"` defaults to tcp.
    fn from_str(s: &str) -> Result<Self> {
        let (port, protocol) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.parse::<Protocol>()?),
            None => (s, Protocol::Tcp),
        };
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in port spec {:?}", s))?;
        Ok(Self { port, protocol })
    }
}

impl Serialize for PortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Upstream address a port specification forwards to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Binding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

impl Binding {
    pub fn new(host_ip: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            host_port: host_port.into(),
        }
    }

    /// Resolve to a socket address. An empty host IP means loopback.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip = if self.host_ip.is_empty() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.host_ip
                .parse::<IpAddr>()
                .with_context(|| format!("invalid HostIp {:?}", self.host_ip))?
        };
        let port = self
            .host_port
            .parse::<u16>()
            .map_err(|e| anyhow!("invalid HostPort {:?}: {}", self.host_port, e))?;
        Ok(SocketAddr::new(ip, port))
    }
}

impl From<SocketAddr> for Binding {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port().to_string())
    }
}

/// Decoded add/remove instruction delivered over the control channel
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MappingRequest {
    #[serde(default)]
    pub remove: bool,
    #[serde(default, with = "ordered_ports")]
    pub ports: Vec<(PortSpec, Vec<Binding>)>,
}

impl MappingRequest {
    pub fn add(ports: Vec<(PortSpec, Vec<Binding>)>) -> Self {
        Self { remove: false, ports }
    }

    pub fn remove(ports: Vec<(PortSpec, Vec<Binding>)>) -> Self {
        Self { remove: true, ports }
    }

    /// Decode one JSON control message
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("Failed to decode port mapping")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode port mapping")
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// The `ports` object, kept in the order the sender declared it.
mod ordered_ports {
    use super::*;

    type Ports = Vec<(PortSpec, Vec<Binding>)>;

    pub fn serialize<S: Serializer>(ports: &Ports, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(ports.len()))?;
        for (spec, bindings) in ports {
            map.serialize_entry(spec, bindings)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Ports, D::Error> {
        struct PortsVisitor;

        impl<'de> Visitor<'de> for PortsVisitor {
            type Value = Ports;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of \"<port>/<protocol>\" to a list of bindings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Ports, A::Error> {
                let mut ports = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((spec, bindings)) = access.next_entry::<PortSpec, Option<Vec<Binding>>>()? {
                    ports.push((spec, bindings.unwrap_or_default()));
                }
                Ok(ports)
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Ports, E> {
                Ok(Vec::new())
            }
        }

        deserializer.deserialize_any(PortsVisitor)
    }
}
