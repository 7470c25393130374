//! The `tcp://<host>:<port>` endpoint grammar.
//!
//! `*` as host means "all interfaces" and is only meaningful for binding.
//! IPv6 literals must be bracketed (`tcp://[::1]:5556`).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::traits::BridgeError;

pub const SCHEME: &str = "tcp://";

/// Host part of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// `*`: every local interface.
    Any,
    /// A host name or IP literal, brackets stripped.
    Name(String),
}

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    raw: String,
    host: Host,
    port: u16,
}

impl Address {
    pub fn parse(s: &str) -> Result<Self, BridgeError> {
        s.parse()
    }

    /// The address exactly as the caller wrote it.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_wildcard(&self) -> bool {
        self.host == Host::Any
    }

    /// Socket addresses a publisher should try to bind, in order.
    pub fn bind_addrs(&self) -> Result<Vec<SocketAddr>, BridgeError> {
        match &self.host {
            Host::Any => Ok(vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))]),
            Host::Name(name) => self.resolve(name).map_err(|reason| BridgeError::BindFailed {
                address: self.raw.clone(),
                reason,
            }),
        }
    }

    /// Socket addresses a subscriber should try to connect to, IPv4 first.
    pub fn connect_addrs(&self) -> Result<Vec<SocketAddr>, BridgeError> {
        let name = match &self.host {
            Host::Any => {
                return Err(BridgeError::address_parse(
                    &self.raw,
                    "wildcard host cannot be a connect target",
                ))
            }
            Host::Name(name) => name,
        };
        if self.port == 0 {
            return Err(BridgeError::address_parse(
                &self.raw,
                "port 0 cannot be a connect target",
            ));
        }

        let mut addrs = self.resolve(name).map_err(|reason| BridgeError::ConnectFailed {
            address: self.raw.clone(),
            reason,
        })?;
        addrs.sort_by_key(|a| a.is_ipv6());
        Ok(addrs)
    }

    fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>, String> {
        let addrs: Vec<SocketAddr> = (name, self.port)
            .to_socket_addrs()
            .map_err(|e| format!("cannot resolve '{}': {}", name, e))?
            .collect();
        if addrs.is_empty() {
            return Err(format!("'{}' resolved to no addresses", name));
        }
        Ok(addrs)
    }
}

impl FromStr for Address {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| BridgeError::address_parse(s, "expected a tcp:// address"))?;

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| BridgeError::address_parse(s, "missing port"))?;

        let port: u16 = port
            .parse()
            .map_err(|_| BridgeError::address_parse(s, format!("invalid port number '{}'", port)))?;

        let host = if host == "*" {
            Host::Any
        } else {
            let bracketed = host.strip_prefix('[').and_then(|h| h.strip_suffix(']'));
            let name = bracketed.unwrap_or(host);
            if name.is_empty() {
                return Err(BridgeError::address_parse(s, "missing host"));
            }
            if bracketed.is_none() && name.contains(':') {
                return Err(BridgeError::address_parse(s, "IPv6 hosts must be bracketed"));
            }
            if name.chars().any(|c| c.is_whitespace() || c == '/' || c == '*') {
                return Err(BridgeError::address_parse(s, format!("invalid host '{}'", name)));
            }
            Host::Name(name.to_string())
        };

        Ok(Self {
            raw: s.to_string(),
            host,
            port,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
