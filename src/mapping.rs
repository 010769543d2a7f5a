//! Mapping table
//! Holds the local host -> remote host correspondences served by the proxy

use crate::error::{ReproError, Result};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Upstream scheme of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl FromStr for Scheme {
    type Err = ReproError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(ReproError::InvalidScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents one proxied route: `local` is served, `scheme://remote` is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    local: String,
    scheme: Scheme,
    remote: String,
    bind_host: String,
    bind_port: u16,
    remote_host: String,
    remote_port: u16,
}

impl Mapping {
    /// Validate and build a mapping
    pub fn new(local: &str, scheme: &str, remote: &str) -> Result<Self> {
        let scheme: Scheme = scheme.parse()?;
        let (bind_host, bind_port) = parse_authority(local, Scheme::Http)?;
        let (remote_host, remote_port) = parse_authority(remote, scheme)?;

        Ok(Self {
            local: local.to_string(),
            scheme,
            remote: remote.to_string(),
            bind_host,
            bind_port,
            remote_host,
            remote_port,
        })
    }

    /// Local `host[:port]` as clients address it
    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Remote `host[:port]` as the upstream expects it
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Host and port the listener for this mapping binds to
    pub fn bind_addr(&self) -> (&str, u16) {
        (&self.bind_host, self.bind_port)
    }

    /// Remote hostname without port (TLS server name)
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Remote port, defaulting to the scheme's port
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Whether an inbound Host value addresses this mapping.
    ///
    /// Hostnames compare ignoring case and a missing port means 80, so
    /// `app.local`, `APP.local:80` and a local configured as `app.local:80`
    /// all address the same mapping.
    pub fn matches_host(&self, host: &str) -> bool {
        split_host_header(host)
            .map_or(false, |(name, port)| self.listens_on(name, port))
    }

    /// Whether both mappings claim the same local address
    pub fn same_local(&self, other: &Mapping) -> bool {
        self.listens_on(&other.bind_host, other.bind_port)
    }

    fn listens_on(&self, name: &str, port: u16) -> bool {
        port == self.bind_port && name.eq_ignore_ascii_case(&self.bind_host)
    }
}

/// Split an inbound `Host` value into hostname and port (80 when absent)
fn split_host_header(host: &str) -> Option<(&str, u16)> {
    if let Some(rest) = host.strip_prefix('[') {
        let (name, tail) = rest.split_once(']')?;
        return match tail {
            "" => Some((name, 80)),
            tail => tail.strip_prefix(':')?.parse().ok().map(|port| (name, port)),
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) => port.parse().ok().map(|port| (name, port)),
        None => Some((host, 80)),
    }
}

/// Split a `host[:port]` string, rejecting anything that is not a bare authority
fn parse_authority(value: &str, scheme: Scheme) -> Result<(String, u16)> {
    if value.is_empty() {
        return Err(ReproError::invalid_host(value, "empty host"));
    }

    if let Some(c) = value
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '@' | '='))
    {
        return Err(ReproError::invalid_host(value, format!("unexpected character '{}'", c)));
    }

    let url = Url::parse(&format!("{}://{}", scheme, value))
        .map_err(|e| ReproError::invalid_host(value, e.to_string()))?;

    let host = match url.host() {
        Some(url::Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => return Err(ReproError::invalid_host(value, "missing hostname")),
    };

    let port = url
        .port_or_known_default()
        .ok_or_else(|| ReproError::invalid_host(value, "missing port"))?;

    Ok((host, port))
}

/// Ordered table of mappings; iteration follows insertion order
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    mappings: Vec<Mapping>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new mapping
    pub fn add_mapping(&mut self, local: &str, scheme: &str, remote: &str) -> Result<&Mapping> {
        let mapping = Mapping::new(local, scheme, remote)?;

        if self.mappings.iter().any(|m| m.same_local(&mapping)) {
            return Err(ReproError::DuplicateLocalHost {
                host: local.to_string(),
            });
        }

        self.mappings.push(mapping);
        Ok(&self.mappings[self.mappings.len() - 1])
    }

    /// Number of registered mappings
    pub fn count_mappings(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Find the mapping serving an inbound Host value
    pub fn find(&self, host: &str) -> Result<&Mapping> {
        self.mappings
            .iter()
            .find(|m| m.matches_host(host))
            .ok_or_else(|| ReproError::NotFound {
                host: host.to_string(),
            })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Mapping> {
        self.mappings.iter()
    }
}

impl<'a> IntoIterator for &'a MappingTable {
    type Item = &'a Mapping;
    type IntoIter = std::slice::Iter<'a, Mapping>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
