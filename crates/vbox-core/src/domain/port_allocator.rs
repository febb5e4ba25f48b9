//! Host-port allocation for new NAT forwarding rules.
//!
//! [`select_available_port`] is a pure function: given every host port already
//! claimed by some VirtualBox NAT rule and an allocation policy, it returns
//! the lowest port in the configured range that does not conflict.
//!
//! # Conflict scopes (for beginners)
//!
//! A host port is "taken" per *binding address*.  Two rules may use port
//! 20000 if one binds `127.0.0.1` and the other `192.168.1.10`.  Whether we
//! exploit that is the caller's choice:
//!
//! - [`HostIpScope::Any`] – every existing rule blocks its port, whatever it
//!   binds to.  Conservative and the default.
//! - [`HostIpScope::Exact`] – an existing rule blocks its port only when its
//!   host IP conflicts with the new rule's host IP
//!   (see [`host_ip_conflicts`]).
//!
//! # Known limitation
//!
//! The set of used ports is a snapshot taken at allocation time.  Two
//! independent invocations allocating concurrently may both pick the same
//! port; nothing reserves a port between selection and rule creation.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::ValidationError;
use crate::protocol::redirect::host_ip_conflicts;

/// How host IPs are compared when deciding whether a used port conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostIpScope {
    /// Every existing binding conflicts, regardless of its IP.
    #[default]
    Any,
    /// Only bindings whose host IP conflicts with the new rule's host IP.
    Exact,
}

impl HostIpScope {
    pub fn as_str(self) -> &'static str {
        match self {
            HostIpScope::Any => "any",
            HostIpScope::Exact => "exact",
        }
    }
}

impl FromStr for HostIpScope {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "any" => Ok(HostIpScope::Any),
            "exact" => Ok(HostIpScope::Exact),
            _ => Err(ValidationError::InvalidScope(s.to_string())),
        }
    }
}

impl fmt::Display for HostIpScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allocation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocatorOptions {
    /// Lowest candidate port (inclusive).
    pub min_port: u16,
    /// Highest candidate port (inclusive).
    pub max_port: u16,
    /// Host IP the *new* rule will bind.
    pub host_ip: String,
    pub scope: HostIpScope,
    /// Also treat NAT-network forwarding rules as used ports.
    pub include_nat_networks: bool,
}

impl Default for PortAllocatorOptions {
    fn default() -> Self {
        Self {
            min_port: 20000,
            max_port: 40000,
            host_ip: String::new(),
            scope: HostIpScope::Any,
            include_nat_networks: true,
        }
    }
}

/// A host port claimed by an existing rule, with the IP it binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsedPort {
    pub port: u16,
    pub host_ip: String,
}

impl UsedPort {
    pub fn new(port: u16, host_ip: impl Into<String>) -> Self {
        Self {
            port,
            host_ip: host_ip.into(),
        }
    }
}

/// Errors returned by [`select_available_port`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("invalid port range: min {min} > max {max}")]
    InvalidRange { min: u16, max: u16 },

    #[error(
        "no available ports in range {min}-{max}: {in_use} of {range_size} ports are in use \
         by other VirtualBox NAT rules"
    )]
    Exhausted {
        min: u16,
        max: u16,
        in_use: u32,
        range_size: u32,
    },
}

/// Returns the lowest port in `[min_port, max_port]` that no used port
/// conflicts with under `options.scope`.
///
/// Deterministic: identical inputs always yield the same port.
///
/// # Errors
///
/// - [`AllocationError::InvalidRange`] if `min_port > max_port`.
/// - [`AllocationError::Exhausted`] if every port in the range conflicts; the
///   error reports how many of the range's ports are occupied.
///
/// # Examples
///
/// ```rust
/// use vbox_core::{select_available_port, PortAllocatorOptions, UsedPort};
///
/// let used = vec![UsedPort::new(20000, ""), UsedPort::new(20001, "")];
/// let opts = PortAllocatorOptions { min_port: 20000, max_port: 20010, ..Default::default() };
/// assert_eq!(select_available_port(&used, &opts), Ok(20002));
/// ```
pub fn select_available_port(
    used_ports: &[UsedPort],
    options: &PortAllocatorOptions,
) -> Result<u16, AllocationError> {
    if options.min_port > options.max_port {
        return Err(AllocationError::InvalidRange {
            min: options.min_port,
            max: options.max_port,
        });
    }

    let blocked: HashSet<u16> = used_ports
        .iter()
        .filter(|used| match options.scope {
            HostIpScope::Any => true,
            HostIpScope::Exact => host_ip_conflicts(&options.host_ip, &used.host_ip),
        })
        .map(|used| used.port)
        .collect();

    let range = options.min_port..=options.max_port;
    if let Some(port) = range.clone().find(|p| !blocked.contains(p)) {
        debug!(
            port,
            blocked = blocked.len(),
            scope = %options.scope,
            "selected host port"
        );
        return Ok(port);
    }

    let range_size = u32::from(options.max_port) - u32::from(options.min_port) + 1;
    let in_use = range.filter(|p| blocked.contains(p)).count() as u32;
    Err(AllocationError::Exhausted {
        min: options.min_port,
        max: options.max_port,
        in_use,
        range_size,
    })
}

/// Sorted, de-duplicated list of the ports in `used_ports`.
pub fn used_ports_by_port(used_ports: &[UsedPort]) -> Vec<u16> {
    let mut ports: Vec<u16> = used_ports.iter().map(|u| u.port).collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}
