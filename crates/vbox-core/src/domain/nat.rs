//! NAT port-forwarding rules.
//!
//! A rule lives on one network adapter slot (0–7) of one machine and is
//! identified by its name within that adapter's NAT engine.  The triple
//! `(machine, slot, name)` is the rule's identity, rendered as
//! `machine_id:adapter_slot:name` by [`RuleId`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Highest adapter slot index (VirtualBox exposes eight NICs, `nic1`–`nic8`).
pub const MAX_ADAPTER_SLOT: u32 = 7;

/// Transport protocol of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatProtocol {
    Tcp,
    Udp,
}

impl NatProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            NatProtocol::Tcp => "tcp",
            NatProtocol::Udp => "udp",
        }
    }
}

impl FromStr for NatProtocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("tcp") {
            Ok(NatProtocol::Tcp)
        } else if s.trim().eq_ignore_ascii_case("udp") {
            Ok(NatProtocol::Udp)
        } else {
            Err(ValidationError::InvalidProtocol(s.to_string()))
        }
    }
}

impl fmt::Display for NatProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One forwarding rule in the version-neutral shape every adapter returns.
///
/// An empty `host_ip` means "any interface"; an empty `guest_ip` lets the
/// NAT engine pick the guest address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRedirect {
    pub name: String,
    pub protocol: NatProtocol,
    pub host_ip: String,
    pub host_port: u16,
    pub guest_ip: String,
    pub guest_port: u16,
}

/// A forwarding rule bound to a specific machine and adapter slot.
///
/// `host_port == 0` is the "to be allocated" sentinel before creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatPortForwardRule {
    pub machine_id: String,
    pub adapter_slot: u32,
    pub name: String,
    pub protocol: NatProtocol,
    pub host_ip: String,
    pub host_port: u16,
    pub guest_ip: String,
    pub guest_port: u16,
}

impl NatPortForwardRule {
    /// Attaches a decoded redirect to its owning machine and slot.
    pub fn from_redirect(machine_id: impl Into<String>, adapter_slot: u32, r: NatRedirect) -> Self {
        Self {
            machine_id: machine_id.into(),
            adapter_slot,
            name: r.name,
            protocol: r.protocol,
            host_ip: r.host_ip,
            host_port: r.host_port,
            guest_ip: r.guest_ip,
            guest_port: r.guest_port,
        }
    }

    /// The adapter-level part of the rule.
    pub fn redirect(&self) -> NatRedirect {
        NatRedirect {
            name: self.name.clone(),
            protocol: self.protocol,
            host_ip: self.host_ip.clone(),
            host_port: self.host_port,
            guest_ip: self.guest_ip.clone(),
            guest_port: self.guest_port,
        }
    }

    pub fn id(&self) -> RuleId {
        RuleId {
            machine_id: self.machine_id.clone(),
            adapter_slot: self.adapter_slot,
            name: self.name.clone(),
        }
    }
}

/// Rejects slots outside 0–7 before any remote call.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidAdapterSlot`].
pub fn validate_adapter_slot(slot: u32) -> Result<(), ValidationError> {
    if slot > MAX_ADAPTER_SLOT {
        return Err(ValidationError::InvalidAdapterSlot(slot.to_string()));
    }
    Ok(())
}

/// Identity of a forwarding rule: `machine_id:adapter_slot:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleId {
    pub machine_id: String,
    pub adapter_slot: u32,
    pub name: String,
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.machine_id, self.adapter_slot, self.name)
    }
}

impl FromStr for RuleId {
    type Err = ValidationError;

    /// Accepts exactly three colon-separated parts with a slot in 0–7.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [machine_id, slot, name] = parts.as_slice() else {
            return Err(ValidationError::InvalidRuleId(s.to_string()));
        };
        if machine_id.is_empty() || name.is_empty() {
            return Err(ValidationError::InvalidRuleId(s.to_string()));
        }

        let adapter_slot = slot
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n <= MAX_ADAPTER_SLOT)
            .ok_or_else(|| ValidationError::InvalidAdapterSlot((*slot).to_string()))?;

        Ok(RuleId {
            machine_id: (*machine_id).to_string(),
            adapter_slot,
            name: (*name).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> NatPortForwardRule {
        NatPortForwardRule {
            machine_id: "9f1c0c1e-2d4b-4c4e-8a55-0d3c6f1e2a10".to_string(),
            adapter_slot: 0,
            name: "ssh".to_string(),
            protocol: NatProtocol::Tcp,
            host_ip: "127.0.0.1".to_string(),
            host_port: 2222,
            guest_ip: String::new(),
            guest_port: 22,
        }
    }

    #[test]
    fn test_protocol_parse_is_case_insensitive() {
        assert_eq!("TCP".parse::<NatProtocol>(), Ok(NatProtocol::Tcp));
        assert_eq!("Udp".parse::<NatProtocol>(), Ok(NatProtocol::Udp));
        assert!("icmp".parse::<NatProtocol>().is_err());
    }

    #[test]
    fn test_rule_id_formats_as_colon_triple() {
        let id = sample_rule().id();
        assert_eq!(id.to_string(), "9f1c0c1e-2d4b-4c4e-8a55-0d3c6f1e2a10:0:ssh");
    }

    #[test]
    fn test_rule_id_parses_valid_triple() {
        let id: RuleId = "vm-uuid:3:web".parse().expect("valid id");
        assert_eq!(id.machine_id, "vm-uuid");
        assert_eq!(id.adapter_slot, 3);
        assert_eq!(id.name, "web");
    }

    #[test]
    fn test_rule_id_rejects_wrong_shapes() {
        for bad in ["vm-uuid:0", "vm-uuid:0:web:extra", "", "::", "vm:0:"] {
            assert_eq!(
                bad.parse::<RuleId>(),
                Err(ValidationError::InvalidRuleId(bad.to_string())),
                "{bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_rule_id_rejects_out_of_range_slot() {
        assert_eq!(
            "vm:8:web".parse::<RuleId>(),
            Err(ValidationError::InvalidAdapterSlot("8".to_string()))
        );
        assert_eq!(
            "vm:x:web".parse::<RuleId>(),
            Err(ValidationError::InvalidAdapterSlot("x".to_string()))
        );
    }

    #[test]
    fn test_redirect_conversion_keeps_fields() {
        let rule = sample_rule();
        let back = NatPortForwardRule::from_redirect(&rule.machine_id, 0, rule.redirect());
        assert_eq!(back, rule);
    }

    #[test]
    fn test_validate_adapter_slot_bounds() {
        assert!(validate_adapter_slot(0).is_ok());
        assert!(validate_adapter_slot(7).is_ok());
        assert!(validate_adapter_slot(8).is_err());
    }
}
