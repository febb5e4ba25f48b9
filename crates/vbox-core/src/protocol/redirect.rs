//! Codec for VirtualBox NAT redirect strings.
//!
//! VirtualBox reports forwarding rules as flat strings, in two formats:
//!
//! ```text
//! adapter NAT engine:  name,proto,hostIP,hostPort,guestIP,guestPort   proto: 0=UDP 1=TCP
//! NAT network:         name:proto:hostIP:hostPort:guestIP:guestPort   proto: tcp|udp
//! ```
//!
//! Both decode to the same [`NatRedirect`].  Ports must fit in a `u16`; empty
//! IP fields are kept as empty strings ("any").

use thiserror::Error;

use crate::domain::nat::{NatProtocol, NatRedirect};

const FIELD_COUNT: usize = 6;

/// Errors that can occur while decoding a redirect string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RedirectParseError {
    /// The string did not split into exactly six fields.
    #[error("expected 6 {separator}-separated fields, got {got}")]
    FieldCount { separator: &'static str, got: usize },

    /// The protocol field was not one of the recognised encodings.
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    /// The host port field is not an unsigned 16-bit integer.
    #[error("invalid host port {0:?}")]
    InvalidHostPort(String),

    /// The guest port field is not an unsigned 16-bit integer.
    #[error("invalid guest port {0:?}")]
    InvalidGuestPort(String),
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decodes a per-adapter redirect (`name,proto,hostIP,hostPort,guestIP,guestPort`).
///
/// # Errors
///
/// Returns [`RedirectParseError`] if the field count is not six, the protocol
/// is not `0` or `1`, or either port is not a valid `u16`.
///
/// # Examples
///
/// ```rust
/// use vbox_core::{decode_adapter_redirect, NatProtocol};
///
/// let r = decode_adapter_redirect("dns,0,,53,,53").unwrap();
/// assert_eq!(r.protocol, NatProtocol::Udp);
/// assert_eq!(r.host_port, 53);
/// ```
pub fn decode_adapter_redirect(raw: &str) -> Result<NatRedirect, RedirectParseError> {
    let fields = split_fields(raw, ',', "comma")?;
    let protocol = match fields[1] {
        "0" => NatProtocol::Udp,
        "1" => NatProtocol::Tcp,
        other => return Err(RedirectParseError::UnknownProtocol(other.to_string())),
    };
    build_redirect(&fields, protocol)
}

/// Decodes a NAT-network rule (`name:proto:hostIP:hostPort:guestIP:guestPort`).
///
/// The protocol literal is matched case-insensitively.
///
/// # Errors
///
/// Same conditions as [`decode_adapter_redirect`], with `tcp`/`udp` as the
/// accepted protocol tokens.
pub fn decode_nat_network_rule(raw: &str) -> Result<NatRedirect, RedirectParseError> {
    let fields = split_fields(raw, ':', "colon")?;
    let protocol = if fields[1].eq_ignore_ascii_case("tcp") {
        NatProtocol::Tcp
    } else if fields[1].eq_ignore_ascii_case("udp") {
        NatProtocol::Udp
    } else {
        return Err(RedirectParseError::UnknownProtocol(fields[1].to_string()));
    };
    build_redirect(&fields, protocol)
}

fn split_fields<'a>(
    raw: &'a str,
    separator: char,
    separator_name: &'static str,
) -> Result<Vec<&'a str>, RedirectParseError> {
    let fields: Vec<&str> = raw.split(separator).collect();
    if fields.len() != FIELD_COUNT {
        return Err(RedirectParseError::FieldCount {
            separator: separator_name,
            got: fields.len(),
        });
    }
    Ok(fields)
}

fn build_redirect(fields: &[&str], protocol: NatProtocol) -> Result<NatRedirect, RedirectParseError> {
    let host_port = fields[3]
        .parse::<u16>()
        .map_err(|_| RedirectParseError::InvalidHostPort(fields[3].to_string()))?;
    let guest_port = fields[5]
        .parse::<u16>()
        .map_err(|_| RedirectParseError::InvalidGuestPort(fields[5].to_string()))?;

    Ok(NatRedirect {
        name: fields[0].to_string(),
        protocol,
        host_ip: fields[2].to_string(),
        host_port,
        guest_ip: fields[4].to_string(),
        guest_port,
    })
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Renders a redirect in the per-adapter comma format.
pub fn encode_adapter_redirect(r: &NatRedirect) -> String {
    let proto = match r.protocol {
        NatProtocol::Udp => "0",
        NatProtocol::Tcp => "1",
    };
    format!(
        "{},{},{},{},{},{}",
        r.name, proto, r.host_ip, r.host_port, r.guest_ip, r.guest_port
    )
}

/// Renders a redirect in the NAT-network colon format.
pub fn encode_nat_network_rule(r: &NatRedirect) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}",
        r.name,
        r.protocol.as_str(),
        r.host_ip,
        r.host_port,
        r.guest_ip,
        r.guest_port
    )
}

// ── Host IP equivalence ───────────────────────────────────────────────────────

/// Canonical form of a host IP: trimmed, with `""` and `"0.0.0.0"` both
/// mapped to `""` ("any interface").
pub fn normalize_host_ip(ip: &str) -> &str {
    let ip = ip.trim();
    if ip == "0.0.0.0" {
        ""
    } else {
        ip
    }
}

/// Whether two host bindings collide on the same port.
///
/// "Any" collides with everything; otherwise the normalised strings must be
/// byte-equal.  Symmetric.
pub fn host_ip_conflicts(a: &str, b: &str) -> bool {
    let a = normalize_host_ip(a);
    let b = normalize_host_ip(b);
    a.is_empty() || b.is_empty() || a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_adapter_redirect_udp_with_empty_ips() {
        let r = decode_adapter_redirect("dns,0,,53,,53").expect("valid");
        assert_eq!(
            r,
            NatRedirect {
                name: "dns".to_string(),
                protocol: NatProtocol::Udp,
                host_ip: String::new(),
                host_port: 53,
                guest_ip: String::new(),
                guest_port: 53,
            }
        );
    }

    #[test]
    fn test_decode_adapter_redirect_rejects_protocol_two() {
        let err = decode_adapter_redirect("ssh,2,127.0.0.1,2222,10.0.2.15,22").unwrap_err();
        assert_eq!(err, RedirectParseError::UnknownProtocol("2".to_string()));
    }

    #[test]
    fn test_decode_adapter_redirect_rejects_wrong_field_count() {
        let err = decode_adapter_redirect("ssh,1,,2222,22").unwrap_err();
        assert_eq!(
            err,
            RedirectParseError::FieldCount {
                separator: "comma",
                got: 5
            }
        );
    }

    #[test]
    fn test_decode_adapter_redirect_rejects_out_of_range_ports() {
        assert_eq!(
            decode_adapter_redirect("web,1,,65536,,80").unwrap_err(),
            RedirectParseError::InvalidHostPort("65536".to_string())
        );
        assert_eq!(
            decode_adapter_redirect("web,1,,8080,,-1").unwrap_err(),
            RedirectParseError::InvalidGuestPort("-1".to_string())
        );
    }

    #[test]
    fn test_decode_nat_network_rule_protocol_case_insensitive() {
        for token in ["TCP", "tcp", "Tcp"] {
            let raw = format!("ssh:{token}:127.0.0.1:2222:10.0.2.15:22");
            let r = decode_nat_network_rule(&raw).expect("valid");
            assert_eq!(r.protocol, NatProtocol::Tcp);
            assert_eq!(r.host_ip, "127.0.0.1");
            assert_eq!(r.guest_ip, "10.0.2.15");
        }
    }

    #[test]
    fn test_decode_nat_network_rule_rejects_unknown_protocol() {
        let err = decode_nat_network_rule("ssh:sctp::2222::22").unwrap_err();
        assert_eq!(err, RedirectParseError::UnknownProtocol("sctp".to_string()));
    }

    #[test]
    fn test_encode_adapter_redirect_matches_wire_format() {
        let r = decode_adapter_redirect("ssh,1,127.0.0.1,2222,,22").unwrap();
        assert_eq!(encode_adapter_redirect(&r), "ssh,1,127.0.0.1,2222,,22");
        assert_eq!(encode_nat_network_rule(&r), "ssh:tcp:127.0.0.1:2222::22");
    }

    #[test]
    fn test_normalize_host_ip() {
        assert_eq!(normalize_host_ip(""), "");
        assert_eq!(normalize_host_ip("  0.0.0.0 "), "");
        assert_eq!(normalize_host_ip(" 127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_host_ip_conflicts_table() {
        assert!(host_ip_conflicts("", "10.0.0.1"));
        assert!(host_ip_conflicts("0.0.0.0", "127.0.0.1"));
        assert!(host_ip_conflicts("127.0.0.1", "127.0.0.1"));
        assert!(!host_ip_conflicts("127.0.0.1", "192.168.1.1"));
    }

    #[test]
    fn test_host_ip_conflicts_is_symmetric() {
        let ips = ["", "0.0.0.0", "127.0.0.1", "192.168.1.1", " 127.0.0.1 "];
        for a in ips {
            for b in ips {
                assert_eq!(host_ip_conflicts(a, b), host_ip_conflicts(b, a), "{a:?} vs {b:?}");
            }
        }
    }
}
