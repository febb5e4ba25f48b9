//! Integration tests for the NAT redirect codec.
//!
//! These tests go through the crate's public re-exports only, the same way
//! protocol adapters in the `vboxweb` crate use the codec.

use vbox_core::{
    decode_adapter_redirect, decode_nat_network_rule, encode_adapter_redirect,
    encode_nat_network_rule, host_ip_conflicts, NatPortForwardRule, NatProtocol, NatRedirect,
    RedirectParseError,
};

#[test]
fn test_adapter_redirect_decodes_every_field() {
    // Arrange
    let raw = "ssh,1,127.0.0.1,2222,10.0.2.15,22";

    // Act
    let r = decode_adapter_redirect(raw).expect("well-formed redirect must decode");

    // Assert
    assert_eq!(r.name, "ssh");
    assert_eq!(r.protocol, NatProtocol::Tcp);
    assert_eq!(r.host_ip, "127.0.0.1");
    assert_eq!(r.host_port, 2222);
    assert_eq!(r.guest_ip, "10.0.2.15");
    assert_eq!(r.guest_port, 22);
}

#[test]
fn test_adapter_redirect_accepts_port_extremes() {
    let low = decode_adapter_redirect("a,0,,0,,0").expect("port 0 is valid on the wire");
    assert_eq!((low.host_port, low.guest_port), (0, 0));

    let high = decode_adapter_redirect("b,1,,65535,,65535").expect("65535 is valid");
    assert_eq!((high.host_port, high.guest_port), (65535, 65535));
}

#[test]
fn test_adapter_redirect_reencodes_to_the_same_string() {
    // The adapter re-reads rules it just wrote, so the encoder must produce
    // exactly what VirtualBox itself reports.
    for raw in ["dns,0,,53,,53", "ssh,1,127.0.0.1,2222,10.0.2.15,22", "web,1,,8080,,80"] {
        let decoded = decode_adapter_redirect(raw).expect("valid");
        assert_eq!(encode_adapter_redirect(&decoded), raw);
    }
}

#[test]
fn test_malformed_adapter_redirects_are_rejected() {
    let cases = [
        ("", RedirectParseError::FieldCount { separator: "comma", got: 1 }),
        (
            "ssh,1,,2222,,22,extra",
            RedirectParseError::FieldCount { separator: "comma", got: 7 },
        ),
        ("ssh,tcp,,2222,,22", RedirectParseError::UnknownProtocol("tcp".to_string())),
        ("ssh,1,,abc,,22", RedirectParseError::InvalidHostPort("abc".to_string())),
        ("ssh,1,,2222,,", RedirectParseError::InvalidGuestPort(String::new())),
    ];

    for (raw, expected) in cases {
        assert_eq!(decode_adapter_redirect(raw), Err(expected), "input {raw:?}");
    }
}

#[test]
fn test_nat_network_rule_decodes_udp() {
    let r = decode_nat_network_rule("dns:UDP::5353:10.0.2.4:53").expect("valid rule");
    assert_eq!(
        r,
        NatRedirect {
            name: "dns".to_string(),
            protocol: NatProtocol::Udp,
            host_ip: String::new(),
            host_port: 5353,
            guest_ip: "10.0.2.4".to_string(),
            guest_port: 53,
        }
    );
    assert_eq!(encode_nat_network_rule(&r), "dns:udp::5353:10.0.2.4:53");
}

#[test]
fn test_nat_network_rule_wrong_separator_is_rejected() {
    let err = decode_nat_network_rule("ssh,1,,2222,,22").unwrap_err();
    assert_eq!(err, RedirectParseError::FieldCount { separator: "colon", got: 1 });
}

#[test]
fn test_decoded_redirect_attaches_to_machine_slot() {
    let r = decode_adapter_redirect("ssh,1,,2222,,22").expect("valid");

    let rule = NatPortForwardRule::from_redirect("vm-1", 2, r);

    assert_eq!(rule.id().to_string(), "vm-1:2:ssh");
    assert_eq!(rule.host_port, 2222);
}

#[test]
fn test_host_ip_conflict_properties() {
    let ips = ["", "0.0.0.0", "127.0.0.1", "192.168.1.1", "10.0.0.5"];

    for x in ips {
        assert!(host_ip_conflicts("", x), "any must conflict with {x:?}");
        assert!(host_ip_conflicts(x, x), "{x:?} must conflict with itself");
        for y in ips {
            assert_eq!(host_ip_conflicts(x, y), host_ip_conflicts(y, x));
        }
    }
    assert!(host_ip_conflicts("0.0.0.0", "127.0.0.1"));
    assert!(!host_ip_conflicts("127.0.0.1", "192.168.1.1"));
}
