//! Wire-level encodings shared by protocol adapters.

pub mod redirect;

pub use redirect::{
    decode_adapter_redirect, decode_nat_network_rule, encode_adapter_redirect,
    encode_nat_network_rule, host_ip_conflicts, normalize_host_ip, RedirectParseError,
};
