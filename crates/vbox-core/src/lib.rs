//! # vbox-core
//!
//! Shared library for vboxweb containing the domain vocabulary, the NAT
//! redirect codec, and the host-port allocator.
//!
//! This crate has no I/O: it never talks to the VirtualBox web service,
//! the file system, or the network.  Everything here can be unit-tested in
//! isolation.
//!
//! # Architecture overview (for beginners)
//!
//! vboxweb manages VirtualBox virtual machines declaratively: you describe
//! the machine (or NAT rule) you want, and the orchestrator in the `vboxweb`
//! crate issues the remote calls needed to make reality match.
//!
//! This crate (`vbox-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – The version-neutral vocabulary every layer agrees on:
//!   machine states, clone modes, NAT rules, and the port allocator that
//!   picks a free host port for a new forwarding rule.
//!
//! - **`protocol`** – How NAT redirects look *on the wire*.  VirtualBox
//!   reports redirects as compact strings (`name,1,,2222,,22`); the codec
//!   turns them into typed [`NatRedirect`] values and back.

pub mod domain;
pub mod protocol;

pub use domain::machine::{
    parse_duration, parse_wait_timeout, CloneMode, CloneOption, CloneRequest, DesiredState,
    MachineInfo, MachineState, SessionType, DEFAULT_WAIT_TIMEOUT,
};
pub use domain::nat::{NatPortForwardRule, NatProtocol, NatRedirect, RuleId, MAX_ADAPTER_SLOT};
pub use domain::port_allocator::{
    select_available_port, used_ports_by_port, AllocationError, HostIpScope,
    PortAllocatorOptions, UsedPort,
};
pub use domain::ValidationError;
pub use protocol::redirect::{
    decode_adapter_redirect, decode_nat_network_rule, encode_adapter_redirect,
    encode_nat_network_rule, host_ip_conflicts, normalize_host_ip, RedirectParseError,
};
