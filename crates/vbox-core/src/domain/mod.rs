//! Domain entities for vboxweb.
//!
//! This module contains pure business logic with no infrastructure dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! The innermost layer of the workspace.  Domain code:
//!
//! - Defines the vocabulary (machine states, NAT rules, clone options) that
//!   the orchestrator and every protocol adapter share.
//! - Has **no** imports from HTTP clients, XML parsers, or the file system.
//! - Validates user input before anything is sent to the remote service.
//!
//! Version-specific encodings (how VirtualBox 7.1 spells a machine state or a
//! redirect) never leak in here: adapters normalise them first.

use thiserror::Error;

/// Machine lifecycle vocabulary: states, clone requests, timeouts.
pub mod machine;
/// NAT port-forwarding rules and their identity.
pub mod nat;
/// Deterministic lowest-free host-port selection.
pub mod port_allocator;

/// Malformed input caught before any remote call is made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field was empty (or whitespace only).
    #[error("{0} is required")]
    Required(&'static str),

    /// Desired state was neither `started` nor `stopped`.
    #[error("invalid desired state: {0}")]
    InvalidDesiredState(String),

    /// Clone mode outside `MachineState | MachineAndChildStates | AllStates`.
    #[error("invalid clone mode: {0}")]
    InvalidCloneMode(String),

    /// Clone option outside the supported set.
    #[error("invalid clone option: {0}")]
    InvalidCloneOption(String),

    /// Session type outside `headless | gui`.
    #[error("invalid session type: {0}")]
    InvalidSessionType(String),

    /// Protocol outside `tcp | udp`.
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    /// Host IP scope outside `any | exact`.
    #[error("invalid host ip scope: {0}")]
    InvalidScope(String),

    /// Adapter slot outside 0–7.
    #[error("adapter slot must be a number between 0 and 7, got: {0}")]
    InvalidAdapterSlot(String),

    /// A port field was outside its permitted range.
    #[error("{field} must be between {min} and {max}, got: {value}")]
    PortOutOfRange {
        field: &'static str,
        min: u32,
        max: u32,
        value: i64,
    },

    /// NAT rule identity was not `machine_id:adapter_slot:name`.
    #[error("expected import ID format: machine_id:adapter_slot:name, got: {0}")]
    InvalidRuleId(String),
}
