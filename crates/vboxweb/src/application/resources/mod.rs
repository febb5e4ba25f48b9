//! Declarative resources built on top of [`VBoxClient`](super::VBoxClient).
//!
//! A resource turns a desired configuration into remote state and reports
//! back what it observed.  Two kinds exist:
//!
//! - **`machine`** – a VM cloned from a source machine, kept in a desired
//!   power state.
//! - **`nat_port_forward`** – one NAT forwarding rule on one adapter of one
//!   machine, optionally with an automatically chosen host port.
//!
//! Each kind offers `create`, `read`, `update`, `delete` and `import`.
//! `read` returns `None` when the remote object disappeared out of band so
//! the caller can forget it.  Failures are [`Diagnostic`]s: a short summary
//! naming the step plus a detail string meant for direct display.

use std::fmt;

pub mod machine;
pub mod nat_port_forward;

pub use machine::{MachineConfig, MachineRecord, MachineResource};
pub use nat_port_forward::{NatPortForwardConfig, NatPortForwardRecord, NatPortForwardResource};

/// A user-facing failure: what went wrong, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub summary: String,
    pub detail: String,
}

impl Diagnostic {
    pub fn new(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    /// Uses the error's display text as the detail.
    pub(crate) fn from_error(summary: impl Into<String>, err: &impl fmt::Display) -> Self {
        Self::new(summary, err.to_string())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.summary, self.detail)
    }
}

impl std::error::Error for Diagnostic {}
