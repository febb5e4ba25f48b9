//! Application layer: the operation orchestrator and the resource layer.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure rules in `vbox_core`) and the infrastructure (SOAP, HTTP, files).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** remote calls to fulfil a user goal ("clone this VM and
//!   start it", "forward host port 2222 to guest port 22").
//! - **Depend on abstractions**: everything goes through `dyn VBoxApi`, so
//!   the same code drives VirtualBox 7.1, a future adapter, or the in-memory
//!   host used by tests.
//! - **Own the policies** the adapters deliberately leave out: session
//!   scope, progress polling, timeouts, cancellation, and best-effort
//!   cleanup.
//!
//! # Sub-modules
//!
//! - **`session`** – [`VBoxClient`] and the per-operation session scope.
//! - **`progress`** – The polling loop for long-running remote operations.
//! - **`machine_lifecycle`** – Clone, power-state convergence, delete.
//! - **`nat_forwarding`** – NAT rule CRUD and host-port allocation.
//! - **`resources`** – The declarative machine / NAT port-forward resources
//!   built on top of the orchestrator.

use std::time::Duration;

use thiserror::Error;

use vbox_core::{AllocationError, ValidationError};

use crate::infrastructure::vbox_api::ApiError;

pub mod machine_lifecycle;
pub mod nat_forwarding;
pub mod progress;
pub mod resources;
pub mod session;

pub use session::VBoxClient;

/// Error type for every orchestrator operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The machine could not be resolved by name or UUID.
    #[error("machine not found: {0}")]
    NotFound(String),

    /// Input was rejected before any remote call was made.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A remote call failed; `step` says what the orchestrator was doing.
    #[error("failed to {step}: {source}")]
    Remote {
        step: String,
        #[source]
        source: ApiError,
    },

    /// A long-running operation completed with a non-zero result code.
    #[error("operation failed with result code {result_code:#x}{}", describe_text(.text))]
    ProgressFailed {
        result_code: i32,
        text: Option<String>,
    },

    /// The local deadline passed while waiting for a long-running operation.
    #[error("timed out after {}s waiting for operation to complete", whole_secs(.0))]
    Timeout(Duration),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

impl ClientError {
    /// Whether this is the matchable "machine does not exist" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub(crate) fn remote(step: impl Into<String>, source: ApiError) -> Self {
        ClientError::Remote {
            step: step.into(),
            source,
        }
    }
}

fn whole_secs(d: &Duration) -> u64 {
    d.as_secs()
}

fn describe_text(text: &Option<String>) -> String {
    match text {
        Some(t) => format!(": {t}"),
        None => String::new(),
    }
}
