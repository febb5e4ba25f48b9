//! The VirtualBox capability interface.
//!
//! [`VBoxApi`] lists every remote operation the orchestrator needs: session
//! management, machine lookup and lifecycle, power control, progress polling,
//! NAT engine access and NAT-network enumeration.  Each method maps to exactly
//! one remote procedure of the vboxwebsrv SOAP service.
//!
//! # Why a trait? (for beginners)
//!
//! VirtualBox changes its web-service schema between releases (7.1 added a
//! platform argument to `createMachine`, for example).  Each supported release
//! gets its own adapter implementing this trait, and the orchestrator in
//! `application` only ever sees `dyn VBoxApi`.  It never branches on version.
//!
//! Adapters are also responsible for turning version-specific encodings into
//! the shared vocabulary before returning: machine states become
//! [`MachineState`], redirect strings become [`NatRedirect`].
//!
//! No method retries.  Retry and polling policy live in the orchestrator.
//!
//! # Handles
//!
//! Every `*Ref` type below is an opaque managed-object reference issued by
//! the server.  References are only valid inside the web session that
//! produced them; they are never persisted or carried into another session.
//!
//! # Implementations
//!
//! - [`vbox71::Adapter71`] – VirtualBox 7.1 over SOAP.
//! - [`mock::InMemoryVBox`] – a stateful in-memory host used by tests.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use vbox_core::{
    CloneMode, CloneOption, MachineState, NatRedirect, RedirectParseError, SessionType,
};

use crate::infrastructure::soap::SoapTransport;

pub mod mock;
pub mod vbox71;

// ── Opaque handles ────────────────────────────────────────────────────────────

macro_rules! opaque_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The server signals "no object" with an empty reference.
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_ref!(
    /// An authenticated web session (`IVirtualBox` reference).
    SessionRef
);
opaque_ref!(
    /// An `ISession` object used to lock a machine or launch its VM process.
    SessionObjectRef
);
opaque_ref!(
    /// An `IMachine` reference, either the registered machine or the mutable
    /// copy obtained through a locked session.
    MachineRef
);
opaque_ref!(ConsoleRef);
opaque_ref!(
    /// An `IProgress` handle for an in-flight asynchronous operation.
    ProgressRef
);
opaque_ref!(AdapterRef);
opaque_ref!(NatEngineRef);
opaque_ref!(NatNetworkRef);
opaque_ref!(
    /// A medium detached by `unregister` and handed to `deleteConfig`.
    MediumRef
);

/// Kind of lock requested on a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// Allows console access and settings changes on a running machine.
    Shared,
    Write,
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            LockType::Shared => "Shared",
            LockType::Write => "Write",
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Error type for capability calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success HTTP status and no SOAP fault.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The server reported a SOAP fault.  `message` is the fault string, which
    /// carries VirtualBox's own error text.
    #[error("{message}")]
    Fault { message: String },

    /// The response parsed but did not have the expected shape.
    #[error("unexpected response to {method}: {detail}")]
    UnexpectedResponse { method: String, detail: String },

    /// A redirect string returned by the server could not be decoded.
    #[error("failed to parse NAT redirect {raw:?}: {source}")]
    MalformedRedirect {
        raw: String,
        #[source]
        source: RedirectParseError,
    },

    /// No adapter exists for the API version the server reported.
    #[error("unsupported VirtualBox API version {0:?}")]
    UnsupportedVersion(String),
}

impl ApiError {
    pub fn fault(message: impl Into<String>) -> Self {
        ApiError::Fault {
            message: message.into(),
        }
    }
}

// ── Capability interface ──────────────────────────────────────────────────────

/// Version-agnostic contract over the VirtualBox web service.
///
/// Futures returned by these methods are dropped when the caller cancels, so
/// implementations must not rely on running to completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VBoxApi: Send + Sync {
    // Session management
    async fn logon(&self, username: &str, password: &str) -> Result<SessionRef, ApiError>;
    async fn logoff(&self, session: &SessionRef) -> Result<(), ApiError>;
    async fn get_session_object(&self, session: &SessionRef)
        -> Result<SessionObjectRef, ApiError>;

    // Machine lookup and enumeration
    async fn find_machine(&self, session: &SessionRef, name_or_id: &str)
        -> Result<MachineRef, ApiError>;
    async fn get_machines(&self, session: &SessionRef) -> Result<Vec<MachineRef>, ApiError>;

    // Machine creation, registration and cleanup
    async fn create_machine(
        &self,
        session: &SessionRef,
        name: &str,
        os_type_id: &str,
        source: &MachineRef,
    ) -> Result<MachineRef, ApiError>;
    async fn register_machine(&self, session: &SessionRef, machine: &MachineRef)
        -> Result<(), ApiError>;
    /// Unregisters with full cleanup and returns the media that were attached.
    async fn unregister_machine(&self, machine: &MachineRef) -> Result<Vec<MediumRef>, ApiError>;
    async fn delete_config(
        &self,
        machine: &MachineRef,
        media: &[MediumRef],
    ) -> Result<ProgressRef, ApiError>;

    // Machine properties
    async fn get_machine_id(&self, machine: &MachineRef) -> Result<String, ApiError>;
    async fn get_machine_name(&self, machine: &MachineRef) -> Result<String, ApiError>;
    async fn get_machine_state(&self, machine: &MachineRef) -> Result<MachineState, ApiError>;
    async fn get_os_type_id(&self, machine: &MachineRef) -> Result<String, ApiError>;

    // Clone
    async fn clone_to(
        &self,
        source: &MachineRef,
        target: &MachineRef,
        mode: CloneMode,
        options: &[CloneOption],
    ) -> Result<ProgressRef, ApiError>;

    // Power management
    async fn launch_vm_process(
        &self,
        machine: &MachineRef,
        session_object: &SessionObjectRef,
        session_type: SessionType,
    ) -> Result<ProgressRef, ApiError>;
    async fn lock_machine(
        &self,
        machine: &MachineRef,
        session_object: &SessionObjectRef,
        lock_type: LockType,
    ) -> Result<(), ApiError>;
    async fn unlock_session(&self, session_object: &SessionObjectRef) -> Result<(), ApiError>;
    async fn get_console(&self, session_object: &SessionObjectRef) -> Result<ConsoleRef, ApiError>;
    async fn power_down(&self, console: &ConsoleRef) -> Result<ProgressRef, ApiError>;

    // Progress monitoring
    async fn get_progress_completed(&self, progress: &ProgressRef) -> Result<bool, ApiError>;
    async fn get_progress_result_code(&self, progress: &ProgressRef) -> Result<i32, ApiError>;
    /// Human-readable text of the operation's error, or an empty string.
    async fn get_progress_error_text(&self, progress: &ProgressRef) -> Result<String, ApiError>;

    // Network adapters and NAT engine
    async fn get_network_adapter(&self, machine: &MachineRef, slot: u32)
        -> Result<AdapterRef, ApiError>;
    async fn get_nat_engine(&self, adapter: &AdapterRef) -> Result<NatEngineRef, ApiError>;
    async fn get_nat_redirects(&self, engine: &NatEngineRef) -> Result<Vec<NatRedirect>, ApiError>;
    async fn add_nat_redirect(
        &self,
        engine: &NatEngineRef,
        redirect: &NatRedirect,
    ) -> Result<(), ApiError>;
    async fn remove_nat_redirect(&self, engine: &NatEngineRef, name: &str) -> Result<(), ApiError>;

    // NAT networks
    async fn get_nat_networks(&self, session: &SessionRef) -> Result<Vec<NatNetworkRef>, ApiError>;
    async fn get_nat_network_port_forward_rules4(
        &self,
        network: &NatNetworkRef,
    ) -> Result<Vec<NatRedirect>, ApiError>;

    // Mutable machine (requires a lock)
    async fn get_mutable_machine(&self, session_object: &SessionObjectRef)
        -> Result<MachineRef, ApiError>;
    async fn save_settings(&self, machine: &MachineRef) -> Result<(), ApiError>;

    // Version info
    async fn get_api_version(&self, session: &SessionRef) -> Result<String, ApiError>;
}

// ── Version selection ─────────────────────────────────────────────────────────

/// VirtualBox web-service versions with an adapter in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V7_1,
}

impl ApiVersion {
    /// Maps the server's `IVirtualBox::APIVersion` value (`"7_1"`) or a
    /// user-facing spelling (`"7.1"`) to a known version.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::UnsupportedVersion`] for anything else.
    pub fn from_remote(raw: &str) -> Result<Self, ApiError> {
        match raw.trim().replace('.', "_").as_str() {
            "7_1" => Ok(ApiVersion::V7_1),
            _ => Err(ApiError::UnsupportedVersion(raw.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApiVersion::V7_1 => "7.1",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version preference read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelection {
    Fixed(ApiVersion),
    /// Log on once, ask the server, and pick the matching adapter.
    Auto,
}

impl FromStr for VersionSelection {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(VersionSelection::Auto)
        } else {
            ApiVersion::from_remote(s).map(VersionSelection::Fixed)
        }
    }
}

/// Everything needed to reach a vboxwebsrv endpoint.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub url: String,
    pub request_timeout: Duration,
    pub version: VersionSelection,
}

/// Builds the adapter for `version` on top of a SOAP transport.
///
/// # Errors
///
/// Returns [`ApiError::Transport`] if the HTTP client cannot be built.
pub fn new_adapter(
    version: ApiVersion,
    url: &str,
    request_timeout: Duration,
) -> Result<Arc<dyn VBoxApi>, ApiError> {
    let transport = SoapTransport::new(url, request_timeout)?;
    match version {
        ApiVersion::V7_1 => Ok(Arc::new(vbox71::Adapter71::new(transport))),
    }
}

/// Resolves [`VersionSelection::Auto`] by asking the server which API
/// version it speaks.
///
/// Logon and `getAPIVersion` have been stable across releases, so any
/// adapter can run the query.  The detection session is always logged off.
///
/// # Errors
///
/// Propagates logon/version-query failures and returns
/// [`ApiError::UnsupportedVersion`] for unknown versions.
pub async fn detect_api_version(
    detector: &dyn VBoxApi,
    username: &str,
    password: &str,
) -> Result<ApiVersion, ApiError> {
    let session = detector.logon(username, password).await?;
    let reported = detector.get_api_version(&session).await;
    if let Err(e) = detector.logoff(&session).await {
        debug!(error = %e, "version detection session logoff failed");
    }
    let reported = reported?;
    let version = ApiVersion::from_remote(&reported)?;
    info!(reported = %reported, adapter = %version, "detected VirtualBox API version");
    Ok(version)
}

/// Builds the adapter described by `options`, querying the server first when
/// the version is `auto`.
///
/// # Errors
///
/// See [`new_adapter`] and [`detect_api_version`].
pub async fn connect(
    options: &EndpointOptions,
    username: &str,
    password: &str,
) -> Result<Arc<dyn VBoxApi>, ApiError> {
    let version = match options.version {
        VersionSelection::Fixed(v) => v,
        VersionSelection::Auto => {
            let detector = new_adapter(ApiVersion::V7_1, &options.url, options.request_timeout)?;
            detect_api_version(detector.as_ref(), username, password).await?
        }
    };
    debug!(url = %options.url, version = %version, "using VirtualBox adapter");
    new_adapter(version, &options.url, options.request_timeout)
}
