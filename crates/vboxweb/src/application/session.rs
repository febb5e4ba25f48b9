//! [`VBoxClient`] and the per-operation web session.
//!
//! Every public orchestrator operation follows the same shape:
//!
//! ```text
//! open session ─► do the work ─► close session (always, even on error)
//! ```
//!
//! A [`Session`] never outlives the operation that opened it, and no handle
//! it produces is carried into another session.
//!
//! # Cancellation (for beginners)
//!
//! Each operation receives a [`CancellationToken`].  Every remote call made
//! through [`Session::call`] is raced against the token with
//! `tokio::select!`; if the token fires first the call's future is dropped
//! and the operation returns [`ClientError::Cancelled`].  Cleanup calls
//! (`logoff`, `unlock_session`) go through [`Session::best_effort`] instead,
//! which is *not* raced, so they still run after cancellation.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ClientError;
use crate::infrastructure::vbox_api::{ApiError, MachineRef, SessionRef, VBoxApi};

/// Entry point for every orchestrator operation.
///
/// Holds the capability implementation and the credentials used to open a
/// fresh web session per operation.  Cheap to clone.
#[derive(Clone)]
pub struct VBoxClient {
    api: Arc<dyn VBoxApi>,
    username: String,
    password: String,
}

impl std::fmt::Debug for VBoxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VBoxClient")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl VBoxClient {
    pub fn new(api: Arc<dyn VBoxApi>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            api,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Logs on and returns a session bound to `cancel`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Cancelled`] if the token has already fired, or
    /// [`ClientError::Remote`] if logon fails.
    pub(crate) async fn open<'a>(&'a self, cancel: &'a CancellationToken) -> Result<Session<'a>, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let logon = self.api.logon(&self.username, &self.password);
        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            r = logon => r.map_err(|e| ClientError::remote("log on to VirtualBox web service", e))?,
        };
        debug!(user = %self.username, "web session opened");
        Ok(Session::new(self.api.as_ref(), handle, cancel))
    }
}

/// An authenticated web session scoped to one orchestrator operation.
pub(crate) struct Session<'a> {
    pub(crate) api: &'a dyn VBoxApi,
    pub(crate) handle: SessionRef,
    pub(crate) cancel: &'a CancellationToken,
}

impl<'a> Session<'a> {
    pub(crate) fn new(api: &'a dyn VBoxApi, handle: SessionRef, cancel: &'a CancellationToken) -> Self {
        Self { api, handle, cancel }
    }

    /// Logs off.  Failures are logged and swallowed.
    pub(crate) async fn close(self) {
        self.best_effort("log off web session", self.api.logoff(&self.handle))
            .await;
        debug!("web session closed");
    }

    /// Runs `fut` unless the token fires first.
    ///
    /// The outer `Result` carries cancellation, the inner one the remote
    /// outcome, so callers can inspect remote failures before wrapping them.
    pub(crate) async fn race<T, F>(&self, fut: F) -> Result<Result<T, ApiError>, ClientError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            r = fut => Ok(r),
        }
    }

    /// Runs a cancellable remote call, wrapping failures with `step`.
    pub(crate) async fn call<T, F>(&self, step: &str, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        self.race(fut)
            .await?
            .map_err(|source| ClientError::remote(step, source))
    }

    /// Attempt, log, continue.  Not raced against cancellation.
    pub(crate) async fn best_effort<T, F>(&self, what: &str, fut: F)
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        if let Err(e) = fut.await {
            warn!(error = %e, "best-effort step failed: {what}");
        }
    }

    /// Resolves a machine by name or UUID.
    ///
    /// An empty reference and faults whose text says the object could not be
    /// found both map to [`ClientError::NotFound`].
    pub(crate) async fn find_machine(&self, name_or_id: &str) -> Result<MachineRef, ClientError> {
        match self.race(self.api.find_machine(&self.handle, name_or_id)).await? {
            Ok(machine) if !machine.is_empty() => Ok(machine),
            Ok(_) => Err(ClientError::NotFound(name_or_id.to_string())),
            Err(e) if is_not_found_fault(&e) => {
                debug!(machine = name_or_id, error = %e, "machine lookup reported not found");
                Err(ClientError::NotFound(name_or_id.to_string()))
            }
            Err(source) => Err(ClientError::remote(format!("find machine {name_or_id:?}"), source)),
        }
    }
}

/// VirtualBox mixes structured and free-text error reporting; lookups that
/// miss are only recognisable by their message.
pub(crate) fn is_not_found_fault(e: &ApiError) -> bool {
    match e {
        ApiError::Fault { message } => {
            let m = message.to_ascii_lowercase();
            m.contains("could not find") || m.contains("object not found")
        }
        _ => false,
    }
}

/// Whether a redirect removal failure just means the rule is already gone.
pub(crate) fn is_absent_rule_fault(e: &ApiError) -> bool {
    match e {
        ApiError::Fault { message } => {
            let m = message.to_ascii_lowercase();
            m.contains("not found") || m.contains("does not exist")
        }
        _ => false,
    }
}
