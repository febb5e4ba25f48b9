//! Machine lifecycle use cases: clone-and-converge, power-state
//! convergence, inspection and deletion.
//!
//! # Power convergence
//!
//! Only two targets exist, and each has a fast path:
//!
//! ```text
//! target = started:  Running     → no-op
//!                    otherwise   → launch VM process, wait, unlock
//! target = stopped:  PoweredOff  → no-op
//!                    otherwise   → lock (shared), console, power down, wait, unlock
//! ```
//!
//! After a transition the state is read again and *that* is returned.  The
//! requested target is never assumed to have been reached.
//!
//! The session lock taken for a transition is released whenever it was
//! acquired, whatever the outcome of the locked section.
//!
//! # Partial failures
//!
//! Clone is not transactional.  If a step after `create_machine` fails the
//! new machine shell (and any cloned disk) is left behind; a later
//! [`VBoxClient::delete_by_id`] cleans it up.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vbox_core::domain::machine::effective_timeout;
use vbox_core::{CloneRequest, DesiredState, MachineInfo, MachineState, SessionType};

use super::session::{Session, VBoxClient};
use super::ClientError;
use crate::infrastructure::vbox_api::{LockType, MachineRef, SessionObjectRef};

impl VBoxClient {
    /// Clones `request.source` into a new machine and converges it to
    /// `request.desired_state`.
    ///
    /// Returns the new machine's UUID and its observed state.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Validation`] for an empty name or source (no remote
    ///   call is made).
    /// - [`ClientError::NotFound`] if the source cannot be resolved.
    /// - Any remote, progress, timeout or cancellation failure along the way.
    pub async fn clone_and_converge(
        &self,
        request: &CloneRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, MachineState), ClientError> {
        request.validate()?;

        let session = self.open(cancel).await?;
        let result = session.clone_and_converge(request).await;
        session.close().await;
        result
    }

    /// Reads id, name and state of the machine with UUID (or name) `id`.
    pub async fn get_machine_info_by_id(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<MachineInfo, ClientError> {
        let session = self.open(cancel).await?;
        let result = session.machine_info(id).await;
        session.close().await;
        result
    }

    pub async fn get_state_by_id(&self, id: &str, cancel: &CancellationToken) -> Result<MachineState, ClientError> {
        let session = self.open(cancel).await?;
        let result = async {
            let machine = session.find_machine(id).await?;
            session
                .call("read machine state", session.api.get_machine_state(&machine))
                .await
        }
        .await;
        session.close().await;
        result
    }

    /// Brings the machine to `desired` and returns the state observed
    /// afterwards.  A zero `timeout` means the default.
    pub async fn converge_state_by_id(
        &self,
        id: &str,
        desired: DesiredState,
        session_type: SessionType,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<MachineState, ClientError> {
        let timeout = effective_timeout(timeout);
        let session = self.open(cancel).await?;
        let result = async {
            let machine = session.find_machine(id).await?;
            session
                .converge(&machine, desired, session_type, timeout)
                .await
        }
        .await;
        session.close().await;
        result
    }

    /// Powers the machine off (best effort), unregisters it and deletes its
    /// settings and media.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotFound`] if the machine does not exist; failures of
    /// the power-off step are logged and ignored.
    pub async fn delete_by_id(&self, id: &str, timeout: Duration, cancel: &CancellationToken) -> Result<(), ClientError> {
        let timeout = effective_timeout(timeout);
        let session = self.open(cancel).await?;
        let result = session.delete(id, timeout).await;
        session.close().await;
        result
    }
}

impl Session<'_> {
    async fn clone_and_converge(&self, request: &CloneRequest) -> Result<(String, MachineState), ClientError> {
        let timeout = request.effective_timeout();

        let source = self.find_machine(&request.source).await?;
        let os_type_id = self
            .call("read source OS type", self.api.get_os_type_id(&source))
            .await?;
        let target = self
            .call(
                "create machine",
                self.api
                    .create_machine(&self.handle, &request.name, &os_type_id, &source),
            )
            .await?;

        let progress = self
            .call(
                "start clone",
                self.api
                    .clone_to(&source, &target, request.mode, &request.options),
            )
            .await?;
        info!(
            name = %request.name,
            source = %request.source,
            mode = %request.mode,
            "cloning machine"
        );
        self.wait_progress(&progress, timeout).await?;

        self.call("register machine", self.api.register_machine(&self.handle, &target))
            .await?;
        let id = self
            .call("read machine id", self.api.get_machine_id(&target))
            .await?;
        info!(name = %request.name, id = %id, "clone registered");

        let state = self
            .converge(&target, request.desired_state, request.session_type, timeout)
            .await?;
        Ok((id, state))
    }

    async fn machine_info(&self, id: &str) -> Result<MachineInfo, ClientError> {
        let machine = self.find_machine(id).await?;
        let uuid = self
            .call("read machine id", self.api.get_machine_id(&machine))
            .await?;
        let name = self
            .call("read machine name", self.api.get_machine_name(&machine))
            .await?;
        let state = self
            .call("read machine state", self.api.get_machine_state(&machine))
            .await?;
        Ok(MachineInfo {
            id: uuid,
            name,
            state,
        })
    }

    pub(crate) async fn converge(
        &self,
        machine: &MachineRef,
        desired: DesiredState,
        session_type: SessionType,
        timeout: Duration,
    ) -> Result<MachineState, ClientError> {
        let current = self
            .call("read machine state", self.api.get_machine_state(machine))
            .await?;
        if current.satisfies(desired) {
            debug!(state = %current, desired = %desired, "machine already in desired state");
            return Ok(current);
        }

        info!(from = %current, desired = %desired, "converging machine state");
        match desired {
            DesiredState::Started => self.ensure_running(machine, session_type, timeout).await?,
            DesiredState::Stopped => self.ensure_powered_off(machine, timeout).await?,
        }

        let observed = self
            .call("read machine state", self.api.get_machine_state(machine))
            .await?;
        info!(state = %observed, "machine state after transition");
        Ok(observed)
    }

    async fn ensure_running(
        &self,
        machine: &MachineRef,
        session_type: SessionType,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let session_object = self
            .call("get session object", self.api.get_session_object(&self.handle))
            .await?;
        let progress = self
            .call(
                "launch VM process",
                self.api
                    .launch_vm_process(machine, &session_object, session_type),
            )
            .await?;

        let waited = self.wait_progress(&progress, timeout).await;
        self.unlock(&session_object).await;
        waited
    }

    async fn ensure_powered_off(&self, machine: &MachineRef, timeout: Duration) -> Result<(), ClientError> {
        let session_object = self
            .call("get session object", self.api.get_session_object(&self.handle))
            .await?;
        // A shared lock is enough for console access.
        self.call(
            "lock machine",
            self.api
                .lock_machine(machine, &session_object, LockType::Shared),
        )
        .await?;

        let result = self.power_down_locked(&session_object, timeout).await;
        self.unlock(&session_object).await;
        result
    }

    async fn power_down_locked(&self, session_object: &SessionObjectRef, timeout: Duration) -> Result<(), ClientError> {
        let console = self
            .call("get console", self.api.get_console(session_object))
            .await?;
        let progress = self
            .call("power down machine", self.api.power_down(&console))
            .await?;
        self.wait_progress(&progress, timeout).await
    }

    pub(crate) async fn unlock(&self, session_object: &SessionObjectRef) {
        self.best_effort("unlock session", self.api.unlock_session(session_object))
            .await;
    }

    async fn delete(&self, id: &str, timeout: Duration) -> Result<(), ClientError> {
        let machine = self.find_machine(id).await?;

        let already_off = matches!(
            self.race(self.api.get_machine_state(&machine)).await?,
            Ok(MachineState::PoweredOff)
        );
        if !already_off {
            if let Err(e) = self.ensure_powered_off(&machine, timeout).await {
                if matches!(e, ClientError::Cancelled) {
                    return Err(e);
                }
                warn!(machine = id, error = %e, "best-effort power-off before delete failed");
            }
        }

        let media = self
            .call("unregister machine", self.api.unregister_machine(&machine))
            .await?;
        let progress = self
            .call("delete machine files", self.api.delete_config(&machine, &media))
            .await?;
        self.wait_progress(&progress, timeout).await?;
        info!(machine = id, media = media.len(), "machine deleted");
        Ok(())
    }
}
