//! NAT port-forward use cases and host-port allocation.
//!
//! Rules live on the NAT engine of one network adapter of one machine.
//! Reading only needs the registered (immutable) machine.  Changing the rule
//! set needs a *mutable* machine, which VirtualBox only hands out while the
//! caller holds a session lock:
//!
//! ```text
//! session object ─► lock (shared) ─► mutable machine ─► adapter[slot]
//!       ─► NAT engine ─► add / remove redirect ─► save settings ─► unlock
//! ```
//!
//! A shared lock is used so rules can be changed while the VM is running.
//! The lock is released whenever it was acquired.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vbox_core::domain::nat::validate_adapter_slot;
use vbox_core::{
    select_available_port, used_ports_by_port, AllocationError, NatPortForwardRule, NatRedirect,
    PortAllocatorOptions, UsedPort, MAX_ADAPTER_SLOT,
};

use super::session::{is_absent_rule_fault, Session, VBoxClient};
use super::ClientError;
use crate::infrastructure::vbox_api::{LockType, MachineRef, NatEngineRef, SessionObjectRef};

impl VBoxClient {
    /// Adds `rule` to the NAT engine of the machine's adapter at
    /// `rule.adapter_slot`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Validation`] for a slot outside 0–7 (no remote call is
    /// made), [`ClientError::NotFound`] if the machine does not exist, and
    /// [`ClientError::Remote`] if the adapter is not NAT-attached or the
    /// rule name is already taken.
    pub async fn create_nat_port_forward(
        &self,
        rule: &NatPortForwardRule,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        validate_adapter_slot(rule.adapter_slot)?;

        let session = self.open(cancel).await?;
        let result = session.create_nat_port_forward(rule).await;
        session.close().await;
        result
    }

    /// Looks a rule up by name.
    ///
    /// Returns `Ok(None)` when the machine exists but has no such rule; a
    /// missing machine is [`ClientError::NotFound`].
    pub async fn read_nat_port_forward(
        &self,
        machine_id: &str,
        adapter_slot: u32,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<NatPortForwardRule>, ClientError> {
        validate_adapter_slot(adapter_slot)?;

        let session = self.open(cancel).await?;
        let result = async {
            let machine = session.find_machine(machine_id).await?;
            let redirects = session.immutable_redirects(&machine, adapter_slot).await?;
            Ok::<_, ClientError>(redirects
                .into_iter()
                .find(|r| r.name == name)
                .map(|r| NatPortForwardRule::from_redirect(machine_id, adapter_slot, r)))
        }
        .await;
        session.close().await;
        result
    }

    /// Removes a rule.  Idempotent: a missing machine or an already-absent
    /// rule both count as success.
    pub async fn delete_nat_port_forward(
        &self,
        machine_id: &str,
        adapter_slot: u32,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        validate_adapter_slot(adapter_slot)?;

        let session = self.open(cancel).await?;
        let result = session
            .delete_nat_port_forward(machine_id, adapter_slot, name)
            .await;
        session.close().await;
        result
    }

    /// Picks a free host port for a new rule.
    ///
    /// Every NAT rule on every adapter of every machine (plus NAT-network
    /// rules when `options.include_nat_networks` is set) is collected first,
    /// then [`select_available_port`] chooses the lowest non-conflicting
    /// port.  The choice is not reserved; see the allocator's notes on
    /// concurrent invocations.
    pub async fn allocate_nat_host_port(
        &self,
        options: &PortAllocatorOptions,
        cancel: &CancellationToken,
    ) -> Result<u16, ClientError> {
        let session = self.open(cancel).await?;
        let used = session.collect_used_ports(options.include_nat_networks).await;
        session.close().await;

        let used = used?;
        let port = select_available_port(&used, options).map_err(|e| {
            if matches!(e, AllocationError::Exhausted { .. }) {
                warn!(occupied = ?used_ports_by_port(&used), "NAT host port range exhausted");
            }
            e
        })?;
        info!(
            port,
            min = options.min_port,
            max = options.max_port,
            scope = %options.scope,
            used = used.len(),
            "allocated NAT host port"
        );
        Ok(port)
    }

    /// Every redirect configured on the machine's adapter at `adapter_slot`.
    pub async fn get_all_nat_redirects(
        &self,
        machine_id: &str,
        adapter_slot: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<NatRedirect>, ClientError> {
        validate_adapter_slot(adapter_slot)?;

        let session = self.open(cancel).await?;
        let result = async {
            let machine = session.find_machine(machine_id).await?;
            session.immutable_redirects(&machine, adapter_slot).await
        }
        .await;
        session.close().await;
        result
    }

    /// Snapshot of every host port claimed by some NAT rule.
    pub async fn collect_used_ports(
        &self,
        include_nat_networks: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<UsedPort>, ClientError> {
        let session = self.open(cancel).await?;
        let result = session.collect_used_ports(include_nat_networks).await;
        session.close().await;
        result
    }
}

impl Session<'_> {
    async fn immutable_redirects(&self, machine: &MachineRef, slot: u32) -> Result<Vec<NatRedirect>, ClientError> {
        let adapter = self
            .call(
                &format!("get network adapter slot {slot}"),
                self.api.get_network_adapter(machine, slot),
            )
            .await?;
        let engine = self
            .call("get NAT engine", self.api.get_nat_engine(&adapter))
            .await?;
        self.call("get NAT redirects", self.api.get_nat_redirects(&engine))
            .await
    }

    async fn create_nat_port_forward(&self, rule: &NatPortForwardRule) -> Result<(), ClientError> {
        let machine = self.find_machine(&rule.machine_id).await?;
        let redirect = rule.redirect();

        self.with_mutable_engine(&machine, rule.adapter_slot, |engine| async move {
            self.call(
                &format!("add NAT rule {:?}", redirect.name),
                self.api.add_nat_redirect(&engine, &redirect),
            )
            .await
        })
        .await?;

        info!(
            machine = %rule.machine_id,
            slot = rule.adapter_slot,
            name = %rule.name,
            protocol = %rule.protocol,
            host_port = rule.host_port,
            guest_port = rule.guest_port,
            "NAT rule created"
        );
        Ok(())
    }

    async fn delete_nat_port_forward(&self, machine_id: &str, slot: u32, name: &str) -> Result<(), ClientError> {
        let machine = match self.find_machine(machine_id).await {
            Ok(machine) => machine,
            Err(e) if e.is_not_found() => {
                debug!(machine = machine_id, name, "machine already gone, nothing to delete");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.with_mutable_engine(&machine, slot, |engine| async move {
            match self.race(self.api.remove_nat_redirect(&engine, name)).await? {
                Ok(()) => Ok(()),
                Err(e) if is_absent_rule_fault(&e) => {
                    debug!(name, error = %e, "NAT rule already absent");
                    Ok(())
                }
                Err(source) => Err(ClientError::remote(format!("remove NAT rule {name:?}"), source)),
            }
        })
        .await?;

        info!(machine = machine_id, slot, name, "NAT rule deleted");
        Ok(())
    }

    /// Locks the machine, runs `edit` against the NAT engine of its mutable
    /// adapter at `slot`, saves settings and unlocks.
    async fn with_mutable_engine<F, Fut>(&self, machine: &MachineRef, slot: u32, edit: F) -> Result<(), ClientError>
    where
        F: FnOnce(NatEngineRef) -> Fut,
        Fut: std::future::Future<Output = Result<(), ClientError>>,
    {
        let session_object = self
            .call("get session object", self.api.get_session_object(&self.handle))
            .await?;
        self.call(
            "lock machine",
            self.api
                .lock_machine(machine, &session_object, LockType::Shared),
        )
        .await?;

        let result = self
            .edit_locked_engine(&session_object, slot, edit)
            .await;
        self.unlock(&session_object).await;
        result
    }

    async fn edit_locked_engine<F, Fut>(
        &self,
        session_object: &SessionObjectRef,
        slot: u32,
        edit: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(NatEngineRef) -> Fut,
        Fut: std::future::Future<Output = Result<(), ClientError>>,
    {
        let mutable = self
            .call("get mutable machine", self.api.get_mutable_machine(session_object))
            .await?;
        let adapter = self
            .call(
                &format!("get network adapter slot {slot}"),
                self.api.get_network_adapter(&mutable, slot),
            )
            .await?;
        let engine = self
            .call("get NAT engine", self.api.get_nat_engine(&adapter))
            .await?;

        edit(engine).await?;

        self.call("save settings", self.api.save_settings(&mutable))
            .await
    }

    /// Every redirect on every adapter slot of every machine, plus NAT
    /// network rules when asked.
    ///
    /// Adapters that do not exist or are not NAT-attached are skipped, as are
    /// NAT networks whose rules cannot be read.  Only failing to enumerate
    /// machines is an error.
    pub(crate) async fn collect_used_ports(&self, include_nat_networks: bool) -> Result<Vec<UsedPort>, ClientError> {
        let machines = self
            .call("enumerate machines", self.api.get_machines(&self.handle))
            .await?;

        let mut used = Vec::new();
        for machine in &machines {
            for slot in 0..=MAX_ADAPTER_SLOT {
                let Ok(adapter) = self.race(self.api.get_network_adapter(machine, slot)).await? else {
                    continue;
                };
                let Ok(engine) = self.race(self.api.get_nat_engine(&adapter)).await? else {
                    continue;
                };
                match self.race(self.api.get_nat_redirects(&engine)).await? {
                    Ok(redirects) => used.extend(
                        redirects
                            .into_iter()
                            .map(|r| UsedPort::new(r.host_port, r.host_ip)),
                    ),
                    Err(e) => debug!(machine = %machine, slot, error = %e, "skipping unreadable NAT engine"),
                }
            }
        }

        if include_nat_networks {
            match self.race(self.api.get_nat_networks(&self.handle)).await? {
                Ok(networks) => {
                    for network in &networks {
                        match self
                            .race(self.api.get_nat_network_port_forward_rules4(network))
                            .await?
                        {
                            Ok(rules) => used.extend(
                                rules
                                    .into_iter()
                                    .map(|r| UsedPort::new(r.host_port, r.host_ip)),
                            ),
                            Err(e) => debug!(network = %network, error = %e, "skipping NAT network"),
                        }
                    }
                }
                Err(e) => debug!(error = %e, "could not enumerate NAT networks"),
            }
        }

        debug!(machines = machines.len(), used = used.len(), "collected used host ports");
        Ok(used)
    }
}
