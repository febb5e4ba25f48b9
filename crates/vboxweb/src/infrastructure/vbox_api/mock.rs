//! In-memory VirtualBox host for testing.
//!
//! [`InMemoryVBox`] implements [`VBoxApi`] against a small simulated host so
//! that orchestrator workflows can be exercised end to end without a
//! vboxwebsrv endpoint.  It models the parts of VirtualBox the orchestrator
//! depends on:
//!
//! - Web sessions.  Every handle is owned by the session that issued it and
//!   stops resolving after `logoff`.
//! - Session objects and machine locks.  A lock survives `logoff` of the
//!   owning web session, so a missing `unlock_session` shows up in
//!   [`InMemoryVBox::held_locks`].
//! - Progress objects that complete after a configurable number of polls and
//!   only then apply their effect (clone, power on/off, delete).
//! - NAT engines holding raw 7.1 redirect strings, and NAT networks holding
//!   colon-format rules.  Redirects are decoded through the same codec as the
//!   real adapter.
//!
//! Failures can be injected per method with [`InMemoryVBox::fail`], and every
//! call is recorded by trait method name.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use vbox_core::{
    decode_adapter_redirect, decode_nat_network_rule, encode_adapter_redirect, CloneMode,
    CloneOption, MachineState, NatRedirect, SessionType, MAX_ADAPTER_SLOT,
};

use super::{
    AdapterRef, ApiError, ConsoleRef, LockType, MachineRef, MediumRef, NatEngineRef,
    NatNetworkRef, ProgressRef, SessionObjectRef, SessionRef, VBoxApi,
};

// ── Simulated host state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct AdapterState {
    nat: bool,
    redirects: Vec<String>,
}

#[derive(Debug, Clone)]
struct MachineRecord {
    id: String,
    name: String,
    os_type_id: String,
    state: MachineState,
    registered: bool,
    adapters: Vec<AdapterState>,
    media: Vec<String>,
}

impl MachineRecord {
    fn new(name: &str, os_type_id: &str, state: MachineState) -> Self {
        let mut adapters = vec![AdapterState::default(); (MAX_ADAPTER_SLOT + 1) as usize];
        adapters[0].nat = true;
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            os_type_id: os_type_id.to_string(),
            state,
            registered: true,
            adapters,
            media: vec![format!("{name}.vdi")],
        }
    }
}

#[derive(Debug, Clone)]
enum Effect {
    Clone { source_id: String, target_id: String },
    PowerOn { machine_id: String },
    PowerOff { machine_id: String },
    Delete { machine_id: String },
}

#[derive(Debug, Clone)]
struct ProgressRecord {
    remaining_polls: u32,
    done: bool,
    result_code: i32,
    error_text: String,
    effect: Effect,
}

#[derive(Debug, Clone)]
enum Obj {
    Machine { id: String, mutable: bool },
    SessionObject,
    Console { machine_id: String },
    Adapter { machine_id: String, slot: usize, mutable: bool },
    Engine { machine_id: String, slot: usize, mutable: bool },
    NatNetwork { name: String },
    Medium,
    Progress,
}

#[derive(Debug, Clone)]
struct Handle {
    session: String,
    obj: Obj,
}

#[derive(Debug, Default)]
struct Host {
    credentials: Option<(String, String)>,
    api_version: String,
    machines: Vec<MachineRecord>,
    nat_networks: Vec<(String, Vec<String>)>,
    sessions: HashSet<String>,
    handles: HashMap<String, Handle>,
    progresses: HashMap<String, ProgressRecord>,
    /// Session-object ref → locked machine id.
    locks: HashMap<String, String>,
    next_ref: u64,
    progress_polls: u32,
    failures: HashMap<String, String>,
    next_progress_failure: Option<(i32, String)>,
    calls: Vec<String>,
}

fn fault(message: impl Into<String>) -> ApiError {
    ApiError::fault(message)
}

fn invalid_ref(raw: &str) -> ApiError {
    fault(format!("Invalid managed object reference \"{raw}\" (object not found)"))
}

impl Host {
    fn issue(&mut self, session: &str, obj: Obj) -> String {
        self.next_ref += 1;
        let raw = format!("{:016x}-{:016x}", self.sessions.len(), self.next_ref);
        self.handles.insert(
            raw.clone(),
            Handle {
                session: session.to_string(),
                obj,
            },
        );
        raw
    }

    fn handle(&self, raw: &str) -> Result<Handle, ApiError> {
        self.handles.get(raw).cloned().ok_or_else(|| invalid_ref(raw))
    }

    fn check_session(&self, session: &SessionRef) -> Result<(), ApiError> {
        if self.sessions.contains(session.as_str()) {
            Ok(())
        } else {
            Err(invalid_ref(session.as_str()))
        }
    }

    fn machine_handle(&self, machine: &MachineRef) -> Result<(String, String, bool), ApiError> {
        let handle = self.handle(machine.as_str())?;
        match handle.obj {
            Obj::Machine { id, mutable } => Ok((handle.session, id, mutable)),
            _ => Err(invalid_ref(machine.as_str())),
        }
    }

    fn session_object(&self, sobj: &SessionObjectRef) -> Result<String, ApiError> {
        let handle = self.handle(sobj.as_str())?;
        match handle.obj {
            Obj::SessionObject => Ok(handle.session),
            _ => Err(invalid_ref(sobj.as_str())),
        }
    }

    fn record(&self, id: &str) -> Result<&MachineRecord, ApiError> {
        self.machines
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| fault(format!("Could not find a registered machine with UUID {{{id}}}")))
    }

    fn record_mut(&mut self, id: &str) -> Result<&mut MachineRecord, ApiError> {
        self.machines
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| fault(format!("Could not find a registered machine with UUID {{{id}}}")))
    }

    fn is_locked(&self, machine_id: &str) -> bool {
        self.locks.values().any(|id| id == machine_id)
    }

    fn start_progress(&mut self, session: &str, effect: Effect) -> String {
        let (result_code, error_text) = self.next_progress_failure.take().unwrap_or((0, String::new()));
        let raw = self.issue(session, Obj::Progress);
        self.progresses.insert(
            raw.clone(),
            ProgressRecord {
                remaining_polls: self.progress_polls.max(1),
                done: false,
                result_code,
                error_text,
                effect,
            },
        );
        raw
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Clone { source_id, target_id } => {
                let source = self.machines.iter().find(|m| m.id == source_id).cloned();
                if let (Some(source), Some(target)) =
                    (source, self.machines.iter_mut().find(|m| m.id == target_id))
                {
                    target.adapters = source.adapters;
                    target.state = MachineState::PoweredOff;
                    target.media = vec![format!("{}.vdi", target.name)];
                }
            }
            Effect::PowerOn { machine_id } => {
                if let Some(m) = self.machines.iter_mut().find(|m| m.id == machine_id) {
                    m.state = MachineState::Running;
                }
            }
            Effect::PowerOff { machine_id } => {
                if let Some(m) = self.machines.iter_mut().find(|m| m.id == machine_id) {
                    m.state = MachineState::PoweredOff;
                }
            }
            Effect::Delete { machine_id } => {
                self.machines.retain(|m| m.id != machine_id);
            }
        }
    }

    fn engine(&self, engine: &NatEngineRef) -> Result<(String, usize, bool), ApiError> {
        match self.handle(engine.as_str())?.obj {
            Obj::Engine {
                machine_id,
                slot,
                mutable,
            } => Ok((machine_id, slot, mutable)),
            _ => Err(invalid_ref(engine.as_str())),
        }
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Stateful in-memory [`VBoxApi`] implementation.
pub struct InMemoryVBox {
    host: Mutex<Host>,
}

impl InMemoryVBox {
    /// Creates an empty host reporting API version `7_1`, accepting any
    /// credentials, whose progress objects complete on the first poll.
    pub fn new() -> Self {
        Self {
            host: Mutex::new(Host {
                api_version: "7_1".to_string(),
                progress_polls: 1,
                ..Host::default()
            }),
        }
    }

    /// Only accept `username`/`password` at logon.
    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        self.lock().credentials = Some((username.to_string(), password.to_string()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Host> {
        self.host.lock().expect("lock poisoned")
    }

    /// Records the call and applies any injected failure.
    fn enter(&self, method: &str) -> Result<MutexGuard<'_, Host>, ApiError> {
        let mut host = self.lock();
        host.calls.push(method.to_string());
        if let Some(message) = host.failures.get(method) {
            return Err(fault(message.clone()));
        }
        Ok(host)
    }

    // ── Builders ──────────────────────────────────────────────────────────────

    /// Registers a machine and returns its UUID.  Adapter slot 0 is attached
    /// to NAT; the others are not.
    pub fn add_machine(&self, name: &str, os_type_id: &str, state: MachineState) -> String {
        let record = MachineRecord::new(name, os_type_id, state);
        let id = record.id.clone();
        self.lock().machines.push(record);
        id
    }

    /// Appends a raw 7.1 redirect string to an adapter, bypassing validation.
    pub fn add_redirect(&self, machine_id: &str, slot: u32, raw: &str) {
        let mut host = self.lock();
        if let Some(m) = host.machines.iter_mut().find(|m| m.id == machine_id) {
            if let Some(adapter) = m.adapters.get_mut(slot as usize) {
                adapter.redirects.push(raw.to_string());
            }
        }
    }

    pub fn set_nat_attached(&self, machine_id: &str, slot: u32, attached: bool) {
        let mut host = self.lock();
        if let Some(m) = host.machines.iter_mut().find(|m| m.id == machine_id) {
            if let Some(adapter) = m.adapters.get_mut(slot as usize) {
                adapter.nat = attached;
            }
        }
    }

    /// Adds a NAT network with colon-format forwarding rules.
    pub fn add_nat_network(&self, name: &str, rules: &[&str]) {
        self.lock()
            .nat_networks
            .push((name.to_string(), rules.iter().map(|r| r.to_string()).collect()));
    }

    /// Number of `get_progress_completed` polls before a progress completes.
    pub fn set_progress_polls(&self, polls: u32) {
        self.lock().progress_polls = polls;
    }

    pub fn set_api_version(&self, version: &str) {
        self.lock().api_version = version.to_string();
    }

    /// Makes every call to `method` fail with a fault carrying `message`.
    pub fn fail(&self, method: &str, message: &str) {
        self.lock()
            .failures
            .insert(method.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, method: &str) {
        self.lock().failures.remove(method);
    }

    /// The next progress object created completes with `result_code` and
    /// `error_text` (empty for "no error info"), without applying its effect.
    pub fn fail_next_progress(&self, result_code: i32, error_text: &str) {
        self.lock().next_progress_failure = Some((result_code, error_text.to_string()));
    }

    // ── Inspectors ────────────────────────────────────────────────────────────

    pub fn machine_state(&self, machine_id: &str) -> Option<MachineState> {
        self.lock()
            .machines
            .iter()
            .find(|m| m.id == machine_id)
            .map(|m| m.state)
    }

    /// Whether a machine with this UUID exists, registered or not.
    pub fn machine_exists(&self, machine_id: &str) -> bool {
        self.lock().machines.iter().any(|m| m.id == machine_id)
    }

    pub fn machine_id_by_name(&self, name: &str) -> Option<String> {
        self.lock()
            .machines
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.id.clone())
    }

    pub fn machine_count(&self) -> usize {
        self.lock().machines.len()
    }

    /// Raw redirect strings stored on an adapter.
    pub fn redirects(&self, machine_id: &str, slot: u32) -> Vec<String> {
        self.lock()
            .machines
            .iter()
            .find(|m| m.id == machine_id)
            .and_then(|m| m.adapters.get(slot as usize))
            .map(|a| a.redirects.clone())
            .unwrap_or_default()
    }

    /// Every call made so far, by trait method name.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == method).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Web sessions that have not been logged off.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Machine locks that have not been released with `unlock_session`.
    pub fn held_locks(&self) -> usize {
        self.lock().locks.len()
    }
}

impl Default for InMemoryVBox {
    fn default() -> Self {
        Self::new()
    }
}

// ── VBoxApi implementation ────────────────────────────────────────────────────

#[async_trait]
impl VBoxApi for InMemoryVBox {
    async fn logon(&self, username: &str, password: &str) -> Result<SessionRef, ApiError> {
        let mut host = self.enter("logon")?;
        if let Some((user, pw)) = &host.credentials {
            if user != username || pw != password {
                return Err(fault("Invalid username or password"));
            }
        }
        host.next_ref += 1;
        let raw = format!("{:016x}-0000000000000001", host.next_ref);
        host.sessions.insert(raw.clone());
        Ok(SessionRef::new(raw))
    }

    async fn logoff(&self, session: &SessionRef) -> Result<(), ApiError> {
        let mut host = self.enter("logoff")?;
        if !host.sessions.remove(session.as_str()) {
            return Err(invalid_ref(session.as_str()));
        }
        let owned: Vec<String> = host
            .handles
            .iter()
            .filter(|(_, h)| h.session == session.as_str())
            .map(|(raw, _)| raw.clone())
            .collect();
        for raw in owned {
            host.handles.remove(&raw);
            host.progresses.remove(&raw);
        }
        Ok(())
    }

    async fn get_session_object(&self, session: &SessionRef) -> Result<SessionObjectRef, ApiError> {
        let mut host = self.enter("get_session_object")?;
        host.check_session(session)?;
        Ok(SessionObjectRef::new(host.issue(session.as_str(), Obj::SessionObject)))
    }

    async fn find_machine(&self, session: &SessionRef, name_or_id: &str) -> Result<MachineRef, ApiError> {
        let mut host = self.enter("find_machine")?;
        host.check_session(session)?;
        let id = host
            .machines
            .iter()
            .find(|m| m.registered && (m.id == name_or_id || m.name == name_or_id))
            .map(|m| m.id.clone())
            .ok_or_else(|| {
                fault(format!("Could not find a registered machine named '{name_or_id}'"))
            })?;
        Ok(MachineRef::new(host.issue(
            session.as_str(),
            Obj::Machine { id, mutable: false },
        )))
    }

    async fn get_machines(&self, session: &SessionRef) -> Result<Vec<MachineRef>, ApiError> {
        let mut host = self.enter("get_machines")?;
        host.check_session(session)?;
        let ids: Vec<String> = host
            .machines
            .iter()
            .filter(|m| m.registered)
            .map(|m| m.id.clone())
            .collect();
        Ok(ids
            .into_iter()
            .map(|id| {
                MachineRef::new(host.issue(session.as_str(), Obj::Machine { id, mutable: false }))
            })
            .collect())
    }

    async fn create_machine(
        &self,
        session: &SessionRef,
        name: &str,
        os_type_id: &str,
        source: &MachineRef,
    ) -> Result<MachineRef, ApiError> {
        let mut host = self.enter("create_machine")?;
        host.check_session(session)?;
        host.machine_handle(source)?;
        if host.machines.iter().any(|m| m.name == name) {
            return Err(fault(format!(
                "Machine settings file '{name}/{name}.vbox' already exists"
            )));
        }
        let mut record = MachineRecord::new(name, os_type_id, MachineState::PoweredOff);
        record.registered = false;
        record.media.clear();
        let id = record.id.clone();
        host.machines.push(record);
        Ok(MachineRef::new(host.issue(
            session.as_str(),
            Obj::Machine { id, mutable: false },
        )))
    }

    async fn register_machine(&self, session: &SessionRef, machine: &MachineRef) -> Result<(), ApiError> {
        let mut host = self.enter("register_machine")?;
        host.check_session(session)?;
        let (_, id, _) = host.machine_handle(machine)?;
        let record = host.record_mut(&id)?;
        if record.registered {
            return Err(fault(format!("Machine '{}' is already registered", record.name)));
        }
        record.registered = true;
        Ok(())
    }

    async fn unregister_machine(&self, machine: &MachineRef) -> Result<Vec<MediumRef>, ApiError> {
        let mut host = self.enter("unregister_machine")?;
        let (session, id, _) = host.machine_handle(machine)?;
        if host.is_locked(&id) {
            return Err(fault("Cannot unregister the machine because it is locked by a session"));
        }
        let record = host.record_mut(&id)?;
        if record.state == MachineState::Running {
            return Err(fault(format!(
                "Cannot unregister the machine '{}' while it is running",
                record.name
            )));
        }
        record.registered = false;
        let media = record.media.len();
        Ok((0..media)
            .map(|_| MediumRef::new(host.issue(&session, Obj::Medium)))
            .collect())
    }

    async fn delete_config(&self, machine: &MachineRef, media: &[MediumRef]) -> Result<ProgressRef, ApiError> {
        let mut host = self.enter("delete_config")?;
        let (session, id, _) = host.machine_handle(machine)?;
        for medium in media {
            host.handle(medium.as_str())?;
        }
        if host.record(&id)?.registered {
            return Err(fault("Cannot delete settings of a registered machine"));
        }
        Ok(ProgressRef::new(
            host.start_progress(&session, Effect::Delete { machine_id: id }),
        ))
    }

    async fn get_machine_id(&self, machine: &MachineRef) -> Result<String, ApiError> {
        let host = self.enter("get_machine_id")?;
        let (_, id, _) = host.machine_handle(machine)?;
        Ok(host.record(&id)?.id.clone())
    }

    async fn get_machine_name(&self, machine: &MachineRef) -> Result<String, ApiError> {
        let host = self.enter("get_machine_name")?;
        let (_, id, _) = host.machine_handle(machine)?;
        Ok(host.record(&id)?.name.clone())
    }

    async fn get_machine_state(&self, machine: &MachineRef) -> Result<MachineState, ApiError> {
        let host = self.enter("get_machine_state")?;
        let (_, id, _) = host.machine_handle(machine)?;
        Ok(host.record(&id)?.state)
    }

    async fn get_os_type_id(&self, machine: &MachineRef) -> Result<String, ApiError> {
        let host = self.enter("get_os_type_id")?;
        let (_, id, _) = host.machine_handle(machine)?;
        Ok(host.record(&id)?.os_type_id.clone())
    }

    async fn clone_to(
        &self,
        source: &MachineRef,
        target: &MachineRef,
        _mode: CloneMode,
        _options: &[CloneOption],
    ) -> Result<ProgressRef, ApiError> {
        let mut host = self.enter("clone_to")?;
        let (session, source_id, _) = host.machine_handle(source)?;
        let (_, target_id, _) = host.machine_handle(target)?;
        host.record(&source_id)?;
        host.record(&target_id)?;
        Ok(ProgressRef::new(host.start_progress(
            &session,
            Effect::Clone {
                source_id,
                target_id,
            },
        )))
    }

    async fn launch_vm_process(
        &self,
        machine: &MachineRef,
        session_object: &SessionObjectRef,
        _session_type: SessionType,
    ) -> Result<ProgressRef, ApiError> {
        let mut host = self.enter("launch_vm_process")?;
        let (session, id, _) = host.machine_handle(machine)?;
        host.session_object(session_object)?;
        let record = host.record(&id)?;
        if record.state == MachineState::Running {
            return Err(fault(format!("The machine '{}' is already running", record.name)));
        }
        if host.is_locked(&id) {
            return Err(fault("The machine is already locked by a session"));
        }
        if host.locks.contains_key(session_object.as_str()) {
            return Err(fault("The given session is busy"));
        }
        host.locks
            .insert(session_object.as_str().to_string(), id.clone());
        Ok(ProgressRef::new(
            host.start_progress(&session, Effect::PowerOn { machine_id: id }),
        ))
    }

    async fn lock_machine(
        &self,
        machine: &MachineRef,
        session_object: &SessionObjectRef,
        lock_type: LockType,
    ) -> Result<(), ApiError> {
        let mut host = self.enter("lock_machine")?;
        let (_, id, _) = host.machine_handle(machine)?;
        host.session_object(session_object)?;
        host.record(&id)?;
        if host.locks.contains_key(session_object.as_str()) {
            return Err(fault("The given session is busy"));
        }
        if lock_type == LockType::Write && host.is_locked(&id) {
            return Err(fault("The machine is already locked by a session"));
        }
        host.locks.insert(session_object.as_str().to_string(), id);
        Ok(())
    }

    async fn unlock_session(&self, session_object: &SessionObjectRef) -> Result<(), ApiError> {
        let mut host = self.enter("unlock_session")?;
        host.session_object(session_object)?;
        if host.locks.remove(session_object.as_str()).is_none() {
            return Err(fault("The session is not locked"));
        }
        Ok(())
    }

    async fn get_console(&self, session_object: &SessionObjectRef) -> Result<ConsoleRef, ApiError> {
        let mut host = self.enter("get_console")?;
        let session = host.session_object(session_object)?;
        let machine_id = host
            .locks
            .get(session_object.as_str())
            .cloned()
            .ok_or_else(|| fault("The session is not locked"))?;
        if host.record(&machine_id)?.state != MachineState::Running {
            return Err(fault("The console is not available because the machine is not running"));
        }
        Ok(ConsoleRef::new(host.issue(&session, Obj::Console { machine_id })))
    }

    async fn power_down(&self, console: &ConsoleRef) -> Result<ProgressRef, ApiError> {
        let mut host = self.enter("power_down")?;
        let handle = host.handle(console.as_str())?;
        let Obj::Console { machine_id } = handle.obj else {
            return Err(invalid_ref(console.as_str()));
        };
        let record = host.record(&machine_id)?;
        if record.state != MachineState::Running && record.state != MachineState::Paused {
            return Err(fault(format!(
                "Invalid machine state: {} (must be Running or Paused)",
                record.state
            )));
        }
        Ok(ProgressRef::new(
            host.start_progress(&handle.session, Effect::PowerOff { machine_id }),
        ))
    }

    async fn get_progress_completed(&self, progress: &ProgressRef) -> Result<bool, ApiError> {
        let mut host = self.enter("get_progress_completed")?;
        let record = host
            .progresses
            .get_mut(progress.as_str())
            .ok_or_else(|| invalid_ref(progress.as_str()))?;
        if record.done {
            return Ok(true);
        }
        record.remaining_polls = record.remaining_polls.saturating_sub(1);
        if record.remaining_polls > 0 {
            return Ok(false);
        }
        record.done = true;
        let succeeded = record.result_code == 0;
        let effect = record.effect.clone();
        if succeeded {
            host.apply(effect);
        }
        Ok(true)
    }

    async fn get_progress_result_code(&self, progress: &ProgressRef) -> Result<i32, ApiError> {
        let host = self.enter("get_progress_result_code")?;
        let record = host
            .progresses
            .get(progress.as_str())
            .ok_or_else(|| invalid_ref(progress.as_str()))?;
        if !record.done {
            return Err(fault("The operation is not yet complete"));
        }
        Ok(record.result_code)
    }

    async fn get_progress_error_text(&self, progress: &ProgressRef) -> Result<String, ApiError> {
        let host = self.enter("get_progress_error_text")?;
        host.progresses
            .get(progress.as_str())
            .map(|p| p.error_text.clone())
            .ok_or_else(|| invalid_ref(progress.as_str()))
    }

    async fn get_network_adapter(&self, machine: &MachineRef, slot: u32) -> Result<AdapterRef, ApiError> {
        let mut host = self.enter("get_network_adapter")?;
        let (session, machine_id, mutable) = host.machine_handle(machine)?;
        host.record(&machine_id)?;
        if slot > MAX_ADAPTER_SLOT {
            return Err(fault(format!("Invalid slot number: {slot} (must be in range [0, 7])")));
        }
        Ok(AdapterRef::new(host.issue(
            &session,
            Obj::Adapter {
                machine_id,
                slot: slot as usize,
                mutable,
            },
        )))
    }

    async fn get_nat_engine(&self, adapter: &AdapterRef) -> Result<NatEngineRef, ApiError> {
        let mut host = self.enter("get_nat_engine")?;
        let handle = host.handle(adapter.as_str())?;
        let Obj::Adapter {
            machine_id,
            slot,
            mutable,
        } = handle.obj
        else {
            return Err(invalid_ref(adapter.as_str()));
        };
        if !host.record(&machine_id)?.adapters[slot].nat {
            return Err(fault(format!("Network adapter {slot} is not attached to NAT")));
        }
        Ok(NatEngineRef::new(host.issue(
            &handle.session,
            Obj::Engine {
                machine_id,
                slot,
                mutable,
            },
        )))
    }

    async fn get_nat_redirects(&self, engine: &NatEngineRef) -> Result<Vec<NatRedirect>, ApiError> {
        let host = self.enter("get_nat_redirects")?;
        let (machine_id, slot, _) = host.engine(engine)?;
        host.record(&machine_id)?.adapters[slot]
            .redirects
            .iter()
            .map(|raw| {
                decode_adapter_redirect(raw).map_err(|source| ApiError::MalformedRedirect {
                    raw: raw.clone(),
                    source,
                })
            })
            .collect()
    }

    async fn add_nat_redirect(&self, engine: &NatEngineRef, redirect: &NatRedirect) -> Result<(), ApiError> {
        let mut host = self.enter("add_nat_redirect")?;
        let (machine_id, slot, mutable) = host.engine(engine)?;
        if !mutable {
            return Err(fault("The machine is not mutable (state is not locked)"));
        }
        let adapter = &mut host.record_mut(&machine_id)?.adapters[slot];
        let exists = adapter
            .redirects
            .iter()
            .any(|raw| raw.split(',').next() == Some(redirect.name.as_str()));
        if exists {
            return Err(fault(format!(
                "A NAT rule of this name already exists: {}",
                redirect.name
            )));
        }
        adapter.redirects.push(encode_adapter_redirect(redirect));
        Ok(())
    }

    async fn remove_nat_redirect(&self, engine: &NatEngineRef, name: &str) -> Result<(), ApiError> {
        let mut host = self.enter("remove_nat_redirect")?;
        let (machine_id, slot, mutable) = host.engine(engine)?;
        if !mutable {
            return Err(fault("The machine is not mutable (state is not locked)"));
        }
        let adapter = &mut host.record_mut(&machine_id)?.adapters[slot];
        let before = adapter.redirects.len();
        adapter
            .redirects
            .retain(|raw| raw.split(',').next() != Some(name));
        if adapter.redirects.len() == before {
            return Err(fault("A NAT rule of this name does not exist"));
        }
        Ok(())
    }

    async fn get_nat_networks(&self, session: &SessionRef) -> Result<Vec<NatNetworkRef>, ApiError> {
        let mut host = self.enter("get_nat_networks")?;
        host.check_session(session)?;
        let names: Vec<String> = host.nat_networks.iter().map(|(n, _)| n.clone()).collect();
        Ok(names
            .into_iter()
            .map(|name| NatNetworkRef::new(host.issue(session.as_str(), Obj::NatNetwork { name })))
            .collect())
    }

    async fn get_nat_network_port_forward_rules4(
        &self,
        network: &NatNetworkRef,
    ) -> Result<Vec<NatRedirect>, ApiError> {
        let host = self.enter("get_nat_network_port_forward_rules4")?;
        let Obj::NatNetwork { name } = host.handle(network.as_str())?.obj else {
            return Err(invalid_ref(network.as_str()));
        };
        let rules = host
            .nat_networks
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, rules)| rules.clone())
            .unwrap_or_default();
        rules
            .into_iter()
            .map(|raw| {
                decode_nat_network_rule(&raw)
                    .map_err(|source| ApiError::MalformedRedirect { raw, source })
            })
            .collect()
    }

    async fn get_mutable_machine(&self, session_object: &SessionObjectRef) -> Result<MachineRef, ApiError> {
        let mut host = self.enter("get_mutable_machine")?;
        let session = host.session_object(session_object)?;
        let id = host
            .locks
            .get(session_object.as_str())
            .cloned()
            .ok_or_else(|| fault("The session is not locked"))?;
        Ok(MachineRef::new(
            host.issue(&session, Obj::Machine { id, mutable: true }),
        ))
    }

    async fn save_settings(&self, machine: &MachineRef) -> Result<(), ApiError> {
        let host = self.enter("save_settings")?;
        let (_, id, mutable) = host.machine_handle(machine)?;
        host.record(&id)?;
        if !mutable {
            return Err(fault("The machine is not mutable (state is not locked)"));
        }
        Ok(())
    }

    async fn get_api_version(&self, session: &SessionRef) -> Result<String, ApiError> {
        let host = self.enter("get_api_version")?;
        host.check_session(session)?;
        Ok(host.api_version.clone())
    }
}
