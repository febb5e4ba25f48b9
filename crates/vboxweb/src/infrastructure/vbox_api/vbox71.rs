//! [`VBoxApi`] adapter for the VirtualBox 7.1 web service.
//!
//! Each trait method issues exactly one SOAP request (machine creation issues
//! two extra lookups to resolve the source platform).  Version-specific
//! encodings are normalised here:
//!
//! - `MachineState` strings are folded into [`MachineState`] by
//!   [`normalize_state_71`].
//! - Adapter redirects (`name,0|1,hostIP,hostPort,guestIP,guestPort`) and
//!   NAT-network rules (`name:tcp|udp:...`) are decoded into [`NatRedirect`].

use async_trait::async_trait;
use tracing::debug;

use vbox_core::{
    decode_adapter_redirect, decode_nat_network_rule, CloneMode, CloneOption, MachineState,
    NatProtocol, NatRedirect, RedirectParseError, SessionType,
};

use super::{
    AdapterRef, ApiError, ConsoleRef, LockType, MachineRef, MediumRef, NatEngineRef,
    NatNetworkRef, ProgressRef, SessionObjectRef, SessionRef, VBoxApi,
};
use crate::infrastructure::soap::{SoapCall, SoapTransport};

/// Architecture used when the source machine does not report one.
const FALLBACK_ARCHITECTURE: &str = "x86";

/// Maps a 7.1 `MachineState` value to the shared vocabulary.
///
/// Transient states (`Starting`, `Saving`, `Restoring`, ...) map to
/// [`MachineState::Null`].
pub fn normalize_state_71(raw: &str) -> MachineState {
    match raw {
        "PoweredOff" | "Aborted" | "Teleported" => MachineState::PoweredOff,
        "Running" | "Teleporting" | "LiveSnapshotting" | "OnlineSnapshotting" => {
            MachineState::Running
        }
        "Paused" | "Stuck" => MachineState::Paused,
        "Saved" | "AbortedSaved" => MachineState::Saved,
        _ => MachineState::Null,
    }
}

/// VirtualBox 7.1 adapter.  Generic over the transport so tests can script
/// SOAP responses.
pub struct Adapter71<T: SoapCall = SoapTransport> {
    soap: T,
}

impl<T: SoapCall> Adapter71<T> {
    pub fn new(soap: T) -> Self {
        Self { soap }
    }

    async fn values(&self, method: &str, params: &[(&str, String)]) -> Result<Vec<String>, ApiError> {
        self.soap.call(method, params).await
    }

    async fn value(&self, method: &str, params: &[(&str, String)]) -> Result<String, ApiError> {
        self.values(method, params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::UnexpectedResponse {
                method: method.to_string(),
                detail: "missing returnval".to_string(),
            })
    }

    async fn void(&self, method: &str, params: &[(&str, String)]) -> Result<(), ApiError> {
        self.values(method, params).await.map(|_| ())
    }

    async fn source_architecture(&self, source: &MachineRef) -> String {
        let platform = match self.value("IMachine_getPlatform", &[this(source)]).await {
            Ok(p) if !p.is_empty() => p,
            Ok(_) => return FALLBACK_ARCHITECTURE.to_string(),
            Err(e) => {
                debug!(error = %e, "platform lookup failed; using fallback architecture");
                return FALLBACK_ARCHITECTURE.to_string();
            }
        };
        match self
            .value("IPlatform_getArchitecture", &[("_this", platform)])
            .await
        {
            Ok(arch) if !arch.is_empty() => arch,
            Ok(_) => FALLBACK_ARCHITECTURE.to_string(),
            Err(e) => {
                debug!(error = %e, "architecture lookup failed; using fallback architecture");
                FALLBACK_ARCHITECTURE.to_string()
            }
        }
    }
}

fn this(r: &impl std::fmt::Display) -> (&'static str, String) {
    ("_this", r.to_string())
}

fn parse_bool(method: &str, raw: &str) -> Result<bool, ApiError> {
    match raw.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ApiError::UnexpectedResponse {
            method: method.to_string(),
            detail: format!("expected boolean, got {other:?}"),
        }),
    }
}

fn decode_all(
    raws: Vec<String>,
    decode: fn(&str) -> Result<NatRedirect, RedirectParseError>,
) -> Result<Vec<NatRedirect>, ApiError> {
    raws.into_iter()
        .filter(|raw| !raw.is_empty())
        .map(|raw| decode(&raw).map_err(|source| ApiError::MalformedRedirect { raw, source }))
        .collect()
}

fn protocol_71(p: NatProtocol) -> &'static str {
    match p {
        NatProtocol::Tcp => "TCP",
        NatProtocol::Udp => "UDP",
    }
}

#[async_trait]
impl<T: SoapCall> VBoxApi for Adapter71<T> {
    async fn logon(&self, username: &str, password: &str) -> Result<SessionRef, ApiError> {
        let params = [
            ("username", username.to_string()),
            ("password", password.to_string()),
        ];
        self.value("IWebsessionManager_logon", &params)
            .await
            .map(SessionRef::new)
    }

    async fn logoff(&self, session: &SessionRef) -> Result<(), ApiError> {
        self.void("IWebsessionManager_logoff", &[("refIVirtualBox", session.to_string())])
            .await
    }

    async fn get_session_object(&self, session: &SessionRef) -> Result<SessionObjectRef, ApiError> {
        self.value(
            "IWebsessionManager_getSessionObject",
            &[("refIVirtualBox", session.to_string())],
        )
        .await
        .map(SessionObjectRef::new)
    }

    async fn find_machine(&self, session: &SessionRef, name_or_id: &str) -> Result<MachineRef, ApiError> {
        self.value(
            "IVirtualBox_findMachine",
            &[this(session), ("nameOrId", name_or_id.to_string())],
        )
        .await
        .map(MachineRef::new)
    }

    async fn get_machines(&self, session: &SessionRef) -> Result<Vec<MachineRef>, ApiError> {
        let refs = self.values("IVirtualBox_getMachines", &[this(session)]).await?;
        Ok(refs.into_iter().map(MachineRef::new).collect())
    }

    async fn create_machine(
        &self,
        session: &SessionRef,
        name: &str,
        os_type_id: &str,
        source: &MachineRef,
    ) -> Result<MachineRef, ApiError> {
        let architecture = self.source_architecture(source).await;
        let params = [
            this(session),
            ("settingsFile", String::new()),
            ("name", name.to_string()),
            ("platform", architecture),
            ("osTypeId", os_type_id.to_string()),
            ("flags", String::new()),
            ("cipher", String::new()),
            ("passwordId", String::new()),
            ("password", String::new()),
        ];
        self.value("IVirtualBox_createMachine", &params)
            .await
            .map(MachineRef::new)
    }

    async fn register_machine(&self, session: &SessionRef, machine: &MachineRef) -> Result<(), ApiError> {
        self.void(
            "IVirtualBox_registerMachine",
            &[this(session), ("machine", machine.to_string())],
        )
        .await
    }

    async fn unregister_machine(&self, machine: &MachineRef) -> Result<Vec<MediumRef>, ApiError> {
        let media = self
            .values(
                "IMachine_unregister",
                &[this(machine), ("cleanupMode", "Full".to_string())],
            )
            .await?;
        Ok(media
            .into_iter()
            .filter(|m| !m.is_empty())
            .map(MediumRef::new)
            .collect())
    }

    async fn delete_config(&self, machine: &MachineRef, media: &[MediumRef]) -> Result<ProgressRef, ApiError> {
        let mut params = vec![this(machine)];
        params.extend(media.iter().map(|m| ("media", m.to_string())));
        self.value("IMachine_deleteConfig", &params)
            .await
            .map(ProgressRef::new)
    }

    async fn get_machine_id(&self, machine: &MachineRef) -> Result<String, ApiError> {
        self.value("IMachine_getId", &[this(machine)]).await
    }

    async fn get_machine_name(&self, machine: &MachineRef) -> Result<String, ApiError> {
        self.value("IMachine_getName", &[this(machine)]).await
    }

    async fn get_machine_state(&self, machine: &MachineRef) -> Result<MachineState, ApiError> {
        let raw = self.value("IMachine_getState", &[this(machine)]).await?;
        Ok(normalize_state_71(&raw))
    }

    async fn get_os_type_id(&self, machine: &MachineRef) -> Result<String, ApiError> {
        self.value("IMachine_getOSTypeId", &[this(machine)]).await
    }

    async fn clone_to(
        &self,
        source: &MachineRef,
        target: &MachineRef,
        mode: CloneMode,
        options: &[CloneOption],
    ) -> Result<ProgressRef, ApiError> {
        let mut params = vec![
            this(source),
            ("target", target.to_string()),
            ("mode", mode.as_str().to_string()),
        ];
        params.extend(options.iter().map(|o| ("options", o.as_str().to_string())));
        self.value("IMachine_cloneTo", &params)
            .await
            .map(ProgressRef::new)
    }

    async fn launch_vm_process(
        &self,
        machine: &MachineRef,
        session_object: &SessionObjectRef,
        session_type: SessionType,
    ) -> Result<ProgressRef, ApiError> {
        let params = [
            this(machine),
            ("session", session_object.to_string()),
            ("name", session_type.as_str().to_string()),
        ];
        self.value("IMachine_launchVMProcess", &params)
            .await
            .map(ProgressRef::new)
    }

    async fn lock_machine(
        &self,
        machine: &MachineRef,
        session_object: &SessionObjectRef,
        lock_type: LockType,
    ) -> Result<(), ApiError> {
        let params = [
            this(machine),
            ("session", session_object.to_string()),
            ("lockType", lock_type.as_str().to_string()),
        ];
        self.void("IMachine_lockMachine", &params).await
    }

    async fn unlock_session(&self, session_object: &SessionObjectRef) -> Result<(), ApiError> {
        self.void("ISession_unlockMachine", &[this(session_object)]).await
    }

    async fn get_console(&self, session_object: &SessionObjectRef) -> Result<ConsoleRef, ApiError> {
        self.value("ISession_getConsole", &[this(session_object)])
            .await
            .map(ConsoleRef::new)
    }

    async fn power_down(&self, console: &ConsoleRef) -> Result<ProgressRef, ApiError> {
        self.value("IConsole_powerDown", &[this(console)])
            .await
            .map(ProgressRef::new)
    }

    async fn get_progress_completed(&self, progress: &ProgressRef) -> Result<bool, ApiError> {
        let raw = self.value("IProgress_getCompleted", &[this(progress)]).await?;
        parse_bool("IProgress_getCompleted", &raw)
    }

    async fn get_progress_result_code(&self, progress: &ProgressRef) -> Result<i32, ApiError> {
        let raw = self.value("IProgress_getResultCode", &[this(progress)]).await?;
        raw.trim()
            .parse::<i32>()
            .map_err(|e| ApiError::UnexpectedResponse {
                method: "IProgress_getResultCode".to_string(),
                detail: format!("{raw:?}: {e}"),
            })
    }

    async fn get_progress_error_text(&self, progress: &ProgressRef) -> Result<String, ApiError> {
        let info = self.value("IProgress_getErrorInfo", &[this(progress)]).await?;
        if info.trim().is_empty() {
            return Ok(String::new());
        }
        self.value("IVirtualBoxErrorInfo_getText", &[("_this", info)])
            .await
    }

    async fn get_network_adapter(&self, machine: &MachineRef, slot: u32) -> Result<AdapterRef, ApiError> {
        self.value(
            "IMachine_getNetworkAdapter",
            &[this(machine), ("slot", slot.to_string())],
        )
        .await
        .map(AdapterRef::new)
    }

    async fn get_nat_engine(&self, adapter: &AdapterRef) -> Result<NatEngineRef, ApiError> {
        self.value("INetworkAdapter_getNATEngine", &[this(adapter)])
            .await
            .map(NatEngineRef::new)
    }

    async fn get_nat_redirects(&self, engine: &NatEngineRef) -> Result<Vec<NatRedirect>, ApiError> {
        let raws = self.values("INATEngine_getRedirects", &[this(engine)]).await?;
        decode_all(raws, decode_adapter_redirect)
    }

    async fn add_nat_redirect(&self, engine: &NatEngineRef, redirect: &NatRedirect) -> Result<(), ApiError> {
        let params = [
            this(engine),
            ("name", redirect.name.clone()),
            ("proto", protocol_71(redirect.protocol).to_string()),
            ("hostIP", redirect.host_ip.clone()),
            ("hostPort", redirect.host_port.to_string()),
            ("guestIP", redirect.guest_ip.clone()),
            ("guestPort", redirect.guest_port.to_string()),
        ];
        self.void("INATEngine_addRedirect", &params).await
    }

    async fn remove_nat_redirect(&self, engine: &NatEngineRef, name: &str) -> Result<(), ApiError> {
        self.void(
            "INATEngine_removeRedirect",
            &[this(engine), ("name", name.to_string())],
        )
        .await
    }

    async fn get_nat_networks(&self, session: &SessionRef) -> Result<Vec<NatNetworkRef>, ApiError> {
        let refs = self.values("IVirtualBox_getNATNetworks", &[this(session)]).await?;
        Ok(refs.into_iter().map(NatNetworkRef::new).collect())
    }

    async fn get_nat_network_port_forward_rules4(
        &self,
        network: &NatNetworkRef,
    ) -> Result<Vec<NatRedirect>, ApiError> {
        let raws = self
            .values("INATNetwork_getPortForwardRules4", &[this(network)])
            .await?;
        decode_all(raws, decode_nat_network_rule)
    }

    async fn get_mutable_machine(&self, session_object: &SessionObjectRef) -> Result<MachineRef, ApiError> {
        self.value("ISession_getMachine", &[this(session_object)])
            .await
            .map(MachineRef::new)
    }

    async fn save_settings(&self, machine: &MachineRef) -> Result<(), ApiError> {
        self.void("IMachine_saveSettings", &[this(machine)]).await
    }

    async fn get_api_version(&self, session: &SessionRef) -> Result<String, ApiError> {
        self.value("IVirtualBox_getAPIVersion", &[this(session)]).await
    }
}
