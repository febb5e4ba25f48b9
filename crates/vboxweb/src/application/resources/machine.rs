//! The machine resource: a VM cloned from a source and kept in a desired
//! power state.
//!
//! `name`, `source`, `clone_mode` and `clone_options` are fixed at creation;
//! changing any of them replaces the machine (delete, then clone again).
//! `state`, `session_type` and `wait_timeout` are updated in place.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use vbox_core::{
    parse_wait_timeout, CloneMode, CloneOption, CloneRequest, DesiredState, MachineState,
    SessionType,
};

use super::Diagnostic;
use crate::application::VBoxClient;

/// Written into configs and imported records when no timeout was given.
pub const DEFAULT_WAIT_TIMEOUT_TEXT: &str = "20m";

fn default_wait_timeout() -> String {
    DEFAULT_WAIT_TIMEOUT_TEXT.to_string()
}

/// Desired configuration of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    /// Source machine name or UUID.  Empty for imported machines.
    pub source: String,
    #[serde(default)]
    pub clone_mode: CloneMode,
    #[serde(default)]
    pub clone_options: Vec<CloneOption>,
    #[serde(default)]
    pub state: DesiredState,
    #[serde(default)]
    pub session_type: SessionType,
    /// Duration text such as `"30m"`; unparsable values mean 20 minutes.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: String,
}

impl MachineConfig {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            clone_mode: CloneMode::default(),
            clone_options: Vec::new(),
            state: DesiredState::default(),
            session_type: SessionType::default(),
            wait_timeout: default_wait_timeout(),
        }
    }

    /// Whether moving from `prior` to this config needs a new machine.
    ///
    /// Clone options are compared as a set.
    pub fn requires_replace(&self, prior: &MachineRecord) -> bool {
        let before = &prior.config;
        let options = |o: &[CloneOption]| o.iter().copied().collect::<BTreeSet<_>>();

        self.name != before.name
            || self.source != before.source
            || self.clone_mode != before.clone_mode
            || options(&self.clone_options) != options(&before.clone_options)
    }

    fn with_defaults(&self) -> Self {
        let mut config = self.clone();
        if config.wait_timeout.trim().is_empty() {
            config.wait_timeout = default_wait_timeout();
        }
        config
    }

    fn clone_request(&self) -> CloneRequest {
        CloneRequest {
            mode: self.clone_mode,
            options: self.clone_options.clone(),
            desired_state: self.state,
            session_type: self.session_type,
            timeout: parse_wait_timeout(&self.wait_timeout),
            ..CloneRequest::new(&self.name, &self.source)
        }
    }
}

/// What is known about a managed machine after the last operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    /// Machine UUID.
    pub id: String,
    #[serde(flatten)]
    pub config: MachineConfig,
    /// Observed state, best effort.
    pub current_state: MachineState,
}

/// Create / read / update / delete / import for machines.
#[derive(Debug, Clone)]
pub struct MachineResource {
    client: VBoxClient,
}

impl MachineResource {
    pub fn new(client: VBoxClient) -> Self {
        Self { client }
    }

    /// Clones the machine and converges it to `config.state`.
    ///
    /// A failure part-way leaves the new machine behind; it is not rolled
    /// back.
    pub async fn create(&self, config: &MachineConfig, cancel: &CancellationToken) -> Result<MachineRecord, Diagnostic> {
        let config = config.with_defaults();
        let (id, current_state) = self
            .client
            .clone_and_converge(&config.clone_request(), cancel)
            .await
            .map_err(|e| Diagnostic::from_error("Failed to clone VM", &e))?;

        info!(id = %id, name = %config.name, state = %current_state, "machine created");
        Ok(MachineRecord {
            id,
            config,
            current_state,
        })
    }

    /// Refreshes `current_state`.  `None` means the machine is gone.
    pub async fn read(
        &self,
        record: &MachineRecord,
        cancel: &CancellationToken,
    ) -> Result<Option<MachineRecord>, Diagnostic> {
        if record.id.trim().is_empty() {
            return Ok(None);
        }

        match self.client.get_state_by_id(&record.id, cancel).await {
            Ok(current_state) => Ok(Some(MachineRecord {
                current_state,
                ..record.clone()
            })),
            Err(e) if e.is_not_found() => {
                info!(id = %record.id, "machine deleted out of band");
                Ok(None)
            }
            Err(e) => Err(Diagnostic::from_error("Failed to read VM state", &e)),
        }
    }

    /// Moves `prior` to `config`, replacing the machine if an immutable
    /// field changed and converging its power state otherwise.
    pub async fn update(
        &self,
        prior: &MachineRecord,
        config: &MachineConfig,
        cancel: &CancellationToken,
    ) -> Result<MachineRecord, Diagnostic> {
        if prior.id.trim().is_empty() {
            return Err(Diagnostic::new("Missing id", "Resource state is missing id"));
        }

        if config.requires_replace(prior) {
            info!(id = %prior.id, name = %config.name, "immutable field changed, replacing machine");
            self.delete(prior, cancel).await?;
            return self.create(config, cancel).await;
        }

        let config = config.with_defaults();
        let current_state = self
            .client
            .converge_state_by_id(
                &prior.id,
                config.state,
                config.session_type,
                parse_wait_timeout(&config.wait_timeout),
                cancel,
            )
            .await
            .map_err(|e| Diagnostic::from_error("Failed to change VM state", &e))?;

        Ok(MachineRecord {
            id: prior.id.clone(),
            config,
            current_state,
        })
    }

    /// Deletes the machine with its media.  Already gone counts as success.
    pub async fn delete(&self, record: &MachineRecord, cancel: &CancellationToken) -> Result<(), Diagnostic> {
        if record.id.trim().is_empty() {
            return Ok(());
        }

        let timeout = parse_wait_timeout(&record.config.wait_timeout);
        match self.client.delete_by_id(&record.id, timeout, cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Diagnostic::from_error("Failed to delete VM", &e)),
        }
    }

    /// Adopts an existing machine by UUID or name.
    ///
    /// What cannot be recovered from the live machine gets a default: empty
    /// `source`, `MachineState` clone mode, headless, `20m`.  The desired
    /// state mirrors the observed one so the next update is a no-op.
    pub async fn import(&self, id_or_name: &str, cancel: &CancellationToken) -> Result<MachineRecord, Diagnostic> {
        let info = self
            .client
            .get_machine_info_by_id(id_or_name, cancel)
            .await
            .map_err(|e| {
                Diagnostic::new(
                    "Failed to import machine",
                    format!("Could not find machine with ID or name {id_or_name:?}: {e}"),
                )
            })?;

        Ok(MachineRecord {
            id: info.id,
            config: MachineConfig {
                state: DesiredState::matching(info.state),
                ..MachineConfig::new(info.name, "")
            },
            current_state: info.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(config: MachineConfig) -> MachineRecord {
        MachineRecord {
            id: "uuid-1".to_string(),
            config,
            current_state: MachineState::PoweredOff,
        }
    }

    #[test]
    fn test_state_change_does_not_require_replace() {
        // Arrange
        let prior = record(MachineConfig::new("web", "golden"));
        let mut plan = MachineConfig::new("web", "golden");
        plan.state = DesiredState::Started;
        plan.session_type = SessionType::Gui;
        plan.wait_timeout = "5m".to_string();

        // Act / Assert
        assert!(!plan.requires_replace(&prior));
    }

    #[test]
    fn test_immutable_field_changes_require_replace() {
        let prior = record(MachineConfig::new("web", "golden"));

        let renamed = MachineConfig::new("web-2", "golden");
        let resourced = MachineConfig::new("web", "golden-2");
        let mut remoded = MachineConfig::new("web", "golden");
        remoded.clone_mode = CloneMode::AllStates;
        let mut linked = MachineConfig::new("web", "golden");
        linked.clone_options = vec![CloneOption::Link];

        assert!(renamed.requires_replace(&prior));
        assert!(resourced.requires_replace(&prior));
        assert!(remoded.requires_replace(&prior));
        assert!(linked.requires_replace(&prior));
    }

    #[test]
    fn test_clone_option_order_is_not_a_change() {
        let mut before = MachineConfig::new("web", "golden");
        before.clone_options = vec![CloneOption::Link, CloneOption::KeepAllMacs];
        let prior = record(before);
        let mut plan = MachineConfig::new("web", "golden");
        plan.clone_options = vec![CloneOption::KeepAllMacs, CloneOption::Link];

        assert!(!plan.requires_replace(&prior));
    }

    #[test]
    fn test_clone_request_uses_lenient_timeout() {
        let mut config = MachineConfig::new("web", "golden");
        config.wait_timeout = "soon".to_string();

        let request = config.clone_request();

        assert_eq!(request.timeout, vbox_core::DEFAULT_WAIT_TIMEOUT);
        assert_eq!(request.name, "web");
    }

    #[test]
    fn test_config_deserialises_with_defaults() {
        let config: MachineConfig =
            serde_json::from_str(r#"{"name":"web","source":"golden"}"#).unwrap();

        assert_eq!(config, MachineConfig::new("web", "golden"));
        assert_eq!(config.wait_timeout, "20m");
    }
}
