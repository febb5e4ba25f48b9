//! The NAT port-forward resource.
//!
//! # Host port selection
//!
//! ```text
//! host_port != 0                    → used as given
//! host_port == 0, auto_host_port    → lowest free port in
//!                                     [auto_host_port_min, auto_host_port_max]
//! host_port == 0, !auto_host_port   → "Invalid host port" diagnostic
//! ```
//!
//! After creation the rule is read back and `effective_host_port` is taken
//! from what VirtualBox reports, not from what was requested.
//!
//! The selected port is only guaranteed not to clash with other VirtualBox
//! NAT rules at the time of selection.  Other host processes are not
//! checked, and VirtualBox may not report a bind failure at all.
//!
//! # Updates
//!
//! VirtualBox has no "modify redirect" call.  Changing anything but the
//! auto-port knobs deletes the rule and creates it again; changing only the
//! knobs touches nothing remote.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use vbox_core::domain::nat::validate_adapter_slot;
use vbox_core::{
    HostIpScope, NatPortForwardRule, NatProtocol, PortAllocatorOptions, RuleId, ValidationError,
};

use super::Diagnostic;
use crate::application::VBoxClient;

fn default_auto_min() -> u16 {
    20000
}

fn default_auto_max() -> u16 {
    40000
}

/// Desired configuration of one forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatPortForwardConfig {
    /// UUID of the machine owning the adapter.
    pub machine_id: String,
    /// 0–7, matching `nic1`–`nic8`.
    pub adapter_slot: u32,
    /// Unique within the adapter's NAT engine.
    pub name: String,
    pub protocol: NatProtocol,
    /// Empty or `0.0.0.0` means every interface.
    #[serde(default)]
    pub host_ip: String,
    /// `0` asks for automatic selection.
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub guest_ip: String,
    pub guest_port: u16,

    #[serde(default)]
    pub auto_host_port: bool,
    #[serde(default = "default_auto_min")]
    pub auto_host_port_min: u16,
    #[serde(default = "default_auto_max")]
    pub auto_host_port_max: u16,
    #[serde(default)]
    pub auto_host_ip_scope: HostIpScope,
}

impl NatPortForwardConfig {
    /// A rule with an explicit host port and every knob at its default.
    pub fn new(
        machine_id: impl Into<String>,
        adapter_slot: u32,
        name: impl Into<String>,
        protocol: NatProtocol,
        host_port: u16,
        guest_port: u16,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            adapter_slot,
            name: name.into(),
            protocol,
            host_ip: String::new(),
            host_port,
            guest_ip: String::new(),
            guest_port,
            auto_host_port: false,
            auto_host_port_min: default_auto_min(),
            auto_host_port_max: default_auto_max(),
            auto_host_ip_scope: HostIpScope::default(),
        }
    }

    /// Field-level checks made before any remote call.
    ///
    /// # Errors
    ///
    /// Empty machine id or name, slot outside 0–7, guest port 0, an auto
    /// range bound of 0, or an auto range whose minimum exceeds its maximum.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.machine_id.trim().is_empty() {
            return Err(ValidationError::Required("machine_id"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::Required("name"));
        }
        validate_adapter_slot(self.adapter_slot)?;

        for (field, value) in [
            ("guest_port", self.guest_port),
            ("auto_host_port_min", self.auto_host_port_min),
            ("auto_host_port_max", self.auto_host_port_max),
        ] {
            if value == 0 {
                return Err(ValidationError::PortOutOfRange {
                    field,
                    min: 1,
                    max: 65535,
                    value: 0,
                });
            }
        }
        if self.auto_host_port_min > self.auto_host_port_max {
            return Err(ValidationError::PortOutOfRange {
                field: "auto_host_port_max",
                min: u32::from(self.auto_host_port_min),
                max: 65535,
                value: i64::from(self.auto_host_port_max),
            });
        }
        Ok(())
    }

    /// Allocation policy for this rule's auto host port.
    pub fn allocator_options(&self, include_nat_networks: bool) -> PortAllocatorOptions {
        PortAllocatorOptions {
            min_port: self.auto_host_port_min,
            max_port: self.auto_host_port_max,
            host_ip: self.host_ip.clone(),
            scope: self.auto_host_ip_scope,
            include_nat_networks,
        }
    }

    /// Whether `self` differs from `other` only in the auto-port knobs.
    pub fn differs_only_in_auto_settings(&self, other: &Self) -> bool {
        let strip = |c: &Self| Self {
            auto_host_port: false,
            auto_host_port_min: 0,
            auto_host_port_max: 0,
            auto_host_ip_scope: HostIpScope::default(),
            ..c.clone()
        };
        strip(self) == strip(other)
    }

    fn rule(&self, host_port: u16) -> NatPortForwardRule {
        NatPortForwardRule {
            machine_id: self.machine_id.clone(),
            adapter_slot: self.adapter_slot,
            name: self.name.clone(),
            protocol: self.protocol,
            host_ip: self.host_ip.clone(),
            host_port,
            guest_ip: self.guest_ip.clone(),
            guest_port: self.guest_port,
        }
    }
}

/// What is known about a managed rule after the last operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatPortForwardRecord {
    /// `machine_id:adapter_slot:name`.
    pub id: String,
    #[serde(flatten)]
    pub config: NatPortForwardConfig,
    /// Host port as read back from VirtualBox.
    pub effective_host_port: u16,
}

/// Create / read / update / delete / import for NAT forwarding rules.
#[derive(Debug, Clone)]
pub struct NatPortForwardResource {
    client: VBoxClient,
    include_nat_networks: bool,
}

impl NatPortForwardResource {
    /// NAT-network rules count as used ports unless
    /// [`with_nat_networks`](Self::with_nat_networks) turns that off.
    pub fn new(client: VBoxClient) -> Self {
        Self {
            client,
            include_nat_networks: true,
        }
    }

    pub fn with_nat_networks(mut self, include: bool) -> Self {
        self.include_nat_networks = include;
        self
    }

    pub async fn create(
        &self,
        config: &NatPortForwardConfig,
        cancel: &CancellationToken,
    ) -> Result<NatPortForwardRecord, Diagnostic> {
        config
            .validate()
            .map_err(|e| Diagnostic::from_error("Invalid NAT port forward configuration", &e))?;

        let host_port = self.resolve_host_port(config, cancel).await?;
        let rule = config.rule(host_port);

        self.client
            .create_nat_port_forward(&rule, cancel)
            .await
            .map_err(|e| Diagnostic::from_error("Failed to create NAT port forward rule", &e))?;

        let read_back = self
            .client
            .read_nat_port_forward(&rule.machine_id, rule.adapter_slot, &rule.name, cancel)
            .await
            .map_err(|e| Diagnostic::from_error("Failed to verify NAT port forward rule", &e))?
            .ok_or_else(|| {
                Diagnostic::new(
                    "NAT port forward rule not found after creation",
                    "The rule was created but could not be read back",
                )
            })?;

        if read_back.host_port != host_port {
            info!(
                requested = host_port,
                effective = read_back.host_port,
                "host port differs from the requested one"
            );
        }

        Ok(NatPortForwardRecord {
            id: rule.id().to_string(),
            config: NatPortForwardConfig {
                host_port,
                ..config.clone()
            },
            effective_host_port: read_back.host_port,
        })
    }

    /// Refreshes the record from the live rule.  `None` means the rule or
    /// its machine is gone.
    pub async fn read(
        &self,
        record: &NatPortForwardRecord,
        cancel: &CancellationToken,
    ) -> Result<Option<NatPortForwardRecord>, Diagnostic> {
        let c = &record.config;
        let rule = match self
            .client
            .read_nat_port_forward(&c.machine_id, c.adapter_slot, &c.name, cancel)
            .await
        {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                info!(id = %record.id, "NAT rule removed out of band");
                return Ok(None);
            }
            Err(e) if e.is_not_found() => {
                info!(id = %record.id, "owning machine removed out of band");
                return Ok(None);
            }
            Err(e) => return Err(Diagnostic::from_error("Failed to read NAT port forward rule", &e)),
        };

        Ok(Some(NatPortForwardRecord {
            id: record.id.clone(),
            config: NatPortForwardConfig {
                protocol: rule.protocol,
                host_ip: rule.host_ip,
                guest_ip: rule.guest_ip,
                guest_port: rule.guest_port,
                ..c.clone()
            },
            effective_host_port: rule.host_port,
        }))
    }

    /// Moves `prior` to `config`.
    ///
    /// Only the auto-port knobs changed: the record is updated without any
    /// remote call.  Otherwise the old rule is deleted and the new one
    /// created.
    pub async fn update(
        &self,
        prior: &NatPortForwardRecord,
        config: &NatPortForwardConfig,
        cancel: &CancellationToken,
    ) -> Result<NatPortForwardRecord, Diagnostic> {
        config
            .validate()
            .map_err(|e| Diagnostic::from_error("Invalid NAT port forward configuration", &e))?;

        // An auto port already chosen stays chosen.
        let mut planned = config.clone();
        if planned.host_port == 0 && planned.auto_host_port {
            planned.host_port = prior.config.host_port;
        }
        if planned.differs_only_in_auto_settings(&prior.config) {
            return Ok(NatPortForwardRecord {
                config: planned,
                ..prior.clone()
            });
        }

        let old = &prior.config;
        match self
            .client
            .delete_nat_port_forward(&old.machine_id, old.adapter_slot, &old.name, cancel)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(Diagnostic::from_error("Failed to delete old NAT port forward rule", &e)),
        }
        info!(id = %prior.id, "NAT rule removed for replacement");

        self.create(config, cancel).await
    }

    /// Removes the rule.  Already gone counts as success.
    pub async fn delete(&self, record: &NatPortForwardRecord, cancel: &CancellationToken) -> Result<(), Diagnostic> {
        let c = &record.config;
        match self
            .client
            .delete_nat_port_forward(&c.machine_id, c.adapter_slot, &c.name, cancel)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Diagnostic::from_error("Failed to delete NAT port forward rule", &e)),
        }
    }

    /// Adopts an existing rule from its `machine_id:adapter_slot:name` id.
    pub async fn import(&self, id: &str, cancel: &CancellationToken) -> Result<NatPortForwardRecord, Diagnostic> {
        let rule_id: RuleId = id.parse().map_err(|e| match e {
            ValidationError::InvalidAdapterSlot(_) => Diagnostic::from_error("Invalid adapter slot", &e),
            other => Diagnostic::from_error("Invalid import ID", &other),
        })?;

        let rule = self
            .client
            .read_nat_port_forward(&rule_id.machine_id, rule_id.adapter_slot, &rule_id.name, cancel)
            .await
            .map_err(|e| Diagnostic::from_error("Failed to import NAT port forward rule", &e))?
            .ok_or_else(|| {
                Diagnostic::new(
                    "Failed to import NAT port forward rule",
                    format!("No NAT rule {:?} on adapter slot {}", rule_id.name, rule_id.adapter_slot),
                )
            })?;

        let mut config = NatPortForwardConfig::new(
            rule.machine_id,
            rule.adapter_slot,
            rule.name,
            rule.protocol,
            rule.host_port,
            rule.guest_port,
        );
        config.host_ip = rule.host_ip;
        config.guest_ip = rule.guest_ip;

        Ok(NatPortForwardRecord {
            id: rule_id.to_string(),
            config,
            effective_host_port: rule.host_port,
        })
    }

    async fn resolve_host_port(
        &self,
        config: &NatPortForwardConfig,
        cancel: &CancellationToken,
    ) -> Result<u16, Diagnostic> {
        if config.host_port != 0 {
            return Ok(config.host_port);
        }
        if !config.auto_host_port {
            return Err(Diagnostic::new(
                "Invalid host port",
                "host_port must be specified or auto_host_port must be enabled to automatically select a port",
            ));
        }

        self.client
            .allocate_nat_host_port(&config.allocator_options(self.include_nat_networks), cancel)
            .await
            .map_err(|e| Diagnostic::from_error("Failed to allocate host port", &e))
    }
}
