//! vboxweb: declarative VirtualBox machine and NAT port-forward management
//! over the vboxwebsrv SOAP API.
//!
//! # Usage
//!
//! ```text
//! vboxweb [OPTIONS] <COMMAND>
//!
//! Commands:
//!   machine create     Clone a machine and bring it to a power state
//!   machine read       Show id, name and state of a machine
//!   machine set-state  Start or stop a machine
//!   machine delete     Power off, unregister and delete a machine
//!   machine import     Adopt an existing machine
//!   nat create         Add a NAT port-forward rule (optionally auto port)
//!   nat read           Show one rule
//!   nat delete         Remove one rule (idempotent)
//!   nat import         Adopt an existing rule by machine_id:slot:name
//!   nat list           List every rule on an adapter
//!   nat allocate       Pick a free host port without creating a rule
//!   config init        Write a starter configuration file
//!
//! Options:
//!   --config   <PATH>  Configuration file [default: platform config dir]
//!   --endpoint <URL>   vboxwebsrv URL              [env: VBOXWEB_ENDPOINT]
//!   --username <NAME>                              [env: VBOXWEB_USERNAME]
//!   --password <PASS>                              [env: VBOXWEB_PASSWORD]
//! ```
//!
//! Results are printed to stdout as JSON.  Logs go to stderr; the level comes
//! from `RUST_LOG`, falling back to `logging.log_level` in the config file.
//!
//! # Architecture overview
//!
//! ```text
//! main.rs  (this file: flags, config, logging, Ctrl+C)
//!   application/resources   machine / NAT rule resources
//!   application/            VBoxClient orchestrator
//!   infrastructure/
//!     vbox_api/             capability trait + 7.1 adapter
//!     soap/                 SOAP envelopes over reqwest
//!     storage/              TOML config
//!       ↕
//! vboxwebsrv  (SOAP over HTTP, port 18083)
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vbox_core::{
    CloneMode, CloneOption, DesiredState, HostIpScope, NatProtocol, RuleId, SessionType,
};
use vboxweb::application::resources::{
    MachineConfig, MachineResource, NatPortForwardConfig, NatPortForwardResource,
};
use vboxweb::application::VBoxClient;
use vboxweb::infrastructure::storage::config::{
    config_file_path, load_config_from, save_config_to, AppConfig,
};
use vboxweb::infrastructure::vbox_api::{connect, EndpointOptions, VersionSelection};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Manage VirtualBox machines and NAT port forwards through vboxwebsrv.
#[derive(Debug, Parser)]
#[command(name = "vboxweb", version)]
struct Cli {
    /// Configuration file.  Defaults to the platform config directory.
    #[arg(long, global = true, env = "VBOXWEB_CONFIG")]
    config: Option<PathBuf>,

    /// vboxwebsrv SOAP endpoint, overriding `endpoint.url`.
    #[arg(long, global = true, env = "VBOXWEB_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, global = true, env = "VBOXWEB_USERNAME")]
    username: Option<String>,

    #[arg(long, global = true, env = "VBOXWEB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Cloned machines.
    #[command(subcommand)]
    Machine(MachineCommand),
    /// NAT port-forward rules.
    #[command(subcommand)]
    Nat(NatCommand),
    /// Configuration file helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum MachineCommand {
    /// Clone SOURCE into a new machine NAME.
    Create {
        #[arg(long)]
        name: String,
        /// Source machine name or UUID.
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "MachineState")]
        clone_mode: CloneMode,
        /// Repeatable: Link, KeepAllMACs, KeepNATMACs, KeepDiskNames, KeepHwUUIDs.
        #[arg(long = "clone-option")]
        clone_options: Vec<CloneOption>,
        #[command(flatten)]
        power: PowerArgs,
    },
    Read {
        /// Machine UUID or name.
        id: String,
    },
    SetState {
        /// Machine UUID or name.
        id: String,
        #[command(flatten)]
        power: PowerArgs,
    },
    Delete {
        /// Machine UUID or name.
        id: String,
        #[arg(long)]
        wait_timeout: Option<String>,
    },
    Import {
        /// Machine UUID or name.
        id: String,
    },
}

#[derive(Debug, Args)]
struct PowerArgs {
    /// started|running|on or stopped|poweredoff|powered_off|off.
    #[arg(long, default_value = "stopped", value_parser = DesiredState::from_alias)]
    state: DesiredState,
    #[arg(long, default_value = "headless")]
    session_type: SessionType,
    /// Per-step timeout such as `30m`; defaults to `operations.wait_timeout`.
    #[arg(long)]
    wait_timeout: Option<String>,
}

#[derive(Debug, Subcommand)]
enum NatCommand {
    Create(NatCreateArgs),
    Read {
        /// `machine_id:adapter_slot:name`.
        id: String,
    },
    Delete {
        /// `machine_id:adapter_slot:name`.
        id: String,
    },
    Import {
        /// `machine_id:adapter_slot:name`.
        id: String,
    },
    List {
        #[arg(long)]
        machine_id: String,
        #[arg(long, default_value_t = 0)]
        adapter_slot: u32,
    },
    Allocate {
        /// Host IP the new rule would bind.
        #[arg(long, default_value = "")]
        host_ip: String,
        #[command(flatten)]
        auto: AutoPortArgs,
    },
}

#[derive(Debug, Args)]
struct NatCreateArgs {
    #[arg(long)]
    machine_id: String,
    #[arg(long, default_value_t = 0)]
    adapter_slot: u32,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "tcp")]
    protocol: NatProtocol,
    #[arg(long, default_value = "")]
    host_ip: String,
    /// 0 together with `--auto-host-port` picks a free port.
    #[arg(long, default_value_t = 0)]
    host_port: u16,
    #[arg(long, default_value = "")]
    guest_ip: String,
    #[arg(long)]
    guest_port: u16,
    #[arg(long)]
    auto_host_port: bool,
    #[command(flatten)]
    auto: AutoPortArgs,
}

/// Overrides for the `[operations]` allocation defaults.
#[derive(Debug, Args)]
struct AutoPortArgs {
    #[arg(long)]
    auto_host_port_min: Option<u16>,
    #[arg(long)]
    auto_host_port_max: Option<u16>,
    #[arg(long)]
    auto_host_ip_scope: Option<HostIpScope>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Write a configuration file with every default filled in.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config_file_path().context("could not locate the configuration file"),
        }
    }

    /// Applies flag and environment overrides on top of the file config.
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(url) = &self.endpoint {
            config.endpoint.url = url.clone();
        }
        if let Some(username) = &self.username {
            config.endpoint.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.endpoint.password = password.clone();
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config_path()?;
    let mut config = load_config_from(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    cli.apply_overrides(&mut config);

    // RUST_LOG wins; otherwise the configured level.  Logs go to stderr so
    // stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Command::Config(ConfigCommand::Init { force }) = &cli.command {
        return init_config(&config_path, *force);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("received Ctrl+C, cancelling");
                on_signal.cancel();
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let client = build_client(&config).await?;
    run(cli.command, &client, &config, &cancel).await
}

async fn build_client(config: &AppConfig) -> anyhow::Result<VBoxClient> {
    let endpoint = &config.endpoint;
    let version: VersionSelection = endpoint
        .api_version
        .parse()
        .with_context(|| format!("invalid endpoint.api_version {:?}", endpoint.api_version))?;
    let options = EndpointOptions {
        url: endpoint.url.clone(),
        request_timeout: endpoint.request_timeout(),
        version,
    };

    let api = connect(&options, &endpoint.username, &endpoint.password)
        .await
        .with_context(|| format!("failed to connect to {}", endpoint.url))?;
    info!(url = %endpoint.url, user = %endpoint.username, "connected");
    Ok(VBoxClient::new(api, &endpoint.username, &endpoint.password))
}

async fn run(
    command: Command,
    client: &VBoxClient,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::Machine(cmd) => run_machine(cmd, client, config, cancel).await,
        Command::Nat(cmd) => run_nat(cmd, client, config, cancel).await,
        Command::Config(_) => Ok(()),
    }
}

async fn run_machine(
    command: MachineCommand,
    client: &VBoxClient,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let machines = MachineResource::new(client.clone());
    let default_timeout = || config.operations.wait_timeout.clone();

    match command {
        MachineCommand::Create {
            name,
            source,
            clone_mode,
            clone_options,
            power,
        } => {
            let desired = MachineConfig {
                clone_mode,
                clone_options,
                state: power.state,
                session_type: power.session_type,
                wait_timeout: power.wait_timeout.unwrap_or_else(default_timeout),
                ..MachineConfig::new(name, source)
            };
            print_json(&machines.create(&desired, cancel).await?)
        }
        MachineCommand::Read { id } => {
            let info = client.get_machine_info_by_id(&id, cancel).await?;
            print_json(&info)
        }
        MachineCommand::SetState { id, power } => {
            let current = machines.import(&id, cancel).await?;
            let desired = MachineConfig {
                state: power.state,
                session_type: power.session_type,
                wait_timeout: power.wait_timeout.unwrap_or_else(default_timeout),
                ..current.config.clone()
            };
            print_json(&machines.update(&current, &desired, cancel).await?)
        }
        MachineCommand::Delete { id, wait_timeout } => {
            let timeout = wait_timeout
                .map(|t| vbox_core::parse_wait_timeout(&t))
                .unwrap_or_else(|| config.operations.wait_timeout());
            match client.delete_by_id(&id, timeout, cancel).await {
                Ok(()) => print_json(&serde_json::json!({ "id": id, "deleted": true })),
                Err(e) if e.is_not_found() => {
                    print_json(&serde_json::json!({ "id": id, "deleted": false }))
                }
                Err(e) => Err(e).context("failed to delete VM"),
            }
        }
        MachineCommand::Import { id } => print_json(&machines.import(&id, cancel).await?),
    }
}

async fn run_nat(
    command: NatCommand,
    client: &VBoxClient,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let rules = NatPortForwardResource::new(client.clone())
        .with_nat_networks(config.operations.include_nat_networks);

    match command {
        NatCommand::Create(args) => {
            let ops = &config.operations;
            let desired = NatPortForwardConfig {
                host_ip: args.host_ip,
                guest_ip: args.guest_ip,
                auto_host_port: args.auto_host_port,
                auto_host_port_min: args.auto.auto_host_port_min.unwrap_or(ops.auto_host_port_min),
                auto_host_port_max: args.auto.auto_host_port_max.unwrap_or(ops.auto_host_port_max),
                auto_host_ip_scope: args.auto.auto_host_ip_scope.unwrap_or(ops.auto_host_ip_scope),
                ..NatPortForwardConfig::new(
                    args.machine_id,
                    args.adapter_slot,
                    args.name,
                    args.protocol,
                    args.host_port,
                    args.guest_port,
                )
            };
            print_json(&rules.create(&desired, cancel).await?)
        }
        NatCommand::Read { id } => {
            let id: RuleId = id.parse()?;
            let rule = client
                .read_nat_port_forward(&id.machine_id, id.adapter_slot, &id.name, cancel)
                .await?;
            print_json(&rule)
        }
        NatCommand::Delete { id } => {
            let id: RuleId = id.parse()?;
            client
                .delete_nat_port_forward(&id.machine_id, id.adapter_slot, &id.name, cancel)
                .await?;
            print_json(&serde_json::json!({ "id": id.to_string(), "deleted": true }))
        }
        NatCommand::Import { id } => print_json(&rules.import(&id, cancel).await?),
        NatCommand::List {
            machine_id,
            adapter_slot,
        } => {
            let redirects = client
                .get_all_nat_redirects(&machine_id, adapter_slot, cancel)
                .await?;
            print_json(&redirects)
        }
        NatCommand::Allocate { host_ip, auto } => {
            let mut options = config.operations.allocator_options(&host_ip);
            if let Some(min) = auto.auto_host_port_min {
                options.min_port = min;
            }
            if let Some(max) = auto.auto_host_port_max {
                options.max_port = max;
            }
            if let Some(scope) = auto.auto_host_ip_scope {
                options.scope = scope;
            }
            let port = client.allocate_nat_host_port(&options, cancel).await?;
            print_json(&serde_json::json!({ "host_port": port }))
        }
    }
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    save_config_to(&AppConfig::default(), path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "configuration written");
    print_json(&serde_json::json!({ "config": path.display().to_string() }))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_create_defaults() {
        // Arrange / Act
        let cli = Cli::parse_from([
            "vboxweb", "machine", "create", "--name", "web", "--source", "golden",
        ]);

        // Assert
        match cli.command {
            Command::Machine(MachineCommand::Create {
                clone_mode,
                clone_options,
                power,
                ..
            }) => {
                assert_eq!(clone_mode, CloneMode::MachineState);
                assert!(clone_options.is_empty());
                assert_eq!(power.state, DesiredState::Stopped);
                assert_eq!(power.session_type, SessionType::Headless);
                assert_eq!(power.wait_timeout, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_machine_state_accepts_aliases_and_repeated_options() {
        let cli = Cli::parse_from([
            "vboxweb",
            "machine",
            "create",
            "--name",
            "web",
            "--source",
            "golden",
            "--state",
            "on",
            "--clone-option",
            "Link",
            "--clone-option",
            "KeepAllMACs",
        ]);

        match cli.command {
            Command::Machine(MachineCommand::Create {
                clone_options,
                power,
                ..
            }) => {
                assert_eq!(power.state, DesiredState::Started);
                assert_eq!(clone_options, vec![CloneOption::Link, CloneOption::KeepAllMacs]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_invalid_state_is_rejected_by_parser() {
        let result = Cli::try_parse_from(["vboxweb", "machine", "set-state", "web", "--state", "paused"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_nat_create_parses_protocol_and_auto_flags() {
        let cli = Cli::parse_from([
            "vboxweb",
            "nat",
            "create",
            "--machine-id",
            "uuid-1",
            "--name",
            "ssh",
            "--protocol",
            "UDP",
            "--guest-port",
            "22",
            "--auto-host-port",
            "--auto-host-ip-scope",
            "exact",
        ]);

        match cli.command {
            Command::Nat(NatCommand::Create(args)) => {
                assert_eq!(args.protocol, NatProtocol::Udp);
                assert_eq!(args.adapter_slot, 0);
                assert_eq!(args.host_port, 0);
                assert!(args.auto_host_port);
                assert_eq!(args.auto.auto_host_ip_scope, Some(HostIpScope::Exact));
                assert_eq!(args.auto.auto_host_port_min, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_overrides_replace_file_values() {
        // Arrange
        let cli = Cli::parse_from([
            "vboxweb",
            "--endpoint",
            "http://vbox.lan:18083/",
            "--username",
            "ops",
            "nat",
            "list",
            "--machine-id",
            "uuid-1",
        ]);
        let mut config = AppConfig::default();

        // Act
        cli.apply_overrides(&mut config);

        // Assert
        assert_eq!(config.endpoint.url, "http://vbox.lan:18083/");
        assert_eq!(config.endpoint.username, "ops");
    }
}
