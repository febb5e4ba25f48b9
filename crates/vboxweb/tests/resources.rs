//! Resource create / read / update / delete / import against the in-memory
//! host.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use vbox_core::{DesiredState, MachineState, NatProtocol};
use vboxweb::application::resources::{
    MachineConfig, MachineResource, NatPortForwardConfig, NatPortForwardResource,
};
use vboxweb::application::VBoxClient;
use vboxweb::infrastructure::vbox_api::mock::InMemoryVBox;

fn setup() -> (Arc<InMemoryVBox>, VBoxClient) {
    let host = Arc::new(InMemoryVBox::new());
    let client = VBoxClient::new(host.clone(), "vbox", "secret");
    (host, client)
}

// ── Machine ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_machine_create_then_start_in_place() {
    // Arrange
    let (host, client) = setup();
    host.add_machine("golden", "Ubuntu_64", MachineState::PoweredOff);
    let resource = MachineResource::new(client);
    let cancel = CancellationToken::new();

    // Act
    let created = resource
        .create(&MachineConfig::new("web", "golden"), &cancel)
        .await
        .unwrap();
    let mut plan = created.config.clone();
    plan.state = DesiredState::Started;
    let updated = resource.update(&created, &plan, &cancel).await.unwrap();

    // Assert: same machine, now running
    assert_eq!(created.current_state, MachineState::PoweredOff);
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.current_state, MachineState::Running);
    assert_eq!(host.machine_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_machine_rename_replaces_machine() {
    // Arrange
    let (host, client) = setup();
    host.add_machine("golden", "Ubuntu_64", MachineState::PoweredOff);
    let resource = MachineResource::new(client);
    let cancel = CancellationToken::new();
    let created = resource
        .create(&MachineConfig::new("web", "golden"), &cancel)
        .await
        .unwrap();

    // Act
    let replaced = resource
        .update(&created, &MachineConfig::new("web-2", "golden"), &cancel)
        .await
        .unwrap();

    // Assert
    assert_ne!(replaced.id, created.id);
    assert!(!host.machine_exists(&created.id));
    assert_eq!(host.machine_id_by_name("web-2").as_deref(), Some(replaced.id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_machine_read_after_out_of_band_delete_is_none() {
    // Arrange
    let (host, client) = setup();
    let id = host.add_machine("web", "Ubuntu_64", MachineState::PoweredOff);
    let resource = MachineResource::new(client.clone());
    let cancel = CancellationToken::new();
    let record = resource.import(&id, &cancel).await.unwrap();
    client
        .delete_by_id(&id, std::time::Duration::ZERO, &cancel)
        .await
        .unwrap();

    // Act
    let read = resource.read(&record, &cancel).await.unwrap();
    let deleted_again = resource.delete(&record, &cancel).await;

    // Assert
    assert_eq!(read, None);
    assert!(deleted_again.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_machine_import_by_name_mirrors_observed_state() {
    let (host, client) = setup();
    let id = host.add_machine("web", "Ubuntu_64", MachineState::Running);
    let resource = MachineResource::new(client);

    let record = resource.import("web", &CancellationToken::new()).await.unwrap();

    assert_eq!(record.id, id);
    assert_eq!(record.config.name, "web");
    assert_eq!(record.config.source, "");
    assert_eq!(record.config.state, DesiredState::Started);
    assert_eq!(record.config.wait_timeout, "20m");
    assert_eq!(record.current_state, MachineState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_machine_import_of_unknown_id_names_it() {
    let (_host, client) = setup();
    let resource = MachineResource::new(client);

    let diag = resource.import("ghost", &CancellationToken::new()).await.unwrap_err();

    assert_eq!(diag.summary, "Failed to import machine");
    assert!(diag.detail.contains("\"ghost\""), "detail: {}", diag.detail);
}

#[tokio::test(start_paused = true)]
async fn test_machine_create_failure_is_a_clone_diagnostic() {
    let (_host, client) = setup();
    let resource = MachineResource::new(client);

    let diag = resource
        .create(&MachineConfig::new("web", "missing"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(diag.summary, "Failed to clone VM");
}

// ── NAT port forward ──────────────────────────────────────────────────────────

fn nat_setup() -> (Arc<InMemoryVBox>, NatPortForwardResource, String) {
    let (host, client) = setup();
    let id = host.add_machine("web", "Ubuntu_64", MachineState::PoweredOff);
    (host, NatPortForwardResource::new(client), id)
}

#[tokio::test]
async fn test_nat_create_with_explicit_port_round_trips() {
    // Arrange
    let (host, resource, id) = nat_setup();
    let mut config = NatPortForwardConfig::new(&id, 0, "ssh", NatProtocol::Tcp, 2222, 22);
    config.host_ip = "127.0.0.1".to_string();
    let cancel = CancellationToken::new();

    // Act
    let created = resource.create(&config, &cancel).await.unwrap();
    let read = resource.read(&created, &cancel).await.unwrap();

    // Assert
    assert_eq!(created.id, format!("{id}:0:ssh"));
    assert_eq!(created.effective_host_port, 2222);
    assert_eq!(read, Some(created));
    assert_eq!(host.redirects(&id, 0), vec!["ssh,1,127.0.0.1,2222,,22".to_string()]);
}

#[tokio::test]
async fn test_nat_port_zero_without_auto_is_rejected() {
    let (host, resource, id) = nat_setup();
    let config = NatPortForwardConfig::new(&id, 0, "ssh", NatProtocol::Tcp, 0, 22);

    let diag = resource.create(&config, &CancellationToken::new()).await.unwrap_err();

    assert_eq!(diag.summary, "Invalid host port");
    assert!(diag.detail.contains("auto_host_port"));
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_nat_auto_port_picks_lowest_free() {
    // Arrange
    let (host, resource, id) = nat_setup();
    host.add_redirect(&id, 0, "http,1,,30000,,80");
    let mut config = NatPortForwardConfig::new(&id, 0, "ssh", NatProtocol::Tcp, 0, 22);
    config.auto_host_port = true;
    config.auto_host_port_min = 30000;
    config.auto_host_port_max = 30010;

    // Act
    let record = resource.create(&config, &CancellationToken::new()).await.unwrap();

    // Assert
    assert_eq!(record.config.host_port, 30001);
    assert_eq!(record.effective_host_port, 30001);
    assert!(record.config.auto_host_port);
}

#[tokio::test]
async fn test_nat_auto_knob_change_makes_no_remote_call() {
    // Arrange
    let (host, resource, id) = nat_setup();
    let mut config = NatPortForwardConfig::new(&id, 0, "ssh", NatProtocol::Tcp, 0, 22);
    config.auto_host_port = true;
    let cancel = CancellationToken::new();
    let created = resource.create(&config, &cancel).await.unwrap();
    host.clear_calls();

    // Act
    let mut plan = config.clone();
    plan.auto_host_port_max = 25000;
    let updated = resource.update(&created, &plan, &cancel).await.unwrap();

    // Assert
    assert!(host.calls().is_empty(), "calls: {:?}", host.calls());
    assert_eq!(updated.config.auto_host_port_max, 25000);
    assert_eq!(updated.config.host_port, created.config.host_port);
    assert_eq!(updated.effective_host_port, created.effective_host_port);
}

#[tokio::test]
async fn test_nat_guest_port_change_recreates_rule() {
    // Arrange
    let (host, resource, id) = nat_setup();
    let config = NatPortForwardConfig::new(&id, 0, "ssh", NatProtocol::Tcp, 2222, 22);
    let cancel = CancellationToken::new();
    let created = resource.create(&config, &cancel).await.unwrap();

    // Act
    let mut plan = config.clone();
    plan.guest_port = 2022;
    let updated = resource.update(&created, &plan, &cancel).await.unwrap();

    // Assert
    assert_eq!(updated.config.guest_port, 2022);
    assert_eq!(host.redirects(&id, 0), vec!["ssh,1,,2222,,2022".to_string()]);
}

#[tokio::test]
async fn test_nat_read_after_out_of_band_removal_is_none() {
    // Arrange
    let (host, resource, id) = nat_setup();
    let cancel = CancellationToken::new();
    let created = resource
        .create(&NatPortForwardConfig::new(&id, 0, "ssh", NatProtocol::Tcp, 2222, 22), &cancel)
        .await
        .unwrap();
    resource.delete(&created, &cancel).await.unwrap();

    // Act
    let read = resource.read(&created, &cancel).await.unwrap();
    let deleted_again = resource.delete(&created, &cancel).await;

    // Assert
    assert_eq!(read, None);
    assert!(deleted_again.is_ok());
    assert!(host.redirects(&id, 0).is_empty());
}

#[tokio::test]
async fn test_nat_import_reads_live_rule() {
    let (host, resource, id) = nat_setup();
    host.add_redirect(&id, 0, "dns,0,127.0.0.1,5353,10.0.2.15,53");

    let record = resource
        .import(&format!("{id}:0:dns"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(record.config.protocol, NatProtocol::Udp);
    assert_eq!(record.config.host_port, 5353);
    assert_eq!(record.config.guest_ip, "10.0.2.15");
    assert_eq!(record.effective_host_port, 5353);
    assert!(!record.config.auto_host_port);
}

#[tokio::test]
async fn test_nat_import_rejects_malformed_ids() {
    // Arrange
    let (host, resource, id) = nat_setup();
    let cancel = CancellationToken::new();

    // Act
    let two_parts = resource.import("vm:ssh", &cancel).await.unwrap_err();
    let bad_slot = resource.import("vm:9:ssh", &cancel).await.unwrap_err();
    let absent = resource.import(&format!("{id}:0:ssh"), &cancel).await.unwrap_err();

    // Assert
    assert_eq!(two_parts.summary, "Invalid import ID");
    assert_eq!(bad_slot.summary, "Invalid adapter slot");
    assert_eq!(absent.summary, "Failed to import NAT port forward rule");
    assert_eq!(host.call_count("find_machine"), 1);
}

#[tokio::test]
async fn test_nat_inverted_auto_range_is_rejected_on_update() {
    // Arrange
    let (host, resource, id) = nat_setup();
    let mut config = NatPortForwardConfig::new(&id, 0, "ssh", NatProtocol::Tcp, 0, 22);
    config.auto_host_port = true;
    let cancel = CancellationToken::new();
    let created = resource.create(&config, &cancel).await.unwrap();
    host.clear_calls();

    // Act: only the auto knobs change, but the range is inverted
    let mut plan = config.clone();
    plan.auto_host_port_min = 30000;
    plan.auto_host_port_max = 25000;
    let diag = resource.update(&created, &plan, &cancel).await.unwrap_err();

    // Assert
    assert_eq!(diag.summary, "Invalid NAT port forward configuration");
    assert!(diag.detail.contains("auto_host_port_max"), "detail: {}", diag.detail);
    assert!(host.calls().is_empty());
    assert_eq!(host.redirects(&id, 0).len(), 1);
}
