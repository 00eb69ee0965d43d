//! End-to-end bootstrap runs against an in-memory directory
//!
//! Every test drives a [`BootstrapRun`] on a [`ManualClock`], so waits that
//! time out finish instantly and tests can assert that nothing slept.

use clusterboot::clock::{Clock, ManualClock};
use clusterboot::cluster::{
    LocalDirectory, MembershipDirectory, NetworkPlane, Node, PlaneBinding, Role,
};
use clusterboot::config::{BootstrapConfig, DeploymentGeneration, OverrideTable, WaitSettings};
use clusterboot::resolver::Resolved;
use clusterboot::run::BootstrapRun;
use clusterboot::topology::Topology;
use clusterboot::tuning::compute_profile;
use clusterboot::wait::{BypassReason, GateState};
use clusterboot::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn wait_config() -> BootstrapConfig {
    BootstrapConfig {
        wait: WaitSettings {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        },
        ..BootstrapConfig::default()
    }
}

async fn start(
    directory: &Arc<LocalDirectory>,
    clock: &Arc<ManualClock>,
    config: BootstrapConfig,
    node: &str,
) -> BootstrapRun {
    BootstrapRun::builder(directory.clone())
        .config(config)
        .clock(clock.clone())
        .start(node)
        .await
        .unwrap()
}

fn metadata(name: &str, address: &str, facet: &str, index: u32) -> Node {
    Node::new(name, address)
        .with_role(Role::PrimaryMetadataService)
        .in_facet(facet, index)
}

fn with_role(name: &str, address: &str, role: Role) -> Node {
    Node::new(name, address).with_role(role).in_facet(role.as_str(), 0)
}

/// HA metadata pair with log replicas, a coordination ensemble, a resource
/// manager and one worker.
fn ha_cluster() -> Arc<LocalDirectory> {
    let dir = LocalDirectory::new();
    dir.upsert_node(metadata("nn1", "10.0.1.1", "nn", 0));
    dir.upsert_node(metadata("nn2", "10.0.1.2", "nn", 1));
    for i in 1..=3 {
        dir.upsert_node(with_role(&format!("jn{i}"), &format!("10.0.3.{i}"), Role::LogReplica));
        dir.upsert_node(with_role(
            &format!("zk{i}"),
            &format!("10.0.4.{i}"),
            Role::CoordinationPeer,
        ));
    }
    dir.upsert_node(with_role("rm1", "10.0.2.1", Role::ResourceManager));
    dir.upsert_node(
        Node::new("w1", "10.0.5.1")
            .with_role(Role::StorageWorker)
            .with_role(Role::TaskWorker)
            .in_facet("workers", 0)
            .with_resources(8, 16384),
    );
    Arc::new(dir)
}

/// Single metadata node whose data plane differs from its identity address.
fn classic_cluster() -> Arc<LocalDirectory> {
    let dir = LocalDirectory::new();
    dir.upsert_node(metadata("nn1", "10.0.1.1", "nn", 0).with_plane(
        NetworkPlane::Data,
        PlaneBinding {
            address: "172.16.1.1".to_string(),
            device: Some("eth1".to_string()),
        },
    ));
    dir.upsert_node(with_role("jn1", "10.0.3.1", Role::LogReplica));
    dir.upsert_node(
        Node::new("w1", "10.0.5.1")
            .with_role(Role::StorageWorker)
            .in_facet("workers", 0)
            .with_resources(4, 8192),
    );
    Arc::new(dir)
}

#[tokio::test]
async fn test_scenario_single_metadata_node() {
    let dir = LocalDirectory::new();
    dir.upsert_node(
        Node::new("nn1", "10.0.1.1")
            .with_role("metadata-service".parse().unwrap())
            .in_facet("nn", 0),
    );
    let dir = Arc::new(dir);
    let run = start(&dir, &Arc::new(ManualClock::new()), wait_config(), "nn1").await;

    assert_eq!(
        run.classify(Role::PrimaryMetadataService).await.unwrap(),
        Topology::Single
    );
    assert!(!run
        .ha_or_federation_active(Role::PrimaryMetadataService)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_scenario_ha_pair_primary_is_index_zero() {
    let dir = ha_cluster();
    let run = start(&dir, &Arc::new(ManualClock::new()), wait_config(), "nn2").await;

    assert_eq!(
        run.classify(Role::PrimaryMetadataService).await.unwrap(),
        Topology::HaPair
    );
    let layout = run.facet_layout(Role::PrimaryMetadataService).await.unwrap();
    let primary = layout.primary_of("nn").unwrap();
    assert_eq!(primary.name, "nn1");
    assert!(BootstrapRun::is_primary(primary));
    assert!(!BootstrapRun::is_primary(run.local_node()));
    assert!(run
        .local_facet_is_ha(Role::PrimaryMetadataService)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_scenario_federation() {
    let dir = LocalDirectory::new();
    dir.upsert_node(metadata("nn-c", "10.0.1.3", "ns-c", 0));
    dir.upsert_node(metadata("nn-a", "10.0.1.1", "ns-a", 0));
    dir.upsert_node(metadata("nn-b", "10.0.1.2", "ns-b", 0));
    let dir = Arc::new(dir);
    let run = start(&dir, &Arc::new(ManualClock::new()), wait_config(), "nn-a").await;

    assert_eq!(
        run.classify(Role::PrimaryMetadataService).await.unwrap(),
        Topology::Federation
    );
    assert_eq!(
        run.facet_names(Role::PrimaryMetadataService).await.unwrap(),
        vec!["ns-a", "ns-b", "ns-c"]
    );
    let addresses = run
        .facet_addresses(Role::PrimaryMetadataService)
        .await
        .unwrap();
    assert_eq!(addresses["ns-b"], vec!["10.0.1.2"]);
    assert!(!run
        .local_facet_is_ha(Role::PrimaryMetadataService)
        .await
        .unwrap());
}

#[test]
fn test_scenario_eight_core_profile() {
    let profile = compute_profile(8, 16384, 0);
    assert_eq!(profile.max_map_tasks, 7);
    assert_eq!(profile.max_reduce_tasks, 4);
    assert_eq!(profile.sort_buffer_mb, 300);
    // floor((16384 - 1024 - 2100) / 11)
    assert_eq!(profile.child_heap_mb, 1205);
    assert_eq!(profile.child_ulimit_kb, 3 * 1205 * 1024);
}

#[tokio::test]
async fn test_absent_dependency_never_blocks() {
    let dir = classic_cluster();
    let clock = Arc::new(ManualClock::new());
    let run = start(&dir, &clock, wait_config(), "w1").await;

    let resolved = run
        .resolve_address(Role::JobCoordinator, true)
        .await
        .unwrap();
    assert_eq!(resolved, Resolved::Absent);
    assert_eq!(clock.now(), Duration::ZERO);
}

#[tokio::test]
async fn test_override_is_trusted_without_waiting() {
    let dir = classic_cluster();
    let clock = Arc::new(ManualClock::new());
    let config = BootstrapConfig {
        overrides: OverrideTable::new().with(Role::JobCoordinator, "10.9.9.9", Some(9001)),
        ..wait_config()
    };
    let run = start(&dir, &clock, config, "w1").await;

    assert_eq!(
        run.resolve_address(Role::JobCoordinator, true).await.unwrap(),
        Resolved::Address("10.9.9.9".to_string())
    );
    assert_eq!(run.resolver().resolve_port(Role::JobCoordinator), 9001);
    assert_eq!(run.resolver().resolve_port(Role::PrimaryMetadataService), 8020);
    assert_eq!(clock.now(), Duration::ZERO);
}

#[tokio::test]
async fn test_self_registration_writes_only_on_change() {
    let dir = classic_cluster();
    let run = start(&dir, &Arc::new(ManualClock::new()), wait_config(), "jn1").await;

    // a log replica answers for the metadata service itself
    let first = run
        .resolve_address(Role::PrimaryMetadataService, true)
        .await
        .unwrap();
    assert_eq!(first, Resolved::Address("10.0.3.1".to_string()));
    assert_eq!(dir.writes(), 1);

    let second = run
        .resolve_address(Role::PrimaryMetadataService, true)
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(dir.writes(), 1);

    let node = dir.get_node("jn1").await.unwrap().unwrap();
    assert_eq!(node.registered_address.as_deref(), Some("10.0.3.1"));
}

#[tokio::test]
async fn test_provider_verified_resolution() {
    let dir = classic_cluster();
    let clock = Arc::new(ManualClock::new());
    let worker = start(&dir, &clock, wait_config(), "w1").await;

    // metadata service not announced yet: the barrier times out and the run fails
    let err = worker
        .resolve_address(Role::PrimaryMetadataService, true)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        Error::TimeoutExceeded { expected: 1, observed: 0, .. }
    ));
    assert!(clock.now() >= Duration::from_secs(30));
    assert!(clock.now() < Duration::from_secs(35));

    let metadata = start(&dir, &clock, wait_config(), "nn1").await;
    assert!(metadata
        .provide_service(Role::PrimaryMetadataService)
        .await
        .unwrap());

    let resolved = worker
        .resolve_address(Role::PrimaryMetadataService, true)
        .await
        .unwrap();
    assert_eq!(resolved, Resolved::Address("172.16.1.1".to_string()));
}

#[tokio::test]
async fn test_metadata_nodes_skip_liveness_for_compute_layer() {
    let dir = ha_cluster();
    let clock = Arc::new(ManualClock::new());
    let run = start(&dir, &clock, wait_config(), "nn1").await;

    // resource manager holds the role but never announced its service
    let resolved = run
        .resolve_address(Role::ResourceManager, true)
        .await
        .unwrap();
    assert_eq!(resolved, Resolved::Address("10.0.2.1".to_string()));
    assert_eq!(clock.now(), Duration::ZERO);
}

#[tokio::test]
async fn test_local_fallback_can_be_disabled() {
    let dir = classic_cluster();
    let run = start(&dir, &Arc::new(ManualClock::new()), wait_config(), "nn1").await;

    // the node still holds the role, so the barrier is bypassed, but nothing
    // is self-registered
    let resolved = run
        .resolve_address(Role::PrimaryMetadataService, false)
        .await
        .unwrap();
    assert_eq!(resolved, Resolved::Address("172.16.1.1".to_string()));
    assert_eq!(dir.writes(), 0);
}

#[tokio::test]
async fn test_ha_metadata_waits_for_every_log_replica() {
    let dir = ha_cluster();
    let clock = Arc::new(ManualClock::new());
    for name in ["jn1", "jn2"] {
        let replica = start(&dir, &clock, wait_config(), name).await;
        replica.provide_service(Role::LogReplica).await.unwrap();
    }

    let run = start(&dir, &clock, wait_config(), "nn1").await;
    let err = run
        .gate_startup(Role::PrimaryMetadataService)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TimeoutExceeded { expected: 3, observed: 2, .. }
    ));

    let replica = start(&dir, &clock, wait_config(), "jn3").await;
    replica.provide_service(Role::LogReplica).await.unwrap();

    let gates = run.gate_startup(Role::PrimaryMetadataService).await.unwrap();
    assert_eq!(gates.len(), 1);
    assert_eq!(gates[0].service, "log-replica");
    assert!(matches!(
        gates[0].state,
        GateState::Satisfied { observed: 3, waited } if waited == Duration::ZERO
    ));
}

#[tokio::test]
async fn test_single_metadata_node_does_not_wait_for_log_replicas() {
    let dir = classic_cluster();
    let clock = Arc::new(ManualClock::new());
    let run = start(&dir, &clock, wait_config(), "nn1").await;

    let gates = run.gate_startup(Role::PrimaryMetadataService).await.unwrap();
    assert!(gates.is_empty());
    assert_eq!(clock.now(), Duration::ZERO);
}

#[tokio::test]
async fn test_absent_prerequisite_opens_gate() {
    let dir = LocalDirectory::new();
    dir.upsert_node(with_role("ts1", "10.0.6.1", Role::TableServer));
    let dir = Arc::new(dir);
    let clock = Arc::new(ManualClock::new());
    let run = start(&dir, &clock, wait_config(), "ts1").await;

    let gates = run.gate_startup(Role::TableServer).await.unwrap();
    assert_eq!(gates.len(), 1);
    assert_eq!(
        gates[0].state,
        GateState::Bypassed {
            reason: BypassReason::Absent
        }
    );
    assert_eq!(clock.now(), Duration::ZERO);
}

#[tokio::test]
async fn test_task_worker_gate_follows_deployment_generation() {
    let dir = ha_cluster();
    let clock = Arc::new(ManualClock::new());
    let rm = start(&dir, &clock, wait_config(), "rm1").await;
    rm.provide_service(Role::ResourceManager).await.unwrap();

    let run = start(&dir, &clock, wait_config(), "w1").await;
    let gates = run.gate_startup(Role::TaskWorker).await.unwrap();
    assert_eq!(gates.len(), 1);
    assert_eq!(gates[0].service, "resource-manager");

    let classic = BootstrapConfig {
        deployment: DeploymentGeneration::Classic,
        overrides: OverrideTable::new().with(Role::JobCoordinator, "10.9.9.9", None),
        ..wait_config()
    };
    let run = start(&dir, &clock, classic, "w1").await;
    let gates = run.gate_startup(Role::TaskWorker).await.unwrap();
    assert_eq!(gates.len(), 1);
    assert_eq!(
        gates[0].state,
        GateState::Bypassed {
            reason: BypassReason::OperatorOverride
        }
    );
}

#[tokio::test]
async fn test_assemble_ha_resource_managed() {
    let dir = ha_cluster();
    let clock = Arc::new(ManualClock::new());
    let run = start(&dir, &clock, wait_config(), "nn1").await;

    let vars = run.assemble().await.unwrap();

    assert_eq!(vars.get("metadata_address"), Some(&json!("10.0.1.1")));
    assert_eq!(vars.get("metadata_port"), Some(&json!(8020)));
    assert_eq!(vars.get("metadata_topology"), Some(&json!("ha_pair")));
    assert_eq!(vars.get("resource_manager_address"), Some(&json!("10.0.2.1")));
    assert!(!vars.contains("job_coordinator_address"));
    assert_eq!(vars.get("nameservices"), Some(&json!(["nn"])));
    assert_eq!(
        vars.get("metadata_facets"),
        Some(&json!({"nn": ["10.0.1.1", "10.0.1.2"]}))
    );
    assert_eq!(
        vars.get("log_replica_quorum"),
        Some(&json!("10.0.3.1:8485;10.0.3.2:8485;10.0.3.3:8485"))
    );
    assert_eq!(
        vars.get("coordination_quorum"),
        Some(&json!("10.0.4.1:2181,10.0.4.2:2181,10.0.4.3:2181"))
    );
    assert_eq!(
        vars.get("coordination_servers"),
        Some(&json!([
            "server.0=10.0.4.1:2888:3888",
            "server.1=10.0.4.2:2888:3888",
            "server.2=10.0.4.3:2888:3888"
        ]))
    );
    assert!(!vars.contains("log_replica_edits_dir"));
    assert_eq!(clock.now(), Duration::ZERO);
}

#[tokio::test]
async fn test_assemble_classic_worker() {
    let dir = classic_cluster();
    let clock = Arc::new(ManualClock::new());
    let metadata = start(&dir, &clock, wait_config(), "nn1").await;
    metadata
        .provide_service(Role::PrimaryMetadataService)
        .await
        .unwrap();

    let run = start(&dir, &clock, wait_config(), "w1").await;
    let vars = run.assemble().await.unwrap();

    assert_eq!(vars.get("metadata_address"), Some(&json!("172.16.1.1")));
    assert_eq!(vars.get("job_coordinator_address"), Some(&json!(null)));
    assert_eq!(vars.get("job_coordinator_port"), Some(&json!(8021)));
    assert_eq!(vars.get("data_bind_address"), Some(&json!("10.0.5.1")));
    assert_eq!(vars.get("max_map_tasks"), Some(&json!(4)));
    assert!(!vars.contains("nameservices"));
    assert!(!vars.contains("log_replica_quorum"));
    assert!(!vars.contains("resource_manager_address"));
}

#[tokio::test]
async fn test_log_replica_gets_edits_dir() {
    let dir = classic_cluster();
    let config = BootstrapConfig {
        log_replica_edits_dir: "/data/edits".to_string(),
        ..wait_config()
    };
    let run = start(&dir, &Arc::new(ManualClock::new()), config, "jn1").await;

    let vars = run.assemble().await.unwrap();
    assert_eq!(vars.get("log_replica_edits_dir"), Some(&json!("/data/edits")));
    assert_eq!(vars.get("metadata_address"), Some(&json!("10.0.3.1")));
}

#[tokio::test]
async fn test_paired_facet_beside_singleton_is_mixed() {
    let dir = LocalDirectory::new();
    dir.upsert_node(metadata("a0", "10.0.1.1", "ns-a", 0));
    dir.upsert_node(metadata("a1", "10.0.1.2", "ns-a", 1));
    dir.upsert_node(metadata("b0", "10.0.1.3", "ns-b", 0));
    let dir = Arc::new(dir);
    let run = start(&dir, &Arc::new(ManualClock::new()), wait_config(), "b0").await;

    assert_eq!(
        run.classify(Role::PrimaryMetadataService).await.unwrap(),
        Topology::HaFederation
    );
    assert!(!run
        .local_facet_is_ha(Role::PrimaryMetadataService)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_assembly_uses_one_metadata_snapshot() {
    let dir = classic_cluster();
    let clock = Arc::new(ManualClock::new());
    let metadata_run = start(&dir, &clock, wait_config(), "nn1").await;
    metadata_run
        .provide_service(Role::PrimaryMetadataService)
        .await
        .unwrap();

    let run = start(&dir, &clock, wait_config(), "w1").await;
    assert_eq!(
        run.facet_names(Role::PrimaryMetadataService).await.unwrap(),
        vec!["nn"]
    );

    // a second metadata node joins the facet after the layout was read
    dir.upsert_node(metadata("nn2", "10.0.1.2", "nn", 1));

    let vars = run.assemble().await.unwrap();
    assert_eq!(vars.get("metadata_topology"), Some(&json!("single")));
    assert!(!vars.contains("nameservices"));
    assert!(!vars.contains("metadata_facets"));

    // a live classification sees the newcomer
    assert_eq!(
        run.classify(Role::PrimaryMetadataService).await.unwrap(),
        Topology::HaPair
    );
}

#[tokio::test]
async fn test_facet_primary_registers_facet_identity_once() {
    let dir = ha_cluster();
    let clock = Arc::new(ManualClock::new());

    let primary = start(&dir, &clock, wait_config(), "nn1").await;
    let replica = start(&dir, &clock, wait_config(), "nn2").await;

    // the replica answers for itself but leaves the facet identity alone
    assert_eq!(
        replica
            .resolve_address(Role::PrimaryMetadataService, true)
            .await
            .unwrap(),
        Resolved::Address("10.0.1.2".to_string())
    );
    assert_eq!(dir.writes(), 1);
    assert!(dir.facet_identity("nn").await.unwrap().is_none());

    // own address plus the facet identity
    primary
        .resolve_address(Role::PrimaryMetadataService, true)
        .await
        .unwrap();
    assert_eq!(dir.writes(), 3);
    assert_eq!(
        dir.facet_identity("nn").await.unwrap().as_deref(),
        Some("10.0.1.1")
    );

    primary
        .resolve_address(Role::PrimaryMetadataService, true)
        .await
        .unwrap();
    replica
        .resolve_address(Role::PrimaryMetadataService, true)
        .await
        .unwrap();
    assert_eq!(dir.writes(), 3);
}

#[tokio::test]
async fn test_unreplicated_facet_registers_no_identity() {
    let dir = classic_cluster();
    let run = start(&dir, &Arc::new(ManualClock::new()), wait_config(), "nn1").await;

    run.resolve_address(Role::PrimaryMetadataService, true)
        .await
        .unwrap();
    assert_eq!(dir.writes(), 1);
    assert!(dir.facet_identity("nn").await.unwrap().is_none());
}
