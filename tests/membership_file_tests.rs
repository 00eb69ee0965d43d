//! Loading cluster membership from JSON files

use clusterboot::clock::ManualClock;
use clusterboot::cluster::{FileDirectory, LocalDirectory, MembershipDirectory, NodeFilter, Role};
use clusterboot::config::BootstrapConfig;
use clusterboot::resolver::Resolved;
use clusterboot::run::BootstrapRun;
use clusterboot::topology::Topology;
use clusterboot::wait::GateState;
use clusterboot::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn membership() -> serde_json::Value {
    json!({
        "nodes": [
            {
                "name": "nn1",
                "address": "10.0.1.1",
                "roles": ["metadata-service"],
                "facet_name": "nn",
                "facet_index": 0,
                "planes": {
                    "data": { "address": "172.16.1.1", "device": "eth1" }
                }
            },
            {
                "name": "nn2",
                "address": "10.0.1.2",
                "roles": ["primary-metadata-service"],
                "facet_name": "nn",
                "facet_index": 1
            },
            {
                "name": "w1",
                "address": "10.0.5.1",
                "roles": ["storage-worker", "task-worker"],
                "facet_name": "workers",
                "resources": { "cores": 8, "memory_bytes": 17179869184u64 }
            }
        ],
        "services": [
            {
                "service": "primary-metadata-service",
                "node": "nn1",
                "address": "172.16.1.1",
                "status": "running",
                "registered_at": "2026-01-01T00:00:00Z"
            }
        ]
    })
}

async fn write_membership(value: &serde_json::Value) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    tokio::fs::write(file.path(), serde_json::to_vec_pretty(value).unwrap())
        .await
        .unwrap();
    file
}

#[tokio::test]
async fn test_load_and_run_from_file() {
    let file = write_membership(&membership()).await;
    let dir = Arc::new(LocalDirectory::from_file(file.path()).await.unwrap());

    assert_eq!(
        dir.count_nodes(&NodeFilter::role(Role::PrimaryMetadataService))
            .await
            .unwrap(),
        2
    );

    let run = BootstrapRun::builder(dir.clone())
        .config(BootstrapConfig::default())
        .clock(Arc::new(ManualClock::new()))
        .start("w1")
        .await
        .unwrap();

    assert_eq!(
        run.classify(Role::PrimaryMetadataService).await.unwrap(),
        Topology::HaPair
    );
    assert_eq!(run.resource_profile().child_heap_mb, 1205);
    // announced provider address wins
    assert_eq!(
        run.resolve_address(Role::PrimaryMetadataService, true)
            .await
            .unwrap(),
        Resolved::Address("172.16.1.1".to_string())
    );
}

#[tokio::test]
async fn test_duplicate_node_names_rejected() {
    let mut value = membership();
    let first = value["nodes"][0].clone();
    value["nodes"].as_array_mut().unwrap().push(first);
    let file = write_membership(&value).await;

    let err = LocalDirectory::from_file(file.path()).await.unwrap_err();
    assert!(matches!(err, Error::Config(msg) if msg.contains("nn1")));
}

#[tokio::test]
async fn test_unknown_role_tag_rejected() {
    let mut value = membership();
    value["nodes"][2]["roles"] = json!(["storage-worker", "data-node"]);
    let file = write_membership(&value).await;

    let err = LocalDirectory::from_file(file.path()).await.unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}

#[tokio::test]
async fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = LocalDirectory::from_file(dir.path().join("absent.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[tokio::test]
async fn test_unknown_local_node() {
    let file = write_membership(&membership()).await;
    let dir = Arc::new(LocalDirectory::from_file(file.path()).await.unwrap());

    let result = BootstrapRun::builder(dir).start("ghost").await;
    assert!(matches!(result, Err(Error::UnknownNode(_))));
}

#[tokio::test]
async fn test_shared_facet_index_rejected() {
    let mut value = membership();
    value["nodes"][1]["facet_index"] = json!(0);
    let file = write_membership(&value).await;

    let err = LocalDirectory::from_file(file.path()).await.unwrap_err();
    assert!(matches!(err, Error::Config(msg) if msg.contains("nn2") && msg.contains("facet nn")));
    assert!(FileDirectory::open(file.path()).await.is_err());
}

#[tokio::test]
async fn test_gate_sees_announcements_written_by_other_nodes() {
    let mut value = membership();
    value["services"] = json!([]);
    let file = write_membership(&value).await;
    let config = BootstrapConfig {
        wait: clusterboot::config::WaitSettings {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        },
        ..BootstrapConfig::default()
    };

    // each node opens the shared file on its own
    let worker_dir = Arc::new(FileDirectory::open(file.path()).await.unwrap());
    let worker = BootstrapRun::builder(worker_dir)
        .config(config.clone())
        .clock(Arc::new(ManualClock::new()))
        .start("w1")
        .await
        .unwrap();

    let err = worker
        .gate_startup(Role::StorageWorker)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TimeoutExceeded { observed: 0, .. }));

    let metadata_dir = Arc::new(FileDirectory::open(file.path()).await.unwrap());
    let metadata = BootstrapRun::builder(metadata_dir)
        .config(config)
        .clock(Arc::new(ManualClock::new()))
        .start("nn1")
        .await
        .unwrap();
    assert!(metadata
        .provide_service(Role::PrimaryMetadataService)
        .await
        .unwrap());

    let gates = worker.gate_startup(Role::StorageWorker).await.unwrap();
    assert_eq!(gates.len(), 1);
    assert!(matches!(gates[0].state, GateState::Satisfied { observed: 1, .. }));

    // the announcement outlives both directories
    let reloaded = LocalDirectory::from_file(file.path()).await.unwrap();
    let providers = reloaded
        .find_providers("primary-metadata-service")
        .await
        .unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].address, "172.16.1.1");
}
