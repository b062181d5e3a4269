//! Integration tests for the swarm provisioner
//!
//! Every test runs the provisioner against an in-process swarm and store and
//! checks the calls the control plane saw.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dockyard::cluster::{
    ClusterClient, ImageConfig, MemoryCluster, RunResult, ServiceMode, ServiceSpec, LABEL_APP_IMAGE,
    LABEL_BUILD_IMAGE, LABEL_IS_BUILD, LABEL_NODE_ADDR,
};
use dockyard::config::SwarmConfig;
use dockyard::image::CustomData;
use dockyard::provision::{
    AddNodeOptions, App, ProvisionError, Provisioner, ProvisionerContext, RemoveNodeOptions,
    SwarmProvisioner, UnitStatus,
};
use dockyard::store::{ImageStore, MemberStore, MemoryStore};

const NODE_1: &str = "http://10.0.0.1:2375";
const NODE_2: &str = "http://10.0.0.2:2375";
const PLATFORM_IMAGE: &str = "registry.local:5000/dockyard/python";

struct Harness {
    provisioner: SwarmProvisioner,
    cluster: MemoryCluster,
    store: Arc<MemoryStore>,
}

fn harness() -> Harness {
    let config = SwarmConfig {
        registry: Some("registry.local:5000".to_string()),
        task_poll_interval_ms: 5,
        task_max_wait_secs: 1,
        ..Default::default()
    };
    let cluster = MemoryCluster::new();
    let store = Arc::new(MemoryStore::new());
    let provisioner = SwarmProvisioner::new(ProvisionerContext {
        config: Arc::new(config),
        connector: Arc::new(cluster.clone()),
        images: store.clone(),
        members: store.clone(),
    });
    Harness {
        provisioner,
        cluster,
        store,
    }
}

fn add(address: &str) -> AddNodeOptions {
    AddNodeOptions {
        address: address.to_string(),
        metadata: HashMap::new(),
    }
}

/// Harness with a one-node swarm
async fn cluster_with_node() -> Harness {
    let h = harness();
    h.provisioner.add_node(&add(NODE_1)).await.unwrap();
    h
}

fn entrypoint_image(entrypoint: &[&str], ports: &[&str]) -> ImageConfig {
    let exposed: HashMap<String, serde_json::Value> = ports
        .iter()
        .map(|p| (p.to_string(), serde_json::json!({})))
        .collect();
    ImageConfig {
        entrypoint: Some(entrypoint.iter().map(|s| s.to_string()).collect()),
        cmd: None,
        exposed_ports: if exposed.is_empty() {
            None
        } else {
            Some(exposed)
        },
    }
}

fn app() -> App {
    App::new("myapp", "python")
}

fn count_calls(calls: &[String], prefix: &str) -> usize {
    calls.iter().filter(|c| c.starts_with(prefix)).count()
}

// ============================================================================
// Node lifecycle
// ============================================================================

#[tokio::test]
async fn test_add_node_inits_then_joins() {
    let h = harness();

    let mut opts = add(NODE_1);
    opts.metadata.insert("pool".to_string(), "web".to_string());
    h.provisioner.add_node(&opts).await.unwrap();
    h.provisioner.add_node(&add(NODE_2)).await.unwrap();

    let calls = h.cluster.calls().await;
    assert_eq!(calls[0], format!("init_swarm:{}", NODE_1));
    assert_eq!(count_calls(&calls, "init_swarm:"), 1);
    assert!(calls.contains(&format!("join_swarm:{}", NODE_2)));

    let nodes = h.provisioner.list_nodes(&[]).await.unwrap();
    assert_eq!(nodes.len(), 2);
    let first = h.provisioner.get_node("http://10.0.0.1:9999").await.unwrap();
    assert_eq!(
        first.spec.labels.get(LABEL_NODE_ADDR).map(String::as_str),
        Some(NODE_1)
    );
    assert_eq!(first.metadata().get("pool").map(String::as_str), Some("web"));

    let members = h.store.members().await.unwrap();
    assert!(members.contains(&NODE_1.to_string()));
    assert!(members.contains(&NODE_2.to_string()));
}

#[tokio::test]
async fn test_list_nodes_without_cluster_is_empty() {
    let h = harness();
    assert!(h.provisioner.list_nodes(&[]).await.unwrap().is_empty());
    assert!(matches!(
        h.provisioner.get_node(NODE_1).await,
        Err(ProvisionError::NodeNotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_node_with_rebalance_drains_first() {
    let h = cluster_with_node().await;
    h.provisioner.add_node(&add(NODE_2)).await.unwrap();
    let node = h.provisioner.get_node(NODE_2).await.unwrap();

    h.provisioner
        .remove_node(&RemoveNodeOptions {
            address: NODE_2.to_string(),
            rebalance: true,
        })
        .await
        .unwrap();

    let calls = h.cluster.calls().await;
    let drain = calls
        .iter()
        .position(|c| c == &format!("update_node:{}:drain", node.id))
        .expect("node was not drained");
    let remove = calls
        .iter()
        .position(|c| c == &format!("remove_node:{}", node.id))
        .expect("node was not removed");
    assert!(drain < remove);

    assert_eq!(h.provisioner.list_nodes(&[]).await.unwrap().len(), 1);
    assert_eq!(h.store.members().await.unwrap(), vec![NODE_1.to_string()]);
}

#[tokio::test]
async fn test_remove_node_without_rebalance_skips_drain() {
    let h = cluster_with_node().await;
    h.provisioner.add_node(&add(NODE_2)).await.unwrap();
    let node = h.provisioner.get_node(NODE_2).await.unwrap();

    h.provisioner
        .remove_node(&RemoveNodeOptions {
            address: NODE_2.to_string(),
            rebalance: false,
        })
        .await
        .unwrap();

    let calls = h.cluster.calls().await;
    assert!(!calls.iter().any(|c| c.ends_with(":drain")));
    assert!(calls.contains(&format!("remove_node:{}", node.id)));
}

#[tokio::test]
async fn test_remove_unknown_node() {
    let h = cluster_with_node().await;
    let result = h
        .provisioner
        .remove_node(&RemoveNodeOptions {
            address: "http://10.9.9.9:2375".to_string(),
            rebalance: true,
        })
        .await;
    assert!(matches!(result, Err(ProvisionError::NodeNotFound(_))));
}

// ============================================================================
// Image deploys
// ============================================================================

#[tokio::test]
async fn test_image_deploy_from_procfile() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image("myorg/api", entrypoint_image(&["./api"], &["8080/tcp"]))
        .await;
    h.cluster
        .set_run_result(
            "myorg/api:latest",
            RunResult::success("web: ./api --port $PORT\nworker: ./jobs\n"),
        )
        .await;

    let mut events = Vec::new();
    let image = h
        .provisioner
        .image_deploy(&app(), "myorg/api", &mut events)
        .await
        .unwrap();
    assert_eq!(image, "registry.local:5000/dockyard/app-myapp:v1");

    let events = String::from_utf8(events).unwrap();
    assert!(events.starts_with("---- Pulling image ----\n"));
    assert!(events.contains("  ---> Process web found with command: ./api --port $PORT\n"));
    assert!(events.contains("  ---> Process worker found with command: ./jobs\n"));

    let calls = h.cluster.calls().await;
    assert!(calls.contains(
        &"tag_image:myorg/api:latest:registry.local:5000/dockyard/app-myapp:v1".to_string()
    ));
    assert_eq!(
        h.cluster.pushed_images().await,
        vec!["registry.local:5000/dockyard/app-myapp:v1"]
    );

    let services = h.cluster.services().await;
    let mut names: Vec<&str> = services.iter().map(|s| s.spec.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["myapp-web", "myapp-worker"]);
    let env = &services[0].spec.task_template.container_spec.env;
    assert!(env.contains(&"PORT=8080".to_string()));

    assert_eq!(
        h.store.current_image("myapp").await.unwrap().as_deref(),
        Some("registry.local:5000/dockyard/app-myapp:v1")
    );
}

#[tokio::test]
async fn test_image_deploy_falls_back_to_entrypoint() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image("myorg/py:1.0", entrypoint_image(&["python", "app.py"], &[]))
        .await;

    let mut events = Vec::new();
    let image = h
        .provisioner
        .image_deploy(&app(), "myorg/py:1.0", &mut events)
        .await
        .unwrap();

    let metadata = h.store.image_metadata(&image).await.unwrap();
    let mut expected = BTreeMap::new();
    expected.insert("web".to_string(), "python \"app.py\"".to_string());
    assert_eq!(metadata.processes(), expected);

    let events = String::from_utf8(events).unwrap();
    assert!(events.contains("  ---> Procfile not found, trying to get entrypoint\n"));
}

#[tokio::test]
async fn test_image_deploy_twice_updates_service() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image("myorg/py", entrypoint_image(&["python", "app.py"], &[]))
        .await;

    let mut events = Vec::new();
    h.provisioner
        .image_deploy(&app(), "myorg/py", &mut events)
        .await
        .unwrap();
    let second = h
        .provisioner
        .image_deploy(&app(), "myorg/py", &mut events)
        .await
        .unwrap();
    assert_eq!(second, "registry.local:5000/dockyard/app-myapp:v2");

    let calls = h.cluster.calls().await;
    assert_eq!(count_calls(&calls, "create_service:myapp-web"), 1);
    assert_eq!(count_calls(&calls, "update_service:myapp-web"), 1);

    let services = h.cluster.services().await;
    assert_eq!(services.len(), 1);
    assert_eq!(
        services[0].spec.labels.get(LABEL_APP_IMAGE).map(String::as_str),
        Some(second.as_str())
    );
    assert_eq!(services[0].version.index, 2);
}

#[tokio::test]
async fn test_image_deploy_rejects_multiple_ports() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image(
            "myorg/multi",
            entrypoint_image(&["./serve"], &["80/tcp", "443/tcp"]),
        )
        .await;

    let mut events = Vec::new();
    let result = h
        .provisioner
        .image_deploy(&app(), "myorg/multi", &mut events)
        .await;
    assert!(matches!(result, Err(ProvisionError::TooManyPorts { .. })));

    let calls = h.cluster.calls().await;
    assert_eq!(count_calls(&calls, "create_service:myapp-web"), 0);
    assert_eq!(count_calls(&calls, "update_service:"), 0);
    assert_eq!(count_calls(&calls, "tag_image:"), 0);
    assert!(h.cluster.services().await.is_empty());
    assert!(h.store.current_image("myapp").await.unwrap().is_none());
}

#[tokio::test]
async fn test_image_deploy_without_procfile_or_entrypoint() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image("myorg/empty", ImageConfig::default())
        .await;

    let mut events = Vec::new();
    let result = h
        .provisioner
        .image_deploy(&app(), "myorg/empty", &mut events)
        .await;
    assert!(matches!(
        result,
        Err(ProvisionError::NoProcfileOrEntrypoint(_))
    ));
    assert!(h.cluster.services().await.is_empty());
}

#[tokio::test]
async fn test_deploy_without_cluster() {
    let h = harness();
    let mut events = Vec::new();
    let result = h
        .provisioner
        .image_deploy(&app(), "myorg/api", &mut events)
        .await;
    assert!(matches!(result, Err(ProvisionError::NoCluster)));
}

// ============================================================================
// Archive deploys
// ============================================================================

#[tokio::test]
async fn test_archive_deploy_uses_registered_processes() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image(PLATFORM_IMAGE, entrypoint_image(&["/bin/sh"], &[]))
        .await;
    h.cluster
        .set_run_result(PLATFORM_IMAGE, RunResult::success("installing deps\n"))
        .await;

    // What a build reports through register-unit before it exits
    let mut data = CustomData::new();
    data.insert(
        "procfile".to_string(),
        serde_json::json!("web: gunicorn app\nclock: python clock.py\n"),
    );
    h.store
        .save_custom_data("registry.local:5000/dockyard/app-myapp:v1", data)
        .await
        .unwrap();

    let mut events = Vec::new();
    let image = h
        .provisioner
        .archive_deploy(&app(), "https://example.com/app.tar.gz", &mut events)
        .await
        .unwrap();
    assert_eq!(image, "registry.local:5000/dockyard/app-myapp:v1");
    assert_eq!(String::from_utf8(events).unwrap(), "installing deps\n");

    let calls = h.cluster.calls().await;
    assert_eq!(
        count_calls(&calls, "commit_container:"),
        1,
        "build container was not committed: {:?}",
        calls
    );
    let mut names: Vec<String> = h
        .cluster
        .services()
        .await
        .into_iter()
        .map(|s| s.spec.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["myapp-clock", "myapp-web"]);
}

#[tokio::test]
async fn test_archive_deploy_falls_back_to_entrypoint() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image(PLATFORM_IMAGE, entrypoint_image(&["python", "app.py"], &[]))
        .await;

    let mut events = Vec::new();
    let image = h
        .provisioner
        .archive_deploy(&app(), "https://example.com/app.tar.gz", &mut events)
        .await
        .unwrap();

    let metadata = h.store.image_metadata(&image).await.unwrap();
    assert_eq!(
        metadata.processes().get("web").map(String::as_str),
        Some("python \"app.py\"")
    );
    assert_eq!(h.cluster.services().await.len(), 1);
}

#[tokio::test]
async fn test_failed_build_leaves_nothing_behind() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image(PLATFORM_IMAGE, entrypoint_image(&["python", "app.py"], &[]))
        .await;
    h.cluster
        .set_run_result(PLATFORM_IMAGE, RunResult::failure(1, "pip failed\n"))
        .await;

    let mut events = Vec::new();
    let result = h
        .provisioner
        .archive_deploy(&app(), "https://example.com/app.tar.gz", &mut events)
        .await;
    assert!(matches!(result, Err(ProvisionError::BuildFailed(1))));
    assert_eq!(String::from_utf8(events).unwrap(), "pip failed\n");

    let calls = h.cluster.calls().await;
    assert_eq!(count_calls(&calls, "create_service:myapp-build-"), 1);
    assert_eq!(count_calls(&calls, "remove_service:myapp-build-"), 1);
    assert_eq!(count_calls(&calls, "commit_container:"), 0);
    assert_eq!(count_calls(&calls, "create_service:myapp-web"), 0);
    assert!(h.cluster.services().await.is_empty());
    assert!(h.cluster.pushed_images().await.is_empty());
}

#[tokio::test]
async fn test_build_service_removed_after_success() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image(PLATFORM_IMAGE, entrypoint_image(&["python", "app.py"], &[]))
        .await;

    let mut events = Vec::new();
    h.provisioner
        .archive_deploy(&app(), "https://example.com/app.tar.gz", &mut events)
        .await
        .unwrap();

    let calls = h.cluster.calls().await;
    assert_eq!(count_calls(&calls, "remove_service:myapp-build-"), 1);
    assert!(h
        .cluster
        .services()
        .await
        .iter()
        .all(|s| !s.spec.name.contains("-build-")));
    assert!(h
        .cluster
        .tasks()
        .await
        .iter()
        .all(|t| !t.labels.contains_key(LABEL_IS_BUILD)));
}

#[tokio::test]
async fn test_build_service_removed_when_push_fails() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image(PLATFORM_IMAGE, entrypoint_image(&["python", "app.py"], &[]))
        .await;
    h.cluster.fail_on("push image").await;

    let mut events = Vec::new();
    let result = h
        .provisioner
        .archive_deploy(&app(), "https://example.com/app.tar.gz", &mut events)
        .await;
    assert!(matches!(result, Err(ProvisionError::Cluster(_))));

    let calls = h.cluster.calls().await;
    assert_eq!(count_calls(&calls, "remove_service:myapp-build-"), 1);
    assert!(h.cluster.services().await.is_empty());
}

// ============================================================================
// Units
// ============================================================================

#[tokio::test]
async fn test_units_and_routable_units() {
    let h = cluster_with_node().await;
    h.cluster
        .add_image("myorg/api", entrypoint_image(&["./api"], &["5000/tcp"]))
        .await;
    h.cluster
        .set_run_result(
            "myorg/api:latest",
            RunResult::success("web: ./api\nworker: ./jobs\n"),
        )
        .await;
    let mut events = Vec::new();
    h.provisioner
        .image_deploy(&app(), "myorg/api", &mut events)
        .await
        .unwrap();

    let units = h.provisioner.units(&app()).await.unwrap();
    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|u| u.status == UnitStatus::Started));
    assert!(units.iter().all(|u| u.ip == "10.0.0.1"));
    assert!(units.iter().all(|u| u.platform == "python"));

    let routable = h.provisioner.routable_units(&app()).await.unwrap();
    assert_eq!(routable.len(), 1);
    assert_eq!(routable[0].process_name, "web");
    let address = routable[0].address.as_ref().unwrap();
    assert_eq!(address.host_str(), Some("10.0.0.1"));
    assert!(address.port().unwrap() > 30000);
}

#[tokio::test]
async fn test_units_of_unknown_app_are_empty() {
    let h = cluster_with_node().await;
    let units = h.provisioner.units(&App::new("ghost", "go")).await.unwrap();
    assert!(units.is_empty());
    assert!(h
        .provisioner
        .routable_units(&App::new("ghost", "go"))
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Unit registration
// ============================================================================

#[tokio::test]
async fn test_register_unit_attaches_data_to_build_image() {
    let h = cluster_with_node().await;

    let mut spec = ServiceSpec {
        name: "myapp-build-0123456789ab".to_string(),
        mode: ServiceMode::replicated(1),
        ..Default::default()
    };
    spec.labels
        .insert(LABEL_IS_BUILD.to_string(), "true".to_string());
    spec.labels
        .insert(LABEL_BUILD_IMAGE.to_string(), "dockyard/app-myapp:v9".to_string());
    spec.task_template.container_spec.image = PLATFORM_IMAGE.to_string();
    h.cluster.client(NODE_1).create_service(&spec).await.unwrap();

    let tasks = h.cluster.tasks().await;
    let container_id = tasks[0].container_id().to_string();

    let mut data = CustomData::new();
    data.insert("procfile".to_string(), serde_json::json!("web: ./run\n"));
    h.provisioner
        .register_unit(&container_id, Some(data))
        .await
        .unwrap();

    let metadata = h.store.image_metadata("dockyard/app-myapp:v9").await.unwrap();
    assert_eq!(
        metadata.processes().get("web").map(String::as_str),
        Some("./run")
    );
}

#[tokio::test]
async fn test_register_unknown_unit_is_noop() {
    let h = cluster_with_node().await;
    let mut data = CustomData::new();
    data.insert("procfile".to_string(), serde_json::json!("web: ./run\n"));
    h.provisioner
        .register_unit("no-such-container", Some(data))
        .await
        .unwrap();
    assert!(h.store.snapshot().await.images.is_empty());
}
