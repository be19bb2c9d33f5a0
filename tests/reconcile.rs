//! End-to-end reconcile tests against the sandbox provider.

use std::sync::Arc;
use std::time::Duration;

use halldyll_converge::config::{ConfigParser, DesiredState};
use halldyll_converge::error::{ConvergeError, GraphError, PlanError, ProviderError, StateError};
use halldyll_converge::executor::{RetryPolicy, SkipReason};
use halldyll_converge::planner::{OperationKind, ReplaceOrder};
use halldyll_converge::provider::{CallKind, Fault, SandboxCloud, catalog};
use halldyll_converge::reconciler::{ReconcileOptions, Reconciler};
use halldyll_converge::schema::{InstanceId, Value};
use halldyll_converge::state::{MemoryStateStore, StateStore, StateTransaction};
use tokio_util::sync::CancellationToken;

struct Env {
    cloud: Arc<SandboxCloud>,
    store: Arc<MemoryStateStore>,
    reconciler: Reconciler,
}

fn env_with(cloud: SandboxCloud, parallelism: usize) -> Env {
    let cloud = Arc::new(cloud);
    let registry = Arc::new(catalog::registry(&cloud).expect("registry"));
    let store = Arc::new(MemoryStateStore::new());
    let shared: Arc<dyn StateStore> = store.clone();
    let reconciler = Reconciler::new(registry, shared)
        .with_holder("test-runner")
        .with_options(ReconcileOptions {
            parallelism,
            retry: RetryPolicy::immediate(3),
        });
    Env {
        cloud,
        store,
        reconciler,
    }
}

fn env() -> Env {
    env_with(SandboxCloud::new(), 4)
}

fn desired(env: &Env, resources: &str) -> DesiredState {
    let yaml = format!("project:\n  name: demo\nresources:\n{resources}");
    let manifest = ConfigParser::new()
        .parse_yaml(&yaml, None)
        .expect("manifest parses");
    env.reconciler.desired_state(&manifest).expect("manifest valid")
}

const NETWORK_AND_SERVER: &str = r#"
  - type: network
    name: x
    attributes:
      cidr: 10.0.0.0/16
  - type: server
    name: y
    attributes:
      image: ubuntu-24.04
      network_id: "${network.x.id}"
"#;

fn id(address: &str) -> InstanceId {
    address.parse().expect("address")
}

async fn provider_id(env: &Env, address: &str) -> String {
    env.store
        .load()
        .await
        .expect("load")
        .expect("state exists")
        .get(&id(address))
        .expect("instance recorded")
        .id
        .clone()
}

#[tokio::test]
async fn test_producer_is_created_first_and_its_id_flows_to_the_consumer() {
    let env = env();
    let desired = desired(&env, NETWORK_AND_SERVER);

    let plan = env.reconciler.plan(&desired).await.expect("plan");
    let summary: Vec<String> = plan
        .operations
        .iter()
        .map(|op| format!("{} {}", op.kind, op.instance))
        .collect();
    assert_eq!(summary, vec!["create network.x", "create server.y"]);

    let result = env
        .reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect("apply");
    assert!(result.is_success(), "{result}");

    let creates: Vec<String> = env
        .cloud
        .calls()
        .await
        .into_iter()
        .filter(|c| c.kind == CallKind::Create)
        .map(|c| c.resource_type)
        .collect();
    assert_eq!(creates, vec!["network", "server"]);

    let network_id = provider_id(&env, "network.x").await;
    let server_id = provider_id(&env, "server.y").await;
    let server = env.cloud.object("server", &server_id).await.expect("server");
    assert_eq!(server.get("network_id"), Some(&Value::string(network_id)));
}

#[tokio::test]
async fn test_second_plan_is_empty() {
    let env = env();
    let desired = desired(&env, NETWORK_AND_SERVER);

    env.reconciler
        .converge(&desired, CancellationToken::new())
        .await
        .expect("first apply");
    let plan = env.reconciler.plan(&desired).await.expect("second plan");

    assert!(plan.is_empty(), "{plan}");
    assert_eq!(plan.unchanged, 2);
}

#[tokio::test]
async fn test_destroy_runs_consumers_first() {
    let env = env();
    env.reconciler
        .converge(&desired(&env, NETWORK_AND_SERVER), CancellationToken::new())
        .await
        .expect("apply");

    let plan = env
        .reconciler
        .plan(&DesiredState::new())
        .await
        .expect("plan");
    let order: Vec<String> = plan.operations.iter().map(|op| op.instance.to_string()).collect();
    assert_eq!(order, vec!["server.y", "network.x"]);

    // the sandbox refuses to delete a network that a server still uses
    let result = env
        .reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect("apply");
    assert!(result.is_success(), "{result}");
    assert!(env.cloud.ids("network").await.is_empty());
    assert!(env.cloud.ids("server").await.is_empty());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_call() {
    let env = env();
    let desired = desired(
        &env,
        r#"
  - type: network
    name: a
    attributes: {cidr: 10.0.0.0/16}
    depends_on: [network.b]
  - type: network
    name: b
    attributes: {cidr: 10.1.0.0/16}
    depends_on: [network.a]
"#,
    );

    let err = env.reconciler.plan(&desired).await.expect_err("cycle");
    assert!(matches!(err, ConvergeError::Graph(GraphError::Cycle { .. })));
    assert!(env.cloud.calls().await.is_empty());
}

#[tokio::test]
async fn test_failure_skips_dependents_and_spares_siblings() {
    let env = env();
    env.cloud
        .inject(
            Fault::new(
                "network",
                CallKind::Create,
                ProviderError::PermissionDenied {
                    message: String::from("quota exceeded"),
                },
            )
            .when("name", Value::string("doomed")),
        )
        .await;
    let desired = desired(
        &env,
        r#"
  - type: network
    name: a
    attributes: {cidr: 10.0.0.0/16, name: doomed}
  - type: subnet
    name: a1
    attributes:
      network_id: "${network.a.id}"
      cidr: 10.0.1.0/24
  - type: network
    name: b
    attributes: {cidr: 10.1.0.0/16}
"#,
    );

    let result = env
        .reconciler
        .converge(&desired, CancellationToken::new())
        .await
        .expect("apply");

    assert!(result.has_failed(&id("network.a")));
    assert_eq!(result.failed[0].attempts, 1);
    assert!(result.was_skipped(&id("subnet.a1")));
    assert_eq!(
        result.skipped[0].reason,
        SkipReason::DependencyFailed {
            instance: id("network.a")
        }
    );
    assert_eq!(result.completed_for(&id("network.b")).len(), 1);
    assert_eq!(env.cloud.call_count(CallKind::Create).await, 2);
    assert!(env.cloud.ids("subnet").await.is_empty());

    env.cloud.clear_faults().await;
    let retried = env
        .reconciler
        .converge(&desired, CancellationToken::new())
        .await
        .expect("second apply");
    assert!(retried.is_success(), "{retried}");
    assert_eq!(retried.completed.len(), 2);
    assert_eq!(env.cloud.ids("subnet").await.len(), 1);
}

#[tokio::test]
async fn test_failed_destroy_keeps_the_instance_recorded() {
    let env = env();
    env.reconciler
        .converge(&desired(&env, NETWORK_AND_SERVER), CancellationToken::new())
        .await
        .expect("apply");
    let network_id = provider_id(&env, "network.x").await;
    env.cloud
        .inject(
            Fault::new(
                "network",
                CallKind::Delete,
                ProviderError::PermissionDenied {
                    message: String::from("protected"),
                },
            )
            .on_id(network_id.clone()),
        )
        .await;

    let result = env
        .reconciler
        .converge(&DesiredState::new(), CancellationToken::new())
        .await
        .expect("apply");

    assert!(result.has_failed(&id("network.x")));
    assert_eq!(result.completed_for(&id("server.y")).len(), 1);
    let state = env.store.load().await.expect("load").expect("state");
    assert!(state.get(&id("server.y")).is_none());
    assert_eq!(state.get(&id("network.x")).map(|i| i.id.clone()), Some(network_id));
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let env = env();
    env.cloud
        .inject(
            Fault::new(
                "network",
                CallKind::Create,
                ProviderError::RateLimited {
                    retry_after_ms: Some(0),
                },
            )
            .times(2),
        )
        .await;
    let desired = desired(&env, "  - type: network\n    name: a\n    attributes: {cidr: 10.0.0.0/16}\n");

    let result = env
        .reconciler
        .converge(&desired, CancellationToken::new())
        .await
        .expect("apply");

    assert!(result.is_success(), "{result}");
    assert_eq!(result.completed[0].attempts, 3);
}

#[tokio::test]
async fn test_crash_keeps_exactly_the_committed_operations() {
    let env = env_with(SandboxCloud::new(), 1);
    let desired = desired(
        &env,
        r#"
  - type: network
    name: a
    attributes: {cidr: 10.0.0.0/16}
  - type: network
    name: b
    attributes: {cidr: 10.1.0.0/16}
  - type: network
    name: c
    attributes: {cidr: 10.2.0.0/16}
"#,
    );
    env.store.fail_appends_after(2).await;

    let err = env
        .reconciler
        .converge(&desired, CancellationToken::new())
        .await
        .expect_err("store fails on the third commit");
    assert!(matches!(
        err,
        ConvergeError::State(StateError::StoreUnavailable { .. })
    ));

    let reloaded = env.store.load().await.expect("load").expect("state");
    let recorded: Vec<String> = reloaded.instances.keys().map(ToString::to_string).collect();
    assert_eq!(recorded, vec!["network.a", "network.b"]);
    assert_eq!(reloaded.serial, 3);
    assert!(reloaded.history.last().is_some_and(|h| !h.success));
    assert_eq!(env.store.journal_len().await, 0);
    assert!(!env.store.is_locked().await.expect("lock state"));
}

#[tokio::test]
async fn test_plan_from_before_an_aborted_run_is_stale() {
    let env = env_with(SandboxCloud::new(), 1);
    let one = "  - type: network\n    name: a\n    attributes: {cidr: 10.0.0.0/16}\n";
    env.reconciler
        .converge(&desired(&env, one), CancellationToken::new())
        .await
        .expect("first apply");
    let before = env.store.load().await.expect("load").expect("state").serial;

    let three = format!(
        "{one}  - type: network\n    name: b\n    attributes: {{cidr: 10.1.0.0/16}}\n  - type: network\n    name: c\n    attributes: {{cidr: 10.2.0.0/16}}\n"
    );
    let plan = env.reconciler.plan(&desired(&env, &three)).await.expect("plan");
    assert_eq!(plan.base_serial, before);

    env.store.fail_appends_after(1).await;
    env.reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect_err("store fails on the second commit");
    env.store.accept_all_appends().await;

    let sealed = env.store.load().await.expect("load").expect("state");
    assert_eq!(sealed.serial, before + 2);
    assert_eq!(env.store.journal_len().await, 0);

    let err = env
        .reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect_err("plan predates the aborted run");
    assert!(
        matches!(err, ConvergeError::Plan(PlanError::StalePlan { planned_serial, .. }) if planned_serial == before),
        "{err}"
    );
}

#[tokio::test]
async fn test_concurrent_run_is_refused() {
    let env = env();
    let desired = desired(&env, "  - type: network\n    name: a\n    attributes: {cidr: 10.0.0.0/16}\n");
    let shared: Arc<dyn StateStore> = env.store.clone();
    let _held = StateTransaction::begin(shared, "someone-else", "apply")
        .await
        .expect("first lock");

    let err = env
        .reconciler
        .converge(&desired, CancellationToken::new())
        .await
        .expect_err("locked");
    assert!(matches!(
        err,
        ConvergeError::State(StateError::ConcurrentModification { .. })
    ));
    assert!(env.cloud.calls().await.is_empty());
}

#[tokio::test]
async fn test_replacement_rewires_consumers_before_destroying() {
    let env = env();
    let resources = |image: &str| {
        format!(
            r#"
  - type: network
    name: main
    attributes: {{cidr: 10.0.0.0/16}}
  - type: server
    name: web
    attributes:
      image: {image}
      network_id: "${{network.main.id}}"
  - type: floating_ip
    name: web
    attributes:
      server_id: "${{server.web.id}}"
"#
        )
    };
    env.reconciler
        .converge(&desired(&env, &resources("ubuntu-24.04")), CancellationToken::new())
        .await
        .expect("first apply");
    let old_server = provider_id(&env, "server.web").await;

    let plan = env
        .reconciler
        .plan(&desired(&env, &resources("debian-13")))
        .await
        .expect("plan");
    let summary: Vec<String> = plan
        .operations
        .iter()
        .map(|op| format!("{} {}", op.kind, op.instance))
        .collect();
    assert_eq!(
        summary,
        vec!["create server.web", "update floating_ip.web", "destroy server.web"]
    );
    assert_eq!(
        plan.operations[0].replacement,
        Some(ReplaceOrder::CreateThenDestroy)
    );

    let result = env
        .reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect("apply");
    assert!(result.is_success(), "{result}");

    let new_server = provider_id(&env, "server.web").await;
    assert_ne!(new_server, old_server);
    assert_eq!(env.cloud.ids("server").await, vec![new_server.clone()]);
    let fip_id = provider_id(&env, "floating_ip.web").await;
    let fip = env.cloud.object("floating_ip", &fip_id).await.expect("fip");
    assert_eq!(fip.get("server_id"), Some(&Value::string(new_server)));

    let state = env.store.load().await.expect("load").expect("state");
    assert!(state.get(&id("server.web")).expect("server").deposed.is_empty());
}

#[tokio::test]
async fn test_destroy_first_replacement_recreates_live_consumers() {
    let env = env();
    env.reconciler
        .converge(&desired(&env, NETWORK_AND_SERVER), CancellationToken::new())
        .await
        .expect("first apply");
    let old_network = provider_id(&env, "network.x").await;
    let old_server = provider_id(&env, "server.y").await;

    let moved = desired(&env, &NETWORK_AND_SERVER.replace("10.0.0.0/16", "10.9.0.0/16"));
    let plan = env.reconciler.plan(&moved).await.expect("plan");
    let summary: Vec<String> = plan
        .operations
        .iter()
        .map(|op| format!("{} {}", op.kind, op.instance))
        .collect();
    assert_eq!(
        summary,
        vec![
            "destroy server.y",
            "destroy network.x",
            "create network.x",
            "create server.y"
        ]
    );

    // the sandbox refuses to delete a network a server still uses
    let result = env
        .reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect("apply");
    assert!(result.is_success(), "{result}");

    let new_network = provider_id(&env, "network.x").await;
    let new_server = provider_id(&env, "server.y").await;
    assert_ne!(new_network, old_network);
    assert_ne!(new_server, old_server);
    assert_eq!(env.cloud.ids("network").await, vec![new_network.clone()]);
    let server = env.cloud.object("server", &new_server).await.expect("server");
    assert_eq!(server.get("network_id"), Some(&Value::string(new_network)));

    let state = env.store.load().await.expect("load").expect("state");
    assert!(state.tainted.is_empty());
    assert!(env.reconciler.plan(&moved).await.expect("plan").is_empty());
}

#[tokio::test]
async fn test_force_new_change_without_dependents_replaces_in_place_order() {
    let env = env();
    let volume = |zone: &str| format!("  - type: volume\n    name: data\n    attributes: {{size: 20, zone: {zone}}}\n");
    env.reconciler
        .converge(&desired(&env, &volume("zone-a")), CancellationToken::new())
        .await
        .expect("first apply");

    let plan = env
        .reconciler
        .plan(&desired(&env, &volume("zone-b")))
        .await
        .expect("plan");
    let kinds: Vec<OperationKind> = plan.operations.iter().map(|op| op.kind).collect();
    assert_eq!(kinds, vec![OperationKind::Destroy, OperationKind::Create]);

    let result = env
        .reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect("apply");
    assert!(result.is_success(), "{result}");
    assert_eq!(env.cloud.ids("volume").await.len(), 1);
}

#[tokio::test]
async fn test_drift_is_detected_and_refreshed() {
    let env = env();
    let desired = desired(&env, NETWORK_AND_SERVER);
    env.reconciler
        .converge(&desired, CancellationToken::new())
        .await
        .expect("apply");
    let server_id = provider_id(&env, "server.y").await;
    let network_id = provider_id(&env, "network.x").await;

    env.cloud
        .set_attribute("server", &server_id, "size", Value::string("large"))
        .await
        .expect("drift");
    let report = env.reconciler.check_drift().await.expect("drift check");
    assert_eq!(report.drifted.len(), 1);
    assert_eq!(report.drifted[0].instance, id("server.y"));
    assert_eq!(report.drifted[0].changes, vec!["size"]);

    let refreshed = env.reconciler.refresh().await.expect("refresh");
    assert_eq!(refreshed.drift.drifted.len(), 1);
    let plan = env.reconciler.plan(&desired).await.expect("plan");
    let summary: Vec<String> = plan.operations.iter().map(ToString::to_string).collect();
    assert_eq!(plan.update_count(), 1, "{summary:?}");
    assert_eq!(plan.operations[0].instance, id("server.y"));

    // an object deleted outside of converge is dropped from state and recreated
    env.reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect("apply");
    assert!(env.cloud.remove_object("server", &server_id).await);
    let refreshed = env.reconciler.refresh().await.expect("refresh");
    assert_eq!(refreshed.drift.vanished, vec![id("server.y")]);

    let plan = env.reconciler.plan(&desired).await.expect("plan");
    assert_eq!(plan.create_count(), 1);
    let result = env
        .reconciler
        .apply(&plan, CancellationToken::new())
        .await
        .expect("apply");
    assert!(result.is_success(), "{result}");
    assert_eq!(provider_id(&env, "network.x").await, network_id);
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let env = env_with(SandboxCloud::new().with_latency(Duration::from_millis(20)), 2);
    let resources: String = (0..6)
        .map(|i| format!("  - type: network\n    name: n{i}\n    attributes: {{cidr: 10.{i}.0.0/16}}\n"))
        .collect();
    let desired = desired(&env, &resources);

    let result = env
        .reconciler
        .converge(&desired, CancellationToken::new())
        .await
        .expect("apply");

    assert!(result.is_success(), "{result}");
    assert_eq!(result.completed.len(), 6);
    assert!(env.cloud.peak_concurrency() <= 2);
}

#[tokio::test]
async fn test_cancellation_lets_in_flight_work_commit() {
    let env = env_with(SandboxCloud::new().with_latency(Duration::from_millis(100)), 1);
    let desired = desired(
        &env,
        r#"
  - type: network
    name: a
    attributes: {cidr: 10.0.0.0/16}
  - type: network
    name: b
    attributes: {cidr: 10.1.0.0/16}
  - type: network
    name: c
    attributes: {cidr: 10.2.0.0/16}
"#,
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = env
        .reconciler
        .converge(&desired, cancel)
        .await
        .expect("apply");

    assert!(result.cancelled);
    assert_eq!(result.completed.len(), 1);
    assert_eq!(result.skipped.len(), 2);
    assert!(result.skipped.iter().all(|s| s.reason == SkipReason::Cancelled));

    let state = env.store.load().await.expect("load").expect("state");
    assert_eq!(state.instances.len(), 1);
    assert!(state.history.last().is_some_and(|h| !h.success));
}
