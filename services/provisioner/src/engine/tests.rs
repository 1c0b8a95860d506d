use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::*;
use crate::config::AbortPolicy;
use crate::plan::Action;
use crate::provider::{
    ApiOp, LocalResources, ProviderRegistry, RetryPolicy, SimulatedCloud, StaticCredentials,
};
use crate::state::{FileLock, MemoryStateStore, NoopLock, ResourceStatus};

const THREE_TIER: &str = include_str!("../../deploy/three-tier.json");

struct Harness {
    sim: Arc<SimulatedCloud>,
    store: Arc<MemoryStateStore>,
    engine: Engine,
}

fn harness_with(sim: SimulatedCloud, config: EngineConfig) -> Harness {
    let sim = Arc::new(sim);
    let store = Arc::new(MemoryStateStore::new());
    let local = Arc::new(LocalResources::new(Arc::new(StaticCredentials::simulated())));
    let api = Arc::new(ProviderRegistry::new(sim.clone(), local).with_retry(RetryPolicy::immediate(2)));
    let engine = Engine::new(api, store.clone(), Arc::new(NoopLock), config);
    Harness { sim, store, engine }
}

fn harness() -> Harness {
    harness_with(SimulatedCloud::new(), EngineConfig::default())
}

fn prepare(declaration: &Value, vars: &[(&str, &str)]) -> Result<Prepared, ConfigError> {
    let sources = VariableSources::default().with_cli(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    Prepared::new(Declaration::from_json_str(&declaration.to_string())?, &sources)
}

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

fn mutation_order(sim: &SimulatedCloud, op: ApiOp) -> Vec<String> {
    sim.mutations()
        .into_iter()
        .filter(|c| c.op == op)
        .filter_map(|c| c.address.map(|a| a.to_string()))
        .collect()
}

fn network_database_secret() -> Value {
    json!({
        "resources": [
            { "kind": "virtual_network", "name": "main",
              "fields": {
                  "name": "vnet-demo", "resource_group": "rg-demo",
                  "location": "westeurope", "address_space": ["10.20.0.0/16"]
              } },
            { "kind": "postgresql_server", "name": "main",
              "depends_on": ["virtual_network.main"],
              "fields": {
                  "name": "pg-demo", "resource_group": "rg-demo", "location": "westeurope",
                  "version": "16", "sku_name": "B_Standard_B1ms",
                  "administrator_login": "pgadmin", "administrator_password": "not-a-secret"
              } },
            { "kind": "key_vault_secret", "name": "db",
              "fields": {
                  "name": "db-host",
                  "key_vault_id": "/subscriptions/0/resourceGroups/rg-demo/providers/Microsoft.KeyVault/vaults/kv-demo",
                  "value": "${postgresql_server.main.fqdn}"
              } }
        ],
        "outputs": { "db_host": { "value": "${postgresql_server.main.fqdn}" } }
    })
}

#[tokio::test]
async fn test_apply_and_destroy_order() {
    let h = harness();
    let prepared = prepare(&network_database_secret(), &[]).unwrap();

    let report = h.engine.apply(&prepared).await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(
        mutation_order(&h.sim, ApiOp::Create),
        vec!["virtual_network.main", "postgresql_server.main", "key_vault_secret.db"]
    );
    assert_eq!(report.count(Outcome::Created), 3);
    assert_eq!(
        report.outputs["db_host"].value,
        json!("pg-demo.postgresql_server.simulated.example")
    );

    h.sim.clear_calls();
    let report = h.engine.destroy().await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(
        mutation_order(&h.sim, ApiOp::Delete),
        vec!["key_vault_secret.db", "postgresql_server.main", "virtual_network.main"]
    );
    assert_eq!(report.count(Outcome::Destroyed), 3);
    let doc = h.store.snapshot();
    assert!(doc.resources.is_empty());
    assert!(doc.outputs.is_empty());
    assert_eq!(h.sim.resource_count(), 0);
}

fn gated_compute() -> Value {
    json!({
        "variables": { "enable_frontend": { "type": "bool", "default": false } },
        "resources": [
            { "kind": "linux_scale_set", "name": "frontend",
              "condition": "${var.enable_frontend}",
              "fields": {
                  "name": "web", "resource_group": "rg-demo", "location": "westeurope",
                  "sku": "Standard_B2s", "instances": 2, "admin_username": "azureuser",
                  "subnet_id": "/subnets/public", "container_image": "web:latest"
              } },
            { "kind": "public_ip", "name": "gateway",
              "fields": {
                  "name": "gw-ip", "resource_group": "rg-demo", "location": "westeurope",
                  "allocation_method": "Static"
              } },
            { "kind": "application_gateway", "name": "main",
              "fields": {
                  "name": "gw", "resource_group": "rg-demo", "location": "westeurope",
                  "sku_name": "WAF_v2", "subnet_id": "/subnets/gateway",
                  "public_ip_id": "${public_ip.gateway.id}",
                  "web_backend_id": "${linux_scale_set.frontend.id ?? null}"
              } }
        ]
    })
}

#[tokio::test]
async fn test_gateway_tolerates_disabled_compute() {
    let h = harness();
    let prepared = prepare(&gated_compute(), &[]).unwrap();
    assert!(prepared.realized.pruned.contains(&addr("linux_scale_set.frontend")));

    let report = h.engine.apply(&prepared).await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(report.outcome(&addr("application_gateway.main")), Some(Outcome::Created));
    assert_eq!(report.outcome(&addr("linux_scale_set.frontend")), None);

    let doc = h.store.snapshot();
    let gateway = doc.resource(&addr("application_gateway.main")).unwrap();
    assert_eq!(gateway.inputs["web_backend_id"], Value::Null);
    assert!(doc.resource(&addr("linux_scale_set.frontend")).is_none());

    // Enabling the frontend creates it and points the gateway at it.
    let enabled = prepare(&gated_compute(), &[("enable_frontend", "true")]).unwrap();
    let report = h.engine.apply(&enabled).await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(report.outcome(&addr("linux_scale_set.frontend")), Some(Outcome::Created));
    assert_eq!(report.outcome(&addr("application_gateway.main")), Some(Outcome::Updated));
    let doc = h.store.snapshot();
    assert_eq!(
        doc.resource(&addr("application_gateway.main")).unwrap().inputs["web_backend_id"],
        json!(h.sim.id_of(&addr("linux_scale_set.frontend")).unwrap())
    );
}

#[tokio::test]
async fn test_required_dependency_disabled() {
    let mut declaration = gated_compute();
    declaration["resources"][2]["fields"]["subnet_id"] = json!("${linux_scale_set.frontend.id}");
    let err = prepare(&declaration, &[]).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::RequiredDependencyDisabled { ref path, .. }
            if path == "application_gateway.main.fields.subnet_id"
    ));
}

fn two_tiers() -> Value {
    json!({
        "resources": [
            { "kind": "linux_scale_set", "name": "backend",
              "fields": {
                  "name": "api", "resource_group": "rg-demo", "location": "westeurope",
                  "sku": "Standard_B2s", "instances": 2, "admin_username": "azureuser",
                  "subnet_id": "/subnets/private", "container_image": "api:latest"
              } },
            { "kind": "linux_scale_set", "name": "frontend",
              "fields": {
                  "name": "web", "resource_group": "rg-demo", "location": "westeurope",
                  "sku": "Standard_B2s", "instances": 2, "admin_username": "azureuser",
                  "subnet_id": "/subnets/public", "container_image": "web:latest",
                  "backend_url": "http://${linux_scale_set.backend.name}:8080"
              } },
            { "kind": "key_vault", "name": "main",
              "fields": {
                  "name": "kv-demo", "resource_group": "rg-demo", "location": "westeurope",
                  "tenant_id": "tenant", "sku_name": "standard"
              } }
        ]
    })
}

#[tokio::test]
async fn test_failed_backend_skips_frontend() {
    let h = harness();
    h.sim.fail(
        &addr("linux_scale_set.backend"),
        ApiError::Rejected("SkuNotAvailable".into()),
    );
    let prepared = prepare(&two_tiers(), &[]).unwrap();

    let report = h.engine.apply(&prepared).await.unwrap();
    assert!(!report.succeeded());
    assert_eq!(report.outcome(&addr("linux_scale_set.backend")), Some(Outcome::Failed));
    assert_eq!(report.outcome(&addr("linux_scale_set.frontend")), Some(Outcome::Skipped));
    assert_eq!(report.outcome(&addr("key_vault.main")), Some(Outcome::Created));
    assert!(report.display().contains("SkuNotAvailable"));

    assert!(h
        .sim
        .calls()
        .iter()
        .all(|c| c.address != Some(addr("linux_scale_set.frontend"))));
    let doc = h.store.snapshot();
    assert!(doc.resource(&addr("linux_scale_set.backend")).is_none());
    assert!(doc.resource(&addr("linux_scale_set.frontend")).is_none());
    // Outputs are only written after a fully successful apply.
    assert!(doc.outputs.is_empty());
}

#[tokio::test]
async fn test_removed_resource_is_destroyed_once() {
    let h = harness();
    let mut declaration = network_database_secret();
    declaration["resources"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "kind": "private_dns_zone", "name": "legacy",
                      "fields": { "name": "legacy.internal", "resource_group": "rg-demo" } }));
    h.engine.apply(&prepare(&declaration, &[]).unwrap()).await.unwrap();
    h.sim.clear_calls();

    let report = h
        .engine
        .apply(&prepare(&network_database_secret(), &[]).unwrap())
        .await
        .unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(
        h.sim.mutations().iter().map(|c| (c.op, c.address.clone())).collect::<Vec<_>>(),
        vec![(ApiOp::Delete, Some(addr("private_dns_zone.legacy")))]
    );
    assert_eq!(report.count(Outcome::Destroyed), 1);
    assert!(h.store.snapshot().resource(&addr("private_dns_zone.legacy")).is_none());
}

#[tokio::test]
async fn test_removed_resource_still_referenced_is_rejected() {
    let mut declaration = network_database_secret();
    declaration["resources"].as_array_mut().unwrap().remove(1);
    let err = prepare(&declaration, &[]).unwrap_err();
    assert!(matches!(err, ConfigError::DanglingReference { .. }), "{err}");
}

/// Drops the database and moves the network, which forces a replacement of
/// the network the database depended on.
fn relocated_network_without_database() -> Value {
    let mut declaration = network_database_secret();
    declaration["resources"][0]["fields"]["name"] = json!("vnet-moved");
    declaration["resources"][0]["fields"]["location"] = json!("northeurope");
    declaration["resources"][2]["fields"]["value"] = json!("db.internal");
    declaration["resources"]
        .as_array_mut()
        .unwrap()
        .remove(1);
    declaration.as_object_mut().unwrap().remove("outputs");
    declaration
}

#[tokio::test]
async fn test_removed_dependent_destroyed_before_replaced_producer() {
    let h = harness();
    h.engine
        .apply(&prepare(&network_database_secret(), &[]).unwrap())
        .await
        .unwrap();
    h.sim.clear_calls();

    let prepared = prepare(&relocated_network_without_database(), &[]).unwrap();
    let plan = h.engine.plan(&prepared).await.unwrap();
    assert_eq!(
        plan.change(&addr("virtual_network.main")).unwrap().action,
        Action::Replace
    );

    let report = h.engine.apply(&prepared).await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(
        mutation_order(&h.sim, ApiOp::Delete),
        vec!["postgresql_server.main", "virtual_network.main"]
    );
    assert_eq!(
        report.outcome(&addr("postgresql_server.main")),
        Some(Outcome::Destroyed)
    );
    assert_eq!(
        report.outcome(&addr("virtual_network.main")),
        Some(Outcome::Replaced)
    );
    let doc = h.store.snapshot();
    assert!(doc.resource(&addr("postgresql_server.main")).is_none());
    assert_eq!(
        doc.resource(&addr("virtual_network.main")).unwrap().inputs["location"],
        json!("northeurope")
    );
}

#[tokio::test]
async fn test_failed_dependent_teardown_blocks_replacement() {
    let h = harness();
    h.engine
        .apply(&prepare(&network_database_secret(), &[]).unwrap())
        .await
        .unwrap();
    h.sim.clear_calls();
    h.sim.fail_mutations(
        &addr("postgresql_server.main"),
        ApiError::Rejected("server is busy".into()),
    );

    let prepared = prepare(&relocated_network_without_database(), &[]).unwrap();
    let report = h.engine.apply(&prepared).await.unwrap();
    assert!(!report.succeeded());
    assert_eq!(
        report.outcome(&addr("postgresql_server.main")),
        Some(Outcome::Failed)
    );
    assert_eq!(
        report.outcome(&addr("virtual_network.main")),
        Some(Outcome::Skipped)
    );
    assert_eq!(
        mutation_order(&h.sim, ApiOp::Delete),
        vec!["postgresql_server.main"]
    );
    assert!(mutation_order(&h.sim, ApiOp::Create).is_empty());
}

#[tokio::test]
async fn test_second_apply_is_all_noop() {
    let h = harness();
    let prepared = prepare(&network_database_secret(), &[]).unwrap();
    let first = h.engine.apply(&prepared).await.unwrap();
    h.sim.clear_calls();

    let second = h.engine.apply(&prepared).await.unwrap();
    assert!(second.succeeded());
    assert_eq!(second.count(Outcome::NoOp), 3);
    assert_eq!(second.resources.len(), 3);
    assert!(h.sim.mutations().is_empty());
    assert_eq!(second.serial, first.serial);
}

fn secret_consumer() -> Value {
    json!({
        "variables": { "db_password": { "type": "string", "sensitive": true } },
        "resources": [
            { "kind": "key_vault_secret", "name": "db",
              "fields": {
                  "name": "db-password",
                  "key_vault_id": "/subscriptions/0/resourceGroups/rg-demo/providers/Microsoft.KeyVault/vaults/kv-demo",
                  "value": "${var.db_password}"
              } },
            { "kind": "linux_scale_set", "name": "backend",
              "fields": {
                  "name": "api", "resource_group": "rg-demo", "location": "westeurope",
                  "sku": "Standard_B2s", "instances": 2, "admin_username": "azureuser",
                  "subnet_id": "/subnets/private", "container_image": "api:latest",
                  "backend_url": "${key_vault_secret.db.version}"
              } }
        ]
    })
}

#[tokio::test]
async fn test_consumer_follows_updated_computed_output() {
    let h = harness();
    let secret = addr("key_vault_secret.db");
    let backend = addr("linux_scale_set.backend");
    h.engine
        .apply(&prepare(&secret_consumer(), &[("db_password", "first")]).unwrap())
        .await
        .unwrap();
    let old_version = h.store.snapshot().resource(&secret).unwrap().attributes["version"].clone();
    h.sim.clear_calls();

    let rotated = prepare(&secret_consumer(), &[("db_password", "second")]).unwrap();
    let plan = h.engine.plan(&rotated).await.unwrap();
    assert_eq!(plan.change(&backend).unwrap().action, Action::NoOp);

    let report = h.engine.apply(&rotated).await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(report.outcome(&secret), Some(Outcome::Updated));
    assert_eq!(report.outcome(&backend), Some(Outcome::Updated));
    assert_eq!(
        mutation_order(&h.sim, ApiOp::Update),
        vec!["key_vault_secret.db", "linux_scale_set.backend"]
    );

    let doc = h.store.snapshot();
    let new_version = doc.resource(&secret).unwrap().attributes["version"].clone();
    assert_ne!(new_version, old_version);
    assert_eq!(doc.resource(&backend).unwrap().inputs["backend_url"], new_version);

    h.sim.clear_calls();
    let again = h.engine.apply(&rotated).await.unwrap();
    assert_eq!(again.count(Outcome::NoOp), 2);
    assert!(h.sim.mutations().is_empty());
}

#[tokio::test]
async fn test_cycle_fails_before_any_remote_call() {
    let h = harness();
    let declaration = json!({
        "resources": [
            { "kind": "key_vault", "name": "a",
              "fields": {
                  "name": "${key_vault.b.name}", "resource_group": "rg", "location": "westeurope",
                  "tenant_id": "tenant", "sku_name": "standard"
              } },
            { "kind": "key_vault", "name": "b",
              "depends_on": ["key_vault.a"],
              "fields": {
                  "name": "b", "resource_group": "rg", "location": "westeurope",
                  "tenant_id": "tenant", "sku_name": "standard"
              } }
        ]
    });
    let err = prepare(&declaration, &[]).unwrap_err();
    assert!(matches!(err, ConfigError::Cycle { .. }));
    assert!(err.to_string().contains("key_vault.a -> key_vault.b -> key_vault.a"), "{err}");
    assert!(h.sim.calls().is_empty());
    assert_eq!(h.store.writes(), 0);
}

#[tokio::test]
async fn test_three_tier_applies_in_topological_order() {
    let h = harness_with(
        SimulatedCloud::new().with_latency(Duration::from_millis(2)),
        EngineConfig {
            max_concurrency: 4,
            ..EngineConfig::default()
        },
    );
    let prepared = prepare(&serde_json::from_str(THREE_TIER).unwrap(), &[]).unwrap();
    assert!(prepared.realized.pruned.contains(&addr("subnet.bastion")));

    let report = h.engine.apply(&prepared).await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(report.resources.len(), prepared.realized.graph.len());
    assert_eq!(report.count(Outcome::Read), 1);
    assert!(h.sim.peak_in_flight() <= 4);

    for (producer, consumer, _) in prepared.realized.graph.edges() {
        let completed = report
            .resources
            .iter()
            .find(|r| &r.address == producer)
            .and_then(|r| r.completed_at)
            .unwrap();
        let dispatched = report
            .resources
            .iter()
            .find(|r| &r.address == consumer)
            .and_then(|r| r.dispatched_at)
            .unwrap();
        assert!(completed < dispatched, "{producer} -> {consumer}");
    }

    let outputs = h.engine.outputs().unwrap();
    assert!(outputs["database_password"].sensitive);
    assert_eq!(
        outputs["frontend_scale_set"].value,
        json!(h.sim.id_of(&addr("linux_scale_set.frontend")).unwrap())
    );
    assert!(!report.display().contains(
        outputs["database_password"].value.as_str().unwrap()
    ));

    h.sim.clear_calls();
    let again = h.engine.apply(&prepared).await.unwrap();
    assert_eq!(again.count(Outcome::NoOp), prepared.realized.graph.len());
    assert!(h.sim.mutations().is_empty());
}

#[tokio::test]
async fn test_three_tier_without_frontend() {
    let h = harness();
    let prepared = prepare(
        &serde_json::from_str(THREE_TIER).unwrap(),
        &[("enable_frontend", "false"), ("prefix", "sandbox")],
    )
    .unwrap();

    let report = h.engine.apply(&prepared).await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(report.outcome(&addr("linux_scale_set.frontend")), None);
    assert_eq!(report.outcome(&addr("application_gateway.main")), Some(Outcome::Created));

    let doc = h.store.snapshot();
    assert_eq!(
        doc.resource(&addr("application_gateway.main")).unwrap().inputs["web_backend_id"],
        Value::Null
    );
    assert_eq!(doc.outputs["frontend_scale_set"].value, Value::Null);
    assert_eq!(
        doc.resource(&addr("resource_group.main")).unwrap().inputs["name"],
        json!("sandbox-rg")
    );
}

#[tokio::test]
async fn test_drift_requires_confirmation() {
    let h = harness();
    let prepared = prepare(&two_tiers(), &[]).unwrap();
    h.engine.apply(&prepared).await.unwrap();
    assert!(h.sim.tamper(&addr("key_vault.main"), "vault_uri", json!("https://moved/")));
    h.sim.clear_calls();

    let err = h.engine.apply(&prepared).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::DriftUnconfirmed { ref conflicts } if conflicts.len() == 1
    ));
    assert!(h.sim.mutations().is_empty());

    // The plan shows the conflict without touching anything.
    let plan = h.engine.plan(&prepared).await.unwrap();
    assert_eq!(plan.conflicts().count(), 1);
    assert!(plan.display().contains("key_vault.main changed outside of provisioning (vault_uri)"));

    let confirmed = harness_with(SimulatedCloud::new(), EngineConfig {
        accept_drift: true,
        ..EngineConfig::default()
    });
    confirmed.engine.apply(&prepared).await.unwrap();
    confirmed
        .sim
        .tamper(&addr("key_vault.main"), "vault_uri", json!("https://moved/"));
    let report = confirmed.engine.apply(&prepared).await.unwrap();
    assert_eq!(report.outcome(&addr("key_vault.main")), Some(Outcome::Updated));
    assert_eq!(report.drift.len(), 1);
}

#[tokio::test]
async fn test_missing_resource_is_recreated() {
    let h = harness();
    let prepared = prepare(&two_tiers(), &[]).unwrap();
    h.engine.apply(&prepared).await.unwrap();
    assert!(h.sim.remove(&addr("key_vault.main")));

    let report = h.engine.apply(&prepared).await.unwrap();
    assert!(report.succeeded(), "{}", report.display());
    assert_eq!(report.outcome(&addr("key_vault.main")), Some(Outcome::Created));
    assert_eq!(report.drift.len(), 1);
}

#[tokio::test]
async fn test_failed_update_leaves_record_in_progress() {
    let h = harness();
    h.engine
        .apply(&prepare(&two_tiers(), &[]).unwrap())
        .await
        .unwrap();

    let mut changed = two_tiers();
    changed["resources"][2]["fields"]["sku_name"] = json!("premium");
    let prepared = prepare(&changed, &[]).unwrap();
    h.sim
        .fail_mutations(&addr("key_vault.main"), ApiError::Unauthorized("token expired".into()));

    let report = h.engine.apply(&prepared).await.unwrap();
    assert_eq!(report.outcome(&addr("key_vault.main")), Some(Outcome::Failed));
    let record = h.store.snapshot().resources[&addr("key_vault.main")].clone();
    assert_eq!(record.status, ResourceStatus::InProgress);
    assert_eq!(record.inputs["sku_name"], json!("standard"));

    // The interrupted record is a conflict on the next run.
    h.sim.clear_failures();
    let err = h.engine.apply(&prepared).await.unwrap_err();
    assert!(matches!(err, EngineError::DriftUnconfirmed { .. }));
}

#[tokio::test]
async fn test_held_lock_blocks_apply() {
    let dir = tempfile::tempdir().unwrap();
    let lock = FileLock::new(dir.path().join("state.json.lock"));
    let _held = lock.acquire("apply").unwrap();

    let sim = Arc::new(SimulatedCloud::new());
    let local = Arc::new(LocalResources::new(Arc::new(StaticCredentials::simulated())));
    let engine = Engine::new(
        Arc::new(ProviderRegistry::new(sim.clone(), local)),
        Arc::new(MemoryStateStore::new()),
        Arc::new(lock.clone()),
        EngineConfig::default(),
    );
    let err = engine
        .apply(&prepare(&two_tiers(), &[]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::State(StateError::Locked { .. })));
    assert!(sim.calls().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_dispatches_nothing() {
    let h = harness_with(
        SimulatedCloud::new(),
        EngineConfig {
            abort_policy: AbortPolicy::Drain,
            ..EngineConfig::default()
        },
    );
    h.engine.cancellation_token().cancel();

    let report = h
        .engine
        .apply(&prepare(&two_tiers(), &[]).unwrap())
        .await
        .unwrap();
    assert!(report.cancelled);
    assert!(!report.succeeded());
    assert_eq!(report.count(Outcome::Skipped), 3);
    assert!(h.sim.mutations().is_empty());
}
