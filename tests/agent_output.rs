use std::collections::BTreeMap;
use std::sync::Arc;

use agent_azure::agent::{
    connection_test, get_group_labels, get_subscriptions, main_subscription, process_resources, run,
    write_group_info,
};
use agent_azure::config::{Args, TagsOption};
use agent_azure::graph::process_graph;
use agent_azure::processors::{process_bulk_resources, process_vault};
use agent_azure::resource::{AzureResource, AzureSubscription};
use agent_azure::section::{OutputBuffer, SectionWriter};
use agent_azure::RunContext;
use clap::Parser;
use cmk_azure::client::{ApiResponse, Method, RATELIMIT_HEADER};
use cmk_azure::testing::MockTransport;
use cmk_azure::types::Tags;
use cmk_azure::AzureErrorKind;
use serde_json::json;
use tempfile::TempDir;

const SUB: &str = "4db89361-bcd9-4353-8edb-33f49608d4fa";

fn context(extra: &[&str], transport: &Arc<MockTransport>) -> (RunContext, OutputBuffer, TempDir) {
    let cache = tempfile::tempdir().unwrap();
    let mut argv = vec![
        "agent_azure",
        "--tenant",
        "tenant",
        "--client",
        "client",
        "--secret",
        "secret",
        "--cache-id",
        "test",
        "--cache-dir",
        cache.path().to_str().unwrap(),
    ];
    argv.extend_from_slice(extra);
    let args = Args::try_parse_from(argv).unwrap();
    let (writer, output) = SectionWriter::in_memory();
    let ctx = RunContext::new(args, transport.clone(), writer).unwrap();
    (ctx, output, cache)
}

fn subscription() -> AzureSubscription {
    AzureSubscription::new(SUB, "mock_subscription", Tags::new(), "tenant", false)
}

fn raw_resource(group: &str, resource_type: &str, name: &str) -> serde_json::Value {
    json!({
        "id": format!("/subscriptions/{SUB}/resourceGroups/{group}/providers/{resource_type}/{name}"),
        "name": name,
        "type": resource_type,
        "location": "westeurope",
        "tags": {"owner": "ops"},
    })
}

#[tokio::test]
async fn test_group_info_only_for_monitored_groups() {
    let transport = Arc::new(MockTransport::new().with_login());
    transport.on(
        Method::GET,
        &format!("{SUB}/resourcegroups"),
        ApiResponse::json(
            200,
            json!({"value": [
                {"id": "rg1", "name": "resource_group_1", "location": "westeurope", "tags": {"tag1": "value1"}},
                {"id": "rg2", "name": "resource_group_2", "location": "westeurope", "tags": {"tag2": "value2"}},
            ]}),
        ),
    );
    let (ctx, output, _cache) = context(&[], &transport);
    let mut client = ctx.mgmt_client(SUB);
    client.login(&ctx.args.credentials()).await.unwrap();

    let groups = vec!["resource_group_1".to_string()];
    let labels = get_group_labels(&ctx, &client, &groups).await.unwrap();
    assert_eq!(labels.keys().collect::<Vec<_>>(), ["resource_group_1"]);

    write_group_info(&ctx, &subscription(), &groups, &[], &labels).unwrap();
    assert_eq!(
        output.contents(),
        concat!(
            "<<<<resource_group_1>>>>\n",
            "<<<azure_labels:sep(0)>>>\n",
            "{\"resource_group\": \"resource_group_1\", \"subscription_name\": \"mock_subscription\", ",
            "\"subscription_id\": \"4db89361-bcd9-4353-8edb-33f49608d4fa\", \"entity\": \"resource_group\"}\n",
            "{\"tag1\": \"value1\"}\n",
            "<<<<>>>>\n",
            "<<<<mock_subscription>>>>\n",
            "<<<azure_agent_info:sep(124)>>>\n",
            "monitored-groups|[\"resource_group_1\"]\n",
            "monitored-resources|[]\n",
            "<<<<>>>>\n",
            "<<<<resource_group_1>>>>\n",
            "<<<azure_agent_info:sep(124)>>>\n",
            "<<<<mock_subscription>>>>\n",
            "<<<azure_agent_info:sep(124)>>>\n",
            "<<<<>>>>\n",
        )
    );
}

#[tokio::test]
async fn test_vault_without_protected_items_bails_out() {
    let transport = Arc::new(MockTransport::new().with_login());
    transport.on(
        Method::GET,
        "vaults/backup-vault/backupProtectedItems",
        ApiResponse::json(200, json!({"value": []})),
    );
    let (ctx, output, _cache) = context(&[], &transport);
    let mut client = ctx.mgmt_client(SUB);
    client.login(&ctx.args.credentials()).await.unwrap();

    let sub = subscription();
    let vault = AzureResource::new(
        raw_resource("rg1", "Microsoft.RecoveryServices/vaults", "backup-vault"),
        &TagsOption::ImportAll,
        &sub,
    )
    .unwrap();

    let err = process_vault(&ctx, &client, &sub, vault).await.unwrap_err();
    assert!(err.is_kind(AzureErrorKind::MissingData));
    assert_eq!(
        output.contents(),
        concat!(
            "<<<<mock_subscription>>>>\n",
            "<<<azure_agent_info:sep(124)>>>\n",
            "agent-bailout|[2, \"Vaults: Vault properties must be present\"]\n",
            "<<<<>>>>\n",
        )
    );
}

#[tokio::test]
async fn test_main_subscription_writes_resources_metrics_and_reads() {
    let transport = Arc::new(MockTransport::new().with_login());
    let storage_type = "Microsoft.Storage/storageAccounts";
    transport.on(
        Method::GET,
        &format!("{SUB}/resources"),
        ApiResponse::json(
            200,
            json!({"value": [
                raw_resource("rg1", storage_type, "account1"),
                raw_resource("rg1", "Microsoft.Compute/virtualMachines", "vm1"),
            ]}),
        )
        .with_header(RATELIMIT_HEADER, "50"),
    );
    transport.on(
        Method::GET,
        &format!("{SUB}/resourcegroups"),
        ApiResponse::json(
            200,
            json!({"value": [{"id": "rg1", "name": "RG1", "location": "westeurope", "tags": {}}]}),
        )
        .with_header(RATELIMIT_HEADER, "30"),
    );
    let storage_id = format!("/subscriptions/{SUB}/resourceGroups/rg1/providers/{storage_type}/account1");
    transport.on(
        Method::POST,
        "metrics:getBatch",
        ApiResponse::json(
            200,
            json!({"values": [{
                "resourceid": storage_id.to_lowercase(),
                "value": [{
                    "name": {"value": "UsedCapacity"},
                    "unit": "Bytes",
                    "timeseries": [{"data": [
                        {"timeStamp": "2024-05-01T10:00:00Z", "total": 1024.0, "average": 512.0},
                        {"timeStamp": "2024-05-01T11:00:00Z", "total": 2048.0, "average": 1024.0},
                    ]}],
                }],
            }]}),
        )
        .with_header(RATELIMIT_HEADER, "80"),
    );
    transport.on(
        Method::GET,
        "resourceGroups/rg1/providers/Microsoft.ResourceHealth/availabilityStatuses",
        ApiResponse::json(200, json!({"value": []})),
    );

    let (ctx, output, _cache) = context(&["--services", storage_type], &transport);
    main_subscription(&ctx, &subscription()).await.unwrap();

    let out = output.contents();
    assert!(out.contains("monitored-groups|[\"rg1\"]\n"), "{out}");
    assert!(out.contains("monitored-resources|[\"account1\", \"vm1\"]\n"), "{out}");
    assert!(out.contains("<<<<rg1>>>>\n<<<azure_storageaccounts:sep(124)>>>\nResource\n"), "{out}");
    assert!(out.contains("metrics following|2\n"), "{out}");
    assert!(out.contains("\"name\": \"UsedCapacity\", \"aggregation\": \"total\", \"value\": 2048.0"), "{out}");
    assert!(out.contains("remaining-reads|30\n"), "{out}");
    assert!(!out.contains("azure_virtualmachines"), "{out}");
    assert!(!out.contains("agent-bailout"), "{out}");
    assert_eq!(transport.requests_to("metrics:getBatch").len(), 2);
}

#[tokio::test]
async fn test_unknown_subscription_is_reported() {
    let transport = Arc::new(MockTransport::new().with_login());
    transport.on(
        Method::GET,
        "management.azure.com/subscriptions",
        ApiResponse::json(
            200,
            json!({"value": [{"subscriptionId": SUB, "displayName": "mock_subscription", "tags": {}}]}),
        ),
    );
    let (ctx, output, _cache) = context(&["--subscription", SUB, "--subscription", "missing"], &transport);

    let subscriptions = get_subscriptions(&ctx).await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].hostname, "mock_subscription");
    assert!(output.contents().contains(
        "agent-bailout|[2, \"Management client - get subscriptions: Subscription missing not found in Azure\"]"
    ));
}

#[tokio::test]
async fn test_dump_config() {
    let transport = Arc::new(MockTransport::new());
    let (ctx, output, _cache) = context(&["--dump-config", "--require-tag", "env"], &transport);

    assert_eq!(run(&ctx).await.unwrap(), 0);
    assert!(output.contents().starts_with("Configuration:\n"));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_connection_test_failure() {
    let transport = Arc::new(MockTransport::new());
    transport.on(
        Method::POST,
        "oauth2/v2.0/token",
        ApiResponse::json(
            401,
            json!({"error": "invalid_client", "error_description": "AADSTS7000215: Invalid client secret provided."}),
        ),
    );
    let (ctx, output, _cache) = context(&["--connection-test"], &transport);

    assert_eq!(connection_test(&ctx).await.unwrap(), 2);
    let out = output.contents();
    assert!(out.starts_with("Connection failed with: "), "{out}");
    assert!(out.contains("invalid_client"), "{out}");
}

#[tokio::test]
async fn test_connection_test_success() {
    let transport = Arc::new(MockTransport::new().with_login());
    let (ctx, output, _cache) = context(&["--connection-test"], &transport);

    assert_eq!(run(&ctx).await.unwrap(), 0);
    assert!(output.contents().is_empty());
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_group_labels_are_keyed_lowercase() {
    let transport = Arc::new(MockTransport::new().with_login());
    transport.on(
        Method::GET,
        &format!("{SUB}/resourcegroups"),
        ApiResponse::json(200, json!({"value": [{"id": "g", "name": "MiXeD", "location": "x", "tags": {"a": "b"}}]})),
    );
    let (ctx, _output, _cache) = context(&["--ignore-all-tags"], &transport);
    let mut client = ctx.mgmt_client(SUB);
    client.login(&ctx.args.credentials()).await.unwrap();

    let labels = get_group_labels(&ctx, &client, &["mixed".to_string()]).await.unwrap();
    let expected: BTreeMap<String, Tags> = [("mixed".to_string(), Tags::new())].into_iter().collect();
    assert_eq!(labels, expected);
}

fn resource(group: &str, resource_type: &str, name: &str) -> AzureResource {
    AzureResource::new(raw_resource(group, resource_type, name), &TagsOption::ImportAll, &subscription()).unwrap()
}

#[tokio::test]
async fn test_denied_graph_service_keeps_other_services() {
    let transport = Arc::new(MockTransport::new().with_login());
    transport.on(
        Method::GET,
        "v1.0/users",
        ApiResponse::json(
            403,
            json!({"error": {"code": "Authorization_RequestDenied", "message": "Insufficient privileges to complete the operation."}}),
        ),
    );
    transport.on(
        Method::GET,
        "v1.0/applications",
        ApiResponse::json(
            200,
            json!({"value": [{
                "id": "1", "appId": "a1", "displayName": "backup app",
                "passwordCredentials": [{"displayName": "key", "endDateTime": "2030-01-01T00:00:00Z"}],
            }]}),
        ),
    );
    let (ctx, output, _cache) = context(&["--services", "users_count", "app_registrations"], &transport);

    process_graph(&ctx).await.unwrap();

    let out = output.contents();
    assert!(
        out.contains("agent-bailout|[2, \"Graph client (async): Insufficient privileges to complete the operation.\"]"),
        "{out}"
    );
    assert!(
        out.contains(concat!(
            "<<<azure_app_registration:sep(0)>>>\n",
            "{\"appId\": \"a1\", \"displayName\": \"backup app\", \"id\": \"1\", ",
            "\"passwordCredentials\": [{\"displayName\": \"key\", \"endDateTime\": \"2030-01-01T00:00:00Z\"}]}\n",
        )),
        "{out}"
    );
    assert!(!out.contains("users_count"), "{out}");
}

#[tokio::test]
async fn test_failing_bulk_type_keeps_other_types() {
    let transport = Arc::new(MockTransport::new().with_login());
    transport.on(
        Method::GET,
        "providers/Microsoft.Compute/virtualMachines",
        ApiResponse::json(
            200,
            json!({"value": [{
                "id": format!("/subscriptions/{SUB}/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm1"),
                "properties": {},
            }]}),
        ),
    );
    transport.on(
        Method::GET,
        "providers/Microsoft.Network/loadBalancers",
        ApiResponse::json(
            200,
            json!({"value": [{
                "id": format!("/subscriptions/{SUB}/resourceGroups/rg1/providers/Microsoft.Network/loadBalancers/lb1"),
                "properties": {},
            }]}),
        ),
    );
    let (ctx, output, _cache) = context(&[], &transport);
    let mut client = ctx.mgmt_client(SUB);
    client.login(&ctx.args.credentials()).await.unwrap();

    let resources: BTreeMap<String, AzureResource> = [
        resource("rg1", "Microsoft.Compute/virtualMachines", "vm1"),
        resource("rg1", "Microsoft.Network/loadBalancers", "lb1"),
    ]
    .into_iter()
    .map(|r| (r.key(), r))
    .collect();

    let processed = process_bulk_resources(&ctx, &client, &subscription(), &resources).await.unwrap();
    let names: Vec<&str> = processed.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["lb1"]);

    let out = output.contents();
    assert_eq!(out.matches("agent-bailout").count(), 1, "{out}");
    assert!(out.contains("agent-bailout|[2, \"Process bulk resources (async): "), "{out}");
    assert!(out.contains("virtualMachines/vm1"), "{out}");
}

#[tokio::test]
async fn test_failing_vault_keeps_vnet_gateway() {
    let vault_type = "Microsoft.RecoveryServices/vaults";
    let gateway_type = "Microsoft.Network/virtualNetworkGateways";
    let transport = Arc::new(MockTransport::new().with_login());
    transport.on(
        Method::GET,
        "vaults/backup-vault/backupProtectedItems",
        ApiResponse::json(200, json!({"value": []})),
    );
    transport.on(
        Method::GET,
        "virtualNetworkGateways/gw1",
        ApiResponse::json(
            200,
            json!({"id": "gw1", "properties": {
                "gatewayType": "Vpn", "vpnType": "RouteBased", "enableBgp": false, "activeActive": false,
                "remoteVirtualNetworkPeerings": [],
            }}),
        ),
    );
    transport.on(
        Method::GET,
        "availabilityStatuses/current",
        ApiResponse::json(200, json!({"id": "h", "properties": {"availabilityState": "Available"}})),
    );
    transport.on(
        Method::GET,
        "resourceGroups/rg1/providers/Microsoft.ResourceHealth/availabilityStatuses",
        ApiResponse::json(200, json!({"value": []})),
    );
    transport.on(Method::POST, "metrics:getBatch", ApiResponse::json(200, json!({"values": []})));

    let (ctx, output, _cache) = context(&["--services", vault_type, gateway_type], &transport);
    let mut client = ctx.mgmt_client(SUB);
    client.login(&ctx.args.credentials()).await.unwrap();

    let resources = vec![
        resource("rg1", vault_type, "backup-vault"),
        resource("rg1", gateway_type, "gw1"),
    ];
    process_resources(&ctx, &client, &subscription(), resources, &BTreeMap::new())
        .await
        .unwrap();

    let out = output.contents();
    assert!(out.contains("agent-bailout|[2, \"Vaults: Vault properties must be present\"]"), "{out}");
    assert!(
        out.contains("agent-bailout|[2, \"Process single resources (async): Vault properties must be present\"]"),
        "{out}"
    );
    assert!(out.contains("<<<<rg1>>>>\n<<<azure_virtualnetworkgateways:sep(124)>>>\nResource\n"), "{out}");
    assert!(!out.contains("azure_vaults"), "{out}");
}
