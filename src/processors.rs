//! Type specific enrichment of monitored resources.
//!
//! Virtual machines, application gateways and load balancers are enriched
//! from one subscription wide listing each ("bulk"). Vaults and virtual
//! network gateways need one view per resource ("single"). Every other
//! type passes through unchanged.

use std::collections::BTreeMap;

use cmk_azure::networking::{
    list_application_gateways, list_load_balancers, nic_ip_configuration, public_ip_by_id,
    vnet_gateway_health, vnet_gateway_view, vnet_peering_view,
};
use cmk_azure::recovery::backup_protected_items;
use cmk_azure::resource_id::{attr_from_uri, params_from_azure_id};
use cmk_azure::resources::list_vm_statuses;
use cmk_azure::types::{
    ApplicationGateway, FrontendIpConfiguration, LoadBalancer, NicIpConfiguration,
};
use cmk_azure::{AzureClient, AzureError, AzureResult};
use futures::future::try_join_all;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::context::RunContext;
use crate::error::{AgentError, AgentResult};
use crate::resource::{AzureResource, AzureSubscription, ResourceKind};

fn insert_some(map: &mut Map<String, Value>, key: &str, value: Option<impl Into<Value>>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value.into());
    }
}

fn sub_resource(value: &Option<cmk_azure::types::SubResource>) -> Value {
    value.as_ref().map_or(Value::Null, |r| json!({"id": r.id}))
}

// ── Shared ──────────────────────────────────────────────────────────

/// Frontend ip configurations keyed by id, public addresses resolved.
pub async fn frontend_ip_configs(
    client: &AzureClient,
    configs: &[FrontendIpConfiguration],
) -> AzureResult<Map<String, Value>> {
    let mut result = Map::new();
    for config in configs {
        let mut data = Map::new();
        data.insert("id".into(), json!(config.id));
        data.insert("name".into(), json!(config.name));
        let props = &config.properties;
        insert_some(&mut data, "privateIPAllocationMethod", props.private_ip_allocation_method.clone());
        insert_some(&mut data, "privateIPAddress", props.private_ip_address.clone());

        if let Some(public_ip_ref) = &props.public_ip_address {
            let public_ip = public_ip_by_id(client, &public_ip_ref.id).await?;
            let fqdn = public_ip
                .properties
                .dns_settings
                .as_ref()
                .and_then(|dns| dns.fqdn.clone())
                .unwrap_or_default();
            data.insert(
                "public_ip_address".into(),
                json!({
                    "dns_fqdn": fqdn,
                    "name": public_ip.name,
                    "location": public_ip.location,
                    "ipAddress": public_ip.properties.ip_address,
                    "publicIPAllocationMethod": public_ip.properties.public_ip_allocation_method,
                }),
            );
        }
        result.insert(config.id.clone(), Value::Object(data));
    }
    Ok(result)
}

// ── Bulk ────────────────────────────────────────────────────────────

fn lookup<'a>(resources: &'a BTreeMap<String, AzureResource>, id: &str) -> Option<&'a AzureResource> {
    let found = resources.get(&id.to_lowercase());
    if found.is_none() {
        info!("Resource {} not monitored, skipping", id);
    }
    found
}

async fn process_virtual_machines(
    client: &AzureClient,
    resources: &BTreeMap<String, AzureResource>,
) -> AgentResult<Vec<AzureResource>> {
    let mut processed = Vec::new();
    for view in list_vm_statuses(client).await? {
        let Some(resource) = lookup(resources, &view.id) else {
            continue;
        };
        let statuses = view.statuses().ok_or_else(|| {
            AzureError::missing_data(format!("Virtual machine statuses missing: {}", view.id))
        })?;
        let mut resource = resource.clone();
        resource.set_info("specific_info", json!({"statuses": statuses}));
        processed.push(resource);
    }
    Ok(processed)
}

/// `properties` of an application gateway.
pub async fn app_gateway_properties(client: &AzureClient, gateway: &ApplicationGateway) -> AzureResult<Value> {
    let props = &gateway.properties;
    let frontend_ports: Map<String, Value> = props
        .frontend_ports
        .iter()
        .map(|p| (p.id.clone(), json!({"port": p.properties.port})))
        .collect();

    let routing_rules: Vec<Value> = props
        .request_routing_rules
        .iter()
        .map(|rule| {
            json!({
                "name": rule.name,
                "httpListener": sub_resource(&rule.properties.http_listener),
                "backendAddressPool": sub_resource(&rule.properties.backend_address_pool),
                "backendHttpSettings": sub_resource(&rule.properties.backend_http_settings),
            })
        })
        .collect();

    let http_listeners: Map<String, Value> = props
        .http_listeners
        .iter()
        .map(|listener| {
            let lp = &listener.properties;
            let port = lp.port.map(Value::from).or_else(|| {
                lp.frontend_port
                    .as_ref()
                    .and_then(|p| frontend_ports.get(&p.id))
                    .and_then(|p| p.get("port").cloned())
            });
            (
                listener.id.clone(),
                json!({
                    "id": listener.id,
                    "name": listener.name,
                    "port": port,
                    "protocol": lp.protocol,
                    "hostNames": lp.host_names,
                    "frontendIPConfiguration": sub_resource(&lp.frontend_ip_configuration),
                    "frontendPort": sub_resource(&lp.frontend_port),
                }),
            )
        })
        .collect();

    let backend_settings: Map<String, Value> = props
        .backend_http_settings_collection
        .iter()
        .map(|s| {
            (
                s.id.clone(),
                json!({"name": s.name, "port": s.properties.port, "protocol": s.properties.protocol}),
            )
        })
        .collect();

    let backend_address_pools: Map<String, Value> = props
        .backend_address_pools
        .iter()
        .map(|pool| (pool.id.clone(), json!(pool)))
        .collect();

    let mut properties = Map::new();
    properties.insert("operational_state".into(), json!(props.operational_state));
    properties.insert("routing_rules".into(), json!(routing_rules));
    properties.insert("http_listeners".into(), Value::Object(http_listeners));
    if let Some(waf) = &props.web_application_firewall_configuration {
        properties.insert("waf_enabled".into(), json!(waf.enabled));
    }
    properties.insert("frontend_ports".into(), Value::Object(frontend_ports));
    properties.insert("backend_settings".into(), Value::Object(backend_settings));
    properties.insert("backend_address_pools".into(), Value::Object(backend_address_pools));
    properties.insert(
        "frontend_api_configs".into(),
        Value::Object(frontend_ip_configs(client, &props.frontend_ip_configurations).await?),
    );
    Ok(Value::Object(properties))
}

async fn process_app_gateways(
    client: &AzureClient,
    resources: &BTreeMap<String, AzureResource>,
) -> AgentResult<Vec<AzureResource>> {
    let gateways = list_application_gateways(client).await?;
    let tasks = gateways.iter().filter_map(|gateway| {
        let resource = lookup(resources, &gateway.id)?;
        Some(async move {
            let mut resource = resource.clone();
            resource.set_info("properties", app_gateway_properties(client, gateway).await?);
            AgentResult::Ok(resource)
        })
    });
    try_join_all(tasks).await
}

fn nic_config_value(config: NicIpConfiguration) -> Value {
    let props = config.properties.unwrap_or(cmk_azure::types::NicIpConfigurationProperties {
        private_ip_address: None,
        private_ip_allocation_method: None,
        primary: None,
    });
    json!({
        "name": config.name,
        "privateIPAddress": props.private_ip_address,
        "privateIPAllocationMethod": props.private_ip_allocation_method,
        "primary": props.primary,
    })
}

/// `properties` of a load balancer.
pub async fn load_balancer_properties(client: &AzureClient, lb: &LoadBalancer) -> AzureResult<Value> {
    let props = &lb.properties;

    let mut inbound_nat_rules = Vec::new();
    for rule in &props.inbound_nat_rules {
        let rp = &rule.properties;
        let mut data = Map::new();
        data.insert("name".into(), json!(rule.name));
        data.insert("frontendPort".into(), json!(rp.frontend_port));
        data.insert("backendPort".into(), json!(rp.backend_port));
        data.insert("frontendIPConfiguration".into(), sub_resource(&rp.frontend_ip_configuration));
        if let Some(backend) = &rp.backend_ip_configuration {
            let config = nic_ip_configuration(client, &backend.id).await?;
            data.insert("backend_ip_config".into(), nic_config_value(config));
        }
        inbound_nat_rules.push(Value::Object(data));
    }

    let mut backend_pools = Map::new();
    for pool in &props.backend_address_pools {
        let mut addresses = Vec::new();
        for address in &pool.properties.load_balancer_backend_addresses {
            let Some(ip_config) = &address.properties.network_interface_ip_configuration else {
                continue;
            };
            addresses.push(nic_config_value(nic_ip_configuration(client, &ip_config.id).await?));
        }
        backend_pools.insert(
            pool.id.clone(),
            json!({"id": pool.id, "name": pool.name, "addresses": addresses}),
        );
    }

    let outbound_rules: Vec<Value> = props
        .outbound_rules
        .iter()
        .map(|rule| {
            json!({
                "name": rule.name,
                "protocol": rule.properties.protocol,
                "idleTimeoutInMinutes": rule.properties.idle_timeout_in_minutes,
                "backendAddressPool": sub_resource(&rule.properties.backend_address_pool),
            })
        })
        .collect();

    Ok(json!({
        "frontend_ip_configs": frontend_ip_configs(client, &props.frontend_ip_configurations).await?,
        "inbound_nat_rules": inbound_nat_rules,
        "backend_pools": backend_pools,
        "outbound_rules": outbound_rules,
    }))
}

async fn process_load_balancers(
    client: &AzureClient,
    resources: &BTreeMap<String, AzureResource>,
) -> AgentResult<Vec<AzureResource>> {
    let load_balancers = list_load_balancers(client).await?;
    let tasks = load_balancers.iter().filter_map(|lb| {
        let resource = lookup(resources, &lb.id)?;
        Some(async move {
            let properties = load_balancer_properties(client, lb).await.map_err(|e| {
                debug!("Load balancer {} sub-request failed: {}", lb.id, e);
                AzureError::missing_data(format!("Failed to collect data for load balancer: {}", lb.id))
            })?;
            let mut resource = resource.clone();
            resource.set_info("properties", properties);
            AgentResult::Ok(resource)
        })
    });
    try_join_all(tasks).await
}

const BULK_COMPONENT: &str = "Process bulk resources (async)";

/// One result per bulk type, so a failing type leaves the others intact.
/// Listings are only fetched for types that are monitored.
pub async fn bulk_results(
    client: &AzureClient,
    resources: &BTreeMap<String, AzureResource>,
) -> Vec<AgentResult<Vec<AzureResource>>> {
    let has = |kind: ResourceKind| resources.values().any(|r| r.kind == kind);

    let vms = async {
        if has(ResourceKind::VirtualMachine) {
            process_virtual_machines(client, resources).await
        } else {
            Ok(Vec::new())
        }
    };
    let gateways = async {
        if has(ResourceKind::ApplicationGateway) {
            process_app_gateways(client, resources).await
        } else {
            Ok(Vec::new())
        }
    };
    let load_balancers = async {
        if has(ResourceKind::LoadBalancer) {
            process_load_balancers(client, resources).await
        } else {
            Ok(Vec::new())
        }
    };

    let (vms, gateways, load_balancers) = futures::join!(vms, gateways, load_balancers);
    vec![vms, gateways, load_balancers]
}

/// Enrich every monitored resource of a bulk type. Each failing type is
/// written as its own bailout; the resources of the other types are
/// returned.
pub async fn process_bulk_resources(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
    resources: &BTreeMap<String, AzureResource>,
) -> AgentResult<Vec<AzureResource>> {
    let mut processed = Vec::new();
    for result in bulk_results(client, resources).await {
        match result {
            Ok(enriched) => processed.extend(enriched),
            Err(e) => ctx.handle_error(e, BULK_COMPONENT, Some(subscription))?,
        }
    }
    Ok(processed)
}

// ── Single ──────────────────────────────────────────────────────────

/// Attach the backup containers of a recovery services vault. A vault
/// without protected items is reported and fails.
pub async fn process_vault(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
    mut resource: AzureResource,
) -> AgentResult<AzureResource> {
    let items = backup_protected_items(client, &resource.group, &resource.name).await?;
    let Some(properties) = items.into_iter().next().and_then(|item| item.properties) else {
        let error = AgentError::from(AzureError::missing_data("Vault properties must be present"));
        ctx.bailout(&error, "Vaults", Some(subscription))?;
        return Err(error);
    };
    resource.set_info("properties", json!({"backup_containers": [properties]}));
    Ok(resource)
}

/// Gateway settings, peerings within the subscription and current health.
pub async fn process_virtual_net_gw(
    client: &AzureClient,
    subscription: &AzureSubscription,
    mut resource: AzureResource,
) -> AgentResult<AzureResource> {
    let gateway = vnet_gateway_view(client, &resource.group, &resource.name).await?;
    let gp = &gateway.properties;

    let mut specific_info = Map::new();
    insert_some(&mut specific_info, "bgpSettings", gp.bgp_settings.clone());
    insert_some(&mut specific_info, "disableIPSecReplayProtection", gp.disable_ip_sec_replay_protection);
    insert_some(&mut specific_info, "gatewayType", gp.gateway_type.clone());
    insert_some(&mut specific_info, "vpnType", gp.vpn_type.clone());
    insert_some(&mut specific_info, "activeActive", gp.active_active);
    insert_some(&mut specific_info, "enableBgp", gp.enable_bgp);
    resource.set_info("specific_info", Value::Object(specific_info));

    let mut peerings = Vec::new();
    for peering in &gp.remote_virtual_network_peerings {
        let params = params_from_azure_id(&peering.id, &["virtualNetworks", "virtualNetworkPeerings"])?;
        if params[0] != subscription.id.to_lowercase() {
            debug!("Skipping peering {} of another subscription", peering.id);
            continue;
        }
        let provider = attr_from_uri(&peering.id, "provider").unwrap_or_else(|| "Microsoft.Network".into());
        let view = vnet_peering_view(client, &params[1], &provider, &params[2], &params[3]).await?;
        peerings.push(json!({
            "name": view.name,
            "peeringState": view.properties.peering_state,
            "peeringSyncLevel": view.properties.peering_sync_level,
        }));
    }

    let provider = resource
        .info
        .get("provider")
        .and_then(Value::as_str)
        .unwrap_or("Microsoft.Network")
        .to_string();
    let health = vnet_gateway_health(client, &resource.group, &provider, &resource.name).await?;

    resource.set_info(
        "properties",
        json!({
            "remote_vnet_peerings": peerings,
            "health": {"id": health.id, "properties": health.properties},
        }),
    );
    Ok(resource)
}

/// Enrich one resource that needs its own view.
pub async fn process_single_resource(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
    resource: AzureResource,
) -> AgentResult<AzureResource> {
    match resource.kind {
        ResourceKind::Vault => process_vault(ctx, client, subscription, resource).await,
        ResourceKind::VirtualNetworkGateway => process_virtual_net_gw(client, subscription, resource).await,
        ResourceKind::VirtualMachine
        | ResourceKind::ApplicationGateway
        | ResourceKind::LoadBalancer
        | ResourceKind::Redis
        | ResourceKind::FlexibleServer
        | ResourceKind::UsageDetails
        | ResourceKind::Other => Ok(resource),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
