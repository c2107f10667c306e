//! Microsoft.Network views used to enrich gateways and load balancers.

use log::debug;

use crate::client::{ApiCall, AzureClient};
use crate::resource_id::params_from_azure_id;
use crate::types::{
    ApplicationGateway, AvailabilityStatus, AzureResult, LoadBalancer, NicIpConfiguration,
    PublicIpAddress, VirtualNetworkGateway, VirtualNetworkPeering,
};

pub const NETWORK_API_VERSION: &str = "2024-05-01";
pub const NIC_API_VERSION: &str = "2022-01-01";
pub const VMSS_NIC_API_VERSION: &str = "2024-07-01";
pub const PEERING_API_VERSION: &str = "2024-10-01";
pub const GATEWAY_HEALTH_API_VERSION: &str = "2025-04-01";

// ── Bulk listings ───────────────────────────────────────────────────

pub async fn list_application_gateways(client: &AzureClient) -> AzureResult<Vec<ApplicationGateway>> {
    let uri = "providers/Microsoft.Network/applicationGateways";
    debug!("list_application_gateways() → {}{}", client.urls().base, uri);
    client
        .request_as(ApiCall::get(uri).api_version(NETWORK_API_VERSION).key("value"))
        .await
}

pub async fn list_load_balancers(client: &AzureClient) -> AzureResult<Vec<LoadBalancer>> {
    let uri = "providers/Microsoft.Network/loadBalancers";
    debug!("list_load_balancers() → {}{}", client.urls().base, uri);
    client
        .request_as(ApiCall::get(uri).api_version(NETWORK_API_VERSION).key("value"))
        .await
}

// ── Single views ────────────────────────────────────────────────────

pub async fn public_ip_view(client: &AzureClient, group: &str, name: &str) -> AzureResult<PublicIpAddress> {
    let uri = format!("resourceGroups/{group}/providers/Microsoft.Network/publicIPAddresses/{name}");
    debug!("public_ip_view({}, {}) → {}", group, name, uri);
    client
        .request_as(ApiCall::get(uri).api_version(NETWORK_API_VERSION))
        .await
}

/// Public IP referenced by its full resource id.
pub async fn public_ip_by_id(client: &AzureClient, public_ip_id: &str) -> AzureResult<PublicIpAddress> {
    let params = params_from_azure_id(public_ip_id, &["publicIPAddresses"])?;
    public_ip_view(client, &params[1], &params[2]).await
}

/// NIC ip-configuration behind `ip_config_id`, either a standalone NIC or a
/// scale-set instance NIC.
pub async fn nic_ip_configuration(client: &AzureClient, ip_config_id: &str) -> AzureResult<NicIpConfiguration> {
    let (uri, api_version) = if ip_config_id.contains("virtualMachineScaleSets") {
        let p = params_from_azure_id(
            ip_config_id,
            &[
                "virtualMachineScaleSets",
                "virtualMachines",
                "networkInterfaces",
                "ipConfigurations",
            ],
        )?;
        (
            format!(
                "resourceGroups/{}/providers/microsoft.Compute/virtualMachineScaleSets/{}/virtualMachines/{}/networkInterfaces/{}/ipConfigurations/{}",
                p[1], p[2], p[3], p[4], p[5]
            ),
            VMSS_NIC_API_VERSION,
        )
    } else {
        let p = params_from_azure_id(ip_config_id, &["networkInterfaces", "ipConfigurations"])?;
        (
            format!(
                "resourceGroups/{}/providers/Microsoft.Network/networkInterfaces/{}/ipConfigurations/{}",
                p[1], p[2], p[3]
            ),
            NIC_API_VERSION,
        )
    };
    debug!("nic_ip_configuration({}) → {}", ip_config_id, uri);
    client
        .request_as(ApiCall::get(uri).api_version(api_version))
        .await
}

pub async fn vnet_gateway_view(client: &AzureClient, group: &str, name: &str) -> AzureResult<VirtualNetworkGateway> {
    let uri = format!("resourceGroups/{group}/providers/Microsoft.Network/virtualNetworkGateways/{name}");
    debug!("vnet_gateway_view({}, {}) → {}", group, name, uri);
    client
        .request_as(ApiCall::get(uri).api_version(NETWORK_API_VERSION))
        .await
}

pub async fn vnet_peering_view(
    client: &AzureClient,
    group: &str,
    provider: &str,
    vnet: &str,
    peering: &str,
) -> AzureResult<VirtualNetworkPeering> {
    let uri = format!(
        "resourceGroups/{group}/providers/{provider}/virtualNetworks/{vnet}/virtualNetworkPeerings/{peering}"
    );
    debug!("vnet_peering_view({}, {}) → {}", vnet, peering, uri);
    client
        .request_as(ApiCall::get(uri).api_version(PEERING_API_VERSION))
        .await
}

/// Current availability status of a virtual network gateway.
pub async fn vnet_gateway_health(
    client: &AzureClient,
    group: &str,
    provider: &str,
    gateway: &str,
) -> AzureResult<AvailabilityStatus> {
    let uri = format!(
        "resourceGroups/{group}/providers/{provider}/virtualNetworkGateways/{gateway}/providers/Microsoft.ResourceHealth/availabilityStatuses/current"
    );
    debug!("vnet_gateway_health({}) → {}", gateway, uri);
    client
        .request_as(ApiCall::get(uri).api_version(GATEWAY_HEALTH_API_VERSION))
        .await
}

// ─── Tests ──────────────────────────────────────────────────────────
