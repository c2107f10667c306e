//! Subscription, resource and resource-group enumeration plus the bulk
//! compute/health views that are fetched once per subscription or group.

use log::debug;
use serde_json::Value;

use crate::client::{ApiCall, AzureClient, Method};
use crate::types::{
    AvailabilityStatus, AzureResult, ResourceGroupInfo, SubscriptionInfo, VirtualMachineStatusView,
};

pub const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
pub const RESOURCES_API_VERSION: &str = "2019-05-01";
pub const VIRTUAL_MACHINES_API_VERSION: &str = "2024-11-01";
pub const RESOURCE_HEALTH_API_VERSION: &str = "2025-05-01";

/// Every subscription visible to the service principal.
///
/// Not bound to the client's subscription; the listing lives directly under
/// the management resource URL.
pub async fn list_subscriptions(client: &AzureClient) -> AzureResult<Vec<SubscriptionInfo>> {
    let url = format!("{}/subscriptions", client.urls().resource);
    debug!("list_subscriptions() → {}", url);
    client
        .request_as(
            ApiCall::full_uri(Method::GET, url)
                .api_version(SUBSCRIPTIONS_API_VERSION)
                .key("value"),
        )
        .await
}

/// Raw resource descriptions of the bound subscription.
///
/// Kept as JSON; the agent keeps every field it does not interpret.
pub async fn list_resources(client: &AzureClient) -> AzureResult<Vec<Value>> {
    debug!("list_resources() → {}resources", client.urls().base);
    client
        .request_as(
            ApiCall::get("resources")
                .api_version(RESOURCES_API_VERSION)
                .key("value"),
        )
        .await
}

pub async fn list_resource_groups(client: &AzureClient) -> AzureResult<Vec<ResourceGroupInfo>> {
    debug!("list_resource_groups() → {}resourcegroups", client.urls().base);
    client
        .request_as(
            ApiCall::get("resourcegroups")
                .api_version(RESOURCES_API_VERSION)
                .key("value"),
        )
        .await
}

/// Instance view statuses of all virtual machines in one request.
pub async fn list_vm_statuses(client: &AzureClient) -> AzureResult<Vec<VirtualMachineStatusView>> {
    let uri = "providers/Microsoft.Compute/virtualMachines";
    debug!("list_vm_statuses() → {}{}", client.urls().base, uri);
    client
        .request_as(
            ApiCall::get(uri)
                .api_version(VIRTUAL_MACHINES_API_VERSION)
                .param("statusOnly", "true")
                .key("value"),
        )
        .await
}

/// Availability statuses of all resources in `group`.
pub async fn list_availability_statuses(
    client: &AzureClient,
    group: &str,
) -> AzureResult<Vec<AvailabilityStatus>> {
    let uri = format!(
        "resourceGroups/{group}/providers/Microsoft.ResourceHealth/availabilityStatuses"
    );
    debug!("list_availability_statuses({}) → {}{}", group, client.urls().base, uri);
    client
        .request_as(
            ApiCall::get(uri)
                .api_version(RESOURCE_HEALTH_API_VERSION)
                .param("$top", "1000")
                .key("value"),
        )
        .await
}

// ─── Tests ──────────────────────────────────────────────────────────
