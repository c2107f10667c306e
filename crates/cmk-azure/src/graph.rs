//! Microsoft Graph queries: directory size, organization and application
//! registrations with client secrets.

use log::debug;
use serde_json::Value;

use crate::client::{ApiCall, AzureClient};
use crate::types::{AzureError, AzureResult, GraphApplication};

const GRAPH_NEXT_PAGE_KEY: &str = "@odata.nextLink";

/// Number of users in the directory.
pub async fn users_count(client: &AzureClient) -> AzureResult<u64> {
    debug!("users_count() → {}users", client.urls().base);
    let count = client
        .request(
            ApiCall::get("users")
                .param("$top", "1")
                .param("$count", "true")
                .header("ConsistencyLevel", "eventual")
                .key("@odata.count"),
        )
        .await?;
    count
        .as_u64()
        .ok_or_else(|| AzureError::api(format!("unexpected users count: {count}")))
}

/// Raw organization objects.
pub async fn organizations(client: &AzureClient) -> AzureResult<Vec<Value>> {
    debug!("organizations() → {}organization", client.urls().base);
    client
        .request_as(ApiCall::get("organization").key("value"))
        .await
}

/// All application registrations, across every page.
pub async fn applications(client: &AzureClient) -> AzureResult<Vec<GraphApplication>> {
    debug!("applications() → {}applications", client.urls().base);
    client
        .request_as(
            ApiCall::get("applications")
                .key("value")
                .next_page_key(GRAPH_NEXT_PAGE_KEY),
        )
        .await
}

// ─── Tests ──────────────────────────────────────────────────────────
