//! Cost Management usage query.
//!
//! The query endpoint has a strict per-tenant quota. A throttled query is
//! surfaced as a `RateLimit` error by the client; [`query_usage`] then honours
//! the `retry-after` hint for short waits and gives up otherwise.

use std::time::Duration;

use chrono::NaiveDate;
use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::client::{ApiCall, AzureClient, Method};
use crate::types::{AzureError, AzureErrorKind, AzureResult, CostColumn, CostQueryPage};

pub const COST_API_VERSION: &str = "2025-03-01";
pub const COST_CLIENT_TYPE: &str = "monitoring-client-type";
pub const RETRY_AFTER_HEADER: &str = "x-ms-ratelimit-microsoft.costmanagement-entity-retry-after";
pub const REMAINING_TENANT_HEADER: &str =
    "x-ms-ratelimit-remaining-microsoft.costmanagement-tenant-requests";
/// Longest `retry-after` we are willing to wait for.
const MAX_RETRY_AFTER_SECS: u64 = 10;
const MAX_ATTEMPTS: usize = 3;

/// Error fragments of subscription offers without access to consumption data.
const NO_CONSUMPTION_API: [&str; 8] = [
    "offer MS-AZR-0145P",
    "offer MS-AZR-0146P",
    "offer MS-AZR-159P",
    "offer MS-AZR-0036P",
    "offer MS-AZR-0143P",
    "offer MS-AZR-0015P",
    "offer MS-AZR-0144P",
    "Customer does not have the privilege to see the cost",
];

/// `ActualCost` for the whole of `day`, grouped by resource type and group.
pub fn usage_query_body(day: NaiveDate) -> Value {
    let day = day.format("%Y-%m-%d");
    json!({
        "type": "ActualCost",
        "dataSet": {
            "granularity": "None",
            "aggregation": {
                "totalCost": {"name": "Cost", "function": "Sum"},
                "totalCostUSD": {"name": "CostUSD", "function": "Sum"},
            },
            "grouping": [
                {"type": "Dimension", "name": "ResourceType"},
                {"type": "Dimension", "name": "ResourceGroupName"},
            ],
            "include": ["Tags"],
        },
        "timeframe": "Custom",
        "timePeriod": {
            "from": format!("{day}T00:00:00+00:00"),
            "to": format!("{day}T23:59:59+00:00"),
        },
    })
}

/// Whether `error` says the subscription offer has no consumption API.
pub fn is_no_consumption_error(error: &AzureError) -> bool {
    NO_CONSUMPTION_API
        .iter()
        .any(|fragment| error.message.contains(fragment))
}

/// One entry per row: the query metadata with a per-row `name` and the row
/// zipped with the column names as `properties`.
pub fn process_query_rows(columns: &[CostColumn], rows: Vec<Vec<Value>>, metadata: &Map<String, Value>) -> Vec<Value> {
    let base_name = metadata
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    rows.into_iter()
        .enumerate()
        .map(|(index, row)| {
            let mut entry = metadata.clone();
            entry.insert("name".into(), Value::String(format!("{base_name}-{index}")));
            let properties: Map<String, Value> = columns
                .iter()
                .map(|c| c.name.clone())
                .zip(row)
                .collect();
            entry.insert("properties".into(), Value::Object(properties));
            Value::Object(entry)
        })
        .collect()
}

/// Delay before retrying a throttled query, or the error to give up with.
pub fn retry_delay(error: &AzureError) -> AzureResult<Duration> {
    let retry_after = error.headers.get(RETRY_AFTER_HEADER);
    let remaining = error.headers.get(REMAINING_TENANT_HEADER);
    let (Some(retry_after), Some(remaining)) = (retry_after, remaining) else {
        return Err(AzureError::api(
            "Rate limit information not available in the response headers.",
        ));
    };

    let retry_after: u64 = retry_after
        .trim()
        .parse()
        .map_err(|_| AzureError::api(format!("invalid retry-after header: {retry_after}")))?;
    let remaining: i64 = remaining
        .trim()
        .trim_start_matches("DefaultQuota:")
        .trim()
        .parse()
        .map_err(|_| AzureError::api(format!("invalid remaining requests header: {remaining}")))?;

    warn!(
        "Rate limit exceeded for Microsoft.CostManagement API. Received a 'retry after' of {} seconds. Remaining requests: {}",
        retry_after, remaining
    );
    if remaining <= 0 || retry_after > MAX_RETRY_AFTER_SECS {
        return Err(AzureError::api(
            "Rate limit exceeded for Microsoft.CostManagement API.",
        ));
    }
    Ok(Duration::from_secs(retry_after + 1))
}

/// Run the usage query once, following `properties.nextLink`.
async fn query_usage_once(client: &AzureClient, body: &Value) -> AzureResult<Vec<Value>> {
    let first: CostQueryPage = client
        .request_as(
            ApiCall::post("/providers/Microsoft.CostManagement/query")
                .api_version(COST_API_VERSION)
                .header("ClientType", COST_CLIENT_TYPE)
                .body(body.clone())
                .raise_for_rate_limit(),
        )
        .await?;

    let CostQueryPage {
        properties,
        metadata,
    } = first;
    let columns = properties.columns;
    let mut rows = properties.rows;
    let mut next_link = properties.next_link;

    while let Some(link) = next_link.filter(|l| !l.is_empty()) {
        debug!("query_usage: following nextLink → {}", link);
        let page: CostQueryPage = client
            .request_as(
                ApiCall::full_uri(Method::POST, link)
                    .header("ClientType", COST_CLIENT_TYPE)
                    .body(body.clone())
                    .raise_for_rate_limit(),
            )
            .await?;
        rows.extend(page.properties.rows);
        next_link = page.properties.next_link;
    }

    Ok(process_query_rows(&columns, rows, &metadata))
}

/// Usage entries for `body`, retrying short throttling waits.
///
/// Offers without consumption data come back as `NoConsumptionApi`.
pub async fn query_usage(client: &AzureClient, body: &Value) -> AzureResult<Vec<Value>> {
    for attempt in 1..=MAX_ATTEMPTS {
        match query_usage_once(client, body).await {
            Ok(entries) => return Ok(entries),
            Err(e) if e.kind == AzureErrorKind::RateLimit => {
                let delay = retry_delay(&e)?;
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) if is_no_consumption_error(&e) => {
                return Err(AzureError::new(AzureErrorKind::NoConsumptionApi, e.message))
            }
            Err(e) => return Err(e),
        }
    }
    Err(AzureError::api(
        "Rate limit exceeded for Microsoft.CostManagement API.",
    ))
}

// ─── Tests ──────────────────────────────────────────────────────────
