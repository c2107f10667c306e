//! Azure Monitor `metrics:getBatch` queries.
//!
//! One batch call covers up to [`BATCH_SIZE`] resources of a single type in a
//! single region. When the service rejects some of the requested metric
//! names for a namespace, the query is retried once with the names the error
//! message lists as valid.

use std::collections::BTreeSet;

use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use serde_json::json;

use crate::client::{ApiCall, AzureClient, Method};
use crate::types::{AzureError, AzureResult, ResourceMetrics};

pub const METRICS_API_VERSION: &str = "2023-10-01";
/// Resource ids per batch request.
pub const BATCH_SIZE: usize = 50;

lazy_static! {
    static ref VALID_METRICS: Regex =
        Regex::new(r"^Failed to find metric configuration for provider.*Valid metrics: ([\w,]*)")
            .expect("Invalid Regex");
}

/// Parameters shared by every chunk of one metric query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    pub start_time: String,
    pub end_time: String,
    /// ISO 8601 interval (`PT1M`, `PT5M`, `PT1H`).
    pub interval: String,
    /// Comma separated metric names.
    pub metric_names: String,
    /// Resource type, e.g. `Microsoft.Network/loadBalancers`.
    pub namespace: String,
    pub aggregation: String,
}

impl MetricQuery {
    fn call(&self, url: &str, resource_ids: &[String]) -> ApiCall {
        ApiCall::full_uri(Method::POST, url)
            .body(json!({ "resourceids": resource_ids }))
            .param("starttime", &self.start_time)
            .param("endtime", &self.end_time)
            .param("interval", &self.interval)
            .param("metricnames", &self.metric_names)
            .param("metricnamespace", &self.namespace)
            .param("aggregation", &self.aggregation)
            .api_version(METRICS_API_VERSION)
            .key("values")
    }
}

/// Names from `desired` that the error lists as valid, sorted and comma
/// joined. `Ok(None)` when none of them is available; the error itself when
/// it is not a metric-configuration error.
pub fn available_metrics_from_error(desired: &str, error: AzureError) -> AzureResult<Option<String>> {
    let Some(caps) = VALID_METRICS.captures(&error.message) else {
        return Err(error);
    };
    let available: BTreeSet<&str> = caps
        .get(1)
        .map(|m| m.as_str().split(',').collect())
        .unwrap_or_default();
    let retry: BTreeSet<&str> = desired
        .split(',')
        .filter(|name| available.contains(name))
        .collect();
    if retry.is_empty() {
        return Ok(None);
    }
    Ok(Some(retry.into_iter().collect::<Vec<_>>().join(",")))
}

/// Query one chunk of resource ids, narrowing `query.metric_names` on a
/// metric-configuration error. The narrowed names stay in `query` so that
/// further chunks do not repeat the failing request.
async fn query_chunk(
    client: &AzureClient,
    url: &str,
    resource_ids: &[String],
    query: &mut MetricQuery,
) -> AzureResult<Vec<ResourceMetrics>> {
    match client.request_as(query.call(url, resource_ids)).await {
        Ok(metrics) => Ok(metrics),
        Err(error) => match available_metrics_from_error(&query.metric_names, error)? {
            Some(retry_names) => {
                debug!(
                    "query_metrics: retrying {} with {}",
                    query.namespace, retry_names
                );
                query.metric_names = retry_names;
                client.request_as(query.call(url, resource_ids)).await
            }
            None => {
                info!("None of the expected metrics are available for {}", query.namespace);
                Ok(Vec::new())
            }
        },
    }
}

/// Metrics of all `resource_ids` in `region`, batched by [`BATCH_SIZE`].
pub async fn query_metrics(
    client: &AzureClient,
    region: &str,
    resource_ids: &[String],
    query: &MetricQuery,
) -> AzureResult<Vec<ResourceMetrics>> {
    let url = client.regional_url(region, "/metrics:getBatch")?;
    debug!(
        "query_metrics({}, {}, {} resources) → {}",
        query.namespace,
        query.metric_names,
        resource_ids.len(),
        url
    );

    let mut query = query.clone();
    let mut metrics = Vec::new();
    for chunk in resource_ids.chunks(BATCH_SIZE) {
        metrics.extend(query_chunk(client, &url, chunk, &mut query).await?);
    }
    Ok(metrics)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::mgmt_authority_urls;
    use crate::client::{ApiResponse, RequestBody};
    use crate::testing::MockTransport;
    use crate::types::{Authority, AzureErrorKind, AzureToken};
    use std::sync::Arc;

    fn client(transport: &Arc<MockTransport>) -> AzureClient {
        let mut c = AzureClient::new(transport.clone(), mgmt_authority_urls(Authority::Global, "sub1"));
        c.set_token(AzureToken {
            access_token: "abc".into(),
            ..Default::default()
        });
        c
    }

    fn query(names: &str) -> MetricQuery {
        MetricQuery {
            start_time: "2024-01-01T00:00:00Z".into(),
            end_time: "2024-01-01T00:25:00Z".into(),
            interval: "PT5M".into(),
            metric_names: names.into(),
            namespace: "Microsoft.Network/loadBalancers".into(),
            aggregation: "average".into(),
        }
    }

    fn config_error(valid: &str) -> AzureError {
        AzureError::api(format!(
            "Failed to find metric configuration for provider: Microsoft.Network, resource Type: loadBalancers, metric: X, Valid metrics: {valid}"
        ))
    }

    #[test]
    fn fallback_intersects_and_sorts() {
        let names = available_metrics_from_error("c,a,x", config_error("a,b,c")).unwrap();
        assert_eq!(names.as_deref(), Some("a,c"));
    }

    #[test]
    fn fallback_empty_intersection() {
        let names = available_metrics_from_error("x,y", config_error("a,b")).unwrap();
        assert_eq!(names, None);
    }

    #[test]
    fn unrelated_error_propagates() {
        let err = available_metrics_from_error("a", AzureError::api("Quota exceeded")).unwrap_err();
        assert_eq!(err.message, "Quota exceeded");
    }

    #[test]
    fn pattern_is_anchored() {
        let err = available_metrics_from_error("a", AzureError::api(format!("Oops. {}", config_error("a").message)));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn chunks_resource_ids() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            Method::POST,
            "westeurope.metrics.monitor.azure.com/subscriptions/sub1/metrics:getBatch",
            ApiResponse::json(200, serde_json::json!({"values": [{"resourceid": "r", "value": []}]})),
        );
        let ids: Vec<String> = (0..120).map(|i| format!("/subscriptions/sub1/r{i}")).collect();
        let metrics = query_metrics(&client(&transport), "westeurope", &ids, &query("a"))
            .await
            .unwrap();
        assert_eq!(metrics.len(), 3);

        let sizes: Vec<usize> = transport
            .requests()
            .iter()
            .map(|r| match &r.body {
                RequestBody::Json(body) => body["resourceids"].as_array().map_or(0, Vec::len),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[tokio::test]
    async fn retries_with_valid_subset() {
        let transport = Arc::new(MockTransport::new());
        transport.on_sequence(
            Method::POST,
            "metrics:getBatch",
            vec![
                ApiResponse::json(
                    400,
                    serde_json::json!({"error": {"code": "BadRequest", "message": config_error("ByteCount,VipAvailability").message}}),
                ),
                ApiResponse::json(200, serde_json::json!({"values": []})),
            ],
        );
        query_metrics(&client(&transport), "westeurope", &["r1".to_string()], &query("VipAvailability,SnatConnectionCount,ByteCount"))
            .await
            .unwrap();
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].query_param("metricnames"), Some("ByteCount,VipAvailability"));
    }

    #[tokio::test]
    async fn no_retry_when_nothing_is_valid() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            Method::POST,
            "metrics:getBatch",
            ApiResponse::json(
                400,
                serde_json::json!({"error": {"code": "BadRequest", "message": config_error("Other").message}}),
            ),
        );
        let metrics = query_metrics(&client(&transport), "westeurope", &["r1".to_string()], &query("A,B"))
            .await
            .unwrap();
        assert!(metrics.is_empty());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn graph_client_has_no_metrics_endpoint() {
        let transport = Arc::new(MockTransport::new());
        let mut c = AzureClient::new(transport.clone(), crate::auth::graph_authority_urls(Authority::Global));
        c.set_token(AzureToken {
            access_token: "abc".into(),
            ..Default::default()
        });
        let err = query_metrics(&c, "westeurope", &["r".to_string()], &query("a")).await.unwrap_err();
        assert_eq!(err.kind, AzureErrorKind::Config);
    }
}
