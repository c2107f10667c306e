//! Metric collection.
//!
//! Monitored resources are grouped by `(type, location)`. Every metric
//! definition of a type becomes one cached batch query over all resources
//! of the group; the results are merged back into the resources by id.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cmk_azure::monitor::{query_metrics, MetricQuery};
use cmk_azure::types::{RawMetric, ResourceMetrics};
use cmk_azure::AzureClient;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::cache::{sanitize_component, DataCache};
use crate::config::PiggybackVms;
use crate::context::RunContext;
use crate::error::AgentResult;
use crate::resource::{AzureResource, AzureSubscription, ResourceKind};
use crate::section::{IssueCollector, Section};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
/// Queries look back this many intervals to absorb the ingestion delay.
const LOOKBACK_INTERVALS: i32 = 5;

// ── Catalogue ───────────────────────────────────────────────────────

/// `(metric names, ISO 8601 interval, aggregation)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDefinition {
    pub names: &'static str,
    pub interval: &'static str,
    pub aggregation: &'static str,
}

const fn def(names: &'static str, interval: &'static str, aggregation: &'static str) -> MetricDefinition {
    MetricDefinition {
        names,
        interval,
        aggregation,
    }
}

const VIRTUAL_NETWORK_GATEWAY_METRICS: &[MetricDefinition] = &[
    def("AverageBandwidth,P2SBandwidth", "PT5M", "average"),
    def("TunnelIngressBytes", "PT5M", "count"),
    def("TunnelEgressBytes", "PT5M", "count"),
    def("TunnelIngressPacketDropCount", "PT5M", "count"),
    def("TunnelEgressPacketDropCount", "PT5M", "count"),
    def("P2SConnectionCount", "PT1M", "maximum"),
];

const SQL_DATABASE_METRICS: &[MetricDefinition] = &[def(
    "storage_percent,deadlock,cpu_percent,dtu_consumption_percent,connection_successful,connection_failed",
    "PT1M",
    "average",
)];

const STORAGE_ACCOUNT_METRICS: &[MetricDefinition] = &[
    def("UsedCapacity,Ingress,Egress,Transactions", "PT1H", "total"),
    def("SuccessServerLatency,SuccessE2ELatency,Availability", "PT1H", "average"),
];

const WEB_SITE_METRICS: &[MetricDefinition] = &[def("CpuTime,AverageResponseTime,Http5xx", "PT1M", "total")];

const MYSQL_SERVER_METRICS: &[MetricDefinition] = &[
    def(
        "cpu_percent,memory_percent,io_consumption_percent,serverlog_storage_percent,storage_percent,active_connections",
        "PT1M",
        "average",
    ),
    def("connections_failed,network_bytes_ingress,network_bytes_egress", "PT1M", "total"),
    def("seconds_behind_master", "PT1M", "maximum"),
];

const MYSQL_FLEXIBLE_SERVER_METRICS: &[MetricDefinition] = &[
    def(
        "cpu_percent,memory_percent,io_consumption_percent,serverlog_storage_percent,storage_percent,active_connections",
        "PT1M",
        "average",
    ),
    def("aborted_connections,network_bytes_ingress,network_bytes_egress", "PT1M", "total"),
    def("replication_lag", "PT1M", "maximum"),
];

const POSTGRESQL_SERVER_METRICS: &[MetricDefinition] = &[
    def(
        "cpu_percent,memory_percent,io_consumption_percent,serverlog_storage_percent,storage_percent,active_connections",
        "PT1M",
        "average",
    ),
    def("connections_failed,network_bytes_ingress,network_bytes_egress", "PT1M", "total"),
    def("pg_replica_log_delay_in_seconds", "PT1M", "maximum"),
];

const POSTGRESQL_FLEXIBLE_SERVER_METRICS: &[MetricDefinition] = &[
    def(
        "cpu_percent,memory_percent,disk_iops_consumed_percentage,storage_percent,active_connections",
        "PT1M",
        "average",
    ),
    def("connections_failed,network_bytes_ingress,network_bytes_egress", "PT1M", "total"),
    def("physical_replication_delay_in_seconds", "PT1M", "maximum"),
];

const TRAFFIC_MANAGER_METRICS: &[MetricDefinition] = &[
    def("QpsByEndpoint", "PT1M", "total"),
    def("ProbeAgentCurrentEndpointStateByProfileResourceId", "PT1M", "maximum"),
];

const LOAD_BALANCER_METRICS: &[MetricDefinition] = &[
    def("ByteCount", "PT1M", "total"),
    def("AllocatedSnatPorts,UsedSnatPorts,VipAvailability,DipAvailability", "PT1M", "average"),
];

const APPLICATION_GATEWAY_METRICS: &[MetricDefinition] = &[
    def("HealthyHostCount", "PT1M", "average"),
    def("FailedRequests", "PT1M", "count"),
];

const VIRTUAL_MACHINE_METRICS: &[MetricDefinition] = &[
    def(
        "Percentage CPU,CPU Credits Consumed,CPU Credits Remaining,Available Memory Bytes,Disk Read Operations/Sec,Disk Write Operations/Sec",
        "PT1M",
        "average",
    ),
    def("Network In Total,Network Out Total,Disk Read Bytes,Disk Write Bytes", "PT1M", "total"),
];

const REDIS_METRICS: &[MetricDefinition] = &[
    def("allconnectedclients", "PT1M", "maximum"),
    def("allConnectionsCreatedPerSecond,allConnectionsClosedPerSecond", "PT1M", "maximum"),
    def("allpercentprocessortime", "PT1M", "maximum"),
    def("allcachehits,allcachemisses,cachemissrate,allgetcommands", "PT1M", "total"),
    def("allusedmemory,allusedmemorypercentage,allusedmemoryRss,allevictedkeys,allexpiredkeys", "PT1M", "total"),
    def("LatencyP99,cacheLatency", "PT1M", "average"),
    def("GeoReplicationHealthy", "PT1M", "minimum"),
    def("GeoReplicationConnectivityLag", "PT1M", "average"),
    def("allcacheRead,allcacheWrite", "PT1M", "maximum"),
    def("serverLoad", "PT1M", "maximum"),
];

const ALL_METRICS: &[(&str, &[MetricDefinition])] = &[
    ("Microsoft.Network/virtualNetworkGateways", VIRTUAL_NETWORK_GATEWAY_METRICS),
    ("Microsoft.Sql/servers/databases", SQL_DATABASE_METRICS),
    ("Microsoft.Storage/storageAccounts", STORAGE_ACCOUNT_METRICS),
    ("Microsoft.Web/sites", WEB_SITE_METRICS),
    ("Microsoft.DBforMySQL/servers", MYSQL_SERVER_METRICS),
    ("Microsoft.DBforMySQL/flexibleServers", MYSQL_FLEXIBLE_SERVER_METRICS),
    ("Microsoft.DBforPostgreSQL/servers", POSTGRESQL_SERVER_METRICS),
    ("Microsoft.DBforPostgreSQL/flexibleServers", POSTGRESQL_FLEXIBLE_SERVER_METRICS),
    ("Microsoft.Network/trafficmanagerprofiles", TRAFFIC_MANAGER_METRICS),
    ("Microsoft.Network/loadBalancers", LOAD_BALANCER_METRICS),
    ("Microsoft.Network/applicationGateways", APPLICATION_GATEWAY_METRICS),
    ("Microsoft.Compute/virtualMachines", VIRTUAL_MACHINE_METRICS),
    ("Microsoft.Cache/Redis", REDIS_METRICS),
];

/// Metrics not every SKU reports; their absence is not an issue.
const OPTIONAL_METRICS: &[(&str, &[&str])] = &[
    ("Microsoft.Sql/servers/databases", &["storage_percent", "deadlock", "dtu_consumption_percent"]),
    ("Microsoft.DBforMySQL/servers", &["seconds_behind_master"]),
    ("Microsoft.DBforMySQL/flexibleServers", &["replication_lag"]),
    ("Microsoft.DBforPostgreSQL/servers", &["pg_replica_log_delay_in_seconds"]),
    ("Microsoft.DBforPostgreSQL/flexibleServers", &["physical_replication_delay_in_seconds"]),
    ("Microsoft.Network/loadBalancers", &["AllocatedSnatPorts", "UsedSnatPorts"]),
    ("Microsoft.Compute/virtualMachines", &["CPU Credits Consumed", "CPU Credits Remaining"]),
];

pub fn metric_definitions(resource_type: &str) -> &'static [MetricDefinition] {
    ALL_METRICS
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(resource_type))
        .map_or(&[], |(_, defs)| *defs)
}

pub fn is_optional_metric(resource_type: &str, metric: &str) -> bool {
    OPTIONAL_METRICS
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(resource_type))
        .is_some_and(|(_, names)| names.contains(&metric))
}

pub fn interval_duration(interval: &str) -> Option<Duration> {
    match interval {
        "PT1M" => Some(Duration::from_secs(60)),
        "PT5M" => Some(Duration::from_secs(300)),
        "PT1H" => Some(Duration::from_secs(3600)),
        _ => None,
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

/// `H:MM:SS`, prefixed with the days when longer than a day.
fn format_timedelta(seconds: i64) -> String {
    let days = seconds.div_euclid(86_400);
    let rest = seconds.rem_euclid(86_400);
    let hms = format!("{}:{:02}:{:02}", rest / 3600, rest % 3600 / 60, rest % 60);
    match days {
        0 => hms,
        1 | -1 => format!("{days} day, {hms}"),
        _ => format!("{days} days, {hms}"),
    }
}

fn gap_between_last_points(timestamps: &[&str]) -> Option<String> {
    let [.., before, last] = timestamps else {
        return None;
    };
    let last = NaiveDateTime::parse_from_str(last, TIMESTAMP_FORMAT).ok()?;
    let before = NaiveDateTime::parse_from_str(before, TIMESTAMP_FORMAT).ok()?;
    Some(format_timedelta((last - before).num_seconds()))
}

/// Newest non-null value of `aggregation`, with its timestamp and the
/// sampling interval. `None` when the metric has no such value.
pub fn create_metric(metric: &RawMetric, aggregation: &str, interval_id: &str) -> Option<Value> {
    let timeseries = metric.timeseries.as_ref().filter(|ts| !ts.is_empty())?;

    let mut interval = Value::Null;
    for series in timeseries.iter().rev() {
        if series.data.is_empty() {
            continue;
        }
        let timestamps: Vec<&str> = series.data.iter().map(|d| d.time_stamp.as_str()).collect();
        if let Some(gap) = gap_between_last_points(&timestamps) {
            interval = Value::String(gap);
        }

        for point in series.data.iter().rev() {
            if let Some(value) = point.aggregate(aggregation) {
                return Some(json!({
                    "name": metric.name.value,
                    "aggregation": aggregation,
                    "value": value,
                    "unit": metric.unit.to_lowercase(),
                    "timestamp": point.time_stamp,
                    "interval_id": interval_id,
                    "interval": interval,
                }));
            }
        }
    }
    None
}

/// Metrics per resource id; metrics without a value become issues unless
/// optional.
pub fn parse_metrics(
    raw: &[ResourceMetrics],
    definition: &MetricDefinition,
    resource_type: &str,
    issues: &IssueCollector,
) -> Map<String, Value> {
    let mut metrics: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for resource_metrics in raw {
        for raw_metric in &resource_metrics.value {
            match create_metric(raw_metric, definition.aggregation, definition.interval) {
                Some(metric) => metrics
                    .entry(resource_metrics.resourceid.as_str())
                    .or_default()
                    .push(metric),
                None => {
                    let name = raw_metric.name.value.as_str();
                    if is_optional_metric(resource_type, name) {
                        continue;
                    }
                    let msg = format!("metric not found: {name} ({})", definition.aggregation);
                    issues.add("info", &resource_metrics.resourceid, &msg);
                    info!("{}", msg);
                }
            }
        }
    }
    metrics
        .into_iter()
        .map(|(id, list)| (id.to_string(), Value::Array(list)))
        .collect()
}

// ── Cache ───────────────────────────────────────────────────────────

/// One metric definition over all resources of one type in one region.
pub struct MetricCache<'a> {
    client: &'a AzureClient,
    issues: &'a IssueCollector,
    definition: MetricDefinition,
    resource_type: String,
    region: String,
    resource_ids: Vec<String>,
    cache_file: PathBuf,
    interval: Duration,
    start_time: String,
    end_time: String,
    debug: bool,
}

impl<'a> MetricCache<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a AzureClient,
        issues: &'a IssueCollector,
        definition: MetricDefinition,
        resource_type: &str,
        region: &str,
        resource_ids: Vec<String>,
        subscription_cache_dir: PathBuf,
        ref_time: DateTime<Utc>,
        debug: bool,
    ) -> Self {
        let interval = interval_duration(definition.interval).unwrap_or(Duration::from_secs(60));
        let step = chrono::Duration::seconds(interval.as_secs() as i64);
        let cache_file = subscription_cache_dir
            .join(sanitize_component(&format!("{region}_{resource_type}")))
            .join(sanitize_component(definition.names));
        Self {
            client,
            issues,
            definition,
            resource_type: resource_type.to_string(),
            region: region.to_string(),
            resource_ids,
            cache_file,
            interval,
            start_time: (ref_time - step * LOOKBACK_INTERVALS).format(TIMESTAMP_FORMAT).to_string(),
            end_time: ref_time.format(TIMESTAMP_FORMAT).to_string(),
            debug,
        }
    }

    /// One minute data changes faster than a cache could help.
    pub fn use_cache(&self) -> bool {
        self.interval > Duration::from_secs(60)
    }

    fn query(&self) -> MetricQuery {
        MetricQuery {
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            interval: self.definition.interval.to_string(),
            metric_names: self.definition.names.to_string(),
            namespace: self.resource_type.clone(),
            aggregation: self.definition.aggregation.to_string(),
        }
    }
}

#[async_trait]
impl DataCache for MetricCache<'_> {
    fn cache_file(&self) -> PathBuf {
        self.cache_file.clone()
    }

    fn cache_interval(&self) -> Duration {
        self.interval
    }

    fn debug(&self) -> bool {
        self.debug
    }

    async fn get_live_data(&self) -> AgentResult<Value> {
        let raw = query_metrics(self.client, &self.region, &self.resource_ids, &self.query()).await?;
        Ok(Value::Object(parse_metrics(
            &raw,
            &self.definition,
            &self.resource_type,
            self.issues,
        )))
    }
}

// ── Orchestration ───────────────────────────────────────────────────

/// Whether metrics of `resource` are queried at all.
fn collects_metrics(resource: &AzureResource, piggyback_vms: PiggybackVms) -> bool {
    resource.kind != ResourceKind::VirtualMachine || piggyback_vms == PiggybackVms::Itself
}

/// Query all metrics of `resources` (keyed by lower-cased id) and attach
/// them. Task failures become issues, or propagate in debug mode.
pub async fn gather_metrics(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
    resources: &mut BTreeMap<String, AzureResource>,
) -> AgentResult<IssueCollector> {
    let issues = IssueCollector::new();

    let mut grouped: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for resource in resources.values() {
        if !collects_metrics(resource, ctx.piggyback_vms()) {
            continue;
        }
        grouped
            .entry((resource.resource_type.clone(), resource.location.clone()))
            .or_default()
            .push(resource.id.clone());
    }

    let cache_dir = ctx.cache_dir(&subscription.id);
    let mut caches = Vec::new();
    for ((resource_type, region), ids) in &grouped {
        for definition in metric_definitions(resource_type) {
            caches.push(MetricCache::new(
                client,
                &issues,
                *definition,
                resource_type,
                region,
                ids.clone(),
                cache_dir.clone(),
                ctx.now,
                ctx.debug(),
            ));
        }
    }

    let results = join_all(caches.iter().map(|cache| cache.get_data(cache.use_cache()))).await;
    drop(caches);

    for result in results {
        let metrics = match result {
            Ok(metrics) => metrics,
            Err(e) => {
                if ctx.debug() {
                    return Err(e);
                }
                error!("metric collection failed: {}", e);
                issues.add("exception", "metric collection", &e.to_string());
                continue;
            }
        };
        let Value::Object(metrics) = metrics else {
            continue;
        };
        for (resource_id, list) in metrics {
            match resources.get_mut(&resource_id.to_lowercase()) {
                Some(resource) => {
                    if let Value::Array(list) = list {
                        resource.metrics.extend(list);
                    }
                }
                None => info!("Resource {} found in metrics cache no longer monitored", resource_id),
            }
        }
    }

    Ok(issues)
}

/// Gather metrics and write collected issues as `agent_info`.
pub async fn process_metrics(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
    resources: &mut BTreeMap<String, AzureResource>,
) -> AgentResult<()> {
    let issues = gather_metrics(ctx, client, subscription, resources).await?;
    if issues.is_empty() {
        return Ok(());
    }
    let mut section = Section::main("agent_info");
    section.add_rows(issues.dumpinfo());
    ctx.write(&section)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cmk_azure::types::{LocalizableString, MetricDatapoint, TimeSeries};

    fn point(ts: &str, average: Option<f64>) -> MetricDatapoint {
        MetricDatapoint {
            time_stamp: ts.into(),
            average,
            total: None,
            count: None,
            maximum: None,
            minimum: None,
        }
    }

    fn metric(series: Vec<Vec<MetricDatapoint>>) -> RawMetric {
        RawMetric {
            name: LocalizableString {
                value: "Percentage CPU".into(),
                localized_value: None,
            },
            unit: "Percent".into(),
            timeseries: Some(series.into_iter().map(|data| TimeSeries { data }).collect()),
        }
    }

    #[test]
    fn newest_non_null_value_wins() {
        let m = metric(vec![vec![
            point("2024-01-01T10:00:00Z", Some(1.0)),
            point("2024-01-01T10:01:00Z", Some(2.5)),
            point("2024-01-01T10:02:00Z", None),
        ]]);
        let parsed = create_metric(&m, "average", "PT1M").unwrap();
        assert_eq!(
            parsed,
            json!({
                "name": "Percentage CPU",
                "aggregation": "average",
                "value": 2.5,
                "unit": "percent",
                "timestamp": "2024-01-01T10:01:00Z",
                "interval_id": "PT1M",
                "interval": "0:01:00",
            })
        );
        let keys: Vec<&String> = parsed.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["name", "aggregation", "value", "unit", "timestamp", "interval_id", "interval"]);
    }

    #[test]
    fn single_point_has_no_interval() {
        let m = metric(vec![vec![point("2024-01-01T10:00:00Z", Some(3.0))]]);
        assert_eq!(create_metric(&m, "average", "PT1M").unwrap()["interval"], Value::Null);
    }

    #[test]
    fn no_value_means_no_metric() {
        assert!(create_metric(&metric(vec![vec![point("2024-01-01T10:00:00Z", None)]]), "average", "PT1M").is_none());
        assert!(create_metric(&metric(vec![]), "average", "PT1M").is_none());
        assert!(create_metric(&metric(vec![vec![point("2024-01-01T10:00:00Z", Some(1.0))]]), "total", "PT1M").is_none());
    }

    #[test]
    fn timedelta_rendering() {
        assert_eq!(format_timedelta(60), "0:01:00");
        assert_eq!(format_timedelta(3600), "1:00:00");
        assert_eq!(format_timedelta(90_061), "1 day, 1:01:01");
        assert_eq!(format_timedelta(2 * 86_400), "2 days, 0:00:00");
    }

    #[test]
    fn missing_metrics_become_issues_unless_optional() {
        let raw: Vec<ResourceMetrics> = serde_json::from_value(json!([{
            "resourceid": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm1",
            "value": [
                {"name": {"value": "Percentage CPU"}, "unit": "Percent", "timeseries": [{"data": [{"timeStamp": "2024-01-01T10:00:00Z", "average": 4.0}]}]},
                {"name": {"value": "CPU Credits Consumed"}, "unit": "Count", "timeseries": []},
                {"name": {"value": "Available Memory Bytes"}, "unit": "Bytes", "timeseries": []},
            ]
        }]))
        .unwrap();
        let issues = IssueCollector::new();
        let definition = VIRTUAL_MACHINE_METRICS[0];
        let parsed = parse_metrics(&raw, &definition, "Microsoft.Compute/virtualMachines", &issues);

        let list = parsed.values().next().unwrap().as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(issues.len(), 1);
        assert!(issues.dumpinfo()[0][1].contains("metric not found: Available Memory Bytes (average)"));
    }

    #[test]
    fn catalogue_lookup() {
        assert_eq!(metric_definitions("Microsoft.Network/loadBalancers").len(), 2);
        assert_eq!(metric_definitions("microsoft.cache/redis").len(), 10);
        assert!(metric_definitions("Microsoft.Unknown/things").is_empty());
        assert!(is_optional_metric("Microsoft.Network/loadBalancers", "UsedSnatPorts"));
        assert!(!is_optional_metric("Microsoft.Network/loadBalancers", "ByteCount"));
        for (_, defs) in ALL_METRICS {
            for d in *defs {
                assert!(interval_duration(d.interval).is_some());
                assert!(d.names.split(',').count() <= 20);
            }
        }
    }

    #[test]
    fn cache_path_and_window() {
        use cmk_azure::auth::mgmt_authority_urls;
        use cmk_azure::testing::MockTransport;
        use cmk_azure::types::Authority;
        use std::sync::Arc;

        let client = AzureClient::new(Arc::new(MockTransport::new()), mgmt_authority_urls(Authority::Global, "sub"));
        let issues = IssueCollector::new();
        let now = DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z").unwrap().with_timezone(&Utc);
        let cache = MetricCache::new(
            &client,
            &issues,
            VIRTUAL_NETWORK_GATEWAY_METRICS[0],
            "Microsoft.Network/virtualNetworkGateways",
            "westeurope",
            vec![],
            PathBuf::from("/cache/id/sub"),
            now,
            false,
        );
        assert_eq!(
            cache.cache_file(),
            PathBuf::from("/cache/id/sub/westeurope_Microsoft.Network_virtualNetworkGateways/AverageBandwidth_P2SBandwidth")
        );
        let query = cache.query();
        assert_eq!(query.start_time, "2024-01-01T11:35:00Z");
        assert_eq!(query.end_time, "2024-01-01T12:00:00Z");
        assert!(cache.use_cache());
        assert_eq!(cache.cache_interval(), Duration::from_secs(300));
    }
}
