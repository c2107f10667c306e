//! Core types for the Azure monitoring client.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Error types ─────────────────────────────────────────────────────

/// Categorised error kinds for Azure operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AzureErrorKind {
    LoginFailed,
    NotAuthenticated,
    AuthorizationRequestDenied,
    MissingData,
    NoConsumptionApi,
    RateLimit,
    Api,
    Network,
    Parse,
    Config,
}

impl fmt::Display for AzureErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoginFailed => write!(f, "Login failed"),
            Self::NotAuthenticated => write!(f, "Not authenticated"),
            Self::AuthorizationRequestDenied => write!(f, "Authorization request denied"),
            Self::MissingData => write!(f, "Missing data"),
            Self::NoConsumptionApi => write!(f, "Consumption API not available"),
            Self::RateLimit => write!(f, "Rate limit exceeded"),
            Self::Api => write!(f, "API error"),
            Self::Network => write!(f, "Network error"),
            Self::Parse => write!(f, "Parse error"),
            Self::Config => write!(f, "Configuration error"),
        }
    }
}

/// Main error type for Azure operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureError {
    pub kind: AzureErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Response headers, kept for rate-limit errors so callers can read
    /// the service specific retry hints.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl AzureError {
    pub fn new(kind: AzureErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_status(kind: AzureErrorKind, message: impl Into<String>, status: u16) -> Self {
        Self {
            status_code: Some(status),
            ..Self::new(kind, message)
        }
    }

    pub fn rate_limited(status: u16, headers: BTreeMap<String, String>) -> Self {
        Self {
            headers,
            ..Self::with_status(AzureErrorKind::RateLimit, "Rate limit exceeded", status)
        }
    }

    pub fn login_failed(message: impl Into<String>) -> Self {
        Self::new(AzureErrorKind::LoginFailed, message)
    }

    pub fn not_authenticated() -> Self {
        Self::new(
            AzureErrorKind::NotAuthenticated,
            "Not authenticated, call login first",
        )
    }

    pub fn missing_data(message: impl Into<String>) -> Self {
        Self::new(AzureErrorKind::MissingData, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(AzureErrorKind::Api, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(AzureErrorKind::Config, message)
    }

    /// Map the `error` object of an ARM / Graph response body.
    pub fn from_error_body(error: &Value) -> Self {
        let code = error.get("code").and_then(Value::as_str);
        let message = error.get("message");

        if code == Some("Authorization_RequestDenied") {
            let text = match message {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => error.to_string(),
            };
            return Self::new(AzureErrorKind::AuthorizationRequestDenied, text);
        }

        match (code, message) {
            (Some(_), Some(Value::String(m))) => Self::api(m.clone()),
            (Some(_), Some(other)) => Self::api(other.to_string()),
            _ => Self::api(error.to_string()),
        }
    }

    /// Proxy failures are reported separately by the connection test.
    pub fn is_proxy_error(&self) -> bool {
        self.kind == AzureErrorKind::Network && self.message.to_lowercase().contains("proxy")
    }
}

impl fmt::Display for AzureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for AzureError {}

impl From<reqwest::Error> for AzureError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_decode() {
            AzureErrorKind::Parse
        } else {
            AzureErrorKind::Network
        };
        let mut message = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(inner) = source {
            message.push_str(&format!(": {inner}"));
            source = std::error::Error::source(inner);
        }
        Self::new(kind, message)
    }
}

pub type AzureResult<T> = Result<T, AzureError>;

// ─── Authority / credentials ────────────────────────────────────────

/// Azure cloud the agent talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    #[default]
    Global,
    China,
}

impl FromStr for Authority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "china" => Ok(Self::China),
            other => Err(format!("unknown authority: {other} (expected global or china)")),
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::China => write!(f, "china"),
        }
    }
}

/// How outgoing connections pick their proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxyConfig {
    #[default]
    FromEnvironment,
    NoProxy,
    Url(String),
}

impl FromStr for ProxyConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FROM_ENVIRONMENT" | "" => Ok(Self::FromEnvironment),
            "NO_PROXY" => Ok(Self::NoProxy),
            url => url::Url::parse(url)
                .map(|_| Self::Url(url.to_string()))
                .map_err(|e| format!("invalid proxy url {url:?}: {e}")),
        }
    }
}

/// Service-principal credentials for the client-credentials flow.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Cached bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AzureToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AzureToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() >= exp,
            None => false,
        }
    }
}

/// Raw token endpoint response, success or AAD error.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

// ─── Common ARM shapes ──────────────────────────────────────────────

pub type Tags = BTreeMap<String, String>;

/// Reference to another ARM resource (`{"id": ...}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubResource {
    pub id: String,
}

// ─── Subscriptions / groups / resources ─────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub subscription_id: String,
    pub display_name: String,
    #[serde(default)]
    pub tags: Option<Tags>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceGroupInfo {
    pub name: String,
    #[serde(default)]
    pub tags: Option<Tags>,
}

// ─── Virtual machines ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatusView {
    pub id: String,
    #[serde(default)]
    pub properties: Option<VirtualMachineStatusProperties>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatusProperties {
    #[serde(default)]
    pub instance_view: Option<VirtualMachineInstanceView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachineInstanceView {
    #[serde(default)]
    pub statuses: Option<Vec<Value>>,
}

impl VirtualMachineStatusView {
    pub fn statuses(&self) -> Option<&Vec<Value>> {
        self.properties
            .as_ref()?
            .instance_view
            .as_ref()?
            .statuses
            .as_ref()
    }
}

// ─── Networking: shared ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendIpConfiguration {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: FrontendIpConfigurationProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrontendIpConfigurationProperties {
    #[serde(default, rename = "privateIPAllocationMethod")]
    pub private_ip_allocation_method: Option<String>,
    #[serde(default, rename = "privateIPAddress")]
    pub private_ip_address: Option<String>,
    #[serde(default, rename = "publicIPAddress")]
    pub public_ip_address: Option<SubResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicIpAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub properties: PublicIpAddressProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublicIpAddressProperties {
    #[serde(default, rename = "ipAddress")]
    pub ip_address: Option<String>,
    #[serde(default, rename = "publicIPAllocationMethod")]
    pub public_ip_allocation_method: Option<String>,
    #[serde(default, rename = "dnsSettings")]
    pub dns_settings: Option<DnsSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsSettings {
    #[serde(default)]
    pub fqdn: Option<String>,
}

/// NIC ip-configuration view (standard or scale-set NIC).
#[derive(Debug, Clone, Deserialize)]
pub struct NicIpConfiguration {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: Option<NicIpConfigurationProperties>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NicIpConfigurationProperties {
    #[serde(default, rename = "privateIPAddress")]
    pub private_ip_address: Option<String>,
    #[serde(default, rename = "privateIPAllocationMethod")]
    pub private_ip_allocation_method: Option<String>,
    #[serde(default)]
    pub primary: Option<bool>,
}

// ─── Networking: application gateways ───────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationGateway {
    pub id: String,
    pub properties: ApplicationGatewayProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationGatewayProperties {
    #[serde(default)]
    pub operational_state: Option<String>,
    #[serde(default)]
    pub request_routing_rules: Vec<RequestRoutingRule>,
    #[serde(default)]
    pub http_listeners: Vec<HttpListener>,
    #[serde(default)]
    pub web_application_firewall_configuration: Option<WafConfiguration>,
    #[serde(default)]
    pub frontend_ports: Vec<FrontendPort>,
    #[serde(default)]
    pub backend_http_settings_collection: Vec<BackendHttpSettings>,
    #[serde(default)]
    pub backend_address_pools: Vec<RawSubResource>,
    #[serde(default, rename = "frontendIPConfigurations")]
    pub frontend_ip_configurations: Vec<FrontendIpConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestRoutingRule {
    pub name: String,
    #[serde(default)]
    pub properties: RequestRoutingRuleProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRoutingRuleProperties {
    #[serde(default)]
    pub http_listener: Option<SubResource>,
    #[serde(default)]
    pub backend_address_pool: Option<SubResource>,
    #[serde(default)]
    pub backend_http_settings: Option<SubResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpListener {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: HttpListenerProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpListenerProperties {
    #[serde(default)]
    pub port: Option<u64>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub host_names: Option<Vec<String>>,
    #[serde(default, rename = "frontendIPConfiguration")]
    pub frontend_ip_configuration: Option<SubResource>,
    #[serde(default)]
    pub frontend_port: Option<SubResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WafConfiguration {
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendPort {
    pub id: String,
    #[serde(default)]
    pub properties: FrontendPortProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrontendPortProperties {
    #[serde(default)]
    pub port: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendHttpSettings {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: BackendHttpSettingsProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendHttpSettingsProperties {
    #[serde(default)]
    pub port: Option<u64>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Sub-resource kept verbatim, keyed by its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSubResource {
    pub id: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

// ─── Networking: load balancers ─────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    pub properties: LoadBalancerProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerProperties {
    #[serde(default, rename = "frontendIPConfigurations")]
    pub frontend_ip_configurations: Vec<FrontendIpConfiguration>,
    #[serde(default)]
    pub inbound_nat_rules: Vec<InboundNatRule>,
    #[serde(default)]
    pub backend_address_pools: Vec<BackendAddressPool>,
    #[serde(default)]
    pub outbound_rules: Vec<OutboundRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundNatRule {
    pub name: String,
    #[serde(default)]
    pub properties: InboundNatRuleProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundNatRuleProperties {
    #[serde(default)]
    pub frontend_port: Option<u64>,
    #[serde(default)]
    pub backend_port: Option<u64>,
    #[serde(default, rename = "frontendIPConfiguration")]
    pub frontend_ip_configuration: Option<SubResource>,
    #[serde(default, rename = "backendIPConfiguration")]
    pub backend_ip_configuration: Option<SubResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendAddressPool {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: BackendAddressPoolProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAddressPoolProperties {
    #[serde(default)]
    pub load_balancer_backend_addresses: Vec<BackendAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendAddress {
    #[serde(default)]
    pub properties: BackendAddressProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendAddressProperties {
    #[serde(default, rename = "networkInterfaceIPConfiguration")]
    pub network_interface_ip_configuration: Option<SubResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboundRule {
    pub name: String,
    #[serde(default)]
    pub properties: OutboundRuleProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRuleProperties {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub idle_timeout_in_minutes: Option<u64>,
    #[serde(default)]
    pub backend_address_pool: Option<SubResource>,
}

// ─── Networking: virtual network gateways ───────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualNetworkGateway {
    pub id: String,
    #[serde(default)]
    pub properties: VirtualNetworkGatewayProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualNetworkGatewayProperties {
    #[serde(default)]
    pub bgp_settings: Option<Value>,
    #[serde(default, rename = "disableIPSecReplayProtection")]
    pub disable_ip_sec_replay_protection: Option<bool>,
    #[serde(default)]
    pub gateway_type: Option<String>,
    #[serde(default)]
    pub vpn_type: Option<String>,
    #[serde(default)]
    pub active_active: Option<bool>,
    #[serde(default)]
    pub enable_bgp: Option<bool>,
    #[serde(default)]
    pub remote_virtual_network_peerings: Vec<SubResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualNetworkPeering {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: VirtualNetworkPeeringProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualNetworkPeeringProperties {
    #[serde(default)]
    pub peering_state: Option<String>,
    #[serde(default)]
    pub peering_sync_level: Option<String>,
}

// ─── Resource health ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityStatus {
    pub id: String,
    #[serde(default)]
    pub properties: AvailabilityStatusProperties,
}

/// Health fields reported downstream; absent values are not rendered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityStatusProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occured_time: Option<String>,
}

// ─── Recovery services ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedItem {
    #[serde(default)]
    pub properties: Option<ProtectedItemProperties>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedItemProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_management_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected_item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protection_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protection_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_archive_enabled: Option<bool>,
}

// ─── Metrics ────────────────────────────────────────────────────────

/// One entry of a `metrics:getBatch` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceMetrics {
    pub resourceid: String,
    #[serde(default)]
    pub value: Vec<RawMetric>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMetric {
    pub name: LocalizableString,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub timeseries: Option<Vec<TimeSeries>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalizableString {
    pub value: String,
    #[serde(default, rename = "localizedValue")]
    pub localized_value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeSeries {
    #[serde(default)]
    pub data: Vec<MetricDatapoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricDatapoint {
    #[serde(rename = "timeStamp")]
    pub time_stamp: String,
    #[serde(default)]
    pub average: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub count: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub minimum: Option<f64>,
}

impl MetricDatapoint {
    /// Value of the named aggregation (`average`, `total`, ...).
    pub fn aggregate(&self, aggregation: &str) -> Option<f64> {
        match aggregation {
            "average" => self.average,
            "total" => self.total,
            "count" => self.count,
            "maximum" => self.maximum,
            "minimum" => self.minimum,
            _ => None,
        }
    }
}

// ─── Cost management ────────────────────────────────────────────────

/// One page of a Cost Management query result.
#[derive(Debug, Clone, Deserialize)]
pub struct CostQueryPage {
    pub properties: CostQueryProperties,
    /// Everything but `properties` (id, name, type, location, sku, eTag).
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostQueryProperties {
    #[serde(default)]
    pub next_link: Option<String>,
    #[serde(default)]
    pub columns: Vec<CostColumn>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CostColumn {
    pub name: String,
    #[serde(default, rename = "type")]
    pub column_type: Option<String>,
}

// ─── Microsoft Graph ────────────────────────────────────────────────

/// Application registration, reduced to the fields reported downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphApplication {
    pub app_id: String,
    pub display_name: String,
    pub id: String,
    #[serde(default)]
    pub password_credentials: Vec<Value>,
}

// ─── Tests ──────────────────────────────────────────────────────────
