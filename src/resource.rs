//! Subscription and resource model.
//!
//! A resource keeps the raw ARM object as its `info` map (document order
//! preserved) enriched with the subscription context and the attributes
//! parsed from its id. Processors later add `specific_info` or
//! `properties`, the metric orchestrator appends to `metrics`.

use cmk_azure::resource_id::attrs_from_uri;
use cmk_azure::types::Tags;
use serde_json::{json, Map, Value};

use crate::config::TagsOption;
use crate::error::{AgentError, AgentResult};
use crate::section::python_json;

// ── Resource types ──────────────────────────────────────────────────

pub const VIRTUAL_MACHINES: &str = "Microsoft.Compute/virtualMachines";
pub const VAULTS: &str = "Microsoft.RecoveryServices/vaults";
pub const APPLICATION_GATEWAYS: &str = "Microsoft.Network/applicationGateways";
pub const LOAD_BALANCERS: &str = "Microsoft.Network/loadBalancers";
pub const VIRTUAL_NETWORK_GATEWAYS: &str = "Microsoft.Network/virtualNetworkGateways";
pub const REDIS: &str = "Microsoft.Cache/Redis";
pub const MYSQL_FLEXIBLE_SERVERS: &str = "Microsoft.DBforMySQL/flexibleServers";
pub const POSTGRESQL_FLEXIBLE_SERVERS: &str = "Microsoft.DBforPostgreSQL/flexibleServers";
pub const USAGE_DETAILS: &str = "Microsoft.Consumption/usageDetails";

/// Closed set of resource types with dedicated handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    VirtualMachine,
    Vault,
    ApplicationGateway,
    LoadBalancer,
    VirtualNetworkGateway,
    Redis,
    FlexibleServer,
    UsageDetails,
    Other,
}

impl ResourceKind {
    pub fn from_type(resource_type: &str) -> Self {
        let eq = |t: &str| resource_type.eq_ignore_ascii_case(t);
        if eq(VIRTUAL_MACHINES) {
            Self::VirtualMachine
        } else if eq(VAULTS) {
            Self::Vault
        } else if eq(APPLICATION_GATEWAYS) {
            Self::ApplicationGateway
        } else if eq(LOAD_BALANCERS) {
            Self::LoadBalancer
        } else if eq(VIRTUAL_NETWORK_GATEWAYS) {
            Self::VirtualNetworkGateway
        } else if eq(REDIS) {
            Self::Redis
        } else if eq(MYSQL_FLEXIBLE_SERVERS) || eq(POSTGRESQL_FLEXIBLE_SERVERS) {
            Self::FlexibleServer
        } else if eq(USAGE_DETAILS) {
            Self::UsageDetails
        } else {
            Self::Other
        }
    }

    /// Types whose enrichment comes from one subscription wide listing.
    pub fn is_bulk(self) -> bool {
        matches!(
            self,
            Self::VirtualMachine | Self::ApplicationGateway | Self::LoadBalancer
        )
    }
}

// ── Tags ────────────────────────────────────────────────────────────

/// Anything selection by tags applies to.
pub trait Tagged {
    fn tags(&self) -> &Tags;
}

pub fn filter_tags(tags: &Tags, option: &TagsOption) -> Tags {
    match option {
        TagsOption::ImportAll => tags.clone(),
        TagsOption::IgnoreAll => Tags::new(),
        TagsOption::Matching(re) => tags
            .iter()
            .filter(|(key, _)| re.is_match(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn tags_from_value(value: Option<&Value>) -> Tags {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let v = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}

// ── Host names ──────────────────────────────────────────────────────

/// Replace every character not allowed in a host name with `_`.
pub fn project_valid(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ── Subscription ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AzureSubscription {
    pub id: String,
    pub name: String,
    pub tags: Tags,
    pub tenant_id: String,
    /// Piggyback host of subscription level data.
    pub hostname: String,
    safe_hostnames: bool,
}

impl AzureSubscription {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        tags: Tags,
        tenant_id: impl Into<String>,
        safe_hostnames: bool,
    ) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            hostname: project_valid(&name),
            name,
            tags,
            tenant_id: tenant_id.into(),
            safe_hostnames,
        }
    }

    /// Host name for a piggyback target, made unique per subscription when
    /// safe host names are enabled.
    pub fn safe_hostname(&self, name: &str) -> String {
        if !self.safe_hostnames {
            return name.to_string();
        }
        let suffix_start = self
            .id
            .char_indices()
            .rev()
            .nth(7)
            .map_or(0, |(idx, _)| idx);
        format!("azr-{name}-{}", &self.id[suffix_start..])
    }
}

impl Tagged for AzureSubscription {
    fn tags(&self) -> &Tags {
        &self.tags
    }
}

// ── Resource ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AzureResource {
    /// Rendered as the `Resource` line.
    pub info: Map<String, Value>,
    pub id: String,
    pub name: String,
    pub resource_type: String,
    pub location: String,
    /// Lower-cased resource group, empty for subscription level objects.
    pub group: String,
    pub tags: Tags,
    pub kind: ResourceKind,
    pub section: String,
    pub piggytargets: Vec<String>,
    pub metrics: Vec<Value>,
}

impl AzureResource {
    pub fn new(raw: Value, tags_option: &TagsOption, subscription: &AzureSubscription) -> AgentResult<Self> {
        let Value::Object(mut info) = raw else {
            return Err(AgentError::InvalidResource(format!("not an object: {raw}")));
        };
        let id = string_field(&info, "id")?;
        let resource_type = string_field(&info, "type")?;

        let tags = filter_tags(&tags_from_value(info.get("tags")), tags_option);
        info.insert("tags".into(), json!(tags));
        info.insert("tenant_id".into(), json!(subscription.tenant_id));
        info.insert("subscription_name".into(), json!(subscription.name));
        for (key, value) in attrs_from_uri(&id) {
            info.insert(key.to_string(), Value::String(value));
        }

        let mut piggytargets = Vec::new();
        let group = match info.get("group").and_then(Value::as_str) {
            Some(group) if !group.is_empty() => group.to_lowercase(),
            _ => String::new(),
        };
        if !group.is_empty() {
            info.insert("group".into(), json!(group));
            piggytargets.push(group.clone());
        }

        let kind = ResourceKind::from_type(&resource_type);
        let section = match kind {
            ResourceKind::FlexibleServer => "servers".to_string(),
            _ => resource_type
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_lowercase(),
        };

        Ok(Self {
            name: info.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            location: info.get("location").and_then(Value::as_str).unwrap_or_default().to_string(),
            info,
            id,
            resource_type,
            group,
            tags,
            kind,
            section,
            piggytargets,
            metrics: Vec::new(),
        })
    }

    /// Lookup key shared with metric, health and bulk listings.
    pub fn key(&self) -> String {
        self.id.to_lowercase()
    }

    pub fn set_info(&mut self, key: &str, value: Value) {
        self.info.insert(key.to_string(), value);
    }

    /// Rows of the resource section.
    pub fn dumpinfo(&self) -> Vec<Vec<String>> {
        let mut lines = vec![
            vec!["Resource".to_string()],
            vec![python_json(&Value::Object(self.info.clone()))],
        ];
        if !self.metrics.is_empty() {
            lines.push(vec!["metrics following".to_string(), self.metrics.len().to_string()]);
            lines.extend(self.metrics.iter().map(|m| vec![python_json(m)]));
        }
        lines
    }
}

impl Tagged for AzureResource {
    fn tags(&self) -> &Tags {
        &self.tags
    }
}

fn string_field(info: &Map<String, Value>, key: &str) -> AgentResult<String> {
    info.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AgentError::InvalidResource(format!("missing {key:?} in {}", Value::Object(info.clone()))))
}

// ─── Tests ──────────────────────────────────────────────────────────
