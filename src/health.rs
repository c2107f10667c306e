//! Resource health: one `resource_health` section per resource group.

use std::collections::{BTreeMap, BTreeSet};

use cmk_azure::resources::list_availability_statuses;
use cmk_azure::types::AvailabilityStatus;
use cmk_azure::AzureClient;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::context::RunContext;
use crate::error::AgentResult;
use crate::resource::{AzureResource, AzureSubscription};
use crate::section::{python_json, Section};

/// The health id of a resource is the resource id followed by
/// `/providers/Microsoft.ResourceHealth/availabilityStatuses/current`.
const HEALTH_ID_SUFFIX_SEGMENTS: usize = 4;

fn health_resource_id(health_id: &str) -> Option<String> {
    let segments: Vec<&str> = health_id.split('/').collect();
    let end = segments.len().checked_sub(HEALTH_ID_SUFFIX_SEGMENTS)?;
    Some(segments[..end].join("/"))
}

/// `type/name` of the resource a health entry belongs to.
fn health_resource_name(health_id: &str) -> Option<String> {
    let segments: Vec<&str> = health_id.split('/').collect();
    let end = segments.len().checked_sub(HEALTH_ID_SUFFIX_SEGMENTS)?;
    let start = end.checked_sub(2)?;
    Some(segments[start..end].join("/"))
}

/// Health rows of `statuses` for monitored resources, paired with the
/// group host they belong to.
pub fn health_rows(
    statuses: &[AvailabilityStatus],
    resources: &BTreeMap<String, AzureResource>,
) -> Vec<(String, Value)> {
    statuses
        .iter()
        .filter_map(|status| {
            let resource_id = health_resource_id(&status.id)?;
            let Some(resource) = resources.get(&resource_id.to_lowercase()) else {
                debug!("Health status of unmonitored resource {} skipped", status.id);
                return None;
            };
            let mut data = Map::new();
            data.insert("id".into(), json!(status.id));
            data.insert("name".into(), json!(health_resource_name(&status.id)?));
            if let Ok(Value::Object(properties)) = serde_json::to_value(&status.properties) {
                data.extend(properties);
            }
            data.insert("tags".into(), json!(resource.tags));
            Some((resource.group.clone(), Value::Object(data)))
        })
        .collect()
}

/// Write the health of all monitored resources, one section per group.
/// A failing group is reported as bailout and does not stop the others.
pub async fn process_resource_health(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
    resources: &BTreeMap<String, AzureResource>,
) -> AgentResult<()> {
    let groups: BTreeSet<&str> = resources
        .values()
        .map(|r| r.group.as_str())
        .filter(|g| !g.is_empty())
        .collect();

    let responses = join_all(groups.iter().map(|group| list_availability_statuses(client, group))).await;

    let mut sections: BTreeMap<String, Section> = BTreeMap::new();
    for (group, response) in groups.iter().zip(responses) {
        let statuses = match response {
            Ok(statuses) => statuses,
            Err(e) => {
                ctx.handle_error(e.into(), "Resource Health client", Some(subscription))?;
                continue;
            }
        };
        for (target, data) in health_rows(&statuses, resources) {
            sections
                .entry(target.clone())
                .or_insert_with(|| Section::piggyback("resource_health", &[target.as_str()], subscription))
                .add([python_json(&data)]);
        }
        debug!("Resource health of group {} collected", group);
    }

    for section in sections.values() {
        ctx.write(section)?;
    }
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────
