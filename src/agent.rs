//! Run orchestration: subscriptions, group and subscription info, resource
//! processing and the connection test.

use std::collections::{BTreeMap, BTreeSet};

use cmk_azure::resources::{list_resource_groups, list_resources, list_subscriptions};
use cmk_azure::types::Tags;
use cmk_azure::{AzureClient, AzureError, AzureErrorKind};
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{PiggybackVms, USAGE_DETAILS_SERVICE};
use crate::context::RunContext;
use crate::error::{AgentError, AgentResult};
use crate::graph::process_graph;
use crate::health::process_resource_health;
use crate::metrics::process_metrics;
use crate::processors::{process_bulk_resources, process_single_resource};
use crate::resource::{filter_tags, AzureResource, AzureSubscription, ResourceKind};
use crate::section::{python_json, Section};
use crate::selector::TagBasedConfig;
use crate::usage::process_usage_details;

// ── Subscriptions ───────────────────────────────────────────────────

/// Subscriptions to monitor. Listing failures are reported on the main
/// host and yield no subscriptions.
pub async fn get_subscriptions(ctx: &RunContext) -> AgentResult<Vec<AzureSubscription>> {
    const COMPONENT: &str = "Management client - get subscriptions";
    if ctx.args.no_subscriptions {
        return Ok(Vec::new());
    }

    let mut client = ctx.mgmt_client("");
    let listed = async {
        client.login(&ctx.args.credentials()).await?;
        list_subscriptions(&client).await
    }
    .await;
    let listed = match listed {
        Ok(listed) => listed,
        Err(e) => {
            ctx.handle_error(e.into(), COMPONENT, None)?;
            return Ok(Vec::new());
        }
    };

    let tenant_id = ctx.args.tenant.clone().unwrap_or_default();
    let available: Vec<AzureSubscription> = listed
        .into_iter()
        .map(|s| {
            AzureSubscription::new(
                s.subscription_id,
                s.display_name,
                s.tags.unwrap_or_default(),
                tenant_id.as_str(),
                ctx.args.safe_hostnames,
            )
        })
        .collect();

    if ctx.args.all_subscriptions {
        return Ok(available);
    }

    if ctx.args.selects_subscriptions_by_tag() {
        let config = TagBasedConfig::new(
            ctx.args.subscriptions_require_tag.clone(),
            ctx.args.subscriptions_require_tag_values(),
        );
        return Ok(available.into_iter().filter(|s| config.is_configured(s)).collect());
    }

    let mut selected = Vec::new();
    for requested in &ctx.args.subscriptions {
        match available.iter().find(|s| s.id.eq_ignore_ascii_case(requested)) {
            Some(subscription) => selected.push(subscription.clone()),
            None => {
                let error = AgentError::from(AzureError::api(format!(
                    "Subscription {requested} not found in Azure"
                )));
                ctx.bailout(&error, COMPONENT, None)?;
            }
        }
    }
    Ok(selected)
}

// ── Groups ──────────────────────────────────────────────────────────

/// Monitored resources of the subscription.
pub async fn collect_resources(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
) -> AgentResult<Vec<AzureResource>> {
    let mut resources = Vec::new();
    for raw in list_resources(client).await? {
        let resource = AzureResource::new(raw, &ctx.tags_option, subscription)?;
        if ctx.selector.do_monitor(&resource) {
            resources.push(resource);
        } else {
            debug!("Resource {} not selected", resource.id);
        }
    }
    Ok(resources)
}

/// Sorted unique groups of `resources`.
pub fn monitored_groups(resources: &[AzureResource]) -> Vec<String> {
    resources
        .iter()
        .map(|r| r.group.clone())
        .filter(|g| !g.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Imported tags of every monitored group, keyed by lower-cased name.
pub async fn get_group_labels(
    ctx: &RunContext,
    client: &AzureClient,
    monitored_groups: &[String],
) -> AgentResult<BTreeMap<String, Tags>> {
    let mut group_labels = BTreeMap::new();
    for group in list_resource_groups(client).await? {
        let name = group.name.to_lowercase();
        if !monitored_groups.contains(&name) {
            continue;
        }
        let tags = filter_tags(&group.tags.unwrap_or_default(), &ctx.tags_option);
        group_labels.insert(name, tags);
    }
    Ok(group_labels)
}

/// Labels of every monitored group and the monitored groups and resources
/// on the subscription host.
pub fn write_group_info(
    ctx: &RunContext,
    subscription: &AzureSubscription,
    monitored_groups: &[String],
    monitored_resources: &[AzureResource],
    group_labels: &BTreeMap<String, Tags>,
) -> AgentResult<()> {
    for (group, tags) in group_labels {
        let labels = json!({
            "resource_group": group,
            "subscription_name": subscription.hostname,
            "subscription_id": subscription.id,
            "entity": "resource_group",
        });
        ctx.write(&Section::labels(group, subscription, &labels, tags))?;
    }

    let mut section = Section::piggyback("agent_info", &[&subscription.hostname], subscription);
    section.add(["monitored-groups".to_string(), python_json(monitored_groups)]);
    let names: Vec<&str> = monitored_resources.iter().map(|r| r.name.as_str()).collect();
    section.add(["monitored-resources".to_string(), python_json(&names)]);
    ctx.write(&section)?;

    // Empty agent_info marks every group host as known.
    let targets: Vec<&str> = monitored_groups
        .iter()
        .map(String::as_str)
        .chain([subscription.hostname.as_str()])
        .collect();
    ctx.write_forced(&Section::piggyback("agent_info", &targets, subscription))
}

pub fn write_subscription_info(ctx: &RunContext, subscription: &AzureSubscription) -> AgentResult<()> {
    let labels = json!({
        "subscription_name": subscription.hostname,
        "subscription_id": subscription.id,
        "entity": "subscription",
    });
    let tags = filter_tags(&subscription.tags, &ctx.tags_option);
    ctx.write(&Section::labels(&subscription.hostname, subscription, &labels, &tags))
}

// ── Resources ───────────────────────────────────────────────────────

/// Write the section of one processed resource. Virtual machines
/// piggybacked to themselves also get their host labels.
pub fn write_resource_section(
    ctx: &RunContext,
    subscription: &AzureSubscription,
    resource: &AzureResource,
    group_labels: &BTreeMap<String, Tags>,
) -> AgentResult<()> {
    let vm_instance =
        resource.kind == ResourceKind::VirtualMachine && ctx.piggyback_vms() == PiggybackVms::Itself;

    let targets = if vm_instance {
        let labels = json!({
            "resource_group": resource.group,
            "entity": resource.section,
            "subscription_name": subscription.hostname,
            "subscription_id": subscription.id,
            "vm_instance": true,
        });
        let mut tags = group_labels.get(&resource.group).cloned().unwrap_or_default();
        tags.extend(resource.tags.clone());
        ctx.write(&Section::labels(&resource.name, subscription, &labels, &tags))?;
        vec![resource.name.clone()]
    } else {
        resource.piggytargets.clone()
    };

    let mut section = Section::piggyback(&resource.section, &targets, subscription);
    section.add_rows(resource.dumpinfo());
    ctx.write(&section)
}

fn service_enabled(ctx: &RunContext, resource: &AzureResource) -> bool {
    ctx.args
        .services
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&resource.resource_type))
}

/// Metrics first, then health, bulk and single enrichment concurrently.
/// Each resource section is written once its enrichment is done.
pub async fn process_resources(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
    resources: Vec<AzureResource>,
    group_labels: &BTreeMap<String, Tags>,
) -> AgentResult<()> {
    let mut monitored: BTreeMap<String, AzureResource> = resources
        .into_iter()
        .filter(|r| service_enabled(ctx, r))
        .map(|r| (r.key(), r))
        .collect();

    process_metrics(ctx, client, subscription, &mut monitored).await?;

    let bulk_resources: BTreeMap<String, AzureResource> = monitored
        .iter()
        .filter(|(_, r)| r.kind.is_bulk())
        .map(|(k, r)| (k.clone(), r.clone()))
        .collect();

    let health = process_resource_health(ctx, client, subscription, &monitored);

    let bulk = async {
        let processed = process_bulk_resources(ctx, client, subscription, &bulk_resources).await?;
        for resource in &processed {
            write_resource_section(ctx, subscription, resource, group_labels)?;
        }
        AgentResult::Ok(())
    };

    let single = async {
        let tasks = monitored
            .values()
            .filter(|r| !r.kind.is_bulk())
            .map(|r| process_single_resource(ctx, client, subscription, r.clone()));
        for result in join_all(tasks).await {
            match result {
                Ok(resource) => write_resource_section(ctx, subscription, &resource, group_labels)?,
                Err(e) => ctx.handle_error(e, "Process single resources (async)", Some(subscription))?,
            }
        }
        AgentResult::Ok(())
    };

    let (health, bulk, single) = futures::join!(health, bulk, single);
    for result in [health, bulk, single] {
        if let Err(e) = result {
            ctx.handle_error(e, "Management client (async)", Some(subscription))?;
        }
    }
    Ok(())
}

/// Everything of one subscription. Any failure ends up as bailout on the
/// subscription host.
pub async fn main_subscription(ctx: &RunContext, subscription: &AzureSubscription) -> AgentResult<()> {
    let mut client = ctx.mgmt_client(&subscription.id);
    let result = async {
        client.login(&ctx.args.credentials()).await?;

        let resources = collect_resources(ctx, &client, subscription).await?;
        let groups = monitored_groups(&resources);
        let group_labels = get_group_labels(ctx, &client, &groups).await?;
        write_group_info(ctx, subscription, &groups, &resources, &group_labels)?;
        write_subscription_info(ctx, subscription)?;

        let usage = async {
            if ctx.args.has_service(USAGE_DETAILS_SERVICE) {
                process_usage_details(ctx, &client, subscription, &groups).await
            } else {
                Ok(())
            }
        };
        let processing = process_resources(ctx, &client, subscription, resources, &group_labels);
        let (usage, processing) = futures::join!(usage, processing);
        usage?;
        processing?;

        let mut section = Section::piggyback("agent_info", &[&subscription.hostname], subscription);
        let remaining = client.ratelimit().map_or_else(|| "None".to_string(), |r| r.to_string());
        section.add(["remaining-reads".to_string(), remaining]);
        ctx.write(&section)
    }
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => ctx.handle_error(e, "Management client", Some(subscription)),
    }
}

// ── Entry points ────────────────────────────────────────────────────

/// Log in to the management API only. Returns the exit code.
pub async fn connection_test(ctx: &RunContext) -> AgentResult<u8> {
    let mut client = ctx.mgmt_client("");
    match client.login(&ctx.args.credentials()).await {
        Ok(()) => {
            info!("Connection test succeeded");
            Ok(0)
        }
        Err(e) if e.is_proxy_error() => {
            ctx.print(&format!("Connection failed due to a proxy error: {e}\n"))?;
            Ok(2)
        }
        Err(e) => {
            if !matches!(
                e.kind,
                AzureErrorKind::LoginFailed | AzureErrorKind::Network | AzureErrorKind::Config
            ) {
                debug!("Unexpected connection test failure: {:?}", e);
            }
            ctx.print(&format!("Connection failed with: {e}\n"))?;
            Ok(2)
        }
    }
}

/// One agent run. Returns the exit code.
pub async fn run(ctx: &RunContext) -> AgentResult<u8> {
    if ctx.args.dump_config {
        ctx.print(&format!("Configuration:\n{}\n", ctx.selector))?;
        return Ok(0);
    }
    if ctx.args.connection_test {
        return connection_test(ctx).await;
    }

    let graph = process_graph(ctx);
    let subscriptions = async {
        let subscriptions = get_subscriptions(ctx).await?;
        info!("Monitoring {} subscription(s)", subscriptions.len());
        let results = join_all(subscriptions.iter().map(|s| main_subscription(ctx, s))).await;
        results.into_iter().collect::<AgentResult<Vec<()>>>()?;
        AgentResult::Ok(())
    };

    let (graph, subscriptions) = futures::join!(graph, subscriptions);
    graph?;
    subscriptions?;
    Ok(0)
}
