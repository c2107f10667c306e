//! Daily usage details (cost) of a subscription.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use cmk_azure::cost::{query_usage, usage_query_body};
use cmk_azure::{AzureClient, AzureErrorKind};
use serde_json::{json, Value};
use tracing::debug;

use crate::cache::DataCache;
use crate::context::RunContext;
use crate::error::AgentResult;
use crate::resource::{AzureResource, AzureSubscription, USAGE_DETAILS};
use crate::section::{bailout_section, Section};

const USAGE_CACHE_INTERVAL: Duration = Duration::from_secs(4 * 3600);
const USAGE_SECTION: &str = "usagedetails";

/// Yesterday's usage of one subscription, cached for a few hours.
pub struct UsageDetailsCache<'a> {
    client: &'a AzureClient,
    cache_file: PathBuf,
    day: NaiveDate,
    debug: bool,
}

impl<'a> UsageDetailsCache<'a> {
    pub fn new(client: &'a AzureClient, subscription_cache_dir: PathBuf, day: NaiveDate, debug: bool) -> Self {
        Self {
            client,
            cache_file: subscription_cache_dir.join("usage_details"),
            day,
            debug,
        }
    }
}

#[async_trait]
impl DataCache for UsageDetailsCache<'_> {
    fn cache_file(&self) -> PathBuf {
        self.cache_file.clone()
    }

    fn cache_interval(&self) -> Duration {
        USAGE_CACHE_INTERVAL
    }

    fn debug(&self) -> bool {
        self.debug
    }

    async fn get_live_data(&self) -> AgentResult<Value> {
        let entries = query_usage(self.client, &usage_query_body(self.day)).await?;
        Ok(Value::Array(entries))
    }
}

/// Usage entries as resources of the usage details type, grouped by
/// their resource group.
pub fn usage_resources(entries: Vec<Value>, ctx: &RunContext, subscription: &AzureSubscription) -> AgentResult<Vec<AzureResource>> {
    entries
        .into_iter()
        .map(|mut entry| {
            if let Value::Object(obj) = &mut entry {
                let group = obj
                    .get("properties")
                    .and_then(|p| p.get("ResourceGroupName"))
                    .cloned()
                    .unwrap_or(Value::Null);
                obj.insert("type".into(), json!(USAGE_DETAILS));
                obj.insert("group".into(), group);
            }
            AzureResource::new(entry, &ctx.tags_option, subscription)
        })
        .collect()
}

/// Write yesterday's usage details, one section per entry.
pub async fn process_usage_details(
    ctx: &RunContext,
    client: &AzureClient,
    subscription: &AzureSubscription,
    monitored_groups: &[String],
) -> AgentResult<()> {
    let yesterday = ctx
        .now
        .date_naive()
        .checked_sub_days(Days::new(1))
        .unwrap_or_else(|| ctx.now.date_naive());
    let cache = UsageDetailsCache::new(client, ctx.cache_dir(&subscription.id), yesterday, ctx.debug());

    let data = {
        let _guard = ctx.cost_query_guard().await;
        cache.get_data(true).await
    };

    let entries = match data {
        Ok(Value::Array(entries)) => entries,
        Ok(_) => Vec::new(),
        Err(e) if e.is_kind(AzureErrorKind::NoConsumptionApi) => {
            debug!("Azure offer doesn't support querying the cost API: {}", e);
            return Ok(());
        }
        Err(e) => {
            if ctx.debug() {
                return Err(e);
            }
            ctx.bailout(&e, "Usage client", Some(subscription))?;
            let targets: Vec<&str> = monitored_groups
                .iter()
                .map(String::as_str)
                .chain([subscription.hostname.as_str()])
                .collect();
            return ctx.write_forced(&Section::piggyback(USAGE_SECTION, &targets, subscription));
        }
    };

    if entries.is_empty() {
        let section = bailout_section(
            0,
            "Usage client",
            "Azure API did not return any usage details",
            Some(subscription),
        );
        return ctx.write(&section);
    }

    for usage in usage_resources(entries, ctx, subscription)? {
        let mut targets = Vec::new();
        if monitored_groups.contains(&usage.group) {
            targets.push(usage.group.clone());
        }
        targets.push(subscription.hostname.clone());

        let mut section = Section::piggyback(&usage.section, &targets, subscription);
        section.add_rows(usage.dumpinfo());
        ctx.write(&section)?;
    }
    Ok(())
}
