//! State shared by every task of one agent run.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cmk_azure::auth::{graph_authority_urls, mgmt_authority_urls};
use cmk_azure::types::Authority;
use cmk_azure::{AzureClient, HttpTransport, Transport};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::{Args, PiggybackVms, TagsOption};
use crate::error::{AgentError, AgentResult};
use crate::resource::AzureSubscription;
use crate::section::{write_exception_to_agent_info_section, Section, SectionWriter};
use crate::selector::Selector;

pub struct RunContext {
    pub args: Args,
    pub authority: Authority,
    pub tags_option: TagsOption,
    pub selector: Selector,
    /// Reference time of every metric and usage query.
    pub now: DateTime<Utc>,
    transport: Arc<dyn Transport>,
    writer: SectionWriter,
    /// Serialises cost queries across subscriptions.
    cost_query_lock: Mutex<()>,
}

impl RunContext {
    pub fn new(args: Args, transport: Arc<dyn Transport>, writer: SectionWriter) -> AgentResult<Self> {
        Ok(Self {
            authority: args.authority()?,
            tags_option: args.tags_option()?,
            selector: Selector::from_args(&args)?,
            now: Utc::now(),
            args,
            transport,
            writer,
            cost_query_lock: Mutex::new(()),
        })
    }

    /// Context talking HTTP and writing to stdout.
    pub fn from_args(args: Args) -> AgentResult<Self> {
        let transport = HttpTransport::new(&args.proxy, args.request_timeout())?;
        Self::new(args, Arc::new(transport), SectionWriter::stdout())
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn debug(&self) -> bool {
        self.args.debug
    }

    pub fn piggyback_vms(&self) -> PiggybackVms {
        self.args.piggyback_vms
    }

    /// Unauthenticated management client for `subscription` (empty for
    /// calls outside a subscription).
    pub fn mgmt_client(&self, subscription: &str) -> AzureClient {
        AzureClient::new(self.transport.clone(), mgmt_authority_urls(self.authority, subscription))
    }

    pub fn graph_client(&self) -> AzureClient {
        AzureClient::new(self.transport.clone(), graph_authority_urls(self.authority))
    }

    /// Cache directory of one subscription.
    pub fn cache_dir(&self, subscription_id: &str) -> PathBuf {
        self.args
            .cache_root()
            .join(self.args.cache_id.as_deref().unwrap_or_default())
            .join(subscription_id)
    }

    pub async fn cost_query_guard(&self) -> MutexGuard<'_, ()> {
        self.cost_query_lock.lock().await
    }

    pub fn write(&self, section: &Section) -> AgentResult<()> {
        Ok(section.write(&self.writer, false)?)
    }

    pub fn write_forced(&self, section: &Section) -> AgentResult<()> {
        Ok(section.write(&self.writer, true)?)
    }

    /// Plain text on the output stream, outside any section.
    pub fn print(&self, text: &str) -> AgentResult<()> {
        Ok(self.writer.write_text(text)?)
    }

    /// Write `error` as a bailout.
    pub fn bailout(
        &self,
        error: &AgentError,
        component: &str,
        subscription: Option<&AzureSubscription>,
    ) -> AgentResult<()> {
        Ok(write_exception_to_agent_info_section(
            &self.writer,
            error,
            component,
            subscription,
        )?)
    }

    /// Propagate `error` in debug mode, write it as a bailout otherwise.
    pub fn handle_error(
        &self,
        error: AgentError,
        component: &str,
        subscription: Option<&AzureSubscription>,
    ) -> AgentResult<()> {
        if self.debug() {
            return Err(error);
        }
        self.bailout(&error, component, subscription)
    }
}
