//! Command line configuration.
//!
//! Flags mirror the special agent rule: credentials, subscription selection,
//! resource filters, tag import, piggyback mode, cache location and network
//! settings. Parsing is done with `clap` derive; a handful of helpers turn
//! the flat flags into the structures the run needs.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, ArgGroup, Parser, ValueEnum};
use cmk_azure::types::{Authority, Credentials, ProxyConfig};
use regex::Regex;

use crate::error::{AgentError, AgentResult};

/// Service name enabling the cost management query.
pub const USAGE_DETAILS_SERVICE: &str = "usage_details";

/// Where the data of virtual machines is attached to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum PiggybackVms {
    /// The host of the resource group the VM belongs to.
    #[default]
    Grouphost,
    /// A host named like the VM itself.
    #[value(name = "self")]
    Itself,
}

/// Which resource tags are imported as host labels.
#[derive(Debug, Clone, Default)]
pub enum TagsOption {
    #[default]
    ImportAll,
    IgnoreAll,
    /// Tags whose key matches the pattern anywhere.
    Matching(Regex),
}

impl fmt::Display for TagsOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImportAll => write!(f, "import_all"),
            Self::IgnoreAll => write!(f, "ignore_all"),
            Self::Matching(re) => write!(f, "{}", re.as_str()),
        }
    }
}

/// Special agent for Microsoft Azure.
#[derive(Debug, Clone, Parser)]
#[command(name = "agent_azure", version)]
#[command(group(
    ArgGroup::new("subscription_selection")
        .args([
            "subscriptions",
            "all_subscriptions",
            "no_subscriptions",
            "subscriptions_require_tag",
            "subscriptions_require_tag_value",
        ])
        .multiple(false)
))]
pub struct Args {
    /// Debug mode: propagate errors instead of writing them as bailouts
    #[arg(long)]
    pub debug: bool,

    /// Verbose mode (for even more output use -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dump parsed configuration and exit
    #[arg(long)]
    pub dump_config: bool,

    /// Timeout of individual HTTP requests in seconds
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// Send VM piggyback data to the group host (default) or the VM itself
    #[arg(long = "piggyback_vms", visible_alias = "piggyback-vms", value_enum, default_value_t)]
    pub piggyback_vms: PiggybackVms,

    /// Monitor this subscription; repeat for more
    #[arg(long = "subscription", value_name = "ID")]
    pub subscriptions: Vec<String>,

    /// Monitor all available subscriptions
    #[arg(long)]
    pub all_subscriptions: bool,

    /// Do not monitor subscriptions
    #[arg(long)]
    pub no_subscriptions: bool,

    /// Only monitor subscriptions that have the specified TAG; repeat for more
    #[arg(long, value_name = "TAG")]
    pub subscriptions_require_tag: Vec<String>,

    /// Only monitor subscriptions that have TAG set to VALUE; repeat for more
    #[arg(long, num_args = 2, value_names = ["TAG", "VALUE"], action = ArgAction::Append)]
    pub subscriptions_require_tag_value: Vec<String>,

    /// Azure client ID
    #[arg(long, required_unless_present = "dump_config")]
    pub client: Option<String>,

    /// Azure tenant ID
    #[arg(long, required_unless_present = "dump_config")]
    pub tenant: Option<String>,

    /// Azure authentication secret
    #[arg(long, env = "AZURE_SECRET", hide_env_values = true, required_unless_present = "dump_config")]
    pub secret: Option<String>,

    /// Authority to be used
    #[arg(long, default_value = "global", value_parser = ["global", "china"])]
    pub authority: String,

    /// Only monitor resources that have the specified TAG; repeat for more
    #[arg(long, value_name = "TAG")]
    pub require_tag: Vec<String>,

    /// Only monitor resources that have TAG set to VALUE; repeat for more
    #[arg(long, num_args = 2, value_names = ["TAG", "VALUE"], action = ArgAction::Append)]
    pub require_tag_value: Vec<String>,

    /// Explicitly configure resources: `group=NAME [resources=A,B] ...`
    #[arg(long, num_args = 0.., value_name = "KEY=VALUE")]
    pub explicit_config: Vec<String>,

    /// List of services to monitor
    #[arg(long, num_args = 0..)]
    pub services: Vec<String>,

    /// Do not import any tags as host labels
    #[arg(long, conflicts_with = "import_matching_tags_as_labels")]
    pub ignore_all_tags: bool,

    /// Only import tags whose key matches PATTERN as host labels
    #[arg(long, value_name = "PATTERN")]
    pub import_matching_tags_as_labels: Option<String>,

    /// Append the last part of the subscription ID to piggyback host names
    #[arg(long)]
    pub safe_hostnames: bool,

    /// Unique id of this agent configuration, used for the cache directory
    #[arg(long, required_unless_present_any = ["connection_test", "dump_config"])]
    pub cache_id: Option<String>,

    /// Root directory of the cache
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// HTTP proxy: FROM_ENVIRONMENT, NO_PROXY or a proxy URL
    #[arg(long, default_value = "FROM_ENVIRONMENT")]
    pub proxy: ProxyConfig,

    /// Run a connection test through the Management API only
    #[arg(long)]
    pub connection_test: bool,
}

impl Args {
    pub fn authority(&self) -> AgentResult<Authority> {
        self.authority.parse().map_err(AgentError::Config)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            tenant_id: self.tenant.clone().unwrap_or_default(),
            client_id: self.client.clone().unwrap_or_default(),
            client_secret: self.secret.clone().unwrap_or_default(),
        }
    }

    pub fn tags_option(&self) -> AgentResult<TagsOption> {
        if self.ignore_all_tags {
            return Ok(TagsOption::IgnoreAll);
        }
        match &self.import_matching_tags_as_labels {
            Some(pattern) => Regex::new(pattern)
                .map(TagsOption::Matching)
                .map_err(|e| AgentError::config(format!("invalid tag pattern {pattern:?}: {e}"))),
            None => Ok(TagsOption::ImportAll),
        }
    }

    pub fn require_tag_values(&self) -> Vec<(String, String)> {
        pairs(&self.require_tag_value)
    }

    pub fn subscriptions_require_tag_values(&self) -> Vec<(String, String)> {
        pairs(&self.subscriptions_require_tag_value)
    }

    /// Subscriptions are picked by their tags.
    pub fn selects_subscriptions_by_tag(&self) -> bool {
        !self.subscriptions_require_tag.is_empty() || !self.subscriptions_require_tag_value.is_empty()
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Root of the cache tree, before the cache id.
    pub fn cache_root(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        if let Some(omd_root) = std::env::var_os("OMD_ROOT") {
            return PathBuf::from(omd_root).join("tmp/check_mk/agents/agent_azure");
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("agent_azure")
    }

    /// Copy with the secret replaced, for logging.
    pub fn masked(&self) -> Self {
        Self {
            secret: self.secret.as_ref().map(|_| "****".to_string()),
            ..self.clone()
        }
    }
}

fn pairs(flat: &[String]) -> Vec<(String, String)> {
    flat.chunks(2)
        .filter_map(|pair| match pair {
            [key, value] => Some((key.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const CREDS: [&str; 6] = ["--tenant", "t", "--client", "c", "--secret", "s"];

    fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
        let argv = std::iter::once("agent_azure")
            .chain(CREDS)
            .chain(extra.iter().copied());
        Args::try_parse_from(argv)
    }

    #[test]
    fn defaults() {
        let args = parse(&["--cache-id", "abc"]).unwrap();
        assert_eq!(args.piggyback_vms, PiggybackVms::Grouphost);
        assert_eq!(args.authority().unwrap(), Authority::Global);
        assert_eq!(args.proxy, ProxyConfig::FromEnvironment);
        assert_eq!(args.timeout, 10);
        assert!(matches!(args.tags_option().unwrap(), TagsOption::ImportAll));
    }

    #[test]
    fn tag_value_pairs() {
        let args = parse(&[
            "--cache-id", "abc",
            "--require-tag-value", "env", "prod",
            "--require-tag-value", "team", "ops",
        ])
        .unwrap();
        assert_eq!(
            args.require_tag_values(),
            vec![("env".into(), "prod".into()), ("team".into(), "ops".into())]
        );
    }

    #[test]
    fn subscription_selection_is_exclusive() {
        assert!(parse(&["--cache-id", "a", "--subscription", "s1", "--all-subscriptions"]).is_err());
        let args = parse(&["--cache-id", "a", "--subscription", "s1", "--subscription", "s2"]).unwrap();
        assert_eq!(args.subscriptions, vec!["s1", "s2"]);
    }

    #[test]
    fn piggyback_vms_spellings() {
        let args = parse(&["--cache-id", "a", "--piggyback_vms", "self"]).unwrap();
        assert_eq!(args.piggyback_vms, PiggybackVms::Itself);
        let args = parse(&["--cache-id", "a", "--piggyback-vms", "grouphost"]).unwrap();
        assert_eq!(args.piggyback_vms, PiggybackVms::Grouphost);
    }

    #[test]
    fn cache_id_not_needed_for_connection_test() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--connection-test"]).is_ok());
    }

    #[test]
    fn tag_import_options() {
        let args = parse(&["--cache-id", "a", "--import-matching-tags-as-labels", "^cmk"]).unwrap();
        assert!(matches!(args.tags_option().unwrap(), TagsOption::Matching(re) if re.as_str() == "^cmk"));
        let args = parse(&["--cache-id", "a", "--ignore-all-tags"]).unwrap();
        assert!(matches!(args.tags_option().unwrap(), TagsOption::IgnoreAll));
        assert!(parse(&["--cache-id", "a", "--ignore-all-tags", "--import-matching-tags-as-labels", "x"]).is_err());
    }

    #[test]
    fn invalid_tag_pattern_is_a_config_error() {
        let args = parse(&["--cache-id", "a", "--import-matching-tags-as-labels", "("]).unwrap();
        assert!(matches!(args.tags_option(), Err(AgentError::Config(_))));
    }

    #[test]
    fn masked_hides_secret() {
        let args = parse(&["--cache-id", "a"]).unwrap().masked();
        assert_eq!(args.secret.as_deref(), Some("****"));
        assert_eq!(args.tenant.as_deref(), Some("t"));
    }

    #[test]
    fn explicit_config_and_services() {
        let args = parse(&[
            "--cache-id", "a",
            "--explicit-config", "group=rg1", "resources=vm1,vm2",
            "--services", "Microsoft.Compute/virtualMachines", "usage_details",
        ])
        .unwrap();
        assert_eq!(args.explicit_config, vec!["group=rg1", "resources=vm1,vm2"]);
        assert!(args.has_service(USAGE_DETAILS_SERVICE));
    }

    #[test]
    fn proxy_variants() {
        let args = parse(&["--cache-id", "a", "--proxy", "NO_PROXY"]).unwrap();
        assert_eq!(args.proxy, ProxyConfig::NoProxy);
        let args = parse(&["--cache-id", "a", "--proxy", "http://proxy:3128"]).unwrap();
        assert_eq!(args.proxy, ProxyConfig::Url("http://proxy:3128".into()));
    }
}
