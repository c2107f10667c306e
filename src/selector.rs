//! Which resources and subscriptions are monitored.
//!
//! The explicit configuration (`group=NAME resources=A,B ...`) and the tag
//! requirements are independent; a resource is monitored when both accept
//! it.

use std::fmt;

use crate::config::Args;
use crate::error::{AgentError, AgentResult};
use crate::resource::{AzureResource, Tagged};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub name: String,
    pub resources: Vec<String>,
}

impl GroupConfig {
    pub fn new(name: &str) -> AgentResult<Self> {
        if name.is_empty() {
            return Err(AgentError::config(format!("falsey group name: {name:?}")));
        }
        Ok(Self {
            name: name.to_string(),
            resources: Vec::new(),
        })
    }

    /// No resource list: every resource of the group.
    pub fn fetchall(&self) -> bool {
        self.resources.is_empty()
    }

    fn add_key(&mut self, key: &str, value: &str) -> AgentResult<()> {
        match key {
            "resources" => {
                self.resources = value.split(',').map(str::to_string).collect();
                Ok(())
            }
            other => Err(AgentError::config(format!("unknown config key: {other}"))),
        }
    }
}

impl fmt::Display for GroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fetchall() {
            return write!(f, "[{}]\n  <fetchall>", self.name);
        }
        writeln!(f, "[{}]", self.name)?;
        let lines: Vec<String> = self.resources.iter().map(|r| format!("resource: {r}")).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplicitConfig {
    /// In order of first appearance; names are lower-cased.
    pub groups: Vec<GroupConfig>,
}

impl ExplicitConfig {
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> AgentResult<Self> {
        let mut config = Self::default();
        let mut current: Option<usize> = None;
        for item in raw {
            let item = item.as_ref();
            let Some((key, value)) = item.split_once('=') else {
                return Err(AgentError::config(format!("must be in <key>=<value> format: {item:?}")));
            };
            if key == "group" {
                let name = value.to_lowercase();
                let idx = match config.groups.iter().position(|g| g.name == name) {
                    Some(idx) => idx,
                    None => {
                        config.groups.push(GroupConfig::new(&name)?);
                        config.groups.len() - 1
                    }
                };
                current = Some(idx);
                continue;
            }
            let Some(idx) = current else {
                return Err(AgentError::config("missing arg: group=<name>"));
            };
            config.groups[idx].add_key(key, value)?;
        }
        Ok(config)
    }

    /// Nothing configured: every resource.
    pub fn fetchall(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn is_configured(&self, resource: &AzureResource) -> bool {
        if self.fetchall() {
            return true;
        }
        let group = resource.group.to_lowercase();
        match self.groups.iter().find(|g| g.name == group) {
            None => false,
            Some(g) if g.fetchall() => true,
            Some(g) => g.resources.iter().any(|r| *r == resource.name),
        }
    }
}

impl fmt::Display for ExplicitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fetchall() {
            return write!(f, "[<fetchall>]");
        }
        let groups: Vec<String> = self.groups.iter().map(ToString::to_string).collect();
        write!(f, "{}", groups.join("\n"))
    }
}

/// Required tag keys and required `(key, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagBasedConfig {
    required: Vec<String>,
    values: Vec<(String, String)>,
}

impl TagBasedConfig {
    pub fn new(required: Vec<String>, values: Vec<(String, String)>) -> Self {
        Self { required, values }
    }

    pub fn is_configured(&self, item: &impl Tagged) -> bool {
        let tags = item.tags();
        if !self.required.iter().all(|k| tags.contains_key(k)) {
            return false;
        }
        self.values
            .iter()
            .all(|(key, val)| tags.get(key) == Some(val))
    }
}

impl fmt::Display for TagBasedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::new();
        if !self.required.is_empty() {
            lines.push(format!("required tags: {}", self.required.join(", ")));
        }
        for (key, val) in &self.values {
            lines.push(format!("required value for '{key}': '{val}'"));
        }
        write!(f, "{}", lines.join("\n"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    explicit: ExplicitConfig,
    tag_based: TagBasedConfig,
}

impl Selector {
    pub fn new(explicit: ExplicitConfig, tag_based: TagBasedConfig) -> Self {
        Self { explicit, tag_based }
    }

    pub fn from_args(args: &Args) -> AgentResult<Self> {
        Ok(Self::new(
            ExplicitConfig::parse(&args.explicit_config)?,
            TagBasedConfig::new(args.require_tag.clone(), args.require_tag_values()),
        ))
    }

    pub fn do_monitor(&self, resource: &AzureResource) -> bool {
        self.explicit.is_configured(resource) && self.tag_based.is_configured(resource)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Explicit configuration:\n  {}",
            self.explicit.to_string().replace('\n', "\n  ")
        )?;
        write!(
            f,
            "Tag based configuration:\n  {}",
            self.tag_based.to_string().replace('\n', "\n  ")
        )
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
