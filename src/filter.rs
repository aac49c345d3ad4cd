//! Rule-based message filtering.
//!
//! A [`FilterChain`] is an ordered list of compiled [`FilterRule`]s. Rules are
//! tried from highest to lowest priority (list order breaks ties) and the
//! first rule that matches decides. Rules that fail to compile are skipped so
//! one bad pattern never disables filtering as a whole.

use crate::error::RuleError;
use crate::message::Message;
use ahash::AHashSet;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::{error, trace};

const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    #[default]
    Allow,
    Block,
}

/// What a rule tests. Each kind carries its own data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RuleKind {
    /// Case-insensitive substring of the payload text.
    Keyword { pattern: String },
    /// Case-insensitive regular expression over the payload text.
    Regex { pattern: String },
    /// Only the listed origin nodes may pass; everything else is blocked.
    NodeWhitelist { nodes: Vec<String> },
    /// The listed origin nodes are blocked.
    NodeBlacklist { nodes: Vec<String> },
    /// Messages on the listed channels take the rule's action.
    ChannelList { channels: Vec<u8> },
    /// Only the listed channels may pass; everything else is blocked.
    ChannelAllowlist { channels: Vec<u8> },
}

/// Coarse classification used for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKindTag {
    Content,
    Node,
    Channel,
}

impl RuleKind {
    pub fn tag(&self) -> RuleKindTag {
        match self {
            RuleKind::Keyword { .. } | RuleKind::Regex { .. } => RuleKindTag::Content,
            RuleKind::NodeWhitelist { .. } | RuleKind::NodeBlacklist { .. } => RuleKindTag::Node,
            RuleKind::ChannelList { .. } | RuleKind::ChannelAllowlist { .. } => RuleKindTag::Channel,
        }
    }
}

/// Restricts a rule to some channels and/or origin nodes. Empty lists do not
/// restrict. A message outside the scope simply does not match the rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuleScope {
    #[serde(default)]
    pub channels: Vec<u8>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// A filter rule as configured.
///
/// Node-list kinds and channel allowlists always block (whitelists and
/// allowlists block what they do not list, blacklists block what they list);
/// `action` only applies to keyword, regex and channel-list rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FilterRule {
    pub name: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    #[serde(default)]
    pub action: FilterAction,
    /// Higher is evaluated first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scope: Option<RuleScope>,
}

impl FilterRule {
    pub fn new(name: impl Into<String>, kind: RuleKind, action: FilterAction, priority: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            action,
            priority,
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// Outcome of evaluating a message against the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: FilterAction,
    /// Name of the rule that decided, `None` when the default applied.
    pub matched_rule: Option<String>,
    pub matched_kind: Option<RuleKindTag>,
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        self.action == FilterAction::Block
    }
}

enum Matcher {
    Keyword(String),
    Regex(Regex),
    NodeWhitelist(AHashSet<String>),
    NodeBlacklist(AHashSet<String>),
    Channels(AHashSet<u8>),
    ChannelAllowlist(AHashSet<u8>),
}

struct CompiledScope {
    channels: AHashSet<u8>,
    nodes: AHashSet<String>,
}

impl CompiledScope {
    fn contains(&self, message: &Message) -> bool {
        (self.channels.is_empty() || self.channels.contains(&message.channel))
            && (self.nodes.is_empty() || self.nodes.contains(&message.origin_node))
    }
}

struct CompiledRule {
    name: String,
    tag: RuleKindTag,
    action: FilterAction,
    scope: Option<CompiledScope>,
    matcher: Matcher,
}

impl CompiledRule {
    fn compile(rule: &FilterRule) -> Result<Self, RuleError> {
        let invalid = |reason: String| RuleError {
            rule: rule.name.clone(),
            reason,
        };

        let matcher = match &rule.kind {
            RuleKind::Keyword { pattern } => {
                if pattern.is_empty() {
                    return Err(invalid("empty keyword".to_string()));
                }
                Matcher::Keyword(pattern.to_lowercase())
            }
            RuleKind::Regex { pattern } => {
                if pattern.is_empty() {
                    return Err(invalid("empty regex".to_string()));
                }
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| invalid(e.to_string()))?;
                Matcher::Regex(regex)
            }
            RuleKind::NodeWhitelist { nodes } => Matcher::NodeWhitelist(nodes.iter().cloned().collect()),
            RuleKind::NodeBlacklist { nodes } => Matcher::NodeBlacklist(nodes.iter().cloned().collect()),
            RuleKind::ChannelList { channels } => Matcher::Channels(channels.iter().copied().collect()),
            RuleKind::ChannelAllowlist { channels } => {
                Matcher::ChannelAllowlist(channels.iter().copied().collect())
            }
        };

        Ok(Self {
            name: rule.name.clone(),
            tag: rule.kind.tag(),
            action: rule.action,
            scope: rule.scope.as_ref().map(|s| CompiledScope {
                channels: s.channels.iter().copied().collect(),
                nodes: s.nodes.iter().cloned().collect(),
            }),
            matcher,
        })
    }

    /// `Some(action)` if this rule decides the message.
    fn verdict(&self, message: &Message) -> Option<FilterAction> {
        if let Some(scope) = &self.scope {
            if !scope.contains(message) {
                return None;
            }
        }

        match &self.matcher {
            Matcher::Keyword(keyword) => {
                let text = message.text()?;
                text.to_lowercase().contains(keyword.as_str()).then_some(self.action)
            }
            Matcher::Regex(regex) => {
                let text = message.text()?;
                regex.is_match(text).then_some(self.action)
            }
            Matcher::NodeWhitelist(nodes) => {
                (!nodes.contains(&message.origin_node)).then_some(FilterAction::Block)
            }
            Matcher::NodeBlacklist(nodes) => {
                nodes.contains(&message.origin_node).then_some(FilterAction::Block)
            }
            Matcher::Channels(channels) => channels.contains(&message.channel).then_some(self.action),
            Matcher::ChannelAllowlist(channels) => {
                (!channels.contains(&message.channel)).then_some(FilterAction::Block)
            }
        }
    }
}

/// Ordered, compiled set of filter rules. Immutable once built; reloading
/// builds a new chain and swaps it in.
pub struct FilterChain {
    rules: Vec<CompiledRule>,
    source: Vec<FilterRule>,
    default_action: FilterAction,
    errors: Vec<RuleError>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl FilterChain {
    /// Compiles `rules`. Malformed rules are logged, recorded in
    /// [`config_errors`](Self::config_errors) and left out of the chain.
    pub fn new(rules: Vec<FilterRule>, default_action: FilterAction) -> Self {
        let mut ordered: Vec<&FilterRule> = rules.iter().collect();
        // Stable: equal priorities keep configuration order.
        ordered.sort_by_key(|rule| Reverse(rule.priority));

        let mut compiled = Vec::with_capacity(ordered.len());
        let mut errors = Vec::new();
        for rule in ordered {
            match CompiledRule::compile(rule) {
                Ok(c) => compiled.push(c),
                Err(e) => {
                    error!(rule = %rule.name, reason = %e.reason, "Skipping malformed filter rule");
                    errors.push(e);
                }
            }
        }

        Self {
            rules: compiled,
            source: rules,
            default_action,
            errors,
        }
    }

    /// A chain with no rules that allows everything.
    pub fn allow_all() -> Self {
        Self::new(Vec::new(), FilterAction::Allow)
    }

    /// Evaluates `message`. Pure apart from trace logging.
    pub fn evaluate(&self, message: &Message) -> Decision {
        for rule in &self.rules {
            if let Some(action) = rule.verdict(message) {
                trace!(
                    rule = %rule.name,
                    action = ?action,
                    fingerprint = %message.fingerprint,
                    "Filter rule matched"
                );
                return Decision {
                    action,
                    matched_rule: Some(rule.name.clone()),
                    matched_kind: Some(rule.tag),
                };
            }
        }

        Decision {
            action: self.default_action,
            matched_rule: None,
            matched_kind: None,
        }
    }

    pub fn default_action(&self) -> FilterAction {
        self.default_action
    }

    /// Rules as configured (including malformed ones), in configuration order.
    pub fn rules(&self) -> &[FilterRule] {
        &self.source
    }

    /// Number of rules that compiled and take part in evaluation.
    pub fn active_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn config_errors(&self) -> &[RuleError] {
        &self.errors
    }

    /// A new chain with `rule` added.
    pub fn with_rule(&self, rule: FilterRule) -> Self {
        let mut rules = self.source.clone();
        rules.push(rule);
        Self::new(rules, self.default_action)
    }

    /// A new chain without the rule called `name`, or `None` if there is no
    /// such rule.
    pub fn without_rule(&self, name: &str) -> Option<Self> {
        let position = self.source.iter().position(|r| r.name == name)?;
        let mut rules = self.source.clone();
        rules.remove(position);
        Some(Self::new(rules, self.default_action))
    }
}
