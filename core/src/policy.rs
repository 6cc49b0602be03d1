use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use regex_lite::Regex;
use regex_lite::RegexBuilder;
use serde::Serialize;

use crate::error::Result;
use crate::error::ShemcpErr;

/// Immutable security policy, built once at startup and shared read-only for
/// the lifetime of the process.
#[derive(Debug)]
pub struct Policy {
    sandbox_root: PathBuf,
    worktree_detection: bool,
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    allow_sources: Vec<String>,
    deny_sources: Vec<String>,
    timeout_ms: u64,
    max_output_bytes: u64,
    env_allowlist: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Allow,
    Deny,
}

/// Structured outcome of a policy check; `matched_rule` carries the regex
/// source so a denial can be debugged without exposing the whole policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyCheck {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<RuleType>,
}

impl Policy {
    pub fn new(
        sandbox_root: PathBuf,
        worktree_detection: bool,
        allow_sources: Vec<String>,
        deny_sources: Vec<String>,
        timeout_ms: u64,
        max_output_bytes: u64,
        env_allowlist: Vec<String>,
    ) -> Result<Self> {
        let allow = compile_patterns(&allow_sources)?;
        let deny = compile_patterns(&deny_sources)?;
        Ok(Self {
            sandbox_root,
            worktree_detection,
            allow,
            deny,
            allow_sources,
            deny_sources,
            timeout_ms,
            max_output_bytes,
            env_allowlist,
        })
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    pub fn worktree_detection(&self) -> bool {
        self.worktree_detection
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn max_output_bytes(&self) -> u64 {
        self.max_output_bytes
    }

    pub fn allow_sources(&self) -> &[String] {
        &self.allow_sources
    }

    pub fn deny_sources(&self) -> &[String] {
        &self.deny_sources
    }

    pub fn env_allowlist(&self) -> &[String] {
        &self.env_allowlist
    }

    /// Deny rules are checked first so an allowlisted program still cannot
    /// run a forbidden subcommand; allow rules are scanned in configured
    /// order; anything unmatched is denied.
    pub fn check_command_policy(&self, command_line: &str) -> PolicyCheck {
        for (regex, source) in self.deny.iter().zip(&self.deny_sources) {
            if regex.is_match(command_line) {
                return PolicyCheck {
                    allowed: false,
                    reason: "Command matches deny rule".to_string(),
                    matched_rule: Some(source.clone()),
                    rule_type: Some(RuleType::Deny),
                };
            }
        }

        for (regex, source) in self.allow.iter().zip(&self.allow_sources) {
            if regex.is_match(command_line) {
                return PolicyCheck {
                    allowed: true,
                    reason: "Command matches allow rule".to_string(),
                    matched_rule: Some(source.clone()),
                    rule_type: Some(RuleType::Allow),
                };
            }
        }

        PolicyCheck {
            allowed: false,
            reason: "Command does not match any allow rule".to_string(),
            matched_rule: None,
            rule_type: None,
        }
    }

    /// Environment forwarded to children: the intersection of the name
    /// allowlist with the parent environment.
    pub fn filtered_env(&self) -> HashMap<String, String> {
        self.env_allowlist
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect()
    }
}

fn compile_patterns(sources: &[String]) -> Result<Vec<Regex>> {
    sources
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ShemcpErr::PolicyPattern {
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}
