// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Command Authorization
//!
//! Pure evaluation of shell commands against a five-layer allowlist
//! hierarchy. Workers consult this before every shell command they run.
//!
//! ## Layer Precedence
//! | # | Layer | Effect | Configurable |
//! |---|-------|--------|--------------|
//! | 1 | Hardcoded blocklist | deny | no |
//! | 2 | Org blocklist | deny | org file |
//! | 3 | Org allowlist | allow | org file |
//! | 4 | Global default allowlist | allow | no |
//! | 5 | Project allowlist | allow | project file |
//!
//! The first layer with a matching rule decides. No match anywhere is a
//! deny. Evaluation is a fold over `PolicyBundle::layers`, so precedence is
//! data rather than branching.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const MAX_RULES_PER_LAYER: usize = 100;

pub const HARDCODED_BLOCKLIST: &[&str] = &[
    // disk
    "dd", "mkfs", "fdisk", "parted", "wipefs",
    // power
    "shutdown", "reboot", "poweroff", "halt", "init",
    // ownership / privilege
    "chown", "chgrp", "sudo", "su", "doas",
    // services
    "systemctl", "service", "launchctl",
    // firewall
    "iptables", "ufw", "nft",
];

pub const DEFAULT_ALLOWLIST: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "grep", "find", "sort", "uniq", "diff",
    "cp", "mv", "mkdir", "touch", "rm", "chmod", "pwd", "echo", "sleep",
    "node", "npm", "npx", "pnpm", "yarn", "git", "ps", "lsof", "pkill", "curl",
    "./init.sh",
];

const PKILL_TARGETS: &[&str] = &["node", "npm", "npx", "pnpm", "yarn", "vite", "next", "tsx"];

const SHELL_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "do", "done", "while", "until", "case", "esac", "time",
    "!", "{", "}",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy layer '{layer}' declares {count} command rules (limit {limit})")]
    TooLarge {
        layer: LayerKind,
        count: usize,
        limit: usize,
    },

    #[error("policy conflict: '{rule}' is both allowed and blocked in {source_name}")]
    Conflict { rule: String, source_name: String },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("failed to load policy from {path}: {message}")]
    Load { path: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    HardcodedBlocklist,
    OrgBlocklist,
    OrgAllowlist,
    GlobalAllowlist,
    ProjectAllowlist,
}

impl LayerKind {
    pub fn effect(&self) -> LayerEffect {
        match self {
            LayerKind::HardcodedBlocklist | LayerKind::OrgBlocklist => LayerEffect::Deny,
            _ => LayerEffect::Allow,
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::HardcodedBlocklist => "hardcoded-blocklist",
            LayerKind::OrgBlocklist => "org-blocklist",
            LayerKind::OrgAllowlist => "org-allowlist",
            LayerKind::GlobalAllowlist => "global-allowlist",
            LayerKind::ProjectAllowlist => "project-allowlist",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerEffect {
    Allow,
    Deny,
}

/// One declared command rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandRule {
    /// `git`
    Exact(String),
    /// `npm*`
    Prefix(String),
    /// `./scripts/setup.sh`, matched by final path segment.
    Script(String),
}

impl CommandRule {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PolicyError::InvalidPattern("empty command rule".to_string()));
        }
        if raw.contains(char::is_whitespace) {
            return Err(PolicyError::InvalidPattern(format!(
                "'{}' must name a single command",
                raw
            )));
        }
        if let Some(prefix) = raw.strip_suffix('*') {
            if prefix.is_empty() || prefix.contains('*') {
                return Err(PolicyError::InvalidPattern(format!(
                    "'{}' needs a non-empty literal prefix before '*'",
                    raw
                )));
            }
            return Ok(CommandRule::Prefix(prefix.to_string()));
        }
        if raw.contains('*') {
            return Err(PolicyError::InvalidPattern(format!(
                "'{}' may only use '*' as a trailing wildcard",
                raw
            )));
        }
        if raw.contains('/') {
            let segment = final_segment(raw);
            if segment.is_empty() {
                return Err(PolicyError::InvalidPattern(format!("'{}' names no script", raw)));
            }
            return Ok(CommandRule::Script(raw.to_string()));
        }
        Ok(CommandRule::Exact(raw.to_string()))
    }

    /// `command` is the command word as written (possibly a path).
    pub fn matches(&self, command: &str) -> bool {
        let name = final_segment(command);
        match self {
            CommandRule::Exact(rule) => name == rule,
            CommandRule::Prefix(prefix) => name.starts_with(prefix.as_str()),
            CommandRule::Script(rule) => name == final_segment(rule),
        }
    }

    pub fn as_declared(&self) -> String {
        match self {
            CommandRule::Exact(rule) | CommandRule::Script(rule) => rule.clone(),
            CommandRule::Prefix(prefix) => format!("{}*", prefix),
        }
    }
}

fn final_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLayer {
    kind: LayerKind,
    rules: Vec<CommandRule>,
}

impl PolicyLayer {
    /// Builds a configurable layer, enforcing the rule limit.
    pub fn new<S: AsRef<str>>(
        kind: LayerKind,
        rules: impl IntoIterator<Item = S>,
    ) -> Result<Self, PolicyError> {
        let rules = rules
            .into_iter()
            .map(|rule| CommandRule::parse(rule.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if rules.len() > MAX_RULES_PER_LAYER {
            return Err(PolicyError::TooLarge {
                layer: kind,
                count: rules.len(),
                limit: MAX_RULES_PER_LAYER,
            });
        }
        Ok(Self { kind, rules })
    }

    pub fn empty(kind: LayerKind) -> Self {
        Self { kind, rules: Vec::new() }
    }

    fn builtin(kind: LayerKind, rules: &[&str]) -> Self {
        Self {
            kind,
            rules: rules
                .iter()
                .filter_map(|rule| CommandRule::parse(rule).ok())
                .collect(),
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn rules(&self) -> &[CommandRule] {
        &self.rules
    }

    pub fn matching_rule(&self, command: &str) -> Option<&CommandRule> {
        self.rules.iter().find(|rule| rule.matches(command))
    }
}

/// Immutable set of the five layers, loaded once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBundle {
    layers: [PolicyLayer; 5],
}

impl PolicyBundle {
    pub fn new(
        org_blocklist: PolicyLayer,
        org_allowlist: PolicyLayer,
        project_allowlist: PolicyLayer,
    ) -> Result<Self, PolicyError> {
        for (layer, expected) in [
            (&org_blocklist, LayerKind::OrgBlocklist),
            (&org_allowlist, LayerKind::OrgAllowlist),
            (&project_allowlist, LayerKind::ProjectAllowlist),
        ] {
            if layer.kind != expected {
                return Err(PolicyError::InvalidPattern(format!(
                    "layer {} supplied where {} was expected",
                    layer.kind, expected
                )));
            }
        }

        if let Some(rule) = org_allowlist
            .rules
            .iter()
            .find(|rule| org_blocklist.rules.contains(rule))
        {
            return Err(PolicyError::Conflict {
                rule: rule.as_declared(),
                source_name: "the org configuration".to_string(),
            });
        }

        Ok(Self {
            layers: [
                PolicyLayer::builtin(LayerKind::HardcodedBlocklist, HARDCODED_BLOCKLIST),
                org_blocklist,
                org_allowlist,
                PolicyLayer::builtin(LayerKind::GlobalAllowlist, DEFAULT_ALLOWLIST),
                project_allowlist,
            ],
        })
    }

    /// Bundle with only the built-in layers.
    pub fn defaults() -> Self {
        Self {
            layers: [
                PolicyLayer::builtin(LayerKind::HardcodedBlocklist, HARDCODED_BLOCKLIST),
                PolicyLayer::empty(LayerKind::OrgBlocklist),
                PolicyLayer::empty(LayerKind::OrgAllowlist),
                PolicyLayer::builtin(LayerKind::GlobalAllowlist, DEFAULT_ALLOWLIST),
                PolicyLayer::empty(LayerKind::ProjectAllowlist),
            ],
        }
    }

    pub fn layers(&self) -> &[PolicyLayer] {
        &self.layers
    }

    /// First matching layer in precedence order.
    pub fn resolve(&self, command: &str) -> Option<(LayerKind, LayerEffect)> {
        self.layers.iter().fold(None, |decided, layer| {
            decided.or_else(|| {
                layer
                    .matching_rule(command)
                    .map(|_| (layer.kind, layer.kind.effect()))
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    Blocked { command: String, layer: LayerKind },
    NotAllowed { command: String },
    InvalidArguments { command: String, detail: String },
    Unparseable { detail: String },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Blocked { command, layer } => {
                write!(f, "'{}' is blocked by the {}", command, layer)
            }
            DenyReason::NotAllowed { command } => {
                write!(f, "'{}' is not in any allowlist", command)
            }
            DenyReason::InvalidArguments { command, detail } => {
                write!(f, "'{}' rejected: {}", command, detail)
            }
            DenyReason::Unparseable { detail } => write!(f, "command rejected: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Authorizes a full shell command line. Every command in every segment
/// must be allowed.
pub fn authorize(command: &str, bundle: &PolicyBundle) -> Decision {
    let segments = match split_segments(command) {
        Ok(segments) => segments,
        Err(detail) => return Decision::Deny(DenyReason::Unparseable { detail }),
    };
    if segments.is_empty() {
        return Decision::Deny(DenyReason::Unparseable {
            detail: "no command found".to_string(),
        });
    }

    for words in &segments {
        let Some((index, name)) = command_word(words) else {
            continue;
        };
        match bundle.resolve(name) {
            Some((layer, LayerEffect::Deny)) => {
                return Decision::Deny(DenyReason::Blocked { command: name.to_string(), layer })
            }
            None => return Decision::Deny(DenyReason::NotAllowed { command: name.to_string() }),
            Some((_, LayerEffect::Allow)) => {
                if let Err(detail) = validate_arguments(name, &words[index + 1..]) {
                    return Decision::Deny(DenyReason::InvalidArguments {
                        command: name.to_string(),
                        detail,
                    });
                }
            }
        }
    }
    Decision::Allow
}

/// Picks the command word: skips `VAR=value` assignments and shell keywords.
fn command_word(words: &[String]) -> Option<(usize, &str)> {
    words.iter().enumerate().find_map(|(index, word)| {
        if is_assignment(word) || SHELL_KEYWORDS.contains(&word.as_str()) {
            None
        } else {
            Some((index, word.as_str()))
        }
    })
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Splits a command line into segments of words on `|`, `&`, `;`, newlines
/// and parentheses, honouring single and double quotes. Command
/// substitution is rejected because its contents would escape evaluation.
pub fn split_segments(command: &str) -> Result<Vec<Vec<String>>, String> {
    let mut segments: Vec<Vec<String>> = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();
    let mut prev: Option<char> = None;

    fn end_word(word: &mut String, in_word: &mut bool, words: &mut Vec<String>) {
        if *in_word {
            words.push(std::mem::take(word));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                let mut closed = false;
                for q in chars.by_ref() {
                    if q == '\'' {
                        closed = true;
                        break;
                    }
                    word.push(q);
                }
                if !closed {
                    return Err("unterminated single quote".to_string());
                }
            }
            '"' => {
                in_word = true;
                let mut closed = false;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        '$' if chars.peek() == Some(&'(') => {
                            return Err("command substitution is not permitted".to_string())
                        }
                        '`' => return Err("command substitution is not permitted".to_string()),
                        _ => word.push(q),
                    }
                }
                if !closed {
                    return Err("unterminated double quote".to_string());
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            '`' => return Err("command substitution is not permitted".to_string()),
            '$' if chars.peek() == Some(&'(') => {
                return Err("command substitution is not permitted".to_string())
            }
            // `2>&1` and `>&2` are redirections, not separators
            '&' if matches!(prev, Some('>') | Some('<')) => {
                in_word = true;
                word.push(c);
            }
            '|' | '&' | ';' | '\n' | '(' | ')' => {
                end_word(&mut word, &mut in_word, &mut words);
                if !words.is_empty() {
                    segments.push(std::mem::take(&mut words));
                }
            }
            c if c.is_whitespace() => end_word(&mut word, &mut in_word, &mut words),
            _ => {
                in_word = true;
                word.push(c);
            }
        }
        prev = Some(c);
    }
    end_word(&mut word, &mut in_word, &mut words);
    if !words.is_empty() {
        segments.push(words);
    }
    Ok(segments)
}

/// Extra checks for commands that are allowed but dangerous with the
/// wrong arguments.
fn validate_arguments(command: &str, args: &[String]) -> Result<(), String> {
    match final_segment(command) {
        "chmod" => validate_chmod(args),
        "pkill" => validate_pkill(args),
        "init.sh" => validate_init_script(command),
        _ => Ok(()),
    }
}

fn validate_chmod(args: &[String]) -> Result<(), String> {
    let mut mode: Option<&str> = None;
    let mut files = 0;
    for arg in args {
        if arg.starts_with('-') {
            return Err(format!("flag '{}' is not permitted", arg));
        }
        if mode.is_none() {
            mode = Some(arg);
        } else {
            files += 1;
        }
    }
    let mode = mode.ok_or_else(|| "missing mode".to_string())?;
    let valid = mode
        .strip_suffix("+x")
        .map(|who| who.chars().all(|c| matches!(c, 'u' | 'g' | 'o' | 'a')))
        .unwrap_or(false);
    if !valid {
        return Err(format!("only +x modes are permitted, got '{}'", mode));
    }
    if files == 0 {
        return Err("missing file operand".to_string());
    }
    Ok(())
}

fn validate_pkill(args: &[String]) -> Result<(), String> {
    let targets: Vec<&String> = args.iter().filter(|arg| !arg.starts_with('-')).collect();
    let Some(target) = targets.last() else {
        return Err("missing process name".to_string());
    };
    // `pkill -f "node server.js"` matches on the first word
    let process = target.split_whitespace().next().unwrap_or("");
    if PKILL_TARGETS.contains(&process) {
        Ok(())
    } else {
        Err(format!("only dev processes may be killed, got '{}'", process))
    }
}

fn validate_init_script(command: &str) -> Result<(), String> {
    if command.starts_with('/') || command.split('/').any(|part| part == "..") {
        return Err("init.sh must be run from inside the project".to_string());
    }
    Ok(())
}
