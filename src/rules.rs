// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! URL/domain rule matcher for classifying intercepted traffic.
//!
//! Rules come from a simplified ad-block list grammar: literal domain
//! rules and wildcard rules live in a shared prefix trie with a dedicated
//! wildcard edge; `/.../` rules compile to regular expressions matched as
//! URL prefixes. The matcher is immutable after loading and safe to share
//! across sessions. A match classifies traffic; it never blocks it.

use std::collections::HashMap;

use anyhow::Context;
use regex::Regex;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<u8, TrieNode>,
    /// Dedicated wildcard edge; consumes zero or more input bytes.
    wildcard: Option<Box<TrieNode>>,
    end_of_rule: bool,
}

#[derive(Debug, Default)]
struct Trie {
    root: TrieNode,
}

impl Trie {
    fn insert(&mut self, pattern: &str) {
        let mut node = &mut self.root;
        for &byte in pattern.as_bytes() {
            if byte == b'*' {
                node = node.wildcard.get_or_insert_with(Box::default);
            } else {
                node = node.children.entry(byte).or_default();
            }
        }
        node.end_of_rule = true;
    }

    /// True when any rule matches a prefix of `url`, expanding wildcard
    /// edges over every split point. Exponential for pathological
    /// many-wildcard patterns; rule lists are curated, not adversarial.
    fn search(&self, url: &str) -> bool {
        Self::search_at(&self.root, url.as_bytes(), 0)
    }

    fn search_at(node: &TrieNode, url: &[u8], index: usize) -> bool {
        if node.end_of_rule {
            return true;
        }
        if index < url.len() {
            if let Some(child) = node.children.get(&url[index]) {
                if Self::search_at(child, url, index + 1) {
                    return true;
                }
            }
        }
        if let Some(wild) = &node.wildcard {
            for split in index..=url.len() {
                if Self::search_at(wild, url, split) {
                    return true;
                }
            }
        }
        false
    }
}

/// Classifier over static, wildcard, and regex rules.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    trie: Trie,
    regex_rules: Vec<Regex>,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a matcher from newline-delimited rule-list content.
    /// Blank lines and lines starting with `!` are comments.
    pub fn from_rule_list(content: &str) -> anyhow::Result<Self> {
        let mut matcher = Self::new();
        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('!') {
                continue;
            }
            matcher.add_rule(line)?;
        }
        Ok(matcher)
    }

    /// Adds one rule line. Malformed regex patterns fail here, not at
    /// match time.
    pub fn add_rule(&mut self, line: &str) -> anyhow::Result<()> {
        if line.len() > 1 && line.starts_with('/') && line.ends_with('/') {
            let body = &line[1..line.len() - 1];
            // Anchor at the start: regex rules match as URL prefixes.
            let re = Regex::new(&format!("^(?:{body})"))
                .with_context(|| format!("invalid regex rule {line:?}"))?;
            self.regex_rules.push(re);
        } else if line.starts_with("||") && !line.contains('*') && !line.contains('/') {
            // Literal domain rule, e.g. ||ads.example.com^
            let domain = line[2..].split('^').next().unwrap_or_default();
            self.trie.insert(domain);
        } else if line.contains('*') || line.contains('/') {
            // Wildcard or path rule, e.g. ||example.com/*banner*
            self.trie.insert(line.strip_prefix("||").unwrap_or(line));
        } else {
            self.trie.insert(line);
        }
        Ok(())
    }

    /// True if any single rule matches; there is no precedence.
    pub fn matches(&self, url: &str) -> bool {
        if self.trie.search(url) {
            return true;
        }
        self.regex_rules.iter().any(|re| re.is_match(url))
    }

    pub fn is_empty(&self) -> bool {
        self.regex_rules.is_empty() && self.trie.root.children.is_empty()
            && self.trie.root.wildcard.is_none()
            && !self.trie.root.end_of_rule
    }
}
