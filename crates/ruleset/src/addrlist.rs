/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::regexp::{compile_raw, Pattern};

/// One address list: literal globs as written in the configuration, each
/// compiled to an anchored case-insensitive regex (`*` → `.*`, `?` → `.`,
/// every other metacharacter escaped).
#[derive(Debug, Clone, Default)]
pub struct AddrList {
    entries: Vec<(String, Pattern)>,
}

/// `whitelist_from_rcvd` entry: the sender glob plus a domain substring that
/// must appear in the Received chain for the entry to apply.
#[derive(Debug, Clone)]
pub struct RcvdEntry {
    pub pattern: Pattern,
    pub domain: String,
}

#[derive(Debug, Clone, Default)]
pub struct AddrLists {
    pub whitelist_from: AddrList,
    pub blacklist_from: AddrList,
    pub whitelist_to: AddrList,
    pub more_spam_to: AddrList,
    pub all_spam_to: AddrList,
    pub whitelist_from_rcvd: Vec<RcvdEntry>,
}

pub fn glob_to_pattern(glob: &str) -> Result<Pattern, String> {
    let mut source = String::with_capacity(glob.len() + 8);
    source.push_str("(?i)^");
    for ch in glob.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                source.push('\\');
                source.push(ch);
            }
            _ => source.push(ch),
        }
    }
    source.push('$');
    compile_raw(&source)
}

impl AddrList {
    pub fn add(&mut self, glob: &str) -> Result<(), String> {
        if self.entries.iter().any(|(g, _)| g == glob) {
            return Ok(());
        }
        let pattern = glob_to_pattern(glob)?;
        self.entries.push((glob.to_string(), pattern));
        Ok(())
    }

    pub fn remove(&mut self, glob: &str) {
        self.entries.retain(|(g, _)| g != glob);
    }

    pub fn matches(&self, address: &str) -> bool {
        self.entries
            .iter()
            .any(|(_, p)| p.is_match(address).unwrap_or(false))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AddrLists {
    pub fn add_whitelist_from_rcvd(&mut self, glob: &str, domain: &str) -> Result<(), String> {
        self.whitelist_from_rcvd.push(RcvdEntry {
            pattern: glob_to_pattern(glob)?,
            domain: domain.to_lowercase(),
        });
        Ok(())
    }

    /// Match a sender against the received-constrained whitelist: the glob
    /// must match and one of the relay lines must contain the domain.
    pub fn matches_whitelist_rcvd(&self, address: &str, received: &[&str]) -> bool {
        self.whitelist_from_rcvd.iter().any(|entry| {
            entry.pattern.is_match(address).unwrap_or(false)
                && received
                    .iter()
                    .any(|line| line.to_lowercase().contains(&entry.domain))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{AddrList, AddrLists};

    #[test]
    fn glob_semantics() {
        let mut list = AddrList::default();
        list.add("*@example.com").unwrap();
        list.add("exact@other.org").unwrap();
        assert!(list.matches("anyone@example.com"));
        assert!(list.matches("ANYONE@EXAMPLE.COM"));
        assert!(!list.matches("anyone@example.com.evil.net"));
        assert!(list.matches("exact@other.org"));
        assert!(!list.matches("inexact@other.org"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let mut list = AddrList::default();
        list.add("use?@example.com").unwrap();
        assert!(list.matches("user@example.com"));
        assert!(!list.matches("users@example.com"));
    }

    #[test]
    fn remove_unwhitelists() {
        let mut list = AddrList::default();
        list.add("*@example.com").unwrap();
        list.remove("*@example.com");
        assert!(!list.matches("anyone@example.com"));
    }

    #[test]
    fn rcvd_constrained_whitelist() {
        let mut lists = AddrLists::default();
        lists
            .add_whitelist_from_rcvd("*@example.com", "relay.example.com")
            .unwrap();
        let relays = ["from relay.example.com (10.0.0.1) by mx"];
        assert!(lists.matches_whitelist_rcvd("a@example.com", &relays));
        assert!(!lists.matches_whitelist_rcvd("a@example.com", &["from elsewhere"]));
    }
}
