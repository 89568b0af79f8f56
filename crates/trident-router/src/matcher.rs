//! Compiled per-policy matchers.
//!
//! Exact and suffix domains live in one hash set (suffixes stored with a
//! leading dot), keywords compile into an Aho-Corasick automaton, regexes
//! stay as a compiled list, and CIDRs are split by family.

use aho_corasick::AhoCorasick;
use ipnet::{Ipv4Net, Ipv6Net};
use regex::Regex;
use rustc_hash::FxHashSet;
use std::net::IpAddr;

use crate::RouterError;

/// All rules of one policy class, compiled for matching.
pub(crate) struct RuleSet {
    domains: FxHashSet<String>,
    keywords: Vec<String>,
    keyword_ac: Option<AhoCorasick>,
    regexes: Vec<Regex>,
    cidr4: Vec<Ipv4Net>,
    cidr6: Vec<Ipv6Net>,
}

impl RuleSet {
    pub(crate) fn new() -> Self {
        Self {
            domains: FxHashSet::default(),
            keywords: Vec::new(),
            keyword_ac: None,
            regexes: Vec::new(),
            cidr4: Vec::new(),
            cidr6: Vec::new(),
        }
    }

    pub(crate) fn add_full(&mut self, domain: &str) {
        self.domains.insert(domain.to_ascii_lowercase());
    }

    /// Suffix rules match the name itself and any subdomain.
    pub(crate) fn add_suffix(&mut self, suffix: &str) {
        let stripped = suffix.strip_prefix('.').unwrap_or(suffix);
        let lower = stripped.to_ascii_lowercase();
        self.domains.insert(format!(".{lower}"));
        self.domains.insert(lower);
    }

    pub(crate) fn add_keyword(&mut self, keyword: &str) {
        self.keywords.push(keyword.to_ascii_lowercase());
    }

    pub(crate) fn add_regex(&mut self, pattern: &str) -> Result<(), RouterError> {
        let regex = Regex::new(pattern)
            .map_err(|e| RouterError::InvalidRegex(pattern.to_string(), e))?;
        self.regexes.push(regex);
        Ok(())
    }

    pub(crate) fn add_cidr(&mut self, net: ipnet::IpNet) {
        match net {
            ipnet::IpNet::V4(v4) => self.cidr4.push(v4),
            ipnet::IpNet::V6(v6) => self.cidr6.push(v6),
        }
    }

    /// Build the keyword automaton; call once after all rules are added.
    pub(crate) fn compile(&mut self) {
        if !self.keywords.is_empty() {
            self.keyword_ac = Some(AhoCorasick::new(&self.keywords).expect("valid patterns"));
        }
    }

    pub(crate) fn match_domain(&self, domain: &str) -> bool {
        let lower = domain.to_ascii_lowercase();

        if self.domains.contains(lower.as_str()) {
            return true;
        }
        // Suffix walk: strip labels left to right.
        let mut pos = 0;
        while let Some(dot) = lower[pos..].find('.') {
            if self.domains.contains(&lower[pos + dot..]) {
                return true;
            }
            pos += dot + 1;
        }

        if let Some(ac) = &self.keyword_ac {
            if ac.is_match(&lower) {
                return true;
            }
        }

        self.regexes.iter().any(|r| r.is_match(&lower))
    }

    pub(crate) fn match_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.cidr4.iter().any(|net| net.contains(&v4)),
            IpAddr::V6(v6) => self.cidr6.iter().any(|net| net.contains(&v6)),
        }
    }

    pub(crate) fn has_ip_rules(&self) -> bool {
        !self.cidr4.is_empty() || !self.cidr6.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.domains.is_empty()
            && self.keywords.is_empty()
            && self.regexes.is_empty()
            && !self.has_ip_rules()
    }
}
