//! Rule syntax and policy types.

use ipnet::IpNet;
use std::net::IpAddr;

use crate::RouterError;

/// What to do with a destination. Lower wins on equal match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Policy {
    Block = 0,
    Bypass = 1,
    Proxy = 2,
}

impl Policy {
    pub const ALL: [Policy; 3] = [Policy::Block, Policy::Bypass, Policy::Proxy];

    pub fn from_name(name: &str) -> Result<Self, RouterError> {
        match name {
            "block" => Ok(Policy::Block),
            "bypass" => Ok(Policy::Bypass),
            "proxy" => Ok(Policy::Proxy),
            other => Err(RouterError::InvalidPolicy(other.to_string())),
        }
    }
}

/// When to bring resolved IPs into domain routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainStrategy {
    /// Match domains as domains only.
    #[default]
    AsIs,
    /// Resolve and try CIDR rules when no domain rule matched.
    IpIfNonMatch,
    /// Resolve first and try CIDR rules before domain rules.
    IpOnDemand,
}

impl DomainStrategy {
    pub fn from_name(name: &str) -> Result<Self, RouterError> {
        match name {
            "as_is" => Ok(DomainStrategy::AsIs),
            "ip_if_non_match" => Ok(DomainStrategy::IpIfNonMatch),
            "ip_on_demand" => Ok(DomainStrategy::IpOnDemand),
            other => Err(RouterError::InvalidStrategy(other.to_string())),
        }
    }
}

/// One parsed rule list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEntry {
    Full(String),
    Suffix(String),
    Keyword(String),
    Regex(String),
    Cidr(IpNet),
    GeoSite { tag: String, attr: Option<String> },
    GeoIp(String),
}

/// Parse one rule list entry.
///
/// Recognized forms: `full:host`, `domain:suffix`, `keyword:word`,
/// `regexp:pattern`, `geosite:tag[@attr]`, `geoip:cc`, a CIDR or bare IP,
/// and a bare domain (treated as a suffix rule).
pub fn parse_rule(input: &str) -> Result<RuleEntry, RouterError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RouterError::InvalidRule(
            input.to_string(),
            "empty rule".into(),
        ));
    }

    if let Some((kind, value)) = input.split_once(':') {
        let value = value.trim();
        match kind {
            "full" => return Ok(RuleEntry::Full(value.to_ascii_lowercase())),
            "domain" => return Ok(RuleEntry::Suffix(value.to_ascii_lowercase())),
            "keyword" => return Ok(RuleEntry::Keyword(value.to_ascii_lowercase())),
            "regexp" => return Ok(RuleEntry::Regex(value.to_string())),
            "geoip" => return Ok(RuleEntry::GeoIp(value.to_ascii_lowercase())),
            "geosite" => {
                let (tag, attr) = match value.split_once('@') {
                    Some((tag, attr)) => (tag, Some(attr.to_ascii_lowercase())),
                    None => (value, None),
                };
                return Ok(RuleEntry::GeoSite {
                    tag: tag.to_ascii_lowercase(),
                    attr,
                });
            }
            _ => {
                // Fall through: bracketed IPv6 literals also contain ':'.
            }
        }
    }

    if let Ok(net) = input.parse::<IpNet>() {
        return Ok(RuleEntry::Cidr(net));
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(RuleEntry::Cidr(IpNet::from(ip)));
    }

    // A bare name routes the whole domain tree.
    Ok(RuleEntry::Suffix(input.to_ascii_lowercase()))
}
