//! The routing decision.

use std::net::IpAddr;

use tracing::debug;

use trident_proto::{Address, Host};

use crate::geodata::GeodataLoader;
use crate::matcher::RuleSet;
use crate::rule::{DomainStrategy, Policy, RuleEntry, parse_rule};
use crate::RouterError;

/// Immutable rule tables; lookups are lock-free and a pure function of the
/// destination (plus the DNS result under the IP strategies, resolved at
/// most once per call).
pub struct Router {
    sets: [RuleSet; 3],
    default_policy: Policy,
    strategy: DomainStrategy,
}

impl Router {
    /// Decide what to do with `address`.
    pub async fn route(&self, address: &Address) -> Policy {
        let policy = match &address.host {
            Host::Domain(domain) => self.route_domain(domain).await,
            Host::Ipv4(ip) => self.match_ip(IpAddr::V4(*ip)),
            Host::Ipv6(ip) => self.match_ip(IpAddr::V6(*ip)),
        };
        let policy = policy.unwrap_or(self.default_policy);
        debug!(target = %address, policy = ?policy, "routed");
        policy
    }

    async fn route_domain(&self, domain: &str) -> Option<Policy> {
        if self.strategy == DomainStrategy::IpOnDemand {
            if let Some(ip) = self.resolve(domain).await {
                if let Some(policy) = self.match_ip(ip) {
                    return Some(policy);
                }
            }
        }

        for policy in Policy::ALL {
            if self.sets[policy as usize].match_domain(domain) {
                return Some(policy);
            }
        }

        if self.strategy == DomainStrategy::IpIfNonMatch {
            if let Some(ip) = self.resolve(domain).await {
                if let Some(policy) = self.match_ip(ip) {
                    return Some(policy);
                }
            }
        }

        None
    }

    fn match_ip(&self, ip: IpAddr) -> Option<Policy> {
        Policy::ALL
            .into_iter()
            .find(|&policy| self.sets[policy as usize].match_ip(ip))
    }

    /// True when some list holds CIDR rules, i.e. resolving can matter.
    pub fn has_ip_rules(&self) -> bool {
        self.sets.iter().any(|set| set.has_ip_rules())
    }

    pub fn default_policy(&self) -> Policy {
        self.default_policy
    }

    async fn resolve(&self, domain: &str) -> Option<IpAddr> {
        if !self.has_ip_rules() {
            return None;
        }
        match tokio::net::lookup_host((domain, 0u16)).await {
            Ok(mut addrs) => addrs.next().map(|a| a.ip()),
            Err(e) => {
                debug!(domain = %domain, error = %e, "router resolution failed");
                None
            }
        }
    }
}

/// Builds a [`Router`] from configured rule lists, expanding geodata
/// references through the loader.
pub struct RouterBuilder {
    sets: [RuleSet; 3],
    default_policy: Policy,
    strategy: DomainStrategy,
}

impl RouterBuilder {
    pub fn new(default_policy: Policy, strategy: DomainStrategy) -> Self {
        Self {
            sets: [RuleSet::new(), RuleSet::new(), RuleSet::new()],
            default_policy,
            strategy,
        }
    }

    /// Add one policy class's rule list.
    pub fn add_rules<S: AsRef<str>>(
        &mut self,
        policy: Policy,
        rules: &[S],
        geodata: &mut GeodataLoader,
    ) -> Result<&mut Self, RouterError> {
        for raw in rules {
            let entry = parse_rule(raw.as_ref())?;
            self.add_entry(policy, entry, geodata)?;
        }
        Ok(self)
    }

    fn add_entry(
        &mut self,
        policy: Policy,
        entry: RuleEntry,
        geodata: &mut GeodataLoader,
    ) -> Result<(), RouterError> {
        let set = &mut self.sets[policy as usize];
        match entry {
            RuleEntry::Full(domain) => set.add_full(&domain),
            RuleEntry::Suffix(suffix) => set.add_suffix(&suffix),
            RuleEntry::Keyword(keyword) => set.add_keyword(&keyword),
            RuleEntry::Regex(pattern) => set.add_regex(&pattern)?,
            RuleEntry::Cidr(net) => set.add_cidr(net),
            RuleEntry::GeoIp(code) => {
                for net in geodata.geoip_cidrs(&code)? {
                    self.sets[policy as usize].add_cidr(net);
                }
            }
            RuleEntry::GeoSite { tag, attr } => {
                for rule in geodata.geosite_rules(&tag, attr.as_deref())? {
                    self.add_entry(policy, rule, geodata)?;
                }
            }
        }
        Ok(())
    }

    pub fn build(mut self) -> Router {
        for set in &mut self.sets {
            set.compile();
        }
        Router {
            sets: self.sets,
            default_policy: self.default_policy,
            strategy: self.strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> GeodataLoader {
        GeodataLoader::new("/nonexistent/geoip.dat", "/nonexistent/geosite.dat")
    }

    fn domain(name: &str) -> Address {
        Address::domain(name, 443).unwrap()
    }

    async fn build_standard() -> Router {
        let mut builder = RouterBuilder::new(Policy::Proxy, DomainStrategy::AsIs);
        let mut geodata = loader();
        builder
            .add_rules(Policy::Block, &["domain:bad.example"], &mut geodata)
            .unwrap();
        builder
            .add_rules(Policy::Bypass, &["domain:corp.lan"], &mut geodata)
            .unwrap();
        builder
            .add_rules(Policy::Proxy, &["domain:example.com"], &mut geodata)
            .unwrap();
        builder.build()
    }

    #[tokio::test]
    async fn standard_matching_table() {
        let router = build_standard().await;
        assert_eq!(router.route(&domain("x.bad.example")).await, Policy::Block);
        assert_eq!(router.route(&domain("api.corp.lan")).await, Policy::Bypass);
        assert_eq!(router.route(&domain("www.example.com")).await, Policy::Proxy);
        assert_eq!(router.route(&domain("other.com")).await, Policy::Proxy);
    }

    #[tokio::test]
    async fn routing_is_deterministic() {
        let router = build_standard().await;
        let target = domain("x.bad.example");
        for _ in 0..8 {
            assert_eq!(router.route(&target).await, Policy::Block);
        }
    }

    #[tokio::test]
    async fn block_wins_over_later_policies() {
        let mut builder = RouterBuilder::new(Policy::Proxy, DomainStrategy::AsIs);
        let mut geodata = loader();
        builder
            .add_rules(Policy::Block, &["domain:example.com"], &mut geodata)
            .unwrap();
        builder
            .add_rules(Policy::Bypass, &["domain:example.com"], &mut geodata)
            .unwrap();
        let router = builder.build();
        assert_eq!(router.route(&domain("example.com")).await, Policy::Block);
    }

    #[tokio::test]
    async fn ip_destinations_use_cidr_lists_only() {
        let mut builder = RouterBuilder::new(Policy::Proxy, DomainStrategy::AsIs);
        let mut geodata = loader();
        builder
            .add_rules(Policy::Bypass, &["10.0.0.0/8"], &mut geodata)
            .unwrap();
        builder
            .add_rules(Policy::Block, &["domain:10.in-addr.arpa"], &mut geodata)
            .unwrap();
        let router = builder.build();

        let bypassed = Address::from_ip("10.1.2.3".parse().unwrap(), 443);
        assert_eq!(router.route(&bypassed).await, Policy::Bypass);

        let defaulted = Address::from_ip("8.8.8.8".parse().unwrap(), 443);
        assert_eq!(router.route(&defaulted).await, Policy::Proxy);
    }

    #[tokio::test]
    async fn bad_regex_fails_construction() {
        let mut builder = RouterBuilder::new(Policy::Proxy, DomainStrategy::AsIs);
        let mut geodata = loader();
        let result = builder.add_rules(Policy::Block, &["regexp:(unclosed"], &mut geodata);
        assert!(matches!(result, Err(RouterError::InvalidRegex(_, _))));
    }

    #[tokio::test]
    async fn default_policy_applies_when_unmatched() {
        let builder = RouterBuilder::new(Policy::Block, DomainStrategy::AsIs);
        let router = builder.build();
        assert_eq!(router.route(&domain("anything.example")).await, Policy::Block);
    }
}
