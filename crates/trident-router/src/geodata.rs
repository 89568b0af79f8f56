//! V2Ray-format geodata tables.
//!
//! `geoip.dat` and `geosite.dat` are protobuf files mapping country codes
//! to CIDR lists and site tags to domain lists. The messages below mirror
//! the published schema; only the fields the router consumes are declared.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use prost::Message;
use tracing::warn;

use crate::RouterError;
use crate::rule::RuleEntry;

/// Environment variable naming the base directory for relative geodata
/// paths.
pub const LOCATION_ASSET_ENV: &str = "TROJAN_GO_LOCATION_ASSET";

#[derive(Clone, PartialEq, Message)]
pub struct GeoCidr {
    #[prost(bytes = "vec", tag = "1")]
    pub ip: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub prefix: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GeoIpEntry {
    #[prost(string, tag = "1")]
    pub country_code: String,
    #[prost(message, repeated, tag = "2")]
    pub cidr: Vec<GeoCidr>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GeoIpList {
    #[prost(message, repeated, tag = "1")]
    pub entry: Vec<GeoIpEntry>,
}

/// Domain rule kinds used by geosite entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum GeoDomainType {
    /// Substring.
    Plain = 0,
    Regex = 1,
    /// Suffix anchored on a label boundary.
    RootDomain = 2,
    Full = 3,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum AttributeValue {
    #[prost(bool, tag = "2")]
    BoolValue(bool),
    #[prost(int64, tag = "3")]
    IntValue(i64),
}

#[derive(Clone, PartialEq, Message)]
pub struct GeoDomainAttribute {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "AttributeValue", tags = "2, 3")]
    pub typed_value: Option<AttributeValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GeoDomain {
    #[prost(enumeration = "GeoDomainType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(message, repeated, tag = "3")]
    pub attribute: Vec<GeoDomainAttribute>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GeoSiteEntry {
    #[prost(string, tag = "1")]
    pub country_code: String,
    #[prost(message, repeated, tag = "2")]
    pub domain: Vec<GeoDomain>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GeoSiteList {
    #[prost(message, repeated, tag = "1")]
    pub entry: Vec<GeoSiteEntry>,
}

/// Resolve a geodata path: absolute paths are used as-is, relative paths
/// are anchored at `TROJAN_GO_LOCATION_ASSET` when set.
pub fn locate_asset(path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::var_os(LOCATION_ASSET_ENV) {
        Some(base) => PathBuf::from(base).join(path),
        None => path.to_path_buf(),
    }
}

/// Lazily-loaded geodata tables. Each file is read and decoded at most
/// once per loader, however many rules reference it.
pub struct GeodataLoader {
    geoip_path: String,
    geosite_path: String,
    geoip: Option<GeoIpList>,
    geosite: Option<GeoSiteList>,
}

impl GeodataLoader {
    pub fn new(geoip_path: impl Into<String>, geosite_path: impl Into<String>) -> Self {
        Self {
            geoip_path: geoip_path.into(),
            geosite_path: geosite_path.into(),
            geoip: None,
            geosite: None,
        }
    }

    /// CIDRs for a country code. Unknown or empty codes warn and yield
    /// nothing.
    pub fn geoip_cidrs(&mut self, code: &str) -> Result<Vec<IpNet>, RouterError> {
        if self.geoip.is_none() {
            self.geoip = Some(load_message::<GeoIpList>(&self.geoip_path)?);
        }
        let list = self.geoip.as_ref().expect("loaded above");

        let Some(entry) = list
            .entry
            .iter()
            .find(|e| e.country_code.eq_ignore_ascii_case(code))
        else {
            warn!(code = %code, "geoip code not found, skipping");
            return Ok(Vec::new());
        };

        let mut nets = Vec::with_capacity(entry.cidr.len());
        for cidr in &entry.cidr {
            match decode_cidr(cidr) {
                Some(net) => nets.push(net),
                None => warn!(code = %code, "skipping malformed geoip cidr"),
            }
        }
        if nets.is_empty() {
            warn!(code = %code, "geoip code has no usable ranges");
        }
        Ok(nets)
    }

    /// Domain rules for a site tag, optionally filtered by attribute
    /// (`geosite:google@ads`). Unknown tags warn and yield nothing.
    pub fn geosite_rules(
        &mut self,
        tag: &str,
        attr: Option<&str>,
    ) -> Result<Vec<RuleEntry>, RouterError> {
        if self.geosite.is_none() {
            self.geosite = Some(load_message::<GeoSiteList>(&self.geosite_path)?);
        }
        let list = self.geosite.as_ref().expect("loaded above");

        let Some(entry) = list
            .entry
            .iter()
            .find(|e| e.country_code.eq_ignore_ascii_case(tag))
        else {
            warn!(tag = %tag, "geosite tag not found, skipping");
            return Ok(Vec::new());
        };

        let mut rules = Vec::new();
        for domain in &entry.domain {
            if let Some(attr) = attr {
                let has_attr = domain
                    .attribute
                    .iter()
                    .any(|a| a.key.eq_ignore_ascii_case(attr));
                if !has_attr {
                    continue;
                }
            }
            let rule = match GeoDomainType::try_from(domain.r#type) {
                Ok(GeoDomainType::Plain) => RuleEntry::Keyword(domain.value.clone()),
                Ok(GeoDomainType::Regex) => RuleEntry::Regex(domain.value.clone()),
                Ok(GeoDomainType::RootDomain) => RuleEntry::Suffix(domain.value.clone()),
                Ok(GeoDomainType::Full) => RuleEntry::Full(domain.value.clone()),
                Err(_) => {
                    warn!(tag = %tag, value = %domain.value, "unknown geosite rule type, skipping");
                    continue;
                }
            };
            rules.push(rule);
        }
        if rules.is_empty() {
            warn!(tag = %tag, "geosite tag yielded no rules");
        }
        Ok(rules)
    }
}

fn load_message<M: Message + Default>(path: &str) -> Result<M, RouterError> {
    let located = locate_asset(path);
    let data = std::fs::read(&located).map_err(|source| RouterError::GeodataRead {
        path: located.display().to_string(),
        source,
    })?;
    M::decode(&data[..]).map_err(|source| RouterError::GeodataDecode {
        path: located.display().to_string(),
        source,
    })
}

fn decode_cidr(cidr: &GeoCidr) -> Option<IpNet> {
    let ip: IpAddr = match cidr.ip.len() {
        4 => {
            let octets: [u8; 4] = cidr.ip.as_slice().try_into().ok()?;
            IpAddr::from(octets)
        }
        16 => {
            let octets: [u8; 16] = cidr.ip.as_slice().try_into().ok()?;
            IpAddr::from(octets)
        }
        _ => return None,
    };
    IpNet::new(ip, cidr.prefix as u8).ok()
}
