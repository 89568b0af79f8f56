//! `serde` default helpers for the configuration types.

pub(crate) fn default_local_addr() -> String {
    "127.0.0.1".into()
}

pub(crate) fn default_log_level() -> u8 {
    1 // info
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_mux_concurrency() -> usize {
    8
}

pub(crate) fn default_mux_idle_timeout() -> u64 {
    60
}

pub(crate) fn default_ws_path() -> String {
    "/".into()
}

pub(crate) fn default_ss_method() -> String {
    "aes-128-gcm".into()
}

pub(crate) fn default_router_policy() -> String {
    "proxy".into()
}

pub(crate) fn default_domain_strategy() -> String {
    "as_is".into()
}

pub(crate) fn default_geoip_path() -> String {
    "geoip.dat".into()
}

pub(crate) fn default_geosite_path() -> String {
    "geosite.dat".into()
}

pub(crate) fn default_api_addr() -> String {
    "127.0.0.1".into()
}

pub(crate) fn default_api_port() -> u16 {
    10000
}

pub(crate) fn default_stat_flush_secs() -> u64 {
    30
}

pub(crate) fn default_keepalive_secs() -> u64 {
    300
}
